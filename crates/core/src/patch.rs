//! Patch extraction and the transform seam.

use anyhow::Result;
use ndarray::{s, Array4, ArrayView4};
use tracing::trace;

use crate::error::TileError;
use crate::planner::TileDescriptor;

/// An image-to-image model applied to one NCHW tensor at a time.
///
/// Implementations must preserve batch and channel counts and scale both
/// spatial dimensions by exactly the configured scale factor.
pub trait Transform {
    fn apply(&mut self, input: ArrayView4<'_, f32>) -> Result<Array4<f32>>;
}

impl<F> Transform for F
where
    F: FnMut(ArrayView4<'_, f32>) -> Result<Array4<f32>>,
{
    fn apply(&mut self, input: ArrayView4<'_, f32>) -> Result<Array4<f32>> {
        self(input)
    }
}

/// Output-space rectangle `[row0, row1) × [col0, col1)` a patch lands on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub row0: usize,
    pub col0: usize,
    pub row1: usize,
    pub col1: usize,
}

impl Placement {
    pub fn for_tile(tile: TileDescriptor, tile_size: usize, scale: usize) -> Self {
        Self {
            row0: tile.row * scale,
            col0: tile.col * scale,
            row1: (tile.row + tile_size) * scale,
            col1: (tile.col + tile_size) * scale,
        }
    }

    /// Zero for an inverted rectangle.
    pub fn height(&self) -> usize {
        self.row1.saturating_sub(self.row0)
    }

    pub fn width(&self) -> usize {
        self.col1.saturating_sub(self.col0)
    }
}

/// Run `transform` on one tile of `image` and place the result in output space.
pub fn process<T: Transform + ?Sized>(
    image: ArrayView4<'_, f32>,
    tile: TileDescriptor,
    tile_size: usize,
    transform: &mut T,
    scale: usize,
) -> Result<(Array4<f32>, Placement), TileError> {
    let (batch, channels, height, width) = image.dim();
    if tile.row + tile_size > height || tile.col + tile_size > width {
        return Err(TileError::accumulation(format!(
            "tile at ({}, {}) of size {tile_size} exceeds image {height}x{width}",
            tile.row, tile.col
        )));
    }

    let patch = image
        .slice(s![
            ..,
            ..,
            tile.row..tile.row + tile_size,
            tile.col..tile.col + tile_size
        ])
        .as_standard_layout()
        .into_owned();

    trace!(row = tile.row, col = tile.col, tile_size, "Running transform on tile");
    let output = transform
        .apply(patch.view())
        .map_err(|source| TileError::transform(tile.row, tile.col, source))?;

    let expected = (batch, channels, tile_size * scale, tile_size * scale);
    check_output_shape(&output, expected, tile)?;

    Ok((output, Placement::for_tile(tile, tile_size, scale)))
}

pub(crate) fn check_output_shape(
    output: &Array4<f32>,
    expected: (usize, usize, usize, usize),
    tile: TileDescriptor,
) -> Result<(), TileError> {
    if output.dim() != expected {
        return Err(TileError::transform(
            tile.row,
            tile.col,
            anyhow::anyhow!(
                "transform returned shape {:?}, expected {:?}",
                output.shape(),
                [expected.0, expected.1, expected.2, expected.3]
            ),
        ));
    }
    Ok(())
}
