//! Tile planning: the ordered set of tile origins that covers an image.
//!
//! Origins along each axis follow the stride lattice `0, stride, 2·stride, …`
//! and always end with a forced origin at `extent − tile`, so the bottom and
//! right edges are covered even when they fall between lattice points.

use serde::Serialize;

use crate::error::TileError;

/// Top-left corner of one tile, in input-space pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct TileDescriptor {
    pub row: usize,
    pub col: usize,
}

/// Row-major set of tile origins sharing one square tile size.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TilePlan {
    pub tile_size: usize,
    pub stride: usize,
    pub height: usize,
    pub width: usize,
    pub rows: Vec<usize>,
    pub cols: Vec<usize>,
}

/// Compute the tile plan for an `height × width` image.
///
/// `tile_size` is clamped to the image extent first, then must be a positive
/// multiple of `window_size` and strictly larger than `overlap`.
pub fn plan(
    height: usize,
    width: usize,
    tile_size: usize,
    overlap: usize,
    window_size: usize,
) -> Result<TilePlan, TileError> {
    if height == 0 || width == 0 {
        return Err(TileError::invalid(format!(
            "image extent must be non-empty, got {height}x{width}"
        )));
    }
    if window_size == 0 {
        return Err(TileError::invalid("window_size must be at least 1"));
    }

    let tile = tile_size.min(height).min(width);
    if tile == 0 || tile % window_size != 0 {
        return Err(TileError::invalid(format!(
            "tile size {tile} (requested {tile_size}, image {height}x{width}) \
             must be a positive multiple of window_size {window_size}"
        )));
    }
    if overlap >= tile {
        return Err(TileError::invalid(format!(
            "tile_overlap ({overlap}) must be smaller than tile size ({tile})"
        )));
    }

    let stride = tile - overlap;
    Ok(TilePlan {
        tile_size: tile,
        stride,
        height,
        width,
        rows: axis_origins(height, tile, stride),
        cols: axis_origins(width, tile, stride),
    })
}

/// Origins along one axis: the stride lattice strictly below `extent − tile`,
/// then the forced last origin, sorted with duplicates removed.
///
/// Callers guarantee `0 < tile <= extent` and `stride >= 1`.
pub fn axis_origins(extent: usize, tile: usize, stride: usize) -> Vec<usize> {
    let last = extent - tile;
    let mut origins: Vec<usize> = (0..last).step_by(stride).collect();
    origins.push(last);
    origins.sort_unstable();
    origins.dedup();
    origins
}

impl TilePlan {
    pub fn len(&self) -> usize {
        self.rows.len() * self.cols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = TileDescriptor> + '_ {
        self.rows.iter().flat_map(move |&row| {
            self.cols
                .iter()
                .map(move |&col| TileDescriptor { row, col })
        })
    }

    pub fn descriptors(&self) -> Vec<TileDescriptor> {
        self.iter().collect()
    }

    /// Number of tiles covering each row index and each column index.
    ///
    /// The weight of pixel `(y, x)` after accumulation is
    /// `rows[y] * cols[x]`, so a zero anywhere means a coverage gap.
    pub fn coverage_counts(&self) -> (Vec<u32>, Vec<u32>) {
        (
            axis_coverage(self.height, self.tile_size, &self.rows),
            axis_coverage(self.width, self.tile_size, &self.cols),
        )
    }
}

fn axis_coverage(extent: usize, tile: usize, origins: &[usize]) -> Vec<u32> {
    let mut counts = vec![0u32; extent];
    for &origin in origins {
        for count in &mut counts[origin..(origin + tile).min(extent)] {
            *count += 1;
        }
    }
    counts
}
