//! Window alignment around the engine: mirror-pad the input up to a multiple
//! of the model's window size, then crop the output back to `original × scale`.

use ndarray::{s, Array4, ArrayView4};

use crate::error::TileError;

/// A padded image plus the extent it had before padding.
#[derive(Debug, Clone)]
pub struct Padded {
    pub image: Array4<f32>,
    pub orig_height: usize,
    pub orig_width: usize,
}

impl Padded {
    pub fn pad_height(&self) -> usize {
        self.image.dim().2 - self.orig_height
    }

    pub fn pad_width(&self) -> usize {
        self.image.dim().3 - self.orig_width
    }
}

/// Pixels needed to bring `dim` up to the next multiple of `window`.
pub fn pad_amount(dim: usize, window: usize) -> usize {
    (window - (dim % window)) % window
}

/// Mirror-pad bottom and right so height and width are multiples of `window`.
///
/// Padded row `h + i` copies row `h − 1 − i` (the edge row is repeated), and
/// pads wider than the image keep folding back and forth.
pub fn pad_to_window(image: ArrayView4<'_, f32>, window: usize) -> Result<Padded, TileError> {
    if window == 0 {
        return Err(TileError::invalid("window_size must be at least 1"));
    }
    let (batch, channels, h, w) = image.dim();
    if h == 0 || w == 0 {
        return Err(TileError::invalid(format!("cannot pad empty image {h}x{w}")));
    }

    let pad_h = pad_amount(h, window);
    let pad_w = pad_amount(w, window);
    if pad_h == 0 && pad_w == 0 {
        return Ok(Padded {
            image: image.to_owned(),
            orig_height: h,
            orig_width: w,
        });
    }

    let padded = Array4::from_shape_fn((batch, channels, h + pad_h, w + pad_w), |(n, c, y, x)| {
        image[[n, c, mirror_index(y, h), mirror_index(x, w)]]
    });

    Ok(Padded {
        image: padded,
        orig_height: h,
        orig_width: w,
    })
}

fn mirror_index(index: usize, extent: usize) -> usize {
    let folded = index % (2 * extent);
    if folded < extent {
        folded
    } else {
        2 * extent - 1 - folded
    }
}

/// Crop a model output back to the unpadded extent times `scale`.
pub fn crop_output(
    output: &Array4<f32>,
    orig_height: usize,
    orig_width: usize,
    scale: usize,
) -> Result<Array4<f32>, TileError> {
    let (_, _, out_h, out_w) = output.dim();
    let (target_h, target_w) = (orig_height * scale, orig_width * scale);
    if target_h > out_h || target_w > out_w {
        return Err(TileError::invalid(format!(
            "cannot crop {out_h}x{out_w} output to {target_h}x{target_w}"
        )));
    }
    if target_h == out_h && target_w == out_w {
        return Ok(output.clone());
    }
    Ok(output.slice(s![.., .., ..target_h, ..target_w]).to_owned())
}
