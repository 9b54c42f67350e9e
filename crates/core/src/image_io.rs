//! Image files <-> NCHW f32 tensors in [0, 1].

use std::path::Path;

use anyhow::{bail, Context, Result};
use image::{DynamicImage, GrayImage, RgbImage};
use ndarray::Array4;
use serde::{Deserialize, Serialize};

/// Channel layout fed to the model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorMode {
    #[default]
    Rgb,
    Gray,
}

impl ColorMode {
    pub fn channels(self) -> usize {
        match self {
            Self::Rgb => 3,
            Self::Gray => 1,
        }
    }
}

pub fn load_image(path: &Path, mode: ColorMode) -> Result<Array4<f32>> {
    let img = image::open(path).with_context(|| format!("failed to read {}", path.display()))?;
    Ok(image_to_tensor(&img, mode))
}

/// 8- and 16-bit sources both normalize to [0, 1].
pub fn image_to_tensor(img: &DynamicImage, mode: ColorMode) -> Array4<f32> {
    let shape = (1, mode.channels(), img.height() as usize, img.width() as usize);
    match mode {
        ColorMode::Rgb => {
            let rgb = img.to_rgb32f();
            Array4::from_shape_fn(shape, |(_, c, y, x)| {
                rgb.get_pixel(x as u32, y as u32)[c]
            })
        }
        ColorMode::Gray => {
            let luma = img.to_luma16();
            Array4::from_shape_fn(shape, |(_, _, y, x)| {
                luma.get_pixel(x as u32, y as u32)[0] as f32 / 65535.0
            })
        }
    }
}

/// Clamp to [0, 1] and quantize to 8 bits with rounding.
pub fn tensor_to_image(tensor: &Array4<f32>) -> Result<DynamicImage> {
    let (batch, channels, h, w) = tensor.dim();
    if batch != 1 {
        bail!("expected a single image, got batch of {batch}");
    }
    let quantize = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;

    match channels {
        3 => {
            let img = RgbImage::from_fn(w as u32, h as u32, |x, y| {
                let (x, y) = (x as usize, y as usize);
                image::Rgb([
                    quantize(tensor[[0, 0, y, x]]),
                    quantize(tensor[[0, 1, y, x]]),
                    quantize(tensor[[0, 2, y, x]]),
                ])
            });
            Ok(DynamicImage::ImageRgb8(img))
        }
        1 => {
            let img = GrayImage::from_fn(w as u32, h as u32, |x, y| {
                image::Luma([quantize(tensor[[0, 0, y as usize, x as usize]])])
            });
            Ok(DynamicImage::ImageLuma8(img))
        }
        other => bail!("cannot encode tensor with {other} channels as an image"),
    }
}

pub fn save_image(tensor: &Array4<f32>, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create output directory: {}", parent.display()))?;
    }
    tensor_to_image(tensor)?
        .save(path)
        .with_context(|| format!("failed to write {}", path.display()))
}
