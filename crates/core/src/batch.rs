//! File-level driver: discover inputs, restore each one, write the result.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use ndarray::Array4;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::engine::TileEngine;
use crate::error::TileError;
use crate::image_io::{self, ColorMode};
use crate::padding::{crop_output, pad_to_window};
use crate::patch::Transform;

const IMAGE_EXTENSIONS: [&str; 6] = ["png", "jpg", "jpeg", "bmp", "tif", "tiff"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreOptions {
    pub color: ColorMode,
    /// Spread tiles over the rayon pool. Ignored in whole-image mode and
    /// without the `parallel` feature.
    pub parallel: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RestoreSummary {
    pub input: PathBuf,
    pub output: PathBuf,
    pub input_size: (usize, usize),
    pub output_size: (usize, usize),
    pub tiles: usize,
    pub elapsed: Duration,
}

/// A single image file, or every image directly inside a folder in name order.
pub fn discover_inputs(path: &Path) -> Result<Vec<PathBuf>> {
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }
    if !path.is_dir() {
        bail!("input path does not exist: {}", path.display());
    }

    let mut inputs = Vec::new();
    for entry in fs::read_dir(path)
        .with_context(|| format!("failed to list input folder: {}", path.display()))?
    {
        let candidate = entry?.path();
        if candidate.is_file() && has_image_extension(&candidate) {
            inputs.push(candidate);
        }
    }
    inputs.sort();

    if inputs.is_empty() {
        bail!("no images found in {}", path.display());
    }
    Ok(inputs)
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            IMAGE_EXTENSIONS
                .iter()
                .any(|known| known.eq_ignore_ascii_case(ext))
        })
}

/// `<output_dir>/<stem>_<suffix>.png`, or `<stem>.png` for an empty suffix.
pub fn output_path_for(input: &Path, output_dir: &Path, suffix: &str) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string());
    let name = if suffix.is_empty() {
        format!("{stem}.png")
    } else {
        format!("{stem}_{suffix}.png")
    };
    output_dir.join(name)
}

/// Load, pad to the model window, run the engine, crop back and save.
///
/// Window size and scale come from the engine's configuration. Engine
/// failures keep their [`TileError`] inside the returned error chain so
/// callers can tell cancellation apart via `downcast_ref`.
pub fn restore_file<T>(
    engine: &mut TileEngine<T>,
    input: &Path,
    output: &Path,
    options: RestoreOptions,
    cancel: &CancellationToken,
) -> Result<RestoreSummary>
where
    T: Transform + Clone + Send + Sync,
{
    let started = Instant::now();
    let window = engine.config().window_size;
    let scale = engine.config().scale;

    let image = image_io::load_image(input, options.color)?;
    let (_, _, height, width) = image.dim();
    let padded = pad_to_window(image.view(), window)?;
    let tiles = engine
        .plan_for(padded.image.view())?
        .map_or(1, |plan| plan.len());

    info!(
        input = %input.display(),
        height,
        width,
        pad_h = padded.pad_height(),
        pad_w = padded.pad_width(),
        tiles,
        "Restoring image"
    );

    let restored = run_engine(engine, &padded.image, options.parallel, cancel)
        .with_context(|| format!("failed to restore {}", input.display()))?;
    let cropped = crop_output(&restored, padded.orig_height, padded.orig_width, scale)?;
    image_io::save_image(&cropped, output)?;

    let summary = RestoreSummary {
        input: input.to_path_buf(),
        output: output.to_path_buf(),
        input_size: (height, width),
        output_size: (cropped.dim().2, cropped.dim().3),
        tiles,
        elapsed: started.elapsed(),
    };
    info!(
        output = %output.display(),
        elapsed_secs = summary.elapsed.as_secs_f64(),
        "Saved restored image"
    );
    Ok(summary)
}

#[cfg(feature = "parallel")]
fn run_engine<T>(
    engine: &mut TileEngine<T>,
    image: &Array4<f32>,
    parallel: bool,
    cancel: &CancellationToken,
) -> Result<Array4<f32>, TileError>
where
    T: Transform + Clone + Send + Sync,
{
    if parallel {
        engine.run_parallel(image.view(), cancel)
    } else {
        engine.run_with_cancel(image.view(), cancel)
    }
}

#[cfg(not(feature = "parallel"))]
fn run_engine<T>(
    engine: &mut TileEngine<T>,
    image: &Array4<f32>,
    parallel: bool,
    cancel: &CancellationToken,
) -> Result<Array4<f32>, TileError>
where
    T: Transform + Clone + Send + Sync,
{
    if parallel {
        tracing::warn!("built without the `parallel` feature; running tiles sequentially");
    }
    engine.run_with_cancel(image.view(), cancel)
}
