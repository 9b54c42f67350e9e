//! Tiled inference orchestration.
//!
//! [`TileEngine`] owns the configuration and the injected [`Transform`] and
//! runs one of two modes per invocation:
//!
//! - **whole image**: the transform sees the full (already padded) image;
//! - **tiled**: the planner splits the image, each tile is transformed on its
//!   own and the results are blended by the [`Accumulator`].
//!
//! Both modes check the cancellation token before every transform call and
//! never return a partially blended image.

use std::time::{Duration, Instant};

use ndarray::{Array4, ArrayView4};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::accumulator::Accumulator;
use crate::config::{ExecutionMode, TileConfig};
use crate::error::TileError;
use crate::patch::{self, check_output_shape, Transform};
use crate::planner::{self, TileDescriptor, TilePlan};

pub struct TileEngine<T> {
    config: TileConfig,
    transform: T,
}

/// Summary of one engine invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineReport {
    pub mode: ExecutionMode,
    pub tiles: usize,
    pub elapsed: Duration,
}

impl<T> TileEngine<T> {
    pub fn config(&self) -> &TileConfig {
        &self.config
    }

    pub fn mode(&self) -> ExecutionMode {
        self.config.mode()
    }

    /// The tile plan this engine would use for `image`, or `None` in
    /// whole-image mode.
    pub fn plan_for(&self, image: ArrayView4<'_, f32>) -> Result<Option<TilePlan>, TileError> {
        let (_, _, height, width) = image.dim();
        match self.config.mode() {
            ExecutionMode::WholeImage => Ok(None),
            ExecutionMode::Tiled { tile_size, overlap } => planner::plan(
                height,
                width,
                tile_size,
                overlap,
                self.config.window_size,
            )
            .map(Some),
        }
    }

    fn output_dim(&self, image: ArrayView4<'_, f32>) -> (usize, usize, usize, usize) {
        let (batch, channels, height, width) = image.dim();
        let scale = self.config.scale;
        (batch, channels, height * scale, width * scale)
    }
}

impl<T: Transform> TileEngine<T> {
    pub fn new(config: TileConfig, transform: T) -> Result<Self, TileError> {
        config.validate()?;
        Ok(Self { config, transform })
    }

    pub fn run(&mut self, image: ArrayView4<'_, f32>) -> Result<Array4<f32>, TileError> {
        self.run_with_cancel(image, &CancellationToken::new())
    }

    pub fn run_with_cancel(
        &mut self,
        image: ArrayView4<'_, f32>,
        cancel: &CancellationToken,
    ) -> Result<Array4<f32>, TileError> {
        self.run_report(image, cancel).map(|(output, _)| output)
    }

    /// Sequential run in plan order; returns the output and a timing report.
    pub fn run_report(
        &mut self,
        image: ArrayView4<'_, f32>,
        cancel: &CancellationToken,
    ) -> Result<(Array4<f32>, EngineReport), TileError> {
        let started = Instant::now();
        let mode = self.config.mode();

        let (output, tiles) = match self.plan_for(image)? {
            None => (self.run_whole(image, cancel)?, 1),
            Some(plan) => {
                let tiles = plan.len();
                (self.run_tiled(image, &plan, cancel)?, tiles)
            }
        };

        let report = EngineReport {
            mode,
            tiles,
            elapsed: started.elapsed(),
        };
        debug!(
            mode = ?report.mode,
            tiles,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Engine run finished"
        );
        Ok((output, report))
    }

    fn run_whole(
        &mut self,
        image: ArrayView4<'_, f32>,
        cancel: &CancellationToken,
    ) -> Result<Array4<f32>, TileError> {
        if cancel.is_cancelled() {
            return Err(TileError::Cancelled);
        }

        let origin = TileDescriptor { row: 0, col: 0 };
        debug!(shape = ?image.shape(), "Running whole-image inference");
        let output = self
            .transform
            .apply(image)
            .map_err(|source| TileError::transform(0, 0, source))?;
        check_output_shape(&output, self.output_dim(image), origin)?;
        Ok(output)
    }

    fn run_tiled(
        &mut self,
        image: ArrayView4<'_, f32>,
        plan: &TilePlan,
        cancel: &CancellationToken,
    ) -> Result<Array4<f32>, TileError> {
        let (batch, channels, out_h, out_w) = self.output_dim(image);
        let scale = self.config.scale;

        info!(
            tile_size = plan.tile_size,
            stride = plan.stride,
            rows = plan.rows.len(),
            cols = plan.cols.len(),
            height = plan.height,
            width = plan.width,
            "Starting tiled inference"
        );

        let mut acc = Accumulator::new(batch, channels, out_h, out_w);
        for (index, tile) in plan.iter().enumerate() {
            if cancel.is_cancelled() {
                info!(completed = index, total = plan.len(), "Tiled inference cancelled");
                return Err(TileError::Cancelled);
            }

            let (patch, placement) =
                patch::process(image, tile, plan.tile_size, &mut self.transform, scale)?;
            acc.merge(patch.view(), placement)?;
            debug!(index, row = tile.row, col = tile.col, "Merged tile");
        }

        acc.finalize()
    }
}

#[cfg(feature = "parallel")]
impl<T: Transform + Clone + Send + Sync> TileEngine<T> {
    /// Tiled run spread over the rayon pool.
    ///
    /// Each worker owns a clone of the transform and a private accumulator;
    /// the private buffers are summed once all tiles are done. Floating-point
    /// summation order differs from [`TileEngine::run`], so results match it
    /// within tolerance rather than bit for bit. Whole-image mode falls back
    /// to the sequential path.
    pub fn run_parallel(
        &mut self,
        image: ArrayView4<'_, f32>,
        cancel: &CancellationToken,
    ) -> Result<Array4<f32>, TileError> {
        use rayon::prelude::*;

        let Some(plan) = self.plan_for(image)? else {
            return self.run_whole(image, cancel);
        };

        let (batch, channels, out_h, out_w) = self.output_dim(image);
        let scale = self.config.scale;
        let tile_size = plan.tile_size;

        info!(
            tile_size,
            tiles = plan.len(),
            threads = rayon::current_num_threads(),
            "Starting parallel tiled inference"
        );

        let transform = &self.transform;
        let acc = plan
            .descriptors()
            .into_par_iter()
            .try_fold(
                || (transform.clone(), Accumulator::new(batch, channels, out_h, out_w)),
                |(mut worker, mut acc), tile| {
                    if cancel.is_cancelled() {
                        return Err(TileError::Cancelled);
                    }
                    let (patch, placement) =
                        patch::process(image, tile, tile_size, &mut worker, scale)?;
                    acc.merge(patch.view(), placement)?;
                    Ok((worker, acc))
                },
            )
            .map(|partial| partial.map(|(_, acc)| acc))
            .try_reduce(
                || Accumulator::new(batch, channels, out_h, out_w),
                |mut left, right| {
                    left.absorb(right)?;
                    Ok(left)
                },
            )?;

        acc.finalize()
    }
}
