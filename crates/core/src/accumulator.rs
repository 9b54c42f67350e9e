//! Overlap-aware accumulation of transformed patches.
//!
//! Every tile contributes weight 1 to each output pixel it covers. The final
//! image is `sum / weight`, which is the arithmetic mean of all predictions
//! for pixels covered by more than one tile and the single prediction
//! everywhere else.

use ndarray::{s, Array4, ArrayView4, Zip};

use crate::error::TileError;
use crate::patch::Placement;

/// Running sum and per-pixel weight for one engine invocation.
#[derive(Debug, Clone)]
pub struct Accumulator {
    sum: Array4<f32>,
    weight: Array4<f32>,
}

impl Accumulator {
    pub fn new(batch: usize, channels: usize, height: usize, width: usize) -> Self {
        let shape = (batch, channels, height, width);
        Self {
            sum: Array4::zeros(shape),
            weight: Array4::zeros(shape),
        }
    }

    pub fn dim(&self) -> (usize, usize, usize, usize) {
        self.sum.dim()
    }

    pub fn weight(&self) -> ArrayView4<'_, f32> {
        self.weight.view()
    }

    /// Smallest accumulated weight, `None` for an empty buffer.
    pub fn min_weight(&self) -> Option<f32> {
        self.weight.iter().copied().reduce(f32::min)
    }

    /// Add `patch` into the placement region and bump its weight by one.
    pub fn merge(&mut self, patch: ArrayView4<'_, f32>, placement: Placement) -> Result<(), TileError> {
        let (batch, channels, height, width) = self.dim();
        if placement.row0 > placement.row1
            || placement.col0 > placement.col1
            || placement.row1 > height
            || placement.col1 > width
        {
            return Err(TileError::accumulation(format!(
                "placement rows {}..{} cols {}..{} outside output {height}x{width}",
                placement.row0, placement.row1, placement.col0, placement.col1
            )));
        }

        let expected = (batch, channels, placement.height(), placement.width());
        if patch.dim() != expected {
            return Err(TileError::accumulation(format!(
                "patch shape {:?} does not match placement {expected:?}",
                patch.shape()
            )));
        }

        let region = s![
            ..,
            ..,
            placement.row0..placement.row1,
            placement.col0..placement.col1
        ];
        Zip::from(self.sum.slice_mut(region))
            .and(self.weight.slice_mut(region))
            .and(&patch)
            .for_each(|sum, weight, &value| {
                *sum += value;
                *weight += 1.0;
            });

        Ok(())
    }

    /// Fold another accumulator of the same shape into this one.
    pub fn absorb(&mut self, other: Accumulator) -> Result<(), TileError> {
        if other.dim() != self.dim() {
            return Err(TileError::accumulation(format!(
                "cannot reduce accumulator {:?} into {:?}",
                other.dim(),
                self.dim()
            )));
        }
        self.sum += &other.sum;
        self.weight += &other.weight;
        Ok(())
    }

    /// Normalize the sum by the accumulated weight.
    ///
    /// A zero weight means some output pixel was never covered, which is a
    /// planner bug rather than a caller error.
    pub fn finalize(self) -> Result<Array4<f32>, TileError> {
        if let Some((index, _)) = self.weight.indexed_iter().find(|(_, w)| **w == 0.0) {
            return Err(TileError::accumulation(format!(
                "output pixel {index:?} received zero weight (coverage gap)"
            )));
        }

        let Self { mut sum, weight } = self;
        Zip::from(&mut sum)
            .and(&weight)
            .for_each(|value, &w| *value /= w);
        Ok(sum)
    }
}
