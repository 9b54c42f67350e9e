use thiserror::Error;

/// Errors surfaced by the tiled inference engine.
///
/// Every variant aborts the whole invocation; no partially blended output is
/// ever returned alongside an error.
#[derive(Error, Debug)]
pub enum TileError {
    /// Rejected before any transform call is made.
    #[error("invalid tiling configuration: {0}")]
    InvalidConfiguration(String),

    /// An internal consistency fault in the accumulation buffers, e.g. an
    /// output pixel that no tile covered.
    #[error("accumulation error: {0}")]
    AccumulationError(String),

    #[error("transform failed on tile at (row {row}, col {col}): {source:#}")]
    TransformFailure {
        row: usize,
        col: usize,
        source: anyhow::Error,
    },

    #[error("tiled inference was cancelled")]
    Cancelled,
}

impl TileError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration(msg.into())
    }

    pub fn accumulation(msg: impl Into<String>) -> Self {
        Self::AccumulationError(msg.into())
    }

    pub fn transform(row: usize, col: usize, source: anyhow::Error) -> Self {
        Self::TransformFailure { row, col, source }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
