//! Tiled inference for window-attention image restoration models.
//!
//! Images are NCHW `f32` tensors. [`engine::TileEngine`] either hands the
//! whole image to a [`patch::Transform`] or splits it into overlapping
//! window-aligned tiles ([`planner`]), runs each tile ([`patch`]) and blends
//! the overlaps by averaging ([`accumulator`]).

pub mod accumulator;
pub mod backend;
pub mod batch;
pub mod config;
pub mod engine;
pub mod error;
pub mod image_io;
pub mod logging;
pub mod onnx;
pub mod padding;
pub mod patch;
pub mod planner;

pub use config::{ExecutionMode, TileConfig};
pub use engine::{EngineReport, TileEngine};
pub use error::TileError;
pub use patch::Transform;
