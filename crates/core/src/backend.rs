//! ONNX Runtime session construction and runtime library discovery.
//!
//! [`build_session`] registers the execution providers matching an
//! [`InferenceBackend`]; ORT silently falls back to CPU when a provider
//! cannot be initialized unless the provider is marked `error_on_failure`.

use std::env;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use ort::{
    execution_providers::{CUDAExecutionProvider, ExecutionProvider, TensorRTExecutionProvider},
    session::{builder::GraphOptimizationLevel, Session},
};
use tracing::{debug, info, warn};

#[cfg(unix)]
const ORT_LIB_NAME: &str = "libonnxruntime.so";
#[cfg(windows)]
const ORT_LIB_NAME: &str = "onnxruntime.dll";
#[cfg(not(any(unix, windows)))]
const ORT_LIB_NAME: &str = "libonnxruntime.dylib";

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum InferenceBackend {
    Cpu,
    #[default]
    Cuda,
    Tensorrt,
}

impl InferenceBackend {
    /// Parse from string (case-insensitive). Returns `Cuda` for unknown values.
    pub fn from_str_lossy(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpu" => Self::Cpu,
            "tensorrt" | "trt" => Self::Tensorrt,
            _ => Self::Cuda,
        }
    }
}

impl std::fmt::Display for InferenceBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda => write!(f, "cuda"),
            Self::Tensorrt => write!(f, "tensorrt"),
        }
    }
}

pub struct SessionConfig<'a> {
    pub model_path: &'a Path,
    pub backend: &'a InferenceBackend,
    pub trt_cache_dir: Option<&'a Path>,
}

pub fn build_session(config: &SessionConfig<'_>) -> Result<Session> {
    let builder = Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?;
    let started = Instant::now();

    let session = match config.backend {
        InferenceBackend::Cpu => {
            debug!(backend = "cpu", "Building session with default CPU EP");
            builder.commit_from_file(config.model_path)
        }
        InferenceBackend::Cuda => {
            let cuda = CUDAExecutionProvider::default();
            if !cuda.is_available().unwrap_or(false) {
                warn!("CUDA EP is not available; inference will fall back to CPU");
            }

            debug!(backend = "cuda", "Building session with CUDA EP");
            builder
                .with_execution_providers([CUDAExecutionProvider::default().build()])?
                .commit_from_file(config.model_path)
        }
        InferenceBackend::Tensorrt => {
            let cache_dir = config
                .trt_cache_dir
                .unwrap_or_else(|| Path::new("trt_cache"));
            if let Err(e) = std::fs::create_dir_all(cache_dir) {
                warn!(
                    dir = %cache_dir.display(),
                    error = %e,
                    "Failed to create TRT cache directory"
                );
            }

            info!(
                cache_dir = %cache_dir.display(),
                "Initializing TensorRT session (first run may take several minutes)"
            );

            // Each distinct tile size builds its own engine; the CUDA EP catches
            // whatever TensorRT cannot handle.
            builder
                .with_execution_providers([
                    TensorRTExecutionProvider::default()
                        .with_engine_cache(true)
                        .with_engine_cache_path(cache_dir.to_string_lossy().to_string())
                        .with_device_id(0)
                        .build(),
                    CUDAExecutionProvider::default().build(),
                ])?
                .commit_from_file(config.model_path)
        }
    }
    .with_context(|| format!("Failed to load ONNX model: {}", config.model_path.display()))?;

    info!(
        backend = %config.backend,
        model = %config.model_path.display(),
        elapsed_secs = started.elapsed().as_secs_f64(),
        "ONNX session ready"
    );

    Ok(session)
}

fn candidate_lib_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Ok(exe) = env::current_exe().and_then(|p| p.canonicalize()) {
        if let Some(exe_dir) = exe.parent() {
            dirs.push(exe_dir.to_path_buf());
            dirs.push(exe_dir.join("lib"));
            if let Some(parent) = exe_dir.parent() {
                dirs.push(parent.join("lib"));
            }
        }
    }
    if let Ok(cwd) = env::current_dir() {
        let cwd_lib = cwd.join("lib");
        if !dirs.contains(&cwd_lib) {
            dirs.push(cwd_lib);
        }
    }
    #[cfg(unix)]
    {
        dirs.push(PathBuf::from("/usr/local/lib"));
        dirs.push(PathBuf::from("/usr/lib"));
    }
    dirs
}

fn find_ort_dylib_in_dirs(dirs: &[PathBuf]) -> Option<PathBuf> {
    dirs.iter()
        .map(|dir| dir.join(ORT_LIB_NAME))
        .find(|candidate| candidate.is_file())
}

/// Point `ORT_DYLIB_PATH` at a bundled ONNX Runtime library when the user
/// has not set it. Call before the first session is built.
pub fn setup_runtime_libs() {
    if env::var_os("ORT_DYLIB_PATH").is_some() {
        return;
    }
    if let Some(path) = find_ort_dylib_in_dirs(&candidate_lib_dirs()) {
        env::set_var("ORT_DYLIB_PATH", &path);
    }
}

/// Call after tracing is initialized.
pub fn log_runtime_lib_status() {
    match env::var("ORT_DYLIB_PATH") {
        Ok(ort) if Path::new(&ort).is_file() => info!("ORT library: {ort}"),
        Ok(ort) => warn!("ORT_DYLIB_PATH set to {ort} but file not found"),
        Err(_) => warn!("ORT_DYLIB_PATH not set; ORT will try default search paths"),
    }
}
