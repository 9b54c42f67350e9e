use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::TileError;

const CONFIG_FILE_NAME: &str = "config.toml";
const ENV_DATA_DIR: &str = "SWINTILE_DATA_DIR";

pub const DEFAULT_TILE_OVERLAP: usize = 32;
pub const DEFAULT_WINDOW_SIZE: usize = 8;
pub const DEFAULT_OUTPUT_SUFFIX: &str = "restored";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct AppConfig {
    pub tiling: TileConfig,
    pub model: ModelConfig,
    pub paths: PathsConfig,
    pub performance: PerformanceConfig,
}

/// Engine options. `tile_size = None` selects whole-image inference.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TileConfig {
    pub tile_size: Option<usize>,
    pub tile_overlap: usize,
    pub window_size: usize,
    pub scale: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ModelConfig {
    pub path: Option<PathBuf>,
    pub backend: String,
    pub input_name: Option<String>,
    pub output_name: Option<String>,
    pub trt_cache_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub output_dir: PathBuf,
    pub suffix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct PerformanceConfig {
    pub parallel: bool,
}

/// How an engine invocation runs; fixed once per invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    WholeImage,
    Tiled { tile_size: usize, overlap: usize },
}

impl Default for TileConfig {
    fn default() -> Self {
        Self {
            tile_size: None,
            tile_overlap: DEFAULT_TILE_OVERLAP,
            window_size: DEFAULT_WINDOW_SIZE,
            scale: 1,
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            path: None,
            backend: "cuda".to_string(),
            input_name: None,
            output_name: None,
            trt_cache_dir: PathBuf::from("trt_cache"),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("results"),
            suffix: DEFAULT_OUTPUT_SUFFIX.to_string(),
        }
    }
}

impl TileConfig {
    pub fn tiled(tile_size: usize, tile_overlap: usize) -> Self {
        Self {
            tile_size: Some(tile_size),
            tile_overlap,
            ..Self::default()
        }
    }

    pub fn with_window_size(mut self, window_size: usize) -> Self {
        self.window_size = window_size;
        self
    }

    pub fn with_scale(mut self, scale: usize) -> Self {
        self.scale = scale;
        self
    }

    pub fn mode(&self) -> ExecutionMode {
        match self.tile_size {
            None => ExecutionMode::WholeImage,
            Some(tile_size) => ExecutionMode::Tiled {
                tile_size,
                overlap: self.tile_overlap,
            },
        }
    }

    /// Checks that do not depend on the image size. Window alignment and
    /// overlap are re-checked by the planner against the clamped tile.
    pub fn validate(&self) -> Result<(), TileError> {
        if self.scale == 0 {
            return Err(TileError::invalid("scale must be at least 1"));
        }
        if self.window_size == 0 {
            return Err(TileError::invalid("window_size must be at least 1"));
        }
        if self.tile_size == Some(0) {
            return Err(TileError::invalid("tile_size must be positive"));
        }
        Ok(())
    }
}

impl AppConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config TOML: {}", path.display()))
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .context("config path does not have a parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;

        let encoded = toml::to_string_pretty(self).context("failed to serialize config TOML")?;
        fs::write(path, encoded)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;

        Ok(())
    }
}

/// Resolve the data directory: CLI override, then `SWINTILE_DATA_DIR`, then `./data`.
pub fn data_dir(cli_override: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_override {
        return path.to_path_buf();
    }

    if let Some(env_dir) = env::var_os(ENV_DATA_DIR) {
        return PathBuf::from(env_dir);
    }

    PathBuf::from("data")
}

pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

/// Create the data directory and a default config.toml if either is missing.
pub fn initialize_data_dir(data_dir: &Path) -> Result<()> {
    if !data_dir.exists() {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
    }

    let cfg_path = config_path(data_dir);
    if !cfg_path.exists() {
        AppConfig::default().save_to_path(&cfg_path)?;
    }

    Ok(())
}

pub fn resolve_relative_to(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = AppConfig::default();

        assert_eq!(cfg.tiling.tile_size, None);
        assert_eq!(cfg.tiling.tile_overlap, 32);
        assert_eq!(cfg.tiling.window_size, 8);
        assert_eq!(cfg.tiling.scale, 1);
        assert_eq!(cfg.model.backend, "cuda");
        assert!(cfg.model.path.is_none());
        assert_eq!(cfg.paths.output_dir, PathBuf::from("results"));
        assert_eq!(cfg.paths.suffix, "restored");
        assert!(!cfg.performance.parallel);
    }

    #[test]
    fn toml_roundtrip_preserves_values() {
        let mut original = AppConfig::default();
        original.tiling = TileConfig::tiled(256, 16).with_scale(4);
        original.model.path = Some(PathBuf::from("models/swinir.onnx"));
        let encoded = toml::to_string_pretty(&original).expect("serialize config");
        let decoded: AppConfig = toml::from_str(&encoded).expect("deserialize config");
        assert_eq!(decoded, original);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let cfg: AppConfig = toml::from_str("[tiling]\ntile_size = 128\n").expect("parse");
        assert_eq!(cfg.tiling.tile_size, Some(128));
        assert_eq!(cfg.tiling.tile_overlap, DEFAULT_TILE_OVERLAP);
        assert_eq!(cfg.paths, PathsConfig::default());
    }

    #[test]
    fn mode_follows_tile_size() {
        assert_eq!(TileConfig::default().mode(), ExecutionMode::WholeImage);
        assert_eq!(
            TileConfig::tiled(64, 16).mode(),
            ExecutionMode::Tiled {
                tile_size: 64,
                overlap: 16
            }
        );
    }

    #[test]
    fn validate_rejects_degenerate_values() {
        assert!(TileConfig::default().validate().is_ok());
        assert!(TileConfig::default().with_scale(0).validate().is_err());
        assert!(TileConfig::default().with_window_size(0).validate().is_err());
        assert!(TileConfig::tiled(0, 0).validate().is_err());
    }

    #[test]
    fn load_from_nonexistent_file_returns_defaults() {
        let dir = tempdir().expect("tempdir");
        let loaded =
            AppConfig::load_from_path(&dir.path().join("missing.toml")).expect("load config");
        assert_eq!(loaded, AppConfig::default());
    }

    #[test]
    fn load_from_empty_file_returns_defaults() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        fs::write(&path, "  \n").expect("write");
        assert_eq!(AppConfig::load_from_path(&path).expect("load"), AppConfig::default());
    }

    #[test]
    fn load_reports_parse_errors() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        fs::write(&path, "[tiling\n").expect("write");
        let err = AppConfig::load_from_path(&path).unwrap_err();
        assert!(format!("{err:#}").contains("failed to parse config TOML"));
    }

    #[test]
    fn data_dir_uses_cli_override() {
        let result = data_dir(Some(Path::new("/custom")));
        assert_eq!(result, PathBuf::from("/custom"));
    }

    #[test]
    fn data_dir_uses_env_var_when_no_cli() {
        env::set_var(ENV_DATA_DIR, "/env/path");
        let result = data_dir(None);
        env::remove_var(ENV_DATA_DIR);
        assert_eq!(result, PathBuf::from("/env/path"));
    }

    #[test]
    fn initialize_creates_data_dir_and_config() {
        let temp = tempdir().expect("tempdir");
        let data = temp.path().join("data");
        initialize_data_dir(&data).expect("initialize data dir");

        assert!(data.exists());
        assert!(data.join("config.toml").exists());
    }

    #[test]
    fn initialize_preserves_existing_config() {
        let temp = tempdir().expect("tempdir");
        let cfg_path = temp.path().join("config.toml");
        let custom_content = "[tiling]\ntile_size = 64\n";
        fs::write(&cfg_path, custom_content).expect("write custom config");

        initialize_data_dir(temp.path()).expect("initialize data dir");

        let content = fs::read_to_string(&cfg_path).expect("read config");
        assert_eq!(content, custom_content);
    }

    #[test]
    fn resolve_relative_to_handles_both_cases() {
        assert_eq!(
            resolve_relative_to(Path::new("/base"), Path::new("/abs/path")),
            PathBuf::from("/abs/path")
        );
        assert_eq!(
            resolve_relative_to(Path::new("/base"), Path::new("sub")),
            PathBuf::from("/base/sub")
        );
    }
}
