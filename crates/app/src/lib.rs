use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use swintile_core::backend::{self, InferenceBackend, SessionConfig};
use swintile_core::batch::{self, RestoreOptions, RestoreSummary};
use swintile_core::config::{
    config_path, data_dir, initialize_data_dir, resolve_relative_to, AppConfig, TileConfig,
    DEFAULT_TILE_OVERLAP, DEFAULT_WINDOW_SIZE,
};
use swintile_core::image_io::ColorMode;
use swintile_core::logging::{
    self, FilterRequest, DEFAULT_LOG_FILTER, DEFAULT_LOG_RETENTION_FILES, DEFAULT_NOISE_FILTER,
};
use swintile_core::onnx::OnnxTransform;
use swintile_core::planner::{self, TileDescriptor, TilePlan};
use swintile_core::{TileEngine, TileError};

#[derive(Parser)]
#[command(
    name = "swintile",
    about = "Tiled inference for SwinIR-style image restoration models"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        global = true,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        global = true,
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Restore an image or every image in a folder.
    Run(RunArgs),
    /// Print the tile plan for an image size as JSON.
    Plan(PlanArgs),
}

#[derive(Args, Debug, Default)]
struct RunArgs {
    #[arg(help = "Image file or folder of images")]
    input: PathBuf,
    #[arg(short = 'm', long, help = "ONNX model (overrides [model].path)")]
    model: Option<PathBuf>,
    #[arg(short = 'o', long, help = "Output folder (overrides [paths].output_dir)")]
    output: Option<PathBuf>,
    #[arg(long, help = "Tile size; omit for whole-image inference")]
    tile: Option<usize>,
    #[arg(long)]
    tile_overlap: Option<usize>,
    #[arg(long)]
    window_size: Option<usize>,
    #[arg(long, help = "Upscale factor of the model (1 for restoration)")]
    scale: Option<usize>,
    #[arg(long, value_name = "cpu|cuda|tensorrt")]
    backend: Option<String>,
    #[arg(
        long,
        help = "Run tiles on the rayon thread pool (workers share one ONNX session, so inference itself stays serial)"
    )]
    parallel: bool,
    #[arg(long, help = "Output file name suffix")]
    suffix: Option<String>,
    #[arg(long, help = "Feed the model a single grayscale channel")]
    gray: bool,
}

#[derive(Args, Debug)]
struct PlanArgs {
    #[arg(long)]
    height: usize,
    #[arg(long)]
    width: usize,
    #[arg(long)]
    tile: usize,
    #[arg(long, default_value_t = DEFAULT_TILE_OVERLAP)]
    tile_overlap: usize,
    #[arg(long, default_value_t = DEFAULT_WINDOW_SIZE)]
    window_size: usize,
}

/// CLI flags layered over the config file.
#[derive(Debug, Clone, PartialEq)]
struct ResolvedRun {
    tiling: TileConfig,
    model_path: PathBuf,
    backend: InferenceBackend,
    input_name: Option<String>,
    output_name: Option<String>,
    trt_cache_dir: PathBuf,
    output_dir: PathBuf,
    suffix: String,
    options: RestoreOptions,
}

#[derive(Serialize)]
struct PlanReport {
    #[serde(flatten)]
    plan: TilePlan,
    tiles: Vec<TileDescriptor>,
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    backend::setup_runtime_libs();
    init_logging(
        Some(resolved_data_dir.as_path()),
        cli.verbose,
        cli.log_filter.as_deref(),
    );
    backend::log_runtime_lib_status();
    log_startup_metadata(&resolved_data_dir);

    match cli.command {
        Commands::Run(args) => run_restore(args, resolved_data_dir).await,
        Commands::Plan(args) => {
            println!("{}", render_plan(&args)?);
            Ok(())
        }
    }
}

fn init_logging(data_dir: Option<&Path>, verbose: u8, cli_log_filter: Option<&str>) {
    let crash_hook = logging::install_panic_hook(data_dir);

    let filters = FilterRequest {
        cli: cli_log_filter.map(ToString::to_string),
        verbose,
        env: std::env::var("RUST_LOG").ok(),
    }
    .resolve(DEFAULT_NOISE_FILTER);

    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(parse_env_filter_with_fallback(&filters.console, "console"));
    let (file_layer, sink_error) =
        match logging::open_file_sink(data_dir, DEFAULT_LOG_RETENTION_FILES) {
            Ok(appender) => {
                let layer = tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(appender)
                    .with_filter(parse_env_filter_with_fallback(&filters.file, "file"));
                (Some(layer), None)
            }
            Err(error) => (None, Some(error)),
        };

    let subscriber = tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer);
    if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!(
            "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
        );
        return;
    }

    if let Some(error) = sink_error {
        warn!(%error, "Persistent file logging unavailable; continuing with console-only logging");
    }
    if let Err(error) = crash_hook {
        warn!(%error, "Panic crash reports disabled");
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn log_startup_metadata(data_dir: &Path) {
    info!(
        pid = std::process::id(),
        data_dir = %data_dir.display(),
        config_path = %config_path(data_dir).display(),
        "Runtime startup metadata"
    );
}

fn load_config(data_dir: &Path) -> AppConfig {
    if let Err(e) = initialize_data_dir(data_dir) {
        warn!(error = %e, "Failed to initialize data directory");
    }
    match AppConfig::load_from_path(&config_path(data_dir)) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %format!("{err:#}"), "Failed to load config file, using defaults");
            AppConfig::default()
        }
    }
}

/// Paths from the config file are relative to the data directory; paths from
/// the command line are used as given.
fn resolve_run(config: &AppConfig, args: &RunArgs, data_dir: &Path) -> Result<ResolvedRun> {
    let mut tiling = config.tiling.clone();
    if let Some(tile) = args.tile {
        tiling.tile_size = Some(tile);
    }
    if let Some(overlap) = args.tile_overlap {
        tiling.tile_overlap = overlap;
    }
    if let Some(window) = args.window_size {
        tiling.window_size = window;
    }
    if let Some(scale) = args.scale {
        tiling.scale = scale;
    }

    let model_path = match (&args.model, &config.model.path) {
        (Some(cli), _) => cli.clone(),
        (None, Some(configured)) => resolve_relative_to(data_dir, configured),
        (None, None) => bail!("no model given; pass --model or set [model].path in the config"),
    };

    let backend = InferenceBackend::from_str_lossy(
        args.backend.as_deref().unwrap_or(&config.model.backend),
    );

    let output_dir = match &args.output {
        Some(dir) => dir.clone(),
        None => resolve_relative_to(data_dir, &config.paths.output_dir),
    };

    Ok(ResolvedRun {
        tiling,
        model_path,
        backend,
        input_name: config.model.input_name.clone(),
        output_name: config.model.output_name.clone(),
        trt_cache_dir: resolve_relative_to(data_dir, &config.model.trt_cache_dir),
        output_dir,
        suffix: args
            .suffix
            .clone()
            .unwrap_or_else(|| config.paths.suffix.clone()),
        options: RestoreOptions {
            color: if args.gray {
                ColorMode::Gray
            } else {
                ColorMode::Rgb
            },
            parallel: args.parallel || config.performance.parallel,
        },
    })
}

fn render_plan(args: &PlanArgs) -> Result<String> {
    let plan = planner::plan(
        args.height,
        args.width,
        args.tile,
        args.tile_overlap,
        args.window_size,
    )?;
    let report = PlanReport {
        tiles: plan.descriptors(),
        plan,
    };
    serde_json::to_string_pretty(&report).context("failed to encode tile plan")
}

async fn run_restore(args: RunArgs, data_dir: PathBuf) -> Result<()> {
    let config = load_config(&data_dir);
    let resolved = resolve_run(&config, &args, &data_dir)?;
    resolved.tiling.validate()?;

    let inputs = batch::discover_inputs(&args.input)?;
    info!(
        images = inputs.len(),
        model = %resolved.model_path.display(),
        backend = %resolved.backend,
        mode = ?resolved.tiling.mode(),
        parallel = resolved.options.parallel,
        "Starting restoration"
    );

    let cancel = CancellationToken::new();
    let ctrl_c_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; stopping after the current tile");
            ctrl_c_token.cancel();
        }
    });

    let started = Instant::now();
    let worker_cancel = cancel.clone();
    let summaries = tokio::task::spawn_blocking(move || {
        restore_all(&resolved, &inputs, &worker_cancel)
    })
    .await
    .context("restoration worker panicked")??;

    info!(
        images = summaries.len(),
        tiles = summaries.iter().map(|s| s.tiles).sum::<usize>(),
        elapsed = %format_duration(started.elapsed().as_secs_f64()),
        "Restoration finished"
    );
    Ok(())
}

fn restore_all(
    resolved: &ResolvedRun,
    inputs: &[PathBuf],
    cancel: &CancellationToken,
) -> Result<Vec<RestoreSummary>> {
    let session_config = SessionConfig {
        model_path: &resolved.model_path,
        backend: &resolved.backend,
        trt_cache_dir: Some(&resolved.trt_cache_dir),
    };
    let transform = OnnxTransform::load(
        &session_config,
        resolved.input_name.clone(),
        resolved.output_name.clone(),
    )?;
    info!(
        input = transform.input_name(),
        output = transform.output_name(),
        fp16 = transform.is_fp16(),
        "Loaded model"
    );
    if resolved.options.parallel && resolved.tiling.tile_size.is_some() {
        warn!(
            "Parallel tiles share a single ONNX session; slicing and blending overlap, \
             but model calls still run one at a time"
        );
    }
    let mut engine = TileEngine::new(resolved.tiling.clone(), transform)?;

    let mut summaries = Vec::with_capacity(inputs.len());
    for (index, input) in inputs.iter().enumerate() {
        let output = batch::output_path_for(input, &resolved.output_dir, &resolved.suffix);
        match batch::restore_file(&mut engine, input, &output, resolved.options, cancel) {
            Ok(summary) => {
                eprintln!(
                    "[{}/{}] {} -> {} ({}x{} -> {}x{}, {} tiles, {})",
                    index + 1,
                    inputs.len(),
                    summary.input.display(),
                    summary.output.display(),
                    summary.input_size.0,
                    summary.input_size.1,
                    summary.output_size.0,
                    summary.output_size.1,
                    summary.tiles,
                    format_duration(summary.elapsed.as_secs_f64()),
                );
                summaries.push(summary);
            }
            Err(err) if is_cancellation(&err) => {
                bail!(
                    "cancelled after {} of {} images",
                    summaries.len(),
                    inputs.len()
                );
            }
            Err(err) => return Err(err),
        }
    }
    Ok(summaries)
}

fn is_cancellation(err: &anyhow::Error) -> bool {
    err.downcast_ref::<TileError>()
        .is_some_and(TileError::is_cancelled)
}

fn format_duration(secs: f64) -> String {
    let total = secs.round() as u64;
    let h = total / 3600;
    let m = (total % 3600) / 60;
    let s = total % 60;
    format!("{:02}:{:02}:{:02}", h, m, s)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_args(input: &str) -> RunArgs {
        RunArgs {
            input: PathBuf::from(input),
            ..RunArgs::default()
        }
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(0.0), "00:00:00");
        assert_eq!(format_duration(59.4), "00:00:59");
        assert_eq!(format_duration(3661.0), "01:01:01");
    }

    #[test]
    fn parallel_help_mentions_the_shared_session() {
        use clap::CommandFactory;

        let command = Cli::command();
        let run = command.find_subcommand("run").expect("run subcommand");
        let parallel = run
            .get_arguments()
            .find(|arg| arg.get_id() == "parallel")
            .expect("--parallel flag");
        let help = parallel.get_help().map(ToString::to_string).unwrap_or_default();
        assert!(help.contains("share one ONNX session"), "{help}");
    }

    #[test]
    fn parses_run_command_with_overrides() {
        let cli = Cli::try_parse_from([
            "swintile",
            "-v",
            "run",
            "photos",
            "--model",
            "m.onnx",
            "--tile",
            "256",
            "--tile-overlap",
            "16",
            "--backend",
            "cpu",
            "--parallel",
        ])
        .expect("parse");

        assert_eq!(cli.verbose, 1);
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.input, PathBuf::from("photos"));
                assert_eq!(args.tile, Some(256));
                assert_eq!(args.tile_overlap, Some(16));
                assert_eq!(args.backend.as_deref(), Some("cpu"));
                assert!(args.parallel);
            }
            Commands::Plan(_) => panic!("expected run command"),
        }
    }

    #[test]
    fn plan_command_uses_default_overlap_and_window() {
        let cli = Cli::try_parse_from([
            "swintile", "plan", "--height", "100", "--width", "140", "--tile", "64",
        ])
        .expect("parse");
        match cli.command {
            Commands::Plan(args) => {
                assert_eq!(args.tile_overlap, DEFAULT_TILE_OVERLAP);
                assert_eq!(args.window_size, DEFAULT_WINDOW_SIZE);
            }
            Commands::Run(_) => panic!("expected plan command"),
        }
    }

    #[test]
    fn cli_flags_override_config_values() {
        let mut config = AppConfig::default();
        config.tiling = TileConfig::tiled(512, 32);
        config.model.path = Some(PathBuf::from("models/config.onnx"));
        config.performance.parallel = false;

        let args = RunArgs {
            model: Some(PathBuf::from("/abs/cli.onnx")),
            tile: Some(128),
            scale: Some(4),
            backend: Some("trt".to_string()),
            suffix: Some("x4".to_string()),
            parallel: true,
            gray: true,
            ..run_args("in.png")
        };
        let resolved = resolve_run(&config, &args, Path::new("/data")).expect("resolve");

        assert_eq!(resolved.tiling.tile_size, Some(128));
        assert_eq!(resolved.tiling.tile_overlap, 32);
        assert_eq!(resolved.tiling.scale, 4);
        assert_eq!(resolved.model_path, PathBuf::from("/abs/cli.onnx"));
        assert_eq!(resolved.backend, InferenceBackend::Tensorrt);
        assert_eq!(resolved.suffix, "x4");
        assert!(resolved.options.parallel);
        assert_eq!(resolved.options.color, ColorMode::Gray);
    }

    #[test]
    fn config_paths_resolve_against_data_dir() {
        let mut config = AppConfig::default();
        config.model.path = Some(PathBuf::from("models/swinir.onnx"));
        config.performance.parallel = true;

        let resolved =
            resolve_run(&config, &run_args("in.png"), Path::new("/data")).expect("resolve");

        assert_eq!(resolved.model_path, PathBuf::from("/data/models/swinir.onnx"));
        assert_eq!(resolved.output_dir, PathBuf::from("/data/results"));
        assert_eq!(resolved.trt_cache_dir, PathBuf::from("/data/trt_cache"));
        assert_eq!(resolved.backend, InferenceBackend::Cuda);
        assert_eq!(resolved.tiling.mode(), swintile_core::ExecutionMode::WholeImage);
        assert!(resolved.options.parallel);
    }

    #[test]
    fn missing_model_is_an_error() {
        let err = resolve_run(&AppConfig::default(), &run_args("in.png"), Path::new("/data"))
            .unwrap_err();
        assert!(err.to_string().contains("no model given"));
    }

    #[test]
    fn plan_json_lists_tiles_in_row_major_order() {
        let args = PlanArgs {
            height: 100,
            width: 140,
            tile: 64,
            tile_overlap: 16,
            window_size: 8,
        };
        let json: serde_json::Value =
            serde_json::from_str(&render_plan(&args).expect("render")).expect("json");

        assert_eq!(json["tile_size"], 64);
        assert_eq!(json["stride"], 48);
        assert_eq!(json["rows"], serde_json::json!([0, 36]));
        assert_eq!(json["cols"], serde_json::json!([0, 48, 76]));
        let tiles = json["tiles"].as_array().expect("tiles");
        assert_eq!(tiles.len(), 6);
        assert_eq!(tiles[1], serde_json::json!({ "row": 0, "col": 48 }));
        assert_eq!(tiles[3], serde_json::json!({ "row": 36, "col": 0 }));
    }

    #[test]
    fn plan_rejects_misaligned_tile() {
        let args = PlanArgs {
            height: 100,
            width: 100,
            tile: 50,
            tile_overlap: 8,
            window_size: 8,
        };
        let err = render_plan(&args).unwrap_err();
        assert!(err.downcast_ref::<TileError>().is_some());
    }

    #[test]
    fn cancellation_is_detected_through_context() {
        let err = anyhow::Error::new(TileError::Cancelled).context("failed to restore a.png");
        assert!(is_cancellation(&err));
        assert!(!is_cancellation(&anyhow::anyhow!("disk full")));
    }
}
