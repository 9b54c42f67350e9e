//! Log filter selection, the rolling file sink and the crash-report panic hook.
//!
//! Nothing here installs a subscriber; the binary builds its layers from
//! [`FilterRequest::resolve`] and [`open_file_sink`].

use std::{
    any::Any,
    backtrace::{Backtrace, BacktraceStatus},
    fs,
    panic::{self, AssertUnwindSafe, PanicHookInfo},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        OnceLock,
    },
};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing_appender::rolling::{InitError, RollingFileAppender, Rotation};

pub const DEFAULT_LOG_FILTER: &str = "info";
/// ONNX Runtime logs provider probing at info level on every session build.
pub const DEFAULT_NOISE_FILTER: &str = "ort=error";
pub const DEFAULT_LOG_RETENTION_FILES: usize = 14;
pub const DEFAULT_LOG_DIR_NAME: &str = "logs";
pub const DEFAULT_CRASH_DIR_NAME: &str = "crash";
const LOG_FILE_PREFIX: &str = "swintile";

static CRASH_DIR: OnceLock<PathBuf> = OnceLock::new();
static CRASH_WRITE_IN_PROGRESS: AtomicBool = AtomicBool::new(false);
static CRASH_SEQUENCE: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Error)]
pub enum LogSinkError {
    #[error("no data directory configured")]
    NoDataDir,

    #[error("failed to create {}: {source}", path.display())]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to open rolling log in {}: {source}", path.display())]
    Appender { path: PathBuf, source: InitError },
}

/// Filter sources in precedence order: `--log-filter`, `-v`/`-vv`, `RUST_LOG`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterRequest {
    pub cli: Option<String>,
    pub verbose: u8,
    pub env: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFilters {
    pub console: String,
    pub file: String,
}

impl FilterRequest {
    fn is_explicit(&self) -> bool {
        self.cli.is_some() || self.verbose > 0
    }

    fn user_filter(&self) -> &str {
        match (self.cli.as_deref(), self.verbose) {
            (Some(filter), _) => filter,
            (None, 2..) => "trace",
            (None, 1) => "debug",
            (None, 0) => self.env.as_deref().unwrap_or(DEFAULT_LOG_FILTER),
        }
    }

    /// `noise` is prepended only when the user did not pick a filter on the
    /// command line. The file sink keeps warnings for those targets.
    pub fn resolve(&self, noise: &str) -> LogFilters {
        let user = self.user_filter();
        if self.is_explicit() || noise.trim().is_empty() {
            return LogFilters {
                console: user.to_string(),
                file: user.to_string(),
            };
        }
        LogFilters {
            console: format!("{noise},{user}"),
            file: format!("{},{user}", widen_errors_to_warn(noise)),
        }
    }
}

fn widen_errors_to_warn(directives: &str) -> String {
    directives
        .split(',')
        .map(str::trim)
        .filter(|directive| !directive.is_empty())
        .map(|directive| match directive.split_once('=') {
            Some((target, level)) if level.trim().eq_ignore_ascii_case("error") => {
                format!("{}=warn", target.trim())
            }
            _ => directive.to_string(),
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Daily-rotated `swintile.*.log` files under `<data_dir>/logs`. A zero
/// retention keeps the default number of files.
pub fn open_file_sink(
    data_dir: Option<&Path>,
    retention: usize,
) -> Result<RollingFileAppender, LogSinkError> {
    let data_dir = data_dir.ok_or(LogSinkError::NoDataDir)?;
    let log_dir = data_dir.join(DEFAULT_LOG_DIR_NAME);
    fs::create_dir_all(&log_dir).map_err(|source| LogSinkError::CreateDir {
        path: log_dir.clone(),
        source,
    })?;

    let retention = if retention == 0 {
        DEFAULT_LOG_RETENTION_FILES
    } else {
        retention
    };
    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix("log")
        .max_log_files(retention)
        .build(&log_dir)
        .map_err(|source| LogSinkError::Appender {
            path: log_dir,
            source,
        })
}

/// Chain a hook that writes one report per panic under `<data_dir>/logs/crash`.
///
/// Returns the crash directory in use. Later calls keep the first hook and
/// its directory.
pub fn install_panic_hook(data_dir: Option<&Path>) -> Result<PathBuf, LogSinkError> {
    if let Some(existing) = CRASH_DIR.get() {
        return Ok(existing.clone());
    }

    let data_dir = data_dir.ok_or(LogSinkError::NoDataDir)?;
    let crash_dir = data_dir
        .join(DEFAULT_LOG_DIR_NAME)
        .join(DEFAULT_CRASH_DIR_NAME);
    fs::create_dir_all(&crash_dir).map_err(|source| LogSinkError::CreateDir {
        path: crash_dir.clone(),
        source,
    })?;

    let installed = CRASH_DIR.get_or_init(|| {
        let previous = panic::take_hook();
        let hook_dir = crash_dir.clone();
        panic::set_hook(Box::new(move |info| {
            record_crash(&hook_dir, info);
            previous(info);
        }));
        crash_dir
    });
    Ok(installed.clone())
}

fn record_crash(crash_dir: &Path, info: &PanicHookInfo<'_>) {
    // a panic while writing the report must not recurse into the hook
    if CRASH_WRITE_IN_PROGRESS.swap(true, Ordering::AcqRel) {
        return;
    }

    let written = panic::catch_unwind(AssertUnwindSafe(|| {
        let at = Utc::now();
        let location = info
            .location()
            .map_or_else(|| "<unknown>".to_string(), ToString::to_string);
        let report = crash_report(
            at,
            &location,
            payload_text(info.payload()),
            &Backtrace::capture(),
        );
        write_crash_report(crash_dir, at, &report)
    }));

    match written {
        Ok(Ok(_)) => {}
        Ok(Err(error)) => eprintln!(
            "Warning: could not write crash report under '{}': {error}",
            crash_dir.display()
        ),
        Err(_) => eprintln!(
            "Warning: panic hook failed while writing crash report under '{}'",
            crash_dir.display()
        ),
    }

    CRASH_WRITE_IN_PROGRESS.store(false, Ordering::Release);
}

fn crash_report(at: DateTime<Utc>, location: &str, payload: &str, backtrace: &Backtrace) -> String {
    let backtrace = match backtrace.status() {
        BacktraceStatus::Captured => format!("captured\n{backtrace}"),
        BacktraceStatus::Disabled => "disabled (set RUST_BACKTRACE=1 to capture)".to_string(),
        _ => "unsupported".to_string(),
    };
    format!(
        "timestamp_utc={}\nlocation={location}\npayload={payload}\nbacktrace={backtrace}\n",
        at.to_rfc3339()
    )
}

fn write_crash_report(
    crash_dir: &Path,
    at: DateTime<Utc>,
    report: &str,
) -> std::io::Result<PathBuf> {
    fs::create_dir_all(crash_dir)?;
    let sequence = CRASH_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    let path = crash_dir.join(format!(
        "panic-{}-{sequence:04}.log",
        at.format("%Y%m%d-%H%M%S-%f")
    ));
    fs::write(&path, report)?;
    Ok(path)
}

fn payload_text(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("<non-string panic payload>")
}
