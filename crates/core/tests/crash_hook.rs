use std::{
    fs,
    path::{Path, PathBuf},
    process::Command,
};

use ndarray::{Array4, ArrayView4};
use swintile_core::logging::{install_panic_hook, DEFAULT_CRASH_DIR_NAME, DEFAULT_LOG_DIR_NAME};
use swintile_core::{TileConfig, TileEngine};
use tempfile::tempdir;

const MODE_ENV: &str = "SWINTILE_PANIC_CHILD_MODE";
const DATA_DIR_ENV: &str = "SWINTILE_PANIC_CHILD_DATA_DIR";

fn run_panic_child(mode: &str, data_dir: &Path) -> std::process::Output {
    Command::new(std::env::current_exe().expect("test executable path"))
        .arg("panic_hook_child_entrypoint")
        .arg("--exact")
        .arg("--nocapture")
        .env(MODE_ENV, mode)
        .env(DATA_DIR_ENV, data_dir)
        .output()
        .expect("run panic hook child")
}

fn crash_dir(data_dir: &Path) -> PathBuf {
    data_dir.join(DEFAULT_LOG_DIR_NAME).join(DEFAULT_CRASH_DIR_NAME)
}

fn collect_crash_artifacts(crash_dir: &Path) -> Vec<PathBuf> {
    let mut paths = fs::read_dir(crash_dir)
        .expect("read crash directory")
        .map(|entry| entry.expect("read crash directory entry").path())
        .filter(|path| path.extension().and_then(|ext| ext.to_str()) == Some("log"))
        .collect::<Vec<_>>();
    paths.sort();
    paths
}

fn panicking_tile(input: ArrayView4<'_, f32>) -> anyhow::Result<Array4<f32>> {
    if input[[0, 0, 0, 0]] > 0.5 {
        panic!("intentional panic inside tile transform");
    }
    Ok(input.to_owned())
}

#[test]
fn panic_hook_child_entrypoint() {
    let Ok(mode) = std::env::var(MODE_ENV) else {
        return;
    };

    let data_dir =
        PathBuf::from(std::env::var(DATA_DIR_ENV).expect("child data dir must be set"));

    let installed = install_panic_hook(Some(data_dir.as_path())).expect("install panic hook");
    assert_eq!(installed, crash_dir(&data_dir));
    assert_eq!(
        install_panic_hook(None).expect("hook already installed"),
        installed
    );

    match mode.as_str() {
        "transform_panic" => {
            let image = Array4::from_shape_fn((1, 1, 32, 32), |(_, _, y, _)| {
                if y >= 16 {
                    1.0
                } else {
                    0.0
                }
            });
            let mut engine =
                TileEngine::new(TileConfig::tiled(16, 0), panicking_tile).expect("engine");
            let _ = engine.run(image.view());
            unreachable!("second tile row should panic");
        }
        "write_failure" => {
            let crash_dir = crash_dir(&data_dir);
            if crash_dir.exists() {
                fs::remove_dir_all(&crash_dir).expect("remove crash directory");
            }
            fs::write(&crash_dir, b"not-a-directory").expect("replace crash directory with file");
            panic!("intentional panic with unwritable crash dir");
        }
        other => panic!("unknown panic hook child mode: {other}"),
    }
}

#[test]
fn transform_panic_writes_crash_file() {
    let data_dir = tempdir().expect("tempdir");
    let output = run_panic_child("transform_panic", data_dir.path());

    assert!(!output.status.success(), "child process should panic");

    let crash_artifacts = collect_crash_artifacts(&crash_dir(data_dir.path()));
    let newest_artifact = crash_artifacts.last().expect("expected crash artifact");
    let contents = fs::read_to_string(newest_artifact).expect("read crash artifact");

    assert!(contents.contains("timestamp_utc="));
    assert!(contents.contains("payload=intentional panic inside tile transform"));
    assert!(contents.contains("location="));
    assert!(contents.contains("backtrace="));

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(!stderr.contains("thread panicked while panicking"));
}

#[test]
fn unwritable_crash_dir_warns_and_does_not_repanic() {
    let data_dir = tempdir().expect("tempdir");
    let output = run_panic_child("write_failure", data_dir.path());

    assert!(!output.status.success(), "child process should panic");

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("intentional panic with unwritable crash dir"));
    assert!(stderr.contains("Warning: could not write crash report under"));
    assert!(!stderr.contains("thread panicked while panicking"));
}
