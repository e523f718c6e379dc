use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const LOG_PREFIX: &str = "prompt-dock";
const RETENTION_DAYS: u64 = 14;

/// Console layer plus daily-rolled JSONL files under `<state-dir>/logs`.
/// `LOG_LEVEL` overrides the filter; `--verbose` wins over both.
pub fn init(state_dir: &Path, verbose: bool) -> anyhow::Result<WorkerGuard> {
    let logs_dir = logs_dir(state_dir);
    fs::create_dir_all(&logs_dir)?;
    cleanup_old_jsonl(&logs_dir, RETENTION_DAYS)?;

    let file_appender = tracing_appender::rolling::Builder::new()
        .rotation(tracing_appender::rolling::Rotation::DAILY)
        .filename_prefix(LOG_PREFIX)
        .filename_suffix("jsonl")
        .build(&logs_dir)?;
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_current_span(false)
        .with_span_list(false);

    let console_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_target(true)
        .with_ansi(true);

    let filter = if verbose {
        EnvFilter::new("debug")
    } else if let Ok(level) = std::env::var("LOG_LEVEL") {
        EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"))
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .ok();

    Ok(guard)
}

pub fn logs_dir(state_dir: &Path) -> PathBuf {
    state_dir.join("logs")
}

/// The newest rolled log file, for `logs -n/-f`.
pub fn latest_log_file(state_dir: &Path) -> Option<PathBuf> {
    let mut files: Vec<PathBuf> = fs::read_dir(logs_dir(state_dir))
        .ok()?
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with(LOG_PREFIX) && n.ends_with(".jsonl"))
                .unwrap_or(false)
        })
        .collect();
    files.sort();
    files.pop()
}

fn cleanup_old_jsonl(logs_dir: &Path, retention_days: u64) -> anyhow::Result<()> {
    let cutoff = Utc::now() - chrono::Duration::days(retention_days as i64);
    let prefix = format!("{LOG_PREFIX}.");

    for entry in fs::read_dir(logs_dir)? {
        let Ok(entry) = entry else { continue };
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !name.starts_with(&prefix) || !name.ends_with(".jsonl") {
            continue;
        }

        // expected: prompt-dock.YYYY-MM-DD.jsonl
        let date_part = name.trim_start_matches(&prefix).trim_end_matches(".jsonl");
        let Ok(date) = chrono::NaiveDate::parse_from_str(date_part, "%Y-%m-%d") else {
            continue;
        };
        let Some(midnight) = date.and_hms_opt(0, 0, 0) else {
            continue;
        };
        if DateTime::<Utc>::from_naive_utc_and_offset(midnight, Utc) < cutoff {
            let _ = fs::remove_file(path);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn old_log_files_are_removed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let stale = dir.path().join("prompt-dock.2020-01-01.jsonl");
        let fresh = dir
            .path()
            .join(format!("prompt-dock.{}.jsonl", Utc::now().format("%Y-%m-%d")));
        let unrelated = dir.path().join("other.txt");
        for path in [&stale, &fresh, &unrelated] {
            fs::write(path, b"{}\n").expect("write");
        }

        cleanup_old_jsonl(dir.path(), RETENTION_DAYS).expect("cleanup");
        assert!(!stale.exists());
        assert!(fresh.exists());
        assert!(unrelated.exists());
    }

    #[test]
    fn latest_log_file_picks_the_newest_date() {
        let dir = tempfile::tempdir().expect("tempdir");
        let logs = logs_dir(dir.path());
        fs::create_dir_all(&logs).expect("mkdir");
        for name in [
            "prompt-dock.2026-07-30.jsonl",
            "prompt-dock.2026-07-31.jsonl",
        ] {
            fs::write(logs.join(name), b"{}\n").expect("write");
        }
        let latest = latest_log_file(dir.path()).expect("latest");
        assert!(latest.ends_with("prompt-dock.2026-07-31.jsonl"));
    }
}
