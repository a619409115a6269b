use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{Builder, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::ProcessKind;

pub const DEFAULT_RETENTION_DAYS: u64 = 14;
const LOG_SUFFIX: &str = "jsonl";

#[derive(Debug, Clone, Serialize)]
pub struct LoggingInitInfo {
    pub process: ProcessKind,
    pub logs_dir: PathBuf,
    pub file_prefix: String,
    pub retention_days: u64,
    pub removed_files: usize,
    pub initialized_at: DateTime<Utc>,
}

/// Install the global subscriber: compact console output on stderr plus a
/// daily JSON-lines file under `logs_dir`. Files of the same process older
/// than `retention_days` are removed first. Keep the guard alive until exit
/// or buffered file lines are lost.
pub fn init_process_logging(
    process: ProcessKind,
    logs_dir: &Path,
    retention_days: u64,
) -> anyhow::Result<(WorkerGuard, LoggingInitInfo)> {
    fs::create_dir_all(logs_dir)?;
    let prefix = file_prefix(process);
    let removed_files = remove_expired(logs_dir, &prefix, retention_days, Utc::now().date_naive())?;

    let appender = Builder::new()
        .rotation(Rotation::DAILY)
        .filename_prefix(&prefix)
        .filename_suffix(LOG_SUFFIX)
        .build(logs_dir)?;
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // stdout carries command results in CLI mode.
    let console = fmt::layer()
        .compact()
        .with_writer(std::io::stderr)
        .with_ansi(process == ProcessKind::Gateway);
    let file = fmt::layer()
        .json()
        .with_writer(writer)
        .with_ansi(false)
        .with_current_span(true)
        .with_span_list(false);

    // A second init in the same process (tests) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .try_init();

    let info = LoggingInitInfo {
        process,
        logs_dir: logs_dir.to_path_buf(),
        file_prefix: prefix,
        retention_days,
        removed_files,
        initialized_at: Utc::now(),
    };
    Ok((guard, info))
}

fn file_prefix(process: ProcessKind) -> String {
    format!("cmdgate.{}", process.as_str())
}

/// Day encoded in `<prefix>.YYYY-MM-DD.jsonl`, if `name` is one of ours.
fn log_file_day(name: &str, prefix: &str) -> Option<NaiveDate> {
    let day = name
        .strip_prefix(prefix)?
        .strip_prefix('.')?
        .strip_suffix(LOG_SUFFIX)?
        .strip_suffix('.')?;
    NaiveDate::parse_from_str(day, "%Y-%m-%d").ok()
}

fn remove_expired(
    logs_dir: &Path,
    prefix: &str,
    retention_days: u64,
    today: NaiveDate,
) -> anyhow::Result<usize> {
    let keep_from = today - chrono::Days::new(retention_days);
    let expired: Vec<PathBuf> = fs::read_dir(logs_dir)?
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .and_then(|name| log_file_day(name, prefix))
                .is_some_and(|day| day < keep_from)
        })
        .collect();
    let mut removed = 0;
    for path in expired {
        if fs::remove_file(&path).is_ok() {
            removed += 1;
        }
    }
    Ok(removed)
}
