//! Process logging for cmdgate binaries and structured command events.

mod event;
mod init;

pub use event::{emit_event, redact_text, short_hash, ObservabilityEvent};
pub use init::{init_process_logging, LoggingInitInfo, DEFAULT_RETENTION_DAYS};

use serde::Serialize;

/// Which binary mode is logging; selects the log file family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessKind {
    /// Long-running chat gateway.
    Gateway,
    /// One-shot CLI invocation, e.g. from a template.
    Cli,
}

impl ProcessKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessKind::Gateway => "gateway",
            ProcessKind::Cli => "cli",
        }
    }
}
