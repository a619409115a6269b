use std::hash::{Hash, Hasher};

use serde::Serialize;
use tracing::Level;

use crate::ProcessKind;

/// A command lifecycle event, emitted under the `cmdgate.obs` target.
/// Unset fields are logged as empty strings so every line has the same keys.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ObservabilityEvent<'a> {
    pub event: &'a str,
    pub component: &'a str,
    pub channel_id: Option<&'a str>,
    pub message_id: Option<&'a str>,
    pub executor: Option<&'a str>,
    pub command: Option<&'a str>,
    pub status: Option<&'a str>,
    pub error_code: Option<&'a str>,
    pub detail: Option<&'a str>,
}

/// Replace a secret with its length and a short fingerprint, so two log
/// lines can be compared without exposing the value.
pub fn redact_text(input: &str) -> String {
    match input.trim() {
        "" => String::new(),
        secret => format!("[redacted len={} hash={}]", secret.len(), short_hash(secret)),
    }
}

pub fn short_hash(input: &str) -> String {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    input.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

macro_rules! obs_event {
    ($level:expr, $process:expr, $ev:expr) => {
        tracing::event!(
            target: "cmdgate.obs",
            $level,
            process = $process.as_str(),
            component = $ev.component,
            event = $ev.event,
            channel_id = $ev.channel_id.unwrap_or_default(),
            message_id = $ev.message_id.unwrap_or_default(),
            executor = $ev.executor.unwrap_or_default(),
            command = $ev.command.unwrap_or_default(),
            status = $ev.status.unwrap_or_default(),
            error_code = $ev.error_code.unwrap_or_default(),
            detail = $ev.detail.unwrap_or_default(),
            "observability_event"
        )
    };
}

/// `tracing` levels are static per callsite; DEBUG and TRACE fold into
/// DEBUG.
pub fn emit_event(level: Level, process: ProcessKind, event: ObservabilityEvent<'_>) {
    if level == Level::ERROR {
        obs_event!(Level::ERROR, process, event);
    } else if level == Level::WARN {
        obs_event!(Level::WARN, process, event);
    } else if level == Level::INFO {
        obs_event!(Level::INFO, process, event);
    } else {
        obs_event!(Level::DEBUG, process, event);
    }
}
