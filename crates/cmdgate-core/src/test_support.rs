use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::context::{Replier, Status};
use crate::error::ReplyResult;

/// Replier double that records everything it is asked to send.
pub struct RecordingReplier {
    pub limit: usize,
    replies: Mutex<Vec<(Status, Vec<String>)>>,
    direct: Mutex<Vec<Vec<String>>>,
}

impl Default for RecordingReplier {
    fn default() -> Self {
        Self::with_limit(2000)
    }
}

impl RecordingReplier {
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit,
            replies: Mutex::new(Vec::new()),
            direct: Mutex::new(Vec::new()),
        }
    }

    pub fn replies(&self) -> Vec<(Status, Vec<String>)> {
        self.replies.lock().clone()
    }

    pub fn statuses(&self) -> Vec<Status> {
        self.replies.lock().iter().map(|(s, _)| *s).collect()
    }

    pub fn last_text(&self) -> String {
        self.replies
            .lock()
            .last()
            .map(|(_, lines)| lines.join("\n"))
            .unwrap_or_default()
    }

    pub fn direct_messages(&self) -> Vec<Vec<String>> {
        self.direct.lock().clone()
    }
}

#[async_trait]
impl Replier for RecordingReplier {
    async fn reply(
        &self,
        _cancel: &CancellationToken,
        status: Status,
        lines: &[String],
    ) -> ReplyResult {
        self.replies.lock().push((status, lines.to_vec()));
        Ok(())
    }

    async fn reply_direct(&self, _cancel: &CancellationToken, lines: &[String]) -> ReplyResult {
        self.direct.lock().push(lines.to_vec());
        Ok(())
    }

    fn message_limit(&self) -> usize {
        self.limit
    }

    fn status_name(&self, status: Status) -> String {
        status.as_str().to_string()
    }
}
