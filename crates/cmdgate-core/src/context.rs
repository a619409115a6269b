//! The per-invocation execution context and the reply capability every chat
//! backend implements.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::Span;

use crate::error::ReplyResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Bad,
    Forbidden,
    Success,
    Failure,
    Running,
}

impl Status {
    pub const ALL: [Status; 5] = [
        Status::Bad,
        Status::Forbidden,
        Status::Success,
        Status::Failure,
        Status::Running,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Bad => "bad",
            Status::Forbidden => "forbidden",
            Status::Success => "success",
            Status::Failure => "failure",
            Status::Running => "running",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outbound side of one inbound message, implemented by each chat adapter.
///
/// A replier is bound to the message that triggered the invocation, so
/// `reply` marks that message and answers in its channel, and
/// `reply_direct` reaches its author privately.
#[async_trait]
pub trait Replier: Send + Sync {
    /// Attach the status marker for `status` and post `lines`, if any.
    async fn reply(
        &self,
        cancel: &CancellationToken,
        status: Status,
        lines: &[String],
    ) -> ReplyResult;

    /// Send `lines` privately to the invoker.
    async fn reply_direct(&self, cancel: &CancellationToken, lines: &[String]) -> ReplyResult;

    /// Maximum message size the transport accepts, in bytes.
    fn message_limit(&self) -> usize;

    /// Human-readable name of the marker used for `status`.
    fn status_name(&self, status: Status) -> String;

    /// How an operator identity is shown in help output.
    fn render_operator(&self, identity: &str) -> String {
        format!("`{identity}`")
    }
}

/// Everything a command node needs to run one invocation.
///
/// Cloning is cheap. [`ExecutionContext::shift_args`] returns a new value
/// and never touches the original, so concurrent descents cannot alias.
#[derive(Clone)]
pub struct ExecutionContext {
    args: Arc<[String]>,
    offset: usize,
    executor: Arc<str>,
    issued_at: DateTime<Utc>,
    cancel: CancellationToken,
    span: Span,
    replier: Arc<dyn Replier>,
}

impl ExecutionContext {
    pub fn new(executor: impl Into<String>, args: Vec<String>, replier: Arc<dyn Replier>) -> Self {
        let executor: String = executor.into();
        let span = tracing::info_span!(
            "command",
            executor = %executor,
            command = %args.join(" "),
        );
        Self {
            args: args.into(),
            offset: 0,
            executor: executor.into(),
            issued_at: Utc::now(),
            cancel: CancellationToken::new(),
            span,
            replier,
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_issued_at(mut self, issued_at: DateTime<Utc>) -> Self {
        self.issued_at = issued_at;
        self
    }

    pub fn executor(&self) -> &str {
        &self.executor
    }

    /// Arguments not yet consumed by the tree walk.
    pub fn args(&self) -> &[String] {
        &self.args[self.offset..]
    }

    /// Arguments consumed so far, i.e. the matched command path.
    pub fn consumed(&self) -> &[String] {
        &self.args[..self.offset]
    }

    pub fn shift_args(&self) -> Self {
        let mut next = self.clone();
        next.offset = (self.offset + 1).min(self.args.len());
        next
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    pub fn message_limit(&self) -> usize {
        self.replier.message_limit()
    }

    pub fn status_name(&self, status: Status) -> String {
        self.replier.status_name(status)
    }

    pub fn render_operator(&self, identity: &str) -> String {
        self.replier.render_operator(identity)
    }

    pub async fn reply(&self, status: Status, lines: Vec<String>) -> ReplyResult {
        self.replier.reply(&self.cancel, status, &lines).await
    }

    pub async fn reply_direct(&self, lines: Vec<String>) -> ReplyResult {
        self.replier.reply_direct(&self.cancel, &lines).await
    }

    pub async fn reply_bad(&self, lines: Vec<String>) -> ReplyResult {
        self.reply(Status::Bad, lines).await
    }

    pub async fn reply_forbidden(&self, lines: Vec<String>) -> ReplyResult {
        self.reply(Status::Forbidden, lines).await
    }

    pub async fn reply_success(&self, lines: Vec<String>) -> ReplyResult {
        self.reply(Status::Success, lines).await
    }

    pub async fn reply_failure(&self, lines: Vec<String>) -> ReplyResult {
        self.reply(Status::Failure, lines).await
    }

    pub async fn reply_running(&self, lines: Vec<String>) -> ReplyResult {
        self.reply(Status::Running, lines).await
    }
}
