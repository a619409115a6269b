use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cmdgate_core::Replier;
use tokio::sync::mpsc;

/// An inbound command that passed the adapter's filters.
#[derive(Debug, Clone)]
pub struct ChannelMessage {
    /// Platform id of the message that markers are attached to.
    pub id: String,
    pub channel_id: String,
    /// Identity checked against operator lists.
    pub sender: String,
    /// Platform user id used for direct replies.
    pub sender_id: String,
    /// Command text with the prefix already removed.
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

#[async_trait]
pub trait Channel: Send + Sync {
    fn name(&self) -> &str;

    /// Stream accepted commands into `tx` until the connection drops.
    async fn listen(&self, tx: mpsc::Sender<ChannelMessage>) -> anyhow::Result<()>;

    async fn health_check(&self) -> bool;

    /// Reply capability bound to `msg`.
    fn replier(&self, msg: &ChannelMessage) -> Arc<dyn Replier>;
}
