//! traQ channel adapter.
//!
//! Listens on the bot WebSocket (`/api/v3/bots/ws`) for `MESSAGE_CREATED`
//! events and answers through the REST API: a stamp on the triggering
//! message plus an optional message in the same channel.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cmdgate_core::config::Stamps;
use cmdgate_core::{with_retry, ReplyResult, Replier, RetryError, RetryPolicy, Status};
use futures_util::{SinkExt, StreamExt};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{marker_for, TraqChannelConfig};
use crate::traits::{Channel, ChannelMessage};

pub const TRAQ_MESSAGE_LIMIT: usize = 9900;

// ---------------------------------------------------------------------------
// REST client
// ---------------------------------------------------------------------------

struct TraqApi {
    client: Client,
    base: String,
    token: String,
}

#[derive(Debug, Deserialize)]
struct StampInfo {
    id: String,
    name: String,
}

impl TraqApi {
    fn new(origin: &str, token: &str) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .context("building traQ http client")?;
        Ok(Self {
            client,
            base: format!("{origin}/api/v3"),
            token: token.to_string(),
        })
    }

    async fn post_json(&self, path: &str, body: &serde_json::Value) -> anyhow::Result<()> {
        let resp = self
            .client
            .post(format!("{}{path}", self.base))
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let err = resp.text().await.unwrap_or_default();
            anyhow::bail!("traQ POST {path} failed ({status}): {err}");
        }
        Ok(())
    }

    async fn post_json_retrying(
        &self,
        cancel: &CancellationToken,
        path: &str,
        body: serde_json::Value,
    ) -> Result<(), RetryError> {
        let body = &body;
        with_retry(cancel, RetryPolicy::default(), || self.post_json(path, body)).await
    }

    async fn post_message(
        &self,
        cancel: &CancellationToken,
        channel_id: &str,
        content: &str,
    ) -> Result<(), RetryError> {
        let path = format!("/channels/{channel_id}/messages");
        self.post_json_retrying(cancel, &path, json!({ "content": content }))
            .await
    }

    async fn post_direct_message(
        &self,
        cancel: &CancellationToken,
        user_id: &str,
        content: &str,
    ) -> Result<(), RetryError> {
        let path = format!("/users/{user_id}/messages");
        self.post_json_retrying(cancel, &path, json!({ "content": content }))
            .await
    }

    async fn add_stamp(
        &self,
        cancel: &CancellationToken,
        message_id: &str,
        stamp_id: &str,
    ) -> Result<(), RetryError> {
        let path = format!("/messages/{message_id}/stamps/{stamp_id}");
        self.post_json_retrying(cancel, &path, json!({ "count": 1 }))
            .await
    }

    async fn stamps(&self) -> anyhow::Result<Vec<StampInfo>> {
        let resp = self
            .client
            .get(format!("{}/stamps", self.base))
            .bearer_auth(&self.token)
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.json().await?)
    }

    async fn me(&self) -> bool {
        self.client
            .get(format!("{}/users/me", self.base))
            .bearer_auth(&self.token)
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }
}

// ---------------------------------------------------------------------------
// Stamps
// ---------------------------------------------------------------------------

/// Stamp ids from the config plus their display names.
struct StatusStamps {
    ids: Stamps,
    names: HashMap<String, String>,
}

impl StatusStamps {
    fn new(ids: Stamps, stamps: Vec<StampInfo>) -> Self {
        let names = stamps.into_iter().map(|s| (s.id, s.name)).collect();
        Self { ids, names }
    }

    fn id(&self, status: Status) -> &str {
        marker_for(&self.ids, status)
    }

    fn display_name(&self, status: Status) -> String {
        let id = self.id(status);
        match self.names.get(id) {
            Some(name) => format!(":{name}:"),
            None => format!("`{id}`"),
        }
    }
}

// ---------------------------------------------------------------------------
// Inbound events
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct WsEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    body: serde_json::Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageCreated {
    event_time: DateTime<Utc>,
    message: TraqMessage,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TraqMessage {
    id: String,
    user: TraqUser,
    channel_id: String,
    plain_text: String,
}

#[derive(Debug, Deserialize)]
struct TraqUser {
    id: String,
    name: String,
    #[serde(default)]
    bot: bool,
}

/// Turn one WebSocket frame into a command, if it is a human's prefixed
/// message in the watched channel.
fn parse_event(raw: &str, channel_id: &str, prefix: &str) -> Option<ChannelMessage> {
    let event: WsEvent = serde_json::from_str(raw).ok()?;
    if event.kind != "MESSAGE_CREATED" {
        debug!("traQ: ignoring {} event", event.kind);
        return None;
    }
    let created: MessageCreated = match serde_json::from_value(event.body) {
        Ok(created) => created,
        Err(e) => {
            warn!("traQ: malformed MESSAGE_CREATED payload: {e}");
            return None;
        }
    };
    let msg = created.message;
    if msg.user.bot || msg.channel_id != channel_id {
        return None;
    }
    let content = msg.plain_text.strip_prefix(prefix)?.to_string();
    Some(ChannelMessage {
        id: msg.id,
        channel_id: msg.channel_id,
        sender: msg.user.name,
        sender_id: msg.user.id,
        content,
        timestamp: created.event_time,
    })
}

fn ws_url(origin: &str) -> String {
    let origin = if let Some(rest) = origin.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = origin.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        origin.to_string()
    };
    format!("{origin}/api/v3/bots/ws")
}

// ---------------------------------------------------------------------------
// TraqChannel
// ---------------------------------------------------------------------------

pub struct TraqChannel {
    config: TraqChannelConfig,
    api: Arc<TraqApi>,
    stamps: Arc<StatusStamps>,
}

impl TraqChannel {
    /// Connects to the REST API once to resolve stamp names.
    pub async fn connect(config: TraqChannelConfig) -> anyhow::Result<Self> {
        let api = TraqApi::new(&config.origin, &config.token)?;
        let all = api.stamps().await.context("resolving stamp names")?;
        info!("traQ: resolved {} stamps", all.len());
        let stamps = StatusStamps::new(config.stamps.clone(), all);
        Ok(Self {
            config,
            api: Arc::new(api),
            stamps: Arc::new(stamps),
        })
    }
}

#[async_trait]
impl Channel for TraqChannel {
    fn name(&self) -> &str {
        "traq"
    }

    async fn listen(&self, tx: mpsc::Sender<ChannelMessage>) -> anyhow::Result<()> {
        let url = ws_url(&self.config.origin);
        let mut request = url.as_str().into_client_request()?;
        request.headers_mut().insert(
            "Authorization",
            HeaderValue::from_str(&format!("Bearer {}", self.config.token))?,
        );
        info!("traQ: connecting to {url}");
        let (ws_stream, _) = tokio_tungstenite::connect_async(request).await?;
        let (mut write, mut read) = ws_stream.split();
        info!("traQ: connected");

        while let Some(frame) = read.next().await {
            let text = match frame? {
                Message::Text(t) => t,
                Message::Ping(payload) => {
                    write.send(Message::Pong(payload)).await?;
                    continue;
                }
                Message::Close(_) => break,
                _ => continue,
            };
            let Some(msg) = parse_event(&text, &self.config.channel_id, &self.config.prefix)
            else {
                continue;
            };
            if tx.send(msg).await.is_err() {
                break;
            }
        }
        warn!("traQ: websocket closed");
        Ok(())
    }

    async fn health_check(&self) -> bool {
        self.api.me().await
    }

    fn replier(&self, msg: &ChannelMessage) -> Arc<dyn Replier> {
        Arc::new(TraqReplier {
            api: self.api.clone(),
            stamps: self.stamps.clone(),
            channel_id: msg.channel_id.clone(),
            message_id: msg.id.clone(),
            user_id: msg.sender_id.clone(),
        })
    }
}

struct TraqReplier {
    api: Arc<TraqApi>,
    stamps: Arc<StatusStamps>,
    channel_id: String,
    message_id: String,
    user_id: String,
}

#[async_trait]
impl Replier for TraqReplier {
    async fn reply(
        &self,
        cancel: &CancellationToken,
        status: Status,
        lines: &[String],
    ) -> ReplyResult {
        let stamp = self.stamps.id(status);
        if !stamp.is_empty() {
            self.api.add_stamp(cancel, &self.message_id, stamp).await?;
        }
        if !lines.is_empty() {
            self.api
                .post_message(cancel, &self.channel_id, &lines.join("\n"))
                .await?;
        }
        Ok(())
    }

    async fn reply_direct(&self, cancel: &CancellationToken, lines: &[String]) -> ReplyResult {
        self.api
            .post_direct_message(cancel, &self.user_id, &lines.join("\n"))
            .await?;
        Ok(())
    }

    fn message_limit(&self) -> usize {
        TRAQ_MESSAGE_LIMIT
    }

    fn status_name(&self, status: Status) -> String {
        self.stamps.display_name(status)
    }

    fn render_operator(&self, identity: &str) -> String {
        format!(":@{identity}:")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(user_bot: bool, channel: &str, text: &str) -> String {
        json!({
            "type": "MESSAGE_CREATED",
            "reqId": "r1",
            "body": {
                "eventTime": "2024-05-01T12:00:00Z",
                "message": {
                    "id": "m1",
                    "user": {"id": "u1", "name": "alice", "displayName": "Alice", "bot": user_bot},
                    "channelId": channel,
                    "text": text,
                    "plainText": text,
                    "embedded": [],
                    "createdAt": "2024-05-01T12:00:00Z",
                    "updatedAt": "2024-05-01T12:00:00Z"
                }
            }
        })
        .to_string()
    }

    #[test]
    fn accepts_prefixed_human_message_in_channel() {
        let msg = parse_event(&event(false, "c1", "/deploy web v2"), "c1", "/").unwrap();
        assert_eq!(msg.id, "m1");
        assert_eq!(msg.sender, "alice");
        assert_eq!(msg.sender_id, "u1");
        assert_eq!(msg.content, "deploy web v2");
        assert_eq!(msg.timestamp.timestamp(), 1714564800);
    }

    #[test]
    fn filters_bots_other_channels_and_unprefixed_text() {
        assert!(parse_event(&event(true, "c1", "/status"), "c1", "/").is_none());
        assert!(parse_event(&event(false, "c2", "/status"), "c1", "/").is_none());
        assert!(parse_event(&event(false, "c1", "status"), "c1", "/").is_none());
    }

    #[test]
    fn ignores_other_event_types_and_garbage() {
        let joined = json!({"type": "JOINED", "body": {"channelId": "c1"}}).to_string();
        assert!(parse_event(&joined, "c1", "/").is_none());
        assert!(parse_event("not json", "c1", "/").is_none());
        let broken = json!({"type": "MESSAGE_CREATED", "body": {}}).to_string();
        assert!(parse_event(&broken, "c1", "/").is_none());
    }

    #[test]
    fn websocket_url_follows_origin_scheme() {
        assert_eq!(ws_url("https://q.trap.jp"), "wss://q.trap.jp/api/v3/bots/ws");
        assert_eq!(ws_url("http://localhost:3000"), "ws://localhost:3000/api/v3/bots/ws");
    }

    #[test]
    fn stamp_names_resolve_by_id() {
        let ids = Stamps {
            success: "s-id".into(),
            failure: "f-id".into(),
            ..Default::default()
        };
        let stamps = StatusStamps::new(
            ids,
            vec![StampInfo {
                id: "s-id".into(),
                name: "done".into(),
            }],
        );
        assert_eq!(stamps.id(Status::Success), "s-id");
        assert_eq!(stamps.display_name(Status::Success), ":done:");
        assert_eq!(stamps.display_name(Status::Failure), "`f-id`");
    }
}
