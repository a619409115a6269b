//! Slack channel adapter (Socket Mode).
//!
//! Opens a Socket Mode WebSocket via `apps.connections.open`, acknowledges
//! every envelope, and turns channel messages and slash commands into
//! commands. Replies add a reaction to the triggering message and post the
//! text with a status-coloured attachment.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use cmdgate_core::config::{Stamps, StatusColors};
use cmdgate_core::{with_retry, ReplyResult, Replier, RetryError, RetryPolicy, Status};
use futures_util::{SinkExt, StreamExt};
use regex::Regex;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{color_for, is_trusted_workflow, marker_for, SlackChannelConfig};
use crate::traits::{Channel, ChannelMessage};

pub const SLACK_MESSAGE_LIMIT: usize = 2000;
const SLACK_API: &str = "https://slack.com/api";
const SLASH_PREFIX: &str = "/";

// ---------------------------------------------------------------------------
// Web API client
// ---------------------------------------------------------------------------

struct SlackApi {
    client: Client,
    oauth_token: String,
    app_token: String,
}

impl SlackApi {
    fn new(oauth_token: &str, app_token: &str) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .context("building Slack http client")?;
        Ok(Self {
            client,
            oauth_token: oauth_token.to_string(),
            app_token: app_token.to_string(),
        })
    }

    /// Call a Web API method. Slack reports failures as `ok: false` with a
    /// 200 status, so both are checked.
    async fn call(&self, method: &str, token: &str, body: &Value) -> anyhow::Result<Value> {
        let resp = self
            .client
            .post(format!("{SLACK_API}/{method}"))
            .bearer_auth(token)
            .json(body)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let err = resp.text().await.unwrap_or_default();
            anyhow::bail!("Slack {method} failed ({status}): {err}");
        }
        let value: Value = resp.json().await?;
        if !value["ok"].as_bool().unwrap_or(false) {
            let err = value["error"].as_str().unwrap_or("unknown_error");
            anyhow::bail!("Slack {method} failed: {err}");
        }
        Ok(value)
    }

    async fn open_connection(&self) -> anyhow::Result<String> {
        let resp = self
            .call("apps.connections.open", &self.app_token, &json!({}))
            .await?;
        resp["url"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("Slack apps.connections.open returned no url"))
    }

    /// Post a message and return its `ts`.
    async fn post_message(&self, body: &Value) -> anyhow::Result<String> {
        let resp = self.call("chat.postMessage", &self.oauth_token, body).await?;
        Ok(resp["ts"].as_str().unwrap_or_default().to_string())
    }

    async fn post_message_retrying(
        &self,
        cancel: &CancellationToken,
        body: Value,
    ) -> Result<String, RetryError> {
        let body = &body;
        with_retry(cancel, RetryPolicy::default(), || self.post_message(body)).await
    }

    async fn add_reaction(
        &self,
        cancel: &CancellationToken,
        channel: &str,
        timestamp: &str,
        name: &str,
    ) -> Result<(), RetryError> {
        let body = &json!({ "channel": channel, "timestamp": timestamp, "name": name });
        with_retry(cancel, RetryPolicy::default(), || async move {
            match self.call("reactions.add", &self.oauth_token, body).await {
                Err(e) if e.to_string().ends_with("already_reacted") => Ok(()),
                other => other.map(|_| ()),
            }
        })
        .await
    }

    async fn auth_test(&self) -> bool {
        self.call("auth.test", &self.oauth_token, &json!({}))
            .await
            .is_ok()
    }
}

/// `chat.postMessage` body: the first line as text, the rest in a coloured
/// attachment.
fn message_body(channel: &str, lines: &[String], color: &str) -> Value {
    let mut body = json!({
        "channel": channel,
        "text": lines.first().cloned().unwrap_or_default(),
    });
    if lines.len() >= 2 {
        body["attachments"] = json!([{
            "color": color,
            "fields": [{ "title": "", "value": lines[1..].join("\n"), "short": false }],
        }]);
    }
    body
}

// ---------------------------------------------------------------------------
// Inbound events
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    envelope_id: Option<String>,
    #[serde(default)]
    payload: Value,
}

#[derive(Debug, Deserialize)]
struct MessageEvent {
    #[serde(rename = "type")]
    kind: String,
    subtype: Option<String>,
    channel: Option<String>,
    user: Option<String>,
    bot_id: Option<String>,
    username: Option<String>,
    #[serde(default)]
    text: String,
    #[serde(default)]
    ts: String,
}

#[derive(Debug, Deserialize)]
struct SlashCommand {
    command: String,
    #[serde(default)]
    text: String,
    user_id: String,
    user_name: String,
    channel_id: String,
}

/// What one envelope asks the adapter to do.
#[derive(Debug)]
enum Inbound {
    Command(ChannelMessage),
    Slash(SlashCommand),
    Disconnect,
    Ignore,
}

fn mention_regex() -> &'static Regex {
    static MENTION: OnceLock<Regex> = OnceLock::new();
    MENTION.get_or_init(|| Regex::new(r"^<@(\w+)(?:\|\w+)?>").expect("valid mention regex"))
}

/// Decide who is running a message and what the command text is.
///
/// Humans run as themselves. Bots are ignored unless they are trusted
/// workflows; a trusted workflow runs as the user it mentions at the very
/// start of the text, or as itself when it mentions no one.
fn resolve_executor(
    user: Option<&str>,
    bot_id: Option<&str>,
    username: Option<&str>,
    text: &str,
    trusted: &[String],
) -> Option<(String, String)> {
    let Some(bot_id) = bot_id.filter(|b| !b.is_empty()) else {
        return user.map(|u| (u.to_string(), text.to_string()));
    };
    let mention = mention_regex().captures(text);
    if !is_trusted_workflow(bot_id, trusted) {
        if mention.is_some() {
            info!(
                bot_id,
                display_name = username.unwrap_or(""),
                "skipping impersonation request from untrusted bot"
            );
        }
        return None;
    }
    match mention {
        Some(caps) => {
            let whole = caps.get(0)?;
            let impersonated = caps.get(1)?.as_str().to_string();
            Some((impersonated, text[whole.end()..].trim().to_string()))
        }
        None => Some((bot_id.to_string(), text.to_string())),
    }
}

fn slack_ts_to_datetime(ts: &str) -> DateTime<Utc> {
    let secs = ts
        .split('.')
        .next()
        .and_then(|s| s.parse::<i64>().ok())
        .unwrap_or_default();
    Utc.timestamp_opt(secs, 0).single().unwrap_or_else(Utc::now)
}

fn parse_envelope(
    raw: &str,
    channel_id: &str,
    prefix: &str,
    trusted: &[String],
) -> (Option<String>, Inbound) {
    let envelope: Envelope = match serde_json::from_str(raw) {
        Ok(e) => e,
        Err(e) => {
            warn!("Slack: unparseable envelope: {e}");
            return (None, Inbound::Ignore);
        }
    };
    let id = envelope.envelope_id.clone();
    let inbound = match envelope.kind.as_str() {
        "hello" => {
            info!("Slack: connected with Socket Mode");
            Inbound::Ignore
        }
        "disconnect" => Inbound::Disconnect,
        "events_api" => parse_message_event(&envelope.payload, channel_id, prefix, trusted)
            .map(Inbound::Command)
            .unwrap_or(Inbound::Ignore),
        "slash_commands" => match serde_json::from_value::<SlashCommand>(envelope.payload) {
            Ok(cmd) if cmd.channel_id == channel_id => Inbound::Slash(cmd),
            Ok(_) => Inbound::Ignore,
            Err(e) => {
                warn!("Slack: malformed slash command: {e}");
                Inbound::Ignore
            }
        },
        other => {
            debug!("Slack: ignoring {other} envelope");
            Inbound::Ignore
        }
    };
    (id, inbound)
}

fn parse_message_event(
    payload: &Value,
    channel_id: &str,
    prefix: &str,
    trusted: &[String],
) -> Option<ChannelMessage> {
    let ev: MessageEvent = serde_json::from_value(payload.get("event")?.clone()).ok()?;
    if ev.kind != "message" {
        return None;
    }
    if ev.subtype.as_deref().is_some_and(|s| s != "bot_message") {
        return None;
    }
    let (sender, text) = resolve_executor(
        ev.user.as_deref(),
        ev.bot_id.as_deref(),
        ev.username.as_deref(),
        &ev.text,
        trusted,
    )?;
    if ev.channel.as_deref() != Some(channel_id) {
        return None;
    }
    let content = text.strip_prefix(prefix)?.to_string();
    Some(ChannelMessage {
        id: ev.ts.clone(),
        channel_id: channel_id.to_string(),
        sender_id: sender.clone(),
        sender,
        content,
        timestamp: slack_ts_to_datetime(&ev.ts),
    })
}

fn slash_announcement(cmd: &SlashCommand) -> (String, String) {
    let command_text = format!("{} {}", cmd.command, cmd.text);
    let announcement = format!(
        "{} (<@{}|{}>) used slash command: {}",
        cmd.user_name, cmd.user_id, cmd.user_name, command_text
    );
    let content = command_text
        .strip_prefix(SLASH_PREFIX)
        .unwrap_or(&command_text)
        .trim()
        .to_string();
    (announcement, content)
}

// ---------------------------------------------------------------------------
// SlackChannel
// ---------------------------------------------------------------------------

pub struct SlackChannel {
    config: SlackChannelConfig,
    api: Arc<SlackApi>,
    colors: Arc<StatusColors>,
    stamps: Arc<Stamps>,
}

impl SlackChannel {
    pub fn new(config: SlackChannelConfig) -> anyhow::Result<Self> {
        let api = SlackApi::new(&config.oauth_token, &config.app_token)?;
        Ok(Self {
            colors: Arc::new(config.colors.clone()),
            stamps: Arc::new(config.stamps.clone()),
            api: Arc::new(api),
            config,
        })
    }

    /// Post the public announcement for a slash command; it becomes the
    /// message that receives status reactions.
    async fn announce_slash(&self, cmd: SlashCommand) -> anyhow::Result<ChannelMessage> {
        let (announcement, content) = slash_announcement(&cmd);
        let ts = self
            .api
            .post_message(&json!({ "channel": cmd.channel_id, "text": announcement }))
            .await
            .context("posting slash command announcement")?;
        Ok(ChannelMessage {
            timestamp: slack_ts_to_datetime(&ts),
            id: ts,
            channel_id: cmd.channel_id,
            sender: cmd.user_id.clone(),
            sender_id: cmd.user_id,
            content,
        })
    }
}

#[async_trait]
impl Channel for SlackChannel {
    fn name(&self) -> &str {
        "slack"
    }

    async fn listen(&self, tx: mpsc::Sender<ChannelMessage>) -> anyhow::Result<()> {
        let url = self.api.open_connection().await?;
        info!("Slack: connecting to Socket Mode");
        let (ws_stream, _) = tokio_tungstenite::connect_async(url.as_str()).await?;
        let (mut write, mut read) = ws_stream.split();

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

            let (envelope_id, inbound) = parse_envelope(
                &text,
                &self.config.channel_id,
                &self.config.prefix,
                &self.config.trusted_workflows,
            );
            if let Some(id) = envelope_id {
                let ack = match inbound {
                    Inbound::Slash(_) => json!({
                        "envelope_id": id,
                        "payload": { "response_type": "in_channel" },
                    }),
                    _ => json!({ "envelope_id": id }),
                };
                write.send(Message::Text(ack.to_string())).await?;
            }

            let msg = match inbound {
                Inbound::Command(msg) => msg,
                Inbound::Slash(cmd) => match self.announce_slash(cmd).await {
                    Ok(msg) => msg,
                    Err(e) => {
                        warn!("Slack: {e:#}");
                        continue;
                    }
                },
                Inbound::Disconnect => {
                    info!("Slack: server requested reconnect");
                    break;
                }
                Inbound::Ignore => continue,
            };
            if tx.send(msg).await.is_err() {
                break;
            }
        }
        Ok(())
    }

    async fn health_check(&self) -> bool {
        self.api.auth_test().await
    }

    fn replier(&self, msg: &ChannelMessage) -> Arc<dyn Replier> {
        Arc::new(SlackReplier {
            api: self.api.clone(),
            stamps: self.stamps.clone(),
            colors: self.colors.clone(),
            channel_id: msg.channel_id.clone(),
            ts: msg.id.clone(),
            user_id: msg.sender_id.clone(),
        })
    }
}

struct SlackReplier {
    api: Arc<SlackApi>,
    stamps: Arc<Stamps>,
    colors: Arc<StatusColors>,
    channel_id: String,
    ts: String,
    user_id: String,
}

#[async_trait]
impl Replier for SlackReplier {
    async fn reply(
        &self,
        cancel: &CancellationToken,
        status: Status,
        lines: &[String],
    ) -> ReplyResult {
        let reaction = marker_for(&self.stamps, status);
        if !reaction.is_empty() {
            self.api
                .add_reaction(cancel, &self.channel_id, &self.ts, reaction)
                .await?;
        }
        if !lines.is_empty() {
            let body = message_body(&self.channel_id, lines, color_for(&self.colors, status));
            self.api.post_message_retrying(cancel, body).await?;
        }
        Ok(())
    }

    async fn reply_direct(&self, cancel: &CancellationToken, lines: &[String]) -> ReplyResult {
        let body = json!({ "channel": self.user_id, "text": lines.join("\n") });
        self.api.post_message_retrying(cancel, body).await?;
        Ok(())
    }

    fn message_limit(&self) -> usize {
        SLACK_MESSAGE_LIMIT
    }

    fn status_name(&self, status: Status) -> String {
        format!(":{}:", marker_for(&self.stamps, status))
    }

    fn render_operator(&self, identity: &str) -> String {
        format!("<@{identity}>")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trusted() -> Vec<String> {
        vec!["BWORK".to_string()]
    }

    fn events_api(event: Value) -> String {
        json!({
            "type": "events_api",
            "envelope_id": "env-1",
            "payload": { "event": event },
        })
        .to_string()
    }

    #[test]
    fn humans_run_as_themselves() {
        let resolved = resolve_executor(Some("U1"), None, None, "/status", &trusted());
        assert_eq!(resolved, Some(("U1".to_string(), "/status".to_string())));
    }

    #[test]
    fn trusted_workflow_impersonates_mentioned_user() {
        let resolved = resolve_executor(
            None,
            Some("BWORK"),
            Some("Deploy workflow"),
            "<@U42|alice> /deploy web",
            &trusted(),
        );
        assert_eq!(resolved, Some(("U42".to_string(), "/deploy web".to_string())));
    }

    #[test]
    fn trusted_workflow_without_mention_runs_as_itself() {
        let resolved = resolve_executor(None, Some("BWORK"), None, "/status", &trusted());
        assert_eq!(resolved, Some(("BWORK".to_string(), "/status".to_string())));
    }

    #[test]
    fn untrusted_bots_are_ignored() {
        assert!(resolve_executor(None, Some("BEVIL"), None, "<@U42> /deploy", &trusted()).is_none());
        assert!(resolve_executor(None, Some("BEVIL"), None, "/status", &trusted()).is_none());
    }

    #[test]
    fn mention_must_lead_the_text() {
        let resolved = resolve_executor(None, Some("BWORK"), None, "/status <@U42>", &trusted());
        assert_eq!(resolved, Some(("BWORK".to_string(), "/status <@U42>".to_string())));
    }

    #[test]
    fn message_events_become_commands() {
        let raw = events_api(json!({
            "type": "message",
            "channel": "C1",
            "user": "U1",
            "text": "/deploy web v2",
            "ts": "1714564800.000100",
        }));
        let (id, inbound) = parse_envelope(&raw, "C1", "/", &trusted());
        assert_eq!(id.as_deref(), Some("env-1"));
        match inbound {
            Inbound::Command(msg) => {
                assert_eq!(msg.id, "1714564800.000100");
                assert_eq!(msg.sender, "U1");
                assert_eq!(msg.content, "deploy web v2");
                assert_eq!(msg.timestamp.timestamp(), 1714564800);
            }
            other => panic!("unexpected inbound: {other:?}"),
        }
    }

    #[test]
    fn message_events_are_filtered() {
        let other_channel = events_api(json!({
            "type": "message", "channel": "C2", "user": "U1", "text": "/status", "ts": "1.0",
        }));
        assert!(matches!(parse_envelope(&other_channel, "C1", "/", &[]).1, Inbound::Ignore));

        let edited = events_api(json!({
            "type": "message", "subtype": "message_changed", "channel": "C1", "ts": "1.0",
        }));
        assert!(matches!(parse_envelope(&edited, "C1", "/", &[]).1, Inbound::Ignore));

        let chatter = events_api(json!({
            "type": "message", "channel": "C1", "user": "U1", "text": "hello", "ts": "1.0",
        }));
        assert!(matches!(parse_envelope(&chatter, "C1", "/", &[]).1, Inbound::Ignore));
    }

    #[test]
    fn slash_commands_are_announced() {
        let raw = json!({
            "type": "slash_commands",
            "envelope_id": "env-2",
            "payload": {
                "command": "/deploy",
                "text": "web v2",
                "user_id": "U1",
                "user_name": "alice",
                "channel_id": "C1",
            },
        })
        .to_string();
        let (id, inbound) = parse_envelope(&raw, "C1", "!", &[]);
        assert_eq!(id.as_deref(), Some("env-2"));
        let Inbound::Slash(cmd) = inbound else {
            panic!("expected slash command");
        };
        let (announcement, content) = slash_announcement(&cmd);
        assert_eq!(
            announcement,
            "alice (<@U1|alice>) used slash command: /deploy web v2"
        );
        assert_eq!(content, "deploy web v2");
    }

    #[test]
    fn hello_and_disconnect() {
        let (id, inbound) = parse_envelope(r#"{"type":"hello"}"#, "C1", "/", &[]);
        assert!(id.is_none());
        assert!(matches!(inbound, Inbound::Ignore));
        let raw = r#"{"type":"disconnect","reason":"refresh_requested"}"#;
        let (_, inbound) = parse_envelope(raw, "C1", "/", &[]);
        assert!(matches!(inbound, Inbound::Disconnect));
    }

    #[test]
    fn reply_body_splits_first_line() {
        let lines: Vec<String> = ["exec failed: exit status: 1", "```", "boom", "```"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let body = message_body("C1", &lines, "#a30200");
        assert_eq!(body["text"], "exec failed: exit status: 1");
        assert_eq!(body["attachments"][0]["color"], "#a30200");
        assert_eq!(body["attachments"][0]["fields"][0]["value"], "```\nboom\n```");

        let single = message_body("C1", &["ok".to_string()], "#2eb886");
        assert!(single.get("attachments").is_none());
    }
}
