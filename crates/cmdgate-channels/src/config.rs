//! Adapter configuration, validated out of the gateway config file.
//!
//! `ChannelConfig::from_gateway()` picks the adapter named by `mode` and
//! returns `Err` when its credentials or channel are missing.

use anyhow::bail;
use cmdgate_core::config::{SlackConfig, Stamps, StatusColors, TraqConfig};
use cmdgate_core::{BotMode, GatewayConfig, Status};

#[derive(Debug, Clone)]
pub enum ChannelConfig {
    Traq(TraqChannelConfig),
    Slack(SlackChannelConfig),
}

#[derive(Debug, Clone)]
pub struct TraqChannelConfig {
    pub origin: String,
    pub token: String,
    pub channel_id: String,
    pub prefix: String,
    /// Stamp ids per status.
    pub stamps: Stamps,
}

#[derive(Debug, Clone)]
pub struct SlackChannelConfig {
    pub oauth_token: String,
    pub app_token: String,
    pub channel_id: String,
    pub prefix: String,
    /// Bot ids allowed to run commands, optionally on behalf of a mentioned user.
    pub trusted_workflows: Vec<String>,
    /// Reaction names per status.
    pub stamps: Stamps,
    pub colors: StatusColors,
}

/// Returns `true` if `bot_id` belongs to a trusted workflow.
pub fn is_trusted_workflow(bot_id: &str, trusted: &[String]) -> bool {
    trusted.iter().any(|t| t == bot_id)
}

/// Stamp id (traQ) or reaction name (Slack) marking `status`.
pub fn marker_for(stamps: &Stamps, status: Status) -> &str {
    match status {
        Status::Bad => &stamps.bad_command,
        Status::Forbidden => &stamps.forbid,
        Status::Success => &stamps.success,
        Status::Failure => &stamps.failure,
        Status::Running => &stamps.running,
    }
}

pub fn color_for(colors: &StatusColors, status: Status) -> &str {
    match status {
        Status::Bad => &colors.bad_command,
        Status::Forbidden => &colors.forbid,
        Status::Success => &colors.success,
        Status::Failure => &colors.failure,
        Status::Running => &colors.running,
    }
}

impl ChannelConfig {
    pub fn from_gateway(config: &GatewayConfig) -> anyhow::Result<Self> {
        match config.mode {
            BotMode::Traq => Self::traq(&config.traq, config).map(ChannelConfig::Traq),
            BotMode::Slack => Self::slack(&config.slack, config).map(ChannelConfig::Slack),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ChannelConfig::Traq(_) => BotMode::Traq.as_str(),
            ChannelConfig::Slack(_) => BotMode::Slack.as_str(),
        }
    }

    fn traq(traq: &TraqConfig, config: &GatewayConfig) -> anyhow::Result<TraqChannelConfig> {
        if traq.token.trim().is_empty() {
            bail!("traq mode needs traq.token (or CMDGATE_TRAQ_TOKEN)");
        }
        if traq.channel_id.trim().is_empty() {
            bail!("traq mode needs traq.channelID");
        }
        Ok(TraqChannelConfig {
            origin: traq.origin.trim_end_matches('/').to_string(),
            token: traq.token.clone(),
            channel_id: traq.channel_id.clone(),
            prefix: config.prefix.clone(),
            stamps: config.stamps.clone(),
        })
    }

    fn slack(slack: &SlackConfig, config: &GatewayConfig) -> anyhow::Result<SlackChannelConfig> {
        if slack.oauth_token.trim().is_empty() || slack.app_token.trim().is_empty() {
            bail!(
                "slack mode needs slack.oauthToken and slack.appToken \
                (or CMDGATE_SLACK_OAUTH_TOKEN, CMDGATE_SLACK_APP_TOKEN)"
            );
        }
        if slack.channel_id.trim().is_empty() {
            bail!("slack mode needs slack.channelID");
        }
        Ok(SlackChannelConfig {
            oauth_token: slack.oauth_token.clone(),
            app_token: slack.app_token.clone(),
            channel_id: slack.channel_id.clone(),
            prefix: config.prefix.clone(),
            trusted_workflows: slack.trusted_workflows.clone(),
            stamps: config.stamps.clone(),
            colors: slack.colors.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gateway(mode: BotMode) -> GatewayConfig {
        let mut config = GatewayConfig {
            mode,
            ..Default::default()
        };
        config.traq.token = "t".into();
        config.traq.channel_id = "c".into();
        config.traq.origin = "https://q.example.com/".into();
        config.slack.oauth_token = "xoxb".into();
        config.slack.app_token = "xapp".into();
        config.slack.channel_id = "C1".into();
        config
    }

    #[test]
    fn traq_mode_selects_traq_adapter() {
        let config = ChannelConfig::from_gateway(&gateway(BotMode::Traq)).unwrap();
        match config {
            ChannelConfig::Traq(traq) => {
                assert_eq!(traq.origin, "https://q.example.com");
                assert_eq!(traq.prefix, "/");
            }
            other => panic!("unexpected adapter {}", other.name()),
        }
    }

    #[test]
    fn missing_credentials_are_rejected() {
        let mut config = gateway(BotMode::Slack);
        config.slack.app_token.clear();
        let err = ChannelConfig::from_gateway(&config).unwrap_err();
        assert!(err.to_string().contains("slack.appToken"));

        let mut config = gateway(BotMode::Traq);
        config.traq.channel_id = "  ".into();
        assert!(ChannelConfig::from_gateway(&config).is_err());
    }

    #[test]
    fn trusted_workflow_lookup() {
        let trusted = vec!["B01".to_string(), "B02".to_string()];
        assert!(is_trusted_workflow("B02", &trusted));
        assert!(!is_trusted_workflow("B03", &trusted));
        assert!(!is_trusted_workflow("B01", &[]));
    }

    #[test]
    fn markers_follow_status() {
        let stamps = Stamps {
            bad_command: "bad".into(),
            forbid: "no_entry".into(),
            success: "ok".into(),
            failure: "ng".into(),
            running: "loading".into(),
        };
        assert_eq!(marker_for(&stamps, Status::Forbidden), "no_entry");
        assert_eq!(marker_for(&stamps, Status::Running), "loading");
        let colors = StatusColors::default();
        assert_eq!(color_for(&colors, Status::Success), "#2eb886");
    }
}
