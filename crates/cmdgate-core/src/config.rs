//! Configuration file schema.
//!
//! The file is YAML with camelCase keys. Secrets can be supplied through
//! `CMDGATE_*` environment variables, which take priority over the file.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;

pub const DEFAULT_CONFIG_PATH: &str = "./config.yaml";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BotMode {
    #[default]
    Traq,
    Slack,
}

impl BotMode {
    pub fn as_str(self) -> &'static str {
        match self {
            BotMode::Traq => "traq",
            BotMode::Slack => "slack",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GatewayConfig {
    pub mode: BotMode,
    /// Command prefix, e.g. `/`.
    pub prefix: String,
    pub stamps: Stamps,
    /// Directory in which inline template bodies are materialized.
    pub tmp_dir: PathBuf,
    /// Working directory for spawned templates. Defaults to the process cwd.
    pub work_dir: Option<PathBuf>,
    /// Reject (instead of warn about) sub-commands that declare operators
    /// their parent does not allow.
    pub strict_operators: bool,
    pub templates: Vec<TemplateConfig>,
    pub commands: Vec<CommandConfig>,
    pub traq: TraqConfig,
    pub slack: SlackConfig,
    pub logs: Option<LogsConfig>,
    pub servers: ServersConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            mode: BotMode::default(),
            prefix: "/".to_string(),
            stamps: Stamps::default(),
            tmp_dir: std::env::temp_dir(),
            work_dir: None,
            strict_operators: false,
            templates: Vec::new(),
            commands: Vec::new(),
            traq: TraqConfig::default(),
            slack: SlackConfig::default(),
            logs: None,
            servers: ServersConfig::default(),
        }
    }
}

/// Stamp (traQ) or reaction (Slack) identifiers used as status markers.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Stamps {
    pub bad_command: String,
    pub forbid: String,
    pub success: String,
    pub failure: String,
    pub running: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TemplateConfig {
    /// Referenced by `templateRef` of each command.
    pub name: String,
    /// Inline executable body, usually a shell script. Exclusive with `exec_file`.
    pub command: Option<String>,
    /// Path of an existing executable. Exclusive with `command`.
    pub exec_file: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CommandConfig {
    pub name: String,
    pub template_ref: Option<String>,
    /// One line describing what the command does.
    pub description: String,
    /// Pass extra user arguments through to the template.
    pub allow_args: bool,
    /// Argument syntax shown by `help`.
    pub args_syntax: String,
    /// Always passed before any user-supplied arguments.
    pub args_prefix: Vec<String>,
    /// Identities allowed to run this command and its sub-commands.
    /// Empty means everyone, unless inherited from a parent.
    pub operators: Vec<String>,
    /// Permit overlapping runs of the same command.
    pub allow_concurrency: bool,
    pub sub_commands: Vec<CommandConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TraqConfig {
    /// HTTP(S) origin of the traQ instance, e.g. `https://q.trap.jp`.
    pub origin: String,
    #[serde(rename = "channelID")]
    pub channel_id: String,
    pub token: String,
}

impl Default for TraqConfig {
    fn default() -> Self {
        Self {
            origin: "https://q.trap.jp".to_string(),
            channel_id: String::new(),
            token: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SlackConfig {
    pub oauth_token: String,
    pub app_token: String,
    #[serde(rename = "channelID")]
    pub channel_id: String,
    /// Bot IDs of workflows allowed to impersonate the user they mention
    /// at the start of the message.
    pub trusted_workflows: Vec<String>,
    pub colors: StatusColors,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StatusColors {
    pub bad_command: String,
    pub forbid: String,
    pub success: String,
    pub failure: String,
    pub running: String,
}

impl Default for StatusColors {
    fn default() -> Self {
        Self {
            bad_command: "#daa038".to_string(),
            forbid: "#a30200".to_string(),
            success: "#2eb886".to_string(),
            failure: "#a30200".to_string(),
            running: "#439fe0".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LogsConfig {
    /// Directory holding per-execution output logs.
    pub dir: PathBuf,
    /// Externally reachable origin used to build one-time log URLs.
    pub public_origin: String,
    /// Listen address of the log retrieval endpoint.
    pub listen: String,
}

impl Default for LogsConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./logs"),
            public_origin: "http://localhost:8080".to_string(),
            listen: "0.0.0.0:8080".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServersConfig {
    pub conoha: ConohaConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConohaConfig {
    pub identity_origin: String,
    pub compute_origin: String,
    pub username: String,
    pub password: String,
    #[serde(rename = "tenantID")]
    pub tenant_id: String,
}

impl Default for ConohaConfig {
    fn default() -> Self {
        Self {
            identity_origin: "https://identity.tyo1.conoha.io/".to_string(),
            compute_origin: "https://compute.tyo1.conoha.io/".to_string(),
            username: String::new(),
            password: String::new(),
            tenant_id: String::new(),
        }
    }
}

impl GatewayConfig {
    /// Read the YAML file at `path` and apply environment overrides.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let mut config = Self::from_yaml(&raw)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn from_yaml(raw: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(raw)?)
    }

    fn apply_env_overrides(&mut self) {
        override_from_env(&mut self.traq.token, "CMDGATE_TRAQ_TOKEN");
        override_from_env(&mut self.slack.oauth_token, "CMDGATE_SLACK_OAUTH_TOKEN");
        override_from_env(&mut self.slack.app_token, "CMDGATE_SLACK_APP_TOKEN");
        override_from_env(&mut self.servers.conoha.password, "CMDGATE_CONOHA_PASSWORD");
        override_from_env(&mut self.prefix, "CMDGATE_PREFIX");
        if let Ok(mode) = std::env::var("CMDGATE_MODE") {
            match mode.trim().to_lowercase().as_str() {
                "traq" => self.mode = BotMode::Traq,
                "slack" => self.mode = BotMode::Slack,
                other => tracing::warn!("ignoring unknown CMDGATE_MODE `{other}`"),
            }
        }
    }
}

fn override_from_env(target: &mut String, key: &str) {
    if let Ok(value) = std::env::var(key) {
        if !value.trim().is_empty() {
            *target = value;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
mode: slack
prefix: "!"
stamps:
  badCommand: bad
  success: ok
templates:
  - name: ping
    command: echo pong
  - name: deploy
    execFile: /usr/local/bin/deploy
commands:
  - name: status
    templateRef: ping
  - name: deploy
    operators: [alice]
    subCommands:
      - name: web
        templateRef: deploy
        allowArgs: true
        argsPrefix: [web]
slack:
  channelID: C123
  trustedWorkflows: [B1]
servers:
  conoha:
    tenantID: t-1
"#;

    #[test]
    fn parses_camel_case_keys() {
        let config = GatewayConfig::from_yaml(SAMPLE).expect("config");
        assert_eq!(config.mode, BotMode::Slack);
        assert_eq!(config.prefix, "!");
        assert_eq!(config.stamps.bad_command, "bad");
        assert_eq!(config.templates.len(), 2);
        assert_eq!(
            config.templates[1].exec_file.as_deref(),
            Some("/usr/local/bin/deploy")
        );
        let deploy = &config.commands[1];
        assert_eq!(deploy.operators, vec!["alice"]);
        assert!(deploy.sub_commands[0].allow_args);
        assert_eq!(deploy.sub_commands[0].args_prefix, vec!["web"]);
        assert_eq!(config.slack.channel_id, "C123");
        assert_eq!(config.slack.trusted_workflows, vec!["B1"]);
        assert_eq!(config.servers.conoha.tenant_id, "t-1");
    }

    #[test]
    fn missing_sections_fall_back_to_defaults() {
        let config = GatewayConfig::from_yaml("commands: []").expect("config");
        assert_eq!(config.mode, BotMode::Traq);
        assert_eq!(config.prefix, "/");
        assert_eq!(config.traq.origin, "https://q.trap.jp");
        assert!(config.logs.is_none());
        assert!(!config.strict_operators);
        assert_eq!(config.slack.colors.success, "#2eb886");
    }

    #[test]
    fn load_reports_missing_file() {
        let err = GatewayConfig::load("/definitely/not/here.yaml").unwrap_err();
        assert!(err.to_string().contains("reading config file"));
    }
}
