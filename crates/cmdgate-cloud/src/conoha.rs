use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Context};
use cmdgate_core::config::ConohaConfig;
use cmdgate_core::{with_retry, RetryPolicy};
use futures_util::future::try_join_all;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebootType {
    Soft,
    Hard,
}

impl RebootType {
    pub fn as_str(self) -> &'static str {
        match self {
            RebootType::Soft => "SOFT",
            RebootType::Hard => "HARD",
        }
    }
}

impl fmt::Display for RebootType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
#[error("unknown restart type: {0} (expected SOFT or HARD)")]
pub struct UnknownRebootType(pub String);

impl FromStr for RebootType {
    type Err = UnknownRebootType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SOFT" => Ok(RebootType::Soft),
            "HARD" => Ok(RebootType::Hard),
            other => Err(UnknownRebootType(other.to_string())),
        }
    }
}

/// One compute server and the hypervisor host it runs on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerHost {
    pub id: String,
    pub host: String,
    /// `instance_name_tag` metadata, the name shown in the control panel.
    pub name: String,
}

#[derive(Deserialize)]
struct TokenResponse {
    access: TokenAccess,
}

#[derive(Deserialize)]
struct TokenAccess {
    token: TokenId,
}

#[derive(Deserialize)]
struct TokenId {
    id: String,
}

#[derive(Deserialize)]
struct ServersResponse {
    servers: Vec<ServerRef>,
}

#[derive(Deserialize)]
struct ServerRef {
    id: String,
}

#[derive(Deserialize)]
struct ServerResponse {
    server: ServerDetail,
}

#[derive(Deserialize)]
struct ServerDetail {
    id: String,
    #[serde(rename = "OS-EXT-SRV-ATTR:host", default)]
    host: String,
    #[serde(default)]
    metadata: ServerMetadata,
}

#[derive(Deserialize, Default)]
struct ServerMetadata {
    #[serde(default)]
    instance_name_tag: String,
}

impl From<ServerDetail> for ServerHost {
    fn from(detail: ServerDetail) -> Self {
        Self {
            id: detail.id,
            host: detail.host,
            name: detail.metadata.instance_name_tag,
        }
    }
}

fn token_request(username: &str, password: &str, tenant_id: &str) -> Value {
    json!({
        "auth": {
            "passwordCredentials": {
                "username": username,
                "password": password,
            },
            "tenantId": tenant_id,
        }
    })
}

fn reboot_request(kind: RebootType) -> Value {
    json!({ "reboot": { "type": kind.as_str() } })
}

fn join_url(origin: &str, path: &str) -> String {
    format!("{}/{}", origin.trim_end_matches('/'), path.trim_start_matches('/'))
}

/// Thin client over the identity and compute endpoints.
///
/// Read-only calls go through [`with_retry`]; `reboot` is sent once.
pub struct ConohaClient {
    http: Client,
    identity_origin: String,
    compute_origin: String,
    username: String,
    password: String,
    tenant_id: String,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

impl ConohaClient {
    pub fn new(config: &ConohaConfig) -> anyhow::Result<Self> {
        if config.username.trim().is_empty() || config.password.trim().is_empty() {
            bail!("servers.conoha.username and servers.conoha.password (or CMDGATE_CONOHA_PASSWORD) are required");
        }
        if config.tenant_id.trim().is_empty() {
            bail!("servers.conoha.tenantID is required");
        }
        Ok(Self {
            http: Client::new(),
            identity_origin: config.identity_origin.clone(),
            compute_origin: config.compute_origin.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
            tenant_id: config.tenant_id.clone(),
            retry: RetryPolicy::default(),
            cancel: CancellationToken::new(),
        })
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Issue an API token with the configured password credentials.
    pub async fn token(&self) -> anyhow::Result<String> {
        let url = join_url(&self.identity_origin, "v2.0/tokens");
        let body = token_request(&self.username, &self.password, &self.tenant_id);
        let body = &body;
        let url = url.as_str();
        let resp: TokenResponse = with_retry(&self.cancel, self.retry, || async move {
            let resp = self
                .http
                .post(url)
                .header("Accept", "application/json")
                .json(body)
                .send()
                .await?;
            expect_status(resp, StatusCode::OK)
                .await?
                .json::<TokenResponse>()
                .await
                .context("decoding token response")
        })
        .await
        .context("failed to get conoha api token")?;
        Ok(resp.access.token.id)
    }

    /// Request a reboot of `server_id`. The API answers 202 once accepted.
    pub async fn reboot(&self, server_id: &str, kind: RebootType) -> anyhow::Result<()> {
        let token = self.token().await?;
        let url = join_url(
            &self.compute_origin,
            &format!("v2/{}/servers/{server_id}/action", self.tenant_id),
        );
        let resp = self
            .http
            .post(&url)
            .header("Accept", "application/json")
            .header("X-Auth-Token", token)
            .json(&reboot_request(kind))
            .send()
            .await
            .context("failed to post restart request")?;
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        info!(url = %url, restart_type = %kind, status = %status, body = %text, "restart requested");
        if status != StatusCode::ACCEPTED {
            bail!("incorrect status code: {status} (expected: 202)");
        }
        Ok(())
    }

    /// Every server in the tenant with its host, sorted by name.
    pub async fn hosts(&self) -> anyhow::Result<Vec<ServerHost>> {
        let token = self.token().await?;
        let list: ServersResponse = self
            .get_json(&token, &format!("v2/{}/servers", self.tenant_id))
            .await
            .context("listing servers")?;
        let details = list.servers.iter().map(|server| {
            let path = format!("v2/{}/servers/{}", self.tenant_id, server.id);
            let token = token.as_str();
            async move {
                self.get_json::<ServerResponse>(token, &path)
                    .await
                    .with_context(|| format!("fetching server {}", server.id))
            }
        });
        let mut hosts: Vec<ServerHost> = try_join_all(details)
            .await?
            .into_iter()
            .map(|resp| resp.server.into())
            .collect();
        hosts.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(hosts)
    }

    async fn get_json<T: DeserializeOwned>(&self, token: &str, path: &str) -> anyhow::Result<T> {
        let url = join_url(&self.compute_origin, path);
        let url = url.as_str();
        let value = with_retry(&self.cancel, self.retry, || async move {
            let resp = self
                .http
                .get(url)
                .header("Accept", "application/json")
                .header("X-Auth-Token", token)
                .send()
                .await?;
            expect_status(resp, StatusCode::OK)
                .await?
                .json::<T>()
                .await
                .context("decoding response body")
        })
        .await?;
        Ok(value)
    }
}

async fn expect_status(
    resp: reqwest::Response,
    expected: StatusCode,
) -> anyhow::Result<reqwest::Response> {
    let status = resp.status();
    if status != expected {
        let text = resp.text().await.unwrap_or_default();
        bail!("invalid status code: {status} (expected: {expected}): {text}");
    }
    Ok(resp)
}
