use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::header::{self, HeaderName};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use cmdgate_core::{ExecLogs, LogAccessCache};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

/// Shared with the `exec-log` command: keys minted there resolve here.
#[derive(Clone)]
pub struct LogServerState {
    cache: Arc<LogAccessCache>,
    dir: PathBuf,
}

impl LogServerState {
    pub fn new(cache: Arc<LogAccessCache>, dir: impl Into<PathBuf>) -> Self {
        Self {
            cache,
            dir: dir.into(),
        }
    }

    pub fn from_logs(logs: &ExecLogs) -> Self {
        Self::new(logs.cache(), logs.dir())
    }
}

#[derive(Debug, Deserialize, Default)]
struct LogQuery {
    download: Option<String>,
}

impl LogQuery {
    fn wants_attachment(&self) -> bool {
        matches!(self.download.as_deref(), Some("true") | Some("1"))
    }
}

pub fn app_router(state: LogServerState) -> Router {
    Router::new()
        .route("/log/{key}", get(get_log))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the log endpoint on `addr` until `cancel` fires.
pub async fn serve(
    addr: SocketAddr,
    state: LogServerState,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("log endpoint listening on {}", listener.local_addr()?);
    axum::serve(listener, app_router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}

async fn get_log(
    State(state): State<LogServerState>,
    Path(key): Path<String>,
    Query(query): Query<LogQuery>,
) -> Response {
    let Some(file_name) = state.cache.get(&key) else {
        return not_found();
    };
    let body = match tokio::fs::read(state.dir.join(&file_name)).await {
        Ok(body) => body,
        Err(err) => {
            tracing::warn!("log {file_name} vanished before download: {err}");
            return not_found();
        }
    };
    let disposition = if query.wants_attachment() {
        format!("attachment; filename=\"{file_name}\"")
    } else {
        format!("inline; filename=\"{file_name}\"")
    };
    let headers: [(HeaderName, String); 2] = [
        (header::CONTENT_TYPE, "text/plain; charset=utf-8".to_string()),
        (header::CONTENT_DISPOSITION, disposition),
    ];
    (headers, body).into_response()
}

fn not_found() -> Response {
    (StatusCode::NOT_FOUND, "Not Found").into_response()
}
