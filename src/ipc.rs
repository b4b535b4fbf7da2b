//! Local HTTP status channel for the UI collaborator
//!
//! - `GET  /status`            current [`CheckStatus`] (pull)
//! - `GET  /status/events`     every change as Server-Sent Events (push)
//! - `GET  /companion`         lifecycle state of the companion process
//! - `GET  /updates/check`     installed and available artifact versions
//! - `POST /updates/apply`     stop, update and restart the companion
//! - `POST /companion/restart` restart the companion

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::{Stream, StreamExt};
use log::{error, info};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::WatchStream;
use tower_http::cors::{Any, CorsLayer};

use crate::artifact::ProgressSink;
use crate::error::SupervisorError;
use crate::status::{CheckStatus, StatusBroadcaster, WatchBroadcaster};
use crate::supervisor::{CompanionState, ProcessSupervisor};

/// Shared by every handler; the supervisor is attached once the environment is ready
#[derive(Clone)]
pub struct ChannelState {
    status: Arc<WatchBroadcaster>,
    supervisor: Arc<OnceLock<Arc<ProcessSupervisor>>>,
}

impl ChannelState {
    pub fn new(status: Arc<WatchBroadcaster>) -> Self {
        Self {
            status,
            supervisor: Arc::new(OnceLock::new()),
        }
    }

    pub fn attach_supervisor(&self, supervisor: Arc<ProcessSupervisor>) {
        if self.supervisor.set(supervisor).is_err() {
            error!("Status channel already has a supervisor attached");
        }
    }

    fn supervisor(&self) -> Result<&Arc<ProcessSupervisor>, ApiError> {
        self.supervisor.get().ok_or(ApiError::NotReady)
    }
}

enum ApiError {
    NotReady,
    Failed(SupervisorError),
}

impl From<SupervisorError> for ApiError {
    fn from(e: SupervisorError) -> Self {
        ApiError::Failed(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotReady => (
                StatusCode::SERVICE_UNAVAILABLE,
                "environment check has not completed".to_string(),
            ),
            ApiError::Failed(e) => {
                error!("Status channel request failed: {e}");
                (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct UpdateCheck {
    current_version: Option<String>,
    available_version: Option<String>,
    update_available: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct UpdateResult {
    updated: bool,
    version: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CompanionInfo {
    state: CompanionState,
    pid: Option<u32>,
    exit_code: Option<i32>,
}

pub fn router(state: ChannelState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any);
    Router::new()
        .route("/status", get(current_status))
        .route("/status/events", get(status_events))
        .route("/companion", get(companion_info))
        .route("/companion/restart", post(restart_companion))
        .route("/updates/check", get(check_updates))
        .route("/updates/apply", post(apply_update))
        .layer(cors)
        .with_state(state)
}

/// Bind and serve in the background; returns the bound address
pub async fn serve(bind: &str, state: ChannelState) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
    let listener = TcpListener::bind(bind).await?;
    let addr = listener.local_addr()?;
    info!("Status channel listening on http://{addr}");
    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router(state)).await {
            error!("Status channel server stopped: {e}");
        }
    });
    Ok((addr, handle))
}

async fn current_status(State(state): State<ChannelState>) -> Json<CheckStatus> {
    Json(state.status.current())
}

async fn status_events(
    State(state): State<ChannelState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = WatchStream::new(state.status.subscribe()).map(|status| {
        let event = Event::default()
            .event("status")
            .json_data(&status)
            .unwrap_or_else(|e| Event::default().event("error").data(e.to_string()));
        Ok(event)
    });
    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}

async fn companion_info(State(state): State<ChannelState>) -> Result<Json<CompanionInfo>, ApiError> {
    let supervisor = state.supervisor()?;
    Ok(Json(CompanionInfo {
        state: supervisor.state(),
        pid: supervisor.pid().await,
        exit_code: supervisor.exit_code().await,
    }))
}

async fn restart_companion(State(state): State<ChannelState>) -> Result<StatusCode, ApiError> {
    state.supervisor()?.restart().await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn check_updates(State(state): State<ChannelState>) -> Result<Json<UpdateCheck>, ApiError> {
    let resolver = state.supervisor()?.updater().resolver();
    let current_version = resolver.current_version().await;
    let available_version = resolver.available_version().await.map(|info| info.version);
    let update_available = available_version.is_some() && available_version != current_version;
    Ok(Json(UpdateCheck {
        current_version,
        available_version,
        update_available,
    }))
}

async fn apply_update(State(state): State<ChannelState>) -> Result<Json<UpdateResult>, ApiError> {
    let version = state.supervisor()?.update(&ProgressSink::default()).await?;
    Ok(Json(UpdateResult {
        updated: version.is_some(),
        version,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::OverallStatus;

    async fn start() -> (String, Arc<WatchBroadcaster>, ChannelState) {
        let broadcaster = Arc::new(WatchBroadcaster::new());
        let state = ChannelState::new(broadcaster.clone());
        let (addr, _handle) = serve("127.0.0.1:0", state.clone()).await.unwrap();
        (format!("http://{addr}"), broadcaster, state)
    }

    #[tokio::test]
    async fn status_is_pulled_as_camel_case_json() {
        let (base, broadcaster, _) = start().await;
        let mut status = CheckStatus::default();
        status.has_runtime = true;
        status.advance(OverallStatus::Checking);
        broadcaster.publish(&status);

        let json: serde_json::Value = reqwest::get(format!("{base}/status"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(json["hasRuntime"], true);
        assert_eq!(json["overallStatus"], "checking");
    }

    async fn read_until<S, B>(body: &mut S, needle: &str) -> String
    where
        S: Stream<Item = reqwest::Result<B>> + Unpin,
        B: AsRef<[u8]>,
    {
        let mut seen = String::new();
        while !seen.contains(needle) {
            let chunk = tokio::time::timeout(Duration::from_secs(5), body.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            seen.push_str(&String::from_utf8_lossy(chunk.as_ref()));
        }
        seen
    }

    #[tokio::test]
    async fn events_stream_pushes_changes() {
        let (base, broadcaster, _) = start().await;
        let response = reqwest::get(format!("{base}/status/events")).await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        let mut body = response.bytes_stream();

        // The current record arrives first
        read_until(&mut body, "initializing").await;

        let mut status = CheckStatus::default();
        status.fail("no runtime interpreter found");
        broadcaster.publish(&status);

        let seen = read_until(&mut body, "no runtime interpreter found").await;
        assert!(seen.contains("event: status"));
        assert!(seen.contains("\"overallStatus\":\"error\""));
    }

    #[tokio::test]
    async fn control_endpoints_wait_for_supervisor() {
        let (base, _, _) = start().await;
        let client = reqwest::Client::new();
        let response = client
            .post(format!("{base}/companion/restart"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::SERVICE_UNAVAILABLE);
        let response = client.get(format!("{base}/updates/check")).send().await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn update_check_reports_versions() {
        let dir = tempfile::tempdir().unwrap();
        let update_base = crate::artifact::tests::update_server("1.3.0", None).await;
        let (cfg, layout) = crate::artifact::tests::config_in(dir.path(), &update_base);
        crate::artifact::version::VersionRecord::from_api("1.2.0")
            .store(&layout.version_file)
            .await
            .unwrap();

        let (base, _, state) = start().await;
        state.attach_supervisor(Arc::new(ProcessSupervisor::new(cfg, None).unwrap()));

        let json: serde_json::Value = reqwest::get(format!("{base}/updates/check"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(json["currentVersion"], "1.2.0");
        assert_eq!(json["availableVersion"], "1.3.0");
        assert_eq!(json["updateAvailable"], true);

        let json: serde_json::Value = reqwest::get(format!("{base}/companion"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(json["state"], "not_started");
    }
}
