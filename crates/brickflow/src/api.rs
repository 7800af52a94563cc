//! HTTP control surface.
//!
//! | Method | Path                 | Action                     |
//! |--------|----------------------|----------------------------|
//! | GET    | `/health`            | liveness probe             |
//! | GET    | `/flows`             | status of every flow       |
//! | GET    | `/flows/{id}`        | status of one flow         |
//! | POST   | `/flows/{id}/start`  | start (or scale out) a flow |
//! | POST   | `/flows/{id}/stop`   | stop a flow                |
//!
//! `{id}` is a flow identifier or name.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use snafu::ResultExt;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::{ApiBindSnafu, ControlPeerError};
use crate::peer::ControlPeer;
use crate::status::{FlowStatus, PeerStatus};

/// How long in-flight requests get to finish once the API is stopped.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Build the control API router.
pub fn router(peer: Arc<ControlPeer>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/flows", get(list_flows_handler))
        .route("/flows/{id}", get(flow_handler))
        .route("/flows/{id}/start", post(start_flow_handler))
        .route("/flows/{id}/stop", post(stop_flow_handler))
        .with_state(peer)
}

/// A running control API server.
pub struct ApiServer {
    address: SocketAddr,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl ApiServer {
    /// Bind `address` and serve the control API in the background.
    pub async fn bind(address: &str, peer: Arc<ControlPeer>) -> Result<Self, ControlPeerError> {
        let listener = TcpListener::bind(address)
            .await
            .context(ApiBindSnafu { address })?;
        let local = listener.local_addr().context(ApiBindSnafu { address })?;

        let shutdown = CancellationToken::new();
        let signal = shutdown.clone();
        let app = router(peer);
        let task = tokio::spawn(async move {
            let serve = axum::serve(listener, app)
                .with_graceful_shutdown(async move { signal.cancelled().await });
            if let Err(e) = serve.await {
                error!(error = %e, "Control API server error");
            }
        });

        info!(address = %local, "Control API listening");
        Ok(Self {
            address: local,
            shutdown,
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.address
    }

    /// Stop accepting requests and wait, bounded, for in-flight ones.
    pub async fn stop(self) {
        self.shutdown.cancel();
        let mut task = self.task;
        if tokio::time::timeout(DRAIN_TIMEOUT, &mut task).await.is_err() {
            warn!("Control API did not drain in time, aborting");
            task.abort();
        }
        info!("Control API stopped");
    }
}

/// Error body returned by the API.
#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

struct ApiError(ControlPeerError);

impl From<ControlPeerError> for ApiError {
    fn from(e: ControlPeerError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0 {
            ControlPeerError::UnknownFlow { .. } => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ErrorBody {
            error: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

async fn health_handler() -> &'static str {
    "ok\n"
}

async fn list_flows_handler(State(peer): State<Arc<ControlPeer>>) -> Json<PeerStatus> {
    Json(peer.status().await)
}

async fn flow_handler(
    State(peer): State<Arc<ControlPeer>>,
    Path(id): Path<String>,
) -> Result<Json<FlowStatus>, ApiError> {
    let flow = peer
        .flow(&id)
        .ok_or(ControlPeerError::UnknownFlow { id })?;
    Ok(Json(flow.status().await))
}

async fn start_flow_handler(
    State(peer): State<Arc<ControlPeer>>,
    Path(id): Path<String>,
) -> Result<Json<FlowStatus>, ApiError> {
    let flow = peer.start_flow(&id).await?;
    Ok(Json(flow.status().await))
}

async fn stop_flow_handler(
    State(peer): State<Arc<ControlPeer>>,
    Path(id): Path<String>,
) -> Result<Json<FlowStatus>, ApiError> {
    let flow = peer.stop_flow(&id).await?;
    Ok(Json(flow.status().await))
}
