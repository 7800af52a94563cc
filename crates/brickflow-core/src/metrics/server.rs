//! Prometheus metrics infrastructure with singleton-based initialization.
//!
//! The recorder is process-wide, so initialization goes through a `OnceLock`.
//! Tests use [`init_test`], which installs the recorder without binding a port
//! and tolerates concurrent callers.

use std::net::SocketAddr;
use std::sync::{Once, OnceLock};

use axum::{Extension, Router, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use snafu::prelude::*;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::error::{
    AddressParseSnafu, AlreadyInitializedSnafu, MetricsError, NotInitializedSnafu,
    PrometheusInitSnafu,
};

/// Default metrics address.
pub const DEFAULT_METRICS_ADDR: &str = "0.0.0.0:9090";

/// Histogram buckets for lifecycle durations (in seconds).
const DURATION_BUCKETS: &[f64] = &[0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0];

static CONTROLLER: OnceLock<MetricsController> = OnceLock::new();

/// Handle to the installed Prometheus recorder.
pub struct MetricsController {
    handle: PrometheusHandle,
}

impl MetricsController {
    /// Get the global metrics controller.
    pub fn get() -> Result<&'static Self, MetricsError> {
        CONTROLLER.get().context(NotInitializedSnafu)
    }

    /// Render metrics in Prometheus text format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

fn install() -> Result<(), MetricsError> {
    let handle = PrometheusBuilder::new()
        .set_buckets(DURATION_BUCKETS)
        .context(PrometheusInitSnafu)?
        .install_recorder()
        .context(PrometheusInitSnafu)?;

    CONTROLLER
        .set(MetricsController { handle })
        .map_err(|_| AlreadyInitializedSnafu.build())
}

/// Install the recorder and serve `/metrics` and `/health` on `address`.
///
/// Must be called from within a tokio runtime.
pub fn init_global(address: &str) -> Result<SocketAddr, MetricsError> {
    let addr: SocketAddr = address.parse().context(AddressParseSnafu { address })?;
    install()?;

    tokio::spawn(run_server(addr));

    info!(%addr, "Metrics server started");
    Ok(addr)
}

/// Install the recorder for tests, without an HTTP endpoint.
///
/// Safe to call repeatedly and from several test threads at once; callers
/// block until the first installation finished.
pub fn init_test() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        if let Err(e) = install() {
            error!(error = %e, "Failed to install test metrics recorder");
        }
    });
}

async fn run_server(addr: SocketAddr) {
    let Some(controller) = CONTROLLER.get() else {
        error!("Metrics server started before the recorder was installed");
        return;
    };

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .layer(Extension(controller.handle.clone()));

    let listener = match TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(%addr, error = %e, "Failed to bind metrics server");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app).await {
        error!(error = %e, "Metrics server error");
    }
}

async fn metrics_handler(Extension(handle): Extension<PrometheusHandle>) -> String {
    handle.render()
}

async fn health_handler() -> &'static str {
    "ok\n"
}
