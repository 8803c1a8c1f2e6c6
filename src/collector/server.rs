//! # Control Server
//!
//! An `axum` server bound to the loopback interface through which the
//! orchestrating process drives the daemon:
//!
//! - `POST /collect` runs one out-of-band tick and answers `200` with an
//!   empty body.
//! - `GET /metrics` answers `200` with the whole buffer as a `Metric`
//!   payload.
//!
//! Other methods on these paths get `405`, other paths `404`. A handler
//! error, including a panic while sampling, becomes `500` with a
//! `{type, message}` JSON body.

use super::{StatCollector, TickOrigin};
use crate::core::TelemetryData;
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinError;
use tracing::{debug, error, info, trace};

#[derive(Error, Debug)]
pub enum ControlError {
    #[error("failed to serialize metric payload: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("collect task failed: {0}")]
    Collect(#[from] JoinError),
}

impl ControlError {
    fn kind(&self) -> &'static str {
        match self {
            ControlError::Serialize(_) => "SerializationError",
            ControlError::Collect(e) if e.is_panic() => "CollectPanicked",
            ControlError::Collect(_) => "CollectCancelled",
        }
    }
}

impl IntoResponse for ControlError {
    fn into_response(self) -> Response {
        error!(error = %self, "Control request failed");
        let body = json!({ "type": self.kind(), "message": self.to_string() });
        (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
    }
}

/// Finds the first port at or above `base` that can be bound on loopback.
///
/// Port 0 is never returned, since it only means "any port" to `bind`.
pub fn find_free_port(base: u16) -> std::io::Result<u16> {
    for port in base.max(1)..=u16::MAX {
        if std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_ok() {
            return Ok(port);
        }
    }
    Err(std::io::Error::new(
        std::io::ErrorKind::AddrInUse,
        format!("no free loopback port at or above {}", base),
    ))
}

/// The daemon's HTTP control plane.
pub struct ControlServer {
    listener: TcpListener,
    collector: Arc<StatCollector>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ControlServer {
    /// Creates a new `ControlServer` on an already bound listener. It does not
    /// start serving until [`ControlServer::run`] is awaited.
    pub fn new(
        listener: TcpListener,
        collector: Arc<StatCollector>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            listener,
            collector,
            shutdown_rx,
        }
    }

    /// Binds the loopback interface on `port` (`0` picks any free port).
    pub async fn bind(
        port: u16,
        collector: Arc<StatCollector>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port)).await?;
        Ok(Self::new(listener, collector, shutdown_rx))
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// The routes served by the daemon.
    pub fn router(collector: Arc<StatCollector>) -> Router {
        Router::new()
            .route("/collect", post(collect))
            .route("/metrics", get(metrics))
            .with_state(collector)
    }

    /// Returns a future that serves requests until a shutdown signal is received.
    pub fn run(mut self) -> impl Future<Output = ()> {
        let app = Self::router(self.collector.clone());

        async move {
            if let Ok(addr) = self.listener.local_addr() {
                info!(%addr, "Stat server listening");
            }
            tokio::select! {
                biased;
                _ = self.shutdown_rx.changed() => {
                    trace!("Control server received shutdown signal via select.");
                }
                result = axum::serve(self.listener, app.into_make_service()) => {
                    if let Err(e) = result {
                        error!("Control server error: {}", e);
                    }
                }
            }
            trace!("Control server task finished.");
        }
    }
}

async fn collect(State(collector): State<Arc<StatCollector>>) -> Result<StatusCode, ControlError> {
    // On its own task so a panicking source surfaces as a JoinError.
    let report = tokio::spawn(async move { collector.collect(TickOrigin::Triggered).await }).await?;
    debug!(
        collected = report.collected,
        failed = report.failed,
        "Triggered stat collect"
    );
    Ok(StatusCode::OK)
}

async fn metrics(State(collector): State<Arc<StatCollector>>) -> Result<Response, ControlError> {
    let payload = TelemetryData::metric(collector.snapshots());
    let body = serde_json::to_vec(&payload)?;
    Ok(([(header::CONTENT_TYPE, "application/json")], body).into_response())
}
