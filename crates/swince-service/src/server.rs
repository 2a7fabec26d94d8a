use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use parking_lot::Mutex;
use serde::Serialize;
use swince_store_sqlite::StorageHandle;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::lifecycle::ErrorSink;

pub const SERVICE_CONTRACT_VERSION: &str = "service.v1";

#[derive(Debug, Clone)]
struct ServiceState {
    store: Arc<StorageHandle>,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    storage: &'static str,
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope { service_contract_version: SERVICE_CONTRACT_VERSION, data }
}

pub fn router(store: Arc<StorageHandle>) -> Router {
    Router::new().route("/v1/health", get(health)).with_state(ServiceState { store })
}

async fn health(State(state): State<ServiceState>) -> Json<ServiceEnvelope<HealthResponse>> {
    let response = if state.store.is_closed() {
        HealthResponse { status: "degraded", storage: "closed" }
    } else {
        HealthResponse { status: "ok", storage: "open" }
    };
    Json(envelope(response))
}

/// The HTTP listener, serving until [`Server::stop`] is called.
#[derive(Debug)]
pub struct Server {
    local_addr: SocketAddr,
    stop: Mutex<Option<oneshot::Sender<()>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Server {
    /// Serve `router` on `listener` in a background task. A serve error is
    /// reported on `errors`.
    ///
    /// # Errors
    /// Fails when the listener has no local address.
    pub fn start(listener: TcpListener, router: Router, errors: ErrorSink) -> Result<Self> {
        let local_addr = listener.local_addr().context("listener has no local address")?;
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            let shutdown = async move {
                let _ = stop_rx.await;
            };
            if let Err(err) = axum::serve(listener, router).with_graceful_shutdown(shutdown).await {
                errors.report(anyhow::Error::new(err).context("HTTP server failed"));
            }
        });

        tracing::info!(addr = %local_addr, "server listening");
        Ok(Self { local_addr, stop: Mutex::new(Some(stop_tx)), task: Mutex::new(Some(task)) })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting connections and wait for in-flight requests. Later calls
    /// return immediately.
    pub async fn stop(&self) {
        if let Some(stop) = self.stop.lock().take() {
            let _ = stop.send(());
        }
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                tracing::error!(error = %err, "server task ended abnormally");
            }
            tracing::info!(addr = %self.local_addr, "server stopped");
        }
    }
}
