//! Liveness and readiness endpoints for the consumer daemon
//!
//! `/livez` follows the queue, `/readyz` follows the store, and `/health`
//! reports both plus the time of the last successful poll.

use crate::queue::EventQueue;
use crate::store::TrapStore;
use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Shared reachability flags, written by workers and the prober.
#[derive(Debug)]
pub struct HealthState {
    queue_reachable: AtomicBool,
    store_reachable: AtomicBool,
    /// Milliseconds since the epoch; 0 until the first poll.
    last_poll_ms: AtomicI64,
}

impl Default for HealthState {
    fn default() -> Self {
        Self {
            queue_reachable: AtomicBool::new(false),
            store_reachable: AtomicBool::new(false),
            last_poll_ms: AtomicI64::new(0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub queue_reachable: bool,
    pub store_reachable: bool,
    pub last_poll: Option<DateTime<Utc>>,
}

impl HealthState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_queue_reachable(&self, reachable: bool) {
        let was = self.queue_reachable.swap(reachable, Ordering::SeqCst);
        if was != reachable {
            if reachable {
                info!("Queue is reachable");
            } else {
                warn!("Queue is unreachable");
            }
        }
    }

    pub fn set_store_reachable(&self, reachable: bool) {
        let was = self.store_reachable.swap(reachable, Ordering::SeqCst);
        if was != reachable {
            if reachable {
                info!("Store is reachable");
            } else {
                warn!("Store is unreachable");
            }
        }
    }

    /// A poll returned, with or without entries.
    pub fn record_poll(&self) {
        self.last_poll_ms.store(Utc::now().timestamp_millis(), Ordering::SeqCst);
        self.set_queue_reachable(true);
    }

    pub fn queue_reachable(&self) -> bool {
        self.queue_reachable.load(Ordering::SeqCst)
    }

    pub fn store_reachable(&self) -> bool {
        self.store_reachable.load(Ordering::SeqCst)
    }

    pub fn report(&self) -> HealthReport {
        let millis = self.last_poll_ms.load(Ordering::SeqCst);
        HealthReport {
            queue_reachable: self.queue_reachable(),
            store_reachable: self.store_reachable(),
            last_poll: (millis > 0)
                .then(|| Utc.timestamp_millis_opt(millis).single())
                .flatten(),
        }
    }
}

pub fn router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/livez", get(livez_handler))
        .route("/readyz", get(readyz_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

fn status_for(ok: bool) -> StatusCode {
    if ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn livez_handler(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let ok = state.queue_reachable();
    (status_for(ok), if ok { "ok" } else { "queue unreachable" })
}

async fn readyz_handler(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let ok = state.store_reachable();
    (status_for(ok), if ok { "ok" } else { "store unreachable" })
}

async fn health_handler(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let report = state.report();
    (status_for(report.queue_reachable && report.store_reachable), Json(report))
}

/// Bind and serve until cancelled.
pub async fn start_server(bind_address: &str, state: Arc<HealthState>, cancel: CancellationToken) -> Result<JoinHandle<()>> {
    let listener = TcpListener::bind(bind_address)
        .await
        .with_context(|| format!("Failed to bind health server to {}", bind_address))?;
    let local_addr = listener.local_addr()?;
    let app = router(state);

    let handle = tokio::spawn(async move {
        info!(addr = %local_addr, "Health server started");
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;
        if let Err(e) = result {
            error!("Health server error: {}", e);
        }
    });
    Ok(handle)
}

/// Refresh both flags on an interval until cancelled.
pub async fn run_prober(
    state: Arc<HealthState>,
    queue: Arc<dyn EventQueue>,
    store: Arc<dyn TrapStore>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                match queue.ping().await {
                    Ok(()) => state.set_queue_reachable(true),
                    Err(e) => {
                        debug!("Queue probe failed: {}", e);
                        state.set_queue_reachable(false);
                    }
                }
                match store.ping().await {
                    Ok(()) => state.set_store_reachable(true),
                    Err(e) => {
                        debug!("Store probe failed: {}", e);
                        state.set_store_reachable(false);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::queue::MemoryQueue;
    use crate::store::MemoryTrapStore;

    #[tokio::test]
    async fn endpoints_follow_their_flag() {
        let state = HealthState::new();
        let live = livez_handler(State(state.clone())).await.into_response();
        assert_eq!(live.status(), StatusCode::SERVICE_UNAVAILABLE);

        state.set_queue_reachable(true);
        let live = livez_handler(State(state.clone())).await.into_response();
        assert_eq!(live.status(), StatusCode::OK);
        let ready = readyz_handler(State(state.clone())).await.into_response();
        assert_eq!(ready.status(), StatusCode::SERVICE_UNAVAILABLE);

        state.set_store_reachable(true);
        let health = health_handler(State(state.clone())).await.into_response();
        assert_eq!(health.status(), StatusCode::OK);
    }

    #[test]
    fn report_includes_last_poll_once_seen() {
        let state = HealthState::new();
        assert_eq!(state.report().last_poll, None);
        state.record_poll();
        let report = state.report();
        assert!(report.queue_reachable);
        assert!(report.last_poll.is_some());
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["store_reachable"], false);
    }

    #[tokio::test]
    async fn prober_reflects_dependency_state() {
        let state = HealthState::new();
        let queue = Arc::new(MemoryQueue::new(1));
        let store = Arc::new(MemoryTrapStore::new());
        queue.set_unavailable(true);
        store.inject_failure(StoreError::Transient("down".into()));

        let cancel = CancellationToken::new();
        let prober = tokio::spawn(run_prober(
            state.clone(),
            queue.clone(),
            store.clone(),
            Duration::from_millis(10),
            cancel.clone(),
        ));
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(!state.queue_reachable());

        queue.set_unavailable(false);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(state.queue_reachable());
        assert!(state.store_reachable());

        cancel.cancel();
        prober.await.unwrap();
    }

    #[tokio::test]
    async fn server_binds_and_stops_on_cancel() {
        let cancel = CancellationToken::new();
        let handle = start_server("127.0.0.1:0", HealthState::new(), cancel.clone()).await.unwrap();
        cancel.cancel();
        handle.await.unwrap();
    }
}
