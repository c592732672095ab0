//! Health check HTTP server for Kubernetes probes.
//!
//! Provides `/healthz` (liveness) and `/readyz` (readiness) endpoints.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

/// Default port for health check server.
pub const DEFAULT_HEALTH_PORT: u16 = 8081;

/// Reachability check against the Kubernetes API server
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ClusterProbe: Send + Sync {
    async fn check_api_server(&self) -> Result<(), kube::Error>;
}

#[async_trait]
impl ClusterProbe for kube::Client {
    async fn check_api_server(&self) -> Result<(), kube::Error> {
        self.apiserver_version().await.map(|_| ())
    }
}

/// Shared state for health check endpoints.
pub struct HealthState<P: ClusterProbe> {
    /// Whether the operator has completed startup.
    started: AtomicBool,
    probe: Arc<P>,
}

impl<P: ClusterProbe> HealthState<P> {
    pub fn new(probe: Arc<P>) -> Self {
        Self {
            started: AtomicBool::new(false),
            probe,
        }
    }

    /// Mark the operator as started and ready.
    pub fn mark_started(&self) {
        self.started.store(true, Ordering::SeqCst);
        info!("Health check: operator marked as started");
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }
}

fn health_router<P: ClusterProbe + 'static>(state: Arc<HealthState<P>>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz::<P>))
        .with_state(state)
}

/// Run the health check HTTP server.
///
/// Runs until the server hits a fatal error. The operator is marked as
/// started once the listener is bound.
pub async fn run_health_server<P: ClusterProbe + 'static>(
    state: Arc<HealthState<P>>,
    port: u16,
) -> std::io::Result<()> {
    let app = health_router(state.clone());

    // Kubelet probes arrive on the pod IP
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;

    info!(port = port, "Health check server listening");
    state.mark_started();

    axum::serve(listener, app).await
}

/// Liveness probe: 200 while the process is serving requests.
async fn healthz() -> StatusCode {
    debug!("Liveness probe: OK");
    StatusCode::OK
}

/// Readiness probe.
///
/// Returns 503 until startup completes or while the API server is unreachable.
async fn readyz<P: ClusterProbe + 'static>(State(state): State<Arc<HealthState<P>>>) -> StatusCode {
    if !state.is_started() {
        debug!("Readiness probe: NOT READY (startup incomplete)");
        return StatusCode::SERVICE_UNAVAILABLE;
    }

    match state.probe.check_api_server().await {
        Ok(()) => {
            debug!("Readiness probe: OK");
            StatusCode::OK
        }
        Err(e) => {
            warn!(error = %e, "Readiness probe: NOT READY (API server unreachable)");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use kube::core::ErrorResponse;
    use tower::ServiceExt;

    fn unreachable() -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "service unavailable".to_string(),
            reason: "ServiceUnavailable".to_string(),
            code: 503,
        })
    }

    #[tokio::test]
    async fn test_healthz_returns_ok() {
        assert_eq!(healthz().await, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_readyz_returns_unavailable_before_startup() {
        let mut probe = MockClusterProbe::new();
        probe.expect_check_api_server().never();

        let state = Arc::new(HealthState::new(Arc::new(probe)));
        assert_eq!(readyz(State(state)).await, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_readyz_returns_ok_when_api_server_reachable() {
        let mut probe = MockClusterProbe::new();
        probe.expect_check_api_server().times(1).returning(|| Ok(()));

        let state = Arc::new(HealthState::new(Arc::new(probe)));
        state.mark_started();

        assert_eq!(readyz(State(state)).await, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_readyz_returns_unavailable_when_api_server_unreachable() {
        let mut probe = MockClusterProbe::new();
        probe
            .expect_check_api_server()
            .returning(|| Err(unreachable()));

        let state = Arc::new(HealthState::new(Arc::new(probe)));
        state.mark_started();

        assert_eq!(readyz(State(state)).await, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_router_serves_both_probes() {
        let mut probe = MockClusterProbe::new();
        probe.expect_check_api_server().returning(|| Ok(()));
        let state = Arc::new(HealthState::new(Arc::new(probe)));
        state.mark_started();

        for path in ["/healthz", "/readyz"] {
            let response = health_router(state.clone())
                .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK, "{path}");
        }
    }

    #[tokio::test]
    async fn test_mark_started_is_idempotent() {
        let state = HealthState::new(Arc::new(MockClusterProbe::new()));
        assert!(!state.is_started());

        state.mark_started();
        state.mark_started();
        assert!(state.is_started());
    }
}
