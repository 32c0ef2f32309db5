//! Health endpoint for load balancers and orchestration probes.
//!
//! `GET /health` answers 200 only when every dependent store responds
//! within the per-check deadline; otherwise 503 naming the failing
//! dependency. Served on its own listener so store trouble never contends
//! with notification ingestion.

use async_trait::async_trait;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::publish::Publisher;
use crate::store::SubscriptionStore;

/// Deadline for a single dependency probe.
const CHECK_TIMEOUT: Duration = Duration::from_secs(2);

/// A dependency that can be probed for liveness.
#[async_trait]
pub trait Pingable: Send + Sync {
    fn name(&self) -> &'static str;
    async fn check(&self) -> Result<(), String>;
}

#[async_trait]
impl Pingable for SubscriptionStore {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn check(&self) -> Result<(), String> {
        self.ping().await.map_err(|e| e.to_string())
    }
}

#[async_trait]
impl Pingable for Publisher {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn check(&self) -> Result<(), String> {
        self.ping().await.map_err(|e| e.to_string())
    }
}

/// The dependency set probed by the health endpoint.
#[derive(Clone)]
pub struct HealthState {
    checks: Arc<Vec<Arc<dyn Pingable>>>,
}

impl HealthState {
    pub fn new(checks: Vec<Arc<dyn Pingable>>) -> Self {
        HealthState {
            checks: Arc::new(checks),
        }
    }
}

/// Builds the health router.
pub fn build_health_router(state: HealthState) -> axum::Router {
    use axum::routing::get;

    axum::Router::new()
        .route("/health", get(health_handler))
        .with_state(state)
}

async fn health_handler(State(state): State<HealthState>) -> Response {
    for check in state.checks.iter() {
        let result = tokio::time::timeout(CHECK_TIMEOUT, check.check()).await;

        let failure = match result {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e),
            Err(_) => Some("probe timed out".to_string()),
        };

        if let Some(reason) = failure {
            warn!(dependency = check.name(), reason = %reason, "health check failed");
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                format!("{} unhealthy", check.name()),
            )
                .into_response();
        }
    }

    (StatusCode::OK, r#"{"status": "healthy"}"#).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    struct AlwaysHealthy;

    #[async_trait]
    impl Pingable for AlwaysHealthy {
        fn name(&self) -> &'static str {
            "healthy-dep"
        }

        async fn check(&self) -> Result<(), String> {
            Ok(())
        }
    }

    struct AlwaysDown;

    #[async_trait]
    impl Pingable for AlwaysDown {
        fn name(&self) -> &'static str {
            "down-dep"
        }

        async fn check(&self) -> Result<(), String> {
            Err("connection refused".to_string())
        }
    }

    struct NeverAnswers;

    #[async_trait]
    impl Pingable for NeverAnswers {
        fn name(&self) -> &'static str {
            "slow-dep"
        }

        async fn check(&self) -> Result<(), String> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        }
    }

    async fn get_health(state: HealthState) -> (StatusCode, String) {
        let router = build_health_router(state);
        let response = router
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8_lossy(&body).to_string())
    }

    #[tokio::test]
    async fn healthy_dependencies_yield_200() {
        let state = HealthState::new(vec![Arc::new(AlwaysHealthy), Arc::new(AlwaysHealthy)]);
        let (status, body) = get_health(state).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, r#"{"status": "healthy"}"#);
    }

    #[tokio::test]
    async fn failing_dependency_yields_503_with_its_name() {
        let state = HealthState::new(vec![Arc::new(AlwaysHealthy), Arc::new(AlwaysDown)]);
        let (status, body) = get_health(state).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body, "down-dep unhealthy");
    }

    #[tokio::test(start_paused = true)]
    async fn unresponsive_dependency_times_out_to_503() {
        let state = HealthState::new(vec![Arc::new(NeverAnswers)]);
        let (status, body) = get_health(state).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body, "slow-dep unhealthy");
    }
}
