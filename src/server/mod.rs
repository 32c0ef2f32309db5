//! HTTP ingress for provider push notifications.
//!
//! # Endpoints
//!
//! - `POST /webhook/{alias}/{user}` - change notifications for one mailbox
//! - `POST /lifecycle/{alias}` - subscription lifecycle notifications
//!
//! Both endpoints implement the provider's validation-probe handshake and
//! its fast-ACK contract: a parseable notification is answered `202
//! Accepted` before any downstream work happens, and an unparseable body is
//! *also* answered 202 - a malformed payload is a bug to diagnose in logs,
//! not something we want the provider to redeliver.
//!
//! # Startup ordering
//!
//! Binding the listening socket is load-bearing: subscription creation
//! triggers a synchronous validation probe from the provider, so the
//! supervisor must have completed `TcpListener::bind` on this router's
//! listener before the lifecycle manager issues its first create call.

use std::collections::HashMap;
use std::sync::Arc;

pub mod health;
pub mod lifecycle;
pub mod notification;
pub mod tunnel;

pub use health::{HealthState, Pingable, build_health_router};
pub use tunnel::resolve_webhook_url;

use crate::pipeline::Deliver;
use crate::store::SubscriptionDirectory;
use crate::subscription::LifecycleSink;
use crate::types::TenantId;

/// Shared application state, passed to handlers via axum's `State`.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    /// Tenant alias (from the URL path) → provider tenant id.
    tenants: HashMap<String, TenantId>,

    directory: Arc<dyn SubscriptionDirectory>,
    pipeline: Arc<dyn Deliver>,
    lifecycle: Arc<dyn LifecycleSink>,
}

impl AppState {
    pub fn new(
        tenants: HashMap<String, TenantId>,
        directory: Arc<dyn SubscriptionDirectory>,
        pipeline: Arc<dyn Deliver>,
        lifecycle: Arc<dyn LifecycleSink>,
    ) -> Self {
        AppState {
            inner: Arc::new(AppStateInner {
                tenants,
                directory,
                pipeline,
                lifecycle,
            }),
        }
    }

    /// Resolves a path alias to its provider tenant id.
    pub fn tenant_id(&self, alias: &str) -> Option<&TenantId> {
        self.inner.tenants.get(alias)
    }

    pub fn directory(&self) -> &Arc<dyn SubscriptionDirectory> {
        &self.inner.directory
    }

    pub fn pipeline(&self) -> &Arc<dyn Deliver> {
        &self.inner.pipeline
    }

    pub fn lifecycle(&self) -> &Arc<dyn LifecycleSink> {
        &self.inner.lifecycle
    }
}

/// Builds the ingress router.
pub fn build_router(state: AppState) -> axum::Router {
    use axum::routing::any;

    axum::Router::new()
        .route(
            "/webhook/{alias}/{user}",
            any(notification::notification_handler),
        )
        .route("/lifecycle/{alias}", any(lifecycle::lifecycle_handler))
        .with_state(state)
}
