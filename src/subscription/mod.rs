//! Subscription lifecycle: creation, renewal, and recovery of per-mailbox
//! change subscriptions with the provider.

pub mod manager;

use async_trait::async_trait;

pub use manager::{
    LifecycleManager, ManagerConfig, ManagerError, SubscriptionAction, MAX_SUBSCRIPTION_MINUTES,
};

/// Receiver of provider lifecycle notifications. The notification ingress
/// holds this seam so its handlers can be tested without a full manager.
#[async_trait]
pub trait LifecycleSink: Send + Sync {
    /// Handles one lifecycle event for a subscription. Never fails upward:
    /// problems are logged and recovered by the renewal/sweep loops.
    async fn handle_lifecycle_event(&self, event: &str, subscription_id: &str, tenant_alias: &str);
}
