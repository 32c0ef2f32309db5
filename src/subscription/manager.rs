//! Lifecycle manager for per-mailbox change subscriptions.
//!
//! Keeps every tracked mailbox covered by an active, not-near-expiry
//! subscription:
//!
//! 1. At startup, discovers each tenant's mailboxes and ensures a
//!    subscription per user (per-user failures are logged, not fatal).
//! 2. A renewal loop ticks at `max(renewal_buffer / 2, 1 min)` and renews
//!    everything expiring within the buffer.
//! 3. Provider lifecycle notifications (removed / reauthorization-required /
//!    missed) are absorbed here.
//!
//! Every successful creation fires the gap hook: messages that arrive
//! between "subscription accepted" and "first notification" are only
//! recoverable by an immediate delta sync of that mailbox.
//!
//! The push server must be listening before `start` is called - subscription
//! creation triggers a synchronous validation probe against the
//! notification URL.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Utc};
use reqwest::{Method, StatusCode};
use ring::rand::{SecureRandom, SystemRandom};
use serde::Deserialize;
use serde_json::json;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::TenantConfig;
use crate::discovery::{Discovery, DiscoveryError, TenantRoster};
use crate::graph::error::body_excerpt;
use crate::graph::{GraphClient, GraphClients, GraphError};
use crate::store::{
    NewSubscription, StoreError, SubscriptionRecord, SubscriptionStatus, SubscriptionStore,
};
use crate::types::{SubscriptionId, TenantId, UserId};

use super::LifecycleSink;

/// Maximum provider subscription lifetime for message resources:
/// 4230 minutes (~2.94 days).
pub const MAX_SUBSCRIPTION_MINUTES: i64 = 4230;

/// Floor for the renewal ticker period.
const MIN_RENEWAL_INTERVAL: Duration = Duration::from_secs(60);

/// Callback fired when a notification gap is known or suspected for a
/// mailbox. Wired to the delta synchroniser at startup.
pub type GapHook = Arc<dyn Fn(TenantId, UserId) + Send + Sync>;

/// Errors from subscription lifecycle operations.
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("no graph client for tenant {0:?}")]
    MissingClient(String),

    #[error("tenant {0:?} not found in configuration")]
    UnknownTenant(String),

    #[error("discover users for {alias}: {source}")]
    Discovery {
        alias: String,
        #[source]
        source: DiscoveryError,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("subscription creation returned HTTP {status} for user {user}")]
    CreateStatus { status: u16, user: UserId },

    #[error("subscription renewal returned HTTP {status}")]
    RenewStatus { status: u16 },

    #[error("decode subscription response: {0}")]
    Decode(#[source] serde_json::Error),
}

/// What `ensure_subscription` should do for one mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionAction {
    /// Active and comfortably far from expiry.
    Keep,
    /// Active but inside the renewal buffer.
    Renew,
    /// Missing, expired, or removed.
    Create,
}

/// Decides how to cover a mailbox given its current record.
///
/// A record exactly at `expires_at - renewal_buffer` renews rather than
/// being treated as fresh: better one early renewal than a coverage gap.
pub fn plan_subscription(
    existing: Option<&SubscriptionRecord>,
    now: DateTime<Utc>,
    renewal_buffer: ChronoDuration,
) -> SubscriptionAction {
    match existing {
        Some(rec) if rec.status == SubscriptionStatus::Active => {
            if rec.expires_at - now <= renewal_buffer {
                SubscriptionAction::Renew
            } else {
                SubscriptionAction::Keep
            }
        }
        _ => SubscriptionAction::Create,
    }
}

/// The renewal ticker period: half the buffer, floored at one minute.
pub fn renewal_interval(renewal_buffer: Duration) -> Duration {
    std::cmp::max(renewal_buffer / 2, MIN_RENEWAL_INTERVAL)
}

/// Generates a fresh shared secret: 16 random bytes, hex-encoded. Echoed by
/// the provider on every notification and compared by the ingress.
pub fn generate_client_state() -> String {
    let mut bytes = [0u8; 16];
    SystemRandom::new()
        .fill(&mut bytes)
        .expect("system RNG unavailable");
    hex_encode(&bytes)
}

fn hex_encode(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push(HEX[(byte >> 4) as usize] as char);
        out.push(HEX[(byte & 0x0f) as usize] as char);
    }
    out
}

/// The notification and lifecycle URLs registered for one mailbox.
fn subscription_urls(webhook_base: &str, alias: &str, user: &UserId) -> (String, String) {
    (
        format!("{webhook_base}/webhook/{alias}/{user}"),
        format!("{webhook_base}/lifecycle/{alias}"),
    )
}

/// Configuration for the lifecycle manager.
pub struct ManagerConfig {
    pub store: Arc<SubscriptionStore>,
    pub discovery: Discovery,
    pub clients: GraphClients,
    pub tenants: Vec<TenantConfig>,
    pub webhook_base: String,
    pub renewal_buffer: Duration,
    pub graph_base_url: String,
}

/// Handles creation, renewal, and recovery of per-mailbox subscriptions.
pub struct LifecycleManager {
    store: Arc<SubscriptionStore>,
    discovery: Discovery,
    clients: GraphClients,
    tenants: Vec<TenantConfig>,
    webhook_base: String,
    renewal_buffer: Duration,
    graph_base_url: String,

    on_gap: RwLock<Option<GapHook>>,
    cancel: CancellationToken,
    renewal_task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

#[derive(Deserialize)]
struct CreatedSubscription {
    #[serde(default)]
    id: String,
    #[serde(rename = "expirationDateTime", default)]
    expiration_date_time: String,
}

impl LifecycleManager {
    pub fn new(cfg: ManagerConfig) -> Self {
        LifecycleManager {
            store: cfg.store,
            discovery: cfg.discovery,
            clients: cfg.clients,
            tenants: cfg.tenants,
            webhook_base: cfg.webhook_base,
            renewal_buffer: cfg.renewal_buffer,
            graph_base_url: cfg.graph_base_url,
            on_gap: RwLock::new(None),
            cancel: CancellationToken::new(),
            renewal_task: tokio::sync::Mutex::new(None),
        }
    }

    /// Wires the gap-recovery callback. Must be set before `start` so
    /// creations during startup can schedule their catch-up syncs.
    pub fn set_gap_hook(&self, hook: GapHook) {
        *self.on_gap.write().expect("gap hook lock poisoned") = Some(hook);
    }

    /// Discovers mailboxes, ensures subscriptions, and starts the renewal
    /// loop. Returns the per-tenant mailbox roster for the delta sweep.
    ///
    /// Individual user failures are logged and skipped; a tenant-level
    /// discovery failure aborts startup.
    pub async fn start(self: &Arc<Self>) -> Result<Vec<TenantRoster>, ManagerError> {
        let mut rosters = Vec::with_capacity(self.tenants.len());

        for tenant in &self.tenants {
            let client = self
                .clients
                .get(&tenant.alias)
                .ok_or_else(|| ManagerError::MissingClient(tenant.alias.clone()))?;

            let users = self
                .discovery
                .discover_users(
                    client,
                    &tenant.alias,
                    &tenant.include_users,
                    &tenant.exclude_users,
                )
                .await
                .map_err(|source| ManagerError::Discovery {
                    alias: tenant.alias.clone(),
                    source,
                })?;

            info!(
                tenant = %tenant.alias,
                users = users.len(),
                "ensuring subscriptions for tenant"
            );

            let mut roster_users = Vec::with_capacity(users.len());
            for user in &users {
                let user_id = UserId::new(user.subscription_identifier());

                if let Err(e) = self.ensure_subscription(client, tenant, &user_id).await {
                    error!(
                        tenant = %tenant.alias,
                        user = %user_id,
                        error = %e,
                        "failed to ensure subscription"
                    );
                    // Keep going: one broken mailbox must not block the rest.
                }
                roster_users.push(user_id);
            }

            rosters.push(TenantRoster {
                tenant_id: TenantId::new(&tenant.tenant_id),
                tenant_alias: tenant.alias.clone(),
                users: roster_users,
            });
        }

        let mgr = Arc::clone(self);
        let handle = tokio::spawn(async move { mgr.renewal_loop().await });
        *self.renewal_task.lock().await = Some(handle);

        info!(
            renewal_interval_secs = renewal_interval(self.renewal_buffer).as_secs(),
            "subscription lifecycle manager started"
        );

        Ok(rosters)
    }

    /// Cancels the renewal loop and waits for it to exit.
    pub async fn stop(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.renewal_task.lock().await.take() {
            let _ = handle.await;
        }
        info!("subscription lifecycle manager stopped");
    }

    /// Ensures a mailbox is covered: no-op, renew, or create as needed.
    async fn ensure_subscription(
        &self,
        client: &Arc<GraphClient>,
        tenant: &TenantConfig,
        user_id: &UserId,
    ) -> Result<(), ManagerError> {
        let existing = self.store.get(&TenantId::new(&tenant.tenant_id), user_id).await?;
        let buffer = ChronoDuration::from_std(self.renewal_buffer).unwrap_or_default();

        match (plan_subscription(existing.as_ref(), Utc::now(), buffer), existing) {
            (SubscriptionAction::Keep, Some(rec)) => {
                debug!(
                    tenant = %tenant.alias,
                    user = %user_id,
                    expires_at = %rec.expires_at,
                    "subscription already active"
                );
                Ok(())
            }
            (SubscriptionAction::Renew, Some(rec)) => {
                info!(
                    tenant = %tenant.alias,
                    user = %user_id,
                    expires_at = %rec.expires_at,
                    "renewing near-expiry subscription"
                );
                self.renew_subscription(client, &rec).await
            }
            _ => {
                info!(tenant = %tenant.alias, user = %user_id, "creating subscription");
                self.create_subscription(client, tenant, user_id).await
            }
        }
    }

    /// Creates a subscription for a mailbox and schedules its gap-recovery
    /// delta sync.
    async fn create_subscription(
        &self,
        client: &Arc<GraphClient>,
        tenant: &TenantConfig,
        user_id: &UserId,
    ) -> Result<(), ManagerError> {
        let client_state = generate_client_state();
        let requested_expiry =
            Utc::now() + ChronoDuration::minutes(MAX_SUBSCRIPTION_MINUTES);

        let (notification_url, lifecycle_url) =
            subscription_urls(&self.webhook_base, &tenant.alias, user_id);

        let payload = json!({
            "changeType": "created",
            "notificationUrl": notification_url,
            "lifecycleNotificationUrl": lifecycle_url,
            "resource": format!("/users/{user_id}/messages"),
            "expirationDateTime": requested_expiry.to_rfc3339_opts(SecondsFormat::Secs, true),
            "clientState": client_state,
        });

        let response = client
            .request(Method::POST, &format!("{}/subscriptions", self.graph_base_url))
            .await?
            .json(&payload)
            .send()
            .await
            .map_err(GraphError::from)?;

        let status = response.status();
        let body = response.text().await.map_err(GraphError::from)?;
        if status != StatusCode::CREATED {
            warn!(
                tenant = %tenant.alias,
                user = %user_id,
                status = status.as_u16(),
                body = %body_excerpt(&body),
                "subscription creation failed"
            );
            return Err(ManagerError::CreateStatus {
                status: status.as_u16(),
                user: user_id.clone(),
            });
        }

        let created: CreatedSubscription =
            serde_json::from_str(&body).map_err(ManagerError::Decode)?;

        let expires_at = DateTime::parse_from_rfc3339(&created.expiration_date_time)
            .map(|ts| ts.with_timezone(&Utc))
            .unwrap_or(requested_expiry);

        self.store
            .upsert(&NewSubscription {
                subscription_id: SubscriptionId::new(created.id.clone()),
                user_id: user_id.clone(),
                tenant_id: TenantId::new(&tenant.tenant_id),
                tenant_alias: tenant.alias.clone(),
                client_state,
                expires_at,
                status: SubscriptionStatus::Active,
            })
            .await?;

        info!(
            tenant = %tenant.alias,
            user = %user_id,
            subscription_id = %created.id,
            expires_at = %expires_at,
            "subscription created"
        );

        // Messages that arrived before the subscription went live are only
        // recoverable via an immediate delta sync.
        self.fire_gap_hook(TenantId::new(&tenant.tenant_id), user_id.clone());

        Ok(())
    }

    /// Extends the expiry of an existing subscription. A 404 means the
    /// provider garbage-collected it; the record is marked removed and a
    /// fresh subscription is created for the same mailbox.
    async fn renew_subscription(
        &self,
        client: &Arc<GraphClient>,
        rec: &SubscriptionRecord,
    ) -> Result<(), ManagerError> {
        let new_expiry = Utc::now() + ChronoDuration::minutes(MAX_SUBSCRIPTION_MINUTES);

        let payload = json!({
            "expirationDateTime": new_expiry.to_rfc3339_opts(SecondsFormat::Secs, true),
        });

        let response = client
            .request(
                Method::PATCH,
                &format!("{}/subscriptions/{}", self.graph_base_url, rec.subscription_id),
            )
            .await?
            .json(&payload)
            .send()
            .await
            .map_err(GraphError::from)?;

        match response.status() {
            StatusCode::NOT_FOUND => {
                warn!(
                    subscription_id = %rec.subscription_id,
                    tenant = %rec.tenant_alias,
                    user = %rec.user_id,
                    "subscription removed by provider, re-creating"
                );

                if let Err(e) = self
                    .store
                    .mark_status(&rec.subscription_id, SubscriptionStatus::Removed)
                    .await
                {
                    error!(error = %e, "failed to mark subscription removed");
                }

                let tenant = self
                    .find_tenant(&rec.tenant_alias)
                    .ok_or_else(|| ManagerError::UnknownTenant(rec.tenant_alias.clone()))?
                    .clone();
                self.create_subscription(client, &tenant, &rec.user_id).await
            }
            StatusCode::OK => {
                self.store
                    .update_expiry(&rec.subscription_id, new_expiry)
                    .await?;

                info!(
                    subscription_id = %rec.subscription_id,
                    tenant = %rec.tenant_alias,
                    user = %rec.user_id,
                    new_expiry = %new_expiry,
                    "subscription renewed"
                );
                Ok(())
            }
            other => Err(ManagerError::RenewStatus {
                status: other.as_u16(),
            }),
        }
    }

    /// Ticks until cancelled, renewing everything inside the buffer.
    async fn renewal_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(renewal_interval(self.renewal_buffer));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick of tokio's interval fires immediately; startup just
        // ensured everything, so swallow it.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = ticker.tick() => self.renew_expiring().await,
            }
        }
    }

    /// Renews all subscriptions close to expiry. Failures are logged and
    /// retried on the next tick.
    async fn renew_expiring(&self) {
        let records = match self.store.list_expiring_soon(self.renewal_buffer).await {
            Ok(records) => records,
            Err(e) => {
                error!(error = %e, "failed to list expiring subscriptions");
                return;
            }
        };

        if records.is_empty() {
            return;
        }

        info!(count = records.len(), "renewing expiring subscriptions");

        for rec in records {
            let Some(client) = self.clients.get(&rec.tenant_alias) else {
                error!(tenant = %rec.tenant_alias, "no graph client for tenant");
                continue;
            };

            if let Err(e) = self.renew_subscription(client, &rec).await {
                error!(
                    subscription_id = %rec.subscription_id,
                    tenant = %rec.tenant_alias,
                    user = %rec.user_id,
                    error = %e,
                    "renewal failed"
                );
            }
        }
    }

    fn find_tenant(&self, alias: &str) -> Option<&TenantConfig> {
        self.tenants.iter().find(|t| t.alias == alias)
    }

    fn fire_gap_hook(&self, tenant_id: TenantId, user_id: UserId) {
        let hook = self.on_gap.read().expect("gap hook lock poisoned").clone();
        if let Some(hook) = hook {
            hook(tenant_id, user_id);
        }
    }
}

#[async_trait]
impl LifecycleSink for LifecycleManager {
    async fn handle_lifecycle_event(&self, event: &str, subscription_id: &str, tenant_alias: &str) {
        let subscription_id = SubscriptionId::new(subscription_id);

        match event {
            "subscriptionRemoved" => {
                warn!(
                    subscription_id = %subscription_id,
                    tenant = %tenant_alias,
                    "subscription removed by provider"
                );
                // Re-creation happens on the next renewal tick.
                if let Err(e) = self
                    .store
                    .mark_status(&subscription_id, SubscriptionStatus::Removed)
                    .await
                {
                    error!(error = %e, "failed to mark subscription removed");
                }
            }

            "reauthorizationRequired" => {
                info!(
                    subscription_id = %subscription_id,
                    tenant = %tenant_alias,
                    "reauthorization required"
                );
                // Token refresh is the transport's job; renewing the
                // subscription immediately is ours.
                let rec = match self.store.get_by_subscription_id(&subscription_id).await {
                    Ok(Some(rec)) => rec,
                    Ok(None) => {
                        error!(
                            subscription_id = %subscription_id,
                            "no record for reauthorization event"
                        );
                        return;
                    }
                    Err(e) => {
                        error!(error = %e, "lookup failed for reauthorization event");
                        return;
                    }
                };

                let Some(client) = self.clients.get(&rec.tenant_alias) else {
                    error!(tenant = %rec.tenant_alias, "no graph client for tenant");
                    return;
                };

                if let Err(e) = self.renew_subscription(client, &rec).await {
                    error!(
                        subscription_id = %rec.subscription_id,
                        error = %e,
                        "reauthorization renewal failed"
                    );
                }
            }

            "missed" => {
                warn!(
                    subscription_id = %subscription_id,
                    tenant = %tenant_alias,
                    "missed notifications detected"
                );
                match self.store.get_by_subscription_id(&subscription_id).await {
                    Ok(Some(rec)) => {
                        self.fire_gap_hook(rec.tenant_id, rec.user_id);
                    }
                    Ok(None) => {
                        warn!(
                            subscription_id = %subscription_id,
                            "no record for missed event; periodic sweep will catch up"
                        );
                    }
                    Err(e) => {
                        error!(error = %e, "lookup failed for missed event");
                    }
                }
            }

            other => {
                warn!(event = %other, "unknown lifecycle event");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(status: SubscriptionStatus, expires_at: DateTime<Utc>) -> SubscriptionRecord {
        SubscriptionRecord {
            id: 1,
            subscription_id: SubscriptionId::new("sub-1"),
            user_id: UserId::new("u1@example.com"),
            tenant_id: TenantId::new("t1"),
            tenant_alias: "acme".to_string(),
            client_state: "secret".to_string(),
            expires_at,
            delta_token: String::new(),
            last_push_observed: None,
            last_delta_sync: None,
            status,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    // ─── plan_subscription ───

    #[test]
    fn missing_record_plans_create() {
        let action = plan_subscription(None, Utc::now(), ChronoDuration::hours(1));
        assert_eq!(action, SubscriptionAction::Create);
    }

    #[test]
    fn removed_record_plans_create() {
        let now = Utc::now();
        let rec = record(SubscriptionStatus::Removed, now + ChronoDuration::days(2));
        let action = plan_subscription(Some(&rec), now, ChronoDuration::hours(1));
        assert_eq!(action, SubscriptionAction::Create);
    }

    #[test]
    fn healthy_record_plans_keep() {
        let now = Utc::now();
        let rec = record(SubscriptionStatus::Active, now + ChronoDuration::days(2));
        let action = plan_subscription(Some(&rec), now, ChronoDuration::hours(1));
        assert_eq!(action, SubscriptionAction::Keep);
    }

    #[test]
    fn near_expiry_record_plans_renew() {
        let now = Utc::now();
        let rec = record(SubscriptionStatus::Active, now + ChronoDuration::minutes(30));
        let action = plan_subscription(Some(&rec), now, ChronoDuration::hours(1));
        assert_eq!(action, SubscriptionAction::Renew);
    }

    #[test]
    fn expiry_exactly_at_buffer_boundary_renews() {
        let now = Utc::now();
        let buffer = ChronoDuration::hours(1);
        let rec = record(SubscriptionStatus::Active, now + buffer);
        let action = plan_subscription(Some(&rec), now, buffer);
        assert_eq!(action, SubscriptionAction::Renew);
    }

    #[test]
    fn already_expired_active_record_plans_renew() {
        let now = Utc::now();
        let rec = record(SubscriptionStatus::Active, now - ChronoDuration::minutes(5));
        let action = plan_subscription(Some(&rec), now, ChronoDuration::hours(1));
        assert_eq!(action, SubscriptionAction::Renew);
    }

    // ─── constants and helpers ───

    #[test]
    fn max_subscription_lifetime_matches_provider_limit() {
        assert_eq!(MAX_SUBSCRIPTION_MINUTES, 4230);
        // ~70.5 hours.
        let hours = MAX_SUBSCRIPTION_MINUTES as f64 / 60.0;
        assert!((70.0..71.0).contains(&hours));
    }

    #[test]
    fn renewal_interval_is_half_the_buffer() {
        assert_eq!(
            renewal_interval(Duration::from_secs(3600)),
            Duration::from_secs(1800)
        );
    }

    #[test]
    fn renewal_interval_is_floored_at_one_minute() {
        assert_eq!(
            renewal_interval(Duration::from_secs(30)),
            Duration::from_secs(60)
        );
    }

    #[test]
    fn client_state_is_32_hex_chars_and_unique() {
        let a = generate_client_state();
        let b = generate_client_state();

        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn subscription_urls_are_mailbox_scoped() {
        let (notify, lifecycle) = subscription_urls(
            "https://hooks.example.com",
            "acme",
            &UserId::new("u1@acme.example"),
        );
        assert_eq!(
            notify,
            "https://hooks.example.com/webhook/acme/u1@acme.example"
        );
        assert_eq!(lifecycle, "https://hooks.example.com/lifecycle/acme");
    }

    #[test]
    fn hex_encode_is_lowercase_pairs() {
        assert_eq!(hex_encode(&[0x00, 0xab, 0xff]), "00abff");
    }
}
