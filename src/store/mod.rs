//! Durable subscription state, backed by Postgres.
//!
//! One row per (tenant, user) is the unit of ingestion progress: the
//! provider-assigned subscription id, the shared secret echoed on every
//! notification, the expiry driving the renewal loop, and the opaque delta
//! token driving catch-up. Every write here must survive a process crash -
//! the renewal loop and the delta synchroniser both restart from this table.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

use crate::types::{SubscriptionId, TenantId, UserId};

/// Errors from the subscription store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("unknown subscription status {0:?}")]
    UnknownStatus(String),
}

/// Lifecycle state of a subscription row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionStatus {
    Active,
    Expired,
    Removed,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Expired => "expired",
            SubscriptionStatus::Removed => "removed",
        }
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubscriptionStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(SubscriptionStatus::Active),
            "expired" => Ok(SubscriptionStatus::Expired),
            "removed" => Ok(SubscriptionStatus::Removed),
            other => Err(StoreError::UnknownStatus(other.to_string())),
        }
    }
}

/// A subscription row as persisted.
#[derive(Debug, Clone)]
pub struct SubscriptionRecord {
    pub id: i64,
    pub subscription_id: SubscriptionId,
    pub user_id: UserId,
    pub tenant_id: TenantId,
    pub tenant_alias: String,
    pub client_state: String,
    pub expires_at: DateTime<Utc>,
    pub delta_token: String,
    pub last_push_observed: Option<DateTime<Utc>>,
    pub last_delta_sync: Option<DateTime<Utc>>,
    pub status: SubscriptionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The fields written on create/re-create; the rest of the row is
/// database-managed.
#[derive(Debug, Clone)]
pub struct NewSubscription {
    pub subscription_id: SubscriptionId,
    pub user_id: UserId,
    pub tenant_id: TenantId,
    pub tenant_alias: String,
    pub client_state: String,
    pub expires_at: DateTime<Utc>,
    pub status: SubscriptionStatus,
}

/// Lookup surface the notification ingress needs; split out as a trait so
/// handler tests run without a live database.
#[async_trait]
pub trait SubscriptionDirectory: Send + Sync {
    async fn find(
        &self,
        tenant: &TenantId,
        user: &UserId,
    ) -> Result<Option<SubscriptionRecord>, StoreError>;

    async fn touch_push_observed(
        &self,
        tenant: &TenantId,
        user: &UserId,
    ) -> Result<(), StoreError>;
}

/// Write surface the delta synchroniser needs for token persistence.
#[async_trait]
pub trait TokenSink: Send + Sync {
    async fn save_delta_token(
        &self,
        tenant: &TenantId,
        user: &UserId,
        token: &str,
    ) -> Result<(), StoreError>;
}

/// CRUD operations for subscription rows in Postgres.
pub struct SubscriptionStore {
    pool: PgPool,
}

const SELECT_COLUMNS: &str = "id, subscription_id, user_id, tenant_id, tenant_alias, \
     client_state, expires_at, delta_token, last_push_observed, \
     last_delta_sync, status, created_at, updated_at";

impl SubscriptionStore {
    /// Creates a store over an existing pool, ensuring the schema exists.
    pub async fn new(pool: PgPool) -> Result<Self, StoreError> {
        let store = SubscriptionStore { pool };
        store.ensure_schema().await?;
        info!("subscription store initialised");
        Ok(store)
    }

    /// Returns the underlying pool (health checks, shutdown).
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS subscriptions (
                id                 BIGSERIAL PRIMARY KEY,
                subscription_id    TEXT NOT NULL UNIQUE,
                user_id            TEXT NOT NULL,
                tenant_id          TEXT NOT NULL,
                tenant_alias       TEXT NOT NULL DEFAULT '',
                client_state       TEXT NOT NULL,
                expires_at         TIMESTAMPTZ NOT NULL,
                delta_token        TEXT NOT NULL DEFAULT '',
                last_push_observed TIMESTAMPTZ,
                last_delta_sync    TIMESTAMPTZ,
                status             TEXT NOT NULL DEFAULT 'active',
                created_at         TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at         TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                UNIQUE (tenant_id, user_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        for stmt in [
            "CREATE INDEX IF NOT EXISTS idx_subs_tenant ON subscriptions (tenant_id)",
            "CREATE INDEX IF NOT EXISTS idx_subs_expires ON subscriptions (expires_at)",
            "CREATE INDEX IF NOT EXISTS idx_subs_status ON subscriptions (status)",
        ] {
            sqlx::query(stmt).execute(&self.pool).await?;
        }

        Ok(())
    }

    /// Inserts or updates a subscription keyed on (tenant, user). On
    /// conflict the provider-assigned id, secret, expiry, and status are
    /// replaced and `updated_at` is bumped; the delta token is preserved.
    pub async fn upsert(&self, sub: &NewSubscription) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO subscriptions
                (subscription_id, user_id, tenant_id, tenant_alias, client_state, expires_at, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (tenant_id, user_id) DO UPDATE SET
                subscription_id = EXCLUDED.subscription_id,
                client_state    = EXCLUDED.client_state,
                expires_at      = EXCLUDED.expires_at,
                status          = EXCLUDED.status,
                updated_at      = NOW()
            "#,
        )
        .bind(sub.subscription_id.as_str())
        .bind(sub.user_id.as_str())
        .bind(sub.tenant_id.as_str())
        .bind(&sub.tenant_alias)
        .bind(&sub.client_state)
        .bind(sub.expires_at)
        .bind(sub.status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Retrieves the subscription for a (tenant, user), if any.
    pub async fn get(
        &self,
        tenant: &TenantId,
        user: &UserId,
    ) -> Result<Option<SubscriptionRecord>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM subscriptions WHERE tenant_id = $1 AND user_id = $2"
        ))
        .bind(tenant.as_str())
        .bind(user.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| record_from_row(&r)).transpose()
    }

    /// Retrieves a subscription by its provider-assigned id. Lifecycle
    /// events identify subscriptions this way only.
    pub async fn get_by_subscription_id(
        &self,
        subscription_id: &SubscriptionId,
    ) -> Result<Option<SubscriptionRecord>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM subscriptions WHERE subscription_id = $1"
        ))
        .bind(subscription_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| record_from_row(&r)).transpose()
    }

    /// Returns all subscriptions for a tenant, ordered by user.
    pub async fn list_by_tenant(
        &self,
        tenant: &TenantId,
    ) -> Result<Vec<SubscriptionRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM subscriptions WHERE tenant_id = $1 ORDER BY user_id"
        ))
        .bind(tenant.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(record_from_row).collect()
    }

    /// Returns active subscriptions expiring within the buffer, soonest
    /// first.
    pub async fn list_expiring_soon(
        &self,
        buffer: Duration,
    ) -> Result<Vec<SubscriptionRecord>, StoreError> {
        let cutoff = Utc::now() + chrono::Duration::from_std(buffer).unwrap_or_default();

        let rows = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM subscriptions \
             WHERE status = 'active' AND expires_at < $1 ORDER BY expires_at"
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(record_from_row).collect()
    }

    /// Persists the delta token for a mailbox and stamps `last_delta_sync`.
    pub async fn save_delta_token(
        &self,
        tenant: &TenantId,
        user: &UserId,
        token: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE subscriptions \
             SET delta_token = $1, last_delta_sync = NOW(), updated_at = NOW() \
             WHERE tenant_id = $2 AND user_id = $3",
        )
        .bind(token)
        .bind(tenant.as_str())
        .bind(user.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Updates the expiry after a successful renewal.
    pub async fn update_expiry(
        &self,
        subscription_id: &SubscriptionId,
        new_expiry: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE subscriptions SET expires_at = $1, updated_at = NOW() \
             WHERE subscription_id = $2",
        )
        .bind(new_expiry)
        .bind(subscription_id.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Sets the status of a subscription.
    pub async fn mark_status(
        &self,
        subscription_id: &SubscriptionId,
        status: SubscriptionStatus,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE subscriptions SET status = $1, updated_at = NOW() \
             WHERE subscription_id = $2",
        )
        .bind(status.as_str())
        .bind(subscription_id.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Stamps `last_push_observed` for a mailbox.
    pub async fn touch_push_observed(
        &self,
        tenant: &TenantId,
        user: &UserId,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE subscriptions \
             SET last_push_observed = NOW(), updated_at = NOW() \
             WHERE tenant_id = $1 AND user_id = $2",
        )
        .bind(tenant.as_str())
        .bind(user.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Removes a subscription row (operator cleanup).
    pub async fn delete(&self, tenant: &TenantId, user: &UserId) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM subscriptions WHERE tenant_id = $1 AND user_id = $2")
            .bind(tenant.as_str())
            .bind(user.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Checks database connectivity.
    pub async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl SubscriptionDirectory for SubscriptionStore {
    async fn find(
        &self,
        tenant: &TenantId,
        user: &UserId,
    ) -> Result<Option<SubscriptionRecord>, StoreError> {
        self.get(tenant, user).await
    }

    async fn touch_push_observed(
        &self,
        tenant: &TenantId,
        user: &UserId,
    ) -> Result<(), StoreError> {
        SubscriptionStore::touch_push_observed(self, tenant, user).await
    }
}

#[async_trait]
impl TokenSink for SubscriptionStore {
    async fn save_delta_token(
        &self,
        tenant: &TenantId,
        user: &UserId,
        token: &str,
    ) -> Result<(), StoreError> {
        SubscriptionStore::save_delta_token(self, tenant, user, token).await
    }
}

fn record_from_row(row: &PgRow) -> Result<SubscriptionRecord, StoreError> {
    let status_raw: String = row.try_get("status")?;

    Ok(SubscriptionRecord {
        id: row.try_get("id")?,
        subscription_id: SubscriptionId::new(row.try_get::<String, _>("subscription_id")?),
        user_id: UserId::new(row.try_get::<String, _>("user_id")?),
        tenant_id: TenantId::new(row.try_get::<String, _>("tenant_id")?),
        tenant_alias: row.try_get("tenant_alias")?,
        client_state: row.try_get("client_state")?,
        expires_at: row.try_get("expires_at")?,
        delta_token: row.try_get("delta_token")?,
        last_push_observed: row.try_get("last_push_observed")?,
        last_delta_sync: row.try_get("last_delta_sync")?,
        status: status_raw.parse()?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}
