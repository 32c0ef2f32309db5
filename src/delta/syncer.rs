//! Delta synchroniser: detects and delivers messages push notifications
//! would have missed.
//!
//! Serves four gap sources: newly created subscriptions, missed lifecycle
//! events, expired delta tokens, and cold start. State is an in-memory map
//! of (tenant, user) → opaque delta token, rehydrated from the subscription
//! store at startup and written back store-first on every advance - if the
//! persist fails the cache is not updated and the next tick retries the
//! same page, which is what makes restarts at-least-once.
//!
//! An initial sync only acquires an anchor token; it deliberately publishes
//! nothing (history is the backfill tool's job). An incremental sync walks
//! pages from the cached token through the shared delivery pipeline.
//! HTTP 410 on any page means the token has expired upstream: both the
//! cached and the persisted token are dropped and an initial sync runs,
//! accepting the data-loss window (operator-triggered backfill recovers it
//! if required).

use reqwest::{Method, StatusCode};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::TenantConfig;
use crate::discovery::TenantRoster;
use crate::graph::error::body_excerpt;
use crate::graph::{GraphClient, GraphClients, GraphError};
use crate::pipeline::{Deliver, Origin, Outcome};
use crate::store::{StoreError, TokenSink};
use crate::types::{MessageId, TenantId, UserId};

/// Errors from delta synchronisation.
#[derive(Debug, Error)]
pub enum DeltaError {
    /// The delta token has expired upstream (HTTP 410 Gone).
    #[error("delta token expired (410 Gone)")]
    TokenExpired,

    #[error("no graph client for tenant alias {0:?}")]
    UnknownTenant(String),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("delta query returned HTTP {status}")]
    Status { status: u16 },

    #[error("decode delta page: {0}")]
    Decode(#[source] serde_json::Error),

    /// A traversal finished without the provider ever handing us a token.
    #[error("initial delta sync completed without receiving a deltaLink")]
    MissingDeltaLink,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A page of the `/messages/delta` response.
#[derive(Debug, Deserialize)]
struct DeltaPage {
    #[serde(default)]
    value: Vec<DeltaMessage>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
    #[serde(rename = "@odata.deltaLink")]
    delta_link: Option<String>,
}

/// A minimal message entry from the delta query.
#[derive(Debug, Deserialize)]
struct DeltaMessage {
    #[serde(default)]
    id: String,
    #[serde(rename = "@removed")]
    removed: Option<RemovedMarker>,
}

#[derive(Debug, Deserialize)]
struct RemovedMarker {
    #[serde(default)]
    #[allow(dead_code)]
    reason: String,
}

/// Configuration for the delta syncer.
pub struct SyncerConfig {
    pub clients: GraphClients,
    pub graph_base_url: String,
    pub pipeline: Arc<dyn Deliver>,
    pub store: Arc<dyn TokenSink>,
    pub tenants: Vec<TenantConfig>,
    pub sync_interval: Duration,
}

/// Catch-up synchronisation via delta queries.
pub struct DeltaSyncer {
    clients: GraphClients,
    graph_base_url: String,
    pipeline: Arc<dyn Deliver>,
    store: Arc<dyn TokenSink>,

    /// tenant:user → delta token. Guarded for short, non-await reads.
    tokens: RwLock<HashMap<String, String>>,

    /// tenant id → alias, for resolving gap-hook invocations.
    alias_by_tenant: HashMap<TenantId, String>,

    sync_interval: Duration,
    cancel: CancellationToken,
    sweep_task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

fn token_key(tenant_id: &TenantId, user_id: &UserId) -> String {
    format!("{tenant_id}:{user_id}")
}

impl DeltaSyncer {
    pub fn new(cfg: SyncerConfig) -> Self {
        let alias_by_tenant = cfg
            .tenants
            .iter()
            .map(|t| (TenantId::new(&t.tenant_id), t.alias.clone()))
            .collect();

        DeltaSyncer {
            clients: cfg.clients,
            graph_base_url: cfg.graph_base_url,
            pipeline: cfg.pipeline,
            store: cfg.store,
            tokens: RwLock::new(HashMap::new()),
            alias_by_tenant,
            sync_interval: cfg.sync_interval,
            cancel: CancellationToken::new(),
            sweep_task: tokio::sync::Mutex::new(None),
        }
    }

    /// Seeds a cached delta token (hydration from the store at startup).
    pub fn set_delta_token(&self, tenant_id: &TenantId, user_id: &UserId, token: &str) {
        self.tokens
            .write()
            .expect("token cache lock poisoned")
            .insert(token_key(tenant_id, user_id), token.to_string());
    }

    fn cached_token(&self, tenant_id: &TenantId, user_id: &UserId) -> Option<String> {
        self.tokens
            .read()
            .expect("token cache lock poisoned")
            .get(&token_key(tenant_id, user_id))
            .cloned()
    }

    /// Synchronises one mailbox: an initial sync when no token is cached,
    /// an incremental sync otherwise.
    pub async fn sync_mailbox(
        &self,
        tenant_id: &TenantId,
        tenant_alias: &str,
        user_id: &UserId,
    ) -> Result<(), DeltaError> {
        let client = self
            .clients
            .get(tenant_alias)
            .ok_or_else(|| DeltaError::UnknownTenant(tenant_alias.to_string()))?
            .clone();

        match self.cached_token(tenant_id, user_id) {
            None => self.initial_sync(&client, tenant_id, tenant_alias, user_id).await,
            Some(token) => {
                self.incremental_sync(&client, tenant_id, tenant_alias, user_id, token)
                    .await
            }
        }
    }

    /// Immediately synchronises the mailbox behind a gap signal, on its own
    /// task. Wired as the lifecycle manager's gap hook.
    pub fn spawn_gap_sync(self: &Arc<Self>, tenant_id: TenantId, user_id: UserId) {
        let Some(alias) = self.alias_by_tenant.get(&tenant_id).cloned() else {
            warn!(tenant = %tenant_id, "gap sync requested for unknown tenant");
            return;
        };

        let syncer = Arc::clone(self);
        tokio::spawn(async move {
            info!(tenant = %alias, user = %user_id, "gap-recovery delta sync");
            if let Err(e) = syncer.sync_mailbox(&tenant_id, &alias, &user_id).await {
                error!(
                    tenant = %alias,
                    user = %user_id,
                    error = %e,
                    "gap-recovery delta sync failed"
                );
            }
        });
    }

    /// Starts the periodic sweep over every mailbox in the roster.
    pub async fn start_periodic_sweep(self: &Arc<Self>, roster: Vec<TenantRoster>) {
        let syncer = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(syncer.sync_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // Skip the interval's immediate first fire; startup already
            // scheduled gap syncs for anything new.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = syncer.cancel.cancelled() => return,
                    _ = ticker.tick() => syncer.sweep_once(&roster).await,
                }
            }
        });
        *self.sweep_task.lock().await = Some(handle);

        info!(
            interval_secs = self.sync_interval.as_secs(),
            "periodic delta sweep started"
        );
    }

    /// Cancels the sweep loop and waits for it to exit.
    pub async fn stop(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.sweep_task.lock().await.take() {
            let _ = handle.await;
        }
        info!("delta syncer stopped");
    }

    /// One sweep pass: every tenant, every user, sequentially. One
    /// mailbox's failure never blocks the others.
    async fn sweep_once(&self, roster: &[TenantRoster]) {
        for tenant in roster {
            for user_id in &tenant.users {
                if self.cancel.is_cancelled() {
                    return;
                }
                if let Err(e) = self
                    .sync_mailbox(&tenant.tenant_id, &tenant.tenant_alias, user_id)
                    .await
                {
                    error!(
                        tenant = %tenant.tenant_alias,
                        user = %user_id,
                        error = %e,
                        "periodic delta sync failed"
                    );
                }
            }
        }
    }

    /// Pages through the delta endpoint to acquire an anchor token without
    /// backfilling history. Messages seen along the way are intentionally
    /// not published.
    async fn initial_sync(
        &self,
        client: &GraphClient,
        tenant_id: &TenantId,
        tenant_alias: &str,
        user_id: &UserId,
    ) -> Result<(), DeltaError> {
        info!(
            tenant = %tenant_alias,
            user = %user_id,
            "starting initial delta sync (collecting token)"
        );

        let mut url = format!(
            "{}/users/{}/messages/delta?$select=id",
            self.graph_base_url, user_id
        );

        loop {
            let page = self.fetch_delta_page(client, &url).await?;

            if let Some(delta_link) = page.delta_link {
                return self.save_token(tenant_id, user_id, &delta_link).await;
            }

            match page.next_link {
                Some(next) => url = next,
                None => return Err(DeltaError::MissingDeltaLink),
            }
        }
    }

    /// Processes all changes since the cached token, following pages until
    /// the provider hands back a terminal token.
    async fn incremental_sync(
        &self,
        client: &GraphClient,
        tenant_id: &TenantId,
        tenant_alias: &str,
        user_id: &UserId,
        start_token: String,
    ) -> Result<(), DeltaError> {
        debug!(tenant = %tenant_alias, user = %user_id, "starting incremental delta sync");

        let mut url = start_token;
        let mut total_new = 0usize;

        loop {
            let page = match self.fetch_delta_page(client, &url).await {
                Ok(page) => page,
                Err(DeltaError::TokenExpired) => {
                    warn!(
                        tenant = %tenant_alias,
                        user = %user_id,
                        "delta token expired (410 Gone), performing full re-sync"
                    );
                    self.clear_token(tenant_id, user_id).await?;
                    return self.initial_sync(client, tenant_id, tenant_alias, user_id).await;
                }
                Err(e) => return Err(e),
            };

            for msg in &page.value {
                // Tombstones carry no content to ingest.
                if msg.removed.is_some() {
                    continue;
                }

                let message_id = MessageId::new(&msg.id);
                match self
                    .pipeline
                    .deliver(tenant_id, tenant_alias, user_id, &message_id, Origin::Delta)
                    .await
                {
                    Ok(Outcome::Published) => total_new += 1,
                    Ok(Outcome::Duplicate) | Ok(Outcome::Missing) => {}
                    Err(e) => {
                        error!(
                            tenant = %tenant_alias,
                            user = %user_id,
                            message = %message_id,
                            error = %e,
                            "delta sync: delivery failed"
                        );
                    }
                }
            }

            if let Some(delta_link) = page.delta_link {
                self.save_token(tenant_id, user_id, &delta_link).await?;
                break;
            }

            match page.next_link {
                Some(next) => url = next,
                None => break,
            }
        }

        info!(
            tenant = %tenant_alias,
            user = %user_id,
            new_messages = total_new,
            "incremental delta sync complete"
        );

        Ok(())
    }

    async fn fetch_delta_page(
        &self,
        client: &GraphClient,
        url: &str,
    ) -> Result<DeltaPage, DeltaError> {
        let response = client
            .request(Method::GET, url)
            .await?
            .header("Prefer", "odata.maxpagesize=100")
            .send()
            .await
            .map_err(GraphError::from)?;

        if response.status() == StatusCode::GONE {
            return Err(DeltaError::TokenExpired);
        }

        let status = response.status();
        let body = response.text().await.map_err(GraphError::from)?;
        if !status.is_success() {
            error!(
                status = status.as_u16(),
                body = %body_excerpt(&body),
                "delta query error"
            );
            return Err(DeltaError::Status {
                status: status.as_u16(),
            });
        }

        serde_json::from_str(&body).map_err(DeltaError::Decode)
    }

    /// Persists a token store-first, then updates the cache. The order is
    /// the at-least-once guarantee: a failed persist leaves the cache on
    /// the old token so the next tick replays the page.
    async fn save_token(
        &self,
        tenant_id: &TenantId,
        user_id: &UserId,
        token: &str,
    ) -> Result<(), DeltaError> {
        self.store.save_delta_token(tenant_id, user_id, token).await?;
        self.set_delta_token(tenant_id, user_id, token);
        debug!(tenant = %tenant_id, user = %user_id, "delta token saved");
        Ok(())
    }

    /// Drops an expired token from both the store and the cache.
    async fn clear_token(&self, tenant_id: &TenantId, user_id: &UserId) -> Result<(), DeltaError> {
        self.store.save_delta_token(tenant_id, user_id, "").await?;
        self.tokens
            .write()
            .expect("token cache lock poisoned")
            .remove(&token_key(tenant_id, user_id));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::Router;
    use axum::routing::get;
    use std::sync::Mutex;

    use crate::pipeline::PipelineError;

    // ─── test doubles ───

    /// Records every delivery request; always reports `Published`.
    #[derive(Default)]
    struct RecordingPipeline {
        calls: Mutex<Vec<(String, String, String, Origin)>>,
    }

    #[async_trait]
    impl Deliver for RecordingPipeline {
        async fn deliver(
            &self,
            _tenant_id: &TenantId,
            tenant_alias: &str,
            user_id: &UserId,
            message_id: &MessageId,
            origin: Origin,
        ) -> Result<Outcome, PipelineError> {
            self.calls.lock().unwrap().push((
                tenant_alias.to_string(),
                user_id.to_string(),
                message_id.to_string(),
                origin,
            ));
            Ok(Outcome::Published)
        }
    }

    /// In-memory token sink.
    #[derive(Default)]
    struct MemorySink {
        tokens: Mutex<HashMap<String, String>>,
    }

    impl MemorySink {
        fn token(&self, tenant: &str, user: &str) -> Option<String> {
            self.tokens
                .lock()
                .unwrap()
                .get(&format!("{tenant}:{user}"))
                .cloned()
        }
    }

    #[async_trait]
    impl TokenSink for MemorySink {
        async fn save_delta_token(
            &self,
            tenant: &TenantId,
            user: &UserId,
            token: &str,
        ) -> Result<(), StoreError> {
            self.tokens
                .lock()
                .unwrap()
                .insert(format!("{tenant}:{user}"), token.to_string());
            Ok(())
        }
    }

    fn tenant_config() -> TenantConfig {
        TenantConfig {
            alias: "acme".to_string(),
            tenant_id: "t1".to_string(),
            client_id: "c".to_string(),
            client_secret: "s".to_string(),
            include_users: vec![],
            exclude_users: vec![],
        }
    }

    async fn spawn_stub(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn syncer_for(
        base: &str,
        pipeline: Arc<RecordingPipeline>,
        sink: Arc<MemorySink>,
    ) -> Arc<DeltaSyncer> {
        let mut clients: GraphClients = HashMap::new();
        clients.insert(
            "acme".to_string(),
            Arc::new(GraphClient::with_static_token("test")),
        );

        Arc::new(DeltaSyncer::new(SyncerConfig {
            clients,
            graph_base_url: base.to_string(),
            pipeline,
            store: sink,
            tenants: vec![tenant_config()],
            sync_interval: Duration::from_secs(3600),
        }))
    }

    // ─── token cache ───

    #[tokio::test]
    async fn set_delta_token_caches_by_tenant_and_user() {
        let syncer = syncer_for(
            "http://unused.invalid",
            Arc::new(RecordingPipeline::default()),
            Arc::new(MemorySink::default()),
        );

        let tenant = TenantId::new("t1");
        let user = UserId::new("u1");
        syncer.set_delta_token(&tenant, &user, "delta://token1");

        assert_eq!(
            syncer.cached_token(&tenant, &user).as_deref(),
            Some("delta://token1")
        );
        assert!(syncer.cached_token(&tenant, &UserId::new("u2")).is_none());
    }

    // ─── initial sync ───

    #[tokio::test]
    async fn initial_sync_collects_the_token_without_publishing() {
        let router = Router::new()
            .route(
                "/users/{user}/messages/delta",
                get(|req: axum::extract::Request| async move {
                    let host = req
                        .headers()
                        .get("host")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default()
                        .to_string();
                    axum::Json(serde_json::json!({
                        "value": [{"id": "m1"}, {"id": "m2"}],
                        "@odata.nextLink": format!("http://{host}/page2")
                    }))
                }),
            )
            .route(
                "/page2",
                get(|| async {
                    axum::Json(serde_json::json!({
                        "value": [],
                        "@odata.deltaLink": "delta://final-token"
                    }))
                }),
            );
        let base = spawn_stub(router).await;

        let pipeline = Arc::new(RecordingPipeline::default());
        let sink = Arc::new(MemorySink::default());
        let syncer = syncer_for(&base, Arc::clone(&pipeline), Arc::clone(&sink));

        let tenant = TenantId::new("t1");
        let user = UserId::new("u1");
        syncer.sync_mailbox(&tenant, "acme", &user).await.unwrap();

        // Token persisted and cached; history not published.
        assert_eq!(sink.token("t1", "u1").as_deref(), Some("delta://final-token"));
        assert_eq!(
            syncer.cached_token(&tenant, &user).as_deref(),
            Some("delta://final-token")
        );
        assert!(pipeline.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn initial_sync_twice_is_idempotent_on_the_stored_token() {
        let router = Router::new().route(
            "/users/{user}/messages/delta",
            get(|| async {
                axum::Json(serde_json::json!({
                    "value": [],
                    "@odata.deltaLink": "delta://stable-token"
                }))
            }),
        );
        let base = spawn_stub(router).await;

        let sink = Arc::new(MemorySink::default());
        let syncer = syncer_for(
            &base,
            Arc::new(RecordingPipeline::default()),
            Arc::clone(&sink),
        );

        let tenant = TenantId::new("t1");
        let user = UserId::new("u1");

        // Force initial sync twice by clearing the cache between runs.
        syncer.sync_mailbox(&tenant, "acme", &user).await.unwrap();
        syncer.tokens.write().unwrap().clear();
        syncer.sync_mailbox(&tenant, "acme", &user).await.unwrap();

        assert_eq!(sink.token("t1", "u1").as_deref(), Some("delta://stable-token"));
    }

    #[tokio::test]
    async fn initial_sync_without_a_delta_link_is_an_error() {
        let router = Router::new().route(
            "/users/{user}/messages/delta",
            get(|| async { axum::Json(serde_json::json!({"value": []})) }),
        );
        let base = spawn_stub(router).await;

        let syncer = syncer_for(
            &base,
            Arc::new(RecordingPipeline::default()),
            Arc::new(MemorySink::default()),
        );

        let err = syncer
            .sync_mailbox(&TenantId::new("t1"), "acme", &UserId::new("u1"))
            .await
            .unwrap_err();
        assert!(matches!(err, DeltaError::MissingDeltaLink));
    }

    // ─── incremental sync ───

    #[tokio::test]
    async fn incremental_sync_delivers_live_messages_and_skips_tombstones() {
        let router = Router::new()
            .route(
                "/delta-start",
                get(|req: axum::extract::Request| async move {
                    let host = req
                        .headers()
                        .get("host")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default()
                        .to_string();
                    axum::Json(serde_json::json!({
                        "value": [
                            {"id": "m1"},
                            {"id": "m2", "@removed": {"reason": "deleted"}},
                            {"id": "m3"}
                        ],
                        "@odata.nextLink": format!("http://{host}/delta-next")
                    }))
                }),
            )
            .route(
                "/delta-next",
                get(|| async {
                    axum::Json(serde_json::json!({
                        "value": [{"id": "m4"}],
                        "@odata.deltaLink": "delta://advanced-token"
                    }))
                }),
            );
        let base = spawn_stub(router).await;

        let pipeline = Arc::new(RecordingPipeline::default());
        let sink = Arc::new(MemorySink::default());
        let syncer = syncer_for(&base, Arc::clone(&pipeline), Arc::clone(&sink));

        let tenant = TenantId::new("t1");
        let user = UserId::new("u1");
        syncer.set_delta_token(&tenant, &user, &format!("{base}/delta-start"));

        syncer.sync_mailbox(&tenant, "acme", &user).await.unwrap();

        let calls = pipeline.calls.lock().unwrap();
        let ids: Vec<&str> = calls.iter().map(|c| c.2.as_str()).collect();
        assert_eq!(ids, vec!["m1", "m3", "m4"]);
        assert!(calls.iter().all(|c| c.3 == Origin::Delta));
        drop(calls);

        assert_eq!(
            sink.token("t1", "u1").as_deref(),
            Some("delta://advanced-token")
        );
        assert_eq!(
            syncer.cached_token(&tenant, &user).as_deref(),
            Some("delta://advanced-token")
        );
    }

    #[tokio::test]
    async fn expired_token_triggers_recovery_initial_sync() {
        // The expired-token URL answers 410; the initial-sync endpoint hands
        // out a fresh token.
        let router = Router::new()
            .route(
                "/delta-expired",
                get(|| async { axum::http::StatusCode::GONE }),
            )
            .route(
                "/users/{user}/messages/delta",
                get(|| async {
                    axum::Json(serde_json::json!({
                        "value": [{"id": "m-old"}],
                        "@odata.deltaLink": "delta://fresh-token"
                    }))
                }),
            );
        let base = spawn_stub(router).await;

        let pipeline = Arc::new(RecordingPipeline::default());
        let sink = Arc::new(MemorySink::default());
        let syncer = syncer_for(&base, Arc::clone(&pipeline), Arc::clone(&sink));

        let tenant = TenantId::new("t1");
        let user = UserId::new("u1");
        syncer.set_delta_token(&tenant, &user, &format!("{base}/delta-expired"));

        syncer.sync_mailbox(&tenant, "acme", &user).await.unwrap();

        // Old token dropped, fresh anchor persisted, nothing published
        // during the recovery window.
        assert_eq!(sink.token("t1", "u1").as_deref(), Some("delta://fresh-token"));
        assert_eq!(
            syncer.cached_token(&tenant, &user).as_deref(),
            Some("delta://fresh-token")
        );
        assert!(pipeline.calls.lock().unwrap().is_empty());
    }

    // ─── wiring ───

    #[tokio::test]
    async fn unknown_tenant_alias_is_an_error() {
        let syncer = syncer_for(
            "http://unused.invalid",
            Arc::new(RecordingPipeline::default()),
            Arc::new(MemorySink::default()),
        );

        let err = syncer
            .sync_mailbox(&TenantId::new("t1"), "nobody", &UserId::new("u1"))
            .await
            .unwrap_err();
        assert!(matches!(err, DeltaError::UnknownTenant(alias) if alias == "nobody"));
    }

    #[tokio::test]
    async fn stop_returns_promptly() {
        let syncer = syncer_for(
            "http://unused.invalid",
            Arc::new(RecordingPipeline::default()),
            Arc::new(MemorySink::default()),
        );

        syncer
            .start_periodic_sweep(vec![TenantRoster {
                tenant_id: TenantId::new("t1"),
                tenant_alias: "acme".to_string(),
                users: vec![UserId::new("u1")],
            }])
            .await;

        tokio::time::timeout(Duration::from_secs(2), syncer.stop())
            .await
            .expect("stop() should not hang");
    }
}
