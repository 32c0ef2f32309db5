//! mailfeed ingestion service - entry point.
//!
//! Startup order is a contract, not a convenience:
//!
//! 1. Per-tenant authenticated transports.
//! 2. Durable stores (Postgres schema ensured, Redis pinged).
//! 3. Fetch→dedup→publish pipeline.
//! 4. Notification ingress, socket **bound** before any subscription call -
//!    the provider validates the push URL synchronously during creation.
//! 5. Lifecycle manager (discovery, ensure/create, renewal loop).
//! 6. Delta syncer: token cache hydrated from the store, sweep started.
//! 7. Health endpoint.
//!
//! Shutdown on SIGINT/SIGTERM reverses it: cancel the root token, stop the
//! lifecycle manager, stop the syncer, drain the HTTP servers within a
//! bounded grace period, close the store connections.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use redis::aio::ConnectionManager;
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mailfeed::config::Config;
use mailfeed::dedup::DedupFilter;
use mailfeed::delta::{DeltaSyncer, SyncerConfig};
use mailfeed::discovery::Discovery;
use mailfeed::graph::{GraphClient, GraphClients, MessageFetcher};
use mailfeed::pipeline::{Deliver, DeliveryPipeline};
use mailfeed::publish::Publisher;
use mailfeed::server::{
    self, AppState, HealthState, Pingable, build_health_router, resolve_webhook_url,
};
use mailfeed::store::{SubscriptionDirectory, SubscriptionStore, TokenSink};
use mailfeed::subscription::{LifecycleManager, LifecycleSink, ManagerConfig};
use mailfeed::types::TenantId;

/// Bound on draining in-flight HTTP work at shutdown.
const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(15);

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mailfeed=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = run().await {
        error!(error = %e, "ingestion service failed");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    info!("starting mailfeed ingestion service");

    let cfg = Config::load()?;
    info!(tenants = cfg.tenants.len(), "configuration loaded");

    let webhook_base = resolve_webhook_url(&cfg.webhook_url).await?;
    if webhook_base.is_empty() {
        return Err("webhook URL is not configured (set webhook.url or WEBHOOK_URL)".into());
    }
    info!(webhook_base = %webhook_base, "webhook base URL resolved");

    // ── Durable stores ──
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&cfg.database_url)
        .await?;
    let store = Arc::new(SubscriptionStore::new(pool.clone()).await?);

    let redis_client = redis::Client::open(cfg.redis_url.as_str())?;
    let redis_conn = ConnectionManager::new(redis_client).await?;

    let publisher = Publisher::new(redis_conn.clone(), cfg.emails_queue.clone());
    publisher.ping().await?;
    info!(queue = %cfg.emails_queue, "connected to queue store");

    let dedup = DedupFilter::new(redis_conn);

    // ── Per-tenant transports and the delivery pipeline ──
    let mut clients: GraphClients = HashMap::new();
    for tenant in &cfg.tenants {
        info!(tenant = %tenant.alias, tenant_id = %tenant.tenant_id, "initialising tenant");
        clients.insert(
            tenant.alias.clone(),
            Arc::new(GraphClient::for_tenant(tenant)),
        );
    }

    let fetcher = MessageFetcher::new(clients.clone(), cfg.graph_base_url.clone());
    let pipeline: Arc<dyn Deliver> =
        Arc::new(DeliveryPipeline::new(fetcher, dedup, publisher.clone()));

    // ── Delta syncer and lifecycle manager (gap hook wired one-way) ──
    let syncer = Arc::new(DeltaSyncer::new(SyncerConfig {
        clients: clients.clone(),
        graph_base_url: cfg.graph_base_url.clone(),
        pipeline: Arc::clone(&pipeline),
        store: Arc::clone(&store) as Arc<dyn TokenSink>,
        tenants: cfg.tenants.clone(),
        sync_interval: cfg.delta_sync_interval,
    }));

    let manager = Arc::new(LifecycleManager::new(ManagerConfig {
        store: Arc::clone(&store),
        discovery: Discovery::new(cfg.graph_base_url.clone()),
        clients: clients.clone(),
        tenants: cfg.tenants.clone(),
        webhook_base,
        renewal_buffer: cfg.renewal_buffer,
        graph_base_url: cfg.graph_base_url.clone(),
    }));

    {
        let syncer = Arc::clone(&syncer);
        manager.set_gap_hook(Arc::new(move |tenant_id, user_id| {
            syncer.spawn_gap_sync(tenant_id, user_id);
        }));
    }

    // ── Notification ingress: bound before any subscription call ──
    let shutdown = CancellationToken::new();

    let tenant_map: HashMap<String, TenantId> = cfg
        .tenants
        .iter()
        .map(|t| (t.alias.clone(), TenantId::new(&t.tenant_id)))
        .collect();

    let app_state = AppState::new(
        tenant_map,
        Arc::clone(&store) as Arc<dyn SubscriptionDirectory>,
        Arc::clone(&pipeline),
        Arc::clone(&manager) as Arc<dyn LifecycleSink>,
    );

    let webhook_listener =
        tokio::net::TcpListener::bind(("0.0.0.0", cfg.webhook_port)).await?;
    info!(port = cfg.webhook_port, "webhook server listening");

    let webhook_handle = {
        let token = shutdown.clone();
        let router = server::build_router(app_state);
        tokio::spawn(async move {
            axum::serve(webhook_listener, router)
                .with_graceful_shutdown(token.cancelled_owned())
                .await
        })
    };

    // ── Lifecycle manager: the socket above is ready, creates may fire ──
    let rosters = manager.start().await?;

    // ── Delta syncer: hydrate tokens, then sweep ──
    for tenant in &cfg.tenants {
        let tenant_id = TenantId::new(&tenant.tenant_id);
        for record in store.list_by_tenant(&tenant_id).await? {
            if !record.delta_token.is_empty() {
                syncer.set_delta_token(&record.tenant_id, &record.user_id, &record.delta_token);
            }
        }
    }
    syncer.start_periodic_sweep(rosters).await;

    // ── Health endpoint ──
    let health_listener = tokio::net::TcpListener::bind(("0.0.0.0", cfg.health_port)).await?;
    info!(port = cfg.health_port, "health server listening");

    let health_handle = {
        let token = shutdown.clone();
        let router = build_health_router(HealthState::new(vec![
            Arc::clone(&store) as Arc<dyn Pingable>,
            Arc::new(publisher.clone()) as Arc<dyn Pingable>,
        ]));
        tokio::spawn(async move {
            axum::serve(health_listener, router)
                .with_graceful_shutdown(token.cancelled_owned())
                .await
        })
    };

    info!("ingestion service started");

    wait_for_shutdown_signal().await;
    info!("received shutdown signal");

    // Stop producing work, then drain the servers, then drop connections.
    shutdown.cancel();
    manager.stop().await;
    syncer.stop().await;

    for (name, handle) in [("webhook", webhook_handle), ("health", health_handle)] {
        match tokio::time::timeout(GRACEFUL_SHUTDOWN_TIMEOUT, handle).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => error!(server = name, error = %e, "server error"),
            Ok(Err(e)) => error!(server = name, error = %e, "server task panicked"),
            Err(_) => error!(server = name, "server did not drain in time"),
        }
    }

    pool.close().await;
    info!("ingestion service stopped");

    Ok(())
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
