//! mailfeed-backfill - historical email ingestion.
//!
//! Standalone CLI that ingests historical mail from a tenant's mailboxes
//! within a lookback window, reusing the same fetch+publish path as the
//! live service. Intended for seeding new deployments and for recovering
//! the data-loss window after a delta-token expiry.

use clap::Parser;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use redis::aio::ConnectionManager;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mailfeed::backfill::{BackfillRequest, Runner};
use mailfeed::config::Config;
use mailfeed::dedup::DedupFilter;
use mailfeed::discovery::Discovery;
use mailfeed::graph::{GraphClient, GraphClients, MessageFetcher};
use mailfeed::pipeline::{Deliver, DeliveryPipeline};
use mailfeed::publish::Publisher;
use mailfeed::types::{TenantId, UserId};

#[derive(Debug, Parser)]
#[command(
    name = "mailfeed-backfill",
    about = "Ingest historical emails from a tenant's mailboxes"
)]
struct Args {
    /// Tenant alias to backfill.
    #[arg(long)]
    tenant: String,

    /// Comma-separated user addresses (empty = all discovered users).
    #[arg(long, value_delimiter = ',')]
    users: Vec<String>,

    /// Lookback window in hours (168 = one week).
    #[arg(long, default_value_t = 168)]
    since_hours: u64,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mailfeed=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = run(Args::parse()).await {
        error!(error = %e, "backfill failed");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let since = Duration::from_secs(args.since_hours * 3600);
    info!(tenant = %args.tenant, since_hours = args.since_hours, "starting historical backfill");

    let cfg = Config::load()?;

    let tenant = cfg
        .find_tenant(&args.tenant)
        .ok_or_else(|| format!("tenant {:?} not found in configuration", args.tenant))?
        .clone();

    // ── Queue store + dedup ──
    let redis_client = redis::Client::open(cfg.redis_url.as_str())?;
    let redis_conn = ConnectionManager::new(redis_client).await?;

    let publisher = Publisher::new(redis_conn.clone(), cfg.emails_queue.clone());
    publisher.ping().await?;
    info!("connected to queue store");

    let dedup = DedupFilter::new(redis_conn);

    // ── Tenant transport + pipeline ──
    let client = Arc::new(GraphClient::for_tenant(&tenant));
    let mut clients: GraphClients = HashMap::new();
    clients.insert(tenant.alias.clone(), Arc::clone(&client));

    let fetcher = MessageFetcher::new(clients, cfg.graph_base_url.clone());
    let pipeline: Arc<dyn Deliver> = Arc::new(DeliveryPipeline::new(fetcher, dedup, publisher));

    // ── Resolve users ──
    let users: Vec<UserId> = if !args.users.is_empty() {
        args.users
            .iter()
            .map(|u| u.trim())
            .filter(|u| !u.is_empty())
            .map(UserId::new)
            .collect()
    } else {
        let discovery = Discovery::new(cfg.graph_base_url.clone());
        discovery
            .discover_users(
                &client,
                &tenant.alias,
                &tenant.include_users,
                &tenant.exclude_users,
            )
            .await?
            .iter()
            .map(|u| UserId::new(u.principal_or_mail()))
            .collect()
    };

    if users.is_empty() {
        return Err("no users to backfill".into());
    }
    info!(count = users.len(), "resolved users for backfill");

    // ── Run ──
    let runner = Runner::new(cfg.graph_base_url.clone(), pipeline);
    let result = runner
        .run(
            &client,
            &BackfillRequest {
                tenant_id: TenantId::new(&tenant.tenant_id),
                tenant_alias: tenant.alias.clone(),
                users,
                since,
            },
        )
        .await?;

    info!(
        tenant = %result.tenant_alias,
        total_new = result.total_new,
        total_skipped = result.total_skipped,
        elapsed_secs = result.elapsed.as_secs(),
        "backfill complete"
    );

    for ur in &result.user_results {
        info!(
            user = %ur.user_id,
            fetched = ur.fetched,
            skipped = ur.skipped,
            errors = ur.errors,
            "user result"
        );
    }

    Ok(())
}
