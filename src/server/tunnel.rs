//! Webhook-URL resolution, including dev tunnel discovery.
//!
//! In production the webhook base URL is static configuration. For local
//! development the sentinel `auto` asks a local tunnel daemon (ngrok-style)
//! for its public URL via the daemon's introspection API, with bounded
//! retries because the daemon may still be starting. There is no fallback:
//! without a reachable webhook URL, subscriptions cannot validate.

use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Introspection API of the local tunnel daemon (Docker-internal address).
const DEFAULT_TUNNEL_API: &str = "http://ngrok:4040";

const DISCOVERY_ATTEMPTS: u32 = 10;
const DISCOVERY_PAUSE: Duration = Duration::from_secs(2);

/// Errors from webhook-URL resolution.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("no tunnel discovered after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: String },
}

#[derive(Debug, Deserialize)]
struct TunnelList {
    #[serde(default)]
    tunnels: Vec<Tunnel>,
}

#[derive(Debug, Deserialize)]
struct Tunnel {
    #[serde(default)]
    public_url: String,
    #[serde(default)]
    proto: String,
}

/// Resolves the configured webhook URL. Anything other than the `auto`
/// sentinel is taken as-is (trailing slash trimmed); `auto` consults the
/// local tunnel daemon.
pub async fn resolve_webhook_url(raw: &str) -> Result<String, TunnelError> {
    let trimmed = raw.trim();
    if !trimmed.eq_ignore_ascii_case("auto") {
        return Ok(trimmed.trim_end_matches('/').to_string());
    }

    let api_base = match std::env::var("NGROK_API_URL") {
        Ok(v) if !v.is_empty() => v,
        _ => DEFAULT_TUNNEL_API.to_string(),
    };

    info!(api = %api_base, "discovering webhook URL from local tunnel");
    discover_tunnel(&api_base, DISCOVERY_ATTEMPTS, DISCOVERY_PAUSE).await
}

/// Polls the tunnel daemon's introspection API until a tunnel shows up.
pub async fn discover_tunnel(
    api_base: &str,
    attempts: u32,
    pause: Duration,
) -> Result<String, TunnelError> {
    let client = reqwest::Client::new();
    let url = format!("{}/api/tunnels", api_base.trim_end_matches('/'));
    let mut last_error = "no tunnels found".to_string();

    for attempt in 1..=attempts {
        match client.get(&url).send().await {
            Ok(response) => match response.json::<TunnelList>().await {
                Ok(list) => {
                    if let Some(public_url) = pick_tunnel(&list.tunnels) {
                        info!(url = %public_url, "tunnel discovered");
                        return Ok(public_url);
                    }
                    last_error = "no tunnels found".to_string();
                }
                Err(e) => {
                    warn!(error = %e, "failed to decode tunnel list");
                    last_error = e.to_string();
                }
            },
            Err(e) => {
                debug!(attempt, error = %e, "tunnel daemon not ready, retrying");
                last_error = e.to_string();
            }
        }

        if attempt < attempts {
            tokio::time::sleep(pause).await;
        }
    }

    Err(TunnelError::Exhausted {
        attempts,
        last_error,
    })
}

/// Picks the HTTPS tunnel when one exists, else the first tunnel.
fn pick_tunnel(tunnels: &[Tunnel]) -> Option<String> {
    tunnels
        .iter()
        .find(|t| t.proto == "https")
        .or_else(|| tunnels.first())
        .filter(|t| !t.public_url.is_empty())
        .map(|t| t.public_url.clone())
}
