//! Fingerprint deduplication backed by the KV store.
//!
//! Push notifications, delta sweeps, backfill runs, and provider retries all
//! overlap; this filter gives the pipeline at-most-once delivery per
//! fingerprint within the TTL window. The check-and-record step is a single
//! atomic `SET key value NX EX ttl`, so concurrent callers cannot both see
//! "new".
//!
//! If the store is unreachable the error surfaces to the caller, which logs
//! and proceeds - a duplicate downstream beats a lost message, and the
//! analysis side is idempotent by envelope id.

use redis::aio::ConnectionManager;
use std::time::Duration;
use thiserror::Error;

/// How long a seen fingerprint is remembered. Delta/audit content expires
/// upstream after a week, so 24 hours comfortably covers the overlap window.
pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Namespace prefix separating dedup keys from other data in the store.
const KEY_PREFIX: &str = "seen:";

/// Errors from the dedup store.
#[derive(Debug, Error)]
pub enum DedupError {
    #[error("dedup store error: {0}")]
    Store(#[from] redis::RedisError),
}

/// Tracks which fingerprints have already been processed.
#[derive(Clone)]
pub struct DedupFilter {
    conn: ConnectionManager,
    ttl: Duration,
}

impl DedupFilter {
    /// Creates a filter with the default TTL.
    pub fn new(conn: ConnectionManager) -> Self {
        DedupFilter {
            conn,
            ttl: DEFAULT_TTL,
        }
    }

    /// Overrides the TTL (tests and tooling).
    pub fn with_ttl(conn: ConnectionManager, ttl: Duration) -> Self {
        DedupFilter { conn, ttl }
    }

    /// Returns true if the fingerprint has NOT been seen within the TTL.
    /// A true result also records the fingerprint atomically.
    pub async fn is_new(&self, fingerprint: &str) -> Result<bool, DedupError> {
        let key = self.key(fingerprint);
        let mut conn = self.conn.clone();

        // SET NX EX returns OK when the key was set, nil when it existed.
        let set: Option<String> = redis::cmd("SET")
            .arg(&key)
            .arg(1)
            .arg("NX")
            .arg("EX")
            .arg(self.ttl.as_secs())
            .query_async(&mut conn)
            .await?;

        Ok(set.is_some())
    }

    fn key(&self, fingerprint: &str) -> String {
        format!("{KEY_PREFIX}{fingerprint}")
    }
}
