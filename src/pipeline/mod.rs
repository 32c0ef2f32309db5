//! The fetch→dedup→publish chain shared by every input path.
//!
//! Push dispatch, the delta sweep, and historical backfill all end in the
//! same three steps; the only difference between them is the fingerprint
//! namespace used for deduplication. The `Deliver` trait is the seam the
//! ingress and the synchroniser are tested through.

use async_trait::async_trait;
use thiserror::Error;
use tracing::warn;

use crate::dedup::DedupFilter;
use crate::graph::{FetchError, MessageFetcher};
use crate::publish::{PublishError, Publisher};
use crate::types::{MessageId, TenantId, UserId};

/// Which input path produced a message id. Determines the dedup namespace:
/// push uses the raw id, the other paths prefix it so their overlapping
/// windows don't suppress each other's first sighting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Push,
    Delta,
    Backfill,
}

impl Origin {
    /// The dedup fingerprint for a message id arriving via this path.
    pub fn fingerprint(&self, message_id: &MessageId) -> String {
        match self {
            Origin::Push => message_id.as_str().to_string(),
            Origin::Delta => format!("delta:{message_id}"),
            Origin::Backfill => format!("backfill:{message_id}"),
        }
    }
}

/// What happened to one message id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Fetched and enqueued downstream.
    Published,
    /// Already seen within the TTL window.
    Duplicate,
    /// Deleted upstream before we could fetch it.
    Missing,
}

/// Errors from the delivery chain.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Publish(#[from] PublishError),
}

/// The delivery seam: turn a (tenant, user, message id) observation into a
/// published envelope, at most once per TTL window.
#[async_trait]
pub trait Deliver: Send + Sync {
    async fn deliver(
        &self,
        tenant_id: &TenantId,
        tenant_alias: &str,
        user_id: &UserId,
        message_id: &MessageId,
        origin: Origin,
    ) -> Result<Outcome, PipelineError>;
}

/// The production chain: dedup check, full-message fetch, queue publish.
pub struct DeliveryPipeline {
    fetcher: MessageFetcher,
    dedup: DedupFilter,
    publisher: Publisher,
}

impl DeliveryPipeline {
    pub fn new(fetcher: MessageFetcher, dedup: DedupFilter, publisher: Publisher) -> Self {
        DeliveryPipeline {
            fetcher,
            dedup,
            publisher,
        }
    }
}

#[async_trait]
impl Deliver for DeliveryPipeline {
    async fn deliver(
        &self,
        tenant_id: &TenantId,
        tenant_alias: &str,
        user_id: &UserId,
        message_id: &MessageId,
        origin: Origin,
    ) -> Result<Outcome, PipelineError> {
        let fingerprint = origin.fingerprint(message_id);

        // A dedup-store failure must not lose mail: log and continue as if
        // the message were new. Downstream is idempotent by envelope id.
        match self.dedup.is_new(&fingerprint).await {
            Ok(false) => return Ok(Outcome::Duplicate),
            Ok(true) => {}
            Err(e) => {
                warn!(
                    tenant = %tenant_alias,
                    message = %message_id,
                    error = %e,
                    "dedup check failed, proceeding"
                );
            }
        }

        let Some(envelope) = self
            .fetcher
            .fetch_message(user_id, message_id, tenant_id, tenant_alias)
            .await?
        else {
            return Ok(Outcome::Missing);
        };

        self.publisher.publish(&envelope).await?;
        Ok(Outcome::Published)
    }
}
