//! Core domain types shared across the ingestion service.

pub mod envelope;
pub mod ids;

pub use envelope::{Attachment, EmailAddress, EmailBody, EmailEnvelope};
pub use ids::{MessageId, SubscriptionId, TenantId, UserId};
