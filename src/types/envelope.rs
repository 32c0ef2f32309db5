//! The canonical email envelope published to the analysis queue.
//!
//! This struct's JSON serialisation is the external contract with the
//! analysis service and MUST remain byte-compatible: field names, optionality,
//! and nesting are frozen. Changes here are wire-format changes.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A sender or recipient with an address and optional display name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailAddress {
    pub address: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
}

/// The message body content.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailBody {
    pub content_type: String,
    pub content: String,
}

/// A file attached to an email.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    pub content_type: String,
    pub size: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_bytes: Option<String>,
}

/// A fully parsed email ready for the analysis pipeline.
///
/// The analysis workers deserialise exactly this shape from the work queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailEnvelope {
    pub message_id: String,
    pub user_id: String,
    pub tenant_id: String,
    pub tenant_alias: String,

    /// RFC-3339 UTC timestamp of receipt, empty when unknown.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub received_at: String,

    pub from: EmailAddress,
    pub to: Vec<EmailAddress>,
    pub subject: String,
    pub body: EmailBody,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,

    pub attachments: Vec<Attachment>,
}
