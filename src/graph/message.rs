//! Wire types for Graph message responses and their mapping to the
//! canonical envelope.
//!
//! The mapping is strict in the sense of the envelope contract: unknown
//! response fields are ignored, missing recipients become an empty list, and
//! internet message headers flatten to a name→value map with last-wins
//! semantics on duplicates.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;
use std::collections::HashMap;

use crate::types::{EmailAddress, EmailBody, EmailEnvelope, TenantId, UserId};

/// The fields requested from the message endpoint.
pub const MESSAGE_SELECT_FIELDS: &str =
    "id,subject,receivedDateTime,from,toRecipients,body,internetMessageHeaders,hasAttachments";

#[derive(Debug, Deserialize)]
pub struct GraphMessage {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub subject: String,
    #[serde(rename = "receivedDateTime")]
    pub received_date_time: Option<String>,
    pub from: Option<GraphRecipient>,
    #[serde(rename = "toRecipients", default)]
    pub to_recipients: Vec<GraphRecipient>,
    pub body: Option<GraphBody>,
    #[serde(rename = "internetMessageHeaders", default)]
    pub internet_message_headers: Vec<GraphHeader>,
    #[serde(rename = "hasAttachments", default)]
    pub has_attachments: bool,
}

#[derive(Debug, Deserialize)]
pub struct GraphRecipient {
    #[serde(rename = "emailAddress")]
    pub email_address: Option<GraphEmailAddress>,
}

#[derive(Debug, Default, Deserialize)]
pub struct GraphEmailAddress {
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct GraphBody {
    #[serde(rename = "contentType", default)]
    pub content_type: String,
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct GraphHeader {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub value: String,
}

impl GraphRecipient {
    fn to_email_address(&self) -> EmailAddress {
        match &self.email_address {
            Some(addr) => EmailAddress {
                address: addr.address.clone(),
                name: addr.name.clone(),
            },
            None => EmailAddress::default(),
        }
    }
}

/// Converts a Graph message response into the canonical envelope.
///
/// `received_at` carries the message's own receipt timestamp when the
/// response includes a parseable one; otherwise it falls back to the current
/// time so downstream ordering heuristics still have something to work with.
pub fn map_message(
    msg: GraphMessage,
    user_id: &UserId,
    tenant_id: &TenantId,
    tenant_alias: &str,
) -> EmailEnvelope {
    let mut headers = HashMap::with_capacity(msg.internet_message_headers.len());
    for h in &msg.internet_message_headers {
        headers.insert(h.name.clone(), h.value.clone());
    }

    let received_at = msg
        .received_date_time
        .as_deref()
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|ts| ts.with_timezone(&Utc))
        .unwrap_or_else(Utc::now)
        .to_rfc3339_opts(SecondsFormat::Secs, true);

    let to = msg
        .to_recipients
        .iter()
        .map(GraphRecipient::to_email_address)
        .collect();

    let from = msg
        .from
        .as_ref()
        .map(GraphRecipient::to_email_address)
        .unwrap_or_default();

    let body = match msg.body {
        Some(b) => EmailBody {
            content_type: b.content_type,
            content: b.content,
        },
        None => EmailBody::default(),
    };

    EmailEnvelope {
        message_id: msg.id,
        user_id: user_id.as_str().to_string(),
        tenant_id: tenant_id.as_str().to_string(),
        tenant_alias: tenant_alias.to_string(),
        received_at,
        from,
        to,
        subject: msg.subject,
        body,
        headers,
        attachments: vec![],
    }
}
