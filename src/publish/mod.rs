//! Work-queue publisher.
//!
//! Envelopes are enqueued in the exact wire format the analysis workers
//! already consume: a Celery task message, JSON-encoded, left-pushed onto
//! the queue list. The shape here is frozen - the analysis side reads it
//! byte-for-byte, so any drift is a wire-format break.

use redis::aio::ConnectionManager;
use serde::Serialize;
use serde_json::json;
use std::time::Duration;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::types::EmailEnvelope;

/// Task name of the analysis entry point draining the queue.
const ANALYZE_TASK: &str = "analysis.tasks.analyze_email";

/// Bound on the queue-store connectivity probe.
const PING_TIMEOUT: Duration = Duration::from_secs(2);

/// Errors from queue publishing.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("serialise task payload: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("queue store error: {0}")]
    Store(#[from] redis::RedisError),

    #[error("queue store ping timed out")]
    PingTimeout,
}

/// The Celery task body (the inner JSON document).
#[derive(Debug, Serialize)]
struct CeleryTask<'a> {
    id: &'a str,
    task: &'a str,
    args: [&'a str; 1],
    kwargs: serde_json::Map<String, serde_json::Value>,
    retries: u32,
    eta: Option<String>,
}

/// The transport message wrapping a task for the queue list.
#[derive(Debug, Serialize)]
struct CeleryMessage<'a> {
    body: String,
    #[serde(rename = "content-encoding")]
    content_encoding: &'a str,
    #[serde(rename = "content-type")]
    content_type: &'a str,
    headers: serde_json::Value,
    properties: serde_json::Value,
}

/// Sends email envelopes to the downstream analysis queue.
#[derive(Clone)]
pub struct Publisher {
    conn: ConnectionManager,
    queue_name: String,
}

impl Publisher {
    /// Creates a publisher targeting the named queue.
    pub fn new(conn: ConnectionManager, queue_name: impl Into<String>) -> Self {
        Publisher {
            conn,
            queue_name: queue_name.into(),
        }
    }

    /// Returns the queue this publisher targets.
    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Serialises the envelope as a Celery task and pushes it to the queue.
    pub async fn publish(&self, envelope: &EmailEnvelope) -> Result<(), PublishError> {
        let task_id = Uuid::new_v4().to_string();
        let payload = encode_task_message(envelope, &task_id, &self.queue_name)?;

        let mut conn = self.conn.clone();
        redis::cmd("LPUSH")
            .arg(&self.queue_name)
            .arg(payload)
            .query_async::<()>(&mut conn)
            .await?;

        info!(
            task_id = %task_id,
            message_id = %envelope.message_id,
            tenant = %envelope.tenant_alias,
            queue = %self.queue_name,
            "published email envelope to queue"
        );

        Ok(())
    }

    /// Checks connectivity to the queue store.
    pub async fn ping(&self) -> Result<(), PublishError> {
        let mut conn = self.conn.clone();
        let cmd = redis::cmd("PING");
        tokio::time::timeout(PING_TIMEOUT, cmd.query_async::<String>(&mut conn))
            .await
            .map_err(|_| PublishError::PingTimeout)??;
        Ok(())
    }
}

/// Builds the full queue payload for one envelope.
fn encode_task_message(
    envelope: &EmailEnvelope,
    task_id: &str,
    queue_name: &str,
) -> Result<String, serde_json::Error> {
    let envelope_json = serde_json::to_string(envelope)?;

    let task = CeleryTask {
        id: task_id,
        task: ANALYZE_TASK,
        args: [envelope_json.as_str()],
        kwargs: serde_json::Map::new(),
        retries: 0,
        eta: None,
    };
    let task_body = serde_json::to_string(&task)?;

    let message = CeleryMessage {
        body: task_body,
        content_encoding: "utf-8",
        content_type: "application/json",
        headers: json!({
            "lang": "py",
            "task": ANALYZE_TASK,
            "id": task_id,
            "retries": 0,
        }),
        properties: json!({
            "correlation_id": task_id,
            "delivery_mode": 2,
            "delivery_tag": task_id,
            "body_encoding": "utf-8",
            "exchange": queue_name,
            "routing_key": queue_name,
            "delivery_info": {
                "exchange": queue_name,
                "routing_key": queue_name,
            },
        }),
    };

    serde_json::to_string(&message)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope() -> EmailEnvelope {
        EmailEnvelope {
            message_id: "m1".to_string(),
            user_id: "u1".to_string(),
            tenant_id: "t1".to_string(),
            tenant_alias: "acme".to_string(),
            subject: "s".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn task_message_has_the_frozen_wire_shape() {
        let payload = encode_task_message(&envelope(), "task-1", "emails").unwrap();
        let message: serde_json::Value = serde_json::from_str(&payload).unwrap();

        assert_eq!(message["content-encoding"], "utf-8");
        assert_eq!(message["content-type"], "application/json");
        assert_eq!(message["headers"]["lang"], "py");
        assert_eq!(message["headers"]["task"], "analysis.tasks.analyze_email");
        assert_eq!(message["headers"]["id"], "task-1");
        assert_eq!(message["properties"]["correlation_id"], "task-1");
        assert_eq!(message["properties"]["delivery_mode"], 2);
        assert_eq!(message["properties"]["exchange"], "emails");
        assert_eq!(message["properties"]["routing_key"], "emails");
        assert_eq!(message["properties"]["delivery_info"]["exchange"], "emails");
    }

    #[test]
    fn task_body_carries_the_envelope_as_a_json_string_arg() {
        let payload = encode_task_message(&envelope(), "task-1", "emails").unwrap();
        let message: serde_json::Value = serde_json::from_str(&payload).unwrap();

        // The body is itself a JSON document…
        let body: serde_json::Value =
            serde_json::from_str(message["body"].as_str().unwrap()).unwrap();
        assert_eq!(body["id"], "task-1");
        assert_eq!(body["task"], "analysis.tasks.analyze_email");
        assert_eq!(body["retries"], 0);
        assert_eq!(body["eta"], serde_json::Value::Null);
        assert_eq!(body["kwargs"], serde_json::json!({}));

        // …whose single positional argument is the envelope, JSON-encoded.
        let args = body["args"].as_array().unwrap();
        assert_eq!(args.len(), 1);
        let parsed: EmailEnvelope = serde_json::from_str(args[0].as_str().unwrap()).unwrap();
        assert_eq!(parsed.message_id, "m1");
        assert_eq!(parsed.tenant_alias, "acme");
    }
}
