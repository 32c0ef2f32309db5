//! Full-message retrieval by (mailbox user, message id).
//!
//! The fetcher holds the per-tenant transport map so every fetch uses the
//! credentials belonging to the tenant the notification came from. A message
//! that has disappeared between notification and fetch (HTTP 404) is not an
//! error - it was deleted in-race and is silently dropped.

use reqwest::{Method, StatusCode};
use thiserror::Error;
use tracing::warn;

use crate::types::{EmailEnvelope, MessageId, TenantId, UserId};

use super::client::GraphClients;
use super::error::{GraphError, body_excerpt};
use super::message::{GraphMessage, MESSAGE_SELECT_FIELDS, map_message};

/// Errors from message retrieval.
#[derive(Debug, Error)]
pub enum FetchError {
    /// No transport is configured for the tenant alias.
    #[error("no graph client for tenant alias {0:?}")]
    UnknownTenant(String),

    #[error(transparent)]
    Graph(#[from] GraphError),

    /// Any non-2xx other than 404; retriable via the delta sweep.
    #[error("message endpoint returned HTTP {status} for message {message_id}")]
    Status { status: u16, message_id: MessageId },

    #[error("decode message response: {0}")]
    Decode(#[source] serde_json::Error),
}

/// Retrieves full email messages and maps them to canonical envelopes.
pub struct MessageFetcher {
    clients: GraphClients,
    base_url: String,
}

impl MessageFetcher {
    /// Creates a fetcher over the per-tenant transport map.
    pub fn new(clients: GraphClients, base_url: impl Into<String>) -> Self {
        MessageFetcher {
            clients,
            base_url: base_url.into(),
        }
    }

    /// Fetches a message and returns its envelope, or `None` if the message
    /// no longer exists.
    pub async fn fetch_message(
        &self,
        user_id: &UserId,
        message_id: &MessageId,
        tenant_id: &TenantId,
        tenant_alias: &str,
    ) -> Result<Option<EmailEnvelope>, FetchError> {
        let client = self
            .clients
            .get(tenant_alias)
            .ok_or_else(|| FetchError::UnknownTenant(tenant_alias.to_string()))?;

        let url = format!(
            "{}/users/{}/messages/{}?$select={}",
            self.base_url, user_id, message_id, MESSAGE_SELECT_FIELDS
        );

        let response = client
            .request(Method::GET, &url)
            .await?
            .header("Prefer", "outlook.body-content-type=\"text\"")
            .send()
            .await
            .map_err(GraphError::from)?;

        if response.status() == StatusCode::NOT_FOUND {
            warn!(
                user = %user_id,
                message = %message_id,
                "message not found (may have been deleted)"
            );
            return Ok(None);
        }

        let status = response.status();
        let body = response.text().await.map_err(GraphError::from)?;
        if !status.is_success() {
            warn!(
                user = %user_id,
                message = %message_id,
                status = status.as_u16(),
                body = %body_excerpt(&body),
                "message fetch failed"
            );
            return Err(FetchError::Status {
                status: status.as_u16(),
                message_id: message_id.clone(),
            });
        }

        let msg: GraphMessage = serde_json::from_str(&body).map_err(FetchError::Decode)?;
        Ok(Some(map_message(msg, user_id, tenant_id, tenant_alias)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::http::StatusCode;
    use axum::routing::get;
    use std::collections::HashMap;
    use std::sync::Arc;

    use crate::graph::client::GraphClient;

    async fn spawn_stub(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn fetcher_for(base: &str) -> MessageFetcher {
        let mut clients: GraphClients = HashMap::new();
        clients.insert(
            "acme".to_string(),
            Arc::new(GraphClient::with_static_token("test")),
        );
        MessageFetcher::new(clients, base)
    }

    #[tokio::test]
    async fn fetches_and_maps_a_message() {
        let router = Router::new().route(
            "/users/{user}/messages/{id}",
            get(|| async {
                axum::Json(serde_json::json!({
                    "id": "m1",
                    "subject": "hello",
                    "receivedDateTime": "2026-02-11T08:15:30Z",
                    "from": {"emailAddress": {"address": "x@example.org", "name": "X"}},
                    "toRecipients": [],
                    "body": {"contentType": "text", "content": "hi"}
                }))
            }),
        );
        let base = spawn_stub(router).await;
        let fetcher = fetcher_for(&base);

        let envelope = fetcher
            .fetch_message(
                &UserId::new("u1"),
                &MessageId::new("m1"),
                &TenantId::new("t1"),
                "acme",
            )
            .await
            .unwrap()
            .expect("envelope");

        assert_eq!(envelope.message_id, "m1");
        assert_eq!(envelope.subject, "hello");
        assert_eq!(envelope.tenant_alias, "acme");
    }

    #[tokio::test]
    async fn race_deleted_message_returns_none() {
        let router = Router::new().route(
            "/users/{user}/messages/{id}",
            get(|| async { StatusCode::NOT_FOUND }),
        );
        let base = spawn_stub(router).await;
        let fetcher = fetcher_for(&base);

        let result = fetcher
            .fetch_message(
                &UserId::new("u1"),
                &MessageId::new("gone"),
                &TenantId::new("t1"),
                "acme",
            )
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn server_errors_surface_as_retriable_status() {
        let router = Router::new().route(
            "/users/{user}/messages/{id}",
            get(|| async { StatusCode::BAD_GATEWAY }),
        );
        let base = spawn_stub(router).await;
        let fetcher = fetcher_for(&base);

        let err = fetcher
            .fetch_message(
                &UserId::new("u1"),
                &MessageId::new("m1"),
                &TenantId::new("t1"),
                "acme",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Status { status: 502, .. }));
    }

    #[tokio::test]
    async fn unknown_tenant_is_an_error() {
        let fetcher = fetcher_for("http://unused.invalid");
        let err = fetcher
            .fetch_message(
                &UserId::new("u1"),
                &MessageId::new("m1"),
                &TenantId::new("t1"),
                "nobody",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::UnknownTenant(alias) if alias == "nobody"));
    }
}
