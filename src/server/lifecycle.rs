//! Lifecycle-notification endpoint handler.
//!
//! The provider posts out-of-band subscription signals here (removed,
//! reauthorization-required, missed). Same contract as the notification
//! endpoint: validation-probe echo, 202 before any work, 202 even for
//! unparseable bodies.

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use tracing::{debug, warn};

use super::AppState;
use super::notification::{ProbeQuery, probe_response};

/// A batch of lifecycle notifications.
#[derive(Debug, Deserialize)]
pub struct LifecyclePayload {
    #[serde(default)]
    pub value: Vec<LifecycleNotification>,
}

/// One lifecycle notification.
#[derive(Debug, Deserialize)]
pub struct LifecycleNotification {
    #[serde(rename = "subscriptionId", default)]
    pub subscription_id: String,
    #[serde(rename = "lifecycleEvent", default)]
    pub lifecycle_event: String,
}

/// Handles `POST /lifecycle/{alias}`.
pub async fn lifecycle_handler(
    State(state): State<AppState>,
    Path(alias): Path<String>,
    Query(probe): Query<ProbeQuery>,
    method: Method,
    body: Bytes,
) -> Response {
    if let Some(token) = probe.validation_token {
        debug!(tenant = %alias, "lifecycle validation probe received");
        return probe_response(token);
    }

    if method != Method::POST {
        return (StatusCode::OK, "OK").into_response();
    }

    match serde_json::from_slice::<LifecyclePayload>(&body) {
        Ok(payload) => {
            tokio::spawn(async move {
                for event in payload.value {
                    if event.lifecycle_event.is_empty() {
                        continue;
                    }
                    state
                        .lifecycle()
                        .handle_lifecycle_event(
                            &event.lifecycle_event,
                            &event.subscription_id,
                            &alias,
                        )
                        .await;
                }
            });
        }
        Err(e) => {
            warn!(tenant = %alias, error = %e, "unparseable lifecycle body");
        }
    }

    (StatusCode::ACCEPTED, "Accepted").into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_payload_deserialises_provider_field_names() {
        let payload: LifecyclePayload = serde_json::from_str(
            r#"{"value":[{"subscriptionId":"sub-9","lifecycleEvent":"missed"}]}"#,
        )
        .unwrap();

        assert_eq!(payload.value.len(), 1);
        assert_eq!(payload.value[0].subscription_id, "sub-9");
        assert_eq!(payload.value[0].lifecycle_event, "missed");
    }

    #[test]
    fn lifecycle_payload_tolerates_missing_fields() {
        let payload: LifecyclePayload = serde_json::from_str(r#"{"value":[{}]}"#).unwrap();
        assert_eq!(payload.value[0].lifecycle_event, "");
    }
}
