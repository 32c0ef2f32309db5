//! Change-notification endpoint handler.
//!
//! The provider's contract is latency-sensitive: the 202 must go out before
//! any downstream work, or the endpoint gets flagged as failing and
//! notifications are retried/redelivered. Dispatch therefore happens on a
//! spawned task after the ack, and per-notification failures are logged
//! rather than reported upstream.

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::pipeline::{Origin, Outcome};
use crate::types::{MessageId, UserId};

use super::AppState;

/// The query parameter carrying a validation probe's token.
#[derive(Debug, Deserialize)]
pub struct ProbeQuery {
    #[serde(rename = "validationToken")]
    pub validation_token: Option<String>,
}

/// A batch of change notifications as POSTed by the provider.
#[derive(Debug, Deserialize)]
pub struct NotificationPayload {
    #[serde(default)]
    pub value: Vec<ChangeNotification>,
}

/// One change notification.
#[derive(Debug, Deserialize)]
pub struct ChangeNotification {
    #[serde(rename = "subscriptionId", default)]
    pub subscription_id: String,
    #[serde(rename = "changeType", default)]
    pub change_type: String,
    #[serde(default)]
    pub resource: String,
    #[serde(rename = "clientState", default)]
    pub client_state: String,
    #[serde(rename = "tenantId", default)]
    pub tenant_id: String,
}

/// A resource path that is not `users/{id}/messages/{id}`.
#[derive(Debug, Error)]
#[error("resource path {0:?} is not users/{{user}}/messages/{{message}}")]
pub struct InvalidResource(String);

/// Parses a notification resource path into its mailbox user and message
/// ids. Exactly four segments, case-insensitive keywords, leading slash
/// tolerated.
pub fn parse_resource(resource: &str) -> Result<(UserId, MessageId), InvalidResource> {
    let trimmed = resource.strip_prefix('/').unwrap_or(resource);
    let segments: Vec<&str> = trimmed.split('/').collect();

    if segments.len() != 4
        || !segments[0].eq_ignore_ascii_case("users")
        || !segments[2].eq_ignore_ascii_case("messages")
        || segments[1].is_empty()
        || segments[3].is_empty()
    {
        return Err(InvalidResource(resource.to_string()));
    }

    Ok((UserId::new(segments[1]), MessageId::new(segments[3])))
}

/// Echoes a validation probe token as the provider requires: 200,
/// `text/plain`, body verbatim.
pub(super) fn probe_response(token: String) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain")],
        token,
    )
        .into_response()
}

/// Handles `POST /webhook/{alias}/{user}` (and answers 200 to anything
/// that isn't a notification POST).
pub async fn notification_handler(
    State(state): State<AppState>,
    Path((alias, user)): Path<(String, String)>,
    Query(probe): Query<ProbeQuery>,
    method: Method,
    body: Bytes,
) -> Response {
    if let Some(token) = probe.validation_token {
        debug!(tenant = %alias, user = %user, "validation probe received");
        return probe_response(token);
    }

    if method != Method::POST {
        return (StatusCode::OK, "OK").into_response();
    }

    match serde_json::from_slice::<NotificationPayload>(&body) {
        Ok(payload) => {
            debug!(
                tenant = %alias,
                count = payload.value.len(),
                "change notifications received"
            );
            // Ack first, work later: the provider's delivery deadline does
            // not wait for fetches.
            tokio::spawn(dispatch_notifications(state, alias, payload));
        }
        Err(e) => {
            // Still 202: letting the provider redeliver a body we cannot
            // parse would just replay the failure.
            warn!(tenant = %alias, error = %e, "unparseable notification body");
        }
    }

    (StatusCode::ACCEPTED, "Accepted").into_response()
}

/// Processes an acked batch. Notifications are handled in list order;
/// failures never affect siblings.
async fn dispatch_notifications(state: AppState, alias: String, payload: NotificationPayload) {
    for notification in payload.value {
        if notification.change_type != "created" {
            debug!(
                change_type = %notification.change_type,
                "skipping non-created change"
            );
            continue;
        }

        let (user_id, message_id) = match parse_resource(&notification.resource) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(tenant = %alias, error = %e, "rejecting notification");
                continue;
            }
        };

        let Some(tenant_id) = state.tenant_id(&alias).cloned() else {
            warn!(tenant = %alias, "notification for unknown tenant alias");
            continue;
        };

        // Authenticity check: the provider echoes the shared secret we
        // registered. A mismatch against a known record means the sender is
        // not the provider. An absent record is a creation race, not an
        // attack - losing real mail is worse than one redundant fetch.
        match state.directory().find(&tenant_id, &user_id).await {
            Ok(Some(record)) => {
                if !notification.client_state.is_empty()
                    && notification.client_state != record.client_state
                {
                    warn!(
                        tenant = %alias,
                        user = %user_id,
                        subscription_id = %notification.subscription_id,
                        "client state mismatch, dropping notification (possible spoofing)"
                    );
                    continue;
                }

                if let Err(e) = state.directory().touch_push_observed(&tenant_id, &user_id).await {
                    warn!(tenant = %alias, user = %user_id, error = %e, "failed to record push");
                }
            }
            Ok(None) => {
                debug!(
                    tenant = %alias,
                    user = %user_id,
                    "no subscription record yet, proceeding"
                );
            }
            Err(e) => {
                warn!(
                    tenant = %alias,
                    user = %user_id,
                    error = %e,
                    "subscription lookup failed, proceeding"
                );
            }
        }

        match state
            .pipeline()
            .deliver(&tenant_id, &alias, &user_id, &message_id, Origin::Push)
            .await
        {
            Ok(Outcome::Published) => {
                debug!(tenant = %alias, user = %user_id, message = %message_id, "published");
            }
            Ok(Outcome::Duplicate) => {
                debug!(tenant = %alias, message = %message_id, "duplicate, skipped");
            }
            Ok(Outcome::Missing) => {
                debug!(tenant = %alias, message = %message_id, "message gone before fetch");
            }
            Err(e) => {
                // Already acked upstream; nothing to do but record it.
                error!(
                    tenant = %alias,
                    user = %user_id,
                    message = %message_id,
                    error = %e,
                    "notification delivery failed"
                );
            }
        }
    }
}
