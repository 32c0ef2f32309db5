//! Authenticated Graph API transport, one per tenant.
//!
//! Each tenant authenticates via the OAuth2 client-credentials flow against
//! its own token endpoint. The bearer token is cached in-process and
//! refreshed shortly before expiry; every API request attaches the current
//! token. Credentials never appear in `Debug` output or logs.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::Method;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::config::TenantConfig;

use super::error::{GraphError, body_excerpt};

/// OAuth scope for Graph mailbox access.
const GRAPH_SCOPE: &str = "https://graph.microsoft.com/.default";

/// Refresh the cached token this long before its stated expiry.
const TOKEN_EXPIRY_SKEW_SECONDS: i64 = 60;

/// Per-tenant authenticated transports, keyed by tenant alias.
pub type GraphClients = HashMap<String, Arc<GraphClient>>;

/// An authenticated HTTP transport for one tenant's Graph API access.
pub struct GraphClient {
    http: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: String,
    scope: String,
    cached: Mutex<Option<CachedToken>>,
}

#[derive(Clone)]
struct CachedToken {
    access_token: String,
    expires_at: DateTime<Utc>,
}

impl CachedToken {
    fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

impl GraphClient {
    /// Creates a transport for a tenant using the standard login endpoint.
    pub fn for_tenant(tenant: &TenantConfig) -> Self {
        let token_url = format!(
            "https://login.microsoftonline.com/{}/oauth2/v2.0/token",
            tenant.tenant_id
        );
        Self::with_token_url(tenant, token_url)
    }

    /// Creates a transport with an explicit token endpoint (dev/test hook).
    pub fn with_token_url(tenant: &TenantConfig, token_url: impl Into<String>) -> Self {
        GraphClient {
            http: reqwest::Client::new(),
            token_url: token_url.into(),
            client_id: tenant.client_id.clone(),
            client_secret: tenant.client_secret.clone(),
            scope: GRAPH_SCOPE.to_string(),
            cached: Mutex::new(None),
        }
    }

    /// Creates a transport whose bearer token is fixed and never refreshed.
    ///
    /// Used by tests and tooling that point at a stub API.
    pub fn with_static_token(token: impl Into<String>) -> Self {
        GraphClient {
            http: reqwest::Client::new(),
            token_url: String::new(),
            client_id: String::new(),
            client_secret: String::new(),
            scope: GRAPH_SCOPE.to_string(),
            cached: Mutex::new(Some(CachedToken {
                access_token: token.into(),
                expires_at: Utc::now() + ChronoDuration::days(3650),
            })),
        }
    }

    /// Returns a request builder for `method url` with the bearer token
    /// attached. The caller adds headers/body and sends.
    pub async fn request(
        &self,
        method: Method,
        url: &str,
    ) -> Result<reqwest::RequestBuilder, GraphError> {
        let token = self.bearer().await?;
        Ok(self
            .http
            .request(method, url)
            .bearer_auth(token)
            .header("Accept", "application/json"))
    }

    /// Returns a valid bearer token, fetching a fresh one when the cached
    /// token is absent or expired.
    async fn bearer(&self) -> Result<String, GraphError> {
        let mut cached = self.cached.lock().await;

        if let Some(token) = cached.as_ref()
            && !token.is_expired()
        {
            return Ok(token.access_token.clone());
        }

        let fresh = self.fetch_token().await?;
        let access_token = fresh.access_token.clone();
        *cached = Some(fresh);
        Ok(access_token)
    }

    async fn fetch_token(&self) -> Result<CachedToken, GraphError> {
        let response = self
            .http
            .post(&self.token_url)
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("scope", self.scope.as_str()),
                ("grant_type", "client_credentials"),
            ])
            .send()
            .await
            .map_err(GraphError::TokenRequest)?;

        let status = response.status();
        let body = response.text().await.map_err(GraphError::TokenRequest)?;
        if !status.is_success() {
            return Err(GraphError::TokenStatus {
                status: status.as_u16(),
                body: body_excerpt(&body),
            });
        }

        let payload: TokenResponse =
            serde_json::from_str(&body).map_err(GraphError::TokenDecode)?;

        Ok(CachedToken {
            access_token: payload.access_token,
            expires_at: Utc::now()
                + ChronoDuration::seconds(
                    payload.expires_in.saturating_sub(TOKEN_EXPIRY_SKEW_SECONDS),
                ),
        })
    }
}

impl std::fmt::Debug for GraphClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphClient")
            .field("token_url", &self.token_url)
            .finish_non_exhaustive()
    }
}
