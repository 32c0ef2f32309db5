//! Mailbox discovery - which users of a tenant get subscriptions.
//!
//! Hybrid strategy: an explicit include-list short-circuits the provider
//! entirely; otherwise all licensed users with a mailbox are enumerated via
//! the paged `/users` endpoint. Exclusions apply case-insensitively in both
//! modes. Discovery runs once at startup; mailbox additions and removals are
//! picked up on restart.

use reqwest::Method;
use serde::Deserialize;
use std::collections::HashSet;
use thiserror::Error;
use tracing::{debug, info};

use crate::graph::error::body_excerpt;
use crate::graph::{GraphClient, GraphError};
use crate::types::{TenantId, UserId};

/// Errors from user discovery. Partial pages already collected are
/// discarded when a later page fails.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("users endpoint returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("decode users response: {0}")]
    Decode(#[source] serde_json::Error),
}

/// A discovered mailbox user.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserInfo {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub mail: String,
    #[serde(rename = "displayName", default)]
    pub display_name: String,
    #[serde(rename = "userPrincipalName", default)]
    pub user_principal_name: String,
}

impl UserInfo {
    /// The identifier to use when creating a subscription: the directory
    /// GUID when known, else the mail address (the provider accepts both).
    pub fn subscription_identifier(&self) -> &str {
        if !self.id.is_empty() {
            &self.id
        } else {
            &self.mail
        }
    }

    /// The identifier the backfill path uses: the principal name when
    /// known, else the mail address.
    pub fn principal_or_mail(&self) -> &str {
        if !self.user_principal_name.is_empty() {
            &self.user_principal_name
        } else {
            &self.mail
        }
    }
}

/// One tenant's sweepable mailboxes, produced at startup.
#[derive(Debug, Clone)]
pub struct TenantRoster {
    pub tenant_id: TenantId,
    pub tenant_alias: String,
    pub users: Vec<UserId>,
}

#[derive(Deserialize)]
struct UsersPage {
    #[serde(default)]
    value: Vec<UserInfo>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
}

/// Discovers mailbox users for a tenant.
pub struct Discovery {
    base_url: String,
}

impl Discovery {
    pub fn new(base_url: impl Into<String>) -> Self {
        Discovery {
            base_url: base_url.into(),
        }
    }

    /// Returns the mailbox users to subscribe to for a tenant.
    pub async fn discover_users(
        &self,
        client: &GraphClient,
        tenant_alias: &str,
        include_users: &[String],
        exclude_users: &[String],
    ) -> Result<Vec<UserInfo>, DiscoveryError> {
        let exclude_set = lowercase_set(exclude_users);

        if !include_users.is_empty() {
            info!(
                tenant = %tenant_alias,
                count = include_users.len(),
                "using explicit user list"
            );
            return Ok(include_list_users(include_users, &exclude_set));
        }

        info!(tenant = %tenant_alias, "auto-discovering mailbox users");

        let mut users = Vec::new();
        let mut next_url = Some(format!(
            "{}/users?$filter=assignedLicenses/$count ne 0&$count=true\
             &$select=id,mail,displayName,userPrincipalName&$top=100",
            self.base_url
        ));

        while let Some(url) = next_url {
            let response = client
                .request(Method::GET, &url)
                .await?
                .header("ConsistencyLevel", "eventual")
                .send()
                .await
                .map_err(GraphError::from)?;

            let status = response.status();
            let body = response.text().await.map_err(GraphError::from)?;
            if !status.is_success() {
                return Err(DiscoveryError::Status {
                    status: status.as_u16(),
                    body: body_excerpt(&body),
                });
            }

            let page: UsersPage = serde_json::from_str(&body).map_err(DiscoveryError::Decode)?;

            for user in page.value {
                if user.mail.is_empty() {
                    continue;
                }
                if exclude_set.contains(&user.mail.to_lowercase()) {
                    debug!(mail = %user.mail, tenant = %tenant_alias, "excluding user");
                    continue;
                }
                users.push(user);
            }

            next_url = page.next_link;
        }

        info!(
            tenant = %tenant_alias,
            discovered = users.len(),
            "mailbox discovery complete"
        );

        Ok(users)
    }
}

/// Builds the user set from an explicit include-list, applying exclusions.
fn include_list_users(include_users: &[String], exclude_set: &HashSet<String>) -> Vec<UserInfo> {
    include_users
        .iter()
        .filter(|mail| !exclude_set.contains(&mail.to_lowercase()))
        .map(|mail| UserInfo {
            mail: mail.clone(),
            user_principal_name: mail.clone(),
            // The GUID is resolved implicitly at subscription time; the
            // provider accepts the principal address in its place.
            ..Default::default()
        })
        .collect()
}

fn lowercase_set(values: &[String]) -> HashSet<String> {
    values.iter().map(|v| v.to_lowercase()).collect()
}
