//! Historical backfill: seed the analysis pipeline with existing mail.
//!
//! Lists messages within a lookback window from the provider's paged list
//! endpoint and pushes each through the shared delivery pipeline under the
//! `backfill:` dedup namespace. Throttles between pages to stay under the
//! provider's rate limits. Intended for new deployments and for recovering
//! the data-loss window after a delta-token expiry.

use reqwest::Method;
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::graph::error::body_excerpt;
use crate::graph::{GraphClient, GraphError};
use crate::pipeline::{Deliver, Origin, Outcome};
use crate::types::{MessageId, TenantId, UserId};

/// Default pause between page fetches.
const DEFAULT_PAGE_DELAY: Duration = Duration::from_millis(500);

/// Errors from a backfill run. Per-message failures are counted, not
/// propagated; these are the run-stopping cases.
#[derive(Debug, Error)]
pub enum BackfillError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("messages list returned HTTP {status}")]
    Status { status: u16 },

    #[error("decode messages response: {0}")]
    Decode(#[source] serde_json::Error),
}

/// The scope of one historical ingestion run.
#[derive(Debug, Clone)]
pub struct BackfillRequest {
    pub tenant_id: TenantId,
    pub tenant_alias: String,
    pub users: Vec<UserId>,
    /// Lookback window (e.g. 168 h for one week).
    pub since: Duration,
}

/// Summary of a completed run.
#[derive(Debug, Default)]
pub struct BackfillResult {
    pub tenant_alias: String,
    pub user_results: Vec<UserResult>,
    pub total_new: usize,
    pub total_skipped: usize,
    pub elapsed: Duration,
}

/// Per-user progress counters.
#[derive(Debug, Default)]
pub struct UserResult {
    pub user_id: String,
    pub fetched: usize,
    pub skipped: usize,
    pub errors: usize,
}

#[derive(Deserialize)]
struct MessagesPage {
    #[serde(default)]
    value: Vec<MessageStub>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
}

#[derive(Deserialize)]
struct MessageStub {
    #[serde(default)]
    id: String,
}

/// Performs historical email backfill through the shared pipeline.
pub struct Runner {
    graph_base_url: String,
    pipeline: Arc<dyn Deliver>,
    page_delay: Duration,
}

impl Runner {
    pub fn new(graph_base_url: impl Into<String>, pipeline: Arc<dyn Deliver>) -> Self {
        Runner {
            graph_base_url: graph_base_url.into(),
            pipeline,
            page_delay: DEFAULT_PAGE_DELAY,
        }
    }

    /// Overrides the inter-page throttle (tests use zero).
    pub fn with_page_delay(mut self, delay: Duration) -> Self {
        self.page_delay = delay;
        self
    }

    /// Runs the backfill for every requested user. A user-level failure is
    /// recorded and the run continues with the remaining users.
    pub async fn run(
        &self,
        client: &GraphClient,
        req: &BackfillRequest,
    ) -> Result<BackfillResult, BackfillError> {
        let started = Instant::now();
        let since_time = (chrono::Utc::now()
            - chrono::Duration::from_std(req.since).unwrap_or_default())
        .to_rfc3339_opts(chrono::SecondsFormat::Secs, true);

        info!(
            tenant = %req.tenant_alias,
            users = req.users.len(),
            since = %since_time,
            "starting historical backfill"
        );

        let mut result = BackfillResult {
            tenant_alias: req.tenant_alias.clone(),
            ..Default::default()
        };

        for user_id in &req.users {
            let user_result = match self
                .backfill_user(client, &req.tenant_id, &req.tenant_alias, user_id, &since_time)
                .await
            {
                Ok(ur) => ur,
                Err(e) => {
                    error!(
                        tenant = %req.tenant_alias,
                        user = %user_id,
                        error = %e,
                        "backfill failed for user"
                    );
                    UserResult {
                        user_id: user_id.to_string(),
                        errors: 1,
                        ..Default::default()
                    }
                }
            };

            result.total_new += user_result.fetched;
            result.total_skipped += user_result.skipped;
            result.user_results.push(user_result);
        }

        result.elapsed = started.elapsed();

        info!(
            tenant = %result.tenant_alias,
            total_new = result.total_new,
            total_skipped = result.total_skipped,
            elapsed_secs = result.elapsed.as_secs(),
            "historical backfill complete"
        );

        Ok(result)
    }

    async fn backfill_user(
        &self,
        client: &GraphClient,
        tenant_id: &TenantId,
        tenant_alias: &str,
        user_id: &UserId,
        since_time: &str,
    ) -> Result<UserResult, BackfillError> {
        let mut user_result = UserResult {
            user_id: user_id.to_string(),
            ..Default::default()
        };

        info!(
            tenant = %tenant_alias,
            user = %user_id,
            since = %since_time,
            "backfilling user mailbox"
        );

        let mut next_url = Some(format!(
            "{}/users/{}/messages?$filter=receivedDateTime ge {}\
             &$select=id&$orderby=receivedDateTime desc&$top=50",
            self.graph_base_url, user_id, since_time
        ));
        let mut page_count = 0usize;

        while let Some(url) = next_url {
            if page_count > 0 {
                tokio::time::sleep(self.page_delay).await;
            }

            let page = self.fetch_page(client, &url).await?;
            page_count += 1;

            debug!(
                user = %user_id,
                page = page_count,
                messages = page.value.len(),
                "backfill page fetched"
            );

            for stub in &page.value {
                let message_id = MessageId::new(&stub.id);
                match self
                    .pipeline
                    .deliver(tenant_id, tenant_alias, user_id, &message_id, Origin::Backfill)
                    .await
                {
                    Ok(Outcome::Published) => user_result.fetched += 1,
                    Ok(Outcome::Duplicate) | Ok(Outcome::Missing) => user_result.skipped += 1,
                    Err(e) => {
                        warn!(
                            message = %message_id,
                            error = %e,
                            "backfill delivery failed"
                        );
                        user_result.errors += 1;
                    }
                }
            }

            next_url = page.next_link;
        }

        info!(
            tenant = %tenant_alias,
            user = %user_id,
            fetched = user_result.fetched,
            skipped = user_result.skipped,
            errors = user_result.errors,
            pages = page_count,
            "user backfill complete"
        );

        Ok(user_result)
    }

    async fn fetch_page(
        &self,
        client: &GraphClient,
        url: &str,
    ) -> Result<MessagesPage, BackfillError> {
        let response = client
            .request(Method::GET, url)
            .await?
            .header("Prefer", "odata.maxpagesize=50")
            .send()
            .await
            .map_err(GraphError::from)?;

        let status = response.status();
        let body = response.text().await.map_err(GraphError::from)?;
        if !status.is_success() {
            error!(
                status = status.as_u16(),
                body = %body_excerpt(&body),
                "messages list error"
            );
            return Err(BackfillError::Status {
                status: status.as_u16(),
            });
        }

        serde_json::from_str(&body).map_err(BackfillError::Decode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::Router;
    use axum::routing::get;
    use std::sync::Mutex;

    use crate::pipeline::PipelineError;

    /// Pipeline double: every other message id is reported as a duplicate.
    #[derive(Default)]
    struct AlternatingPipeline {
        calls: Mutex<Vec<(String, Origin)>>,
    }

    #[async_trait]
    impl Deliver for AlternatingPipeline {
        async fn deliver(
            &self,
            _tenant_id: &TenantId,
            _tenant_alias: &str,
            _user_id: &UserId,
            message_id: &MessageId,
            origin: Origin,
        ) -> Result<Outcome, PipelineError> {
            let mut calls = self.calls.lock().unwrap();
            let outcome = if calls.len() % 2 == 0 {
                Outcome::Published
            } else {
                Outcome::Duplicate
            };
            calls.push((message_id.to_string(), origin));
            Ok(outcome)
        }
    }

    async fn spawn_stub(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn request_for(users: &[&str]) -> BackfillRequest {
        BackfillRequest {
            tenant_id: TenantId::new("t1"),
            tenant_alias: "acme".to_string(),
            users: users.iter().map(|u| UserId::new(*u)).collect(),
            since: Duration::from_secs(7 * 24 * 3600),
        }
    }

    #[tokio::test]
    async fn pages_through_the_list_and_counts_outcomes() {
        let router = Router::new()
            .route(
                "/users/{user}/messages",
                get(|req: axum::extract::Request| async move {
                    let host = req
                        .headers()
                        .get("host")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default()
                        .to_string();
                    axum::Json(serde_json::json!({
                        "value": [{"id": "m1"}, {"id": "m2"}],
                        "@odata.nextLink": format!("http://{host}/page2")
                    }))
                }),
            )
            .route(
                "/page2",
                get(|| async {
                    axum::Json(serde_json::json!({"value": [{"id": "m3"}]}))
                }),
            );
        let base = spawn_stub(router).await;

        let pipeline = Arc::new(AlternatingPipeline::default());
        let runner = Runner::new(&base, Arc::clone(&pipeline) as Arc<dyn Deliver>)
            .with_page_delay(Duration::ZERO);
        let client = GraphClient::with_static_token("test");

        let result = runner.run(&client, &request_for(&["u1"])).await.unwrap();

        // m1 published, m2 duplicate, m3 published.
        assert_eq!(result.total_new, 2);
        assert_eq!(result.total_skipped, 1);
        assert_eq!(result.user_results.len(), 1);
        assert_eq!(result.user_results[0].fetched, 2);
        assert_eq!(result.user_results[0].skipped, 1);

        let calls = pipeline.calls.lock().unwrap();
        assert!(calls.iter().all(|(_, origin)| *origin == Origin::Backfill));
    }

    #[tokio::test]
    async fn a_failing_user_does_not_stop_the_run() {
        let router = Router::new().route(
            "/users/{user}/messages",
            get(|axum::extract::Path(user): axum::extract::Path<String>| async move {
                if user == "broken" {
                    (
                        axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                        axum::Json(serde_json::json!({})),
                    )
                } else {
                    (
                        axum::http::StatusCode::OK,
                        axum::Json(serde_json::json!({"value": [{"id": "m1"}]})),
                    )
                }
            }),
        );
        let base = spawn_stub(router).await;

        let pipeline = Arc::new(AlternatingPipeline::default());
        let runner = Runner::new(&base, Arc::clone(&pipeline) as Arc<dyn Deliver>)
            .with_page_delay(Duration::ZERO);
        let client = GraphClient::with_static_token("test");

        let result = runner
            .run(&client, &request_for(&["broken", "u2"]))
            .await
            .unwrap();

        assert_eq!(result.user_results.len(), 2);
        assert_eq!(result.user_results[0].errors, 1);
        assert_eq!(result.user_results[1].fetched, 1);
    }
}
