//! Client for the Morpheus approvals API.
//!
//! Calls are never retried here: the poller retries on its next tick and the
//! apply path has its own bounded retry. Every call races the caller's
//! cancellation token so shutdown is not held up by a slow appliance.

use std::collections::HashSet;
use std::time::Duration;

use anyhow::Context;
use reqwest::header::AUTHORIZATION;
use reqwest::RequestBuilder;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::models::approval::{ApprovalAction, ApprovalRequest};

/// Upper bound on list requests per call.
const MAX_PAGES: u32 = 500;

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("upstream rejected the request with status {status}")]
    Rejected { status: u16 },

    #[error("upstream unreachable: {0}")]
    Unreachable(String),

    #[error("upstream returned an unexpected body: {0}")]
    Malformed(String),

    #[error("upstream call cancelled by shutdown")]
    Cancelled,

    #[error("'{0}' is not an upstream action")]
    NotApplicable(ApprovalAction),
}

#[derive(Deserialize)]
struct ApprovalPage {
    #[serde(default)]
    approvals: Vec<ApprovalRequest>,
}

#[derive(Deserialize)]
struct ApprovalDetail {
    approval: ApprovalRequest,
}

pub struct UpstreamClient {
    client: reqwest::Client,
    base_url: String,
    bearer: String,
}

impl UpstreamClient {
    pub fn new(
        base_url: &str,
        bearer: &str,
        accept_invalid_certs: bool,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .danger_accept_invalid_certs(accept_invalid_certs)
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(5))
            .user_agent(concat!("Link/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build upstream HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            bearer: bearer.to_string(),
        })
    }

    /// All approvals with an id above `since_id`, ascending by id.
    ///
    /// Pages with `max`/`offset` until the platform returns a short page.
    pub async fn list_approvals(
        &self,
        since_id: i64,
        page_size: u32,
        cancel: &CancellationToken,
    ) -> Result<Vec<ApprovalRequest>, UpstreamError> {
        let url = format!("{}/api/approvals", self.base_url);
        let page_size = page_size.max(1);
        let mut offset: u64 = 0;
        let mut seen = HashSet::new();
        let mut found = Vec::new();

        for page_no in 1..=MAX_PAGES {
            let req = self
                .client
                .get(&url)
                .query(&[("max", u64::from(page_size)), ("offset", offset)]);
            let page: ApprovalPage = self.send_json(req, cancel).await?;
            let returned = page.approvals.len();
            let mut fresh = 0;
            for approval in page.approvals {
                if seen.insert(approval.id) {
                    fresh += 1;
                    if approval.id > since_id {
                        found.push(approval);
                    }
                }
            }

            if returned < page_size as usize {
                break;
            }
            // an appliance that ignores offset keeps returning the same page
            if fresh == 0 {
                tracing::warn!(offset, "upstream page repeated already-seen approvals; paging stopped");
                break;
            }
            if page_no == MAX_PAGES {
                tracing::warn!(pages = MAX_PAGES, "upstream page limit reached; remaining approvals wait for the next tick");
            }
            offset += returned as u64;
        }

        found.sort_by_key(|a| a.id);
        tracing::debug!(since_id, count = found.len(), "listed upstream approvals");
        Ok(found)
    }

    pub async fn get_approval(
        &self,
        id: i64,
        cancel: &CancellationToken,
    ) -> Result<ApprovalRequest, UpstreamError> {
        let url = format!("{}/api/approvals/{}", self.base_url, id);
        let detail: ApprovalDetail = self.send_json(self.client.get(&url), cancel).await?;
        Ok(detail.approval)
    }

    /// Relay a reviewer's decision. Only approve and deny are upstream actions.
    pub async fn apply_decision(
        &self,
        id: i64,
        action: ApprovalAction,
        cancel: &CancellationToken,
    ) -> Result<(), UpstreamError> {
        let name = action
            .upstream_action()
            .ok_or(UpstreamError::NotApplicable(action))?;
        let url = format!("{}/api/approvals/{}/action", self.base_url, id);
        let req = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "id": id, "action": name }));
        self.send(req, cancel).await?;
        tracing::info!(approval_id = id, action = name, "decision applied upstream");
        Ok(())
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        req: RequestBuilder,
        cancel: &CancellationToken,
    ) -> Result<T, UpstreamError> {
        let body = self.send(req, cancel).await?;
        serde_json::from_slice(&body).map_err(|e| UpstreamError::Malformed(e.to_string()))
    }

    async fn send(&self, req: RequestBuilder, cancel: &CancellationToken) -> Result<Vec<u8>, UpstreamError> {
        let call = async {
            let resp = req
                .header(AUTHORIZATION, format!("BEARER {}", self.bearer))
                .send()
                .await
                .map_err(|e| UpstreamError::Unreachable(e.to_string()))?;

            let status = resp.status();
            if !status.is_success() {
                tracing::warn!(url = %resp.url(), status = %status, "upstream returned non-success status");
                return Err(UpstreamError::Rejected {
                    status: status.as_u16(),
                });
            }

            resp.bytes()
                .await
                .map(|b| b.to_vec())
                .map_err(|e| UpstreamError::Unreachable(e.to_string()))
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(UpstreamError::Cancelled),
            result = call => result,
        }
    }
}
