//! Background job: pull new approvals from Morpheus and notify reviewers.
//!
//! Each tick lists approvals above the stored cursor, matches each one against
//! the routing rules, records matches with one action token per reviewer
//! action, notifies, and finally advances the cursor. A failure at approval X
//! stops the tick and leaves the cursor at the last id handled before X, so X
//! is retried next tick.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::errors::{Classify, ErrorKind};
use crate::models::approval::{ApprovalAction, ApprovalRequest};
use crate::models::rule::{RuleSet, DEFAULT_TEMPLATE};
use crate::notification::{Notice, Notifier};
use crate::routing::match_rule;
use crate::store::{CreateOutcome, SqliteStore, StoreError};
use crate::token::TokenCodec;
use crate::upstream::{UpstreamClient, UpstreamError};

#[derive(Debug, Error)]
pub enum PollError {
    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Approvals above the cursor that upstream returned.
    pub seen: usize,
    /// Approvals that matched a rule and are now tracked.
    pub tracked: usize,
    pub notified: usize,
    /// Cursor after the tick.
    pub cursor: i64,
    /// Id the tick stopped at after an error, if any.
    pub stopped_at: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Handled {
    NotAwaiting,
    Unmatched,
    AlreadyNotified,
    Tracked { notified: bool },
}

pub struct Poller {
    store: SqliteStore,
    upstream: Arc<UpstreamClient>,
    codec: Arc<TokenCodec>,
    notifier: Arc<dyn Notifier>,
    rules: Arc<RuleSet>,
    public_url: String,
    page_size: u32,
}

impl Poller {
    pub fn new(
        store: SqliteStore,
        upstream: Arc<UpstreamClient>,
        codec: Arc<TokenCodec>,
        notifier: Arc<dyn Notifier>,
        rules: Arc<RuleSet>,
        public_url: &str,
        page_size: u32,
    ) -> Self {
        Self {
            store,
            upstream,
            codec,
            notifier,
            rules,
            public_url: public_url.trim_end_matches('/').to_string(),
            page_size,
        }
    }

    pub async fn tick(&self, cancel: &CancellationToken) -> Result<TickReport, PollError> {
        let since = self.store.cursor().await?;
        let approvals = self
            .upstream
            .list_approvals(since, self.page_size, cancel)
            .await?;

        let mut report = TickReport {
            seen: approvals.len(),
            ..Default::default()
        };
        let mut last_handled = since;

        for summary in &approvals {
            match self.handle(summary, cancel).await {
                Ok(handled) => {
                    if let Handled::Tracked { notified } = handled {
                        report.tracked += 1;
                        if notified {
                            report.notified += 1;
                        }
                    }
                    last_handled = summary.id;
                }
                Err(e) if e.kind() == ErrorKind::Durability => {
                    tracing::error!(
                        approval_id = summary.id,
                        error = %e,
                        "state store failed while handling approval; cursor held before it"
                    );
                    report.stopped_at = Some(summary.id);
                    break;
                }
                Err(e) => {
                    tracing::warn!(
                        approval_id = summary.id,
                        error = %e,
                        "failed to handle approval; cursor held before it"
                    );
                    report.stopped_at = Some(summary.id);
                    break;
                }
            }
        }

        report.cursor = self.store.advance_cursor(last_handled).await?;
        Ok(report)
    }

    async fn handle(&self, summary: &ApprovalRequest, cancel: &CancellationToken) -> Result<Handled, PollError> {
        if !summary.is_awaiting_decision() {
            tracing::debug!(approval_id = summary.id, status = %summary.status, "not awaiting a decision");
            return Ok(Handled::NotAwaiting);
        }

        let detail = self.upstream.get_approval(summary.id, cancel).await?;
        let approval = summary.refined_by(detail);

        let Some(rule) = match_rule(&approval, self.rules.rules()) else {
            tracing::debug!(
                approval_id = approval.id,
                request_type = %approval.request_type,
                "no routing rule matched"
            );
            return Ok(Handled::Unmatched);
        };

        let now = Utc::now();
        match self.store.create_tracked(&approval, rule, now).await? {
            CreateOutcome::Created => {
                tracing::info!(approval_id = approval.id, rule = %rule.description, "tracking approval");
            }
            CreateOutcome::AlreadyTracked {
                needs_notification: false,
            } => return Ok(Handled::AlreadyNotified),
            CreateOutcome::AlreadyTracked {
                needs_notification: true,
            } => {
                tracing::info!(approval_id = approval.id, "approval tracked but never notified; notifying again");
            }
        }

        // Recipients come from the stored record so a rule edit between ticks
        // does not change who an already-tracked approval goes to.
        let tracked = self
            .store
            .get(approval.id)
            .await?
            .ok_or(StoreError::NotTracked(approval.id))?;

        let expires_at = self.codec.expires_at(now);
        let mut links = BTreeMap::new();
        for action in ApprovalAction::ALL {
            let token = self.codec.issue(approval.id, action, now);
            self.store
                .issue_token_record(approval.id, action, &token, now, expires_at)
                .await?;
            links.insert(action, format!("{}/action/{}", self.public_url, token));
        }

        let notice = Notice {
            approval: &approval,
            rule_description: &tracked.rule_description,
            template: tracked.template.as_deref().unwrap_or(DEFAULT_TEMPLATE),
            recipients: &tracked.recipients,
            linked: tracked.linked,
            links: &links,
        };
        if let Err(e) = self.notifier.notify(&notice).await {
            tracing::warn!(approval_id = approval.id, error = %e, "failed to notify reviewers");
            return Ok(Handled::Tracked { notified: false });
        }

        self.store.mark_notified(approval.id, Utc::now()).await?;
        tracing::info!(
            approval_id = approval.id,
            recipients = tracked.recipients.len(),
            "reviewers notified"
        );
        Ok(Handled::Tracked { notified: true })
    }
}

/// Spawn the poll loop. Ticks every `interval` until `cancel` fires.
pub fn spawn(poller: Arc<Poller>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match poller.tick(&cancel).await {
                Ok(report) => tracing::info!(
                    seen = report.seen,
                    tracked = report.tracked,
                    notified = report.notified,
                    cursor = report.cursor,
                    "checked Morpheus for new approvals"
                ),
                Err(e) if e.kind() == ErrorKind::Durability => {
                    tracing::error!(error = %e, "poll tick failed: state store unavailable")
                }
                Err(e) => tracing::warn!(error = %e, "poll tick failed"),
            }
        }
        tracing::info!("poller stopped");
    })
}
