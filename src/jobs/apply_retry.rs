//! Relays consumed decisions to Morpheus.
//!
//! The action endpoint makes one bounded attempt inline. If that fails the
//! record stays `decided` and a background task retries with exponential
//! back-off until upstream accepts it or the attempt budget is spent
//! (`apply_failed`). On startup every `decided` record is picked up again, so a
//! crash between consume and apply never loses a decision.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::models::approval::{ApprovalAction, TrackedState};
use crate::store::{ApplyOutcome, SqliteStore, StoreError};
use crate::upstream::{UpstreamClient, UpstreamError};

const MAX_RETRY_DELAY: Duration = Duration::from_secs(300);

#[derive(Clone)]
pub struct Applier {
    store: SqliteStore,
    upstream: Arc<UpstreamClient>,
    cancel: CancellationToken,
    timeout: Duration,
    max_attempts: u32,
    retry_base: Duration,
    retries: TaskTracker,
}

impl Applier {
    pub fn new(
        store: SqliteStore,
        upstream: Arc<UpstreamClient>,
        cancel: CancellationToken,
        timeout: Duration,
        max_attempts: u32,
    ) -> Self {
        Self {
            store,
            upstream,
            cancel,
            timeout,
            max_attempts,
            retry_base: Duration::from_secs(5),
            retries: TaskTracker::new(),
        }
    }

    /// First back-off delay; doubles per attempt up to five minutes.
    pub fn with_retry_base(mut self, retry_base: Duration) -> Self {
        self.retry_base = retry_base;
        self
    }

    /// Make one bounded apply attempt and record the result.
    ///
    /// Returns the state the record is left in: `Applied`, `Decided` (retry
    /// later) or `ApplyFailed`. A shutdown mid-call records nothing; the
    /// decision is picked up again on the next start.
    pub async fn apply_once(&self, approval_id: i64, action: ApprovalAction) -> Result<TrackedState, StoreError> {
        let call = self.upstream.apply_decision(approval_id, action, &self.cancel);
        let outcome = match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(())) => ApplyOutcome::Applied,
            Ok(Err(UpstreamError::Cancelled)) => {
                tracing::info!(approval_id, "apply interrupted by shutdown; will resume on restart");
                return Ok(TrackedState::Decided);
            }
            Ok(Err(e)) => {
                tracing::warn!(approval_id, %action, error = %e, "apply attempt failed");
                ApplyOutcome::Failed {
                    error: e.to_string(),
                    max_attempts: self.max_attempts,
                }
            }
            Err(_) => {
                tracing::warn!(approval_id, %action, timeout_secs = self.timeout.as_secs(), "apply attempt timed out");
                ApplyOutcome::Failed {
                    error: format!("timed out after {:?}", self.timeout),
                    max_attempts: self.max_attempts,
                }
            }
        };

        let state = self.store.finalize(approval_id, outcome, Utc::now()).await?;
        if state == TrackedState::ApplyFailed {
            tracing::error!(approval_id, %action, "apply retries exhausted; operator follow-up required");
        }
        Ok(state)
    }

    /// Retry in the background until the record leaves `decided`.
    pub fn spawn_retry(&self, approval_id: i64, action: ApprovalAction) -> JoinHandle<()> {
        let applier = self.clone();
        self.retries.spawn(async move {
            let mut delay = applier.retry_base;
            loop {
                tokio::select! {
                    _ = applier.cancel.cancelled() => {
                        tracing::debug!(approval_id, "apply retry stopped by shutdown");
                        return;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }

                match applier.apply_once(approval_id, action).await {
                    Ok(TrackedState::Decided) => {
                        delay = (delay * 2).min(MAX_RETRY_DELAY);
                    }
                    Ok(state) => {
                        tracing::info!(approval_id, %state, "apply retry finished");
                        return;
                    }
                    Err(e) => {
                        tracing::error!(approval_id, error = %e, "apply retry could not record its result");
                        return;
                    }
                }
            }
        })
    }

    /// Resume every decision left unapplied by an earlier run.
    pub async fn recover(&self) -> Result<usize, StoreError> {
        let pending = self.store.list_unapplied().await?;
        for (approval_id, action) in &pending {
            tracing::info!(approval_id, %action, "resuming unapplied decision");
            self.spawn_retry(*approval_id, *action);
        }
        Ok(pending.len())
    }

    /// Operator retry of an `apply_failed` record: requeue it, then keep
    /// retrying until it is applied, the budget is spent again, or shutdown.
    pub async fn retry_failed(&self, approval_id: i64) -> Result<TrackedState, StoreError> {
        let action = self.store.requeue_failed(approval_id).await?;
        tracing::info!(approval_id, %action, "requeued failed decision");

        if self.apply_once(approval_id, action).await? == TrackedState::Decided {
            if let Err(e) = self.spawn_retry(approval_id, action).await {
                tracing::error!(approval_id, error = %e, "apply retry task failed");
            }
        }
        self.store
            .get(approval_id)
            .await?
            .map(|t| t.state)
            .ok_or(StoreError::NotTracked(approval_id))
    }

    /// Wait for background retries to stop. Call after cancelling, before
    /// closing the store.
    pub async fn drain(&self) {
        self.retries.close();
        self.retries.wait().await;
    }
}
