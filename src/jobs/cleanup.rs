//! Background job: expire approvals nobody decided.
//!
//! Runs hourly. Pending records older than the retention window move to
//! `expired` and are archived; their links then render "already actioned".

use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::store::{SqliteStore, StoreError};

/// Spawn the background cleanup task. Call this once at startup.
pub fn spawn(store: SqliteStore, retention_days: u32, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = time::interval(Duration::from_secs(3600)); // every hour
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            if let Err(e) = expire_stale(&store, retention_days).await {
                tracing::error!("cleanup job failed: {}", e);
            }
        }
    })
}

/// Expire pending approvals created more than `retention_days` ago.
pub async fn expire_stale(store: &SqliteStore, retention_days: u32) -> Result<Vec<i64>, StoreError> {
    let now = Utc::now();
    let expired = store
        .expire_stale(now - chrono::Duration::days(i64::from(retention_days.max(1))), now)
        .await?;
    if !expired.is_empty() {
        tracing::info!(count = expired.len(), ids = ?expired, "expired undecided approvals");
    }
    Ok(expired)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::models::approval::{ApprovalKind, ApprovalRequest, Scope, TrackedState, STATUS_REQUESTED};
    use crate::models::rule::RoutingRule;

    fn approval(id: i64) -> ApprovalRequest {
        ApprovalRequest {
            id,
            name: format!("APPROVAL-{:07}", id),
            request_type: "Provision Instance".into(),
            status: STATUS_REQUESTED.into(),
            date_created: None,
            request_by: "requester".into(),
            items: vec![],
            scope: Scope::default(),
        }
    }

    fn rule() -> RoutingRule {
        RoutingRule {
            description: "all provisioning".into(),
            actions: BTreeSet::from([ApprovalKind::Provision]),
            template: None,
            recipients: vec!["ops@example.com".into()],
            scope: None,
            linked_approval: false,
        }
    }

    #[tokio::test]
    async fn test_expires_only_past_retention() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(&dir.path().join("link.db")).await.unwrap();
        store.migrate().await.unwrap();
        store
            .create_tracked(&approval(1), &rule(), Utc::now() - chrono::Duration::days(31))
            .await
            .unwrap();
        store.create_tracked(&approval(2), &rule(), Utc::now()).await.unwrap();

        assert_eq!(expire_stale(&store, 30).await.unwrap(), vec![1]);
        assert_eq!(store.get(1).await.unwrap().unwrap().state, TrackedState::Expired);
        assert_eq!(store.get(2).await.unwrap().unwrap().state, TrackedState::Pending);
        assert!(expire_stale(&store, 30).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_zero_retention_keeps_fresh_approvals() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(&dir.path().join("link.db")).await.unwrap();
        store.migrate().await.unwrap();
        store.create_tracked(&approval(1), &rule(), Utc::now()).await.unwrap();

        assert!(expire_stale(&store, 0).await.unwrap().is_empty());
        assert_eq!(store.get(1).await.unwrap().unwrap().state, TrackedState::Pending);
    }

    #[tokio::test]
    async fn test_spawned_job_stops_on_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(&dir.path().join("link.db")).await.unwrap();
        store.migrate().await.unwrap();
        store
            .create_tracked(&approval(1), &rule(), Utc::now() - chrono::Duration::days(40))
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let handle = spawn(store.clone(), 30, cancel.clone());
        // the first interval tick fires immediately
        for _ in 0..50 {
            if store.get(1).await.unwrap().unwrap().state == TrackedState::Expired {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(store.get(1).await.unwrap().unwrap().state, TrackedState::Expired);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
