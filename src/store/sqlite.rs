//! Durable approval state on SQLite.
//!
//! Every method commits before it returns. Mutual exclusion between racing
//! reviewers comes from conditional single-statement updates
//! (`... WHERE approval_id = ? AND state = 'pending'`), so clicks on different
//! approvals never wait on each other beyond SQLite's own write serialization.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::types::Json;
use sqlx::SqlitePool;

use super::{ApplyOutcome, Consumption, CreateOutcome, StoreError};
use crate::models::approval::{
    ApprovalAction, ApprovalRequest, Decision, TrackedApproval, TrackedState,
};
use crate::models::rule::RoutingRule;
use crate::token;

const TOKEN_SECRET_KEY: &str = "token_secret";

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?;
        Self::connect_with(options).await
    }

    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        Self::connect_with(SqliteConnectOptions::new().filename(path)).await
    }

    async fn connect_with(options: SqliteConnectOptions) -> Result<Self, StoreError> {
        let options = options
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full)
            .busy_timeout(Duration::from_secs(10))
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    /// Run pending migrations from the migrations/ directory.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    // -- Tracked approvals --

    /// Start tracking an approval. Idempotent on approval id: a repeat call
    /// leaves the existing record, its recipients and its tokens untouched.
    pub async fn create_tracked(
        &self,
        approval: &ApprovalRequest,
        rule: &RoutingRule,
        now: DateTime<Utc>,
    ) -> Result<CreateOutcome, StoreError> {
        let inserted = sqlx::query(
            r#"INSERT INTO tracked_approvals
                   (approval_id, state, rule_description, template, recipients, linked, snapshot, created_at)
               VALUES (?1, 'pending', ?2, ?3, ?4, ?5, ?6, ?7)
               ON CONFLICT (approval_id) DO NOTHING"#,
        )
        .bind(approval.id)
        .bind(&rule.description)
        .bind(&rule.template)
        .bind(Json(&rule.recipients))
        .bind(rule.linked_approval)
        .bind(Json(approval))
        .bind(now)
        .execute(&self.pool)
        .await?;

        if inserted.rows_affected() > 0 {
            return Ok(CreateOutcome::Created);
        }

        let needs_notification = sqlx::query_scalar::<_, bool>(
            "SELECT notified_at IS NULL AND state = 'pending' FROM tracked_approvals WHERE approval_id = ?1",
        )
        .bind(approval.id)
        .fetch_one(&self.pool)
        .await?;
        Ok(CreateOutcome::AlreadyTracked { needs_notification })
    }

    /// Record an issued token by digest. Returns the digest.
    pub async fn issue_token_record(
        &self,
        approval_id: i64,
        action: ApprovalAction,
        token: &str,
        issued_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<String, StoreError> {
        let digest = token::digest(token);
        sqlx::query(
            r#"INSERT INTO action_tokens (digest, approval_id, action, issued_at, expires_at)
               VALUES (?1, ?2, ?3, ?4, ?5)"#,
        )
        .bind(&digest)
        .bind(approval_id)
        .bind(action.as_str())
        .bind(issued_at)
        .bind(expires_at)
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db)
                if db.kind() == sqlx::error::ErrorKind::ForeignKeyViolation =>
            {
                StoreError::NotTracked(approval_id)
            }
            other => StoreError::Database(other),
        })?;
        Ok(digest)
    }

    pub async fn mark_notified(&self, approval_id: i64, now: DateTime<Utc>) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE tracked_approvals SET notified_at = ?1 WHERE approval_id = ?2")
            .bind(now)
            .bind(approval_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotTracked(approval_id));
        }
        Ok(())
    }

    /// Consume the approval with the token identified by `digest`.
    ///
    /// Exactly one caller per approval id ever observes `Won`, whichever
    /// token it presents; the recorded token decides the action. On `Won` the
    /// record is already durably `decided` (or `info_requested`).
    pub async fn try_consume(
        &self,
        approval_id: i64,
        digest: &str,
        actor: &str,
        now: DateTime<Utc>,
    ) -> Result<Consumption, StoreError> {
        let won = sqlx::query_scalar::<_, String>(
            r#"UPDATE tracked_approvals
               SET state = CASE (SELECT action FROM action_tokens WHERE digest = ?1 AND approval_id = ?2)
                               WHEN 'request-info' THEN 'info_requested'
                               ELSE 'decided'
                           END,
                   decided_action = (SELECT action FROM action_tokens WHERE digest = ?1 AND approval_id = ?2),
                   decided_by = ?3,
                   decided_at = ?4,
                   consumed_digest = ?1
               WHERE approval_id = ?2
                 AND state = 'pending'
                 AND EXISTS (SELECT 1 FROM action_tokens WHERE digest = ?1 AND approval_id = ?2)
               RETURNING decided_action"#,
        )
        .bind(digest)
        .bind(approval_id)
        .bind(actor)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(action) = won {
            let action = parse_action(approval_id, &action)?;
            return Ok(Consumption::Won { action });
        }

        let state = self.state_of(approval_id).await?;
        let known = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM action_tokens WHERE digest = ?1 AND approval_id = ?2)",
        )
        .bind(digest)
        .bind(approval_id)
        .fetch_one(&self.pool)
        .await?;
        if !known {
            return Err(StoreError::UnknownToken(approval_id));
        }
        Ok(Consumption::AlreadyConsumed { state })
    }

    /// Record the result of acting on a consumed approval. Returns the state
    /// the record is left in.
    pub async fn finalize(
        &self,
        approval_id: i64,
        outcome: ApplyOutcome,
        now: DateTime<Utc>,
    ) -> Result<TrackedState, StoreError> {
        let (operation, updated) = match outcome {
            ApplyOutcome::Applied => (
                "mark applied",
                sqlx::query_scalar::<_, String>(
                    r#"UPDATE tracked_approvals
                       SET state = 'applied',
                           apply_attempts = apply_attempts + 1,
                           last_error = NULL,
                           applied_at = ?1,
                           archived_at = ?1
                       WHERE approval_id = ?2 AND state = 'decided'
                       RETURNING state"#,
                )
                .bind(now)
                .bind(approval_id)
                .fetch_optional(&self.pool)
                .await?,
            ),
            ApplyOutcome::Failed { error, max_attempts } => (
                "record apply failure",
                sqlx::query_scalar::<_, String>(
                    r#"UPDATE tracked_approvals
                       SET apply_attempts = apply_attempts + 1,
                           last_error = ?1,
                           state = CASE WHEN apply_attempts + 1 >= ?2 THEN 'apply_failed' ELSE 'decided' END
                       WHERE approval_id = ?3 AND state = 'decided'
                       RETURNING state"#,
                )
                .bind(error)
                .bind(i64::from(max_attempts))
                .bind(approval_id)
                .fetch_optional(&self.pool)
                .await?,
            ),
            ApplyOutcome::InfoRequested => (
                "archive info request",
                sqlx::query_scalar::<_, String>(
                    r#"UPDATE tracked_approvals
                       SET archived_at = ?1
                       WHERE approval_id = ?2 AND state = 'info_requested' AND archived_at IS NULL
                       RETURNING state"#,
                )
                .bind(now)
                .bind(approval_id)
                .fetch_optional(&self.pool)
                .await?,
            ),
        };

        match updated {
            Some(state) => parse_state(approval_id, &state),
            None => Err(StoreError::InvalidTransition {
                approval_id,
                state: self.state_of(approval_id).await?,
                operation,
            }),
        }
    }

    /// Put an `apply_failed` record back to `decided` with a fresh attempt budget.
    pub async fn requeue_failed(&self, approval_id: i64) -> Result<ApprovalAction, StoreError> {
        let action = sqlx::query_scalar::<_, String>(
            r#"UPDATE tracked_approvals
               SET state = 'decided', apply_attempts = 0
               WHERE approval_id = ?1 AND state = 'apply_failed'
               RETURNING decided_action"#,
        )
        .bind(approval_id)
        .fetch_optional(&self.pool)
        .await?;
        match action {
            Some(a) => parse_action(approval_id, &a),
            None => Err(StoreError::InvalidTransition {
                approval_id,
                state: self.state_of(approval_id).await?,
                operation: "requeue",
            }),
        }
    }

    /// Decisions that were consumed but not yet accepted upstream.
    pub async fn list_unapplied(&self) -> Result<Vec<(i64, ApprovalAction)>, StoreError> {
        let rows = sqlx::query_as::<_, (i64, String)>(
            "SELECT approval_id, decided_action FROM tracked_approvals WHERE state = 'decided' ORDER BY approval_id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|(id, action)| Ok((id, parse_action(id, &action)?)))
            .collect()
    }

    /// Archive pending approvals created before `before`. Returns their ids.
    pub async fn expire_stale(
        &self,
        before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<i64>, StoreError> {
        let ids = sqlx::query_scalar::<_, i64>(
            r#"UPDATE tracked_approvals
               SET state = 'expired', archived_at = ?1
               WHERE state = 'pending' AND julianday(created_at) < julianday(?2)
               RETURNING approval_id"#,
        )
        .bind(now)
        .bind(before)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    pub async fn get(&self, approval_id: i64) -> Result<Option<TrackedApproval>, StoreError> {
        let row = sqlx::query_as::<_, TrackedRow>(&format!(
            "SELECT {} FROM tracked_approvals WHERE approval_id = ?1",
            TRACKED_COLUMNS
        ))
        .bind(approval_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(TrackedApproval::try_from).transpose()
    }

    /// Tracked approvals, newest first. Archived records only when asked.
    pub async fn list(&self, include_archived: bool) -> Result<Vec<TrackedApproval>, StoreError> {
        let sql = if include_archived {
            format!("SELECT {} FROM tracked_approvals ORDER BY approval_id DESC", TRACKED_COLUMNS)
        } else {
            format!(
                "SELECT {} FROM tracked_approvals WHERE archived_at IS NULL ORDER BY approval_id DESC",
                TRACKED_COLUMNS
            )
        };
        let rows = sqlx::query_as::<_, TrackedRow>(&sql).fetch_all(&self.pool).await?;
        rows.into_iter().map(TrackedApproval::try_from).collect()
    }

    pub async fn token_count(&self, approval_id: i64) -> Result<i64, StoreError> {
        let n = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM action_tokens WHERE approval_id = ?1")
            .bind(approval_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }

    async fn state_of(&self, approval_id: i64) -> Result<TrackedState, StoreError> {
        let state = sqlx::query_scalar::<_, String>("SELECT state FROM tracked_approvals WHERE approval_id = ?1")
            .bind(approval_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotTracked(approval_id))?;
        parse_state(approval_id, &state)
    }

    // -- Feed cursor --

    pub async fn cursor(&self) -> Result<i64, StoreError> {
        let id = sqlx::query_scalar::<_, i64>("SELECT last_id FROM feed_cursor WHERE id = 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(id)
    }

    /// Move the cursor forward to `id`. Never moves it backwards; returns the
    /// resulting value.
    pub async fn advance_cursor(&self, id: i64) -> Result<i64, StoreError> {
        let last = sqlx::query_scalar::<_, i64>(
            "UPDATE feed_cursor SET last_id = MAX(last_id, ?1) WHERE id = 1 RETURNING last_id",
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await?;
        Ok(last)
    }

    // -- Settings --

    /// The persisted token signing secret, generated on first use.
    pub async fn signing_secret(&self) -> Result<String, StoreError> {
        sqlx::query("INSERT INTO settings (key, value) VALUES (?1, ?2) ON CONFLICT (key) DO NOTHING")
            .bind(TOKEN_SECRET_KEY)
            .bind(token::generate_secret())
            .execute(&self.pool)
            .await?;
        let secret = sqlx::query_scalar::<_, String>("SELECT value FROM settings WHERE key = ?1")
            .bind(TOKEN_SECRET_KEY)
            .fetch_one(&self.pool)
            .await?;
        Ok(secret)
    }
}

const TRACKED_COLUMNS: &str = "approval_id, state, rule_description, template, recipients, linked, \
    snapshot, decided_action, decided_by, decided_at, apply_attempts, last_error, created_at, \
    notified_at, applied_at, archived_at";

#[derive(sqlx::FromRow)]
struct TrackedRow {
    approval_id: i64,
    state: String,
    rule_description: String,
    template: Option<String>,
    recipients: Json<Vec<String>>,
    linked: bool,
    snapshot: Json<ApprovalRequest>,
    decided_action: Option<String>,
    decided_by: Option<String>,
    decided_at: Option<DateTime<Utc>>,
    apply_attempts: i64,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    notified_at: Option<DateTime<Utc>>,
    applied_at: Option<DateTime<Utc>>,
    archived_at: Option<DateTime<Utc>>,
}

impl TryFrom<TrackedRow> for TrackedApproval {
    type Error = StoreError;

    fn try_from(row: TrackedRow) -> Result<Self, Self::Error> {
        let id = row.approval_id;
        let decision = match (row.decided_action, row.decided_at) {
            (Some(action), Some(decided_at)) => Some(Decision {
                action: parse_action(id, &action)?,
                actor: row.decided_by.unwrap_or_default(),
                decided_at,
            }),
            _ => None,
        };
        Ok(TrackedApproval {
            approval_id: id,
            state: parse_state(id, &row.state)?,
            rule_description: row.rule_description,
            template: row.template,
            recipients: row.recipients.0,
            linked: row.linked,
            approval: row.snapshot.0,
            decision,
            apply_attempts: row.apply_attempts,
            last_error: row.last_error,
            created_at: row.created_at,
            notified_at: row.notified_at,
            applied_at: row.applied_at,
            archived_at: row.archived_at,
        })
    }
}

fn parse_state(approval_id: i64, raw: &str) -> Result<TrackedState, StoreError> {
    raw.parse()
        .map_err(|reason| StoreError::Corrupt { approval_id, reason })
}

fn parse_action(approval_id: i64, raw: &str) -> Result<ApprovalAction, StoreError> {
    raw.parse()
        .map_err(|reason| StoreError::Corrupt { approval_id, reason })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use chrono::Duration as ChronoDuration;

    use super::*;
    use crate::models::approval::{ApprovalKind, Scope, STATUS_REQUESTED};

    async fn test_store() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(&dir.path().join("link.db")).await.unwrap();
        store.migrate().await.unwrap();
        (dir, store)
    }

    fn approval(id: i64) -> ApprovalRequest {
        ApprovalRequest {
            id,
            name: format!("APPROVAL-{:07}", id),
            request_type: "provision".into(),
            status: STATUS_REQUESTED.into(),
            date_created: None,
            request_by: "requester".into(),
            items: vec![],
            scope: Scope {
                group: Some("Prod".into()),
                ..Default::default()
            },
        }
    }

    fn rule() -> RoutingRule {
        RoutingRule {
            description: "prod".into(),
            actions: BTreeSet::from([ApprovalKind::Provision]),
            template: None,
            recipients: vec!["a@x".into(), "b@x".into()],
            scope: None,
            linked_approval: false,
        }
    }

    /// Track `id` and issue one token per action. Returns digests in
    /// `ApprovalAction::ALL` order.
    async fn track_with_tokens(store: &SqliteStore, id: i64) -> Vec<String> {
        let now = Utc::now();
        store.create_tracked(&approval(id), &rule(), now).await.unwrap();
        let mut digests = Vec::new();
        for action in ApprovalAction::ALL {
            let token = format!("token-{}-{}", id, action);
            let digest = store
                .issue_token_record(id, action, &token, now, now + ChronoDuration::days(7))
                .await
                .unwrap();
            digests.push(digest);
        }
        digests
    }

    #[tokio::test]
    async fn test_create_tracked_is_idempotent() {
        let (_dir, store) = test_store().await;
        let now = Utc::now();
        assert_eq!(
            store.create_tracked(&approval(42), &rule(), now).await.unwrap(),
            CreateOutcome::Created
        );
        store
            .issue_token_record(42, ApprovalAction::Approve, "t1", now, now)
            .await
            .unwrap();

        let mut changed = rule();
        changed.recipients = vec!["other@x".into()];
        assert_eq!(
            store.create_tracked(&approval(42), &changed, now).await.unwrap(),
            CreateOutcome::AlreadyTracked {
                needs_notification: true
            }
        );

        let tracked = store.get(42).await.unwrap().unwrap();
        assert_eq!(tracked.recipients, vec!["a@x", "b@x"]);
        assert_eq!(tracked.state, TrackedState::Pending);
        assert_eq!(store.token_count(42).await.unwrap(), 1);

        store.mark_notified(42, now).await.unwrap();
        assert_eq!(
            store.create_tracked(&approval(42), &rule(), now).await.unwrap(),
            CreateOutcome::AlreadyTracked {
                needs_notification: false
            }
        );
    }

    #[tokio::test]
    async fn test_token_for_untracked_approval_rejected() {
        let (_dir, store) = test_store().await;
        let now = Utc::now();
        let err = store
            .issue_token_record(99, ApprovalAction::Approve, "t", now, now)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotTracked(99)));
    }

    #[tokio::test]
    async fn test_first_consume_wins_then_replays_see_consumed() {
        let (_dir, store) = test_store().await;
        let digests = track_with_tokens(&store, 42).await;

        let first = store.try_consume(42, &digests[0], "10.0.0.1", Utc::now()).await.unwrap();
        assert_eq!(
            first,
            Consumption::Won {
                action: ApprovalAction::Approve
            }
        );

        for digest in &digests {
            let again = store.try_consume(42, digest, "10.0.0.2", Utc::now()).await.unwrap();
            assert_eq!(
                again,
                Consumption::AlreadyConsumed {
                    state: TrackedState::Decided
                }
            );
        }

        let tracked = store.get(42).await.unwrap().unwrap();
        let decision = tracked.decision.unwrap();
        assert_eq!(decision.action, ApprovalAction::Approve);
        assert_eq!(decision.actor, "10.0.0.1");
    }

    #[tokio::test]
    async fn test_request_info_moves_to_info_requested() {
        let (_dir, store) = test_store().await;
        let digests = track_with_tokens(&store, 5).await;
        let won = store.try_consume(5, &digests[2], "x", Utc::now()).await.unwrap();
        assert_eq!(
            won,
            Consumption::Won {
                action: ApprovalAction::RequestInfo
            }
        );
        assert_eq!(store.get(5).await.unwrap().unwrap().state, TrackedState::InfoRequested);

        let state = store
            .finalize(5, ApplyOutcome::InfoRequested, Utc::now())
            .await
            .unwrap();
        assert_eq!(state, TrackedState::InfoRequested);
        assert!(store.get(5).await.unwrap().unwrap().archived_at.is_some());
        assert!(store.list_unapplied().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_digest_and_untracked_id() {
        let (_dir, store) = test_store().await;
        let digests = track_with_tokens(&store, 1).await;
        track_with_tokens(&store, 2).await;

        let err = store.try_consume(1, "deadbeef", "x", Utc::now()).await.unwrap_err();
        assert!(matches!(err, StoreError::UnknownToken(1)));

        // a real digest presented against the wrong approval
        let err = store.try_consume(2, &digests[0], "x", Utc::now()).await.unwrap_err();
        assert!(matches!(err, StoreError::UnknownToken(2)));
        assert_eq!(store.get(2).await.unwrap().unwrap().state, TrackedState::Pending);

        let err = store.try_consume(77, &digests[0], "x", Utc::now()).await.unwrap_err();
        assert!(matches!(err, StoreError::NotTracked(77)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_consume_has_exactly_one_winner() {
        let (_dir, store) = test_store().await;
        let digests = track_with_tokens(&store, 42).await;

        let handles: Vec<_> = (0..24)
            .map(|i| {
                let store = store.clone();
                let digest = digests[i % 2].clone();
                tokio::spawn(async move {
                    store
                        .try_consume(42, &digest, &format!("client-{}", i), Utc::now())
                        .await
                        .unwrap()
                })
            })
            .collect();

        let results: Vec<Consumption> = futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        let winners: Vec<_> = results
            .iter()
            .filter_map(|r| match r {
                Consumption::Won { action } => Some(*action),
                _ => None,
            })
            .collect();
        assert_eq!(winners.len(), 1, "results: {:?}", results);

        let recorded = store.get(42).await.unwrap().unwrap().decision.unwrap();
        assert_eq!(recorded.action, winners[0]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_different_approvals_consume_independently() {
        let (_dir, store) = test_store().await;
        let mut all = Vec::new();
        for id in 1..=8 {
            all.push((id, track_with_tokens(&store, id).await));
        }

        let handles: Vec<_> = all
            .into_iter()
            .map(|(id, digests)| {
                let store = store.clone();
                tokio::spawn(async move { store.try_consume(id, &digests[1], "x", Utc::now()).await.unwrap() })
            })
            .collect();

        for result in futures::future::join_all(handles).await {
            assert_eq!(
                result.unwrap(),
                Consumption::Won {
                    action: ApprovalAction::Deny
                }
            );
        }
    }

    #[tokio::test]
    async fn test_finalize_transitions() {
        let (_dir, store) = test_store().await;
        let digests = track_with_tokens(&store, 3).await;

        // nothing consumed yet
        let err = store.finalize(3, ApplyOutcome::Applied, Utc::now()).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::InvalidTransition {
                state: TrackedState::Pending,
                ..
            }
        ));

        store.try_consume(3, &digests[0], "x", Utc::now()).await.unwrap();
        let state = store
            .finalize(
                3,
                ApplyOutcome::Failed {
                    error: "502".into(),
                    max_attempts: 3,
                },
                Utc::now(),
            )
            .await
            .unwrap();
        assert_eq!(state, TrackedState::Decided);
        assert_eq!(store.list_unapplied().await.unwrap(), vec![(3, ApprovalAction::Approve)]);

        let state = store.finalize(3, ApplyOutcome::Applied, Utc::now()).await.unwrap();
        assert_eq!(state, TrackedState::Applied);

        let tracked = store.get(3).await.unwrap().unwrap();
        assert_eq!(tracked.apply_attempts, 2);
        assert!(tracked.last_error.is_none());
        assert!(tracked.archived_at.is_some());
        assert!(store.list(false).await.unwrap().is_empty());
        assert_eq!(store.list(true).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_apply_failures_are_bounded_and_requeueable() {
        let (_dir, store) = test_store().await;
        let digests = track_with_tokens(&store, 8).await;
        store.try_consume(8, &digests[1], "x", Utc::now()).await.unwrap();

        let fail = || ApplyOutcome::Failed {
            error: "unreachable".into(),
            max_attempts: 2,
        };
        assert_eq!(store.finalize(8, fail(), Utc::now()).await.unwrap(), TrackedState::Decided);
        assert_eq!(store.finalize(8, fail(), Utc::now()).await.unwrap(), TrackedState::ApplyFailed);
        assert!(store.list_unapplied().await.unwrap().is_empty());

        assert_eq!(store.requeue_failed(8).await.unwrap(), ApprovalAction::Deny);
        assert_eq!(store.list_unapplied().await.unwrap(), vec![(8, ApprovalAction::Deny)]);
    }

    #[tokio::test]
    async fn test_cursor_is_monotonic() {
        let (_dir, store) = test_store().await;
        assert_eq!(store.cursor().await.unwrap(), 0);
        assert_eq!(store.advance_cursor(10).await.unwrap(), 10);
        assert_eq!(store.advance_cursor(4).await.unwrap(), 10);
        assert_eq!(store.advance_cursor(11).await.unwrap(), 11);
        assert_eq!(store.cursor().await.unwrap(), 11);
    }

    #[tokio::test]
    async fn test_expire_stale_only_touches_old_pending() {
        let (_dir, store) = test_store().await;
        let old = Utc::now() - ChronoDuration::days(30);
        store.create_tracked(&approval(1), &rule(), old).await.unwrap();
        store.create_tracked(&approval(2), &rule(), Utc::now()).await.unwrap();

        let expired = store
            .expire_stale(Utc::now() - ChronoDuration::days(14), Utc::now())
            .await
            .unwrap();
        assert_eq!(expired, vec![1]);
        assert_eq!(store.get(1).await.unwrap().unwrap().state, TrackedState::Expired);
        assert_eq!(store.get(2).await.unwrap().unwrap().state, TrackedState::Pending);
    }

    #[tokio::test]
    async fn test_state_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("link.db");

        let secret = {
            let store = SqliteStore::open(&path).await.unwrap();
            store.migrate().await.unwrap();
            let digests = track_with_tokens(&store, 42).await;
            store.try_consume(42, &digests[0], "x", Utc::now()).await.unwrap();
            store.advance_cursor(42).await.unwrap();
            let secret = store.signing_secret().await.unwrap();
            store.close().await;
            secret
        };

        let store = SqliteStore::open(&path).await.unwrap();
        store.migrate().await.unwrap();
        assert_eq!(store.cursor().await.unwrap(), 42);
        assert_eq!(store.get(42).await.unwrap().unwrap().state, TrackedState::Decided);
        assert_eq!(store.list_unapplied().await.unwrap(), vec![(42, ApprovalAction::Approve)]);
        assert_eq!(store.signing_secret().await.unwrap(), secret);
    }
}
