pub mod sqlite;

use thiserror::Error;

use crate::models::approval::{ApprovalAction, TrackedState};

pub use sqlite::SqliteStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("approval {0} is not tracked")]
    NotTracked(i64),

    #[error("no action link was issued with this token for approval {0}")]
    UnknownToken(i64),

    #[error("approval {approval_id} is {state}; cannot {operation}")]
    InvalidTransition {
        approval_id: i64,
        state: TrackedState,
        operation: &'static str,
    },

    #[error("stored record for approval {approval_id} is unreadable: {reason}")]
    Corrupt { approval_id: i64, reason: String },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("database migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    /// The approval was tracked by an earlier poll. `needs_notification` is
    /// set when that poll never got as far as notifying reviewers.
    AlreadyTracked { needs_notification: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Consumption {
    /// This caller consumed the approval; `action` is now its recorded decision.
    Won { action: ApprovalAction },
    /// Someone got there first. Carries the record's current state.
    AlreadyConsumed { state: TrackedState },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    Failed { error: String, max_attempts: u32 },
    InfoRequested,
}
