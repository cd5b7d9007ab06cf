use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Path, State},
    http::HeaderMap,
    response::{Html, IntoResponse, Response},
};
use chrono::Utc;

use super::pages;
use crate::errors::{AppError, Classify, ErrorKind};
use crate::models::approval::{ApprovalAction, TrackedState};
use crate::state::AppState;
use crate::store::{ApplyOutcome, Consumption, StoreError};
use crate::token::{self, VerifiedToken};

pub async fn ping() -> &'static str {
    "Link is up\n"
}

/// GET /action/:token
///
/// Acts immediately unless confirmation is required, in which case the
/// reviewer gets a form that POSTs back to the same path.
pub async fn action_link(
    State(state): State<Arc<AppState>>,
    Path(raw): Path<String>,
    headers: HeaderMap,
    peer: Option<ConnectInfo<SocketAddr>>,
) -> Result<Response, AppError> {
    let verified = state.codec.verify(&raw, Utc::now())?;

    if state.require_confirm {
        let tracked = state
            .store
            .get(verified.approval_id)
            .await?
            .ok_or(StoreError::NotTracked(verified.approval_id))?;
        if tracked.state != TrackedState::Pending {
            return Ok(Html(pages::already_actioned(tracked.approval_id, tracked.state)).into_response());
        }
        let post_path = format!("/action/{}", raw);
        return Ok(Html(pages::confirm(verified.approval_id, verified.action, &post_path)).into_response());
    }

    execute(&state, &raw, verified, actor(&headers, peer)).await
}

/// POST /action/:token
pub async fn confirm_action(
    State(state): State<Arc<AppState>>,
    Path(raw): Path<String>,
    headers: HeaderMap,
    peer: Option<ConnectInfo<SocketAddr>>,
) -> Result<Response, AppError> {
    let verified = state.codec.verify(&raw, Utc::now())?;
    execute(&state, &raw, verified, actor(&headers, peer)).await
}

async fn execute(
    state: &AppState,
    raw: &str,
    verified: VerifiedToken,
    actor: String,
) -> Result<Response, AppError> {
    let approval_id = verified.approval_id;
    let consumption = state
        .store
        .try_consume(approval_id, &token::digest(raw), &actor, Utc::now())
        .await
        .map_err(|e| log_store_error(approval_id, "consume", e))?;

    let action = match consumption {
        Consumption::AlreadyConsumed { state: current } => {
            tracing::info!(approval_id, actor = %actor, state = %current, "replayed action link");
            return Ok(Html(pages::already_actioned(approval_id, current)).into_response());
        }
        Consumption::Won { action } => action,
    };
    tracing::info!(approval_id, %action, actor = %actor, "decision recorded");

    match action {
        ApprovalAction::RequestInfo => {
            state
                .store
                .finalize(approval_id, ApplyOutcome::InfoRequested, Utc::now())
                .await
                .map_err(|e| log_store_error(approval_id, "archive info request", e))?;
            if let Some(tracked) = state.store.get(approval_id).await? {
                if let Err(e) = state
                    .notifier
                    .info_requested(&tracked.approval, &actor)
                    .await
                {
                    tracing::warn!(approval_id, error = %e, "failed to send info request");
                }
            }
            Ok(Html(pages::info_requested(approval_id)).into_response())
        }
        ApprovalAction::Approve | ApprovalAction::Deny => {
            let applied = state
                .applier
                .apply_once(approval_id, action)
                .await
                .map_err(|e| log_store_error(approval_id, "record apply", e))?;
            match applied {
                TrackedState::Applied => Ok(Html(pages::applied(approval_id, action)).into_response()),
                TrackedState::Decided => {
                    state.applier.spawn_retry(approval_id, action);
                    Ok(Html(pages::apply_pending(approval_id)).into_response())
                }
                _ => Ok(Html(pages::apply_pending(approval_id)).into_response()),
            }
        }
    }
}

fn log_store_error(approval_id: i64, operation: &'static str, e: StoreError) -> StoreError {
    if e.kind() == ErrorKind::Durability {
        tracing::error!(approval_id, operation, error = %e, "state store failure");
    }
    e
}

/// Who clicked: first X-Forwarded-For hop, else the TCP peer.
fn actor(headers: &HeaderMap, peer: Option<ConnectInfo<SocketAddr>>) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .or_else(|| peer.map(|ConnectInfo(addr)| addr.ip().to_string()))
        .unwrap_or_else(|| "unknown".to_string())
}
