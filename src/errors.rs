use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use thiserror::Error;

use crate::api::pages;
use crate::config::ConfigError;
use crate::jobs::poller::PollError;
use crate::models::rule::RuleError;
use crate::store::StoreError;
use crate::token::TokenError;
use crate::upstream::UpstreamError;

/// Closed classification every component error maps onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad operator configuration. Fatal at startup.
    Config,
    /// Morpheus could not be reached or refused a call. Retried later.
    TransientUpstream,
    /// A reviewer presented a link that does not verify.
    Token,
    /// A valid link for an approval that was already actioned.
    Replay,
    /// The state store failed to read or commit.
    Durability,
}

pub trait Classify {
    fn kind(&self) -> ErrorKind;
}

impl Classify for ConfigError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Config
    }
}

impl Classify for RuleError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Config
    }
}

impl Classify for UpstreamError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::TransientUpstream
    }
}

impl Classify for TokenError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Token
    }
}

impl Classify for StoreError {
    fn kind(&self) -> ErrorKind {
        match self {
            StoreError::NotTracked(_) | StoreError::UnknownToken(_) => ErrorKind::Token,
            StoreError::InvalidTransition { .. } => ErrorKind::Replay,
            StoreError::Corrupt { .. } | StoreError::Database(_) | StoreError::Migrate(_) => {
                ErrorKind::Durability
            }
        }
    }
}

impl Classify for PollError {
    fn kind(&self) -> ErrorKind {
        match self {
            PollError::Upstream(e) => e.kind(),
            PollError::Store(e) => e.kind(),
        }
    }
}

/// Errors surfaced to a reviewer's browser. Rendered as HTML pages.
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Token(#[from] TokenError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl Classify for AppError {
    fn kind(&self) -> ErrorKind {
        match self {
            AppError::Token(e) => e.kind(),
            AppError::Store(e) => e.kind(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, title, message) = match (self.kind(), &self) {
            (ErrorKind::Token, AppError::Token(TokenError::Expired)) => (
                StatusCode::GONE,
                "Link expired",
                "This approval link has expired. Ask for the approval to be re-sent if it still needs a decision.",
            ),
            // authentic, but not a link this service issued
            (ErrorKind::Token, AppError::Store(_)) => (
                StatusCode::NOT_FOUND,
                "Link invalid",
                "This approval link is not recognised.",
            ),
            (ErrorKind::Token, _) => (
                StatusCode::BAD_REQUEST,
                "Link invalid",
                "This approval link is invalid. Check that the whole link was copied from the email.",
            ),
            (ErrorKind::Replay, _) => (
                StatusCode::OK,
                "Already actioned",
                "This approval has already been actioned.",
            ),
            (ErrorKind::Durability | ErrorKind::Config | ErrorKind::TransientUpstream, e) => {
                tracing::error!(error = %e, "request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Please try again",
                    "Your decision could not be recorded. Please try the link again in a moment.",
                )
            }
        };

        (status, Html(pages::message(title, message))).into_response()
    }
}
