//! Link: multi-person email approvals for Morpheus.
//!
//! Library crate shared by the `link` binary and the integration tests in
//! `tests/`.

pub mod api;
pub mod cli;
pub mod config;
pub mod errors;
pub mod jobs;
pub mod models;
pub mod notification;
pub mod routing;
pub mod state;
pub mod store;
pub mod tls;
pub mod token;
pub mod upstream;
