pub mod webhook;

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::models::approval::{ApprovalAction, ApprovalRequest};

/// Everything a notifier needs to tell reviewers about one approval.
#[derive(Debug, Clone, Copy)]
pub struct Notice<'a> {
    pub approval: &'a ApprovalRequest,
    pub rule_description: &'a str,
    pub template: &'a str,
    pub recipients: &'a [String],
    pub linked: bool,
    /// One single-use URL per reviewer action.
    pub links: &'a BTreeMap<ApprovalAction, String>,
}

/// Outbound notification transport. Delivery is at-least-once; the action
/// endpoint is what enforces single use.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notice: &Notice<'_>) -> anyhow::Result<()>;

    /// Tell the requester (`approval.request_by`) that reviewer `asked_by`
    /// wants more information.
    async fn info_requested(&self, approval: &ApprovalRequest, asked_by: &str) -> anyhow::Result<()>;
}

/// Writes notifications to the log only. Used when no relay is configured.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notice: &Notice<'_>) -> anyhow::Result<()> {
        tracing::info!(
            approval_id = notice.approval.id,
            rule = notice.rule_description,
            template = notice.template,
            recipients = ?notice.recipients,
            "no notification relay configured; approval links logged only"
        );
        for (action, url) in notice.links {
            tracing::debug!(approval_id = notice.approval.id, %action, url = %url, "action link");
        }
        Ok(())
    }

    async fn info_requested(&self, approval: &ApprovalRequest, asked_by: &str) -> anyhow::Result<()> {
        tracing::info!(
            approval_id = approval.id,
            requester = %approval.request_by,
            asked_by,
            "reviewer requested more information"
        );
        Ok(())
    }
}
