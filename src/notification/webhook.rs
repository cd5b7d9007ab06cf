use anyhow::{Context, Result};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::header::CONTENT_TYPE;
use serde::Serialize;
use sha2::Sha256;
use std::time::Duration;
use tracing::{info, warn};

use super::{Notice, Notifier};
use crate::models::approval::ApprovalRequest;

// ── Webhook Event Types ───────────────────────────────────────

/// A structured event posted to the mail relay.
#[derive(Debug, Clone, Serialize)]
pub struct WebhookEvent {
    /// "approval_requested" or "info_requested".
    pub event_type: String,
    /// ISO-8601 timestamp of when the event was built.
    pub timestamp: String,
    pub approval_id: i64,
    pub approval_name: String,
    pub recipients: Vec<String>,
    pub details: serde_json::Value,
}

impl WebhookEvent {
    pub fn approval_requested(notice: &Notice<'_>) -> Self {
        let approval = notice.approval;
        let links: serde_json::Map<String, serde_json::Value> = notice
            .links
            .iter()
            .map(|(action, url)| (action.as_str().to_string(), serde_json::Value::String(url.clone())))
            .collect();
        Self {
            event_type: "approval_requested".to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            approval_id: approval.id,
            approval_name: approval.name.clone(),
            recipients: notice.recipients.to_vec(),
            details: serde_json::json!({
                "rule": notice.rule_description,
                "template": notice.template,
                "linked_approval": notice.linked,
                "request_type": approval.request_type,
                "requested_by": approval.request_by,
                "item_ids": approval.items.iter().map(|i| i.id).collect::<Vec<_>>(),
                "scope": approval.scope,
                "links": links,
            }),
        }
    }

    /// Addressed to the requester, naming the reviewer who asked.
    pub fn info_requested(approval: &ApprovalRequest, asked_by: &str) -> Self {
        Self {
            event_type: "info_requested".to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            approval_id: approval.id,
            approval_name: approval.name.clone(),
            recipients: vec![approval.request_by.clone()],
            details: serde_json::json!({
                "asked_by": asked_by,
                "request_type": approval.request_type,
                "item_ids": approval.items.iter().map(|i| i.id).collect::<Vec<_>>(),
            }),
        }
    }
}

// ── HMAC Signing ─────────────────────────────────────────────

/// HMAC-SHA256 over `<timestamp>.<payload>`, formatted as "sha256=<hex>".
/// `timestamp` is the `x-link-timestamp` header value.
fn sign_delivery(secret: &str, timestamp: &str, payload: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .expect("HMAC can take key of any size");
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(payload);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// One serialized event with its delivery headers, reused across attempts.
struct Delivery {
    id: String,
    timestamp: String,
    event_type: String,
    payload: Vec<u8>,
    signature: Option<String>,
}

impl Delivery {
    fn new(event: &WebhookEvent, secret: Option<&str>) -> Result<Self> {
        let payload = serde_json::to_vec(event).context("failed to serialize relay event")?;
        let timestamp = chrono::Utc::now().timestamp().to_string();
        let signature = secret.map(|s| sign_delivery(s, &timestamp, &payload));
        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp,
            event_type: event.event_type.clone(),
            payload,
            signature,
        })
    }
}

// ── Webhook Notifier ──────────────────────────────────────────

/// Hands approval events to a mail relay over HTTP.
///
/// The relay owns rendering and SMTP. Each event is delivered at least once:
/// one attempt per back-off entry, stopping at the first 2xx. With a secret
/// set, `x-link-signature` carries [`sign_delivery`] of the body.
#[derive(Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
    signing_secret: Option<String>,
    backoff_secs: Vec<u64>,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, signing_secret: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .user_agent(concat!("Link-Relay/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build relay HTTP client")?;
        Ok(Self {
            client,
            url: url.into(),
            signing_secret,
            backoff_secs: vec![0, 1, 5, 25],
        })
    }

    /// Replace the delay schedule. One attempt is made per entry.
    pub fn with_backoff(mut self, backoff_secs: Vec<u64>) -> Self {
        self.backoff_secs = backoff_secs;
        self
    }

    pub async fn send(&self, event: &WebhookEvent) -> Result<()> {
        let delivery = Delivery::new(event, self.signing_secret.as_deref())?;
        let mut last_failure = String::from("no attempts configured");

        for (attempt, &delay) in self.backoff_secs.iter().enumerate() {
            if delay > 0 {
                tokio::time::sleep(Duration::from_secs(delay)).await;
            }
            match self.attempt(&delivery).await {
                Ok(()) => {
                    info!(
                        approval_id = event.approval_id,
                        event = %delivery.event_type,
                        delivery_id = %delivery.id,
                        attempt,
                        "relay accepted event"
                    );
                    return Ok(());
                }
                Err(failure) => {
                    warn!(
                        approval_id = event.approval_id,
                        event = %delivery.event_type,
                        delivery_id = %delivery.id,
                        attempt,
                        failure = %failure,
                        "relay did not accept event"
                    );
                    last_failure = failure;
                }
            }
        }

        anyhow::bail!(
            "relay did not accept {} for approval {} after {} attempts: {}",
            delivery.event_type,
            event.approval_id,
            self.backoff_secs.len(),
            last_failure
        )
    }

    async fn attempt(&self, delivery: &Delivery) -> std::result::Result<(), String> {
        let mut req = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, "application/json")
            .header("x-link-delivery-id", &delivery.id)
            .header("x-link-timestamp", &delivery.timestamp)
            .header("x-link-event", &delivery.event_type);
        if let Some(sig) = &delivery.signature {
            req = req.header("x-link-signature", sig);
        }

        let resp = req
            .body(delivery.payload.clone())
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(format!("status {}", resp.status()))
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, notice: &Notice<'_>) -> Result<()> {
        self.send(&WebhookEvent::approval_requested(notice)).await
    }

    async fn info_requested(&self, approval: &ApprovalRequest, asked_by: &str) -> Result<()> {
        self.send(&WebhookEvent::info_requested(approval, asked_by)).await
    }
}

// ── Tests ─────────────────────────────────────────────────────
