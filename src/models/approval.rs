use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status Morpheus reports for an approval that is still waiting on a reviewer.
pub const STATUS_REQUESTED: &str = "1 requested";

// ── Upstream snapshot ────────────────────────────────────────

/// An approval as returned by the Morpheus approvals API.
///
/// This is an immutable snapshot: it is passed by value into the matcher and
/// the notifier, and stored as JSON on the tracked record. Only the state store
/// holds mutable handling state, keyed by `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRequest {
    pub id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub request_type: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub date_created: Option<DateTime<Utc>>,
    #[serde(default)]
    pub request_by: String,
    #[serde(default, rename = "approvalItems")]
    pub items: Vec<ApprovalItem>,
    #[serde(default)]
    pub scope: Scope,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalItem {
    pub id: i64,
}

impl ApprovalRequest {
    pub fn kind(&self) -> Option<ApprovalKind> {
        ApprovalKind::from_request_type(&self.request_type)
    }

    pub fn is_awaiting_decision(&self) -> bool {
        self.status == STATUS_REQUESTED || self.status.to_ascii_lowercase().ends_with("requested")
    }

    /// Merge a re-fetched detail record over this list summary.
    /// The detail wins, except where it leaves scope or type empty.
    pub fn refined_by(&self, detail: ApprovalRequest) -> ApprovalRequest {
        let mut refined = detail;
        if refined.scope.is_global() {
            refined.scope = self.scope.clone();
        }
        if refined.request_type.is_empty() {
            refined.request_type = self.request_type.clone();
        }
        if refined.status.is_empty() {
            refined.status = self.status.clone();
        }
        refined
    }
}

// ── Kind ─────────────────────────────────────────────────────

/// The platform operation an approval gates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalKind {
    Provision,
    Delete,
    Reconfigure,
}

impl ApprovalKind {
    /// Morpheus reports the kind as free text ("Provision Instance",
    /// "Delete App", ...), so match on the keyword.
    pub fn from_request_type(raw: &str) -> Option<Self> {
        let lower = raw.to_ascii_lowercase();
        if lower.contains("reconfigure") {
            Some(Self::Reconfigure)
        } else if lower.contains("delete") {
            Some(Self::Delete)
        } else if lower.contains("provision") {
            Some(Self::Provision)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Provision => "provision",
            Self::Delete => "delete",
            Self::Reconfigure => "reconfigure",
        }
    }
}

impl fmt::Display for ApprovalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Scope ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeField {
    Group,
    Cloud,
    User,
    Role,
    Network,
}

impl ScopeField {
    pub const ALL: [ScopeField; 5] = [
        ScopeField::Group,
        ScopeField::Cloud,
        ScopeField::User,
        ScopeField::Role,
        ScopeField::Network,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Group => "group",
            Self::Cloud => "cloud",
            Self::User => "user",
            Self::Role => "role",
            Self::Network => "network",
        }
    }
}

/// Scope descriptor shared by upstream approvals and routing rules.
/// Empty strings are treated the same as absent fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
}

impl Scope {
    pub fn get(&self, field: ScopeField) -> Option<&str> {
        let value = match field {
            ScopeField::Group => &self.group,
            ScopeField::Cloud => &self.cloud,
            ScopeField::User => &self.user,
            ScopeField::Role => &self.role,
            ScopeField::Network => &self.network,
        };
        value.as_deref().map(str::trim).filter(|v| !v.is_empty())
    }

    /// Populated fields, in declaration order.
    pub fn populated(&self) -> Vec<(ScopeField, &str)> {
        ScopeField::ALL
            .iter()
            .filter_map(|f| self.get(*f).map(|v| (*f, v)))
            .collect()
    }

    pub fn is_global(&self) -> bool {
        self.populated().is_empty()
    }
}

// ── Reviewer actions ─────────────────────────────────────────

/// A decision a reviewer can take from an emailed link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApprovalAction {
    Approve,
    Deny,
    RequestInfo,
}

impl ApprovalAction {
    pub const ALL: [ApprovalAction; 3] = [
        ApprovalAction::Approve,
        ApprovalAction::Deny,
        ApprovalAction::RequestInfo,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::Deny => "deny",
            Self::RequestInfo => "request-info",
        }
    }

    /// The action name sent to the upstream platform. Request-info never
    /// reaches upstream.
    pub fn upstream_action(&self) -> Option<&'static str> {
        match self {
            Self::Approve => Some("approve"),
            Self::Deny => Some("deny"),
            Self::RequestInfo => None,
        }
    }

    pub(crate) fn to_byte(self) -> u8 {
        match self {
            Self::Approve => 1,
            Self::Deny => 2,
            Self::RequestInfo => 3,
        }
    }

    pub(crate) fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Approve),
            2 => Some(Self::Deny),
            3 => Some(Self::RequestInfo),
            _ => None,
        }
    }
}

impl fmt::Display for ApprovalAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ApprovalAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approve" => Ok(Self::Approve),
            "deny" => Ok(Self::Deny),
            "request-info" => Ok(Self::RequestInfo),
            other => Err(format!("unknown approval action '{}'", other)),
        }
    }
}

// ── Tracked approval projection ──────────────────────────────

/// Lifecycle of an approval while Link is handling it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackedState {
    /// Reviewers notified, no decision yet.
    Pending,
    /// Approve/deny consumed; upstream apply not confirmed yet.
    Decided,
    /// Upstream accepted the decision.
    Applied,
    /// Background apply retries exhausted; needs an operator.
    ApplyFailed,
    InfoRequested,
    /// Never decided within the retention window.
    Expired,
}

impl TrackedState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Decided => "decided",
            Self::Applied => "applied",
            Self::ApplyFailed => "apply_failed",
            Self::InfoRequested => "info_requested",
            Self::Expired => "expired",
        }
    }
}

impl fmt::Display for TrackedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TrackedState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "decided" => Ok(Self::Decided),
            "applied" => Ok(Self::Applied),
            "apply_failed" => Ok(Self::ApplyFailed),
            "info_requested" => Ok(Self::InfoRequested),
            "expired" => Ok(Self::Expired),
            other => Err(format!("unknown tracked state '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Decision {
    pub action: ApprovalAction,
    pub actor: String,
    pub decided_at: DateTime<Utc>,
}

/// The store's view of one approval that matched a routing rule.
#[derive(Debug, Clone, Serialize)]
pub struct TrackedApproval {
    pub approval_id: i64,
    pub state: TrackedState,
    pub rule_description: String,
    pub template: Option<String>,
    pub recipients: Vec<String>,
    pub linked: bool,
    pub approval: ApprovalRequest,
    pub decision: Option<Decision>,
    pub apply_attempts: i64,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub notified_at: Option<DateTime<Utc>>,
    pub applied_at: Option<DateTime<Utc>>,
    pub archived_at: Option<DateTime<Utc>>,
}
