//! Operator routing rules (`approvals.yaml`).
//!
//! Rules are evaluated top to bottom and the first match wins. Two rules that
//! overlap (same action, compatible scope) therefore resolve deterministically
//! in favour of the one listed first.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

use super::approval::{ApprovalKind, Scope, ScopeField};

/// Template used when a rule does not name one.
pub const DEFAULT_TEMPLATE: &str = "default.html";

static EMAIL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^[A-Za-z0-9.!#$%&'*+/=?^_`{|}~-]+@[A-Za-z0-9](?:[A-Za-z0-9-]{0,61}[A-Za-z0-9])?(?:\.[A-Za-z0-9](?:[A-Za-z0-9-]{0,61}[A-Za-z0-9])?)*$",
    )
    .expect("email regex is valid")
});

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("failed to read approval configuration {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse approval configuration: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("rule #{index}: no description is set")]
    NoDescription { index: usize },

    #[error("rule #{index} ({description}): not configured for 'provision', 'delete' nor 'reconfigure'")]
    NoAction { index: usize, description: String },

    #[error("rule #{index} ({description}): message template '{template}' cannot be found")]
    TemplateNotFound {
        index: usize,
        description: String,
        template: String,
    },

    #[error("rule #{index} ({description}): no recipients are configured")]
    NoRecipients { index: usize, description: String },

    #[error("rule #{index} ({description}): recipient '{email}' is not a valid email address")]
    BadRecipientEmail {
        index: usize,
        description: String,
        email: String,
    },

    #[error("rule #{index} ({description}): multiple scopes set ({fields})")]
    MultipleScopes {
        index: usize,
        description: String,
        fields: String,
    },
}

// ── File format ──────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RuleEntry {
    approval: RawRule,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawRule {
    #[serde(default)]
    description: String,
    #[serde(default)]
    template: Option<String>,
    #[serde(default)]
    on_provision: bool,
    #[serde(default)]
    on_delete: bool,
    #[serde(default)]
    on_reconfigure: bool,
    #[serde(default)]
    linked_approval: bool,
    #[serde(default)]
    recipient_list: Vec<String>,
    #[serde(default)]
    scope: Scope,
}

// ── Validated rules ──────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeConstraint {
    pub field: ScopeField,
    pub value: String,
}

/// A validated routing rule. Construction goes through [`RuleSet`], so every
/// instance has a description, at least one action and recipient, and at most
/// one scope field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingRule {
    pub description: String,
    pub actions: BTreeSet<ApprovalKind>,
    pub template: Option<String>,
    pub recipients: Vec<String>,
    pub scope: Option<ScopeConstraint>,
    pub linked_approval: bool,
}

/// The ordered, validated rule set.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<RoutingRule>,
}

impl RuleSet {
    /// Read and validate `approvals.yaml`. Templates are resolved relative to
    /// `template_dir`.
    pub fn load(path: &Path, template_dir: &Path) -> Result<Self, RuleError> {
        let raw = std::fs::read_to_string(path).map_err(|source| RuleError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&raw, template_dir)
    }

    pub fn from_yaml(yaml: &str, template_dir: &Path) -> Result<Self, RuleError> {
        let has_content = yaml.lines().map(str::trim).any(|l| {
            !l.is_empty() && !l.starts_with('#') && l != "---"
        });
        if !has_content {
            return Ok(Self::default());
        }
        let entries: Vec<RuleEntry> = serde_yaml::from_str(yaml)?;
        let rules = entries
            .into_iter()
            .enumerate()
            .map(|(i, entry)| validate(i + 1, entry.approval, template_dir))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rules })
    }

    pub fn rules(&self) -> &[RoutingRule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

fn validate(index: usize, raw: RawRule, template_dir: &Path) -> Result<RoutingRule, RuleError> {
    let description = raw.description.trim().to_string();
    if description.is_empty() {
        return Err(RuleError::NoDescription { index });
    }

    let mut actions = BTreeSet::new();
    if raw.on_provision {
        actions.insert(ApprovalKind::Provision);
    }
    if raw.on_delete {
        actions.insert(ApprovalKind::Delete);
    }
    if raw.on_reconfigure {
        actions.insert(ApprovalKind::Reconfigure);
    }
    if actions.is_empty() {
        return Err(RuleError::NoAction { index, description });
    }

    let template = raw
        .template
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty());
    if let Some(ref t) = template {
        let escapes = Path::new(t)
            .components()
            .any(|c| !matches!(c, std::path::Component::Normal(_)));
        if escapes || !template_dir.join(t).is_file() {
            return Err(RuleError::TemplateNotFound {
                index,
                description,
                template: t.clone(),
            });
        }
    }

    if raw.recipient_list.is_empty() {
        return Err(RuleError::NoRecipients { index, description });
    }
    let mut recipients = Vec::with_capacity(raw.recipient_list.len());
    for email in raw.recipient_list {
        let email = email.trim().to_string();
        if !is_valid_email(&email) {
            return Err(RuleError::BadRecipientEmail {
                index,
                description,
                email,
            });
        }
        if !recipients.contains(&email) {
            recipients.push(email);
        }
    }

    let populated = raw.scope.populated();
    let scope = match populated.as_slice() {
        [] => None,
        [(field, value)] => Some(ScopeConstraint {
            field: *field,
            value: value.to_string(),
        }),
        many => {
            let fields = many
                .iter()
                .map(|(f, _)| f.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            return Err(RuleError::MultipleScopes {
                index,
                description,
                fields,
            });
        }
    };

    Ok(RoutingRule {
        description,
        actions,
        template,
        recipients,
        scope,
        linked_approval: raw.linked_approval,
    })
}

/// Accepts a bare address or `Display Name <address>`.
pub fn is_valid_email(input: &str) -> bool {
    let addr = match (input.rfind('<'), input.strip_suffix('>')) {
        (Some(start), Some(inner)) => &inner[start + 1..],
        _ => input,
    };
    EMAIL_RE.is_match(addr.trim())
}
