//! Minimal HTML pages shown to reviewers after they click a link.

use crate::models::approval::{ApprovalAction, TrackedState};

pub fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

fn layout(title: &str, body: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<meta name="robots" content="noindex">
<title>Link: {title}</title>
<style>
body {{ font-family: -apple-system, "Segoe UI", Helvetica, Arial, sans-serif; max-width: 36rem; margin: 4rem auto; padding: 0 1rem; color: #222; }}
h1 {{ font-size: 1.4rem; }}
button {{ font-size: 1rem; padding: 0.5rem 1.5rem; }}
</style>
</head>
<body>
<h1>{title}</h1>
{body}
</body>
</html>
"#,
        title = escape(title),
        body = body,
    )
}

pub fn message(title: &str, message: &str) -> String {
    layout(title, &format!("<p>{}</p>", escape(message)))
}

fn verb(action: ApprovalAction) -> &'static str {
    match action {
        ApprovalAction::Approve => "approve",
        ApprovalAction::Deny => "deny",
        ApprovalAction::RequestInfo => "request more information for",
    }
}

/// GET form used when links must be confirmed with a POST.
pub fn confirm(approval_id: i64, action: ApprovalAction, post_path: &str) -> String {
    layout(
        "Confirm your decision",
        &format!(
            r#"<p>You are about to {} approval {}.</p>
<form method="post" action="{}">
<button type="submit">Confirm</button>
</form>"#,
            verb(action),
            approval_id,
            escape(post_path),
        ),
    )
}

pub fn applied(approval_id: i64, action: ApprovalAction) -> String {
    let outcome = match action {
        ApprovalAction::Deny => "denied",
        _ => "approved",
    };
    message(
        "Decision applied",
        &format!("Approval {} has been {}. Thank you.", approval_id, outcome),
    )
}

pub fn apply_pending(approval_id: i64) -> String {
    message(
        "Decision recorded",
        &format!(
            "We recorded your decision on approval {} but could not reach Morpheus yet. \
             It will be applied automatically; there is no need to click again.",
            approval_id
        ),
    )
}

pub fn info_requested(approval_id: i64) -> String {
    message(
        "Information requested",
        &format!(
            "The requester of approval {} has been asked for more information.",
            approval_id
        ),
    )
}

pub fn already_actioned(approval_id: i64, state: TrackedState) -> String {
    let detail = match state {
        TrackedState::Expired => "it expired before anyone responded",
        TrackedState::InfoRequested => "more information was requested",
        _ => "a decision has already been made",
    };
    message(
        "Already actioned",
        &format!("Approval {} needs no further action: {}.", approval_id, detail),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape() {
        assert_eq!(escape(r#"<a href="x">'&'</a>"#), "&lt;a href=&quot;x&quot;&gt;&#39;&amp;&#39;&lt;/a&gt;");
    }

    #[test]
    fn test_confirm_posts_back() {
        let page = confirm(42, ApprovalAction::Deny, "/action/abc.def");
        assert!(page.contains(r#"method="post""#));
        assert!(page.contains(r#"action="/action/abc.def""#));
        assert!(page.contains("deny approval 42"));
    }
}
