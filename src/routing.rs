//! Routing matcher: decides which rule, if any, handles an approval.
//!
//! Pure function over an immutable snapshot and the ordered rule set. No I/O,
//! no state, so rule changes can be unit-tested in isolation.

use crate::models::approval::ApprovalRequest;
use crate::models::rule::RoutingRule;

/// Return the first rule that matches `request`, in configured order.
///
/// A rule matches when the request's kind is one of the rule's actions and the
/// rule is either global or its single scope field equals the request's value
/// for that field. `None` is a normal outcome: the approval is left untracked.
pub fn match_rule<'a>(request: &ApprovalRequest, rules: &'a [RoutingRule]) -> Option<&'a RoutingRule> {
    let kind = request.kind()?;
    rules.iter().find(|rule| {
        rule.actions.contains(&kind)
            && match &rule.scope {
                None => true,
                Some(constraint) => request.scope.get(constraint.field) == Some(constraint.value.as_str()),
            }
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::models::approval::{ApprovalKind, Scope, ScopeField, STATUS_REQUESTED};
    use crate::models::rule::ScopeConstraint;

    fn rule(description: &str, actions: &[ApprovalKind], scope: Option<(ScopeField, &str)>) -> RoutingRule {
        RoutingRule {
            description: description.into(),
            actions: actions.iter().copied().collect::<BTreeSet<_>>(),
            template: None,
            recipients: vec!["a@x".into(), "b@x".into()],
            scope: scope.map(|(field, value)| ScopeConstraint {
                field,
                value: value.into(),
            }),
            linked_approval: false,
        }
    }

    fn approval(id: i64, request_type: &str, scope: Scope) -> ApprovalRequest {
        ApprovalRequest {
            id,
            name: format!("APPROVAL-{:07}", id),
            request_type: request_type.into(),
            status: STATUS_REQUESTED.into(),
            date_created: None,
            request_by: "requester".into(),
            items: vec![],
            scope,
        }
    }

    fn group(name: &str) -> Scope {
        Scope {
            group: Some(name.into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_prod_group_provision_matches() {
        let rules = vec![rule("prod", &[ApprovalKind::Provision], Some((ScopeField::Group, "Prod")))];
        let req = approval(42, "provision", group("Prod"));
        let matched = match_rule(&req, &rules).expect("should match");
        assert_eq!(matched.description, "prod");
        assert_eq!(matched.recipients, vec!["a@x", "b@x"]);
    }

    #[test]
    fn test_delete_against_provision_only_rules_is_unmatched() {
        let rules = vec![rule("prod", &[ApprovalKind::Provision], Some((ScopeField::Group, "Prod")))];
        let req = approval(
            43,
            "delete",
            Scope {
                cloud: Some("Azure".into()),
                ..Default::default()
            },
        );
        assert!(match_rule(&req, &rules).is_none());
    }

    #[test]
    fn test_scope_value_must_be_equal() {
        let rules = vec![rule("prod", &[ApprovalKind::Provision], Some((ScopeField::Group, "Prod")))];
        assert!(match_rule(&approval(1, "provision", group("Dev")), &rules).is_none());
        assert!(match_rule(&approval(2, "provision", Scope::default()), &rules).is_none());
    }

    #[test]
    fn test_global_rule_matches_any_scope() {
        let rules = vec![rule("global", &[ApprovalKind::Delete], None)];
        assert!(match_rule(&approval(1, "Delete Instance", group("Dev")), &rules).is_some());
        assert!(match_rule(&approval(2, "Delete Instance", Scope::default()), &rules).is_some());
    }

    #[test]
    fn test_first_matching_rule_wins() {
        let rules = vec![
            rule("global", &[ApprovalKind::Provision], None),
            rule("prod", &[ApprovalKind::Provision], Some((ScopeField::Group, "Prod"))),
        ];
        let req = approval(42, "provision", group("Prod"));
        assert_eq!(match_rule(&req, &rules).unwrap().description, "global");

        let reversed: Vec<_> = rules.into_iter().rev().collect();
        assert_eq!(match_rule(&req, &reversed).unwrap().description, "prod");
    }

    #[test]
    fn test_unknown_kind_never_matches() {
        let rules = vec![rule(
            "all",
            &[ApprovalKind::Provision, ApprovalKind::Delete, ApprovalKind::Reconfigure],
            None,
        )];
        assert!(match_rule(&approval(9, "Run Workflow", Scope::default()), &rules).is_none());
    }

    #[test]
    fn test_match_is_deterministic() {
        let rules = vec![
            rule("a", &[ApprovalKind::Reconfigure], Some((ScopeField::Cloud, "Azure"))),
            rule("b", &[ApprovalKind::Reconfigure], None),
        ];
        let req = approval(
            5,
            "reconfigure",
            Scope {
                cloud: Some("Azure".into()),
                ..Default::default()
            },
        );
        let first = match_rule(&req, &rules).map(|r| r.description.clone());
        for _ in 0..10 {
            assert_eq!(match_rule(&req, &rules).map(|r| r.description.clone()), first);
        }
    }
}
