//! The evaluator (component C5): walks every rule for an event's layer
//! against the compiled matcher tree and tags the event with each rule
//! that matches. Evaluation is fail-open (spec §4.5c/§7.3) — an
//! internal error on one leaf or one rule degrades to a non-match for
//! that leaf/rule rather than aborting the event.

use std::time::{Duration, Instant};

use metrics::counter;

use crate::event::Event;
use crate::field::FieldValue;
use crate::loader::RuleStore;
use crate::payload;
use crate::rule::{GroupOp, LeafMatch, MatchGroup, Rule};

/// How long the evaluator is willing to spend per rule before giving up
/// on it and counting a deadline exceedance. Checked between leaves,
/// not inside a single regex scan — the `regex` crate has no
/// interruption hook, so this is a best-effort bound, not a hard one
/// (documented as an Open Question resolution).
#[derive(Debug, Clone, Copy)]
pub struct EvalBudget {
    pub per_rule: Duration,
}

impl EvalBudget {
    pub fn from_millis(ms: u64) -> Self {
        EvalBudget {
            per_rule: Duration::from_millis(ms.max(1)),
        }
    }
}

/// Evaluate every rule registered for `event`'s layer, tagging the
/// event with each matching rule's name (under the `"rules"` tag
/// category) and static tags. Matching continues through every rule in
/// the layer; one rule matching never short-circuits the rest
/// (spec §4.4's "a tap, not a firewall" multi-match norm).
pub fn evaluate(event: &mut Event, rules: &RuleStore, budget: EvalBudget) {
    let layer = event.kind();
    let rules_for_layer = rules.rules_for(layer);
    counter!("melody_events_evaluated", "layer" => layer.as_str()).increment(1);

    for rule in rules_for_layer {
        let deadline = Instant::now() + budget.per_rule;
        match eval_group(&rule.matcher, event, deadline) {
            Ok(true) => apply_rule_tags(event, rule),
            Ok(false) => {}
            Err(EvalError::DeadlineExceeded) => {
                counter!("melody_regex_deadline_exceeded").increment(1);
                tracing::warn!(rule = %rule.name, "rule evaluation exceeded its deadline; treated as non-match");
            }
        }
    }
}

fn apply_rule_tags(event: &mut Event, rule: &Rule) {
    for (category, values) in &rule.tags {
        for value in values {
            event.add_tag(category, value.clone());
        }
    }
    event.add_tag("rules", rule.name.clone());
    counter!("melody_rule_matches", "rule" => rule.name.clone()).increment(1);
}

enum EvalError {
    DeadlineExceeded,
}

fn eval_group(group: &MatchGroup, event: &Event, deadline: Instant) -> Result<bool, EvalError> {
    if Instant::now() > deadline {
        return Err(EvalError::DeadlineExceeded);
    }

    match group {
        MatchGroup::Leaf(leaf) => Ok(eval_leaf(leaf, event)),
        MatchGroup::Group {
            operator,
            children,
            negate,
        } => {
            let result = match operator {
                GroupOp::And => {
                    let mut acc = true;
                    for child in children {
                        if !eval_group(child, event, deadline)? {
                            acc = false;
                            break;
                        }
                    }
                    acc
                }
                GroupOp::Or => {
                    if children.is_empty() {
                        // An empty OR group has no disjunct to satisfy.
                        false
                    } else {
                        let mut acc = false;
                        for child in children {
                            if eval_group(child, event, deadline)? {
                                acc = true;
                                break;
                            }
                        }
                        acc
                    }
                }
            };
            Ok(if *negate { !result } else { result })
        }
    }
}

fn eval_leaf(leaf: &LeafMatch, event: &Event) -> bool {
    let resolved = leaf.selector.resolve(event);
    let bytes = match field_value_bytes(&resolved) {
        Some(bytes) => bytes,
        // Missing field is a defined non-match, never an error (spec §4.5b).
        None => return false,
    };

    let decoded = match payload::decode(bytes.as_ref(), leaf.decode) {
        Some(d) => d,
        // Decode failure is a defined non-match, never an error (spec §4.2).
        None => return false,
    };

    leaf.primitive.eval(&decoded)
}

fn field_value_bytes<'a>(value: &'a FieldValue<'a>) -> Option<std::borrow::Cow<'a, [u8]>> {
    match value {
        FieldValue::Bytes(b) => Some(std::borrow::Cow::Borrowed(b)),
        FieldValue::Str(s) => Some(std::borrow::Cow::Borrowed(s.as_bytes())),
        FieldValue::OwnedStr(s) => Some(std::borrow::Cow::Owned(s.clone().into_bytes())),
        FieldValue::Int(i) => Some(std::borrow::Cow::Owned(i.to_string().into_bytes())),
        FieldValue::Bool(b) => Some(std::borrow::Cow::Owned(b.to_string().into_bytes())),
        FieldValue::Missing => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventKind, ReassembledHttpRequest};
    use crate::loader::load_rules;

    fn make_event(uri: &str, ua: &str, body: &[u8]) -> Event {
        let request = ReassembledHttpRequest {
            method: "GET".to_string(),
            version: Some("HTTP/1.1".to_string()),
            uri: uri.to_string(),
            headers: vec![("User-Agent".to_string(), ua.to_string())],
            body: body.to_vec(),
            is_tls: false,
            source_ip: "10.0.0.1".to_string(),
            dest_ip: "10.0.0.2".to_string(),
            source_port: 51234,
            dest_port: 80,
        };
        Event::new_from_reassembled_http(request, "sess-1".to_string(), 0)
    }

    #[test]
    fn matching_rule_tags_event() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("ua.yml"),
            "ua_sqlmap:\n  layer: http\n  tags:\n    category: [scanner]\n  match:\n    http.headers.user-agent:\n      contains: [\"sqlmap\"]\n      options: { case_insensitive: true }\n",
        )
        .unwrap();
        let store = load_rules(dir.path().to_str().unwrap(), &[]).unwrap();

        let mut event = make_event("/", "Mozilla/5.0 sqlmap/1.5", b"");
        evaluate(&mut event, &store, EvalBudget::from_millis(50));

        assert_eq!(event.tags.get("rules"), Some(&vec!["ua_sqlmap".to_string()]));
        assert_eq!(event.tags.get("category"), Some(&vec!["scanner".to_string()]));
    }

    #[test]
    fn non_matching_rule_leaves_event_untagged() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("ua.yml"),
            "ua_sqlmap:\n  layer: http\n  match:\n    http.headers.user-agent:\n      contains: [\"sqlmap\"]\n",
        )
        .unwrap();
        let store = load_rules(dir.path().to_str().unwrap(), &[]).unwrap();

        let mut event = make_event("/", "Mozilla/5.0 Firefox", b"");
        evaluate(&mut event, &store, EvalBudget::from_millis(50));

        assert!(event.tags.is_empty());
    }

    #[test]
    fn multiple_rules_can_all_tag_the_same_event() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("multi.yml"),
            "r1:\n  layer: http\n  match:\n    http.uri: { regex: \"^/admin\" }\nr2:\n  layer: http\n  match:\n    http.body: { contains: \"<?php\" }\n",
        )
        .unwrap();
        let store = load_rules(dir.path().to_str().unwrap(), &[]).unwrap();

        let mut event = make_event("/admin/login", "curl", b"<?php system($_GET['c']);");
        evaluate(&mut event, &store, EvalBudget::from_millis(50));

        let mut rules_matched = event.tags.get("rules").cloned().unwrap_or_default();
        rules_matched.sort();
        assert_eq!(rules_matched, vec!["r1".to_string(), "r2".to_string()]);
    }

    #[test]
    fn negated_group_inverts_result() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("neg.yml"),
            "not_get:\n  layer: http\n  match:\n    group:\n      operator: or\n      negate: true\n      matches:\n        - http.verb: { equals: \"GET\" }\n",
        )
        .unwrap();
        let store = load_rules(dir.path().to_str().unwrap(), &[]).unwrap();

        let mut get_event = make_event("/", "curl", b"");
        evaluate(&mut get_event, &store, EvalBudget::from_millis(50));
        assert!(get_event.tags.is_empty());
    }

    #[test]
    fn event_from_different_layer_is_unaffected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("tcp.yml"),
            "syn_scan:\n  layer: tcp\n  match:\n    tcp.flags: { numeric_cmp: { op: eq, value: 2 } }\n",
        )
        .unwrap();
        let store = load_rules(dir.path().to_str().unwrap(), &[]).unwrap();

        let mut event = make_event("/", "curl", b"");
        evaluate(&mut event, &store, EvalBudget::from_millis(50));
        assert_eq!(event.kind(), EventKind::Http);
        assert!(event.tags.is_empty());
    }
}
