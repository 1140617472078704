//! End-to-end scenarios and testable-property checks against the
//! public rule engine surface: load rules from a temp directory,
//! evaluate a constructed event, project it, and assert on the result.

use melody::config::SessionConfig;
use melody::event::{Event, EventKind, ReassembledHttpRequest, TransportPayload};
use melody::{evaluate, load_rules, project, EvalBudget, SessionRegistry};

fn write_rules(dir: &std::path::Path, name: &str, contents: &str) {
    std::fs::write(dir.join(name), contents).unwrap();
}

fn http_request(verb: &str, uri: &str, ua: &str, body: &[u8]) -> ReassembledHttpRequest {
    ReassembledHttpRequest {
        method: verb.to_string(),
        version: Some("HTTP/1.1".to_string()),
        uri: uri.to_string(),
        headers: vec![("User-Agent".to_string(), ua.to_string())],
        body: body.to_vec(),
        is_tls: false,
        source_ip: "198.51.100.7".to_string(),
        dest_ip: "198.51.100.1".to_string(),
        source_port: 54321,
        dest_port: 80,
    }
}

fn budget() -> EvalBudget {
    EvalBudget::from_millis(50)
}

#[test]
fn scenario_ua_match() {
    let dir = tempfile::tempdir().unwrap();
    write_rules(
        dir.path(),
        "ua.yml",
        r#"
ua_sqlmap:
  layer: http
  tags:
    tool: [sqlmap]
  match:
    http.headers.user-agent:
      contains: ["sqlmap"]
      options: { case_insensitive: true }
"#,
    );
    let store = load_rules(dir.path().to_str().unwrap(), &[]).unwrap();

    let mut event = Event::new_from_reassembled_http(
        http_request("GET", "/", "sqlmap/1.5", b""),
        "sess-1".to_string(),
        0,
    );
    evaluate(&mut event, &store, budget());

    assert_eq!(event.tags.get("tool"), Some(&vec!["sqlmap".to_string()]));
    assert_eq!(event.tags.get("rules"), Some(&vec!["ua_sqlmap".to_string()]));

    let record = project(&event, 65536);
    assert_eq!(record.tags.get("tool"), Some(&vec!["sqlmap".to_string()]));
}

#[test]
fn scenario_uri_regex_and_body_and() {
    let dir = tempfile::tempdir().unwrap();
    write_rules(
        dir.path(),
        "wp.yml",
        r#"
wp_login_admin:
  layer: http
  match:
    group:
      operator: and
      matches:
        - http.uri: { regex: "^/wp-login" }
        - http.body: { contains: "admin" }
"#,
    );
    let store = load_rules(dir.path().to_str().unwrap(), &[]).unwrap();

    let mut matching = Event::new_from_reassembled_http(
        http_request("POST", "/wp-login.php", "curl", b"log=admin&pwd=x"),
        "sess-1".to_string(),
        0,
    );
    evaluate(&mut matching, &store, budget());
    assert_eq!(matching.tags.get("rules"), Some(&vec!["wp_login_admin".to_string()]));

    let mut non_matching = Event::new_from_reassembled_http(
        http_request("POST", "/about", "curl", b"log=admin&pwd=x"),
        "sess-2".to_string(),
        0,
    );
    evaluate(&mut non_matching, &store, budget());
    assert!(non_matching.tags.is_empty());
}

#[test]
fn scenario_base64_decode() {
    use base64::Engine;

    let dir = tempfile::tempdir().unwrap();
    write_rules(
        dir.path(),
        "php.yml",
        r#"
php_webshell:
  layer: http
  match:
    http.body:
      contains: ["<?php"]
      options: { decode: base64 }
"#,
    );
    let store = load_rules(dir.path().to_str().unwrap(), &[]).unwrap();

    let body = base64::engine::general_purpose::STANDARD.encode(b"<?php system($_GET['c']);");
    let mut event = Event::new_from_reassembled_http(
        http_request("POST", "/upload", "curl", body.as_bytes()),
        "sess-1".to_string(),
        0,
    );
    evaluate(&mut event, &store, budget());
    assert_eq!(event.tags.get("rules"), Some(&vec!["php_webshell".to_string()]));
}

#[test]
fn scenario_negation_matches_non_get() {
    let dir = tempfile::tempdir().unwrap();
    write_rules(
        dir.path(),
        "neg.yml",
        r#"
not_get:
  layer: http
  match:
    group:
      operator: and
      negate: true
      matches:
        - http.verb: { equals: "GET" }
"#,
    );
    let store = load_rules(dir.path().to_str().unwrap(), &[]).unwrap();

    let mut get_event =
        Event::new_from_reassembled_http(http_request("GET", "/", "curl", b""), "sess-1".to_string(), 0);
    evaluate(&mut get_event, &store, budget());
    assert!(get_event.tags.is_empty());

    let mut post_event =
        Event::new_from_reassembled_http(http_request("POST", "/", "curl", b""), "sess-2".to_string(), 0);
    evaluate(&mut post_event, &store, budget());
    assert_eq!(post_event.tags.get("rules"), Some(&vec!["not_get".to_string()]));
}

#[test]
fn scenario_multi_rule_tagging_preserves_load_order() {
    let dir = tempfile::tempdir().unwrap();
    write_rules(
        dir.path(),
        "multi.yml",
        r#"
rule_one:
  layer: http
  match:
    http.uri: { regex: "^/admin" }
rule_two:
  layer: http
  match:
    http.body: { contains: "<?php" }
"#,
    );
    let store = load_rules(dir.path().to_str().unwrap(), &[]).unwrap();

    let mut event = Event::new_from_reassembled_http(
        http_request("GET", "/admin/panel", "curl", b"<?php evil();"),
        "sess-1".to_string(),
        0,
    );
    evaluate(&mut event, &store, budget());

    assert_eq!(
        event.tags.get("rules"),
        Some(&vec!["rule_one".to_string(), "rule_two".to_string()])
    );
}

#[test]
fn scenario_session_stability_across_flows() {
    use melody::session::flow_key;

    let registry = SessionRegistry::new(&SessionConfig {
        max_sessions: Some(100),
        session_ttl_seconds: None,
    });

    let key_a = flow_key("198.51.100.7", 54321, "198.51.100.1", 80);
    let id_a1 = registry.get_or_insert(&key_a);
    let id_a2 = registry.get_or_insert(&key_a);
    assert_eq!(id_a1, id_a2);

    let key_b = flow_key("198.51.100.9", 1234, "198.51.100.1", 80);
    let id_b = registry.get_or_insert(&key_b);
    assert_ne!(id_a1, id_b);
}

#[test]
fn invariant_evaluate_preserves_non_tag_fields() {
    let dir = tempfile::tempdir().unwrap();
    write_rules(
        dir.path(),
        "r.yml",
        "r1:\n  layer: http\n  match:\n    http.uri: { regex: \".*\" }\n",
    );
    let store = load_rules(dir.path().to_str().unwrap(), &[]).unwrap();

    let mut event = Event::new_from_reassembled_http(
        http_request("GET", "/x", "curl", b"body"),
        "sess-1".to_string(),
        42,
    );
    let uri_before = event.payload.as_http().unwrap().uri.clone();
    let source_ip_before = event.source_ip.clone();

    evaluate(&mut event, &store, budget());

    assert_eq!(event.payload.as_http().unwrap().uri, uri_before);
    assert_eq!(event.source_ip, source_ip_before);
}

#[test]
fn invariant_evaluation_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    write_rules(
        dir.path(),
        "r.yml",
        "r1:\n  layer: http\n  match:\n    http.verb: { equals: \"GET\" }\n",
    );
    let store = load_rules(dir.path().to_str().unwrap(), &[]).unwrap();

    let mut event =
        Event::new_from_reassembled_http(http_request("GET", "/", "curl", b""), "sess-1".to_string(), 0);
    evaluate(&mut event, &store, budget());
    let tags_after_first = event.tags.clone();
    evaluate(&mut event, &store, budget());

    assert_eq!(event.tags, tags_after_first);
    assert_eq!(event.tags.get("rules"), Some(&vec!["r1".to_string()]));
}

#[test]
fn boundary_empty_rule_set_never_tags() {
    let dir = tempfile::tempdir().unwrap();
    let store = load_rules(dir.path().to_str().unwrap(), &[]).unwrap();
    assert_eq!(store.total_rules(), 0);

    let mut event =
        Event::new_from_reassembled_http(http_request("GET", "/", "curl", b""), "sess-1".to_string(), 0);
    evaluate(&mut event, &store, budget());
    assert!(event.tags.is_empty());
}

#[test]
fn boundary_empty_matcher_matches_every_event_of_its_layer() {
    let dir = tempfile::tempdir().unwrap();
    write_rules(dir.path(), "catchall.yml", "tap:\n  layer: http\n");
    let store = load_rules(dir.path().to_str().unwrap(), &[]).unwrap();

    let mut event =
        Event::new_from_reassembled_http(http_request("DELETE", "/anything", "x", b""), "sess-1".to_string(), 0);
    evaluate(&mut event, &store, budget());
    assert_eq!(event.tags.get("rules"), Some(&vec!["tap".to_string()]));
}

#[test]
fn boundary_header_lookup_is_case_insensitive() {
    let event = Event::new_from_reassembled_http(
        http_request("GET", "/", "sqlmap/1.5", b""),
        "sess-1".to_string(),
        0,
    );
    let http = event.payload.as_http().unwrap();
    assert_eq!(http.headers.get("user-agent"), http.headers.get("USER-AGENT"));
}

#[test]
fn round_trip_payload_log_exact_when_cap_sufficient() {
    use melody::payload::{payload_log, payload_log_decode};

    let body = b"session registry canonical flow key";
    let log = payload_log(body, body.len());
    assert!(!log.truncated);
    assert_eq!(payload_log_decode(&log).unwrap(), body);
}

#[test]
fn non_http_layer_event_is_untouched_by_http_only_rules() {
    let dir = tempfile::tempdir().unwrap();
    write_rules(
        dir.path(),
        "http_only.yml",
        "ua_rule:\n  layer: http\n  match:\n    http.headers.user-agent: { contains: \"sqlmap\" }\n",
    );
    let store = load_rules(dir.path().to_str().unwrap(), &[]).unwrap();

    let transport = TransportPayload {
        payload: b"\x16\x03\x01".to_vec(),
        flags: Some(2),
        window: Some(65535),
        sequence: Some(100),
    };
    let mut event = Event::new_from_transport(
        EventKind::Tcp,
        "198.51.100.7".to_string(),
        "198.51.100.1".to_string(),
        54321,
        443,
        "sess-1".to_string(),
        0,
        transport,
    );
    evaluate(&mut event, &store, budget());
    assert!(event.tags.is_empty());
}
