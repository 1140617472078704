//! Log projector (component C6): a pure, side-effect-free mapping from
//! an evaluated [`Event`] to the canonical JSON-lines log record (spec
//! §4.8). Never mutates the event.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::event::{Event, EventKind, EventPayload};
use crate::payload::{payload_log, PayloadLog};

#[derive(Debug, Serialize)]
pub struct LogRecord {
    pub timestamp: String,
    pub session_id: String,
    pub layer: &'static str,
    pub source_ip: String,
    pub dest_ip: String,
    pub source_port: u16,
    pub dest_port: u16,
    pub tags: std::collections::HashMap<String, Vec<String>>,
    pub additional: std::collections::HashMap<String, String>,
    pub errors: Vec<String>,
    #[serde(flatten)]
    pub layer_data: LayerData,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum LayerData {
    Http {
        http_verb: String,
        http_proto: String,
        http_uri: String,
        /// Case-insensitive collapsed header mapping: first observed
        /// value per folded name (spec §4.6/§6).
        http_headers_folded: std::collections::HashMap<String, String>,
        /// Every observed (name, value) pair, in observed order.
        http_headers: Vec<[String; 2]>,
        http_body: PayloadLog,
        http_is_tls: bool,
    },
    Transport {
        transport_payload: PayloadLog,
        transport_flags: Option<u16>,
        transport_window: Option<u16>,
        transport_sequence: Option<u32>,
    },
    Icmp {
        icmp_type: u8,
        icmp_code: u8,
        icmp_payload: PayloadLog,
    },
}

/// Project `event` into its canonical log record. `body_cap` bounds how
/// much of any payload is embedded verbatim (base64-encoded); the rest
/// is flagged `truncated` (spec §4.8).
pub fn project(event: &Event, body_cap: usize) -> LogRecord {
    let timestamp = nanos_to_rfc3339(event.timestamp_ns);

    let layer_data = match &event.payload {
        EventPayload::Http(http) | EventPayload::Https(http) => LayerData::Http {
            http_verb: http.verb.clone(),
            http_proto: http.proto.clone(),
            http_uri: http.uri.clone(),
            http_headers_folded: http.headers.folded().clone(),
            http_headers: http
                .headers
                .keys
                .iter()
                .zip(http.headers.values.iter())
                .map(|(k, v)| [k.clone(), v.clone()])
                .collect(),
            http_body: payload_log(&http.body, body_cap),
            http_is_tls: http.is_tls,
        },
        EventPayload::Tcp(t) | EventPayload::Udp(t) => LayerData::Transport {
            transport_payload: payload_log(&t.payload, body_cap),
            transport_flags: t.flags,
            transport_window: t.window,
            transport_sequence: t.sequence,
        },
        EventPayload::Icmpv4(i) | EventPayload::Icmpv6(i) => LayerData::Icmp {
            icmp_type: i.icmp_type,
            icmp_code: i.code,
            icmp_payload: payload_log(&i.payload, body_cap),
        },
    };

    LogRecord {
        timestamp,
        session_id: event.session_id.clone(),
        layer: layer_name(event.kind()),
        source_ip: event.source_ip.clone(),
        dest_ip: event.dest_ip.clone(),
        source_port: event.source_port,
        dest_port: event.dest_port,
        tags: event.tags.clone(),
        additional: event.additional.clone(),
        errors: event.errors.clone(),
        layer_data,
    }
}

fn layer_name(kind: EventKind) -> &'static str {
    kind.as_str()
}

fn nanos_to_rfc3339(ts_ns: u128) -> String {
    let secs = (ts_ns / 1_000_000_000) as i64;
    let nanos = (ts_ns % 1_000_000_000) as u32;
    DateTime::<Utc>::from_timestamp(secs, nanos)
        .unwrap_or_else(|| DateTime::<Utc>::from_timestamp(0, 0).expect("epoch is always valid"))
        .to_rfc3339_opts(chrono::SecondsFormat::Nanos, true)
}

/// Serialize a [`LogRecord`] to a single JSON line (no trailing newline).
pub fn to_json_line(record: &LogRecord) -> crate::error::Result<String> {
    Ok(serde_json::to_string(record)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::ReassembledHttpRequest;

    fn sample_event() -> Event {
        let request = ReassembledHttpRequest {
            method: "GET".to_string(),
            version: Some("HTTP/1.1".to_string()),
            uri: "/admin".to_string(),
            headers: vec![("User-Agent".to_string(), "sqlmap/1.5".to_string())],
            body: b"hello world".to_vec(),
            is_tls: false,
            source_ip: "10.0.0.1".to_string(),
            dest_ip: "10.0.0.2".to_string(),
            source_port: 51234,
            dest_port: 80,
        };
        Event::new_from_reassembled_http(request, "sess-1".to_string(), 1_700_000_000_123_456_789)
    }

    #[test]
    fn projects_http_event_with_rfc3339_timestamp() {
        let event = sample_event();
        let record = project(&event, 65536);
        assert_eq!(record.layer, "http");
        assert_eq!(record.session_id, "sess-1");
        assert!(record.timestamp.contains('T'));
        assert!(record.timestamp.ends_with('Z'));
    }

    #[test]
    fn http_record_includes_folded_map_and_parallel_lists() {
        let event = sample_event();
        let record = project(&event, 65536);
        match &record.layer_data {
            LayerData::Http {
                http_headers_folded,
                http_headers,
                ..
            } => {
                assert_eq!(
                    http_headers_folded.get("user-agent").map(String::as_str),
                    Some("sqlmap/1.5")
                );
                assert_eq!(http_headers, &vec![["User-Agent".to_string(), "sqlmap/1.5".to_string()]]);
            }
            other => panic!("expected HTTP layer data, got {other:?}"),
        }
    }

    #[test]
    fn never_mutates_the_source_event() {
        let event = sample_event();
        let before = serde_json::to_string(&event).unwrap();
        let _ = project(&event, 4);
        let after = serde_json::to_string(&event).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn tags_additional_errors_are_always_present() {
        let event = sample_event();
        let record = project(&event, 65536);
        let json = serde_json::to_value(&record).unwrap();
        assert!(json.get("tags").unwrap().is_object());
        assert!(json.get("additional").unwrap().is_object());
        assert!(json.get("errors").unwrap().is_array());
    }

    #[test]
    fn serializes_as_a_single_json_line() {
        let event = sample_event();
        let record = project(&event, 65536);
        let line = to_json_line(&record).unwrap();
        assert!(!line.contains('\n'));
        let _: serde_json::Value = serde_json::from_str(&line).unwrap();
    }
}
