//! The event model (component C1): a typed, polymorphic record of one
//! observed network interaction, as seen by the rule engine.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// The six layers melody can observe. Selected at the site of event
/// construction and used by the evaluator to pick the right rule list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Http,
    Https,
    Tcp,
    Udp,
    #[serde(rename = "icmpv4")]
    Icmpv4,
    #[serde(rename = "icmpv6")]
    Icmpv6,
}

impl EventKind {
    /// Parse the YAML/config surface form (`http`, `https`, `tcp`, `udp`,
    /// `icmp` — accepted as an alias for `icmpv4`).
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Some(EventKind::Http),
            "https" => Some(EventKind::Https),
            "tcp" => Some(EventKind::Tcp),
            "udp" => Some(EventKind::Udp),
            "icmp" | "icmpv4" => Some(EventKind::Icmpv4),
            "icmpv6" => Some(EventKind::Icmpv6),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Http => "http",
            EventKind::Https => "https",
            EventKind::Tcp => "tcp",
            EventKind::Udp => "udp",
            EventKind::Icmpv4 => "icmpv4",
            EventKind::Icmpv6 => "icmpv6",
        }
    }

    /// All known kinds, used by the loader to pre-size the per-layer
    /// rule index.
    pub fn all() -> [EventKind; 6] {
        [
            EventKind::Http,
            EventKind::Https,
            EventKind::Tcp,
            EventKind::Udp,
            EventKind::Icmpv4,
            EventKind::Icmpv6,
        ]
    }
}

/// Ordered tag values under one tag category, e.g. `rules` or `tool`.
pub type TagValues = Vec<String>;

/// `tags`: category -> ordered, append-only sequence of values.
pub type TagMap = HashMap<String, TagValues>;

/// Case-insensitive-lookup HTTP header collection that also preserves
/// every observed (name, value) pair in order.
///
/// Spec Open Question #1 is resolved as: "first value wins in the
/// folded map, all values preserved in parallel lists in observed
/// order."
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeaderMap {
    /// Folded map: lowercase header name -> first observed value.
    folded: HashMap<String, String>,
    /// Every header name exactly as observed, in order.
    pub keys: Vec<String>,
    /// Every header value exactly as observed, in the same order as `keys`.
    pub values: Vec<String>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one observed header. If the folded name was already seen,
    /// the folded-map value is left untouched (first value wins) but the
    /// pair is still appended to the parallel lists.
    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        let folded_key = name.to_ascii_lowercase();
        self.folded.entry(folded_key).or_insert_with(|| value.clone());
        self.keys.push(name);
        self.values.push(value);
    }

    /// Case-insensitive lookup. Absence is a defined non-match for the
    /// evaluator, not an error.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.folded.get(&name.to_ascii_lowercase()).map(|s| s.as_str())
    }

    /// The folded map itself, for projections that need to emit the
    /// case-insensitive collapsed view alongside the parallel lists
    /// (spec §4.6/§6).
    pub fn folded(&self) -> &HashMap<String, String> {
        &self.folded
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// HTTP/HTTPS request payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpPayload {
    pub verb: String,
    pub proto: String,
    pub uri: String,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
    pub is_tls: bool,
}

/// TCP/UDP transport payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportPayload {
    pub payload: Vec<u8>,
    /// TCP flags bitmask; `None` for UDP.
    pub flags: Option<u16>,
    pub window: Option<u16>,
    pub sequence: Option<u32>,
}

/// ICMP payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IcmpPayload {
    pub icmp_type: u8,
    pub code: u8,
    pub payload: Vec<u8>,
}

/// The layer-specific variant of an event, always consistent with
/// `Event::kind` (invariant (a) of spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "layer", rename_all = "lowercase")]
pub enum EventPayload {
    Http(HttpPayload),
    Https(HttpPayload),
    Tcp(TransportPayload),
    Udp(TransportPayload),
    #[serde(rename = "icmpv4")]
    Icmpv4(IcmpPayload),
    #[serde(rename = "icmpv6")]
    Icmpv6(IcmpPayload),
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::Http(_) => EventKind::Http,
            EventPayload::Https(_) => EventKind::Https,
            EventPayload::Tcp(_) => EventKind::Tcp,
            EventPayload::Udp(_) => EventKind::Udp,
            EventPayload::Icmpv4(_) => EventKind::Icmpv4,
            EventPayload::Icmpv6(_) => EventKind::Icmpv6,
        }
    }

    pub fn as_http(&self) -> Option<&HttpPayload> {
        match self {
            EventPayload::Http(p) | EventPayload::Https(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_transport(&self) -> Option<&TransportPayload> {
        match self {
            EventPayload::Tcp(p) | EventPayload::Udp(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_icmp(&self) -> Option<&IcmpPayload> {
        match self {
            EventPayload::Icmpv4(p) | EventPayload::Icmpv6(p) => Some(p),
            _ => None,
        }
    }
}

/// A fully constructed, observed network event, ready for evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Opaque session identifier, stable per transport flow (C7).
    pub session_id: String,
    pub source_ip: String,
    pub dest_ip: String,
    /// Zero when inapplicable (e.g. ICMP).
    pub source_port: u16,
    pub dest_port: u16,
    pub timestamp_ns: u128,
    pub payload: EventPayload,
    /// Mutated only by the evaluator; empty rather than absent.
    #[serde(default)]
    pub tags: TagMap,
    /// Arbitrary string annotations; empty rather than absent.
    #[serde(default)]
    pub additional: HashMap<String, String>,
    /// Partial-parse failures accumulated at construction time. The
    /// event remains evaluable on whatever fields were successfully
    /// populated (spec §4.1).
    #[serde(default)]
    pub errors: Vec<String>,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    /// Append one tag value under `category`. Evaluator-only mutation;
    /// categories are set-semantic — re-adding a value already present is
    /// a no-op, so re-evaluating an event is idempotent (spec §8).
    pub fn add_tag(&mut self, category: &str, value: impl Into<String>) {
        let value = value.into();
        let values = self.tags.entry(category.to_string()).or_default();
        if !values.contains(&value) {
            values.push(value);
        }
    }

    /// Construct an HTTP/HTTPS event from a request reassembled by the
    /// (external) capture/reassembly pipeline.
    ///
    /// `network_flow`/`transport_flow` describe the 4-tuple used to
    /// derive the session ID; this constructor itself does not touch the
    /// session registry, callers pass an already-resolved `session_id`.
    #[allow(clippy::too_many_arguments)]
    pub fn new_from_reassembled_http(
        request: ReassembledHttpRequest,
        session_id: String,
        timestamp_ns: u128,
    ) -> Self {
        let mut errors = Vec::new();
        let verb = request.method;
        let proto = request.version.unwrap_or_else(|| {
            errors.push("missing HTTP version, defaulting to HTTP/1.1".to_string());
            "HTTP/1.1".to_string()
        });

        let mut headers = HeaderMap::new();
        for (name, value) in request.headers {
            headers.push(name, value);
        }

        Event {
            session_id,
            source_ip: request.source_ip,
            dest_ip: request.dest_ip,
            source_port: request.source_port,
            dest_port: request.dest_port,
            timestamp_ns,
            payload: if request.is_tls {
                EventPayload::Https(HttpPayload {
                    verb,
                    proto,
                    uri: request.uri,
                    headers,
                    body: request.body,
                    is_tls: true,
                })
            } else {
                EventPayload::Http(HttpPayload {
                    verb,
                    proto,
                    uri: request.uri,
                    headers,
                    body: request.body,
                    is_tls: false,
                })
            },
            tags: TagMap::new(),
            additional: HashMap::new(),
            errors,
        }
    }

    /// Construct an HTTPS event observed by the decoy TLS/HTTP server,
    /// which has no raw transport tuple and so always allocates a fresh
    /// session ID (spec §4.7).
    pub fn new_from_decoy_http(
        request: DecoyHttpRequest,
        session_id: String,
        timestamp_ns: u128,
    ) -> Self {
        let mut headers = HeaderMap::new();
        for (name, value) in request.headers {
            headers.push(name, value);
        }

        Event {
            session_id,
            source_ip: request.remote_addr,
            dest_ip: request.host,
            source_port: 0,
            dest_port: 443,
            timestamp_ns,
            payload: EventPayload::Https(HttpPayload {
                verb: request.method,
                proto: request.version,
                uri: request.uri,
                headers,
                body: request.body,
                is_tls: true,
            }),
            tags: TagMap::new(),
            additional: HashMap::new(),
            errors: Vec::new(),
        }
    }

    /// Construct a TCP or UDP event from parsed transport headers.
    pub fn new_from_transport(
        kind: EventKind,
        source_ip: String,
        dest_ip: String,
        source_port: u16,
        dest_port: u16,
        session_id: String,
        timestamp_ns: u128,
        payload: TransportPayload,
    ) -> Self {
        let variant = match kind {
            EventKind::Tcp => EventPayload::Tcp(payload),
            EventKind::Udp => EventPayload::Udp(payload),
            other => {
                return Event {
                    session_id,
                    source_ip,
                    dest_ip,
                    source_port,
                    dest_port,
                    timestamp_ns,
                    payload: EventPayload::Tcp(payload),
                    tags: TagMap::new(),
                    additional: HashMap::new(),
                    errors: vec![format!(
                        "new_from_transport called with non-transport kind {other:?}"
                    )],
                }
            }
        };

        Event {
            session_id,
            source_ip,
            dest_ip,
            source_port,
            dest_port,
            timestamp_ns,
            payload: variant,
            tags: TagMap::new(),
            additional: HashMap::new(),
            errors: Vec::new(),
        }
    }

    /// Construct an ICMP event from parsed packet headers.
    pub fn new_from_icmp(
        kind: EventKind,
        source_ip: String,
        dest_ip: String,
        session_id: String,
        timestamp_ns: u128,
        payload: IcmpPayload,
    ) -> Self {
        let variant = match kind {
            EventKind::Icmpv4 => EventPayload::Icmpv4(payload),
            EventKind::Icmpv6 => EventPayload::Icmpv6(payload),
            _ => EventPayload::Icmpv4(payload),
        };

        Event {
            session_id,
            source_ip,
            dest_ip,
            source_port: 0,
            dest_port: 0,
            timestamp_ns,
            payload: variant,
            tags: TagMap::new(),
            additional: HashMap::new(),
            errors: Vec::new(),
        }
    }
}

/// What the (external) capture/reassembly pipeline hands melody for an
/// observed HTTP request, per spec §6's "Collaborator interfaces
/// consumed".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReassembledHttpRequest {
    pub method: String,
    pub version: Option<String>,
    pub uri: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub is_tls: bool,
    pub source_ip: String,
    pub dest_ip: String,
    pub source_port: u16,
    pub dest_port: u16,
}

/// What the (external) decoy TLS/HTTP server hands melody, with
/// `RemoteAddr` and `Host` already set per spec §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecoyHttpRequest {
    pub method: String,
    pub version: String,
    pub uri: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub remote_addr: String,
    pub host: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request() -> ReassembledHttpRequest {
        ReassembledHttpRequest {
            method: "GET".to_string(),
            version: Some("HTTP/1.1".to_string()),
            uri: "/admin".to_string(),
            headers: vec![
                ("User-Agent".to_string(), "sqlmap/1.5".to_string()),
                ("user-agent".to_string(), "second-value".to_string()),
            ],
            body: Vec::new(),
            is_tls: false,
            source_ip: "10.0.0.1".to_string(),
            dest_ip: "10.0.0.2".to_string(),
            source_port: 51234,
            dest_port: 80,
        }
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let event = Event::new_from_reassembled_http(sample_request(), "sess-1".to_string(), 0);
        let http = event.payload.as_http().unwrap();
        assert_eq!(http.headers.get("User-Agent"), Some("sqlmap/1.5"));
        assert_eq!(http.headers.get("USER-AGENT"), Some("sqlmap/1.5"));
    }

    #[test]
    fn duplicate_headers_first_value_wins_all_preserved() {
        let event = Event::new_from_reassembled_http(sample_request(), "sess-1".to_string(), 0);
        let http = event.payload.as_http().unwrap();
        assert_eq!(http.headers.get("user-agent"), Some("sqlmap/1.5"));
        assert_eq!(http.headers.keys.len(), 2);
        assert_eq!(http.headers.values[1], "second-value");
    }

    #[test]
    fn tags_and_additional_start_empty_not_absent() {
        let event = Event::new_from_reassembled_http(sample_request(), "sess-1".to_string(), 0);
        assert!(event.tags.is_empty());
        assert!(event.additional.is_empty());
        assert!(event.errors.is_empty());
    }

    #[test]
    fn variant_kind_matches_event_kind() {
        let event = Event::new_from_reassembled_http(sample_request(), "sess-1".to_string(), 0);
        assert_eq!(event.kind(), EventKind::Http);
    }
}
