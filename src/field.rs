//! Static field selectors (spec.md DESIGN NOTES: "Dynamic field
//! selectors" redesign flag). The YAML surface syntax names fields by
//! dotted string path (`http.headers.user-agent`); the loader resolves
//! every selector in a rule file to one of the variants below exactly
//! once, at load time. Evaluation is then an indexed match on this enum
//! and a direct struct-field read, never a second string parse or a
//! reflective lookup.

use crate::event::{Event, EventKind, EventPayload};

/// A resolved field path. Header selectors carry the (lowercased) header
/// name as their only runtime-variable piece; everything else is a
/// fixed accessor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FieldSelector {
    HttpVerb,
    HttpProto,
    HttpUri,
    HttpHeader(String),
    HttpBody,
    HttpIsTls,
    TcpPayload,
    TcpFlags,
    TcpWindow,
    TcpSequence,
    UdpPayload,
    IcmpType,
    IcmpCode,
    IcmpPayload,
    IpSrc,
    IpDst,
    PortSrc,
    PortDst,
}

/// A resolved field value, borrowed from the event or scratch buffer
/// where possible so primitives stay allocation-free on the hot path.
#[derive(Debug, Clone)]
pub enum FieldValue<'a> {
    Bytes(&'a [u8]),
    Str(&'a str),
    OwnedStr(String),
    Int(i64),
    Bool(bool),
    /// The selector is well-formed but the field is absent on this
    /// event (e.g. a TCP-only selector against an HTTP event, or a
    /// header that was never sent). This is a defined non-match, not
    /// an error.
    Missing,
}

impl FieldSelector {
    /// Parse the YAML surface selector string into a resolved field
    /// path. Returns `None` for unknown selectors — the loader turns
    /// that into a fatal load-time error (spec §4.3 rule 4).
    pub fn parse(selector: &str) -> Option<FieldSelector> {
        if let Some(name) = selector.strip_prefix("http.headers.") {
            if name.is_empty() {
                return None;
            }
            return Some(FieldSelector::HttpHeader(name.to_ascii_lowercase()));
        }

        match selector {
            "http.verb" => Some(FieldSelector::HttpVerb),
            "http.proto" => Some(FieldSelector::HttpProto),
            "http.uri" => Some(FieldSelector::HttpUri),
            "http.body" => Some(FieldSelector::HttpBody),
            "http.is_tls" => Some(FieldSelector::HttpIsTls),
            "tcp.payload" => Some(FieldSelector::TcpPayload),
            "tcp.flags" => Some(FieldSelector::TcpFlags),
            "tcp.window" => Some(FieldSelector::TcpWindow),
            "tcp.sequence" => Some(FieldSelector::TcpSequence),
            "udp.payload" => Some(FieldSelector::UdpPayload),
            "icmp.type" => Some(FieldSelector::IcmpType),
            "icmp.code" => Some(FieldSelector::IcmpCode),
            "icmp.payload" => Some(FieldSelector::IcmpPayload),
            "ip.src" => Some(FieldSelector::IpSrc),
            "ip.dst" => Some(FieldSelector::IpDst),
            "port.src" => Some(FieldSelector::PortSrc),
            "port.dst" => Some(FieldSelector::PortDst),
            _ => None,
        }
    }

    /// Whether this selector is meaningful for the given layer. Used by
    /// the loader to reject e.g. `tcp.payload` inside an `http`-layer
    /// rule at load time rather than silently never matching.
    pub fn valid_for_layer(&self, layer: EventKind) -> bool {
        match self {
            FieldSelector::IpSrc | FieldSelector::IpDst | FieldSelector::PortSrc | FieldSelector::PortDst => {
                true
            }
            FieldSelector::HttpVerb
            | FieldSelector::HttpProto
            | FieldSelector::HttpUri
            | FieldSelector::HttpHeader(_)
            | FieldSelector::HttpBody
            | FieldSelector::HttpIsTls => matches!(layer, EventKind::Http | EventKind::Https),
            FieldSelector::TcpPayload
            | FieldSelector::TcpFlags
            | FieldSelector::TcpWindow
            | FieldSelector::TcpSequence => matches!(layer, EventKind::Tcp),
            FieldSelector::UdpPayload => matches!(layer, EventKind::Udp),
            FieldSelector::IcmpType | FieldSelector::IcmpCode | FieldSelector::IcmpPayload => {
                matches!(layer, EventKind::Icmpv4 | EventKind::Icmpv6)
            }
        }
    }

    /// Resolve this selector against an event. Returns
    /// [`FieldValue::Missing`] for any structurally-absent field rather
    /// than erroring (spec §4.1, §4.5b).
    pub fn resolve<'a>(&self, event: &'a Event) -> FieldValue<'a> {
        match self {
            FieldSelector::IpSrc => FieldValue::Str(event.source_ip.as_str()),
            FieldSelector::IpDst => FieldValue::Str(event.dest_ip.as_str()),
            FieldSelector::PortSrc => FieldValue::Int(event.source_port as i64),
            FieldSelector::PortDst => FieldValue::Int(event.dest_port as i64),

            FieldSelector::HttpVerb => event
                .payload
                .as_http()
                .map(|h| FieldValue::Str(h.verb.as_str()))
                .unwrap_or(FieldValue::Missing),
            FieldSelector::HttpProto => event
                .payload
                .as_http()
                .map(|h| FieldValue::Str(h.proto.as_str()))
                .unwrap_or(FieldValue::Missing),
            FieldSelector::HttpUri => event
                .payload
                .as_http()
                .map(|h| FieldValue::Str(h.uri.as_str()))
                .unwrap_or(FieldValue::Missing),
            FieldSelector::HttpBody => event
                .payload
                .as_http()
                .map(|h| FieldValue::Bytes(h.body.as_slice()))
                .unwrap_or(FieldValue::Missing),
            FieldSelector::HttpIsTls => event
                .payload
                .as_http()
                .map(|h| FieldValue::Bool(h.is_tls))
                .unwrap_or(FieldValue::Missing),
            FieldSelector::HttpHeader(name) => event
                .payload
                .as_http()
                .and_then(|h| h.headers.get(name))
                .map(FieldValue::Str)
                .unwrap_or(FieldValue::Missing),

            FieldSelector::TcpPayload => match &event.payload {
                EventPayload::Tcp(t) => FieldValue::Bytes(t.payload.as_slice()),
                _ => FieldValue::Missing,
            },
            FieldSelector::TcpFlags => match &event.payload {
                EventPayload::Tcp(t) => t.flags.map(|f| FieldValue::Int(f as i64)).unwrap_or(FieldValue::Missing),
                _ => FieldValue::Missing,
            },
            FieldSelector::TcpWindow => match &event.payload {
                EventPayload::Tcp(t) => t.window.map(|w| FieldValue::Int(w as i64)).unwrap_or(FieldValue::Missing),
                _ => FieldValue::Missing,
            },
            FieldSelector::TcpSequence => match &event.payload {
                EventPayload::Tcp(t) => t.sequence.map(|s| FieldValue::Int(s as i64)).unwrap_or(FieldValue::Missing),
                _ => FieldValue::Missing,
            },
            FieldSelector::UdpPayload => match &event.payload {
                EventPayload::Udp(t) => FieldValue::Bytes(t.payload.as_slice()),
                _ => FieldValue::Missing,
            },
            FieldSelector::IcmpType => event
                .payload
                .as_icmp()
                .map(|i| FieldValue::Int(i.icmp_type as i64))
                .unwrap_or(FieldValue::Missing),
            FieldSelector::IcmpCode => event
                .payload
                .as_icmp()
                .map(|i| FieldValue::Int(i.code as i64))
                .unwrap_or(FieldValue::Missing),
            FieldSelector::IcmpPayload => event
                .payload
                .as_icmp()
                .map(|i| FieldValue::Bytes(i.payload.as_slice()))
                .unwrap_or(FieldValue::Missing),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_header_selector_case_folded() {
        let selector = FieldSelector::parse("http.headers.User-Agent").unwrap();
        assert_eq!(selector, FieldSelector::HttpHeader("user-agent".to_string()));
    }

    #[test]
    fn rejects_unknown_selector() {
        assert!(FieldSelector::parse("http.nonexistent").is_none());
        assert!(FieldSelector::parse("http.headers.").is_none());
    }

    #[test]
    fn tcp_selector_invalid_for_http_layer() {
        let selector = FieldSelector::parse("tcp.payload").unwrap();
        assert!(!selector.valid_for_layer(EventKind::Http));
        assert!(selector.valid_for_layer(EventKind::Tcp));
    }

    #[test]
    fn generic_selectors_valid_everywhere() {
        let selector = FieldSelector::parse("ip.src").unwrap();
        for kind in EventKind::all() {
            assert!(selector.valid_for_layer(kind));
        }
    }
}
