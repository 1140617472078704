//! Payload decoders and size caps (component C8). Shared by the rule
//! normalizer (pre-decoding literal needles), the evaluator's `decode`
//! leaf option, and the log projector's capped body rendering.

use base64::Engine;
use serde::{Deserialize, Serialize};
use std::io::Read;

/// The `decode` option on a [`crate::rule::LeafMatch`]: applied to the
/// field value before the primitive runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Decode {
    #[default]
    None,
    Base64,
    Hex,
    Gzip,
}

impl Decode {
    pub fn parse(s: &str) -> Option<Decode> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Some(Decode::None),
            "base64" => Some(Decode::Base64),
            "hex" => Some(Decode::Hex),
            "gzip" => Some(Decode::Gzip),
            _ => None,
        }
    }
}

/// Decode `input` per `decode`. A decode failure is a defined non-match
/// for the caller (spec §4.2/§4.5c), represented here as `None` rather
/// than an error — callers never need to distinguish "failed to decode"
/// from any other reason a leaf didn't match.
pub fn decode(input: &[u8], decode: Decode) -> Option<Vec<u8>> {
    match decode {
        Decode::None => Some(input.to_vec()),
        Decode::Base64 => base64::engine::general_purpose::STANDARD
            .decode(input)
            .ok(),
        Decode::Hex => {
            let as_str = std::str::from_utf8(input).ok()?;
            hex::decode(as_str.trim()).ok()
        }
        Decode::Gzip => {
            let mut decoder = flate2::read::GzDecoder::new(input);
            let mut out = Vec::new();
            decoder.read_to_end(&mut out).ok()?;
            Some(out)
        }
    }
}

/// A size-capped, base64-rendered payload wrapper for log output
/// (spec §4.8, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayloadLog {
    pub encoding: String,
    pub data: String,
    pub truncated: bool,
    pub original_size: usize,
}

/// Build a capped, base64-encoded log representation of `bytes`.
///
/// When `cap >= bytes.len()` the round trip is exact: decoding `data`
/// yields `bytes` bit-for-bit and `truncated` is `false` (spec §8
/// round-trip property).
pub fn payload_log(bytes: &[u8], cap: usize) -> PayloadLog {
    let original_size = bytes.len();
    let truncated = original_size > cap;
    let slice = if truncated { &bytes[..cap] } else { bytes };

    if truncated {
        metrics::counter!("melody_payload_truncated").increment(1);
    }

    PayloadLog {
        encoding: "base64".to_string(),
        data: base64::engine::general_purpose::STANDARD.encode(slice),
        truncated,
        original_size,
    }
}

/// Decode a [`PayloadLog`]'s `data` field back to raw bytes, for tests
/// and tooling that need to invert `payload_log`.
pub fn payload_log_decode(log: &PayloadLog) -> Option<Vec<u8>> {
    base64::engine::general_purpose::STANDARD.decode(&log.data).ok()
}
