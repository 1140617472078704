//! Match primitives (component C2): pure `(field_value, options) -> bool`
//! leaf predicates. Case-insensitive string comparisons fold ASCII only
//! (never Unicode, per spec §4.2) and avoid allocating on the hot path
//! by walking byte slices directly instead of building owned lowercase
//! copies.

use regex::Regex;
use std::collections::HashSet;

/// A compiled, ready-to-evaluate leaf primitive. Built once at rule
/// load time by [`crate::loader`]; never mutated afterward.
#[derive(Debug, Clone)]
pub enum CompiledPrimitive {
    Equals(StringSet),
    Contains(StringSet),
    StartsWith(StringSet),
    EndsWith(StringSet),
    Regex(Regex),
    InSet(HashSet<Vec<u8>>),
    NumericCmp(NumericOp, NumericValue),
    BinaryPattern(Vec<Option<u8>>),
}

/// A set of alternative literal needles; a match against any one of
/// them is a match for the primitive (spec §3's "implicit OR" over
/// needles).
#[derive(Debug, Clone)]
pub struct StringSet {
    pub needles: Vec<Vec<u8>>,
    pub case_insensitive: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumericOp {
    Eq,
    Ne,
    Lt,
    Lte,
    Gt,
    Gte,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NumericValue {
    Int(i64),
    Float(f64),
}

impl CompiledPrimitive {
    /// Evaluate this primitive against a resolved byte slice. Missing
    /// fields are handled by the caller before reaching here (the
    /// defined non-match of spec §4.5b); this function only ever sees
    /// a present (possibly decoded) value.
    pub fn eval(&self, value: &[u8]) -> bool {
        match self {
            CompiledPrimitive::Equals(set) => set.needles.iter().any(|n| {
                if set.case_insensitive {
                    ascii_eq_ignore_case(value, n)
                } else {
                    value == n.as_slice()
                }
            }),
            CompiledPrimitive::Contains(set) => set.needles.iter().any(|n| {
                if set.case_insensitive {
                    ascii_contains_ignore_case(value, n)
                } else {
                    contains(value, n)
                }
            }),
            CompiledPrimitive::StartsWith(set) => set.needles.iter().any(|n| {
                if set.case_insensitive {
                    ascii_starts_with_ignore_case(value, n)
                } else {
                    value.starts_with(n.as_slice())
                }
            }),
            CompiledPrimitive::EndsWith(set) => set.needles.iter().any(|n| {
                if set.case_insensitive {
                    ascii_ends_with_ignore_case(value, n)
                } else {
                    value.ends_with(n.as_slice())
                }
            }),
            CompiledPrimitive::Regex(re) => match std::str::from_utf8(value) {
                Ok(s) => re.is_match(s),
                Err(_) => false,
            },
            CompiledPrimitive::InSet(set) => set.contains(value),
            CompiledPrimitive::NumericCmp(op, target) => match parse_numeric(value) {
                Some(actual) => numeric_compare(actual, *op, *target),
                // Parse failure yields non-match, not error (spec §4.2).
                None => false,
            },
            CompiledPrimitive::BinaryPattern(pattern) => binary_pattern_scan(value, pattern),
        }
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    if needle.is_empty() {
        return true;
    }
    haystack.windows(needle.len()).any(|w| w == needle)
}

fn ascii_eq_ignore_case(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.eq_ignore_ascii_case(y))
}

fn ascii_starts_with_ignore_case(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.len() >= needle.len() && ascii_eq_ignore_case(&haystack[..needle.len()], needle)
}

fn ascii_ends_with_ignore_case(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.len() >= needle.len()
        && ascii_eq_ignore_case(&haystack[haystack.len() - needle.len()..], needle)
}

fn ascii_contains_ignore_case(haystack: &[u8], needle: &[u8]) -> bool {
    if needle.is_empty() {
        return true;
    }
    if haystack.len() < needle.len() {
        return false;
    }
    haystack
        .windows(needle.len())
        .any(|w| ascii_eq_ignore_case(w, needle))
}

/// Scan for any occurrence of `pattern` (with `None` wildcard bytes) in
/// `haystack`, per spec §4.2's `binary_pattern` contract.
fn binary_pattern_scan(haystack: &[u8], pattern: &[Option<u8>]) -> bool {
    if pattern.is_empty() || haystack.len() < pattern.len() {
        return false;
    }
    haystack.windows(pattern.len()).any(|window| {
        window
            .iter()
            .zip(pattern.iter())
            .all(|(b, p)| match p {
                Some(expected) => b == expected,
                None => true,
            })
    })
}

fn parse_numeric(value: &[u8]) -> Option<NumericValue> {
    let s = std::str::from_utf8(value).ok()?.trim();
    if let Ok(i) = s.parse::<i64>() {
        return Some(NumericValue::Int(i));
    }
    s.parse::<f64>().ok().map(NumericValue::Float)
}

fn numeric_compare(actual: NumericValue, op: NumericOp, target: NumericValue) -> bool {
    let (a, t) = match (actual, target) {
        (NumericValue::Int(a), NumericValue::Int(t)) => (a as f64, t as f64),
        (NumericValue::Int(a), NumericValue::Float(t)) => (a as f64, t),
        (NumericValue::Float(a), NumericValue::Int(t)) => (a, t as f64),
        (NumericValue::Float(a), NumericValue::Float(t)) => (a, t),
    };
    match op {
        NumericOp::Eq => a == t,
        NumericOp::Ne => a != t,
        NumericOp::Lt => a < t,
        NumericOp::Lte => a <= t,
        NumericOp::Gt => a > t,
        NumericOp::Gte => a >= t,
    }
}

/// Parse a fixed-length byte pattern with `??` wildcard tokens (e.g.
/// `"4d5a??00"`) into the wildcard-aware form the evaluator scans with.
pub fn parse_binary_pattern(spec: &str) -> Option<Vec<Option<u8>>> {
    let cleaned: String = spec.chars().filter(|c| !c.is_whitespace()).collect();
    if cleaned.len() % 2 != 0 {
        return None;
    }
    let mut out = Vec::with_capacity(cleaned.len() / 2);
    let bytes = cleaned.as_bytes();
    for chunk in bytes.chunks(2) {
        let token = std::str::from_utf8(chunk).ok()?;
        if token == "??" {
            out.push(None);
        } else {
            out.push(Some(u8::from_str_radix(token, 16).ok()?));
        }
    }
    Some(out)
}
