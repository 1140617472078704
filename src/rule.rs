//! Rule AST and normalization (component C3): the YAML surface syntax
//! is parsed into [`Rule`]/[`MatchGroup`]/[`LeafMatch`] — a rooted tree
//! that the evaluator walks with no further string parsing. See the
//! normalization rules in spec §4.3; the "Dynamic field selectors" and
//! "YAML polymorphism of match bodies" redesign flags from spec.md
//! DESIGN NOTES are both addressed here (selectors resolve to
//! [`FieldSelector`] once, at load time; the YAML decoder explicitly
//! disambiguates on which keys are present rather than guessing).

use std::collections::{HashMap, HashSet};

use regex::RegexBuilder;
use serde::Deserialize;
use serde_yaml::Value as YamlValue;

use crate::error::{MelodyError, Result};
use crate::event::EventKind;
use crate::field::FieldSelector;
use crate::payload::{self, Decode};
use crate::primitives::{CompiledPrimitive, NumericOp, NumericValue, StringSet};

/// Free-form rule metadata (author, description, references, ...),
/// stringified for uniform carry-through to the log projector.
pub type RuleMeta = HashMap<String, String>;

/// A fully normalized, immutable rule.
#[derive(Debug, Clone)]
pub struct Rule {
    pub name: String,
    pub layer: EventKind,
    pub meta: RuleMeta,
    pub tags: HashMap<String, Vec<String>>,
    pub matcher: MatchGroup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupOp {
    And,
    Or,
}

/// A node in the compiled matcher tree.
#[derive(Debug, Clone)]
pub enum MatchGroup {
    Leaf(LeafMatch),
    Group {
        operator: GroupOp,
        children: Vec<MatchGroup>,
        negate: bool,
    },
}

impl MatchGroup {
    /// An empty AND group: vacuously true, used for catch-all taps
    /// (spec §4.3 rule 3).
    pub fn match_all() -> MatchGroup {
        MatchGroup::Group {
            operator: GroupOp::And,
            children: Vec::new(),
            negate: false,
        }
    }

    pub fn is_match_all(&self) -> bool {
        matches!(
            self,
            MatchGroup::Group { children, negate: false, .. } if children.is_empty()
        )
    }
}

#[derive(Debug, Clone)]
pub struct LeafMatch {
    pub selector: FieldSelector,
    pub primitive: CompiledPrimitive,
    pub decode: Decode,
}

// ---------------------------------------------------------------------
// Raw YAML surface
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawRuleBody {
    layer: String,
    #[serde(default)]
    meta: HashMap<String, YamlValue>,
    #[serde(default)]
    tags: HashMap<String, Vec<String>>,
    #[serde(rename = "match", default)]
    match_: Option<YamlValue>,
}

/// A YAML rule file's top-level mapping (`rule_name -> rule_body`),
/// deserialized entry-by-entry so that a name repeated within one file
/// is observed twice rather than silently collapsed — the loader needs
/// to see the duplicate to reject it per spec §4.3/§7.1.
struct RawRuleFile(Vec<(String, RawRuleBody)>);

impl<'de> Deserialize<'de> for RawRuleFile {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct RawRuleFileVisitor;

        impl<'de> serde::de::Visitor<'de> for RawRuleFileVisitor {
            type Value = RawRuleFile;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("a mapping of rule name to rule body")
            }

            fn visit_map<A>(self, mut map: A) -> std::result::Result<Self::Value, A::Error>
            where
                A: serde::de::MapAccess<'de>,
            {
                let mut entries = Vec::new();
                while let Some((key, value)) = map.next_entry::<String, RawRuleBody>()? {
                    entries.push((key, value));
                }
                Ok(RawRuleFile(entries))
            }
        }

        deserializer.deserialize_map(RawRuleFileVisitor)
    }
}

/// Parse and normalize every rule in a `.yml` file's contents.
/// `file_name` is used only to annotate error messages.
pub fn parse_rule_file(contents: &str, file_name: &str) -> Result<Vec<Rule>> {
    let raw: RawRuleFile = serde_yaml::from_str(contents)
        .map_err(|e| MelodyError::RuleLoad(format!("{file_name}: YAML parse error: {e}")))?;

    let mut seen_names = HashSet::new();
    let mut rules = Vec::with_capacity(raw.0.len());
    for (name, body) in raw.0 {
        if !seen_names.insert(name.clone()) {
            return Err(MelodyError::RuleLoad(format!(
                "{file_name}: duplicate rule name '{name}'"
            )));
        }
        rules.push(normalize_rule(name, body, file_name)?);
    }
    Ok(rules)
}

fn normalize_rule(name: String, body: RawRuleBody, file_name: &str) -> Result<Rule> {
    let layer = EventKind::parse(&body.layer).ok_or_else(|| {
        MelodyError::RuleLoad(format!(
            "{file_name}: rule '{name}': unknown layer '{}'",
            body.layer
        ))
    })?;

    let meta = body
        .meta
        .into_iter()
        .map(|(k, v)| (k, yaml_value_to_string(&v)))
        .collect();

    let matcher = match &body.match_ {
        None => MatchGroup::match_all(),
        Some(YamlValue::Mapping(m)) if m.is_empty() => MatchGroup::match_all(),
        Some(value @ YamlValue::Mapping(_)) => {
            let mapping = value.as_mapping().expect("checked above");
            let mut children = Vec::with_capacity(mapping.len());
            for (k, v) in mapping.iter() {
                let key = k.as_str().ok_or_else(|| {
                    MelodyError::RuleLoad(format!(
                        "{file_name}: rule '{name}': match keys must be strings"
                    ))
                })?;
                children.push(
                    parse_named_node(key, v, layer)
                        .map_err(|e| contextualize(file_name, &name, e))?,
                );
            }
            collapse_single(GroupOp::And, children)
        }
        Some(_) => {
            return Err(MelodyError::RuleLoad(format!(
                "{file_name}: rule '{name}': 'match' must be a mapping"
            )))
        }
    };

    if matcher.is_match_all() {
        tracing::warn!(
            rule = %name,
            file = %file_name,
            "rule has an empty matcher and will match every event of its layer"
        );
    }

    Ok(Rule {
        name,
        layer,
        meta,
        tags: body.tags,
        matcher,
    })
}

fn contextualize(file_name: &str, rule_name: &str, err: MelodyError) -> MelodyError {
    MelodyError::RuleLoad(format!("{file_name}: rule '{rule_name}': {err}"))
}

fn parse_named_node(key: &str, value: &YamlValue, layer: EventKind) -> Result<MatchGroup> {
    if key == "group" {
        parse_group(value, layer)
    } else {
        parse_field_node(key, value, layer)
    }
}

fn parse_group(value: &YamlValue, layer: EventKind) -> Result<MatchGroup> {
    let operator_str = value.get("operator").and_then(|v| v.as_str()).unwrap_or("and");
    let operator = match operator_str.to_ascii_lowercase().as_str() {
        "and" => GroupOp::And,
        "or" => GroupOp::Or,
        other => return Err(MelodyError::RuleLoad(format!("unknown group operator '{other}'"))),
    };
    let negate = value.get("negate").and_then(|v| v.as_bool()).unwrap_or(false);
    let matches_val = value
        .get("matches")
        .ok_or_else(|| MelodyError::RuleLoad("group is missing 'matches'".to_string()))?;
    let seq = matches_val
        .as_sequence()
        .ok_or_else(|| MelodyError::RuleLoad("group 'matches' must be a list".to_string()))?;
    let children = parse_group_children(seq, layer)?;
    Ok(MatchGroup::Group {
        operator,
        children,
        negate,
    })
}

fn parse_group_children(seq: &[YamlValue], layer: EventKind) -> Result<Vec<MatchGroup>> {
    let mut out = Vec::with_capacity(seq.len());
    for item in seq {
        let mapping = item
            .as_mapping()
            .ok_or_else(|| MelodyError::RuleLoad("group match entry must be a single-key mapping".to_string()))?;
        if mapping.len() != 1 {
            return Err(MelodyError::RuleLoad(
                "group match entry must have exactly one key".to_string(),
            ));
        }
        let (k, v) = mapping.iter().next().expect("length checked above");
        let key = k
            .as_str()
            .ok_or_else(|| MelodyError::RuleLoad("group match entry key must be a string".to_string()))?;
        out.push(parse_named_node(key, v, layer)?);
    }
    Ok(out)
}

fn parse_field_node(selector_str: &str, value: &YamlValue, layer: EventKind) -> Result<MatchGroup> {
    let selector = FieldSelector::parse(selector_str)
        .ok_or_else(|| MelodyError::RuleLoad(format!("unknown selector '{selector_str}'")))?;
    if !selector.valid_for_layer(layer) {
        return Err(MelodyError::RuleLoad(format!(
            "selector '{selector_str}' is not valid for layer '{}'",
            layer.as_str()
        )));
    }

    match value {
        YamlValue::Sequence(items) => {
            let mut leaves = Vec::with_capacity(items.len());
            for item in items {
                leaves.push(MatchGroup::Leaf(parse_leaf_body(selector.clone(), item)?));
            }
            Ok(collapse_single(GroupOp::Or, leaves))
        }
        YamlValue::Mapping(_) => {
            let all_flag = value.get("all").and_then(|v| v.as_bool()).unwrap_or(false);
            if all_flag {
                let matches_val = value.get("matches").ok_or_else(|| {
                    MelodyError::RuleLoad(format!(
                        "'{selector_str}': all:true requires a 'matches' list"
                    ))
                })?;
                let seq = matches_val.as_sequence().ok_or_else(|| {
                    MelodyError::RuleLoad(format!("'{selector_str}': 'matches' must be a list"))
                })?;
                let mut leaves = Vec::with_capacity(seq.len());
                for item in seq {
                    leaves.push(MatchGroup::Leaf(parse_leaf_body(selector.clone(), item)?));
                }
                Ok(collapse_single(GroupOp::And, leaves))
            } else {
                Ok(MatchGroup::Leaf(parse_leaf_body(selector, value)?))
            }
        }
        _ => Err(MelodyError::RuleLoad(format!(
            "'{selector_str}': expected a mapping or a list of matchers"
        ))),
    }
}

/// Redundant unary groups are collapsed (spec §4.3 rule 2): a
/// single-child OR/AND group is just its child.
fn collapse_single(operator: GroupOp, mut children: Vec<MatchGroup>) -> MatchGroup {
    if children.len() == 1 {
        children.pop().expect("length checked above")
    } else {
        MatchGroup::Group {
            operator,
            children,
            negate: false,
        }
    }
}

const PRIMITIVE_KEYS: [&str; 8] = [
    "equals",
    "contains",
    "starts_with",
    "ends_with",
    "regex",
    "in_set",
    "numeric_cmp",
    "binary_pattern",
];

fn parse_leaf_body(selector: FieldSelector, body: &YamlValue) -> Result<LeafMatch> {
    if body.as_mapping().is_none() {
        return Err(MelodyError::RuleLoad("match leaf must be a mapping".to_string()));
    }

    let options = body.get("options");
    let case_insensitive = options
        .and_then(|o| o.get("case_insensitive"))
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let decode = options
        .and_then(|o| o.get("decode"))
        .and_then(|v| v.as_str())
        .map(|s| Decode::parse(s).ok_or_else(|| MelodyError::RuleLoad(format!("unknown decode '{s}'"))))
        .transpose()?
        .unwrap_or(Decode::None);
    let needle_encoding = options
        .and_then(|o| o.get("needle_encoding"))
        .and_then(|v| v.as_str())
        .map(|s| Decode::parse(s).ok_or_else(|| MelodyError::RuleLoad(format!("unknown needle_encoding '{s}'"))))
        .transpose()?
        .unwrap_or(Decode::None);

    let mut primitive_key = None;
    for key in PRIMITIVE_KEYS {
        if body.get(key).is_some() {
            if primitive_key.is_some() {
                return Err(MelodyError::RuleLoad(
                    "match leaf must specify exactly one primitive".to_string(),
                ));
            }
            primitive_key = Some(key);
        }
    }
    let primitive_key = primitive_key
        .ok_or_else(|| MelodyError::RuleLoad("match leaf specifies no known primitive".to_string()))?;
    let raw_value = body.get(primitive_key).expect("presence checked above");

    let primitive = match primitive_key {
        "equals" => CompiledPrimitive::Equals(build_string_set(raw_value, case_insensitive, needle_encoding)?),
        "contains" => CompiledPrimitive::Contains(build_string_set(raw_value, case_insensitive, needle_encoding)?),
        "starts_with" => {
            CompiledPrimitive::StartsWith(build_string_set(raw_value, case_insensitive, needle_encoding)?)
        }
        "ends_with" => CompiledPrimitive::EndsWith(build_string_set(raw_value, case_insensitive, needle_encoding)?),
        "regex" => {
            let pattern = raw_value
                .as_str()
                .ok_or_else(|| MelodyError::RuleLoad("regex value must be a string".to_string()))?;
            let compiled = RegexBuilder::new(pattern)
                .case_insensitive(case_insensitive)
                .build()
                .map_err(|e| MelodyError::RuleLoad(format!("uncompilable regex '{pattern}': {e}")))?;
            CompiledPrimitive::Regex(compiled)
        }
        "in_set" => {
            let items = raw_value
                .as_sequence()
                .ok_or_else(|| MelodyError::RuleLoad("in_set value must be a list".to_string()))?;
            let mut set = HashSet::new();
            for item in items {
                let s = item
                    .as_str()
                    .ok_or_else(|| MelodyError::RuleLoad("in_set items must be strings".to_string()))?;
                let mut bytes = decode_needle(s, needle_encoding)?;
                if case_insensitive {
                    bytes = bytes.to_ascii_lowercase();
                }
                set.insert(bytes);
            }
            CompiledPrimitive::InSet(set)
        }
        "numeric_cmp" => {
            let op_str = raw_value
                .get("op")
                .and_then(|v| v.as_str())
                .ok_or_else(|| MelodyError::RuleLoad("numeric_cmp requires 'op'".to_string()))?;
            let op = parse_numeric_op(op_str)?;
            let value_node = raw_value
                .get("value")
                .ok_or_else(|| MelodyError::RuleLoad("numeric_cmp requires 'value'".to_string()))?;
            let target = if let Some(i) = value_node.as_i64() {
                NumericValue::Int(i)
            } else if let Some(f) = value_node.as_f64() {
                NumericValue::Float(f)
            } else {
                return Err(MelodyError::RuleLoad("numeric_cmp 'value' must be numeric".to_string()));
            };
            CompiledPrimitive::NumericCmp(op, target)
        }
        "binary_pattern" => {
            let pattern_str = raw_value
                .as_str()
                .ok_or_else(|| MelodyError::RuleLoad("binary_pattern value must be a string".to_string()))?;
            let pattern = crate::primitives::parse_binary_pattern(pattern_str)
                .ok_or_else(|| MelodyError::RuleLoad(format!("invalid binary_pattern '{pattern_str}'")))?;
            CompiledPrimitive::BinaryPattern(pattern)
        }
        _ => unreachable!("PRIMITIVE_KEYS is exhaustive"),
    };

    Ok(LeafMatch {
        selector,
        primitive,
        decode,
    })
}

fn string_needles(raw: &YamlValue) -> Result<Vec<String>> {
    match raw {
        YamlValue::String(s) => Ok(vec![s.clone()]),
        YamlValue::Sequence(seq) => seq
            .iter()
            .map(|v| {
                v.as_str()
                    .map(|s| s.to_string())
                    .ok_or_else(|| MelodyError::RuleLoad("needle list items must be strings".to_string()))
            })
            .collect(),
        _ => Err(MelodyError::RuleLoad(
            "expected a string or a list of strings".to_string(),
        )),
    }
}

fn decode_needle(s: &str, encoding: Decode) -> Result<Vec<u8>> {
    match encoding {
        Decode::None => Ok(s.as_bytes().to_vec()),
        other => payload::decode(s.as_bytes(), other)
            .ok_or_else(|| MelodyError::RuleLoad(format!("failed to pre-decode needle '{s}' as {other:?}"))),
    }
}

fn build_string_set(raw: &YamlValue, case_insensitive: bool, needle_encoding: Decode) -> Result<StringSet> {
    let needles = string_needles(raw)?
        .into_iter()
        .map(|s| decode_needle(&s, needle_encoding))
        .collect::<Result<Vec<_>>>()?;
    Ok(StringSet {
        needles,
        case_insensitive,
    })
}

fn parse_numeric_op(s: &str) -> Result<NumericOp> {
    match s {
        "eq" | "==" => Ok(NumericOp::Eq),
        "ne" | "!=" => Ok(NumericOp::Ne),
        "lt" | "<" => Ok(NumericOp::Lt),
        "lte" | "<=" => Ok(NumericOp::Lte),
        "gt" | ">" => Ok(NumericOp::Gt),
        "gte" | ">=" => Ok(NumericOp::Gte),
        other => Err(MelodyError::RuleLoad(format!("unknown numeric_cmp op '{other}'"))),
    }
}

fn yaml_value_to_string(v: &YamlValue) -> String {
    match v {
        YamlValue::String(s) => s.clone(),
        YamlValue::Number(n) => n.to_string(),
        YamlValue::Bool(b) => b.to_string(),
        YamlValue::Null => String::new(),
        YamlValue::Sequence(seq) => seq.iter().map(yaml_value_to_string).collect::<Vec<_>>().join(", "),
        other => serde_yaml::to_string(other).unwrap_or_default().trim().to_string(),
    }
}
