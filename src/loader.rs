//! Rule loader (component C4): walks a rule directory, parses every
//! `.yml`/`.yaml` file, and partitions the normalized rules by layer.
//! Loading is fail-closed: any malformed file aborts the whole load
//! (spec §4.4, §7.1) rather than silently skipping the bad file.

use std::collections::HashMap;
use std::path::Path;

use walkdir::WalkDir;

use crate::error::{MelodyError, Result};
use crate::event::EventKind;
use crate::rule::{self, Rule};

/// Rules partitioned by layer, ready for the evaluator to index into
/// directly with no further filtering.
#[derive(Debug, Default)]
pub struct RuleStore {
    by_layer: HashMap<EventKind, Vec<Rule>>,
    total: usize,
}

impl RuleStore {
    pub fn rules_for(&self, layer: EventKind) -> &[Rule] {
        self.by_layer.get(&layer).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn total_rules(&self) -> usize {
        self.total
    }

    /// Per-layer rule counts, for `/stats` and `melody lint`.
    pub fn stats(&self) -> HashMap<&'static str, usize> {
        EventKind::all()
            .into_iter()
            .map(|kind| (kind.as_str(), self.rules_for(kind).len()))
            .collect()
    }
}

/// Load and normalize every rule file under `rules_dir`, skipping any
/// file whose name appears in `skip_list`. Returns a fatal
/// [`MelodyError::RuleLoad`] on the first problem encountered — an
/// unreadable directory, a YAML syntax error, an unknown selector, an
/// uncompilable regex, or a rule name duplicated within a file.
pub fn load_rules(rules_dir: &str, skip_list: &[String]) -> Result<RuleStore> {
    let root = Path::new(rules_dir);
    if !root.exists() {
        return Err(MelodyError::RuleLoad(format!(
            "rules directory '{rules_dir}' does not exist"
        )));
    }

    let mut store = RuleStore::default();

    for entry in WalkDir::new(root).into_iter() {
        let entry = entry.map_err(|e| MelodyError::RuleLoad(format!("walking '{rules_dir}': {e}")))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();

        if skip_list.iter().any(|s| s == file_name) {
            continue;
        }
        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yml") | Some("yaml")
        );
        if !is_yaml {
            tracing::warn!(file = %path.display(), "skipping non-rule file with unrecognized extension");
            continue;
        }

        let display_path = path.display().to_string();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| MelodyError::RuleLoad(format!("reading '{display_path}': {e}")))?;

        let rules = rule::parse_rule_file(&contents, &display_path)?;
        for parsed_rule in rules {
            store.total += 1;
            metrics::counter!("melody_rules_loaded", "layer" => parsed_rule.layer.as_str()).increment(1);
            store.by_layer.entry(parsed_rule.layer).or_default().push(parsed_rule);
        }
    }

    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_rule_file(dir: &std::path::Path, name: &str, contents: &str) {
        let path = dir.join(name);
        let mut file = std::fs::File::create(path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
    }

    #[test]
    fn loads_and_partitions_by_layer() {
        let dir = tempfile::tempdir().unwrap();
        write_rule_file(
            dir.path(),
            "http.yml",
            "ua_sqlmap:\n  layer: http\n  match:\n    http.headers.user-agent:\n      contains: [\"sqlmap\"]\n",
        );
        write_rule_file(
            dir.path(),
            "tcp.yml",
            "syn_scan:\n  layer: tcp\n  match:\n    tcp.flags:\n      numeric_cmp: { op: eq, value: 2 }\n",
        );

        let store = load_rules(dir.path().to_str().unwrap(), &[]).unwrap();
        assert_eq!(store.total_rules(), 2);
        assert_eq!(store.rules_for(EventKind::Http).len(), 1);
        assert_eq!(store.rules_for(EventKind::Tcp).len(), 1);
        assert_eq!(store.rules_for(EventKind::Udp).len(), 0);
    }

    #[test]
    fn skip_list_excludes_named_files() {
        let dir = tempfile::tempdir().unwrap();
        write_rule_file(dir.path(), "README.md", "not yaml at all");
        write_rule_file(
            dir.path(),
            "rules.yml",
            "r1:\n  layer: http\n  match: {}\n",
        );

        let store = load_rules(
            dir.path().to_str().unwrap(),
            &["README.md".to_string()],
        )
        .unwrap();
        assert_eq!(store.total_rules(), 1);
    }

    #[test]
    fn non_yaml_extension_not_in_skip_list_is_skipped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        write_rule_file(dir.path(), "notes.txt", "not yaml at all, and not skip-listed either");
        write_rule_file(
            dir.path(),
            "rules.yml",
            "r1:\n  layer: http\n  match: {}\n",
        );

        let store = load_rules(dir.path().to_str().unwrap(), &[]).unwrap();
        assert_eq!(store.total_rules(), 1);
    }

    #[test]
    fn missing_directory_is_fatal() {
        let err = load_rules("/nonexistent/melody/rules", &[]).unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn bad_rule_file_aborts_whole_load() {
        let dir = tempfile::tempdir().unwrap();
        write_rule_file(
            dir.path(),
            "good.yml",
            "r1:\n  layer: http\n  match: {}\n",
        );
        write_rule_file(
            dir.path(),
            "bad.yml",
            "r2:\n  layer: http\n  match:\n    http.nonexistent:\n      equals: \"x\"\n",
        );

        let err = load_rules(dir.path().to_str().unwrap(), &[]).unwrap_err();
        assert!(err.to_string().contains("unknown selector"));
    }
}
