//! Rule loading and hot reload (SPEC_FULL §4.1, §9 "Hot reload throttling",
//! "Rule indexing").

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use parking_lot::Mutex;
use serde::Deserialize;
use thiserror::Error;

use super::atom::{classify_host_bucket, HostBucket};
use super::rule::{sort_rules, Rule};

#[derive(Debug, Error)]
pub enum RuleLoadError {
    #[error("io error reading rules: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid rule yaml in {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

/// On-disk rule file shape: one rule nested under the `rule` key, with an
/// `execution` block that this module flattens into `Rule`'s own fields
/// (SPEC_FULL §6 "Rule file format").
#[derive(Debug, Deserialize)]
struct RuleFile {
    rule: RuleFileBody,
}

#[derive(Debug, Deserialize)]
struct RuleFileBody {
    id: String,
    name: String,
    #[serde(default)]
    execution: ExecutionBlock,
    #[serde(rename = "match", default)]
    match_block: super::rule::MatchBlock,
    #[serde(default)]
    actions: Vec<super::action::Action>,
}

#[derive(Debug, Default, Deserialize)]
struct ExecutionBlock {
    #[serde(default)]
    enabled: bool,
    #[serde(default)]
    priority: i32,
    #[serde(default, rename = "stopOnMatch")]
    stop_on_match: bool,
}

impl RuleFile {
    fn into_rule(self, source_path: PathBuf) -> Rule {
        Rule {
            id: self.rule.id,
            name: self.rule.name,
            enabled: self.rule.execution.enabled,
            priority: self.rule.execution.priority,
            stop_on_match: self.rule.execution.stop_on_match,
            match_block: self.rule.match_block,
            actions: self.rule.actions,
            source_path: Some(source_path),
        }
    }
}

/// A loaded, indexed ruleset (SPEC_FULL §4.3 "Candidate selection").
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    pub global: Vec<Rule>,
    pub exact_host_index: HashMap<String, Vec<Rule>>,
    pub complex_host: Vec<Rule>,
}

impl RuleSet {
    fn from_rules(mut rules: Vec<Rule>) -> Self {
        sort_rules(&mut rules);

        let mut global = Vec::new();
        let mut exact_host_index: HashMap<String, Vec<Rule>> = HashMap::new();
        let mut complex_host = Vec::new();

        for rule in rules {
            match classify_host_bucket(&rule.match_block.request) {
                HostBucket::Global => global.push(rule),
                HostBucket::ExactHost => {
                    let host = rule
                        .match_block
                        .request
                        .iter()
                        .find_map(|a| a.host_value())
                        .unwrap_or_default()
                        .to_string();
                    exact_host_index.entry(host).or_default().push(rule);
                }
                HostBucket::ComplexHost => complex_host.push(rule),
            }
        }

        Self {
            global,
            exact_host_index,
            complex_host,
        }
    }

    /// Candidate rules for `host`, re-sorted per SPEC_FULL §4.3 step 4.
    pub fn candidates_for_host(&self, host: &str) -> Vec<&Rule> {
        let mut candidates: Vec<&Rule> = self.global.iter().collect();
        if let Some(exact) = self.exact_host_index.get(host) {
            candidates.extend(exact.iter());
        }
        candidates.extend(self.complex_host.iter());
        candidates.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        candidates
    }

    pub fn total_len(&self) -> usize {
        self.global.len()
            + self.exact_host_index.values().map(Vec::len).sum::<usize>()
            + self.complex_host.len()
    }
}

#[derive(Debug, Clone, Copy)]
struct DirFingerprint {
    file_count: usize,
    max_mtime: SystemTime,
}

/// Scans a rules directory tree for `*.yaml`/`*.yml` files, parses, compiles,
/// and indexes them, throttling rescans to at most once per second
/// (SPEC_FULL §4.1, §9 "Hot reload throttling").
pub struct RuleLoader {
    root: PathBuf,
    min_reload_interval: Duration,
    state: Mutex<LoaderState>,
}

struct LoaderState {
    last_checked: Option<Instant>,
    fingerprint: Option<DirFingerprint>,
    ruleset: RuleSet,
}

impl RuleLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            min_reload_interval: Duration::from_secs(1),
            state: Mutex::new(LoaderState {
                last_checked: None,
                fingerprint: None,
                ruleset: RuleSet::default(),
            }),
        }
    }

    /// Returns the current ruleset, rescanning the directory tree if the 1s
    /// throttle window has elapsed and the cheap fingerprint (file count +
    /// max mtime) indicates a change. Idempotent and safe to call on every
    /// request.
    pub fn reload_if_stale(&self) -> RuleSet {
        let mut state = self.state.lock();

        let now = Instant::now();
        let should_check = match state.last_checked {
            Some(last) => now.duration_since(last) >= self.min_reload_interval,
            None => true,
        };
        if !should_check {
            return state.ruleset.clone();
        }
        state.last_checked = Some(now);

        let fingerprint = match scan_fingerprint(&self.root) {
            Ok(fp) => fp,
            Err(e) => {
                tracing::warn!(root = %self.root.display(), error = %e, "failed to stat rules directory; keeping last-good ruleset");
                return state.ruleset.clone();
            }
        };

        let changed = match state.fingerprint {
            Some(prev) => {
                prev.file_count != fingerprint.file_count || prev.max_mtime != fingerprint.max_mtime
            }
            None => true,
        };
        if !changed {
            return state.ruleset.clone();
        }

        match load_rules(&self.root) {
            Ok(rules) => {
                state.fingerprint = Some(fingerprint);
                state.ruleset = RuleSet::from_rules(rules);
            }
            Err(e) => {
                tracing::error!(root = %self.root.display(), error = %e, "rule reload failed; retaining last-good ruleset");
            }
        }
        state.ruleset.clone()
    }
}

fn scan_fingerprint(root: &Path) -> Result<DirFingerprint, RuleLoadError> {
    let mut file_count = 0usize;
    let mut max_mtime = SystemTime::UNIX_EPOCH;
    if !root.exists() {
        return Ok(DirFingerprint {
            file_count: 0,
            max_mtime,
        });
    }
    for entry in walk_yaml_files(root)? {
        let meta = fs::metadata(&entry)?;
        if let Ok(mtime) = meta.modified() {
            if mtime > max_mtime {
                max_mtime = mtime;
            }
        }
        file_count += 1;
    }
    Ok(DirFingerprint {
        file_count,
        max_mtime,
    })
}

fn walk_yaml_files(root: &Path) -> Result<Vec<PathBuf>, RuleLoadError> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if is_yaml(&path) && !is_reserved(&path) {
                out.push(path);
            }
        }
    }
    Ok(out)
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    )
}

/// `groups.yaml` is a reserved filename (SPEC_FULL §4.1 "File discovery") not
/// eligible to contribute a rule, wherever it appears in the tree.
fn is_reserved(path: &Path) -> bool {
    path.file_name().and_then(|f| f.to_str()) == Some("groups.yaml")
}

/// Parse and compile a single rule file, returning a typed error instead of
/// logging-and-skipping. Used by the offline rule validator binary, where a
/// malformed file should fail loudly rather than be silently dropped.
pub fn parse_rule_file(path: &Path) -> Result<Rule, RuleLoadError> {
    let contents = fs::read_to_string(path)?;
    let file: RuleFile = serde_yaml::from_str(&contents).map_err(|source| RuleLoadError::Yaml {
        path: path.to_path_buf(),
        source,
    })?;
    let mut rule = file.into_rule(path.to_path_buf());
    rule.compile();
    Ok(rule)
}

fn load_rules(root: &Path) -> Result<Vec<Rule>, RuleLoadError> {
    let mut rules = Vec::new();
    for path in walk_yaml_files(root)? {
        let contents = fs::read_to_string(&path)?;
        match serde_yaml::from_str::<RuleFile>(&contents) {
            Ok(file) => {
                let mut rule = file.into_rule(path.clone());
                rule.compile();
                rules.push(rule);
            }
            Err(source) => {
                // A single malformed rule file must not take down the whole
                // reload; log and skip it (SPEC_FULL §7 "Rule configuration
                // errors").
                tracing::warn!(path = %path.display(), error = %source, "skipping invalid rule file");
            }
        }
    }
    Ok(rules)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_rule(dir: &Path, filename: &str, contents: &str) {
        let path = dir.join(filename);
        let mut f = fs::File::create(path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
    }

    const BLOCK_RULE: &str = r#"
rule:
  id: r1
  name: Block Admin
  execution: { enabled: true, priority: 0, stopOnMatch: true }
  match:
    request:
      - { type: url, matchType: contains, value: "/admin" }
  actions:
    - type: block_request
"#;

    #[test]
    fn loads_and_indexes_a_global_rule() {
        let dir = tempfile::tempdir().unwrap();
        write_rule(dir.path(), "block.yaml", BLOCK_RULE);

        let loader = RuleLoader::new(dir.path());
        let ruleset = loader.reload_if_stale();
        assert_eq!(ruleset.total_len(), 1);
        assert_eq!(ruleset.global.len(), 1);
        assert!(ruleset.global[0].stop_on_match);
    }

    #[test]
    fn invalid_yaml_is_skipped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        write_rule(dir.path(), "good.yaml", BLOCK_RULE);
        write_rule(dir.path(), "bad.yaml", "not: [valid e");

        let loader = RuleLoader::new(dir.path());
        let ruleset = loader.reload_if_stale();
        assert_eq!(ruleset.total_len(), 1);
    }

    #[test]
    fn exact_host_rule_is_indexed_by_host() {
        let dir = tempfile::tempdir().unwrap();
        write_rule(
            dir.path(),
            "host.yaml",
            r#"
rule:
  id: r2
  name: Host Rule
  execution: { enabled: true, priority: 0 }
  match:
    request:
      - { type: host, matchType: exact, value: "example.com" }
  actions: []
"#,
        );
        let loader = RuleLoader::new(dir.path());
        let ruleset = loader.reload_if_stale();
        assert!(ruleset.exact_host_index.contains_key("example.com"));
        assert!(ruleset.global.is_empty());
    }

    #[test]
    fn groups_yaml_is_reserved_and_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write_rule(dir.path(), "block.yaml", BLOCK_RULE);
        write_rule(dir.path(), "groups.yaml", "groups: [a, b]");

        let loader = RuleLoader::new(dir.path());
        let ruleset = loader.reload_if_stale();
        assert_eq!(ruleset.total_len(), 1);
    }

    #[test]
    fn missing_directory_yields_empty_ruleset_without_erroring() {
        let loader = RuleLoader::new("/nonexistent/path/for/rules");
        let ruleset = loader.reload_if_stale();
        assert_eq!(ruleset.total_len(), 0);
    }

    #[test]
    fn parse_rule_file_surfaces_yaml_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.yaml");
        fs::write(&path, "not: [valid e").unwrap();
        let err = parse_rule_file(&path).unwrap_err();
        assert!(matches!(err, RuleLoadError::Yaml { .. }));
    }

    #[test]
    fn parse_rule_file_compiles_atoms() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("good.yaml");
        fs::write(&path, BLOCK_RULE).unwrap();
        let rule = parse_rule_file(&path).unwrap();
        assert_eq!(rule.id, "r1");
    }
}
