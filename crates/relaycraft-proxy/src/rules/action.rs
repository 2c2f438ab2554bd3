//! Action definitions (SPEC_FULL §3, §4.3.1, §6). This module only carries
//! the data shapes and the handful of pure helpers that belong to the shape
//! itself (capture-group expansion, JSON-modification ordering); applying an
//! action against a live `Flow` is the rule engine's job (`engine.rs`).

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ActionError {
    #[error("referenced file not found")]
    MissingFile,
    #[error("json path did not match any value")]
    JsonPathNoMatch,
    #[error("invalid rewrite_body target")]
    InvalidTarget,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MapLocalSource {
    File,
    Manual,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapLocalAction {
    pub source: MapLocalSource,
    #[serde(default, rename = "localPath", skip_serializing_if = "Option::is_none")]
    pub local_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, rename = "contentType", skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, rename = "statusCode", skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<Vec<HeaderOp>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapRemoteAction {
    #[serde(rename = "targetUrl")]
    pub target_url: String,
    #[serde(rename = "preservePath", default)]
    pub preserve_path: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<Vec<HeaderOp>>,
    /// Legacy field kept alongside `headers` per the Open Question
    /// resolution in SPEC_FULL §9.1 #3 — both are applied when both are
    /// present, unified object first, legacy list second.
    #[serde(default, rename = "requestHeaders", skip_serializing_if = "Option::is_none")]
    pub request_headers: Option<Vec<HeaderOp>>,
}

impl MapRemoteAction {
    /// A `targetUrl` containing a `$N` or `\N` back-reference activates
    /// regex-substitution mode instead of host/scheme/port rewriting
    /// (SPEC_FULL §4.3 step 3).
    pub fn is_regex_substitution(&self) -> bool {
        contains_capture_reference(&self.target_url)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeaderOpKind {
    Add,
    Set,
    Remove,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeaderOp {
    pub operation: HeaderOpKind,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeaderOpSet {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<Vec<HeaderOp>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Vec<HeaderOp>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewriteHeaderAction {
    pub headers: HeaderOpSet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BodyTarget {
    Request,
    Response,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BodySet {
    pub content: String,
    #[serde(default, rename = "statusCode", skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(default, rename = "contentType", skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BodyReplace {
    pub pattern: String,
    pub replacement: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JsonOpKind {
    Set,
    Delete,
    Append,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonModification {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
    pub operation: JsonOpKind,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonBody {
    pub modifications: Vec<JsonModification>,
}

impl JsonBody {
    /// Order modifications so that, within any group of `delete`
    /// operations sharing the same parent JSON-path, the deepest/highest
    /// array index is removed first — avoiding the index-shift-after-delete
    /// hazard (SPEC_FULL §4.3.1). Non-delete operations, and deletes with
    /// distinct parents, keep their original relative order.
    pub fn ordered_modifications(&self) -> Vec<&JsonModification> {
        let mut indexed: Vec<(usize, &JsonModification)> =
            self.modifications.iter().enumerate().collect();
        indexed.sort_by(|(ia, a), (ib, b)| {
            let parent_a = parent_path(&a.path);
            let parent_b = parent_path(&b.path);
            match (a.operation, b.operation) {
                (JsonOpKind::Delete, JsonOpKind::Delete) if parent_a == parent_b => {
                    // same parent: highest index/key first
                    path_tail_key(&b.path).cmp(&path_tail_key(&a.path))
                }
                _ => ia.cmp(ib),
            }
        });
        indexed.into_iter().map(|(_, m)| m).collect()
    }
}

fn parent_path(path: &str) -> &str {
    match path.rfind('.') {
        Some(idx) => &path[..idx],
        None => "",
    }
}

fn path_tail_key(path: &str) -> String {
    match path.rfind('.') {
        Some(idx) => path[idx + 1..].to_string(),
        None => path.to_string(),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewriteBodyAction {
    pub target: BodyTarget,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub set: Option<BodySet>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replace: Option<BodyReplace>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regex_replace: Option<BodyReplace>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json: Option<JsonBody>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThrottleAction {
    #[serde(default, rename = "delayMs", skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u64>,
    #[serde(default, rename = "packetLoss", skip_serializing_if = "Option::is_none")]
    pub packet_loss: Option<f64>,
    #[serde(default, rename = "bandwidthKbps", skip_serializing_if = "Option::is_none")]
    pub bandwidth_kbps: Option<f64>,
}

impl ThrottleAction {
    /// Seconds to sleep for a response body of `content_bytes`
    /// (SPEC_FULL §4.3 response phase step 1).
    pub fn bandwidth_delay_secs(&self, content_bytes: u64) -> f64 {
        match self.bandwidth_kbps {
            Some(kbps) if kbps > 0.0 => (content_bytes as f64 * 8.0) / (kbps * 1000.0),
            _ => 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    BlockRequest,
    MapLocal(MapLocalAction),
    MapRemote(MapRemoteAction),
    RewriteHeader(RewriteHeaderAction),
    RewriteBody(RewriteBodyAction),
    Throttle(ThrottleAction),
}

impl Action {
    /// Whether this action kind can terminate the request phase
    /// (SPEC_FULL §4.3 "Terminal actions").
    pub fn is_terminal_kind(&self) -> bool {
        matches!(
            self,
            Action::BlockRequest | Action::MapLocal(_) | Action::MapRemote(_)
        )
    }
}

fn contains_capture_reference(s: &str) -> bool {
    let bytes = s.as_bytes();
    for (i, b) in bytes.iter().enumerate() {
        if (*b == b'$' || *b == b'\\') && bytes.get(i + 1).is_some_and(u8::is_ascii_digit) {
            return true;
        }
    }
    false
}

/// Expand `$N`/`\N` back-references in `template` using 1-indexed `captures`
/// (SPEC_FULL §4.3.1). A reference past the end of `captures` expands to an
/// empty string rather than erroring, matching the original's permissive
/// substitution behavior.
pub fn expand_captures(template: &str, captures: &[String]) -> String {
    let mut out = String::with_capacity(template.len());
    let chars: Vec<char> = template.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if (c == '$' || c == '\\') && i + 1 < chars.len() && chars[i + 1].is_ascii_digit() {
            let mut j = i + 1;
            while j < chars.len() && chars[j].is_ascii_digit() {
                j += 1;
            }
            let n: usize = chars[i + 1..j].iter().collect::<String>().parse().unwrap_or(0);
            if n >= 1 {
                if let Some(value) = captures.get(n - 1) {
                    out.push_str(value);
                }
            }
            i = j;
        } else {
            out.push(c);
            i += 1;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_dollar_capture_reference() {
        let action = MapRemoteAction {
            target_url: "https://new.com/api/$1".into(),
            preserve_path: false,
            headers: None,
            request_headers: None,
        };
        assert!(action.is_regex_substitution());
    }

    #[test]
    fn detects_backslash_capture_reference() {
        assert!(contains_capture_reference("https://new.com/api/\\1"));
    }

    #[test]
    fn plain_url_has_no_capture_reference() {
        let action = MapRemoteAction {
            target_url: "https://new.com/api".into(),
            preserve_path: true,
            headers: None,
            request_headers: None,
        };
        assert!(!action.is_regex_substitution());
    }

    #[test]
    fn expand_captures_substitutes_dollar_groups() {
        let captures = vec!["x".to_string(), "y".to_string()];
        let expanded = expand_captures("https://new.com/api/$1/$2", &captures);
        assert_eq!(expanded, "https://new.com/api/x/y");
    }

    #[test]
    fn expand_captures_missing_group_becomes_empty() {
        let captures = vec!["x".to_string()];
        let expanded = expand_captures("/$1/$2", &captures);
        assert_eq!(expanded, "/x/");
    }

    #[test]
    fn bandwidth_delay_matches_scenario_3() {
        let throttle = ThrottleAction {
            delay_ms: None,
            packet_loss: None,
            bandwidth_kbps: Some(100.0),
        };
        let secs = throttle.bandwidth_delay_secs(100_000);
        assert!((secs - 8.0).abs() < 0.001);
    }

    #[test]
    fn json_deletes_on_shared_parent_order_highest_index_first() {
        let body = JsonBody {
            modifications: vec![
                JsonModification {
                    path: "items.0".into(),
                    value: None,
                    operation: JsonOpKind::Delete,
                    enabled: true,
                },
                JsonModification {
                    path: "items.2".into(),
                    value: None,
                    operation: JsonOpKind::Delete,
                    enabled: true,
                },
                JsonModification {
                    path: "items.1".into(),
                    value: None,
                    operation: JsonOpKind::Delete,
                    enabled: true,
                },
            ],
        };
        let ordered: Vec<&str> = body
            .ordered_modifications()
            .into_iter()
            .map(|m| m.path.as_str())
            .collect();
        assert_eq!(ordered, vec!["items.2", "items.1", "items.0"]);
    }

    #[test]
    fn json_modifications_with_distinct_parents_keep_original_order() {
        let body = JsonBody {
            modifications: vec![
                JsonModification {
                    path: "a.0".into(),
                    value: None,
                    operation: JsonOpKind::Delete,
                    enabled: true,
                },
                JsonModification {
                    path: "b.0".into(),
                    value: None,
                    operation: JsonOpKind::Delete,
                    enabled: true,
                },
            ],
        };
        let ordered: Vec<&str> = body
            .ordered_modifications()
            .into_iter()
            .map(|m| m.path.as_str())
            .collect();
        assert_eq!(ordered, vec!["a.0", "b.0"]);
    }

    #[test]
    fn action_tag_round_trips_block_request() {
        let json = r#"{"type":"block_request"}"#;
        let action: Action = serde_json::from_str(json).unwrap();
        assert!(matches!(action, Action::BlockRequest));
        assert!(action.is_terminal_kind());
    }
}
