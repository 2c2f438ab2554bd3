//! The rule engine: orchestrates the loader + matcher + action executor into
//! the two-phase pipeline described in SPEC_FULL §4.3.
//!
//! Candidate selection and matching happen once, at request time; both
//! phases then iterate the same matched-rule list, applying whichever
//! action kinds belong to that phase. The caller (the Core Addon) holds the
//! [`MatchedRule`] list returned by [`RuleEngine::process_request`] across
//! the upstream fetch and feeds it back into [`RuleEngine::process_response`].

use std::time::Duration;

use rand::Rng;
use regex::Regex;
use serde_json_path::JsonPath;

use crate::flow::{Flow, FlowResponse, Phase};
use crate::rules::action::{
    Action, BodyTarget, HeaderOpKind, JsonOpKind, MapLocalSource, RewriteBodyAction,
};
use crate::rules::hit::{Hit, HitType};
use crate::rules::loader::RuleSet;
use crate::rules::matcher::match_rule;
use crate::rules::rule::Rule;
use crate::util::mime_for_path;

/// A rule that matched this flow, together with the URL capture groups the
/// matcher extracted for it (SPEC_FULL §4.2).
#[derive(Debug, Clone)]
pub struct MatchedRule {
    pub rule: Rule,
    pub captures: Vec<String>,
}

/// Outcome of running the request phase: whether a terminal action produced
/// a local response, and which rules matched (threaded through to the
/// response phase).
#[derive(Debug, Default)]
pub struct RequestOutcome {
    pub matched: Vec<MatchedRule>,
}

pub struct RuleEngine;

impl RuleEngine {
    pub fn new() -> Self {
        Self
    }

    /// Select and evaluate candidate rules, apply request-phase actions in
    /// the fixed order of SPEC_FULL §4.3, and return the matched-rule list
    /// for later reuse in the response phase.
    pub async fn process_request(&self, flow: &mut Flow, ruleset: &RuleSet) -> RequestOutcome {
        let candidates = ruleset.candidates_for_host(&flow.request.host);
        let mut matched = Vec::new();

        for rule in candidates {
            if !rule.enabled {
                continue;
            }
            let outcome = match_rule(flow, rule);
            if !outcome.matched {
                continue;
            }
            flow.meta.matched_rules.push(rule.id.clone());
            flow.meta.record_hit(Hit::success(
                rule.id.clone(),
                rule.name.clone(),
                HitType::Rule,
            ));
            matched.push(MatchedRule {
                rule: rule.clone(),
                captures: outcome.captures,
            });
            if rule.stop_on_match {
                break;
            }
        }

        // Step 1: throttle (latency + packet loss).
        for m in &matched {
            for action in &m.rule.actions {
                if let Action::Throttle(t) = action {
                    if apply_packet_loss(flow, t.packet_loss) {
                        return RequestOutcome { matched };
                    }
                    if let Some(ms) = t.delay_ms {
                        tokio::time::sleep(Duration::from_millis(ms)).await;
                    }
                }
            }
        }

        // Step 2: terminal actions, cascading block > map_local > map_remote.
        if let Some(blocking) = find_block_request(&matched) {
            apply_block(flow, blocking);
        } else if let Some(done) = apply_map_local(flow, &matched) {
            if !done {
                apply_map_remote(flow, &matched);
            }
        } else {
            apply_map_remote(flow, &matched);
        }

        // Steps 3 & 4: header/body rewrites only run if no terminal action
        // fired this phase (SPEC_FULL §4.3 "Terminal flag").
        if !flow.meta.terminated {
            apply_header_rewrites(flow, &matched, Phase::Request);
            apply_body_rewrites(flow, &matched, BodyTarget::Request);
        }

        flow.meta.touch();
        RequestOutcome { matched }
    }

    /// Apply response-phase actions against the same matched-rule list.
    pub async fn process_response(&self, flow: &mut Flow, matched: &[MatchedRule]) {
        if flow.meta.aborted {
            return;
        }
        // Step 1: bandwidth throttle.
        let content_len = flow
            .response
            .as_ref()
            .map(|r| r.body.len() as u64)
            .unwrap_or(0);
        for m in matched {
            for action in &m.rule.actions {
                if let Action::Throttle(t) = action {
                    let secs = t.bandwidth_delay_secs(content_len);
                    if secs > 0.0 {
                        tokio::time::sleep(Duration::from_secs_f64(secs)).await;
                    }
                }
            }
        }

        // Step 2: response header ops.
        apply_header_rewrites(flow, matched, Phase::Response);

        // Step 3: response body rewrites.
        apply_body_rewrites(flow, matched, BodyTarget::Response);

        flow.meta.touch();
    }
}

impl Default for RuleEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Returns `true` (and kills the flow) if `packet_loss` (a percentage in
/// `[0, 100]`) fires (SPEC_FULL §4.3.1).
fn apply_packet_loss(flow: &mut Flow, packet_loss: Option<f64>) -> bool {
    match packet_loss {
        Some(p) if p > 0.0 => {
            let roll: f64 = rand::thread_rng().gen_range(0.0..100.0);
            if roll < p {
                flow.kill();
                true
            } else {
                false
            }
        }
        _ => false,
    }
}

fn find_block_request(matched: &[MatchedRule]) -> Option<&MatchedRule> {
    matched
        .iter()
        .find(|m| m.rule.actions.iter().any(|a| matches!(a, Action::BlockRequest)))
}

fn apply_block(flow: &mut Flow, blocking: &MatchedRule) {
    flow.response = Some(FlowResponse {
        status: 403,
        headers: crate::flow::Headers::new(),
        body: b"Blocked by Rule".to_vec(),
        started_at: chrono::Utc::now(),
        finished_at: Some(chrono::Utc::now()),
    });
    flow.meta.terminated = true;
    flow.meta.record_hit(Hit::success(
        blocking.rule.id.clone(),
        blocking.rule.name.clone(),
        HitType::Rule,
    ));
}

/// Applies the first matching `map_local` action found across `matched`.
/// Returns `Some(true)` if it produced a response (terminating the phase),
/// `Some(false)` if it was a file-miss (cascade continues to map_remote),
/// `None` if no rule carried a `map_local` action at all.
fn apply_map_local(flow: &mut Flow, matched: &[MatchedRule]) -> Option<bool> {
    for m in matched {
        for action in &m.rule.actions {
            if let Action::MapLocal(local) = action {
                let resolved_path = local
                    .local_path
                    .as_deref()
                    .map(|p| crate::rules::action::expand_captures(p, &m.captures));

                match local.source {
                    MapLocalSource::Manual => {
                        let content = local.content.clone().unwrap_or_default();
                        let content_type = local
                            .content_type
                            .clone()
                            .unwrap_or_else(|| "text/plain".to_string());
                        set_synthesized_response(
                            flow,
                            local.status_code.unwrap_or(200),
                            content_type,
                            content.into_bytes(),
                            local.headers.as_deref(),
                        );
                        flow.meta.record_hit(Hit::success(
                            m.rule.id.clone(),
                            m.rule.name.clone(),
                            HitType::Rule,
                        ));
                        return Some(true);
                    }
                    MapLocalSource::File => {
                        let path = resolved_path.unwrap_or_default();
                        if path.is_empty() {
                            // Empty-path semantics are distinct from file-missing
                            // (SPEC_FULL §9.1 decision #2).
                            set_synthesized_response(
                                flow,
                                local.status_code.unwrap_or(200),
                                local
                                    .content_type
                                    .clone()
                                    .unwrap_or_else(|| "text/plain".to_string()),
                                Vec::new(),
                                local.headers.as_deref(),
                            );
                            flow.meta.record_hit(Hit::success(
                                m.rule.id.clone(),
                                m.rule.name.clone(),
                                HitType::Rule,
                            ));
                            return Some(true);
                        }
                        match std::fs::read(&path) {
                            Ok(bytes) => {
                                let content_type = local.content_type.clone().unwrap_or_else(|| {
                                    mime_for_path(&path).to_string()
                                });
                                set_synthesized_response(
                                    flow,
                                    local.status_code.unwrap_or(200),
                                    content_type,
                                    bytes,
                                    local.headers.as_deref(),
                                );
                                flow.meta.record_hit(Hit::success(
                                    m.rule.id.clone(),
                                    m.rule.name.clone(),
                                    HitType::Rule,
                                ));
                                return Some(true);
                            }
                            Err(_) => {
                                flow.meta.record_hit(
                                    Hit::success(m.rule.id.clone(), m.rule.name.clone(), HitType::Rule)
                                        .with_status("file_not_found"),
                                );
                                return Some(false);
                            }
                        }
                    }
                }
            }
        }
    }
    None
}

fn set_synthesized_response(
    flow: &mut Flow,
    status: u16,
    content_type: String,
    body: Vec<u8>,
    header_ops: Option<&[crate::rules::action::HeaderOp]>,
) {
    let mut headers = crate::flow::Headers::new();
    headers.set("Content-Type", &content_type);
    if let Some(ops) = header_ops {
        apply_header_ops(&mut headers, ops);
    }
    let now = chrono::Utc::now();
    flow.response = Some(FlowResponse {
        status,
        headers,
        body,
        started_at: now,
        finished_at: Some(now),
    });
    flow.meta.terminated = true;
}

/// A parsed absolute URL, stripped to the fields the engine needs.
struct ParsedUrl {
    scheme: String,
    host: String,
    port: Option<u16>,
    path_and_query: String,
}

fn parse_url(url: &str) -> Option<ParsedUrl> {
    let (scheme, rest) = url.split_once("://")?;
    let (authority, path_and_query) = match rest.find('/') {
        Some(idx) => (&rest[..idx], rest[idx..].to_string()),
        None => (rest, "/".to_string()),
    };
    let (host, port) = match authority.rsplit_once(':') {
        Some((h, p)) => (h.to_string(), p.parse::<u16>().ok()),
        None => (authority.to_string(), None),
    };
    Some(ParsedUrl {
        scheme: scheme.to_string(),
        host,
        port,
        path_and_query,
    })
}

fn default_port_for_scheme(scheme: &str) -> u16 {
    if scheme.eq_ignore_ascii_case("https") {
        443
    } else {
        80
    }
}

fn apply_map_remote(flow: &mut Flow, matched: &[MatchedRule]) {
    for m in matched {
        for action in &m.rule.actions {
            if let Action::MapRemote(remote) = action {
                if remote.is_regex_substitution() {
                    let new_url =
                        crate::rules::action::expand_captures(&remote.target_url, &m.captures);
                    if let Some(parsed) = parse_url(&new_url) {
                        apply_parsed_url(flow, &parsed, &new_url);
                    }
                } else if let Some(parsed) = parse_url(&remote.target_url) {
                    // "preservePath" means append the original request's own
                    // path/query onto the target's, literal-concatenated
                    // rather than joined with a corrective `/` (SPEC_FULL
                    // §4.3.1 map_remote — this quirk must not be "corrected").
                    // A bare host-swap target (path is empty or just `/`)
                    // contributes no prefix at all, so the original path
                    // isn't doubled up behind a stray slash.
                    let new_path = if remote.preserve_path {
                        let target_path = parsed.path_and_query.split('?').next().unwrap_or("");
                        let prefix = target_path.trim_end_matches('/');
                        match flow.request.query() {
                            Some(q) => format!("{}{}?{}", prefix, flow.request.path, q),
                            None => format!("{}{}", prefix, flow.request.path),
                        }
                    } else {
                        parsed.path_and_query.clone()
                    };
                    let port = parsed.port.unwrap_or_else(|| default_port_for_scheme(&parsed.scheme));
                    let new_url = format!("{}://{}:{}{}", parsed.scheme, parsed.host, port, new_path);
                    flow.request.url = new_url;
                    flow.request.host = parsed.host.clone();
                    flow.request.path = new_path.split('?').next().unwrap_or("").to_string();
                    flow.request.port = port;
                }

                if let Some(headers) = &remote.headers {
                    apply_header_ops(&mut flow.request.headers, headers);
                }
                if let Some(headers) = &remote.request_headers {
                    apply_header_ops(&mut flow.request.headers, headers);
                }

                flow.meta.terminated = true;
                flow.meta.record_hit(Hit::success(
                    m.rule.id.clone(),
                    m.rule.name.clone(),
                    HitType::Rule,
                ));
                return;
            }
        }
    }
}

fn apply_parsed_url(flow: &mut Flow, parsed: &ParsedUrl, full_url: &str) {
    flow.request.url = full_url.to_string();
    flow.request.host = parsed.host.clone();
    flow.request.path = parsed
        .path_and_query
        .split('?')
        .next()
        .unwrap_or("")
        .to_string();
    flow.request.port = parsed
        .port
        .unwrap_or_else(|| default_port_for_scheme(&parsed.scheme));
}

fn apply_header_ops(headers: &mut crate::flow::Headers, ops: &[crate::rules::action::HeaderOp]) {
    for op in ops {
        match op.operation {
            HeaderOpKind::Add => {
                if let Some(v) = &op.value {
                    headers.add(&op.key, v);
                }
            }
            HeaderOpKind::Set => {
                if let Some(v) = &op.value {
                    headers.set(&op.key, v);
                }
            }
            HeaderOpKind::Remove => headers.remove(&op.key),
        }
    }
}

fn apply_header_rewrites(flow: &mut Flow, matched: &[MatchedRule], phase: Phase) {
    for m in matched {
        for action in &m.rule.actions {
            if let Action::RewriteHeader(rh) = action {
                let ops = match phase {
                    Phase::Request => rh.headers.request.as_deref(),
                    Phase::Response => rh.headers.response.as_deref(),
                };
                if let Some(ops) = ops {
                    match phase {
                        Phase::Request => apply_header_ops(&mut flow.request.headers, ops),
                        Phase::Response => {
                            if let Some(resp) = flow.response.as_mut() {
                                apply_header_ops(&mut resp.headers, ops);
                            }
                        }
                    }
                    flow.meta.record_hit(Hit::success(
                        m.rule.id.clone(),
                        m.rule.name.clone(),
                        HitType::Rule,
                    ));
                }
            }
        }
    }
}

fn apply_body_rewrites(flow: &mut Flow, matched: &[MatchedRule], target: BodyTarget) {
    for m in matched {
        for action in &m.rule.actions {
            if let Action::RewriteBody(rb) = action {
                if rb.target != target {
                    continue;
                }
                if apply_one_body_rewrite(flow, rb, target) {
                    flow.meta.record_hit(Hit::success(
                        m.rule.id.clone(),
                        m.rule.name.clone(),
                        HitType::Rule,
                    ));
                }
            }
        }
    }
}

fn apply_one_body_rewrite(flow: &mut Flow, rb: &RewriteBodyAction, target: BodyTarget) -> bool {
    if let Some(set) = &rb.set {
        let body = set.content.clone().into_bytes();
        match target {
            BodyTarget::Request => flow.request.body = body,
            BodyTarget::Response => {
                if let Some(resp) = flow.response.as_mut() {
                    resp.body = body;
                    if let Some(status) = set.status_code {
                        resp.status = status;
                    }
                    if let Some(ct) = &set.content_type {
                        resp.headers.set("Content-Type", ct);
                    }
                } else {
                    flow.response = Some(FlowResponse {
                        status: set.status_code.unwrap_or(200),
                        headers: {
                            let mut h = crate::flow::Headers::new();
                            if let Some(ct) = &set.content_type {
                                h.set("Content-Type", ct);
                            }
                            h
                        },
                        body: set.content.clone().into_bytes(),
                        started_at: chrono::Utc::now(),
                        finished_at: Some(chrono::Utc::now()),
                    });
                }
            }
        }
        return true;
    }

    if let Some(replace) = &rb.replace {
        return with_body_mut(flow, target, |body| {
            if let Ok(text) = String::from_utf8(body.clone()) {
                *body = text.replace(&replace.pattern, &replace.replacement).into_bytes();
                true
            } else {
                false
            }
        });
    }

    if let Some(regex_replace) = &rb.regex_replace {
        return with_body_mut(flow, target, |body| {
            let text = match String::from_utf8(body.clone()) {
                Ok(t) => t,
                Err(_) => return false,
            };
            match Regex::new(&regex_replace.pattern) {
                Ok(re) => {
                    *body = re
                        .replace_all(&text, regex_replace.replacement.as_str())
                        .into_owned()
                        .into_bytes();
                    true
                }
                Err(e) => {
                    tracing::warn!(pattern = %regex_replace.pattern, error = %e, "invalid regex_replace pattern");
                    false
                }
            }
        });
    }

    if let Some(json) = &rb.json {
        return with_body_mut(flow, target, |body| {
            let mut value: serde_json::Value = match serde_json::from_slice(body) {
                Ok(v) => v,
                Err(_) => return false,
            };
            let mut changed = false;
            for modification in json.ordered_modifications() {
                if !modification.enabled {
                    continue;
                }
                changed |= apply_json_modification(&mut value, modification);
            }
            if changed {
                if let Ok(bytes) = serde_json::to_vec(&value) {
                    *body = bytes;
                }
            }
            changed
        });
    }

    false
}

fn with_body_mut(flow: &mut Flow, target: BodyTarget, f: impl FnOnce(&mut Vec<u8>) -> bool) -> bool {
    match target {
        BodyTarget::Request => f(&mut flow.request.body),
        BodyTarget::Response => match flow.response.as_mut() {
            Some(resp) => f(&mut resp.body),
            None => false,
        },
    }
}

/// Accept the engine's historical dot/bracket shorthand (`"a.b"`,
/// `"items[0]"`) alongside a full RFC 9535 expression, by prefixing a bare
/// relative path with the `$` root selector `serde_json_path` requires.
fn normalize_json_path(path: &str) -> String {
    let trimmed = path.trim();
    if trimmed.is_empty() || trimmed == "$" {
        "$".to_string()
    } else if trimmed.starts_with('$') {
        trimmed.to_string()
    } else if trimmed.starts_with('[') {
        format!("${trimmed}")
    } else {
        format!("$.{trimmed}")
    }
}

fn apply_json_modification(
    root: &mut serde_json::Value,
    modification: &crate::rules::action::JsonModification,
) -> bool {
    let normalized = normalize_json_path(&modification.path);
    let path = match JsonPath::parse(&normalized) {
        Ok(p) => p,
        Err(e) => {
            tracing::warn!(path = %modification.path, error = %e, "invalid JSONPath expression");
            return false;
        }
    };

    let pointers: Vec<String> = path
        .query_located(root)
        .into_iter()
        .map(|node| node.location().to_json_pointer())
        .collect();

    if pointers.is_empty() {
        tracing::debug!(path = %modification.path, "JSONPath matched no fields in the body");
        return false;
    }

    match modification.operation {
        JsonOpKind::Set => {
            let Some(value) = &modification.value else { return false };
            let mut changed = false;
            for pointer in &pointers {
                if let Some(slot) = root.pointer_mut(pointer) {
                    *slot = value.clone();
                    changed = true;
                }
            }
            changed
        }
        JsonOpKind::Append => {
            let Some(value) = &modification.value else { return false };
            let mut changed = false;
            for pointer in &pointers {
                if let Some(serde_json::Value::Array(arr)) = root.pointer_mut(pointer) {
                    arr.push(value.clone());
                    changed = true;
                } else {
                    tracing::warn!(path = %modification.path, "cannot append to a non-array match");
                }
            }
            changed
        }
        JsonOpKind::Delete => delete_matched(root, &pointers),
    }
}

/// Group matched locations by parent so an array's indices are removed
/// highest-first, avoiding the index-shift-after-delete hazard when several
/// matches share the same parent array.
fn delete_matched(root: &mut serde_json::Value, pointers: &[String]) -> bool {
    use std::collections::BTreeMap;

    let mut by_parent: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for pointer in pointers {
        // The root itself (`""`) has no parent to delete it from.
        let Some(split) = pointer.rfind('/') else { continue };
        let (parent, child) = (&pointer[..split], &pointer[split + 1..]);
        by_parent.entry(parent.to_string()).or_default().push(child.to_string());
    }

    let mut changed = false;
    for (parent_pointer, children) in by_parent {
        let parent = if parent_pointer.is_empty() {
            Some(&mut *root)
        } else {
            root.pointer_mut(&parent_pointer)
        };
        let Some(parent) = parent else { continue };

        match parent {
            serde_json::Value::Array(arr) => {
                let mut indices: Vec<usize> = children.iter().filter_map(|c| c.parse().ok()).collect();
                indices.sort_unstable_by(|a, b| b.cmp(a));
                indices.dedup();
                for idx in indices {
                    if idx < arr.len() {
                        arr.remove(idx);
                        changed = true;
                    }
                }
            }
            serde_json::Value::Object(map) => {
                for child in &children {
                    if map.remove(unescape_pointer_segment(child).as_str()).is_some() {
                        changed = true;
                    }
                }
            }
            _ => {}
        }
    }
    changed
}

fn unescape_pointer_segment(segment: &str) -> std::borrow::Cow<'_, str> {
    if segment.contains('~') {
        segment.replace("~1", "/").replace("~0", "~").into()
    } else {
        segment.into()
    }
}
