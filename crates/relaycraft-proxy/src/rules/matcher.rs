//! The rule matcher (SPEC_FULL §4.2): evaluates a rule's atoms against a
//! flow and extracts the capture groups later actions (`map_local`,
//! `map_remote`) expand `$N`/`\N` references against.

use crate::flow::Flow;

use super::atom::{Atom, AtomType, AtomValue, MatchType};
use super::rule::{CombineMode, Rule};

#[derive(Debug, Clone, Default)]
pub struct MatchOutcome {
    pub matched: bool,
    /// Capture groups from the first URL atom using `regex`/`wildcard` that
    /// actually matched — empty if none did.
    pub captures: Vec<String>,
}

fn resolve_atom_value<'a>(flow: &'a Flow, atom: &Atom) -> Option<&'a str> {
    match atom.atom_type {
        AtomType::Url => Some(flow.request.url.as_str()),
        AtomType::Host => Some(flow.request.host.as_str()),
        AtomType::Method => Some(flow.request.method.as_str()),
        AtomType::Port => None, // handled separately below (needs owned String)
        AtomType::Header => atom
            .key
            .as_deref()
            .and_then(|key| flow.request.headers.get(key)),
        AtomType::Query => None, // handled separately below (needs an owned, percent-decoded String)
        AtomType::Ip => None, // handled separately below
    }
}

struct AtomMatch {
    matched: bool,
    captures: Vec<String>,
}

fn match_atom(flow: &Flow, atom: &Atom) -> AtomMatch {
    // Fields needing an owned string (computed, not borrowed from the flow)
    // are resolved up front so the rest of the function can work uniformly
    // on `Option<&str>`.
    let port_string;
    let ip_string;
    let query_string;
    let resolved: Option<&str> = match atom.atom_type {
        AtomType::Port => {
            port_string = flow.request.port.to_string();
            Some(port_string.as_str())
        }
        AtomType::Ip => {
            ip_string = flow.client_addr.map(|a| a.ip().to_string());
            ip_string.as_deref()
        }
        AtomType::Query => {
            query_string = atom.key.as_deref().and_then(|key| {
                flow.request.query().and_then(|q| {
                    q.split('&')
                        .filter_map(|pair| pair.split_once('='))
                        .find(|(k, _)| urlencoding::decode(k).map(|d| d.as_ref() == key).unwrap_or(false))
                        .map(|(_, v)| urlencoding::decode(v).map(|d| d.into_owned()).unwrap_or_else(|_| v.to_string()))
                })
            });
            query_string.as_deref()
        }
        _ => resolve_atom_value(flow, atom),
    };

    let (raw_matched, captures) = match atom.match_type {
        MatchType::Exists => (resolved.is_some(), Vec::new()),
        MatchType::NotExists => (resolved.is_none(), Vec::new()),
        MatchType::Exact => {
            let matched = match (resolved, &atom.value) {
                (Some(r), Some(v)) => v.contains(r),
                _ => false,
            };
            (matched, Vec::new())
        }
        MatchType::Contains => {
            let matched = match (resolved, atom.value.as_ref().and_then(AtomValue::as_single)) {
                (Some(r), Some(v)) => r.contains(v),
                _ => false,
            };
            (matched, Vec::new())
        }
        MatchType::Regex | MatchType::Wildcard => match (resolved, &atom.compiled) {
            (Some(r), Some(re)) => {
                if let Some(caps) = re.captures(r) {
                    let groups: Vec<String> = caps
                        .iter()
                        .skip(1)
                        .map(|m| m.map(|m| m.as_str().to_string()).unwrap_or_default())
                        .collect();
                    (true, groups)
                } else {
                    (false, Vec::new())
                }
            }
            // Compile failure: fall back to a literal comparison, per
            // SPEC_FULL §4.1 "Failure semantics".
            (Some(r), None) => {
                let literal = atom.value.as_ref().and_then(AtomValue::as_single);
                (literal == Some(r), Vec::new())
            }
            _ => (false, Vec::new()),
        },
    };

    let matched = if atom.invert { !raw_matched } else { raw_matched };
    AtomMatch { matched, captures }
}

/// Evaluate every atom in `rule.match_block` against `flow`, combining per
/// `combine` (`all`/`any`), and return the outcome plus any URL capture
/// groups for downstream action expansion.
pub fn match_rule(flow: &Flow, rule: &Rule) -> MatchOutcome {
    let atoms = &rule.match_block.request;
    if atoms.is_empty() {
        return MatchOutcome {
            matched: true,
            captures: Vec::new(),
        };
    }

    let mut captures = Vec::new();
    let mut results = Vec::with_capacity(atoms.len());
    for atom in atoms {
        let result = match_atom(flow, atom);
        if result.matched
            && captures.is_empty()
            && !result.captures.is_empty()
            && atom.atom_type == AtomType::Url
        {
            captures = result.captures.clone();
        }
        results.push(result.matched);
    }

    let matched = match rule.match_block.combine {
        CombineMode::All => results.iter().all(|m| *m),
        CombineMode::Any => results.iter().any(|m| *m),
    };

    MatchOutcome { matched, captures }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{FlowRequest, Headers};
    use crate::rules::atom::AtomValue;
    use crate::rules::rule::MatchBlock;
    use chrono::Utc;

    fn flow_with_url(url: &str) -> Flow {
        let request = FlowRequest {
            method: "GET".into(),
            url: url.into(),
            host: "old.com".into(),
            path: "/x/y".into(),
            port: 443,
            headers: Headers::new(),
            body: Vec::new(),
            started_at: Utc::now(),
        };
        Flow::new("f1".into(), request, None)
    }

    fn regex_url_atom(pattern: &str) -> Atom {
        let mut atom = Atom {
            atom_type: AtomType::Url,
            match_type: MatchType::Regex,
            key: None,
            value: Some(AtomValue::Single(pattern.to_string())),
            invert: false,
            compiled: None,
        };
        atom.compile();
        atom
    }

    #[test]
    fn regex_match_extracts_capture_groups() {
        let flow = flow_with_url("https://old.com/x/y");
        let atom = regex_url_atom(r"^https://old\.com/(.*)$");
        let rule = Rule {
            id: "r1".into(),
            name: "n".into(),
            enabled: true,
            priority: 0,
            stop_on_match: false,
            match_block: MatchBlock {
                combine: CombineMode::All,
                request: vec![atom],
            },
            actions: Vec::new(),
            source_path: None,
        };
        let outcome = match_rule(&flow, &rule);
        assert!(outcome.matched);
        assert_eq!(outcome.captures, vec!["x/y".to_string()]);
    }

    #[test]
    fn contains_match_on_url() {
        let flow = flow_with_url("https://site/admin/x");
        let atom = Atom {
            atom_type: AtomType::Url,
            match_type: MatchType::Contains,
            key: None,
            value: Some(AtomValue::Single("/admin".to_string())),
            invert: false,
            compiled: None,
        };
        let rule = Rule {
            id: "r1".into(),
            name: "n".into(),
            enabled: true,
            priority: 0,
            stop_on_match: false,
            match_block: MatchBlock {
                combine: CombineMode::All,
                request: vec![atom],
            },
            actions: Vec::new(),
            source_path: None,
        };
        assert!(match_rule(&flow, &rule).matched);
    }

    #[test]
    fn invert_flips_outcome() {
        let flow = flow_with_url("https://site/ok");
        let atom = Atom {
            atom_type: AtomType::Url,
            match_type: MatchType::Contains,
            key: None,
            value: Some(AtomValue::Single("/admin".to_string())),
            invert: true,
            compiled: None,
        };
        let rule = Rule {
            id: "r1".into(),
            name: "n".into(),
            enabled: true,
            priority: 0,
            stop_on_match: false,
            match_block: MatchBlock {
                combine: CombineMode::All,
                request: vec![atom],
            },
            actions: Vec::new(),
            source_path: None,
        };
        assert!(match_rule(&flow, &rule).matched);
    }

    #[test]
    fn any_combine_passes_if_one_atom_matches() {
        let flow = flow_with_url("https://site/ok");
        let missing = Atom {
            atom_type: AtomType::Url,
            match_type: MatchType::Contains,
            key: None,
            value: Some(AtomValue::Single("/nope".to_string())),
            invert: false,
            compiled: None,
        };
        let present = Atom {
            atom_type: AtomType::Url,
            match_type: MatchType::Contains,
            key: None,
            value: Some(AtomValue::Single("/ok".to_string())),
            invert: false,
            compiled: None,
        };
        let rule = Rule {
            id: "r1".into(),
            name: "n".into(),
            enabled: true,
            priority: 0,
            stop_on_match: false,
            match_block: MatchBlock {
                combine: CombineMode::Any,
                request: vec![missing, present],
            },
            actions: Vec::new(),
            source_path: None,
        };
        assert!(match_rule(&flow, &rule).matched);
    }

    #[test]
    fn empty_match_block_matches_unconditionally() {
        let flow = flow_with_url("https://site/anything");
        let rule = Rule {
            id: "r1".into(),
            name: "n".into(),
            enabled: true,
            priority: 0,
            stop_on_match: false,
            match_block: MatchBlock::default(),
            actions: Vec::new(),
            source_path: None,
        };
        assert!(match_rule(&flow, &rule).matched);
    }
}
