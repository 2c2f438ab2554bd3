//! Match atoms — the predicate primitives a rule's `match.request` list is
//! built from (SPEC_FULL §3, §4.1, §4.2).

use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AtomType {
    Url,
    Host,
    Method,
    Header,
    Query,
    Port,
    Ip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    Exact,
    Contains,
    Regex,
    Wildcard,
    Exists,
    NotExists,
}

/// `value` may be a single scalar or (for `method`) a list for
/// set-membership matching (SPEC_FULL §4.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AtomValue {
    Single(String),
    Multi(Vec<String>),
}

impl AtomValue {
    pub fn as_single(&self) -> Option<&str> {
        match self {
            AtomValue::Single(s) => Some(s),
            AtomValue::Multi(_) => None,
        }
    }

    pub fn contains(&self, candidate: &str) -> bool {
        match self {
            AtomValue::Single(s) => s == candidate,
            AtomValue::Multi(list) => list.iter().any(|v| v == candidate),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Atom {
    #[serde(rename = "type")]
    pub atom_type: AtomType,
    pub match_type: MatchType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<AtomValue>,
    #[serde(default)]
    pub invert: bool,

    /// Populated once by `compile()` during loading; `None` either because
    /// the atom isn't `regex`/`wildcard`, or because the pattern failed to
    /// compile (SPEC_FULL §4.1 "Failure semantics" — matching then falls
    /// back to a literal comparison).
    #[serde(skip)]
    pub compiled: Option<Regex>,
}

impl Atom {
    /// Escape literal `.` then translate `*` → `.*`, `?` → `.`, anchored with
    /// `^…$` (SPEC_FULL §4.1).
    pub fn wildcard_to_regex(pattern: &str) -> String {
        let mut out = String::with_capacity(pattern.len() * 2 + 2);
        out.push('^');
        for c in pattern.chars() {
            match c {
                '.' => out.push_str("\\."),
                '*' => out.push_str(".*"),
                '?' => out.push('.'),
                other => {
                    if is_meta_character(other) {
                        out.push('\\');
                    }
                    out.push(other);
                }
            }
        }
        out.push('$');
        out
    }

    /// Compile the regex/wildcard pattern cache slot. Never fails: a bad
    /// pattern is logged by the caller (the loader) and leaves `compiled`
    /// as `None`, per the loader's failure semantics.
    pub fn compile(&mut self) {
        let source = match self.value.as_ref().and_then(AtomValue::as_single) {
            Some(s) => s,
            None => return,
        };
        let pattern = match self.match_type {
            MatchType::Regex => source.to_string(),
            MatchType::Wildcard => Self::wildcard_to_regex(source),
            _ => return,
        };
        match Regex::new(&pattern) {
            Ok(re) => self.compiled = Some(re),
            Err(e) => {
                tracing::warn!(pattern = %pattern, error = %e, "rule atom pattern failed to compile; falling back to literal match");
                self.compiled = None;
            }
        }
    }

    pub fn host_value(&self) -> Option<&str> {
        if self.atom_type == AtomType::Host {
            self.value.as_ref().and_then(AtomValue::as_single)
        } else {
            None
        }
    }
}

/// Classification used by the loader to bucket rules (SPEC_FULL §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostBucket {
    /// No host atom at all.
    Global,
    /// Exactly one non-inverted, exact-match host atom.
    ExactHost,
    /// Anything else involving a host atom (regex/wildcard/contains/invert).
    ComplexHost,
}

pub fn classify_host_bucket(atoms: &[Atom]) -> HostBucket {
    let host_atoms: Vec<&Atom> = atoms.iter().filter(|a| a.atom_type == AtomType::Host).collect();
    if host_atoms.is_empty() {
        return HostBucket::Global;
    }
    let all_exact_non_inverted = host_atoms
        .iter()
        .all(|a| a.match_type == MatchType::Exact && !a.invert);
    if all_exact_non_inverted {
        HostBucket::ExactHost
    } else {
        HostBucket::ComplexHost
    }
}

/// Only needed to decide whether a wildcard-translated character needs
/// escaping; the `regex` crate doesn't expose this, so the ASCII regex
/// metacharacters are special-cased directly.
fn is_meta_character(c: char) -> bool {
    matches!(
        c,
        '\\' | '+' | '(' | ')' | '|' | '[' | ']' | '{' | '}' | '^' | '$'
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_atom(match_type: MatchType, value: &str) -> Atom {
        Atom {
            atom_type: AtomType::Url,
            match_type,
            key: None,
            value: Some(AtomValue::Single(value.to_string())),
            invert: false,
            compiled: None,
        }
    }

    #[test]
    fn wildcard_translates_star_and_question_mark() {
        let pattern = Atom::wildcard_to_regex("*.example.com/a?c");
        assert_eq!(pattern, "^.*\\.example\\.com/a.c$");
    }

    #[test]
    fn compile_populates_regex_for_regex_match_type() {
        let mut atom = make_atom(MatchType::Regex, "^https://old\\.com/(.*)$");
        atom.compile();
        assert!(atom.compiled.is_some());
        assert!(atom.compiled.unwrap().is_match("https://old.com/x/y"));
    }

    #[test]
    fn compile_leaves_none_for_exact_match_type() {
        let mut atom = make_atom(MatchType::Exact, "literal");
        atom.compile();
        assert!(atom.compiled.is_none());
    }

    #[test]
    fn bad_regex_leaves_compiled_none_without_panicking() {
        let mut atom = make_atom(MatchType::Regex, "(unclosed");
        atom.compile();
        assert!(atom.compiled.is_none());
    }

    #[test]
    fn classify_global_when_no_host_atom() {
        let atoms = vec![make_atom(MatchType::Contains, "/admin")];
        assert_eq!(classify_host_bucket(&atoms), HostBucket::Global);
    }

    #[test]
    fn classify_exact_host_bucket() {
        let mut atom = make_atom(MatchType::Exact, "example.com");
        atom.atom_type = AtomType::Host;
        assert_eq!(classify_host_bucket(&[atom]), HostBucket::ExactHost);
    }

    #[test]
    fn classify_complex_host_for_regex_atom() {
        let mut atom = make_atom(MatchType::Regex, "ex.*\\.com");
        atom.atom_type = AtomType::Host;
        assert_eq!(classify_host_bucket(&[atom]), HostBucket::ComplexHost);
    }

    #[test]
    fn classify_complex_host_for_inverted_exact_atom() {
        let mut atom = make_atom(MatchType::Exact, "example.com");
        atom.atom_type = AtomType::Host;
        atom.invert = true;
        assert_eq!(classify_host_bucket(&[atom]), HostBucket::ComplexHost);
    }
}
