//! Hit records (SPEC_FULL §3, §4.3) and their dedup policy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::flow::Phase;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HitType {
    Rule,
    Breakpoint,
    Script,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hit {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub hit_type: HitType,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Hit {
    pub fn success(id: impl Into<String>, name: impl Into<String>, hit_type: HitType) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            hit_type,
            status: "success".to_string(),
            phase: None,
            timestamp: Utc::now(),
            message: None,
        }
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = status.into();
        self
    }

    pub fn with_phase(mut self, phase: Phase) -> Self {
        self.phase = Some(phase);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Hit storage with the literal dedup rule from SPEC_FULL §9.1 decision #1:
/// a new hit for an existing `(id, type)` key overwrites the stored entry
/// iff `new.status != "success" || existing.status == "unknown"`; otherwise
/// the existing entry is left untouched. This asymmetry is intentional —
/// once a hit is recorded as a non-success status, a later success for the
/// same key must not paper over it, but an `"unknown"` placeholder is always
/// upgradeable.
#[derive(Debug, Clone, Default)]
pub struct HitLog(Vec<Hit>);

impl HitLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `hit`, applying the dedup rule. Returns `true` if the stored
    /// set changed (an insert or an overwrite), `false` if the call was a
    /// no-op — callers use this to decide whether to set the dirty flag.
    pub fn record(&mut self, hit: Hit) -> bool {
        if let Some(existing) = self
            .0
            .iter_mut()
            .find(|h| h.id == hit.id && h.hit_type == hit.hit_type)
        {
            let should_overwrite = hit.status != "success" || existing.status == "unknown";
            if should_overwrite {
                *existing = hit;
                true
            } else {
                false
            }
        } else {
            self.0.push(hit);
            true
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Hit> {
        self.0.iter()
    }

    pub fn as_slice(&self) -> &[Hit] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_id_and_type_dedups() {
        let mut log = HitLog::new();
        log.record(Hit::success("r1", "Rule One", HitType::Rule));
        log.record(Hit::success("r1", "Rule One", HitType::Rule));
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn success_does_not_overwrite_existing_non_success() {
        let mut log = HitLog::new();
        log.record(Hit::success("r1", "x", HitType::Rule).with_status("file_not_found"));
        let changed = log.record(Hit::success("r1", "x", HitType::Rule));
        assert!(!changed);
        assert_eq!(log.as_slice()[0].status, "file_not_found");
    }

    #[test]
    fn non_success_overwrites_success() {
        let mut log = HitLog::new();
        log.record(Hit::success("r1", "x", HitType::Rule));
        let changed = log.record(Hit::success("r1", "x", HitType::Rule).with_status("file_not_found"));
        assert!(changed);
        assert_eq!(log.as_slice()[0].status, "file_not_found");
    }

    #[test]
    fn unknown_status_is_always_upgradeable() {
        let mut log = HitLog::new();
        log.record(Hit::success("r1", "x", HitType::Rule).with_status("unknown"));
        let changed = log.record(Hit::success("r1", "x", HitType::Rule));
        assert!(changed);
        assert_eq!(log.as_slice()[0].status, "success");
    }

    #[test]
    fn different_type_same_id_is_distinct() {
        let mut log = HitLog::new();
        log.record(Hit::success("x1", "a", HitType::Rule));
        log.record(Hit::success("x1", "b", HitType::Breakpoint));
        assert_eq!(log.len(), 2);
    }
}
