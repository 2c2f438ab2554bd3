//! The debug/breakpoint manager (SPEC_FULL §4.4): suspends a flow mid-transit
//! until an operator resumes it, optionally with edits, via the control
//! channel (`monitor.rs`).
//!
//! The suspension handoff is a one-shot, single-producer/single-consumer
//! signal: the task holding the flow registers itself and awaits a
//! `tokio::sync::oneshot::Receiver`, while `resume_flow` — called from the
//! control channel, not necessarily on the same task — fires the paired
//! `Sender`. `parking_lot::Mutex` guards the registration map and breakpoint
//! list; both critical sections are short and never held across an `.await`.

use std::collections::HashMap;

use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::oneshot;

use crate::flow::{Flow, Phase};
use crate::rules::hit::{Hit, HitType};

#[derive(Debug, Error)]
pub enum DebugError {
    #[error("no breakpoint registration for flow")]
    UnknownFlow,
    #[error("resume channel closed (flow no longer waiting)")]
    ChannelClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakpointMatchType {
    Contains,
    Exact,
    Regex,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakpointRule {
    pub id: String,
    pub pattern: String,
    #[serde(rename = "matchType")]
    pub match_type: BreakpointMatchType,
    #[serde(rename = "breakOnRequest", default)]
    pub break_on_request: bool,
    #[serde(rename = "breakOnResponse", default)]
    pub break_on_response: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(skip)]
    compiled: Option<Regex>,
}

fn default_true() -> bool {
    true
}

impl BreakpointRule {
    /// Precompile the regex pattern slot. Mirrors the rule atom's failure
    /// semantics: a bad pattern falls back to a literal-equality match
    /// rather than erroring (SPEC_FULL §4.1).
    pub fn compile(&mut self) {
        if self.match_type == BreakpointMatchType::Regex {
            match Regex::new(&self.pattern) {
                Ok(re) => self.compiled = Some(re),
                Err(e) => {
                    tracing::warn!(pattern = %self.pattern, error = %e, "breakpoint pattern failed to compile; falling back to literal match");
                    self.compiled = None;
                }
            }
        }
    }

    fn matches(&self, url: &str) -> bool {
        match self.match_type {
            BreakpointMatchType::Contains => url.contains(&self.pattern),
            BreakpointMatchType::Exact => url == self.pattern,
            BreakpointMatchType::Regex => match &self.compiled {
                Some(re) => re.is_match(url),
                None => url == self.pattern,
            },
        }
    }

    fn phase_flag(&self, phase: Phase) -> bool {
        match phase {
            Phase::Request => self.break_on_request,
            Phase::Response => self.break_on_response,
        }
    }
}

/// Edits an operator submits alongside a resume request (SPEC_FULL §4.4). All
/// fields are optional; only the subset relevant to the recorded pause phase
/// is applied.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResumeModifications {
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default, rename = "requestHeaders")]
    pub request_headers: Option<HashMap<String, String>>,
    #[serde(default, rename = "requestBody")]
    pub request_body: Option<String>,
    #[serde(default, rename = "responseHeaders")]
    pub response_headers: Option<HashMap<String, String>>,
    #[serde(default, rename = "responseBody")]
    pub response_body: Option<String>,
    #[serde(default, rename = "statusCode")]
    pub status_code: Option<u16>,
}

impl ResumeModifications {
    pub fn is_abort(&self) -> bool {
        self.action.as_deref() == Some("abort")
    }
}

struct Registration {
    signal: oneshot::Sender<ResumeModifications>,
}

pub struct DebugManager {
    breakpoints: Mutex<Vec<BreakpointRule>>,
    registrations: Mutex<HashMap<String, Registration>>,
}

impl DebugManager {
    pub fn new() -> Self {
        Self {
            breakpoints: Mutex::new(Vec::new()),
            registrations: Mutex::new(HashMap::new()),
        }
    }

    /// Add a breakpoint, replacing any existing rule with the same `id`
    /// (idempotent add per SPEC_FULL §4.4).
    pub fn add_breakpoint(&self, mut rule: BreakpointRule) {
        rule.compile();
        let mut breakpoints = self.breakpoints.lock();
        if let Some(existing) = breakpoints.iter_mut().find(|bp| bp.id == rule.id) {
            *existing = rule;
        } else {
            breakpoints.push(rule);
        }
    }

    /// Remove by `id`; if no rule carries that id, fall back to matching on
    /// `pattern` (the "legacy fallback key" SPEC_FULL §4.4 describes).
    /// Returns `true` if a rule was removed.
    pub fn remove_breakpoint(&self, id_or_pattern: &str) -> bool {
        let mut breakpoints = self.breakpoints.lock();
        let before = breakpoints.len();
        let had_id_match = breakpoints.iter().any(|bp| bp.id == id_or_pattern);
        if had_id_match {
            breakpoints.retain(|bp| bp.id != id_or_pattern);
        } else {
            breakpoints.retain(|bp| bp.pattern != id_or_pattern);
        }
        breakpoints.len() != before
    }

    pub fn clear_breakpoints(&self) {
        self.breakpoints.lock().clear();
    }

    pub fn list_breakpoints(&self) -> Vec<BreakpointRule> {
        self.breakpoints.lock().clone()
    }

    /// First enabled rule with the matching phase flag set whose pattern
    /// matches the flow's URL (SPEC_FULL §4.4). Callers must not invoke this
    /// for internal requests — that exclusion is the Core Addon's job.
    pub fn should_intercept(&self, flow: &Flow, phase: Phase) -> Option<BreakpointRule> {
        let breakpoints = self.breakpoints.lock();
        breakpoints
            .iter()
            .find(|bp| bp.enabled && bp.phase_flag(phase) && bp.matches(&flow.request.url))
            .cloned()
    }

    /// Suspend `flow` until an operator resumes it (SPEC_FULL §4.4
    /// "Suspension contract"). `on_pause` lets the caller push a snapshot of
    /// the paused flow into the traffic monitor before blocking.
    pub async fn wait_for_resume(
        &self,
        flow: &mut Flow,
        phase: Phase,
        rule: &BreakpointRule,
        on_pause: impl FnOnce(&Flow),
    ) {
        let (tx, rx) = oneshot::channel();
        self.registrations
            .lock()
            .insert(flow.id.clone(), Registration { signal: tx });
        let _guard = RegistrationGuard {
            manager: self,
            flow_id: flow.id.clone(),
        };

        flow.meta.record_hit(
            Hit::success(rule.id.clone(), rule.id.clone(), HitType::Breakpoint).with_phase(phase),
        );
        flow.meta.paused_phase = Some(phase);
        on_pause(flow);

        let modifications = rx.await.unwrap_or_default();
        flow.meta.paused_phase = None;
        apply_modifications(flow, phase, modifications);
    }

    /// Locate the registration for `flow_id` and fire its resume signal
    /// (SPEC_FULL §4.4 "resume_flow"). The signal is safe to fire from any
    /// thread — `resume_flow` is called from the control channel, which may
    /// not share a task with the suspended flow.
    pub fn resume_flow(
        &self,
        flow_id: &str,
        modifications: Option<ResumeModifications>,
    ) -> Result<(), DebugError> {
        let registration = self
            .registrations
            .lock()
            .remove(flow_id)
            .ok_or(DebugError::UnknownFlow)?;
        registration
            .signal
            .send(modifications.unwrap_or_default())
            .map_err(|_| DebugError::ChannelClosed)
    }
}

impl Default for DebugManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Guarantees the registration is removed even if the holding future is
/// cancelled mid-wait (SPEC_FULL §4.4 step 5: "regardless of exit path").
struct RegistrationGuard<'a> {
    manager: &'a DebugManager,
    flow_id: String,
}

impl Drop for RegistrationGuard<'_> {
    fn drop(&mut self) {
        self.manager.registrations.lock().remove(&self.flow_id);
    }
}

fn apply_modifications(flow: &mut Flow, phase: Phase, modifications: ResumeModifications) {
    if modifications.is_abort() {
        flow.kill();
        return;
    }
    match phase {
        Phase::Request => {
            if let Some(headers) = &modifications.request_headers {
                for (k, v) in headers {
                    flow.request.headers.set(k, v);
                }
            }
            if let Some(body) = modifications.request_body {
                flow.request.body = body.into_bytes();
            }
        }
        Phase::Response => {
            if let Some(resp) = flow.response.as_mut() {
                if let Some(headers) = &modifications.response_headers {
                    for (k, v) in headers {
                        resp.headers.set(k, v);
                    }
                }
                if let Some(body) = modifications.response_body {
                    resp.body = body.into_bytes();
                }
                if let Some(status) = modifications.status_code {
                    resp.status = status;
                }
            }
        }
    }
    flow.meta.touch();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{FlowRequest, FlowResponse, Headers};
    use chrono::Utc;

    fn flow_for(url: &str) -> Flow {
        let request = FlowRequest {
            method: "GET".into(),
            url: url.into(),
            host: "site".into(),
            path: "/api/x".into(),
            port: 443,
            headers: Headers::new(),
            body: Vec::new(),
            started_at: Utc::now(),
        };
        Flow::new("f1".into(), request, None)
    }

    fn request_breakpoint(pattern: &str) -> BreakpointRule {
        let mut bp = BreakpointRule {
            id: "bp1".into(),
            pattern: pattern.into(),
            match_type: BreakpointMatchType::Contains,
            break_on_request: true,
            break_on_response: false,
            enabled: true,
            compiled: None,
        };
        bp.compile();
        bp
    }

    #[test]
    fn add_is_idempotent_by_id() {
        let manager = DebugManager::new();
        manager.add_breakpoint(request_breakpoint("/api"));
        manager.add_breakpoint(request_breakpoint("/other"));
        assert_eq!(manager.list_breakpoints().len(), 1);
        assert_eq!(manager.list_breakpoints()[0].pattern, "/other");
    }

    #[test]
    fn remove_falls_back_to_pattern_when_id_unknown() {
        let manager = DebugManager::new();
        manager.add_breakpoint(request_breakpoint("/api"));
        assert!(manager.remove_breakpoint("/api"));
        assert!(manager.list_breakpoints().is_empty());
    }

    #[test]
    fn should_intercept_respects_phase_flag() {
        let manager = DebugManager::new();
        manager.add_breakpoint(request_breakpoint("/api"));
        let flow = flow_for("https://site/api/x");
        assert!(manager.should_intercept(&flow, Phase::Request).is_some());
        assert!(manager.should_intercept(&flow, Phase::Response).is_none());
    }

    #[tokio::test]
    async fn scenario_4_resume_with_edits_applies_request_side() {
        let manager = DebugManager::new();
        let rule = request_breakpoint("/api");
        let mut flow = flow_for("https://site/api/x");

        let waiter = {
            let manager = &manager;
            let rule = rule.clone();
            async move {
                manager
                    .wait_for_resume(&mut flow, Phase::Request, &rule, |_| {})
                    .await;
                flow
            }
        };

        let resumer = async {
            // Give the waiter a chance to register before resuming.
            tokio::task::yield_now().await;
            let mut headers = HashMap::new();
            headers.insert("X".to_string(), "1".to_string());
            manager
                .resume_flow(
                    "f1",
                    Some(ResumeModifications {
                        action: None,
                        request_headers: Some(headers),
                        request_body: Some("{}".to_string()),
                        response_headers: None,
                        response_body: None,
                        status_code: None,
                    }),
                )
                .unwrap();
        };

        let (flow, _) = tokio::join!(waiter, resumer);
        assert_eq!(flow.request.headers.get("X"), Some("1"));
        assert_eq!(flow.request.body, b"{}");
        let hit = flow.meta.hits.iter().find(|h| h.id == "bp1").unwrap();
        assert_eq!(hit.hit_type, HitType::Breakpoint);
    }

    #[tokio::test]
    async fn resume_with_abort_kills_flow() {
        let manager = DebugManager::new();
        let rule = request_breakpoint("/api");
        let mut flow = flow_for("https://site/api/x");

        let waiter = {
            let manager = &manager;
            let rule = rule.clone();
            async move {
                manager
                    .wait_for_resume(&mut flow, Phase::Request, &rule, |_| {})
                    .await;
                flow
            }
        };
        let resumer = async {
            tokio::task::yield_now().await;
            manager
                .resume_flow(
                    "f1",
                    Some(ResumeModifications {
                        action: Some("abort".to_string()),
                        ..Default::default()
                    }),
                )
                .unwrap();
        };

        let (flow, _) = tokio::join!(waiter, resumer);
        assert!(flow.meta.aborted);
    }

    #[test]
    fn resume_unknown_flow_returns_error() {
        let manager = DebugManager::new();
        let err = manager.resume_flow("ghost", None).unwrap_err();
        assert!(matches!(err, DebugError::UnknownFlow));
    }

    #[tokio::test]
    async fn response_phase_modifications_apply_to_response_side() {
        let manager = DebugManager::new();
        let mut rule = request_breakpoint("/api");
        rule.break_on_request = false;
        rule.break_on_response = true;
        manager.add_breakpoint(rule.clone());

        let mut flow = flow_for("https://site/api/x");
        flow.response = Some(FlowResponse {
            status: 200,
            headers: Headers::new(),
            body: b"old".to_vec(),
            started_at: Utc::now(),
            finished_at: None,
        });

        let waiter = {
            let manager = &manager;
            let rule = rule.clone();
            async move {
                manager
                    .wait_for_resume(&mut flow, Phase::Response, &rule, |_| {})
                    .await;
                flow
            }
        };
        let resumer = async {
            tokio::task::yield_now().await;
            manager
                .resume_flow(
                    "f1",
                    Some(ResumeModifications {
                        status_code: Some(201),
                        response_body: Some("new".to_string()),
                        ..Default::default()
                    }),
                )
                .unwrap();
        };

        let (flow, _) = tokio::join!(waiter, resumer);
        let resp = flow.response.unwrap();
        assert_eq!(resp.status, 201);
        assert_eq!(resp.body, b"new");
    }
}
