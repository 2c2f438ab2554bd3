//! The flow data model (SPEC_FULL §3).
//!
//! A `Flow` is the transient, in-memory record of one HTTP/WebSocket exchange,
//! owned by the proxy runtime substrate for the life of one request. Every
//! other subsystem — the rule engine, the debug manager, the traffic
//! monitor, the flow database — operates on a `Flow` or a serialized
//! projection of one.

use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::rules::hit::{Hit, HitLog};

/// An ordered, duplicate-tolerant header list. Rule actions mutate headers
/// with explicit add/set/remove operations (SPEC_FULL §6), which a `HashMap`
/// cannot express faithfully (HTTP allows repeated header names); a flat
/// `Vec` preserves both order and repetition.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Headers(pub Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.iter().any(|(k, _)| k.eq_ignore_ascii_case(name))
    }

    /// `add`: append, keeping any existing values for the same name.
    pub fn add(&mut self, name: &str, value: &str) {
        self.0.push((name.to_string(), value.to_string()));
    }

    /// `set`: replace all existing values for `name` with a single value.
    pub fn set(&mut self, name: &str, value: &str) {
        self.remove(name);
        self.0.push((name.to_string(), value.to_string()));
    }

    /// `remove`: drop every entry matching `name`.
    pub fn remove(&mut self, name: &str) {
        self.0.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Request,
    Response,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowRequest {
    pub method: String,
    /// Full request URL, including scheme/host/path/query.
    pub url: String,
    pub host: String,
    pub path: String,
    pub port: u16,
    pub headers: Headers,
    pub body: Vec<u8>,
    pub started_at: DateTime<Utc>,
}

impl FlowRequest {
    pub fn query(&self) -> Option<&str> {
        self.url.splitn(2, '?').nth(1)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: Vec<u8>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WsDirection {
    ToServer,
    ToClient,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WsFrameType {
    Text,
    Binary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsFrame {
    pub direction: WsDirection,
    pub frame_type: WsFrameType,
    pub content: Vec<u8>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    Connection,
    TlsError,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowError {
    pub error_type: ErrorType,
    pub message: String,
}

/// Core-owned metadata attached to a flow, as distinct from the wire data in
/// `request`/`response`. Everything here is mutated by the rule engine,
/// debug manager, or traffic monitor — never by the proxy runtime itself.
#[derive(Debug, Clone, Default)]
pub struct FlowMeta {
    pub matched_rules: Vec<String>,
    pub hits: HitLog,
    /// Set by the rule engine or a user script whenever a hit is recorded;
    /// the capture anchor clears it after re-emitting the flow (SPEC_FULL §9).
    pub dirty: bool,
    pub aborted: bool,
    /// Set once a terminal action (block/map_local/map_remote) has produced
    /// a response; short-circuits remaining request-phase action kinds.
    pub terminated: bool,
    pub paused_phase: Option<Phase>,
    /// Monotonic timestamp, refreshed on every material mutation so pollers
    /// can order/filter by `msg_ts` without wall-clock ambiguity.
    pub msg_ts: f64,
}

impl FlowMeta {
    pub fn touch(&mut self) {
        self.msg_ts = clock::now_secs();
    }

    /// Record a hit via the dedup/asymmetric-update rule (SPEC_FULL §9.1 #1).
    pub fn record_hit(&mut self, hit: Hit) {
        if self.hits.record(hit) {
            self.dirty = true;
        }
    }
}

#[derive(Debug, Clone)]
pub struct Flow {
    pub id: String,
    pub request: FlowRequest,
    pub response: Option<FlowResponse>,
    pub websocket: Option<Vec<WsFrame>>,
    pub error: Option<FlowError>,
    pub client_addr: Option<SocketAddr>,
    pub server_addr: Option<SocketAddr>,
    pub meta: FlowMeta,
}

impl Flow {
    pub fn new(id: String, request: FlowRequest, client_addr: Option<SocketAddr>) -> Self {
        Self {
            id,
            request,
            response: None,
            websocket: None,
            error: None,
            client_addr,
            server_addr: None,
            meta: FlowMeta::default(),
        }
    }

    /// Abort a flow in flight: packet-loss throttle and breakpoint-abort both
    /// funnel through here (SPEC_FULL §5 "Cancellation").
    pub fn kill(&mut self) {
        self.meta.aborted = true;
        self.meta.terminated = true;
    }

    pub fn is_websocket(&self) -> bool {
        self.websocket.is_some()
    }

    /// The status code a serialized record should report: `0` if aborted,
    /// `101` for a live (non-aborted) WebSocket upgrade, else the response's
    /// own status (SPEC_FULL §4.5).
    pub fn effective_status(&self) -> u16 {
        if self.meta.aborted {
            return 0;
        }
        if self.is_websocket() {
            return 101;
        }
        self.response.as_ref().map(|r| r.status).unwrap_or(0)
    }
}

/// Monotonic clock used for `msg_ts` stamping. A thin wrapper so tests can
/// construct a deterministic clock instead of reading the real one.
pub mod clock {
    use super::*;

    pub fn now_secs() -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request() -> FlowRequest {
        FlowRequest {
            method: "GET".into(),
            url: "https://example.com/x".into(),
            host: "example.com".into(),
            path: "/x".into(),
            port: 443,
            headers: Headers::new(),
            body: Vec::new(),
            started_at: Utc::now(),
        }
    }

    #[test]
    fn headers_set_replaces_all_values() {
        let mut h = Headers::new();
        h.add("X-Test", "1");
        h.add("X-Test", "2");
        h.set("X-Test", "3");
        assert_eq!(h.get("X-Test"), Some("3"));
        assert_eq!(h.0.iter().filter(|(k, _)| k == "X-Test").count(), 1);
    }

    #[test]
    fn headers_lookup_is_case_insensitive() {
        let mut h = Headers::new();
        h.add("Content-Type", "text/plain");
        assert_eq!(h.get("content-type"), Some("text/plain"));
    }

    #[test]
    fn kill_sets_aborted_and_terminated() {
        let mut flow = Flow::new("f1".into(), sample_request(), None);
        flow.kill();
        assert!(flow.meta.aborted);
        assert!(flow.meta.terminated);
        assert_eq!(flow.effective_status(), 0);
    }

    #[test]
    fn websocket_status_is_101_unless_aborted() {
        let mut flow = Flow::new("f1".into(), sample_request(), None);
        flow.websocket = Some(Vec::new());
        assert_eq!(flow.effective_status(), 101);
        flow.kill();
        assert_eq!(flow.effective_status(), 0);
    }
}
