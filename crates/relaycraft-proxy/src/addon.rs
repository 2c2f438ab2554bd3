//! Core Addon: the top-level hook dispatcher gluing the rule engine, debug
//! manager, traffic monitor, and flow database into the entry points the
//! proxy runtime substrate calls on every flow transition (SPEC_FULL §4.7).
//!
//! Every other subsystem is pure with respect to the network; this module is
//! the one place that knows what a "hook" is and in what order they fire.

use std::net::IpAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::db::{FlowDb, FlowRecord};
use crate::debug::DebugManager;
use crate::engine::{MatchedRule, RuleEngine};
use crate::flow::{ErrorType, Flow, Phase};
use crate::monitor::TrafficMonitor;
use crate::rules::loader::RuleLoader;

const INTERNAL_HOST: &str = "relay.guide";
const INTERNAL_PATHS: [&str; 3] = ["/cert", "/cert.pem", "/cert.crt"];
const LOOPBACK_LITERALS: [&str; 2] = ["127.0.0.1", "localhost"];

/// Glues the rule loader/engine, debug manager, traffic monitor, and flow
/// database together. One instance is shared (via `Arc`) across every
/// accepted connection.
pub struct CoreAddon {
    loader: RuleLoader,
    engine: RuleEngine,
    debug: Arc<DebugManager>,
    db: Arc<FlowDb>,
    monitor: Arc<TrafficMonitor>,
    session_id: String,
    listen_port: u16,
    traffic_active: AtomicBool,
}

impl CoreAddon {
    pub fn new(
        loader: RuleLoader,
        debug: Arc<DebugManager>,
        db: Arc<FlowDb>,
        monitor: Arc<TrafficMonitor>,
        session_id: String,
        listen_port: u16,
    ) -> Self {
        Self {
            loader,
            engine: RuleEngine::new(),
            debug,
            db,
            monitor,
            session_id,
            listen_port,
            traffic_active: AtomicBool::new(true),
        }
    }

    pub fn monitor(&self) -> &Arc<TrafficMonitor> {
        &self.monitor
    }

    pub fn traffic_active(&self) -> bool {
        self.traffic_active.load(Ordering::Relaxed)
    }

    /// Toggled by the control channel to simulate "proxy off" (SPEC_FULL
    /// §4.7 "Global state").
    pub fn set_traffic_active(&self, active: bool) {
        self.traffic_active.store(active, Ordering::Relaxed);
    }

    /// True iff `flow` targets the control channel rather than an external
    /// upstream (SPEC_FULL §4.7 "Internal-request detection").
    pub fn is_internal(&self, flow: &Flow) -> bool {
        self.is_internal_request(&flow.request.host, &flow.request.path, flow.request.port)
    }

    /// Same check, usable before a [`Flow`] has been assembled — the proxy
    /// runtime substrate calls this on the raw request parts so it can route
    /// straight to the traffic monitor's control handler without paying for
    /// a `Flow` it would just discard.
    pub fn is_internal_request(&self, host: &str, path: &str, port: u16) -> bool {
        if host == INTERNAL_HOST {
            return true;
        }
        if path.contains("/_relay") {
            return true;
        }
        if INTERNAL_PATHS.contains(&path) {
            return true;
        }
        let is_loopback = LOOPBACK_LITERALS.contains(&host)
            || IpAddr::from_str(host).map(|ip| ip.is_loopback()).unwrap_or(false);
        is_loopback && port == self.listen_port && (path == "/" || INTERNAL_PATHS.contains(&path))
    }

    /// Request-phase hook. Internal flows and flows observed while traffic
    /// capture is paused short-circuit with an empty matched-rule list —
    /// the former because they never touch the rule engine, the latter
    /// because the flow is killed outright (SPEC_FULL §4.7 "Global state").
    pub async fn on_request(&self, flow: &mut Flow) -> Vec<MatchedRule> {
        if self.is_internal(flow) {
            return Vec::new();
        }
        if !self.traffic_active() {
            flow.kill();
            return Vec::new();
        }

        let ruleset = self.loader.reload_if_stale();
        let outcome = self.engine.process_request(flow, &ruleset).await;
        for m in &outcome.matched {
            crate::metrics::record_rule_match(&m.rule.id, "request");
        }

        // A terminal action (block / map_local success) already produced a
        // response; map_remote terminates the phase but forwards upstream to
        // its rewritten destination without one. `response.is_some()`, not
        // `meta.terminated`, is the signal that the upstream fetch should be
        // skipped (SPEC_FULL §4.7 "Request hook").
        if flow.response.is_some() {
            self.persist(flow).await;
        }

        self.await_breakpoint(flow, Phase::Request).await;

        outcome.matched
    }

    /// Response-phase hook: response actions, then a breakpoint check, then
    /// an unconditional baseline capture. If the flow was mutated again
    /// after the baseline (its dirty flag set), the capture anchor re-emits
    /// once and clears the flag (SPEC_FULL §4.7 "Response hook", §9 "Capture
    /// anchor pattern").
    pub async fn on_response(&self, flow: &mut Flow, matched: &[MatchedRule]) {
        if self.is_internal(flow) {
            return;
        }

        self.engine.process_response(flow, matched).await;
        for m in matched {
            crate::metrics::record_rule_match(&m.rule.id, "response");
        }

        self.await_breakpoint(flow, Phase::Response).await;

        self.monitor.record(flow, None);
        self.persist(flow).await;

        if flow.meta.dirty {
            flow.meta.dirty = false;
            self.monitor.record(flow, None);
            self.persist(flow).await;
        }

        crate::metrics::record_request(&flow.request.method, flow.effective_status());
    }

    /// Error / TLS-failure hook: attaches error metadata and appends a
    /// record so the UI can surface the failure. `suppress_noisy` lets the
    /// proxy runtime substrate silence routine client disconnects during a
    /// `CONNECT` tunnel's TLS handshake instead of flooding the ring with
    /// them (SPEC_FULL §4.7 "Error & TLS-failure hooks").
    pub async fn on_error(&self, flow: &mut Flow, error_type: ErrorType, message: String, suppress_noisy: bool) {
        flow.meta.aborted = true;
        flow.error = Some(crate::flow::FlowError { error_type, message });
        flow.meta.touch();

        if suppress_noisy || self.is_internal(flow) {
            tracing::debug!(flow_id = %flow.id, "suppressing noisy error flow");
            return;
        }

        self.monitor.record(flow, None);
        self.persist(flow).await;
    }

    /// WebSocket frame hook: refresh `msg_ts` and re-append so pollers pick
    /// up the frame delta (SPEC_FULL §4.7 "WebSocket message hook").
    pub fn on_websocket_message(&self, flow: &mut Flow) {
        if self.is_internal(flow) {
            return;
        }
        flow.meta.touch();
        self.monitor.record(flow, None);
    }

    async fn await_breakpoint(&self, flow: &mut Flow, phase: Phase) {
        let Some(rule) = self.debug.should_intercept(flow, phase) else {
            return;
        };
        crate::metrics::BREAKPOINTS_PAUSED.inc();
        let monitor = Arc::clone(&self.monitor);
        self.debug
            .wait_for_resume(flow, phase, &rule, |f| monitor.record(f, Some(phase)))
            .await;
        crate::metrics::BREAKPOINTS_PAUSED.dec();
    }

    async fn persist(&self, flow: &Flow) {
        let record = self.to_flow_record(flow);
        let db = Arc::clone(&self.db);
        let start = std::time::Instant::now();
        match tokio::task::spawn_blocking(move || db.store_flow(&record, false)).await {
            Ok(Ok(())) => {
                crate::metrics::record_db_write("store_flow", start.elapsed().as_secs_f64() * 1000.0);
            }
            Ok(Err(err)) => {
                tracing::error!(flow_id = %flow.id, error = %err, "failed to persist flow");
            }
            Err(join_err) => {
                tracing::error!(error = %join_err, "persist task panicked");
            }
        }
    }

    fn to_flow_record(&self, flow: &Flow) -> FlowRecord {
        let detail = crate::monitor::serialize_flow(flow, flow.meta.paused_phase);
        let hits = serde_json::to_value(flow.meta.hits.as_slice()).unwrap_or(serde_json::Value::Null);
        FlowRecord {
            id: flow.id.clone(),
            session_id: self.session_id.clone(),
            msg_ts: flow.meta.msg_ts,
            host: flow.request.host.clone(),
            method: flow.request.method.clone(),
            status: flow.effective_status() as i64,
            hits,
            detail,
            request_body: flow.request.body.clone(),
            response_body: flow.response.as_ref().map(|r| r.body.clone()),
        }
    }
}
