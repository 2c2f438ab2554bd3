//! Traffic monitor (SPEC_FULL §4.5): converts live flows into serializable
//! records, keeps a bounded in-memory ring, and services the `/_relay`
//! control endpoints plus `GET /cert`.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Method, Request, Response, StatusCode};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::db::{FlowDb, Notification};
use crate::debug::{BreakpointRule, DebugManager, ResumeModifications};
use crate::flow::{Flow, Phase, WsDirection, WsFrameType};

/// Bounded FIFO capacity of the in-memory record ring (SPEC_FULL §4.5).
const RING_CAPACITY: usize = 1000;
/// Both bodies are capped at this many characters in the serialized record.
const BODY_CHAR_CAP: usize = 100_000;

pub type BoxedBody = BoxBody<Bytes, hyper::Error>;

fn body_from(bytes: impl Into<Bytes>) -> BoxedBody {
    Full::new(bytes.into())
        .map_err(|never: std::convert::Infallible| match never {})
        .boxed()
}

fn json_response(status: StatusCode, body: Value) -> Response<BoxedBody> {
    let bytes = serde_json::to_vec(&body).unwrap_or_else(|_| b"{}".to_vec());
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("Access-Control-Allow-Origin", "*")
        .body(body_from(bytes))
        .unwrap_or_else(|_| Response::new(body_from(Bytes::new())))
}

/// Magic-byte/Content-Type sniffing used to decide `text` vs `base64`
/// encoding for a serialized body (SPEC_FULL §4.5 "Body decoding").
fn looks_binary(content_type: Option<&str>, body: &[u8]) -> bool {
    if let Some(ct) = content_type {
        let ct = ct.to_ascii_lowercase();
        if ct.starts_with("text/")
            || ct.contains("json")
            || ct.contains("xml")
            || ct.contains("javascript")
            || ct.contains("urlencoded")
        {
            return false;
        }
        if ct.starts_with("image/")
            || ct.starts_with("audio/")
            || ct.starts_with("video/")
            || ct.contains("octet-stream")
            || ct.contains("pdf")
            || ct.contains("zip")
        {
            return true;
        }
    }
    if body.is_empty() {
        return true;
    }
    body.starts_with(&[0xFF, 0xD8, 0xFF])
        || body.starts_with(b"\x89PNG\r\n\x1a\n")
        || body.starts_with(b"GIF87a")
        || body.starts_with(b"GIF89a")
}

fn cap_chars(s: &str) -> (String, bool) {
    if s.chars().count() <= BODY_CHAR_CAP {
        (s.to_string(), false)
    } else {
        (s.chars().take(BODY_CHAR_CAP).collect(), true)
    }
}

struct EncodedBody {
    content: String,
    encoding: &'static str,
    truncated: bool,
}

fn encode_body(content_type: Option<&str>, body: &[u8]) -> EncodedBody {
    if looks_binary(content_type, body) {
        let (content, truncated) = cap_chars(&BASE64.encode(body));
        return EncodedBody {
            content,
            encoding: "base64",
            truncated,
        };
    }
    match std::str::from_utf8(body) {
        Ok(text) => {
            let (content, truncated) = cap_chars(text);
            EncodedBody {
                content,
                encoding: "text",
                truncated,
            }
        }
        Err(_) => {
            let (content, truncated) = cap_chars(&BASE64.encode(body));
            EncodedBody {
                content,
                encoding: "base64",
                truncated,
            }
        }
    }
}

fn ws_scheme_rewrite(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        url.to_string()
    }
}

fn headers_to_json(headers: &crate::flow::Headers) -> Value {
    Value::Object(
        headers
            .iter()
            .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
            .collect(),
    )
}

/// Serialize a flow into the control-channel record shape (SPEC_FULL §4.5
/// "Serialization"). `intercepted_phase` is `Some` while the flow is
/// suspended at a breakpoint.
pub fn serialize_flow(flow: &Flow, intercepted_phase: Option<Phase>) -> Value {
    let is_ws = flow.is_websocket();
    let url = if is_ws {
        ws_scheme_rewrite(&flow.request.url)
    } else {
        flow.request.url.clone()
    };

    let request_content_type = flow.request.headers.get("content-type").map(str::to_string);
    let request_body = encode_body(request_content_type.as_deref(), &flow.request.body);

    let (response_headers, response_body) = match &flow.response {
        Some(resp) => {
            let ct = resp.headers.get("content-type").map(str::to_string);
            let body = encode_body(ct.as_deref(), &resp.body);
            (headers_to_json(&resp.headers), Some(body))
        }
        None => (Value::Object(Default::default()), None),
    };

    let body_truncated = request_body.truncated
        || response_body.as_ref().map(|b| b.truncated).unwrap_or(false);

    let duration_secs = flow.response.as_ref().and_then(|r| r.finished_at).map(|finished| {
        (finished - flow.request.started_at)
            .to_std()
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
    });

    let ws_frames: Vec<Value> = flow
        .websocket
        .as_ref()
        .map(|frames| {
            frames
                .iter()
                .rev()
                .take(100)
                .rev()
                .map(|f| {
                    json!({
                        "direction": match f.direction {
                            WsDirection::ToServer => "to_server",
                            WsDirection::ToClient => "to_client",
                        },
                        "type": match f.frame_type {
                            WsFrameType::Text => "text",
                            WsFrameType::Binary => "binary",
                        },
                        "content": encode_body(None, &f.content).content,
                        "timestamp": f.timestamp.timestamp_millis(),
                        "length": f.content.len(),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    let http_version = if is_ws {
        if flow.request.url.starts_with("https://") {
            "wss"
        } else {
            "ws"
        }
    } else {
        "1.1"
    };

    let hits: Vec<Value> = flow
        .meta
        .hits
        .iter()
        .map(|h| serde_json::to_value(h).unwrap_or(Value::Null))
        .collect();

    json!({
        "id": flow.id,
        "ts": flow.request.started_at.timestamp_millis(),
        "msg_ts": flow.meta.msg_ts,
        "method": flow.request.method,
        "url": url,
        "host": flow.request.host,
        "path": flow.request.path,
        "status": flow.effective_status(),
        "requestHeaders": headers_to_json(&flow.request.headers),
        "responseHeaders": response_headers,
        "requestBody": { "content": request_body.content, "encoding": request_body.encoding, "size": flow.request.body.len() },
        "responseBody": response_body.map(|b| json!({ "content": b.content, "encoding": b.encoding, "size": flow.response.as_ref().map(|r| r.body.len()).unwrap_or(0) })),
        "bodyTruncated": body_truncated,
        "duration": duration_secs,
        "hits": hits,
        "intercepted": intercepted_phase.is_some(),
        "interceptedPhase": intercepted_phase,
        "httpVersion": http_version,
        "clientIp": flow.client_addr.map(|a| a.ip().to_string()),
        "serverIp": flow.server_addr.map(|a| a.ip().to_string()),
        "error": flow.error.as_ref().map(|e| json!({ "errorType": e.error_type, "message": e.message })),
        "timing": {
            "dns": 0.0,
            "connect": 0.0,
            "ssl": 0.0,
            "ttfb": duration_secs,
            "total": duration_secs,
        },
        "wsFrames": ws_frames,
    })
}

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
enum BreakpointCommand {
    Add {
        #[serde(flatten)]
        rule: BreakpointRule,
    },
    Remove {
        #[serde(alias = "pattern")]
        id: String,
    },
    Clear,
}

#[derive(Debug, Deserialize)]
struct ResumeRequest {
    id: String,
    #[serde(default)]
    modifications: Option<ResumeModifications>,
}

/// The in-memory ring plus the `/_relay` control surface (SPEC_FULL §4.5).
pub struct TrafficMonitor {
    ring: Mutex<VecDeque<Value>>,
    debug: Arc<DebugManager>,
    db: Arc<FlowDb>,
    ca_dir: PathBuf,
}

impl TrafficMonitor {
    pub fn new(debug: Arc<DebugManager>, db: Arc<FlowDb>, ca_dir: PathBuf) -> Self {
        Self {
            ring: Mutex::new(VecDeque::with_capacity(RING_CAPACITY)),
            debug,
            db,
            ca_dir,
        }
    }

    /// Append a record for `flow`, dropping the oldest if the ring is full
    /// (SPEC_FULL §4.5 "In-memory ring").
    pub fn record(&self, flow: &Flow, intercepted_phase: Option<Phase>) {
        let record = serialize_flow(flow, intercepted_phase);
        let mut ring = self.ring.lock();
        if ring.len() >= RING_CAPACITY {
            ring.pop_front();
        }
        ring.push_back(record);
        crate::metrics::ACTIVE_FLOWS.set(ring.len() as i64);
    }

    fn poll(&self, since: f64) -> Value {
        let ring = self.ring.lock();
        let flows: Vec<Value> = ring
            .iter()
            .filter(|record| {
                record
                    .get("msg_ts")
                    .and_then(Value::as_f64)
                    .map(|ts| ts > since)
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        drop(ring);

        let notifications: Vec<Value> = self
            .db
            .drain_notifications()
            .into_iter()
            .map(|n: Notification| serde_json::to_value(n).unwrap_or(Value::Null))
            .collect();

        json!({
            "flows": flows,
            "server_ts": crate::flow::clock::now_secs(),
            "notifications": notifications,
        })
    }

    async fn read_json_body(req: Request<Incoming>) -> Result<Value, ()> {
        let bytes = req.into_body().collect().await.map_err(|_| ())?.to_bytes();
        serde_json::from_slice(&bytes).map_err(|_| ())
    }

    fn serve_cert(&self) -> Response<BoxedBody> {
        let candidates = [self.ca_dir.join("cert.crt"), self.ca_dir.join("cert.pem")];
        for path in candidates {
            if let Ok(bytes) = std::fs::read(&path) {
                let filename = path
                    .file_name()
                    .map(|f| f.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "cert".to_string());
                return Response::builder()
                    .status(StatusCode::OK)
                    .header("Content-Type", "application/x-x509-ca-cert")
                    .header(
                        "Content-Disposition",
                        format!("attachment; filename=\"{filename}\""),
                    )
                    .header("Access-Control-Allow-Origin", "*")
                    .body(body_from(bytes))
                    .unwrap_or_else(|_| Response::new(body_from(Bytes::new())));
            }
        }
        json_response(
            StatusCode::NOT_FOUND,
            json!({"error": "no CA certificate configured"}),
        )
    }

    /// Handle one request under `/_relay` or `/cert*`. The caller (the Core
    /// Addon) is responsible for routing internal requests here.
    pub async fn handle_control_request(&self, req: Request<Incoming>) -> Response<BoxedBody> {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let query = req.uri().query().unwrap_or("").to_string();

        match (&method, path.as_str()) {
            (&Method::GET, "/_relay/poll") => {
                let since = query
                    .split('&')
                    .filter_map(|p| p.split_once('='))
                    .find(|(k, _)| *k == "since")
                    .and_then(|(_, v)| v.parse::<f64>().ok())
                    .unwrap_or(0.0);
                json_response(StatusCode::OK, self.poll(since))
            }
            (&Method::POST, "/_relay/breakpoints") => {
                let body = match Self::read_json_body(req).await {
                    Ok(v) => v,
                    Err(_) => {
                        return json_response(
                            StatusCode::BAD_REQUEST,
                            json!({"error": "invalid json"}),
                        )
                    }
                };
                self.apply_breakpoint_command(body)
            }
            (&Method::POST, "/_relay/resume") => {
                let body = match Self::read_json_body(req).await {
                    Ok(v) => v,
                    Err(_) => {
                        return json_response(
                            StatusCode::BAD_REQUEST,
                            json!({"error": "invalid json"}),
                        )
                    }
                };
                let resume: ResumeRequest = match serde_json::from_value(body) {
                    Ok(r) => r,
                    Err(_) => {
                        return json_response(
                            StatusCode::BAD_REQUEST,
                            json!({"error": "invalid resume request"}),
                        )
                    }
                };
                match self.debug.resume_flow(&resume.id, resume.modifications) {
                    Ok(()) => json_response(StatusCode::OK, json!({"ok": true})),
                    Err(_) => json_response(
                        StatusCode::NOT_FOUND,
                        json!({"error": "no such paused flow"}),
                    ),
                }
            }
            (&Method::GET, "/cert" | "/cert.pem" | "/cert.crt") => self.serve_cert(),
            _ => json_response(StatusCode::NOT_FOUND, json!({"error": "not found"})),
        }
    }

    fn apply_breakpoint_command(&self, body: Value) -> Response<BoxedBody> {
        let command: BreakpointCommand = match serde_json::from_value(body) {
            Ok(c) => c,
            Err(_) => {
                return json_response(
                    StatusCode::BAD_REQUEST,
                    json!({"error": "invalid breakpoint command"}),
                )
            }
        };
        match command {
            BreakpointCommand::Add { mut rule } => {
                rule.compile();
                self.debug.add_breakpoint(rule);
                json_response(StatusCode::OK, json!({"ok": true}))
            }
            BreakpointCommand::Remove { id } => {
                self.debug.remove_breakpoint(&id);
                json_response(StatusCode::OK, json!({"ok": true}))
            }
            BreakpointCommand::Clear => {
                self.debug.clear_breakpoints();
                json_response(StatusCode::OK, json!({"ok": true}))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{FlowRequest, Headers};
    use chrono::Utc;
    use tempfile::tempdir;

    fn sample_flow() -> Flow {
        let request = FlowRequest {
            method: "GET".into(),
            url: "https://example.com/x".into(),
            host: "example.com".into(),
            path: "/x".into(),
            port: 443,
            headers: Headers::new(),
            body: b"hello".to_vec(),
            started_at: Utc::now(),
        };
        Flow::new("f1".into(), request, None)
    }

    #[test]
    fn encode_body_prefers_text_for_utf8() {
        let encoded = encode_body(Some("text/plain"), b"hello world");
        assert_eq!(encoded.encoding, "text");
        assert!(!encoded.truncated);
    }

    #[test]
    fn encode_body_falls_back_to_base64_for_invalid_utf8() {
        let encoded = encode_body(None, &[0xFF, 0xFE, 0x00, 0x01]);
        assert_eq!(encoded.encoding, "base64");
    }

    #[test]
    fn encode_body_detects_png_magic() {
        let mut bytes = b"\x89PNG\r\n\x1a\n".to_vec();
        bytes.extend_from_slice(b"rest-of-file");
        let encoded = encode_body(None, &bytes);
        assert_eq!(encoded.encoding, "base64");
    }

    #[test]
    fn serialize_flow_rewrites_ws_scheme() {
        let mut flow = sample_flow();
        flow.websocket = Some(Vec::new());
        let record = serialize_flow(&flow, None);
        assert_eq!(record["url"], "wss://example.com/x");
        assert_eq!(record["status"], 101);
    }

    #[test]
    fn serialize_flow_reports_aborted_status_zero() {
        let mut flow = sample_flow();
        flow.kill();
        let record = serialize_flow(&flow, None);
        assert_eq!(record["status"], 0);
    }

    #[tokio::test]
    async fn poll_returns_only_records_after_since() {
        let dir = tempdir().unwrap();
        let db = Arc::new(FlowDb::open(dir.path(), crate::config::DbConfig::default()).unwrap());
        let debug = Arc::new(DebugManager::new());
        let monitor = TrafficMonitor::new(debug, db, dir.path().join("ca"));

        let mut flow1 = sample_flow();
        flow1.meta.msg_ts = 10.0;
        monitor.record(&flow1, None);

        let mut flow2 = sample_flow();
        flow2.id = "f2".into();
        flow2.meta.msg_ts = 20.0;
        monitor.record(&flow2, None);

        let result = monitor.poll(15.0);
        let flows = result["flows"].as_array().unwrap();
        assert_eq!(flows.len(), 1);
        assert_eq!(flows[0]["id"], "f2");
    }

    #[test]
    fn ring_drops_oldest_past_capacity() {
        let dir = tempdir().unwrap();
        let db = Arc::new(FlowDb::open(dir.path(), crate::config::DbConfig::default()).unwrap());
        let debug = Arc::new(DebugManager::new());
        let monitor = TrafficMonitor::new(debug, db, dir.path().join("ca"));

        for i in 0..(RING_CAPACITY + 10) {
            let mut flow = sample_flow();
            flow.id = format!("f{i}");
            monitor.record(&flow, None);
        }
        assert_eq!(monitor.ring.lock().len(), RING_CAPACITY);
    }

    #[test]
    fn cert_endpoint_404_when_unconfigured() {
        let dir = tempdir().unwrap();
        let db = Arc::new(FlowDb::open(dir.path(), crate::config::DbConfig::default()).unwrap());
        let debug = Arc::new(DebugManager::new());
        let monitor = TrafficMonitor::new(debug, db, dir.path().join("missing-ca"));
        let response = monitor.serve_cert();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
