//! Per-request dispatch: internal control-channel routing, the rule/debug
//! hook dance around an upstream fetch, and WebSocket frame relay
//! (SPEC_FULL §1.1, §4.5, §4.7).

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::upgrade::Upgraded;
use hyper::{HeaderMap, Method, Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use tokio_tungstenite::tungstenite::Message;
use tracing::{error, warn};

use crate::addon::CoreAddon;
use crate::flow::{ErrorType, Flow, WsDirection, WsFrameType};

use super::client::HttpClient;
use super::forwarding::{body_from, error_response, fetch_upstream, flow_to_response, incoming_to_flow};
use super::BoxedBody;

fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(hyper::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}

fn request_host_path_port(uri: &Uri, headers: &HeaderMap, default_port: u16) -> (String, String, u16) {
    let path = uri.path().to_string();
    if let Some(authority) = uri.authority() {
        let port = authority.port_u16().unwrap_or(default_port);
        return (authority.host().to_string(), path, port);
    }
    let host_header = headers
        .get(hyper::header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    match host_header.rsplit_once(':') {
        Some((host, port)) => (host.to_string(), path, port.parse().unwrap_or(default_port)),
        None => (host_header.to_string(), path, default_port),
    }
}

/// Handle one HTTP request arriving on either the plain listener or a
/// decrypted `CONNECT` tunnel. Internal requests are routed straight to the
/// traffic monitor's control handler and never touch the rule engine, per
/// SPEC_FULL §4.5 ("external traffic to this prefix is never captured").
pub async fn handle_request(
    addon: &Arc<CoreAddon>,
    http_client: &HttpClient,
    req: Request<Incoming>,
    client_addr: Option<SocketAddr>,
    default_scheme: &str,
    default_port: u16,
) -> Response<BoxedBody> {
    let (host, path, port) = request_host_path_port(req.uri(), req.headers(), default_port);

    if addon.is_internal_request(&host, &path, port) {
        if req.method() == Method::POST && path == "/_relay/traffic" {
            return handle_traffic_toggle(addon, req).await;
        }
        return addon.monitor().handle_control_request(req).await;
    }

    if is_websocket_upgrade(req.headers()) {
        return handle_websocket_upgrade(addon, req, client_addr, default_scheme, default_port).await;
    }

    let flow_id = crate::db::new_flow_id();
    let mut flow = match incoming_to_flow(flow_id, req, client_addr, default_scheme, default_port).await {
        Ok(flow) => flow,
        Err(err) => {
            error!(error = %err, "failed to read request body");
            return error_response(StatusCode::BAD_REQUEST, "failed to read request body");
        }
    };

    let matched = addon.on_request(&mut flow).await;

    if flow.response.is_none() && !flow.meta.aborted {
        match fetch_upstream(http_client, &flow).await {
            Ok(response) => flow.response = Some(response),
            Err(err) => {
                warn!(flow_id = %flow.id, host = %flow.request.host, error = %err, "upstream fetch failed");
                addon.on_error(&mut flow, ErrorType::Connection, err, false).await;
                return error_response(StatusCode::BAD_GATEWAY, "upstream request failed");
            }
        }
    }

    if flow.meta.aborted {
        addon.on_response(&mut flow, &matched).await;
        return Response::builder()
            .status(StatusCode::OK)
            .body(body_from(Bytes::new()))
            .unwrap_or_else(|_| Response::new(body_from(Bytes::new())));
    }

    addon.on_response(&mut flow, &matched).await;
    flow_to_response(&flow)
}

/// Complete the WebSocket handshake: run the request-phase hooks against a
/// synthetic flow, dial the upstream as a WebSocket client, then hand the
/// inbound connection's eventual upgrade future off to a background task
/// that pumps frames in both directions (SPEC_FULL §1.1, §4.7).
async fn handle_websocket_upgrade(
    addon: &Arc<CoreAddon>,
    mut req: Request<Incoming>,
    client_addr: Option<SocketAddr>,
    default_scheme: &str,
    default_port: u16,
) -> Response<BoxedBody> {
    let (host, path, port) = request_host_path_port(req.uri(), req.headers(), default_port);
    let ws_scheme = if default_scheme == "https" { "wss" } else { "ws" };
    let url = format!("{ws_scheme}://{host}{path}");

    let mut headers = crate::flow::Headers::new();
    for (name, value) in req.headers().iter() {
        headers.add(name.as_str(), value.to_str().unwrap_or_default());
    }
    let flow_request = crate::flow::FlowRequest {
        method: req.method().to_string(),
        url: url.clone(),
        host,
        path,
        port,
        headers,
        body: Vec::new(),
        started_at: chrono::Utc::now(),
    };
    let mut flow = Flow::new(crate::db::new_flow_id(), flow_request, client_addr);
    flow.websocket = Some(Vec::new());

    let matched = addon.on_request(&mut flow).await;
    if flow.meta.aborted || flow.response.is_some() {
        addon.on_response(&mut flow, &matched).await;
        return error_response(StatusCode::BAD_GATEWAY, "websocket blocked by rule");
    }

    let (upstream_ws, upstream_resp) = match tokio_tungstenite::connect_async(flow.request.url.clone()).await {
        Ok(pair) => pair,
        Err(err) => {
            warn!(flow_id = %flow.id, error = %err, "websocket upstream connect failed");
            addon.on_error(&mut flow, ErrorType::Connection, err.to_string(), false).await;
            return error_response(StatusCode::BAD_GATEWAY, "websocket upstream unreachable");
        }
    };

    let on_upgrade = hyper::upgrade::on(&mut req);

    let mut response = Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(hyper::header::CONNECTION, "upgrade")
        .header(hyper::header::UPGRADE, "websocket");
    for (name, value) in upstream_resp.headers().iter() {
        if name == hyper::header::CONNECTION || name == hyper::header::UPGRADE {
            continue;
        }
        response = response.header(name, value);
    }
    let response = response
        .body(body_from(Bytes::new()))
        .unwrap_or_else(|_| Response::new(body_from(Bytes::new())));

    let addon = Arc::clone(addon);
    tokio::spawn(async move {
        match on_upgrade.await {
            Ok(upgraded) => relay_websocket_frames(addon, flow, upgraded, upstream_ws).await,
            Err(err) => error!(error = %err, "client websocket upgrade failed"),
        }
    });

    response
}

/// Pump WebSocket frames bidirectionally between the client's upgraded
/// connection and the upstream's WebSocket client, appending a `WsFrame` to
/// `flow` and firing the message hook for every frame that crosses
/// (SPEC_FULL §4.7 "WebSocket message hook").
async fn relay_websocket_frames(
    addon: Arc<CoreAddon>,
    mut flow: Flow,
    client_upgraded: Upgraded,
    upstream: tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
) {
    use futures::{SinkExt, StreamExt};

    let client_io = TokioIo::new(client_upgraded);
    let client_ws = tokio_tungstenite::WebSocketStream::from_raw_socket(
        client_io,
        tokio_tungstenite::tungstenite::protocol::Role::Server,
        None,
    )
    .await;
    let (mut upstream_tx, mut upstream_rx) = upstream.split();
    let (mut client_tx, mut client_rx) = client_ws.split();

    loop {
        tokio::select! {
            msg = client_rx.next() => {
                match msg {
                    Some(Ok(msg)) => {
                        record_frame(&mut flow, &addon, WsDirection::ToServer, &msg);
                        if upstream_tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    _ => break,
                }
            }
            msg = upstream_rx.next() => {
                match msg {
                    Some(Ok(msg)) => {
                        record_frame(&mut flow, &addon, WsDirection::ToClient, &msg);
                        if client_tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    _ => break,
                }
            }
        }
    }
}

fn record_frame(flow: &mut Flow, addon: &Arc<CoreAddon>, direction: WsDirection, msg: &Message) {
    let (frame_type, content) = match msg {
        Message::Text(t) => (WsFrameType::Text, t.as_bytes().to_vec()),
        Message::Binary(b) => (WsFrameType::Binary, b.to_vec()),
        _ => return,
    };
    if let Some(frames) = flow.websocket.as_mut() {
        frames.push(crate::flow::WsFrame {
            direction,
            frame_type,
            content,
            timestamp: chrono::Utc::now(),
        });
    }
    addon.on_websocket_message(flow);
}
