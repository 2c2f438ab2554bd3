//! Conversion between hyper's wire types and a [`Flow`], and the upstream
//! fetch that drives the request/response hooks (SPEC_FULL §1.1, §4.7).
//!
//! This module owns no policy: it neither matches rules nor decides whether
//! to forward. It only translates "bytes on the wire" to and from the
//! `Flow` the Core Addon's hooks operate on.

use std::convert::Infallible;
use std::net::SocketAddr;

use bytes::Bytes;
use chrono::Utc;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::http::request::Parts;
use hyper::{HeaderMap, Method, Request, Response, StatusCode};

use crate::flow::{Flow, FlowRequest, FlowResponse, Headers};

use super::client::HttpClient;

pub type BoxedBody = BoxBody<Bytes, hyper::Error>;

pub fn body_from(bytes: impl Into<Bytes>) -> BoxedBody {
    Full::new(bytes.into())
        .map_err(|never: Infallible| match never {})
        .boxed()
}

/// Build an error response for failures internal to the substrate itself —
/// distinct from an upstream error, which the request still completes with
/// (a synthesized `502`, not a dropped connection).
pub fn error_response(status: StatusCode, message: &str) -> Response<BoxedBody> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(body_from(format!(r#"{{"error":"{message}"}}"#)))
        .unwrap_or_else(|_| Response::new(body_from(Bytes::new())))
}

fn headers_from_map(map: &HeaderMap) -> Headers {
    let mut headers = Headers::new();
    for (name, value) in map.iter() {
        headers.add(name.as_str(), value.to_str().unwrap_or_default());
    }
    headers
}

/// Resolve `(scheme, host, port)` for an incoming request. Absolute-form
/// request lines (used by plain-HTTP forward proxying) carry the authority
/// in the URI itself; origin-form requests (used inside a `CONNECT` tunnel,
/// decrypted or otherwise) carry it only in the `Host` header.
fn resolve_authority(parts: &Parts, default_scheme: &str, default_port: u16) -> (String, String, u16) {
    if let Some(authority) = parts.uri.authority() {
        let scheme = parts.uri.scheme_str().unwrap_or(default_scheme).to_string();
        let host = authority.host().to_string();
        let port = authority
            .port_u16()
            .unwrap_or(if scheme == "https" { 443 } else { 80 });
        return (scheme, host, port);
    }

    let host_header = parts
        .headers
        .get(hyper::header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    match host_header.rsplit_once(':') {
        Some((host, port)) => (
            default_scheme.to_string(),
            host.to_string(),
            port.parse().unwrap_or(default_port),
        ),
        None => (default_scheme.to_string(), host_header.to_string(), default_port),
    }
}

fn port_suffix(scheme: &str, port: u16) -> String {
    let default = if scheme == "https" { 443 } else { 80 };
    if port == default {
        String::new()
    } else {
        format!(":{port}")
    }
}

/// Collect an incoming hyper request's body and assemble a [`Flow`].
/// `default_scheme`/`default_port` describe the connection this request
/// arrived on (`http`/80 for the plain listener, `https`/443 inside a
/// decrypted `CONNECT` tunnel).
pub async fn incoming_to_flow(
    flow_id: String,
    req: Request<Incoming>,
    client_addr: Option<SocketAddr>,
    default_scheme: &str,
    default_port: u16,
) -> Result<Flow, hyper::Error> {
    let (parts, body) = req.into_parts();
    let (scheme, host, port) = resolve_authority(&parts, default_scheme, default_port);
    let body_bytes = body.collect().await?.to_bytes();

    let path = parts.uri.path().to_string();
    let query = parts.uri.query().map(|q| format!("?{q}")).unwrap_or_default();
    let url = format!("{scheme}://{host}{}{path}{query}", port_suffix(&scheme, port));

    let request = FlowRequest {
        method: parts.method.to_string(),
        url,
        host,
        path,
        port,
        headers: headers_from_map(&parts.headers),
        body: body_bytes.to_vec(),
        started_at: Utc::now(),
    };
    Ok(Flow::new(flow_id, request, client_addr))
}

/// Fetch `flow.request` from its (possibly rule-rewritten) destination and
/// return the result as a [`FlowResponse`]. Errors are returned to the
/// caller as a plain `String` rather than propagated through `?` chains
/// across hook boundaries — the caller synthesizes a `502` flow error from
/// it, per SPEC_FULL §7 "Client-facing proxy errors".
pub async fn fetch_upstream(client: &HttpClient, flow: &Flow) -> Result<FlowResponse, String> {
    let method: Method = flow
        .request
        .method
        .parse()
        .map_err(|_| "invalid method".to_string())?;

    let mut builder = Request::builder().method(method).uri(flow.request.url.clone());
    for (name, value) in flow.request.headers.iter() {
        if name.eq_ignore_ascii_case("host") || name.eq_ignore_ascii_case("content-length") {
            continue;
        }
        builder = builder.header(name, value);
    }
    builder = builder.header(hyper::header::HOST, &flow.request.host);

    let upstream_req = builder
        .body(body_from(flow.request.body.clone()))
        .map_err(|e| e.to_string())?;

    let started_at = Utc::now();
    let response = client.request(upstream_req).await.map_err(|e| e.to_string())?;
    let (parts, body) = response.into_parts();
    let body_bytes = body.collect().await.map_err(|e| e.to_string())?.to_bytes();

    Ok(FlowResponse {
        status: parts.status.as_u16(),
        headers: headers_from_map(&parts.headers),
        body: body_bytes.to_vec(),
        started_at,
        finished_at: Some(Utc::now()),
    })
}

/// Render `flow.response` (set by a terminal rule action or an upstream
/// fetch) as an outgoing hyper response.
pub fn flow_to_response(flow: &Flow) -> Response<BoxedBody> {
    let Some(resp) = &flow.response else {
        return error_response(StatusCode::BAD_GATEWAY, "no response produced");
    };
    let status = StatusCode::from_u16(resp.status).unwrap_or(StatusCode::OK);
    let mut builder = Response::builder().status(status);
    for (name, value) in resp.headers.iter() {
        builder = builder.header(name, value);
    }
    builder
        .body(body_from(resp.body.clone()))
        .unwrap_or_else(|_| Response::new(body_from(Bytes::new())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_suffix_omits_default_port() {
        assert_eq!(port_suffix("https", 443), "");
        assert_eq!(port_suffix("http", 80), "");
        assert_eq!(port_suffix("https", 8443), ":8443");
    }

    #[test]
    fn error_response_has_json_content_type() {
        let resp = error_response(StatusCode::BAD_GATEWAY, "boom");
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            resp.headers().get("content-type").unwrap(),
            "application/json"
        );
    }
}
