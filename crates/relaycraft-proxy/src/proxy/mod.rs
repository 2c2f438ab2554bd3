//! The proxy runtime substrate (SPEC_FULL §1.1): a thin forward-proxy,
//! `CONNECT`-tunnel, and WebSocket-relay layer standing in for the
//! externally-owned HTTP/TLS interception engine the distilled spec treats
//! as out of scope. Its only job is to hand the Core Addon's hooks real
//! flows to dispatch on.
//!
//! # Module structure
//!
//! - `server` — accept loop, hyper wiring, `CONNECT` tunnel handling
//! - `handler` — per-request dispatch (internal routing, hooks, WebSocket)
//! - `forwarding` — `Flow` <-> hyper wire-type conversion and upstream fetch
//! - `client` — shared upstream HTTP client
//! - `tls` — TLS acceptor construction for HTTPS listeners and decrypted
//!   `CONNECT` tunnels
//! - `network` — `SO_REUSEPORT` listener setup

mod client;
mod forwarding;
mod handler;
mod network;
mod server;
mod tls;

pub use client::{create_http_client, HttpClient};
pub use forwarding::BoxedBody;
pub use server::ProxyServer;
