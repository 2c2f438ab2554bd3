//! `ProxyServer`: the accept loop and hyper wiring for the proxy runtime
//! substrate (SPEC_FULL §1.1).
//!
//! Three shapes of connection are served, all ending up at
//! `handler::handle_request`: a plain-HTTP forward proxy, a `CONNECT`
//! tunnel (raw byte-shovel unless CA material is configured, in which case
//! it's decrypted and served as another HTTP/1.1 connection), and the
//! WebSocket upgrade handled inside `handler`.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info};

use crate::addon::CoreAddon;
use crate::config::{ListenConfig, Protocol};

use super::client::HttpClient;
use super::forwarding::{body_from, BoxedBody};
use super::handler::handle_request;
use super::network::create_reusable_listener;
use super::tls::create_tls_acceptor;

/// Owns the accept loop and everything a connection needs to be served:
/// the shared upstream client, the Core Addon the hooks dispatch through,
/// and (optionally) the CA keypair used to decrypt `CONNECT` tunnels.
pub struct ProxyServer {
    addon: Arc<CoreAddon>,
    http_client: HttpClient,
    listen: ListenConfig,
    /// Decrypts `CONNECT` tunnels when present. Loading/generating this
    /// material is out of scope (SPEC_FULL §1); the substrate only reads a
    /// pre-generated `cert.crt`/`cert.pem` + `key.pem` pair from `ca_dir`.
    tunnel_tls: Option<TlsAcceptor>,
}

fn find_ca_material(ca_dir: &Path) -> Option<(PathBuf, PathBuf)> {
    let key = ca_dir.join("key.pem");
    if !key.exists() {
        return None;
    }
    for cert_name in ["cert.crt", "cert.pem"] {
        let cert = ca_dir.join(cert_name);
        if cert.exists() {
            return Some((cert, key));
        }
    }
    None
}

impl ProxyServer {
    pub fn new(
        addon: Arc<CoreAddon>,
        http_client: HttpClient,
        listen: ListenConfig,
        ca_dir: &Path,
    ) -> Result<Self, anyhow::Error> {
        let tunnel_tls = match find_ca_material(ca_dir) {
            Some((cert, key)) => {
                info!(cert = %cert.display(), "CONNECT tunnels will be decrypted with configured CA material");
                Some(create_tls_acceptor(
                    cert.to_string_lossy().as_ref(),
                    key.to_string_lossy().as_ref(),
                )?)
            }
            None => {
                info!("no CA material found under {}; CONNECT tunnels will be raw-relayed", ca_dir.display());
                None
            }
        };

        Ok(Self {
            addon,
            http_client,
            listen,
            tunnel_tls,
        })
    }

    pub async fn run(self) -> Result<(), anyhow::Error> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.listen.port));
        let listener = create_reusable_listener(addr)?;

        let listener_tls = if self.listen.protocol == Protocol::Https {
            let tls = self
                .listen
                .tls
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("listen.tls is required when listen.protocol is https"))?;
            Some(create_tls_acceptor(&tls.cert_path, &tls.key_path)?)
        } else {
            None
        };

        info!("listening on {}://{}", self.listen.protocol.as_str(), addr);

        let server = Arc::new(self);
        loop {
            let (stream, remote_addr) = listener.accept().await?;
            let server = Arc::clone(&server);
            let listener_tls = listener_tls.clone();

            tokio::spawn(async move {
                let result = match listener_tls {
                    Some(acceptor) => match acceptor.accept(stream).await {
                        Ok(tls_stream) => server.serve_http1(TokioIo::new(tls_stream), Some(remote_addr), "https", 443).await,
                        Err(err) => {
                            debug!(%remote_addr, error = %err, "listener TLS handshake failed");
                            return;
                        }
                    },
                    None => server.serve_http1(TokioIo::new(stream), Some(remote_addr), "http", 80).await,
                };
                if let Err(err) = result {
                    debug!(%remote_addr, error = %err, "connection closed with error");
                }
            });
        }
    }

    async fn serve_http1<I>(
        self: &Arc<Self>,
        io: TokioIo<I>,
        remote_addr: Option<SocketAddr>,
        default_scheme: &'static str,
        default_port: u16,
    ) -> Result<(), hyper::Error>
    where
        I: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let server = Arc::clone(self);
        let service = service_fn(move |req: Request<Incoming>| {
            let server = Arc::clone(&server);
            async move {
                Ok::<_, Infallible>(
                    server
                        .dispatch(req, remote_addr, default_scheme, default_port)
                        .await,
                )
            }
        });
        http1::Builder::new()
            .serve_connection(io, service)
            .with_upgrades()
            .await
    }

    async fn dispatch(
        self: &Arc<Self>,
        req: Request<Incoming>,
        remote_addr: Option<SocketAddr>,
        default_scheme: &'static str,
        default_port: u16,
    ) -> Response<BoxedBody> {
        if req.method() == Method::CONNECT {
            return self.handle_connect(req, remote_addr).await;
        }
        handle_request(&self.addon, &self.http_client, req, remote_addr, default_scheme, default_port).await
    }

    /// `CONNECT host:port` — answer `200 Connection Established`, then hand
    /// the raw upgraded stream to a TLS acceptor (if CA material is
    /// configured) or straight through as a byte-shovel.
    async fn handle_connect(self: &Arc<Self>, mut req: Request<Incoming>, remote_addr: Option<SocketAddr>) -> Response<BoxedBody> {
        let authority = req.uri().to_string();
        let (host, port) = match authority.rsplit_once(':') {
            Some((h, p)) => (h.to_string(), p.parse().unwrap_or(443)),
            None => (authority.clone(), 443u16),
        };

        let server = Arc::clone(self);
        tokio::spawn(async move {
            let upgraded = match hyper::upgrade::on(&mut req).await {
                Ok(upgraded) => upgraded,
                Err(err) => {
                    error!(error = %err, "CONNECT upgrade failed");
                    return;
                }
            };
            let io = TokioIo::new(upgraded);

            match server.tunnel_tls.clone() {
                Some(acceptor) => match acceptor.accept(io).await {
                    Ok(tls_stream) => {
                        if let Err(err) = server
                            .serve_http1(TokioIo::new(tls_stream), remote_addr, "https", port)
                            .await
                        {
                            // Client TLS disconnects mid-tunnel are routine and
                            // would otherwise flood the logs (SPEC_FULL §4.7
                            // "Error & TLS-failure hooks").
                            debug!(error = %err, "tunnel connection closed");
                        }
                    }
                    Err(err) => debug!(error = %err, "CONNECT tunnel TLS handshake failed"),
                },
                None => {
                    if let Err(err) = shovel_bytes(io, &host, port).await {
                        debug!(%host, port, error = %err, "CONNECT byte-shovel ended");
                    }
                }
            }
        });

        Response::builder()
            .status(StatusCode::OK)
            .body(body_from(Bytes::new()))
            .unwrap_or_else(|_| Response::new(body_from(Bytes::new())))
    }
}

async fn shovel_bytes<I>(mut client: TokioIo<I>, host: &str, port: u16) -> std::io::Result<()>
where
    I: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let mut upstream = TcpStream::connect((host, port)).await?;
    tokio::io::copy_bidirectional(&mut client, &mut upstream).await?;
    Ok(())
}
