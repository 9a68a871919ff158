//! Explicit HTTP proxy listener.
//!
//! Clients send `CONNECT host:port` for HTTPS and absolute-form requests for
//! plain HTTP. Each CONNECT is either relayed opaquely or terminated locally
//! so that every request inside it can be routed.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use http::{Method, Request, Response, StatusCode};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use super::error::ProxyError;
use super::forward::{self, Origin, ProxyBody, empty_body, status_response};
use super::tls::TlsAcceptor;
use super::tunnel::Tunnel;
use crate::ca::{CaState, CertCache};
use crate::engine::{RequestDecision, TunnelDecision, Verdict};

/// Shared state for all proxy connections.
pub struct ProxyState {
    tunnel_decision: Arc<dyn TunnelDecision>,
    pub(super) request_decision: Arc<dyn RequestDecision>,
    tls_acceptor: TlsAcceptor,
    pub(super) tunnel: Tunnel,
}

impl ProxyState {
    pub fn new(
        tunnel_decision: Arc<dyn TunnelDecision>,
        request_decision: Arc<dyn RequestDecision>,
        ca: Arc<CaState>,
    ) -> Self {
        Self {
            tunnel_decision,
            request_decision,
            tls_acceptor: TlsAcceptor::new(Arc::new(CertCache::new(ca))),
            tunnel: Tunnel::new(),
        }
    }
}

/// The proxy listener.
pub struct ProxyServer {
    state: Arc<ProxyState>,
    listener: TcpListener,
}

impl ProxyServer {
    /// Binds the listener. Port 0 picks an ephemeral port.
    pub async fn bind(state: Arc<ProxyState>, addr: SocketAddr) -> Result<Self, std::io::Error> {
        let listener = TcpListener::bind(addr).await?;
        info!("proxy server listening on {}", listener.local_addr()?);
        Ok(Self { state, listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.listener.local_addr()
    }

    /// Accepts connections until the listener fails.
    pub async fn run(self) -> Result<(), std::io::Error> {
        loop {
            let (stream, peer_addr) = self.listener.accept().await?;
            debug!("accepted connection from {}", peer_addr);

            let state = Arc::clone(&self.state);
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, state).await {
                    debug!("connection from {} ended: {}", peer_addr, e);
                }
            });
        }
    }
}

async fn handle_connection(stream: TcpStream, state: Arc<ProxyState>) -> Result<(), ProxyError> {
    let service = service_fn(move |req: Request<Incoming>| {
        let state = Arc::clone(&state);
        async move { handle_proxy_request(req, state).await }
    });

    http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .serve_connection(TokioIo::new(stream), service)
        .with_upgrades()
        .await?;

    Ok(())
}

async fn handle_proxy_request(
    req: Request<Incoming>,
    state: Arc<ProxyState>,
) -> Result<Response<ProxyBody>, Infallible> {
    if req.method() == Method::CONNECT {
        return Ok(handle_connect(req, state));
    }

    match Origin::from_absolute_uri(req.uri()) {
        Some(origin) => forward::handle_request(req, state, origin).await,
        None => {
            warn!("rejecting non-proxy request for {}", req.uri());
            Ok(status_response(StatusCode::BAD_REQUEST, "expected an absolute URL"))
        }
    }
}

/// Answers a CONNECT and hands the upgraded stream to a background task.
fn handle_connect(req: Request<Incoming>, state: Arc<ProxyState>) -> Response<ProxyBody> {
    let (host, port) = match parse_connect_target(&req) {
        Ok(target) => target,
        Err(e) => {
            warn!("{}", e);
            return status_response(StatusCode::BAD_REQUEST, &e.to_string());
        }
    };

    let authority = format!("{}:{}", host, port);
    let verdict = state.tunnel_decision.decide_tunnel(&authority);
    debug!("CONNECT {} -> {}", authority, verdict);

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                let result = if verdict == Verdict::Decrypt {
                    intercept(upgraded, host, port, state).await
                } else {
                    relay(upgraded, &host, port, &state).await
                };
                if let Err(e) = result {
                    debug!("tunnel to {} ended: {}", authority, e);
                }
            }
            Err(e) => warn!("upgrade failed for {}: {}", authority, e),
        }
    });

    let mut response = Response::new(empty_body());
    *response.status_mut() = StatusCode::OK;
    response
}

/// Relays an opaque tunnel to the requested destination.
async fn relay(
    upgraded: Upgraded,
    host: &str,
    port: u16,
    state: &ProxyState,
) -> Result<(), ProxyError> {
    let mut upstream = state.tunnel.connect_plain(host, port).await?;
    let mut client = TokioIo::new(upgraded);
    Tunnel::relay(&mut client, &mut upstream).await?;
    Ok(())
}

/// Terminates TLS as `host` and serves the decrypted requests.
async fn intercept(
    upgraded: Upgraded,
    host: String,
    port: u16,
    state: Arc<ProxyState>,
) -> Result<(), ProxyError> {
    let tls_stream = state
        .tls_acceptor
        .accept(TokioIo::new(upgraded), &host)
        .await
        .map_err(ProxyError::TlsHandshake)?;

    // The tunnel's host is only a fallback; each request names its own.
    let tunnel_origin = Origin::https(host, port);
    let service = service_fn(move |req: Request<Incoming>| {
        let state = Arc::clone(&state);
        let origin = tunnel_origin.with_host_header(req.headers());
        async move { forward::handle_request(req, state, origin).await }
    });

    http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .serve_connection(TokioIo::new(tls_stream), service)
        .await?;

    Ok(())
}

/// Extracts `(host, port)` from a CONNECT request, defaulting to 443.
fn parse_connect_target<B>(req: &Request<B>) -> Result<(String, u16), ProxyError> {
    let authority = req
        .uri()
        .authority()
        .ok_or_else(|| ProxyError::InvalidConnect(req.uri().to_string()))?;

    let host = authority
        .host()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string();
    if host.is_empty() {
        return Err(ProxyError::InvalidConnect(authority.to_string()));
    }

    Ok((host, authority.port_u16().unwrap_or(443)))
}
