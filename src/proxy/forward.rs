//! Applies a request verdict: inject a response, redirect, or forward.

use std::convert::Infallible;
use std::sync::Arc;

use bytes::Bytes;
use http::header::{HOST, HeaderValue};
use http::uri::Authority;
use http::{HeaderMap, Request, Response, StatusCode, Uri, Version};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full, Limited};
use hyper::body::{Body, Incoming};
use hyper::ext::ReasonPhrase;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{Level, debug, error, info};
use url::{Position, Url};

use super::error::ProxyError;
use super::server::ProxyState;
use crate::engine::{RequestContext, Verdict, rewrite};

pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Largest blackholed request body read for the debug log.
const LOGGED_BODY_LIMIT: usize = 64 * 1024;

/// Headers that only concern the client-to-proxy hop.
const PROXY_HOP_HEADERS: &[&str] = &["proxy-connection", "proxy-authorization"];

/// Where a request was originally headed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    tls: bool,
    host: String,
    port: u16,
}

impl Origin {
    pub fn https(host: String, port: u16) -> Self {
        Self {
            tls: true,
            host,
            port,
        }
    }

    /// Origin of an absolute-form proxy request (`GET http://host/path`).
    pub fn from_absolute_uri(uri: &Uri) -> Option<Self> {
        let tls = match uri.scheme_str()? {
            "http" => false,
            "https" => true,
            _ => return None,
        };
        let host = uri
            .host()?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = uri.port_u16().unwrap_or(if tls { 443 } else { 80 });
        Some(Self { tls, host, port })
    }

    /// Origin named by the `Host` header of a request inside a decrypted
    /// tunnel. Keeps the tunnel's host when the header is missing or
    /// malformed.
    pub fn with_host_header(&self, headers: &HeaderMap) -> Self {
        let Some(authority) = headers
            .get(HOST)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<Authority>().ok())
        else {
            return self.clone();
        };

        let host = authority.host().trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return self.clone();
        }
        let default_port = if self.tls { 443 } else { 80 };
        Self {
            tls: self.tls,
            host: host.to_string(),
            port: authority.port_u16().unwrap_or(default_port),
        }
    }

    /// Full URL of a request for `path_and_query` on this origin.
    pub fn url(&self, path_and_query: &str) -> Result<Url, ProxyError> {
        let scheme = if self.tls { "https" } else { "http" };
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        let raw = format!("{}://{}:{}{}", scheme, host, self.port, path_and_query);
        Url::parse(&raw).map_err(|source| ProxyError::InvalidUrl { url: raw, source })
    }
}

/// Routes one request and turns failures into a 502.
pub async fn handle_request(
    req: Request<Incoming>,
    state: Arc<ProxyState>,
    origin: Origin,
) -> Result<Response<ProxyBody>, Infallible> {
    match route_request(req, &state, &origin).await {
        Ok(response) => Ok(response),
        Err(e) => {
            error!("request to {}:{} failed: {}", origin.host, origin.port, e);
            Ok(status_response(StatusCode::BAD_GATEWAY, &e.to_string()))
        }
    }
}

async fn route_request(
    req: Request<Incoming>,
    state: &ProxyState,
    origin: &Origin,
) -> Result<Response<ProxyBody>, ProxyError> {
    let (parts, body) = req.into_parts();
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let url = origin.url(path_and_query)?;

    let verdict = state.request_decision.decide_request(&RequestContext {
        method: &parts.method,
        url: &url,
        headers: &parts.headers,
    });

    match verdict {
        Verdict::Block => {
            info!("Blocked: {}", url);
            Ok(inject(&verdict))
        }
        Verdict::Blackhole => {
            info!("Blackhole: {}", url);
            if tracing::enabled!(Level::DEBUG) {
                debug!("host: {}, path: {}", origin.host, url.path());
                log_body(body).await;
            }
            Ok(inject(&verdict))
        }
        Verdict::Redirect(endpoint) => {
            let target = rewrite(&url, &endpoint);
            info!("Redirecting: {} -> {}", url, target);
            let stream = state
                .tunnel
                .connect_plain(endpoint.domain(), endpoint.port())
                .await?;
            send(stream, Request::from_parts(parts, body), &target).await
        }
        Verdict::PassThrough | Verdict::Decrypt => {
            let req = Request::from_parts(parts, body);
            if origin.tls {
                let stream = state.tunnel.connect_tls(&origin.host, origin.port).await?;
                send(stream, req, &url).await
            } else {
                let stream = state.tunnel.connect_plain(&origin.host, origin.port).await?;
                send(stream, req, &url).await
            }
        }
    }
}

/// Logs up to [`LOGGED_BODY_LIMIT`] bytes of a body nobody will receive.
/// Read failures are logged too; they never change the response.
async fn log_body<B>(body: B)
where
    B: Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    match Limited::new(body, LOGGED_BODY_LIMIT).collect().await {
        Ok(collected) => {
            debug!("body: {}", String::from_utf8_lossy(&collected.to_bytes()));
        }
        Err(e) => debug!("body not logged: {}", e),
    }
}

/// Sends `req` to `target` over an already connected stream.
async fn send<S>(
    stream: S,
    mut req: Request<Incoming>,
    target: &Url,
) -> Result<Response<ProxyBody>, ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!("upstream connection closed: {}", e);
        }
    });

    *req.uri_mut() = Uri::try_from(&target[Position::BeforePath..Position::AfterQuery])
        .map_err(http::Error::from)?;
    *req.version_mut() = Version::HTTP_11;

    let headers = req.headers_mut();
    for name in PROXY_HOP_HEADERS {
        headers.remove(*name);
    }
    let authority = &target[Position::BeforeHost..Position::AfterPort];
    headers.insert(
        HOST,
        HeaderValue::from_str(authority).map_err(http::Error::from)?,
    );

    let response = sender.send_request(req).await?;
    Ok(response.map(|body| body.boxed()))
}

/// Answers in place of the backend, as required for Block and Blackhole.
fn inject(verdict: &Verdict) -> Response<ProxyBody> {
    let status = verdict.synthesized_status().unwrap_or(StatusCode::NOT_FOUND);
    let reason = verdict.reason();
    let mut response = status_response(status, reason);
    if !reason.is_empty() {
        response
            .extensions_mut()
            .insert(ReasonPhrase::from_static(reason.as_bytes()));
    }
    response
}

pub fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

fn full_body(content: String) -> ProxyBody {
    Full::new(Bytes::from(content))
        .map_err(|never| match never {})
        .boxed()
}

/// Plain-text response with the given status.
pub fn status_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    let body = if message.is_empty() {
        empty_body()
    } else {
        full_body(message.to_string())
    };
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response
}
