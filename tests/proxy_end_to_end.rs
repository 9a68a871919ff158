use std::convert::Infallible;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use http::header::HOST;
use http::{Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Empty, Full};
use hyacine_proxy::{CaState, RuleConfig, RuleSet, Service};
use hyper::body::Incoming;
use hyper::ext::ReasonPhrase;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, ServerName};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsConnector;

/// Plain HTTP server that echoes what it received and counts requests.
async fn spawn_backend(hits: Arc<AtomicUsize>) -> SocketAddr {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let hits = Arc::clone(&hits);
            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    hits.fetch_add(1, Ordering::SeqCst);
                    let host = req
                        .headers()
                        .get(HOST)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default()
                        .to_string();
                    let body = format!("{} {} host={}", req.method(), req.uri(), host);
                    async move { Ok::<_, Infallible>(Response::new(Full::new(Bytes::from(body)))) }
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    addr
}

struct Harness {
    proxy: SocketAddr,
    backend: SocketAddr,
    hits: Arc<AtomicUsize>,
    ca_pem: String,
}

/// Starts a backend and a proxy whose dispatch endpoint points at it.
async fn start() -> Harness {
    let hits = Arc::new(AtomicUsize::new(0));
    let backend = spawn_backend(Arc::clone(&hits)).await;

    let mut config = RuleConfig::default();
    config.proxy_port = 0;
    config.dispatch.domain = "127.0.0.1".to_string();
    config.dispatch.port = backend.port();

    let ca = CaState::generate().unwrap();
    let ca_pem = ca.ca_cert_pem().to_string();

    let service = Service::new(RuleSet::from_config(&config).unwrap(), ca)
        .with_bind_addr(Ipv4Addr::LOCALHOST.into());
    let server = service.bind().await.unwrap();
    let proxy = server.local_addr().unwrap();
    tokio::spawn(server.run());

    Harness {
        proxy,
        backend,
        hits,
        ca_pem,
    }
}

/// Sends one request over `stream` and returns status, reason and body.
async fn send<S>(stream: S, req: Request<Empty<Bytes>>) -> (StatusCode, Option<String>, String)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .unwrap();
    tokio::spawn(conn);

    let response = sender.send_request(req).await.unwrap();
    let status = response.status();
    let reason = response
        .extensions()
        .get::<ReasonPhrase>()
        .map(|r| String::from_utf8_lossy(r.as_bytes()).into_owned());
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, reason, String::from_utf8_lossy(&body).into_owned())
}

async fn proxy_get(proxy: SocketAddr, url: &str) -> (StatusCode, Option<String>, String) {
    let stream = TcpStream::connect(proxy).await.unwrap();
    let host = url::Url::parse(url).unwrap().host_str().unwrap().to_string();
    let req = Request::builder()
        .uri(url)
        .header(HOST, host)
        .body(Empty::new())
        .unwrap();
    send(stream, req).await
}

#[tokio::test]
async fn test_plain_request_is_redirected() {
    let h = start().await;

    let (status, _, body) = proxy_get(
        h.proxy,
        "http://dispatch.hoyoverse.com/query_dispatch?version=OSPRODWin2.0.0",
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        format!(
            "GET /query_dispatch?version=OSPRODWin2.0.0 host=127.0.0.1:{}",
            h.backend.port()
        )
    );
    assert_eq!(h.hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_blocked_and_blackholed_requests_never_leave() {
    let h = start().await;

    let (status, _, _) = proxy_get(h.proxy, "http://sdk.hoyoverse.com/sdk/upload").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, reason, body) =
        proxy_get(h.proxy, "http://sdk.hoyoverse.com/unknown/endpoint").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(reason.as_deref(), Some("Blackholed"));
    assert_eq!(body, "Blackholed");

    assert_eq!(h.hits.load(Ordering::SeqCst), 0);
}

/// Reads from `stream` until the end of the response head.
async fn read_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = stream.read(&mut buf).await.unwrap();
        if n == 0 {
            break;
        }
        head.extend_from_slice(&buf[..n]);
    }
    String::from_utf8_lossy(&head).into_owned()
}

#[tokio::test]
async fn test_unreadable_blackholed_body_still_gets_404() {
    // With debug logging on, the proxy reads the body it discards.
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let h = start().await;
    let mut stream = TcpStream::connect(h.proxy).await.unwrap();
    stream
        .write_all(
            b"POST http://log.hoyoverse.com/unknown/endpoint HTTP/1.1\r\n\
              Host: log.hoyoverse.com\r\n\
              Transfer-Encoding: chunked\r\n\
              \r\n\
              ZZ\r\nnot a chunk\r\n\r\n",
        )
        .await
        .unwrap();

    let head = tokio::time::timeout(Duration::from_secs(10), read_head(&mut stream))
        .await
        .unwrap();
    assert!(head.starts_with("HTTP/1.1 404 Blackholed\r\n"), "{head}");
    assert_eq!(h.hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_connect_tunnel_is_decrypted_and_redirected() {
    let h = start().await;

    // CONNECT through the proxy.
    let stream = TcpStream::connect(h.proxy).await.unwrap();
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .unwrap();
    tokio::spawn(conn.with_upgrades());

    let connect = Request::builder()
        .method(Method::CONNECT)
        .uri("dispatch.hoyoverse.com:443")
        .body(Empty::<Bytes>::new())
        .unwrap();
    let response = sender.send_request(connect).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let upgraded = hyper::upgrade::on(response).await.unwrap();

    // Trust only the proxy's root, as an installed client would.
    let mut roots = rustls::RootCertStore::empty();
    roots
        .add(CertificateDer::from_pem_slice(h.ca_pem.as_bytes()).unwrap())
        .unwrap();
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let tls = TlsConnector::from(Arc::new(config))
        .connect(
            ServerName::try_from("dispatch.hoyoverse.com").unwrap(),
            TokioIo::new(upgraded),
        )
        .await
        .unwrap();

    let req = Request::builder()
        .uri("/query_region_list?channel_id=1")
        .header(HOST, "dispatch.hoyoverse.com")
        .body(Empty::new())
        .unwrap();
    let (status, _, body) = send(tls, req).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        format!(
            "GET /query_region_list?channel_id=1 host=127.0.0.1:{}",
            h.backend.port()
        )
    );
    assert_eq!(h.hits.load(Ordering::SeqCst), 1);
}
