use super::tunnel::TunnelError;

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid CONNECT target: {0}")]
    InvalidConnect(String),
    #[error("invalid request URL {url}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("TLS handshake failed: {0}")]
    TlsHandshake(#[source] std::io::Error),
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),
    #[error("failed to build request: {0}")]
    Request(#[from] http::Error),
    #[error("tunnel error: {0}")]
    Tunnel(#[from] TunnelError),
}
