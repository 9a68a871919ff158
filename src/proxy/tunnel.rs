//! Upstream connections and opaque relaying.

use std::sync::Arc;

use rustls::ClientConfig;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite, copy_bidirectional};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

/// Opens connections to the hosts the client originally asked for.
pub struct Tunnel {
    client_config: Arc<ClientConfig>,
}

impl Tunnel {
    /// Creates a tunnel that verifies upstream certificates against the
    /// webpki root store.
    pub fn new() -> Self {
        let root_store = rustls::RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };

        let mut config = ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        Self {
            client_config: Arc::new(config),
        }
    }

    /// Opens a plain TCP connection to `host:port`.
    pub async fn connect_plain(&self, host: &str, port: u16) -> Result<TcpStream, TunnelError> {
        debug!("connecting to upstream {}:{}", host, port);
        TcpStream::connect((host, port))
            .await
            .map_err(TunnelError::Connect)
    }

    /// Opens a verified TLS connection to `host:port`.
    pub async fn connect_tls(
        &self,
        host: &str,
        port: u16,
    ) -> Result<tokio_rustls::client::TlsStream<TcpStream>, TunnelError> {
        let tcp_stream = self.connect_plain(host, port).await?;

        let server_name = ServerName::try_from(host.to_string())
            .map_err(|_| TunnelError::InvalidServerName(host.to_string()))?;

        let connector = TlsConnector::from(Arc::clone(&self.client_config));
        let tls_stream = connector
            .connect(server_name, tcp_stream)
            .await
            .map_err(TunnelError::TlsHandshake)?;

        debug!("upstream TLS connection established to {}", host);

        Ok(tls_stream)
    }

    /// Copies bytes both ways until either side closes.
    pub async fn relay<C, U>(client: &mut C, upstream: &mut U) -> Result<(u64, u64), TunnelError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
        U: AsyncRead + AsyncWrite + Unpin,
    {
        let result = copy_bidirectional(client, upstream)
            .await
            .map_err(TunnelError::Io)?;

        debug!(
            "tunnel closed: {} bytes client->upstream, {} bytes upstream->client",
            result.0, result.1
        );

        Ok(result)
    }
}

impl Default for Tunnel {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("failed to connect to upstream: {0}")]
    Connect(#[source] std::io::Error),
    #[error("invalid server name: {0}")]
    InvalidServerName(String),
    #[error("TLS handshake failed: {0}")]
    TlsHandshake(#[source] std::io::Error),
    #[error("I/O error: {0}")]
    Io(#[source] std::io::Error),
}
