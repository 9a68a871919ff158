//! Client-facing TLS termination for intercepted tunnels.

use std::sync::Arc;

use rustls::ServerConfig;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::server::TlsStream;
use tracing::{debug, error};

use crate::ca::CertCache;

/// Terminates TLS on an intercepted tunnel, impersonating its host.
#[derive(Clone)]
pub struct TlsAcceptor {
    cert_cache: Arc<CertCache>,
}

impl TlsAcceptor {
    pub fn new(cert_cache: Arc<CertCache>) -> Self {
        Self { cert_cache }
    }

    /// Builds a server config that issues certificates for the client's
    /// SNI, falling back to the CONNECT host when the client sends none.
    fn config_for(&self, fallback_host: &str) -> Arc<ServerConfig> {
        let resolver = Arc::new(CertResolver {
            cache: Arc::clone(&self.cert_cache),
            fallback_host: fallback_host.to_string(),
        });
        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_cert_resolver(resolver);
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        Arc::new(config)
    }

    /// Performs the handshake with the client on `stream`.
    pub async fn accept<S>(&self, stream: S, host: &str) -> Result<TlsStream<S>, std::io::Error>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let acceptor = tokio_rustls::TlsAcceptor::from(self.config_for(host));
        let tls_stream = acceptor.accept(stream).await?;

        debug!(
            "client TLS established for {} (SNI: {:?})",
            host,
            tls_stream.get_ref().1.server_name()
        );

        Ok(tls_stream)
    }
}

struct CertResolver {
    cache: Arc<CertCache>,
    fallback_host: String,
}

impl std::fmt::Debug for CertResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertResolver")
            .field("fallback_host", &self.fallback_host)
            .finish_non_exhaustive()
    }
}

impl rustls::server::ResolvesServerCert for CertResolver {
    fn resolve(
        &self,
        client_hello: rustls::server::ClientHello<'_>,
    ) -> Option<Arc<rustls::sign::CertifiedKey>> {
        let host = client_hello.server_name().unwrap_or(&self.fallback_host);
        match self.cache.get_or_create(host) {
            Ok(key) => Some(key),
            Err(e) => {
                error!("failed to issue certificate for {}: {}", host, e);
                None
            }
        }
    }
}
