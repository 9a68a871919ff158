//! Intercepting forward proxy that classifies game client traffic.
//!
//! Clients point their HTTP proxy at this service. Each CONNECT target is
//! classified by domain: ignored hosts are relayed opaquely, everything on a
//! redirect domain is decrypted with a certificate issued by a local CA.
//! Decrypted requests are then blocked, redirected to a local dispatch or
//! SDK server, or blackholed.
//!
//! # Architecture
//!
//! ```text
//! config.yaml --(notify)--> RuleStore (ArcSwap<RuleSet>)
//!                               |
//!                            Engine  <-- TunnelDecision / RequestDecision
//!                               |
//!                          ProxyServer --> local endpoint or original host
//! ```
//!
//! # Example
//!
//! ```no_run
//! use hyacine_proxy::{CaState, RuleConfig, RuleSet, Service};
//! use std::path::{Path, PathBuf};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = RuleConfig::load_or_create(Path::new("config.yaml"))?;
//! let ca = CaState::load_or_generate(Path::new("."))?;
//! Service::new(RuleSet::from_config(&config)?, ca)
//!     .with_config_path(PathBuf::from("config.yaml"))
//!     .run()
//!     .await
//! # }
//! ```

pub mod ca;
pub mod config_watcher;
pub mod engine;
pub mod proxy;
pub mod rules;

pub use ca::{CaError, CaState};
pub use engine::{Engine, RequestContext, RequestDecision, TunnelDecision, Verdict};
pub use proxy::{ProxyServer, ProxyState};
pub use rules::{RuleConfig, RuleSet, RuleStore, RulesError};

use anyhow::{Context, Result};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Runs the proxy with hot-reloadable rules.
pub struct Service {
    store: Arc<RuleStore>,
    ca: Arc<CaState>,
    /// Path to the configuration file for hot-reloading.
    config_path: Option<PathBuf>,
    bind_addr: IpAddr,
}

impl Service {
    /// Creates a service listening on all interfaces at the rules' port.
    pub fn new(rules: RuleSet, ca: CaState) -> Self {
        Self {
            store: Arc::new(RuleStore::new(rules)),
            ca: Arc::new(ca),
            config_path: None,
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        }
    }

    /// Watches `path` and reloads the rules when it changes.
    pub fn with_config_path(mut self, path: PathBuf) -> Self {
        self.config_path = Some(path);
        self
    }

    pub fn with_bind_addr(mut self, addr: IpAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    pub fn store(&self) -> &Arc<RuleStore> {
        &self.store
    }

    /// Binds the listener without serving. Port 0 picks an ephemeral port.
    pub async fn bind(&self) -> Result<ProxyServer> {
        let engine = Arc::new(Engine::new(Arc::clone(&self.store)));
        let state = Arc::new(ProxyState::new(
            engine.clone(),
            engine,
            Arc::clone(&self.ca),
        ));

        let addr = SocketAddr::new(self.bind_addr, self.store.proxy_port());
        ProxyServer::bind(state, addr)
            .await
            .with_context(|| format!("failed to bind proxy listener on {}", addr))
    }

    /// Serves until the listener fails or Ctrl-C is received.
    pub async fn run(self) -> Result<()> {
        let server = self.bind().await?;

        // The reloader thread lives for the rest of the process.
        if let Some(path) = &self.config_path {
            match config_watcher::spawn_reloader(Arc::clone(&self.store), path.clone()) {
                Ok(_) => info!("watching {} for changes", path.display()),
                Err(e) => warn!("failed to watch {}: {}", path.display(), e),
            }
        }

        tokio::select! {
            result = server.run() => {
                if let Err(e) = &result {
                    error!("proxy server error: {}", e);
                }
                result.context("proxy server stopped")
            }
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for Ctrl-C")?;
                info!("shutting down");
                Ok(())
            }
        }
    }
}
