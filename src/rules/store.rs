//! Hot-reloadable holder of the active [`RuleSet`].
//!
//! ```text
//! classify/route -> RuleStore::current() -> ArcSwap::load_full() -> Arc<RuleSet>
//!                                                 |
//!                                          (lock-free read)
//!
//! reload         -> RuleStore::replace() -> ArcSwap::store()     -> old snapshot dropped
//!                                                 |                 when its readers finish
//!                                           (atomic swap)
//! ```

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use arc_swap::ArcSwap;
use tracing::info;

use super::config::{RuleConfig, RulesError};
use super::ruleset::RuleSet;

/// Single-writer, multi-reader store for the current rule snapshot.
pub struct RuleStore {
    active: ArcSwap<RuleSet>,
    /// Port the listener was bound with; reloads cannot change it.
    proxy_port: u16,
    generation: AtomicU64,
}

impl std::fmt::Debug for RuleStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleStore")
            .field("proxy_port", &self.proxy_port)
            .field("generation", &self.generation())
            .finish_non_exhaustive()
    }
}

impl RuleStore {
    /// Creates a store from the startup snapshot and pins its port.
    pub fn new(rules: RuleSet) -> Self {
        let proxy_port = rules.proxy_port();
        Self {
            active: ArcSwap::from_pointee(rules),
            proxy_port,
            generation: AtomicU64::new(0),
        }
    }

    /// Returns the active snapshot. The caller keeps a consistent view for
    /// as long as it holds the `Arc`, regardless of later reloads.
    pub fn current(&self) -> Arc<RuleSet> {
        self.active.load_full()
    }

    /// The port fixed at startup.
    pub fn proxy_port(&self) -> u16 {
        self.proxy_port
    }

    /// Number of snapshots installed since startup.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Installs `rules` as the active snapshot, keeping the startup port.
    pub fn replace(&self, rules: RuleSet) {
        let rules = if rules.proxy_port() != self.proxy_port {
            info!(
                "ignoring proxy port change {} -> {} (restart required)",
                self.proxy_port,
                rules.proxy_port()
            );
            rules.with_proxy_port(self.proxy_port)
        } else {
            rules
        };

        self.active.store(Arc::new(rules));
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Parses, validates and installs a fully read configuration file.
    /// On error the active snapshot is left untouched.
    pub fn reload(&self, bytes: &[u8]) -> Result<Arc<RuleSet>, RulesError> {
        let config = RuleConfig::from_bytes(bytes)?;
        let rules = RuleSet::from_config(&config)?;
        self.replace(rules);
        Ok(self.current())
    }

    /// Reads `path` in full and reloads from its contents.
    pub fn reload_from_path(&self, path: &Path) -> Result<Arc<RuleSet>, RulesError> {
        let bytes = fs::read(path)?;
        self.reload(&bytes)
    }
}
