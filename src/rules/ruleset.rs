use std::collections::HashSet;

use url::Url;

use super::config::{EndpointConfig, RuleConfig, RulesError};

/// Destination of a redirect: a plain-HTTP local service.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    domain: String,
    port: u16,
    /// `http://domain:port/`, parsed once so rewriting cannot fail.
    base: Url,
}

impl Endpoint {
    pub fn new(domain: &str, port: u16) -> Result<Self, RulesError> {
        let invalid = |reason: String| RulesError::InvalidEndpoint {
            name: "endpoint",
            reason,
        };
        if domain.is_empty() || domain.contains(['/', '?', '#', '@']) {
            return Err(invalid(format!("bad domain {:?}", domain)));
        }
        let base = Url::parse(&format!("http://{}:{}/", domain, port))
            .map_err(|e| invalid(format!("{}:{} is not a valid authority: {}", domain, port, e)))?;
        Ok(Self {
            domain: domain.to_string(),
            port,
            base,
        })
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.domain, self.port)
    }
}

/// One redirect target together with the path substrings that select it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointRule {
    endpoint: Endpoint,
    triggers: Vec<String>,
}

impl EndpointRule {
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn triggers(&self) -> &[String] {
        &self.triggers
    }

    /// True if any trigger occurs anywhere in `path`. Case-sensitive
    /// substring containment, not segment matching.
    pub fn matches(&self, path: &str) -> bool {
        self.triggers.iter().any(|t| path.contains(t.as_str()))
    }
}

impl EndpointRule {
    fn compile(name: &'static str, config: &EndpointConfig) -> Result<Self, RulesError> {
        let endpoint = Endpoint::new(&config.domain, config.port).map_err(|e| match e {
            RulesError::InvalidEndpoint { reason, .. } => {
                RulesError::InvalidEndpoint { name, reason }
            }
            other => other,
        })?;
        Ok(Self {
            endpoint,
            triggers: config.triggers.clone(),
        })
    }
}

/// Immutable, validated snapshot of every routing rule.
///
/// Never mutated after construction; a reload builds a new one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleSet {
    proxy_port: u16,
    dispatch: EndpointRule,
    sdk: EndpointRule,
    /// Lowercased host suffixes.
    always_ignore_domains: Vec<String>,
    /// Lowercased host suffixes.
    redirect_domains: Vec<String>,
    /// Block paths as configured.
    block_paths: Vec<String>,
    /// Lowercased block paths for exact case-insensitive lookup.
    block_index: HashSet<String>,
}

impl RuleSet {
    /// Validates `config` and compiles it into a snapshot.
    pub fn from_config(config: &RuleConfig) -> Result<Self, RulesError> {
        config.validate()?;

        let lower = |items: &[String]| -> Vec<String> {
            items.iter().map(|s| s.to_ascii_lowercase()).collect()
        };

        Ok(Self {
            proxy_port: config.proxy_port,
            dispatch: EndpointRule::compile("Dispatch", &config.dispatch)?,
            sdk: EndpointRule::compile("SDK", &config.sdk)?,
            always_ignore_domains: lower(&config.always_ignore_domains),
            redirect_domains: lower(&config.redirect_domains),
            block_paths: config.block_urls.clone(),
            block_index: config.block_urls.iter().map(|p| p.to_lowercase()).collect(),
        })
    }

    pub fn proxy_port(&self) -> u16 {
        self.proxy_port
    }

    pub fn dispatch(&self) -> &EndpointRule {
        &self.dispatch
    }

    pub fn sdk(&self) -> &EndpointRule {
        &self.sdk
    }

    /// Endpoint rules in matching priority order: Dispatch, then SDK.
    pub fn endpoints(&self) -> [&EndpointRule; 2] {
        [&self.dispatch, &self.sdk]
    }

    pub fn block_paths(&self) -> &[String] {
        &self.block_paths
    }

    /// `host` must already be lowercase and without a port.
    pub fn is_ignored_domain(&self, host: &str) -> bool {
        self.always_ignore_domains
            .iter()
            .any(|suffix| host.ends_with(suffix.as_str()))
    }

    /// `host` must already be lowercase and without a port.
    pub fn is_redirect_domain(&self, host: &str) -> bool {
        self.redirect_domains
            .iter()
            .any(|suffix| host.ends_with(suffix.as_str()))
    }

    pub fn is_blocked_path(&self, path: &str) -> bool {
        !self.block_index.is_empty() && self.block_index.contains(&path.to_lowercase())
    }

    pub(crate) fn with_proxy_port(mut self, port: u16) -> Self {
        self.proxy_port = port;
        self
    }
}
