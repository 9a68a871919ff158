//! Hook points the transport calls into.

use std::sync::Arc;

use http::{HeaderMap, Method};
use tracing::debug;
use url::Url;

use super::classifier::{DomainClassifier, Interception};
use super::router::RequestRouter;
use super::verdict::Verdict;
use crate::rules::RuleStore;

/// Decides whether a CONNECT tunnel is decrypted.
pub trait TunnelDecision: Send + Sync {
    /// `authority` is the CONNECT target, usually `host:port`.
    /// Returns [`Verdict::Decrypt`] or [`Verdict::PassThrough`].
    fn decide_tunnel(&self, authority: &str) -> Verdict;
}

/// Decides what happens to a single HTTP request.
pub trait RequestDecision: Send + Sync {
    fn decide_request(&self, request: &RequestContext<'_>) -> Verdict;
}

/// What the transport knows about a request when it asks for a verdict.
#[derive(Debug, Clone, Copy)]
pub struct RequestContext<'a> {
    pub method: &'a Method,
    /// Absolute URL, including the original scheme and host.
    pub url: &'a Url,
    pub headers: &'a HeaderMap,
}

/// Decision engine over a shared [`RuleStore`].
///
/// Every decision loads the snapshot once and uses only that snapshot, so
/// a concurrent reload is seen either entirely or not at all.
#[derive(Debug, Clone)]
pub struct Engine {
    store: Arc<RuleStore>,
}

impl Engine {
    pub fn new(store: Arc<RuleStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<RuleStore> {
        &self.store
    }
}

impl TunnelDecision for Engine {
    fn decide_tunnel(&self, authority: &str) -> Verdict {
        let rules = self.store.current();
        let verdict = match DomainClassifier::classify(&rules, authority) {
            Interception::Decrypt => Verdict::Decrypt,
            Interception::Ignore => Verdict::PassThrough,
        };
        debug!("tunnel {}: {}", authority, verdict);
        verdict
    }
}

impl RequestDecision for Engine {
    fn decide_request(&self, request: &RequestContext<'_>) -> Verdict {
        let rules = self.store.current();

        // Requests reaching us outside an intercepted scope are not ours
        // to route.
        let in_scope = request
            .url
            .host_str()
            .is_some_and(|host| DomainClassifier::classify(&rules, host) == Interception::Decrypt);
        if !in_scope {
            return Verdict::PassThrough;
        }

        let verdict = RequestRouter::route(&rules, request.url.path());
        debug!("{} {}: {}", request.method, request.url, verdict);
        verdict
    }
}
