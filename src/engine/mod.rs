//! Traffic classification: which connections are decrypted and what
//! happens to each intercepted request.

mod classifier;
mod hooks;
mod rewrite;
mod router;
mod verdict;

pub use classifier::{DomainClassifier, Interception};
pub use hooks::{Engine, RequestContext, RequestDecision, TunnelDecision};
pub use rewrite::rewrite;
pub use router::RequestRouter;
pub use verdict::Verdict;
