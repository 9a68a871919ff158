mod config;
mod ruleset;
mod store;

pub use config::{EndpointConfig, RuleConfig, RulesError};
pub use ruleset::{Endpoint, EndpointRule, RuleSet};
pub use store::RuleStore;
