use crate::rules::RuleSet;

use super::verdict::Verdict;

/// Path-based decision for requests on an intercepted connection.
pub struct RequestRouter;

impl RequestRouter {
    /// Routes `path` (without query or fragment).
    ///
    /// Block paths are checked first, then endpoints in priority order
    /// (Dispatch before SDK). Anything left over is blackholed: an
    /// in-scope request nobody claims must never reach the real host.
    pub fn route(rules: &RuleSet, path: &str) -> Verdict {
        if rules.is_blocked_path(path) {
            return Verdict::Block;
        }

        for rule in rules.endpoints() {
            if rule.matches(path) {
                return Verdict::Redirect(rule.endpoint().clone());
            }
        }

        Verdict::Blackhole
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{Endpoint, RuleConfig};

    fn rules() -> RuleSet {
        RuleSet::from_config(&RuleConfig::default()).unwrap()
    }

    fn redirect(port: u16) -> Verdict {
        Verdict::Redirect(Endpoint::new("localhost", port).unwrap())
    }

    #[test]
    fn block_path() {
        assert_eq!(RequestRouter::route(&rules(), "/sdk/upload"), Verdict::Block);
        assert_eq!(RequestRouter::route(&rules(), "/LOG"), Verdict::Block);
    }

    /// Tests that a blocked path is blocked even though it contains an
    /// SDK trigger ("combo").
    #[test]
    fn block_precedes_triggers() {
        assert_eq!(
            RequestRouter::route(&rules(), "/combo/box/api/config/sdk/combo"),
            Verdict::Block
        );
    }

    #[test]
    fn dispatch_trigger_redirects() {
        assert_eq!(
            RequestRouter::route(&rules(), "/query_dispatch/rail"),
            redirect(21000)
        );
        assert_eq!(
            RequestRouter::route(&rules(), "/query_gateway"),
            redirect(21000)
        );
    }

    #[test]
    fn sdk_trigger_redirects() {
        assert_eq!(
            RequestRouter::route(&rules(), "/hkrpg_global/mdk/shield/api/verify"),
            redirect(20100)
        );
    }

    /// Tests that Dispatch wins when both endpoints' triggers match.
    #[test]
    fn dispatch_wins_overlap() {
        assert_eq!(
            RequestRouter::route(&rules(), "/account/query_dispatch"),
            redirect(21000)
        );
    }

    #[test]
    fn unknown_path_blackholed() {
        assert_eq!(
            RequestRouter::route(&rules(), "/unknown/endpoint"),
            Verdict::Blackhole
        );
        assert_eq!(RequestRouter::route(&rules(), "/"), Verdict::Blackhole);
    }

    /// Tests that endpoints without triggers never match.
    #[test]
    fn empty_trigger_lists_blackhole() {
        let mut config = RuleConfig::default();
        config.dispatch.triggers.clear();
        config.sdk.triggers.clear();
        let rules = RuleSet::from_config(&config).unwrap();
        assert_eq!(
            RequestRouter::route(&rules, "/query_dispatch"),
            Verdict::Blackhole
        );
    }
}
