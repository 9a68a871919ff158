use crate::rules::RuleSet;

/// Whether a connection is decrypted for inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interception {
    Ignore,
    Decrypt,
}

/// Host-only decision over a rule snapshot.
pub struct DomainClassifier;

impl DomainClassifier {
    /// Classifies `host`, which may carry a `:port` suffix.
    ///
    /// Ignore suffixes win over redirect suffixes; anything matching neither
    /// is ignored.
    pub fn classify(rules: &RuleSet, host: &str) -> Interception {
        let host = normalize_host(host);

        if rules.is_ignored_domain(&host) {
            return Interception::Ignore;
        }
        if rules.is_redirect_domain(&host) {
            return Interception::Decrypt;
        }
        Interception::Ignore
    }
}

/// Drops everything from the first `:` and lowercases the rest.
pub(crate) fn normalize_host(host: &str) -> String {
    let host = match host.split_once(':') {
        Some((name, _port)) => name,
        None => host,
    };
    host.to_ascii_lowercase()
}
