use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum RulesError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("config file is not valid UTF-8")]
    Encoding(#[from] std::str::Utf8Error),
    #[error("invalid endpoint {name}: {reason}")]
    InvalidEndpoint { name: &'static str, reason: String },
    #[error("invalid domain suffix: {0:?}")]
    InvalidDomain(String),
    #[error("invalid block path: {0:?}")]
    InvalidBlockPath(String),
}

/// A local backend that matching requests are redirected to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointConfig {
    #[serde(rename = "Domain", alias = "domain")]
    pub domain: String,
    #[serde(rename = "Port", alias = "port")]
    pub port: u16,
    /// Path substrings that select this endpoint.
    #[serde(
        rename = "RedirectTrigger",
        alias = "redirectTrigger",
        alias = "redirect_trigger",
        alias = "triggers",
        default
    )]
    pub triggers: Vec<String>,
}

impl EndpointConfig {
    fn new(domain: &str, port: u16, triggers: &[&str]) -> Self {
        Self {
            domain: domain.to_string(),
            port,
            triggers: triggers.iter().map(|t| t.to_string()).collect(),
        }
    }

    fn validate(&self, name: &'static str) -> Result<(), RulesError> {
        if self.domain.is_empty() || self.domain.chars().any(|c| c.is_whitespace()) {
            return Err(RulesError::InvalidEndpoint {
                name,
                reason: format!("bad domain {:?}", self.domain),
            });
        }
        if self.port == 0 {
            return Err(RulesError::InvalidEndpoint {
                name,
                reason: "port must be non-zero".to_string(),
            });
        }
        // An empty trigger is a substring of every path.
        if self.triggers.iter().any(|t| t.is_empty()) {
            return Err(RulesError::InvalidEndpoint {
                name,
                reason: "empty redirect trigger".to_string(),
            });
        }
        Ok(())
    }
}

/// Proxy configuration file format.
///
/// Keys are written in PascalCase, matching the files produced by earlier
/// releases. camelCase and snake_case spellings are accepted on read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleConfig {
    /// Listening port. 0 asks the OS for an ephemeral port.
    #[serde(rename = "ProxyPort", alias = "proxyPort", alias = "proxy_port", default)]
    pub proxy_port: u16,

    #[serde(rename = "Dispatch", alias = "dispatch")]
    pub dispatch: EndpointConfig,

    #[serde(rename = "SDK", alias = "Sdk", alias = "sdk")]
    pub sdk: EndpointConfig,

    /// Host suffixes that are never decrypted, even if they are also
    /// listed in `redirect_domains`.
    #[serde(
        rename = "AlwaysIgnoreDomains",
        alias = "alwaysIgnoreDomains",
        alias = "always_ignore_domains",
        default
    )]
    pub always_ignore_domains: Vec<String>,

    /// Host suffixes whose connections are decrypted and routed.
    #[serde(
        rename = "RedirectDomains",
        alias = "redirectDomains",
        alias = "redirect_domains",
        default
    )]
    pub redirect_domains: Vec<String>,

    /// Request paths answered with 404 without contacting any backend.
    #[serde(rename = "BlockUrls", alias = "blockUrls", alias = "block_urls", default)]
    pub block_urls: Vec<String>,
}

impl RuleConfig {
    /// Loads config from a YAML (or JSON) file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, RulesError> {
        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parses config from a YAML string.
    pub fn parse(yaml: &str) -> Result<Self, RulesError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Parses config from raw file contents.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, RulesError> {
        Self::parse(std::str::from_utf8(bytes)?)
    }

    /// Loads the config at `path`, writing the default config there first
    /// if the file does not exist yet.
    pub fn load_or_create(path: impl AsRef<Path>) -> Result<Self, RulesError> {
        let path = path.as_ref();
        if !path.exists() {
            info!("config not found: {}", path.display());
            info!("creating new config file with default data");
            let config = Self::default();
            config.save(path)?;
            return Ok(config);
        }
        Self::load(path)
    }

    /// Writes the config as YAML.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), RulesError> {
        let content = serde_yaml::to_string(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    pub(crate) fn validate(&self) -> Result<(), RulesError> {
        self.dispatch.validate("Dispatch")?;
        self.sdk.validate("SDK")?;

        for domain in self
            .always_ignore_domains
            .iter()
            .chain(&self.redirect_domains)
        {
            if domain.is_empty() || domain.chars().any(|c| c.is_whitespace()) {
                return Err(RulesError::InvalidDomain(domain.clone()));
            }
        }

        for path in &self.block_urls {
            if !path.starts_with('/') {
                return Err(RulesError::InvalidBlockPath(path.clone()));
            }
        }

        Ok(())
    }
}

impl Default for RuleConfig {
    fn default() -> Self {
        Self {
            proxy_port: 8081,
            dispatch: EndpointConfig::new(
                "localhost",
                21000,
                &[
                    "query_dispatch",
                    "query_gateway",
                    "query_region_list",
                    "query_cur_region",
                ],
            ),
            sdk: EndpointConfig::new("localhost", 20100, &["account", "mdk", "combo"]),
            always_ignore_domains: to_strings(&[
                "autopatchcn.bhsr.com",
                "autopatchos.starrails.com",
            ]),
            redirect_domains: to_strings(&[
                ".hoyoverse.com",
                ".mihoyo.com",
                ".aliyuncs.com",
                ".bhsr.com",
                ".starrails.com",
            ]),
            block_urls: to_strings(DEFAULT_BLOCK_URLS),
        }
    }
}

/// Telemetry, crash-report and log upload endpoints.
const DEFAULT_BLOCK_URLS: &[&str] = &[
    "/sdk/upload",
    "/sdk/dataUpload",
    "/common/h5log/log/batch",
    "/crash/dataUpload",
    "/crashdump/dataUpload",
    "/client/event/dataUpload",
    "/log",
    "/asm/dataUpload",
    "/sophon/dataUpload",
    "/apm/dataUpload",
    "/2g/dataUpload",
    "/v1/firelog/legacy/log",
    "/h5/upload",
    "/_ts",
    "/perf/config/verify",
    "/ptolemaios_api/api/reportStrategyData",
    "/combo/box/api/config/sdk/combo",
    "/hkrpg_global/combo/granter/api/compareProtocolVersion",
    "/admin/mi18n",
    "/combo/box/api/config/sw/precache",
    "/hkrpg_global/mdk/agreement/api/getAgreementInfos",
    "/device-fp/api/getExtList",
    "/admin/mi18n/plat_os/m09291531181441/m09291531181441-version.json",
    "/admin/mi18n/plat_oversea/m2020030410/m2020030410-version.json",
];

fn to_strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE_CONFIG: &str = r#"
ProxyPort: 9090
Dispatch:
  Domain: 127.0.0.1
  Port: 21000
  RedirectTrigger: [query_dispatch, query_gateway]
SDK:
  Domain: 127.0.0.1
  Port: 20100
  RedirectTrigger: [account]
AlwaysIgnoreDomains:
  - autopatchos.starrails.com
RedirectDomains:
  - .starrails.com
BlockUrls:
  - /sdk/upload
"#;

    /// Tests parsing a complete YAML configuration file with the
    /// PascalCase keys the proxy writes itself.
    #[test]
    fn parse_example_config() {
        let config = RuleConfig::parse(EXAMPLE_CONFIG).unwrap();
        assert_eq!(config.proxy_port, 9090);
        assert_eq!(config.dispatch.domain, "127.0.0.1");
        assert_eq!(config.dispatch.triggers.len(), 2);
        assert_eq!(config.sdk.port, 20100);
        assert_eq!(config.redirect_domains, vec![".starrails.com"]);
        assert_eq!(config.block_urls, vec!["/sdk/upload"]);
    }

    /// Tests that a JSON config written by earlier releases, with its
    /// lower-case keys, is read by the YAML parser.
    #[test]
    fn parse_json_camel_case() {
        let json = r#"{
  "proxyPort": 8081,
  "dispatch": { "domain": "localhost", "port": 21000, "redirectTrigger": ["query_dispatch"] },
  "sdk": { "domain": "localhost", "port": 20100, "redirectTrigger": ["mdk"] },
  "alwaysIgnoreDomains": [],
  "redirectDomains": [".mihoyo.com"],
  "blockUrls": ["/log"]
}"#;
        let config = RuleConfig::parse(json).unwrap();
        assert_eq!(config.proxy_port, 8081);
        assert_eq!(config.sdk.triggers, vec!["mdk"]);
        assert!(config.always_ignore_domains.is_empty());
    }

    /// Tests that the seed data matches what the proxy has always shipped.
    #[test]
    fn default_seed_data() {
        let config = RuleConfig::default();
        assert_eq!(config.proxy_port, 8081);
        assert_eq!(config.dispatch.domain, "localhost");
        assert_eq!(config.dispatch.port, 21000);
        assert_eq!(
            config.dispatch.triggers,
            vec![
                "query_dispatch",
                "query_gateway",
                "query_region_list",
                "query_cur_region"
            ]
        );
        assert_eq!(config.sdk.port, 20100);
        assert_eq!(config.sdk.triggers, vec!["account", "mdk", "combo"]);
        assert_eq!(config.redirect_domains.len(), 5);
        assert_eq!(config.always_ignore_domains.len(), 2);
        assert_eq!(config.block_urls.len(), 24);
        assert!(config.validate().is_ok());
    }

    /// Tests that the default config survives a save and load cycle.
    #[test]
    fn load_or_create_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");

        let created = RuleConfig::load_or_create(&path).unwrap();
        assert!(path.exists());
        assert_eq!(created, RuleConfig::default());

        let loaded = RuleConfig::load_or_create(&path).unwrap();
        assert_eq!(loaded, created);
    }

    /// Tests that an empty trigger is rejected, since it would redirect
    /// every request on a decrypted connection.
    #[test]
    fn empty_trigger_rejected() {
        let yaml = EXAMPLE_CONFIG.replace("[account]", "[account, \"\"]");
        assert!(matches!(
            RuleConfig::parse(&yaml),
            Err(RulesError::InvalidEndpoint { name: "SDK", .. })
        ));
    }

    #[test]
    fn missing_endpoint_rejected() {
        assert!(matches!(
            RuleConfig::parse("ProxyPort: 8081\n"),
            Err(RulesError::Parse(_))
        ));
    }

    #[test]
    fn relative_block_path_rejected() {
        let yaml = EXAMPLE_CONFIG.replace("- /sdk/upload", "- sdk/upload");
        assert!(matches!(
            RuleConfig::parse(&yaml),
            Err(RulesError::InvalidBlockPath(_))
        ));
    }
}
