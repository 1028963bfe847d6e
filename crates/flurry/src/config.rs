use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::warn;
use url::Url;

use proxy_core::NatType;

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub nat: NatType,
}

#[derive(Debug, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_broker_url")]
    pub url: String,
    #[serde(default = "default_proxy_type")]
    pub proxy_type: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: default_broker_url(),
            proxy_type: default_proxy_type(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_relay_url")]
    pub url: String,
    #[serde(default = "default_relay_pattern")]
    pub allowed_pattern: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            url: default_relay_url(),
            allowed_pattern: default_relay_pattern(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct LimitsConfig {
    /// Bytes per second; absent means unlimited.
    #[serde(default)]
    pub rate_bytes_per_sec: Option<u64>,
    /// Concurrent client cap; absent keeps the adaptive default.
    #[serde(default)]
    pub max_clients: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// JSON-lines activity log; absent disables file logging.
    #[serde(default)]
    pub event_log: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            event_log: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Default-value functions used by serde
// ---------------------------------------------------------------------------

fn default_broker_url() -> String {
    "snowflake-broker.freehaven.net".to_string()
}

fn default_proxy_type() -> String {
    "standalone".to_string()
}

fn default_relay_url() -> String {
    "wss://snowflake.freehaven.net".to_string()
}

fn default_relay_pattern() -> String {
    "snowflake.torproject.net".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load configuration from a YAML file.
///
/// If the file does not exist a default configuration is returned and a
/// warning is emitted, so a volunteer can start the proxy without writing
/// any configuration at all.
pub fn load(path: &Path) -> anyhow::Result<Config> {
    if !path.exists() {
        warn!(
            path = %path.display(),
            "configuration file not found; using defaults"
        );
        return Ok(Config::default());
    }

    let contents = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read config file {}: {e}", path.display()))?;

    let config: Config = serde_yml::from_str(&contents)
        .map_err(|e| anyhow::anyhow!("failed to parse config file {}: {e}", path.display()))?;

    Ok(config)
}

/// Translate the file configuration into the core's runtime parameters.
pub fn to_core(config: &Config) -> anyhow::Result<proxy_core::Config> {
    let relay_url = Url::parse(&config.relay.url)
        .map_err(|e| anyhow::anyhow!("invalid relay URL '{}': {e}", config.relay.url))?;

    let mut core = proxy_core::Config {
        broker_url: config.broker.url.clone(),
        relay_url,
        allowed_relay_pattern: config.relay.allowed_pattern.clone(),
        rate_limit_bytes: config.limits.rate_bytes_per_sec,
        proxy_type: config.broker.proxy_type.clone(),
        nat: config.nat,
        ..proxy_core::Config::default()
    };
    if let Some(max_clients) = config.limits.max_clients {
        core.max_clients = max_clients;
    }
    Ok(core)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_translate_to_valid_core_config() {
        let core = to_core(&Config::default()).expect("translates");
        core.validate().expect("valid");
        assert_eq!(core.broker_url, "snowflake-broker.freehaven.net");
        assert_eq!(core.relay_url.as_str(), "wss://snowflake.freehaven.net/");
        assert_eq!(core.nat, NatType::Unknown);
    }

    #[test]
    fn parses_a_partial_file() {
        let yaml = "\
broker:
  url: localhost:8080
limits:
  rate_bytes_per_sec: 1048576
nat: unrestricted
";
        let config: Config = serde_yml::from_str(yaml).expect("parses");
        assert_eq!(config.broker.url, "localhost:8080");
        assert_eq!(config.limits.rate_bytes_per_sec, Some(1_048_576));
        assert_eq!(config.nat, NatType::Unrestricted);
        // Unspecified sections fall back to defaults.
        assert_eq!(config.relay.allowed_pattern, "snowflake.torproject.net");
    }

    #[test]
    fn rejects_a_bad_relay_url() {
        let config = Config {
            relay: RelayConfig {
                url: "not a url".to_string(),
                allowed_pattern: default_relay_pattern(),
            },
            ..Config::default()
        };
        assert!(to_core(&config).is_err());
    }
}
