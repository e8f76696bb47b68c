use std::path::Path;
use std::time::Duration;
use serde::Deserialize;
use anyhow::{Context, Result};
use service_search::{CloudProviderConfig, MdnsProviderConfig, SearchConfig};
use shared::protocol::SERVICE_TYPE;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub search: SearchSection,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub cloud: CloudConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchSection {
    /// Only look for this service id
    pub target_id: Option<String>,
    /// Restrict mDNS to one network interface
    pub interface: Option<String>,
    #[serde(default = "default_service_type")]
    pub service_type: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_descriptor")]
    pub descriptor_secs: u64,
    #[serde(default = "default_probe")]
    pub probe_secs: u64,
    #[serde(default = "default_resolve")]
    pub resolve_secs: u64,
    #[serde(default = "default_resolve_retry")]
    pub resolve_retry_secs: u64,
    #[serde(default = "default_browse_restart")]
    pub browse_restart_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CloudConfig {
    #[serde(default)]
    pub enabled: bool,
    pub directory_url: Option<String>,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
}

fn default_service_type() -> String {
    SERVICE_TYPE.to_string()
}

fn default_descriptor() -> u64 {
    5
}

fn default_probe() -> u64 {
    5
}

fn default_resolve() -> u64 {
    2
}

fn default_resolve_retry() -> u64 {
    15
}

fn default_browse_restart() -> u64 {
    1
}

fn default_poll_interval() -> u64 {
    30
}

fn default_listen() -> String {
    "[::]:8054".to_string()
}

impl Default for SearchSection {
    fn default() -> Self {
        Self {
            target_id: None,
            interface: None,
            service_type: default_service_type(),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            descriptor_secs: default_descriptor(),
            probe_secs: default_probe(),
            resolve_secs: default_resolve(),
            resolve_retry_secs: default_resolve_retry(),
            browse_restart_secs: default_browse_restart(),
        }
    }
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            directory_url: None,
            poll_interval_secs: default_poll_interval(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        if config.cloud.enabled && config.cloud.directory_url.is_none() {
            anyhow::bail!("cloud.enabled requires cloud.directory_url");
        }
        Ok(config)
    }

    pub fn search_config(&self) -> SearchConfig {
        SearchConfig {
            descriptor_timeout: Duration::from_secs(self.timeouts.descriptor_secs),
            probe_timeout: Duration::from_secs(self.timeouts.probe_secs),
        }
    }

    pub fn mdns_config(&self) -> MdnsProviderConfig {
        MdnsProviderConfig {
            service_type: self.search.service_type.clone(),
            resolve_timeout: Duration::from_secs(self.timeouts.resolve_secs),
            retry_timeout: Duration::from_secs(self.timeouts.resolve_retry_secs),
            restart_delay: Duration::from_secs(self.timeouts.browse_restart_secs),
            ..MdnsProviderConfig::default()
        }
    }

    pub fn cloud_config(&self) -> CloudProviderConfig {
        CloudProviderConfig {
            poll_interval: Duration::from_secs(self.cloud.poll_interval_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse("").unwrap();

        assert_eq!(config.search.service_type, "_samsungmsf._tcp.local.");
        assert!(config.search.target_id.is_none());
        assert_eq!(config.api.listen, "[::]:8054");
        assert!(!config.cloud.enabled);

        let search = config.search_config();
        assert_eq!(search.descriptor_timeout, Duration::from_secs(5));
        assert_eq!(search.probe_timeout, Duration::from_secs(5));

        let mdns = config.mdns_config();
        assert_eq!(mdns.resolve_timeout, Duration::from_secs(2));
        assert_eq!(mdns.retry_timeout, Duration::from_secs(15));
        assert_eq!(mdns.restart_delay, Duration::from_secs(1));
        assert!(mdns.auto_restart);
    }

    #[test]
    fn test_partial_sections() {
        let config = Config::parse(
            r#"
            [search]
            target_id = "tv-42"
            interface = "eth0"

            [timeouts]
            descriptor_secs = 3

            [cloud]
            enabled = true
            directory_url = "https://directory.example/services"
            "#,
        )
        .unwrap();

        assert_eq!(config.search.target_id.as_deref(), Some("tv-42"));
        assert_eq!(config.search.interface.as_deref(), Some("eth0"));
        assert_eq!(config.timeouts.descriptor_secs, 3);
        assert_eq!(config.timeouts.probe_secs, 5);
        assert_eq!(config.cloud_config().poll_interval, Duration::from_secs(30));
    }

    #[test]
    fn test_cloud_requires_directory_url() {
        assert!(Config::parse("[cloud]\nenabled = true\n").is_err());
    }
}
