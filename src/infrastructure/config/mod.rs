//! Configuration management

use serde::{Deserialize, Serialize};
use std::collections::{HashSet, BTreeMap};
use std::path::PathBuf;
use std::time::Duration;
use crate::application::errors::ConfigError;

/// Global configuration document
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    /// Prefix of the built-in command surface
    #[serde(default = "default_prefix")]
    pub prefix: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Users granted level 6 on every account
    #[serde(default)]
    pub maintainers: Vec<String>,
    #[serde(default)]
    pub permission: PermissionConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub plugins: PluginsConfig,
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
}

fn default_prefix() -> String {
    "/".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct PermissionConfig {
    /// Activity strictly above this grants level 2
    pub high_activity: u32,
    /// Activity strictly above this grants level 1
    pub low_activity: u32,
}

impl Default for PermissionConfig {
    fn default() -> Self {
        Self {
            high_activity: 50,
            low_activity: 20,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct RuntimeConfig {
    pub restart_delay_ms: u64,
    pub max_restart_delay_ms: u64,
    pub max_restarts: u32,
    /// Uptime after which a unit's restart counter resets
    pub stable_after_ms: u64,
    pub remote_timeout_ms: u64,
    pub shutdown_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            restart_delay_ms: 1_000,
            max_restart_delay_ms: 30_000,
            max_restarts: 5,
            stable_after_ms: 60_000,
            remote_timeout_ms: 10_000,
            shutdown_timeout_ms: 5_000,
            handshake_timeout_ms: 5_000,
        }
    }
}

impl RuntimeConfig {
    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn max_restart_delay(&self) -> Duration {
        Duration::from_millis(self.max_restart_delay_ms)
    }

    pub fn stable_after(&self) -> Duration {
        Duration::from_millis(self.stable_after_ms)
    }

    pub fn remote_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Delay before the `attempt`-th consecutive respawn (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        self.restart_delay()
            .saturating_mul(factor as u32)
            .min(self.max_restart_delay().max(self.restart_delay()))
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct PluginsConfig {
    /// Plugins mounted at startup, in order
    #[serde(default)]
    pub mounted: Vec<String>,
}

/// One chat account
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct AccountConfig {
    pub uin: String,
    #[serde(default)]
    pub masters: Vec<String>,
    #[serde(default = "default_auto_login")]
    pub auto_login: bool,
    #[serde(default)]
    pub connector: ConnectorConfig,
}

fn default_auto_login() -> bool {
    true
}

impl AccountConfig {
    pub fn new(uin: impl Into<String>) -> Self {
        Self {
            uin: uin.into(),
            masters: Vec::new(),
            auto_login: true,
            connector: ConnectorConfig::default(),
        }
    }

    pub fn with_masters(mut self, masters: Vec<String>) -> Self {
        self.masters = masters;
        self
    }
}

/// Connector settings; keys other than `platform` are passed through untouched
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct ConnectorConfig {
    pub platform: String,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            platform: "console".to_string(),
            extra: BTreeMap::new(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
            data_dir: default_data_dir(),
            maintainers: Vec::new(),
            permission: PermissionConfig::default(),
            runtime: RuntimeConfig::default(),
            plugins: PluginsConfig {
                mounted: vec!["dice".to_string()],
            },
            accounts: vec![AccountConfig::new("10001").with_masters(vec!["20001".to_string()])],
        }
    }
}

impl Config {
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let content = std::fs::read_to_string(&path)
            .map_err(|e| ConfigError::Parse(format!("Failed to read config: {}", e)))?;

        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(content)
            .map_err(|e| ConfigError::Parse(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_env() -> Self {
        // Load from environment variables
        let mut config = Config::default();

        if let Ok(prefix) = std::env::var("MESHBOT_PREFIX") {
            config.prefix = prefix;
        }

        if let Ok(dir) = std::env::var("MESHBOT_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }

        config
    }

    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        serde_yaml::to_string(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for account in &self.accounts {
            if account.uin.trim().is_empty() {
                return Err(ConfigError::MissingField("accounts[].uin".to_string()));
            }
            if !seen.insert(account.uin.as_str()) {
                return Err(ConfigError::InvalidValue(format!(
                    "account {} listed twice",
                    account.uin
                )));
            }
        }

        if self.permission.low_activity > self.permission.high_activity {
            return Err(ConfigError::InvalidValue(
                "permission.low-activity must not exceed permission.high-activity".to_string(),
            ));
        }

        let rt = &self.runtime;
        if rt.remote_timeout_ms == 0 || rt.shutdown_timeout_ms == 0 || rt.handshake_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue("runtime timeouts must be non-zero".to_string()));
        }

        Ok(())
    }

    pub fn account(&self, uin: &str) -> Option<&AccountConfig> {
        self.accounts.iter().find(|a| a.uin == uin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_yaml() {
        let config = Config::from_yaml(
            r#"
maintainers: ["1"]
accounts:
  - uin: "10001"
    masters: ["2"]
    connector:
      platform: console
      echo: true
"#,
        )
        .unwrap();

        assert_eq!(config.prefix, "/");
        assert_eq!(config.runtime.remote_timeout_ms, 10_000);
        let account = config.account("10001").unwrap();
        assert!(account.auto_login);
        assert_eq!(account.masters, vec!["2"]);
        assert!(account.connector.extra.contains_key("echo"));
    }

    #[test]
    fn test_duplicate_accounts_rejected() {
        let err = Config::from_yaml(
            r#"
accounts:
  - uin: "1"
  - uin: "1"
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(_)));
    }

    #[test]
    fn test_default_round_trips() {
        let yaml = Config::default().to_yaml().unwrap();
        let parsed = Config::from_yaml(&yaml).unwrap();
        assert_eq!(parsed.plugins.mounted, vec!["dice"]);
        assert_eq!(parsed.accounts.len(), 1);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let rt = RuntimeConfig {
            restart_delay_ms: 100,
            max_restart_delay_ms: 350,
            ..RuntimeConfig::default()
        };
        assert_eq!(rt.backoff(1), Duration::from_millis(100));
        assert_eq!(rt.backoff(2), Duration::from_millis(200));
        assert_eq!(rt.backoff(3), Duration::from_millis(350));
        assert_eq!(rt.backoff(30), Duration::from_millis(350));
    }
}
