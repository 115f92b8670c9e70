use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use kite_agents::{OptionsError, PrefixPair, ProducerOptions, RendezvousOptions, RetryPolicy};
use kite_network::Name;
use kite_network::serde_helpers::duration_ms;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Application configuration stored at `~/.kite/config.toml`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KiteConfig {
    pub logging: LoggingConfig,
    pub network: NetworkConfig,
    pub producer: ProducerConfig,
    pub rendezvous: RendezvousConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Used when `RUST_LOG` is not set.
    pub filter: String,
    /// Also write daily-rotated log files.
    pub to_file: bool,
    /// Log directory; `~/.kite/logs` when unset.
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address the forwarder listens on and the agents connect to.
    pub forwarder_addr: String,
    /// Key chain file; `~/.kite/keychain.json` when unset.
    pub keychain_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProducerConfig {
    #[serde(rename = "update_interval_ms", with = "duration_ms")]
    pub update_interval: Duration,
    #[serde(rename = "request_lifetime_ms", with = "duration_ms")]
    pub request_lifetime: Duration,
    pub auto_renew: bool,
    /// Ordered prefix pairs; the first one is active.
    pub prefix_pairs: Vec<PrefixPair>,
    pub retry: RetryPolicy,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RendezvousConfig {
    /// Ordered rendezvous prefixes; the first one is active.
    pub prefixes: Vec<Name>,
    /// TOML trust policy applied to update requests.
    pub trust_policy: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info,kite_app=debug,kite_agents=debug,kite_network=info".into(),
            to_file: false,
            dir: None,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            forwarder_addr: "127.0.0.1:6363".into(),
            keychain_path: None,
        }
    }
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            update_interval: kite_agents::options::DEFAULT_UPDATE_INTERVAL,
            request_lifetime: kite_agents::options::DEFAULT_REQUEST_LIFETIME,
            auto_renew: true,
            prefix_pairs: Vec::new(),
            retry: RetryPolicy::default(),
        }
    }
}

impl ProducerConfig {
    /// Build agent options, with `pairs` taking precedence over the
    /// configured list.
    pub fn to_options(&self, pairs: Vec<PrefixPair>) -> Result<ProducerOptions, OptionsError> {
        let pairs = if pairs.is_empty() {
            self.prefix_pairs.clone()
        } else {
            pairs
        };
        let options = ProducerOptions::from_pairs(pairs)?
            .with_update_interval(self.update_interval)
            .with_request_lifetime(self.request_lifetime)
            .with_auto_renew(self.auto_renew)
            .with_retry(self.retry.clone());
        options.validate()?;
        Ok(options)
    }
}

impl RendezvousConfig {
    pub fn to_options(&self, prefix: Option<Name>) -> Result<RendezvousOptions, OptionsError> {
        match prefix {
            Some(prefix) => RendezvousOptions::from_prefixes(std::iter::once(prefix)),
            None => RendezvousOptions::from_prefixes(self.prefixes.clone()),
        }
    }
}

impl KiteConfig {
    /// Returns the base config directory: `~/.kite/`
    pub fn base_dir() -> Result<PathBuf> {
        let home = dirs::home_dir().context("Could not determine home directory")?;
        Ok(home.join(".kite"))
    }

    /// Returns the config file path: `~/.kite/config.toml`
    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::base_dir()?.join("config.toml"))
    }

    pub fn logs_dir(&self) -> Result<PathBuf> {
        match &self.logging.dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(Self::base_dir()?.join("logs")),
        }
    }

    pub fn keychain_path(&self) -> Result<PathBuf> {
        match &self.network.keychain_path {
            Some(path) => Ok(path.clone()),
            None => Ok(Self::base_dir()?.join("keychain.json")),
        }
    }

    /// Load from `path`, or from the default location when `None`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load_from_path(path),
            None => Self::load_from_path(&Self::config_path()?),
        }
    }

    /// Load config from a specific file path, writing the defaults there if
    /// the file does not exist yet.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config: {}", path.display()))?;
            let config: Self = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config: {}", path.display()))?;
            Ok(config)
        } else {
            let config = Self::default();
            config.save_to_path(path)?;
            info!("Created default config at {}", path.display());
            Ok(config)
        }
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config: {}", path.display()))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
