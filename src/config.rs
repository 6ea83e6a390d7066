//! TOML configuration.
//!
//! ```toml
//! [source]
//! default_url = "https://raw.githubusercontent.com/acme/datos/main/data/SPSA.csv"
//!
//! [fetch]
//! timeout_secs = 30
//! direct_retries = 1
//! backoff_ms = 500
//! relays = ["https://corsproxy.io/?{url}", "https://api.allorigins.win/raw?url={url}"]
//!
//! [poll]
//! interval_secs = 300
//!
//! [poll.window]
//! days = ["Mon", "Tue", "Wed", "Thu", "Fri", "Sat"]
//! start_hour = 8
//! end_hour = 20
//!
//! [state]
//! dir = "./.stk"
//!
//! [users]
//! url = "https://raw.githubusercontent.com/acme/datos/main/data/json/users.json"
//!
//! [views]
//! overstock_threshold = 50
//! ranking_limit = 15
//! ```
//!
//! Every section is optional. [`Config::minimal`] yields the defaults.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::poller::PollWindow;
use crate::resolve::DEFAULT_API_BASE;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub poll: PollConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub users: UsersConfig,
    #[serde(default)]
    pub views: ViewsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    /// Built-in source used when no custom source is persisted.
    #[serde(default = "default_source_url")]
    pub default_url: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            default_url: default_source_url(),
        }
    }
}

fn default_source_url() -> String {
    "./SPSA.csv".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct FetchConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Extra attempts for the direct fetcher on network errors, 429, or 5xx.
    #[serde(default = "default_direct_retries")]
    pub direct_retries: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    /// Relay templates tried in order after the direct fetch. `{url}` is
    /// replaced with the percent-encoded target.
    #[serde(default = "default_relays")]
    pub relays: Vec<String>,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            direct_retries: default_direct_retries(),
            backoff_ms: default_backoff_ms(),
            relays: default_relays(),
        }
    }
}

impl FetchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

fn default_timeout_secs() -> u64 {
    30
}
fn default_direct_retries() -> u32 {
    1
}
fn default_backoff_ms() -> u64 {
    500
}
fn default_relays() -> Vec<String> {
    vec![
        "https://corsproxy.io/?{url}".to_string(),
        "https://api.allorigins.win/raw?url={url}".to_string(),
    ]
}

#[derive(Debug, Deserialize, Clone)]
pub struct PollConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Base URL of the GitHub REST API used for version tokens.
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default)]
    pub window: Option<PollWindow>,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            api_base: default_api_base(),
            window: None,
        }
    }
}

impl PollConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

fn default_interval_secs() -> u64 {
    300
}
fn default_api_base() -> String {
    DEFAULT_API_BASE.to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct StateConfig {
    /// Directory holding `settings.json` (durable) and `session.json`.
    #[serde(default = "default_state_dir")]
    pub dir: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            dir: default_state_dir(),
        }
    }
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("./.stk")
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct UsersConfig {
    /// JSON array of `{username, pass, role}`. Without it only the cached
    /// list and the built-in seed are available.
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ViewsConfig {
    #[serde(default = "default_overstock_threshold")]
    pub overstock_threshold: f64,
    #[serde(default = "default_ranking_limit")]
    pub ranking_limit: usize,
}

impl Default for ViewsConfig {
    fn default() -> Self {
        Self {
            overstock_threshold: default_overstock_threshold(),
            ranking_limit: default_ranking_limit(),
        }
    }
}

fn default_overstock_threshold() -> f64 {
    50.0
}
fn default_ranking_limit() -> usize {
    15
}

impl Config {
    /// Built-in defaults, used when no config file exists.
    pub fn minimal() -> Self {
        Self::default()
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.source.default_url.trim().is_empty() {
        anyhow::bail!("source.default_url must not be empty");
    }

    if config.fetch.timeout_secs == 0 {
        anyhow::bail!("fetch.timeout_secs must be > 0");
    }
    for relay in &config.fetch.relays {
        if !relay.contains("{url}") {
            anyhow::bail!("fetch.relays entry '{}' must contain a {{url}} placeholder", relay);
        }
    }

    if config.poll.interval_secs == 0 {
        anyhow::bail!("poll.interval_secs must be > 0");
    }
    if let Some(window) = &config.poll.window {
        if window.start_hour > 24 || window.end_hour > 24 {
            anyhow::bail!("poll.window hours must be in [0, 24]");
        }
        if window.start_hour == window.end_hour {
            anyhow::bail!("poll.window start_hour and end_hour must differ");
        }
    }

    if config.views.ranking_limit < 1 {
        anyhow::bail!("views.ranking_limit must be >= 1");
    }

    Ok(())
}
