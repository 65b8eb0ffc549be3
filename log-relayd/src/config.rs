use std::path::{Path, PathBuf};
use serde::Deserialize;
use anyhow::{Context, Result};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/log-relay/relayd.toml";

/// Environment variables that override file settings
const ENV_PUBLIC_URL: &str = "APP_URL";
const ENV_DB_PATH: &str = "RELAY_DB_PATH";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub streams: StreamsConfig,
    #[serde(default)]
    pub ingress: IngressConfig,
    #[serde(default)]
    pub broadcast: BroadcastConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Externally reachable base URL, used for share links and webhook callbacks
    #[serde(default = "default_public_url")]
    pub public_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// Link lifetime; 0 disables expiry
    #[serde(default = "default_code_ttl")]
    pub code_ttl_secs: u64,
    #[serde(default = "default_reap_interval")]
    pub reap_interval_secs: u64,
    #[serde(default = "default_max_code_attempts")]
    pub max_code_attempts: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RestartPolicy {
    /// Keep persisted subscriptions active after a restart
    Resume,
    /// Delete persisted subscriptions upstream on startup
    Teardown,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamsConfig {
    /// Tear down a link's subscriptions once its last viewer leaves
    #[serde(default = "default_true")]
    pub stop_when_idle: bool,
    #[serde(default = "default_restart_policy")]
    pub on_restart: RestartPolicy,
    /// How long a link may go unwatched before its subscriptions are released
    #[serde(default = "default_idle_grace")]
    pub idle_grace_secs: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IngressConfig {
    /// Deliver batches posted to the bare webhook path to every viewer
    #[serde(default = "default_true")]
    pub untagged_fanout: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BroadcastConfig {
    /// Per-viewer queue depth before lines are dropped for that viewer
    #[serde(default = "default_viewer_buffer")]
    pub viewer_buffer: usize,
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_public_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_db_path() -> PathBuf {
    PathBuf::from("/var/lib/log-relay/codes.db")
}

fn default_code_ttl() -> u64 {
    86400
}

fn default_reap_interval() -> u64 {
    300
}

fn default_max_code_attempts() -> u32 {
    8
}

fn default_api_base() -> String {
    "https://api.render.com/v1".to_string()
}

fn default_timeout() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

fn default_restart_policy() -> RestartPolicy {
    RestartPolicy::Resume
}

fn default_idle_grace() -> u64 {
    120
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_viewer_buffer() -> usize {
    256
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            public_url: default_public_url(),
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            code_ttl_secs: default_code_ttl(),
            reap_interval_secs: default_reap_interval(),
            max_code_attempts: default_max_code_attempts(),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            timeout_secs: default_timeout(),
        }
    }
}

impl Default for StreamsConfig {
    fn default() -> Self {
        Self {
            stop_when_idle: default_true(),
            on_restart: default_restart_policy(),
            idle_grace_secs: default_idle_grace(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl Default for IngressConfig {
    fn default() -> Self {
        Self {
            untagged_fanout: default_true(),
        }
    }
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            viewer_buffer: default_viewer_buffer(),
        }
    }
}

impl ServerConfig {
    /// Public base URL without a trailing slash
    pub fn base_url(&self) -> &str {
        self.public_url.trim_end_matches('/')
    }
}

impl RegistryConfig {
    pub fn code_ttl(&self) -> Option<chrono::Duration> {
        (self.code_ttl_secs > 0).then(|| chrono::Duration::seconds(self.code_ttl_secs as i64))
    }
}

impl StreamsConfig {
    /// Grace period for unwatched links; `None` keeps them subscribed
    pub fn idle_grace(&self) -> Option<chrono::Duration> {
        self.stop_when_idle
            .then(|| chrono::Duration::seconds(self.idle_grace_secs as i64))
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
        Ok(config)
    }

    /// Resolve the config for startup: an explicit path must exist, the default
    /// path may be absent. Environment overrides are applied last.
    pub fn resolve(explicit: Option<&str>) -> Result<Self> {
        let mut config = match explicit {
            Some(path) => Self::load(path)?,
            None if Path::new(DEFAULT_CONFIG_PATH).exists() => Self::load(DEFAULT_CONFIG_PATH)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup(ENV_PUBLIC_URL).filter(|v| !v.is_empty()) {
            self.server.public_url = url;
        }
        if let Some(path) = lookup(ENV_DB_PATH).filter(|v| !v.is_empty()) {
            self.registry.db_path = PathBuf::from(path);
        }
    }
}
