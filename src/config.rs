use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Environment variable naming a config file when `--config` is absent.
pub const CONFIG_ENV: &str = "CONFIG_FILE";

/// Config file picked up from the working directory.
const LOCAL_CONFIG: &str = "config.yaml";

/// Commented template written by `ethtop init`.
pub const TEMPLATE: &str = r#"# ethtop configuration

rpc:
  # Beacon node REST endpoint (serves /eth/v1/events).
  http: http://localhost:5052
  # Execution node WebSocket endpoint (eth_subscribe).
  ws: ws://localhost:8546

log:
  path: ethtop.log

# trace, debug, info, warn, error
log_level: info

subscription:
  # Pending slot events buffered before the beacon stream is throttled.
  slot_buffer: 100
  connect_timeout: 10s
  # Beacon stream silent this long is treated as lost.
  idle_timeout: 48s
  backoff_initial: 1s
  backoff_max: 30s

history:
  # Keep only the most recent N epochs. Unset keeps everything.
  retain_epochs: ~
"#;

/// Top-level configuration for ethtop.
#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    /// Node endpoints.
    #[serde(default)]
    pub rpc: RpcConfig,

    /// Log output.
    #[serde(default)]
    pub log: LogConfig,

    /// Logging verbosity (trace, debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Subscription queueing and reconnect behavior.
    #[serde(default)]
    pub subscription: SubscriptionConfig,

    /// Epoch history retention.
    #[serde(default)]
    pub history: HistoryConfig,
}

/// Node endpoints.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct RpcConfig {
    /// Beacon node HTTP endpoint (e.g., "http://localhost:5052").
    #[serde(default)]
    pub http: String,

    /// Execution node WebSocket endpoint (e.g., "ws://localhost:8546").
    #[serde(default)]
    pub ws: String,
}

/// Log output configuration.
#[derive(Debug, Deserialize, Serialize)]
pub struct LogConfig {
    /// Log file path. Default: "ethtop.log".
    #[serde(default = "default_log_path")]
    pub path: PathBuf,
}

/// Subscription queueing and reconnect behavior.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SubscriptionConfig {
    /// Slot events buffered before producers block. Default: 100.
    #[serde(default = "default_slot_buffer")]
    pub slot_buffer: usize,

    /// Time allowed to open a subscription. Default: 10s.
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Silence on the beacon event stream before resubscribing. Default: 48s.
    #[serde(default = "default_idle_timeout", with = "humantime_serde")]
    pub idle_timeout: Duration,

    /// First resubscribe delay. Default: 1s.
    #[serde(default = "default_backoff_initial", with = "humantime_serde")]
    pub backoff_initial: Duration,

    /// Upper bound on the resubscribe delay. Default: 30s.
    #[serde(default = "default_backoff_max", with = "humantime_serde")]
    pub backoff_max: Duration,
}

/// Epoch history retention.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct HistoryConfig {
    /// Number of most recent epochs to keep. Unset keeps all.
    #[serde(default)]
    pub retain_epochs: Option<u64>,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_path() -> PathBuf {
    PathBuf::from("ethtop.log")
}

fn default_slot_buffer() -> usize {
    100
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_idle_timeout() -> Duration {
    Duration::from_secs(48)
}

fn default_backoff_initial() -> Duration {
    Duration::from_secs(1)
}

fn default_backoff_max() -> Duration {
    Duration::from_secs(30)
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            rpc: RpcConfig::default(),
            log: LogConfig::default(),
            log_level: default_log_level(),
            subscription: SubscriptionConfig::default(),
            history: HistoryConfig::default(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            path: default_log_path(),
        }
    }
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            slot_buffer: default_slot_buffer(),
            connect_timeout: default_connect_timeout(),
            idle_timeout: default_idle_timeout(),
            backoff_initial: default_backoff_initial(),
            backoff_max: default_backoff_max(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        Self::parse(&data).with_context(|| format!("parsing config file {}", path.display()))
    }

    /// Parse and validate configuration from YAML text.
    pub fn parse(data: &str) -> Result<Self> {
        let cfg: Config = serde_yaml::from_str(data)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.rpc.http.is_empty() {
            bail!("rpc.http is required");
        }
        if !(self.rpc.http.starts_with("http://") || self.rpc.http.starts_with("https://")) {
            bail!("rpc.http must be an http:// or https:// URL");
        }

        if self.rpc.ws.is_empty() {
            bail!("rpc.ws is required");
        }
        if !(self.rpc.ws.starts_with("ws://") || self.rpc.ws.starts_with("wss://")) {
            bail!("rpc.ws must be a ws:// or wss:// URL");
        }

        if self.log.path.as_os_str().is_empty() {
            bail!("log.path must not be empty");
        }

        let sub = &self.subscription;
        if sub.slot_buffer == 0 {
            bail!("subscription.slot_buffer must be positive");
        }
        if sub.connect_timeout.is_zero() {
            bail!("subscription.connect_timeout must be positive");
        }
        if sub.idle_timeout.is_zero() {
            bail!("subscription.idle_timeout must be positive");
        }
        if sub.backoff_initial.is_zero() {
            bail!("subscription.backoff_initial must be positive");
        }
        if sub.backoff_max < sub.backoff_initial {
            bail!(
                "subscription.backoff_max {:?} must not be below backoff_initial {:?}",
                sub.backoff_max,
                sub.backoff_initial
            );
        }

        if let Some(retain) = self.history.retain_epochs {
            if retain < 2 {
                bail!("history.retain_epochs must be at least 2");
            }
        }

        Ok(())
    }
}

/// Resolve which config file to use.
///
/// Order: explicit path, `CONFIG_FILE`, `./config.yaml` when present,
/// then `$HOME/.ethtop/config.yaml`.
pub fn resolve_path(explicit: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path);
    }

    if let Some(path) = std::env::var_os(CONFIG_ENV).filter(|p| !p.is_empty()) {
        return Ok(PathBuf::from(path));
    }

    let local = PathBuf::from(LOCAL_CONFIG);
    if local.exists() {
        return Ok(local);
    }

    let home = dirs::home_dir().context("locating home directory for default config")?;
    Ok(home.join(".ethtop").join(LOCAL_CONFIG))
}

/// Write the config template to `path`, creating parent directories.
pub fn write_template(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!(
            "{} already exists (use --force to overwrite)",
            path.display()
        );
    }

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating directory {}", parent.display()))?;
    }

    std::fs::write(path, TEMPLATE).with_context(|| format!("writing {}", path.display()))?;

    Ok(())
}
