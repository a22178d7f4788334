//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/apptilaus/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/apptilaus/` (~/.config/apptilaus/)
//! - Data: `$XDG_DATA_HOME/apptilaus/` (~/.local/share/apptilaus/)
//! - State/Logs: `$XDG_STATE_HOME/apptilaus/` (~/.local/state/apptilaus/)

use crate::error::{Error, Result};
use crate::platform::Platform;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Default collection endpoint for purchase and opt-out events
pub const DEFAULT_BASE_URL: &str = "https://api.apptilaus.com";

/// Default endpoint for install/session registration
pub const DEFAULT_SESSION_URL: &str = "https://device.apptilaus.com/v1/device";

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Strips trailing `/` and `\` from a base URL.
pub fn trim_base_url(url: &str) -> String {
    url.trim_end_matches(['/', '\\']).to_string()
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default)]
pub struct Config {
    /// Collection client configuration
    #[serde(default)]
    pub client: ClientConfig,

    /// Static device identifiers for hosts without a platform provider
    #[serde(default)]
    pub device: DeviceConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Collection client configuration
///
/// `app_id` and `app_token` are not required to load a config; the client
/// stays uninitialized until `setup` receives non-empty credentials.
#[derive(Debug, Deserialize, Clone)]
pub struct ClientConfig {
    /// Endpoint for purchase and opt-out events
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Endpoint for install/session registration
    #[serde(default = "default_session_url")]
    pub session_url: String,

    /// App ID issued by Apptilaus
    #[serde(default)]
    pub app_id: String,

    /// App token issued by Apptilaus
    #[serde(default)]
    pub app_token: String,

    /// Custom user id attached to purchases
    #[serde(default)]
    pub user_id: Option<String>,

    /// Extra attempts after a network failure (purchases only)
    #[serde(default = "default_max_retry_count")]
    pub max_retry_count: u32,

    /// Register install/session on setup
    #[serde(default)]
    pub session_tracking: bool,

    /// Reported as `sdk_version` on purchases
    #[serde(default = "default_sdk_version")]
    pub sdk_version: String,

    /// Store platform, selects receipt parsing and device-id scheme
    #[serde(default)]
    pub platform: Platform,

    /// Host application bundle identifier, sent on opt-out
    #[serde(default)]
    pub app_bundle: String,

    /// Rebuild the full parameter set on every retry
    #[serde(default = "default_retry_rebuilds_payload")]
    pub retry_rebuilds_payload: bool,

    /// HTTP timeout in seconds; the transport default applies when unset
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    /// Delay before the first retry, doubled per attempt (0 = immediate)
    #[serde(default)]
    pub retry_delay_ms: u64,

    /// Upper bound on waiting for the advertising identifier
    #[serde(default)]
    pub advertising_id_timeout_ms: Option<u64>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            session_url: default_session_url(),
            app_id: String::new(),
            app_token: String::new(),
            user_id: None,
            max_retry_count: default_max_retry_count(),
            session_tracking: false,
            sdk_version: default_sdk_version(),
            platform: Platform::default(),
            app_bundle: String::new(),
            retry_rebuilds_payload: default_retry_rebuilds_payload(),
            timeout_secs: None,
            retry_delay_ms: 0,
            advertising_id_timeout_ms: None,
        }
    }
}

impl ClientConfig {
    /// Check if credentials are present
    pub fn has_credentials(&self) -> bool {
        !self.app_id.is_empty() && !self.app_token.is_empty()
    }

    /// Validate endpoint configuration
    pub fn validate(&self) -> Result<()> {
        if trim_base_url(&self.base_url).is_empty() {
            return Err(Error::Config("client.base_url must not be empty".to_string()));
        }
        if trim_base_url(&self.session_url).is_empty() {
            return Err(Error::Config(
                "client.session_url must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_session_url() -> String {
    DEFAULT_SESSION_URL.to_string()
}

fn default_max_retry_count() -> u32 {
    10
}

fn default_sdk_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_retry_rebuilds_payload() -> bool {
    true
}

/// Fixed device identifiers
#[derive(Debug, Deserialize, Clone, Default)]
pub struct DeviceConfig {
    /// iOS identifier for vendor
    pub vendor_id: Option<String>,
    /// Android device unique identifier
    pub device_id: Option<String>,
    /// Advertising identifier (IDFA / GPS ADID)
    pub advertising_id: Option<String>,
    /// Whether ad tracking is enabled for the advertising identifier
    #[serde(default = "default_tracking_enabled")]
    pub tracking_enabled: bool,
}

fn default_tracking_enabled() -> bool {
    true
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        config.client.validate()?;
        Ok(config)
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/apptilaus/config.toml` (~/.config/apptilaus/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("apptilaus").join("config.toml")
    }

    /// Returns the data directory path (for the marker file)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("apptilaus")
    }

    /// Returns the state directory path (for daily-rolled logs)
    ///
    /// `$XDG_STATE_HOME/apptilaus`
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("apptilaus")
    }

    /// Returns the marker store file path
    ///
    /// `$XDG_DATA_HOME/apptilaus/markers.json`
    pub fn marker_path() -> PathBuf {
        Self::data_dir().join("markers.json")
    }
}
