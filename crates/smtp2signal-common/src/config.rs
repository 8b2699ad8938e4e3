//! Configuration for smtp2signal
//!
//! Settings come from an optional TOML file overlaid by `SIGNAL_*`
//! environment variables. The result is built once at startup and handed
//! to the components that need it.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Environment variables and the configuration keys they override
const ENV_OVERRIDES: &[(&str, &str)] = &[
    ("SIGNAL_SMTP_HOST", "smtp.host"),
    ("SIGNAL_SMTP_PORT", "smtp.port"),
    ("SIGNAL_SMTP_HOSTNAME", "smtp.hostname"),
    ("SIGNAL_SMTP_TOKEN_FILE", "smtp.token_file"),
    ("SIGNAL_SMTP_MAX_MESSAGE_SIZE", "smtp.max_message_size"),
    ("SIGNAL_SMTP_MAX_RECIPIENTS", "smtp.max_recipients"),
    ("SIGNAL_SMTP_MAX_CONNECTIONS", "smtp.max_connections"),
    ("SIGNAL_SMTP_CONNECTION_TIMEOUT_SECS", "smtp.connection_timeout_secs"),
    ("SIGNAL_CLI_BASE_URL", "signal.base_url"),
    ("SIGNAL_CLI_REQUEST_TIMEOUT_SECS", "signal.request_timeout_secs"),
    ("SIGNAL_SHUTDOWN_TIMEOUT_SECS", "shutdown.timeout_secs"),
    ("SIGNAL_LOG_LEVEL", "logging.level"),
    ("SIGNAL_LOG_FORMAT", "logging.format"),
];

/// Variable naming an explicit configuration file
const CONFIG_FILE_VAR: &str = "SIGNAL_CONFIG_FILE";

const DEFAULT_CONFIG_PATHS: &[&str] = &["./smtp2signal.toml", "/etc/smtp2signal/config.toml"];

/// Path appended to the signal-cli base URL for sending messages
pub const SEND_API_PATH: &str = "/v2/send";

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// SMTP listener configuration
    #[serde(default)]
    pub smtp: SmtpConfig,

    /// signal-cli REST API configuration
    #[serde(default)]
    pub signal: SignalConfig,

    /// Graceful shutdown configuration
    #[serde(default)]
    pub shutdown: ShutdownConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// SMTP configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SmtpConfig {
    /// Hostname for SMTP banner
    #[serde(default = "default_hostname")]
    pub hostname: String,

    /// Bind host
    #[serde(default = "default_smtp_host")]
    pub host: String,

    /// Bind port
    #[serde(default = "default_smtp_port")]
    pub port: u16,

    /// File the shared auth token is cached in
    #[serde(default)]
    pub token_file: Option<PathBuf>,

    /// Maximum message size in bytes
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Maximum recipients per message
    #[serde(default = "default_max_recipients")]
    pub max_recipients: usize,

    /// Maximum concurrent connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Idle timeout per command line in seconds
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
            host: default_smtp_host(),
            port: default_smtp_port(),
            token_file: None,
            max_message_size: default_max_message_size(),
            max_recipients: default_max_recipients(),
            max_connections: default_max_connections(),
            connection_timeout_secs: default_connection_timeout(),
        }
    }
}

impl SmtpConfig {
    /// Address the listener binds to
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }
}

fn default_hostname() -> String {
    "localhost".to_string()
}

fn default_smtp_host() -> String {
    "localhost".to_string()
}

fn default_smtp_port() -> u16 {
    8025
}

fn default_max_message_size() -> usize {
    25 * 1024 * 1024 // 25 MB
}

fn default_max_recipients() -> usize {
    100
}

fn default_max_connections() -> usize {
    100
}

fn default_connection_timeout() -> u64 {
    300
}

/// signal-cli REST API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SignalConfig {
    /// Base URL of the signal-cli REST API
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl SignalConfig {
    /// Full URL of the send endpoint
    pub fn send_url(&self) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), SEND_API_PATH)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn default_base_url() -> String {
    "http://127.0.0.1:8080".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

/// Graceful shutdown configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ShutdownConfig {
    /// How long outstanding dispatches may run before they are cancelled
    #[serde(default = "default_shutdown_timeout")]
    pub timeout_secs: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_shutdown_timeout(),
        }
    }
}

impl ShutdownConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_shutdown_timeout() -> u64 {
    5
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Filter directives, used when `RUST_LOG` is not set
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info,smtp2signal=debug".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

impl Config {
    /// Load configuration from the process environment and optional file
    pub fn load() -> crate::Result<Self> {
        Self::load_from(std::env::vars())
    }

    /// Load configuration from the given variables and optional file
    pub fn load_from<I>(vars: I) -> crate::Result<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let vars: HashMap<String, String> = vars
            .into_iter()
            .filter(|(_, value)| !value.is_empty())
            .collect();

        let mut builder = config::Config::builder();

        let file = match vars.get(CONFIG_FILE_VAR) {
            Some(path) => Some(PathBuf::from(path)),
            None => DEFAULT_CONFIG_PATHS
                .iter()
                .map(PathBuf::from)
                .find(|path| path.exists()),
        };

        if let Some(path) = file {
            builder = builder.add_source(
                config::File::new(&path.to_string_lossy(), config::FileFormat::Toml)
                    .required(true),
            );
        }

        for (var, key) in ENV_OVERRIDES {
            if let Some(value) = vars.get(*var) {
                builder = builder
                    .set_override(*key, value.as_str())
                    .map_err(|e| crate::Error::Config(format!("Invalid {}: {}", var, e)))?;
            }
        }

        builder
            .build()
            .and_then(|c| c.try_deserialize::<Config>())
            .map_err(|e| crate::Error::Config(format!("Failed to load config: {}", e)))
    }
}
