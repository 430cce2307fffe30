use crate::engine::EngineConfig;
use clap::Parser;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// CLI interface for the demo client.
#[derive(Parser, Debug)]
#[command(name = "tetherc", about = "tether relay client")]
#[command(version)]
pub struct Cli {
    /// Identity to register with the relay.
    pub client_id: String,

    /// Identity to send demo messages to (`*` broadcasts).
    pub receiver: String,

    /// Path to a TOML configuration file.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Relay server URL override.
    #[arg(long)]
    pub url: Option<String>,

    /// Increase log verbosity (repeat for more detail).
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Write logs to a file instead of stderr
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

/// Runtime configuration loaded from defaults, file and environment.
#[derive(Debug, Deserialize, Clone)]
pub struct ClientConfig {
    /// WebSocket URL of the relay, including the path.
    pub server_url: String,
    /// Retry budget and spacing.
    pub reconnect: ReconnectConfig,
    /// Liveness probing.
    pub keepalive: KeepaliveConfig,
    /// Demo sender loop.
    pub demo: DemoConfig,
}

/// Fixed-interval reconnect parameters.
#[derive(Debug, Deserialize, Clone)]
pub struct ReconnectConfig {
    /// Consecutive failed attempts before giving up.
    pub max_attempts: u32,
    /// Delay between attempts, in milliseconds.
    pub interval_ms: u64,
}

/// WebSocket keepalive settings.
#[derive(Debug, Deserialize, Clone)]
pub struct KeepaliveConfig {
    /// Ping interval, in seconds.
    pub interval_s: u64,
    /// Drop the connection after this many seconds without traffic.
    pub idle_timeout_s: u64,
}

/// Demo sender loop settings.
#[derive(Debug, Deserialize, Clone)]
pub struct DemoConfig {
    /// Milliseconds between demo messages.
    pub send_interval_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://localhost:8080/ws".to_string(),
            reconnect: ReconnectConfig::default(),
            keepalive: KeepaliveConfig::default(),
            demo: DemoConfig::default(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            interval_ms: 2000,
        }
    }
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            interval_s: 30,
            idle_timeout_s: 60,
        }
    }
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            send_interval_ms: 1000,
        }
    }
}

impl ClientConfig {
    /// Validates the configuration values are within acceptable bounds.
    /// Returns Ok(()) if valid, Err with description otherwise.
    pub fn validate(&self) -> Result<(), String> {
        if self.server_url.is_empty() {
            return Err("server URL must not be empty".to_string());
        }
        if !(self.server_url.starts_with("ws://") || self.server_url.starts_with("wss://")) {
            return Err(format!(
                "server URL must start with ws:// or wss://, got: {}",
                self.server_url
            ));
        }

        if self.reconnect.max_attempts == 0 {
            return Err("reconnect.max_attempts must be at least 1".to_string());
        }
        if self.reconnect.interval_ms == 0 {
            return Err("reconnect.interval_ms must be greater than 0".to_string());
        }

        if self.keepalive.interval_s == 0 {
            return Err("keepalive.interval_s must be greater than 0".to_string());
        }
        if self.keepalive.idle_timeout_s <= self.keepalive.interval_s {
            return Err(format!(
                "keepalive.idle_timeout_s ({}) must be greater than keepalive.interval_s ({})",
                self.keepalive.idle_timeout_s, self.keepalive.interval_s
            ));
        }

        if self.demo.send_interval_ms == 0 {
            return Err("demo.send_interval_ms must be greater than 0".to_string());
        }

        Ok(())
    }

    /// Engine parameters derived from this configuration.
    #[must_use]
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            max_attempts: self.reconnect.max_attempts,
            retry_interval: Duration::from_millis(self.reconnect.interval_ms),
            keepalive_interval: Duration::from_secs(self.keepalive.interval_s),
            idle_timeout: Duration::from_secs(self.keepalive.idle_timeout_s),
        }
    }

    /// Interval between demo messages.
    #[must_use]
    pub const fn send_interval(&self) -> Duration {
        Duration::from_millis(self.demo.send_interval_ms)
    }
}

/// # Errors
///
/// Returns an error if the configuration file cannot be read or parsed.
#[allow(clippy::cast_possible_wrap)]
pub fn load_config(path: Option<&Path>) -> anyhow::Result<ClientConfig> {
    let defaults = ClientConfig::default();
    let mut builder = config::Config::builder()
        .set_default("server_url", defaults.server_url.as_str())?
        .set_default(
            "reconnect.max_attempts",
            i64::from(defaults.reconnect.max_attempts),
        )?
        .set_default(
            "reconnect.interval_ms",
            defaults.reconnect.interval_ms as i64,
        )?
        .set_default("keepalive.interval_s", defaults.keepalive.interval_s as i64)?
        .set_default(
            "keepalive.idle_timeout_s",
            defaults.keepalive.idle_timeout_s as i64,
        )?
        .set_default(
            "demo.send_interval_ms",
            defaults.demo.send_interval_ms as i64,
        )?;

    if let Some(config_path) = path {
        if config_path.exists() {
            builder = builder.add_source(config::File::from(config_path));
        }
    }

    // TETHERC_SERVER_URL, TETHERC_RECONNECT__MAX_ATTEMPTS, ...
    builder = builder.add_source(
        config::Environment::with_prefix("TETHERC")
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true),
    );

    let settings = builder.build()?;
    let config: ClientConfig = settings.try_deserialize()?;

    Ok(config)
}
