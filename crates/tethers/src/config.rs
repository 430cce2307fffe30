use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tether_common::types::DEFAULT_RELAY_PATH;

/// CLI arguments for the relay server.
#[derive(Parser, Debug, Clone)]
#[command(name = "tethers")]
#[command(about = "tether relay server")]
#[command(version)]
pub struct Args {
    /// Socket address to listen on.
    #[arg(long, default_value = "0.0.0.0:8080", env = "TETHERS_LISTEN")]
    pub listen: SocketAddr,
    /// Socket address for the metrics and health endpoint.
    #[arg(long, default_value = "127.0.0.1:9090", env = "TETHERS_METRICS")]
    pub metrics_addr: SocketAddr,
    /// Path WebSocket clients connect on.
    #[arg(long, default_value = DEFAULT_RELAY_PATH, env = "TETHERS_PATH")]
    pub path: String,
    /// Interval between keepalive pings in seconds.
    #[arg(long, default_value = "30", env = "TETHERS_PING_INTERVAL")]
    pub ping_interval: u64,
    /// Seconds without any inbound frame before a connection is dropped.
    #[arg(long, default_value = "60", env = "TETHERS_IDLE_TIMEOUT")]
    pub idle_timeout: u64,
    /// Seconds to wait after the last client leaves before exiting. 0 = never.
    #[arg(long, default_value = "5", env = "TETHERS_IDLE_GRACE")]
    pub idle_grace: u64,
    /// WebSocket upgrade timeout in seconds.
    #[arg(long, default_value = "5", env = "TETHERS_HANDSHAKE_TIMEOUT")]
    pub handshake_timeout: u64,
    /// Maximum inbound message size in bytes.
    #[arg(long, default_value = "65536", env = "TETHERS_MAX_MESSAGE_SIZE")]
    pub max_message_size: usize,
    /// Per-connection outbound queue depth, in messages.
    #[arg(long, default_value = "256", env = "TETHERS_OUTBOUND_QUEUE")]
    pub outbound_queue: usize,
    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    pub verbose: u8,
    /// Write logs to this file instead of stderr.
    #[arg(long, env = "TETHERS_LOG_FILE")]
    pub log_file: Option<PathBuf>,
}

/// Runtime configuration derived from [`Args`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address to listen on.
    pub listen: SocketAddr,
    /// Socket address for the metrics and health endpoint.
    pub metrics_addr: SocketAddr,
    /// Path WebSocket clients connect on.
    pub path: String,
    /// Interval between keepalive pings.
    pub ping_interval: Duration,
    /// Idle-read deadline, reset by every inbound frame.
    pub idle_timeout: Duration,
    /// Delay between the registry emptying and server exit. Zero disables.
    pub idle_grace: Duration,
    /// WebSocket upgrade timeout.
    pub handshake_timeout: Duration,
    /// Maximum inbound message size in bytes.
    pub max_message_size: usize,
    /// Per-connection outbound queue depth, in messages.
    pub outbound_queue: usize,
}

const MAX_MESSAGE_SIZE_LIMIT: usize = 16 * 1024 * 1024;

impl ServerConfig {
    /// Validates the configuration values are within acceptable bounds.
    /// Returns Ok(()) if valid, Err with description otherwise.
    pub fn validate(&self) -> Result<(), String> {
        if !self.path.starts_with('/') {
            return Err("path must start with '/'".to_string());
        }

        if self.ping_interval.is_zero() {
            return Err("ping_interval must be greater than 0".to_string());
        }
        if self.ping_interval > Duration::from_secs(3600) {
            return Err("ping_interval exceeds reasonable limit (3600 seconds)".to_string());
        }

        if self.idle_timeout.is_zero() {
            return Err("idle_timeout must be greater than 0".to_string());
        }
        if self.idle_timeout > Duration::from_secs(86_400) {
            return Err(
                "idle_timeout exceeds reasonable limit (86400 seconds / 1 day)".to_string(),
            );
        }
        // A healthy peer only proves liveness by answering our pings.
        if self.idle_timeout <= self.ping_interval {
            return Err("idle_timeout must be greater than ping_interval".to_string());
        }

        if self.idle_grace > Duration::from_secs(3600) {
            return Err("idle_grace exceeds reasonable limit (3600 seconds)".to_string());
        }

        if self.handshake_timeout.is_zero() {
            return Err("handshake_timeout must be greater than 0".to_string());
        }
        if self.handshake_timeout > Duration::from_secs(300) {
            return Err("handshake_timeout exceeds reasonable limit (300 seconds)".to_string());
        }

        if self.max_message_size == 0 {
            return Err("max_message_size must be greater than 0".to_string());
        }
        if self.max_message_size > MAX_MESSAGE_SIZE_LIMIT {
            return Err(format!(
                "max_message_size exceeds maximum allowed ({MAX_MESSAGE_SIZE_LIMIT} bytes)"
            ));
        }

        if self.outbound_queue == 0 {
            return Err("outbound_queue must be greater than 0".to_string());
        }
        if self.outbound_queue > 65_536 {
            return Err("outbound_queue exceeds reasonable limit (65536)".to_string());
        }
        Ok(())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8080)),
            metrics_addr: SocketAddr::from(([127, 0, 0, 1], 9090)),
            path: DEFAULT_RELAY_PATH.to_string(),
            ping_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(60),
            idle_grace: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(5),
            max_message_size: 65_536,
            outbound_queue: 256,
        }
    }
}

impl From<Args> for ServerConfig {
    fn from(args: Args) -> Self {
        Self {
            listen: args.listen,
            metrics_addr: args.metrics_addr,
            path: args.path,
            ping_interval: Duration::from_secs(args.ping_interval),
            idle_timeout: Duration::from_secs(args.idle_timeout),
            idle_grace: Duration::from_secs(args.idle_grace),
            handshake_timeout: Duration::from_secs(args.handshake_timeout),
            max_message_size: args.max_message_size,
            outbound_queue: args.outbound_queue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> ServerConfig {
        ServerConfig {
            listen: "127.0.0.1:8080".parse().unwrap(),
            metrics_addr: "127.0.0.1:9090".parse().unwrap(),
            ..ServerConfig::default()
        }
    }

    #[test]
    fn valid_config_passes() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn default_config_passes() {
        assert!(ServerConfig::default().validate().is_ok());
    }

    #[test]
    fn args_defaults_match_config_defaults() {
        let args = Args::try_parse_from(["tethers"]).unwrap();
        let config: ServerConfig = args.into();
        let defaults = ServerConfig::default();
        assert_eq!(config.listen, defaults.listen);
        assert_eq!(config.metrics_addr, defaults.metrics_addr);
        assert_eq!(config.path, defaults.path);
        assert_eq!(config.ping_interval, defaults.ping_interval);
        assert_eq!(config.idle_timeout, defaults.idle_timeout);
        assert_eq!(config.idle_grace, defaults.idle_grace);
        assert_eq!(config.max_message_size, defaults.max_message_size);
        assert_eq!(config.outbound_queue, defaults.outbound_queue);
    }

    #[test]
    fn args_override_values() {
        let args = Args::try_parse_from([
            "tethers",
            "--listen",
            "127.0.0.1:7000",
            "--path",
            "/relay",
            "--idle-grace",
            "0",
            "-vv",
        ])
        .unwrap();
        assert_eq!(args.verbose, 2);
        let config: ServerConfig = args.into();
        assert_eq!(config.listen.port(), 7000);
        assert_eq!(config.path, "/relay");
        assert!(config.idle_grace.is_zero());
    }

    #[test]
    fn path_without_slash() {
        let mut c = valid_config();
        c.path = "ws".to_string();
        assert!(c.validate().unwrap_err().contains("path"));
    }

    #[test]
    fn ping_interval_zero() {
        let mut c = valid_config();
        c.ping_interval = Duration::ZERO;
        assert!(c.validate().unwrap_err().contains("ping_interval"));
    }

    #[test]
    fn ping_interval_too_large() {
        let mut c = valid_config();
        c.ping_interval = Duration::from_secs(3601);
        c.idle_timeout = Duration::from_secs(7200);
        assert!(c.validate().unwrap_err().contains("ping_interval"));
    }

    #[test]
    fn idle_timeout_zero() {
        let mut c = valid_config();
        c.idle_timeout = Duration::ZERO;
        assert!(c.validate().unwrap_err().contains("idle_timeout"));
    }

    #[test]
    fn idle_timeout_too_large() {
        let mut c = valid_config();
        c.idle_timeout = Duration::from_secs(86_401);
        assert!(c.validate().unwrap_err().contains("idle_timeout"));
    }

    #[test]
    fn idle_timeout_not_above_ping_interval() {
        let mut c = valid_config();
        c.idle_timeout = c.ping_interval;
        assert!(c.validate().unwrap_err().contains("greater than ping_interval"));
    }

    #[test]
    fn idle_grace_too_large() {
        let mut c = valid_config();
        c.idle_grace = Duration::from_secs(3601);
        assert!(c.validate().unwrap_err().contains("idle_grace"));
    }

    #[test]
    fn idle_grace_zero_is_valid() {
        let mut c = valid_config();
        c.idle_grace = Duration::ZERO;
        assert!(c.validate().is_ok());
    }

    #[test]
    fn handshake_timeout_zero() {
        let mut c = valid_config();
        c.handshake_timeout = Duration::ZERO;
        assert!(c.validate().unwrap_err().contains("handshake_timeout"));
    }

    #[test]
    fn handshake_timeout_too_large() {
        let mut c = valid_config();
        c.handshake_timeout = Duration::from_secs(301);
        assert!(c.validate().unwrap_err().contains("handshake_timeout"));
    }

    #[test]
    fn max_message_size_zero() {
        let mut c = valid_config();
        c.max_message_size = 0;
        assert!(c.validate().unwrap_err().contains("max_message_size"));
    }

    #[test]
    fn max_message_size_too_large() {
        let mut c = valid_config();
        c.max_message_size = MAX_MESSAGE_SIZE_LIMIT + 1;
        assert!(c.validate().unwrap_err().contains("max_message_size"));
    }

    #[test]
    fn outbound_queue_zero() {
        let mut c = valid_config();
        c.outbound_queue = 0;
        assert!(c.validate().unwrap_err().contains("outbound_queue"));
    }

    #[test]
    fn outbound_queue_too_large() {
        let mut c = valid_config();
        c.outbound_queue = 65_537;
        assert!(c.validate().unwrap_err().contains("outbound_queue"));
    }

    #[test]
    fn boundary_values_valid() {
        let mut c = valid_config();
        c.ping_interval = Duration::from_secs(1);
        c.idle_timeout = Duration::from_secs(2);
        c.handshake_timeout = Duration::from_secs(1);
        c.max_message_size = 1;
        c.outbound_queue = 1;
        assert!(c.validate().is_ok());
    }

    #[test]
    fn upper_boundary_values_valid() {
        let mut c = valid_config();
        c.ping_interval = Duration::from_secs(3600);
        c.idle_timeout = Duration::from_secs(86_400);
        c.idle_grace = Duration::from_secs(3600);
        c.handshake_timeout = Duration::from_secs(300);
        c.max_message_size = MAX_MESSAGE_SIZE_LIMIT;
        c.outbound_queue = 65_536;
        assert!(c.validate().is_ok());
    }
}
