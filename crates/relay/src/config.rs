// Relay server configuration.
//
// Centralizes environment variable parsing with defaults for local
// development. Invalid values fall back to the defaults below.

use std::net::SocketAddr;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 8201;
pub const DEFAULT_PRESENCE_INTERVAL_MS: u64 = 5_000;
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 15_000;
pub const DEFAULT_HEARTBEAT_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_WRITE_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_MAX_FRAME_BYTES: usize = 65_536;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Core relay server configuration.
///
/// Constructed via [`RelayConfig::from_env`] which reads environment
/// variables and falls back to development defaults.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Listen address (host:port).
    pub listen_addr: SocketAddr,
    /// Period of the `activeUsers` presence broadcast.
    pub presence_interval: Duration,
    /// How often each session pings its client.
    pub heartbeat_interval: Duration,
    /// Grace period after a missed pong before the session is dropped.
    pub heartbeat_timeout: Duration,
    /// Upper bound on a single write to one connection.
    pub write_timeout: Duration,
    /// Maximum inbound frame and message size.
    pub max_frame_bytes: usize,
    /// Allowed `Origin` values for upgrades. `None` accepts any origin.
    pub allowed_origins: Option<Vec<String>>,
    /// Log filter directive (e.g. `info`, `huddle_relay=debug`).
    pub log_filter: String,
    pub log_format: LogFormat,
}

impl RelayConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `HUDDLE_RELAY_HOST` | `0.0.0.0` |
    /// | `HUDDLE_RELAY_PORT` | `8201` |
    /// | `HUDDLE_RELAY_PRESENCE_INTERVAL_MS` | `5000` |
    /// | `HUDDLE_RELAY_HEARTBEAT_INTERVAL_MS` | `15000` |
    /// | `HUDDLE_RELAY_HEARTBEAT_TIMEOUT_MS` | `10000` |
    /// | `HUDDLE_RELAY_WRITE_TIMEOUT_MS` | `5000` |
    /// | `HUDDLE_RELAY_MAX_FRAME_BYTES` | `65536` |
    /// | `HUDDLE_RELAY_ALLOWED_ORIGINS` | *(none, any origin)* |
    /// | `HUDDLE_RELAY_LOG_FILTER` | `info` |
    /// | `HUDDLE_RELAY_LOG_FORMAT` | `text` |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let host = env("HUDDLE_RELAY_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 = env("HUDDLE_RELAY_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_PORT);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let millis = |key: &str, default: u64| {
            let value = env(key)
                .ok()
                .and_then(|v| v.trim().parse::<u64>().ok())
                .filter(|v| *v > 0)
                .unwrap_or(default);
            Duration::from_millis(value)
        };

        let max_frame_bytes = env("HUDDLE_RELAY_MAX_FRAME_BYTES")
            .ok()
            .and_then(|v| v.trim().parse::<usize>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(DEFAULT_MAX_FRAME_BYTES);

        let allowed_origins = env("HUDDLE_RELAY_ALLOWED_ORIGINS")
            .ok()
            .map(|raw| parse_origins(&raw))
            .filter(|origins| !origins.is_empty());

        let log_filter = env("HUDDLE_RELAY_LOG_FILTER").unwrap_or_else(|_| "info".into());
        let log_format = match env("HUDDLE_RELAY_LOG_FORMAT").ok().as_deref().map(str::trim) {
            Some(format) if format.eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Text,
        };

        Self {
            listen_addr,
            presence_interval: millis(
                "HUDDLE_RELAY_PRESENCE_INTERVAL_MS",
                DEFAULT_PRESENCE_INTERVAL_MS,
            ),
            heartbeat_interval: millis(
                "HUDDLE_RELAY_HEARTBEAT_INTERVAL_MS",
                DEFAULT_HEARTBEAT_INTERVAL_MS,
            ),
            heartbeat_timeout: millis(
                "HUDDLE_RELAY_HEARTBEAT_TIMEOUT_MS",
                DEFAULT_HEARTBEAT_TIMEOUT_MS,
            ),
            write_timeout: millis("HUDDLE_RELAY_WRITE_TIMEOUT_MS", DEFAULT_WRITE_TIMEOUT_MS),
            max_frame_bytes,
            allowed_origins,
            log_filter,
            log_format,
        }
    }
}

fn parse_origins(comma_separated: &str) -> Vec<String> {
    comma_separated
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToOwned::to_owned)
        .collect()
}
