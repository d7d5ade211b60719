//! Monitor configuration loading.
//!
//! Environment variables are the sole config source. Required variables:
//! `TM_USERNAME` and `TM_PASSWORD` (forwarded to the upstream feed).
//! Everything else has a default.
//!
//! | Variable | Default |
//! |---|---|
//! | `TM_SERVER_URL` | `transit-feed.example.com` |
//! | `TM_SERVER_PORT` | `443` |
//! | `TM_CACERT_PATH` | `cacert.pem` |
//! | `TM_NETWORK_LAYOUT_FILE_PATH` | none (download the layout) |
//! | `TM_QUIET_ROUTE_HOST` | `127.0.0.1` |
//! | `TM_QUIET_ROUTE_IP` | `127.0.0.1` |
//! | `TM_QUIET_ROUTE_PORT` | `8042` |
//! | `TM_QUIET_ROUTE_CERT_PATH` | `server-cert.pem` |
//! | `TM_QUIET_ROUTE_KEY_PATH` | `server-key.pem` |
//! | `TM_MAX_SLOWDOWN_PC` | `0.1` |
//! | `TM_MIN_QUIETNESS_PC` | `0.1` |
//! | `TM_MAX_N_PATHS` | `20` |
//! | `TM_TIMEOUT_MS` | `0` (run forever) |

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

// ---------------------------------------------------------------------------
// Config type
// ---------------------------------------------------------------------------

/// Fully resolved monitor configuration.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Upstream feed host, also used as the STOMP `host` header.
    pub server_url: String,
    pub server_port: String,
    pub username: String,
    pub password: String,
    pub ca_cert_path: PathBuf,
    /// Local layout file; when absent the layout is downloaded from the
    /// feed host.
    pub network_layout_path: Option<PathBuf>,
    /// Host header expected from quiet-route clients.
    pub quiet_route_host: String,
    pub quiet_route_ip: String,
    pub quiet_route_port: u16,
    pub quiet_route_cert_path: PathBuf,
    pub quiet_route_key_path: PathBuf,
    pub max_slowdown_pc: f64,
    pub min_quietness_pc: f64,
    pub max_n_paths: usize,
    /// `None` runs forever.
    pub run_duration: Option<Duration>,
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingVariable(String),
    #[error("invalid value for {name}: {value}")]
    InvalidValue { name: String, value: String },
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Read an environment variable, falling back to a default.
pub fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_owned())
}

fn require_env(name: &str) -> Result<String, ConfigError> {
    std::env::var(name).map_err(|_| ConfigError::MissingVariable(name.to_owned()))
}

fn parse_env<T: std::str::FromStr>(name: &str, default: &str) -> Result<T, ConfigError> {
    let value = env_or(name, default);
    value.parse().map_err(|_| ConfigError::InvalidValue {
        name: name.to_owned(),
        value,
    })
}

/// Load the monitor configuration from the environment.
pub fn from_env() -> Result<MonitorConfig, ConfigError> {
    let layout = env_or("TM_NETWORK_LAYOUT_FILE_PATH", "");
    let timeout_ms: u64 = parse_env("TM_TIMEOUT_MS", "0")?;
    Ok(MonitorConfig {
        server_url: env_or("TM_SERVER_URL", "transit-feed.example.com"),
        server_port: env_or("TM_SERVER_PORT", "443"),
        username: require_env("TM_USERNAME")?,
        password: require_env("TM_PASSWORD")?,
        ca_cert_path: PathBuf::from(env_or("TM_CACERT_PATH", "cacert.pem")),
        network_layout_path: (!layout.is_empty()).then(|| PathBuf::from(layout)),
        quiet_route_host: env_or("TM_QUIET_ROUTE_HOST", "127.0.0.1"),
        quiet_route_ip: env_or("TM_QUIET_ROUTE_IP", "127.0.0.1"),
        quiet_route_port: parse_env("TM_QUIET_ROUTE_PORT", "8042")?,
        quiet_route_cert_path: PathBuf::from(env_or("TM_QUIET_ROUTE_CERT_PATH", "server-cert.pem")),
        quiet_route_key_path: PathBuf::from(env_or("TM_QUIET_ROUTE_KEY_PATH", "server-key.pem")),
        max_slowdown_pc: parse_env("TM_MAX_SLOWDOWN_PC", "0.1")?,
        min_quietness_pc: parse_env("TM_MIN_QUIETNESS_PC", "0.1")?,
        max_n_paths: parse_env("TM_MAX_N_PATHS", "20")?,
        run_duration: (timeout_ms > 0).then(|| Duration::from_millis(timeout_ms)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_or_falls_back_to_the_default() {
        assert_eq!(env_or("TM_TEST_UNSET_VARIABLE", "fallback"), "fallback");
    }

    #[test]
    fn parse_env_rejects_garbage() {
        // Uses the default since the variable is unset; a bad default is
        // the simplest way to exercise the error path hermetically.
        let result: Result<u16, _> = parse_env("TM_TEST_UNSET_VARIABLE", "not-a-number");
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }
}
