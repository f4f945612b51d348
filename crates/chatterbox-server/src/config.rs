//! Server configuration loaded from environment variables.
//!
//! - `CHATTERBOX_BIND_ADDR`: listen address (default: `0.0.0.0:4000`)
//! - `CHATTERBOX_DB_PATH`: message database file; unset runs in-memory
//! - `CHATTERBOX_CORS_ORIGIN`: allowed browser origin (default: `*`)
//! - `CHATTERBOX_HISTORY_LIMIT`: max messages per history fetch (default: 100)
//! - `CHATTERBOX_LOG_JSON`: `true`/`1` for JSON log output
//!
//! Malformed values fall back to the default with a warning rather than
//! refusing to start.

use std::net::SocketAddr;
use std::path::PathBuf;

use tracing::{info, warn};

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:4000";
const DEFAULT_HISTORY_LIMIT: u32 = 100;

#[derive(Debug, Clone)]
pub struct Config {
    /// Address the HTTP/WebSocket listener binds to.
    pub bind_addr: SocketAddr,
    /// Message database file; `None` runs an in-memory database that is
    /// lost on restart.
    pub db_path: Option<PathBuf>,
    /// Allowed CORS origin; `*` permits any.
    pub cors_origin: String,
    /// Cap on messages returned by a single history fetch.
    pub history_limit: u32,
    /// Emit JSON-formatted logs instead of human-readable output.
    pub log_json: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.parse().expect("valid default address"),
            db_path: None,
            cors_origin: "*".to_string(),
            history_limit: DEFAULT_HISTORY_LIMIT,
            log_json: false,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            bind_addr: parse_bind_addr(std::env::var("CHATTERBOX_BIND_ADDR").ok()),
            db_path: std::env::var("CHATTERBOX_DB_PATH").ok().map(PathBuf::from),
            cors_origin: std::env::var("CHATTERBOX_CORS_ORIGIN")
                .unwrap_or_else(|_| "*".to_string()),
            history_limit: parse_history_limit(std::env::var("CHATTERBOX_HISTORY_LIMIT").ok()),
            log_json: parse_flag(std::env::var("CHATTERBOX_LOG_JSON").ok()),
        }
    }

    /// Log the effective configuration at startup.
    pub fn log_config(&self) {
        info!(bind_addr = %self.bind_addr, "Config: bind address");
        match &self.db_path {
            Some(path) => info!(path = %path.display(), "Config: file-based message database"),
            None => info!("Config: in-memory message database (lost on restart)"),
        }
        info!(origin = %self.cors_origin, "Config: CORS origin");
        info!(limit = self.history_limit, "Config: history fetch limit");
    }
}

fn parse_bind_addr(raw: Option<String>) -> SocketAddr {
    match raw {
        Some(value) => value.parse().unwrap_or_else(|_| {
            warn!(value = %value, "Invalid CHATTERBOX_BIND_ADDR, using default");
            DEFAULT_BIND_ADDR.parse().expect("valid default address")
        }),
        None => DEFAULT_BIND_ADDR.parse().expect("valid default address"),
    }
}

fn parse_history_limit(raw: Option<String>) -> u32 {
    match raw {
        Some(value) => match value.parse::<u32>() {
            Ok(limit) if limit > 0 => limit,
            _ => {
                warn!(value = %value, "Invalid CHATTERBOX_HISTORY_LIMIT, using default");
                DEFAULT_HISTORY_LIMIT
            }
        },
        None => DEFAULT_HISTORY_LIMIT,
    }
}

fn parse_flag(raw: Option<String>) -> bool {
    raw.map(|v| v.to_lowercase() == "true" || v == "1")
        .unwrap_or(false)
}
