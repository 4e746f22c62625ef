//! Server configuration, read once from the environment

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use loopsync_core::{EngineConfig, LoopDuration};
use thiserror::Error;

const DEFAULT_BIND: IpAddr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_LOOP_DURATION_SECS: f64 = 21.0;
const DEFAULT_HEARTBEAT_MS: u64 = 2000;
const DEFAULT_DEBOUNCE_MS: u64 = 1000;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{name} is not a valid {expected}: {value:?}")]
    Malformed {
        name: &'static str,
        expected: &'static str,
        value: String,
    },

    #[error("{name} must be greater than zero")]
    NotPositive { name: &'static str },
}

/// Which origins may open a websocket or read the status endpoint
#[derive(Debug, Clone, PartialEq)]
pub enum AllowedOrigins {
    Any,
    List(Vec<String>),
}

impl AllowedOrigins {
    fn parse(raw: &str) -> Self {
        let list: Vec<String> = raw
            .split(',')
            .map(|o| o.trim().trim_end_matches('/').to_string())
            .filter(|o| !o.is_empty())
            .collect();
        if list.is_empty() || list.iter().any(|o| o == "*") {
            AllowedOrigins::Any
        } else {
            AllowedOrigins::List(list)
        }
    }

    /// A missing origin (non-browser client) is always allowed
    pub fn allows(&self, origin: Option<&str>) -> bool {
        match (self, origin) {
            (AllowedOrigins::Any, _) | (_, None) => true,
            (AllowedOrigins::List(list), Some(origin)) => {
                let origin = origin.trim_end_matches('/');
                list.iter().any(|allowed| allowed == origin)
            }
        }
    }

    pub fn describe(&self) -> String {
        match self {
            AllowedOrigins::Any => "any".to_string(),
            AllowedOrigins::List(list) => list.join(", "),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: IpAddr,
    pub port: u16,
    pub loop_duration: LoopDuration,
    pub allowed_origins: AllowedOrigins,
    pub heartbeat_interval: Duration,
    pub debounce_window: Duration,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source (the process environment in production)
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let bind = parse_var(&lookup, "LOOPSYNC_BIND", "IP address")?
            .unwrap_or(DEFAULT_BIND);
        let port = parse_var(&lookup, "LOOPSYNC_PORT", "port")?.unwrap_or(DEFAULT_PORT);

        let secs: f64 = parse_var(&lookup, "LOOP_DURATION_SECS", "number")?
            .unwrap_or(DEFAULT_LOOP_DURATION_SECS);
        let loop_duration = LoopDuration::from_secs(secs).map_err(|_| ConfigError::Malformed {
            name: "LOOP_DURATION_SECS",
            expected: "positive duration",
            value: secs.to_string(),
        })?;

        let heartbeat_ms = positive_millis(&lookup, "HEARTBEAT_INTERVAL_MS", DEFAULT_HEARTBEAT_MS)?;
        let debounce_ms = positive_millis(&lookup, "DEBOUNCE_WINDOW_MS", DEFAULT_DEBOUNCE_MS)?;

        let allowed_origins = AllowedOrigins::parse(&lookup("ALLOWED_ORIGINS").unwrap_or_default());

        Ok(Self {
            bind,
            port,
            loop_duration,
            allowed_origins,
            heartbeat_interval: Duration::from_millis(heartbeat_ms),
            debounce_window: Duration::from_millis(debounce_ms),
        })
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            heartbeat_interval: self.heartbeat_interval,
            debounce_window: self.debounce_window,
        }
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    expected: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(name) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw.trim().parse().map(Some).map_err(|_| ConfigError::Malformed {
            name,
            expected,
            value: raw,
        }),
    }
}

fn positive_millis(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: u64,
) -> Result<u64, ConfigError> {
    let ms = parse_var(lookup, name, "millisecond count")?.unwrap_or(default);
    if ms == 0 {
        return Err(ConfigError::NotPositive { name });
    }
    Ok(ms)
}
