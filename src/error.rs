use std::net::SocketAddr;

/// Failures surfaced by a [`crate::source::WeatherSource`].
///
/// Only `Bind`, `AlreadyListening` and (under the fail-fast policy) `Child`
/// ever escape a `listen` loop. Everything else is logged inside the loop
/// and retried after a backoff.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("failed to bind UDP socket on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid json payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("provider {provider} reported failure: {message}")]
    Provider { provider: &'static str, message: String },

    #[error("bluetooth error: {0}")]
    Ble(#[from] btleplug::Error),

    #[error("bluetooth station {0} not found")]
    StationNotFound(String),

    #[error("no bluetooth adapter available")]
    NoAdapter,

    #[error("source {0} is already listening")]
    AlreadyListening(String),

    #[error("child source {name} failed: {message}")]
    Child { name: String, message: String },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Binary packet decode failures for the BLE layouts.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("empty packet")]
    Empty,

    #[error("unexpected packet type: expected {expected:#04x}, got {actual:#04x}")]
    UnexpectedType { expected: u8, actual: u8 },

    #[error("unknown packet type {0:#04x}")]
    UnknownType(u8),

    #[error("packet type {packet_type:#04x} truncated: need {needed} bytes, got {actual}")]
    Truncated {
        packet_type: u8,
        needed: usize,
        actual: usize,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required config key {0}")]
    MissingKey(String),

    #[error("invalid value for config key {key}: {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}
