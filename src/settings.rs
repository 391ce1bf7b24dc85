use crate::e131::DEFAULT_SOURCE_NAME;
use crate::error::{PenumbraError, Result};
use std::path::PathBuf;

const DEFAULT_UDP_PORT: u16 = 7000;
const DEFAULT_WS_PORT: u16 = 3000;
const DEFAULT_CONFIG_PATH: &str = "config.json";

/// Process settings read from the environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// `UDP_PORT`: inbound state packets
    pub udp_port: u16,
    /// `WS_PORT`: WebSocket clients
    pub ws_port: u16,
    /// `CONFIG_PATH`: mapping file
    pub config_path: PathBuf,
    /// `SACN_SOURCE_NAME`: name announced in every frame
    pub source_name: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            udp_port: DEFAULT_UDP_PORT,
            ws_port: DEFAULT_WS_PORT,
            config_path: PathBuf::from(DEFAULT_CONFIG_PATH),
            source_name: DEFAULT_SOURCE_NAME.to_string(),
        }
    }
}

impl Settings {
    /// Read settings from the process environment
    ///
    /// Ports that fail to parse fall back to their defaults with a warning.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let port = |key: &str, fallback: u16| match lookup(key) {
            None => fallback,
            Some(value) => parse_port(key, &value).unwrap_or_else(|e| {
                tracing::warn!("{}, using {}", e, fallback);
                fallback
            }),
        };

        Self {
            udp_port: port("UDP_PORT", defaults.udp_port),
            ws_port: port("WS_PORT", defaults.ws_port),
            config_path: lookup("CONFIG_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.config_path),
            source_name: lookup("SACN_SOURCE_NAME").unwrap_or(defaults.source_name),
        }
    }
}

fn parse_port(key: &str, value: &str) -> Result<u16> {
    value
        .trim()
        .parse()
        .map_err(|_| PenumbraError::InvalidSetting {
            key: key.to_string(),
            value: value.to_string(),
        })
}
