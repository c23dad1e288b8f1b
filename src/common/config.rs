//! Configuration file handling

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use super::paths::config_path;
use super::Result;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// Listener settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Deferred assertion timeouts
    #[serde(default)]
    pub timeouts: Timeouts,
}

/// Listener settings for the wire protocol socket
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Port to listen on
    #[serde(default = "default_bind_port")]
    pub bind_port: u16,

    /// Largest command line accepted before the connection is dropped
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            bind_port: default_bind_port(),
            max_frame_bytes: default_max_frame_bytes(),
        }
    }
}

impl ServerConfig {
    /// `address:port` string suitable for binding
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.bind_address, self.bind_port)
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}
fn default_bind_port() -> u16 {
    31221
}
fn default_max_frame_bytes() -> usize {
    100 * 1024
}

/// Timeout settings in milliseconds
#[derive(Debug, Clone, Deserialize)]
pub struct Timeouts {
    /// How long "is connected" style steps wait for the link state
    #[serde(default = "default_connect")]
    pub connect_ms: u64,

    /// How long "received event" waits for a matching event
    #[serde(default = "default_event")]
    pub event_ms: u64,

    /// How long "should not receive" watches for an unwanted event
    #[serde(default = "default_absence")]
    pub absence_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect_ms: default_connect(),
            event_ms: default_event(),
            absence_ms: default_absence(),
        }
    }
}

impl Timeouts {
    pub fn connect(&self) -> Duration {
        Duration::from_millis(self.connect_ms)
    }

    pub fn event(&self) -> Duration {
        Duration::from_millis(self.event_ms)
    }

    pub fn absence(&self) -> Duration {
        Duration::from_millis(self.absence_ms)
    }
}

fn default_connect() -> u64 {
    5_000
}
fn default_event() -> u64 {
    5_000
}
fn default_absence() -> u64 {
    2_000
}

impl Config {
    /// Load configuration from `path`, or from the default config file
    ///
    /// Returns default configuration if no file exists at the default
    /// location. An explicitly given path must exist.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load_file(path),
            None => match config_path() {
                Some(path) if path.exists() => Self::load_file(&path),
                _ => Ok(Self::default()),
            },
        }
    }

    fn load_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| super::Error::FileRead {
            path: path.display().to_string(),
            error: e.to_string(),
        })?;
        Self::parse(&content)
    }

    /// Parse configuration from TOML text
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| super::Error::ConfigParse(e.to_string()))?;
        if config.server.max_frame_bytes == 0 {
            return Err(super::Error::Config(
                "server.max_frame_bytes must be greater than zero".to_string(),
            ));
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.listen_address(), "0.0.0.0:31221");
        assert_eq!(config.server.max_frame_bytes, 102400);
        assert_eq!(config.timeouts.connect(), Duration::from_secs(5));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = Config::parse(
            r#"
            [server]
            bind_port = 4000

            [timeouts]
            event_ms = 250
            "#,
        )
        .unwrap();

        assert_eq!(config.server.bind_port, 4000);
        assert_eq!(config.server.bind_address, "0.0.0.0");
        assert_eq!(config.timeouts.event(), Duration::from_millis(250));
        assert_eq!(config.timeouts.absence_ms, 2_000);
    }

    #[test]
    fn test_rejects_zero_frame_size() {
        let err = Config::parse("[server]\nmax_frame_bytes = 0\n").unwrap_err();
        assert!(matches!(err, crate::Error::Config(_)));
    }

    #[test]
    fn test_explicit_missing_file_is_error() {
        let err = Config::load(Some(Path::new("/nonexistent/cukemerlin.toml"))).unwrap_err();
        assert!(matches!(err, crate::Error::FileRead { .. }));
    }
}
