//! Server configuration
//!
//! Loads listener, tick and application settings from a TOML file.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Default configuration file name
pub const CONFIG_FILE: &str = "ws-engine.toml";

/// Default cap on a single message (16 MiB)
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Errors that can occur during config operations
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Kind of application bound to a path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplicationKind {
    /// Rebroadcasts each message to every client
    Echo,
    /// Periodically pushes the current time
    Time,
}

/// Binding of an application to a URL path
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ApplicationEntry {
    /// Path without the leading slash (`echo` serves `/echo`)
    pub path: String,
    pub kind: ApplicationKind,
}

impl ApplicationEntry {
    pub fn new(path: impl Into<String>, kind: ApplicationKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }
}

/// Configuration for the WebSocket server
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind: String,
    /// Port to listen on
    pub port: u16,
    /// Milliseconds between application ticks
    pub tick_interval_ms: u64,
    /// Largest message accepted from a client, in bytes
    pub max_message_size: usize,
    /// Seconds between pushes of the time application
    pub time_interval_secs: u64,
    /// Applications served, by path
    pub applications: Vec<ApplicationEntry>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 8000,
            tick_interval_ms: 1000,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            time_interval_secs: 3,
            applications: vec![
                ApplicationEntry::new("echo", ApplicationKind::Echo),
                ApplicationEntry::new("time", ApplicationKind::Time),
            ],
        }
    }
}

impl ServerConfig {
    /// Load configuration from a file, falling back to defaults if it is missing
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: ServerConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "tick_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.max_message_size == 0 {
            return Err(ConfigError::Invalid(
                "max_message_size must be greater than 0".to_string(),
            ));
        }
        for (i, entry) in self.applications.iter().enumerate() {
            if entry.path.is_empty() || entry.path.starts_with('/') {
                return Err(ConfigError::Invalid(format!(
                    "application path {:?} must be non-empty without a leading '/'",
                    entry.path
                )));
            }
            if self.applications[..i].iter().any(|e| e.path == entry.path) {
                return Err(ConfigError::Invalid(format!(
                    "application path {:?} is bound twice",
                    entry.path
                )));
            }
        }
        Ok(())
    }

    /// Override the bind address
    pub fn with_bind(mut self, bind: Option<String>) -> Self {
        if let Some(bind) = bind {
            self.bind = bind;
        }
        self
    }

    /// Override the port
    pub fn with_port(mut self, port: Option<u16>) -> Self {
        if let Some(port) = port {
            self.port = port;
        }
        self
    }

    /// Get the socket address to bind to
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}
