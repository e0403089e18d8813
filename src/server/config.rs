//! Server configuration
//!
//! The configuration is a single JSON document. Key lookup is
//! case-insensitive to stay compatible with configs written for permissive
//! decoders: object keys are normalized to lower case before
//! deserialization.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use crate::error::Result;

fn default_timeout() -> u64 {
    10
}

fn default_input_buffer() -> usize {
    1000
}

fn default_output_buffer() -> usize {
    400
}

fn default_max_connections() -> usize {
    100
}

fn default_reconnect() -> u64 {
    10
}

/// Top-level configuration document
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Interface and port to serve on, `host:port`
    pub listen: String,

    /// Upstream I/O deadline in seconds; 0 disables it
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// Intake buffer capacity in packets, per stream
    #[serde(rename = "inputbuffer", default = "default_input_buffer")]
    pub input_buffer: usize,

    /// Private queue capacity in packets, per subscriber. Each stalled
    /// subscriber can pin up to `outputbuffer * 188` bytes.
    #[serde(rename = "outputbuffer", default = "default_output_buffer")]
    pub output_buffer: usize,

    /// Maximum simultaneous subscribers per stream
    #[serde(rename = "maxconnections", default = "default_max_connections")]
    pub max_connections: usize,

    /// Pause in seconds between failover passes; 0 disables reconnection
    #[serde(default = "default_reconnect")]
    pub reconnect: u64,

    /// Optional access-log file; JSON lines go to stdout when unset
    #[serde(default)]
    pub log: Option<PathBuf>,

    /// The streams to restream
    #[serde(default)]
    pub streams: Vec<StreamConfig>,
}

/// One stream definition
#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    /// Local path to serve the stream under
    pub serve: String,
    /// Upstream endpoint(s), in failover order
    pub remote: Remote,
}

/// A single upstream URI or an ordered failover list
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Remote {
    Single(String),
    List(Vec<String>),
}

impl Remote {
    pub fn uris(&self) -> &[String] {
        match self {
            Remote::Single(uri) => std::slice::from_ref(uri),
            Remote::List(uris) => uris,
        }
    }
}

impl Config {
    /// Read and parse a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Parse a configuration document from a JSON string.
    pub fn from_json(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)?;
        let mut config: Config = serde_json::from_value(lowercase_keys(value))?;
        for stream in &mut config.streams {
            if !stream.serve.starts_with('/') {
                stream.serve.insert(0, '/');
            }
        }
        Ok(config)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    pub fn reconnect(&self) -> Duration {
        Duration::from_secs(self.reconnect)
    }
}

/// Recursively lower-case object keys so lookup matches any input casing
fn lowercase_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, value)| (key.to_ascii_lowercase(), lowercase_keys(value)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(lowercase_keys).collect()),
        other => other,
    }
}
