//! Engine configuration
//!
//! Supports YAML configuration; every field has a default so an empty document
//! yields a usable configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::protocol::MIN_CHECK_RESPONSE_LEN;
use crate::Error;

/// Engine configuration, fixed for the lifetime of an engine
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Configuration {
    /// Decision cache capacity (0 disables caching)
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,

    /// Path of the service's client socket
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,

    /// Largest inbound frame accepted before the connection is treated as corrupt
    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: usize,

    /// Bytes requested from the socket per read call
    #[serde(default = "default_read_chunk_size")]
    pub read_chunk_size: usize,
}

fn default_cache_size() -> usize {
    10_000
}

fn default_socket_path() -> PathBuf {
    PathBuf::from("/run/cynara/cynara.socket")
}

fn default_max_frame_len() -> usize {
    1024 * 1024
}

fn default_read_chunk_size() -> usize {
    8 * 1024
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            cache_size: default_cache_size(),
            socket_path: default_socket_path(),
            max_frame_len: default_max_frame_len(),
            read_chunk_size: default_read_chunk_size(),
        }
    }
}

impl Configuration {
    /// Load configuration from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        Self::from_yaml(&contents)
    }

    /// Parse configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        // An empty document deserializes as unit, not as an empty mapping.
        let config: Configuration = if yaml.trim().is_empty() {
            Configuration::default()
        } else {
            serde_yaml::from_str(yaml).with_context(|| "Failed to parse client config YAML")?
        };

        config.validate()?;

        Ok(config)
    }

    /// Builder-style override of the cache capacity
    pub fn with_cache_size(mut self, cache_size: usize) -> Self {
        self.cache_size = cache_size;
        self
    }

    pub fn with_socket_path(mut self, socket_path: impl Into<PathBuf>) -> Self {
        self.socket_path = socket_path.into();
        self
    }

    /// Reject configurations the engine cannot run with
    pub fn validate(&self) -> Result<(), Error> {
        if self.socket_path.as_os_str().is_empty() {
            return Err(Error::InvalidParam("socket_path must not be empty".into()));
        }
        if self.max_frame_len < MIN_CHECK_RESPONSE_LEN {
            return Err(Error::InvalidParam(format!(
                "max_frame_len {} cannot hold a check response ({MIN_CHECK_RESPONSE_LEN} bytes)",
                self.max_frame_len
            )));
        }
        if self.max_frame_len > u32::MAX as usize {
            return Err(Error::InvalidParam(format!(
                "max_frame_len {} does not fit the frame length field",
                self.max_frame_len
            )));
        }
        if self.read_chunk_size == 0 {
            return Err(Error::InvalidParam("read_chunk_size must be positive".into()));
        }
        Ok(())
    }
}
