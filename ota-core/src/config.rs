/// Update configuration that can be tested independently
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ConfigError;

pub const MIN_CHUNK_SIZE: usize = 256;
pub const MAX_CHUNK_SIZE: usize = 4096;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OtaConfig {
    pub server_host: String,
    pub server_port: u16,
    pub image_path: String,
    pub user_agent: String,
    pub connect_timeout_ms: u64,
    pub recv_timeout_ms: u64,
    /// Receive buffer size; also bounds the header block.
    pub chunk_size: usize,
    pub viewer_poll_ms: u64,
    pub viewer_max_polls: u32,
}

impl Default for OtaConfig {
    fn default() -> Self {
        Self {
            server_host: "192.168.0.3".to_string(),
            server_port: 8070,
            image_path: "/esproom.bin".to_string(),
            user_agent: "esp-idf/1.0 esp32".to_string(),
            connect_timeout_ms: 10_000,
            recv_timeout_ms: 30_000,
            chunk_size: 1024,
            viewer_poll_ms: 1000,
            viewer_max_polls: 600,
        }
    }
}

impl OtaConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server_host.trim().is_empty() {
            return Err(ConfigError::EmptyHost);
        }
        if self.server_port == 0 {
            return Err(ConfigError::ZeroPort);
        }
        if !self.image_path.starts_with('/') {
            return Err(ConfigError::InvalidPath(self.image_path.clone()));
        }
        if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&self.chunk_size) {
            return Err(ConfigError::ChunkSize(self.chunk_size));
        }
        if self.recv_timeout_ms == 0 {
            return Err(ConfigError::ZeroReceiveTimeout);
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn recv_timeout(&self) -> Duration {
        Duration::from_millis(self.recv_timeout_ms)
    }

    pub fn viewer_poll_interval(&self) -> Duration {
        Duration::from_millis(self.viewer_poll_ms)
    }
}
