//! Service configuration with defaults, optionally loaded from TOML.
//!
//! ```toml
//! listen_port = 7911
//! backlog = 5
//! protocol_version = 100
//! header_size = 24
//! ```

use crate::error::{OmapiError, OmapiResult};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Size of the fixed message header: six 32-bit fields.
pub const FIXED_HEADER_SIZE: u32 = 24;

/// Protocol version spoken by this implementation.
pub const PROTOCOL_VERSION: u32 = 100;

/// Well-known OMAPI port.
pub const DEFAULT_PORT: u16 = 7911;

/// Configuration shared by listeners, connections and protocol objects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OmapiConfig {
    /// Port bound by the listener. Default: 7911.
    pub listen_port: u16,
    /// Listen backlog. Default: 5.
    pub backlog: u32,
    /// Version sent in, and required of, every handshake. Default: 100.
    pub protocol_version: u32,
    /// Header size announced in the handshake. Must be at least 24.
    pub header_size: u32,
    /// Initial capacity of connection buffers and the socket read chunk.
    pub buffer_size: usize,
    /// Largest value, authenticator or header length a peer may declare.
    pub max_value_len: u32,
}

impl Default for OmapiConfig {
    fn default() -> Self {
        Self {
            listen_port: DEFAULT_PORT,
            backlog: 5,
            protocol_version: PROTOCOL_VERSION,
            header_size: FIXED_HEADER_SIZE,
            buffer_size: 2048,
            max_value_len: 16 * 1024 * 1024,
        }
    }
}

impl OmapiConfig {
    /// Check the invariants the protocol engine relies on.
    pub fn validate(&self) -> OmapiResult<()> {
        if self.header_size < FIXED_HEADER_SIZE {
            return Err(OmapiError::Config(format!(
                "header_size {} is smaller than the fixed header ({FIXED_HEADER_SIZE})",
                self.header_size
            )));
        }
        if self.buffer_size == 0 {
            return Err(OmapiError::Config("buffer_size must be non-zero".into()));
        }
        if self.max_value_len < self.header_size {
            return Err(OmapiError::Config(format!(
                "max_value_len {} is smaller than header_size {}",
                self.max_value_len, self.header_size
            )));
        }
        Ok(())
    }
}

/// Load configuration from a TOML file, or defaults when no path is given.
pub fn load_config(path: Option<&Path>) -> OmapiResult<OmapiConfig> {
    let config = match path {
        None => OmapiConfig::default(),
        Some(path) => {
            let contents = std::fs::read_to_string(path).map_err(|e| {
                OmapiError::Config(format!("cannot read {}: {e}", path.display()))
            })?;
            toml::from_str::<OmapiConfig>(&contents).map_err(|e| {
                OmapiError::Config(format!("cannot parse {}: {e}", path.display()))
            })?
        }
    };
    config.validate()?;
    Ok(config)
}
