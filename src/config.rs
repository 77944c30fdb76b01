//! Bridge configuration.
//!
//! Every field has a default, so an empty or missing file is valid. A TOML
//! file may override any of them:
//!
//! ```toml
//! tun_name = "vpn0"
//! socket_path = "/tmp/vpn-tun.sock"
//! socket_mode = 0o777
//! socket_buffer_size = 1048576
//! poll_timeout_ms = 10
//! device_read_mode = "drain"
//! client_read_budget = 16
//! log_level = "info"
//! ```

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::info;

use crate::error::{BridgeError, Result};

/// Linux limit on interface names, excluding the trailing NUL.
const MAX_IFNAME_LEN: usize = 15;

/// How many packets to take from the device per readiness event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadMode {
    /// Read until the device reports it is empty.
    #[default]
    Drain,
    /// Read one packet and go back to polling.
    Single,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BridgeConfig {
    /// TUN interface to create or attach to.
    pub tun_name: String,
    /// Filesystem address of the local channel.
    pub socket_path: PathBuf,
    /// Permission bits applied to the socket file.
    pub socket_mode: u32,
    /// Requested SO_RCVBUF/SO_SNDBUF for the listener and each client.
    pub socket_buffer_size: usize,
    /// Upper bound on one poll wait; also how quickly a stop request is seen.
    pub poll_timeout_ms: u16,
    pub device_read_mode: ReadMode,
    /// Socket reads per client per readiness event.
    pub client_read_budget: usize,
    pub log_level: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            tun_name: "vpn0".to_string(),
            socket_path: PathBuf::from("/tmp/vpn-tun.sock"),
            socket_mode: 0o777,
            socket_buffer_size: 1024 * 1024,
            poll_timeout_ms: 10,
            device_read_mode: ReadMode::Drain,
            client_read_budget: 16,
            log_level: "info".to_string(),
        }
    }
}

impl BridgeConfig {
    /// Loads and validates a TOML configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("Loading configuration from {}", path.display());

        let content = std::fs::read_to_string(path).map_err(|source| BridgeError::ConfigFile {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&content).map_err(|source| BridgeError::ConfigParse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.tun_name.is_empty() || self.tun_name.len() > MAX_IFNAME_LEN {
            return Err(BridgeError::config(format!(
                "interface name '{}' must be 1-{} bytes",
                self.tun_name, MAX_IFNAME_LEN
            )));
        }
        if self.socket_path.as_os_str().is_empty() {
            return Err(BridgeError::config("socket_path is empty"));
        }
        if self.socket_mode > 0o7777 {
            return Err(BridgeError::config(format!(
                "socket_mode {:o} is not a permission mask",
                self.socket_mode
            )));
        }
        if !(1..=1000).contains(&self.poll_timeout_ms) {
            return Err(BridgeError::config("poll_timeout_ms must be within 1-1000"));
        }
        if self.client_read_budget == 0 {
            return Err(BridgeError::config("client_read_budget must be at least 1"));
        }
        Ok(())
    }
}
