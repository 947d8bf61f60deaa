//! Configuration for canvis-rs
//!
//! This module contains the serde-backed configuration structs and TOML
//! load/save helpers. Configuration covers the serial port parameters,
//! SDO transfer defaults and the value registry's refresh interval.
//!
//! # Main Types
//!
//! - [`AppConfig`] - Top-level configuration (port, SDO defaults, registry)
//! - [`PortConfig`] - Serial port name and framing parameters
//! - [`SdoConfig`] - Transfer timeout and default node id
//! - [`RegistryConfig`] - Periodic refresh interval
//!
//! All structs implement `Default` with the values the tool has always
//! shipped with: 115200 8N1, 1000 ms SDO timeout, 100 ms update interval.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{CanVisError, Result, ResultExt};

/// Serial parity setting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Parity {
    /// No parity bit
    #[default]
    None,
    /// Odd parity
    Odd,
    /// Even parity
    Even,
}

/// Serial stop bit setting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum StopBits {
    /// One stop bit
    #[default]
    One,
    /// Two stop bits
    Two,
}

/// Serial port parameters for the bus adapter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortConfig {
    /// Port name (e.g. "/dev/ttyUSB0" or "COM23")
    pub name: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Parity
    pub parity: Parity,
    /// Stop bits
    pub stop_bits: StopBits,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            name: String::from("/dev/ttyUSB0"),
            baud_rate: 115_200,
            parity: Parity::None,
            stop_bits: StopBits::One,
        }
    }
}

/// Defaults applied to newly created SDO transfers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SdoConfig {
    /// Transfer timeout in milliseconds
    pub timeout_ms: u64,
    /// Default node id for new transfers
    pub node_id: u8,
}

impl Default for SdoConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 1000,
            node_id: 1,
        }
    }
}

impl SdoConfig {
    /// Transfer timeout as a `Duration`
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Value registry refresh settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Periodic refresh interval in milliseconds
    pub update_interval_ms: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            update_interval_ms: 100,
        }
    }
}

impl RegistryConfig {
    /// Refresh interval as a `Duration`
    pub fn update_interval(&self) -> Duration {
        Duration::from_millis(self.update_interval_ms)
    }
}

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Serial port parameters
    pub port: PortConfig,
    /// SDO transfer defaults
    pub sdo: SdoConfig,
    /// Value registry settings
    pub registry: RegistryConfig,
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(CanVisError::Io)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        toml::from_str(&contents).map_err(|e| CanVisError::Config(e.to_string()))
    }

    /// Save configuration to a TOML file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let contents =
            toml::to_string_pretty(self).map_err(|e| CanVisError::Config(e.to_string()))?;
        std::fs::write(path, contents)
            .map_err(CanVisError::Io)
            .with_context(|| format!("Failed to write config to {}", path.display()))
    }
}
