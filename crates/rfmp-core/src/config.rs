//! Typed configuration for an RFMP node.
//!
//! The host process hands the engine a fully-typed record; parsing a config
//! file into it is the host's problem. Unknown keys are rejected at
//! deserialization time (`deny_unknown_fields`), so a typo'd option fails
//! loudly instead of silently using a default.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use rfmp_proto::Callsign;

/// Errors raised by [`Config::validate`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// `node.callsign` missing or unparseable.
    #[error("invalid node callsign: {0}")]
    Callsign(String),

    /// `protocol.destination` unparseable.
    #[error("invalid destination callsign: {0}")]
    Destination(String),

    /// A numeric option is outside its accepted range.
    #[error("{option} out of range: {detail}")]
    OutOfRange {
        /// Option path, e.g. `protocol.mtu`.
        option: &'static str,
        /// What range it must sit in.
        detail: &'static str,
    },
}

/// Complete node configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    /// Station identity.
    pub node: NodeConfig,
    /// TNC endpoint.
    pub network: NetworkConfig,
    /// Protocol tuning.
    pub protocol: ProtocolConfig,
    /// Persistence.
    pub storage: StorageConfig,
}

/// Station identity.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct NodeConfig {
    /// Base callsign, required. Uppercase ASCII, 1-6 characters.
    pub callsign: String,
    /// SSID 0-15.
    pub ssid: u8,
}

/// TNC endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct NetworkConfig {
    /// KISS-over-TCP host.
    pub tnc_host: String,
    /// KISS-over-TCP port.
    pub tnc_port: u16,
    /// Disable wire I/O entirely (tests, import tooling).
    pub offline_mode: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self { tnc_host: "127.0.0.1".to_string(), tnc_port: 8001, offline_mode: false }
    }
}

/// Protocol tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ProtocolConfig {
    /// Air MTU: maximum RFMP payload bytes per UI frame.
    pub mtu: u16,
    /// Seconds between SYNC emissions (jittered ±20%).
    pub sync_interval_s: u32,
    /// Width of one Bloom window in seconds.
    pub bloom_window_s: u32,
    /// log2 of the Bloom bit count.
    pub bloom_m_log2: u8,
    /// Bloom hash count.
    pub bloom_k: u8,
    /// REQ token bucket: frames per minute.
    pub req_per_minute: u32,
    /// Destination group callsign all RFMP traffic is addressed to.
    pub destination: String,
    /// TX queue depth above which backpressure engages.
    pub queue_high_water: u32,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            mtu: 200,
            sync_interval_s: 30,
            bloom_window_s: 600,
            bloom_m_log2: 10,
            bloom_k: 4,
            req_per_minute: 6,
            destination: "RFMP".to_string(),
            queue_high_water: 1000,
        }
    }
}

/// Persistence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct StorageConfig {
    /// Path of the embedded database file.
    pub database_path: std::path::PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { database_path: std::path::PathBuf::from("rfmp.redb") }
    }
}

impl Config {
    /// Check every option against its accepted range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.local_callsign()?;
        self.destination_callsign()?;
        if self.protocol.mtu < 64 || self.protocol.mtu > 1024 {
            return Err(ConfigError::OutOfRange {
                option: "protocol.mtu",
                detail: "must be 64..=1024",
            });
        }
        if !(6..=14).contains(&self.protocol.bloom_m_log2) {
            return Err(ConfigError::OutOfRange {
                option: "protocol.bloom_m_log2",
                detail: "must be 6..=14",
            });
        }
        if !(1..=8).contains(&self.protocol.bloom_k) {
            return Err(ConfigError::OutOfRange {
                option: "protocol.bloom_k",
                detail: "must be 1..=8",
            });
        }
        if self.protocol.sync_interval_s == 0 || self.protocol.bloom_window_s == 0 {
            return Err(ConfigError::OutOfRange {
                option: "protocol.sync_interval_s",
                detail: "intervals must be non-zero",
            });
        }
        if self.protocol.req_per_minute == 0 {
            return Err(ConfigError::OutOfRange {
                option: "protocol.req_per_minute",
                detail: "must be at least 1",
            });
        }
        Ok(())
    }

    /// The node's own callsign with SSID applied.
    pub fn local_callsign(&self) -> Result<Callsign, ConfigError> {
        Callsign::with_ssid(&self.node.callsign, self.node.ssid)
            .map_err(|e| ConfigError::Callsign(e.to_string()))
    }

    /// The fixed destination callsign for outbound frames.
    pub fn destination_callsign(&self) -> Result<Callsign, ConfigError> {
        Callsign::parse(&self.protocol.destination)
            .map_err(|e| ConfigError::Destination(e.to_string()))
    }
}
