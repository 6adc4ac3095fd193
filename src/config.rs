//! Stream configuration
//!
//! Mirrors what a host framework passes per PCM device: the remote
//! address, the transport to ask for, and optional codec overrides that
//! narrow negotiation instead of letting it pick defaults.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::codec::{Allocation, ChannelMode};
use crate::error::ConfigError;
use crate::transport::TransportPreference;

/// What to do when the data socket is not writable at transmit time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverrunPolicy {
    /// Drop the packet and keep the clock running (real-time bias)
    #[default]
    DropPacket,
    /// Surface the stall to the writer
    Fail,
}

/// Per-stream configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StreamConfig {
    /// Remote device address, colon-separated ("00:11:22:33:44:55")
    pub device: String,

    #[serde(default)]
    pub profile: TransportPreference,

    /// Ask the service to establish the link if it is down
    #[serde(default = "default_autoconnect")]
    pub autoconnect: bool,

    #[serde(default)]
    pub overrun: OverrunPolicy,

    /// Codec overrides; unset fields are negotiated from capabilities
    #[serde(default)]
    pub rate: Option<u32>,
    #[serde(default)]
    pub mode: Option<ChannelMode>,
    #[serde(default)]
    pub allocation: Option<Allocation>,
    #[serde(default)]
    pub subbands: Option<u8>,
    #[serde(default)]
    pub blocks: Option<u8>,
    #[serde(default)]
    pub bitpool: Option<u8>,
}

fn default_autoconnect() -> bool {
    true
}

impl StreamConfig {
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            profile: TransportPreference::default(),
            autoconnect: true,
            overrun: OverrunPolicy::default(),
            rate: None,
            mode: None,
            allocation: None,
            subbands: None,
            blocks: None,
            bitpool: None,
        }
    }

    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: StreamConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> crate::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(Self::from_toml_str(&raw)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device.is_empty() {
            return Err(ConfigError::MissingDevice);
        }
        if let Some(rate) = self.rate {
            if crate::codec::sbc::rate_to_bit(rate).is_none() {
                return Err(invalid("rate", format!("{rate} Hz is not an SBC rate")));
            }
        }
        if let Some(subbands) = self.subbands {
            if !matches!(subbands, 4 | 8) {
                return Err(invalid("subbands", format!("{subbands} (expected 4 or 8)")));
            }
        }
        if let Some(blocks) = self.blocks {
            if !matches!(blocks, 4 | 8 | 12 | 16) {
                return Err(invalid(
                    "blocks",
                    format!("{blocks} (expected 4, 8, 12 or 16)"),
                ));
            }
        }
        if let Some(bitpool) = self.bitpool {
            if !(crate::constants::MIN_BITPOOL..=crate::constants::MAX_BITPOOL)
                .contains(&bitpool)
            {
                return Err(invalid(
                    "bitpool",
                    format!(
                        "{bitpool} (expected {}..={})",
                        crate::constants::MIN_BITPOOL,
                        crate::constants::MAX_BITPOOL
                    ),
                ));
            }
        }
        Ok(())
    }
}

fn invalid(key: &'static str, reason: String) -> ConfigError {
    ConfigError::InvalidValue { key, reason }
}
