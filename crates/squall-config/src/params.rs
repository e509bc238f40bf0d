//! Multicast data-plane parameters.
//!
//! A [`MulticastParams`] bundle configures one subgroup's data planes: the
//! block/slot size cutoff, the block-plane chunking and dissemination
//! algorithm, and the in-flight window. Named profiles in the configuration
//! file (`[profile.<name>]`) override the `[multicast]` defaults per
//! subgroup.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use squall_types::MessageHeader;

use crate::ConfigError;

/// Block dissemination algorithm for the bulk (block) plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SendAlgorithm {
    /// Binomial-tree forwarding; log-depth, the default.
    #[default]
    #[serde(rename = "binomial_send")]
    Binomial,
    /// Pipeline relay through members in shard order.
    #[serde(rename = "chain_send")]
    Chain,
    /// The sender transmits every block to each receiver directly.
    #[serde(rename = "sequential_send")]
    Sequential,
    /// Binary-tree forwarding.
    #[serde(rename = "tree_send")]
    Tree,
}

impl SendAlgorithm {
    pub fn as_str(self) -> &'static str {
        match self {
            SendAlgorithm::Binomial => "binomial_send",
            SendAlgorithm::Chain => "chain_send",
            SendAlgorithm::Sequential => "sequential_send",
            SendAlgorithm::Tree => "tree_send",
        }
    }
}

impl fmt::Display for SendAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SendAlgorithm {
    type Err = ConfigError;

    /// Unknown algorithm names are a configuration error, surfaced at load
    /// time rather than at first send.
    fn from_str(s: &str) -> Result<Self, ConfigError> {
        match s {
            "binomial_send" => Ok(SendAlgorithm::Binomial),
            "chain_send" => Ok(SendAlgorithm::Chain),
            "sequential_send" => Ok(SendAlgorithm::Sequential),
            "tree_send" => Ok(SendAlgorithm::Tree),
            other => Err(ConfigError::InvalidSendAlgorithm(other.to_string())),
        }
    }
}

/// Low-level parameters for one subgroup's multicast planes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MulticastParams {
    /// Maximum payload size for a multicast message. Determines buffer
    /// allocation for the block plane.
    pub max_payload_size: u64,
    /// Maximum payload size of a reply to an ordered RPC send.
    pub max_reply_payload_size: u64,
    /// Maximum payload size eligible for the slot (SMC) plane. Larger
    /// messages go to the block plane.
    pub max_smc_payload_size: u64,
    /// Block-plane chunk size in bytes.
    pub block_size: u64,
    /// In-flight messages allowed per sender before sends backpressure.
    pub window_size: u32,
    /// Dissemination algorithm for the block plane.
    pub rdmc_send_algorithm: SendAlgorithm,
    /// Milliseconds of sender silence before a null message is injected on
    /// its behalf to keep the round-robin order advancing.
    pub sender_timeout_ms: u32,
}

impl Default for MulticastParams {
    fn default() -> Self {
        Self {
            max_payload_size: 10_240,
            max_reply_payload_size: 10_240,
            max_smc_payload_size: 1_024,
            block_size: 1_048_576,
            window_size: 16,
            rdmc_send_algorithm: SendAlgorithm::Binomial,
            sender_timeout_ms: 1_000,
        }
    }
}

impl MulticastParams {
    /// Full on-wire size of the largest multicast message: payload plus
    /// header, rounded up to a whole number of blocks when the block plane
    /// is in play.
    pub fn max_msg_size(&self) -> u64 {
        Self::compute_max_msg_size(
            self.max_payload_size,
            self.block_size,
            self.max_payload_size > self.max_smc_payload_size,
        )
    }

    /// Maximum on-wire size of a slot-plane message, header included.
    pub fn sst_max_msg_size(&self) -> u64 {
        self.max_smc_payload_size + MessageHeader::SIZE as u64
    }

    /// Maximum on-wire size of an RPC reply message.
    pub fn max_reply_msg_size(&self) -> u64 {
        self.max_reply_payload_size + MessageHeader::SIZE as u64
    }

    pub fn compute_max_msg_size(max_payload_size: u64, block_size: u64, using_rdmc: bool) -> u64 {
        let mut max_msg_size = max_payload_size + MessageHeader::SIZE as u64;
        if using_rdmc && max_msg_size % block_size != 0 {
            max_msg_size = (max_msg_size / block_size + 1) * block_size;
        }
        max_msg_size
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.block_size == 0 {
            return Err(ConfigError::ValidationError(
                "block_size must be positive".into(),
            ));
        }
        if self.window_size == 0 {
            return Err(ConfigError::ValidationError(
                "window_size must be positive".into(),
            ));
        }
        if self.max_smc_payload_size > self.max_payload_size {
            return Err(ConfigError::ValidationError(format!(
                "max_smc_payload_size {} exceeds max_payload_size {}",
                self.max_smc_payload_size, self.max_payload_size
            )));
        }
        Ok(())
    }
}
