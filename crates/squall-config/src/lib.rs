//! Configuration management for Squall
//!
//! Provides hierarchical configuration loading from multiple sources:
//! 1. Environment variables (SQUALL_* prefix, highest precedence)
//! 2. squall.local.toml (gitignored, local overrides)
//! 3. squall.toml (git-tracked, project config)
//! 4. Built-in defaults (lowest precedence)
//!
//! The loaded [`SquallConfig`] is a frozen value threaded explicitly through
//! constructors; there is no global singleton.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};
use squall_types::{MemberAddr, MemberPorts, MessageHeader};

mod error;
mod loader;
mod params;

pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use params::{MulticastParams, SendAlgorithm};

/// Main Squall configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SquallConfig {
    pub group: GroupConfig,
    pub multicast: MulticastParams,
    pub p2p: P2pConfig,
    pub info: InfoConfig,
    /// Per-subgroup multicast parameter profiles, keyed by profile name.
    pub profile: HashMap<String, MulticastParams>,
}

impl SquallConfig {
    /// Resolves the multicast parameters for a named profile, falling back
    /// to the `[multicast]` defaults when no such profile exists.
    pub fn multicast_profile(&self, name: &str) -> MulticastParams {
        self.profile
            .get(name)
            .cloned()
            .unwrap_or_else(|| self.multicast.clone())
    }

    /// The transport address this node advertises to peers.
    pub fn local_addr(&self) -> Result<MemberAddr, ConfigError> {
        let ip: Ipv4Addr = self
            .group
            .local_ip
            .parse()
            .map_err(|_| ConfigError::ValidationError(format!(
                "local_ip {:?} is not a valid IPv4 address",
                self.group.local_ip
            )))?;
        Ok(MemberAddr {
            ip,
            ports: MemberPorts {
                gms: self.group.gms_port,
                state_transfer: self.group.state_transfer_port,
                sst: self.group.sst_port,
                rdmc: self.group.rdmc_port,
                external: self.group.external_port,
            },
        })
    }

    /// Checks cross-field constraints that serde defaults cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.multicast.validate()?;
        for (name, params) in &self.profile {
            params
                .validate()
                .map_err(|e| ConfigError::ValidationError(format!("profile {name:?}: {e}")))?;
        }
        if self.group.local_id > self.group.max_node_id {
            return Err(ConfigError::ValidationError(format!(
                "local_id {} exceeds max_node_id {}",
                self.group.local_id, self.group.max_node_id
            )));
        }
        if self.p2p.p2p_window_size == 0 {
            return Err(ConfigError::ValidationError(
                "p2p_window_size must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Group membership and bootstrap settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupConfig {
    /// Address of the contact leader a joiner connects to.
    pub contact_ip: String,
    pub contact_port: u16,
    /// This node's ID; must not exceed `max_node_id`.
    pub local_id: u32,
    pub local_ip: String,
    pub gms_port: u16,
    pub state_transfer_port: u16,
    pub sst_port: u16,
    pub rdmc_port: u16,
    pub external_port: u16,
    /// Interval between heartbeat ticks; peers silent for longer are suspected.
    pub heartbeat_ms: u32,
    pub restart_timeout_ms: u32,
    /// Allows installing a view smaller than a majority of its predecessor.
    pub disable_partitioning_safety: bool,
    pub max_node_id: u32,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            contact_ip: "127.0.0.1".to_string(),
            contact_port: 23580,
            local_id: 0,
            local_ip: "127.0.0.1".to_string(),
            gms_port: 23580,
            state_transfer_port: 28366,
            sst_port: 37683,
            rdmc_port: 31675,
            external_port: 32645,
            heartbeat_ms: 100,
            restart_timeout_ms: 2000,
            disable_partitioning_safety: false,
            max_node_id: 1024,
        }
    }
}

/// Peer-to-peer connection settings for non-member subgroup access.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct P2pConfig {
    pub p2p_window_size: u32,
    pub max_p2p_request_payload_size: u64,
    pub max_p2p_reply_payload_size: u64,
}

impl Default for P2pConfig {
    fn default() -> Self {
        Self {
            p2p_window_size: 16,
            max_p2p_request_payload_size: 10_240,
            max_p2p_reply_payload_size: 10_240,
        }
    }
}

impl P2pConfig {
    /// Maximum on-wire message size for a p2p request, header included.
    pub fn max_request_msg_size(&self) -> u64 {
        self.max_p2p_request_payload_size + MessageHeader::SIZE as u64
    }

    pub fn max_reply_msg_size(&self) -> u64 {
        self.max_p2p_reply_payload_size + MessageHeader::SIZE as u64
    }
}

/// Push rates for the application-visible info fields. These are hints: the
/// engine pushes no more often than this, never on a deadline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InfoConfig {
    pub load_info_rate_us: u64,
    pub cache_info_rate_us: u64,
}

impl Default for InfoConfig {
    fn default() -> Self {
        Self {
            load_info_rate_us: 100_000,
            cache_info_rate_us: 500_000,
        }
    }
}
