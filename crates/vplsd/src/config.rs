//! VPLS configuration and controller settings.
//!
//! The VPLS configuration is a JSON document mapping every customer host to
//! the pseudowire it belongs to:
//!
//! ```json
//! { "hosts": { "h1": 1, "h2": 1, "h3": 2 } }
//! ```

use crate::error::{Result, VplsError};
use crate::types::PwId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

/// Default values for controller settings.
pub mod defaults {
    /// Mirror session used to send control frames to the CPU port.
    pub const MIRROR_ID: u32 = 100;

    /// Frames buffered between capture and dispatch, per switch.
    pub const QUEUE_DEPTH: usize = 1024;

    /// Forwarding-control CLI binary.
    pub const CLI_BINARY: &str = "simple_switch_CLI";

    /// Topology description file.
    pub const TOPOLOGY_FILE: &str = "topology.json";
}

/// Customer membership loaded from the VPLS configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VplsConfig {
    /// Host name to pseudowire id.
    pub hosts: BTreeMap<String, PwId>,
}

impl VplsConfig {
    /// Loads the configuration from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            VplsError::config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_json(&content)
    }

    /// Parses the configuration from a JSON string.
    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content)
            .map_err(|e| VplsError::config(format!("Invalid VPLS configuration: {}", e)))
    }

    /// Pseudowire the host belongs to.
    pub fn customer_of(&self, host: &str) -> Option<PwId> {
        self.hosts.get(host).copied()
    }

    /// All configured pseudowires.
    pub fn pseudowires(&self) -> BTreeSet<PwId> {
        self.hosts.values().copied().collect()
    }
}

/// How equal-cost shortest paths between a PE pair become tunnels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum EcmpPolicy {
    /// Every shortest path becomes an independent tunnel.
    #[default]
    All,
    /// Only the first shortest path per pair is used.
    First,
}

/// Runtime settings for the controller (command line).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerSettings {
    pub mirror_id: u32,
    pub queue_depth: usize,
    pub ecmp: EcmpPolicy,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            mirror_id: defaults::MIRROR_ID,
            queue_depth: defaults::QUEUE_DEPTH,
            ecmp: EcmpPolicy::default(),
        }
    }
}
