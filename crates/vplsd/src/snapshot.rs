//! Frozen result of the setup phase.
//!
//! Listeners only read it; it is shared as `Arc<VplsSnapshot>` once every
//! switch has been programmed.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::types::{AccessPort, MulticastGroup, PwId, SwitchInfo, Tunnel, TunnelId};

#[derive(Debug, Clone, Default)]
pub struct VplsSnapshot {
    pub switches: Vec<SwitchInfo>,
    pub tunnels: Vec<Tunnel>,
    pub groups: Vec<MulticastGroup>,
    pub customer_ports: BTreeMap<PwId, Vec<AccessPort>>,
}

impl VplsSnapshot {
    pub fn tunnel(&self, id: TunnelId) -> Option<&Tunnel> {
        self.tunnels.iter().find(|t| t.id == id)
    }

    /// True if some host is configured for `pw_id`.
    pub fn has_pseudowire(&self, pw_id: PwId) -> bool {
        self.customer_ports
            .get(&pw_id)
            .is_some_and(|ports| !ports.is_empty())
    }

    pub fn groups_on<'a>(&'a self, switch: &'a str) -> impl Iterator<Item = &'a MulticastGroup> + 'a {
        self.groups.iter().filter(move |g| g.switch == switch)
    }

    pub fn summary(&self) -> SnapshotSummary {
        SnapshotSummary {
            switches: self.switches.len(),
            tunnels: self.tunnels.len(),
            multicast_groups: self.groups.len(),
            pseudowires: self.customer_ports.len(),
        }
    }
}

/// Setup totals, logged once the snapshot is frozen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SnapshotSummary {
    pub switches: usize,
    pub tunnels: usize,
    pub multicast_groups: usize,
    pub pseudowires: usize,
}
