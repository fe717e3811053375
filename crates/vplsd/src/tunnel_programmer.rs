//! Installs tunnel forwarding state.
//!
//! A tunnel is programmed in both directions. Every hop forwards frames
//! tagged with the tunnel id towards the destination PE; the destination PE
//! itself strips the tunnel header.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::control::ForwardingControl;
use crate::topology::TopologyGraph;
use crate::types::{Hop, Tunnel};

pub const TUNNEL_FORWARD_TABLE: &str = "tunnel_forward";
pub const TUNNEL_EGRESS_ACTION: &str = "tunnel_egress";
pub const TUNNEL_DECAP_ACTION: &str = "tunnel_decap";

/// One `tunnel_forward` entry on one switch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelRule {
    pub switch: String,
    pub action: &'static str,
    pub match_fields: Vec<String>,
    pub action_params: Vec<String>,
}

/// Counts of a programming run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgramSummary {
    pub installed: usize,
    pub failed: usize,
}

pub struct TunnelProgrammer {
    topology: Arc<dyn TopologyGraph>,
}

impl TunnelProgrammer {
    pub fn new(topology: Arc<dyn TopologyGraph>) -> Self {
        Self { topology }
    }

    /// Entries for one tunnel, forward direction first.
    ///
    /// Tunnels whose endpoints are missing from the topology produce no rules.
    pub fn rules(&self, tunnel: &Tunnel) -> Vec<TunnelRule> {
        let (Some(src), Some(dst)) = (
            self.topology.switch(tunnel.source()),
            self.topology.switch(tunnel.destination()),
        ) else {
            warn!(tunnel_id = %tunnel.id, "Tunnel endpoint unknown to topology");
            return Vec::new();
        };

        let mut rules = Vec::with_capacity(2 * tunnel.hop_count() + 2);
        for (hops, egress_pe) in [(&tunnel.hops, &dst), (&tunnel.reverse_hops, &src)] {
            let match_fields = vec![tunnel.id.to_string(), egress_pe.id.to_string()];
            rules.extend(hops.iter().map(|hop| egress_rule(hop, &match_fields)));
            rules.push(TunnelRule {
                switch: egress_pe.name.clone(),
                action: TUNNEL_DECAP_ACTION,
                match_fields,
                action_params: Vec::new(),
            });
        }
        rules
    }

    /// Installs every rule of every tunnel. Failed entries are logged and
    /// skipped.
    pub async fn program(
        &self,
        tunnels: &[Tunnel],
        controls: &BTreeMap<String, Arc<dyn ForwardingControl>>,
    ) -> ProgramSummary {
        let mut summary = ProgramSummary::default();
        for tunnel in tunnels {
            for rule in self.rules(tunnel) {
                let Some(control) = controls.get(&rule.switch) else {
                    warn!(switch = %rule.switch, tunnel_id = %tunnel.id, "No control handle for switch");
                    summary.failed += 1;
                    continue;
                };
                match control
                    .table_add(
                        TUNNEL_FORWARD_TABLE,
                        rule.action,
                        &rule.match_fields,
                        &rule.action_params,
                    )
                    .await
                {
                    Ok(handle) => {
                        debug!(
                            switch = %rule.switch,
                            tunnel_id = %tunnel.id,
                            action = rule.action,
                            handle,
                            "Installed tunnel entry"
                        );
                        summary.installed += 1;
                    }
                    Err(e) => {
                        warn!(switch = %rule.switch, tunnel_id = %tunnel.id, error = %e, "Failed to install tunnel entry");
                        summary.failed += 1;
                    }
                }
            }
        }
        info!(
            tunnels = tunnels.len(),
            installed = summary.installed,
            failed = summary.failed,
            "Tunnels programmed"
        );
        summary
    }
}

fn egress_rule(hop: &Hop, match_fields: &[String]) -> TunnelRule {
    TunnelRule {
        switch: hop.switch.clone(),
        action: TUNNEL_EGRESS_ACTION,
        match_fields: match_fields.to_vec(),
        action_params: vec![hop.port.to_string()],
    }
}
