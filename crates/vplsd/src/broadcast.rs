//! Per-customer broadcast domains.
//!
//! On every PE switch each pseudowire with local access ports gets one
//! multicast group. Its replication node covers the local access ports plus
//! the ports of every tunnel leading from this switch to another PE that
//! serves the same pseudowire. Frames entering on an access port are mapped
//! to the group through the `broadcast` table.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::VplsConfig;
use crate::control::ForwardingControl;
use crate::error::Result;
use crate::topology::TopologyGraph;
use crate::types::{AccessPort, MulticastGroup, PwId, Tunnel};

pub const BROADCAST_TABLE: &str = "broadcast";
pub const SET_MCAST_GRP_ACTION: &str = "set_mcast_grp";
pub const PORT_TO_PW_TABLE: &str = "port_to_pw";
pub const SET_PW_ID_ACTION: &str = "set_pw_id";

/// Replication id used for every multicast node.
pub const REPLICATION_ID: u16 = 0;

/// Groups every host-facing port by the pseudowire of its host.
///
/// Hosts absent from the configuration are skipped with a warning.
pub fn customer_port_map(
    topology: &dyn TopologyGraph,
    config: &VplsConfig,
) -> BTreeMap<PwId, Vec<AccessPort>> {
    let mut map: BTreeMap<PwId, Vec<AccessPort>> = BTreeMap::new();
    for sw in topology.switches() {
        for host in topology.hosts_connected_to(&sw.name) {
            let Some(pw_id) = config.customer_of(&host) else {
                warn!(host = %host, switch = %sw.name, "Host has no customer configured, skipping");
                continue;
            };
            let Some(port) = topology.port_between(&sw.name, &host) else {
                warn!(host = %host, switch = %sw.name, "No port towards host, skipping");
                continue;
            };
            map.entry(pw_id).or_default().push(AccessPort {
                switch: sw.name.clone(),
                port,
                host,
            });
        }
    }
    map
}

/// The ports one switch floods a pseudowire's broadcast traffic to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastDomainPlan {
    pub switch: String,
    pub pw_id: PwId,
    pub access_ports: BTreeSet<u16>,
    pub tunnel_ports: BTreeSet<u16>,
}

impl BroadcastDomainPlan {
    /// Access ports ∪ tunnel ports; no port appears twice.
    pub fn combined_ports(&self) -> BTreeSet<u16> {
        self.access_ports.union(&self.tunnel_ports).copied().collect()
    }
}

/// Computes the broadcast domain of every (switch, pseudowire) pair that has
/// local access ports. Plans are ordered by switch then pseudowire.
pub fn plan_domains(
    customer_ports: &BTreeMap<PwId, Vec<AccessPort>>,
    tunnels: &[Tunnel],
) -> Vec<BroadcastDomainPlan> {
    let mut plans: BTreeMap<(String, PwId), BroadcastDomainPlan> = BTreeMap::new();

    for (pw_id, ports) in customer_ports {
        let serving: BTreeSet<&str> = ports.iter().map(|p| p.switch.as_str()).collect();

        for access in ports {
            plans
                .entry((access.switch.clone(), *pw_id))
                .or_insert_with(|| BroadcastDomainPlan {
                    switch: access.switch.clone(),
                    pw_id: *pw_id,
                    access_ports: BTreeSet::new(),
                    tunnel_ports: BTreeSet::new(),
                })
                .access_ports
                .insert(access.port);
        }

        for plan in plans.values_mut().filter(|plan| plan.pw_id == *pw_id) {
            for tunnel in tunnels {
                let reaches_customer = tunnel
                    .peer_of(&plan.switch)
                    .is_some_and(|peer| serving.contains(peer));
                if !reaches_customer {
                    continue;
                }
                if let Some(port) = tunnel.egress_port_at(&plan.switch) {
                    plan.tunnel_ports.insert(port);
                }
            }
        }
    }

    plans.into_values().collect()
}

/// Installs broadcast domains and hands out multicast group ids.
#[derive(Debug)]
pub struct BroadcastDomainBuilder {
    /// `None` once every u16 group id has been handed out.
    next_group_id: Option<u16>,
}

impl Default for BroadcastDomainBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl BroadcastDomainBuilder {
    pub fn new() -> Self {
        Self {
            next_group_id: Some(1),
        }
    }

    /// Installs every plan on its switch. Plans whose switch has no control
    /// handle, or whose group cannot be created, are skipped.
    pub async fn build(
        &mut self,
        plans: &[BroadcastDomainPlan],
        controls: &BTreeMap<String, Arc<dyn ForwardingControl>>,
    ) -> Vec<MulticastGroup> {
        let mut groups = Vec::new();
        for plan in plans {
            let Some(control) = controls.get(&plan.switch) else {
                warn!(switch = %plan.switch, "No control handle for switch, skipping broadcast domain");
                continue;
            };
            let Some(group_id) = self.next_group_id else {
                warn!("Multicast group id space exhausted, remaining broadcast domains are dropped");
                break;
            };
            self.next_group_id = group_id.checked_add(1);

            match self.install(group_id, plan, control.as_ref()).await {
                Ok(group) => groups.push(group),
                Err(e) => warn!(
                    switch = %plan.switch,
                    pw_id = %plan.pw_id,
                    group_id,
                    error = %e,
                    "Failed to install broadcast domain"
                ),
            }
        }
        info!(count = groups.len(), "Broadcast domains installed");
        groups
    }

    async fn install(
        &self,
        group_id: u16,
        plan: &BroadcastDomainPlan,
        control: &dyn ForwardingControl,
    ) -> Result<MulticastGroup> {
        let ports = plan.combined_ports();
        let port_list: Vec<u16> = ports.iter().copied().collect();

        control.mc_mgrp_create(group_id).await?;
        let node_handle = control.mc_node_create(REPLICATION_ID, &port_list).await?;
        control.mc_node_associate(group_id, node_handle).await?;

        for &ingress_port in &plan.access_ports {
            let match_fields = vec![ingress_port.to_string(), plan.pw_id.to_string()];
            if let Err(e) = control
                .table_add(
                    BROADCAST_TABLE,
                    SET_MCAST_GRP_ACTION,
                    &match_fields,
                    &[group_id.to_string()],
                )
                .await
            {
                warn!(switch = %plan.switch, ingress_port, error = %e, "Failed to add broadcast entry");
            }

            if let Err(e) = control
                .table_add(
                    PORT_TO_PW_TABLE,
                    SET_PW_ID_ACTION,
                    &[ingress_port.to_string()],
                    &[plan.pw_id.to_string()],
                )
                .await
            {
                warn!(switch = %plan.switch, ingress_port, error = %e, "Failed to add port_to_pw entry");
            }
        }

        debug!(
            switch = %plan.switch,
            pw_id = %plan.pw_id,
            group_id,
            ports = ?port_list,
            "Installed broadcast domain"
        );

        Ok(MulticastGroup {
            id: group_id,
            switch: plan.switch.clone(),
            pw_id: plan.pw_id,
            ports,
            node_handle,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EcmpPolicy;
    use crate::control::RecordingControl;
    use crate::topology::test_topologies::{diamond, switch};
    use crate::topology::StaticTopology;
    use crate::tunnel_planner::TunnelPlanner;
    use pretty_assertions::assert_eq;

    /// h1, h2 on s1; h3 on s2; s1 and s2 directly connected.
    fn two_pe() -> StaticTopology {
        let mut topo = StaticTopology::new();
        topo.add_switch(switch("s1", 1));
        topo.add_switch(switch("s2", 2));
        for host in ["h1", "h2", "h3"] {
            topo.add_host(host);
        }
        topo.add_link("h1", 0, "s1", 1).unwrap();
        topo.add_link("h2", 0, "s1", 2).unwrap();
        topo.add_link("s1", 3, "s2", 3).unwrap();
        topo.add_link("h3", 0, "s2", 1).unwrap();
        topo
    }

    fn controls(
        names: &[&str],
    ) -> (
        BTreeMap<String, Arc<RecordingControl>>,
        BTreeMap<String, Arc<dyn ForwardingControl>>,
    ) {
        let recorders: BTreeMap<String, Arc<RecordingControl>> = names
            .iter()
            .map(|n| (n.to_string(), Arc::new(RecordingControl::new(*n))))
            .collect();
        let dyns = recorders
            .iter()
            .map(|(n, c)| (n.clone(), c.clone() as Arc<dyn ForwardingControl>))
            .collect();
        (recorders, dyns)
    }

    #[test]
    fn test_customer_port_map() {
        let topo = two_pe();
        let config = VplsConfig::from_json(r#"{"hosts": {"h1": 1, "h2": 1, "h3": 2}}"#).unwrap();
        let map = customer_port_map(&topo, &config);

        assert_eq!(map.len(), 2);
        assert_eq!(map[&PwId(1)].len(), 2);
        assert_eq!(map[&PwId(2)].len(), 1);
        assert_eq!(
            map[&PwId(2)][0],
            AccessPort {
                switch: "s2".to_string(),
                port: 1,
                host: "h3".to_string()
            }
        );
    }

    #[test]
    fn test_unconfigured_host_skipped() {
        let topo = two_pe();
        let config = VplsConfig::from_json(r#"{"hosts": {"h1": 1}}"#).unwrap();
        let map = customer_port_map(&topo, &config);
        assert_eq!(map.len(), 1);
        assert_eq!(map[&PwId(1)].len(), 1);
    }

    #[tokio::test]
    async fn test_two_customers_two_groups() {
        let topo: Arc<dyn TopologyGraph> = Arc::new(two_pe());
        let config = VplsConfig::from_json(r#"{"hosts": {"h1": 1, "h2": 1, "h3": 2}}"#).unwrap();
        let tunnels = TunnelPlanner::new(topo.clone(), EcmpPolicy::All).plan();
        let customer_ports = customer_port_map(topo.as_ref(), &config);
        let plans = plan_domains(&customer_ports, &tunnels);
        let (recorders, dyns) = controls(&["s1", "s2"]);

        let groups = BroadcastDomainBuilder::new().build(&plans, &dyns).await;

        assert_eq!(groups.len(), 2);
        assert_eq!(groups.iter().map(|g| g.id).collect::<Vec<_>>(), vec![1, 2]);
        // No other PE serves either customer, so no tunnel ports are added
        assert_eq!(groups[0].ports, BTreeSet::from([1, 2]));
        assert_eq!(groups[1].ports, BTreeSet::from([1]));

        let s1 = &recorders["s1"];
        assert_eq!(s1.multicast_groups().get(&1), Some(&vec![1, 2]));
        let entries = s1.entries(BROADCAST_TABLE);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].match_fields, vec!["1", "1"]);
        assert_eq!(entries[1].match_fields, vec!["2", "1"]);
        assert!(entries.iter().all(|e| e.action_params == vec!["1"]));
        assert_eq!(s1.entry_count(PORT_TO_PW_TABLE), 2);
    }

    #[tokio::test]
    async fn test_shared_customer_includes_tunnel_ports() {
        let topo: Arc<dyn TopologyGraph> = Arc::new(diamond());
        let config =
            VplsConfig::from_json(r#"{"hosts": {"h1": 5, "h4": 5, "h5": 6}}"#).unwrap();
        let tunnels = TunnelPlanner::new(topo.clone(), EcmpPolicy::All).plan();
        let plans = plan_domains(&customer_port_map(topo.as_ref(), &config), &tunnels);

        let s1 = plans.iter().find(|p| p.switch == "s1").unwrap();
        assert_eq!(s1.access_ports, BTreeSet::from([1]));
        assert_eq!(s1.tunnel_ports, BTreeSet::from([2, 3]));
        assert_eq!(s1.combined_ports(), BTreeSet::from([1, 2, 3]));

        let s4 = plans.iter().find(|p| p.switch == "s4").unwrap();
        assert_eq!(s4.access_ports, BTreeSet::from([1]));
        assert_eq!(s4.tunnel_ports, BTreeSet::from([2, 3]));

        let s5 = plans.iter().find(|p| p.switch == "s5").unwrap();
        assert!(s5.tunnel_ports.is_empty());
    }

    #[tokio::test]
    async fn test_group_ids_strictly_increasing() {
        let topo: Arc<dyn TopologyGraph> = Arc::new(diamond());
        let config =
            VplsConfig::from_json(r#"{"hosts": {"h1": 5, "h4": 5, "h5": 6}}"#).unwrap();
        let tunnels = TunnelPlanner::new(topo.clone(), EcmpPolicy::All).plan();
        let plans = plan_domains(&customer_port_map(topo.as_ref(), &config), &tunnels);
        let (_recorders, dyns) = controls(&["s1", "s2", "s3", "s4", "s5"]);

        let groups = BroadcastDomainBuilder::new().build(&plans, &dyns).await;

        let ids: Vec<u16> = groups.iter().map(|g| g.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_failed_group_is_skipped() {
        let topo: Arc<dyn TopologyGraph> = Arc::new(two_pe());
        let config = VplsConfig::from_json(r#"{"hosts": {"h1": 1, "h2": 1, "h3": 2}}"#).unwrap();
        let plans = plan_domains(&customer_port_map(topo.as_ref(), &config), &[]);
        let (recorders, dyns) = controls(&["s1", "s2"]);
        recorders["s1"].fail_on("mc_mgrp_create");

        let groups = BroadcastDomainBuilder::new().build(&plans, &dyns).await;

        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].switch, "s2");
        assert_eq!(groups[0].id, 2);
        assert_eq!(recorders["s1"].entry_count(BROADCAST_TABLE), 0);
    }

    #[tokio::test]
    async fn test_group_id_space_exhausted() {
        let topo: Arc<dyn TopologyGraph> = Arc::new(two_pe());
        let config = VplsConfig::from_json(r#"{"hosts": {"h1": 1, "h2": 1, "h3": 2}}"#).unwrap();
        let plans = plan_domains(&customer_port_map(topo.as_ref(), &config), &[]);
        let (recorders, dyns) = controls(&["s1", "s2"]);
        let mut builder = BroadcastDomainBuilder {
            next_group_id: Some(u16::MAX),
        };

        let groups = builder.build(&plans, &dyns).await;

        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].id, u16::MAX);
        assert_eq!(groups[0].switch, "s1");
        assert!(recorders["s2"].multicast_groups().is_empty());
        assert!(builder.build(&plans, &dyns).await.is_empty());
    }
}
