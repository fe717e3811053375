//! Pseudowire tunnel planning.
//!
//! PE switches are the switches with at least one attached host. Every
//! unordered PE pair gets one tunnel per shortest path between them.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::EcmpPolicy;
use crate::error::{Result, VplsError};
use crate::topology::TopologyGraph;
use crate::types::{Hop, Tunnel, TunnelId};

pub struct TunnelPlanner {
    topology: Arc<dyn TopologyGraph>,
    ecmp: EcmpPolicy,
}

impl TunnelPlanner {
    pub fn new(topology: Arc<dyn TopologyGraph>, ecmp: EcmpPolicy) -> Self {
        Self { topology, ecmp }
    }

    /// Switches with at least one directly connected host, in topology order.
    pub fn pe_switches(&self) -> Vec<String> {
        self.topology
            .switches()
            .into_iter()
            .filter(|sw| !self.topology.hosts_connected_to(&sw.name).is_empty())
            .map(|sw| sw.name)
            .collect()
    }

    /// Resolves a switch path into (switch, egress port) hops.
    pub fn path_hops(&self, path: &[String]) -> Result<Vec<Hop>> {
        path.windows(2)
            .map(|pair| {
                let (sw, next) = (&pair[0], &pair[1]);
                self.topology
                    .port_between(sw, next)
                    .map(|port| Hop::new(sw.clone(), port))
                    .ok_or_else(|| {
                        VplsError::topology(format!("No adjacency port from {} to {}", sw, next))
                    })
            })
            .collect()
    }

    /// Computes every tunnel between PE pairs.
    ///
    /// Tunnel ids are assigned sequentially from 1 in pair/path order.
    /// Structurally identical hop sequences are kept once.
    pub fn plan(&self) -> Vec<Tunnel> {
        let pe_switches = self.pe_switches();
        info!(pe_switches = ?pe_switches, "Planning pseudowire tunnels");

        let mut tunnels = Vec::new();
        let mut seen: HashSet<Vec<Hop>> = HashSet::new();
        let mut next_id: u16 = 1;

        for (i, sw1) in pe_switches.iter().enumerate() {
            for sw2 in &pe_switches[i + 1..] {
                let mut paths = self.topology.shortest_paths(sw1, sw2);
                if paths.is_empty() {
                    warn!(from = %sw1, to = %sw2, "No path between PE switches, skipping pair");
                    continue;
                }
                if self.ecmp == EcmpPolicy::First {
                    paths.truncate(1);
                }

                for path in paths {
                    let tunnel = match self.build_tunnel(TunnelId(next_id), path) {
                        Ok(tunnel) => tunnel,
                        Err(e) => {
                            warn!(from = %sw1, to = %sw2, error = %e, "Skipping tunnel path");
                            continue;
                        }
                    };
                    if !seen.insert(tunnel.hops.clone()) {
                        continue;
                    }

                    debug!(
                        tunnel_id = %tunnel.id,
                        path = ?tunnel.path,
                        hops = tunnel.hop_count(),
                        "Planned tunnel"
                    );
                    tunnels.push(tunnel);

                    next_id = match next_id.checked_add(1) {
                        Some(id) => id,
                        None => {
                            warn!("Tunnel id space exhausted, remaining paths are dropped");
                            return tunnels;
                        }
                    };
                }
            }
        }

        info!(count = tunnels.len(), "Tunnel planning complete");
        tunnels
    }

    fn build_tunnel(&self, id: TunnelId, path: Vec<String>) -> Result<Tunnel> {
        let hops = self.path_hops(&path)?;
        let reversed: Vec<String> = path.iter().rev().cloned().collect();
        let reverse_hops = self.path_hops(&reversed)?;
        Ok(Tunnel {
            id,
            path,
            hops,
            reverse_hops,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::test_topologies::{chain, diamond, switch};
    use crate::topology::StaticTopology;
    use crate::types::SwitchInfo;
    use pretty_assertions::assert_eq;

    fn planner(topo: StaticTopology, ecmp: EcmpPolicy) -> TunnelPlanner {
        TunnelPlanner::new(Arc::new(topo), ecmp)
    }

    #[test]
    fn test_pe_switches() {
        let p = planner(diamond(), EcmpPolicy::All);
        assert_eq!(p.pe_switches(), vec!["s1", "s4", "s5"]);
    }

    #[test]
    fn test_three_hop_tunnel_ports() {
        let p = planner(chain(), EcmpPolicy::All);
        let tunnels = p.plan();

        assert_eq!(tunnels.len(), 1);
        let tunnel = &tunnels[0];
        assert_eq!(tunnel.id, TunnelId(1));
        assert_eq!(tunnel.hop_count(), 3);
        assert_eq!(
            tunnel.hops,
            vec![Hop::new("s1", 2), Hop::new("s2", 2), Hop::new("s3", 2)]
        );
        assert_eq!(
            tunnel.reverse_hops,
            vec![Hop::new("s4", 1), Hop::new("s3", 1), Hop::new("s2", 1)]
        );
        assert_eq!(tunnel.ports(), vec![2, 2, 2]);
    }

    #[test]
    fn test_ecmp_paths_are_independent_tunnels() {
        let p = planner(diamond(), EcmpPolicy::All);
        let tunnels = p.plan();

        // s1-s4 has two equal-cost paths, s5 is isolated
        assert_eq!(tunnels.len(), 2);
        assert_eq!(tunnels[0].path, vec!["s1", "s2", "s4"]);
        assert_eq!(tunnels[1].path, vec!["s1", "s3", "s4"]);
        assert_eq!(tunnels[0].id, TunnelId(1));
        assert_eq!(tunnels[1].id, TunnelId(2));
        for tunnel in &tunnels {
            assert_eq!(tunnel.hop_count(), 2);
            assert!(tunnel.connects("s1") && tunnel.connects("s4"));
        }
        assert!(tunnels.iter().all(|t| !t.connects("s5")));
    }

    #[test]
    fn test_ecmp_first_keeps_one_path() {
        let p = planner(diamond(), EcmpPolicy::First);
        let tunnels = p.plan();
        assert_eq!(tunnels.len(), 1);
        assert_eq!(tunnels[0].path, vec!["s1", "s2", "s4"]);
    }

    #[test]
    fn test_no_pe_switches() {
        let mut topo = StaticTopology::new();
        topo.add_switch(switch("s1", 1));
        topo.add_switch(switch("s2", 2));
        topo.add_link("s1", 1, "s2", 1).unwrap();

        assert!(planner(topo, EcmpPolicy::All).plan().is_empty());
    }

    #[test]
    fn test_missing_adjacency_port() {
        let p = planner(chain(), EcmpPolicy::All);
        let path: Vec<String> = vec!["s1".into(), "s3".into()];
        assert!(matches!(p.path_hops(&path), Err(VplsError::Topology(_))));
    }

    /// Two switches whose only reported path crosses a switch with no port
    /// towards its successor, alongside one resolvable path.
    struct BrokenPathTopology {
        inner: StaticTopology,
    }

    impl TopologyGraph for BrokenPathTopology {
        fn switches(&self) -> Vec<SwitchInfo> {
            self.inner.switches()
        }

        fn switch(&self, name: &str) -> Option<SwitchInfo> {
            self.inner.switch(name)
        }

        fn hosts_connected_to(&self, switch: &str) -> Vec<String> {
            self.inner.hosts_connected_to(switch)
        }

        fn port_between(&self, node: &str, neighbor: &str) -> Option<u16> {
            self.inner.port_between(node, neighbor)
        }

        fn shortest_paths(&self, from: &str, to: &str) -> Vec<Vec<String>> {
            let mut paths = vec![vec![from.to_string(), "s9".to_string(), to.to_string()]];
            paths.extend(self.inner.shortest_paths(from, to));
            paths
        }
    }

    #[test]
    fn test_unresolvable_path_is_skipped() {
        let p = TunnelPlanner::new(
            Arc::new(BrokenPathTopology { inner: diamond() }),
            EcmpPolicy::All,
        );
        let tunnels = p.plan();

        assert_eq!(tunnels.len(), 2);
        assert_eq!(tunnels[0].path, vec!["s1", "s2", "s4"]);
        assert_eq!(tunnels[1].path, vec!["s1", "s3", "s4"]);
        assert_eq!(
            tunnels.iter().map(|t| t.id).collect::<Vec<_>>(),
            vec![TunnelId(1), TunnelId(2)]
        );
    }
}
