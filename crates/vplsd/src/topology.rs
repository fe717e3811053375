//! Read-only topology graph.
//!
//! The controller only queries the topology: which hosts hang off a switch,
//! which local port leads to a neighbor, and all shortest switch paths between
//! two switches. [`StaticTopology`] answers those queries from a JSON
//! description of the network:
//!
//! ```json
//! {
//!   "switches": {
//!     "s1": { "id": 1, "thrift_port": 9090, "cpu_port": 4, "cpu_intf": "s1-cpu-eth1" }
//!   },
//!   "hosts": ["h1"],
//!   "links": [
//!     { "node1": "h1", "port1": 0, "node2": "s1", "port2": 1 }
//!   ]
//! }
//! ```

use crate::error::{Result, VplsError};
use crate::types::SwitchInfo;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fs;
use std::path::Path;
use tracing::debug;

/// Read-only graph queries used by the planners.
pub trait TopologyGraph: Send + Sync {
    /// All programmable switches, ordered by name.
    fn switches(&self) -> Vec<SwitchInfo>;

    fn switch(&self, name: &str) -> Option<SwitchInfo>;

    /// Hosts directly attached to `switch`, ordered by name.
    fn hosts_connected_to(&self, switch: &str) -> Vec<String>;

    /// Local port on `node` that leads to `neighbor`.
    fn port_between(&self, node: &str, neighbor: &str) -> Option<u16>;

    /// Every shortest path between two switches, transiting switches only.
    ///
    /// Each path starts with `from` and ends with `to`. Disconnected or
    /// unknown switches yield an empty list.
    fn shortest_paths(&self, from: &str, to: &str) -> Vec<Vec<String>>;
}

#[derive(Debug, Deserialize)]
struct TopologyFile {
    switches: BTreeMap<String, SwitchEntry>,
    #[serde(default)]
    hosts: Vec<String>,
    #[serde(default)]
    links: Vec<LinkEntry>,
}

#[derive(Debug, Deserialize)]
struct SwitchEntry {
    id: u16,
    thrift_port: u16,
    #[serde(default)]
    cpu_port: Option<u16>,
    #[serde(default)]
    cpu_intf: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LinkEntry {
    node1: String,
    port1: u16,
    node2: String,
    port2: u16,
}

/// In-memory topology graph.
#[derive(Debug, Clone, Default)]
pub struct StaticTopology {
    switches: BTreeMap<String, SwitchInfo>,
    hosts: BTreeSet<String>,
    /// node -> neighbor -> local port on node
    adjacency: BTreeMap<String, BTreeMap<String, u16>>,
}

impl StaticTopology {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a topology description from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            VplsError::topology(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let file: TopologyFile = serde_json::from_str(content)
            .map_err(|e| VplsError::topology(format!("Invalid topology description: {}", e)))?;

        let mut topo = Self::new();
        for (name, entry) in file.switches {
            topo.add_switch(SwitchInfo {
                name,
                id: entry.id,
                thrift_port: entry.thrift_port,
                cpu_port: entry.cpu_port,
                cpu_intf: entry.cpu_intf,
            });
        }
        for host in file.hosts {
            topo.add_host(host);
        }
        for link in file.links {
            topo.add_link(&link.node1, link.port1, &link.node2, link.port2)?;
        }

        debug!(
            switches = topo.switches.len(),
            hosts = topo.hosts.len(),
            "Loaded topology"
        );
        Ok(topo)
    }

    pub fn add_switch(&mut self, info: SwitchInfo) {
        self.switches.insert(info.name.clone(), info);
    }

    pub fn add_host(&mut self, name: impl Into<String>) {
        self.hosts.insert(name.into());
    }

    /// Connects `a` (on `port_a`) to `b` (on `port_b`). Both nodes must exist.
    pub fn add_link(&mut self, a: &str, port_a: u16, b: &str, port_b: u16) -> Result<()> {
        for node in [a, b] {
            if !self.is_node(node) {
                return Err(VplsError::topology(format!("Link references unknown node {}", node)));
            }
        }
        self.adjacency
            .entry(a.to_string())
            .or_default()
            .insert(b.to_string(), port_a);
        self.adjacency
            .entry(b.to_string())
            .or_default()
            .insert(a.to_string(), port_b);
        Ok(())
    }

    fn is_node(&self, name: &str) -> bool {
        self.switches.contains_key(name) || self.hosts.contains(name)
    }

    fn switch_neighbors<'a>(&'a self, node: &str) -> impl Iterator<Item = &'a str> + 'a {
        self.adjacency
            .get(node)
            .into_iter()
            .flat_map(|neighbors| neighbors.keys())
            .map(String::as_str)
            .filter(move |name| self.switches.contains_key(*name))
    }

    /// Hop distance from every reachable switch to `target`.
    fn distances_to<'a>(&'a self, target: &'a str) -> HashMap<&'a str, usize> {
        let mut dist = HashMap::new();
        let mut queue = VecDeque::new();
        dist.insert(target, 0);
        queue.push_back(target);

        while let Some(node) = queue.pop_front() {
            let d = dist[node];
            for next in self.switch_neighbors(node) {
                if !dist.contains_key(next) {
                    dist.insert(next, d + 1);
                    queue.push_back(next);
                }
            }
        }
        dist
    }

    fn collect_paths<'a>(
        &'a self,
        node: &'a str,
        target: &str,
        dist: &HashMap<&'a str, usize>,
        current: &mut Vec<&'a str>,
        out: &mut Vec<Vec<String>>,
    ) {
        current.push(node);
        if node == target {
            out.push(current.iter().map(|s| s.to_string()).collect());
        } else if let Some(&d) = dist.get(node) {
            for next in self.switch_neighbors(node) {
                if dist.get(next) == Some(&(d - 1)) {
                    self.collect_paths(next, target, dist, current, out);
                }
            }
        }
        current.pop();
    }
}

impl TopologyGraph for StaticTopology {
    fn switches(&self) -> Vec<SwitchInfo> {
        self.switches.values().cloned().collect()
    }

    fn switch(&self, name: &str) -> Option<SwitchInfo> {
        self.switches.get(name).cloned()
    }

    fn hosts_connected_to(&self, switch: &str) -> Vec<String> {
        self.adjacency
            .get(switch)
            .into_iter()
            .flat_map(|neighbors| neighbors.keys())
            .filter(|name| self.hosts.contains(*name))
            .cloned()
            .collect()
    }

    fn port_between(&self, node: &str, neighbor: &str) -> Option<u16> {
        self.adjacency.get(node)?.get(neighbor).copied()
    }

    fn shortest_paths(&self, from: &str, to: &str) -> Vec<Vec<String>> {
        let (Some((from, _)), Some((to, _))) = (
            self.switches.get_key_value(from),
            self.switches.get_key_value(to),
        ) else {
            return Vec::new();
        };
        if from == to {
            return Vec::new();
        }

        let dist = self.distances_to(to);
        let mut paths = Vec::new();
        if dist.contains_key(from.as_str()) {
            self.collect_paths(from, to, &dist, &mut Vec::new(), &mut paths);
        }
        paths
    }
}


#[cfg(test)]
mod tests {
    use super::test_topologies::*;
    use super::*;
    use pretty_assertions::assert_eq;

    fn names(path: &[&str]) -> Vec<String> {
        path.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_hosts_and_ports() {
        let topo = chain();
        assert_eq!(topo.hosts_connected_to("s1"), vec!["h1".to_string()]);
        assert!(topo.hosts_connected_to("s2").is_empty());
        assert_eq!(topo.port_between("s1", "s2"), Some(2));
        assert_eq!(topo.port_between("s2", "s1"), Some(1));
        assert_eq!(topo.port_between("s1", "s3"), None);
    }

    #[test]
    fn test_single_shortest_path() {
        let topo = chain();
        assert_eq!(
            topo.shortest_paths("s1", "s4"),
            vec![names(&["s1", "s2", "s3", "s4"])]
        );
    }

    #[test]
    fn test_equal_cost_paths_in_name_order() {
        let topo = diamond();
        assert_eq!(
            topo.shortest_paths("s1", "s4"),
            vec![names(&["s1", "s2", "s4"]), names(&["s1", "s3", "s4"])]
        );
    }

    #[test]
    fn test_disconnected_and_unknown() {
        let topo = diamond();
        assert!(topo.shortest_paths("s1", "s5").is_empty());
        assert!(topo.shortest_paths("s1", "s9").is_empty());
        assert!(topo.shortest_paths("s1", "s1").is_empty());
    }

    #[test]
    fn test_paths_do_not_transit_hosts() {
        let mut topo = StaticTopology::new();
        topo.add_switch(switch("s1", 1));
        topo.add_switch(switch("s2", 2));
        topo.add_host("h1");
        topo.add_link("s1", 1, "h1", 0).unwrap();
        topo.add_link("h1", 1, "s2", 1).unwrap();

        assert!(topo.shortest_paths("s1", "s2").is_empty());
    }

    #[test]
    fn test_link_to_unknown_node() {
        let mut topo = StaticTopology::new();
        topo.add_switch(switch("s1", 1));
        let err = topo.add_link("s1", 1, "s2", 1).unwrap_err();
        assert!(matches!(err, VplsError::Topology(_)));
    }

    #[test]
    fn test_from_json() {
        let topo = StaticTopology::from_json(
            r#"{
                "switches": {
                    "s1": {"id": 1, "thrift_port": 9090, "cpu_port": 4, "cpu_intf": "s1-cpu-eth1"},
                    "s2": {"id": 2, "thrift_port": 9091}
                },
                "hosts": ["h1"],
                "links": [
                    {"node1": "h1", "port1": 0, "node2": "s1", "port2": 1},
                    {"node1": "s1", "port1": 2, "node2": "s2", "port2": 1}
                ]
            }"#,
        )
        .unwrap();

        let s1 = topo.switch("s1").unwrap();
        assert_eq!(s1.cpu_port, Some(4));
        assert_eq!(s1.cpu_intf.as_deref(), Some("s1-cpu-eth1"));
        assert_eq!(topo.switch("s2").unwrap().cpu_port, None);
        assert_eq!(topo.switches().len(), 2);
        assert_eq!(topo.shortest_paths("s2", "s1"), vec![names(&["s2", "s1"])]);
    }

    #[test]
    fn test_from_json_invalid() {
        assert!(StaticTopology::from_json("{}").is_err());
    }
}
