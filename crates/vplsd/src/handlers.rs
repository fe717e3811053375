//! Control event handlers.
//!
//! [`MacLearningHandler`] turns learn notifications into `smac`/`dmac`
//! entries on the switch that raised them. [`RttReportHandler`] forwards
//! round-trip samples to a [`TelemetrySink`].

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::codec::{CpuHeader, RttHeader};
use crate::control::{EntryHandle, ForwardingControl};
use crate::error::Result;
use crate::snapshot::VplsSnapshot;
use crate::types::{MacAddress, PwId, TunnelId};

pub const SMAC_TABLE: &str = "smac";
pub const DMAC_TABLE: &str = "dmac";
pub const NO_ACTION: &str = "NoAction";
pub const FORWARD_ACTION: &str = "forward";
pub const FORWARD_TUNNEL_ACTION: &str = "forward_tunnel";

/// Where a learned MAC was last seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LearnedEntry {
    pub ingress_port: u16,
    pub tunnel_id: TunnelId,
    pub dmac_handle: EntryHandle,
    /// False until the `smac` entry is on the switch; retried on the next learn.
    pub smac_installed: bool,
}

impl LearnedEntry {
    fn action(&self) -> &'static str {
        if self.tunnel_id.is_local() {
            FORWARD_ACTION
        } else {
            FORWARD_TUNNEL_ACTION
        }
    }

    fn action_params(&self) -> Vec<String> {
        if self.tunnel_id.is_local() {
            vec![self.ingress_port.to_string()]
        } else {
            vec![self.ingress_port.to_string(), self.tunnel_id.to_string()]
        }
    }

    fn same_location(&self, other: &LearnedEntry) -> bool {
        self.ingress_port == other.ingress_port && self.tunnel_id == other.tunnel_id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LearnOutcome {
    /// New entries were added, or a missing `smac` entry was retried.
    Installed,
    /// The MAC moved; its `dmac` entry was rewritten.
    Refreshed,
    /// Already learned at the same location.
    Unchanged,
    /// Pseudowire or tunnel unknown; nothing installed.
    Rejected,
}

/// Per-switch MAC learning state.
pub struct MacLearningHandler {
    control: Arc<dyn ForwardingControl>,
    snapshot: Arc<VplsSnapshot>,
    learned: HashMap<(MacAddress, PwId), LearnedEntry>,
}

impl MacLearningHandler {
    pub fn new(control: Arc<dyn ForwardingControl>, snapshot: Arc<VplsSnapshot>) -> Self {
        Self {
            control,
            snapshot,
            learned: HashMap::new(),
        }
    }

    pub fn switch_name(&self) -> &str {
        self.control.switch_name()
    }

    pub fn learned(&self, mac: MacAddress, pw_id: PwId) -> Option<&LearnedEntry> {
        self.learned.get(&(mac, pw_id))
    }

    pub fn learned_count(&self) -> usize {
        self.learned.len()
    }

    pub async fn handle(&mut self, header: &CpuHeader) -> Result<LearnOutcome> {
        let switch = self.control.switch_name().to_string();
        let mac = header.src_addr;
        let pw_id = header.pw_id;

        if mac.is_multicast() {
            warn!(switch = %switch, mac = %mac, "Learn for multicast source address, ignoring");
            return Ok(LearnOutcome::Rejected);
        }
        if !self.snapshot.has_pseudowire(pw_id) {
            warn!(switch = %switch, mac = %mac, pw_id = %pw_id, "Learn for unknown pseudowire, ignoring");
            return Ok(LearnOutcome::Rejected);
        }
        if !header.tunnel_id.is_local() && self.snapshot.tunnel(header.tunnel_id).is_none() {
            warn!(
                switch = %switch,
                mac = %mac,
                tunnel_id = %header.tunnel_id,
                "Learn for unknown tunnel, ignoring"
            );
            return Ok(LearnOutcome::Rejected);
        }

        let mut entry = LearnedEntry {
            ingress_port: header.ingress_port,
            tunnel_id: header.tunnel_id,
            dmac_handle: 0,
            smac_installed: false,
        };
        let match_fields = vec![mac.to_string(), pw_id.to_string()];

        if let Some(existing) = self.learned.get_mut(&(mac, pw_id)) {
            if existing.same_location(&entry) {
                if existing.smac_installed {
                    debug!(switch = %switch, mac = %mac, pw_id = %pw_id, "MAC already learned");
                    return Ok(LearnOutcome::Unchanged);
                }
                existing.smac_installed = add_smac(self.control.as_ref(), &match_fields).await;
                return Ok(if existing.smac_installed {
                    LearnOutcome::Installed
                } else {
                    LearnOutcome::Unchanged
                });
            }
            entry.dmac_handle = existing.dmac_handle;
            entry.smac_installed = existing.smac_installed;
            self.control
                .table_modify(
                    DMAC_TABLE,
                    entry.action(),
                    entry.dmac_handle,
                    &entry.action_params(),
                )
                .await?;
            if !entry.smac_installed {
                entry.smac_installed = add_smac(self.control.as_ref(), &match_fields).await;
            }
            info!(
                switch = %switch,
                mac = %mac,
                pw_id = %pw_id,
                from_port = existing.ingress_port,
                to_port = entry.ingress_port,
                tunnel_id = %entry.tunnel_id,
                "MAC moved"
            );
            *existing = entry;
            return Ok(LearnOutcome::Refreshed);
        }

        entry.dmac_handle = self
            .control
            .table_add(DMAC_TABLE, entry.action(), &match_fields, &entry.action_params())
            .await?;
        // smac goes in last: once present, the switch stops reporting the MAC.
        entry.smac_installed = add_smac(self.control.as_ref(), &match_fields).await;
        self.learned.insert((mac, pw_id), entry);

        info!(
            switch = %switch,
            mac = %mac,
            pw_id = %pw_id,
            ingress_port = entry.ingress_port,
            tunnel_id = %entry.tunnel_id,
            smac = entry.smac_installed,
            "Learned MAC"
        );
        Ok(LearnOutcome::Installed)
    }
}

async fn add_smac(control: &dyn ForwardingControl, match_fields: &[String]) -> bool {
    match control
        .table_add(SMAC_TABLE, NO_ACTION, match_fields, &[])
        .await
    {
        Ok(_) => true,
        Err(e) => {
            warn!(
                switch = %control.switch_name(),
                key = %match_fields.join(" "),
                error = %e,
                "Failed to add smac entry, will retry on next learn"
            );
            false
        }
    }
}

/// One round-trip sample.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RttRecord {
    pub switch: String,
    pub customer_id: PwId,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub rtt: u64,
}

/// Destination of RTT samples.
pub trait TelemetrySink: Send + Sync {
    fn record(&self, record: &RttRecord);
}

/// Logs samples under the `vpls::rtt` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl TelemetrySink for TracingSink {
    fn record(&self, record: &RttRecord) {
        info!(
            target: "vpls::rtt",
            switch = %record.switch,
            customer_id = %record.customer_id,
            src = %record.src,
            dst = %record.dst,
            rtt = record.rtt,
            "RTT report"
        );
    }
}

/// Keeps samples in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<RttRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<RttRecord> {
        self.records.lock().clone()
    }
}

impl TelemetrySink for MemorySink {
    fn record(&self, record: &RttRecord) {
        self.records.lock().push(record.clone());
    }
}

pub struct RttReportHandler {
    switch: String,
    sink: Arc<dyn TelemetrySink>,
}

impl RttReportHandler {
    pub fn new(switch: impl Into<String>, sink: Arc<dyn TelemetrySink>) -> Self {
        Self {
            switch: switch.into(),
            sink,
        }
    }

    pub fn handle(&self, header: &RttHeader) -> RttRecord {
        let record = RttRecord {
            switch: self.switch.clone(),
            customer_id: header.customer_id,
            src: header.ip_addr_src,
            dst: header.ip_addr_dst,
            rtt: header.rtt,
        };
        self.sink.record(&record);
        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::RecordingControl;
    use crate::types::{AccessPort, Hop, Tunnel};
    use pretty_assertions::assert_eq;

    fn snapshot() -> Arc<VplsSnapshot> {
        let mut snap = VplsSnapshot::default();
        snap.customer_ports.insert(
            PwId(1),
            vec![AccessPort {
                switch: "s1".to_string(),
                port: 1,
                host: "h1".to_string(),
            }],
        );
        snap.tunnels.push(Tunnel {
            id: TunnelId(4),
            path: vec!["s1".to_string(), "s2".to_string()],
            hops: vec![Hop::new("s1", 3)],
            reverse_hops: vec![Hop::new("s2", 3)],
        });
        Arc::new(snap)
    }

    fn learn(mac: &str, tunnel_id: u16, pw_id: u16, ingress_port: u16) -> CpuHeader {
        CpuHeader {
            src_addr: mac.parse().unwrap(),
            tunnel_id: TunnelId(tunnel_id),
            pw_id: PwId(pw_id),
            ingress_port,
        }
    }

    fn handler() -> (Arc<RecordingControl>, MacLearningHandler) {
        let control = Arc::new(RecordingControl::new("s1"));
        let handler = MacLearningHandler::new(control.clone(), snapshot());
        (control, handler)
    }

    #[tokio::test]
    async fn test_local_learn_installs_smac_and_dmac() {
        let (control, mut handler) = handler();
        let outcome = handler.handle(&learn("00:00:0a:00:00:01", 0, 1, 1)).await.unwrap();

        assert_eq!(outcome, LearnOutcome::Installed);
        let dmac = control.entries(DMAC_TABLE);
        assert_eq!(dmac.len(), 1);
        assert_eq!(dmac[0].action, FORWARD_ACTION);
        assert_eq!(dmac[0].match_fields, vec!["00:00:0a:00:00:01", "1"]);
        assert_eq!(dmac[0].action_params, vec!["1"]);
        assert_eq!(control.entries(SMAC_TABLE)[0].action, NO_ACTION);
    }

    #[tokio::test]
    async fn test_duplicate_learn_single_entry() {
        let (control, mut handler) = handler();
        let header = learn("00:00:0a:00:00:01", 0, 1, 1);

        assert_eq!(handler.handle(&header).await.unwrap(), LearnOutcome::Installed);
        assert_eq!(handler.handle(&header).await.unwrap(), LearnOutcome::Unchanged);

        assert_eq!(control.entry_count(DMAC_TABLE), 1);
        assert_eq!(control.entry_count(SMAC_TABLE), 1);
        assert_eq!(handler.learned_count(), 1);
    }

    #[tokio::test]
    async fn test_tunnel_learn_and_move() {
        let (control, mut handler) = handler();
        handler.handle(&learn("00:00:0a:00:00:02", 4, 1, 3)).await.unwrap();

        let dmac = control.entries(DMAC_TABLE);
        assert_eq!(dmac[0].action, FORWARD_TUNNEL_ACTION);
        assert_eq!(dmac[0].action_params, vec!["3", "4"]);

        // Host moved behind a local port
        let outcome = handler.handle(&learn("00:00:0a:00:00:02", 0, 1, 1)).await.unwrap();
        assert_eq!(outcome, LearnOutcome::Refreshed);
        let dmac = control.entries(DMAC_TABLE);
        assert_eq!(dmac.len(), 1);
        assert_eq!(dmac[0].action, FORWARD_ACTION);
        assert_eq!(dmac[0].action_params, vec!["1"]);
        assert_eq!(
            handler.learned("00:00:0a:00:00:02".parse().unwrap(), PwId(1)).map(|e| e.ingress_port),
            Some(1)
        );
    }

    #[tokio::test]
    async fn test_unknown_pw_or_tunnel_rejected() {
        let (control, mut handler) = handler();
        let unknown_pw = handler.handle(&learn("00:00:0a:00:00:03", 0, 9, 1)).await.unwrap();
        let unknown_tunnel = handler.handle(&learn("00:00:0a:00:00:03", 7, 1, 1)).await.unwrap();
        let multicast = handler.handle(&learn("01:00:5e:00:00:01", 0, 1, 1)).await.unwrap();

        assert_eq!(unknown_pw, LearnOutcome::Rejected);
        assert_eq!(unknown_tunnel, LearnOutcome::Rejected);
        assert_eq!(multicast, LearnOutcome::Rejected);
        assert!(control.commands().is_empty());
    }

    #[tokio::test]
    async fn test_dmac_failure_propagates() {
        let (control, mut handler) = handler();
        control.fail_on("table_add");
        let header = learn("00:00:0a:00:00:04", 0, 1, 2);

        assert!(handler.handle(&header).await.is_err());
        assert_eq!(handler.learned_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_smac_is_retried() {
        let (control, mut handler) = handler();
        control.fail_table_add(SMAC_TABLE);
        let header = learn("00:00:0a:00:00:05", 0, 1, 1);
        let mac = header.src_addr;

        assert_eq!(handler.handle(&header).await.unwrap(), LearnOutcome::Installed);
        assert_eq!(control.entry_count(DMAC_TABLE), 1);
        assert_eq!(control.entry_count(SMAC_TABLE), 0);
        assert_eq!(handler.learned(mac, PwId(1)).map(|e| e.smac_installed), Some(false));

        // Still failing: nothing new on the switch, state unchanged
        assert_eq!(handler.handle(&header).await.unwrap(), LearnOutcome::Unchanged);
        assert_eq!(control.entry_count(SMAC_TABLE), 0);

        control.recover();
        assert_eq!(handler.handle(&header).await.unwrap(), LearnOutcome::Installed);
        assert_eq!(control.entry_count(SMAC_TABLE), 1);
        assert_eq!(control.entry_count(DMAC_TABLE), 1);
        assert_eq!(handler.learned(mac, PwId(1)).map(|e| e.smac_installed), Some(true));

        assert_eq!(handler.handle(&header).await.unwrap(), LearnOutcome::Unchanged);
        assert_eq!(control.entry_count(SMAC_TABLE), 1);
    }

    #[tokio::test]
    async fn test_move_retries_missing_smac() {
        let (control, mut handler) = handler();
        control.fail_table_add(SMAC_TABLE);
        handler.handle(&learn("00:00:0a:00:00:06", 4, 1, 3)).await.unwrap();
        control.recover();

        let outcome = handler.handle(&learn("00:00:0a:00:00:06", 0, 1, 1)).await.unwrap();

        assert_eq!(outcome, LearnOutcome::Refreshed);
        assert_eq!(control.entry_count(SMAC_TABLE), 1);
        assert_eq!(control.entry_count(DMAC_TABLE), 1);
    }

    #[test]
    fn test_rtt_report_reaches_sink() {
        let sink = Arc::new(MemorySink::new());
        let handler = RttReportHandler::new("s2", sink.clone());
        let record = handler.handle(&RttHeader {
            customer_id: PwId(1),
            ip_addr_src: Ipv4Addr::new(10, 0, 1, 1),
            ip_addr_dst: Ipv4Addr::new(10, 0, 1, 2),
            rtt: 1500,
        });

        assert_eq!(sink.records(), vec![record.clone()]);
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["src"], "10.0.1.1");
        assert_eq!(json["rtt"], 1500);
    }
}
