//! Forwarding-control surface of a switch.
//!
//! Every switch gets its own [`ForwardingControl`] handle. The controller
//! only needs a handful of runtime operations: resetting state, mirroring,
//! exact-match table entries and the multicast replication engine.
//! [`RecordingControl`] keeps the resulting switch state in memory; it backs
//! `--dry-run` and the tests.

use crate::cli;
use crate::error::{Result, VplsError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use tracing::debug;

/// Handle of an installed table entry.
pub type EntryHandle = u32;

/// Handle of a multicast replication node.
pub type NodeHandle = u32;

/// Per-switch forwarding-control API.
#[async_trait]
pub trait ForwardingControl: Send + Sync {
    /// Switch this handle talks to.
    fn switch_name(&self) -> &str;

    /// Clears all tables and multicast state.
    async fn reset_state(&self) -> Result<()>;

    /// Mirrors `mirror_id` sessions to `port`.
    async fn mirroring_add(&self, mirror_id: u32, port: u16) -> Result<()>;

    /// Installs an entry; fails if the match key already exists.
    async fn table_add(
        &self,
        table: &str,
        action: &str,
        match_fields: &[String],
        action_params: &[String],
    ) -> Result<EntryHandle>;

    /// Rewrites the action of an existing entry.
    async fn table_modify(
        &self,
        table: &str,
        action: &str,
        handle: EntryHandle,
        action_params: &[String],
    ) -> Result<()>;

    async fn mc_mgrp_create(&self, group_id: u16) -> Result<()>;

    /// Creates a replication node over `ports`.
    async fn mc_node_create(&self, replication_id: u16, ports: &[u16]) -> Result<NodeHandle>;

    async fn mc_node_associate(&self, group_id: u16, handle: NodeHandle) -> Result<()>;
}

/// An installed table entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableEntry {
    pub handle: EntryHandle,
    pub action: String,
    pub match_fields: Vec<String>,
    pub action_params: Vec<String>,
}

#[derive(Debug, Default)]
struct RecordedState {
    commands: Vec<String>,
    tables: BTreeMap<String, Vec<TableEntry>>,
    next_entry_handle: EntryHandle,
    mirrors: BTreeMap<u32, u16>,
    groups: BTreeMap<u16, Vec<NodeHandle>>,
    nodes: BTreeMap<NodeHandle, (u16, Vec<u16>)>,
    next_node_handle: NodeHandle,
}

/// In-memory switch that records every call.
#[derive(Debug)]
pub struct RecordingControl {
    switch: String,
    state: Mutex<RecordedState>,
    failing: Mutex<HashSet<String>>,
    failing_tables: Mutex<HashSet<String>>,
}

impl RecordingControl {
    pub fn new(switch: impl Into<String>) -> Self {
        Self {
            switch: switch.into(),
            state: Mutex::new(RecordedState::default()),
            failing: Mutex::new(HashSet::new()),
            failing_tables: Mutex::new(HashSet::new()),
        }
    }

    /// Makes every subsequent call of `operation` fail.
    pub fn fail_on(&self, operation: &str) {
        self.failing.lock().insert(operation.to_string());
    }

    /// Makes `table_add` fail for `table` only.
    pub fn fail_table_add(&self, table: &str) {
        self.failing_tables.lock().insert(table.to_string());
    }

    /// Clears every injected failure.
    pub fn recover(&self) {
        self.failing.lock().clear();
        self.failing_tables.lock().clear();
    }

    /// Commands issued so far, in CLI syntax.
    pub fn commands(&self) -> Vec<String> {
        self.state.lock().commands.clone()
    }

    pub fn entries(&self, table: &str) -> Vec<TableEntry> {
        self.state.lock().tables.get(table).cloned().unwrap_or_default()
    }

    pub fn entry_count(&self, table: &str) -> usize {
        self.state.lock().tables.get(table).map_or(0, Vec::len)
    }

    /// Multicast group id to the ports of its associated nodes.
    pub fn multicast_groups(&self) -> BTreeMap<u16, Vec<u16>> {
        let state = self.state.lock();
        state
            .groups
            .iter()
            .map(|(group, handles)| {
                let ports = handles
                    .iter()
                    .filter_map(|h| state.nodes.get(h))
                    .flat_map(|(_, ports)| ports.iter().copied())
                    .collect();
                (*group, ports)
            })
            .collect()
    }

    pub fn mirrors(&self) -> BTreeMap<u32, u16> {
        self.state.lock().mirrors.clone()
    }

    fn check(&self, operation: &str) -> Result<()> {
        if self.failing.lock().contains(operation) {
            return Err(VplsError::control_plane(
                &self.switch,
                operation,
                "injected failure",
            ));
        }
        Ok(())
    }

    fn record(&self, state: &mut RecordedState, command: String) {
        debug!(switch = %self.switch, command = %command, "Recorded control command");
        state.commands.push(command);
    }
}

#[async_trait]
impl ForwardingControl for RecordingControl {
    fn switch_name(&self) -> &str {
        &self.switch
    }

    async fn reset_state(&self) -> Result<()> {
        self.check("reset_state")?;
        let mut state = self.state.lock();
        let commands = std::mem::take(&mut state.commands);
        *state = RecordedState {
            commands,
            ..RecordedState::default()
        };
        self.record(&mut state, "reset_state".to_string());
        Ok(())
    }

    async fn mirroring_add(&self, mirror_id: u32, port: u16) -> Result<()> {
        self.check("mirroring_add")?;
        let mut state = self.state.lock();
        state.mirrors.insert(mirror_id, port);
        self.record(&mut state, cli::build_mirroring_add_cmd(mirror_id, port));
        Ok(())
    }

    async fn table_add(
        &self,
        table: &str,
        action: &str,
        match_fields: &[String],
        action_params: &[String],
    ) -> Result<EntryHandle> {
        self.check("table_add")?;
        if self.failing_tables.lock().contains(table) {
            return Err(VplsError::control_plane(
                &self.switch,
                "table_add",
                format!("injected failure on {}", table),
            ));
        }
        let mut state = self.state.lock();
        let duplicate = state
            .tables
            .get(table)
            .is_some_and(|entries| entries.iter().any(|e| e.match_fields == match_fields));
        if duplicate {
            return Err(VplsError::control_plane(
                &self.switch,
                "table_add",
                format!("Duplicate entry in {}: {}", table, match_fields.join(" ")),
            ));
        }

        let handle = state.next_entry_handle;
        state.next_entry_handle += 1;
        state.tables.entry(table.to_string()).or_default().push(TableEntry {
            handle,
            action: action.to_string(),
            match_fields: match_fields.to_vec(),
            action_params: action_params.to_vec(),
        });
        self.record(
            &mut state,
            cli::build_table_add_cmd(table, action, match_fields, action_params),
        );
        Ok(handle)
    }

    async fn table_modify(
        &self,
        table: &str,
        action: &str,
        handle: EntryHandle,
        action_params: &[String],
    ) -> Result<()> {
        self.check("table_modify")?;
        let mut state = self.state.lock();
        let entry = state
            .tables
            .get_mut(table)
            .and_then(|entries| entries.iter_mut().find(|e| e.handle == handle))
            .ok_or_else(|| {
                VplsError::control_plane(
                    &self.switch,
                    "table_modify",
                    format!("Invalid handle {} in {}", handle, table),
                )
            })?;
        entry.action = action.to_string();
        entry.action_params = action_params.to_vec();
        self.record(
            &mut state,
            cli::build_table_modify_cmd(table, action, handle, action_params),
        );
        Ok(())
    }

    async fn mc_mgrp_create(&self, group_id: u16) -> Result<()> {
        self.check("mc_mgrp_create")?;
        let mut state = self.state.lock();
        if state.groups.contains_key(&group_id) {
            return Err(VplsError::control_plane(
                &self.switch,
                "mc_mgrp_create",
                format!("Group {} already exists", group_id),
            ));
        }
        state.groups.insert(group_id, Vec::new());
        self.record(&mut state, cli::build_mc_mgrp_create_cmd(group_id));
        Ok(())
    }

    async fn mc_node_create(&self, replication_id: u16, ports: &[u16]) -> Result<NodeHandle> {
        self.check("mc_node_create")?;
        let mut state = self.state.lock();
        let handle = state.next_node_handle;
        state.next_node_handle += 1;
        state.nodes.insert(handle, (replication_id, ports.to_vec()));
        self.record(
            &mut state,
            cli::build_mc_node_create_cmd(replication_id, ports),
        );
        Ok(handle)
    }

    async fn mc_node_associate(&self, group_id: u16, handle: NodeHandle) -> Result<()> {
        self.check("mc_node_associate")?;
        let mut state = self.state.lock();
        if !state.nodes.contains_key(&handle) {
            return Err(VplsError::control_plane(
                &self.switch,
                "mc_node_associate",
                format!("Invalid node handle {}", handle),
            ));
        }
        state
            .groups
            .get_mut(&group_id)
            .ok_or_else(|| {
                VplsError::control_plane(
                    &self.switch,
                    "mc_node_associate",
                    format!("Invalid group {}", group_id),
                )
            })?
            .push(handle);
        self.record(&mut state, cli::build_mc_node_associate_cmd(group_id, handle));
        Ok(())
    }
}
