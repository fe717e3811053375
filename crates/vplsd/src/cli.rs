//! `simple_switch_CLI` adapter for [`ForwardingControl`].
//!
//! Each call is rendered as one runtime command and written to the stdin of
//! a CLI process bound to the switch's thrift port. The CLI exits 0 even when
//! a command is rejected, so failures are detected from its output.

use std::process::Stdio;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, trace, warn};

use crate::control::{EntryHandle, ForwardingControl, NodeHandle};
use crate::error::{Result, VplsError};

static HANDLE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"handle (\d+)").expect("Invalid regex pattern"));

/// Builds a `table_add` runtime command.
pub fn build_table_add_cmd(
    table: &str,
    action: &str,
    match_fields: &[String],
    action_params: &[String],
) -> String {
    format!(
        "table_add {} {} {} => {}",
        table,
        action,
        match_fields.join(" "),
        action_params.join(" ")
    )
    .trim_end()
    .to_string()
}

/// Builds a `table_modify` runtime command.
pub fn build_table_modify_cmd(
    table: &str,
    action: &str,
    handle: EntryHandle,
    action_params: &[String],
) -> String {
    format!(
        "table_modify {} {} {} => {}",
        table,
        action,
        handle,
        action_params.join(" ")
    )
    .trim_end()
    .to_string()
}

pub fn build_mirroring_add_cmd(mirror_id: u32, port: u16) -> String {
    format!("mirroring_add {} {}", mirror_id, port)
}

pub fn build_mc_mgrp_create_cmd(group_id: u16) -> String {
    format!("mc_mgrp_create {}", group_id)
}

pub fn build_mc_node_create_cmd(replication_id: u16, ports: &[u16]) -> String {
    let ports: Vec<String> = ports.iter().map(u16::to_string).collect();
    format!("mc_node_create {} {}", replication_id, ports.join(" "))
}

pub fn build_mc_node_associate_cmd(group_id: u16, handle: NodeHandle) -> String {
    format!("mc_node_associate {} {}", group_id, handle)
}

/// Extracts the last `handle N` reported by the CLI.
pub fn parse_handle(output: &str) -> Option<u32> {
    HANDLE_RE
        .captures_iter(output)
        .last()
        .and_then(|caps| caps[1].parse().ok())
}

/// Returns the first line in which the CLI reports a rejected command.
pub fn cli_error(output: &str) -> Option<&str> {
    output
        .lines()
        .map(str::trim)
        .find(|line| line.contains("Error") || line.contains("Invalid"))
}

/// Forwarding control through the switch runtime CLI.
#[derive(Debug, Clone)]
pub struct CliControl {
    switch: String,
    thrift_port: u16,
    cli: String,
}

impl CliControl {
    pub fn new(switch: impl Into<String>, thrift_port: u16, cli: impl Into<String>) -> Self {
        Self {
            switch: switch.into(),
            thrift_port,
            cli: cli.into(),
        }
    }

    async fn run(&self, operation: &str, command: &str) -> Result<String> {
        debug!(switch = %self.switch, command = %command, "Sending runtime command");
        let fail = |message: String| VplsError::control_plane(&self.switch, operation, message);

        let mut child = Command::new(&self.cli)
            .arg("--thrift-port")
            .arg(self.thrift_port.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| fail(format!("Failed to start {}: {}", self.cli, e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            let line = format!("{}\n", command);
            if let Err(e) = stdin.write_all(line.as_bytes()).await {
                warn!(switch = %self.switch, error = %e, "Failed to write runtime command");
            }
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| fail(format!("Failed to wait for {}: {}", self.cli, e)))?;
        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

        if !output.status.success() {
            let code = output.status.code().unwrap_or(-1);
            let detail = if stderr.is_empty() { &stdout } else { &stderr };
            return Err(fail(format!("{} exited with {}: {}", self.cli, code, detail)));
        }
        if let Some(line) = cli_error(&stdout) {
            return Err(fail(line.to_string()));
        }
        trace!(switch = %self.switch, output = %stdout, "Runtime command accepted");
        Ok(stdout)
    }

    async fn run_for_handle(&self, operation: &str, command: &str) -> Result<u32> {
        let output = self.run(operation, command).await?;
        parse_handle(&output).ok_or_else(|| {
            VplsError::control_plane(
                &self.switch,
                operation,
                format!("No handle in CLI output: {}", output),
            )
        })
    }
}

#[async_trait]
impl ForwardingControl for CliControl {
    fn switch_name(&self) -> &str {
        &self.switch
    }

    async fn reset_state(&self) -> Result<()> {
        self.run("reset_state", "reset_state").await.map(|_| ())
    }

    async fn mirroring_add(&self, mirror_id: u32, port: u16) -> Result<()> {
        self.run("mirroring_add", &build_mirroring_add_cmd(mirror_id, port))
            .await
            .map(|_| ())
    }

    async fn table_add(
        &self,
        table: &str,
        action: &str,
        match_fields: &[String],
        action_params: &[String],
    ) -> Result<EntryHandle> {
        let cmd = build_table_add_cmd(table, action, match_fields, action_params);
        self.run_for_handle("table_add", &cmd).await
    }

    async fn table_modify(
        &self,
        table: &str,
        action: &str,
        handle: EntryHandle,
        action_params: &[String],
    ) -> Result<()> {
        let cmd = build_table_modify_cmd(table, action, handle, action_params);
        self.run("table_modify", &cmd).await.map(|_| ())
    }

    async fn mc_mgrp_create(&self, group_id: u16) -> Result<()> {
        self.run("mc_mgrp_create", &build_mc_mgrp_create_cmd(group_id))
            .await
            .map(|_| ())
    }

    async fn mc_node_create(&self, replication_id: u16, ports: &[u16]) -> Result<NodeHandle> {
        let cmd = build_mc_node_create_cmd(replication_id, ports);
        self.run_for_handle("mc_node_create", &cmd).await
    }

    async fn mc_node_associate(&self, group_id: u16, handle: NodeHandle) -> Result<()> {
        self.run(
            "mc_node_associate",
            &build_mc_node_associate_cmd(group_id, handle),
        )
        .await
        .map(|_| ())
    }
}
