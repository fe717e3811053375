//! Controller lifecycle.
//!
//! Setup runs once and in order: every switch is reset and mirrors control
//! frames to its CPU port, tunnels are planned and programmed, broadcast
//! domains are installed. The result is frozen into a [`VplsSnapshot`] and
//! only then is one [`EventListener`] spawned per switch.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::broadcast::{customer_port_map, plan_domains, BroadcastDomainBuilder};
use crate::config::{ControllerSettings, VplsConfig};
use crate::control::ForwardingControl;
use crate::error::{Result, VplsError};
use crate::frame_source::FrameSource;
use crate::handlers::TelemetrySink;
use crate::listener::{EventListener, ListenerReport};
use crate::snapshot::VplsSnapshot;
use crate::topology::TopologyGraph;
use crate::tunnel_planner::TunnelPlanner;
use crate::tunnel_programmer::TunnelProgrammer;
use crate::types::SwitchInfo;

/// Opens the per-switch collaborators.
pub trait SwitchConnector: Send + Sync {
    fn control(&self, switch: &SwitchInfo) -> Result<Arc<dyn ForwardingControl>>;

    fn frame_source(&self, switch: &SwitchInfo) -> Result<Box<dyn FrameSource>>;
}

pub struct Orchestrator {
    topology: Arc<dyn TopologyGraph>,
    config: VplsConfig,
    settings: ControllerSettings,
    controls: BTreeMap<String, Arc<dyn ForwardingControl>>,
}

impl Orchestrator {
    /// Connects to every switch in the topology.
    ///
    /// Switches the connector cannot reach are left out with a warning.
    pub fn new(
        topology: Arc<dyn TopologyGraph>,
        config: VplsConfig,
        settings: ControllerSettings,
        connector: &dyn SwitchConnector,
    ) -> Result<Self> {
        let mut controls = BTreeMap::new();
        for sw in topology.switches() {
            match connector.control(&sw) {
                Ok(control) => {
                    controls.insert(sw.name.clone(), control);
                }
                Err(e) => warn!(switch = %sw.name, error = %e, "Cannot connect to switch, skipping"),
            }
        }
        if controls.is_empty() {
            return Err(VplsError::topology("No reachable switches in topology"));
        }

        Ok(Self {
            topology,
            config,
            settings,
            controls,
        })
    }

    pub fn controls(&self) -> &BTreeMap<String, Arc<dyn ForwardingControl>> {
        &self.controls
    }

    /// Programs every switch and freezes the result.
    pub async fn setup(&self) -> Arc<VplsSnapshot> {
        let switches = self.topology.switches();
        self.prepare_switches(&switches).await;

        for host in self.config.hosts.keys() {
            let attached = switches
                .iter()
                .any(|sw| self.topology.port_between(&sw.name, host).is_some());
            if !attached {
                warn!(host = %host, "Configured host is not attached to any switch");
            }
        }

        let tunnels = TunnelPlanner::new(self.topology.clone(), self.settings.ecmp).plan();
        TunnelProgrammer::new(self.topology.clone())
            .program(&tunnels, &self.controls)
            .await;

        let customer_ports = customer_port_map(self.topology.as_ref(), &self.config);
        let plans = plan_domains(&customer_ports, &tunnels);
        let groups = BroadcastDomainBuilder::new().build(&plans, &self.controls).await;

        let snapshot = VplsSnapshot {
            switches,
            tunnels,
            groups,
            customer_ports,
        };
        info!(summary = ?snapshot.summary(), "Setup complete");
        Arc::new(snapshot)
    }

    async fn prepare_switches(&self, switches: &[SwitchInfo]) {
        for sw in switches {
            let Some(control) = self.controls.get(&sw.name) else {
                continue;
            };
            if let Err(e) = control.reset_state().await {
                warn!(switch = %sw.name, error = %e, "Failed to reset switch state");
            }
            let Some(cpu_port) = sw.cpu_port else {
                warn!(switch = %sw.name, "Switch has no CPU port, control frames will not reach the controller");
                continue;
            };
            if let Err(e) = control.mirroring_add(self.settings.mirror_id, cpu_port).await {
                warn!(switch = %sw.name, cpu_port, error = %e, "Failed to add CPU mirroring session");
            }
        }
    }

    /// Spawns one listener per switch that has a frame source.
    pub fn spawn_listeners(
        &self,
        snapshot: Arc<VplsSnapshot>,
        connector: &dyn SwitchConnector,
        sink: Arc<dyn TelemetrySink>,
        cancel: &CancellationToken,
    ) -> JoinSet<ListenerReport> {
        let mut listeners = JoinSet::new();
        for sw in &snapshot.switches {
            let Some(control) = self.controls.get(&sw.name) else {
                continue;
            };
            let source = match connector.frame_source(sw) {
                Ok(source) => source,
                Err(e) => {
                    warn!(switch = %sw.name, error = %e, "No frame source, switch will not learn");
                    continue;
                }
            };
            let listener = EventListener::new(
                control.clone(),
                source,
                snapshot.clone(),
                sink.clone(),
                self.settings.queue_depth,
            );
            listeners.spawn(listener.run(cancel.child_token()));
        }
        if listeners.is_empty() {
            error!("No frame source could be opened, no switch will learn");
        } else {
            info!(count = listeners.len(), "Listeners spawned");
        }
        listeners
    }

    /// Waits for every listener to stop.
    pub async fn join_listeners(mut listeners: JoinSet<ListenerReport>) -> Vec<ListenerReport> {
        let mut reports = Vec::with_capacity(listeners.len());
        while let Some(result) = listeners.join_next().await {
            match result {
                Ok(report) => reports.push(report),
                Err(e) => error!(error = %e, "Listener task failed"),
            }
        }
        reports.sort_by(|a, b| a.switch.cmp(&b.switch));
        reports
    }

    /// Sets up the switches and listens until `cancel` fires or every frame
    /// source ends. Fails if no listener could be started.
    pub async fn run(
        &self,
        connector: &dyn SwitchConnector,
        sink: Arc<dyn TelemetrySink>,
        cancel: CancellationToken,
    ) -> Result<Vec<ListenerReport>> {
        let snapshot = self.setup().await;
        let listeners = self.spawn_listeners(snapshot, connector, sink, &cancel);
        if listeners.is_empty() {
            return Err(VplsError::capture(
                "every CPU interface",
                "No frame source could be opened",
            ));
        }
        Ok(Self::join_listeners(listeners).await)
    }
}
