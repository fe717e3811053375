//! VPLS control plane for programmable switches.
//!
//! vplsd emulates a layer-2 VPN over a fabric of programmable switches:
//! - Pseudowire tunnels between every pair of provider-edge switches
//! - Per-customer broadcast domains built from multicast groups
//! - MAC learning from control frames mirrored to the controller
//! - Round-trip-time reports forwarded to telemetry
//!
//! Setup is driven by [`Orchestrator`]; each switch then gets its own
//! [`EventListener`].

pub mod broadcast;
pub mod cli;
pub mod codec;
pub mod config;
pub mod control;
pub mod error;
pub mod frame_source;
pub mod handlers;
pub mod listener;
pub mod orchestrator;
pub mod snapshot;
pub mod topology;
pub mod tunnel_planner;
pub mod tunnel_programmer;
pub mod types;

pub use config::{ControllerSettings, EcmpPolicy, VplsConfig};
pub use control::{ForwardingControl, RecordingControl};
pub use error::{DecodeError, Result, VplsError};
pub use listener::{EventListener, ListenerReport, ListenerState};
pub use orchestrator::{Orchestrator, SwitchConnector};
pub use snapshot::VplsSnapshot;
pub use topology::{StaticTopology, TopologyGraph};
pub use types::{MacAddress, PwId, Tunnel, TunnelId};
