//! Core VPLS domain types.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Mask for 48-bit values (MAC addresses, RTT samples).
pub const MASK_48: u64 = (1 << 48) - 1;

/// A 48-bit Ethernet MAC address.
///
/// ```
/// use vplsd::MacAddress;
///
/// let mac: MacAddress = "00:11:22:33:44:55".parse().unwrap();
/// assert_eq!(mac.to_string(), "00:11:22:33:44:55");
/// assert_eq!(MacAddress::from_u64(mac.to_u64()), mac);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    /// The zero/null MAC address (00:00:00:00:00:00).
    pub const ZERO: MacAddress = MacAddress([0, 0, 0, 0, 0, 0]);

    /// The broadcast MAC address (FF:FF:FF:FF:FF:FF).
    pub const BROADCAST: MacAddress = MacAddress([0xff; 6]);

    pub const fn new(bytes: [u8; 6]) -> Self {
        MacAddress(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }

    /// Returns true if this is a multicast address.
    pub const fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 != 0
    }

    /// Builds an address from the low 48 bits of `value`.
    pub fn from_u64(value: u64) -> Self {
        let be = (value & MASK_48).to_be_bytes();
        let mut bytes = [0u8; 6];
        bytes.copy_from_slice(&be[2..]);
        MacAddress(bytes)
    }

    pub fn to_u64(&self) -> u64 {
        self.0.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b))
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl FromStr for MacAddress {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let separator = if s.contains(':') { ':' } else { '-' };

        let parts: Vec<&str> = s.split(separator).collect();
        if parts.len() != 6 {
            return Err(format!("Invalid MAC address: {}", s));
        }

        let mut bytes = [0u8; 6];
        for (i, part) in parts.iter().enumerate() {
            bytes[i] = u8::from_str_radix(part, 16)
                .map_err(|_| format!("Invalid MAC address: {}", s))?;
        }

        Ok(MacAddress(bytes))
    }
}

impl TryFrom<String> for MacAddress {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<MacAddress> for String {
    fn from(mac: MacAddress) -> String {
        mac.to_string()
    }
}

impl From<[u8; 6]> for MacAddress {
    fn from(bytes: [u8; 6]) -> Self {
        MacAddress(bytes)
    }
}

/// Pseudowire (customer) identifier as carried in `pw_id` / `customer_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PwId(pub u16);

impl fmt::Display for PwId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Tunnel identifier as carried in `tunnel_id`. Zero means "not tunnelled".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TunnelId(pub u16);

impl TunnelId {
    pub const LOCAL: TunnelId = TunnelId(0);

    pub fn is_local(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for TunnelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Programmable switch as described by the topology.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchInfo {
    pub name: String,
    /// Numeric switch id (`sw_id`).
    pub id: u16,
    /// Forwarding-control endpoint.
    pub thrift_port: u16,
    /// Port mirrored to the controller, if the switch has one.
    pub cpu_port: Option<u16>,
    /// Host interface the controller captures control frames on.
    pub cpu_intf: Option<String>,
}

/// A host-facing port on a PE switch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AccessPort {
    pub switch: String,
    pub port: u16,
    pub host: String,
}

/// One tunnel hop: leave `switch` through `port`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Hop {
    pub switch: String,
    pub port: u16,
}

impl Hop {
    pub fn new(switch: impl Into<String>, port: u16) -> Self {
        Self {
            switch: switch.into(),
            port,
        }
    }
}

/// Pseudowire tunnel between two distinct PE switches.
///
/// `hops` walks the path from `path[0]` to the last switch, `reverse_hops`
/// walks it back. Both exclude the destination switch, so a path of `n`
/// switches has `n - 1` hops in each direction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Tunnel {
    pub id: TunnelId,
    pub path: Vec<String>,
    pub hops: Vec<Hop>,
    pub reverse_hops: Vec<Hop>,
}

impl Tunnel {
    pub fn source(&self) -> &str {
        self.path.first().map(String::as_str).unwrap_or_default()
    }

    pub fn destination(&self) -> &str {
        self.path.last().map(String::as_str).unwrap_or_default()
    }

    pub fn hop_count(&self) -> usize {
        self.hops.len()
    }

    /// Egress ports in forward direction, one per hop.
    pub fn ports(&self) -> Vec<u16> {
        self.hops.iter().map(|hop| hop.port).collect()
    }

    pub fn connects(&self, switch: &str) -> bool {
        self.source() == switch || self.destination() == switch
    }

    /// The PE at the other end of the tunnel, seen from `switch`.
    pub fn peer_of(&self, switch: &str) -> Option<&str> {
        if self.source() == switch {
            Some(self.destination())
        } else if self.destination() == switch {
            Some(self.source())
        } else {
            None
        }
    }

    /// Port a frame leaves `switch` on when it enters this tunnel there.
    pub fn egress_port_at(&self, switch: &str) -> Option<u16> {
        if self.source() == switch {
            self.hops.first().map(|hop| hop.port)
        } else if self.destination() == switch {
            self.reverse_hops.first().map(|hop| hop.port)
        } else {
            None
        }
    }
}

/// Multicast replication group installed on one switch for one pseudowire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MulticastGroup {
    pub id: u16,
    pub switch: String,
    pub pw_id: PwId,
    pub ports: BTreeSet<u16>,
    pub node_handle: u32,
}
