//! Control-frame codecs.
//!
//! Switches punt control records to the CPU port inside plain Ethernet
//! frames. The ethertype selects the record layout:
//!
//! | Ethertype | Record      | Layout (big-endian)                                  |
//! |-----------|-------------|------------------------------------------------------|
//! | `0x1234`  | [`CpuHeader`] | src MAC (6) + tunnel_id (2) + pw_id (2) + ingress_port (2) |
//! | `0x5678`  | [`RttHeader`] | customer_id (2) + src IPv4 (4) + dst IPv4 (4) + rtt (6)     |
//!
//! Bytes after the record (Ethernet padding) are ignored.

use crate::error::DecodeError;
use crate::types::{MacAddress, PwId, TunnelId, MASK_48};
use byteorder::{BigEndian, ByteOrder};
use std::net::Ipv4Addr;

pub const ETHERTYPE_MAC_LEARNING: u16 = 0x1234;
pub const ETHERTYPE_RTT_REPORT: u16 = 0x5678;

pub const ETHERNET_HEADER_LEN: usize = 14;
pub const CPU_HEADER_LEN: usize = 12;
pub const RTT_HEADER_LEN: usize = 16;

/// Outer link-layer header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EthernetHeader {
    pub dst: MacAddress,
    pub src: MacAddress,
    pub ethertype: u16,
}

impl EthernetHeader {
    /// Decodes the header and returns it together with the payload.
    pub fn decode(buf: &[u8]) -> Result<(Self, &[u8]), DecodeError> {
        if buf.len() < ETHERNET_HEADER_LEN {
            return Err(DecodeError::truncated("ethernet", ETHERNET_HEADER_LEN, buf.len()));
        }
        let mut dst = [0u8; 6];
        let mut src = [0u8; 6];
        dst.copy_from_slice(&buf[0..6]);
        src.copy_from_slice(&buf[6..12]);
        let header = Self {
            dst: MacAddress::new(dst),
            src: MacAddress::new(src),
            ethertype: BigEndian::read_u16(&buf[12..14]),
        };
        Ok((header, &buf[ETHERNET_HEADER_LEN..]))
    }

    pub fn encode(&self) -> [u8; ETHERNET_HEADER_LEN] {
        let mut buf = [0u8; ETHERNET_HEADER_LEN];
        buf[0..6].copy_from_slice(self.dst.as_bytes());
        buf[6..12].copy_from_slice(self.src.as_bytes());
        BigEndian::write_u16(&mut buf[12..14], self.ethertype);
        buf
    }
}

/// MAC-learning notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuHeader {
    pub src_addr: MacAddress,
    pub tunnel_id: TunnelId,
    pub pw_id: PwId,
    pub ingress_port: u16,
}

impl CpuHeader {
    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        if buf.len() < CPU_HEADER_LEN {
            return Err(DecodeError::truncated("cpu", CPU_HEADER_LEN, buf.len()));
        }
        Ok(Self {
            src_addr: MacAddress::from_u64(BigEndian::read_u48(&buf[0..6])),
            tunnel_id: TunnelId(BigEndian::read_u16(&buf[6..8])),
            pw_id: PwId(BigEndian::read_u16(&buf[8..10])),
            ingress_port: BigEndian::read_u16(&buf[10..12]),
        })
    }

    pub fn encode(&self) -> [u8; CPU_HEADER_LEN] {
        let mut buf = [0u8; CPU_HEADER_LEN];
        BigEndian::write_u48(&mut buf[0..6], self.src_addr.to_u64() & MASK_48);
        BigEndian::write_u16(&mut buf[6..8], self.tunnel_id.0);
        BigEndian::write_u16(&mut buf[8..10], self.pw_id.0);
        BigEndian::write_u16(&mut buf[10..12], self.ingress_port);
        buf
    }
}

/// RTT telemetry report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RttHeader {
    pub customer_id: PwId,
    pub ip_addr_src: Ipv4Addr,
    pub ip_addr_dst: Ipv4Addr,
    /// 48-bit RTT sample as measured by the switch.
    pub rtt: u64,
}

impl RttHeader {
    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        if buf.len() < RTT_HEADER_LEN {
            return Err(DecodeError::truncated("rtt", RTT_HEADER_LEN, buf.len()));
        }
        Ok(Self {
            customer_id: PwId(BigEndian::read_u16(&buf[0..2])),
            ip_addr_src: Ipv4Addr::from(BigEndian::read_u32(&buf[2..6])),
            ip_addr_dst: Ipv4Addr::from(BigEndian::read_u32(&buf[6..10])),
            rtt: BigEndian::read_u48(&buf[10..16]),
        })
    }

    /// Encodes the header; `rtt` is truncated to its 48-bit field.
    pub fn encode(&self) -> [u8; RTT_HEADER_LEN] {
        let mut buf = [0u8; RTT_HEADER_LEN];
        BigEndian::write_u16(&mut buf[0..2], self.customer_id.0);
        BigEndian::write_u32(&mut buf[2..6], u32::from(self.ip_addr_src));
        BigEndian::write_u32(&mut buf[6..10], u32::from(self.ip_addr_dst));
        BigEndian::write_u48(&mut buf[10..16], self.rtt & MASK_48);
        buf
    }
}

/// A control frame after classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlEvent {
    MacLearning(CpuHeader),
    RttReport(RttHeader),
    /// Any other ethertype; carries the ethertype for tracing.
    Unknown(u16),
}

impl ControlEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            ControlEvent::MacLearning(_) => "mac_learning",
            ControlEvent::RttReport(_) => "rtt_report",
            ControlEvent::Unknown(_) => "unknown",
        }
    }
}

/// Parses the outer header and decodes the control record it announces.
pub fn classify(frame: &[u8]) -> Result<ControlEvent, DecodeError> {
    let (eth, payload) = EthernetHeader::decode(frame)?;
    match eth.ethertype {
        ETHERTYPE_MAC_LEARNING => CpuHeader::decode(payload).map(ControlEvent::MacLearning),
        ETHERTYPE_RTT_REPORT => RttHeader::decode(payload).map(ControlEvent::RttReport),
        other => Ok(ControlEvent::Unknown(other)),
    }
}

/// Builds a full frame around a control record.
pub fn build_frame(src: MacAddress, ethertype: u16, payload: &[u8]) -> Vec<u8> {
    let eth = EthernetHeader {
        dst: MacAddress::BROADCAST,
        src,
        ethertype,
    };
    let mut frame = Vec::with_capacity(ETHERNET_HEADER_LEN + payload.len());
    frame.extend_from_slice(&eth.encode());
    frame.extend_from_slice(payload);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample_cpu() -> CpuHeader {
        CpuHeader {
            src_addr: MacAddress::new([0x00, 0x00, 0x0a, 0x00, 0x01, 0x02]),
            tunnel_id: TunnelId(0xbeef),
            pw_id: PwId(7),
            ingress_port: 3,
        }
    }

    fn sample_rtt() -> RttHeader {
        RttHeader {
            customer_id: PwId(2),
            ip_addr_src: Ipv4Addr::new(10, 0, 1, 1),
            ip_addr_dst: Ipv4Addr::new(10, 0, 2, 1),
            rtt: 0x0000_ffff_0000_1234,
        }
    }

    #[test]
    fn test_cpu_header_layout() {
        let bytes = sample_cpu().encode();
        assert_eq!(
            bytes,
            [0x00, 0x00, 0x0a, 0x00, 0x01, 0x02, 0xbe, 0xef, 0x00, 0x07, 0x00, 0x03]
        );
    }

    #[test]
    fn test_cpu_header_round_trip() {
        let header = sample_cpu();
        assert_eq!(CpuHeader::decode(&header.encode()).unwrap(), header);
    }

    #[test]
    fn test_rtt_header_layout() {
        let bytes = sample_rtt().encode();
        assert_eq!(&bytes[0..2], &[0x00, 0x02]);
        assert_eq!(&bytes[2..6], &[10, 0, 1, 1]);
        assert_eq!(&bytes[6..10], &[10, 0, 2, 1]);
        assert_eq!(&bytes[10..16], &[0xff, 0xff, 0x00, 0x00, 0x12, 0x34]);
    }

    #[test]
    fn test_rtt_header_round_trip() {
        let header = sample_rtt();
        assert_eq!(RttHeader::decode(&header.encode()).unwrap(), header);
    }

    #[test]
    fn test_rtt_masked_to_48_bits() {
        let mut header = sample_rtt();
        header.rtt = u64::MAX;
        let decoded = RttHeader::decode(&header.encode()).unwrap();
        assert_eq!(decoded.rtt, MASK_48);
    }

    #[test]
    fn test_round_trip_boundary_values() {
        let header = CpuHeader {
            src_addr: MacAddress::BROADCAST,
            tunnel_id: TunnelId(u16::MAX),
            pw_id: PwId(u16::MAX),
            ingress_port: u16::MAX,
        };
        assert_eq!(CpuHeader::decode(&header.encode()).unwrap(), header);

        let header = RttHeader {
            customer_id: PwId(0),
            ip_addr_src: Ipv4Addr::UNSPECIFIED,
            ip_addr_dst: Ipv4Addr::BROADCAST,
            rtt: MASK_48,
        };
        assert_eq!(RttHeader::decode(&header.encode()).unwrap(), header);
    }

    #[test]
    fn test_truncated_payloads() {
        assert_eq!(
            CpuHeader::decode(&[0u8; 11]).unwrap_err(),
            DecodeError::truncated("cpu", 12, 11)
        );
        assert_eq!(
            RttHeader::decode(&[0u8; 15]).unwrap_err(),
            DecodeError::truncated("rtt", 16, 15)
        );
    }

    #[test]
    fn test_trailing_padding_ignored() {
        let mut payload = sample_cpu().encode().to_vec();
        payload.extend_from_slice(&[0u8; 34]);
        assert_eq!(CpuHeader::decode(&payload).unwrap(), sample_cpu());
    }

    #[test]
    fn test_classify_mac_learning() {
        let frame = build_frame(MacAddress::ZERO, ETHERTYPE_MAC_LEARNING, &sample_cpu().encode());
        assert_eq!(classify(&frame).unwrap(), ControlEvent::MacLearning(sample_cpu()));
    }

    #[test]
    fn test_classify_rtt_report() {
        let frame = build_frame(MacAddress::ZERO, ETHERTYPE_RTT_REPORT, &sample_rtt().encode());
        let event = classify(&frame).unwrap();
        assert_eq!(event.kind(), "rtt_report");
        assert_eq!(event, ControlEvent::RttReport(sample_rtt()));
    }

    #[test]
    fn test_classify_unknown_ethertype() {
        let frame = build_frame(MacAddress::ZERO, 0x0800, &[0u8; 20]);
        assert_eq!(classify(&frame).unwrap(), ControlEvent::Unknown(0x0800));
    }

    #[test]
    fn test_classify_truncated() {
        let frame = build_frame(MacAddress::ZERO, ETHERTYPE_MAC_LEARNING, &[0u8; 4]);
        assert_eq!(
            classify(&frame).unwrap_err(),
            DecodeError::truncated("cpu", 12, 4)
        );
        assert!(classify(&[0u8; 10]).is_err());
    }

    #[test]
    fn test_ethernet_round_trip() {
        let eth = EthernetHeader {
            dst: MacAddress::BROADCAST,
            src: MacAddress::new([1, 2, 3, 4, 5, 6]),
            ethertype: ETHERTYPE_RTT_REPORT,
        };
        let bytes = eth.encode();
        let (decoded, payload) = EthernetHeader::decode(&bytes).unwrap();
        assert_eq!(decoded, eth);
        assert!(payload.is_empty());
    }
}
