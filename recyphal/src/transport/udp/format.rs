//! Cyphal/UDP wire format: 24-byte datagram header, transfer CRC,
//! multicast endpoint derivation
//!
//! Header layout, little-endian throughout:
//!
//! ```text
//! offset  0  version        u8   (= 1)
//!         1  priority       u8
//!         2  source         u16  (0xffff = anonymous)
//!         4  destination    u16  (0xffff = broadcast)
//!         6  data specifier u16  (bit 15 service, bit 14 request)
//!         8  transfer-id    u64
//!        16  frame index    u32  (bit 31 = end of transfer)
//!        20  user data      u16  (reserved, 0)
//!        22  header CRC     u16  (CRC-16/CCITT-FALSE of bytes 0..22)
//! ```
//!
//! Multi-frame transfers append the CRC-32C of the whole payload,
//! little-endian, behind the last payload byte.

use recyphal_media::udp::UdpEndpoint;

use crate::core::{DataSpecifier, NodeId, Priority, ServiceId, SubjectId, TransferId};
use crate::transport::can::crc16_of;

pub(crate) const HEADER_SIZE: usize = 24;
pub(crate) const HEADER_VERSION: u8 = 1;

/// The well-known Cyphal/UDP port.
pub const UDP_PORT: u16 = 9382;

const NODE_ID_UNSET: u16 = 0xffff;
const EOT_FLAG: u32 = 1 << 31;
const SPEC_SERVICE_FLAG: u16 = 1 << 15;
const SPEC_REQUEST_FLAG: u16 = 1 << 14;

/// Message transfers of one subject share this multicast group.
pub(crate) fn message_endpoint(subject: SubjectId) -> UdpEndpoint {
    UdpEndpoint {
        address: 0xef00_0000 | u32::from(u16::from(subject)),
        port: UDP_PORT,
    }
}

/// All service transfers addressed to one node share this multicast group.
pub(crate) fn service_endpoint(destination: NodeId) -> UdpEndpoint {
    UdpEndpoint {
        address: 0xef01_0000 | u32::from(u16::from(destination)),
        port: UDP_PORT,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct UdpHeader {
    pub priority: Priority,
    pub source: Option<NodeId>,
    pub destination: Option<NodeId>,
    pub data_specifier: DataSpecifier,
    pub transfer_id: TransferId,
    pub frame_index: u32,
    pub end_of_transfer: bool,
}

impl UdpHeader {
    pub fn serialize(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[0] = HEADER_VERSION;
        bytes[1] = self.priority.into_u8();
        bytes[2..4].copy_from_slice(&node_bits(self.source).to_le_bytes());
        bytes[4..6].copy_from_slice(&node_bits(self.destination).to_le_bytes());
        bytes[6..8].copy_from_slice(&spec_bits(self.data_specifier).to_le_bytes());
        bytes[8..16].copy_from_slice(&self.transfer_id.into_u64().to_le_bytes());
        let index = self.frame_index | if self.end_of_transfer { EOT_FLAG } else { 0 };
        bytes[16..20].copy_from_slice(&index.to_le_bytes());
        // bytes 20..22: user data, transmitted as zero
        let crc = crc16_of(&bytes[..22]);
        bytes[22..24].copy_from_slice(&crc.to_le_bytes());
        bytes
    }

    /// Parses and validates a header; `None` for malformed datagrams.
    pub fn parse(bytes: &[u8]) -> Option<UdpHeader> {
        if bytes.len() < HEADER_SIZE || bytes[0] != HEADER_VERSION {
            return None;
        }
        let stored_crc = u16::from_le_bytes([bytes[22], bytes[23]]);
        if crc16_of(&bytes[..22]) != stored_crc {
            return None;
        }

        let priority = Priority::try_from_u8(bytes[1])?;
        let source = parse_node(u16::from_le_bytes([bytes[2], bytes[3]]))?;
        let destination = parse_node(u16::from_le_bytes([bytes[4], bytes[5]]))?;
        let data_specifier = parse_spec(u16::from_le_bytes([bytes[6], bytes[7]]))?;
        let transfer_id = TransferId::new(u64::from_le_bytes(unwrap!(bytes[8..16].try_into())));
        let index = u32::from_le_bytes(unwrap!(bytes[16..20].try_into()));

        Some(UdpHeader {
            priority,
            source,
            destination,
            data_specifier,
            transfer_id,
            frame_index: index & !EOT_FLAG,
            end_of_transfer: index & EOT_FLAG != 0,
        })
    }
}

fn node_bits(node: Option<NodeId>) -> u16 {
    node.map_or(NODE_ID_UNSET, u16::from)
}

fn parse_node(bits: u16) -> Option<Option<NodeId>> {
    if bits == NODE_ID_UNSET {
        Some(None)
    } else {
        // Values above the ceiling other than the unset marker are invalid
        // by construction of the marker; NodeId::new covers the full range.
        NodeId::new(bits).map(Some)
    }
}

fn spec_bits(spec: DataSpecifier) -> u16 {
    match spec {
        DataSpecifier::Message(subject) => subject.into_u16(),
        DataSpecifier::Request(service) => {
            SPEC_SERVICE_FLAG | SPEC_REQUEST_FLAG | service.into_u16()
        }
        DataSpecifier::Response(service) => SPEC_SERVICE_FLAG | service.into_u16(),
    }
}

fn parse_spec(bits: u16) -> Option<DataSpecifier> {
    if bits & SPEC_SERVICE_FLAG == 0 {
        SubjectId::new(bits).map(DataSpecifier::Message)
    } else {
        let service = ServiceId::new(bits & !(SPEC_SERVICE_FLAG | SPEC_REQUEST_FLAG))?;
        if bits & SPEC_REQUEST_FLAG != 0 {
            Some(DataSpecifier::Request(service))
        } else {
            Some(DataSpecifier::Response(service))
        }
    }
}

/// Transfer CRC: CRC-32C (Castagnoli), reflected, appended little-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TransferCrc32(u32);

impl Default for TransferCrc32 {
    fn default() -> Self {
        Self(0xffff_ffff)
    }
}

impl TransferCrc32 {
    pub const LENGTH: usize = 4;
    const POLYNOMIAL: u32 = 0x82f6_3b78;

    pub fn add_bytes(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.0 ^= u32::from(byte);
            for _ in 0..8 {
                self.0 = if self.0 & 1 != 0 {
                    (self.0 >> 1) ^ Self::POLYNOMIAL
                } else {
                    self.0 >> 1
                };
            }
        }
    }

    pub fn get(&self) -> u32 {
        self.0 ^ 0xffff_ffff
    }
}

pub(crate) fn crc32c_of(bytes: &[u8]) -> u32 {
    let mut crc = TransferCrc32::default();
    crc.add_bytes(bytes);
    crc.get()
}
