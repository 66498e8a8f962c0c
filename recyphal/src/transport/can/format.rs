//! Cyphal/CAN wire format: 29-bit identifier layout, tail byte, transfer CRC
//!
//! The identifier layout is fixed by the Cyphal/CAN specification and must
//! be reproduced bit-exact:
//!
//! ```text
//! message:  [28:26] priority  [25]=0  [24] anonymous  [23]=0
//!           [22:21]=0b11 (tx)  [20:8] subject-id  [7]=0  [6:0] source
//! service:  [28:26] priority  [25]=1  [24] request-not-response  [23]=0
//!           [22:14] service-id  [13:7] destination  [6:0] source
//! ```
//!
//! Bits 21/22 of message frames transmit as ones and are ignored on
//! reception; bit 23 (and bit 7 of message frames) must read back zero for
//! a frame to be accepted.

use recyphal_media::can::Filter;
use recyphal_media::ExtendedId;

use crate::core::{NodeId, Priority, ServiceId, SubjectId, TransferId};

const PRIORITY_OFFSET: u32 = 26;
const SERVICE_FLAG: u32 = 1 << 25;
const ANONYMOUS_FLAG: u32 = 1 << 24;
const REQUEST_FLAG: u32 = 1 << 24;
const RESERVED_23: u32 = 1 << 23;
const MESSAGE_VERSION_BITS: u32 = 0b11 << 21;
const SUBJECT_OFFSET: u32 = 8;
const SERVICE_OFFSET: u32 = 14;
const DESTINATION_OFFSET: u32 = 7;
const RESERVED_7: u32 = 1 << 7;
const SOURCE_MASK: u32 = 0x7f;

pub(crate) fn message_can_id(
    priority: Priority,
    subject: SubjectId,
    source: Option<NodeId>,
    pseudo_source: u8,
) -> ExtendedId {
    let (anonymous, source_bits) = match source {
        Some(node) => (0, u32::from(u16::from(node)) & SOURCE_MASK),
        None => (ANONYMOUS_FLAG, u32::from(pseudo_source) & SOURCE_MASK),
    };
    let raw = (u32::from(u8::from(priority)) << PRIORITY_OFFSET)
        | anonymous
        | MESSAGE_VERSION_BITS
        | (u32::from(u16::from(subject)) << SUBJECT_OFFSET)
        | source_bits;
    unwrap!(ExtendedId::new(raw))
}

pub(crate) fn service_can_id(
    priority: Priority,
    request: bool,
    service: ServiceId,
    destination: NodeId,
    source: NodeId,
) -> ExtendedId {
    let raw = (u32::from(u8::from(priority)) << PRIORITY_OFFSET)
        | SERVICE_FLAG
        | if request { REQUEST_FLAG } else { 0 }
        | (u32::from(u16::from(service)) << SERVICE_OFFSET)
        | ((u32::from(u16::from(destination)) & SOURCE_MASK) << DESTINATION_OFFSET)
        | (u32::from(u16::from(source)) & SOURCE_MASK);
    unwrap!(ExtendedId::new(raw))
}

/// Decoded form of a received 29-bit identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ParsedCanId {
    Message {
        priority: Priority,
        subject: SubjectId,
        source: Option<NodeId>,
    },
    Service {
        priority: Priority,
        request: bool,
        service: ServiceId,
        destination: NodeId,
        source: NodeId,
    },
}

/// Parses an identifier, rejecting frames with reserved bits set.
pub(crate) fn parse_can_id(id: ExtendedId) -> Option<ParsedCanId> {
    let raw = id.as_raw();
    if raw & RESERVED_23 != 0 {
        return None;
    }
    let priority = Priority::from_u8_truncating((raw >> PRIORITY_OFFSET) as u8);

    if raw & SERVICE_FLAG == 0 {
        if raw & RESERVED_7 != 0 {
            return None;
        }
        let subject = SubjectId::from_u16_truncating((raw >> SUBJECT_OFFSET) as u16);
        let source_bits = (raw & SOURCE_MASK) as u16;
        let source = if raw & ANONYMOUS_FLAG != 0 {
            None
        } else {
            Some(unwrap!(NodeId::new(source_bits)))
        };
        Some(ParsedCanId::Message {
            priority,
            subject,
            source,
        })
    } else {
        let service = ServiceId::from_u16_truncating((raw >> SERVICE_OFFSET) as u16);
        let destination = unwrap!(NodeId::new(((raw >> DESTINATION_OFFSET) & SOURCE_MASK) as u16));
        let source = unwrap!(NodeId::new((raw & SOURCE_MASK) as u16));
        Some(ParsedCanId::Service {
            priority,
            request: raw & REQUEST_FLAG != 0,
            service,
            destination,
            source,
        })
    }
}

/// Acceptance filter matching one subscribed subject.
pub(crate) fn filter_for_subject(subject: SubjectId) -> Filter {
    Filter {
        id: u32::from(u16::from(subject)) << SUBJECT_OFFSET,
        mask: SERVICE_FLAG | RESERVED_7 | (u32::from(u16::from(SubjectId::MAX)) << SUBJECT_OFFSET),
    }
}

/// Acceptance filter matching one subscribed service port addressed to the
/// local node.
pub(crate) fn filter_for_service(service: ServiceId, local_node_id: NodeId) -> Filter {
    Filter {
        id: SERVICE_FLAG
            | (u32::from(u16::from(service)) << SERVICE_OFFSET)
            | ((u32::from(u16::from(local_node_id)) & SOURCE_MASK) << DESTINATION_OFFSET),
        mask: SERVICE_FLAG
            | RESERVED_23
            | (u32::from(u16::from(ServiceId::MAX)) << SERVICE_OFFSET)
            | (SOURCE_MASK << DESTINATION_OFFSET),
    }
}

/// The last byte of every Cyphal/CAN frame:
/// `[SOT | EOT | TOGGLE | transfer-id mod 32]`.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct TailByte(u8);

impl TailByte {
    const START_OF_TRANSFER: u8 = 7;
    const END_OF_TRANSFER: u8 = 6;
    const TOGGLE_BIT: u8 = 5;
    const TRANSFER_ID_MASK: u8 = 0x1f;

    pub fn new(sot: bool, eot: bool, toggle: bool, transfer_id: TransferId) -> Self {
        Self(
            (sot as u8) << Self::START_OF_TRANSFER
                | (eot as u8) << Self::END_OF_TRANSFER
                | (toggle as u8) << Self::TOGGLE_BIT
                | transfer_id.can_modulo(),
        )
    }

    pub fn sot(&self) -> bool {
        (self.0 >> Self::START_OF_TRANSFER) & 0x1 != 0
    }

    pub fn eot(&self) -> bool {
        (self.0 >> Self::END_OF_TRANSFER) & 0x1 != 0
    }

    pub fn toggle(&self) -> bool {
        (self.0 >> Self::TOGGLE_BIT) & 0x1 != 0
    }

    /// The 5-bit transfer-id projection.
    pub fn transfer_id5(&self) -> u8 {
        self.0 & Self::TRANSFER_ID_MASK
    }
}

impl From<TailByte> for u8 {
    fn from(value: TailByte) -> Self {
        value.0
    }
}

impl From<u8> for TailByte {
    fn from(value: u8) -> Self {
        Self(value)
    }
}

/// Toggle bit value of a start-of-transfer frame [1; table 4.4]
pub(crate) const SOT_TOGGLE_BIT: bool = true;

pub(crate) const TAIL_LENGTH: usize = 1;

pub(crate) const PAD_VALUE: u8 = 0;

/// Transfer CRC: CRC-16/CCITT-FALSE, appended big-endian to multi-frame
/// transfers. Feeding the received CRC bytes through the accumulator must
/// leave a zero residue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TransferCrc(u16);

impl Default for TransferCrc {
    fn default() -> Self {
        Self(Self::INIT_VALUE)
    }
}

impl TransferCrc {
    pub const LENGTH: usize = 2;
    const INIT_VALUE: u16 = 0xffff;
    const POLYNOMIAL: u16 = 0x1021;

    pub fn add(&mut self, byte: u8) {
        self.0 ^= u16::from(byte) << 8;
        for _ in 0..8 {
            self.0 = if self.0 & 0x8000 != 0 {
                (self.0 << 1) ^ Self::POLYNOMIAL
            } else {
                self.0 << 1
            };
        }
    }

    pub fn add_bytes(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.add(byte);
        }
    }

    pub fn get(&self) -> u16 {
        self.0
    }
}

/// One-shot CRC-16/CCITT-FALSE; also used for the Cyphal/UDP header CRC.
pub(crate) fn crc16_of(bytes: &[u8]) -> u16 {
    let mut crc = TransferCrc::default();
    crc.add_bytes(bytes);
    crc.get()
}
