//! Cyphal protocol core data types
//!
//! This crate provides the basic protocol value types shared by the Recyphal
//! transport crates. Stack users should not depend on this crate directly;
//! use the `recyphal::core` reexport instead.
//!
//! All types are plain validated newtypes. Range limits follow the Cyphal
//! specification: the widest profile (Cyphal/UDP) bounds the types here,
//! while narrower per-profile limits (e.g. the 7-bit Cyphal/CAN node-id
//! space) are enforced by the transport that owns the profile.
#![no_std]

/// Error of a range-checked conversion into a protocol value type.
#[derive(Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct InvalidValue;

/// Transfer priority [1; 4.1.1.3]
///
/// The numeric encoding matches the wire-level priority bits, thus the
/// ordering is reversed: `Optional` compares greater than `Exceptional`.
/// `Exceptional` preempts everything; `Nominal` is the default for regular
/// traffic (heartbeats); `Optional` may never be delivered at all under
/// sustained load.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Priority {
    Exceptional = 0,
    Immediate = 1,
    Fast = 2,
    High = 3,
    /// The default priority for regular traffic.
    Nominal = 4,
    Low = 5,
    Slow = 6,
    Optional = 7,
}

impl Priority {
    pub const MIN: Priority = Priority::Exceptional;
    pub const MAX: Priority = Priority::Optional;

    pub const fn try_from_u8(code: u8) -> Option<Priority> {
        if code <= Self::MAX.into_u8() {
            Some(Priority::from_u8_truncating(code))
        } else {
            None
        }
    }

    pub const fn from_u8_truncating(code: u8) -> Priority {
        match code & 0x7 {
            0 => Priority::Exceptional,
            1 => Priority::Immediate,
            2 => Priority::Fast,
            3 => Priority::High,
            4 => Priority::Nominal,
            5 => Priority::Low,
            6 => Priority::Slow,
            _ => Priority::Optional,
        }
    }

    pub const fn into_u8(self) -> u8 {
        self as u8
    }
}

impl From<Priority> for u8 {
    fn from(value: Priority) -> Self {
        value.into_u8()
    }
}

impl From<Priority> for usize {
    fn from(value: Priority) -> Self {
        u8::from(value).into()
    }
}

impl TryFrom<u8> for Priority {
    type Error = InvalidValue;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::try_from_u8(value).ok_or(InvalidValue)
    }
}

/// Node identifier
///
/// The protocol-wide ceiling is 65534 (Cyphal/UDP). The Cyphal/CAN profile
/// narrows the valid range to `[0, CAN_MAX]`; the CAN transport enforces
/// that bound. A node without an identifier (anonymous) is modeled as
/// `Option::<NodeId>::None`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct NodeId(u16);

impl NodeId {
    const MAX_VALUE: u16 = 0xfffe;
    pub const MAX: NodeId = NodeId(Self::MAX_VALUE);

    /// The inclusive upper bound of the Cyphal/CAN node-id space.
    pub const CAN_MAX: NodeId = NodeId(0x7f);

    pub const fn new(value: u16) -> Option<Self> {
        if value <= Self::MAX_VALUE {
            Some(Self(value))
        } else {
            None
        }
    }

    pub const fn into_u16(self) -> u16 {
        self.0
    }

    pub const fn is_valid_for_can(self) -> bool {
        self.0 <= Self::CAN_MAX.0
    }
}

impl From<NodeId> for u16 {
    fn from(value: NodeId) -> Self {
        value.into_u16()
    }
}

impl From<NodeId> for usize {
    fn from(value: NodeId) -> Self {
        u16::from(value).into()
    }
}

impl TryFrom<u16> for NodeId {
    type Error = InvalidValue;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        Self::new(value).ok_or(InvalidValue)
    }
}

/// Message subject identifier, at most 8191.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SubjectId(u16);

impl SubjectId {
    const MAX_VALUE: u16 = 0x1fff;
    pub const MAX: SubjectId = SubjectId(Self::MAX_VALUE);

    pub const fn new(value: u16) -> Option<Self> {
        if value <= Self::MAX_VALUE {
            Some(Self(value))
        } else {
            None
        }
    }

    pub const fn from_u16_truncating(value: u16) -> Self {
        Self(value & Self::MAX_VALUE)
    }

    pub const fn into_u16(self) -> u16 {
        self.0
    }
}

impl From<SubjectId> for u16 {
    fn from(value: SubjectId) -> Self {
        value.into_u16()
    }
}

impl TryFrom<u16> for SubjectId {
    type Error = InvalidValue;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        Self::new(value).ok_or(InvalidValue)
    }
}

/// Service identifier, at most 511.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ServiceId(u16);

impl ServiceId {
    const MAX_VALUE: u16 = 0x1ff;
    pub const MAX: ServiceId = ServiceId(Self::MAX_VALUE);

    pub const fn new(value: u16) -> Option<Self> {
        if value <= Self::MAX_VALUE {
            Some(Self(value))
        } else {
            None
        }
    }

    pub const fn from_u16_truncating(value: u16) -> Self {
        Self(value & Self::MAX_VALUE)
    }

    pub const fn into_u16(self) -> u16 {
        self.0
    }
}

impl From<ServiceId> for u16 {
    fn from(value: ServiceId) -> Self {
        value.into_u16()
    }
}

impl TryFrom<u16> for ServiceId {
    type Error = InvalidValue;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        Self::new(value).ok_or(InvalidValue)
    }
}

/// Transfer identifier
///
/// A monotonically advancing per-session counter. The full 64-bit value is
/// carried by Cyphal/UDP; Cyphal/CAN maps it through modulo 32 at the tail
/// byte. Wrap-around is allowed; sequence comparison uses modular distance.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TransferId(u64);

impl TransferId {
    /// Transfer id of the first transfer in a session [1; 4.1.1.7]
    pub const SESSION_START: TransferId = TransferId(0);

    /// Number of distinct values representable in a Cyphal/CAN tail byte.
    pub const CAN_MODULO: u64 = 32;

    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn into_u64(self) -> u64 {
        self.0
    }

    /// The 5-bit projection carried by a Cyphal/CAN tail byte.
    pub const fn can_modulo(self) -> u8 {
        (self.0 % Self::CAN_MODULO) as u8
    }

    pub const fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

impl From<TransferId> for u64 {
    fn from(value: TransferId) -> Self {
        value.into_u64()
    }
}

impl From<u64> for TransferId {
    fn from(value: u64) -> Self {
        Self::new(value)
    }
}

/// Encodes the kind of a transfer and the port it addresses.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DataSpecifier {
    Message(SubjectId),
    Request(ServiceId),
    Response(ServiceId),
}

impl DataSpecifier {
    pub const fn port_id(self) -> u16 {
        match self {
            DataSpecifier::Message(subject) => subject.into_u16(),
            DataSpecifier::Request(service) | DataSpecifier::Response(service) => {
                service.into_u16()
            }
        }
    }

    pub const fn is_service(self) -> bool {
        !matches!(self, DataSpecifier::Message(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_round_trip() {
        for code in 0u8..8 {
            let priority = Priority::try_from(code).unwrap();
            assert_eq!(u8::from(priority), code);
        }
        assert!(Priority::try_from(8).is_err());
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Exceptional < Priority::Nominal);
        assert!(Priority::Nominal < Priority::Optional);
    }

    #[test]
    fn test_node_id_bounds() {
        assert!(NodeId::new(0).is_some());
        assert!(NodeId::new(0xfffe).is_some());
        assert!(NodeId::new(0xffff).is_none());

        assert!(NodeId::new(127).unwrap().is_valid_for_can());
        assert!(!NodeId::new(128).unwrap().is_valid_for_can());
    }

    #[test]
    fn test_port_id_bounds() {
        assert!(SubjectId::new(8191).is_some());
        assert!(SubjectId::new(8192).is_none());
        assert!(ServiceId::new(511).is_some());
        assert!(ServiceId::new(512).is_none());
    }

    #[test]
    fn test_transfer_id_modulo() {
        assert_eq!(TransferId::new(0x13).can_modulo(), 0x13);
        assert_eq!(TransferId::new(32 + 5).can_modulo(), 5);
        assert_eq!(TransferId::new(u64::MAX).next(), TransferId::new(0));
    }

    #[test]
    fn test_data_specifier() {
        let subject = SubjectId::new(7).unwrap();
        let service = ServiceId::new(42).unwrap();
        assert_eq!(DataSpecifier::Message(subject).port_id(), 7);
        assert!(!DataSpecifier::Message(subject).is_service());
        assert!(DataSpecifier::Request(service).is_service());
        assert!(DataSpecifier::Response(service).is_service());
    }
}
