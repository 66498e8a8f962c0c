//! CAN media interface consumed by the transport core
//!
//! A media implementation wraps one CAN interface (e.g. a SocketCAN socket
//! or a peripheral driver). All operations are non-blocking: `push` reports
//! `Busy` instead of waiting, `pop` returns `None` when no frame is queued.
//! The transport polls every media on each `run`.

use embedded_can::ExtendedId;

use crate::frame::Mtu;
use crate::time::Instant;

/// A non-recoverable error reported by a media implementation.
///
/// The code is platform-defined (e.g. an `errno` value) and is used for
/// logging only; the transport maps any media error to its own taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MediaError {
    pub code: i32,
}

/// Outcome of a non-blocking `push` attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PushOutcome {
    /// The frame was accepted for transmission.
    Sent,
    /// The interface cannot take a frame now; retry later.
    Busy,
}

/// A hardware acceptance filter entry: accept a frame when
/// `frame_id & mask == id & mask`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Filter {
    pub id: u32,
    pub mask: u32,
}

/// Reception metadata returned by [`CanMedia::pop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanRxMetadata {
    pub id: ExtendedId,
    pub timestamp: Instant,
    pub length: usize,
}

/// One CAN interface as seen by the transport.
///
/// The MTU may change between calls (e.g. an FD interface downgraded to
/// classic); the transport re-reads it before fragmenting each transfer.
pub trait CanMedia {
    fn mtu(&self) -> Mtu;

    /// Attempts to hand one frame to the interface.
    ///
    /// The deadline is advisory: an implementation that queues internally
    /// should drop the frame if it cannot reach the bus in time.
    fn push(
        &mut self,
        deadline: Instant,
        id: ExtendedId,
        data: &[u8],
    ) -> Result<PushOutcome, MediaError>;

    /// Fetches one received frame into `payload`, which must hold at least
    /// `Mtu::Fd` bytes. Returns `None` when the receive queue is empty.
    fn pop(&mut self, payload: &mut [u8]) -> Result<Option<CanRxMetadata>, MediaError>;

    /// Replaces the hardware acceptance filter configuration.
    ///
    /// An empty list rejects all traffic. Implementations with fewer
    /// hardware slots than entries should degrade to accepting a superset.
    fn set_filters(&mut self, filters: &[Filter]) -> Result<(), MediaError>;
}
