//! UDP media interface consumed by the transport core
//!
//! One media corresponds to one local network interface. The transport
//! creates a single TX socket per media and one RX socket per multicast
//! group it subscribes to. Socket construction is the only operation that
//! may touch the OS synchronously; data-path operations are non-blocking.

use alloc::boxed::Box;

use crate::can::{MediaError, PushOutcome};
use crate::time::Instant;

/// An IPv4 multicast endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct UdpEndpoint {
    /// Group address in host byte order.
    pub address: u32,
    pub port: u16,
}

/// Reception metadata returned by [`UdpRxSocket::receive`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpRxMetadata {
    pub timestamp: Instant,
    pub length: usize,
}

pub trait UdpTxSocket {
    /// Attempts to send one datagram to `endpoint`.
    fn send(
        &mut self,
        deadline: Instant,
        endpoint: UdpEndpoint,
        payload: &[u8],
    ) -> Result<PushOutcome, MediaError>;
}

pub trait UdpRxSocket {
    /// Fetches one received datagram into `payload`. Returns `None` when
    /// the receive queue is empty. Oversized datagrams are truncated.
    fn receive(&mut self, payload: &mut [u8]) -> Result<Option<UdpRxMetadata>, MediaError>;
}

/// One UDP-capable network interface as seen by the transport.
pub trait UdpMedia {
    /// Bytes of datagram payload the interface can carry without IP
    /// fragmentation, header included.
    fn mtu(&self) -> usize;

    fn make_tx_socket(&mut self) -> Result<Box<dyn UdpTxSocket>, MediaError>;

    /// Opens a socket joined to the given multicast group.
    fn make_rx_socket(&mut self, endpoint: UdpEndpoint)
        -> Result<Box<dyn UdpRxSocket>, MediaError>;
}
