//! Transport layer: sessions, transfer codecs, redundant-media dispatch
//!
//! The transport issues and receives prioritized, deduplicated transfers
//! across one or more redundant media. Two profiles are provided:
//! [`can::CanTransport`] and [`udp::UdpTransport`]. Both are driven from the
//! application loop through [`Transport::run`]; nothing here blocks or
//! spawns threads.
//!
//! Sessions are created through the transport and hold shared handles to
//! its internals; dropping a session unregisters its subscription. The six
//! session kinds share the capability traits defined here so that the
//! presentation layer can work over either profile.

use alloc::boxed::Box;
use alloc::vec::Vec;

use recyphal_media::can::MediaError;
use recyphal_media::time::{Duration, Instant};

use crate::core::{NodeId, Priority, ServiceId, SubjectId, TransferId};

pub mod can;
pub(crate) mod tx_queue;
pub mod udp;

/// Transport-layer error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// The caller violated a precondition.
    Argument,
    /// Allocation failure.
    Memory,
    /// A queue or buffer is full.
    Capacity,
    /// A subscription for the same `(kind, port)` already exists.
    AlreadyExists,
    /// The operation is not available in this build or configuration.
    NotImplemented,
    /// A media interface reported a non-recoverable error.
    Platform(MediaError),
}

/// Static parameters of a constructed transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ProtocolParams {
    /// Number of distinct transfer-id values on the wire.
    pub transfer_id_modulo: u64,
    /// The smallest MTU across all attached media, in bytes.
    pub mtu_bytes: usize,
    /// Size of the node-id space, including the unset value.
    pub max_nodes: u32,
}

/// Counters of events absorbed (not propagated) during `run`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Statistics {
    /// Media errors while handing frames to an interface.
    pub tx_media_errors: u64,
    /// Media errors while fetching frames from an interface.
    pub rx_media_errors: u64,
    /// TX frames dropped because their deadline lapsed in the queue.
    pub tx_frames_expired: u64,
    /// Received frames discarded as malformed or out of protocol.
    pub rx_frames_rejected: u64,
}

/// Metadata shared by every received or transmitted transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TransferMetadata {
    pub transfer_id: TransferId,
    pub priority: Priority,
    /// Reception time of the first frame (RX) or the send call time (TX).
    pub timestamp: Instant,
}

/// A received message transfer. `source_node_id` is `None` for anonymous
/// publishers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageTransfer {
    pub metadata: TransferMetadata,
    pub source_node_id: Option<NodeId>,
    pub payload: Vec<u8>,
}

/// A received service transfer; `remote_node_id` is the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceTransfer {
    pub metadata: TransferMetadata,
    pub remote_node_id: NodeId,
    pub payload: Vec<u8>,
}

/// Metadata supplied by the application when transmitting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TransferTxMetadata {
    pub transfer_id: TransferId,
    pub priority: Priority,
    /// Frames not handed to a media interface by this time are dropped.
    pub deadline: Instant,
}

/// TX metadata of a service response; `remote_node_id` addresses the
/// original requester, `transfer_id` must echo the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ServiceTxMetadata {
    pub base: TransferTxMetadata,
    pub remote_node_id: NodeId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MessageRxParams {
    pub extent_bytes: usize,
    pub subject_id: SubjectId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MessageTxParams {
    pub subject_id: SubjectId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RequestRxParams {
    pub extent_bytes: usize,
    pub service_id: ServiceId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RequestTxParams {
    pub service_id: ServiceId,
    pub server_node_id: NodeId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ResponseRxParams {
    pub extent_bytes: usize,
    pub service_id: ServiceId,
    pub server_node_id: NodeId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ResponseTxParams {
    pub service_id: ServiceId,
}

/// Capability shared by every RX session kind.
pub trait RxSession {
    /// Sets the transfer-id timeout used for reassembly expiration and
    /// duplicate detection on this session.
    fn set_transfer_id_timeout(&mut self, timeout: Duration);
}

/// Receives message transfers on one subject.
///
/// Exactly one of polling (`receive`) or push delivery (`set_on_receive`)
/// is in effect at a time; installing a callback consumes a latched
/// transfer by delivering it.
pub trait MessageRxSession: RxSession {
    fn params(&self) -> MessageRxParams;

    /// Non-blocking; latches the most recent transfer since the last call.
    fn receive(&mut self) -> Option<MessageTransfer>;

    fn set_on_receive(&mut self, callback: Option<Box<dyn FnMut(MessageTransfer)>>);
}

/// Publishes message transfers on one subject.
pub trait MessageTxSession {
    fn params(&self) -> MessageTxParams;

    /// Fragments the payload (given as a scatter list) and enqueues the
    /// frames on every media.
    fn send(&mut self, metadata: &TransferTxMetadata, payload: &[&[u8]]) -> Result<(), Error>;
}

/// Receives request transfers on one service port (server side).
pub trait RequestRxSession: RxSession {
    fn params(&self) -> RequestRxParams;
    fn receive(&mut self) -> Option<ServiceTransfer>;
    fn set_on_receive(&mut self, callback: Option<Box<dyn FnMut(ServiceTransfer)>>);
}

/// Sends request transfers to one server node (client side).
pub trait RequestTxSession {
    fn params(&self) -> RequestTxParams;
    fn send(&mut self, metadata: &TransferTxMetadata, payload: &[&[u8]]) -> Result<(), Error>;
}

/// Receives response transfers from one server node (client side).
pub trait ResponseRxSession: RxSession {
    fn params(&self) -> ResponseRxParams;
    fn receive(&mut self) -> Option<ServiceTransfer>;
    fn set_on_receive(&mut self, callback: Option<Box<dyn FnMut(ServiceTransfer)>>);
}

/// Sends response transfers on one service port (server side).
pub trait ResponseTxSession {
    fn params(&self) -> ResponseTxParams;
    fn send(&mut self, metadata: &ServiceTxMetadata, payload: &[&[u8]]) -> Result<(), Error>;
}

/// Default transfer-id timeout of new RX sessions [1; 4.1.1.9]
pub const DEFAULT_TRANSFER_ID_TIMEOUT: Duration = Duration::from_secs(2);

/// Subscription registry key discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum SessionKind {
    Message,
    Request,
    Response,
}

/// What a TX session is sending; fixes the wire addressing.
#[derive(Debug, Clone, Copy)]
pub(crate) enum TxKind {
    Message {
        subject: SubjectId,
    },
    Request {
        service: ServiceId,
        destination: NodeId,
    },
    Response {
        service: ServiceId,
        destination: NodeId,
    },
}

/// A received transfer before it is shaped into the session-kind-specific
/// message/service representation.
pub(crate) struct RxTransfer {
    pub metadata: TransferMetadata,
    pub source: Option<NodeId>,
    pub payload: Vec<u8>,
}

/// A contiguous view of a scatter-list payload; a staging buffer is
/// allocated only when there is more than one non-empty fragment.
pub(crate) enum PayloadView<'a> {
    Borrowed(&'a [u8]),
    Staged(Vec<u8>),
}

impl<'a> PayloadView<'a> {
    pub fn new(fragments: &'a [&[u8]]) -> Result<Self, Error> {
        match fragments {
            [] => Ok(PayloadView::Borrowed(&[])),
            [single] => Ok(PayloadView::Borrowed(*single)),
            many => {
                let total = many.iter().map(|fragment| fragment.len()).sum();
                let mut staging = Vec::new();
                staging.try_reserve_exact(total).map_err(|_| Error::Memory)?;
                for fragment in many {
                    staging.extend_from_slice(fragment);
                }
                Ok(PayloadView::Staged(staging))
            }
        }
    }
}

impl core::ops::Deref for PayloadView<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            PayloadView::Borrowed(bytes) => bytes,
            PayloadView::Staged(staging) => staging,
        }
    }
}

/// The profile-independent transport contract.
pub trait Transport {
    fn local_node_id(&self) -> Option<NodeId>;

    /// One-shot `unset -> value` transition; setting the current value again
    /// is idempotent, any other change fails with [`Error::Argument`].
    fn set_local_node_id(&mut self, node_id: NodeId) -> Result<(), Error>;

    fn protocol_params(&self) -> ProtocolParams;

    fn make_message_rx_session(
        &mut self,
        params: MessageRxParams,
    ) -> Result<Box<dyn MessageRxSession>, Error>;

    fn make_message_tx_session(
        &mut self,
        params: MessageTxParams,
    ) -> Result<Box<dyn MessageTxSession>, Error>;

    fn make_request_rx_session(
        &mut self,
        params: RequestRxParams,
    ) -> Result<Box<dyn RequestRxSession>, Error>;

    fn make_request_tx_session(
        &mut self,
        params: RequestTxParams,
    ) -> Result<Box<dyn RequestTxSession>, Error>;

    fn make_response_rx_session(
        &mut self,
        params: ResponseRxParams,
    ) -> Result<Box<dyn ResponseRxSession>, Error>;

    fn make_response_tx_session(
        &mut self,
        params: ResponseTxParams,
    ) -> Result<Box<dyn ResponseTxSession>, Error>;

    /// Advances TX queues, drains received frames, reconciles filters and
    /// expires timed-out reassembly state. Bounded by the work ready at
    /// entry; never blocks.
    fn run(&mut self, now: Instant);
}
