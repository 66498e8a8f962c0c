//! Cyphal/UDP transport profile
//!
//! [`UdpTransport`] carries transfers in multicast datagrams: one TX socket
//! per media, one RX socket per `(subscription, media)` joined to the
//! multicast group derived from the subject (messages) or from the local
//! node id (services). Fragmentation uses the 24-byte header of
//! [`format::UdpHeader`]; reassembly tolerates out-of-order fragments.
//!
//! Service subscriptions created while the node is anonymous cannot join a
//! group yet (the group encodes the local node id); their sockets are
//! reconciled lazily by `run` once the node id is assigned, mirroring the
//! CAN profile's filter dirty flag.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::rc::Rc;
use alloc::vec::Vec;
use core::cell::RefCell;

use recyphal_media::can::PushOutcome;
use recyphal_media::time::{Duration, Instant};
use recyphal_media::udp::{UdpEndpoint, UdpMedia, UdpRxSocket, UdpTxSocket};

use crate::core::{DataSpecifier, NodeId};
use crate::transport::tx_queue::TxQueue;
use crate::transport::{
    Error, MessageRxParams, MessageRxSession, MessageTxParams, MessageTxSession, PayloadView,
    ProtocolParams, RequestRxParams, RequestRxSession, RequestTxParams, RequestTxSession,
    ResponseRxParams, ResponseRxSession, ResponseTxParams, ResponseTxSession, RxTransfer,
    SessionKind, Statistics, TransferMetadata, TransferTxMetadata, Transport, TxKind,
    DEFAULT_TRANSFER_ID_TIMEOUT,
};

mod assembly;
mod format;
mod session;

pub use format::UDP_PORT;
pub use session::{
    UdpMessageRxSession, UdpMessageTxSession, UdpRequestRxSession, UdpRequestTxSession,
    UdpResponseRxSession, UdpResponseTxSession,
};

use assembly::FragmentAssembler;
use format::{crc32c_of, UdpHeader, HEADER_SIZE};

/// Maximum number of redundant network interfaces per transport.
pub const MAX_MEDIA: usize = 3;

struct UdpFrame {
    endpoint: UdpEndpoint,
    data: Vec<u8>,
}

struct MediaEntry {
    iface: Box<dyn UdpMedia>,
    tx_socket: Box<dyn UdpTxSocket>,
    queue: TxQueue<UdpFrame>,
}

pub(crate) struct UdpSubscription {
    kind: SessionKind,
    port_id: u16,
    pub extent: usize,
    pub timeout: Duration,
    pub remote_filter: Option<NodeId>,
    assembler: FragmentAssembler,
    /// One RX socket per media; empty while `sockets_pending`.
    sockets: Vec<Box<dyn UdpRxSocket>>,
    /// Service subscriptions wait here until the node id is known.
    sockets_pending: bool,
    pub latched: Option<RxTransfer>,
    pub callback: Option<Box<dyn FnMut(RxTransfer)>>,
}

pub(crate) struct Shared {
    media: Vec<MediaEntry>,
    node_id: Option<NodeId>,
    subscriptions: BTreeMap<(SessionKind, u16), Rc<RefCell<UdpSubscription>>>,
    /// Reused datagram buffer, sized to the largest media MTU.
    rx_buffer: Vec<u8>,
    stats: Statistics,
}

impl Shared {
    fn min_chunk_capacity(&self) -> usize {
        self.media
            .iter()
            .map(|entry| entry.iface.mtu().saturating_sub(HEADER_SIZE))
            .min()
            .unwrap_or(0)
    }

    pub(crate) fn unregister(&mut self, kind: SessionKind, port_id: u16) {
        self.subscriptions.remove(&(kind, port_id));
    }

    /// Fragments one transfer into datagrams and enqueues them on every
    /// media. Succeeds if at least one media accepted the whole transfer.
    pub(crate) fn send_transfer(
        &mut self,
        kind: TxKind,
        metadata: &TransferTxMetadata,
        fragments: &[&[u8]],
    ) -> Result<(), Error> {
        let payload = PayloadView::new(fragments)?;
        let payload: &[u8] = &payload;

        let (data_specifier, destination, endpoint) = match kind {
            TxKind::Message { subject } => {
                if self.node_id.is_none() && payload.len() > self.min_chunk_capacity() {
                    return Err(Error::Argument);
                }
                (
                    DataSpecifier::Message(subject),
                    None,
                    format::message_endpoint(subject),
                )
            }
            TxKind::Request { service, destination } => {
                self.node_id.ok_or(Error::Argument)?;
                (
                    DataSpecifier::Request(service),
                    Some(destination),
                    format::service_endpoint(destination),
                )
            }
            TxKind::Response { service, destination } => {
                self.node_id.ok_or(Error::Argument)?;
                (
                    DataSpecifier::Response(service),
                    Some(destination),
                    format::service_endpoint(destination),
                )
            }
        };

        // The CRC-terminated stream is built once, on the first media that
        // needs the multi-frame representation.
        let mut multi_stream: Option<Vec<u8>> = None;
        let mut first_error = None;
        let mut delivered = false;

        for entry in &mut self.media {
            let capacity = entry.iface.mtu().saturating_sub(HEADER_SIZE);
            if capacity == 0 {
                first_error.get_or_insert(Error::Argument);
                continue;
            }

            let stream: &[u8] = if payload.len() <= capacity {
                payload
            } else {
                if multi_stream.is_none() {
                    let mut stream = Vec::new();
                    if stream
                        .try_reserve_exact(payload.len() + format::TransferCrc32::LENGTH)
                        .is_err()
                    {
                        first_error.get_or_insert(Error::Memory);
                        continue;
                    }
                    stream.extend_from_slice(payload);
                    stream.extend_from_slice(&crc32c_of(payload).to_le_bytes());
                    multi_stream = Some(stream);
                }
                unwrap!(multi_stream.as_deref())
            };

            let frame_count = core::cmp::max(1, stream.len().div_ceil(capacity));
            if entry.queue.free_capacity() < frame_count {
                first_error.get_or_insert(Error::Capacity);
                continue;
            }

            let mut out_of_memory = false;
            for index in 0..frame_count {
                let chunk =
                    &stream[index * capacity..core::cmp::min((index + 1) * capacity, stream.len())];
                let header = UdpHeader {
                    priority: metadata.priority,
                    source: self.node_id,
                    destination,
                    data_specifier,
                    transfer_id: metadata.transfer_id,
                    frame_index: index as u32,
                    end_of_transfer: index == frame_count - 1,
                };

                let mut data = Vec::new();
                if data.try_reserve_exact(HEADER_SIZE + chunk.len()).is_err() {
                    first_error.get_or_insert(Error::Memory);
                    out_of_memory = true;
                    break;
                }
                data.extend_from_slice(&header.serialize());
                data.extend_from_slice(chunk);

                let pushed =
                    entry
                        .queue
                        .push(metadata.priority, metadata.deadline, UdpFrame { endpoint, data });
                debug_assert!(pushed.is_ok());
            }
            if !out_of_memory {
                delivered = true;
            }
        }

        if delivered {
            Ok(())
        } else {
            Err(unwrap!(first_error))
        }
    }
}

/// The Cyphal/UDP transport.
pub struct UdpTransport {
    shared: Rc<RefCell<Shared>>,
}

impl UdpTransport {
    /// Creates a transport over the given redundant media group.
    ///
    /// One TX socket is opened per media immediately; RX sockets follow the
    /// subscription set.
    pub fn new(
        media: Vec<Box<dyn UdpMedia>>,
        tx_capacity: usize,
        local_node_id: Option<NodeId>,
    ) -> Result<Self, Error> {
        if media.is_empty() || media.len() > MAX_MEDIA {
            return Err(Error::Argument);
        }

        let mut entries = Vec::new();
        entries
            .try_reserve_exact(media.len())
            .map_err(|_| Error::Memory)?;
        let mut max_mtu = 0;
        for mut iface in media {
            let tx_socket = iface.make_tx_socket().map_err(Error::Platform)?;
            max_mtu = core::cmp::max(max_mtu, iface.mtu());
            entries.push(MediaEntry {
                queue: TxQueue::new(tx_capacity)?,
                tx_socket,
                iface,
            });
        }

        let mut rx_buffer = Vec::new();
        rx_buffer
            .try_reserve_exact(max_mtu)
            .map_err(|_| Error::Memory)?;
        rx_buffer.resize(max_mtu, 0);

        Ok(Self {
            shared: Rc::new(RefCell::new(Shared {
                media: entries,
                node_id: local_node_id,
                subscriptions: BTreeMap::new(),
                rx_buffer,
                stats: Statistics::default(),
            })),
        })
    }

    pub fn statistics(&self) -> Statistics {
        self.shared.borrow().stats
    }

    fn register(
        &mut self,
        kind: SessionKind,
        port_id: u16,
        extent: usize,
        remote_filter: Option<NodeId>,
    ) -> Result<Rc<RefCell<UdpSubscription>>, Error> {
        let mut shared = self.shared.borrow_mut();
        let shared = &mut *shared;
        if shared.subscriptions.contains_key(&(kind, port_id)) {
            return Err(Error::AlreadyExists);
        }

        let mut subscription = UdpSubscription {
            kind,
            port_id,
            extent,
            timeout: DEFAULT_TRANSFER_ID_TIMEOUT,
            remote_filter,
            assembler: FragmentAssembler::new(extent),
            sockets: Vec::new(),
            sockets_pending: false,
            latched: None,
            callback: None,
        };

        match subscription_endpoint(kind, port_id, shared.node_id) {
            Some(endpoint) => {
                subscription.sockets = open_rx_sockets(&mut shared.media, endpoint)?;
            }
            // Anonymous node: the service group is unknown until the node
            // id is assigned.
            None => subscription.sockets_pending = true,
        }

        let subscription = Rc::new(RefCell::new(subscription));
        shared
            .subscriptions
            .insert((kind, port_id), subscription.clone());
        Ok(subscription)
    }

    fn run_tx(shared: &mut Shared, now: Instant) {
        for entry in &mut shared.media {
            loop {
                let Some((frame, deadline)) = entry.queue.peek(now) else {
                    break;
                };
                match entry.tx_socket.send(deadline, frame.endpoint, &frame.data) {
                    Ok(PushOutcome::Sent) => {
                        entry.queue.pop();
                    }
                    Ok(PushOutcome::Busy) => break,
                    Err(media_error) => {
                        warn!("tx media error {}, datagram dropped", media_error.code);
                        shared.stats.tx_media_errors += 1;
                        entry.queue.pop();
                    }
                }
            }
            shared.stats.tx_frames_expired += entry.queue.take_expired();
        }
    }

    fn run_rx(shared: &mut Shared, deliveries: &mut Vec<(Rc<RefCell<UdpSubscription>>, RxTransfer)>) {
        let local_node_id = shared.node_id;
        for subscription in shared.subscriptions.values() {
            let mut sub = subscription.borrow_mut();
            for socket_index in 0..sub.sockets.len() {
                let datagram = match sub.sockets[socket_index].receive(&mut shared.rx_buffer) {
                    Ok(Some(rx_meta)) => {
                        let length = core::cmp::min(rx_meta.length, shared.rx_buffer.len());
                        (rx_meta.timestamp, length)
                    }
                    Ok(None) => continue,
                    Err(media_error) => {
                        warn!("rx media error {}", media_error.code);
                        shared.stats.rx_media_errors += 1;
                        continue;
                    }
                };
                let (timestamp, length) = datagram;

                let Some(header) = UdpHeader::parse(&shared.rx_buffer[..length]) else {
                    shared.stats.rx_frames_rejected += 1;
                    continue;
                };
                let body = &shared.rx_buffer[HEADER_SIZE..length];

                if !sub.accepts(&header, local_node_id) {
                    continue;
                }

                match header.source {
                    Some(source) => {
                        let timeout = sub.timeout;
                        if let Some(completed) = sub.assembler.push_fragment(
                            timeout,
                            u16::from(source),
                            header.transfer_id,
                            header.frame_index,
                            header.end_of_transfer,
                            header.priority,
                            body,
                            timestamp,
                        ) {
                            deliveries.push((
                                subscription.clone(),
                                RxTransfer {
                                    metadata: TransferMetadata {
                                        transfer_id: completed.transfer_id,
                                        priority: completed.priority,
                                        timestamp: completed.timestamp,
                                    },
                                    source: Some(source),
                                    payload: completed.payload,
                                },
                            ));
                        }
                    }
                    None => {
                        // Anonymous publishers are restricted to
                        // single-frame message transfers.
                        if header.frame_index != 0 || !header.end_of_transfer {
                            shared.stats.rx_frames_rejected += 1;
                            continue;
                        }
                        let length = core::cmp::min(body.len(), sub.extent);
                        let mut payload = Vec::new();
                        if payload.try_reserve_exact(length).is_err() {
                            continue;
                        }
                        payload.extend_from_slice(&body[..length]);
                        deliveries.push((
                            subscription.clone(),
                            RxTransfer {
                                metadata: TransferMetadata {
                                    transfer_id: header.transfer_id,
                                    priority: header.priority,
                                    timestamp,
                                },
                                source: None,
                                payload,
                            },
                        ));
                    }
                }
            }
        }
    }

    /// Opens the deferred RX sockets of service subscriptions once the
    /// local node id is known; failures retry on the next run.
    fn run_socket_reconciliation(shared: &mut Shared) {
        let Some(_) = shared.node_id else {
            return;
        };
        for ((kind, port_id), subscription) in &shared.subscriptions {
            let mut sub = subscription.borrow_mut();
            if !sub.sockets_pending {
                continue;
            }
            let Some(endpoint) = subscription_endpoint(*kind, *port_id, shared.node_id) else {
                continue;
            };
            match open_rx_sockets(&mut shared.media, endpoint) {
                Ok(sockets) => {
                    sub.sockets = sockets;
                    sub.sockets_pending = false;
                }
                Err(_) => {
                    warn!("deferred rx socket setup failed, will retry");
                }
            }
        }
    }

    fn run_timers(shared: &mut Shared, now: Instant) {
        for subscription in shared.subscriptions.values() {
            let mut sub = subscription.borrow_mut();
            let timeout = sub.timeout;
            sub.assembler.expire(now, timeout);
        }
    }

    fn deliver(deliveries: Vec<(Rc<RefCell<UdpSubscription>>, RxTransfer)>) {
        for (subscription, transfer) in deliveries {
            let callback = subscription.borrow_mut().callback.take();
            match callback {
                Some(mut callback) => {
                    callback(transfer);
                    let mut sub = subscription.borrow_mut();
                    if sub.callback.is_none() {
                        sub.callback = Some(callback);
                    }
                }
                None => subscription.borrow_mut().latched = Some(transfer),
            }
        }
    }
}

impl UdpSubscription {
    /// Socket-level demultiplexing: service sockets share one multicast
    /// group per destination node, so each subscription filters for its own
    /// `(kind, port)` and lets the others' traffic pass.
    fn accepts(&self, header: &UdpHeader, local_node_id: Option<NodeId>) -> bool {
        let (kind, port_id) = match header.data_specifier {
            DataSpecifier::Message(subject) => (SessionKind::Message, subject.into_u16()),
            DataSpecifier::Request(service) => (SessionKind::Request, service.into_u16()),
            DataSpecifier::Response(service) => (SessionKind::Response, service.into_u16()),
        };
        if kind != self.kind || port_id != self.port_id {
            return false;
        }
        match kind {
            SessionKind::Message => header.destination.is_none(),
            SessionKind::Request | SessionKind::Response => {
                if header.destination != local_node_id || header.source.is_none() {
                    return false;
                }
                match self.remote_filter {
                    Some(expected) => header.source == Some(expected),
                    None => true,
                }
            }
        }
    }
}

fn subscription_endpoint(
    kind: SessionKind,
    port_id: u16,
    node_id: Option<NodeId>,
) -> Option<UdpEndpoint> {
    match kind {
        SessionKind::Message => Some(format::message_endpoint(
            crate::core::SubjectId::from_u16_truncating(port_id),
        )),
        SessionKind::Request | SessionKind::Response => node_id.map(format::service_endpoint),
    }
}

fn open_rx_sockets(
    media: &mut [MediaEntry],
    endpoint: UdpEndpoint,
) -> Result<Vec<Box<dyn UdpRxSocket>>, Error> {
    let mut sockets = Vec::new();
    sockets.try_reserve_exact(media.len()).map_err(|_| Error::Memory)?;
    for entry in media {
        sockets.push(entry.iface.make_rx_socket(endpoint).map_err(Error::Platform)?);
    }
    Ok(sockets)
}

impl Transport for UdpTransport {
    fn local_node_id(&self) -> Option<NodeId> {
        self.shared.borrow().node_id
    }

    fn set_local_node_id(&mut self, node_id: NodeId) -> Result<(), Error> {
        let mut shared = self.shared.borrow_mut();
        match shared.node_id {
            Some(current) if current == node_id => Ok(()),
            Some(_) => Err(Error::Argument),
            // Deferred service sockets are opened by the next run.
            None => {
                shared.node_id = Some(node_id);
                Ok(())
            }
        }
    }

    fn protocol_params(&self) -> ProtocolParams {
        ProtocolParams {
            // The full 64-bit space; saturated representation of 2**64.
            transfer_id_modulo: u64::MAX,
            mtu_bytes: self
                .shared
                .borrow()
                .media
                .iter()
                .map(|entry| entry.iface.mtu())
                .min()
                .unwrap_or(0),
            max_nodes: u32::from(u16::from(NodeId::MAX)) + 1,
        }
    }

    fn make_message_rx_session(
        &mut self,
        params: MessageRxParams,
    ) -> Result<Box<dyn MessageRxSession>, Error> {
        let subscription = self.register(
            SessionKind::Message,
            params.subject_id.into_u16(),
            params.extent_bytes,
            None,
        )?;
        Ok(Box::new(UdpMessageRxSession::new(
            self.shared.clone(),
            subscription,
            params,
        )))
    }

    fn make_message_tx_session(
        &mut self,
        params: MessageTxParams,
    ) -> Result<Box<dyn MessageTxSession>, Error> {
        Ok(Box::new(UdpMessageTxSession::new(
            self.shared.clone(),
            params,
        )))
    }

    fn make_request_rx_session(
        &mut self,
        params: RequestRxParams,
    ) -> Result<Box<dyn RequestRxSession>, Error> {
        let subscription = self.register(
            SessionKind::Request,
            params.service_id.into_u16(),
            params.extent_bytes,
            None,
        )?;
        Ok(Box::new(UdpRequestRxSession::new(
            self.shared.clone(),
            subscription,
            params,
        )))
    }

    fn make_request_tx_session(
        &mut self,
        params: RequestTxParams,
    ) -> Result<Box<dyn RequestTxSession>, Error> {
        Ok(Box::new(UdpRequestTxSession::new(
            self.shared.clone(),
            params,
        )))
    }

    fn make_response_rx_session(
        &mut self,
        params: ResponseRxParams,
    ) -> Result<Box<dyn ResponseRxSession>, Error> {
        let subscription = self.register(
            SessionKind::Response,
            params.service_id.into_u16(),
            params.extent_bytes,
            Some(params.server_node_id),
        )?;
        Ok(Box::new(UdpResponseRxSession::new(
            self.shared.clone(),
            subscription,
            params,
        )))
    }

    fn make_response_tx_session(
        &mut self,
        params: ResponseTxParams,
    ) -> Result<Box<dyn ResponseTxSession>, Error> {
        Ok(Box::new(UdpResponseTxSession::new(
            self.shared.clone(),
            params,
        )))
    }

    fn run(&mut self, now: Instant) {
        let mut deliveries = Vec::new();
        {
            let shared = &mut *self.shared.borrow_mut();
            Self::run_tx(shared, now);
            Self::run_rx(shared, &mut deliveries);
            Self::run_socket_reconciliation(shared);
            Self::run_timers(shared, now);
        }
        // Callbacks run with no internal borrow held.
        Self::deliver(deliveries);
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        // Sessions must not outlive the transport that created them.
        debug_assert!(
            self.shared.borrow().subscriptions.is_empty(),
            "sessions must be destroyed before the transport"
        );
    }
}
