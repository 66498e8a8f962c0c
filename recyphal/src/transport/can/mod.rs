//! Cyphal/CAN transport profile
//!
//! [`CanTransport`] composes the wire format, the frame splitter, the
//! per-session reassemblers and the per-media TX queues into the polled
//! transport contract. Outgoing transfers are enqueued on every attached
//! media (the receiver side deduplicates on transfer-id); incoming frames
//! are popped one per media per `run` and dispatched to the subscription
//! registry. Hardware acceptance filters are reconciled lazily through a
//! dirty flag whenever the subscription set or the local node id changes.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::rc::Rc;
use alloc::vec::Vec;
use core::cell::RefCell;

use recyphal_media::can::{CanMedia, Filter, PushOutcome};
use recyphal_media::frame::{Data, Mtu};
use recyphal_media::time::{Duration, Instant};
use recyphal_media::ExtendedId;

use crate::core::{NodeId, Priority, ServiceId, SubjectId, TransferId};
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
mod split;

pub use session::{
    CanMessageRxSession, CanMessageTxSession, CanRequestRxSession, CanRequestTxSession,
    CanResponseRxSession, CanResponseTxSession,
};

pub(crate) use format::crc16_of;

use assembly::TransferAssembler;
use format::{ParsedCanId, TailByte, TransferCrc, SOT_TOGGLE_BIT};
use split::FrameSplitter;

/// Maximum number of redundant CAN media per transport.
pub const MAX_MEDIA: usize = 255;

struct CanFrame {
    id: ExtendedId,
    data: Data,
}

struct MediaEntry {
    iface: Box<dyn CanMedia>,
    queue: TxQueue<CanFrame>,
}

/// Shared state of one RX subscription, co-owned by the transport registry
/// and the session object.
pub(crate) struct Subscription {
    pub extent: usize,
    pub timeout: Duration,
    /// Response subscriptions accept transfers from this node only.
    pub remote_filter: Option<NodeId>,
    pub assemblers: BTreeMap<u16, TransferAssembler>,
    pub latched: Option<RxTransfer>,
    pub callback: Option<Box<dyn FnMut(RxTransfer)>>,
}

impl Subscription {
    fn new(extent: usize, remote_filter: Option<NodeId>) -> Self {
        Self {
            extent,
            timeout: DEFAULT_TRANSFER_ID_TIMEOUT,
            remote_filter,
            assemblers: BTreeMap::new(),
            latched: None,
            callback: None,
        }
    }
}

pub(crate) struct Shared {
    media: Vec<MediaEntry>,
    node_id: Option<NodeId>,
    subscriptions: BTreeMap<(SessionKind, u16), Rc<RefCell<Subscription>>>,
    message_ports: usize,
    service_ports: usize,
    filters_dirty: bool,
    stats: Statistics,
}

impl Shared {
    fn min_mtu(&self) -> Mtu {
        self.media
            .iter()
            .map(|entry| entry.iface.mtu())
            .min()
            .unwrap_or(Mtu::Classic)
    }

    pub(crate) fn unregister(&mut self, kind: SessionKind, port_id: u16) {
        if self.subscriptions.remove(&(kind, port_id)).is_some() {
            match kind {
                SessionKind::Message => self.message_ports -= 1,
                SessionKind::Request | SessionKind::Response => self.service_ports -= 1,
            }
            self.filters_dirty = true;
        }
    }

    /// Fragments one transfer and enqueues the frames on every media.
    ///
    /// Succeeds if at least one media accepted the whole transfer;
    /// otherwise returns the first error encountered.
    pub(crate) fn send_transfer(
        &mut self,
        kind: TxKind,
        metadata: &TransferTxMetadata,
        fragments: &[&[u8]],
    ) -> Result<(), Error> {
        let payload = PayloadView::new(fragments)?;
        let payload: &[u8] = &payload;

        let can_id = match kind {
            TxKind::Message { subject } => {
                // Anonymous nodes may publish single-frame messages only.
                if self.node_id.is_none()
                    && !FrameSplitter::is_single_frame(payload.len(), self.min_mtu())
                {
                    return Err(Error::Argument);
                }
                format::message_can_id(
                    metadata.priority,
                    subject,
                    self.node_id,
                    pseudo_source_id(payload),
                )
            }
            TxKind::Request { service, destination } => {
                let source = self.node_id.ok_or(Error::Argument)?;
                format::service_can_id(metadata.priority, true, service, destination, source)
            }
            TxKind::Response { service, destination } => {
                let source = self.node_id.ok_or(Error::Argument)?;
                format::service_can_id(metadata.priority, false, service, destination, source)
            }
        };

        let mut first_error = None;
        let mut delivered = false;
        for entry in &mut self.media {
            let mtu = entry.iface.mtu();
            let frame_count = FrameSplitter::frame_count(payload.len(), mtu);
            if entry.queue.free_capacity() < frame_count {
                first_error.get_or_insert(Error::Capacity);
                continue;
            }
            for data in FrameSplitter::new(metadata.transfer_id, payload, mtu) {
                let pushed = entry.queue.push(
                    metadata.priority,
                    metadata.deadline,
                    CanFrame { id: can_id, data },
                );
                debug_assert!(pushed.is_ok());
            }
            delivered = true;
        }

        if delivered {
            Ok(())
        } else {
            Err(unwrap!(first_error))
        }
    }
}

/// Pseudo source id of anonymous frames, derived from the payload so that
/// replicas of the same transfer collide deliberately.
fn pseudo_source_id(payload: &[u8]) -> u8 {
    let mut crc = TransferCrc::default();
    crc.add_bytes(payload);
    (crc.get() & 0x7f) as u8
}

/// The Cyphal/CAN transport.
pub struct CanTransport {
    shared: Rc<RefCell<Shared>>,
}

impl CanTransport {
    /// Creates a transport over the given redundant media group.
    ///
    /// `tx_capacity` frames per media are reserved up front; `send` fails
    /// with [`Error::Capacity`] beyond that. The node id may be assigned
    /// here or later through [`Transport::set_local_node_id`].
    pub fn new(
        media: Vec<Box<dyn CanMedia>>,
        tx_capacity: usize,
        local_node_id: Option<NodeId>,
    ) -> Result<Self, Error> {
        if media.is_empty() || media.len() > MAX_MEDIA {
            return Err(Error::Argument);
        }
        if let Some(node_id) = local_node_id {
            if !node_id.is_valid_for_can() {
                return Err(Error::Argument);
            }
        }

        let mut entries = Vec::new();
        entries
            .try_reserve_exact(media.len())
            .map_err(|_| Error::Memory)?;
        for iface in media {
            entries.push(MediaEntry {
                queue: TxQueue::new(tx_capacity)?,
                iface,
            });
        }

        Ok(Self {
            shared: Rc::new(RefCell::new(Shared {
                media: entries,
                node_id: local_node_id,
                subscriptions: BTreeMap::new(),
                message_ports: 0,
                service_ports: 0,
                filters_dirty: false,
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
    ) -> Result<Rc<RefCell<Subscription>>, Error> {
        let mut shared = self.shared.borrow_mut();
        if shared.subscriptions.contains_key(&(kind, port_id)) {
            return Err(Error::AlreadyExists);
        }
        let subscription = Rc::new(RefCell::new(Subscription::new(extent, remote_filter)));
        shared
            .subscriptions
            .insert((kind, port_id), subscription.clone());
        match kind {
            SessionKind::Message => shared.message_ports += 1,
            SessionKind::Request | SessionKind::Response => shared.service_ports += 1,
        }
        shared.filters_dirty = true;
        Ok(subscription)
    }

    fn run_tx(shared: &mut Shared, now: Instant) {
        for entry in &mut shared.media {
            loop {
                let Some((frame, deadline)) = entry.queue.peek(now) else {
                    break;
                };
                match entry.iface.push(deadline, frame.id, &frame.data) {
                    Ok(PushOutcome::Sent) => {
                        entry.queue.pop();
                    }
                    Ok(PushOutcome::Busy) => break,
                    Err(media_error) => {
                        warn!("tx media error {}, frame dropped", media_error.code);
                        shared.stats.tx_media_errors += 1;
                        entry.queue.pop();
                    }
                }
            }
            shared.stats.tx_frames_expired += entry.queue.take_expired();
        }
    }

    fn run_rx(shared: &mut Shared, deliveries: &mut Vec<(Rc<RefCell<Subscription>>, RxTransfer)>) {
        let mut payload = [0u8; Mtu::Fd.as_usize()];
        for media_index in 0..shared.media.len() {
            let rx_meta = match shared.media[media_index].iface.pop(&mut payload) {
                Ok(Some(rx_meta)) => rx_meta,
                Ok(None) => continue,
                Err(media_error) => {
                    warn!("rx media error {}", media_error.code);
                    shared.stats.rx_media_errors += 1;
                    continue;
                }
            };

            let Some(parsed) = format::parse_can_id(rx_meta.id) else {
                shared.stats.rx_frames_rejected += 1;
                continue;
            };
            let data = &payload[..core::cmp::min(rx_meta.length, payload.len())];

            match parsed {
                ParsedCanId::Message {
                    priority,
                    subject,
                    source,
                } => {
                    let Some(subscription) = shared
                        .subscriptions
                        .get(&(SessionKind::Message, subject.into_u16()))
                        .cloned()
                    else {
                        continue;
                    };
                    match source {
                        Some(source_node) => {
                            Self::feed_assembler(
                                &subscription,
                                media_index as u8,
                                source_node,
                                priority,
                                data,
                                rx_meta.timestamp,
                                deliveries,
                            );
                        }
                        None => {
                            // Anonymous publishers are restricted to
                            // single-frame transfers.
                            if let Some(transfer) =
                                anonymous_transfer(&subscription, priority, data, rx_meta.timestamp)
                            {
                                deliveries.push((subscription, transfer));
                            } else {
                                shared.stats.rx_frames_rejected += 1;
                            }
                        }
                    }
                }
                ParsedCanId::Service {
                    priority,
                    request,
                    service,
                    destination,
                    source,
                } => {
                    // Service frames not addressed to us are normal bus
                    // traffic when hardware filtering is coarse.
                    if shared.node_id != Some(destination) {
                        continue;
                    }
                    let kind = if request {
                        SessionKind::Request
                    } else {
                        SessionKind::Response
                    };
                    let Some(subscription) = shared
                        .subscriptions
                        .get(&(kind, service.into_u16()))
                        .cloned()
                    else {
                        continue;
                    };
                    if let Some(expected) = subscription.borrow().remote_filter {
                        if expected != source {
                            continue;
                        }
                    }
                    Self::feed_assembler(
                        &subscription,
                        media_index as u8,
                        source,
                        priority,
                        data,
                        rx_meta.timestamp,
                        deliveries,
                    );
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn feed_assembler(
        subscription: &Rc<RefCell<Subscription>>,
        media_index: u8,
        source: NodeId,
        priority: Priority,
        data: &[u8],
        timestamp: Instant,
        deliveries: &mut Vec<(Rc<RefCell<Subscription>>, RxTransfer)>,
    ) {
        let mut sub = subscription.borrow_mut();
        let timeout = sub.timeout;
        let extent = sub.extent;
        let assembler = sub
            .assemblers
            .entry(u16::from(source))
            .or_insert_with(|| TransferAssembler::new(extent));
        let completed = assembler.push_frame(timeout, media_index, priority, data, timestamp);
        drop(sub);

        if let Some(completed) = completed {
            deliveries.push((
                subscription.clone(),
                RxTransfer {
                    metadata: TransferMetadata {
                        transfer_id: TransferId::new(u64::from(completed.transfer_id5)),
                        priority: completed.priority,
                        timestamp: completed.timestamp,
                    },
                    source: Some(source),
                    payload: completed.payload,
                },
            ));
        }
    }

    /// Rebuilds and applies the acceptance filter set when marked dirty.
    ///
    /// One filter per message subscription, plus one per service
    /// subscription while the node is non-anonymous. Any failure keeps the
    /// dirty flag set so the next run retries.
    fn run_filters(shared: &mut Shared) {
        if !shared.filters_dirty {
            return;
        }

        let service_filters = match shared.node_id {
            Some(_) => shared.service_ports,
            None => 0,
        };
        let mut filters: Vec<Filter> = Vec::new();
        if filters
            .try_reserve_exact(shared.message_ports + service_filters)
            .is_err()
        {
            return;
        }

        for (kind, port_id) in shared.subscriptions.keys() {
            match kind {
                SessionKind::Message => {
                    filters.push(format::filter_for_subject(SubjectId::from_u16_truncating(
                        *port_id,
                    )));
                }
                SessionKind::Request | SessionKind::Response => {
                    if let Some(local) = shared.node_id {
                        filters.push(format::filter_for_service(
                            ServiceId::from_u16_truncating(*port_id),
                            local,
                        ));
                    }
                }
            }
        }

        let mut failed = false;
        for entry in &mut shared.media {
            if let Err(media_error) = entry.iface.set_filters(&filters) {
                warn!("filter reconfiguration failed: {}", media_error.code);
                failed = true;
            }
        }
        if !failed {
            shared.filters_dirty = false;
        }
    }

    fn run_timers(shared: &mut Shared, now: Instant) {
        for subscription in shared.subscriptions.values() {
            let mut sub = subscription.borrow_mut();
            let timeout = sub.timeout;
            sub.assemblers.retain(|_, assembler| {
                assembler.expire(now, timeout);
                !assembler.is_idle()
            });
        }
    }

    fn deliver(deliveries: Vec<(Rc<RefCell<Subscription>>, RxTransfer)>) {
        for (subscription, transfer) in deliveries {
            // The callback is taken out for the call so it may re-enter the
            // transport (e.g. send a response) without a borrow conflict.
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

/// Shapes an anonymous single-frame message directly into a transfer.
fn anonymous_transfer(
    subscription: &Rc<RefCell<Subscription>>,
    priority: Priority,
    data: &[u8],
    timestamp: Instant,
) -> Option<RxTransfer> {
    let (tail_byte, body) = data.split_last()?;
    let tail = TailByte::from(*tail_byte);
    if !tail.sot() || !tail.eot() || tail.toggle() != SOT_TOGGLE_BIT {
        return None;
    }
    let extent = subscription.borrow().extent;
    let length = core::cmp::min(body.len(), extent);
    let mut payload = Vec::new();
    payload.try_reserve_exact(length).ok()?;
    payload.extend_from_slice(&body[..length]);
    Some(RxTransfer {
        metadata: TransferMetadata {
            transfer_id: TransferId::new(u64::from(tail.transfer_id5())),
            priority,
            timestamp,
        },
        source: None,
        payload,
    })
}

impl Transport for CanTransport {
    fn local_node_id(&self) -> Option<NodeId> {
        self.shared.borrow().node_id
    }

    fn set_local_node_id(&mut self, node_id: NodeId) -> Result<(), Error> {
        if !node_id.is_valid_for_can() {
            return Err(Error::Argument);
        }
        let mut shared = self.shared.borrow_mut();
        match shared.node_id {
            Some(current) if current == node_id => Ok(()),
            Some(_) => Err(Error::Argument),
            None => {
                shared.node_id = Some(node_id);
                // Now that service transfers can address us, service
                // subscriptions become filterable.
                if shared.service_ports > 0 {
                    shared.filters_dirty = true;
                }
                Ok(())
            }
        }
    }

    fn protocol_params(&self) -> ProtocolParams {
        ProtocolParams {
            transfer_id_modulo: TransferId::CAN_MODULO,
            mtu_bytes: self.shared.borrow().min_mtu().as_usize(),
            max_nodes: u32::from(u16::from(NodeId::CAN_MAX)) + 1,
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
        Ok(Box::new(CanMessageRxSession::new(
            self.shared.clone(),
            subscription,
            params,
        )))
    }

    fn make_message_tx_session(
        &mut self,
        params: MessageTxParams,
    ) -> Result<Box<dyn MessageTxSession>, Error> {
        Ok(Box::new(CanMessageTxSession::new(
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
        Ok(Box::new(CanRequestRxSession::new(
            self.shared.clone(),
            subscription,
            params,
        )))
    }

    fn make_request_tx_session(
        &mut self,
        params: RequestTxParams,
    ) -> Result<Box<dyn RequestTxSession>, Error> {
        if !params.server_node_id.is_valid_for_can() {
            return Err(Error::Argument);
        }
        Ok(Box::new(CanRequestTxSession::new(
            self.shared.clone(),
            params,
        )))
    }

    fn make_response_rx_session(
        &mut self,
        params: ResponseRxParams,
    ) -> Result<Box<dyn ResponseRxSession>, Error> {
        if !params.server_node_id.is_valid_for_can() {
            return Err(Error::Argument);
        }
        let subscription = self.register(
            SessionKind::Response,
            params.service_id.into_u16(),
            params.extent_bytes,
            Some(params.server_node_id),
        )?;
        Ok(Box::new(CanResponseRxSession::new(
            self.shared.clone(),
            subscription,
            params,
        )))
    }

    fn make_response_tx_session(
        &mut self,
        params: ResponseTxParams,
    ) -> Result<Box<dyn ResponseTxSession>, Error> {
        Ok(Box::new(CanResponseTxSession::new(
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
            Self::run_filters(shared);
            Self::run_timers(shared, now);
        }
        // Callbacks run with no internal borrow held.
        Self::deliver(deliveries);
    }
}

impl Drop for CanTransport {
    fn drop(&mut self) {
        // Sessions must not outlive the transport that created them.
        debug_assert!(
            self.shared.borrow().subscriptions.is_empty(),
            "sessions must be destroyed before the transport"
        );
    }
}
