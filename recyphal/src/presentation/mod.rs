//! Presentation layer: typed clients over raw transport sessions
//!
//! A client owns one request-TX / response-RX session pair on a service
//! port and correlates outgoing requests with inbound responses through
//! response promises (see [`promise`]). The application drives expiration
//! by calling `run(now)` on the client at its loop cadence, next to
//! `transport.run(now)`.
//!
//! Typed clients serialize requests and deserialize responses through the
//! `recyphal-encoding` traits; a deserialization failure settles the
//! promise with [`PromiseFailure::Decode`]. Raw clients bypass both
//! directions and move byte buffers.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::rc::{Rc, Weak};
use alloc::vec::Vec;
use core::cell::RefCell;
use core::marker::PhantomData;

use recyphal_encoding::{Deserialize, Serialize};
use recyphal_media::time::Instant;

use crate::core::{NodeId, Priority, ServiceId, TransferId};
use crate::transport::{
    Error, RequestTxParams, RequestTxSession, ResponseRxParams, ResponseRxSession,
    ServiceTransfer, TransferTxMetadata, Transport,
};

mod promise;

pub use promise::{
    PromiseCallbackArg, PromiseExpired, PromiseFailure, PromiseResult, PromiseSuccess,
    RawPromiseFailure, RawResponsePromise, ResponsePromise,
};

use promise::{accept_result, PromiseState};

type Pending<P, F> = Rc<RefCell<BTreeMap<u64, Weak<RefCell<PromiseState<P, F>>>>>>;

/// The untyped correlation machinery shared by typed and raw clients.
struct ClientCore<P, F> {
    request_tx: Box<dyn RequestTxSession>,
    /// Kept alive for the registry entry; delivery goes through its
    /// callback into `pending`.
    _response_rx: Box<dyn ResponseRxSession>,
    pending: Pending<P, F>,
    next_transfer_id: TransferId,
    priority: Priority,
    expired: fn(PromiseExpired) -> F,
}

impl<P: 'static, F: 'static> ClientCore<P, F> {
    fn new(
        transport: &mut dyn Transport,
        service_id: ServiceId,
        server_node_id: NodeId,
        response_extent: usize,
        priority: Priority,
        decode: fn(&ServiceTransfer) -> PromiseResult<P, F>,
        expired: fn(PromiseExpired) -> F,
    ) -> Result<Self, Error> {
        let request_tx = transport.make_request_tx_session(RequestTxParams {
            service_id,
            server_node_id,
        })?;
        let mut response_rx = transport.make_response_rx_session(ResponseRxParams {
            extent_bytes: response_extent,
            service_id,
            server_node_id,
        })?;

        let pending: Pending<P, F> = Rc::new(RefCell::new(BTreeMap::new()));
        let delivery = pending.clone();
        response_rx.set_on_receive(Some(Box::new(move |transfer: ServiceTransfer| {
            let correlated = delivery
                .borrow_mut()
                .remove(&transfer.metadata.transfer_id.into_u64());
            // Promises dropped by the application leave dead entries; the
            // late response is discarded.
            let Some(state) = correlated.and_then(|weak| weak.upgrade()) else {
                return;
            };
            let approx_now = transfer.metadata.timestamp;
            accept_result(&state, decode(&transfer), approx_now);
        })));

        Ok(Self {
            request_tx,
            _response_rx: response_rx,
            pending,
            next_transfer_id: TransferId::SESSION_START,
            priority,
            expired,
        })
    }

    fn request(
        &mut self,
        now: Instant,
        response_deadline: Instant,
        payload: &[&[u8]],
    ) -> Result<ResponsePromise<P, F>, Error> {
        let transfer_id = self.next_transfer_id;
        self.request_tx.send(
            &TransferTxMetadata {
                transfer_id,
                priority: self.priority,
                deadline: response_deadline,
            },
            payload,
        )?;
        self.next_transfer_id = transfer_id.next();

        let state = Rc::new(RefCell::new(PromiseState::new(now, response_deadline)));
        self.pending
            .borrow_mut()
            .insert(transfer_id.into_u64(), Rc::downgrade(&state));
        Ok(ResponsePromise::new(state))
    }

    /// Expires due promises and sweeps abandoned ones.
    fn run(&mut self, now: Instant) {
        let mut due = Vec::new();
        self.pending.borrow_mut().retain(|_, weak| {
            let Some(state) = weak.upgrade() else {
                return false;
            };
            let deadline = state.borrow().deadline;
            if deadline <= now {
                due.push((state, deadline));
                return false;
            }
            true
        });

        let expired = self.expired;
        for (state, deadline) in due {
            accept_result(&state, Err(expired(PromiseExpired { deadline })), now);
        }
    }
}

/// Strong-typed service client.
pub struct Client<Req: Serialize, Rsp: Deserialize + 'static> {
    core: ClientCore<Rsp, PromiseFailure>,
    _request: PhantomData<Req>,
}

impl<Req: Serialize, Rsp: Deserialize + 'static> Client<Req, Rsp> {
    pub fn new(
        transport: &mut dyn Transport,
        service_id: ServiceId,
        server_node_id: NodeId,
        response_extent: usize,
        priority: Priority,
    ) -> Result<Self, Error> {
        Ok(Self {
            core: ClientCore::new(
                transport,
                service_id,
                server_node_id,
                response_extent,
                priority,
                decode_typed::<Rsp>,
                PromiseFailure::Expired,
            )?,
            _request: PhantomData,
        })
    }

    /// Serializes and sends a request; the returned promise settles with
    /// the response or expires at `response_deadline`.
    pub fn request(
        &mut self,
        now: Instant,
        response_deadline: Instant,
        request: &Req,
    ) -> Result<ResponsePromise<Rsp, PromiseFailure>, Error> {
        let size = request.size_bytes();
        let mut buffer = Vec::new();
        buffer.try_reserve_exact(size).map_err(|_| Error::Memory)?;
        buffer.resize(size, 0);
        request.serialize_to_bytes(&mut buffer);

        self.core.request(now, response_deadline, &[&buffer])
    }

    pub fn run(&mut self, now: Instant) {
        self.core.run(now);
    }
}

/// Untyped service client moving raw byte buffers.
pub struct RawClient {
    core: ClientCore<Vec<u8>, RawPromiseFailure>,
}

impl RawClient {
    pub fn new(
        transport: &mut dyn Transport,
        service_id: ServiceId,
        server_node_id: NodeId,
        response_extent: usize,
        priority: Priority,
    ) -> Result<Self, Error> {
        Ok(Self {
            core: ClientCore::new(
                transport,
                service_id,
                server_node_id,
                response_extent,
                priority,
                decode_raw,
                RawPromiseFailure::Expired,
            )?,
        })
    }

    pub fn request(
        &mut self,
        now: Instant,
        response_deadline: Instant,
        payload: &[&[u8]],
    ) -> Result<RawResponsePromise, Error> {
        self.core.request(now, response_deadline, payload)
    }

    pub fn run(&mut self, now: Instant) {
        self.core.run(now);
    }
}

fn decode_typed<Rsp: Deserialize>(
    transfer: &ServiceTransfer,
) -> PromiseResult<Rsp, PromiseFailure> {
    match Rsp::deserialize_from_bytes(&transfer.payload) {
        Ok(response) => Ok(PromiseSuccess {
            response,
            metadata: transfer.metadata,
            remote_node_id: transfer.remote_node_id,
        }),
        Err(decode_error) => Err(PromiseFailure::Decode(decode_error)),
    }
}

fn decode_raw(transfer: &ServiceTransfer) -> PromiseResult<Vec<u8>, RawPromiseFailure> {
    Ok(PromiseSuccess {
        response: transfer.payload.clone(),
        metadata: transfer.metadata,
        remote_node_id: transfer.remote_node_id,
    })
}
