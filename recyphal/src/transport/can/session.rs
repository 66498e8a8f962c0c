//! The six Cyphal/CAN session objects
//!
//! RX sessions co-own their subscription record with the transport
//! registry; dropping the session unregisters it and marks the filter set
//! dirty. TX sessions are stateless forwarders into the transport's
//! redundant send path.

use alloc::boxed::Box;
use alloc::rc::Rc;
use core::cell::RefCell;

use recyphal_media::time::Duration;

use crate::transport::can::{Shared, Subscription};
use crate::transport::{
    Error, MessageRxParams, MessageRxSession, MessageTransfer, MessageTxParams, MessageTxSession,
    RequestRxParams, RequestRxSession, RequestTxParams, RequestTxSession, ResponseRxParams,
    ResponseRxSession, ResponseTxParams, ResponseTxSession, RxSession, RxTransfer, ServiceTransfer,
    ServiceTxMetadata, SessionKind, TransferTxMetadata, TxKind,
};

fn into_message(transfer: RxTransfer) -> MessageTransfer {
    MessageTransfer {
        metadata: transfer.metadata,
        source_node_id: transfer.source,
        payload: transfer.payload,
    }
}

fn into_service(transfer: RxTransfer) -> ServiceTransfer {
    ServiceTransfer {
        metadata: transfer.metadata,
        // Service frames from anonymous sources do not exist on the wire.
        remote_node_id: unwrap!(transfer.source),
        payload: transfer.payload,
    }
}

pub struct CanMessageRxSession {
    shared: Rc<RefCell<Shared>>,
    subscription: Rc<RefCell<Subscription>>,
    params: MessageRxParams,
}

impl CanMessageRxSession {
    pub(crate) fn new(
        shared: Rc<RefCell<Shared>>,
        subscription: Rc<RefCell<Subscription>>,
        params: MessageRxParams,
    ) -> Self {
        Self {
            shared,
            subscription,
            params,
        }
    }
}

impl RxSession for CanMessageRxSession {
    fn set_transfer_id_timeout(&mut self, timeout: Duration) {
        self.subscription.borrow_mut().timeout = timeout;
    }
}

impl MessageRxSession for CanMessageRxSession {
    fn params(&self) -> MessageRxParams {
        self.params
    }

    fn receive(&mut self) -> Option<MessageTransfer> {
        self.subscription.borrow_mut().latched.take().map(into_message)
    }

    fn set_on_receive(&mut self, callback: Option<Box<dyn FnMut(MessageTransfer)>>) {
        match callback {
            Some(mut user) => {
                let latched = self.subscription.borrow_mut().latched.take();
                if let Some(transfer) = latched {
                    user(into_message(transfer));
                }
                self.subscription.borrow_mut().callback =
                    Some(Box::new(move |transfer| user(into_message(transfer))));
            }
            None => self.subscription.borrow_mut().callback = None,
        }
    }
}

impl Drop for CanMessageRxSession {
    fn drop(&mut self) {
        self.shared
            .borrow_mut()
            .unregister(SessionKind::Message, self.params.subject_id.into_u16());
    }
}

pub struct CanMessageTxSession {
    shared: Rc<RefCell<Shared>>,
    params: MessageTxParams,
}

impl CanMessageTxSession {
    pub(crate) fn new(shared: Rc<RefCell<Shared>>, params: MessageTxParams) -> Self {
        Self { shared, params }
    }
}

impl MessageTxSession for CanMessageTxSession {
    fn params(&self) -> MessageTxParams {
        self.params
    }

    fn send(&mut self, metadata: &TransferTxMetadata, payload: &[&[u8]]) -> Result<(), Error> {
        self.shared.borrow_mut().send_transfer(
            TxKind::Message {
                subject: self.params.subject_id,
            },
            metadata,
            payload,
        )
    }
}

pub struct CanRequestRxSession {
    shared: Rc<RefCell<Shared>>,
    subscription: Rc<RefCell<Subscription>>,
    params: RequestRxParams,
}

impl CanRequestRxSession {
    pub(crate) fn new(
        shared: Rc<RefCell<Shared>>,
        subscription: Rc<RefCell<Subscription>>,
        params: RequestRxParams,
    ) -> Self {
        Self {
            shared,
            subscription,
            params,
        }
    }
}

impl RxSession for CanRequestRxSession {
    fn set_transfer_id_timeout(&mut self, timeout: Duration) {
        self.subscription.borrow_mut().timeout = timeout;
    }
}

impl RequestRxSession for CanRequestRxSession {
    fn params(&self) -> RequestRxParams {
        self.params
    }

    fn receive(&mut self) -> Option<ServiceTransfer> {
        self.subscription.borrow_mut().latched.take().map(into_service)
    }

    fn set_on_receive(&mut self, callback: Option<Box<dyn FnMut(ServiceTransfer)>>) {
        match callback {
            Some(mut user) => {
                let latched = self.subscription.borrow_mut().latched.take();
                if let Some(transfer) = latched {
                    user(into_service(transfer));
                }
                self.subscription.borrow_mut().callback =
                    Some(Box::new(move |transfer| user(into_service(transfer))));
            }
            None => self.subscription.borrow_mut().callback = None,
        }
    }
}

impl Drop for CanRequestRxSession {
    fn drop(&mut self) {
        self.shared
            .borrow_mut()
            .unregister(SessionKind::Request, self.params.service_id.into_u16());
    }
}

pub struct CanRequestTxSession {
    shared: Rc<RefCell<Shared>>,
    params: RequestTxParams,
}

impl CanRequestTxSession {
    pub(crate) fn new(shared: Rc<RefCell<Shared>>, params: RequestTxParams) -> Self {
        Self { shared, params }
    }
}

impl RequestTxSession for CanRequestTxSession {
    fn params(&self) -> RequestTxParams {
        self.params
    }

    fn send(&mut self, metadata: &TransferTxMetadata, payload: &[&[u8]]) -> Result<(), Error> {
        self.shared.borrow_mut().send_transfer(
            TxKind::Request {
                service: self.params.service_id,
                destination: self.params.server_node_id,
            },
            metadata,
            payload,
        )
    }
}

pub struct CanResponseRxSession {
    shared: Rc<RefCell<Shared>>,
    subscription: Rc<RefCell<Subscription>>,
    params: ResponseRxParams,
}

impl CanResponseRxSession {
    pub(crate) fn new(
        shared: Rc<RefCell<Shared>>,
        subscription: Rc<RefCell<Subscription>>,
        params: ResponseRxParams,
    ) -> Self {
        Self {
            shared,
            subscription,
            params,
        }
    }
}

impl RxSession for CanResponseRxSession {
    fn set_transfer_id_timeout(&mut self, timeout: Duration) {
        self.subscription.borrow_mut().timeout = timeout;
    }
}

impl ResponseRxSession for CanResponseRxSession {
    fn params(&self) -> ResponseRxParams {
        self.params
    }

    fn receive(&mut self) -> Option<ServiceTransfer> {
        self.subscription.borrow_mut().latched.take().map(into_service)
    }

    fn set_on_receive(&mut self, callback: Option<Box<dyn FnMut(ServiceTransfer)>>) {
        match callback {
            Some(mut user) => {
                let latched = self.subscription.borrow_mut().latched.take();
                if let Some(transfer) = latched {
                    user(into_service(transfer));
                }
                self.subscription.borrow_mut().callback =
                    Some(Box::new(move |transfer| user(into_service(transfer))));
            }
            None => self.subscription.borrow_mut().callback = None,
        }
    }
}

impl Drop for CanResponseRxSession {
    fn drop(&mut self) {
        self.shared
            .borrow_mut()
            .unregister(SessionKind::Response, self.params.service_id.into_u16());
    }
}

pub struct CanResponseTxSession {
    shared: Rc<RefCell<Shared>>,
    params: ResponseTxParams,
}

impl CanResponseTxSession {
    pub(crate) fn new(shared: Rc<RefCell<Shared>>, params: ResponseTxParams) -> Self {
        Self { shared, params }
    }
}

impl ResponseTxSession for CanResponseTxSession {
    fn params(&self) -> ResponseTxParams {
        self.params
    }

    fn send(&mut self, metadata: &ServiceTxMetadata, payload: &[&[u8]]) -> Result<(), Error> {
        self.shared.borrow_mut().send_transfer(
            TxKind::Response {
                service: self.params.service_id,
                destination: metadata.remote_node_id,
            },
            &metadata.base,
            payload,
        )
    }
}
