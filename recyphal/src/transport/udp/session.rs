//! The six Cyphal/UDP session objects
//!
//! Same shape as the CAN profile sessions: RX sessions co-own their
//! subscription record (including its multicast sockets) with the transport
//! registry, TX sessions forward into the redundant datagram send path.

use alloc::boxed::Box;
use alloc::rc::Rc;
use core::cell::RefCell;

use recyphal_media::time::Duration;

use crate::transport::udp::{Shared, UdpSubscription};
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
        // Anonymous service datagrams are rejected at dispatch.
        remote_node_id: unwrap!(transfer.source),
        payload: transfer.payload,
    }
}

pub struct UdpMessageRxSession {
    shared: Rc<RefCell<Shared>>,
    subscription: Rc<RefCell<UdpSubscription>>,
    params: MessageRxParams,
}

impl UdpMessageRxSession {
    pub(crate) fn new(
        shared: Rc<RefCell<Shared>>,
        subscription: Rc<RefCell<UdpSubscription>>,
        params: MessageRxParams,
    ) -> Self {
        Self {
            shared,
            subscription,
            params,
        }
    }
}

impl RxSession for UdpMessageRxSession {
    fn set_transfer_id_timeout(&mut self, timeout: Duration) {
        self.subscription.borrow_mut().timeout = timeout;
    }
}

impl MessageRxSession for UdpMessageRxSession {
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

impl Drop for UdpMessageRxSession {
    fn drop(&mut self) {
        self.shared
            .borrow_mut()
            .unregister(SessionKind::Message, self.params.subject_id.into_u16());
    }
}

pub struct UdpMessageTxSession {
    shared: Rc<RefCell<Shared>>,
    params: MessageTxParams,
}

impl UdpMessageTxSession {
    pub(crate) fn new(shared: Rc<RefCell<Shared>>, params: MessageTxParams) -> Self {
        Self { shared, params }
    }
}

impl MessageTxSession for UdpMessageTxSession {
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

pub struct UdpRequestRxSession {
    shared: Rc<RefCell<Shared>>,
    subscription: Rc<RefCell<UdpSubscription>>,
    params: RequestRxParams,
}

impl UdpRequestRxSession {
    pub(crate) fn new(
        shared: Rc<RefCell<Shared>>,
        subscription: Rc<RefCell<UdpSubscription>>,
        params: RequestRxParams,
    ) -> Self {
        Self {
            shared,
            subscription,
            params,
        }
    }
}

impl RxSession for UdpRequestRxSession {
    fn set_transfer_id_timeout(&mut self, timeout: Duration) {
        self.subscription.borrow_mut().timeout = timeout;
    }
}

impl RequestRxSession for UdpRequestRxSession {
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

impl Drop for UdpRequestRxSession {
    fn drop(&mut self) {
        self.shared
            .borrow_mut()
            .unregister(SessionKind::Request, self.params.service_id.into_u16());
    }
}

pub struct UdpRequestTxSession {
    shared: Rc<RefCell<Shared>>,
    params: RequestTxParams,
}

impl UdpRequestTxSession {
    pub(crate) fn new(shared: Rc<RefCell<Shared>>, params: RequestTxParams) -> Self {
        Self { shared, params }
    }
}

impl RequestTxSession for UdpRequestTxSession {
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

pub struct UdpResponseRxSession {
    shared: Rc<RefCell<Shared>>,
    subscription: Rc<RefCell<UdpSubscription>>,
    params: ResponseRxParams,
}

impl UdpResponseRxSession {
    pub(crate) fn new(
        shared: Rc<RefCell<Shared>>,
        subscription: Rc<RefCell<UdpSubscription>>,
        params: ResponseRxParams,
    ) -> Self {
        Self {
            shared,
            subscription,
            params,
        }
    }
}

impl RxSession for UdpResponseRxSession {
    fn set_transfer_id_timeout(&mut self, timeout: Duration) {
        self.subscription.borrow_mut().timeout = timeout;
    }
}

impl ResponseRxSession for UdpResponseRxSession {
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

impl Drop for UdpResponseRxSession {
    fn drop(&mut self) {
        self.shared
            .borrow_mut()
            .unregister(SessionKind::Response, self.params.service_id.into_u16());
    }
}

pub struct UdpResponseTxSession {
    shared: Rc<RefCell<Shared>>,
    params: ResponseTxParams,
}

impl UdpResponseTxSession {
    pub(crate) fn new(shared: Rc<RefCell<Shared>>, params: ResponseTxParams) -> Self {
        Self { shared, params }
    }
}

impl ResponseTxSession for UdpResponseTxSession {
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
