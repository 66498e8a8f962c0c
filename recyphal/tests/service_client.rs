//! Request/response round trips, response promises and filter
//! reconciliation.

mod common;

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use common::{ts, CanMockState, MockCanMedia};

use recyphal::core::{NodeId, Priority, ServiceId, SubjectId};
use recyphal::encoding::{Deserialize, DeserializeError, Serialize};
use recyphal::media::frame::Mtu;
use recyphal::media::time::Instant;
use recyphal::presentation::{Client, PromiseFailure, RawClient, RawPromiseFailure};
use recyphal::transport::can::CanTransport;
use recyphal::transport::{
    MessageRxParams, RequestRxParams, RequestRxSession, ResponseTxParams, ResponseTxSession,
    ServiceTxMetadata, TransferTxMetadata, Transport,
};

const CLIENT_NODE: u16 = 0x01;
const SERVER_NODE: u16 = 0x10;
const SERVICE: u16 = 44;

fn node(id: u16) -> NodeId {
    NodeId::new(id).unwrap()
}

fn transport(node_id: u16) -> (CanTransport, Rc<RefCell<CanMockState>>) {
    let (media, state) = MockCanMedia::new(Mtu::Classic);
    let transport =
        CanTransport::new(vec![Box::new(media)], 16, Some(node(node_id))).unwrap();
    (transport, state)
}

fn forward(from: &Rc<RefCell<CanMockState>>, to: &Rc<RefCell<CanMockState>>, at: Instant) {
    let mut from = from.borrow_mut();
    for (_, id, data) in from.pushed.drain(..) {
        to.borrow_mut().inject(id, at, &data);
    }
}

#[test]
fn test_request_response_round_trip() {
    let (mut client_transport, client_state) = transport(CLIENT_NODE);
    let (mut server_transport, server_state) = transport(SERVER_NODE);

    let mut client = RawClient::new(
        &mut client_transport,
        ServiceId::new(SERVICE).unwrap(),
        node(SERVER_NODE),
        16,
        Priority::Nominal,
    )
    .unwrap();

    let mut request_rx = server_transport
        .make_request_rx_session(RequestRxParams {
            extent_bytes: 16,
            service_id: ServiceId::new(SERVICE).unwrap(),
        })
        .unwrap();
    let mut response_tx = server_transport
        .make_response_tx_session(ResponseTxParams {
            service_id: ServiceId::new(SERVICE).unwrap(),
        })
        .unwrap();

    let mut promise = client
        .request(ts(0), ts(1_000_000), &[b"ping"])
        .unwrap();
    assert_eq!(promise.get_request_time(), ts(0));

    client_transport.run(ts(1));
    forward(&client_state, &server_state, ts(2));
    server_transport.run(ts(3));

    let request = request_rx.receive().expect("request delivered");
    assert_eq!(request.remote_node_id, node(CLIENT_NODE));
    assert_eq!(request.payload, b"ping".to_vec());

    response_tx
        .send(
            &ServiceTxMetadata {
                base: TransferTxMetadata {
                    transfer_id: request.metadata.transfer_id,
                    priority: request.metadata.priority,
                    deadline: Instant::MAX,
                },
                remote_node_id: request.remote_node_id,
            },
            &[b"pong"],
        )
        .unwrap();
    server_transport.run(ts(4));
    forward(&server_state, &client_state, ts(5));
    client_transport.run(ts(6));
    client.run(ts(6));

    // Peek first, then consume; afterwards the result is gone for good.
    assert!(promise.get_result().is_some());
    let result = promise.fetch_result().expect("fulfilled");
    let success = result.expect("success");
    assert_eq!(success.response, b"pong".to_vec());
    assert_eq!(success.remote_node_id, node(SERVER_NODE));
    assert!(promise.fetch_result().is_none());
    assert!(promise.get_result().is_none());
}

#[test]
fn test_promise_expiration_fires_callback_once() {
    let (mut client_transport, _client_state) = transport(CLIENT_NODE);
    let mut client = RawClient::new(
        &mut client_transport,
        ServiceId::new(SERVICE).unwrap(),
        node(SERVER_NODE),
        16,
        Priority::Nominal,
    )
    .unwrap();

    let deadline = ts(100_000);
    let mut promise = client.request(ts(0), deadline, &[b"ping"]).unwrap();

    let fired = Rc::new(Cell::new(0u32));
    let observer = fired.clone();
    promise.set_callback(move |arg| {
        observer.set(observer.get() + 1);
        match arg.result {
            Err(RawPromiseFailure::Expired(expired)) => {
                assert_eq!(expired.deadline, ts(100_000));
            }
            Ok(_) => panic!("no response was sent"),
        }
    });

    client.run(ts(99_999));
    assert_eq!(fired.get(), 0);

    client.run(ts(100_001));
    assert_eq!(fired.get(), 1);

    // Settled promises never fire again.
    client.run(ts(200_000));
    assert_eq!(fired.get(), 1);
    assert!(promise.fetch_result().is_none());
}

#[test]
fn test_callback_on_latched_result_fires_synchronously() {
    let (mut client_transport, client_state) = transport(CLIENT_NODE);
    let (mut server_transport, server_state) = transport(SERVER_NODE);

    let mut client = RawClient::new(
        &mut client_transport,
        ServiceId::new(SERVICE).unwrap(),
        node(SERVER_NODE),
        16,
        Priority::Nominal,
    )
    .unwrap();
    let mut request_rx = server_transport
        .make_request_rx_session(RequestRxParams {
            extent_bytes: 16,
            service_id: ServiceId::new(SERVICE).unwrap(),
        })
        .unwrap();
    let mut response_tx = server_transport
        .make_response_tx_session(ResponseTxParams {
            service_id: ServiceId::new(SERVICE).unwrap(),
        })
        .unwrap();

    let mut promise = client.request(ts(0), ts(1_000_000), &[b"ping"]).unwrap();
    client_transport.run(ts(1));
    forward(&client_state, &server_state, ts(2));
    server_transport.run(ts(3));
    let request = request_rx.receive().unwrap();
    response_tx
        .send(
            &ServiceTxMetadata {
                base: TransferTxMetadata {
                    transfer_id: request.metadata.transfer_id,
                    priority: request.metadata.priority,
                    deadline: Instant::MAX,
                },
                remote_node_id: request.remote_node_id,
            },
            &[b"pong"],
        )
        .unwrap();
    server_transport.run(ts(4));
    forward(&server_state, &client_state, ts(5));
    client_transport.run(ts(6));

    // The result is latched inside the promise now.
    let fired = Rc::new(Cell::new(0u32));
    let observer = fired.clone();
    promise.set_callback(move |arg| {
        assert!(arg.result.is_ok());
        observer.set(observer.get() + 1);
    });
    assert_eq!(fired.get(), 1);

    // The synchronous delivery consumed the stored result.
    assert!(promise.get_result().is_none());
    assert!(promise.fetch_result().is_none());
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Word([u8; 4]);

impl Serialize for Word {
    fn size_bytes(&self) -> usize {
        4
    }

    fn serialize_to_bytes(&self, buffer: &mut [u8]) {
        buffer[..4].copy_from_slice(&self.0);
    }
}

impl Deserialize for Word {
    fn deserialize_from_bytes(buffer: &[u8]) -> Result<Self, DeserializeError> {
        let bytes = buffer.get(..4).ok_or(DeserializeError::Truncated)?;
        Ok(Word(bytes.try_into().unwrap()))
    }
}

#[test]
fn test_typed_client_decodes_response() {
    let (mut client_transport, client_state) = transport(CLIENT_NODE);
    let (mut server_transport, server_state) = transport(SERVER_NODE);

    let mut client: Client<Word, Word> = Client::new(
        &mut client_transport,
        ServiceId::new(SERVICE).unwrap(),
        node(SERVER_NODE),
        16,
        Priority::Nominal,
    )
    .unwrap();
    let mut request_rx = server_transport
        .make_request_rx_session(RequestRxParams {
            extent_bytes: 16,
            service_id: ServiceId::new(SERVICE).unwrap(),
        })
        .unwrap();
    let mut response_tx = server_transport
        .make_response_tx_session(ResponseTxParams {
            service_id: ServiceId::new(SERVICE).unwrap(),
        })
        .unwrap();

    let mut respond = |client_transport: &mut CanTransport,
                       server_transport: &mut CanTransport,
                       response: &[u8]| {
        client_transport.run(ts(1));
        forward(&client_state, &server_state, ts(2));
        server_transport.run(ts(3));
        let request = request_rx.receive().expect("request delivered");
        assert_eq!(request.payload, b"ping".to_vec());
        response_tx
            .send(
                &ServiceTxMetadata {
                    base: TransferTxMetadata {
                        transfer_id: request.metadata.transfer_id,
                        priority: request.metadata.priority,
                        deadline: Instant::MAX,
                    },
                    remote_node_id: request.remote_node_id,
                },
                &[response],
            )
            .unwrap();
        server_transport.run(ts(4));
        forward(&server_state, &client_state, ts(5));
        client_transport.run(ts(6));
    };

    // A well-formed response deserializes into the typed payload.
    let mut promise = client
        .request(ts(0), ts(1_000_000), &Word(*b"ping"))
        .unwrap();
    respond(&mut client_transport, &mut server_transport, b"pong");
    let success = promise.fetch_result().unwrap().expect("decoded");
    assert_eq!(success.response, Word(*b"pong"));

    // A truncated response settles the promise with a decode failure.
    let mut promise = client
        .request(ts(0), ts(1_000_000), &Word(*b"ping"))
        .unwrap();
    respond(&mut client_transport, &mut server_transport, b"po");
    match promise.fetch_result().unwrap() {
        Err(PromiseFailure::Decode(DeserializeError::Truncated)) => {}
        other => panic!("expected decode failure, got {:?}", other.map(|s| s.response)),
    }
}

#[test]
fn test_filter_reconciliation_follows_anonymity() {
    let (media, state) = MockCanMedia::new(Mtu::Classic);
    let mut transport = CanTransport::new(vec![Box::new(media)], 16, None).unwrap();

    let _subscriber = transport
        .make_message_rx_session(MessageRxParams {
            extent_bytes: 8,
            subject_id: SubjectId::new(7).unwrap(),
        })
        .unwrap();
    let _server = transport
        .make_request_rx_session(RequestRxParams {
            extent_bytes: 8,
            service_id: ServiceId::new(SERVICE).unwrap(),
        })
        .unwrap();

    // Anonymous: only the message subscription is filterable.
    transport.run(ts(1));
    {
        let state = state.borrow();
        let filters = state.filters.as_ref().expect("filters applied");
        assert_eq!(filters.len(), 1);
        assert_eq!(filters[0].id, 7 << 8);
    }

    // Becoming non-anonymous makes the service port filterable too.
    transport.set_local_node_id(node(SERVER_NODE)).unwrap();
    transport.run(ts(2));
    {
        let state = state.borrow();
        let filters = state.filters.as_ref().unwrap();
        assert_eq!(filters.len(), 2);
        assert_eq!(
            filters[1].id,
            (1 << 25) | ((SERVICE as u32) << 14) | ((SERVER_NODE as u32) << 7)
        );
    }
}

#[test]
fn test_request_requires_node_id() {
    let (mut transport, _state) = {
        let (media, state) = MockCanMedia::new(Mtu::Classic);
        (
            CanTransport::new(vec![Box::new(media)], 16, None).unwrap(),
            state,
        )
    };

    let mut client = RawClient::new(
        &mut transport,
        ServiceId::new(SERVICE).unwrap(),
        node(SERVER_NODE),
        16,
        Priority::Nominal,
    )
    .unwrap();

    // Anonymous nodes cannot complete service transfers.
    assert!(client.request(ts(0), ts(100), &[b"x"]).is_err());
}
