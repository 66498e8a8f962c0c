//! Redundant-media transmission and receiver-side deduplication.

mod common;

use common::{ts, MockCanMedia};

use recyphal::core::{NodeId, Priority, SubjectId, TransferId};
use recyphal::media::frame::Mtu;
use recyphal::media::time::Instant;
use recyphal::transport::can::CanTransport;
use recyphal::transport::{
    MessageRxParams, MessageRxSession, MessageTxParams, MessageTxSession, TransferTxMetadata,
    Transport,
};

const SUBJECT: u16 = 0x155;
const NEVER: Instant = Instant::MAX;

#[test]
fn test_redundant_transmit_with_one_busy_media() {
    let (media_a, state_a) = MockCanMedia::new(Mtu::Classic);
    let (media_b, state_b) = MockCanMedia::new(Mtu::Classic);
    let mut sender = CanTransport::new(
        vec![Box::new(media_a), Box::new(media_b)],
        16,
        Some(NodeId::new(0x10).unwrap()),
    )
    .unwrap();

    // First media reports Busy on the first push attempt.
    state_a.borrow_mut().busy_pushes = 1;

    let mut publisher = sender
        .make_message_tx_session(MessageTxParams {
            subject_id: SubjectId::new(SUBJECT).unwrap(),
        })
        .unwrap();
    publisher
        .send(
            &TransferTxMetadata {
                transfer_id: TransferId::new(4),
                priority: Priority::Nominal,
                deadline: NEVER,
            },
            &[b"01234567"],
        )
        .unwrap();

    sender.run(ts(10));
    // Media B took both frames immediately, media A stalled on the first.
    assert_eq!(state_b.borrow().pushed.len(), 2);
    assert_eq!(state_a.borrow().pushed.len(), 0);

    sender.run(ts(20));
    assert_eq!(state_a.borrow().pushed.len(), 2);

    // Both copies reach a receiver with two media; it must deliver the
    // transfer exactly once.
    let (rx_media_a, rx_state_a) = MockCanMedia::new(Mtu::Classic);
    let (rx_media_b, rx_state_b) = MockCanMedia::new(Mtu::Classic);
    let mut receiver = CanTransport::new(
        vec![Box::new(rx_media_a), Box::new(rx_media_b)],
        16,
        Some(NodeId::new(0x20).unwrap()),
    )
    .unwrap();
    let mut subscriber = receiver
        .make_message_rx_session(MessageRxParams {
            extent_bytes: 16,
            subject_id: SubjectId::new(SUBJECT).unwrap(),
        })
        .unwrap();

    for (_, id, data) in state_a.borrow().pushed.iter() {
        rx_state_a.borrow_mut().inject(*id, ts(30), data);
    }
    for (_, id, data) in state_b.borrow().pushed.iter() {
        rx_state_b.borrow_mut().inject(*id, ts(30), data);
    }

    let mut delivered = Vec::new();
    for tick in 0..8 {
        receiver.run(ts(40 + tick));
        if let Some(transfer) = subscriber.receive() {
            delivered.push(transfer);
        }
    }

    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].payload, b"01234567".to_vec());
}

#[test]
fn test_media_error_does_not_fail_other_paths() {
    let (media_a, state_a) = MockCanMedia::new(Mtu::Classic);
    let (media_b, state_b) = MockCanMedia::new(Mtu::Classic);
    let mut sender = CanTransport::new(
        vec![Box::new(media_a), Box::new(media_b)],
        16,
        Some(NodeId::new(0x10).unwrap()),
    )
    .unwrap();

    state_a.borrow_mut().failing_pushes = 1;

    let mut publisher = sender
        .make_message_tx_session(MessageTxParams {
            subject_id: SubjectId::new(SUBJECT).unwrap(),
        })
        .unwrap();
    publisher
        .send(
            &TransferTxMetadata {
                transfer_id: TransferId::new(0),
                priority: Priority::Nominal,
                deadline: NEVER,
            },
            &[&[0xaa]],
        )
        .unwrap();

    sender.run(ts(10));
    // The failing frame was dropped and counted; the healthy path sent.
    assert_eq!(state_a.borrow().pushed.len(), 0);
    assert_eq!(state_b.borrow().pushed.len(), 1);
    assert_eq!(sender.statistics().tx_media_errors, 1);
}

#[test]
fn test_expired_frames_never_reach_media() {
    let (media, state) = MockCanMedia::new(Mtu::Classic);
    let mut sender = CanTransport::new(
        vec![Box::new(media)],
        16,
        Some(NodeId::new(0x10).unwrap()),
    )
    .unwrap();

    let mut publisher = sender
        .make_message_tx_session(MessageTxParams {
            subject_id: SubjectId::new(SUBJECT).unwrap(),
        })
        .unwrap();
    publisher
        .send(
            &TransferTxMetadata {
                transfer_id: TransferId::new(0),
                priority: Priority::Nominal,
                deadline: ts(100),
            },
            &[&[0xaa]],
        )
        .unwrap();

    sender.run(ts(100));
    assert!(state.borrow().pushed.is_empty());
    assert_eq!(sender.statistics().tx_frames_expired, 1);
}
