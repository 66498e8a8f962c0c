//! Transfer reassembly: tail-byte-terminated frames back into one payload
//!
//! One assembler instance tracks one `(subscription, source node)` pair.
//! The state machine is two-state:
//!
//! * `Idle` — no transfer in progress. Only a start-of-transfer frame with
//!   the correct toggle leaves this state (or completes immediately when it
//!   is also end-of-transfer).
//! * `Accepting` — frames must carry the same transfer-id, the alternated
//!   toggle, and arrive within the transfer-id timeout of the first frame.
//!
//! Violations are absorbed, never propagated: a frame with the *previous*
//! toggle value is a link-level duplicate and is ignored without touching
//! the accumulated state; a frame with a foreign transfer-id or outside the
//! timeout window discards the accumulated bytes and returns to `Idle`.
//! With redundant media the assembler locks onto the interface that
//! delivered the first frame of the current transfer; the completed-id
//! window then swallows replicas arriving on the other interfaces.
//!
//! Payload bytes beyond the subscription extent are dropped but stay part
//! of the CRC computation (implicit truncation rule).

use alloc::vec::Vec;

use recyphal_media::time::{Duration, Instant};

use crate::core::Priority;
use crate::transport::can::format::{TailByte, TransferCrc, SOT_TOGGLE_BIT};

/// A fully reassembled transfer, before source/port attribution.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct CompletedTransfer {
    pub transfer_id5: u8,
    pub priority: Priority,
    /// Reception time of the first frame.
    pub timestamp: Instant,
    pub payload: Vec<u8>,
}

enum State {
    Idle,
    Accepting {
        transfer_id5: u8,
        media_index: u8,
        expected_toggle: bool,
        started_at: Instant,
        payload: Vec<u8>,
        total_len: usize,
        crc: TransferCrc,
    },
}

pub(crate) struct TransferAssembler {
    extent: usize,
    state: State,
    /// Completed transfer-id and its completion time; replicas of this id
    /// are dropped until the transfer-id timeout elapses.
    last_completed: Option<(u8, Instant)>,
}

impl TransferAssembler {
    pub fn new(extent: usize) -> Self {
        Self {
            extent,
            state: State::Idle,
            last_completed: None,
        }
    }

    /// Capacity needed to keep `extent` payload bytes plus a possibly
    /// buffered transfer CRC.
    fn storage_cap(&self) -> usize {
        self.extent + TransferCrc::LENGTH
    }

    pub fn push_frame(
        &mut self,
        timeout: Duration,
        media_index: u8,
        priority: Priority,
        data: &[u8],
        timestamp: Instant,
    ) -> Option<CompletedTransfer> {
        // A frame without a tail byte carries no transfer-id; skip it.
        let (tail_byte, body) = data.split_last()?;
        let tail = TailByte::from(*tail_byte);

        if self.is_duplicate(tail.transfer_id5(), timestamp, timeout) {
            return None;
        }

        if tail.sot() {
            if let State::Accepting {
                transfer_id5,
                media_index: locked,
                ..
            } = self.state
            {
                if tail.toggle() != SOT_TOGGLE_BIT {
                    // Malformed start frame; cancels its own transfer only.
                    if transfer_id5 == tail.transfer_id5() {
                        self.reset();
                    }
                    return None;
                }
                if transfer_id5 == tail.transfer_id5() && locked != media_index {
                    // Replica of the in-progress transfer starting on
                    // another interface.
                    return None;
                }
            }
            if tail.toggle() != SOT_TOGGLE_BIT {
                return None;
            }
            if tail.eot() {
                return self.complete_single(tail.transfer_id5(), priority, body, timestamp);
            }
            self.start_accepting(tail.transfer_id5(), media_index, body, timestamp);
            return None;
        }

        self.continue_accepting(tail, media_index, priority, body, timestamp, timeout)
    }

    /// Discards an unfinished reassembly whose first frame is older than
    /// the transfer-id timeout. Returns `true` if state was dropped.
    pub fn expire(&mut self, now: Instant, timeout: Duration) -> bool {
        if let State::Accepting { started_at, .. } = self.state {
            if now > started_at.saturating_add(timeout) {
                self.reset();
                return true;
            }
        }
        false
    }

    /// `true` when the assembler holds no state worth keeping.
    pub fn is_idle(&self) -> bool {
        matches!(self.state, State::Idle) && self.last_completed.is_none()
    }

    fn is_duplicate(&mut self, transfer_id5: u8, timestamp: Instant, timeout: Duration) -> bool {
        match self.last_completed {
            Some((completed, at)) if completed == transfer_id5 => {
                if timestamp <= at.saturating_add(timeout) {
                    true
                } else {
                    self.last_completed = None;
                    false
                }
            }
            _ => false,
        }
    }

    fn complete_single(
        &mut self,
        transfer_id5: u8,
        priority: Priority,
        body: &[u8],
        timestamp: Instant,
    ) -> Option<CompletedTransfer> {
        self.reset();

        let length = core::cmp::min(body.len(), self.extent);
        let mut payload = Vec::new();
        if payload.try_reserve_exact(length).is_err() {
            return None;
        }
        payload.extend_from_slice(&body[..length]);

        self.last_completed = Some((transfer_id5, timestamp));
        Some(CompletedTransfer {
            transfer_id5,
            priority,
            timestamp,
            payload,
        })
    }

    fn start_accepting(
        &mut self,
        transfer_id5: u8,
        media_index: u8,
        body: &[u8],
        timestamp: Instant,
    ) {
        self.reset();

        let mut payload = Vec::new();
        if payload.try_reserve_exact(self.storage_cap()).is_err() {
            return;
        }

        let mut crc = TransferCrc::default();
        crc.add_bytes(body);
        let store = core::cmp::min(body.len(), self.storage_cap());
        payload.extend_from_slice(&body[..store]);

        self.state = State::Accepting {
            transfer_id5,
            media_index,
            expected_toggle: !SOT_TOGGLE_BIT,
            started_at: timestamp,
            payload,
            total_len: body.len(),
            crc,
        };
    }

    fn continue_accepting(
        &mut self,
        tail: TailByte,
        frame_media: u8,
        priority: Priority,
        body: &[u8],
        timestamp: Instant,
        timeout: Duration,
    ) -> Option<CompletedTransfer> {
        let State::Accepting {
            transfer_id5,
            media_index,
            mut expected_toggle,
            started_at,
            mut payload,
            mut total_len,
            mut crc,
        } = core::mem::replace(&mut self.state, State::Idle)
        else {
            return None;
        };

        let keep = |state: &mut State,
                    expected_toggle: bool,
                    payload: Vec<u8>,
                    total_len: usize,
                    crc: TransferCrc| {
            *state = State::Accepting {
                transfer_id5,
                media_index,
                expected_toggle,
                started_at,
                payload,
                total_len,
                crc,
            };
        };

        if frame_media != media_index {
            // Locked onto the interface that started this transfer.
            keep(&mut self.state, expected_toggle, payload, total_len, crc);
            return None;
        }
        if tail.transfer_id5() != transfer_id5 || timestamp > started_at.saturating_add(timeout) {
            return None;
        }
        if tail.toggle() != expected_toggle {
            // Previous toggle value: a retransmitted duplicate frame.
            keep(&mut self.state, expected_toggle, payload, total_len, crc);
            return None;
        }
        if body.is_empty() {
            return None;
        }

        crc.add_bytes(body);
        let store = core::cmp::min(body.len(), self.storage_cap().saturating_sub(payload.len()));
        payload.extend_from_slice(&body[..store]);
        total_len += body.len();
        expected_toggle = !expected_toggle;

        if !tail.eot() {
            keep(&mut self.state, expected_toggle, payload, total_len, crc);
            return None;
        }

        if total_len < TransferCrc::LENGTH || crc.get() != 0 {
            return None;
        }

        let logical_len = total_len - TransferCrc::LENGTH;
        payload.truncate(core::cmp::min(logical_len, self.extent));
        self.last_completed = Some((transfer_id5, timestamp));
        Some(CompletedTransfer {
            transfer_id5,
            priority,
            timestamp: started_at,
            payload,
        })
    }

    fn reset(&mut self) {
        self.state = State::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    const TIMEOUT: Duration = Duration::from_secs(2);
    const PRIORITY: Priority = Priority::Nominal;
    const MEDIA: u8 = 0;

    fn ts(us: u64) -> Instant {
        Instant::from_micros(us)
    }

    fn push(
        assembler: &mut TransferAssembler,
        data: &[u8],
        at: u64,
    ) -> Option<CompletedTransfer> {
        assembler.push_frame(TIMEOUT, MEDIA, PRIORITY, data, ts(at))
    }

    #[test]
    fn test_single_frame_transfer() {
        let mut assembler = TransferAssembler::new(8);
        let transfer = push(&mut assembler, &[0x48, 0x69, 0b1111_0011], 10).unwrap();
        assert_eq!(transfer.transfer_id5, 0x13);
        assert_eq!(transfer.timestamp, ts(10));
        assert_eq!(transfer.payload, vec![0x48, 0x69]);
    }

    #[test]
    fn test_empty_frame_ignored() {
        let mut assembler = TransferAssembler::new(8);
        assert!(push(&mut assembler, &[], 10).is_none());
    }

    #[test]
    fn test_two_frame_round_trip() {
        let mut assembler = TransferAssembler::new(16);
        let first = [0x30, 0x31, 0x32, 0x33, 0x34, 0x35, 0x36, 0b1010_0000 + 27];
        let second = [0x37, 0xf1, 0x34, 0b0100_0000 + 27];
        assert!(push(&mut assembler, &first, 10).is_none());
        let transfer = push(&mut assembler, &second, 20).unwrap();
        assert_eq!(transfer.payload, b"01234567".to_vec());
        assert_eq!(transfer.timestamp, ts(10));
        assert_eq!(transfer.transfer_id5, 27);
    }

    #[test]
    fn test_bad_crc_discarded() {
        let mut assembler = TransferAssembler::new(16);
        let first = [0x30, 0x31, 0x32, 0x33, 0x34, 0x35, 0x36, 0b1010_0000 + 27];
        let second = [0x37, 0xf1, 0x35, 0b0100_0000 + 27];
        assert!(push(&mut assembler, &first, 10).is_none());
        assert!(push(&mut assembler, &second, 20).is_none());
    }

    #[test]
    fn test_duplicate_transfer_dropped() {
        let mut assembler = TransferAssembler::new(8);
        let frame = [0x48, 0x69, 0b1110_0000 + 5];
        assert!(push(&mut assembler, &frame, 10).is_some());
        assert!(push(&mut assembler, &frame, 20).is_none());
        // Past the timeout window the same id is a fresh transfer.
        assert!(push(&mut assembler, &frame, 2_000_020).is_some());
    }

    #[test]
    fn test_duplicate_mid_frame_ignored() {
        let mut assembler = TransferAssembler::new(16);
        let first = [0x30, 0x31, 0x32, 0x33, 0x34, 0x35, 0x36, 0b1010_0000 + 27];
        let second = [0x37, 0xf1, 0x34, 0b0100_0000 + 27];
        assert!(push(&mut assembler, &first, 10).is_none());
        // Retransmission of the first frame (previous toggle): ignored.
        assert!(push(&mut assembler, &first, 11).is_none());
        assert!(push(&mut assembler, &second, 20).is_some());
    }

    #[test]
    fn test_interrupting_transfer_resets() {
        let mut assembler = TransferAssembler::new(16);
        let first = [0x30, 0x31, 0x32, 0x33, 0x34, 0x35, 0x36, 0b1010_0000 + 27];
        let second = [0x37, 0xf1, 0x34, 0b0100_0000 + 27];
        let foreign = [0x00, 0b0000_0000 + 28];
        assert!(push(&mut assembler, &first, 10).is_none());
        assert!(push(&mut assembler, &foreign, 11).is_none());
        assert!(push(&mut assembler, &second, 12).is_none());
    }

    #[test]
    fn test_reassembly_timeout() {
        let mut assembler = TransferAssembler::new(16);
        let first = [0x30, 0x31, 0x32, 0x33, 0x34, 0x35, 0x36, 0b1010_0000 + 27];
        let second = [0x37, 0xf1, 0x34, 0b0100_0000 + 27];
        assert!(push(&mut assembler, &first, 10).is_none());
        assert!(push(&mut assembler, &second, 3_000_000).is_none());
    }

    #[test]
    fn test_expire_sweep() {
        let mut assembler = TransferAssembler::new(16);
        let first = [0x30, 0x31, 0x32, 0x33, 0x34, 0x35, 0x36, 0b1010_0000 + 27];
        assert!(push(&mut assembler, &first, 10).is_none());
        assert!(!assembler.expire(ts(1_000_000), TIMEOUT));
        assert!(assembler.expire(ts(3_000_000), TIMEOUT));
    }

    #[test]
    fn test_other_media_locked_out() {
        let mut assembler = TransferAssembler::new(16);
        let first = [0x30, 0x31, 0x32, 0x33, 0x34, 0x35, 0x36, 0b1010_0000 + 27];
        let second = [0x37, 0xf1, 0x34, 0b0100_0000 + 27];
        assert!(assembler
            .push_frame(TIMEOUT, 0, PRIORITY, &first, ts(10))
            .is_none());
        // The replica on media 1 must not disturb the transfer on media 0.
        assert!(assembler
            .push_frame(TIMEOUT, 1, PRIORITY, &first, ts(11))
            .is_none());
        assert!(assembler
            .push_frame(TIMEOUT, 1, PRIORITY, &second, ts(12))
            .is_none());
        assert!(assembler
            .push_frame(TIMEOUT, 0, PRIORITY, &second, ts(13))
            .is_some());
        // The copy completing later on media 1 is a duplicate.
        assert!(assembler
            .push_frame(TIMEOUT, 1, PRIORITY, &second, ts(14))
            .is_none());
    }

    #[test]
    fn test_extent_truncation_keeps_crc_valid() {
        let mut assembler = TransferAssembler::new(4);
        let first = [0x30, 0x31, 0x32, 0x33, 0x34, 0x35, 0x36, 0b1010_0000 + 27];
        let second = [0x37, 0xf1, 0x34, 0b0100_0000 + 27];
        assert!(push(&mut assembler, &first, 10).is_none());
        let transfer = push(&mut assembler, &second, 20).unwrap();
        assert_eq!(transfer.payload, b"0123".to_vec());
    }
}
