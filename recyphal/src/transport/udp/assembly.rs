//! Cyphal/UDP transfer reassembly with out-of-order fragment tolerance
//!
//! Reassembly slots are keyed by `(source node, transfer id)`, so fragments
//! of different transfers may interleave freely (including across redundant
//! media). A slot buffers fragments up to the subscription's byte budget;
//! exceeding the budget, a fragment index beyond the declared end, or a
//! conflicting end-of-transfer index discards the slot. Completion requires
//! every index `0..=eot` present and, for multi-frame transfers, a matching
//! trailing CRC-32C.
//!
//! A completed `(source, transfer id)` pair is remembered for the
//! transfer-id timeout and replicas are dropped, which also deduplicates
//! redundant media.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use recyphal_media::time::{Duration, Instant};

use crate::core::{Priority, TransferId};
use crate::transport::udp::format::{crc32c_of, TransferCrc32};

#[derive(Debug, PartialEq, Eq)]
pub(crate) struct CompletedUdpTransfer {
    pub transfer_id: TransferId,
    pub priority: Priority,
    /// Reception time of the first fragment that arrived.
    pub timestamp: Instant,
    pub payload: Vec<u8>,
}

struct Slot {
    started_at: Instant,
    priority: Priority,
    fragments: BTreeMap<u32, Vec<u8>>,
    eot_index: Option<u32>,
    buffered: usize,
}

pub(crate) struct FragmentAssembler {
    extent: usize,
    /// Maximum bytes buffered per reassembly slot; transfers that cannot
    /// fit are dropped rather than partially delivered.
    budget: usize,
    slots: BTreeMap<(u16, u64), Slot>,
    completed: BTreeMap<u16, (u64, Instant)>,
}

impl FragmentAssembler {
    pub fn new(extent: usize) -> Self {
        Self {
            extent,
            budget: extent + TransferCrc32::LENGTH,
            slots: BTreeMap::new(),
            completed: BTreeMap::new(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn push_fragment(
        &mut self,
        timeout: Duration,
        source: u16,
        transfer_id: TransferId,
        frame_index: u32,
        end_of_transfer: bool,
        priority: Priority,
        fragment: &[u8],
        timestamp: Instant,
    ) -> Option<CompletedUdpTransfer> {
        let tid = transfer_id.into_u64();

        if let Some(&(done, at)) = self.completed.get(&source) {
            if done == tid {
                if timestamp <= at.saturating_add(timeout) {
                    return None;
                }
                self.completed.remove(&source);
            }
        }

        let key = (source, tid);
        let slot = self.slots.entry(key).or_insert_with(|| Slot {
            started_at: timestamp,
            priority,
            fragments: BTreeMap::new(),
            eot_index: None,
            buffered: 0,
        });

        // A fragment past the timeout restarts the slot rather than
        // extending a stale one.
        if timestamp > slot.started_at.saturating_add(timeout) {
            slot.started_at = timestamp;
            slot.priority = priority;
            slot.fragments.clear();
            slot.eot_index = None;
            slot.buffered = 0;
        }

        if end_of_transfer {
            let highest_known = slot.fragments.keys().next_back().copied();
            let conflict = slot.eot_index.is_some_and(|known| known != frame_index)
                || highest_known.is_some_and(|highest| highest > frame_index);
            if conflict {
                self.slots.remove(&key);
                return None;
            }
            slot.eot_index = Some(frame_index);
        } else if slot.eot_index.is_some_and(|eot| frame_index >= eot) {
            self.slots.remove(&key);
            return None;
        }

        if slot.fragments.contains_key(&frame_index) {
            return None;
        }
        if slot.buffered + fragment.len() > self.budget {
            self.slots.remove(&key);
            return None;
        }

        let mut stored = Vec::new();
        if stored.try_reserve_exact(fragment.len()).is_err() {
            self.slots.remove(&key);
            return None;
        }
        stored.extend_from_slice(fragment);
        slot.buffered += fragment.len();
        slot.fragments.insert(frame_index, stored);

        let complete = slot
            .eot_index
            .is_some_and(|eot| slot.fragments.len() == eot as usize + 1);
        if !complete {
            return None;
        }

        let slot = unwrap!(self.slots.remove(&key));
        let multi_frame = unwrap!(slot.eot_index) > 0;

        let mut data = Vec::new();
        if data.try_reserve_exact(slot.buffered).is_err() {
            return None;
        }
        for fragment in slot.fragments.values() {
            data.extend_from_slice(fragment);
        }

        if multi_frame {
            if data.len() < TransferCrc32::LENGTH {
                return None;
            }
            let payload_len = data.len() - TransferCrc32::LENGTH;
            let stored_crc = u32::from_le_bytes(unwrap!(data[payload_len..].try_into()));
            if crc32c_of(&data[..payload_len]) != stored_crc {
                return None;
            }
            data.truncate(payload_len);
        }

        data.truncate(core::cmp::min(data.len(), self.extent));
        self.completed.insert(source, (tid, timestamp));
        Some(CompletedUdpTransfer {
            transfer_id,
            priority: slot.priority,
            timestamp: slot.started_at,
            payload: data,
        })
    }

    /// Evicts reassembly slots and duplicate-window entries older than the
    /// transfer-id timeout.
    pub fn expire(&mut self, now: Instant, timeout: Duration) {
        self.slots
            .retain(|_, slot| now <= slot.started_at.saturating_add(timeout));
        self.completed
            .retain(|_, (_, at)| now <= at.saturating_add(timeout));
    }
}
