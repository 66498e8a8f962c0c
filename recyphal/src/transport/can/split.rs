//! Transfer disassembly: one payload into tail-byte-terminated frames
//!
//! A transfer that fits `MTU - 1` bytes travels as a single frame without a
//! transfer CRC. Anything larger is split into chunks of `MTU - 1` with the
//! CRC-16 of the payload appended big-endian behind the last payload byte;
//! the toggle bit starts at one and alternates per frame. CAN FD padding is
//! inserted in the final frame, before the CRC, and is covered by it.

use recyphal_media::frame::{Data, DataLength, Mtu};

use crate::core::TransferId;
use crate::transport::can::format::{
    TailByte, TransferCrc, PAD_VALUE, SOT_TOGGLE_BIT, TAIL_LENGTH,
};

pub(crate) struct FrameSplitter<'a> {
    payload: &'a [u8],
    transfer_id: TransferId,
    mtu: Mtu,
    crc: TransferCrc,
    /// Position in the virtual `payload ++ crc` stream (multi-frame only).
    offset: usize,
    toggle: bool,
    done: bool,
}

impl<'a> FrameSplitter<'a> {
    pub fn new(transfer_id: TransferId, payload: &'a [u8], mtu: Mtu) -> Self {
        let mut crc = TransferCrc::default();
        crc.add_bytes(payload);
        Self {
            payload,
            transfer_id,
            mtu,
            crc,
            offset: 0,
            toggle: SOT_TOGGLE_BIT,
            done: false,
        }
    }

    pub fn is_single_frame(payload_len: usize, mtu: Mtu) -> bool {
        payload_len <= mtu.as_usize() - TAIL_LENGTH
    }

    /// Number of frames the transfer will occupy on the wire.
    pub fn frame_count(payload_len: usize, mtu: Mtu) -> usize {
        let capacity = mtu.as_usize() - TAIL_LENGTH;
        if payload_len <= capacity {
            1
        } else {
            (payload_len + TransferCrc::LENGTH).div_ceil(capacity)
        }
    }

    fn stream_len(&self) -> usize {
        self.payload.len() + TransferCrc::LENGTH
    }

    /// Copies bytes from the `payload ++ crc` stream starting at `offset`.
    fn fill_from_stream(&mut self, area: &mut [u8]) {
        let crc_bytes = self.crc.get().to_be_bytes();
        for slot in area {
            *slot = if self.offset < self.payload.len() {
                self.payload[self.offset]
            } else {
                crc_bytes[self.offset - self.payload.len()]
            };
            self.offset += 1;
        }
    }

    fn single_frame(&mut self) -> Data {
        let length = unwrap!(DataLength::new_ceil(self.payload.len() + TAIL_LENGTH));
        let mut frame = Data::new_zeros(length);
        let (tail, area) = unwrap!(frame.split_last_mut());
        area[..self.payload.len()].copy_from_slice(self.payload);
        area[self.payload.len()..].fill(PAD_VALUE);
        *tail = TailByte::new(true, true, SOT_TOGGLE_BIT, self.transfer_id).into();
        self.done = true;
        frame
    }

    fn multi_frame(&mut self) -> Data {
        let capacity = self.mtu.as_usize() - TAIL_LENGTH;
        let residual = self.stream_len() - self.offset;
        let length = unwrap!(DataLength::new_ceil(
            core::cmp::min(residual, capacity) + TAIL_LENGTH
        ));
        let mut frame = Data::new_zeros(length);
        let (tail, area) = unwrap!(frame.split_last_mut());

        let sot = self.offset == 0;
        if residual >= area.len() {
            self.fill_from_stream(area);
        } else {
            // DLC rounding left room for padding; only possible while no
            // CRC byte has been emitted yet.
            debug_assert!(self.offset <= self.payload.len());
            let data = &self.payload[self.offset..];
            let (payload_area, crc_area) = area.split_at_mut(area.len() - TransferCrc::LENGTH);
            payload_area[..data.len()].copy_from_slice(data);
            payload_area[data.len()..].fill(PAD_VALUE);

            let mut crc = self.crc;
            crc.add_bytes(&payload_area[data.len()..]);
            crc_area.copy_from_slice(&crc.get().to_be_bytes());
            self.offset = self.stream_len();
        }

        let eot = self.offset == self.stream_len();
        self.done = eot;
        *tail = TailByte::new(sot, eot, self.toggle, self.transfer_id).into();
        self.toggle = !self.toggle;
        frame
    }
}

impl Iterator for FrameSplitter<'_> {
    type Item = Data;

    fn next(&mut self) -> Option<Data> {
        if self.done {
            return None;
        }
        if Self::is_single_frame(self.payload.len(), self.mtu) {
            Some(self.single_frame())
        } else {
            Some(self.multi_frame())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    fn frames(transfer_id: u64, payload: &[u8], mtu: Mtu) -> Vec<Data> {
        FrameSplitter::new(TransferId::new(transfer_id), payload, mtu).collect()
    }

    #[test]
    fn test_empty_payload() {
        let out = frames(27, &[], Mtu::Classic);
        assert_eq!(out, [Data::new(&[0b1110_0000 + 27]).unwrap()]);
    }

    #[test]
    fn test_single_frame() {
        let out = frames(0x13, &[0x48, 0x69], Mtu::Classic);
        assert_eq!(out, [Data::new(&[0x48, 0x69, 0b1111_0011]).unwrap()]);
    }

    #[test]
    fn test_full_single_frame() {
        let out = frames(27, &[0, 1, 2, 3, 4, 5, 6], Mtu::Classic);
        assert_eq!(
            out,
            [Data::new(&[0, 1, 2, 3, 4, 5, 6, 0b1110_0000 + 27]).unwrap()]
        );
    }

    #[test]
    fn test_two_frame_split() {
        // Eight bytes at classic MTU: seven in the first frame, the eighth
        // plus the big-endian payload CRC in the second.
        let payload: [u8; 8] = *b"01234567";
        let out = frames(27, &payload, Mtu::Classic);
        assert_eq!(
            out,
            [
                Data::new(&[0x30, 0x31, 0x32, 0x33, 0x34, 0x35, 0x36, 0b1010_0000 + 27]).unwrap(),
                Data::new(&[0x37, 0xf1, 0x34, 0b0100_0000 + 27]).unwrap(),
            ]
        );
    }

    #[test]
    fn test_crc_straddles_frames() {
        // 13 payload bytes: the second frame carries the final six bytes
        // plus the first CRC byte, the third frame the remaining CRC byte.
        let payload: Vec<u8> = (0u8..13).collect();
        let out = frames(27, &payload, Mtu::Classic);
        assert_eq!(
            out,
            [
                Data::new(&[0, 1, 2, 3, 4, 5, 6, 0b1010_0000 + 27]).unwrap(),
                Data::new(&[7, 8, 9, 10, 11, 12, 0xac, 0b0000_0000 + 27]).unwrap(),
                Data::new(&[0xdd, 0b0110_0000 + 27]).unwrap(),
            ]
        );
    }

    #[test]
    fn test_crc_only_final_frame() {
        let payload: Vec<u8> = (0u8..21).collect();
        let out = frames(27, &payload, Mtu::Classic);
        assert_eq!(out.len(), 4);
        assert_eq!(&*out[3], &[0xdd, 0x0a, 0b0100_0000 + 27]);
    }

    #[test]
    fn test_fd_single_frame_padding() {
        let payload: Vec<u8> = (0u8..9).collect();
        let out = frames(27, &payload, Mtu::Fd);
        // 9 payload + tail rounds up to DLC length 12 with zero padding.
        assert_eq!(
            &*out[0],
            &[0, 1, 2, 3, 4, 5, 6, 7, 8, 0, 0, 0b1110_0000 + 27]
        );
    }

    #[test]
    fn test_fd_multi_frame_padding_covered_by_crc() {
        let payload: Vec<u8> = (0u8..69).collect();
        let out = frames(27, &payload, Mtu::Fd);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].len(), 64);
        assert_eq!(out[0][63], 0b1010_0000 + 27);

        // Second frame: 6 payload bytes, 3 pad bytes, 2 CRC bytes, tail.
        let second = &*out[1];
        assert_eq!(second.len(), 12);
        assert_eq!(&second[..6], &[63, 64, 65, 66, 67, 68]);
        assert_eq!(&second[6..9], &[0, 0, 0]);

        let mut crc = TransferCrc::default();
        crc.add_bytes(&payload);
        crc.add_bytes(&[0, 0, 0]);
        assert_eq!(&second[9..11], &crc.get().to_be_bytes());
        assert_eq!(second[11], 0b0100_0000 + 27);
    }

    #[test]
    fn test_toggle_alternation_and_frame_count() {
        let payload: Vec<u8> = (0u8..40).collect();
        let out = frames(5, &payload, Mtu::Classic);
        assert_eq!(
            out.len(),
            FrameSplitter::frame_count(payload.len(), Mtu::Classic)
        );
        for (index, frame) in out.iter().enumerate() {
            let tail = TailByte::from(*frame.last().unwrap());
            assert_eq!(tail.sot(), index == 0);
            assert_eq!(tail.eot(), index == out.len() - 1);
            assert_eq!(tail.toggle(), index % 2 == 0);
            assert_eq!(tail.transfer_id5(), 5);
        }
    }
}
