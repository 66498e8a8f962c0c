//! Mock media implementations shared by the integration suites.
#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;
use std::vec::Vec;

use recyphal::media::can::{CanMedia, CanRxMetadata, Filter, MediaError, PushOutcome};
use recyphal::media::frame::Mtu;
use recyphal::media::time::Instant;
use recyphal::media::udp::{
    UdpEndpoint, UdpMedia, UdpRxMetadata, UdpRxSocket, UdpTxSocket,
};
use recyphal::media::ExtendedId;

#[derive(Default)]
pub struct CanMockState {
    /// Frames handed to the interface: (deadline, raw id, data).
    pub pushed: Vec<(Instant, u32, Vec<u8>)>,
    /// Frames waiting to be popped: (raw id, timestamp, data).
    pub rx_queue: VecDeque<(u32, Instant, Vec<u8>)>,
    /// The last applied acceptance filter set.
    pub filters: Option<Vec<Filter>>,
    /// Number of upcoming pushes to answer with `Busy`.
    pub busy_pushes: usize,
    /// Number of upcoming pushes to answer with a media error.
    pub failing_pushes: usize,
}

impl CanMockState {
    pub fn inject(&mut self, id: u32, timestamp: Instant, data: &[u8]) {
        self.rx_queue.push_back((id, timestamp, data.to_vec()));
    }
}

pub struct MockCanMedia {
    mtu: Mtu,
    state: Rc<RefCell<CanMockState>>,
}

impl MockCanMedia {
    pub fn new(mtu: Mtu) -> (Self, Rc<RefCell<CanMockState>>) {
        let state = Rc::new(RefCell::new(CanMockState::default()));
        (
            Self {
                mtu,
                state: state.clone(),
            },
            state,
        )
    }
}

impl CanMedia for MockCanMedia {
    fn mtu(&self) -> Mtu {
        self.mtu
    }

    fn push(
        &mut self,
        deadline: Instant,
        id: ExtendedId,
        data: &[u8],
    ) -> Result<PushOutcome, MediaError> {
        let mut state = self.state.borrow_mut();
        if state.busy_pushes > 0 {
            state.busy_pushes -= 1;
            return Ok(PushOutcome::Busy);
        }
        if state.failing_pushes > 0 {
            state.failing_pushes -= 1;
            return Err(MediaError { code: -5 });
        }
        state.pushed.push((deadline, id.as_raw(), data.to_vec()));
        Ok(PushOutcome::Sent)
    }

    fn pop(&mut self, payload: &mut [u8]) -> Result<Option<CanRxMetadata>, MediaError> {
        let Some((id, timestamp, data)) = self.state.borrow_mut().rx_queue.pop_front() else {
            return Ok(None);
        };
        payload[..data.len()].copy_from_slice(&data);
        Ok(Some(CanRxMetadata {
            id: ExtendedId::new(id).unwrap(),
            timestamp,
            length: data.len(),
        }))
    }

    fn set_filters(&mut self, filters: &[Filter]) -> Result<(), MediaError> {
        self.state.borrow_mut().filters = Some(filters.to_vec());
        Ok(())
    }
}

#[derive(Default)]
pub struct UdpMockState {
    /// Datagrams handed to the TX socket: (endpoint, deadline, data).
    pub sent: Vec<(UdpEndpoint, Instant, Vec<u8>)>,
    /// Pending datagrams per multicast group address.
    pub rx_queues: BTreeMap<u32, VecDeque<(Instant, Vec<u8>)>>,
    /// Groups joined through `make_rx_socket`.
    pub joined: Vec<UdpEndpoint>,
    pub busy_sends: usize,
}

impl UdpMockState {
    pub fn inject(&mut self, endpoint: UdpEndpoint, timestamp: Instant, data: &[u8]) {
        self.rx_queues
            .entry(endpoint.address)
            .or_default()
            .push_back((timestamp, data.to_vec()));
    }
}

pub struct MockUdpMedia {
    mtu: usize,
    state: Rc<RefCell<UdpMockState>>,
}

impl MockUdpMedia {
    pub fn new(mtu: usize) -> (Self, Rc<RefCell<UdpMockState>>) {
        let state = Rc::new(RefCell::new(UdpMockState::default()));
        (
            Self {
                mtu,
                state: state.clone(),
            },
            state,
        )
    }
}

struct MockUdpTxSocket {
    state: Rc<RefCell<UdpMockState>>,
}

impl UdpTxSocket for MockUdpTxSocket {
    fn send(
        &mut self,
        deadline: Instant,
        endpoint: UdpEndpoint,
        payload: &[u8],
    ) -> Result<PushOutcome, MediaError> {
        let mut state = self.state.borrow_mut();
        if state.busy_sends > 0 {
            state.busy_sends -= 1;
            return Ok(PushOutcome::Busy);
        }
        state.sent.push((endpoint, deadline, payload.to_vec()));
        Ok(PushOutcome::Sent)
    }
}

struct MockUdpRxSocket {
    endpoint: UdpEndpoint,
    state: Rc<RefCell<UdpMockState>>,
}

impl UdpRxSocket for MockUdpRxSocket {
    fn receive(&mut self, payload: &mut [u8]) -> Result<Option<UdpRxMetadata>, MediaError> {
        let mut state = self.state.borrow_mut();
        let Some(queue) = state.rx_queues.get_mut(&self.endpoint.address) else {
            return Ok(None);
        };
        let Some((timestamp, data)) = queue.pop_front() else {
            return Ok(None);
        };
        let length = data.len().min(payload.len());
        payload[..length].copy_from_slice(&data[..length]);
        Ok(Some(UdpRxMetadata { timestamp, length }))
    }
}

impl UdpMedia for MockUdpMedia {
    fn mtu(&self) -> usize {
        self.mtu
    }

    fn make_tx_socket(&mut self) -> Result<Box<dyn UdpTxSocket>, MediaError> {
        Ok(Box::new(MockUdpTxSocket {
            state: self.state.clone(),
        }))
    }

    fn make_rx_socket(
        &mut self,
        endpoint: UdpEndpoint,
    ) -> Result<Box<dyn UdpRxSocket>, MediaError> {
        self.state.borrow_mut().joined.push(endpoint);
        Ok(Box::new(MockUdpRxSocket {
            endpoint,
            state: self.state.clone(),
        }))
    }
}

pub fn ts(us: u64) -> Instant {
    Instant::from_micros(us)
}
