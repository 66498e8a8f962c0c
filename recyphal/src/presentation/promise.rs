//! Response promises: request/response correlation with deadlines
//!
//! A promise is created by a client `request` call and settles exactly once:
//! either a matching response transfer arrives (`Fulfilled`) or the deadline
//! lapses (`Expired`). Delivery is by polling (`get_result`/`fetch_result`)
//! or by an at-most-once callback; the two are mutually exclusive, a
//! delivered result is cleared from internal storage.

use alloc::boxed::Box;
use alloc::rc::Rc;
use core::cell::{Ref, RefCell};

use recyphal_encoding::DeserializeError;
use recyphal_media::time::Instant;

use crate::core::NodeId;
use crate::transport::TransferMetadata;

/// Terminal state of a promise whose deadline lapsed without a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PromiseExpired {
    /// The deadline that lapsed.
    pub deadline: Instant,
}

/// Failure states of a strong-typed promise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PromiseFailure {
    Expired(PromiseExpired),
    /// The response payload did not deserialize into the expected type.
    Decode(DeserializeError),
}

/// Failure states of a raw promise; raw promises forward the byte buffer
/// and therefore cannot fail to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RawPromiseFailure {
    Expired(PromiseExpired),
}

/// A received response and its transfer metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromiseSuccess<P> {
    pub response: P,
    pub metadata: TransferMetadata,
    pub remote_node_id: NodeId,
}

pub type PromiseResult<P, F> = Result<PromiseSuccess<P>, F>;

/// Argument of a promise callback invocation.
pub struct PromiseCallbackArg<P, F> {
    pub result: PromiseResult<P, F>,
    /// Approximately "now" at delivery time.
    pub approx_now: Instant,
}

pub(crate) struct PromiseState<P, F> {
    pub request_time: Instant,
    pub deadline: Instant,
    /// A result was produced (possibly already consumed); the promise
    /// settles at most once.
    terminal: bool,
    result: Option<(PromiseResult<P, F>, Instant)>,
    callback: Option<Box<dyn FnMut(PromiseCallbackArg<P, F>)>>,
}

impl<P, F> PromiseState<P, F> {
    pub fn new(request_time: Instant, deadline: Instant) -> Self {
        Self {
            request_time,
            deadline,
            terminal: false,
            result: None,
            callback: None,
        }
    }
}

/// Settles the promise: fires the installed callback or latches the result.
/// A second settlement attempt is ignored.
pub(crate) fn accept_result<P, F>(
    state: &Rc<RefCell<PromiseState<P, F>>>,
    result: PromiseResult<P, F>,
    approx_now: Instant,
) {
    let fire = {
        let mut state = state.borrow_mut();
        if state.terminal {
            return;
        }
        state.terminal = true;
        match state.callback.take() {
            Some(callback) => Some((callback, result)),
            None => {
                state.result = Some((result, approx_now));
                None
            }
        }
    };
    // The callback runs with the state unborrowed so it may inspect the
    // promise or issue a new request.
    if let Some((mut callback, result)) = fire {
        callback(PromiseCallbackArg { result, approx_now });
    }
}

/// A pending, fulfilled or expired response.
///
/// Dropping the promise abandons the correlation; a response arriving later
/// is discarded by the client.
pub struct ResponsePromise<P, F> {
    state: Rc<RefCell<PromiseState<P, F>>>,
}

/// Promise of an untyped response carrying the raw payload bytes.
pub type RawResponsePromise = ResponsePromise<alloc::vec::Vec<u8>, RawPromiseFailure>;

impl<P, F> ResponsePromise<P, F> {
    pub(crate) fn new(state: Rc<RefCell<PromiseState<P, F>>>) -> Self {
        Self { state }
    }

    /// Non-consuming peek at the settled result, if still stored.
    pub fn get_result(&self) -> Option<Ref<'_, PromiseResult<P, F>>> {
        Ref::filter_map(self.state.borrow(), |state| {
            state.result.as_ref().map(|(result, _)| result)
        })
        .ok()
    }

    /// Consuming take: the first call after settlement returns the result,
    /// every later call returns `None`.
    pub fn fetch_result(&mut self) -> Option<PromiseResult<P, F>> {
        self.state
            .borrow_mut()
            .result
            .take()
            .map(|(result, _)| result)
    }

    /// Installs the at-most-once delivery callback.
    ///
    /// Fires synchronously if a result is already latched; has no effect if
    /// the result was already consumed.
    pub fn set_callback(&mut self, callback: impl FnMut(PromiseCallbackArg<P, F>) + 'static) {
        let mut callback = callback;
        let latched = self.state.borrow_mut().result.take();
        if let Some((result, approx_now)) = latched {
            callback(PromiseCallbackArg { result, approx_now });
            return;
        }
        let mut state = self.state.borrow_mut();
        if !state.terminal {
            state.callback = Some(Box::new(callback));
        }
    }

    /// Moves the expiration deadline; `Instant::MAX` disables it, a past
    /// value expires the promise on the next client run. No effect once
    /// settled.
    pub fn set_deadline(&mut self, deadline: Instant) {
        let mut state = self.state.borrow_mut();
        if !state.terminal {
            state.deadline = deadline;
        }
    }

    /// The time the originating `request` call was made.
    pub fn get_request_time(&self) -> Instant {
        self.state.borrow().request_time
    }
}
