//! Single-threaded cooperative executor
//!
//! The application owns the loop: it registers callbacks, schedules them
//! (one-shot or periodic) and calls [`Executor::spin_once`] at its own
//! cadence. Nothing here spawns threads or blocks, with the single
//! exception of [`Executor::poll_awaitable_resources_for`], which delegates
//! to an injected OS-specific [`WaitPolicy`].
//!
//! Ordering guarantee: callbacks due at the same time fire in registration
//! order. Expiration is evaluated lazily inside `spin_once`; there is no
//! background timer.

use alloc::boxed::Box;
use alloc::rc::Rc;
use alloc::vec::Vec;
use core::cell::RefCell;

use recyphal_media::time::{Duration, Instant, Monotonic};

use crate::transport::Error;

/// Argument of a scheduled callback invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallbackArg {
    /// The time `spin_once` started; an approximation of "now" that spares
    /// the callback a clock read.
    pub approx_now: Instant,
}

/// Outcome of one `spin_once` pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SpinResult {
    /// The worst observed difference between a callback's scheduled time
    /// and the moment it actually fired.
    pub worst_lateness: Duration,
    /// Earliest scheduled time still in the future, if any.
    pub next_exec_time: Option<Instant>,
}

/// Blocks the calling thread until I/O readiness or timeout.
///
/// Implemented by platform shims (e.g. a `poll(2)` wrapper); the executor
/// itself stays OS-agnostic.
pub trait WaitPolicy {
    fn wait(&mut self, timeout: Option<Duration>) -> Result<(), Error>;
}

#[derive(Debug, Clone, Copy)]
struct Schedule {
    next: Instant,
    period: Option<Duration>,
}

struct Slot {
    /// Registration sequence; breaks ties among equal scheduled times.
    seq: u64,
    function: Option<Box<dyn FnMut(CallbackArg)>>,
    schedule: Option<Schedule>,
}

#[derive(Default)]
struct Registry {
    slots: Vec<Option<Slot>>,
    next_seq: u64,
}

impl Registry {
    fn insert(&mut self, function: Box<dyn FnMut(CallbackArg)>) -> usize {
        let slot = Slot {
            seq: self.next_seq,
            function: Some(function),
            schedule: None,
        };
        self.next_seq += 1;

        match self.slots.iter_mut().enumerate().find(|(_, s)| s.is_none()) {
            Some((index, vacant)) => {
                *vacant = Some(slot);
                index
            }
            None => {
                self.slots.push(Some(slot));
                self.slots.len() - 1
            }
        }
    }

    /// The due slot with the smallest `(scheduled time, registration
    /// sequence)` pair.
    fn pick_due(&self, now: Instant) -> Option<usize> {
        let mut best: Option<(Instant, u64, usize)> = None;
        for (index, slot) in self.slots.iter().enumerate() {
            let Some(slot) = slot else { continue };
            let Some(schedule) = slot.schedule else { continue };
            if schedule.next > now {
                continue;
            }
            let key = (schedule.next, slot.seq, index);
            if best.is_none() || key < unwrap!(best) {
                best = Some(key);
            }
        }
        best.map(|(_, _, index)| index)
    }

    fn next_exec_time(&self) -> Option<Instant> {
        self.slots
            .iter()
            .flatten()
            .filter_map(|slot| slot.schedule.map(|schedule| schedule.next))
            .min()
    }
}

/// Handle of one registered callback.
///
/// Scheduling operations go through the handle; dropping it cancels and
/// unregisters the callback.
pub struct Callback {
    registry: Rc<RefCell<Registry>>,
    index: usize,
}

impl Callback {
    /// Schedules a single invocation at `at` (or immediately if `at` is in
    /// the past). Replaces any previous schedule.
    pub fn schedule_once(&self, at: Instant) {
        if let Some(slot) = &mut self.registry.borrow_mut().slots[self.index] {
            slot.schedule = Some(Schedule {
                next: at,
                period: None,
            });
        }
    }

    /// Schedules periodic invocations starting at `start`.
    pub fn schedule_repeat(&self, start: Instant, period: Duration) {
        if let Some(slot) = &mut self.registry.borrow_mut().slots[self.index] {
            slot.schedule = Some(Schedule {
                next: start,
                period: Some(period),
            });
        }
    }

    /// Removes any pending schedule; the callback stays registered.
    pub fn cancel(&self) {
        if let Some(slot) = &mut self.registry.borrow_mut().slots[self.index] {
            slot.schedule = None;
        }
    }
}

impl Drop for Callback {
    fn drop(&mut self) {
        self.registry.borrow_mut().slots[self.index] = None;
    }
}

/// The cooperative executor; generic over the injected clock.
pub struct Executor<C: Monotonic> {
    clock: C,
    registry: Rc<RefCell<Registry>>,
    wait_policy: Option<Box<dyn WaitPolicy>>,
}

impl<C: Monotonic> Executor<C> {
    pub fn new(clock: C) -> Self {
        Self {
            clock,
            registry: Rc::new(RefCell::new(Registry::default())),
            wait_policy: None,
        }
    }

    /// Installs the platform blocking-wait shim used by
    /// [`poll_awaitable_resources_for`](Self::poll_awaitable_resources_for).
    pub fn set_wait_policy(&mut self, policy: Box<dyn WaitPolicy>) {
        self.wait_policy = Some(policy);
    }

    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    /// Registers a callback; it fires only once scheduled via the handle.
    pub fn register_callback(&mut self, function: impl FnMut(CallbackArg) + 'static) -> Callback {
        let index = self.registry.borrow_mut().insert(Box::new(function));
        Callback {
            registry: self.registry.clone(),
            index,
        }
    }

    /// Fires every callback scheduled at or before the current time.
    ///
    /// Due callbacks fire in `(scheduled time, registration order)` order.
    /// The due set is fixed against the entry time, so a zero-period
    /// repeating callback cannot starve the loop.
    pub fn spin_once(&mut self) -> SpinResult {
        let now = self.clock.now();
        let mut worst_lateness = Duration::ZERO;

        loop {
            let picked = self.registry.borrow().pick_due(now);
            let Some(index) = picked else { break };

            // Update the schedule and take the function out first, so the
            // callback itself may use its handle (or register new ones).
            let (mut function, lateness) = {
                let mut registry = self.registry.borrow_mut();
                let Some(slot) = &mut registry.slots[index] else {
                    continue;
                };
                let Some(schedule) = &mut slot.schedule else {
                    continue;
                };
                let lateness = now.saturating_duration_since(schedule.next);
                match schedule.period {
                    Some(period) => {
                        // A zero period must still advance, or this spin
                        // would never drain the due set.
                        let step = core::cmp::max(period, Duration::from_micros(1));
                        schedule.next = schedule.next.saturating_add(step);
                    }
                    None => slot.schedule = None,
                }
                let Some(function) = slot.function.take() else {
                    continue;
                };
                (function, lateness)
            };

            worst_lateness = core::cmp::max(worst_lateness, lateness);
            function(CallbackArg { approx_now: now });

            // Put the function back unless the callback dropped its handle
            // meanwhile.
            if let Some(slot) = &mut self.registry.borrow_mut().slots[index] {
                slot.function = Some(function);
            }

            // A periodic schedule may still be due if the period is zero or
            // the callback ran long; `pick_due` is bounded by `now` taken
            // at entry, and `next` advanced past it terminates the loop.
        }

        SpinResult {
            worst_lateness,
            next_exec_time: self.registry.borrow().next_exec_time(),
        }
    }

    /// Blocks on I/O readiness for up to `timeout` (indefinitely when
    /// `None`), then returns. Fails with [`Error::NotImplemented`] unless a
    /// [`WaitPolicy`] was installed.
    pub fn poll_awaitable_resources_for(&mut self, timeout: Option<Duration>) -> Result<(), Error> {
        match &mut self.wait_policy {
            Some(policy) => policy.wait(timeout),
            None => Err(Error::NotImplemented),
        }
    }
}
