//! Recyphal media driver interface
//!
//! The crate provides the interface between platform media drivers (CAN
//! peripherals, SocketCAN wrappers, UDP socket shims) and the Recyphal
//! stack. Limited scope facilitates compatibility across versions: driver
//! crates should depend on this crate, while stack users should depend on
//! the `recyphal` crate instead.
//!
//! The stack pulls and pushes data through the traits defined here from its
//! single-threaded `run` loop; implementations must therefore never block.
//! Time points cross the boundary as [`time::Instant`] values produced by
//! an injected [`time::Monotonic`] clock.
#![no_std]

extern crate alloc;

// This mod MUST go first, so that the others see its macros.
pub(crate) mod fmt;

pub mod can;
pub mod frame;
pub mod time;
pub mod udp;

pub use embedded_can::{ExtendedId, Id};
