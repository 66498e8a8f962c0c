//! # Recyphal
//!
//! A Cyphal transport runtime for embedded and mixed-criticality systems
//! communicating over CAN (2.0 / FD) and UDP/IP multicast. The library
//! issues and receives ordered, prioritized, deduplicated transfers that
//! may exceed a single link frame, across one or more redundant media,
//! with deterministic memory usage.
//!
//! ## Architecture
//!
//! ```text
//!  application callbacks / polls
//!        ▲                │ send
//!        │                ▼
//!  ┌───────────┐    ┌───────────┐      ┌──────────────┐
//!  │ RX session│    │ TX session│  ◄───┤ Presentation │
//!  └─────▲─────┘    └─────┬─────┘      │ (clients,    │
//!        │                ▼            │  promises)   │
//!  ┌─────┴─────────────────────────┐   └──────────────┘
//!  │        Transport core         │
//!  │  reassembler │ splitter │ ids │   ┌──────────────┐
//!  └─────▲────────┴────┬──────────┘    │   Executor   │
//!        │             ▼               │ (spin_once)  │
//!  ┌─────┴─────┐  ┌───────────┐       └──────────────┘
//!  │ media pop │  │ TX queues │  × redundant media
//!  └───────────┘  └───────────┘
//! ```
//!
//! Everything is single-threaded and cooperative: the application owns the
//! loop and calls `transport.run(now)` plus `executor.spin_once()` at its
//! own cadence. Only `Executor::poll_awaitable_resources_for` may block.
//!
//! The clock ([`media::time::Monotonic`]) and the media interfaces
//! ([`media::can::CanMedia`], [`media::udp::UdpMedia`]) are injected;
//! the library opens no sockets and reads no clocks by itself.
//!
//! ## Crates
//!
//! * `recyphal-core` — protocol value types (reexported as [`core`]).
//! * `recyphal-media` — driver interface (reexported as [`media`]).
//! * `recyphal-encoding` — serialization traits (reexported as
//!   [`encoding`]).
//! * `recyphal` — this crate: transport profiles, executor, presentation
//!   layer and the application register registry.
#![no_std]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub use recyphal_core as core;
pub use recyphal_encoding as encoding;
pub use recyphal_media as media;

// This mod MUST go first, so that the others see its macros.
pub(crate) mod fmt;

pub mod application;
pub mod exec;
pub mod presentation;
pub mod transport;
