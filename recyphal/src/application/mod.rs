//! Application-layer building blocks above the transport.

pub mod registry;
