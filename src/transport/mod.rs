//! # Streaming Transport
//!
//! The connection to the remote voice endpoint.
//!
//! ## Key Components:
//! - **Protocol**: JSON frame shapes and server-message interpretation
//! - **Session**: WebSocket state machine with drop-when-not-open sends

pub mod protocol;
pub mod session;

#[cfg(test)]
pub(crate) mod loopback;
