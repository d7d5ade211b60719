//! Test doubles for the STOMP session layer.
//!
//! The mock transports implement the session transport traits over
//! in-memory channels, so tests can script sequences of connect, message,
//! and disconnect events and inspect every frame the session sent —
//! without sockets, TLS, or timing dependence.

mod fixtures;
mod mock_client;
mod mock_server;

pub use fixtures::*;
pub use mock_client::{MockClientHandle, MockClientTransport, stomp_feed_responder};
pub use mock_server::{MockServerHandle, MockServerTransport};
