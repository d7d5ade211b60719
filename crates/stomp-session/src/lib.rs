//! STOMP 1.2 session state machines over a WebSocket transport.
//!
//! The client ([`StompClient`]) drives the upstream feed connection; the
//! server ([`StompServer`]) accepts downstream clients and validates their
//! STOMP handshake before exposing them.
//!
//! Both state machines are written against the transport capability traits
//! in [`transport`], so tests can swap the live WSS transports for scripted
//! mocks. Each session runs two tasks on the shared runtime: an I/O task
//! that owns the transport and the protocol state, and a dispatch task
//! that owns the user callbacks. User code therefore never runs on the
//! transport's read path, and a slow handler cannot stall a read loop.
//!
//! Sessions are constructed wired-but-idle: commands queue up until a
//! `start` call releases the tasks, so an orchestrator can finish its
//! setup before any traffic flows.

pub mod client;
pub mod server;
pub mod transport;
pub mod wss;

pub use client::{StompClient, StompClientError};
pub use server::{ClientMessage, ServerHandlers, StompServer, StompServerError};
pub use transport::{
    ClientTransportEvent, ConnHandle, ServerTransportEvent, TransportError, WsClientTransport,
    WsServerTransport,
};
pub use wss::{WssClientTransport, WssServerTransport};
