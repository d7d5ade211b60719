//! Transport capability traits.
//!
//! The session state machines are written against these traits rather than
//! a concrete socket type. The contract is an opaque, message-framed,
//! asynchronous duplex channel: connect, send text, close, and a stream of
//! incoming events. [`crate::wss`] provides the live WSS+TLS
//! implementations; `tm-test-utils` provides scripted mocks.

use std::future::Future;

use thiserror::Error;

/// Errors surfaced by a transport implementation.
///
/// The session layer maps these onto its own error codes; the payload is
/// kept for logging only.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("could not connect: {0}")]
    Connect(String),
    #[error("could not bind: {0}")]
    Bind(String),
    #[error("could not send: {0}")]
    Send(String),
    #[error("could not close: {0}")]
    Close(String),
    #[error("unknown connection: {0}")]
    UnknownConnection(ConnHandle),
}

/// Identifies one accepted connection within a server transport.
pub type ConnHandle = u64;

/// Events produced by a client transport after a successful connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientTransportEvent {
    /// One complete incoming text message.
    Message(String),
    /// The peer or the network dropped the connection. `clean` is true for
    /// an orderly close handshake.
    Disconnected { clean: bool },
}

/// Events produced by a server transport while running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerTransportEvent {
    /// A new transport-level connection was accepted.
    Connected(ConnHandle),
    /// One complete incoming text message on a connection.
    Message(ConnHandle, String),
    /// A connection went away. `clean` is true for an orderly close.
    Disconnected(ConnHandle, bool),
}

/// Client-side transport: one outbound message-framed duplex channel.
pub trait WsClientTransport: Send + 'static {
    /// Establish the connection. Resolves once messages can be sent.
    fn connect(&mut self) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Send one text message.
    fn send(&mut self, text: String) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Close the connection.
    fn close(&mut self) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// The next incoming event. `None` once the connection is finished and
    /// every event has been delivered. Must be cancel-safe.
    fn next_event(&mut self)
    -> impl Future<Output = Option<ClientTransportEvent>> + Send;
}

/// Server-side transport: an acceptor multiplexing any number of
/// message-framed connections, each identified by a [`ConnHandle`].
pub trait WsServerTransport: Send + 'static {
    /// Bind and start accepting connections.
    fn run(&mut self) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// The next event from any connection. `None` once the transport has
    /// stopped and every event has been delivered. Must be cancel-safe.
    fn next_event(&mut self)
    -> impl Future<Output = Option<ServerTransportEvent>> + Send;

    /// Send one text message on a connection.
    fn send(
        &mut self,
        conn: ConnHandle,
        text: String,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Close one connection.
    fn close(&mut self, conn: ConnHandle)
    -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Stop accepting and tear down all live connections.
    fn stop(&mut self) -> impl Future<Output = ()> + Send;
}
