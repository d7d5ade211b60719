// mock_server: A scripted server transport for STOMP server session tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use stomp_session::{ConnHandle, ServerTransportEvent, TransportError, WsServerTransport};
use tokio::sync::mpsc;

/// A mock server transport.
///
/// Tests script the connection lifecycle through the
/// [`MockServerHandle`] — connect, message, disconnect, per connection —
/// and inspect the frames the session sent back and the connections it
/// closed.
pub struct MockServerTransport {
    run_error: Option<TransportError>,
    events_rx: mpsc::UnboundedReceiver<ServerTransportEvent>,
    sent: Arc<Mutex<Vec<(ConnHandle, String)>>>,
    closed: Arc<Mutex<Vec<ConnHandle>>>,
    stopped: Arc<AtomicBool>,
}

/// Test-side handle to a [`MockServerTransport`].
#[derive(Clone)]
pub struct MockServerHandle {
    events_tx: mpsc::UnboundedSender<ServerTransportEvent>,
    sent: Arc<Mutex<Vec<(ConnHandle, String)>>>,
    closed: Arc<Mutex<Vec<ConnHandle>>>,
    stopped: Arc<AtomicBool>,
}

impl MockServerTransport {
    pub fn new() -> (Self, MockServerHandle) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let sent = Arc::new(Mutex::new(Vec::new()));
        let closed = Arc::new(Mutex::new(Vec::new()));
        let stopped = Arc::new(AtomicBool::new(false));
        let transport = MockServerTransport {
            run_error: None,
            events_rx,
            sent: sent.clone(),
            closed: closed.clone(),
            stopped: stopped.clone(),
        };
        let handle = MockServerHandle {
            events_tx,
            sent,
            closed,
            stopped,
        };
        (transport, handle)
    }

    /// Make `run` fail with the given error.
    #[must_use]
    pub fn with_run_error(mut self, error: TransportError) -> Self {
        self.run_error = Some(error);
        self
    }
}

impl WsServerTransport for MockServerTransport {
    async fn run(&mut self) -> Result<(), TransportError> {
        match self.run_error.take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn next_event(&mut self) -> Option<ServerTransportEvent> {
        self.events_rx.recv().await
    }

    async fn send(&mut self, conn: ConnHandle, text: String) -> Result<(), TransportError> {
        self.sent.lock().expect("sent frames lock").push((conn, text));
        Ok(())
    }

    async fn close(&mut self, conn: ConnHandle) -> Result<(), TransportError> {
        self.closed.lock().expect("closed list lock").push(conn);
        Ok(())
    }

    async fn stop(&mut self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

impl MockServerHandle {
    /// A new transport connection is accepted.
    pub fn connect_client(&self, conn: ConnHandle) {
        let _ = self.events_tx.send(ServerTransportEvent::Connected(conn));
    }

    /// A connection delivers a raw text message.
    pub fn client_message(&self, conn: ConnHandle, text: impl Into<String>) {
        let _ = self
            .events_tx
            .send(ServerTransportEvent::Message(conn, text.into()));
    }

    /// A connection drops from the peer side.
    pub fn disconnect_client(&self, conn: ConnHandle, clean: bool) {
        let _ = self
            .events_tx
            .send(ServerTransportEvent::Disconnected(conn, clean));
    }

    /// Every `(connection, frame)` the session has sent so far.
    pub fn sent_frames(&self) -> Vec<(ConnHandle, String)> {
        self.sent.lock().expect("sent frames lock").clone()
    }

    /// The frames sent to one connection.
    pub fn sent_to(&self, conn: ConnHandle) -> Vec<String> {
        self.sent
            .lock()
            .expect("sent frames lock")
            .iter()
            .filter(|(to, _)| *to == conn)
            .map(|(_, frame)| frame.clone())
            .collect()
    }

    /// The connections the session has closed, in order.
    pub fn closed_connections(&self) -> Vec<ConnHandle> {
        self.closed.lock().expect("closed list lock").clone()
    }

    /// Whether the session stopped the transport.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}
