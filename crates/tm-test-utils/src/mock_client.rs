// mock_client: A scripted client transport for STOMP client session tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use stomp_core::{StompCommand, StompFrame, StompHeader};
use stomp_session::{ClientTransportEvent, TransportError, WsClientTransport};
use tokio::sync::mpsc;

/// Maps each frame the session sends to the events the peer would answer
/// with. Runs synchronously inside the mock's `send`.
pub type Responder = Box<dyn FnMut(&StompFrame) -> Vec<ClientTransportEvent> + Send>;

/// A mock client transport.
///
/// Events flow to the session from three sources: the scripted connect
/// result, the optional responder (reacting to sent frames), and the
/// [`MockClientHandle`] (for test-injected messages and disconnects).
pub struct MockClientTransport {
    connect_error: Option<TransportError>,
    fail_sends: bool,
    responder: Option<Responder>,
    events_rx: mpsc::UnboundedReceiver<ClientTransportEvent>,
    events_tx: mpsc::UnboundedSender<ClientTransportEvent>,
    sent: Arc<Mutex<Vec<String>>>,
    closed: Arc<AtomicBool>,
}

/// Test-side handle to a [`MockClientTransport`].
#[derive(Clone)]
pub struct MockClientHandle {
    events_tx: mpsc::UnboundedSender<ClientTransportEvent>,
    sent: Arc<Mutex<Vec<String>>>,
    closed: Arc<AtomicBool>,
}

impl MockClientTransport {
    pub fn new() -> (Self, MockClientHandle) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let sent = Arc::new(Mutex::new(Vec::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let transport = MockClientTransport {
            connect_error: None,
            fail_sends: false,
            responder: None,
            events_rx,
            events_tx: events_tx.clone(),
            sent: sent.clone(),
            closed: closed.clone(),
        };
        let handle = MockClientHandle {
            events_tx,
            sent,
            closed,
        };
        (transport, handle)
    }

    /// Make `connect` fail with the given error.
    #[must_use]
    pub fn with_connect_error(mut self, error: TransportError) -> Self {
        self.connect_error = Some(error);
        self
    }

    /// Make every `send` fail.
    #[must_use]
    pub fn with_send_failures(mut self) -> Self {
        self.fail_sends = true;
        self
    }

    /// Install a responder that answers sent frames with peer events.
    #[must_use]
    pub fn with_responder(mut self, responder: Responder) -> Self {
        self.responder = Some(responder);
        self
    }
}

impl WsClientTransport for MockClientTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        match self.connect_error.take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        if self.fail_sends {
            return Err(TransportError::Send("scripted send failure".to_owned()));
        }
        self.sent.lock().expect("sent frames lock").push(text.clone());
        if let Some(responder) = self.responder.as_mut() {
            if let Ok(frame) = StompFrame::parse(text) {
                for event in responder(&frame) {
                    let _ = self.events_tx.send(event);
                }
            }
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn next_event(&mut self) -> Option<ClientTransportEvent> {
        self.events_rx.recv().await
    }
}

impl MockClientHandle {
    /// Deliver a raw text message to the session.
    pub fn push_message(&self, text: impl Into<String>) {
        let _ = self
            .events_tx
            .send(ClientTransportEvent::Message(text.into()));
    }

    /// Drop the connection from the peer side.
    pub fn push_disconnect(&self, clean: bool) {
        let _ = self
            .events_tx
            .send(ClientTransportEvent::Disconnected { clean });
    }

    /// Every frame the session has sent so far, in order.
    pub fn sent_frames(&self) -> Vec<String> {
        self.sent.lock().expect("sent frames lock").clone()
    }

    /// Whether the session closed the transport.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// The canned upstream feed: validates the handshake credentials, answers
/// `CONNECTED`, and acknowledges every `SUBSCRIBE` with a `RECEIPT`.
///
/// Messages on a subscription are injected by the test through the
/// [`MockClientHandle`] once `on_subscribe` has fired.
pub fn stomp_feed_responder(
    username: impl Into<String>,
    password: impl Into<String>,
) -> Responder {
    let username = username.into();
    let password = password.into();
    Box::new(move |frame| match frame.command() {
        StompCommand::Stomp | StompCommand::Connect => {
            if frame.header_value(StompHeader::Login) == Some(username.as_str())
                && frame.header_value(StompHeader::Passcode) == Some(password.as_str())
            {
                vec![ClientTransportEvent::Message(crate::connected_frame("s0"))]
            } else {
                vec![
                    ClientTransportEvent::Message(crate::error_frame("bad credentials")),
                    ClientTransportEvent::Disconnected { clean: false },
                ]
            }
        }
        StompCommand::Subscribe => {
            let receipt = frame.header_value(StompHeader::Receipt).unwrap_or_default();
            vec![ClientTransportEvent::Message(crate::receipt_frame(receipt))]
        }
        _ => Vec::new(),
    })
}
