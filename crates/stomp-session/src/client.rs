//! STOMP client session.
//!
//! Drives the upstream feed connection: WebSocket connect, STOMP
//! handshake with the user's credentials, subscriptions with receipt
//! acknowledgement, and per-subscription message demux.
//!
//! The session runs an I/O task (owns the transport and the protocol
//! state) and a dispatch task (owns the user callbacks). All callbacks
//! fire on the dispatch task, in the order the transport delivered the
//! frames that caused them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use stomp_core::{StompCommand, StompFrame, StompHeader};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::transport::{ClientTransportEvent, WsClientTransport};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Result codes passed to STOMP client callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum StompClientError {
    #[error("ok")]
    Ok,
    #[error("could not close the websocket connection")]
    CouldNotCloseWebsocketConnection,
    #[error("could not connect to the websocket server")]
    CouldNotConnectToWebsocketServer,
    #[error("could not parse the message as a STOMP frame")]
    CouldNotParseMessageAsStompFrame,
    #[error("could not send the STOMP frame")]
    CouldNotSendStompFrame,
    #[error("could not send the SUBSCRIBE frame")]
    CouldNotSendSubscribeFrame,
    #[error("could not create a valid frame")]
    CouldNotCreateValidFrame,
    #[error("unexpected message content type")]
    UnexpectedMessageContentType,
    #[error("message destination does not match the subscription")]
    UnexpectedSubscriptionMismatch,
    #[error("the websocket server disconnected")]
    WebsocketServerDisconnected,
}

impl StompClientError {
    pub fn is_ok(self) -> bool {
        self == StompClientError::Ok
    }
}

// ---------------------------------------------------------------------------
// Handler types
// ---------------------------------------------------------------------------

/// Called once the STOMP connection is established, or earlier on failure.
pub type ConnectHandler = Box<dyn FnMut(StompClientError) + Send>;
/// Called when the connection drops outside an explicit `close`.
pub type DisconnectHandler = Box<dyn FnMut(StompClientError) + Send>;
/// Called when an explicit `close` completes.
pub type CloseHandler = Box<dyn FnOnce(StompClientError) + Send>;
/// Called once per subscription with the subscription id, when the
/// server's receipt arrives (or on failure, with an empty id).
pub type SubscribeHandler = Box<dyn FnOnce(StompClientError, String) + Send>;
/// Called for every message on a subscription, with the message body.
pub type MessageHandler = Box<dyn FnMut(StompClientError, String) + Send>;
/// Called for messages the server pushes outside any subscription
/// (incoming SEND frames), with the destination and the body.
pub type SessionMessageHandler = Box<dyn FnMut(StompClientError, String, String) + Send>;
/// Called when an outbound `send` completes, with the request id.
pub type SendHandler = Box<dyn FnOnce(StompClientError, String) + Send>;

// ---------------------------------------------------------------------------
// StompClient
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionStatus {
    Idle,
    TransportConnecting,
    StompConnecting,
    Connected,
}

#[derive(Debug)]
struct Shared {
    status: SessionStatus,
}

enum Command {
    Connect {
        username: String,
        password: String,
        on_connect: ConnectHandler,
        on_message: Option<SessionMessageHandler>,
        on_disconnect: DisconnectHandler,
    },
    Subscribe {
        id: String,
        destination: String,
        on_subscribe: SubscribeHandler,
        on_message: MessageHandler,
    },
    Send {
        request_id: String,
        destination: String,
        body: String,
        on_send: Option<SendHandler>,
    },
    Close {
        on_close: Option<CloseHandler>,
    },
}

type Starter = Box<dyn FnOnce() + Send>;

/// Handle to a STOMP client session.
///
/// Cheap to clone; the session lives until `close` or a disconnect, and is
/// single-use: one `connect` per session.
///
/// A new session is wired but idle: commands queue up until
/// [`StompClient::start`] releases the I/O and dispatch tasks, so an
/// orchestrator can finish its setup before any traffic flows.
#[derive(Clone)]
pub struct StompClient {
    commands: mpsc::UnboundedSender<Command>,
    shared: Arc<Mutex<Shared>>,
    starter: Arc<Mutex<Option<Starter>>>,
}

impl StompClient {
    /// Create a client session over the given transport.
    ///
    /// `host` is the value of the STOMP `host` header. Nothing happens on
    /// the wire until [`StompClient::start`].
    pub fn new<T: WsClientTransport>(transport: T, host: impl Into<String>) -> Self {
        let host = host.into();
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Mutex::new(Shared {
            status: SessionStatus::Idle,
        }));
        info!(%host, "creating STOMP client");
        let actor_shared = shared.clone();
        let starter: Starter = Box::new(move || {
            tokio::spawn(dispatcher(dispatch_rx));
            tokio::spawn(actor(transport, host, command_rx, dispatch_tx, actor_shared));
        });
        StompClient {
            commands,
            shared,
            starter: Arc::new(Mutex::new(Some(starter))),
        }
    }

    /// Start the session's I/O and dispatch tasks.
    ///
    /// Commands issued earlier (a queued `connect`, for instance) are
    /// processed once started. Idempotent.
    pub fn start(&self) {
        if let Some(starter) = self.starter.lock().expect("client state lock").take() {
            starter();
        }
    }

    /// Connect the transport and perform the STOMP handshake with the
    /// given credentials.
    ///
    /// `on_connect` fires on success and on every failure on the way
    /// there; `on_message` receives messages pushed outside any
    /// subscription; `on_disconnect` fires when the connection drops.
    pub fn connect(
        &self,
        username: impl Into<String>,
        password: impl Into<String>,
        on_connect: ConnectHandler,
        on_message: Option<SessionMessageHandler>,
        on_disconnect: DisconnectHandler,
    ) {
        {
            let mut shared = self.shared.lock().expect("client state lock");
            if shared.status != SessionStatus::Idle {
                warn!("connect called on a non-idle STOMP client; ignoring");
                return;
            }
            shared.status = SessionStatus::TransportConnecting;
        }
        let _ = self.commands.send(Command::Connect {
            username: username.into(),
            password: password.into(),
            on_connect,
            on_message,
            on_disconnect,
        });
    }

    /// Subscribe to a destination.
    ///
    /// Returns the generated subscription id, or an empty string when the
    /// session is not connected. `on_subscribe` fires exactly once, when
    /// the server's receipt arrives.
    pub fn subscribe(
        &self,
        destination: impl Into<String>,
        on_subscribe: SubscribeHandler,
        on_message: MessageHandler,
    ) -> String {
        if !self.is_connected() {
            return String::new();
        }
        let id = Uuid::new_v4().to_string();
        let _ = self.commands.send(Command::Subscribe {
            id: id.clone(),
            destination: destination.into(),
            on_subscribe,
            on_message,
        });
        id
    }

    /// Send a message to a destination.
    ///
    /// Returns the generated request id, or an empty string when the
    /// session is not connected.
    pub fn send(
        &self,
        destination: impl Into<String>,
        body: impl Into<String>,
        on_send: Option<SendHandler>,
    ) -> String {
        if !self.is_connected() {
            return String::new();
        }
        let request_id = Uuid::new_v4().to_string();
        let _ = self.commands.send(Command::Send {
            request_id: request_id.clone(),
            destination: destination.into(),
            body: body.into(),
            on_send,
        });
        request_id
    }

    /// Close the session. Subscriptions are dropped; `on_close` fires when
    /// the transport has been closed.
    pub fn close(&self, on_close: Option<CloseHandler>) {
        self.shared.lock().expect("client state lock").status = SessionStatus::Idle;
        let _ = self.commands.send(Command::Close { on_close });
    }

    fn is_connected(&self) -> bool {
        self.shared.lock().expect("client state lock").status == SessionStatus::Connected
    }
}

// ---------------------------------------------------------------------------
// Dispatch task
// ---------------------------------------------------------------------------

enum DispatchEvent {
    RegisterSession {
        on_connect: ConnectHandler,
        on_message: Option<SessionMessageHandler>,
        on_disconnect: DisconnectHandler,
    },
    RegisterSubscription {
        id: String,
        on_subscribe: SubscribeHandler,
        on_message: MessageHandler,
    },
    ConnectResult(StompClientError),
    SubscribeResult {
        id: String,
        error: StompClientError,
    },
    SubscriptionMessage {
        id: String,
        error: StompClientError,
        body: String,
    },
    SessionMessage {
        error: StompClientError,
        destination: String,
        body: String,
    },
    SendResult {
        on_send: SendHandler,
        error: StompClientError,
        request_id: String,
    },
    Disconnected(StompClientError),
    Closed {
        on_close: Option<CloseHandler>,
        error: StompClientError,
    },
}

struct Subscription {
    on_subscribe: Option<SubscribeHandler>,
    on_message: MessageHandler,
}

/// Runs the user callbacks, decoupled from the transport I/O task.
async fn dispatcher(mut events: mpsc::UnboundedReceiver<DispatchEvent>) {
    let mut on_connect: Option<ConnectHandler> = None;
    let mut on_session_message: Option<SessionMessageHandler> = None;
    let mut on_disconnect: Option<DisconnectHandler> = None;
    let mut subscriptions: HashMap<String, Subscription> = HashMap::new();

    while let Some(event) = events.recv().await {
        match event {
            DispatchEvent::RegisterSession {
                on_connect: connect,
                on_message,
                on_disconnect: disconnect,
            } => {
                on_connect = Some(connect);
                on_session_message = on_message;
                on_disconnect = Some(disconnect);
            }
            DispatchEvent::RegisterSubscription {
                id,
                on_subscribe,
                on_message,
            } => {
                subscriptions.insert(
                    id,
                    Subscription {
                        on_subscribe: Some(on_subscribe),
                        on_message,
                    },
                );
            }
            DispatchEvent::ConnectResult(error) => {
                if let Some(handler) = on_connect.as_mut() {
                    handler(error);
                }
            }
            DispatchEvent::SubscribeResult { id, error } => {
                let Some(subscription) = subscriptions.get_mut(&id) else {
                    warn!(%id, "receipt for an unknown subscription");
                    continue;
                };
                if let Some(handler) = subscription.on_subscribe.take() {
                    let reported = if error.is_ok() { id.clone() } else { String::new() };
                    handler(error, reported);
                } else {
                    warn!(%id, "duplicate receipt for a subscription");
                }
                if !error.is_ok() {
                    subscriptions.remove(&id);
                }
            }
            DispatchEvent::SubscriptionMessage { id, error, body } => {
                if let Some(subscription) = subscriptions.get_mut(&id) {
                    (subscription.on_message)(error, body);
                }
            }
            DispatchEvent::SessionMessage {
                error,
                destination,
                body,
            } => {
                if let Some(handler) = on_session_message.as_mut() {
                    handler(error, destination, body);
                } else {
                    warn!(%destination, "dropping message with no session handler");
                }
            }
            DispatchEvent::SendResult {
                on_send,
                error,
                request_id,
            } => {
                on_send(error, request_id);
            }
            DispatchEvent::Disconnected(error) => {
                subscriptions.clear();
                if let Some(handler) = on_disconnect.as_mut() {
                    handler(error);
                }
            }
            DispatchEvent::Closed { on_close, error } => {
                subscriptions.clear();
                if let Some(handler) = on_close {
                    handler(error);
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// I/O task
// ---------------------------------------------------------------------------

/// Owns the transport and the protocol state machine.
async fn actor<T: WsClientTransport>(
    mut transport: T,
    host: String,
    mut commands: mpsc::UnboundedReceiver<Command>,
    dispatch: mpsc::UnboundedSender<DispatchEvent>,
    shared: Arc<Mutex<Shared>>,
) {
    let set_status = |status: SessionStatus| {
        if let Ok(mut shared) = shared.lock() {
            shared.status = status;
        }
    };

    // Wait for the connect command.
    let connect = loop {
        match commands.recv().await {
            None => return,
            Some(Command::Connect {
                username,
                password,
                on_connect,
                on_message,
                on_disconnect,
            }) => {
                let _ = dispatch.send(DispatchEvent::RegisterSession {
                    on_connect,
                    on_message,
                    on_disconnect,
                });
                break (username, password);
            }
            Some(command) => reject_early_command(command, &dispatch),
        }
    };

    // Transport connect, then the STOMP handshake frame.
    info!(%host, "connecting to the STOMP server");
    if let Err(error) = transport.connect().await {
        error!(%error, "could not connect to the websocket server");
        let _ = dispatch.send(DispatchEvent::ConnectResult(
            StompClientError::CouldNotConnectToWebsocketServer,
        ));
        set_status(SessionStatus::Idle);
        return;
    }
    set_status(SessionStatus::StompConnecting);
    let (username, password) = connect;
    let handshake = StompFrame::from_components(
        StompCommand::Stomp,
        &[
            (StompHeader::AcceptVersion, "1.2"),
            (StompHeader::Host, &host),
            (StompHeader::Login, &username),
            (StompHeader::Passcode, &password),
        ],
        "",
    );
    let handshake = match handshake {
        Ok(frame) => frame,
        Err(error) => {
            error!(%error, "could not create a valid STOMP frame");
            let _ = dispatch.send(DispatchEvent::ConnectResult(
                StompClientError::CouldNotCreateValidFrame,
            ));
            set_status(SessionStatus::Idle);
            let _ = transport.close().await;
            return;
        }
    };
    if let Err(error) = transport.send(handshake.as_wire().to_owned()).await {
        error!(%error, "could not send the STOMP frame");
        let _ = dispatch.send(DispatchEvent::ConnectResult(
            StompClientError::CouldNotSendStompFrame,
        ));
        set_status(SessionStatus::Idle);
        let _ = transport.close().await;
        return;
    }

    // Main loop: demux transport frames and user commands.
    // Subscription id -> destination, as registered on this session.
    let mut subscriptions: HashMap<String, String> = HashMap::new();
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                None => {
                    let _ = transport.close().await;
                    return;
                }
                Some(Command::Close { on_close }) => {
                    info!("closing the STOMP client connection");
                    let error = match transport.close().await {
                        Ok(()) => StompClientError::Ok,
                        Err(_) => StompClientError::CouldNotCloseWebsocketConnection,
                    };
                    set_status(SessionStatus::Idle);
                    let _ = dispatch.send(DispatchEvent::Closed { on_close, error });
                    return;
                }
                Some(command) => {
                    handle_command(command, &mut transport, &dispatch, &mut subscriptions).await;
                }
            },
            event = transport.next_event() => {
                let clean = match event {
                    Some(ClientTransportEvent::Message(text)) => {
                        handle_frame(text, &dispatch, &subscriptions, &shared);
                        continue;
                    }
                    Some(ClientTransportEvent::Disconnected { clean }) => clean,
                    // The event stream ended without a close event: treat
                    // it as an unclean drop.
                    None => false,
                };
                info!(clean, "websocket connection disconnected");
                set_status(SessionStatus::Idle);
                let error = if clean {
                    StompClientError::Ok
                } else {
                    StompClientError::WebsocketServerDisconnected
                };
                let _ = dispatch.send(DispatchEvent::Disconnected(error));
                return;
            },
        }
    }
}

fn reject_early_command(command: Command, dispatch: &mpsc::UnboundedSender<DispatchEvent>) {
    match command {
        Command::Subscribe {
            id,
            on_subscribe,
            on_message,
            ..
        } => {
            let _ = dispatch.send(DispatchEvent::RegisterSubscription {
                id: id.clone(),
                on_subscribe,
                on_message,
            });
            let _ = dispatch.send(DispatchEvent::SubscribeResult {
                id,
                error: StompClientError::CouldNotSendSubscribeFrame,
            });
        }
        Command::Send {
            request_id,
            on_send: Some(on_send),
            ..
        } => {
            let _ = dispatch.send(DispatchEvent::SendResult {
                on_send,
                error: StompClientError::CouldNotSendStompFrame,
                request_id,
            });
        }
        Command::Close { on_close } => {
            let _ = dispatch.send(DispatchEvent::Closed {
                on_close,
                error: StompClientError::Ok,
            });
        }
        Command::Connect { .. } | Command::Send { .. } => {}
    }
}

async fn handle_command<T: WsClientTransport>(
    command: Command,
    transport: &mut T,
    dispatch: &mpsc::UnboundedSender<DispatchEvent>,
    subscriptions: &mut HashMap<String, String>,
) {
    match command {
        Command::Subscribe {
            id,
            destination,
            on_subscribe,
            on_message,
        } => {
            info!(%id, %destination, "subscribing");
            let frame = StompFrame::from_components(
                StompCommand::Subscribe,
                &[
                    (StompHeader::Id, &id),
                    (StompHeader::Destination, &destination),
                    (StompHeader::Ack, "auto"),
                    (StompHeader::Receipt, &id),
                ],
                "",
            );
            // Register before sending so the receipt can never outrun the
            // registration.
            let _ = dispatch.send(DispatchEvent::RegisterSubscription {
                id: id.clone(),
                on_subscribe,
                on_message,
            });
            let frame = match frame {
                Ok(frame) => frame,
                Err(error) => {
                    error!(%error, "could not create a valid SUBSCRIBE frame");
                    let _ = dispatch.send(DispatchEvent::SubscribeResult {
                        id,
                        error: StompClientError::CouldNotCreateValidFrame,
                    });
                    return;
                }
            };
            if transport.send(frame.as_wire().to_owned()).await.is_err() {
                error!(%id, "could not send the SUBSCRIBE frame");
                let _ = dispatch.send(DispatchEvent::SubscribeResult {
                    id,
                    error: StompClientError::CouldNotSendSubscribeFrame,
                });
            } else {
                subscriptions.insert(id, destination);
            }
        }
        Command::Send {
            request_id,
            destination,
            body,
            on_send,
        } => {
            let content_length = body.len().to_string();
            let frame = StompFrame::from_components(
                StompCommand::Send,
                &[
                    (StompHeader::Id, &request_id),
                    (StompHeader::Destination, &destination),
                    (StompHeader::ContentType, "application/json"),
                    (StompHeader::ContentLength, &content_length),
                ],
                &body,
            );
            let result = match frame {
                Ok(frame) => match transport.send(frame.as_wire().to_owned()).await {
                    Ok(()) => StompClientError::Ok,
                    Err(_) => StompClientError::CouldNotSendStompFrame,
                },
                Err(error) => {
                    error!(%error, "could not create a valid SEND frame");
                    StompClientError::CouldNotCreateValidFrame
                }
            };
            if let Some(on_send) = on_send {
                let _ = dispatch.send(DispatchEvent::SendResult {
                    on_send,
                    error: result,
                    request_id,
                });
            }
        }
        // Connect and Close are handled by the actor loop directly.
        Command::Connect { .. } | Command::Close { .. } => {}
    }
}

fn handle_frame(
    text: String,
    dispatch: &mpsc::UnboundedSender<DispatchEvent>,
    subscriptions: &HashMap<String, String>,
    shared: &Arc<Mutex<Shared>>,
) {
    let frame = match StompFrame::parse(text) {
        Ok(frame) => frame,
        Err(error) => {
            error!(%error, "could not parse the message as a STOMP frame");
            let _ = dispatch.send(DispatchEvent::ConnectResult(
                StompClientError::CouldNotParseMessageAsStompFrame,
            ));
            return;
        }
    };
    debug!(command = %frame.command(), "received frame");
    match frame.command() {
        StompCommand::Connected => {
            info!("successfully connected to the STOMP server");
            if let Ok(mut shared) = shared.lock() {
                shared.status = SessionStatus::Connected;
            }
            let _ = dispatch.send(DispatchEvent::ConnectResult(StompClientError::Ok));
        }
        StompCommand::Error => {
            // Nothing to handle; the server typically closes the
            // transport next.
            error!(body = frame.body(), "the STOMP server returned an error");
        }
        StompCommand::Message => {
            let subscription_id = frame
                .header_value(StompHeader::Subscription)
                .unwrap_or_default();
            let Some(destination) = subscriptions.get(subscription_id) else {
                error!(subscription_id, "cannot find subscription");
                return;
            };
            if frame.header_value(StompHeader::Destination) != Some(destination) {
                error!(subscription_id, "subscription destination mismatch");
                let _ = dispatch.send(DispatchEvent::SubscriptionMessage {
                    id: subscription_id.to_owned(),
                    error: StompClientError::UnexpectedSubscriptionMismatch,
                    body: String::new(),
                });
                return;
            }
            if let Some(content_type) = frame.header_value(StompHeader::ContentType) {
                if content_type != "application/json" {
                    error!(subscription_id, content_type, "unexpected content type");
                    let _ = dispatch.send(DispatchEvent::SubscriptionMessage {
                        id: subscription_id.to_owned(),
                        error: StompClientError::UnexpectedMessageContentType,
                        body: String::new(),
                    });
                    return;
                }
            }
            let _ = dispatch.send(DispatchEvent::SubscriptionMessage {
                id: subscription_id.to_owned(),
                error: StompClientError::Ok,
                body: frame.body().to_owned(),
            });
        }
        StompCommand::Receipt => {
            let receipt_id = frame
                .header_value(StompHeader::ReceiptId)
                .unwrap_or_default();
            if subscriptions.contains_key(receipt_id) {
                info!(receipt_id, "successfully subscribed");
                let _ = dispatch.send(DispatchEvent::SubscribeResult {
                    id: receipt_id.to_owned(),
                    error: StompClientError::Ok,
                });
            } else {
                error!(receipt_id, "receipt for an unknown subscription");
            }
        }
        StompCommand::Send => {
            // A message pushed by the server outside any subscription,
            // e.g. a quiet-route response correlated by request id.
            let destination = frame
                .header_value(StompHeader::Destination)
                .unwrap_or_default()
                .to_owned();
            let _ = dispatch.send(DispatchEvent::SessionMessage {
                error: StompClientError::Ok,
                destination,
                body: frame.body().to_owned(),
            });
        }
        command => {
            error!(%command, "unexpected STOMP command");
        }
    }
}
