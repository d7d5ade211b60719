//! STOMP server session.
//!
//! Accepts downstream clients and enforces the STOMP handshake before
//! exposing them: a new transport connection stays pending, and invisible
//! to the user, until its first frame is a valid `STOMP`/`CONNECT` with
//! the right `accept-version` and `host`. Protocol violations answer with
//! an `ERROR` frame and close the connection without ever notifying the
//! user.
//!
//! Like the client session, the server runs an I/O task owning the
//! transport and a dispatch task owning the user callbacks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use stomp_core::{StompCommand, StompFrame, StompHeader};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::transport::{ConnHandle, ServerTransportEvent, WsServerTransport};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Result codes passed to STOMP server callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum StompServerError {
    #[error("ok")]
    Ok,
    #[error("a connected client cannot send a new STOMP frame")]
    ClientCannotReconnect,
    #[error("could not close the client connection")]
    CouldNotCloseClientConnection,
    #[error("could not parse the message as a STOMP frame")]
    CouldNotParseFrame,
    #[error("could not send the message")]
    CouldNotSendMessage,
    #[error("could not start the websocket server")]
    CouldNotStartWebsocketServer,
    #[error("invalid accept-version header value")]
    InvalidHeaderValueAcceptVersion,
    #[error("invalid host header value")]
    InvalidHeaderValueHost,
    #[error("unsupported frame")]
    UnsupportedFrame,
    #[error("the websocket session disconnected")]
    WebsocketSessionDisconnected,
    #[error("the websocket server disconnected")]
    WebsocketServerDisconnected,
}

impl StompServerError {
    pub fn is_ok(self) -> bool {
        self == StompServerError::Ok
    }
}

// ---------------------------------------------------------------------------
// Handler types
// ---------------------------------------------------------------------------

/// A message received from a connected STOMP client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientMessage {
    pub connection_id: String,
    pub destination: String,
    /// The frame's `id` header; may be empty. Reusing it as the reply's
    /// request id lets the client correlate request and response.
    pub request_id: String,
    pub body: String,
}

/// Called when a client completes the STOMP handshake.
pub type ClientConnectHandler = Box<dyn FnMut(StompServerError, String) + Send>;
/// Called for every SEND frame from a connected client.
pub type ClientMessageHandler = Box<dyn FnMut(StompServerError, ClientMessage) + Send>;
/// Called when a connected client goes away.
pub type ClientDisconnectHandler = Box<dyn FnMut(StompServerError, String) + Send>;
/// Called when the server transport itself goes away.
pub type ServerDisconnectHandler = Box<dyn FnMut(StompServerError) + Send>;
/// Called when an outbound `send` completes, with the request id.
pub type ServerSendHandler = Box<dyn FnOnce(StompServerError, String) + Send>;
/// Called when an explicit per-connection `close` completes.
pub type ClientCloseHandler = Box<dyn FnOnce(StompServerError, String) + Send>;

/// The callback set wired in by [`StompServer::run`].
pub struct ServerHandlers {
    pub on_client_connect: ClientConnectHandler,
    pub on_client_message: ClientMessageHandler,
    pub on_client_disconnect: ClientDisconnectHandler,
    pub on_server_disconnect: ServerDisconnectHandler,
}

// ---------------------------------------------------------------------------
// StompServer
// ---------------------------------------------------------------------------

const STOMP_VERSION: &str = "1.2";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionStatus {
    Pending,
    Connected,
}

#[derive(Debug)]
struct Shared {
    running: bool,
    /// STOMP-connected clients only; pending connections stay invisible.
    connections: HashMap<String, ConnectionStatus>,
}

enum Command {
    Send {
        connection_id: String,
        request_id: String,
        destination: String,
        body: String,
        on_send: Option<ServerSendHandler>,
    },
    Close {
        connection_id: String,
        on_close: Option<ClientCloseHandler>,
    },
    Stop,
}

type Starter = Box<dyn FnOnce() + Send>;

/// Handle to a STOMP server.
///
/// Cheap to clone. Created by [`StompServer::run`], which binds the
/// transport but leaves the session idle: connections are accepted and
/// validated only once [`StompServer::start`] releases the I/O and
/// dispatch tasks.
#[derive(Clone)]
pub struct StompServer {
    commands: mpsc::UnboundedSender<Command>,
    shared: Arc<Mutex<Shared>>,
    starter: Arc<Mutex<Option<Starter>>>,
}

impl StompServer {
    /// Set up the server on the given transport.
    ///
    /// Binds the transport, surfacing bind failures immediately; no
    /// connection is processed until [`StompServer::start`]. `host` is
    /// the value every client's handshake `host` header must match.
    pub async fn run<T: WsServerTransport>(
        mut transport: T,
        host: impl Into<String>,
        handlers: ServerHandlers,
    ) -> Result<Self, StompServerError> {
        let host = host.into();
        if let Err(error) = transport.run().await {
            error!(%error, "could not start the websocket server");
            return Err(StompServerError::CouldNotStartWebsocketServer);
        }
        info!(%host, "websocket server bound");

        let (commands, command_rx) = mpsc::unbounded_channel();
        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Mutex::new(Shared {
            running: true,
            connections: HashMap::new(),
        }));
        let actor_shared = shared.clone();
        let starter: Starter = Box::new(move || {
            tokio::spawn(dispatcher(dispatch_rx, handlers));
            tokio::spawn(actor(transport, host, command_rx, dispatch_tx, actor_shared));
        });
        Ok(StompServer {
            commands,
            shared,
            starter: Arc::new(Mutex::new(Some(starter))),
        })
    }

    /// Start accepting and validating connections. Idempotent.
    pub fn start(&self) {
        if let Some(starter) = self.starter.lock().expect("server state lock").take() {
            starter();
        }
    }

    /// Send a message to a connected STOMP client.
    ///
    /// Returns the request id (auto-generated unless `user_request_id` is
    /// given), or an empty string when the connection is unknown, not yet
    /// STOMP-connected, or the server has stopped.
    pub fn send(
        &self,
        connection_id: &str,
        destination: impl Into<String>,
        body: impl Into<String>,
        on_send: Option<ServerSendHandler>,
        user_request_id: Option<String>,
    ) -> String {
        {
            let shared = self.shared.lock().expect("server state lock");
            if !shared.running
                || shared.connections.get(connection_id) != Some(&ConnectionStatus::Connected)
            {
                warn!(connection_id, "cannot send: not a connected STOMP client");
                return String::new();
            }
        }
        let request_id = user_request_id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let _ = self.commands.send(Command::Send {
            connection_id: connection_id.to_owned(),
            request_id: request_id.clone(),
            destination: destination.into(),
            body: body.into(),
            on_send,
        });
        request_id
    }

    /// Close one client connection. Does not fire `on_client_disconnect`.
    ///
    /// The connection leaves the connected set immediately: a `send`
    /// issued right after this call returns an empty request id, even
    /// though the transport teardown completes asynchronously.
    pub fn close(&self, connection_id: &str, on_close: Option<ClientCloseHandler>) {
        self.shared
            .lock()
            .expect("server state lock")
            .connections
            .remove(connection_id);
        let _ = self.commands.send(Command::Close {
            connection_id: connection_id.to_owned(),
            on_close,
        });
    }

    /// Stop accepting connections immediately and close all live ones
    /// asynchronously. Fires neither `on_client_disconnect` nor
    /// `on_server_disconnect`.
    pub fn stop(&self) {
        self.shared.lock().expect("server state lock").running = false;
        let _ = self.commands.send(Command::Stop);
    }
}

// ---------------------------------------------------------------------------
// Dispatch task
// ---------------------------------------------------------------------------

enum DispatchEvent {
    ClientConnect(StompServerError, String),
    ClientMessage(StompServerError, ClientMessage),
    ClientDisconnect(StompServerError, String),
    ServerDisconnect(StompServerError),
    SendResult {
        on_send: ServerSendHandler,
        error: StompServerError,
        request_id: String,
    },
    CloseResult {
        on_close: ClientCloseHandler,
        error: StompServerError,
        connection_id: String,
    },
}

/// Runs the user callbacks, decoupled from the transport I/O task.
async fn dispatcher(mut events: mpsc::UnboundedReceiver<DispatchEvent>, mut handlers: ServerHandlers) {
    while let Some(event) = events.recv().await {
        match event {
            DispatchEvent::ClientConnect(error, id) => {
                (handlers.on_client_connect)(error, id);
            }
            DispatchEvent::ClientMessage(error, message) => {
                (handlers.on_client_message)(error, message);
            }
            DispatchEvent::ClientDisconnect(error, id) => {
                (handlers.on_client_disconnect)(error, id);
            }
            DispatchEvent::ServerDisconnect(error) => {
                (handlers.on_server_disconnect)(error);
            }
            DispatchEvent::SendResult {
                on_send,
                error,
                request_id,
            } => {
                on_send(error, request_id);
            }
            DispatchEvent::CloseResult {
                on_close,
                error,
                connection_id,
            } => {
                on_close(error, connection_id);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// I/O task
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Connection {
    id: String,
    status: ConnectionStatus,
}

struct ServerState {
    host: String,
    by_handle: HashMap<ConnHandle, Connection>,
    by_id: HashMap<String, ConnHandle>,
    shared: Arc<Mutex<Shared>>,
    dispatch: mpsc::UnboundedSender<DispatchEvent>,
}

/// Owns the transport and the per-connection handshake state machine.
async fn actor<T: WsServerTransport>(
    mut transport: T,
    host: String,
    mut commands: mpsc::UnboundedReceiver<Command>,
    dispatch: mpsc::UnboundedSender<DispatchEvent>,
    shared: Arc<Mutex<Shared>>,
) {
    let mut state = ServerState {
        host,
        by_handle: HashMap::new(),
        by_id: HashMap::new(),
        shared,
        dispatch,
    };
    let mut stopping = false;

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                None => {
                    transport.stop().await;
                    return;
                }
                Some(Command::Stop) => {
                    info!("stopping the STOMP server");
                    stopping = true;
                    transport.stop().await;
                    for handle in state.by_handle.keys().copied().collect::<Vec<_>>() {
                        let _ = transport.close(handle).await;
                    }
                    state.by_handle.clear();
                    state.by_id.clear();
                    if let Ok(mut shared) = state.shared.lock() {
                        shared.connections.clear();
                    }
                }
                Some(command) => state.handle_command(command, &mut transport).await,
            },
            event = transport.next_event() => match event {
                Some(event) => state.handle_event(event, &mut transport).await,
                None => {
                    // The transport is gone. After an explicit stop this
                    // is the expected wind-down and stays silent.
                    if !stopping {
                        error!("websocket server disconnected");
                        if let Ok(mut shared) = state.shared.lock() {
                            shared.running = false;
                        }
                        let _ = state.dispatch.send(DispatchEvent::ServerDisconnect(
                            StompServerError::WebsocketServerDisconnected,
                        ));
                    }
                    return;
                }
            },
        }
    }
}

impl ServerState {
    async fn handle_command<T: WsServerTransport>(&mut self, command: Command, transport: &mut T) {
        match command {
            Command::Send {
                connection_id,
                request_id,
                destination,
                body,
                on_send,
            } => {
                let error = self
                    .send_frame(&connection_id, &request_id, &destination, &body, transport)
                    .await;
                if let Some(on_send) = on_send {
                    let _ = self.dispatch.send(DispatchEvent::SendResult {
                        on_send,
                        error,
                        request_id,
                    });
                }
            }
            Command::Close {
                connection_id,
                on_close,
            } => {
                let error = match self.by_id.get(&connection_id).copied() {
                    Some(handle) => {
                        self.remove_connection(handle);
                        match transport.close(handle).await {
                            Ok(()) => StompServerError::Ok,
                            Err(_) => StompServerError::CouldNotCloseClientConnection,
                        }
                    }
                    None => {
                        error!(connection_id, "unrecognized STOMP connection");
                        StompServerError::CouldNotCloseClientConnection
                    }
                };
                if let Some(on_close) = on_close {
                    let _ = self.dispatch.send(DispatchEvent::CloseResult {
                        on_close,
                        error,
                        connection_id,
                    });
                }
            }
            Command::Stop => {}
        }
    }

    async fn send_frame<T: WsServerTransport>(
        &mut self,
        connection_id: &str,
        request_id: &str,
        destination: &str,
        body: &str,
        transport: &mut T,
    ) -> StompServerError {
        let Some(handle) = self.by_id.get(connection_id).copied() else {
            error!(connection_id, "unrecognized STOMP connection");
            return StompServerError::CouldNotSendMessage;
        };
        let content_length = body.len().to_string();
        let frame = StompFrame::from_components(
            StompCommand::Send,
            &[
                (StompHeader::Id, request_id),
                (StompHeader::Destination, destination),
                (StompHeader::ContentType, "application/json"),
                (StompHeader::ContentLength, &content_length),
            ],
            body,
        );
        let frame = match frame {
            Ok(frame) => frame,
            Err(error) => {
                error!(%error, "could not create a valid SEND frame");
                return StompServerError::CouldNotSendMessage;
            }
        };
        info!(connection_id, destination, "sending message");
        match transport.send(handle, frame.as_wire().to_owned()).await {
            Ok(()) => StompServerError::Ok,
            Err(_) => StompServerError::CouldNotSendMessage,
        }
    }

    async fn handle_event<T: WsServerTransport>(
        &mut self,
        event: ServerTransportEvent,
        transport: &mut T,
    ) {
        match event {
            ServerTransportEvent::Connected(handle) => {
                // Not a STOMP connection until a valid handshake frame
                // arrives; the user is not notified yet.
                let connection = Connection {
                    id: Uuid::new_v4().to_string(),
                    status: ConnectionStatus::Pending,
                };
                info!(connection_id = %connection.id, "connection pending");
                self.by_id.insert(connection.id.clone(), handle);
                self.by_handle.insert(handle, connection);
            }
            ServerTransportEvent::Message(handle, text) => {
                self.handle_message(handle, text, transport).await;
            }
            ServerTransportEvent::Disconnected(handle, clean) => {
                let Some(connection) = self.by_handle.get(&handle) else {
                    return;
                };
                let id = connection.id.clone();
                let status = connection.status;
                info!(connection_id = %id, clean, "client disconnected");
                self.remove_connection(handle);
                if status == ConnectionStatus::Connected {
                    let error = if clean {
                        StompServerError::Ok
                    } else {
                        StompServerError::WebsocketSessionDisconnected
                    };
                    let _ = self
                        .dispatch
                        .send(DispatchEvent::ClientDisconnect(error, id));
                }
            }
        }
    }

    async fn handle_message<T: WsServerTransport>(
        &mut self,
        handle: ConnHandle,
        text: String,
        transport: &mut T,
    ) {
        if !self.by_handle.contains_key(&handle) {
            warn!(handle, "message on an unknown connection");
            let _ = transport.close(handle).await;
            return;
        }

        let frame = match StompFrame::parse(text) {
            Ok(frame) => frame,
            Err(error) => {
                error!(%error, "could not parse the client frame");
                self.close_with_error(handle, StompServerError::CouldNotParseFrame, transport)
                    .await;
                return;
            }
        };
        info!(command = %frame.command(), "received client frame");
        match frame.command() {
            StompCommand::Stomp | StompCommand::Connect => {
                self.handle_stomp(handle, &frame, transport).await;
            }
            StompCommand::Send => {
                self.handle_send(handle, &frame, transport).await;
            }
            _ => {
                self.close_with_error(handle, StompServerError::UnsupportedFrame, transport)
                    .await;
            }
        }
    }

    async fn handle_stomp<T: WsServerTransport>(
        &mut self,
        handle: ConnHandle,
        frame: &StompFrame,
        transport: &mut T,
    ) {
        if frame.header_value(StompHeader::AcceptVersion) != Some(STOMP_VERSION) {
            self.close_with_error(
                handle,
                StompServerError::InvalidHeaderValueAcceptVersion,
                transport,
            )
            .await;
            return;
        }
        if frame.header_value(StompHeader::Host) != Some(self.host.as_str()) {
            self.close_with_error(handle, StompServerError::InvalidHeaderValueHost, transport)
                .await;
            return;
        }
        let Some((id, status)) = self
            .by_handle
            .get(&handle)
            .map(|connection| (connection.id.clone(), connection.status))
        else {
            return;
        };
        if status != ConnectionStatus::Pending {
            error!(connection_id = %id, "connection was not pending");
            self.close_with_error(handle, StompServerError::ClientCannotReconnect, transport)
                .await;
            return;
        }

        if let Some(connection) = self.by_handle.get_mut(&handle) {
            connection.status = ConnectionStatus::Connected;
        }
        info!(connection_id = %id, "STOMP client connected");
        if let Ok(mut shared) = self.shared.lock() {
            shared
                .connections
                .insert(id.clone(), ConnectionStatus::Connected);
        }

        let response = StompFrame::from_components(
            StompCommand::Connected,
            &[
                (StompHeader::Version, STOMP_VERSION),
                (StompHeader::Session, &id),
            ],
            "",
        );
        match response {
            Ok(response) => {
                let _ = transport.send(handle, response.as_wire().to_owned()).await;
            }
            Err(error) => {
                error!(%error, "could not create the CONNECTED frame");
                return;
            }
        }
        let _ = self
            .dispatch
            .send(DispatchEvent::ClientConnect(StompServerError::Ok, id));
    }

    async fn handle_send<T: WsServerTransport>(
        &mut self,
        handle: ConnHandle,
        frame: &StompFrame,
        transport: &mut T,
    ) {
        let Some((id, status)) = self
            .by_handle
            .get(&handle)
            .map(|connection| (connection.id.clone(), connection.status))
        else {
            return;
        };
        if status != ConnectionStatus::Connected {
            error!(connection_id = %id, "SEND frame before the STOMP handshake");
            // Not a valid STOMP connection: close silently, no user event.
            self.remove_connection(handle);
            let _ = transport.close(handle).await;
            return;
        }
        let message = ClientMessage {
            connection_id: id,
            destination: frame
                .header_value(StompHeader::Destination)
                .unwrap_or_default()
                .to_owned(),
            request_id: frame
                .header_value(StompHeader::Id)
                .unwrap_or_default()
                .to_owned(),
            body: frame.body().to_owned(),
        };
        let _ = self
            .dispatch
            .send(DispatchEvent::ClientMessage(StompServerError::Ok, message));
    }

    /// Tear down a connection after a protocol violation: reply with an
    /// ERROR frame, close the transport, and forget the connection. The
    /// user is never notified about it.
    async fn close_with_error<T: WsServerTransport>(
        &mut self,
        handle: ConnHandle,
        error: StompServerError,
        transport: &mut T,
    ) {
        if let Some(connection) = self.by_handle.get(&handle) {
            info!(connection_id = %connection.id, %error, "closing connection");
        }
        self.remove_connection(handle);
        let _ = transport.send(handle, error_frame(error)).await;
        let _ = transport.close(handle).await;
    }

    fn remove_connection(&mut self, handle: ConnHandle) {
        if let Some(connection) = self.by_handle.remove(&handle) {
            self.by_id.remove(&connection.id);
            if let Ok(mut shared) = self.shared.lock() {
                shared.connections.remove(&connection.id);
            }
        }
    }
}

fn error_frame(error: StompServerError) -> String {
    let reason = error.to_string();
    match StompFrame::from_components(
        StompCommand::Error,
        &[
            (StompHeader::ContentType, "text/plain"),
            (StompHeader::Version, STOMP_VERSION),
        ],
        &reason,
    ) {
        Ok(frame) => frame.as_wire().to_owned(),
        Err(frame_error) => {
            error!(%frame_error, "could not create the ERROR frame");
            String::new()
        }
    }
}
