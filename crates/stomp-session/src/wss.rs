//! Live WSS transports.
//!
//! [`WssClientTransport`] dials out over TLS, verifying the server against
//! a CA bundle when one is configured. [`WssServerTransport`] accepts TLS
//! connections with the configured certificate and multiplexes them behind
//! the [`WsServerTransport`] trait: one background task per connection
//! pumps reads into a shared event channel, and writes are routed to the
//! connection task over a per-connection command channel.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::transport::{
    ClientTransportEvent, ConnHandle, ServerTransportEvent, TransportError, WsClientTransport,
    WsServerTransport,
};

const CLIENT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const SERVER_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Client transport
// ---------------------------------------------------------------------------

type ClientWsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Outbound WSS connection for the STOMP client session.
pub struct WssClientTransport {
    url: String,
    ca_cert: Option<PathBuf>,
    ws: Option<ClientWsStream>,
}

impl WssClientTransport {
    /// Create a transport for the given `wss://` URL.
    ///
    /// With a CA bundle the server certificate is verified against that
    /// bundle alone; without one the system webpki roots apply.
    pub fn new(url: impl Into<String>, ca_cert: Option<PathBuf>) -> Self {
        WssClientTransport {
            url: url.into(),
            ca_cert,
            ws: None,
        }
    }
}

impl WsClientTransport for WssClientTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        let connector = match &self.ca_cert {
            Some(path) => {
                let roots = load_ca_roots(path)?;
                let config = rustls::ClientConfig::builder()
                    .with_root_certificates(roots)
                    .with_no_client_auth();
                Some(Connector::Rustls(Arc::new(config)))
            }
            None => None,
        };
        let connect = tokio_tungstenite::connect_async_tls_with_config(
            self.url.as_str(),
            None,
            false,
            connector,
        );
        let (ws, _response) = tokio::time::timeout(CLIENT_HANDSHAKE_TIMEOUT, connect)
            .await
            .map_err(|_| TransportError::Connect("handshake timed out".to_owned()))?
            .map_err(|error| TransportError::Connect(error.to_string()))?;
        info!(url = %self.url, "websocket connected");
        self.ws = Some(ws);
        Ok(())
    }

    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        let ws = self
            .ws
            .as_mut()
            .ok_or_else(|| TransportError::Send("not connected".to_owned()))?;
        ws.send(Message::Text(text.into()))
            .await
            .map_err(|error| TransportError::Send(error.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if let Some(mut ws) = self.ws.take() {
            ws.close(None)
                .await
                .map_err(|error| TransportError::Close(error.to_string()))?;
        }
        Ok(())
    }

    async fn next_event(&mut self) -> Option<ClientTransportEvent> {
        let ws = self.ws.as_mut()?;
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    return Some(ClientTransportEvent::Message(text.to_string()));
                }
                Some(Ok(Message::Ping(data))) => {
                    let _ = ws.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Close(_))) => {
                    self.ws = None;
                    return Some(ClientTransportEvent::Disconnected { clean: true });
                }
                Some(Ok(_)) => {}
                Some(Err(error)) => {
                    warn!(%error, "websocket read error");
                    self.ws = None;
                    return Some(ClientTransportEvent::Disconnected { clean: false });
                }
                None => {
                    self.ws = None;
                    return Some(ClientTransportEvent::Disconnected { clean: false });
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Server transport
// ---------------------------------------------------------------------------

enum ConnCommand {
    Send(String, oneshot::Sender<Result<(), TransportError>>),
    Close,
}

type ConnTable = Arc<Mutex<HashMap<ConnHandle, mpsc::UnboundedSender<ConnCommand>>>>;

/// TLS WebSocket acceptor for the STOMP server session.
///
/// `run` binds the listener (so bind failures surface immediately), but
/// accepting starts lazily on the first `next_event` poll: until the
/// session actor drives this transport, no connection is processed.
pub struct WssServerTransport {
    bind_addr: String,
    cert_path: PathBuf,
    key_path: PathBuf,
    bound: Option<(TcpListener, TlsAcceptor)>,
    events_tx: Option<mpsc::UnboundedSender<ServerTransportEvent>>,
    events_rx: mpsc::UnboundedReceiver<ServerTransportEvent>,
    conns: ConnTable,
    accept_task: Option<tokio::task::JoinHandle<()>>,
}

impl WssServerTransport {
    /// Create a transport bound to `ip:port`, presenting the certificate
    /// at `cert_path` with the private key at `key_path`.
    pub fn new(
        bind_addr: impl Into<String>,
        cert_path: impl Into<PathBuf>,
        key_path: impl Into<PathBuf>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        WssServerTransport {
            bind_addr: bind_addr.into(),
            cert_path: cert_path.into(),
            key_path: key_path.into(),
            bound: None,
            events_tx: Some(events_tx),
            events_rx,
            conns: Arc::new(Mutex::new(HashMap::new())),
            accept_task: None,
        }
    }
}

impl WsServerTransport for WssServerTransport {
    async fn run(&mut self) -> Result<(), TransportError> {
        let acceptor = load_tls_acceptor(&self.cert_path, &self.key_path)?;
        let listener = TcpListener::bind(&self.bind_addr)
            .await
            .map_err(|error| TransportError::Bind(error.to_string()))?;
        info!(bind_addr = %self.bind_addr, "websocket server bound");
        self.bound = Some((listener, acceptor));
        Ok(())
    }

    async fn next_event(&mut self) -> Option<ServerTransportEvent> {
        if let Some((listener, acceptor)) = self.bound.take() {
            // First poll: start the accept loop. It owns the only
            // long-lived event sender; when it and every connection task
            // are gone, the event stream ends.
            if let Some(events_tx) = self.events_tx.take() {
                let conns = self.conns.clone();
                self.accept_task =
                    Some(tokio::spawn(accept_loop(listener, acceptor, events_tx, conns)));
            }
        }
        self.events_rx.recv().await
    }

    async fn send(&mut self, conn: ConnHandle, text: String) -> Result<(), TransportError> {
        let sender = {
            let conns = self.conns.lock().expect("connection table lock");
            conns.get(&conn).cloned()
        };
        let sender = sender.ok_or(TransportError::UnknownConnection(conn))?;
        let (ack_tx, ack_rx) = oneshot::channel();
        sender
            .send(ConnCommand::Send(text, ack_tx))
            .map_err(|_| TransportError::UnknownConnection(conn))?;
        ack_rx
            .await
            .unwrap_or_else(|_| Err(TransportError::Send("connection task gone".to_owned())))
    }

    async fn close(&mut self, conn: ConnHandle) -> Result<(), TransportError> {
        let sender = {
            let conns = self.conns.lock().expect("connection table lock");
            conns.get(&conn).cloned()
        };
        match sender {
            Some(sender) => {
                let _ = sender.send(ConnCommand::Close);
                Ok(())
            }
            None => Err(TransportError::UnknownConnection(conn)),
        }
    }

    async fn stop(&mut self) {
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
        // Release the listener too, in case accepting never started.
        self.bound = None;
        let senders: Vec<_> = {
            let mut conns = self.conns.lock().expect("connection table lock");
            conns.drain().map(|(_, sender)| sender).collect()
        };
        for sender in senders {
            let _ = sender.send(ConnCommand::Close);
        }
        // Drop our event sender copy as well, if accepting never started.
        self.events_tx = None;
    }
}

/// Accepts connections and spawns one [`serve_connection`] task each.
async fn accept_loop(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    events_tx: mpsc::UnboundedSender<ServerTransportEvent>,
    conns: ConnTable,
) {
    let mut next_handle: ConnHandle = 0;
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(error) => {
                error!(%error, "accept failed");
                break;
            }
        };
        next_handle += 1;
        let handle = next_handle;
        debug!(handle, %peer, "accepted TCP connection");
        tokio::spawn(serve_connection(
            stream,
            acceptor.clone(),
            handle,
            events_tx.clone(),
            conns.clone(),
        ));
    }
}

/// One task per accepted connection: TLS and WebSocket handshakes, then a
/// read/write pump until either side closes.
async fn serve_connection(
    stream: TcpStream,
    acceptor: TlsAcceptor,
    handle: ConnHandle,
    events: mpsc::UnboundedSender<ServerTransportEvent>,
    conns: ConnTable,
) {
    let handshake = async {
        let tls = acceptor
            .accept(stream)
            .await
            .map_err(|error| error.to_string())?;
        tokio_tungstenite::accept_async(tls)
            .await
            .map_err(|error| error.to_string())
    };
    let mut ws = match tokio::time::timeout(SERVER_HANDSHAKE_TIMEOUT, handshake).await {
        Ok(Ok(ws)) => ws,
        Ok(Err(error)) => {
            warn!(handle, %error, "connection handshake failed");
            return;
        }
        Err(_) => {
            warn!(handle, "connection handshake timed out");
            return;
        }
    };

    let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel();
    conns
        .lock()
        .expect("connection table lock")
        .insert(handle, cmd_tx);
    let _ = events.send(ServerTransportEvent::Connected(handle));

    let clean = loop {
        tokio::select! {
            message = ws.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    let _ = events.send(ServerTransportEvent::Message(
                        handle,
                        text.to_string(),
                    ));
                }
                Some(Ok(Message::Ping(data))) => {
                    let _ = ws.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Close(_))) => break true,
                Some(Ok(_)) => {}
                Some(Err(error)) => {
                    warn!(handle, %error, "websocket read error");
                    break false;
                }
                None => break false,
            },
            command = cmd_rx.recv() => match command {
                Some(ConnCommand::Send(text, ack)) => {
                    let result = ws
                        .send(Message::Text(text.into()))
                        .await
                        .map_err(|error| TransportError::Send(error.to_string()));
                    let _ = ack.send(result);
                }
                Some(ConnCommand::Close) | None => {
                    let _ = ws.close(None).await;
                    break true;
                }
            },
        }
    };

    conns.lock().expect("connection table lock").remove(&handle);
    let _ = events.send(ServerTransportEvent::Disconnected(handle, clean));
}

// ---------------------------------------------------------------------------
// TLS material loading
// ---------------------------------------------------------------------------

fn load_ca_roots(path: &Path) -> Result<rustls::RootCertStore, TransportError> {
    let file = std::fs::File::open(path).map_err(|error| {
        TransportError::Connect(format!("reading CA bundle '{}': {error}", path.display()))
    })?;
    let mut reader = std::io::BufReader::new(file);
    let mut roots = rustls::RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut reader) {
        let cert = cert.map_err(|error| {
            TransportError::Connect(format!("parsing CA bundle '{}': {error}", path.display()))
        })?;
        roots.add(cert).map_err(|error| {
            TransportError::Connect(format!("loading CA bundle '{}': {error}", path.display()))
        })?;
    }
    Ok(roots)
}

fn load_tls_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor, TransportError> {
    let certs = {
        let file = std::fs::File::open(cert_path).map_err(|error| {
            TransportError::Bind(format!(
                "reading certificate '{}': {error}",
                cert_path.display()
            ))
        })?;
        let mut reader = std::io::BufReader::new(file);
        rustls_pemfile::certs(&mut reader)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|error| {
                TransportError::Bind(format!(
                    "parsing certificate '{}': {error}",
                    cert_path.display()
                ))
            })?
    };
    let key = {
        let file = std::fs::File::open(key_path).map_err(|error| {
            TransportError::Bind(format!("reading key '{}': {error}", key_path.display()))
        })?;
        let mut reader = std::io::BufReader::new(file);
        rustls_pemfile::private_key(&mut reader)
            .map_err(|error| {
                TransportError::Bind(format!("parsing key '{}': {error}", key_path.display()))
            })?
            .ok_or_else(|| {
                TransportError::Bind(format!("no private key in '{}'", key_path.display()))
            })?
    };
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|error| TransportError::Bind(format!("invalid TLS material: {error}")))?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}
