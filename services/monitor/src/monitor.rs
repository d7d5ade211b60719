//! The monitor orchestrator.
//!
//! Owns one transport network, one STOMP client (upstream passenger
//! feed), and one STOMP server (downstream quiet-route service), and
//! wires the callbacks between them.
//!
//! The network is the only shared state; every mutation and every path
//! computation happens under its lock, so a quiet-route request can never
//! observe a half-applied passenger event.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use stomp_session::client::{MessageHandler, SubscribeHandler};
use stomp_session::{
    ClientMessage, ServerHandlers, StompClient, StompClientError, StompServer, WsClientTransport,
    WsServerTransport,
};
use tm_protocol::{PassengerEvent, PassengerEventKind, QuietRouteRequest, TravelRoute};
use tokio::sync::Notify;
use tracing::{debug, error, info};
use transit_network::{QuietRouteParams, TransportNetwork};

use crate::config::MonitorConfig;
use crate::layout;

/// Path of the layout document on the feed host.
const LAYOUT_ENDPOINT: &str = "/network-layout.json";
/// Upstream subscription destination.
const PASSENGERS_DESTINATION: &str = "/passengers";
/// The only destination the quiet-route service accepts.
const QUIET_ROUTE_DESTINATION: &str = "/quiet-route";

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Monitor-level result codes. The monitor records the most recent one
/// instead of propagating errors across the async boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MonitorError {
    #[error("ok")]
    Ok,
    #[error("could not connect the STOMP client")]
    CouldNotConnectToStompClient,
    #[error("could not parse a passenger event")]
    CouldNotParsePassengerEvent,
    #[error("could not parse a quiet-route request")]
    CouldNotParseQuietRouteRequest,
    #[error("could not record a passenger event")]
    CouldNotRecordPassengerEvent,
    #[error("could not start the STOMP server")]
    CouldNotStartStompServer,
    #[error("could not subscribe to passenger events")]
    CouldNotSubscribeToPassengerEvents,
    #[error("network layout download failed")]
    FailedNetworkLayoutFileDownload,
    #[error("network layout parsing failed")]
    FailedNetworkLayoutFileParsing,
    #[error("transport network construction failed")]
    FailedTransportNetworkConstruction,
    #[error("missing CA certificate file")]
    MissingCaCertFile,
    #[error("missing network layout file")]
    MissingNetworkLayoutFile,
    #[error("the STOMP client disconnected")]
    StompClientDisconnected,
    #[error("a STOMP server client disconnected")]
    StompServerClientDisconnected,
    #[error("the STOMP server disconnected")]
    StompServerDisconnected,
}

impl MonitorError {
    pub fn is_ok(self) -> bool {
        self == MonitorError::Ok
    }
}

// ---------------------------------------------------------------------------
// TransitMonitor
// ---------------------------------------------------------------------------

struct MonitorState {
    network: TransportNetwork,
    params: QuietRouteParams,
    last_error: MonitorError,
    last_travel_route: TravelRoute,
    connected_clients: HashSet<String>,
}

type SharedState = Arc<Mutex<MonitorState>>;
/// The server handle becomes available only once the server is running;
/// the server callbacks fetch it from this slot.
type ServerSlot = Arc<Mutex<Option<StompServer>>>;

/// The live transport-network monitor.
pub struct TransitMonitor {
    state: SharedState,
    client: StompClient,
    server: StompServer,
    stop: Arc<Notify>,
}

impl TransitMonitor {
    /// Set up the monitor: validate the configuration, obtain and load
    /// the network layout, bind the quiet-route server, and wire up the
    /// feed client.
    ///
    /// No I/O is processed yet — the queued feed connection and the
    /// server's accept loop only start inside [`TransitMonitor::run`] or
    /// [`TransitMonitor::run_for`].
    pub async fn configure<C: WsClientTransport, S: WsServerTransport>(
        config: &MonitorConfig,
        client_transport: C,
        server_transport: S,
    ) -> Result<Self, MonitorError> {
        info!("configuring the transport network monitor");

        // Sanity checks.
        if !config.ca_cert_path.exists() {
            error!(path = %config.ca_cert_path.display(), "CA certificate file not found");
            return Err(MonitorError::MissingCaCertFile);
        }
        if let Some(path) = &config.network_layout_path {
            if !path.exists() {
                error!(path = %path.display(), "network layout file not found");
                return Err(MonitorError::MissingNetworkLayoutFile);
            }
        }

        // Obtain and parse the layout, then build the network.
        let layout_path = match &config.network_layout_path {
            Some(path) => path.clone(),
            None => {
                let destination = std::env::temp_dir().join("network-layout.json");
                let url = format!("https://{}{}", config.server_url, LAYOUT_ENDPOINT);
                layout::download_file(&url, &destination, &config.ca_cert_path)
                    .await
                    .map_err(|error| {
                        error!(%error, "could not download the network layout");
                        MonitorError::FailedNetworkLayoutFileDownload
                    })?;
                destination
            }
        };
        info!(path = %layout_path.display(), "loading the network layout");
        let layout_text = std::fs::read_to_string(&layout_path).map_err(|error| {
            error!(%error, "could not read the network layout");
            MonitorError::FailedNetworkLayoutFileParsing
        })?;
        let layout = serde_json::from_str(&layout_text).map_err(|error| {
            error!(%error, "could not parse the network layout");
            MonitorError::FailedNetworkLayoutFileParsing
        })?;
        let network = TransportNetwork::from_layout(&layout).map_err(|error| {
            error!(%error, "could not construct the transport network");
            MonitorError::FailedTransportNetworkConstruction
        })?;

        let state: SharedState = Arc::new(Mutex::new(MonitorState {
            network,
            params: QuietRouteParams {
                max_slowdown_pc: config.max_slowdown_pc,
                min_quietness_pc: config.min_quietness_pc,
                max_n_paths: config.max_n_paths,
            },
            last_error: MonitorError::Ok,
            last_travel_route: TravelRoute::default(),
            connected_clients: HashSet::new(),
        }));

        // Quiet-route server. The handlers need the server handle, which
        // exists only after run; they fetch it from the slot.
        info!(
            host = %config.quiet_route_host,
            port = config.quiet_route_port,
            "binding the quiet-route server"
        );
        let server_slot: ServerSlot = Arc::default();
        let server = StompServer::run(
            server_transport,
            config.quiet_route_host.clone(),
            server_handlers(&state, &server_slot),
        )
        .await
        .map_err(|error| {
            error!(%error, "could not start the STOMP server");
            MonitorError::CouldNotStartStompServer
        })?;
        *server_slot.lock().expect("server slot lock") = Some(server.clone());

        // Upstream feed client. The connect command queues here and is
        // processed once the monitor runs.
        info!(
            url = %config.server_url,
            port = %config.server_port,
            "wiring the network-events client"
        );
        let client = StompClient::new(client_transport, config.server_url.clone());
        client.connect(
            config.username.clone(),
            config.password.clone(),
            on_feed_connect(&state, &client, &server),
            None,
            on_feed_disconnect(&state),
        );

        info!("monitor configured");
        Ok(TransitMonitor {
            state,
            client,
            server,
            stop: Arc::new(Notify::new()),
        })
    }

    /// Run until [`TransitMonitor::stop`] is called.
    pub async fn run(&self) {
        info!("monitor running");
        self.start_sessions();
        self.stop.notified().await;
    }

    /// Run for a bounded duration.
    ///
    /// The sessions keep their tasks after the duration elapses; only
    /// [`TransitMonitor::stop`] tears them down.
    pub async fn run_for(&self, duration: Duration) {
        info!(?duration, "monitor running");
        self.start_sessions();
        tokio::time::sleep(duration).await;
    }

    /// Release the session I/O tasks: the feed client processes its
    /// queued connect, the quiet-route server begins accepting.
    fn start_sessions(&self) {
        self.client.start();
        self.server.start();
    }

    /// Cancel outstanding work: close the feed client and stop the
    /// quiet-route server. The last error code is left untouched so the
    /// caller can still inspect it.
    pub fn stop(&self) {
        info!("monitor stopping");
        self.client.close(None);
        self.server.stop();
        self.stop.notify_waiters();
    }

    /// The most recent monitor-level result code.
    pub fn last_error(&self) -> MonitorError {
        self.state.lock().expect("monitor state lock").last_error
    }

    /// The most recent quiet-route response, if any was computed.
    pub fn last_travel_route(&self) -> TravelRoute {
        self.state
            .lock()
            .expect("monitor state lock")
            .last_travel_route
            .clone()
    }

    /// The ids of the currently connected quiet-route clients.
    pub fn connected_clients(&self) -> HashSet<String> {
        self.state
            .lock()
            .expect("monitor state lock")
            .connected_clients
            .clone()
    }

    /// Inspect the network representation.
    pub fn with_network<R>(&self, inspect: impl FnOnce(&TransportNetwork) -> R) -> R {
        inspect(&self.state.lock().expect("monitor state lock").network)
    }

    /// Pre-seed the network crowding, e.g. for tests: each entry is
    /// applied as that many In (positive) or Out (negative) events.
    pub fn set_network_crowding(&self, counts: &HashMap<String, i64>) {
        let mut state = self.state.lock().expect("monitor state lock");
        for (station_id, count) in counts {
            let kind = if *count > 0 {
                PassengerEventKind::In
            } else {
                PassengerEventKind::Out
            };
            for _ in 0..count.unsigned_abs() {
                let _ = state.network.record_passenger_event(&PassengerEvent {
                    station_id: station_id.clone(),
                    passenger_event: kind,
                    datetime: chrono::Utc::now(),
                });
            }
        }
    }
}

fn set_error(state: &SharedState, error: MonitorError) {
    state.lock().expect("monitor state lock").last_error = error;
}

// ---------------------------------------------------------------------------
// Feed-side callbacks
// ---------------------------------------------------------------------------

fn on_feed_connect(
    state: &SharedState,
    client: &StompClient,
    server: &StompServer,
) -> Box<dyn FnMut(StompClientError) + Send> {
    let state = state.clone();
    let client = client.clone();
    let server = server.clone();
    Box::new(move |ec| {
        if !ec.is_ok() {
            error!(%ec, "STOMP client connection failed");
            set_error(&state, MonitorError::CouldNotConnectToStompClient);
            client.close(None);
            server.stop();
            return;
        }
        info!(destination = PASSENGERS_DESTINATION, "STOMP client connected; subscribing");
        let id = client.subscribe(
            PASSENGERS_DESTINATION,
            on_feed_subscribe(&state),
            on_feed_message(&state),
        );
        if id.is_empty() {
            error!("STOMP client subscription failed");
            set_error(&state, MonitorError::CouldNotSubscribeToPassengerEvents);
            client.close(None);
            server.stop();
        }
    })
}

fn on_feed_subscribe(state: &SharedState) -> SubscribeHandler {
    let state = state.clone();
    Box::new(move |ec, id| {
        if ec.is_ok() {
            info!(%id, "subscribed to passenger events");
            set_error(&state, MonitorError::Ok);
        } else {
            error!(%ec, "unable to subscribe to passenger events");
            set_error(&state, MonitorError::CouldNotSubscribeToPassengerEvents);
        }
    })
}

fn on_feed_message(state: &SharedState) -> MessageHandler {
    let state = state.clone();
    Box::new(move |_ec, body| {
        let event: PassengerEvent = match serde_json::from_str(&body) {
            Ok(event) => event,
            Err(error) => {
                error!(%error, %body, "could not parse passenger event");
                set_error(&state, MonitorError::CouldNotParsePassengerEvent);
                return;
            }
        };
        debug!(station_id = %event.station_id, "passenger event");
        let mut state = state.lock().expect("monitor state lock");
        match state.network.record_passenger_event(&event) {
            Ok(()) => state.last_error = MonitorError::Ok,
            Err(error) => {
                error!(%error, "could not record passenger event");
                state.last_error = MonitorError::CouldNotRecordPassengerEvent;
            }
        }
    })
}

fn on_feed_disconnect(state: &SharedState) -> Box<dyn FnMut(StompClientError) + Send> {
    let state = state.clone();
    Box::new(move |ec| {
        error!(%ec, "STOMP client disconnected");
        set_error(&state, MonitorError::StompClientDisconnected);
    })
}

// ---------------------------------------------------------------------------
// Quiet-route-side callbacks
// ---------------------------------------------------------------------------

fn server_handlers(state: &SharedState, slot: &ServerSlot) -> ServerHandlers {
    let connect_state = state.clone();
    let message_state = state.clone();
    let message_slot = slot.clone();
    let disconnect_state = state.clone();
    let server_state = state.clone();
    ServerHandlers {
        on_client_connect: Box::new(move |ec, id| {
            if ec.is_ok() {
                info!(connection_id = %id, "client connected to quiet-route");
                let mut state = connect_state.lock().expect("monitor state lock");
                state.connected_clients.insert(id);
                state.last_error = MonitorError::Ok;
            }
        }),
        on_client_message: Box::new(move |_ec, message| {
            handle_quiet_route_request(&message_state, &message_slot, message);
        }),
        on_client_disconnect: Box::new(move |_ec, id| {
            info!(connection_id = %id, "client disconnected from quiet-route");
            let mut state = disconnect_state.lock().expect("monitor state lock");
            state.connected_clients.remove(&id);
            state.last_error = MonitorError::StompServerClientDisconnected;
        }),
        on_server_disconnect: Box::new(move |ec| {
            error!(%ec, "quiet-route server disconnected");
            set_error(&server_state, MonitorError::StompServerDisconnected);
        }),
    }
}

fn handle_quiet_route_request(state: &SharedState, slot: &ServerSlot, message: ClientMessage) {
    let Some(server) = slot.lock().expect("server slot lock").clone() else {
        error!("quiet-route server handle not ready; dropping request");
        return;
    };
    let connection_id = message.connection_id;

    if message.destination != QUIET_ROUTE_DESTINATION {
        error!(
            connection_id = %connection_id,
            destination = %message.destination,
            "unsupported destination"
        );
        server.close(&connection_id, None);
        state
            .lock()
            .expect("monitor state lock")
            .connected_clients
            .remove(&connection_id);
        return;
    }

    info!(connection_id = %connection_id, "new quiet-route request");
    let request: QuietRouteRequest = match serde_json::from_str(&message.body) {
        Ok(request) => request,
        Err(error) => {
            error!(%error, body = %message.body, "could not parse quiet-route request");
            let mut state = state.lock().expect("monitor state lock");
            state.last_error = MonitorError::CouldNotParseQuietRouteRequest;
            state.connected_clients.remove(&connection_id);
            drop(state);
            server.close(&connection_id, None);
            return;
        }
    };

    let (route, body) = {
        let state = state.lock().expect("monitor state lock");
        let route = state.network.quiet_travel_route(
            &request.start_station_id,
            &request.end_station_id,
            &state.params,
        );
        let body = serde_json::to_string(&route).unwrap_or_default();
        (route, body)
    };
    server.send(
        &connection_id,
        QUIET_ROUTE_DESTINATION,
        body,
        None,
        Some(message.request_id),
    );
    let mut state = state.lock().expect("monitor state lock");
    state.last_error = MonitorError::Ok;
    state.last_travel_route = route;
}
