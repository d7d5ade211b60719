//! Monitor orchestration, end to end over mock transports.
//!
//! Each test stands up a full monitor — network loaded from a layout
//! file on disk, STOMP client and server on scripted mock transports —
//! and drives it through feed events and quiet-route requests.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use monitor::monitor::{MonitorError, TransitMonitor};
use monitor::MonitorConfig;
use stomp_core::{StompCommand, StompFrame, StompHeader};
use tempfile::NamedTempFile;
use tm_protocol::{Step, TravelRoute};
use tm_test_utils::{
    layout_json, send_frame, stomp_feed_responder, stomp_frame, MockClientHandle,
    MockClientTransport, MockServerHandle, MockServerTransport,
};

// ---------------------------------------------------------------------------
// Harness helpers
// ---------------------------------------------------------------------------

const USERNAME: &str = "some_username";
const PASSWORD: &str = "some_password_123";

async fn wait_until(mut predicate: impl FnMut() -> bool) {
    for _ in 0..100 {
        if predicate() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 1s");
}

fn temp_file(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("temp file");
    file.write_all(content.as_bytes()).expect("temp file write");
    file
}

fn test_config(ca_cert: &Path, layout: Option<&Path>) -> MonitorConfig {
    MonitorConfig {
        server_url: "transit-feed.example.com".to_owned(),
        server_port: "443".to_owned(),
        username: USERNAME.to_owned(),
        password: PASSWORD.to_owned(),
        ca_cert_path: ca_cert.to_path_buf(),
        network_layout_path: layout.map(Path::to_path_buf),
        quiet_route_host: "localhost".to_owned(),
        quiet_route_ip: "127.0.0.1".to_owned(),
        quiet_route_port: 8042,
        quiet_route_cert_path: PathBuf::from("server-cert.pem"),
        quiet_route_key_path: PathBuf::from("server-key.pem"),
        // The detour in the fixture layout is 3 vs 2 time units, so give
        // the planner headroom to divert.
        max_slowdown_pc: 0.6,
        min_quietness_pc: 0.1,
        max_n_paths: 20,
        run_duration: None,
    }
}

struct Harness {
    monitor: TransitMonitor,
    feed: MockClientHandle,
    quiet_route: MockServerHandle,
    // Keep the fixture files alive for the monitor's lifetime.
    _ca_cert: NamedTempFile,
    _layout: NamedTempFile,
}

/// Configure a monitor over mock transports and wait for the feed
/// subscription to go out.
async fn configured_monitor() -> Harness {
    let ca_cert = temp_file("not really a certificate");
    let layout = temp_file(layout_json());
    let config = test_config(ca_cert.path(), Some(layout.path()));

    let (client_transport, feed) = MockClientTransport::new();
    let client_transport =
        client_transport.with_responder(stomp_feed_responder(USERNAME, PASSWORD));
    let (server_transport, quiet_route) = MockServerTransport::new();

    let monitor = TransitMonitor::configure(&config, client_transport, server_transport)
        .await
        .expect("monitor configures");
    // Nothing runs until the monitor does; the sessions keep processing
    // after run_for returns, so the tests can keep scripting events.
    assert!(feed.sent_frames().is_empty());
    monitor.run_for(Duration::from_millis(1)).await;
    // STOMP handshake, then SUBSCRIBE.
    wait_until(|| feed.sent_frames().len() >= 2).await;

    Harness {
        monitor,
        feed,
        quiet_route,
        _ca_cert: ca_cert,
        _layout: layout,
    }
}

/// The id of the feed subscription, read back from the SUBSCRIBE frame.
fn subscription_id(feed: &MockClientHandle) -> String {
    let frames = feed.sent_frames();
    let frame = StompFrame::parse(frames[1].clone()).expect("subscribe frame");
    assert_eq!(frame.command(), StompCommand::Subscribe);
    frame
        .header_value(StompHeader::Id)
        .expect("subscription id")
        .to_owned()
}

fn passenger_event(station_id: &str, direction: &str) -> String {
    format!(
        r#"{{"station_id": "{station_id}", "passenger_event": "{direction}",
            "datetime": "2024-03-01T08:15:30.000Z"}}"#
    )
}

fn feed_message(feed: &MockClientHandle, body: &str) {
    let id = subscription_id(feed);
    feed.push_message(tm_test_utils::message_frame(&id, "/passengers", body));
}

/// Connect a quiet-route client through the mock server transport.
async fn connect_quiet_route_client(harness: &Harness) {
    harness.quiet_route.connect_client(1);
    harness
        .quiet_route
        .client_message(1, stomp_frame("localhost"));
    wait_until(|| harness.monitor.connected_clients().len() == 1).await;
}

/// The last SEND frame the server pushed to connection 1.
fn last_reply(harness: &Harness) -> StompFrame {
    let frames = harness.quiet_route.sent_to(1);
    let frame = StompFrame::parse(frames.last().expect("a reply").clone()).expect("reply frame");
    assert_eq!(frame.command(), StompCommand::Send);
    frame
}

// ---------------------------------------------------------------------------
// Configure
// ---------------------------------------------------------------------------

#[tokio::test]
async fn configure_rejects_a_missing_ca_certificate() {
    let layout = temp_file(layout_json());
    let config = test_config(Path::new("/nonexistent/cacert.pem"), Some(layout.path()));
    let (client_transport, _feed) = MockClientTransport::new();
    let (server_transport, _quiet_route) = MockServerTransport::new();
    let result = TransitMonitor::configure(&config, client_transport, server_transport).await;
    assert!(matches!(result.map(|_| ()), Err(MonitorError::MissingCaCertFile)));
}

#[tokio::test]
async fn configure_rejects_a_missing_layout_file() {
    let ca_cert = temp_file("not really a certificate");
    let config = test_config(ca_cert.path(), Some(Path::new("/nonexistent/layout.json")));
    let (client_transport, _feed) = MockClientTransport::new();
    let (server_transport, _quiet_route) = MockServerTransport::new();
    let result = TransitMonitor::configure(&config, client_transport, server_transport).await;
    assert!(matches!(
        result.map(|_| ()),
        Err(MonitorError::MissingNetworkLayoutFile)
    ));
}

#[tokio::test]
async fn configure_rejects_an_unparsable_layout() {
    let ca_cert = temp_file("not really a certificate");
    let layout = temp_file("{ not json ]");
    let config = test_config(ca_cert.path(), Some(layout.path()));
    let (client_transport, _feed) = MockClientTransport::new();
    let (server_transport, _quiet_route) = MockServerTransport::new();
    let result = TransitMonitor::configure(&config, client_transport, server_transport).await;
    assert!(matches!(
        result.map(|_| ()),
        Err(MonitorError::FailedNetworkLayoutFileParsing)
    ));
}

#[tokio::test]
async fn a_feed_connect_failure_stops_both_sessions() {
    let ca_cert = temp_file("not really a certificate");
    let layout = temp_file(layout_json());
    let config = test_config(ca_cert.path(), Some(layout.path()));

    let (client_transport, _feed) = MockClientTransport::new();
    let client_transport = client_transport
        .with_connect_error(stomp_session::TransportError::Connect("refused".to_owned()));
    let (server_transport, quiet_route) = MockServerTransport::new();

    let monitor = TransitMonitor::configure(&config, client_transport, server_transport)
        .await
        .expect("monitor configures");
    monitor.run_for(Duration::from_millis(1)).await;
    wait_until(|| quiet_route.is_stopped()).await;
    assert_eq!(
        monitor.last_error(),
        MonitorError::CouldNotConnectToStompClient
    );
}

// ---------------------------------------------------------------------------
// Feed ingestion
// ---------------------------------------------------------------------------

#[tokio::test]
async fn the_feed_handshake_subscribes_to_passengers() {
    let harness = configured_monitor().await;

    let frames = harness.feed.sent_frames();
    let handshake = StompFrame::parse(frames[0].clone()).unwrap();
    assert_eq!(handshake.command(), StompCommand::Stomp);
    assert_eq!(handshake.header_value(StompHeader::Login), Some(USERNAME));

    let subscribe = StompFrame::parse(frames[1].clone()).unwrap();
    assert_eq!(
        subscribe.header_value(StompHeader::Destination),
        Some("/passengers")
    );
    wait_until(|| harness.monitor.last_error() == MonitorError::Ok).await;
}

#[tokio::test]
async fn passenger_events_update_the_network() {
    let harness = configured_monitor().await;

    feed_message(&harness.feed, &passenger_event("station_mid", "in"));
    feed_message(&harness.feed, &passenger_event("station_mid", "in"));
    feed_message(&harness.feed, &passenger_event("station_2", "out"));

    wait_until(|| {
        harness
            .monitor
            .with_network(|network| network.passenger_count("station_mid") == Ok(2))
    })
    .await;
    assert_eq!(
        harness
            .monitor
            .with_network(|network| network.passenger_count("station_2")),
        Ok(-1)
    );
}

#[tokio::test]
async fn a_malformed_event_is_recorded_and_skipped() {
    let harness = configured_monitor().await;

    feed_message(&harness.feed, "not json at all");
    wait_until(|| harness.monitor.last_error() == MonitorError::CouldNotParsePassengerEvent).await;

    // The monitor keeps going: later events still apply.
    feed_message(&harness.feed, &passenger_event("station_mid", "in"));
    wait_until(|| {
        harness
            .monitor
            .with_network(|network| network.passenger_count("station_mid") == Ok(1))
    })
    .await;
}

#[tokio::test]
async fn an_event_for_an_unknown_station_is_recorded_and_skipped() {
    let harness = configured_monitor().await;

    feed_message(&harness.feed, &passenger_event("station_ghost", "in"));
    wait_until(|| harness.monitor.last_error() == MonitorError::CouldNotRecordPassengerEvent)
        .await;
}

#[tokio::test]
async fn a_feed_drop_records_a_terminal_error() {
    let harness = configured_monitor().await;

    harness.feed.push_disconnect(false);
    wait_until(|| harness.monitor.last_error() == MonitorError::StompClientDisconnected).await;
}

// ---------------------------------------------------------------------------
// Quiet-route service
// ---------------------------------------------------------------------------

#[tokio::test]
async fn a_quiet_route_request_gets_a_correlated_reply() {
    let harness = configured_monitor().await;
    connect_quiet_route_client(&harness).await;

    harness.quiet_route.client_message(
        1,
        send_frame(
            "req0",
            "/quiet-route",
            r#"{"start_station_id": "station_0", "end_station_id": "station_1"}"#,
        ),
    );
    wait_until(|| harness.quiet_route.sent_to(1).len() >= 2).await;

    let reply = last_reply(&harness);
    assert_eq!(reply.header_value(StompHeader::Id), Some("req0"));
    assert_eq!(
        reply.header_value(StompHeader::Destination),
        Some("/quiet-route")
    );
    let route: TravelRoute = serde_json::from_str(reply.body()).expect("travel route body");
    assert_eq!(route.start_station_id, "station_0");
    assert_eq!(route.end_station_id, "station_1");
    assert_eq!(route.total_travel_time, 2);
    assert_eq!(
        route.steps,
        vec![
            Step::Stop { station_id: "station_0".to_owned() },
            Step::Board { line_id: "line_0".to_owned(), route_id: "route_0".to_owned() },
            Step::Stop { station_id: "station_mid".to_owned() },
            Step::Stop { station_id: "station_1".to_owned() },
        ]
    );
    assert_eq!(harness.monitor.last_travel_route(), route);
}

#[tokio::test]
async fn crowding_on_the_fast_route_diverts_the_itinerary() {
    let harness = configured_monitor().await;
    harness
        .monitor
        .set_network_crowding(&HashMap::from([("station_mid".to_owned(), 10)]));
    connect_quiet_route_client(&harness).await;

    harness.quiet_route.client_message(
        1,
        send_frame(
            "req1",
            "/quiet-route",
            r#"{"start_station_id": "station_0", "end_station_id": "station_1"}"#,
        ),
    );
    wait_until(|| harness.quiet_route.sent_to(1).len() >= 2).await;

    let route: TravelRoute =
        serde_json::from_str(last_reply(&harness).body()).expect("travel route body");
    assert_eq!(route.total_travel_time, 3);
    assert!(route.steps.contains(&Step::Stop {
        station_id: "station_2".to_owned()
    }));
}

#[tokio::test]
async fn unknown_stations_yield_the_empty_route() {
    let harness = configured_monitor().await;
    connect_quiet_route_client(&harness).await;

    harness.quiet_route.client_message(
        1,
        send_frame(
            "req2",
            "/quiet-route",
            r#"{"start_station_id": "station_0", "end_station_id": "station_xxx"}"#,
        ),
    );
    wait_until(|| harness.quiet_route.sent_to(1).len() >= 2).await;

    let route: TravelRoute =
        serde_json::from_str(last_reply(&harness).body()).expect("travel route body");
    assert!(route.is_empty());
    assert_eq!(route.total_travel_time, 0);
    // The client did nothing wrong: it stays connected.
    assert_eq!(harness.monitor.connected_clients().len(), 1);
}

#[tokio::test]
async fn a_malformed_request_closes_the_client() {
    let harness = configured_monitor().await;
    connect_quiet_route_client(&harness).await;

    harness.quiet_route.client_message(
        1,
        send_frame("req3", "/quiet-route", r#"{"start_station_id": "station_0"}"#),
    );
    wait_until(|| !harness.quiet_route.closed_connections().is_empty()).await;
    assert_eq!(
        harness.monitor.last_error(),
        MonitorError::CouldNotParseQuietRouteRequest
    );
    assert!(harness.monitor.connected_clients().is_empty());
}

#[tokio::test]
async fn an_unsupported_destination_closes_the_client() {
    let harness = configured_monitor().await;
    connect_quiet_route_client(&harness).await;

    harness
        .quiet_route
        .client_message(1, send_frame("req4", "/loud-route", "{}"));
    wait_until(|| !harness.quiet_route.closed_connections().is_empty()).await;
    assert!(harness.monitor.connected_clients().is_empty());
}

#[tokio::test]
async fn stop_halts_the_quiet_route_server() {
    let harness = configured_monitor().await;
    connect_quiet_route_client(&harness).await;

    harness.monitor.stop();
    wait_until(|| harness.quiet_route.is_stopped()).await;
    assert!(harness.feed.is_closed());
}
