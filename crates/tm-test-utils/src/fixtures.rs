// fixtures: Canned frames and layout documents shared across tests.

use stomp_core::{StompCommand, StompFrame, StompHeader};

/// A client handshake frame for the given host.
pub fn stomp_frame(host: &str) -> String {
    frame(
        StompCommand::Stomp,
        &[
            (StompHeader::AcceptVersion, "1.2"),
            (StompHeader::Host, host),
        ],
        "",
    )
}

/// A SEND frame carrying a request id, as a downstream client would emit.
pub fn send_frame(request_id: &str, destination: &str, body: &str) -> String {
    let content_length = body.len().to_string();
    frame(
        StompCommand::Send,
        &[
            (StompHeader::Id, request_id),
            (StompHeader::Destination, destination),
            (StompHeader::ContentType, "application/json"),
            (StompHeader::ContentLength, &content_length),
        ],
        body,
    )
}

/// A CONNECTED frame with the given session id.
pub fn connected_frame(session: &str) -> String {
    frame(
        StompCommand::Connected,
        &[
            (StompHeader::Version, "1.2"),
            (StompHeader::Session, session),
        ],
        "",
    )
}

/// A RECEIPT frame acknowledging the given receipt id.
pub fn receipt_frame(receipt_id: &str) -> String {
    frame(
        StompCommand::Receipt,
        &[(StompHeader::ReceiptId, receipt_id)],
        "",
    )
}

/// A MESSAGE frame delivered on a subscription.
pub fn message_frame(subscription: &str, destination: &str, body: &str) -> String {
    frame(
        StompCommand::Message,
        &[
            (StompHeader::Subscription, subscription),
            (StompHeader::MessageId, "msg-0"),
            (StompHeader::Destination, destination),
            (StompHeader::ContentType, "application/json"),
        ],
        body,
    )
}

/// An ERROR frame with a plain-text reason.
pub fn error_frame(reason: &str) -> String {
    frame(
        StompCommand::Error,
        &[(StompHeader::ContentType, "text/plain")],
        reason,
    )
}

fn frame(command: StompCommand, headers: &[(StompHeader, &str)], body: &str) -> String {
    StompFrame::from_components(command, headers, body)
        .expect("fixture frames are well formed")
        .as_wire()
        .to_owned()
}

/// A small network layout: a fast route with one interior stop, plus a
/// slower two-stop detour between the same endpoints.
///
/// ```text
///   station_0 --1-- station_mid --1-- station_1                  (line_0 / route_0)
///   station_0 --1-- station_2 --1-- station_3 --1-- station_1    (line_1 / route_1)
/// ```
pub fn layout_json() -> &'static str {
    r#"{
        "stations": [
            {"station_id": "station_0", "name": "Alder Green"},
            {"station_id": "station_1", "name": "Birch Cross"},
            {"station_id": "station_2", "name": "Cedar Park"},
            {"station_id": "station_3", "name": "Dane Street"},
            {"station_id": "station_mid", "name": "Mill Lane"}
        ],
        "lines": [
            {
                "line_id": "line_0",
                "name": "Fast Line",
                "routes": [{
                    "route_id": "route_0",
                    "direction": "outbound",
                    "line_id": "line_0",
                    "start_station_id": "station_0",
                    "end_station_id": "station_1",
                    "route_stops": ["station_0", "station_mid", "station_1"]
                }]
            },
            {
                "line_id": "line_1",
                "name": "Loop Line",
                "routes": [{
                    "route_id": "route_1",
                    "direction": "outbound",
                    "line_id": "line_1",
                    "start_station_id": "station_0",
                    "end_station_id": "station_1",
                    "route_stops": ["station_0", "station_2", "station_3", "station_1"]
                }]
            }
        ],
        "travel_times": [
            {"start_station_id": "station_0", "end_station_id": "station_mid", "travel_time": 1},
            {"start_station_id": "station_mid", "end_station_id": "station_1", "travel_time": 1},
            {"start_station_id": "station_0", "end_station_id": "station_2", "travel_time": 1},
            {"start_station_id": "station_2", "end_station_id": "station_3", "travel_time": 1},
            {"start_station_id": "station_3", "end_station_id": "station_1", "travel_time": 1}
        ]
    }"#
}
