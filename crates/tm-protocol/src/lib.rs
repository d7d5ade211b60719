// tm-protocol: Transport monitor wire types and serialization.
//
// Everything that crosses a process boundary as JSON lives here: the
// passenger-event feed schema, the quiet-route request/response bodies,
// and the network-layout document.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A station, line, or route ID. Opaque, unique within its namespace.
pub type Id = String;

// ---------------------------------------------------------------------------
// Passenger events (upstream feed)
// ---------------------------------------------------------------------------

/// Direction of a passenger event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PassengerEventKind {
    In,
    Out,
}

/// One passenger-count event from the upstream feed.
///
/// ```json
/// { "station_id": "station_42", "passenger_event": "in",
///   "datetime": "2024-03-01T08:15:30.000Z" }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassengerEvent {
    pub station_id: Id,
    pub passenger_event: PassengerEventKind,
    pub datetime: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Quiet-route request/response
// ---------------------------------------------------------------------------

/// Request body accepted on the `/quiet-route` destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuietRouteRequest {
    pub start_station_id: Id,
    pub end_station_id: Id,
}

/// One entry in a travel route.
///
/// Serializes with a `kind` tag:
///
/// ```json
/// { "kind": "stop", "station_id": "station_42" }
/// { "kind": "board", "line_id": "line_1", "route_id": "route_049" }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
#[serde(rename_all = "snake_case")]
pub enum Step {
    /// A visit to a station along the itinerary.
    Stop { station_id: Id },
    /// Board (or change to) the given route before the next stop.
    Board { line_id: Id, route_id: Id },
}

/// A computed itinerary between two stations.
///
/// The all-empty value is the well-defined answer when no path exists or
/// the request was invalid.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TravelRoute {
    pub start_station_id: Id,
    pub end_station_id: Id,
    pub total_travel_time: u32,
    pub steps: Vec<Step>,
}

impl TravelRoute {
    /// Whether this is the empty route (no itinerary found).
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Network layout document
// ---------------------------------------------------------------------------

/// One station record in the layout document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StationRecord {
    pub station_id: Id,
    pub name: String,
}

/// One route record in the layout document.
///
/// A route is one direction of travel along a line: an ordered sequence of
/// at least two distinct stops.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRecord {
    pub route_id: Id,
    pub direction: String,
    pub line_id: Id,
    pub start_station_id: Id,
    pub end_station_id: Id,
    pub route_stops: Vec<Id>,
}

/// One line record in the layout document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineRecord {
    pub line_id: Id,
    pub name: String,
    pub routes: Vec<RouteRecord>,
}

/// One travel-time record in the layout document.
///
/// Travel times are symmetric per adjacency; a single record covers both
/// directions and every route traversing the adjacency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TravelTimeRecord {
    pub start_station_id: Id,
    pub end_station_id: Id,
    pub travel_time: u32,
}

/// The network layout document: the static description of the network the
/// monitor loads at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkLayout {
    pub stations: Vec<StationRecord>,
    pub lines: Vec<LineRecord>,
    pub travel_times: Vec<TravelTimeRecord>,
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passenger_event_parses_feed_schema() {
        let event: PassengerEvent = serde_json::from_str(
            r#"{"station_id": "station_0", "passenger_event": "in",
                "datetime": "2024-03-01T08:15:30.000Z"}"#,
        )
        .unwrap();
        assert_eq!(event.station_id, "station_0");
        assert_eq!(event.passenger_event, PassengerEventKind::In);
        assert_eq!(event.datetime.to_rfc3339(), "2024-03-01T08:15:30+00:00");
    }

    #[test]
    fn passenger_event_rejects_unknown_kind() {
        let result = serde_json::from_str::<PassengerEvent>(
            r#"{"station_id": "station_0", "passenger_event": "sideways",
                "datetime": "2024-03-01T08:15:30.000Z"}"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn step_serializes_with_kind_tag() {
        let stop = serde_json::to_value(Step::Stop {
            station_id: "station_1".to_owned(),
        })
        .unwrap();
        assert_eq!(stop["kind"], "stop");
        assert_eq!(stop["station_id"], "station_1");

        let board = serde_json::to_value(Step::Board {
            line_id: "line_1".to_owned(),
            route_id: "route_049".to_owned(),
        })
        .unwrap();
        assert_eq!(board["kind"], "board");
        assert_eq!(board["route_id"], "route_049");
    }

    #[test]
    fn empty_travel_route_serializes_with_zeroed_fields() {
        let route = TravelRoute::default();
        assert!(route.is_empty());
        let json = serde_json::to_value(&route).unwrap();
        assert_eq!(json["start_station_id"], "");
        assert_eq!(json["total_travel_time"], 0);
        assert_eq!(json["steps"].as_array().unwrap().len(), 0);
    }

    #[test]
    fn layout_document_round_trips() {
        let layout = NetworkLayout {
            stations: vec![
                StationRecord {
                    station_id: "station_0".to_owned(),
                    name: "South Quay".to_owned(),
                },
                StationRecord {
                    station_id: "station_1".to_owned(),
                    name: "North Quay".to_owned(),
                },
            ],
            lines: vec![LineRecord {
                line_id: "line_0".to_owned(),
                name: "Quay Line".to_owned(),
                routes: vec![RouteRecord {
                    route_id: "route_0".to_owned(),
                    direction: "inbound".to_owned(),
                    line_id: "line_0".to_owned(),
                    start_station_id: "station_0".to_owned(),
                    end_station_id: "station_1".to_owned(),
                    route_stops: vec!["station_0".to_owned(), "station_1".to_owned()],
                }],
            }],
            travel_times: vec![TravelTimeRecord {
                start_station_id: "station_0".to_owned(),
                end_station_id: "station_1".to_owned(),
                travel_time: 2,
            }],
        };
        let json = serde_json::to_string(&layout).unwrap();
        let parsed: NetworkLayout = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, layout);
    }
}
