//! Quiet-route planner behavior.
//!
//! The fixture network is a diamond: a fast two-hop route through the
//! middle and a slower three-hop route around it, so the planner has a
//! genuine trade to make between travel time and crowding.
//!
//! Crowding convention exercised throughout: the weight of a path is the
//! sum of `max(0, passenger_count)` over its interior stations only —
//! endpoints never count.

use chrono::Utc;
use tm_protocol::{
    LineRecord, PassengerEvent, PassengerEventKind, RouteRecord, StationRecord, Step,
};
use transit_network::{QuietRouteParams, TransportNetwork};

// ---------------------------------------------------------------------------
// Fixture helpers
// ---------------------------------------------------------------------------

fn station(id: &str) -> StationRecord {
    StationRecord {
        station_id: id.to_owned(),
        name: id.to_owned(),
    }
}

fn route(route_id: &str, line_id: &str, stops: &[&str]) -> RouteRecord {
    RouteRecord {
        route_id: route_id.to_owned(),
        direction: "outbound".to_owned(),
        line_id: line_id.to_owned(),
        start_station_id: (*stops.first().unwrap()).to_owned(),
        end_station_id: (*stops.last().unwrap()).to_owned(),
        route_stops: stops.iter().map(|stop| (*stop).to_owned()).collect(),
    }
}

fn line(line_id: &str, routes: Vec<RouteRecord>) -> LineRecord {
    LineRecord {
        line_id: line_id.to_owned(),
        name: line_id.to_owned(),
        routes,
    }
}

fn crowd(network: &mut TransportNetwork, station_id: &str, count: u32) {
    for _ in 0..count {
        network
            .record_passenger_event(&PassengerEvent {
                station_id: station_id.to_owned(),
                passenger_event: PassengerEventKind::In,
                datetime: Utc::now(),
            })
            .unwrap();
    }
}

/// Diamond network:
///
/// ```text
///   start --5-- mid --5-- end          (route_fast, line_a, 10 total)
///   start --3-- alt_1 --4-- alt_2 --4-- end   (route_slow, line_b, 11 total)
/// ```
fn diamond() -> TransportNetwork {
    let mut network = TransportNetwork::new();
    for id in ["station_start", "station_mid", "station_end", "station_alt_1", "station_alt_2"] {
        network.add_station(&station(id)).unwrap();
    }
    network
        .add_line(&line(
            "line_a",
            vec![route(
                "route_fast",
                "line_a",
                &["station_start", "station_mid", "station_end"],
            )],
        ))
        .unwrap();
    network
        .add_line(&line(
            "line_b",
            vec![route(
                "route_slow",
                "line_b",
                &["station_start", "station_alt_1", "station_alt_2", "station_end"],
            )],
        ))
        .unwrap();
    network.set_travel_time("station_start", "station_mid", 5).unwrap();
    network.set_travel_time("station_mid", "station_end", 5).unwrap();
    network.set_travel_time("station_start", "station_alt_1", 3).unwrap();
    network.set_travel_time("station_alt_1", "station_alt_2", 4).unwrap();
    network.set_travel_time("station_alt_2", "station_end", 4).unwrap();
    network
}

fn stop_ids(steps: &[Step]) -> Vec<&str> {
    steps
        .iter()
        .filter_map(|step| match step {
            Step::Stop { station_id } => Some(station_id.as_str()),
            Step::Board { .. } => None,
        })
        .collect()
}

fn boarded_routes(steps: &[Step]) -> Vec<&str> {
    steps
        .iter()
        .filter_map(|step| match step {
            Step::Board { route_id, .. } => Some(route_id.as_str()),
            Step::Stop { .. } => None,
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[test]
fn uncrowded_network_returns_the_fastest_path() {
    let network = diamond();
    let route = network.quiet_travel_route(
        "station_start",
        "station_end",
        &QuietRouteParams::default(),
    );
    assert_eq!(route.start_station_id, "station_start");
    assert_eq!(route.end_station_id, "station_end");
    assert_eq!(route.total_travel_time, 10);
    assert_eq!(
        stop_ids(&route.steps),
        vec!["station_start", "station_mid", "station_end"]
    );
    assert_eq!(boarded_routes(&route.steps), vec!["route_fast"]);
}

#[test]
fn crowding_on_the_fast_path_diverts_within_the_slowdown_budget() {
    let mut network = diamond();
    crowd(&mut network, "station_mid", 10);
    let route = network.quiet_travel_route(
        "station_start",
        "station_end",
        &QuietRouteParams::default(),
    );
    // 11 <= 10 * 1.1, and the alternative drops the whole interior crowding.
    assert_eq!(route.total_travel_time, 11);
    assert_eq!(
        stop_ids(&route.steps),
        vec!["station_start", "station_alt_1", "station_alt_2", "station_end"]
    );
    assert_eq!(boarded_routes(&route.steps), vec!["route_slow"]);
}

#[test]
fn endpoint_crowding_does_not_count() {
    let mut network = diamond();
    // Heavy crowding at both endpoints, none in any interior: every path
    // weighs zero, so the fastest path stands.
    crowd(&mut network, "station_start", 50);
    crowd(&mut network, "station_end", 50);
    let route = network.quiet_travel_route(
        "station_start",
        "station_end",
        &QuietRouteParams::default(),
    );
    assert_eq!(route.total_travel_time, 10);
}

#[test]
fn slowdown_budget_rejects_too_slow_alternatives() {
    let mut network = diamond();
    crowd(&mut network, "station_mid", 10);
    let params = QuietRouteParams {
        max_slowdown_pc: 0.05,
        ..QuietRouteParams::default()
    };
    // 11 > 10 * 1.05: the quiet alternative is out of budget.
    let route = network.quiet_travel_route("station_start", "station_end", &params);
    assert_eq!(route.total_travel_time, 10);
}

#[test]
fn improvement_below_the_quietness_threshold_keeps_the_fastest_path() {
    let mut network = diamond();
    crowd(&mut network, "station_mid", 10);
    crowd(&mut network, "station_alt_1", 5);
    crowd(&mut network, "station_alt_2", 4);
    let params = QuietRouteParams {
        min_quietness_pc: 0.5,
        ..QuietRouteParams::default()
    };
    // Improvement is (10 - 9) / 10 = 0.1 < 0.5.
    let route = network.quiet_travel_route("station_start", "station_end", &params);
    assert_eq!(route.total_travel_time, 10);
}

#[test]
fn negative_counts_clamp_to_zero_in_the_crowding_weight() {
    let mut network = diamond();
    crowd(&mut network, "station_mid", 2);
    // Drive the alternative's interior far below zero; it must weigh 0,
    // not buy extra credit.
    for _ in 0..20 {
        network
            .record_passenger_event(&PassengerEvent {
                station_id: "station_alt_1".to_owned(),
                passenger_event: PassengerEventKind::Out,
                datetime: Utc::now(),
            })
            .unwrap();
    }
    let route = network.quiet_travel_route(
        "station_start",
        "station_end",
        &QuietRouteParams::default(),
    );
    // Improvement (2 - 0) / 2 = 1.0: divert.
    assert_eq!(route.total_travel_time, 11);
}

#[test]
fn single_path_budget_never_diverts() {
    let mut network = diamond();
    crowd(&mut network, "station_mid", 100);
    let params = QuietRouteParams {
        max_n_paths: 1,
        ..QuietRouteParams::default()
    };
    let route = network.quiet_travel_route("station_start", "station_end", &params);
    assert_eq!(route.total_travel_time, 10);
}

#[test]
fn invalid_inputs_return_the_empty_route() {
    let network = diamond();
    let params = QuietRouteParams::default();
    assert!(network
        .quiet_travel_route("station_ghost", "station_end", &params)
        .is_empty());
    assert!(network
        .quiet_travel_route("station_start", "station_ghost", &params)
        .is_empty());
    assert!(network
        .quiet_travel_route("station_start", "station_start", &params)
        .is_empty());
}

#[test]
fn disconnected_stations_return_the_empty_route() {
    let mut network = diamond();
    network.add_station(&station("station_island")).unwrap();
    let route = network.quiet_travel_route(
        "station_start",
        "station_island",
        &QuietRouteParams::default(),
    );
    assert!(route.is_empty());
    assert_eq!(route.total_travel_time, 0);
}

#[test]
fn transfers_emit_board_markers_between_routes() {
    let mut network = TransportNetwork::new();
    for id in ["station_0", "station_1", "station_2"] {
        network.add_station(&station(id)).unwrap();
    }
    network
        .add_line(&line(
            "line_a",
            vec![route("route_a", "line_a", &["station_0", "station_1"])],
        ))
        .unwrap();
    network
        .add_line(&line(
            "line_b",
            vec![route("route_b", "line_b", &["station_1", "station_2"])],
        ))
        .unwrap();
    network.set_travel_time("station_0", "station_1", 2).unwrap();
    network.set_travel_time("station_1", "station_2", 3).unwrap();

    let travel = network.quiet_travel_route(
        "station_0",
        "station_2",
        &QuietRouteParams::default(),
    );
    assert_eq!(travel.total_travel_time, 5);
    assert_eq!(
        travel.steps,
        vec![
            Step::Stop { station_id: "station_0".to_owned() },
            Step::Board { line_id: "line_a".to_owned(), route_id: "route_a".to_owned() },
            Step::Stop { station_id: "station_1".to_owned() },
            Step::Board { line_id: "line_b".to_owned(), route_id: "route_b".to_owned() },
            Step::Stop { station_id: "station_2".to_owned() },
        ]
    );
}

#[test]
fn hop_annotation_prefers_staying_on_the_current_route() {
    // Two routes overlap on the middle leg; the itinerary should not hop
    // between them mid-journey.
    let mut network = TransportNetwork::new();
    for id in ["station_0", "station_1", "station_2", "station_3"] {
        network.add_station(&station(id)).unwrap();
    }
    network
        .add_line(&line(
            "line_a",
            vec![route(
                "route_long",
                "line_a",
                &["station_0", "station_1", "station_2", "station_3"],
            )],
        ))
        .unwrap();
    network
        .add_line(&line(
            "line_b",
            vec![route("route_branch", "line_b", &["station_1", "station_2"])],
        ))
        .unwrap();
    for (a, b, t) in [
        ("station_0", "station_1", 1),
        ("station_1", "station_2", 1),
        ("station_2", "station_3", 1),
    ] {
        network.set_travel_time(a, b, t).unwrap();
    }

    let travel = network.quiet_travel_route(
        "station_0",
        "station_3",
        &QuietRouteParams::default(),
    );
    assert_eq!(boarded_routes(&travel.steps), vec!["route_long"]);
}

#[test]
fn equal_time_paths_resolve_by_station_id_order() {
    // Two parallel middle stations with identical times; the path through
    // the lexicographically smaller station id wins deterministically.
    let mut network = TransportNetwork::new();
    for id in ["station_a", "station_m1", "station_m2", "station_z"] {
        network.add_station(&station(id)).unwrap();
    }
    network
        .add_line(&line(
            "line_a",
            vec![route("route_1", "line_a", &["station_a", "station_m1", "station_z"])],
        ))
        .unwrap();
    network
        .add_line(&line(
            "line_b",
            vec![route("route_2", "line_b", &["station_a", "station_m2", "station_z"])],
        ))
        .unwrap();
    for (a, b) in [
        ("station_a", "station_m1"),
        ("station_m1", "station_z"),
        ("station_a", "station_m2"),
        ("station_m2", "station_z"),
    ] {
        network.set_travel_time(a, b, 4).unwrap();
    }

    let travel = network.quiet_travel_route(
        "station_a",
        "station_z",
        &QuietRouteParams::default(),
    );
    assert_eq!(
        stop_ids(&travel.steps),
        vec!["station_a", "station_m1", "station_z"]
    );
}

#[test]
fn planned_time_matches_the_cumulative_route_time() {
    let network = diamond();
    let travel = network.quiet_travel_route(
        "station_start",
        "station_end",
        &QuietRouteParams::default(),
    );
    assert_eq!(
        travel.total_travel_time,
        network.route_travel_time("line_a", "route_fast", "station_start", "station_end"),
    );
}
