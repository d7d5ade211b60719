//! Graph storage and point queries.

use std::collections::HashMap;

use thiserror::Error;
use tm_protocol::{
    Id, LineRecord, NetworkLayout, PassengerEvent, PassengerEventKind, StationRecord,
};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors raised by network construction and queries.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NetworkError {
    #[error("station not found: {0}")]
    StationNotFound(Id),
    #[error("station already in the network: {0}")]
    DuplicateStation(Id),
    #[error("line already in the network: {0}")]
    DuplicateLine(Id),
    #[error("route already in the network: {0}")]
    DuplicateRoute(Id),
    #[error("route {route} references unknown station {station}")]
    UnknownRouteStop { route: Id, station: Id },
    #[error("route {0} must have at least two distinct stops")]
    MalformedRoute(Id),
    #[error("no direct adjacency between {0} and {1}")]
    NoSuchAdjacency(Id, Id),
}

// ---------------------------------------------------------------------------
// Arena records
// ---------------------------------------------------------------------------

pub(crate) type StationIdx = usize;
pub(crate) type LineIdx = usize;
pub(crate) type RouteIdx = usize;

/// A directed edge attached to its "from" station.
#[derive(Debug, Clone, Copy)]
pub(crate) struct GraphEdge {
    pub(crate) route: RouteIdx,
    pub(crate) next_stop: StationIdx,
    pub(crate) travel_time: u32,
}

#[derive(Debug)]
pub(crate) struct StationNode {
    pub(crate) id: Id,
    #[allow(dead_code)]
    pub(crate) name: String,
    pub(crate) passenger_count: i64,
    pub(crate) edges: Vec<GraphEdge>,
}

#[derive(Debug)]
pub(crate) struct RouteEntry {
    pub(crate) id: Id,
    pub(crate) line: LineIdx,
    pub(crate) stops: Vec<StationIdx>,
}

#[derive(Debug)]
pub(crate) struct LineEntry {
    pub(crate) id: Id,
    #[allow(dead_code)]
    pub(crate) name: String,
    pub(crate) routes: Vec<RouteIdx>,
}

// ---------------------------------------------------------------------------
// TransportNetwork
// ---------------------------------------------------------------------------

/// The transport network: stations, lines, routes, travel times, and live
/// passenger counts.
#[derive(Debug, Default)]
pub struct TransportNetwork {
    pub(crate) stations: Vec<StationNode>,
    station_ids: HashMap<Id, StationIdx>,
    pub(crate) lines: Vec<LineEntry>,
    line_ids: HashMap<Id, LineIdx>,
    pub(crate) routes: Vec<RouteEntry>,
    route_ids: HashMap<Id, RouteIdx>,
}

impl TransportNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a network from a layout document: all stations first, then all
    /// lines, then every travel-time record.
    ///
    /// Any failure aborts the whole load; callers never observe a partially
    /// loaded network.
    pub fn from_layout(layout: &NetworkLayout) -> Result<Self, NetworkError> {
        let mut network = Self::new();
        for station in &layout.stations {
            network.add_station(station)?;
        }
        for line in &layout.lines {
            network.add_line(line)?;
        }
        for record in &layout.travel_times {
            network.set_travel_time(
                &record.start_station_id,
                &record.end_station_id,
                record.travel_time,
            )?;
        }
        Ok(network)
    }

    /// Add a station. Fails if the id is already present.
    pub fn add_station(&mut self, station: &StationRecord) -> Result<(), NetworkError> {
        if self.station_ids.contains_key(&station.station_id) {
            return Err(NetworkError::DuplicateStation(station.station_id.clone()));
        }
        let idx = self.stations.len();
        self.stations.push(StationNode {
            id: station.station_id.clone(),
            name: station.name.clone(),
            passenger_count: 0,
            edges: Vec::new(),
        });
        self.station_ids.insert(station.station_id.clone(), idx);
        Ok(())
    }

    /// Add a line and all of its routes.
    ///
    /// All-or-nothing: every route is validated against the current network
    /// before any edge is attached, so a failed insert leaves the graph
    /// untouched.
    pub fn add_line(&mut self, line: &LineRecord) -> Result<(), NetworkError> {
        if self.line_ids.contains_key(&line.line_id) {
            return Err(NetworkError::DuplicateLine(line.line_id.clone()));
        }

        // Validation pass: resolve every stop of every route first.
        let mut resolved: Vec<(Id, Vec<StationIdx>)> = Vec::with_capacity(line.routes.len());
        for route in &line.routes {
            if self.route_ids.contains_key(&route.route_id)
                || resolved.iter().any(|(id, _)| *id == route.route_id)
            {
                return Err(NetworkError::DuplicateRoute(route.route_id.clone()));
            }
            let mut stops = Vec::with_capacity(route.route_stops.len());
            for stop in &route.route_stops {
                let idx = self.station_ids.get(stop).copied().ok_or_else(|| {
                    NetworkError::UnknownRouteStop {
                        route: route.route_id.clone(),
                        station: stop.clone(),
                    }
                })?;
                if stops.contains(&idx) {
                    return Err(NetworkError::MalformedRoute(route.route_id.clone()));
                }
                stops.push(idx);
            }
            if stops.len() < 2 {
                return Err(NetworkError::MalformedRoute(route.route_id.clone()));
            }
            resolved.push((route.route_id.clone(), stops));
        }

        // Mutation pass: attach routes and edges.
        let line_idx = self.lines.len();
        let mut route_idxs = Vec::with_capacity(resolved.len());
        for (route_id, stops) in resolved {
            let route_idx = self.routes.len();
            for pair in stops.windows(2) {
                self.stations[pair[0]].edges.push(GraphEdge {
                    route: route_idx,
                    next_stop: pair[1],
                    travel_time: 0,
                });
            }
            self.route_ids.insert(route_id.clone(), route_idx);
            self.routes.push(RouteEntry {
                id: route_id,
                line: line_idx,
                stops,
            });
            route_idxs.push(route_idx);
        }
        self.line_ids.insert(line.line_id.clone(), line_idx);
        self.lines.push(LineEntry {
            id: line.line_id.clone(),
            name: line.name.clone(),
            routes: route_idxs,
        });
        Ok(())
    }

    /// Record a passenger event at a station.
    pub fn record_passenger_event(&mut self, event: &PassengerEvent) -> Result<(), NetworkError> {
        let idx = self.station_idx(&event.station_id)?;
        match event.passenger_event {
            PassengerEventKind::In => self.stations[idx].passenger_count += 1,
            PassengerEventKind::Out => self.stations[idx].passenger_count -= 1,
        }
        Ok(())
    }

    /// The passenger count currently recorded at a station.
    ///
    /// The count can go negative when recording starts mid-day and more
    /// exits than entries have been observed.
    pub fn passenger_count(&self, station_id: &str) -> Result<i64, NetworkError> {
        let idx = self.station_idx(station_id)?;
        Ok(self.stations[idx].passenger_count)
    }

    /// The routes serving a station, in sorted order.
    ///
    /// A route serves a station when the station appears anywhere in its
    /// stops. Outgoing edges alone miss a route's terminal stop, so a scan
    /// over the routes supplements the edge index. Computed on demand.
    pub fn routes_serving_station(&self, station_id: &str) -> Result<Vec<Id>, NetworkError> {
        let idx = self.station_idx(station_id)?;
        let mut serving: Vec<Id> = self.stations[idx]
            .edges
            .iter()
            .map(|edge| self.routes[edge.route].id.clone())
            .collect();
        for route in &self.routes {
            if route.stops.last() == Some(&idx) {
                serving.push(route.id.clone());
            }
        }
        serving.sort_unstable();
        serving.dedup();
        Ok(serving)
    }

    /// Set the travel time between two directly adjacent stations.
    ///
    /// The time applies to every edge A→B and B→A, across all routes that
    /// traverse the adjacency: it is a property of the station pair, not of
    /// any single route.
    pub fn set_travel_time(
        &mut self,
        station_a: &str,
        station_b: &str,
        travel_time: u32,
    ) -> Result<(), NetworkError> {
        let a = self.station_idx(station_a)?;
        let b = self.station_idx(station_b)?;
        let mut found = false;
        for (from, to) in [(a, b), (b, a)] {
            for edge in &mut self.stations[from].edges {
                if edge.next_stop == to {
                    edge.travel_time = travel_time;
                    found = true;
                }
            }
        }
        if found {
            Ok(())
        } else {
            Err(NetworkError::NoSuchAdjacency(
                station_a.to_owned(),
                station_b.to_owned(),
            ))
        }
    }

    /// The travel time between two directly adjacent stations, in either
    /// direction. 0 when the stations are not adjacent or are the same.
    pub fn travel_time(&self, station_a: &str, station_b: &str) -> u32 {
        let (Ok(a), Ok(b)) = (self.station_idx(station_a), self.station_idx(station_b)) else {
            return 0;
        };
        if a == b {
            return 0;
        }
        for (from, to) in [(a, b), (b, a)] {
            if let Some(edge) = self.stations[from].edges.iter().find(|e| e.next_stop == to) {
                return edge.travel_time;
            }
        }
        0
    }

    /// The cumulative travel time from `station_a` to `station_b` along a
    /// specific route, in route order.
    ///
    /// 0 when either station is absent from the route, when they appear in
    /// the wrong order, or when they are the same station.
    pub fn route_travel_time(
        &self,
        line_id: &str,
        route_id: &str,
        station_a: &str,
        station_b: &str,
    ) -> u32 {
        let Some(route_idx) = self.route_ids.get(route_id).copied() else {
            return 0;
        };
        let route = &self.routes[route_idx];
        if self.lines[route.line].id != line_id {
            return 0;
        }
        let (Ok(a), Ok(b)) = (self.station_idx(station_a), self.station_idx(station_b)) else {
            return 0;
        };
        if a == b {
            return 0;
        }

        let mut total: u32 = 0;
        let mut found_a = false;
        for stop in &route.stops {
            if *stop == a {
                found_a = true;
            }
            if *stop == b {
                return if found_a { total } else { 0 };
            }
            if found_a {
                let Some(edge) = self.stations[*stop]
                    .edges
                    .iter()
                    .find(|edge| edge.route == route_idx)
                else {
                    return 0;
                };
                total += edge.travel_time;
            }
        }
        0
    }

    // -----------------------------------------------------------------------
    // Internal lookups shared with the planner
    // -----------------------------------------------------------------------

    pub(crate) fn station_idx(&self, station_id: &str) -> Result<StationIdx, NetworkError> {
        self.station_ids
            .get(station_id)
            .copied()
            .ok_or_else(|| NetworkError::StationNotFound(station_id.to_owned()))
    }

    pub(crate) fn station_id(&self, idx: StationIdx) -> &str {
        &self.stations[idx].id
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
