//! In-memory representation of the transport network.
//!
//! The network is a directed multigraph: stations are nodes, and every
//! adjacent pair of stops on every route contributes one edge labelled with
//! that route. Stations, lines, and routes live in index-keyed arenas so
//! the graph holds no reference cycles and can be traversed without
//! chasing shared pointers.
//!
//! Two query families sit on top of the graph: point lookups (passenger
//! counts, travel times, routes serving a station) and the quiet-route
//! planner, a K-shortest-paths enumeration followed by a crowding-based
//! selection.

mod graph;
mod routing;

pub use graph::{NetworkError, TransportNetwork};
pub use routing::QuietRouteParams;
