//! Quiet-route planning.
//!
//! The planner enumerates up to `max_n_paths` loopless shortest paths by
//! travel time (Yen's algorithm over repeated Dijkstra runs), then picks
//! the path with the best crowding improvement among those within the
//! allowed slowdown over the fastest path.
//!
//! Crowding weight is the sum of `max(0, passenger_count)` over a path's
//! interior stations; the endpoints are excluded. Ties between equal-time
//! paths are broken by lexicographic comparison of the station-id
//! sequences, so results are deterministic for a given network state.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};

use tm_protocol::{Step, TravelRoute};
use tracing::debug;

use crate::graph::{RouteIdx, StationIdx, TransportNetwork};

// ---------------------------------------------------------------------------
// QuietRouteParams
// ---------------------------------------------------------------------------

/// Tuning knobs for the quiet-route planner.
#[derive(Debug, Clone, Copy)]
pub struct QuietRouteParams {
    /// Accept paths up to `fastest * (1 + max_slowdown_pc)` travel time.
    pub max_slowdown_pc: f64,
    /// Minimum crowding improvement over the fastest path required to
    /// divert; below it the fastest path is returned unchanged.
    pub min_quietness_pc: f64,
    /// Upper bound on enumerated paths; the main guard against worst-case
    /// blow-up on dense networks.
    pub max_n_paths: usize,
}

impl Default for QuietRouteParams {
    fn default() -> Self {
        QuietRouteParams {
            max_slowdown_pc: 0.1,
            min_quietness_pc: 0.1,
            max_n_paths: 20,
        }
    }
}

// Slack for the admissibility comparison, so a path exactly on the budget
// boundary is not rejected over float rounding.
const SLOWDOWN_EPSILON: f64 = 1e-9;

type Path = Vec<StationIdx>;

impl TransportNetwork {
    /// Compute a quiet travel route from `start` to `end`.
    ///
    /// Returns the empty [`TravelRoute`] when either station is unknown,
    /// when `start == end`, or when no path exists.
    pub fn quiet_travel_route(
        &self,
        start: &str,
        end: &str,
        params: &QuietRouteParams,
    ) -> TravelRoute {
        let (Ok(source), Ok(target)) = (self.station_idx(start), self.station_idx(end)) else {
            return TravelRoute::default();
        };
        if source == target || params.max_n_paths == 0 {
            return TravelRoute::default();
        }

        let adjacency = self.build_adjacency();
        let paths = self.k_shortest_paths(&adjacency, source, target, params.max_n_paths);
        let Some(fastest) = paths.first() else {
            return TravelRoute::default();
        };

        let fastest_time = path_time(&adjacency, fastest);
        let fastest_crowding = self.path_crowding(fastest);
        let budget =
            fastest_time as f64 * (1.0 + params.max_slowdown_pc) + SLOWDOWN_EPSILON;

        let mut chosen = fastest;
        let mut best_improvement = 0.0_f64;
        for path in &paths {
            if path_time(&adjacency, path) as f64 > budget {
                continue;
            }
            let improvement = (fastest_crowding - self.path_crowding(path)) as f64
                / fastest_crowding.max(1) as f64;
            if improvement > best_improvement {
                best_improvement = improvement;
                chosen = path;
            }
        }
        if best_improvement < params.min_quietness_pc {
            chosen = fastest;
        }
        debug!(
            start,
            end,
            candidates = paths.len(),
            improvement = best_improvement,
            "quiet route selected"
        );

        self.expand_route(chosen, path_time(&adjacency, chosen))
    }

    // -----------------------------------------------------------------------
    // Graph views
    // -----------------------------------------------------------------------

    /// Collapse the multigraph into one (neighbor, time) entry per
    /// adjacency. Parallel edges share the adjacency's travel time, so any
    /// representative works; the minimum keeps the view well defined even
    /// before all times are set.
    fn build_adjacency(&self) -> Vec<Vec<(StationIdx, u32)>> {
        self.stations
            .iter()
            .map(|station| {
                let mut neighbors: Vec<(StationIdx, u32)> = Vec::new();
                for edge in &station.edges {
                    match neighbors.iter_mut().find(|(to, _)| *to == edge.next_stop) {
                        Some((_, time)) => *time = (*time).min(edge.travel_time),
                        None => neighbors.push((edge.next_stop, edge.travel_time)),
                    }
                }
                neighbors.sort_by_key(|(to, _)| *to);
                neighbors
            })
            .collect()
    }

    fn path_crowding(&self, path: &Path) -> i64 {
        path[1..path.len().saturating_sub(1)]
            .iter()
            .map(|idx| self.stations[*idx].passenger_count.max(0))
            .sum()
    }

    // -----------------------------------------------------------------------
    // K shortest paths (Yen)
    // -----------------------------------------------------------------------

    fn k_shortest_paths(
        &self,
        adjacency: &[Vec<(StationIdx, u32)>],
        source: StationIdx,
        target: StationIdx,
        k: usize,
    ) -> Vec<Path> {
        let no_nodes = HashSet::new();
        let no_edges = HashSet::new();
        let Some(first) = self.dijkstra(adjacency, source, target, &no_nodes, &no_edges) else {
            return Vec::new();
        };

        let mut paths: Vec<Path> = vec![first];
        // Candidates found but not yet promoted, as (time, path).
        let mut candidates: Vec<(u64, Path)> = Vec::new();

        while paths.len() < k {
            let previous = paths[paths.len() - 1].clone();
            for spur_pos in 0..previous.len() - 1 {
                let root = &previous[..=spur_pos];
                let spur = previous[spur_pos];

                // Edges leaving the spur node along any already-accepted
                // path with the same root prefix are off limits.
                let mut removed_edges: HashSet<(StationIdx, StationIdx)> = HashSet::new();
                for path in &paths {
                    if path.len() > spur_pos + 1 && path[..=spur_pos] == *root {
                        removed_edges.insert((path[spur_pos], path[spur_pos + 1]));
                    }
                }
                // Root nodes other than the spur node are off limits too,
                // keeping the paths loopless.
                let removed_nodes: HashSet<StationIdx> =
                    root[..spur_pos].iter().copied().collect();

                let Some(spur_path) =
                    self.dijkstra(adjacency, spur, target, &removed_nodes, &removed_edges)
                else {
                    continue;
                };

                let mut candidate = root[..spur_pos].to_vec();
                candidate.extend(spur_path);
                if paths.contains(&candidate)
                    || candidates.iter().any(|(_, path)| *path == candidate)
                {
                    continue;
                }
                let time = path_time(adjacency, &candidate);
                candidates.push((time, candidate));
            }

            // Promote the best candidate: shortest time, then the
            // lexicographically smallest station-id sequence.
            let Some(best_pos) = candidates
                .iter()
                .enumerate()
                .min_by(|(_, (ta, pa)), (_, (tb, pb))| {
                    ta.cmp(tb).then_with(|| self.compare_paths(pa, pb))
                })
                .map(|(pos, _)| pos)
            else {
                break;
            };
            paths.push(candidates.swap_remove(best_pos).1);
        }
        paths
    }

    fn compare_paths(&self, a: &Path, b: &Path) -> std::cmp::Ordering {
        let ids = |path: &Path| -> Vec<&str> {
            path.iter().map(|idx| self.station_id(*idx)).collect()
        };
        ids(a).cmp(&ids(b))
    }

    /// Dijkstra over the collapsed adjacency view, honoring removed nodes
    /// and edges. Equal-distance fronts settle in station-id order, which
    /// keeps the returned path deterministic.
    fn dijkstra(
        &self,
        adjacency: &[Vec<(StationIdx, u32)>],
        source: StationIdx,
        target: StationIdx,
        removed_nodes: &HashSet<StationIdx>,
        removed_edges: &HashSet<(StationIdx, StationIdx)>,
    ) -> Option<Path> {
        let mut dist: Vec<u64> = vec![u64::MAX; adjacency.len()];
        let mut prev: Vec<Option<StationIdx>> = vec![None; adjacency.len()];
        let mut heap: BinaryHeap<Reverse<(u64, &str, StationIdx)>> = BinaryHeap::new();

        dist[source] = 0;
        heap.push(Reverse((0, self.station_id(source), source)));

        while let Some(Reverse((node_dist, _, node))) = heap.pop() {
            if node == target {
                break;
            }
            if node_dist > dist[node] {
                continue;
            }
            for (next, time) in &adjacency[node] {
                if removed_nodes.contains(next) || removed_edges.contains(&(node, *next)) {
                    continue;
                }
                let next_dist = node_dist + u64::from(*time);
                if next_dist < dist[*next] {
                    dist[*next] = next_dist;
                    prev[*next] = Some(node);
                    heap.push(Reverse((next_dist, self.station_id(*next), *next)));
                }
            }
        }

        if dist[target] == u64::MAX {
            return None;
        }
        let mut path = vec![target];
        let mut node = target;
        while let Some(parent) = prev[node] {
            path.push(parent);
            node = parent;
        }
        path.reverse();
        (path[0] == source).then_some(path)
    }

    // -----------------------------------------------------------------------
    // Step expansion
    // -----------------------------------------------------------------------

    /// Annotate each hop with a concrete route and expand the path into
    /// steps. The annotation stays on the current route while it still
    /// serves the next hop, otherwise it boards the lexicographically
    /// smallest route that does; every route change emits a board marker
    /// before the next stop.
    fn expand_route(&self, path: &Path, total_time: u64) -> TravelRoute {
        let mut steps = Vec::with_capacity(path.len() * 2);
        steps.push(Step::Stop {
            station_id: self.station_id(path[0]).to_owned(),
        });

        let mut current: Option<RouteIdx> = None;
        for pair in path.windows(2) {
            let chosen = self.pick_hop_route(pair[0], pair[1], current);
            if current != Some(chosen) {
                steps.push(Step::Board {
                    line_id: self.lines[self.routes[chosen].line].id.clone(),
                    route_id: self.routes[chosen].id.clone(),
                });
                current = Some(chosen);
            }
            steps.push(Step::Stop {
                station_id: self.station_id(pair[1]).to_owned(),
            });
        }

        TravelRoute {
            start_station_id: self.station_id(path[0]).to_owned(),
            end_station_id: self.station_id(path[path.len() - 1]).to_owned(),
            total_travel_time: u32::try_from(total_time).unwrap_or(u32::MAX),
            steps,
        }
    }

    fn pick_hop_route(
        &self,
        from: StationIdx,
        to: StationIdx,
        current: Option<RouteIdx>,
    ) -> RouteIdx {
        let serving = self.stations[from]
            .edges
            .iter()
            .filter(|edge| edge.next_stop == to)
            .map(|edge| edge.route);
        if let Some(current) = current {
            if serving.clone().any(|route| route == current) {
                return current;
            }
        }
        serving
            .min_by_key(|route| &self.routes[*route].id)
            .expect("hop taken from a path must have a serving edge")
    }
}

fn path_time(adjacency: &[Vec<(StationIdx, u32)>], path: &[StationIdx]) -> u64 {
    path.windows(2)
        .map(|pair| {
            adjacency[pair[0]]
                .iter()
                .find(|(to, _)| *to == pair[1])
                .map_or(0, |(_, time)| u64::from(*time))
        })
        .sum()
}
