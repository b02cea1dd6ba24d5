//! Breadth-first traversals bounded by a set of end operations.
//!
//! End operations are included in the result but never expanded.

use super::{Graph, OpId};
use std::collections::{HashSet, VecDeque};

/// Every operation reachable from `start` through data inputs.
pub fn ancestors(graph: &Graph, start: &[OpId], end: &HashSet<OpId>) -> HashSet<OpId> {
    bfs(start, end, |id| {
        graph.op(id).inputs.iter().map(|t| t.op).collect()
    })
}

/// Every operation reachable from `start` through data consumers.
pub fn descendants(consumers: &[Vec<OpId>], start: &[OpId], end: &HashSet<OpId>) -> HashSet<OpId> {
    bfs(start, end, |id| consumers[id].clone())
}

fn bfs<F>(start: &[OpId], end: &HashSet<OpId>, mut neighbors: F) -> HashSet<OpId>
where
    F: FnMut(OpId) -> Vec<OpId>,
{
    let mut visited = HashSet::new();
    let mut queue: VecDeque<OpId> = start.iter().copied().collect();
    while let Some(id) = queue.pop_front() {
        if !visited.insert(id) {
            continue;
        }
        if end.contains(&id) {
            continue;
        }
        queue.extend(neighbors(id));
    }
    visited
}
