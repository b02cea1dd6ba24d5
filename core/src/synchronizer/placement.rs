//! Parameter-server task assignment for post-aggregation ops.
//!
//! Aggregated gradients (accumulator takes) and variable updates are pinned to the task of
//! their variable. Everything in between inherits a task from its placement references:
//! its inputs on the way forward, its consumers on the way back. Two worklist passes run
//! until every op in the bounded subgraph is assigned; an op whose references span several
//! tasks is marked [`TaskSlot::Shared`] and lands on [`SHARED_TASK_FALLBACK`].

use crate::error::{Result, SyncError};
use crate::graph::traverse::{ancestors, descendants};
use crate::graph::{DeviceSpec, Graph, OpId};
use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use tracing::debug;

/// Task that shared ops are placed on. No balancing is attempted across shared ops.
pub const SHARED_TASK_FALLBACK: u32 = 0;

/// Task assigned to an op during the traversal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TaskSlot {
    Task(u32),
    /// Referenced from more than one task.
    Shared,
}

impl TaskSlot {
    /// The task the op is actually placed on.
    pub fn concrete(self) -> u32 {
        match self {
            TaskSlot::Task(task) => task,
            TaskSlot::Shared => SHARED_TASK_FALLBACK,
        }
    }
}

/// Final placement: every op in the aggregation/update subgraph and its concrete task.
pub type TaskAssignment = BTreeMap<OpId, u32>;

#[derive(Debug, Clone, Copy)]
enum Direction {
    Forward,
    Backward,
}

enum Visit {
    /// A reference has no task yet; retry later.
    Defer,
    Expand(Vec<OpId>),
}

/// Keeps every aggregated gradient on the same task as the update consuming it.
pub struct PsGradientTaskAssigner {
    op_to_task: BTreeMap<OpId, TaskSlot>,
    agg_grad_ops: Vec<OpId>,
    apply_grad_ops: Vec<OpId>,
    ps_device: DeviceSpec,
    consumers: Vec<Vec<OpId>>,
    apply_grad_ancestor_ops: HashSet<OpId>,
    ancestors_diff_descendants: HashSet<OpId>,
}

impl PsGradientTaskAssigner {
    /// `op_to_task` seeds the traversal and must cover every op of `agg_grad_ops` and
    /// `apply_grad_ops`.
    pub fn new(
        graph: &Graph,
        op_to_task: BTreeMap<OpId, TaskSlot>,
        agg_grad_ops: Vec<OpId>,
        apply_grad_ops: Vec<OpId>,
        ps_device: DeviceSpec,
    ) -> Self {
        let consumers = graph.consumer_map();
        let agg_set: HashSet<OpId> = agg_grad_ops.iter().copied().collect();
        let apply_set: HashSet<OpId> = apply_grad_ops.iter().copied().collect();

        let apply_grad_ancestor_ops = ancestors(graph, &apply_grad_ops, &agg_set);
        let agg_grad_descendant_ops = descendants(&consumers, &agg_grad_ops, &apply_set);
        let ancestors_diff_descendants: HashSet<OpId> = apply_grad_ancestor_ops
            .difference(&agg_grad_descendant_ops)
            .copied()
            .collect();

        debug!(
            apply_grad_ancestors = apply_grad_ancestor_ops.len(),
            agg_grad_descendants = agg_grad_descendant_ops.len(),
            ancestors_diff_descendants = ancestors_diff_descendants.len(),
            "placement subgraph bounded"
        );

        Self {
            op_to_task,
            agg_grad_ops,
            apply_grad_ops,
            ps_device,
            consumers,
            apply_grad_ancestor_ops,
            ancestors_diff_descendants,
        }
    }

    /// Traverses from aggregation ops to update ops, then back, setting the device of every
    /// op it assigns.
    pub fn assign(mut self, graph: &mut Graph) -> Result<TaskAssignment> {
        let agg_set: HashSet<OpId> = self.agg_grad_ops.iter().copied().collect();
        let apply_set: HashSet<OpId> = self.apply_grad_ops.iter().copied().collect();

        let agg = self.agg_grad_ops.clone();
        self.run_pass(graph, &agg, &apply_set, Direction::Forward)?;
        let apply = self.apply_grad_ops.clone();
        self.run_pass(graph, &apply, &agg_set, Direction::Backward)?;

        Ok(self
            .op_to_task
            .iter()
            .map(|(op, slot)| (*op, slot.concrete()))
            .collect())
    }

    fn run_pass(
        &mut self,
        graph: &mut Graph,
        start: &[OpId],
        end: &HashSet<OpId>,
        direction: Direction,
    ) -> Result<()> {
        let mut queue: VecDeque<OpId> = start.iter().copied().collect();
        let mut done: HashSet<OpId> = HashSet::new();
        // consecutive deferrals since the last assignment
        let mut stalled = 0usize;

        while let Some(op) = queue.pop_front() {
            if done.contains(&op) {
                continue;
            }
            if end.contains(&op) {
                done.insert(op);
                continue;
            }
            match self.visit(graph, op, direction)? {
                Visit::Defer => {
                    stalled += 1;
                    if stalled > queue.len() {
                        return Err(SyncError::NoPlacementReference {
                            op: graph.op(op).name.clone(),
                        });
                    }
                    queue.push_back(op);
                }
                Visit::Expand(next) => {
                    done.insert(op);
                    stalled = 0;
                    queue.extend(next.into_iter().filter(|n| !done.contains(n)));
                }
            }
        }
        Ok(())
    }

    fn visit(&mut self, graph: &mut Graph, op: OpId, direction: Direction) -> Result<Visit> {
        if self.op_to_task.contains_key(&op) {
            return Ok(Visit::Expand(self.neighbors(graph, op, direction)));
        }

        let refs: BTreeSet<OpId> = match direction {
            Direction::Forward => graph
                .op(op)
                .inputs
                .iter()
                .map(|t| t.op)
                .filter(|r| !self.ancestors_diff_descendants.contains(r))
                .collect(),
            Direction::Backward => self.consumers[op]
                .iter()
                .copied()
                .filter(|c| self.apply_grad_ancestor_ops.contains(c))
                .collect(),
        };
        if refs.iter().any(|r| !self.op_to_task.contains_key(r)) {
            return Ok(Visit::Defer);
        }

        self.assign_task(graph, op, &refs)?;
        Ok(Visit::Expand(self.neighbors(graph, op, direction)))
    }

    fn neighbors(&self, graph: &Graph, op: OpId, direction: Direction) -> Vec<OpId> {
        match direction {
            Direction::Forward => self.consumers[op]
                .iter()
                .copied()
                .filter(|c| self.apply_grad_ancestor_ops.contains(c))
                .collect(),
            Direction::Backward => graph.op(op).inputs.iter().map(|t| t.op).collect(),
        }
    }

    fn assign_task(&mut self, graph: &mut Graph, op: OpId, refs: &BTreeSet<OpId>) -> Result<()> {
        let mut tasks: BTreeSet<TaskSlot> = refs
            .iter()
            .filter_map(|r| self.op_to_task.get(r).copied())
            .collect();

        let slot = match tasks.len() {
            0 => {
                return Err(SyncError::NoPlacementReference {
                    op: graph.op(op).name.clone(),
                })
            }
            1 => tasks.iter().next().copied().unwrap_or(TaskSlot::Shared),
            _ => {
                // an assigned task wins over shared
                tasks.remove(&TaskSlot::Shared);
                match tasks.len() {
                    1 => tasks.iter().next().copied().unwrap_or(TaskSlot::Shared),
                    _ => TaskSlot::Shared,
                }
            }
        };
        self.op_to_task.insert(op, slot);

        let device = self.ps_device.with_task(slot.concrete());
        debug!(op = %graph.op(op).name, ?slot, %device, "post-aggregation op assigned");
        graph.set_device(op, &device);
        Ok(())
    }
}
