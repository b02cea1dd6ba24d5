//! Update barrier.
//!
//! For every synchronized variable each worker owns a single-slot token queue. The chief
//! runs the update, then enqueues one token into every other worker's queue; a non-chief
//! worker skips the update and blocks on its own queue instead. Whatever depended on the
//! update op afterwards depends on the barrier's finish op.

use super::replicator::MirrorVars;
use crate::error::Result;
use crate::graph::{ConstValue, DType, DeviceSpec, Graph, OpId, OpKind, OpSpec, TensorMeta};
use serde::{Deserialize, Serialize};

/// Which side of the barrier a worker plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BarrierRole {
    Chief,
    Worker,
}

impl BarrierRole {
    pub fn for_worker(worker_id: usize) -> Self {
        if worker_id == 0 {
            BarrierRole::Chief
        } else {
            BarrierRole::Worker
        }
    }
}

/// Progress of one variable update through the barrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum BarrierState {
    #[default]
    WaitingForLocalUpdate,
    /// Chief only: tokens are being handed out.
    Signaling,
    /// Non-chief only: blocked on the token queue.
    WaitingForToken,
    Done,
}

impl BarrierState {
    pub fn advance(self, role: BarrierRole) -> Self {
        match (self, role) {
            (BarrierState::WaitingForLocalUpdate, BarrierRole::Chief) => BarrierState::Signaling,
            (BarrierState::WaitingForLocalUpdate, BarrierRole::Worker) => BarrierState::WaitingForToken,
            (BarrierState::Signaling, _) | (BarrierState::WaitingForToken, _) => BarrierState::Done,
            (BarrierState::Done, _) => BarrierState::Done,
        }
    }
}

/// Name of worker `index`'s token queue for `var_name`.
pub fn sync_queue_name(var_name: &str, index: usize) -> String {
    format!("{var_name}_update_sync_queue_{index}")
}

/// Inputs of the barrier for one update op.
pub(crate) struct BarrierSpec<'a> {
    pub var_name: &'a str,
    pub var_device: &'a DeviceSpec,
    pub update_op: OpId,
    pub role: BarrierRole,
    pub worker_id: usize,
    pub num_workers: usize,
    /// The accumulator apply op, for trainable values.
    pub accum_apply_op: Option<OpId>,
}

/// Creates the token queues and this worker's enqueue/dequeue ops.
pub(crate) fn build_queue_ops(graph: &mut Graph, spec: &BarrierSpec<'_>) -> Result<Vec<OpId>> {
    let mut queues = Vec::with_capacity(spec.num_workers);
    for i in 0..spec.num_workers {
        let name = sync_queue_name(spec.var_name, i);
        let queue = graph.add_op(
            OpSpec::new(
                name.clone(),
                OpKind::FifoQueue {
                    shared_name: name,
                    capacity: 1,
                    variable: spec.var_name.to_string(),
                },
            )
            .device(spec.var_device)
            .output(TensorMeta::scalar(DType::Resource)),
        )?;
        queues.push(queue);
    }

    let mut queue_ops = Vec::new();
    match spec.role {
        BarrierRole::Chief => {
            let mut deps: Vec<OpId> = spec.accum_apply_op.into_iter().collect();
            deps.push(spec.update_op);
            let token = graph.add_op(
                OpSpec::new(
                    format!("{}_update_sync_token", spec.var_name),
                    OpKind::Const {
                        value: ConstValue::Bool(false),
                    },
                )
                .device(spec.var_device)
                .output(TensorMeta::scalar(DType::Bool)),
            )?;
            for (i, queue) in queues.iter().enumerate() {
                let op = if i != spec.worker_id {
                    graph.add_op(
                        OpSpec::new(format!("{}_enqueue", sync_queue_name(spec.var_name, i)), OpKind::QueueEnqueue)
                            .inputs(vec![queue.output(0), token.output(0)])
                            .control_inputs(deps.clone())
                            .device(spec.var_device),
                    )?
                } else {
                    graph.add_op(
                        OpSpec::new(format!("{}_noop", sync_queue_name(spec.var_name, i)), OpKind::NoOp)
                            .control_inputs(deps.clone())
                            .device(spec.var_device),
                    )?
                };
                queue_ops.push(op.id());
            }
        }
        BarrierRole::Worker => {
            let queue = queues[spec.worker_id];
            let dequeue = graph.add_op(
                OpSpec::new(
                    format!("{}_dequeue", sync_queue_name(spec.var_name, spec.worker_id)),
                    OpKind::QueueDequeue,
                )
                .inputs(vec![queue.output(0)])
                .control_inputs(spec.accum_apply_op.into_iter().collect())
                .device(spec.var_device)
                .output(TensorMeta::scalar(DType::Bool)),
            )?;
            queue_ops.push(dequeue.id());
        }
    }
    Ok(queue_ops)
}

/// Groups the queue ops (or the mirror updates depending on them) into the finish op.
pub(crate) fn build_finish_op(
    graph: &mut Graph,
    spec: &BarrierSpec<'_>,
    queue_ops: &[OpId],
    mirrors: Option<&MirrorVars>,
    worker_cpu: &DeviceSpec,
) -> Result<OpId> {
    let name = format!("{}_update_sync_finish", spec.var_name);
    let finish = match mirrors {
        Some(mirrors) => {
            let updates = mirrors.get_all_update_ops(graph, queue_ops, worker_cpu)?;
            graph.add_op(OpSpec::new(name, OpKind::NoOp).control_inputs(updates).device(worker_cpu))?
        }
        None => graph.add_op(
            OpSpec::new(name, OpKind::NoOp)
                .control_inputs(queue_ops.to_vec())
                .device(spec.var_device),
        )?,
    };
    Ok(finish.id())
}

/// Widens a non-chief's finish condition for the step counter with the update's own inputs
/// and control inputs.
pub(crate) fn widen_for_global_step(
    graph: &mut Graph,
    spec: &BarrierSpec<'_>,
    finish: OpId,
) -> Result<OpId> {
    let update = graph.op(spec.update_op);
    let mut deps = vec![finish];
    deps.extend(update.inputs.iter().map(|t| t.op));
    deps.extend(update.control_inputs.iter().copied());
    let grouped = graph.add_op(
        OpSpec::new(format!("{}_update_sync_finish_step", spec.var_name), OpKind::NoOp)
            .control_inputs(deps)
            .device(spec.var_device),
    )?;
    Ok(grouped.id())
}
