use super::accumulation::{build_accumulation, AggregatedGrad};
use super::aggregation::{aggregate_dense, aggregate_sparse};
use super::barrier::{build_finish_op, build_queue_ops, widen_for_global_step, BarrierRole, BarrierSpec};
use super::gradient::{Gradient, GradientSpec};
use super::placement::{PsGradientTaskAssigner, TaskAssignment, TaskSlot};
use super::replicator::{MirrorVars, VariableReplicator};
use super::{Synchronizer, REDUCE_TO_DEVICE, UPDATE_OP_VAR_POS};
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::graph::{replica_prefix, DeviceSpec, Graph, OpId};
use crate::registry::TrainableRegistry;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Synchronous parameter-server synchronizer.
///
/// The per-variable maps accumulate over every call so that
/// [`PsSynchronizer::place_post_grad_agg_ops`] can place all values in one traversal.
#[derive(Debug, Clone)]
pub struct PsSynchronizer {
    num_replicas: usize,
    num_workers: usize,
    worker_id: usize,
    worker_device: DeviceSpec,
    worker_cpu: DeviceSpec,
    target_device: DeviceSpec,
    local_replication: bool,
    var_op_to_agg_grad: BTreeMap<OpId, AggregatedGrad>,
    var_op_to_accum_apply_op: BTreeMap<OpId, OpId>,
    var_op_to_update_op: BTreeMap<OpId, OpId>,
}

impl PsSynchronizer {
    pub fn new(config: &SyncConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            num_replicas: config.num_replicas,
            num_workers: config.num_workers,
            worker_id: config.worker_id,
            worker_device: config.worker_device()?,
            worker_cpu: config.worker_cpu()?,
            target_device: config.target_device()?,
            local_replication: config.local_replication,
            var_op_to_agg_grad: BTreeMap::new(),
            var_op_to_accum_apply_op: BTreeMap::new(),
            var_op_to_update_op: BTreeMap::new(),
        })
    }

    pub fn role(&self) -> BarrierRole {
        BarrierRole::for_worker(self.worker_id)
    }

    /// The accumulator take feeding `var`'s update.
    pub fn agg_grad(&self, var: OpId) -> Option<&AggregatedGrad> {
        self.var_op_to_agg_grad.get(&var)
    }

    pub fn accum_apply_op(&self, var: OpId) -> Option<OpId> {
        self.var_op_to_accum_apply_op.get(&var).copied()
    }

    pub fn update_op(&self, var: OpId) -> Option<OpId> {
        self.var_op_to_update_op.get(&var).copied()
    }

    /// Wraps `update_op` in the chief/worker barrier and returns the finish op that now
    /// stands in for the update as a control dependency.
    pub fn add_sync_op(
        &mut self,
        graph: &mut Graph,
        registry: &TrainableRegistry,
        update_op: OpId,
        mirrors: Option<&MirrorVars>,
    ) -> Result<OpId> {
        let var_op = graph
            .op(update_op)
            .inputs
            .get(UPDATE_OP_VAR_POS)
            .map(|t| t.op)
            .ok_or_else(|| SyncError::MissingVariableInput(graph.op(update_op).name.clone()))?;
        let is_trainable = registry.is_trainable(var_op);
        let global_step = registry.global_step()?;
        let var_name = graph.op(var_op).name.clone();
        let var_device = graph.device_spec(var_op)?;

        // Snapshot first: the queue ops below become control consumers of the update.
        let control_consumers = graph.control_consumers(update_op);

        let spec = BarrierSpec {
            var_name: &var_name,
            var_device: &var_device,
            update_op,
            role: self.role(),
            worker_id: self.worker_id,
            num_workers: self.num_workers,
            accum_apply_op: if is_trainable {
                self.accum_apply_op(var_op)
            } else {
                None
            },
        };
        let queue_ops = build_queue_ops(graph, &spec)?;
        let mut finish = build_finish_op(graph, &spec, &queue_ops, mirrors, &self.worker_cpu)?;

        if global_step == Some(var_op) && spec.role == BarrierRole::Worker {
            // The chief's finish already waits on the update itself.
            finish = widen_for_global_step(graph, &spec, finish)?;
        }

        if is_trainable {
            self.var_op_to_update_op.insert(var_op, update_op);
        }
        graph.update_control_consumers(&control_consumers, update_op, finish);

        info!(
            variable = %var_name,
            role = ?spec.role,
            trainable = is_trainable,
            mirrored = mirrors.is_some(),
            "update barrier inserted"
        );
        Ok(finish)
    }

    /// Pins every aggregated gradient and every trainable update to its variable's task,
    /// then assigns the ops between them.
    pub fn place_post_grad_agg_ops(&self, graph: &mut Graph) -> Result<TaskAssignment> {
        let mut op_to_task = BTreeMap::new();

        let mut agg_grad_ops = Vec::new();
        for (var, agg_grad) in &self.var_op_to_agg_grad {
            let task = graph.device_spec(*var)?.task_or_default();
            for op in agg_grad.ops() {
                agg_grad_ops.push(op);
                op_to_task.insert(op, TaskSlot::Task(task));
            }
        }

        let mut apply_grad_ops = Vec::new();
        for (var, update) in &self.var_op_to_update_op {
            let var_device = graph.op(*var).device.clone();
            let task = DeviceSpec::parse(&var_device)?.task_or_default();
            // colocate the update with its variable
            graph.set_device(*update, var_device);
            apply_grad_ops.push(*update);
            op_to_task.insert(*update, TaskSlot::Task(task));
        }

        PsGradientTaskAssigner::new(
            graph,
            op_to_task,
            agg_grad_ops,
            apply_grad_ops,
            self.target_device.clone(),
        )
        .assign(graph)
    }
}

impl Synchronizer for PsSynchronizer {
    fn in_graph_apply(
        &mut self,
        graph: &mut Graph,
        registry: &TrainableRegistry,
        gradient: &GradientSpec,
        target: OpId,
    ) -> Result<Gradient> {
        let Some(var) = registry.trainable(target) else {
            debug!(
                variable = %graph.op(target).name,
                "not trainable, replica gradients left unaggregated"
            );
            return gradient.resolve(graph, &replica_prefix(0));
        };

        let reduce_to_device = DeviceSpec::parse(REDUCE_TO_DEVICE)?;
        let aggregated = match gradient {
            GradientSpec::Dense(name) => {
                Gradient::Dense(aggregate_dense(graph, name, self.num_replicas, &reduce_to_device)?)
            }
            GradientSpec::Sparse { .. } => Gradient::Sparse(aggregate_sparse(
                graph,
                gradient,
                &var.meta,
                self.num_replicas,
                &reduce_to_device,
            )?),
        };
        info!(
            variable = %var.name,
            replicas = self.num_replicas,
            sparse = aggregated.is_sparse(),
            "replica gradients aggregated"
        );
        Ok(aggregated)
    }

    fn between_graph_apply(
        &mut self,
        graph: &mut Graph,
        registry: &TrainableRegistry,
        update_op: OpId,
        gradient: Option<&Gradient>,
        target: OpId,
        replicator: &dyn VariableReplicator,
    ) -> Result<Option<MirrorVars>> {
        // Only dense trainable variables are mirrored.
        let mirrors = match gradient {
            Some(Gradient::Dense(_)) if self.local_replication && registry.is_trainable(target) => Some(
                replicator.build_mirror_vars(graph, target, &self.worker_device, self.num_replicas)?,
            ),
            _ => None,
        };

        if let Some(gradient) = gradient {
            match registry.trainable(target) {
                Some(var) => {
                    let accumulation = build_accumulation(graph, var, gradient, self.num_workers)?;
                    self.var_op_to_agg_grad.insert(target, accumulation.agg_grad);
                    self.var_op_to_accum_apply_op
                        .insert(target, accumulation.accum_apply_op);
                }
                None => debug!(
                    variable = %graph.op(target).name,
                    "gradient for non-trainable variable, no accumulator inserted"
                ),
            }
        }

        self.add_sync_op(graph, registry, update_op, mirrors.as_ref())?;
        Ok(mirrors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{ConstValue, DType, OpKind, OpSpec, TensorMeta};
    use crate::synchronizer::ResourceVariableReplicator;

    fn config(worker_id: usize) -> SyncConfig {
        SyncConfig {
            num_replicas: 2,
            num_workers: 2,
            worker_id,
            worker_device: format!("/job:worker/task:{worker_id}"),
            reduction_destinations: vec!["/job:ps/task:0/device:CPU:0".to_string()],
            local_replication: false,
        }
    }

    // w (ps task 1), two replica gradients, one update with a control consumer.
    fn graph() -> (Graph, TrainableRegistry, OpId, OpId, OpId) {
        let mut g = Graph::new();
        let w = g
            .add_op(
                OpSpec::new("w", OpKind::Variable)
                    .device("/job:ps/task:1/device:CPU:0")
                    .output(TensorMeta::new(DType::F32, vec![2])),
            )
            .unwrap();
        for i in 0..2 {
            g.add_op(
                OpSpec::new(format!("Replica-{i}/grad"), OpKind::Placeholder)
                    .output(TensorMeta::new(DType::F32, vec![2])),
            )
            .unwrap();
        }
        let lr = g
            .add_op(
                OpSpec::new("lr", OpKind::Const { value: ConstValue::Float(vec![1.0]) })
                    .output(TensorMeta::scalar(DType::F32)),
            )
            .unwrap();
        let grad0 = g.tensor_by_name("Replica-0/grad:0").unwrap();
        let update = g
            .add_op(
                OpSpec::new("update", OpKind::ApplyGradientDescent)
                    .inputs(vec![w.output(0), lr.output(0), grad0]),
            )
            .unwrap();
        let train = g
            .add_op(OpSpec::new("train", OpKind::NoOp).control_inputs(vec![update.id()]))
            .unwrap();
        let mut registry = TrainableRegistry::new();
        registry.register_trainable(&g, "w").unwrap();
        (g, registry, w.id(), update.id(), train.id())
    }

    #[test]
    fn test_chief_rewrite_routes_train_op_through_barrier() {
        let (mut g, registry, w, update, train) = graph();
        let mut sync = PsSynchronizer::new(&config(0)).unwrap();
        let grad = sync
            .in_graph_apply(&mut g, &registry, &GradientSpec::Dense("grad:0".into()), w)
            .unwrap();
        sync.between_graph_apply(&mut g, &registry, update, Some(&grad), w, &ResourceVariableReplicator)
            .unwrap();
        let assignment = sync.place_post_grad_agg_ops(&mut g).unwrap();

        let finish = g.op_by_name("w_update_sync_finish").unwrap();
        assert_eq!(g.op(train).control_inputs, vec![finish]);
        assert_eq!(g.op(update).inputs[2].op, g.op_by_name("w_take_grad").unwrap());
        assert_eq!(g.op(update).device, "/job:ps/task:1/device:CPU:0");
        assert_eq!(assignment[&update], 1);
        assert!(g.contains("w_update_sync_queue_1_enqueue"));
    }

    #[test]
    fn test_worker_dequeues_after_accumulation() {
        let (mut g, registry, w, update, _) = graph();
        let mut sync = PsSynchronizer::new(&config(1)).unwrap();
        let grad = sync
            .in_graph_apply(&mut g, &registry, &GradientSpec::Dense("grad:0".into()), w)
            .unwrap();
        sync.between_graph_apply(&mut g, &registry, update, Some(&grad), w, &ResourceVariableReplicator)
            .unwrap();

        let dequeue = g.op(g.op_by_name("w_update_sync_queue_1_dequeue").unwrap());
        assert_eq!(dequeue.control_inputs, vec![sync.accum_apply_op(w).unwrap()]);
        assert!(!g.contains("w_update_sync_queue_0_enqueue"));
    }

    #[test]
    fn test_update_without_variable_input() {
        let (mut g, registry, ..) = graph();
        let bare = g.add_op(OpSpec::new("bare", OpKind::NoOp)).unwrap().id();
        let mut sync = PsSynchronizer::new(&config(0)).unwrap();
        assert!(matches!(
            sync.add_sync_op(&mut g, &registry, bare, None),
            Err(SyncError::MissingVariableInput(_))
        ));
    }
}
