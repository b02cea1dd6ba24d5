//! In-graph (intra-worker) gradient aggregation.
//!
//! Each of the `N` replicas on a worker computes its own copy of a gradient under the
//! replica's name scope. These helpers combine the `N` copies on the worker's reduction
//! device and point the consumers of the replica-0 gradient at the combined result.

use super::gradient::{Gradient, GradientSpec, SparseGradient};
use super::{MAX_STEP, SYNC_PREFIX};
use crate::error::Result;
use crate::graph::{
    parse_tensor_name, prepend_name_scope, replica_prefix, ConstValue, DType, DeviceSpec, Graph,
    OpId, OpKind, OpSpec, Reduction, TensorMeta, TensorRef,
};
use std::collections::HashSet;

/// Consumers of a tensor, captured before any aggregation op is added.
#[derive(Debug, Clone, Default)]
pub(crate) struct ConsumerSnapshot {
    pub data: Vec<OpId>,
    pub control: Vec<OpId>,
}

impl ConsumerSnapshot {
    pub fn of(graph: &Graph, tensor: TensorRef) -> Self {
        Self {
            data: graph.tensor_consumers(tensor),
            control: graph.control_consumers(tensor.op),
        }
    }
}

/// Rewires data consumers of `old` to `new` and control consumers of `old.op` to `new.op`.
pub(crate) fn update_gradient_consumers(
    graph: &mut Graph,
    consumers: &[OpId],
    control_consumers: &[OpId],
    old: TensorRef,
    new: TensorRef,
) {
    graph.update_consumers(consumers, old, new);
    graph.update_control_consumers(control_consumers, old.op, new.op);
}

fn scoped(name: &str, prefix: &str) -> String {
    prepend_name_scope(name, &format!("{SYNC_PREFIX}{prefix}"))
}

fn op_name_of(tensor_name: &str) -> Result<&str> {
    Ok(parse_tensor_name(tensor_name)?.0)
}

/// Replaces the dense gradient named `grad_name` by the average of its `num_replicas` copies.
pub(crate) fn aggregate_dense(
    graph: &mut Graph,
    grad_name: &str,
    num_replicas: usize,
    reduce_to_device: &DeviceSpec,
) -> Result<TensorRef> {
    let spec = GradientSpec::Dense(grad_name.to_string());
    let grads = replica_gradients(graph, &spec, num_replicas)?
        .into_iter()
        .map(|g| g.values())
        .collect::<Vec<_>>();
    let primary = grads[0];
    let snapshot = ConsumerSnapshot::of(graph, primary);

    let grad_op_name = op_name_of(grad_name)?;
    let meta = graph.tensor_meta(primary).clone();
    let sum = graph.add_op(
        OpSpec::new(scoped(grad_op_name, "Add"), OpKind::AddN)
            .inputs(grads)
            .device(reduce_to_device)
            .output(meta.clone()),
    )?;
    let avg_name = scoped(grad_op_name, "Div");
    let divisor = graph.add_op(
        OpSpec::new(
            format!("{avg_name}/divisor"),
            OpKind::Const {
                value: ConstValue::Float(vec![num_replicas as f32]),
            },
        )
        .device(reduce_to_device)
        .output(TensorMeta::scalar(DType::F32)),
    )?;
    let avg = graph.add_op(
        OpSpec::new(avg_name, OpKind::RealDiv)
            .inputs(vec![sum.output(0), divisor.output(0)])
            .device(reduce_to_device)
            .output(meta),
    )?;

    update_gradient_consumers(graph, &snapshot.data, &snapshot.control, primary, avg.output(0));
    Ok(avg.output(0))
}

/// Feeds the `num_replicas` copies of a sparse gradient into one accumulator and exposes
/// the combined result, cast back to the original index and shape dtypes.
pub(crate) fn aggregate_sparse(
    graph: &mut Graph,
    spec: &GradientSpec,
    var_meta: &TensorMeta,
    num_replicas: usize,
    reduce_to_device: &DeviceSpec,
) -> Result<SparseGradient> {
    let grads: Vec<SparseGradient> = replica_gradients(graph, spec, num_replicas)?
        .into_iter()
        .filter_map(|g| match g {
            Gradient::Sparse(s) => Some(s),
            Gradient::Dense(_) => None,
        })
        .collect();
    let primary = grads[0];

    let indices_snapshot = ConsumerSnapshot::of(graph, primary.indices);
    let values_snapshot = ConsumerSnapshot::of(graph, primary.values);
    let shape_consumers = graph.tensor_consumers(primary.dense_shape);

    let values_op_name = op_name_of(spec.values_name())?.to_string();
    let accum_name = scoped(&values_op_name, "Accum");
    let accum = graph.add_op(
        OpSpec::new(
            accum_name.clone(),
            OpKind::SparseConditionalAccumulator {
                shared_name: accum_name.clone(),
                reduction: Reduction::Sum,
            },
        )
        .device(reduce_to_device)
        .output(TensorMeta::new(DType::Resource, var_meta.shape.clone())),
    )?;
    let local_step = graph.add_op(
        OpSpec::new(
            format!("{accum_name}/local_step"),
            OpKind::Const {
                value: ConstValue::Int {
                    dtype: DType::I64,
                    values: vec![MAX_STEP],
                },
            },
        )
        .device(reduce_to_device)
        .output(TensorMeta::scalar(DType::I64)),
    )?;

    let mut apply_ops = Vec::with_capacity(num_replicas);
    for (i, grad) in grads.iter().enumerate() {
        let apply = graph.add_op(
            OpSpec::new(
                prepend_name_scope(&values_op_name, &format!("{}-Accum-Apply", replica_prefix(i))),
                OpKind::SparseAccumulatorApplyGradient,
            )
            .inputs(vec![
                accum.output(0),
                local_step.output(0),
                grad.indices,
                grad.values,
                grad.dense_shape,
            ])
            .device(reduce_to_device),
        )?;
        apply_ops.push(apply.id());
    }

    let take_name = scoped(&values_op_name, "Take-Grad");
    let num_required = graph.add_op(
        OpSpec::new(
            format!("{take_name}/num_required"),
            OpKind::Const {
                value: ConstValue::Int {
                    dtype: DType::I32,
                    values: vec![num_replicas as i64],
                },
            },
        )
        .device(reduce_to_device)
        .output(TensorMeta::scalar(DType::I32)),
    )?;
    let values_meta = graph.tensor_meta(primary.values).clone();
    let take = graph.add_op(
        OpSpec::new(take_name, OpKind::SparseAccumulatorTakeGradient)
            .inputs(vec![accum.output(0), num_required.output(0)])
            .control_inputs(apply_ops)
            .device(reduce_to_device)
            .output(TensorMeta::new(DType::I64, vec![]))
            .output(values_meta)
            .output(TensorMeta::new(DType::I64, vec![])),
    )?;

    let indices_dtype = graph.tensor_meta(primary.indices).dtype;
    let shape_dtype = graph.tensor_meta(primary.dense_shape).dtype;
    let indices = cast_if_needed(
        graph,
        take.output(0),
        indices_dtype,
        scoped(&values_op_name, "Take-Grad-Cast-Indices"),
        reduce_to_device,
    )?;
    let dense_shape = cast_if_needed(
        graph,
        take.output(2),
        shape_dtype,
        scoped(&values_op_name, "Take-Grad-Cast-Shape"),
        reduce_to_device,
    )?;
    let aggregated = SparseGradient {
        values: take.output(1),
        indices,
        dense_shape,
    };

    // The triple is rewired together; a control consumer shared by the values and indices
    // producers is moved once, with the indices.
    update_gradient_consumers(
        graph,
        &indices_snapshot.data,
        &indices_snapshot.control,
        primary.indices,
        aggregated.indices,
    );
    let values_control: Vec<OpId> = difference(&values_snapshot.control, &indices_snapshot.control);
    update_gradient_consumers(
        graph,
        &values_snapshot.data,
        &values_control,
        primary.values,
        aggregated.values,
    );
    graph.update_consumers(&shape_consumers, primary.dense_shape, aggregated.dense_shape);

    Ok(aggregated)
}

/// Inserts a cast of `tensor` to `dtype` unless it already has that dtype.
pub(crate) fn cast_if_needed(
    graph: &mut Graph,
    tensor: TensorRef,
    dtype: DType,
    name: String,
    device: &DeviceSpec,
) -> Result<TensorRef> {
    let meta = graph.tensor_meta(tensor).clone();
    if meta.dtype == dtype {
        return Ok(tensor);
    }
    let cast = graph.add_op(
        OpSpec::new(name, OpKind::Cast { to: dtype })
            .inputs(vec![tensor])
            .device(device)
            .output(TensorMeta::new(dtype, meta.shape)),
    )?;
    Ok(cast.output(0))
}

/// Elements of `a` not in `b`, in the order of `a`.
pub(crate) fn difference(a: &[OpId], b: &[OpId]) -> Vec<OpId> {
    let b: HashSet<OpId> = b.iter().copied().collect();
    a.iter().copied().filter(|id| !b.contains(id)).collect()
}

fn replica_gradients(graph: &Graph, spec: &GradientSpec, num_replicas: usize) -> Result<Vec<Gradient>> {
    (0..num_replicas.max(1))
        .map(|i| spec.resolve(graph, &replica_prefix(i)))
        .collect()
}
