//! Between-worker gradient accumulation.
//!
//! Every worker applies its (already replica-aggregated) gradient to one accumulator living
//! next to the variable. The update then consumes the accumulator's take, which completes
//! only once all `num_workers` contributions arrived.

use super::aggregation::{cast_if_needed, difference, update_gradient_consumers, ConsumerSnapshot};
use super::gradient::{Gradient, SparseGradient};
use super::MAX_STEP;
use crate::error::Result;
use crate::graph::{
    ConstValue, DType, DeviceSpec, Graph, OpHandle, OpId, OpKind, OpSpec, Reduction, TensorMeta,
    TensorRef,
};
use crate::registry::TrainableVar;

/// The aggregated gradient exposed by an accumulator take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregatedGrad {
    /// Indices tensor for sparse gradients.
    pub indices: Option<TensorRef>,
    pub values: TensorRef,
}

impl AggregatedGrad {
    /// Producing ops of the aggregated tensors, without duplicates.
    pub fn ops(&self) -> Vec<OpId> {
        let mut ops = Vec::with_capacity(2);
        if let Some(indices) = self.indices {
            ops.push(indices.op);
        }
        if !ops.contains(&self.values.op) {
            ops.push(self.values.op);
        }
        ops
    }
}

/// Ops created for one variable's accumulator.
#[derive(Debug, Clone)]
pub(crate) struct Accumulation {
    pub agg_grad: AggregatedGrad,
    pub accum_apply_op: OpId,
}

pub(crate) fn build_accumulation(
    graph: &mut Graph,
    var: &TrainableVar,
    gradient: &Gradient,
    num_workers: usize,
) -> Result<Accumulation> {
    let device = graph.device_spec(var.op)?;
    match gradient {
        Gradient::Dense(grad) => dense_accumulation(graph, var, *grad, num_workers, &device),
        Gradient::Sparse(grad) => sparse_accumulation(graph, var, grad, num_workers, &device),
    }
}

fn accumulator(graph: &mut Graph, var: &TrainableVar, sparse: bool, device: &DeviceSpec) -> Result<(OpHandle, OpHandle)> {
    let shared_name = format!("{}/grad_accum", var.name);
    let kind = if sparse {
        OpKind::SparseConditionalAccumulator {
            shared_name: shared_name.clone(),
            reduction: Reduction::Mean,
        }
    } else {
        OpKind::ConditionalAccumulator {
            shared_name: shared_name.clone(),
            reduction: Reduction::Mean,
        }
    };
    let accum = graph.add_op(
        OpSpec::new(shared_name.clone(), kind)
            .device(device)
            .output(TensorMeta::new(DType::Resource, var.meta.shape.clone())),
    )?;
    let local_step = graph.add_op(
        OpSpec::new(
            format!("{shared_name}/local_step"),
            OpKind::Const {
                value: ConstValue::Int {
                    dtype: DType::I64,
                    values: vec![MAX_STEP],
                },
            },
        )
        .device(device)
        .output(TensorMeta::scalar(DType::I64)),
    )?;
    Ok((accum, local_step))
}

fn num_required(graph: &mut Graph, take_name: &str, num_workers: usize, device: &DeviceSpec) -> Result<OpHandle> {
    graph.add_op(
        OpSpec::new(
            format!("{take_name}/num_required"),
            OpKind::Const {
                value: ConstValue::Int {
                    dtype: DType::I32,
                    values: vec![num_workers as i64],
                },
            },
        )
        .device(device)
        .output(TensorMeta::scalar(DType::I32)),
    )
}

fn dense_accumulation(
    graph: &mut Graph,
    var: &TrainableVar,
    grad: TensorRef,
    num_workers: usize,
    device: &DeviceSpec,
) -> Result<Accumulation> {
    // Consumers are captured before the apply op becomes one of them.
    let snapshot = ConsumerSnapshot::of(graph, grad);
    let (accum, local_step) = accumulator(graph, var, false, device)?;

    let apply_name = format!("{}_accum_apply_grad", graph.op(grad.op).name);
    let apply = graph.add_op(
        OpSpec::new(apply_name, OpKind::AccumulatorApplyGradient)
            .inputs(vec![accum.output(0), local_step.output(0), grad])
            .device(device),
    )?;

    let take_name = format!("{}_take_grad", var.name);
    let required = num_required(graph, &take_name, num_workers, device)?;
    let meta = graph.tensor_meta(grad).clone();
    let take = graph.add_op(
        OpSpec::new(take_name, OpKind::AccumulatorTakeGradient)
            .inputs(vec![accum.output(0), required.output(0)])
            .device(device)
            .output(meta),
    )?;

    update_gradient_consumers(graph, &snapshot.data, &snapshot.control, grad, take.output(0));
    Ok(Accumulation {
        agg_grad: AggregatedGrad {
            indices: None,
            values: take.output(0),
        },
        accum_apply_op: apply.id(),
    })
}

fn sparse_accumulation(
    graph: &mut Graph,
    var: &TrainableVar,
    grad: &SparseGradient,
    num_workers: usize,
    device: &DeviceSpec,
) -> Result<Accumulation> {
    let indices_snapshot = ConsumerSnapshot::of(graph, grad.indices);
    let values_snapshot = ConsumerSnapshot::of(graph, grad.values);
    let shape_consumers = graph.tensor_consumers(grad.dense_shape);
    let (accum, local_step) = accumulator(graph, var, true, device)?;

    let apply_name = format!("{}_accum_apply_grad", graph.op(grad.values.op).name);
    let apply = graph.add_op(
        OpSpec::new(apply_name, OpKind::SparseAccumulatorApplyGradient)
            .inputs(vec![
                accum.output(0),
                local_step.output(0),
                grad.indices,
                grad.values,
                grad.dense_shape,
            ])
            .device(device),
    )?;

    let take_name = format!("{}_take_grad", var.name);
    let required = num_required(graph, &take_name, num_workers, device)?;
    let values_meta = graph.tensor_meta(grad.values).clone();
    let take = graph.add_op(
        OpSpec::new(take_name.clone(), OpKind::SparseAccumulatorTakeGradient)
            .inputs(vec![accum.output(0), required.output(0)])
            .device(device)
            .output(TensorMeta::new(DType::I64, vec![]))
            .output(values_meta)
            .output(TensorMeta::new(DType::I64, vec![])),
    )?;

    let indices_dtype = graph.tensor_meta(grad.indices).dtype;
    let shape_dtype = graph.tensor_meta(grad.dense_shape).dtype;
    let indices = cast_if_needed(
        graph,
        take.output(0),
        indices_dtype,
        format!("{take_name}/cast_indices"),
        device,
    )?;
    let dense_shape = cast_if_needed(
        graph,
        take.output(2),
        shape_dtype,
        format!("{take_name}/cast_shape"),
        device,
    )?;

    update_gradient_consumers(
        graph,
        &indices_snapshot.data,
        &indices_snapshot.control,
        grad.indices,
        indices,
    );
    let values_control = difference(&values_snapshot.control, &indices_snapshot.control);
    update_gradient_consumers(graph, &values_snapshot.data, &values_control, grad.values, take.output(1));
    graph.update_consumers(&shape_consumers, grad.dense_shape, dense_shape);

    Ok(Accumulation {
        agg_grad: AggregatedGrad {
            indices: Some(indices),
            values: take.output(1),
        },
        accum_apply_op: apply.id(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::TrainableRegistry;

    fn dense_graph() -> (Graph, TrainableVar, TensorRef, OpId) {
        let mut g = Graph::new();
        let w = g
            .add_op(
                OpSpec::new("w", OpKind::Variable)
                    .device("/job:ps/task:1/device:CPU:0")
                    .output(TensorMeta::new(DType::F32, vec![2])),
            )
            .unwrap();
        let grad = g
            .add_op(OpSpec::new("grad", OpKind::Placeholder).output(TensorMeta::new(DType::F32, vec![2])))
            .unwrap();
        let lr = g
            .add_op(
                OpSpec::new("lr", OpKind::Const { value: ConstValue::Float(vec![0.5]) })
                    .output(TensorMeta::scalar(DType::F32)),
            )
            .unwrap();
        let update = g
            .add_op(
                OpSpec::new("update", OpKind::ApplyGradientDescent)
                    .inputs(vec![w.output(0), lr.output(0), grad.output(0)]),
            )
            .unwrap();
        let mut registry = TrainableRegistry::new();
        registry.register_trainable(&g, "w").unwrap();
        let var = registry.trainable(w.id()).cloned().unwrap();
        (g, var, grad.output(0), update.id())
    }

    #[test]
    fn test_dense_accumulation_rewires_update() {
        let (mut g, var, grad, update) = dense_graph();
        let acc = build_accumulation(&mut g, &var, &Gradient::Dense(grad), 3).unwrap();

        let take = g.op(acc.agg_grad.values.op);
        assert_eq!(take.name, "w_take_grad");
        assert_eq!(take.device, "/job:ps/task:1/device:CPU:0");
        assert_eq!(g.op(update).inputs[2], acc.agg_grad.values);

        let apply = g.op(acc.accum_apply_op);
        assert_eq!(apply.name, "grad_accum_apply_grad");
        // the apply still reads the raw gradient
        assert_eq!(apply.inputs[2], grad);

        let accum = g.op(apply.inputs[0].op);
        assert!(matches!(
            &accum.kind,
            OpKind::ConditionalAccumulator { shared_name, reduction: Reduction::Mean } if shared_name == "w/grad_accum"
        ));
        assert_eq!(acc.agg_grad.ops(), vec![acc.agg_grad.values.op]);
    }
}
