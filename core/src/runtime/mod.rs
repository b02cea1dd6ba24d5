//! # Reference Runtime
//!
//! A small in-process executor for rewritten graphs, used to check that the rewrite trains
//! correctly. Each worker runs its own [`Session`] over its own rewritten graph (typically on
//! its own thread); all sessions of a job share one [`SharedResources`], which plays the role
//! of the parameter servers.
//!
//! Ops run one at a time, in a deterministic post-order of the fetched ops' dependencies
//! (data inputs first, then control inputs). Blocking ops (accumulator takes, queue
//! dequeues) block the calling thread, exactly like the cross-worker rendezvous they model.
//!
//! ```rust
//! use ps_sync::config::SyncConfig;
//! use ps_sync::graph::{DType, Graph, OpKind, OpSpec, TensorMeta};
//! use ps_sync::runtime::{Session, SharedResources, Value};
//! use std::sync::Arc;
//!
//! let mut graph = Graph::new();
//! let x = graph.add_op(OpSpec::new("x", OpKind::Placeholder).output(TensorMeta::new(DType::F32, vec![2]))).unwrap();
//! graph
//!     .add_op(OpSpec::new("sum", OpKind::AddN).inputs(vec![x.output(0), x.output(0)]).output(TensorMeta::new(DType::F32, vec![2])))
//!     .unwrap();
//!
//! let session = Session::new(graph, Arc::new(SharedResources::new()), &SyncConfig::default()).unwrap();
//! let out = session.run(&["sum:0"], &[("x", Value::vector(vec![1.0, 2.0]))]).unwrap();
//! assert_eq!(out[0], Value::vector(vec![2.0, 4.0]));
//! ```

pub mod resources;
pub mod value;

pub use resources::{Accumulator, SharedResources, SparseSlices, TokenQueue};
pub use value::Value;

use crate::config::SyncConfig;
use crate::error::{ExecError, ExecResult};
use crate::graph::{parse_tensor_name, ConstValue, DType, DeviceSpec, Graph, OpId, OpKind, Operation};
use crate::synchronizer::{BarrierRole, BarrierState, UPDATE_OP_VAR_POS};
use rayon::prelude::*;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tracing::{debug, trace};

#[derive(Debug, Default, Clone, Copy)]
struct BarrierProgress {
    state: BarrierState,
    enqueued: usize,
}

/// Executes one worker's graph against the shared resources.
#[derive(Debug)]
pub struct Session {
    graph: Graph,
    resources: Arc<SharedResources>,
    worker_device: DeviceSpec,
    role: BarrierRole,
    num_workers: usize,
    barriers: Mutex<HashMap<String, BarrierProgress>>,
}

impl Session {
    pub fn new(graph: Graph, resources: Arc<SharedResources>, config: &SyncConfig) -> ExecResult<Self> {
        let barriers: HashMap<String, BarrierProgress> = graph
            .ops()
            .filter_map(|(_, op)| match &op.kind {
                OpKind::FifoQueue { variable, .. } if !variable.is_empty() => {
                    Some((variable.clone(), BarrierProgress::default()))
                }
                _ => None,
            })
            .collect();
        Ok(Self {
            graph,
            resources,
            worker_device: config.worker_device()?,
            role: BarrierRole::for_worker(config.worker_id),
            num_workers: config.num_workers,
            barriers: Mutex::new(barriers),
        })
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn resources(&self) -> &Arc<SharedResources> {
        &self.resources
    }

    /// Barrier progress of the latest update of `variable`, if it is synchronized.
    pub fn barrier_state(&self, variable: &str) -> Option<BarrierState> {
        self.barriers
            .lock()
            .ok()
            .and_then(|b| b.get(variable).map(|p| p.state))
    }

    /// Assigns the initial value of the variable named `name`.
    pub fn init_variable(&self, name: &str, value: Value) -> ExecResult<()> {
        let id = self.graph.op_by_name(name)?;
        let key = self.resource_key(self.graph.op(id), name)?;
        self.resources.write_variable(&key, value)
    }

    /// Current value of the variable named `name`.
    pub fn read_variable(&self, name: &str) -> ExecResult<Value> {
        let id = self.graph.op_by_name(name)?;
        let key = self.resource_key(self.graph.op(id), name)?;
        self.resources.read_variable(&key)
    }

    /// Runs the ops needed for `fetches` (tensor names) and returns their values.
    pub fn run(&self, fetches: &[&str], feeds: &[(&str, Value)]) -> ExecResult<Vec<Value>> {
        let tensors = fetches
            .iter()
            .map(|name| self.graph.tensor_by_name(name))
            .collect::<Result<Vec<_>, _>>()?;
        let roots: Vec<OpId> = tensors.iter().map(|t| t.op).collect();
        let outputs = self.execute(&roots, feeds)?;
        tensors
            .iter()
            .map(|t| {
                outputs
                    .get(&t.op)
                    .and_then(|values| values.get(t.index))
                    .cloned()
                    .ok_or_else(|| ExecError::InvalidOperand {
                        op: self.graph.tensor_name(*t),
                        reason: "no value produced".to_string(),
                    })
            })
            .collect()
    }

    /// Runs the named ops for their side effects.
    pub fn run_targets(&self, targets: &[&str], feeds: &[(&str, Value)]) -> ExecResult<()> {
        let roots = targets
            .iter()
            .map(|name| self.graph.op_by_name(name))
            .collect::<Result<Vec<_>, _>>()?;
        self.execute(&roots, feeds)?;
        Ok(())
    }

    /// Dependency closure of `roots` in post-order.
    fn plan(&self, roots: &[OpId]) -> Vec<OpId> {
        let mut order = Vec::new();
        let mut visited = HashSet::new();
        // (op, dependencies already pushed)
        let mut stack: Vec<(OpId, bool)> = roots.iter().rev().map(|&r| (r, false)).collect();
        while let Some((id, expanded)) = stack.pop() {
            if expanded {
                order.push(id);
                continue;
            }
            if !visited.insert(id) {
                continue;
            }
            stack.push((id, true));
            let op = self.graph.op(id);
            let deps: Vec<OpId> = op
                .inputs
                .iter()
                .map(|t| t.op)
                .chain(op.control_inputs.iter().copied())
                .collect();
            for dep in deps.into_iter().rev() {
                if !visited.contains(&dep) {
                    stack.push((dep, false));
                }
            }
        }
        order
    }

    fn execute(&self, roots: &[OpId], feeds: &[(&str, Value)]) -> ExecResult<HashMap<OpId, Vec<Value>>> {
        let feeds = feeds
            .iter()
            .map(|(name, value)| Ok((parse_tensor_name(name)?.0.to_string(), value.clone())))
            .collect::<ExecResult<HashMap<String, Value>>>()?;

        let mut outputs: HashMap<OpId, Vec<Value>> = HashMap::new();
        for id in self.plan(roots) {
            let op = self.graph.op(id);
            let inputs = op
                .inputs
                .iter()
                .map(|t| {
                    outputs
                        .get(&t.op)
                        .and_then(|values| values.get(t.index))
                        .cloned()
                        .ok_or_else(|| ExecError::InvalidOperand {
                            op: op.name.clone(),
                            reason: format!("input {} was not produced", self.graph.tensor_name(*t)),
                        })
                })
                .collect::<ExecResult<Vec<_>>>()?;
            trace!(op = %op.name, kind = op.kind.name(), "executing");
            let values = self.execute_op(op, inputs, &feeds)?;
            outputs.insert(id, values);
        }
        Ok(outputs)
    }

    fn resource_key(&self, op: &Operation, name: &str) -> ExecResult<String> {
        let device = DeviceSpec::parse(&op.device)?;
        let resolved = if device.job.is_some() {
            device
        } else {
            self.worker_device.replace(&device)
        };
        Ok(format!("{}/{}", resolved.host(), name))
    }

    fn execute_op(&self, op: &Operation, inputs: Vec<Value>, feeds: &HashMap<String, Value>) -> ExecResult<Vec<Value>> {
        let name = op.name.as_str();
        let arity = min_inputs(&op.kind);
        if inputs.len() < arity {
            return Err(ExecError::InvalidOperand {
                op: name.to_string(),
                reason: format!("expected {arity} inputs, got {}", inputs.len()),
            });
        }
        let out = match &op.kind {
            OpKind::Placeholder => vec![feed(op, feeds)?],
            OpKind::Const { value } => vec![const_value(op, value)],
            OpKind::Variable => vec![Value::Handle(self.resource_key(op, name)?)],
            OpKind::ReadVariable => vec![self.resources.read_variable(inputs[0].as_handle(name)?)?],
            OpKind::Identity => vec![inputs[0].clone()],
            OpKind::NoOp => Vec::new(),
            OpKind::AddN => vec![add_n(name, &inputs)?],
            OpKind::RealDiv => vec![real_div(name, &inputs[0], &inputs[1])?],
            OpKind::Cast { to } => vec![cast(name, &inputs[0], *to)?],
            OpKind::Assign | OpKind::AssignAdd | OpKind::ApplyGradientDescent | OpKind::ScatterApplyGradientDescent => {
                self.update_variable(op, &inputs)?;
                Vec::new()
            }
            OpKind::ConditionalAccumulator { shared_name, reduction }
            | OpKind::SparseConditionalAccumulator { shared_name, reduction } => {
                let key = self.resource_key(op, shared_name)?;
                let shape = op.outputs.first().map(|m| m.shape.clone()).unwrap_or_default();
                self.resources.accumulator(&key, *reduction, &shape)?;
                vec![Value::Handle(key)]
            }
            OpKind::AccumulatorApplyGradient => {
                let acc = self.resources.get_accumulator(inputs[0].as_handle(name)?)?;
                let step = inputs[1].as_int_scalar(name)?;
                let (_, grad) = inputs[2].as_float(name)?;
                acc.apply_dense(step, grad)?;
                Vec::new()
            }
            OpKind::AccumulatorTakeGradient => {
                let acc = self.resources.get_accumulator(inputs[0].as_handle(name)?)?;
                let n = required(name, &inputs[1])?;
                let data = acc.take_dense(n)?;
                let shape = op
                    .outputs
                    .first()
                    .map(|m| m.shape.clone())
                    .filter(|s| s.iter().product::<usize>() == data.len())
                    .unwrap_or_else(|| vec![data.len()]);
                vec![Value::float(shape, data)]
            }
            OpKind::SparseAccumulatorApplyGradient => {
                let acc = self.resources.get_accumulator(inputs[0].as_handle(name)?)?;
                let step = inputs[1].as_int_scalar(name)?;
                let indices = inputs[2].as_int(name)?;
                let (_, values) = inputs[3].as_float(name)?;
                let dense_shape = inputs[4].as_int(name)?;
                acc.apply_sparse(step, indices, values, dense_shape)?;
                Vec::new()
            }
            OpKind::SparseAccumulatorTakeGradient => {
                let acc = self.resources.get_accumulator(inputs[0].as_handle(name)?)?;
                let n = required(name, &inputs[1])?;
                let taken = acc.take_sparse(n)?;
                let rows = taken.indices.len();
                let row_width = if rows == 0 { 0 } else { taken.values.len() / rows };
                vec![
                    Value::int(DType::I64, taken.indices),
                    Value::float(vec![rows, row_width], taken.values),
                    Value::int(DType::I64, taken.dense_shape),
                ]
            }
            OpKind::FifoQueue {
                shared_name, capacity, ..
            } => {
                let key = self.resource_key(op, shared_name)?;
                self.resources.queue(&key, *capacity)?;
                vec![Value::Handle(key)]
            }
            OpKind::QueueEnqueue => {
                let queue = self.resources.get_queue(inputs[0].as_handle(name)?)?;
                queue.enqueue(inputs[1].clone())?;
                if let Some(var) = self.queue_variable(op) {
                    self.on_token_sent(&var);
                }
                Vec::new()
            }
            OpKind::QueueDequeue => {
                let queue = self.resources.get_queue(inputs[0].as_handle(name)?)?;
                let var = self.queue_variable(op);
                if let Some(var) = &var {
                    self.set_barrier(var, BarrierState::WaitingForLocalUpdate.advance(self.role));
                }
                debug!(op = name, "waiting for update token");
                let token = queue.dequeue()?;
                if let Some(var) = &var {
                    self.set_barrier(var, BarrierState::Done);
                }
                vec![token]
            }
        };
        Ok(out)
    }

    fn update_variable(&self, op: &Operation, inputs: &[Value]) -> ExecResult<()> {
        let name = op.name.as_str();
        let key = inputs[UPDATE_OP_VAR_POS].as_handle(name)?.to_string();
        match &op.kind {
            OpKind::Assign => self.resources.write_variable(&key, inputs[1].clone())?,
            OpKind::AssignAdd => self
                .resources
                .update_variable(&key, |var| axpy(name, var, 1.0, &inputs[1]))?,
            OpKind::ApplyGradientDescent => {
                let alpha = scalar(name, &inputs[1])?;
                self.resources
                    .update_variable(&key, |var| axpy(name, var, -alpha, &inputs[2]))?
            }
            OpKind::ScatterApplyGradientDescent => {
                let alpha = scalar(name, &inputs[1])?;
                let (_, values) = inputs[2].as_float(name)?;
                let indices = inputs[3].as_int(name)?;
                self.resources.update_variable(&key, |var| {
                    scatter_sub(name, var, alpha, values, indices)
                })?
            }
            _ => {}
        }

        // The chief's local update starts the barrier for its variable.
        if let Some(var) = op.inputs.get(UPDATE_OP_VAR_POS).map(|t| self.graph.op(t.op).name.clone()) {
            if self.role == BarrierRole::Chief && self.is_barrier_var(&var) {
                let signaling = BarrierState::WaitingForLocalUpdate.advance(self.role);
                self.set_barrier_progress(&var, signaling, 0);
                if self.num_workers <= 1 {
                    self.set_barrier(&var, BarrierState::Done);
                }
            }
        }
        Ok(())
    }

    fn queue_variable(&self, op: &Operation) -> Option<String> {
        let queue = self.graph.op(op.inputs.first()?.op);
        match &queue.kind {
            OpKind::FifoQueue { variable, .. } if !variable.is_empty() => Some(variable.clone()),
            _ => None,
        }
    }

    fn is_barrier_var(&self, var: &str) -> bool {
        self.barriers
            .lock()
            .map(|b| b.contains_key(var))
            .unwrap_or(false)
    }

    fn on_token_sent(&self, var: &str) {
        if let Ok(mut barriers) = self.barriers.lock() {
            if let Some(progress) = barriers.get_mut(var) {
                progress.enqueued += 1;
                if progress.enqueued + 1 >= self.num_workers {
                    progress.state = progress.state.advance(self.role);
                }
            }
        }
    }

    fn set_barrier(&self, var: &str, state: BarrierState) {
        if let Ok(mut barriers) = self.barriers.lock() {
            if let Some(progress) = barriers.get_mut(var) {
                progress.state = state;
            }
        }
    }

    fn set_barrier_progress(&self, var: &str, state: BarrierState, enqueued: usize) {
        if let Ok(mut barriers) = self.barriers.lock() {
            barriers.insert(var.to_string(), BarrierProgress { state, enqueued });
        }
    }
}

fn min_inputs(kind: &OpKind) -> usize {
    match kind {
        OpKind::ReadVariable | OpKind::Identity | OpKind::AddN | OpKind::Cast { .. } | OpKind::QueueDequeue => 1,
        OpKind::RealDiv
        | OpKind::Assign
        | OpKind::AssignAdd
        | OpKind::AccumulatorTakeGradient
        | OpKind::SparseAccumulatorTakeGradient
        | OpKind::QueueEnqueue => 2,
        OpKind::ApplyGradientDescent | OpKind::AccumulatorApplyGradient => 3,
        OpKind::ScatterApplyGradientDescent => 4,
        OpKind::SparseAccumulatorApplyGradient => 5,
        _ => 0,
    }
}

fn const_value(op: &Operation, value: &ConstValue) -> Value {
    match value {
        ConstValue::Float(data) => {
            let shape = op
                .outputs
                .first()
                .map(|m| m.shape.clone())
                .filter(|s| s.iter().product::<usize>() == data.len())
                .unwrap_or_else(|| vec![data.len()]);
            Value::float(shape, data.clone())
        }
        ConstValue::Int { dtype, values } => Value::int(*dtype, values.clone()),
        ConstValue::Bool(b) => Value::Bool(*b),
    }
}

/// The fed value of a placeholder, checked against its declared dtype.
fn feed(op: &Operation, feeds: &HashMap<String, Value>) -> ExecResult<Value> {
    let value = feeds
        .get(&op.name)
        .cloned()
        .ok_or_else(|| ExecError::MissingFeed(op.name.clone()))?;
    match op.outputs.first() {
        Some(meta) if meta.dtype != value.dtype() => Err(ExecError::InvalidOperand {
            op: op.name.clone(),
            reason: format!("fed {value}, declared {:?}", meta.dtype),
        }),
        _ => Ok(value),
    }
}

fn required(op: &str, value: &Value) -> ExecResult<usize> {
    let n = value.as_int_scalar(op)?;
    usize::try_from(n).map_err(|_| ExecError::InvalidOperand {
        op: op.to_string(),
        reason: format!("num_required must be non-negative, got {n}"),
    })
}

fn scalar(op: &str, value: &Value) -> ExecResult<f32> {
    match value.as_float(op)? {
        (_, [x]) => Ok(*x),
        (shape, _) => Err(ExecError::ShapeMismatch {
            op: op.to_string(),
            expected: Vec::new(),
            got: shape.to_vec(),
        }),
    }
}

fn add_n(op: &str, inputs: &[Value]) -> ExecResult<Value> {
    let (shape, first) = inputs
        .first()
        .ok_or_else(|| ExecError::InvalidOperand {
            op: op.to_string(),
            reason: "no inputs".to_string(),
        })?
        .as_float(op)?;
    let mut operands = Vec::with_capacity(inputs.len());
    for input in inputs {
        let (s, data) = input.as_float(op)?;
        if s != shape {
            return Err(ExecError::ShapeMismatch {
                op: op.to_string(),
                expected: shape.to_vec(),
                got: s.to_vec(),
            });
        }
        operands.push(data);
    }
    let data = (0..first.len())
        .into_par_iter()
        .map(|i| operands.iter().map(|x| x[i]).sum::<f32>())
        .collect();
    Ok(Value::float(shape.to_vec(), data))
}

fn real_div(op: &str, x: &Value, y: &Value) -> ExecResult<Value> {
    let (shape, lhs) = x.as_float(op)?;
    let (y_shape, rhs) = y.as_float(op)?;
    let data: Vec<f32> = match rhs {
        [d] => lhs.par_iter().map(|v| v / d).collect(),
        _ if y_shape == shape => lhs.par_iter().zip(rhs.par_iter()).map(|(a, b)| a / b).collect(),
        _ => {
            return Err(ExecError::ShapeMismatch {
                op: op.to_string(),
                expected: shape.to_vec(),
                got: y_shape.to_vec(),
            })
        }
    };
    Ok(Value::float(shape.to_vec(), data))
}

fn cast(op: &str, x: &Value, to: DType) -> ExecResult<Value> {
    match (x, to) {
        (Value::Int { data, .. }, to) if to.is_integer() => Ok(Value::int(to, data.clone())),
        (Value::Int { data, .. }, DType::F32) => Ok(Value::vector(data.iter().map(|&v| v as f32).collect())),
        (Value::Float { data, .. }, to) if to.is_integer() => {
            Ok(Value::int(to, data.iter().map(|&v| v as i64).collect()))
        }
        (Value::Float { .. }, DType::F32) => Ok(x.clone()),
        (Value::Bool(b), DType::Bool) => Ok(Value::Bool(*b)),
        (other, _) => Err(ExecError::InvalidOperand {
            op: op.to_string(),
            reason: format!("cannot cast {other} to {to:?}"),
        }),
    }
}

/// `var += alpha * delta`
fn axpy(op: &str, var: &mut Value, alpha: f32, delta: &Value) -> ExecResult<()> {
    match (var, delta) {
        (Value::Float { shape, data }, Value::Float { data: d, .. }) => {
            if data.len() != d.len() {
                return Err(ExecError::ShapeMismatch {
                    op: op.to_string(),
                    expected: shape.clone(),
                    got: vec![d.len()],
                });
            }
            data.par_iter_mut().zip(d.par_iter()).for_each(|(v, g)| *v += alpha * g);
            Ok(())
        }
        (Value::Int { data, .. }, Value::Int { data: d, .. }) if d.len() == data.len() => {
            data.iter_mut().zip(d).for_each(|(v, g)| *v += alpha as i64 * g);
            Ok(())
        }
        (var, delta) => Err(ExecError::InvalidOperand {
            op: op.to_string(),
            reason: format!("cannot update {var} with {delta}"),
        }),
    }
}

/// `var[indices[k]] -= alpha * values[k]`, row-wise.
fn scatter_sub(op: &str, var: &mut Value, alpha: f32, values: &[f32], indices: &[i64]) -> ExecResult<()> {
    let Value::Float { shape, data } = var else {
        return Err(ExecError::InvalidOperand {
            op: op.to_string(),
            reason: "expected an f32 variable".to_string(),
        });
    };
    let rows = shape.first().copied().unwrap_or(1).max(1);
    let width = data.len() / rows;
    if width * indices.len() != values.len() {
        return Err(ExecError::ShapeMismatch {
            op: op.to_string(),
            expected: vec![indices.len(), width],
            got: vec![values.len()],
        });
    }
    for (k, &index) in indices.iter().enumerate() {
        let row = usize::try_from(index)
            .ok()
            .filter(|r| *r < rows)
            .ok_or_else(|| ExecError::InvalidOperand {
                op: op.to_string(),
                reason: format!("row {index} out of range for {rows} rows"),
            })?;
        let target = &mut data[row * width..(row + 1) * width];
        let source = &values[k * width..(k + 1) * width];
        target.iter_mut().zip(source).for_each(|(v, g)| *v -= alpha * g);
    }
    Ok(())
}
