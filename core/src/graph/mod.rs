//! Arena computation graph.
//!
//! Operations live in a `Vec` and are addressed by [`OpId`]; a name index gives lookup by
//! fully-qualified name. Edges are stored on the consumer side only (data inputs as
//! [`TensorRef`]s, control inputs as [`OpId`]s). Consumers are derived by scanning, which keeps
//! rewiring trivially consistent.
//!
//! # Example
//!
//! ```rust
//! use ps_sync::graph::{DType, Graph, OpKind, OpSpec, TensorMeta};
//!
//! let mut graph = Graph::new();
//! let a = graph.add_op(OpSpec::new("a", OpKind::Placeholder).output(TensorMeta::new(DType::F32, vec![2]))).unwrap();
//! let b = graph.add_op(OpSpec::new("b", OpKind::Placeholder).output(TensorMeta::new(DType::F32, vec![2]))).unwrap();
//! let sum = graph
//!     .add_op(OpSpec::new("sum", OpKind::AddN).inputs(vec![a.output(0), b.output(0)]).output(TensorMeta::new(DType::F32, vec![2])))
//!     .unwrap();
//!
//! assert_eq!(graph.consumers(a.id()), vec![sum.id()]);
//! assert_eq!(graph.tensor_name(sum.output(0)), "sum:0");
//! ```

use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

pub mod device;
pub mod op;
pub mod traverse;

pub use device::DeviceSpec;
pub use op::{ConstValue, DType, OpKind, Reduction, TensorMeta};

/// Index of an operation in the graph arena.
pub type OpId = usize;

/// One output slot of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TensorRef {
    pub op: OpId,
    pub index: usize,
}

impl TensorRef {
    pub fn new(op: OpId, index: usize) -> Self {
        Self { op, index }
    }
}

/// A node in the computation graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub name: String,
    pub kind: OpKind,
    #[serde(default)]
    pub device: String,
    #[serde(default)]
    pub inputs: Vec<TensorRef>,
    #[serde(default)]
    pub control_inputs: Vec<OpId>,
    #[serde(default)]
    pub outputs: Vec<TensorMeta>,
}

/// Description of an operation to be added to a [`Graph`].
#[derive(Debug, Clone)]
pub struct OpSpec {
    name: String,
    kind: OpKind,
    device: String,
    inputs: Vec<TensorRef>,
    control_inputs: Vec<OpId>,
    outputs: Vec<TensorMeta>,
}

impl OpSpec {
    pub fn new(name: impl Into<String>, kind: OpKind) -> Self {
        Self {
            name: name.into(),
            kind,
            device: String::new(),
            inputs: Vec::new(),
            control_inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn device(mut self, device: impl ToString) -> Self {
        self.device = device.to_string();
        self
    }

    pub fn inputs(mut self, inputs: Vec<TensorRef>) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn control_inputs(mut self, control_inputs: Vec<OpId>) -> Self {
        self.control_inputs = control_inputs;
        self
    }

    pub fn output(mut self, meta: TensorMeta) -> Self {
        self.outputs.push(meta);
        self
    }
}

/// Handle returned by [`Graph::add_op`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpHandle(OpId);

impl OpHandle {
    pub fn id(&self) -> OpId {
        self.0
    }

    pub fn output(&self, index: usize) -> TensorRef {
        TensorRef::new(self.0, index)
    }
}

/// The operation arena.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "GraphDef", into = "GraphDef")]
pub struct Graph {
    ops: Vec<Operation>,
    index: HashMap<String, OpId>,
}

/// Serialized form: the operation list only.
#[derive(Serialize, Deserialize)]
struct GraphDef {
    ops: Vec<Operation>,
}

impl From<GraphDef> for Graph {
    fn from(def: GraphDef) -> Self {
        let index = def
            .ops
            .iter()
            .enumerate()
            .map(|(id, op)| (op.name.clone(), id))
            .collect();
        Graph {
            ops: def.ops,
            index,
        }
    }
}

impl From<Graph> for GraphDef {
    fn from(graph: Graph) -> Self {
        GraphDef { ops: graph.ops }
    }
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a graph from its JSON description, validating every edge.
    pub fn from_json(json: &str) -> Result<Self> {
        let graph: Graph = serde_json::from_str(json)?;
        graph.validate()?;
        Ok(graph)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    fn validate(&self) -> Result<()> {
        for op in &self.ops {
            for input in &op.inputs {
                self.check_tensor(*input)?;
            }
            for ctrl in &op.control_inputs {
                if *ctrl >= self.ops.len() {
                    return Err(SyncError::OpNotFound(format!("#{ctrl}")));
                }
            }
        }
        Ok(())
    }

    fn check_tensor(&self, tensor: TensorRef) -> Result<()> {
        let op = self
            .ops
            .get(tensor.op)
            .ok_or_else(|| SyncError::OpNotFound(format!("#{}", tensor.op)))?;
        if tensor.index >= op.outputs.len() {
            return Err(SyncError::OutputOutOfRange {
                op: op.name.clone(),
                index: tensor.index,
            });
        }
        Ok(())
    }

    /// Adds an operation. A name already in use gets a `_N` suffix.
    pub fn add_op(&mut self, spec: OpSpec) -> Result<OpHandle> {
        for input in &spec.inputs {
            self.check_tensor(*input)?;
        }
        for ctrl in &spec.control_inputs {
            if *ctrl >= self.ops.len() {
                return Err(SyncError::OpNotFound(format!("#{ctrl}")));
            }
        }

        let name = self.unique_name(&spec.name);
        let id = self.ops.len();
        let mut control_inputs = Vec::with_capacity(spec.control_inputs.len());
        for ctrl in spec.control_inputs {
            if !control_inputs.contains(&ctrl) {
                control_inputs.push(ctrl);
            }
        }
        self.ops.push(Operation {
            name: name.clone(),
            kind: spec.kind,
            device: spec.device,
            inputs: spec.inputs,
            control_inputs,
            outputs: spec.outputs,
        });
        self.index.insert(name, id);
        Ok(OpHandle(id))
    }

    fn unique_name(&self, name: &str) -> String {
        if !self.index.contains_key(name) {
            return name.to_string();
        }
        (1..)
            .map(|i| format!("{name}_{i}"))
            .find(|candidate| !self.index.contains_key(candidate))
            .unwrap_or_else(|| name.to_string())
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn op(&self, id: OpId) -> &Operation {
        &self.ops[id]
    }

    pub fn ops(&self) -> impl Iterator<Item = (OpId, &Operation)> {
        self.ops.iter().enumerate()
    }

    pub fn op_by_name(&self, name: &str) -> Result<OpId> {
        self.index
            .get(name)
            .copied()
            .ok_or_else(|| SyncError::OpNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Looks up a tensor by `op_name:index` (a bare op name means output 0).
    pub fn tensor_by_name(&self, name: &str) -> Result<TensorRef> {
        let (op_name, index) = parse_tensor_name(name)?;
        let tensor = TensorRef::new(self.op_by_name(op_name)?, index);
        self.check_tensor(tensor)?;
        Ok(tensor)
    }

    pub fn tensor_name(&self, tensor: TensorRef) -> String {
        format!("{}:{}", self.ops[tensor.op].name, tensor.index)
    }

    pub fn tensor_meta(&self, tensor: TensorRef) -> &TensorMeta {
        &self.ops[tensor.op].outputs[tensor.index]
    }

    pub fn set_device(&mut self, id: OpId, device: impl ToString) {
        self.ops[id].device = device.to_string();
    }

    pub fn device_spec(&self, id: OpId) -> Result<DeviceSpec> {
        DeviceSpec::parse(&self.ops[id].device)
    }

    /// Operations consuming any output of `id`, in graph order.
    pub fn consumers(&self, id: OpId) -> Vec<OpId> {
        self.ops()
            .filter(|(_, op)| op.inputs.iter().any(|t| t.op == id))
            .map(|(cid, _)| cid)
            .collect()
    }

    /// Operations consuming `tensor`, in graph order.
    pub fn tensor_consumers(&self, tensor: TensorRef) -> Vec<OpId> {
        self.ops()
            .filter(|(_, op)| op.inputs.contains(&tensor))
            .map(|(cid, _)| cid)
            .collect()
    }

    /// Operations with a control dependency on `id`, in graph order.
    pub fn control_consumers(&self, id: OpId) -> Vec<OpId> {
        self.ops()
            .filter(|(_, op)| op.control_inputs.contains(&id))
            .map(|(cid, _)| cid)
            .collect()
    }

    /// Data consumers of every operation, indexed by producer.
    pub fn consumer_map(&self) -> Vec<Vec<OpId>> {
        let mut map = vec![Vec::new(); self.ops.len()];
        for (cid, op) in self.ops() {
            for input in &op.inputs {
                if !map[input.op].contains(&cid) {
                    map[input.op].push(cid);
                }
            }
        }
        map
    }

    /// Points every input of `consumers` that reads `old` at `new` instead.
    pub fn update_consumers(&mut self, consumers: &[OpId], old: TensorRef, new: TensorRef) {
        for &cid in consumers {
            for input in self.ops[cid].inputs.iter_mut() {
                if *input == old {
                    *input = new;
                }
            }
        }
    }

    /// Moves the control dependency of `consumers` from `old` to `new`.
    ///
    /// An edge to `new` is never duplicated, and `new` never depends on itself.
    pub fn update_control_consumers(&mut self, consumers: &[OpId], old: OpId, new: OpId) {
        for &cid in consumers {
            let op = &mut self.ops[cid];
            op.control_inputs.retain(|c| *c != old);
            if cid != new && !op.control_inputs.contains(&new) {
                op.control_inputs.push(new);
            }
        }
    }

    pub fn add_control_input(&mut self, id: OpId, ctrl: OpId) {
        let op = &mut self.ops[id];
        if !op.control_inputs.contains(&ctrl) {
            op.control_inputs.push(ctrl);
        }
    }
}

impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for op in &self.ops {
            let inputs: Vec<String> = op.inputs.iter().map(|t| self.tensor_name(*t)).collect();
            write!(f, "{} = {}({})", op.name, op.kind.name(), inputs.join(", "))?;
            if !op.control_inputs.is_empty() {
                let ctrl: Vec<&str> = op
                    .control_inputs
                    .iter()
                    .map(|c| self.ops[*c].name.as_str())
                    .collect();
                write!(f, " ^[{}]", ctrl.join(", "))?;
            }
            if !op.device.is_empty() {
                write!(f, " @ {}", op.device)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

/// Splits `op_name:index`; a name without `:` refers to output 0.
pub fn parse_tensor_name(name: &str) -> Result<(&str, usize)> {
    match name.rsplit_once(':') {
        Some((op, idx)) => {
            let index = idx
                .parse()
                .map_err(|_| SyncError::MalformedTensorName(name.to_string()))?;
            if op.is_empty() {
                return Err(SyncError::MalformedTensorName(name.to_string()));
            }
            Ok((op, index))
        }
        None if !name.is_empty() => Ok((name, 0)),
        None => Err(SyncError::MalformedTensorName(name.to_string())),
    }
}

/// Returns `scope/name`, or `name` when `scope` is empty.
pub fn prepend_name_scope(name: &str, scope: &str) -> String {
    if scope.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", scope.trim_end_matches('/'), name)
    }
}

/// Name scope of replica `index`.
pub fn replica_prefix(index: usize) -> String {
    format!("Replica-{index}")
}
