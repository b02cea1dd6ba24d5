//! Operation vocabulary.
//!
//! Only the kinds the rewrite inserts (plus the handful a front-end needs to express a
//! training step) are modelled. Input positions are fixed per kind and listed on each
//! variant; the reference runtime and the rewrite both rely on them.

use serde::{Deserialize, Serialize};

/// Element type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    F32,
    I32,
    I64,
    Bool,
    /// Handle to a stateful resource (variable, accumulator, queue).
    Resource,
}

impl DType {
    pub fn is_integer(&self) -> bool {
        matches!(self, DType::I32 | DType::I64)
    }
}

/// How an accumulator combines the contributions of one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reduction {
    /// Divide the summed contributions by their count.
    #[default]
    Mean,
    /// Plain sum.
    Sum,
}

/// Literal payload of a `Const` operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConstValue {
    Float(Vec<f32>),
    Int { dtype: DType, values: Vec<i64> },
    Bool(bool),
}

/// The kind of an operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum OpKind {
    /// Value supplied by the caller at run time.
    Placeholder,
    Const {
        value: ConstValue,
    },
    /// Stateful variable; output 0 is its resource handle.
    Variable,
    /// `[variable]`
    ReadVariable,
    /// `[x]`
    Identity,
    /// `[x0, x1, ...]`
    AddN,
    /// `[x, y]`
    RealDiv,
    /// `[x]`
    Cast {
        to: DType,
    },
    /// Groups its control inputs.
    NoOp,
    /// `[variable, value]`
    Assign,
    /// `[variable, delta]`
    AssignAdd,
    /// `[variable, alpha, delta]`
    ApplyGradientDescent,
    /// `[variable, alpha, values, indices]`
    ScatterApplyGradientDescent,
    ConditionalAccumulator {
        shared_name: String,
        reduction: Reduction,
    },
    SparseConditionalAccumulator {
        shared_name: String,
        reduction: Reduction,
    },
    /// `[handle, local_step, gradient]`
    AccumulatorApplyGradient,
    /// `[handle, num_required]` -> `[gradient]`
    AccumulatorTakeGradient,
    /// `[handle, local_step, indices, values, dense_shape]`
    SparseAccumulatorApplyGradient,
    /// `[handle, num_required]` -> `[indices, values, dense_shape]`
    SparseAccumulatorTakeGradient,
    /// Bounded rendezvous queue; output 0 is its handle. `variable` names the value whose
    /// update the queue synchronizes.
    FifoQueue {
        shared_name: String,
        capacity: usize,
        #[serde(default)]
        variable: String,
    },
    /// `[handle, component]`
    QueueEnqueue,
    /// `[handle]` -> `[component]`
    QueueDequeue,
}

impl OpKind {
    /// Short kind name, used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            OpKind::Placeholder => "Placeholder",
            OpKind::Const { .. } => "Const",
            OpKind::Variable => "Variable",
            OpKind::ReadVariable => "ReadVariable",
            OpKind::Identity => "Identity",
            OpKind::AddN => "AddN",
            OpKind::RealDiv => "RealDiv",
            OpKind::Cast { .. } => "Cast",
            OpKind::NoOp => "NoOp",
            OpKind::Assign => "Assign",
            OpKind::AssignAdd => "AssignAdd",
            OpKind::ApplyGradientDescent => "ApplyGradientDescent",
            OpKind::ScatterApplyGradientDescent => "ScatterApplyGradientDescent",
            OpKind::ConditionalAccumulator { .. } => "ConditionalAccumulator",
            OpKind::SparseConditionalAccumulator { .. } => "SparseConditionalAccumulator",
            OpKind::AccumulatorApplyGradient => "AccumulatorApplyGradient",
            OpKind::AccumulatorTakeGradient => "AccumulatorTakeGradient",
            OpKind::SparseAccumulatorApplyGradient => "SparseAccumulatorApplyGradient",
            OpKind::SparseAccumulatorTakeGradient => "SparseAccumulatorTakeGradient",
            OpKind::FifoQueue { .. } => "FifoQueue",
            OpKind::QueueEnqueue => "QueueEnqueue",
            OpKind::QueueDequeue => "QueueDequeue",
        }
    }
}

/// Static metadata of one output slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorMeta {
    pub dtype: DType,
    #[serde(default)]
    pub shape: Vec<usize>,
}

impl TensorMeta {
    pub fn new(dtype: DType, shape: Vec<usize>) -> Self {
        Self { dtype, shape }
    }

    pub fn scalar(dtype: DType) -> Self {
        Self::new(dtype, Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_serde_tag() {
        let kind = OpKind::Cast { to: DType::I32 };
        let json = serde_json::to_string(&kind).unwrap();
        assert_eq!(json, r#"{"op":"cast","to":"i32"}"#);
    }

    #[test]
    fn test_integer_dtypes() {
        assert!(DType::I32.is_integer());
        assert!(DType::I64.is_integer());
        assert!(!DType::F32.is_integer());
    }
}
