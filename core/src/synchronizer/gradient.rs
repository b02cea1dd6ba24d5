//! Gradient representations.
//!
//! A gradient reaches the rewrite either as one dense tensor or as a sparse
//! `(values, indices, dense_shape)` triple. Anything else is rejected up front.

use crate::error::{Result, SyncError};
use crate::graph::{prepend_name_scope, Graph, TensorRef};
use serde::{Deserialize, Serialize};

/// Three co-indexed tensors describing a gradient that touches a subset of rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SparseGradient {
    pub values: TensorRef,
    pub indices: TensorRef,
    pub dense_shape: TensorRef,
}

/// A gradient resolved to tensors of a graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gradient {
    Dense(TensorRef),
    Sparse(SparseGradient),
}

impl Gradient {
    /// Classifies a raw tensor list: one tensor is dense, three are `values, indices, dense_shape`.
    pub fn from_parts(target: &str, parts: &[TensorRef]) -> Result<Self> {
        match parts {
            [dense] => Ok(Gradient::Dense(*dense)),
            [values, indices, dense_shape] => Ok(Gradient::Sparse(SparseGradient {
                values: *values,
                indices: *indices,
                dense_shape: *dense_shape,
            })),
            _ => Err(SyncError::InvalidGradientKind {
                target: target.to_string(),
                parts: parts.len(),
            }),
        }
    }

    /// The tensor carrying gradient values.
    pub fn values(&self) -> TensorRef {
        match self {
            Gradient::Dense(t) => *t,
            Gradient::Sparse(s) => s.values,
        }
    }

    pub fn is_sparse(&self) -> bool {
        matches!(self, Gradient::Sparse(_))
    }
}

/// A gradient named in the single-replica graph, before replica scopes are applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GradientSpec {
    Dense(String),
    Sparse {
        values: String,
        indices: String,
        dense_shape: String,
    },
}

impl GradientSpec {
    /// Classifies tensor names the same way as [`Gradient::from_parts`].
    pub fn from_names<S: AsRef<str>>(target: &str, names: &[S]) -> Result<Self> {
        match names {
            [dense] => Ok(GradientSpec::Dense(dense.as_ref().to_string())),
            [values, indices, dense_shape] => Ok(GradientSpec::Sparse {
                values: values.as_ref().to_string(),
                indices: indices.as_ref().to_string(),
                dense_shape: dense_shape.as_ref().to_string(),
            }),
            _ => Err(SyncError::InvalidGradientKind {
                target: target.to_string(),
                parts: names.len(),
            }),
        }
    }

    /// Resolves the gradient inside name scope `scope` (empty for the unscoped graph).
    pub fn resolve(&self, graph: &Graph, scope: &str) -> Result<Gradient> {
        let lookup = |name: &str| graph.tensor_by_name(&prepend_name_scope(name, scope));
        Ok(match self {
            GradientSpec::Dense(name) => Gradient::Dense(lookup(name)?),
            GradientSpec::Sparse {
                values,
                indices,
                dense_shape,
            } => Gradient::Sparse(SparseGradient {
                values: lookup(values)?,
                indices: lookup(indices)?,
                dense_shape: lookup(dense_shape)?,
            }),
        })
    }

    /// Name of the tensor carrying gradient values.
    pub fn values_name(&self) -> &str {
        match self {
            GradientSpec::Dense(name) => name,
            GradientSpec::Sparse { values, .. } => values,
        }
    }
}
