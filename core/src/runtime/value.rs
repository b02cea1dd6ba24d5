//! Runtime values.

use crate::error::{ExecError, ExecResult};
use crate::graph::DType;
use std::fmt;

/// A value flowing along a graph edge.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Row-major `f32` tensor.
    Float { shape: Vec<usize>, data: Vec<f32> },
    /// Integer tensor, stored widened; `dtype` is `I32` or `I64`.
    Int { dtype: DType, data: Vec<i64> },
    Bool(bool),
    /// Key of a variable, accumulator or queue in the shared resources.
    Handle(String),
}

impl Value {
    pub fn float(shape: Vec<usize>, data: Vec<f32>) -> Self {
        Value::Float { shape, data }
    }

    pub fn vector(data: Vec<f32>) -> Self {
        Value::Float {
            shape: vec![data.len()],
            data,
        }
    }

    pub fn scalar(x: f32) -> Self {
        Value::Float {
            shape: Vec::new(),
            data: vec![x],
        }
    }

    pub fn int(dtype: DType, data: Vec<i64>) -> Self {
        Value::Int { dtype, data }
    }

    pub fn dtype(&self) -> DType {
        match self {
            Value::Float { .. } => DType::F32,
            Value::Int { dtype, .. } => *dtype,
            Value::Bool(_) => DType::Bool,
            Value::Handle(_) => DType::Resource,
        }
    }

    /// Shape and data of an `f32` tensor whose shape covers exactly its data.
    pub fn as_float(&self, op: &str) -> ExecResult<(&[usize], &[f32])> {
        match self {
            Value::Float { shape, data } if shape.iter().product::<usize>() != data.len() => {
                Err(ExecError::ShapeMismatch {
                    op: op.to_string(),
                    expected: shape.clone(),
                    got: vec![data.len()],
                })
            }
            Value::Float { shape, data } => Ok((shape, data)),
            other => Err(invalid(op, "f32 tensor", other)),
        }
    }

    pub fn as_int(&self, op: &str) -> ExecResult<&[i64]> {
        match self {
            Value::Int { data, .. } => Ok(data),
            other => Err(invalid(op, "integer tensor", other)),
        }
    }

    /// Integer scalar, e.g. a step or a count.
    pub fn as_int_scalar(&self, op: &str) -> ExecResult<i64> {
        match self.as_int(op)? {
            [x] => Ok(*x),
            _ => Err(invalid(op, "integer scalar", self)),
        }
    }

    pub fn as_handle(&self, op: &str) -> ExecResult<&str> {
        match self {
            Value::Handle(key) => Ok(key),
            other => Err(invalid(op, "resource handle", other)),
        }
    }
}

fn invalid(op: &str, expected: &str, got: &Value) -> ExecError {
    ExecError::InvalidOperand {
        op: op.to_string(),
        reason: format!("expected {expected}, got {got}"),
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Float { shape, data } => write!(f, "f32{shape:?} {data:?}"),
            Value::Int { dtype, data } => write!(f, "{dtype:?} {data:?}"),
            Value::Bool(b) => write!(f, "bool {b}"),
            Value::Handle(key) => write!(f, "handle `{key}`"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accessors() {
        let v = Value::vector(vec![1.0, 2.0]);
        assert_eq!(v.as_float("x").unwrap().0, &[2]);
        assert_eq!(v.dtype(), DType::F32);
        assert!(v.as_int("x").is_err());

        let step = Value::int(DType::I64, vec![7]);
        assert_eq!(step.as_int_scalar("x").unwrap(), 7);
        assert!(Value::int(DType::I64, vec![1, 2]).as_int_scalar("x").is_err());
    }

    #[test]
    fn test_shape_must_cover_data() {
        assert!(Value::scalar(1.0).as_float("x").is_ok());
        assert!(Value::float(vec![0, 1], Vec::new()).as_float("x").is_ok());
        assert!(matches!(
            Value::float(vec![2], vec![1.0]).as_float("x"),
            Err(ExecError::ShapeMismatch { .. })
        ));
    }
}
