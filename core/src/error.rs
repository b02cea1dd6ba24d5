//! Error types for the rewrite engine.
//!
//! Every fatal condition aborts the whole rewrite pass: a partially synchronized graph is
//! never safe to execute, so nothing here is retried. Each variant carries enough context
//! (operation or variable name) to locate the offending subgraph.

use thiserror::Error;

/// Error type for graph rewriting.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The gradient is neither a single dense tensor nor a `(values, indices, dense_shape)` triple.
    #[error("invalid gradient for `{target}`: expected 1 dense tensor or a 3-tensor sparse triple, got {parts} tensor(s)")]
    InvalidGradientKind { target: String, parts: usize },

    /// An operation in the placement subgraph has no resolvable reference operations.
    #[error("no placement reference for operation `{op}`")]
    NoPlacementReference { op: String },

    /// More than one shared step counter is registered.
    #[error("expected at most one global step registration, found {found}")]
    MissingGlobalStepInvariant { found: usize },

    /// No operation with the given name exists in the graph.
    #[error("operation `{0}` not found")]
    OpNotFound(String),

    /// A tensor name is not of the form `op_name:index`.
    #[error("malformed tensor name `{0}`")]
    MalformedTensorName(String),

    /// A tensor index is out of range for its producing operation.
    #[error("operation `{op}` has no output {index}")]
    OutputOutOfRange { op: String, index: usize },

    /// A device string could not be parsed.
    #[error("invalid device `{device}`: {reason}")]
    InvalidDevice { device: String, reason: String },

    /// An update operation does not read a variable at its variable position.
    #[error("update operation `{0}` has no variable input")]
    MissingVariableInput(String),

    /// Configuration could not be loaded or is inconsistent.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Graph fixture could not be (de)serialized.
    #[error("graph serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SyncError>;

impl From<figment::Error> for SyncError {
    fn from(err: figment::Error) -> Self {
        SyncError::Config(err.to_string())
    }
}

/// Error type for the reference runtime.
#[derive(Error, Debug)]
pub enum ExecError {
    /// A placeholder was reached without a fed value.
    #[error("no value fed for placeholder `{0}`")]
    MissingFeed(String),

    /// An operand has the wrong kind of value for the operation.
    #[error("invalid operand for `{op}`: {reason}")]
    InvalidOperand { op: String, reason: String },

    /// Operand shapes are incompatible.
    #[error("shape mismatch in `{op}`: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        op: String,
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    /// A variable was read before being assigned.
    #[error("variable `{0}` is not initialized")]
    UninitializedVariable(String),

    /// A handle refers to a resource that was never created.
    #[error("resource `{0}` not found")]
    ResourceNotFound(String),

    /// The token queue was torn down while in use.
    #[error("queue `{0}` closed")]
    QueueClosed(String),

    /// A thread panicked while holding a resource lock.
    #[error("lock on `{0}` poisoned")]
    Poisoned(String),

    #[error(transparent)]
    Graph(#[from] SyncError),
}

pub type ExecResult<T> = std::result::Result<T, ExecError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SyncError::InvalidGradientKind {
            target: "w".to_string(),
            parts: 2,
        };
        assert_eq!(
            err.to_string(),
            "invalid gradient for `w`: expected 1 dense tensor or a 3-tensor sparse triple, got 2 tensor(s)"
        );

        let err = SyncError::NoPlacementReference {
            op: "PsSync-Add/grad".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "no placement reference for operation `PsSync-Add/grad`"
        );
    }

    #[test]
    fn test_exec_error_wraps_graph_error() {
        let err: ExecError = SyncError::OpNotFound("train".to_string()).into();
        assert_eq!(err.to_string(), "operation `train` not found");
    }

    #[test]
    fn test_global_step_invariant_display() {
        let err = SyncError::MissingGlobalStepInvariant { found: 2 };
        assert!(err.to_string().contains("found 2"));
    }
}
