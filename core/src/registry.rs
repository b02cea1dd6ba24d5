//! Trainable-value registry.
//!
//! The rewrite pass receives the set of trainable variables (and the optional shared step
//! counter) explicitly, as a value built once when the pass starts and dropped when it ends.

use crate::error::{Result, SyncError};
use crate::graph::{Graph, OpId, TensorMeta};
use std::collections::BTreeMap;

/// A registered trainable value.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainableVar {
    /// The variable operation holding the value.
    pub op: OpId,
    pub name: String,
    pub meta: TensorMeta,
}

/// Registry of trainable values and step counters for one rewrite pass.
#[derive(Debug, Clone, Default)]
pub struct TrainableRegistry {
    trainable: BTreeMap<OpId, TrainableVar>,
    global_steps: Vec<OpId>,
}

impl TrainableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the variable named `name` as trainable.
    pub fn register_trainable(&mut self, graph: &Graph, name: &str) -> Result<OpId> {
        let op = graph.op_by_name(name)?;
        let meta = graph
            .op(op)
            .outputs
            .first()
            .cloned()
            .ok_or_else(|| SyncError::OutputOutOfRange {
                op: name.to_string(),
                index: 0,
            })?;
        self.trainable.insert(
            op,
            TrainableVar {
                op,
                name: name.to_string(),
                meta,
            },
        );
        Ok(op)
    }

    /// Registers the shared step counter. Registering more than one is an error
    /// surfaced by [`TrainableRegistry::global_step`].
    pub fn register_global_step(&mut self, graph: &Graph, name: &str) -> Result<OpId> {
        let op = graph.op_by_name(name)?;
        if !self.global_steps.contains(&op) {
            self.global_steps.push(op);
        }
        Ok(op)
    }

    pub fn is_trainable(&self, op: OpId) -> bool {
        self.trainable.contains_key(&op)
    }

    pub fn trainable(&self, op: OpId) -> Option<&TrainableVar> {
        self.trainable.get(&op)
    }

    /// The shared step counter, if one is registered.
    pub fn global_step(&self) -> Result<Option<OpId>> {
        match self.global_steps.as_slice() {
            [] => Ok(None),
            [step] => Ok(Some(*step)),
            many => Err(SyncError::MissingGlobalStepInvariant { found: many.len() }),
        }
    }
}
