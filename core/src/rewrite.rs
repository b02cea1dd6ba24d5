//! The rewrite pass.
//!
//! One pass rewrites one worker's graph: for every synchronized value it aggregates the
//! replica gradients, adds cross-worker accumulation and the update barrier, and finally
//! places every aggregation and update op on a parameter-server task. Any error aborts the
//! whole pass; a partially rewritten graph must not be executed.
//!
//! ```rust
//! use ps_sync::config::SyncConfig;
//! use ps_sync::graph::{ConstValue, DType, Graph, OpKind, OpSpec, TensorMeta};
//! use ps_sync::registry::TrainableRegistry;
//! use ps_sync::rewrite::{RewritePass, SyncTarget};
//!
//! let mut graph = Graph::new();
//! let w = graph
//!     .add_op(OpSpec::new("w", OpKind::Variable).device("/job:ps/task:0/device:CPU:0").output(TensorMeta::new(DType::F32, vec![2])))
//!     .unwrap();
//! let grad = graph
//!     .add_op(OpSpec::new("Replica-0/grad", OpKind::Placeholder).output(TensorMeta::new(DType::F32, vec![2])))
//!     .unwrap();
//! let lr = graph
//!     .add_op(OpSpec::new("lr", OpKind::Const { value: ConstValue::Float(vec![0.1]) }).output(TensorMeta::scalar(DType::F32)))
//!     .unwrap();
//! graph
//!     .add_op(OpSpec::new("update", OpKind::ApplyGradientDescent).inputs(vec![w.output(0), lr.output(0), grad.output(0)]))
//!     .unwrap();
//!
//! let mut registry = TrainableRegistry::new();
//! registry.register_trainable(&graph, "w").unwrap();
//!
//! let config = SyncConfig {
//!     reduction_destinations: vec!["/job:ps/task:0/device:CPU:0".to_string()],
//!     ..SyncConfig::default()
//! };
//! let report = RewritePass::new(config, registry)
//!     .run(&mut graph, &[SyncTarget::new("w", &["grad:0"], "update")])
//!     .unwrap();
//! assert_eq!(report.synchronized, vec!["w".to_string()]);
//! assert!(graph.contains("w_take_grad"));
//! ```

use crate::config::SyncConfig;
use crate::error::Result;
use crate::graph::Graph;
use crate::registry::TrainableRegistry;
use crate::synchronizer::{
    GradientSpec, PsSynchronizer, ResourceVariableReplicator, Synchronizer, TaskAssignment,
    VariableReplicator,
};
use serde::{Deserialize, Serialize};
use tracing::{info, info_span};

/// A value to synchronize, named in the single-replica graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncTarget {
    /// The variable op.
    pub variable: String,
    /// One dense tensor, or `values, indices, dense_shape`. Empty for values updated
    /// without a gradient, such as a step counter.
    #[serde(default)]
    pub gradient: Vec<String>,
    /// The op applying the update; reads the variable at input 0.
    pub update_op: String,
}

impl SyncTarget {
    pub fn new(variable: &str, gradient: &[&str], update_op: &str) -> Self {
        Self {
            variable: variable.to_string(),
            gradient: gradient.iter().map(|g| g.to_string()).collect(),
            update_op: update_op.to_string(),
        }
    }
}

/// Outcome of a rewrite pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RewriteReport {
    /// Trainable values that got the full treatment.
    pub synchronized: Vec<String>,
    /// Values absent from the trainable registry: barrier only.
    pub skipped: Vec<String>,
    /// Ops that must run once before training to seed mirror variables.
    pub mirror_initializers: Vec<String>,
    pub assignment: TaskAssignment,
}

/// Rewrites one worker's graph for synchronous parameter-server training.
pub struct RewritePass {
    config: SyncConfig,
    registry: TrainableRegistry,
    replicator: Box<dyn VariableReplicator>,
}

impl RewritePass {
    pub fn new(config: SyncConfig, registry: TrainableRegistry) -> Self {
        Self {
            config,
            registry,
            replicator: Box::new(ResourceVariableReplicator),
        }
    }

    pub fn with_replicator(mut self, replicator: Box<dyn VariableReplicator>) -> Self {
        self.replicator = replicator;
        self
    }

    /// Rewrites `graph` in place. The registry is consumed with the pass.
    pub fn run(self, graph: &mut Graph, targets: &[SyncTarget]) -> Result<RewriteReport> {
        let span = info_span!("rewrite", worker = self.config.worker_id);
        let _enter = span.enter();

        self.config.validate()?;
        self.registry.global_step()?;
        let mut synchronizer = PsSynchronizer::new(&self.config)?;
        let mut report = RewriteReport::default();

        for target in targets {
            let var = graph.op_by_name(&target.variable)?;
            let update = graph.op_by_name(&target.update_op)?;
            let gradient = if target.gradient.is_empty() {
                None
            } else {
                let spec = GradientSpec::from_names(&target.variable, &target.gradient)?;
                Some(synchronizer.in_graph_apply(graph, &self.registry, &spec, var)?)
            };

            let mirrors = synchronizer.between_graph_apply(
                graph,
                &self.registry,
                update,
                gradient.as_ref(),
                var,
                self.replicator.as_ref(),
            )?;
            if let Some(mirrors) = mirrors {
                report
                    .mirror_initializers
                    .extend(mirrors.initializers.iter().map(|id| graph.op(*id).name.clone()));
            }

            if self.registry.is_trainable(var) {
                report.synchronized.push(target.variable.clone());
            } else {
                report.skipped.push(target.variable.clone());
            }
        }

        report.assignment = synchronizer.place_post_grad_agg_ops(graph)?;
        info!(
            synchronized = report.synchronized.len(),
            skipped = report.skipped.len(),
            placed = report.assignment.len(),
            "rewrite finished"
        );
        Ok(report)
    }
}
