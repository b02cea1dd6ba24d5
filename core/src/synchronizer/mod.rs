//! # Gradient Synchronization
//!
//! Turns a graph with `N` per-replica gradient copies into one that trains synchronously
//! across `W` workers sharing parameter-server variables.
//!
//! ## Stages
//!
//! 1.  **In-graph aggregation** ([`Synchronizer::in_graph_apply`]): the `N` replica gradients
//!     on one worker are combined on the worker CPU (dense: sum then divide by `N`; sparse:
//!     one accumulator fed by every replica).
//! 2.  **Between-graph accumulation** ([`Synchronizer::between_graph_apply`]): each worker
//!     applies its aggregated gradient to a shared accumulator next to the variable, and the
//!     update consumes the accumulator's take.
//! 3.  **Barrier**: the chief performs the update and hands one token to every other worker
//!     through a single-slot queue; the update's control consumers wait on the barrier.
//! 4.  **Placement** ([`PsSynchronizer::place_post_grad_agg_ops`]): every op between an
//!     accumulator take and a variable update is pinned to one parameter-server task.
//!
//! ## Module Contents
//!
//! *   [`PsSynchronizer`]: the parameter-server implementation of [`Synchronizer`].
//! *   [`PsGradientTaskAssigner`]: the bidirectional placement traversal.
//! *   [`VariableReplicator`]: the collaborator producing local mirror variables.

pub mod accumulation;
pub mod aggregation;
pub mod barrier;
pub mod gradient;
pub mod placement;
pub mod ps;
pub mod replicator;

pub use barrier::{BarrierRole, BarrierState};
pub use gradient::{Gradient, GradientSpec, SparseGradient};
pub use placement::{PsGradientTaskAssigner, TaskAssignment, TaskSlot, SHARED_TASK_FALLBACK};
pub use ps::PsSynchronizer;
pub use replicator::{MirrorVars, ResourceVariableReplicator, VariableReplicator};

use crate::error::Result;
use crate::graph::{Graph, OpId};
use crate::registry::TrainableRegistry;

/// Prefix of every name the synchronizer generates for aggregation ops.
pub const SYNC_PREFIX: &str = "PsSync-";

/// Local step attached to every accumulator contribution; accepted unconditionally.
pub const MAX_STEP: i64 = i64::MAX;

/// Input position of the variable in an update op.
pub const UPDATE_OP_VAR_POS: usize = 0;

/// Worker-local device where replica gradients are combined.
pub const REDUCE_TO_DEVICE: &str = "/device:CPU:0";

/// Graph rewriting for one synchronization strategy.
pub trait Synchronizer {
    /// Aggregates the per-replica copies of `gradient` for the variable `target`.
    ///
    /// Returns the aggregated gradient, or the replica-0 gradient unchanged when `target`
    /// is not trainable.
    fn in_graph_apply(
        &mut self,
        graph: &mut Graph,
        registry: &TrainableRegistry,
        gradient: &GradientSpec,
        target: OpId,
    ) -> Result<Gradient>;

    /// Adds cross-worker accumulation and the update barrier for `update_op`.
    ///
    /// `gradient` is `None` for values updated without a gradient (e.g. a step counter).
    /// Returns the mirror variables built for `target`, if any.
    fn between_graph_apply(
        &mut self,
        graph: &mut Graph,
        registry: &TrainableRegistry,
        update_op: OpId,
        gradient: Option<&Gradient>,
        target: OpId,
        replicator: &dyn VariableReplicator,
    ) -> Result<Option<MirrorVars>>;
}
