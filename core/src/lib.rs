//! # ps-sync
//!
//! `ps-sync` rewrites a replicated dataflow graph so that its variables are trained
//! synchronously through parameter servers. Each worker rewrites its own copy of the graph;
//! the rewritten graphs then cooperate through shared accumulators and token queues.
//!
//! For every synchronized variable the rewrite:
//! 1. averages the replica gradients on the worker (dense `AddN`/`RealDiv`, or a sparse
//!    accumulator),
//! 2. feeds the result into a cross-worker accumulator colocated with the variable,
//! 3. wraps the variable update in a chief/worker token barrier,
//! 4. places everything between the accumulator and the update on a parameter-server task.
//!
//! ## Modules
//!
//! - [`graph`]: Arena dataflow graph, device strings and traversals.
//! - [`registry`]: Trainable variables and the optional global step.
//! - [`synchronizer`]: The rewrite stages and the parameter-server task assigner.
//! - [`rewrite`]: One-call rewrite pass over a list of targets.
//! - [`runtime`]: A small CPU interpreter for executing rewritten graphs.
//! - [`config`], [`logging`], [`error`]: Ambient plumbing.
//!
//! ## Example
//!
//! ```rust
//! use ps_sync::graph::{DeviceSpec, Graph};
//!
//! let device: DeviceSpec = "/job:ps/task:1/device:CPU:0".parse().unwrap();
//! assert_eq!(device.task_or_default(), 1);
//! assert!(Graph::new().is_empty());
//! ```

pub mod config;
pub mod error;
pub mod graph;
pub mod logging;
pub mod registry;
pub mod rewrite;
pub mod runtime;
pub mod synchronizer;

pub use config::SyncConfig;
pub use error::{ExecError, Result, SyncError};
pub use graph::{DeviceSpec, Graph, OpId, TensorRef};
pub use registry::TrainableRegistry;
pub use rewrite::{RewritePass, RewriteReport, SyncTarget};
pub use runtime::{Session, SharedResources, Value};
pub use synchronizer::{PsSynchronizer, Synchronizer};
