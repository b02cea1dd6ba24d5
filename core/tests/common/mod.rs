#![allow(dead_code)]

use ps_sync::config::SyncConfig;
use ps_sync::graph::{ConstValue, DType, Graph, OpKind, OpSpec, TensorMeta};
use ps_sync::registry::TrainableRegistry;
use ps_sync::rewrite::{RewritePass, RewriteReport, SyncTarget};
use ps_sync::runtime::{Session, SharedResources, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const PS_DEVICE: &str = "/job:ps/task:0/device:CPU:0";
pub const LEARNING_RATE: f32 = 0.1;

pub fn config(num_replicas: usize, num_workers: usize, worker_id: usize) -> SyncConfig {
    ps_sync::logging::init_for_tests();
    SyncConfig {
        num_replicas,
        num_workers,
        worker_id,
        worker_device: format!("/job:worker/task:{worker_id}"),
        reduction_destinations: vec![PS_DEVICE.to_string()],
        local_replication: false,
    }
}

/// `w -= lr * grad` with one gradient placeholder per replica, trained by `train`.
/// With `global_step`, `train` also increments an integer step counter.
pub fn linear_model(num_replicas: usize, global_step: bool) -> Graph {
    let mut g = Graph::new();
    let w = g
        .add_op(
            OpSpec::new("w", OpKind::Variable)
                .device(PS_DEVICE)
                .output(TensorMeta::new(DType::F32, vec![2])),
        )
        .unwrap();
    let mut grads = Vec::new();
    for i in 0..num_replicas {
        let grad = g
            .add_op(
                OpSpec::new(format!("Replica-{i}/grad"), OpKind::Placeholder)
                    .output(TensorMeta::new(DType::F32, vec![2])),
            )
            .unwrap();
        grads.push(grad);
    }
    let lr = g
        .add_op(
            OpSpec::new(
                "lr",
                OpKind::Const {
                    value: ConstValue::Float(vec![LEARNING_RATE]),
                },
            )
            .output(TensorMeta::scalar(DType::F32)),
        )
        .unwrap();
    let update = g
        .add_op(
            OpSpec::new("update", OpKind::ApplyGradientDescent)
                .inputs(vec![w.output(0), lr.output(0), grads[0].output(0)]),
        )
        .unwrap();
    let mut train_deps = vec![update.id()];

    if global_step {
        let step = g
            .add_op(
                OpSpec::new("global_step", OpKind::Variable)
                    .device(PS_DEVICE)
                    .output(TensorMeta::scalar(DType::I64)),
            )
            .unwrap();
        let one = g
            .add_op(
                OpSpec::new(
                    "one",
                    OpKind::Const {
                        value: ConstValue::Int {
                            dtype: DType::I64,
                            values: vec![1],
                        },
                    },
                )
                .output(TensorMeta::scalar(DType::I64)),
            )
            .unwrap();
        let inc = g
            .add_op(OpSpec::new("step_inc", OpKind::AssignAdd).inputs(vec![step.output(0), one.output(0)]))
            .unwrap();
        train_deps.push(inc.id());
    }

    g.add_op(OpSpec::new("train", OpKind::NoOp).control_inputs(train_deps))
        .unwrap();
    g
}

pub fn linear_targets(global_step: bool) -> Vec<SyncTarget> {
    let mut targets = vec![SyncTarget::new("w", &["grad:0"], "update")];
    if global_step {
        targets.push(SyncTarget::new("global_step", &[], "step_inc"));
    }
    targets
}

/// Builds and rewrites one worker's copy of [`linear_model`].
pub fn rewritten_linear_model(config: &SyncConfig, global_step: bool) -> (Graph, RewriteReport) {
    let mut graph = linear_model(config.num_replicas, global_step);
    let mut registry = TrainableRegistry::new();
    registry.register_trainable(&graph, "w").unwrap();
    if global_step {
        registry.register_global_step(&graph, "global_step").unwrap();
    }
    let report = RewritePass::new(config.clone(), registry)
        .run(&mut graph, &linear_targets(global_step))
        .unwrap();
    (graph, report)
}

pub fn linear_session(config: &SyncConfig, resources: &Arc<SharedResources>, global_step: bool) -> Session {
    let (graph, _) = rewritten_linear_model(config, global_step);
    Session::new(graph, Arc::clone(resources), config).unwrap()
}

/// Feeds `[g, g]` to every replica, with `g = base + replica + 1`.
pub fn replica_feeds(num_replicas: usize, base: usize) -> Vec<(String, Value)> {
    (0..num_replicas)
        .map(|i| {
            let g = (base + i + 1) as f32;
            (format!("Replica-{i}/grad"), Value::vector(vec![g, g]))
        })
        .collect()
}

pub fn as_feeds(feeds: &[(String, Value)]) -> Vec<(&str, Value)> {
    feeds.iter().map(|(n, v)| (n.as_str(), v.clone())).collect()
}

pub fn floats(value: &Value) -> Vec<f32> {
    value.as_float("test").unwrap().1.to_vec()
}

pub fn assert_close(actual: &[f32], expected: &[f32]) {
    assert_eq!(actual.len(), expected.len(), "{actual:?} vs {expected:?}");
    for (a, e) in actual.iter().zip(expected) {
        assert!((a - e).abs() < 1e-5, "expected {expected:?}, got {actual:?}");
    }
}

/// Polls `condition` until it holds, failing the test after a few seconds.
pub fn wait_until<F: Fn() -> bool>(what: &str, condition: F) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(5));
    }
}
