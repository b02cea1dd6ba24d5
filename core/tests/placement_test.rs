mod common;

use common::*;
use ps_sync::error::SyncError;
use ps_sync::graph::{DType, DeviceSpec, Graph, OpKind, OpSpec, TensorMeta};
use ps_sync::registry::TrainableRegistry;
use ps_sync::rewrite::{RewritePass, RewriteReport, SyncTarget};
use ps_sync::synchronizer::{
    GradientSpec, PsGradientTaskAssigner, PsSynchronizer, ResourceVariableReplicator, Synchronizer,
    TaskSlot, SHARED_TASK_FALLBACK,
};
use std::collections::BTreeMap;

const FIXTURE: &str = include_str!("fixtures/two_variables.json");
const TARGETS: &str = include_str!("fixtures/two_variables_targets.json");

fn rewrite_fixture(worker_id: usize) -> (Graph, RewriteReport) {
    let mut graph = Graph::from_json(FIXTURE).unwrap();
    let targets: Vec<SyncTarget> = serde_json::from_str(TARGETS).unwrap();
    let mut registry = TrainableRegistry::new();
    for target in &targets {
        registry.register_trainable(&graph, &target.variable).unwrap();
    }
    let report = RewritePass::new(config(2, 2, worker_id), registry)
        .run(&mut graph, &targets)
        .unwrap();
    (graph, report)
}

fn device_of(graph: &Graph, name: &str) -> String {
    graph.op(graph.op_by_name(name).unwrap()).device.clone()
}

#[test]
fn test_ops_follow_their_variable_task() {
    let (graph, report) = rewrite_fixture(0);
    assert_eq!(report.synchronized, vec!["w".to_string(), "b".to_string()]);

    assert_eq!(device_of(&graph, "update_w"), "/job:ps/task:1/device:CPU:0");
    assert_eq!(device_of(&graph, "update_b"), "/job:ps/task:0/device:CPU:0");
    assert_eq!(device_of(&graph, "w_take_grad"), "/job:ps/task:1/device:CPU:0");

    let task = |name: &str| report.assignment[&graph.op_by_name(name).unwrap()];
    assert_eq!(task("update_w"), 1);
    assert_eq!(task("w_take_grad"), 1);
    assert_eq!(task("b_take_grad"), 0);
    assert_eq!(task("w"), 1);
}

#[test]
fn test_shared_input_falls_back_to_task_zero() {
    // `lr` feeds updates on tasks 0 and 1
    let (graph, report) = rewrite_fixture(0);
    let lr = graph.op_by_name("lr").unwrap();
    assert_eq!(report.assignment[&lr], SHARED_TASK_FALLBACK);
    assert_eq!(graph.op(lr).device, "/job:ps/task:0/device:CPU:0");
}

#[test]
fn test_rewrite_is_deterministic() {
    for worker_id in [0, 1] {
        let (first, first_report) = rewrite_fixture(worker_id);
        let (second, second_report) = rewrite_fixture(worker_id);
        assert_eq!(first.to_json().unwrap(), second.to_json().unwrap());
        assert_eq!(first_report, second_report);
    }
}

#[test]
fn test_rewritten_graph_reloads() {
    let (graph, _) = rewrite_fixture(1);
    let reloaded = Graph::from_json(&graph.to_json().unwrap()).unwrap();
    assert_eq!(reloaded, graph);
    assert!(reloaded.contains("w_update_sync_queue_1_dequeue"));
}

#[test]
fn test_placement_is_idempotent() {
    let mut graph = Graph::from_json(FIXTURE).unwrap();
    let mut registry = TrainableRegistry::new();
    let mut sync = PsSynchronizer::new(&config(2, 2, 0)).unwrap();
    for (var, grad, update) in [("w", "grad_w:0", "update_w"), ("b", "grad_b:0", "update_b")] {
        let var = registry.register_trainable(&graph, var).unwrap();
        let update = graph.op_by_name(update).unwrap();
        let grad = sync
            .in_graph_apply(&mut graph, &registry, &GradientSpec::Dense(grad.to_string()), var)
            .unwrap();
        sync.between_graph_apply(&mut graph, &registry, update, Some(&grad), var, &ResourceVariableReplicator)
            .unwrap();
    }

    let first = sync.place_post_grad_agg_ops(&mut graph).unwrap();
    let placed = graph.to_json().unwrap();
    let second = sync.place_post_grad_agg_ops(&mut graph).unwrap();
    assert_eq!(first, second);
    assert_eq!(graph.to_json().unwrap(), placed);
}

fn f32_meta() -> TensorMeta {
    TensorMeta::new(DType::F32, vec![2])
}

// take_a (task 1) and take_b (task 2) both feed `sum`, which feeds one update per task.
#[test]
fn test_op_between_two_tasks_is_shared() {
    let mut g = Graph::new();
    let take_a = g.add_op(OpSpec::new("take_a", OpKind::Placeholder).output(f32_meta())).unwrap();
    let take_b = g.add_op(OpSpec::new("take_b", OpKind::Placeholder).output(f32_meta())).unwrap();
    let sum = g
        .add_op(
            OpSpec::new("sum", OpKind::AddN)
                .inputs(vec![take_a.output(0), take_b.output(0)])
                .output(f32_meta()),
        )
        .unwrap();
    let apply_a = g
        .add_op(OpSpec::new("apply_a", OpKind::NoOp).inputs(vec![sum.output(0)]))
        .unwrap();
    let apply_b = g
        .add_op(OpSpec::new("apply_b", OpKind::NoOp).inputs(vec![sum.output(0)]))
        .unwrap();

    let seeds = BTreeMap::from([
        (take_a.id(), TaskSlot::Task(1)),
        (take_b.id(), TaskSlot::Task(2)),
        (apply_a.id(), TaskSlot::Task(1)),
        (apply_b.id(), TaskSlot::Task(2)),
    ]);
    let forward = vec![take_a.id(), take_b.id()];
    let backward = vec![apply_a.id(), apply_b.id()];
    let reversed = |ops: &[usize]| ops.iter().rev().copied().collect::<Vec<_>>();
    let orders = [
        (forward.clone(), backward.clone()),
        (reversed(&forward), reversed(&backward)),
        (forward.clone(), reversed(&backward)),
    ];

    for (agg_grad_ops, apply_grad_ops) in orders {
        let mut graph = g.clone();
        let ps = DeviceSpec::parse(PS_DEVICE).unwrap();
        let assignment = PsGradientTaskAssigner::new(&graph, seeds.clone(), agg_grad_ops, apply_grad_ops, ps)
            .assign(&mut graph)
            .unwrap();

        assert_eq!(assignment[&sum.id()], SHARED_TASK_FALLBACK);
        assert_eq!(graph.op(sum.id()).device, "/job:ps/task:0/device:CPU:0");
        assert_eq!(assignment[&apply_a.id()], 1);
        assert_eq!(assignment[&apply_b.id()], 2);
    }
}

#[test]
fn test_unseeded_update_has_no_reference() {
    let mut g = Graph::new();
    let take = g.add_op(OpSpec::new("take", OpKind::Placeholder).output(f32_meta())).unwrap();
    let apply = g
        .add_op(OpSpec::new("apply", OpKind::NoOp).inputs(vec![take.output(0)]))
        .unwrap();

    let seeds = BTreeMap::from([(take.id(), TaskSlot::Task(0))]);
    let ps = DeviceSpec::parse(PS_DEVICE).unwrap();
    let err = PsGradientTaskAssigner::new(&g, seeds, vec![take.id()], vec![apply.id()], ps)
        .assign(&mut g)
        .unwrap_err();
    assert!(matches!(err, SyncError::NoPlacementReference { op } if op == "apply"));
}
