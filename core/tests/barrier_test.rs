mod common;

use common::*;
use ps_sync::runtime::{Session, SharedResources, Value};
use ps_sync::synchronizer::BarrierState;
use std::sync::Arc;
use std::thread;

const NUM_REPLICAS: usize = 2;
const NUM_WORKERS: usize = 2;

fn sessions(global_step: bool) -> (Arc<Session>, Arc<Session>) {
    let resources = Arc::new(SharedResources::new());
    let chief = linear_session(&config(NUM_REPLICAS, NUM_WORKERS, 0), &resources, global_step);
    let worker = linear_session(&config(NUM_REPLICAS, NUM_WORKERS, 1), &resources, global_step);
    chief.init_variable("w", Value::vector(vec![1.0, 1.0])).unwrap();
    if global_step {
        chief
            .init_variable("global_step", Value::int(ps_sync::graph::DType::I64, vec![0]))
            .unwrap();
    }
    (Arc::new(chief), Arc::new(worker))
}

// Chief feeds 1, 2 and the worker 3, 4: the global mean gradient is 2.5.
const STEP_DELTA: f32 = LEARNING_RATE * 2.5;

fn train(session: &Session, worker_id: usize, steps: usize) {
    let feeds = replica_feeds(NUM_REPLICAS, worker_id * NUM_REPLICAS);
    for _ in 0..steps {
        session.run_targets(&["train"], &as_feeds(&feeds)).unwrap();
    }
}

#[test]
fn test_worker_waits_for_chief_update() {
    let (chief, worker) = sessions(false);

    let handle = {
        let worker = Arc::clone(&worker);
        thread::spawn(move || train(&worker, 1, 1))
    };
    wait_until("worker to block on its token", || {
        worker.barrier_state("w") == Some(BarrierState::WaitingForToken)
    });
    // nothing has been applied while only the worker ran
    assert_close(&floats(&chief.read_variable("w").unwrap()), &[1.0, 1.0]);
    assert!(!handle.is_finished());

    train(&chief, 0, 1);
    handle.join().unwrap();

    let expected = 1.0 - STEP_DELTA;
    assert_close(&floats(&chief.read_variable("w").unwrap()), &[expected, expected]);
    assert_close(&floats(&worker.read_variable("w").unwrap()), &[expected, expected]);
    assert_eq!(chief.barrier_state("w"), Some(BarrierState::Done));
    assert_eq!(worker.barrier_state("w"), Some(BarrierState::Done));
}

#[test]
fn test_update_applied_once_per_step() {
    let steps = 3;
    let (chief, worker) = sessions(false);

    let handles: Vec<_> = [(chief.clone(), 0), (worker.clone(), 1)]
        .into_iter()
        .map(|(session, id)| thread::spawn(move || train(&session, id, steps)))
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let expected = 1.0 - steps as f32 * STEP_DELTA;
    assert_close(&floats(&chief.read_variable("w").unwrap()), &[expected, expected]);
}

#[test]
fn test_global_step_counts_steps_not_workers() {
    let steps = 4;
    let (chief, worker) = sessions(true);
    assert!(worker.graph().contains("global_step_update_sync_finish_step"));
    assert!(!chief.graph().contains("global_step_update_sync_finish_step"));

    let handles: Vec<_> = [(chief.clone(), 0), (worker.clone(), 1)]
        .into_iter()
        .map(|(session, id)| thread::spawn(move || train(&session, id, steps)))
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let step = chief.read_variable("global_step").unwrap();
    assert_eq!(step.as_int_scalar("global_step").unwrap(), steps as i64);
    let expected = 1.0 - steps as f32 * STEP_DELTA;
    assert_close(&floats(&chief.read_variable("w").unwrap()), &[expected, expected]);
}

#[test]
fn test_single_worker_needs_no_token() {
    let resources = Arc::new(SharedResources::new());
    let config = config(1, 1, 0);
    let session = linear_session(&config, &resources, false);
    session.init_variable("w", Value::vector(vec![0.0, 0.0])).unwrap();
    assert!(!session.graph().contains("w_update_sync_queue_0_enqueue"));

    train(&session, 0, 2);
    assert_eq!(session.barrier_state("w"), Some(BarrierState::Done));
    assert_close(
        &floats(&session.read_variable("w").unwrap()),
        &[-2.0 * LEARNING_RATE, -2.0 * LEARNING_RATE],
    );
}

#[test]
fn test_mirrors_follow_the_master() {
    let mut config = config(2, 1, 0);
    config.local_replication = true;
    let (graph, report) = rewritten_linear_model(&config, false);
    assert_eq!(report.mirror_initializers.len(), 2);

    let session = Session::new(graph, Arc::new(SharedResources::new()), &config).unwrap();
    session.init_variable("w", Value::vector(vec![1.0, 1.0])).unwrap();
    let initializers: Vec<&str> = report.mirror_initializers.iter().map(String::as_str).collect();
    session.run_targets(&initializers, &[]).unwrap();
    assert_close(&floats(&session.read_variable("w/Replica-1-Mirror").unwrap()), &[1.0, 1.0]);

    train(&session, 0, 1);
    let master = floats(&session.read_variable("w").unwrap());
    for i in 0..2 {
        let mirror = floats(&session.read_variable(&format!("w/Replica-{i}-Mirror")).unwrap());
        assert_close(&mirror, &master);
    }
}
