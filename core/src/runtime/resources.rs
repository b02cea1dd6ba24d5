//! Stateful resources shared by every session of a training job.
//!
//! Variables, accumulators and token queues are keyed by `<host>/<name>`, so two workers
//! reach the same parameter-server resource while worker-local resources stay separate.

use super::value::Value;
use crate::error::{ExecError, ExecResult};
use crate::graph::Reduction;
use crossbeam::channel::{bounded, Receiver, Sender};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use tracing::warn;

/// Result of a sparse take: unique sorted indices and their rows.
#[derive(Debug, Clone, PartialEq)]
pub struct SparseSlices {
    pub indices: Vec<i64>,
    /// `indices.len()` rows, row-major.
    pub values: Vec<f32>,
    pub dense_shape: Vec<i64>,
}

#[derive(Debug, Default)]
struct AccumState {
    step: i64,
    count: usize,
    dense: Option<Vec<f32>>,
    /// Summed rows and how many contributions touched each index.
    rows: BTreeMap<i64, (Vec<f32>, usize)>,
    row_width: usize,
    dense_shape: Vec<i64>,
}

impl AccumState {
    fn reset(&mut self) {
        self.count = 0;
        self.dense = None;
        self.rows.clear();
        self.step = self.step.saturating_add(1);
    }
}

/// Gradient accumulator.
///
/// Applies are serialized by the mutex; `take` blocks until enough contributions for the
/// current step have arrived, releases their combination and moves to the next step.
#[derive(Debug)]
pub struct Accumulator {
    name: String,
    reduction: Reduction,
    shape: Vec<usize>,
    state: Mutex<AccumState>,
    ready: Condvar,
}

impl Accumulator {
    pub fn new(name: impl Into<String>, reduction: Reduction, shape: Vec<usize>) -> Self {
        Self {
            name: name.into(),
            reduction,
            shape,
            state: Mutex::new(AccumState::default()),
            ready: Condvar::new(),
        }
    }

    /// Step of the contributions currently accepted.
    pub fn step(&self) -> ExecResult<i64> {
        Ok(self.lock()?.step)
    }

    fn lock(&self) -> ExecResult<MutexGuard<'_, AccumState>> {
        self.state
            .lock()
            .map_err(|_| ExecError::Poisoned(self.name.clone()))
    }

    fn is_stale(&self, state: &AccumState, local_step: i64) -> bool {
        if local_step < state.step {
            warn!(
                accumulator = %self.name,
                local_step,
                step = state.step,
                "stale gradient dropped"
            );
            return true;
        }
        false
    }

    /// Adds a dense contribution. Returns `false` when it was dropped as stale.
    pub fn apply_dense(&self, local_step: i64, grad: &[f32]) -> ExecResult<bool> {
        let mut state = self.lock()?;
        if self.is_stale(&state, local_step) {
            return Ok(false);
        }
        match state.dense.as_mut() {
            Some(sum) => {
                if sum.len() != grad.len() {
                    return Err(ExecError::ShapeMismatch {
                        op: self.name.clone(),
                        expected: vec![sum.len()],
                        got: vec![grad.len()],
                    });
                }
                sum.iter_mut().zip(grad).for_each(|(s, g)| *s += g);
            }
            None => state.dense = Some(grad.to_vec()),
        }
        state.count += 1;
        self.ready.notify_all();
        Ok(true)
    }

    /// Adds a sparse contribution, summing rows that share an index.
    pub fn apply_sparse(
        &self,
        local_step: i64,
        indices: &[i64],
        values: &[f32],
        dense_shape: &[i64],
    ) -> ExecResult<bool> {
        let row_width = match indices.len() {
            0 => 0,
            n if values.len() % n == 0 => values.len() / n,
            n => {
                return Err(ExecError::ShapeMismatch {
                    op: self.name.clone(),
                    expected: vec![n],
                    got: vec![values.len()],
                })
            }
        };

        let mut state = self.lock()?;
        if self.is_stale(&state, local_step) {
            return Ok(false);
        }
        if row_width > 0 {
            if state.row_width != 0 && state.row_width != row_width {
                return Err(ExecError::ShapeMismatch {
                    op: self.name.clone(),
                    expected: vec![state.row_width],
                    got: vec![row_width],
                });
            }
            state.row_width = row_width;
        }
        for (k, &index) in indices.iter().enumerate() {
            let row = &values[k * row_width..(k + 1) * row_width];
            state
                .rows
                .entry(index)
                .and_modify(|(acc, touched)| {
                    acc.iter_mut().zip(row).for_each(|(a, v)| *a += v);
                    *touched += 1;
                })
                .or_insert_with(|| (row.to_vec(), 1));
        }
        if !dense_shape.is_empty() {
            state.dense_shape = dense_shape.to_vec();
        }
        state.count += 1;
        self.ready.notify_all();
        Ok(true)
    }

    fn wait_for(&self, num_required: usize) -> ExecResult<MutexGuard<'_, AccumState>> {
        let guard = self.lock()?;
        self.ready
            .wait_while(guard, |s| s.count < num_required)
            .map_err(|_| ExecError::Poisoned(self.name.clone()))
    }

    fn scale(&self, count: usize) -> f32 {
        match self.reduction {
            Reduction::Mean if count > 0 => 1.0 / count as f32,
            _ => 1.0,
        }
    }

    /// Blocks until `num_required` dense contributions arrived, then returns their reduction.
    pub fn take_dense(&self, num_required: usize) -> ExecResult<Vec<f32>> {
        let mut state = self.wait_for(num_required)?;
        let scale = self.scale(state.count);
        let result = state
            .dense
            .take()
            .unwrap_or_else(|| vec![0.0; self.shape.iter().product()])
            .into_iter()
            .map(|x| x * scale)
            .collect();
        state.reset();
        Ok(result)
    }

    /// Blocks until `num_required` sparse contributions arrived, then returns their reduction.
    ///
    /// A `Mean` divides each row by the number of contributions that touched its index, not
    /// by the total contribution count.
    pub fn take_sparse(&self, num_required: usize) -> ExecResult<SparseSlices> {
        let mut state = self.wait_for(num_required)?;
        let rows = std::mem::take(&mut state.rows);
        let mut indices = Vec::with_capacity(rows.len());
        let mut values = Vec::with_capacity(rows.len() * state.row_width);
        for (index, (row, touched)) in rows {
            let scale = self.scale(touched);
            indices.push(index);
            values.extend(row.into_iter().map(|x| x * scale));
        }
        let dense_shape = if state.dense_shape.is_empty() {
            self.shape.iter().map(|&d| d as i64).collect()
        } else {
            state.dense_shape.clone()
        };
        state.reset();
        Ok(SparseSlices {
            indices,
            values,
            dense_shape,
        })
    }
}

/// Bounded blocking queue of tokens.
#[derive(Debug)]
pub struct TokenQueue {
    name: String,
    tx: Sender<Value>,
    rx: Receiver<Value>,
}

impl TokenQueue {
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity);
        Self {
            name: name.into(),
            tx,
            rx,
        }
    }

    /// Blocks while the queue is full.
    pub fn enqueue(&self, token: Value) -> ExecResult<()> {
        self.tx
            .send(token)
            .map_err(|_| ExecError::QueueClosed(self.name.clone()))
    }

    /// Blocks while the queue is empty.
    pub fn dequeue(&self) -> ExecResult<Value> {
        self.rx
            .recv()
            .map_err(|_| ExecError::QueueClosed(self.name.clone()))
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

/// Resources of one training job, shared by all sessions.
#[derive(Debug, Default)]
pub struct SharedResources {
    variables: Mutex<HashMap<String, Value>>,
    accumulators: Mutex<HashMap<String, Arc<Accumulator>>>,
    queues: Mutex<HashMap<String, Arc<TokenQueue>>>,
}

fn poisoned<T>(what: &str) -> impl FnOnce(T) -> ExecError + '_ {
    move |_| ExecError::Poisoned(what.to_string())
}

impl SharedResources {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read_variable(&self, key: &str) -> ExecResult<Value> {
        self.variables
            .lock()
            .map_err(poisoned("variables"))?
            .get(key)
            .cloned()
            .ok_or_else(|| ExecError::UninitializedVariable(key.to_string()))
    }

    pub fn write_variable(&self, key: &str, value: Value) -> ExecResult<()> {
        self.variables
            .lock()
            .map_err(poisoned("variables"))?
            .insert(key.to_string(), value);
        Ok(())
    }

    /// Applies `f` to the variable under the lock.
    pub fn update_variable<F>(&self, key: &str, f: F) -> ExecResult<()>
    where
        F: FnOnce(&mut Value) -> ExecResult<()>,
    {
        let mut variables = self.variables.lock().map_err(poisoned("variables"))?;
        let value = variables
            .get_mut(key)
            .ok_or_else(|| ExecError::UninitializedVariable(key.to_string()))?;
        f(value)
    }

    /// Returns the accumulator under `key`, creating it on first use.
    pub fn accumulator(&self, key: &str, reduction: Reduction, shape: &[usize]) -> ExecResult<Arc<Accumulator>> {
        let mut accumulators = self.accumulators.lock().map_err(poisoned("accumulators"))?;
        Ok(accumulators
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Accumulator::new(key, reduction, shape.to_vec())))
            .clone())
    }

    pub fn get_accumulator(&self, key: &str) -> ExecResult<Arc<Accumulator>> {
        self.accumulators
            .lock()
            .map_err(poisoned("accumulators"))?
            .get(key)
            .cloned()
            .ok_or_else(|| ExecError::ResourceNotFound(key.to_string()))
    }

    /// Returns the queue under `key`, creating it on first use.
    pub fn queue(&self, key: &str, capacity: usize) -> ExecResult<Arc<TokenQueue>> {
        let mut queues = self.queues.lock().map_err(poisoned("queues"))?;
        Ok(queues
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(TokenQueue::new(key, capacity.max(1))))
            .clone())
    }

    pub fn get_queue(&self, key: &str) -> ExecResult<Arc<TokenQueue>> {
        self.queues
            .lock()
            .map_err(poisoned("queues"))?
            .get(key)
            .cloned()
            .ok_or_else(|| ExecError::ResourceNotFound(key.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_dense_mean() {
        let acc = Accumulator::new("a", Reduction::Mean, vec![2]);
        acc.apply_dense(i64::MAX, &[1.0, 3.0]).unwrap();
        acc.apply_dense(i64::MAX, &[3.0, 5.0]).unwrap();
        assert_eq!(acc.take_dense(2).unwrap(), vec![2.0, 4.0]);
        assert_eq!(acc.step().unwrap(), 1);
    }

    #[test]
    fn test_stale_contribution_dropped() {
        let acc = Accumulator::new("a", Reduction::Sum, vec![1]);
        acc.apply_dense(0, &[1.0]).unwrap();
        acc.take_dense(1).unwrap();
        assert!(!acc.apply_dense(0, &[5.0]).unwrap());
        assert!(acc.apply_dense(1, &[2.0]).unwrap());
        assert_eq!(acc.take_dense(1).unwrap(), vec![2.0]);
    }

    #[test]
    fn test_sparse_sum_by_index() {
        let acc = Accumulator::new("s", Reduction::Sum, vec![6, 2]);
        acc.apply_sparse(i64::MAX, &[0, 2], &[1.0, 1.0, 2.0, 2.0], &[6, 2]).unwrap();
        acc.apply_sparse(i64::MAX, &[2, 5], &[3.0, 3.0, 4.0, 4.0], &[6, 2]).unwrap();
        let taken = acc.take_sparse(2).unwrap();
        assert_eq!(taken.indices, vec![0, 2, 5]);
        assert_eq!(taken.values, vec![1.0, 1.0, 5.0, 5.0, 4.0, 4.0]);
        assert_eq!(taken.dense_shape, vec![6, 2]);
    }

    #[test]
    fn test_sparse_mean_per_index() {
        let acc = Accumulator::new("s", Reduction::Mean, vec![6, 1]);
        acc.apply_sparse(i64::MAX, &[0, 2], &[2.0, 6.0], &[6, 1]).unwrap();
        acc.apply_sparse(i64::MAX, &[2, 5], &[2.0, 4.0], &[6, 1]).unwrap();
        let taken = acc.take_sparse(2).unwrap();
        // rows 0 and 5 came from one contribution each, row 2 from both
        assert_eq!(taken.indices, vec![0, 2, 5]);
        assert_eq!(taken.values, vec![2.0, 4.0, 4.0]);
    }

    #[test]
    fn test_take_blocks_until_all_applied() {
        let acc = Arc::new(Accumulator::new("a", Reduction::Mean, vec![1]));
        let taker = {
            let acc = Arc::clone(&acc);
            thread::spawn(move || acc.take_dense(2).unwrap())
        };
        acc.apply_dense(i64::MAX, &[2.0]).unwrap();
        thread::sleep(Duration::from_millis(20));
        assert!(!taker.is_finished());
        acc.apply_dense(i64::MAX, &[4.0]).unwrap();
        assert_eq!(taker.join().unwrap(), vec![3.0]);
    }

    #[test]
    fn test_queue_is_single_slot() {
        let q = TokenQueue::new("q", 1);
        q.enqueue(Value::Bool(false)).unwrap();
        assert_eq!(q.len(), 1);
        assert!(q.tx.try_send(Value::Bool(false)).is_err());
        assert_eq!(q.dequeue().unwrap(), Value::Bool(false));
        assert!(q.is_empty());
    }

    #[test]
    fn test_shared_resources_reuse_by_key() {
        let res = SharedResources::new();
        let a = res.accumulator("/job:ps/task:0/w/grad_accum", Reduction::Mean, &[2]).unwrap();
        let b = res.accumulator("/job:ps/task:0/w/grad_accum", Reduction::Mean, &[2]).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(matches!(
            res.read_variable("missing"),
            Err(ExecError::UninitializedVariable(_))
        ));
    }
}
