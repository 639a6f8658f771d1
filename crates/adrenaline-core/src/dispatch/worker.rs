//! Background compile queue
//!
//! A bounded set of named threads pops jobs from a priority queue: `hot` functions first,
//! then in submission order. The queue also tracks outstanding work so callers can wait
//! until every queued compilation has finished.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};
use tracing::warn;

use crate::analysis::typed::ValueKind;

use super::entry::Entry;

/// One pending compilation
pub(crate) struct Job {
    pub entry: Arc<Entry>,
    pub kinds: Vec<ValueKind>,
    pub hot: bool,
    seq: u64,
}

impl PartialEq for Job {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Job {}

impl PartialOrd for Job {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Job {
    // Max-heap: hot before cold, then earlier submissions first
    fn cmp(&self, other: &Self) -> Ordering {
        self.hot
            .cmp(&other.hot)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct QueueState {
    jobs: BinaryHeap<Job>,
    next_seq: u64,
    /// Queued plus running
    outstanding: usize,
    shutdown: bool,
}

#[derive(Default)]
pub(crate) struct CompileQueue {
    state: Mutex<QueueState>,
    ready: Condvar,
    idle: Condvar,
}

impl CompileQueue {
    pub fn push(&self, entry: Arc<Entry>, kinds: Vec<ValueKind>, hot: bool) {
        let mut state = self.state.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.outstanding += 1;
        state.jobs.push(Job {
            entry,
            kinds,
            hot,
            seq,
        });
        self.ready.notify_one();
    }

    /// Block until a job is available; `None` once the queue is shut down
    pub fn pop(&self) -> Option<Job> {
        let mut state = self.state.lock();
        loop {
            if state.shutdown {
                return None;
            }
            if let Some(job) = state.jobs.pop() {
                return Some(job);
            }
            self.ready.wait(&mut state);
        }
    }

    /// Mark a popped job as finished
    pub fn done(&self) {
        let mut state = self.state.lock();
        state.outstanding = state.outstanding.saturating_sub(1);
        if state.outstanding == 0 {
            self.idle.notify_all();
        }
    }

    pub fn wait_idle(&self) {
        let mut state = self.state.lock();
        while state.outstanding > 0 && !state.shutdown {
            self.idle.wait(&mut state);
        }
    }

    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        state.shutdown = true;
        state.outstanding = state.outstanding.saturating_sub(state.jobs.len());
        state.jobs.clear();
        self.ready.notify_all();
        self.idle.notify_all();
    }

    #[cfg(test)]
    fn try_pop(&self) -> Option<Job> {
        self.state.lock().jobs.pop()
    }
}

/// Start `count` workers running `run` for every job; returns the handles that started
pub(crate) fn spawn_workers(
    count: usize,
    queue: &Arc<CompileQueue>,
    run: Arc<dyn Fn(Job) + Send + Sync>,
) -> Vec<JoinHandle<()>> {
    (0..count)
        .filter_map(|i| {
            let queue = Arc::clone(queue);
            let run = Arc::clone(&run);
            std::thread::Builder::new()
                .name(format!("adrenaline-compile-{i}"))
                .spawn(move || {
                    while let Some(job) = queue.pop() {
                        run(job);
                        queue.done();
                    }
                })
                .map_err(|e| warn!(event = "worker_spawn_failed", error = %e))
                .ok()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::entry::Entry;
    use crate::host::{FunctionSource, HostProgram};
    use crate::unit::FunctionUnit;

    fn entry(name: &str) -> Arc<Entry> {
        let program = HostProgram::from_source(&format!("def {name}():\n    return 1\n"), 100).unwrap();
        Arc::new(Entry::new(Arc::new(FunctionUnit::new(program.function(name).unwrap())), 0, Arc::default()))
    }

    #[test]
    fn hot_jobs_jump_the_queue() {
        let queue = CompileQueue::default();
        queue.push(entry("a"), Vec::new(), false);
        queue.push(entry("b"), Vec::new(), true);
        queue.push(entry("c"), Vec::new(), false);
        let order: Vec<String> = std::iter::from_fn(|| queue.try_pop())
            .map(|job| job.entry.unit.name.clone())
            .collect();
        assert_eq!(order, ["b", "a", "c"]);
    }

    #[test]
    fn workers_drain_the_queue() {
        let queue = Arc::new(CompileQueue::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handles = spawn_workers(
            2,
            &queue,
            Arc::new(move |job: Job| sink.lock().push(job.entry.unit.name.clone())),
        );
        for name in ["a", "b", "c", "d"] {
            queue.push(entry(name), Vec::new(), false);
        }
        queue.wait_idle();
        assert_eq!(seen.lock().len(), 4);
        queue.shutdown();
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
