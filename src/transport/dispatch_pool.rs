use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::transport::transport_config::{PoolConfig, RejectionPolicy};


pub type PoolTask = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// why a pool turned down a task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    QueueFull,
    PoolClosed,
}

/// What happened to a submitted task. Note that [SubmitOutcome::Inline] hands the task back:
///  running it (and thereby absorbing the backpressure) is the caller's job.
pub enum SubmitOutcome {
    /// accepted; a pool worker will run it
    Queued,
    /// the caller must run the task itself
    Inline(PoolTask),
    /// dropped as configured, not an error
    Discarded,
    Rejected(RejectReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStatsSnapshot {
    pub submitted: u64,
    pub rejected: u64,
    pub discarded: u64,
    pub caller_runs: u64,
}

#[derive(Default)]
struct PoolStats {
    submitted: AtomicU64,
    rejected: AtomicU64,
    discarded: AtomicU64,
    caller_runs: AtomicU64,
}

impl PoolStats {
    fn snapshot(&self) -> PoolStatsSnapshot {
        PoolStatsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            caller_runs: self.caller_runs.load(Ordering::Relaxed),
        }
    }
}


/// A bounded executor for message processing, mirroring the classic thread pool semantics on
///  top of tokio tasks: a core of `min_workers` workers that stick around, growth up to
///  `max_workers` under load with idle workers expiring after a keep-alive, an optional
///  bounded queue, and a configurable policy for the moment both workers and queue are
///  exhausted.
///
/// A disabled pool degenerates to running every task inline on the submitting task. That is
///  not just a test convenience: it skips a buffer copy on the receive path, and for cheap
///  upper layers it outperforms the real pool.
pub struct DispatchPool {
    inner: PoolImpl,
}

enum PoolImpl {
    Direct { stats: PoolStats },
    Bounded(BoundedPool),
}

impl DispatchPool {
    pub fn new(name: &'static str, config: &PoolConfig) -> DispatchPool {
        let inner = if config.enabled {
            PoolImpl::Bounded(BoundedPool::new(name, config.clone()))
        }
        else {
            PoolImpl::Direct { stats: PoolStats::default() }
        };
        DispatchPool { inner }
    }

    /// whether tasks run inline on the submitter, i.e. whether submitting borrowed data
    ///  without copying is an option for the caller
    pub fn is_direct(&self) -> bool {
        matches!(self.inner, PoolImpl::Direct { .. })
    }

    pub fn submit(&self, task: PoolTask) -> SubmitOutcome {
        match &self.inner {
            PoolImpl::Direct { stats } => {
                stats.submitted.fetch_add(1, Ordering::Relaxed);
                stats.caller_runs.fetch_add(1, Ordering::Relaxed);
                SubmitOutcome::Inline(task)
            }
            PoolImpl::Bounded(pool) => pool.submit(task),
        }
    }

    /// Records a task the caller ran on the pool's behalf without a [DispatchPool::submit]
    ///  round trip, so inline fast paths show up in the stats like submitted tasks do.
    pub fn note_inline_run(&self) {
        let stats = match &self.inner {
            PoolImpl::Direct { stats } => stats,
            PoolImpl::Bounded(pool) => &pool.shared.stats,
        };
        stats.submitted.fetch_add(1, Ordering::Relaxed);
        stats.caller_runs.fetch_add(1, Ordering::Relaxed);
    }

    /// Refuses new tasks from now on, drops whatever is still queued and waits up to the
    ///  grace period for the workers, aborting those that do not finish in time.
    pub async fn shutdown(&self, grace: Duration) {
        if let PoolImpl::Bounded(pool) = &self.inner {
            pool.shutdown(grace).await;
        }
    }

    pub fn stats(&self) -> PoolStatsSnapshot {
        match &self.inner {
            PoolImpl::Direct { stats } => stats.snapshot(),
            PoolImpl::Bounded(pool) => pool.shared.stats.snapshot(),
        }
    }

    pub fn live_workers(&self) -> usize {
        match &self.inner {
            PoolImpl::Direct { .. } => 0,
            PoolImpl::Bounded(pool) => pool.shared.state.lock().unwrap().live_workers,
        }
    }
}


struct PoolState {
    queue: VecDeque<PoolTask>,
    live_workers: usize,
    idle_workers: usize,
    shutting_down: bool,
    worker_handles: Vec<JoinHandle<()>>,
}

struct PoolShared {
    name: &'static str,
    config: PoolConfig,
    state: Mutex<PoolState>,
    task_available: Notify,
    stats: PoolStats,
}

struct BoundedPool {
    shared: Arc<PoolShared>,
}

impl BoundedPool {
    fn new(name: &'static str, config: PoolConfig) -> BoundedPool {
        BoundedPool {
            shared: Arc::new(PoolShared {
                name,
                config,
                state: Mutex::new(PoolState {
                    queue: VecDeque::new(),
                    live_workers: 0,
                    idle_workers: 0,
                    shutting_down: false,
                    worker_handles: Vec::new(),
                }),
                task_available: Notify::new(),
                stats: PoolStats::default(),
            }),
        }
    }

    fn submit(&self, task: PoolTask) -> SubmitOutcome {
        let shared = &self.shared;
        let mut state = shared.state.lock().unwrap();

        if state.shutting_down {
            shared.stats.rejected.fetch_add(1, Ordering::Relaxed);
            return SubmitOutcome::Rejected(RejectReason::PoolClosed);
        }
        shared.stats.submitted.fetch_add(1, Ordering::Relaxed);

        // Each buffered task has already claimed a worker: one was notified (or freshly
        //  spawned) for it when it was pushed. Only workers beyond that are free - the
        //  handoff must never double-book a parked worker that has not picked up its
        //  task yet.
        let unclaimed_idle = state.idle_workers.saturating_sub(state.queue.len());

        // Workers are spawned lazily, one per submission, until the core size is reached;
        //  beyond that only when no unclaimed worker is left. A freshly spawned worker takes
        //  the new task even if the queue is momentarily full.
        let mut spawned = false;
        if state.live_workers < shared.config.min_workers
            || (unclaimed_idle == 0 && state.live_workers < shared.config.max_workers)
        {
            spawn_worker(shared, &mut state);
            spawned = true;
        }

        let accepted = spawned
            || (shared.config.queue_enabled && state.queue.len() < shared.config.queue_capacity)
            || (!shared.config.queue_enabled && unclaimed_idle > 0);

        if accepted {
            state.queue.push_back(task);
            drop(state);
            shared.task_available.notify_one();
            return SubmitOutcome::Queued;
        }

        match shared.config.rejection_policy {
            RejectionPolicy::Run => {
                shared.stats.caller_runs.fetch_add(1, Ordering::Relaxed);
                debug!("dispatch pool {} is full, running the task on the submitter", shared.name);
                SubmitOutcome::Inline(task)
            }
            RejectionPolicy::Abort => {
                shared.stats.rejected.fetch_add(1, Ordering::Relaxed);
                SubmitOutcome::Rejected(RejectReason::QueueFull)
            }
            RejectionPolicy::Discard => {
                shared.stats.discarded.fetch_add(1, Ordering::Relaxed);
                trace!("dispatch pool {} is full, discarding the new task", shared.name);
                SubmitOutcome::Discarded
            }
            RejectionPolicy::DiscardOldest => {
                shared.stats.discarded.fetch_add(1, Ordering::Relaxed);
                match state.queue.pop_front() {
                    Some(oldest) => {
                        trace!("dispatch pool {} is full, discarding the oldest queued task", shared.name);
                        drop(oldest);
                        state.queue.push_back(task);
                        drop(state);
                        shared.task_available.notify_one();
                        SubmitOutcome::Queued
                    }
                    // nothing queued to evict (queue disabled or capacity zero)
                    None => SubmitOutcome::Discarded,
                }
            }
        }
    }

    async fn shutdown(&self, grace: Duration) {
        let (num_dropped, handles) = {
            let mut state = self.shared.state.lock().unwrap();
            state.shutting_down = true;
            let num_dropped = state.queue.len();
            state.queue.clear();
            (num_dropped, std::mem::take(&mut state.worker_handles))
        };
        if num_dropped > 0 {
            self.shared.stats.discarded.fetch_add(num_dropped as u64, Ordering::Relaxed);
            debug!("dispatch pool {}: dropping {} queued tasks on shutdown", self.shared.name, num_dropped);
        }
        self.shared.task_available.notify_waiters();

        let deadline = tokio::time::Instant::now() + grace;
        for mut handle in handles {
            if handle.is_finished() {
                continue;
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if tokio::time::timeout(remaining, &mut handle).await.is_err() {
                warn!("dispatch pool {}: worker did not finish within the shutdown grace period, aborting it", self.shared.name);
                handle.abort();
            }
        }

        // aborted workers never get to deregister themselves
        let mut state = self.shared.state.lock().unwrap();
        state.live_workers = 0;
        state.idle_workers = 0;
    }
}

/// Core workers never expire on their own, so a pool that is dropped without a prior
///  [BoundedPool::shutdown] aborts them outright. After a shutdown this is a no-op.
impl Drop for BoundedPool {
    fn drop(&mut self) {
        let handles = {
            let mut state = self.shared.state.lock().unwrap();
            state.shutting_down = true;
            state.queue.clear();
            std::mem::take(&mut state.worker_handles)
        };
        for handle in handles {
            handle.abort();
        }
    }
}

fn spawn_worker(shared: &Arc<PoolShared>, state: &mut PoolState) {
    state.live_workers += 1;
    state.worker_handles.retain(|handle| !handle.is_finished());
    state.worker_handles.push(tokio::spawn(worker_loop(shared.clone())));
}

async fn worker_loop(shared: Arc<PoolShared>) {
    loop {
        let task = {
            let mut state = shared.state.lock().unwrap();
            match state.queue.pop_front() {
                Some(task) => Some(task),
                None if state.shutting_down => {
                    state.live_workers -= 1;
                    return;
                }
                None => None,
            }
        };

        match task {
            Some(task) => task.await,
            None => {
                let notified = shared.task_available.notified();
                tokio::pin!(notified);
                {
                    let mut state = shared.state.lock().unwrap();
                    // registering interest under the lock closes the race against a task
                    //  being queued between the check and the wait
                    if !state.queue.is_empty() || state.shutting_down {
                        continue;
                    }
                    state.idle_workers += 1;
                    notified.as_mut().enable();
                }

                let timed_out = tokio::time::timeout(shared.config.keep_alive, notified).await.is_err();

                let mut state = shared.state.lock().unwrap();
                state.idle_workers -= 1;
                if state.queue.is_empty()
                    && (state.shutting_down
                        || (timed_out && state.live_workers > shared.config.min_workers))
                {
                    state.live_workers -= 1;
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tokio::sync::Semaphore;

    fn pool_config(f: impl FnOnce(&mut PoolConfig)) -> PoolConfig {
        let mut config = PoolConfig {
            enabled: true,
            min_workers: 1,
            max_workers: 1,
            keep_alive: Duration::from_secs(30),
            queue_enabled: true,
            queue_capacity: 10,
            rejection_policy: RejectionPolicy::Discard,
        };
        f(&mut config);
        config
    }

    fn rt() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build()
            .unwrap()
    }

    /// lets the spawned workers make progress; auto-advance takes care of the paused clock
    async fn breathe() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    fn recording_task(id: u32, record: &Arc<Mutex<Vec<u32>>>) -> PoolTask {
        let record = record.clone();
        Box::pin(async move {
            record.lock().unwrap().push(id);
        })
    }

    /// a task that blocks until a permit is added to the gate
    fn gated_task(id: u32, record: &Arc<Mutex<Vec<u32>>>, gate: &Arc<Semaphore>) -> PoolTask {
        let record = record.clone();
        let gate = gate.clone();
        Box::pin(async move {
            gate.acquire().await.unwrap().forget();
            record.lock().unwrap().push(id);
        })
    }

    fn recorded(record: &Arc<Mutex<Vec<u32>>>) -> Vec<u32> {
        record.lock().unwrap().clone()
    }

    #[test]
    fn test_direct_pool_runs_inline() {
        rt().block_on(async {
            let pool = DispatchPool::new("test", &pool_config(|c| c.enabled = false));
            assert!(pool.is_direct());
            assert_eq!(pool.live_workers(), 0);

            let record = Arc::new(Mutex::new(Vec::new()));
            match pool.submit(recording_task(1, &record)) {
                SubmitOutcome::Inline(task) => task.await,
                _ => panic!("direct pool should hand the task back"),
            }

            assert_eq!(recorded(&record), vec![1]);
            assert_eq!(pool.stats(), PoolStatsSnapshot {
                submitted: 1,
                caller_runs: 1,
                ..Default::default()
            });
        });
    }

    #[test]
    fn test_tasks_run_in_submission_order() {
        rt().block_on(async {
            let pool = DispatchPool::new("test", &pool_config(|_| {}));
            let record = Arc::new(Mutex::new(Vec::new()));
            let gate = Arc::new(Semaphore::new(0));

            assert!(matches!(pool.submit(gated_task(0, &record, &gate)), SubmitOutcome::Queued));
            breathe().await;
            for id in 1..=3 {
                assert!(matches!(pool.submit(recording_task(id, &record)), SubmitOutcome::Queued));
            }

            gate.add_permits(1);
            breathe().await;
            assert_eq!(recorded(&record), vec![0, 1, 2, 3]);
        });
    }

    #[test]
    fn test_workers_grow_to_core_size() {
        rt().block_on(async {
            let pool = DispatchPool::new("test", &pool_config(|c| {
                c.min_workers = 2;
                c.max_workers = 4;
            }));
            let record = Arc::new(Mutex::new(Vec::new()));

            pool.submit(recording_task(1, &record));
            assert_eq!(pool.live_workers(), 1);
            breathe().await;

            // a second worker is started even though the first one is idle
            pool.submit(recording_task(2, &record));
            assert_eq!(pool.live_workers(), 2);
            breathe().await;

            pool.submit(recording_task(3, &record));
            assert_eq!(pool.live_workers(), 2);
        });
    }

    #[test]
    fn test_workers_grow_under_load_and_shrink_when_idle() {
        rt().block_on(async {
            let keep_alive = Duration::from_secs(10);
            let pool = DispatchPool::new("test", &pool_config(|c| {
                c.min_workers = 1;
                c.max_workers = 3;
                c.keep_alive = keep_alive;
            }));
            let record = Arc::new(Mutex::new(Vec::new()));
            let gate = Arc::new(Semaphore::new(0));

            for id in 0..3 {
                pool.submit(gated_task(id, &record, &gate));
                breathe().await;
            }
            assert_eq!(pool.live_workers(), 3);

            gate.add_permits(3);
            breathe().await;
            assert_eq!(recorded(&record).len(), 3);
            assert_eq!(pool.live_workers(), 3);

            tokio::time::sleep(keep_alive + Duration::from_secs(1)).await;
            assert_eq!(pool.live_workers(), 1);
        });
    }

    #[test]
    fn test_rendezvous_handoff_without_queue() {
        rt().block_on(async {
            let pool = DispatchPool::new("test", &pool_config(|c| c.queue_enabled = false));
            let record = Arc::new(Mutex::new(Vec::new()));
            let gate = Arc::new(Semaphore::new(0));

            assert!(matches!(pool.submit(gated_task(0, &record, &gate)), SubmitOutcome::Queued));
            breathe().await;

            // the only worker is busy and there is no queue
            assert!(matches!(pool.submit(recording_task(1, &record)), SubmitOutcome::Discarded));

            gate.add_permits(1);
            breathe().await;

            // now the worker is parked, so handoff works again
            assert!(matches!(pool.submit(recording_task(2, &record)), SubmitOutcome::Queued));
            breathe().await;

            assert_eq!(recorded(&record), vec![0, 2]);
            assert_eq!(pool.stats().discarded, 1);
        });
    }

    #[test]
    fn test_handoff_claims_one_worker_per_task() {
        rt().block_on(async {
            let pool = DispatchPool::new("test", &pool_config(|c| c.queue_enabled = false));
            let record = Arc::new(Mutex::new(Vec::new()));

            pool.submit(recording_task(0, &record));
            breathe().await;

            // two submissions without yielding in between: the single parked worker has no
            //  chance to pick up the first task before the second one arrives
            assert!(matches!(pool.submit(recording_task(1, &record)), SubmitOutcome::Queued));
            assert!(matches!(pool.submit(recording_task(2, &record)), SubmitOutcome::Discarded));

            breathe().await;
            assert_eq!(recorded(&record), vec![0, 1]);
            assert_eq!(pool.stats().discarded, 1);
        });
    }

    #[test]
    fn test_handoff_spawns_for_a_second_task_below_max() {
        rt().block_on(async {
            let pool = DispatchPool::new("test", &pool_config(|c| {
                c.queue_enabled = false;
                c.max_workers = 2;
            }));
            let record = Arc::new(Mutex::new(Vec::new()));

            pool.submit(recording_task(0, &record));
            breathe().await;
            assert_eq!(pool.live_workers(), 1);

            // the parked worker takes the first task, the second one gets a fresh worker
            assert!(matches!(pool.submit(recording_task(1, &record)), SubmitOutcome::Queued));
            assert!(matches!(pool.submit(recording_task(2, &record)), SubmitOutcome::Queued));
            assert_eq!(pool.live_workers(), 2);

            breathe().await;
            assert_eq!(recorded(&record), vec![0, 1, 2]);
        });
    }

    async fn saturated_pool(policy: RejectionPolicy, record: &Arc<Mutex<Vec<u32>>>, gate: &Arc<Semaphore>) -> DispatchPool {
        let pool = DispatchPool::new("test", &pool_config(|c| {
            c.queue_capacity = 1;
            c.rejection_policy = policy;
        }));
        // worker busy with task 0, task 1 occupying the single queue slot
        pool.submit(gated_task(0, record, gate));
        breathe().await;
        pool.submit(recording_task(1, record));
        pool
    }

    #[test]
    fn test_rejection_policy_abort() {
        rt().block_on(async {
            let record = Arc::new(Mutex::new(Vec::new()));
            let gate = Arc::new(Semaphore::new(0));
            let pool = saturated_pool(RejectionPolicy::Abort, &record, &gate).await;

            assert!(matches!(
                pool.submit(recording_task(2, &record)),
                SubmitOutcome::Rejected(RejectReason::QueueFull)
            ));

            gate.add_permits(1);
            breathe().await;
            assert_eq!(recorded(&record), vec![0, 1]);
            assert_eq!(pool.stats().rejected, 1);
        });
    }

    #[test]
    fn test_rejection_policy_discard() {
        rt().block_on(async {
            let record = Arc::new(Mutex::new(Vec::new()));
            let gate = Arc::new(Semaphore::new(0));
            let pool = saturated_pool(RejectionPolicy::Discard, &record, &gate).await;

            assert!(matches!(pool.submit(recording_task(2, &record)), SubmitOutcome::Discarded));

            gate.add_permits(1);
            breathe().await;
            assert_eq!(recorded(&record), vec![0, 1]);
            assert_eq!(pool.stats().discarded, 1);
        });
    }

    #[test]
    fn test_rejection_policy_discard_oldest() {
        rt().block_on(async {
            let record = Arc::new(Mutex::new(Vec::new()));
            let gate = Arc::new(Semaphore::new(0));
            let pool = saturated_pool(RejectionPolicy::DiscardOldest, &record, &gate).await;

            assert!(matches!(pool.submit(recording_task(2, &record)), SubmitOutcome::Queued));

            gate.add_permits(1);
            breathe().await;
            // task 1 was pushed out of the queue in favor of task 2
            assert_eq!(recorded(&record), vec![0, 2]);
            assert_eq!(pool.stats().discarded, 1);
        });
    }

    #[test]
    fn test_rejection_policy_run() {
        rt().block_on(async {
            let record = Arc::new(Mutex::new(Vec::new()));
            let gate = Arc::new(Semaphore::new(0));
            let pool = saturated_pool(RejectionPolicy::Run, &record, &gate).await;

            match pool.submit(recording_task(2, &record)) {
                SubmitOutcome::Inline(task) => task.await,
                _ => panic!("expected the task back for inline execution"),
            }
            // the overflow task ran on the submitter, before the queued ones
            assert_eq!(recorded(&record), vec![2]);

            gate.add_permits(1);
            breathe().await;
            assert_eq!(recorded(&record), vec![2, 0, 1]);
            assert_eq!(pool.stats().caller_runs, 1);
        });
    }

    #[rstest]
    #[case::completes_in_time(true)]
    #[case::aborted_after_grace(false)]
    fn test_shutdown(#[case] release_before_shutdown: bool) {
        rt().block_on(async {
            let record = Arc::new(Mutex::new(Vec::new()));
            let gate = Arc::new(Semaphore::new(0));
            let pool = DispatchPool::new("test", &pool_config(|_| {}));

            pool.submit(gated_task(0, &record, &gate));
            breathe().await;
            pool.submit(recording_task(1, &record));

            if release_before_shutdown {
                gate.add_permits(1);
            }
            pool.shutdown(Duration::from_millis(100)).await;

            // the queued task is dropped either way; the running one only finishes if it
            //  was unblocked before the grace period expired
            let expected: Vec<u32> = if release_before_shutdown { vec![0] } else { vec![] };
            assert_eq!(recorded(&record), expected);
            assert_eq!(pool.stats().discarded, 1);
            assert_eq!(pool.live_workers(), 0);

            assert!(matches!(
                pool.submit(recording_task(2, &record)),
                SubmitOutcome::Rejected(RejectReason::PoolClosed)
            ));
        });
    }

    #[test]
    fn test_dropping_the_pool_stops_its_workers() {
        rt().block_on(async {
            let pool = DispatchPool::new("test", &pool_config(|c| {
                c.min_workers = 2;
                c.max_workers = 2;
            }));
            let record = Arc::new(Mutex::new(Vec::new()));

            pool.submit(recording_task(1, &record));
            pool.submit(recording_task(2, &record));
            breathe().await;
            assert_eq!(recorded(&record), vec![1, 2]);
            assert_eq!(pool.live_workers(), 2);

            // after the drop, only the parked workers could still hold the shared state
            let shared = match &pool.inner {
                PoolImpl::Bounded(bounded) => Arc::downgrade(&bounded.shared),
                PoolImpl::Direct { .. } => unreachable!(),
            };
            drop(pool);
            breathe().await;

            assert!(shared.upgrade().is_none(), "dropped pool left workers behind");
        });
    }

    #[test]
    fn test_idle_workers_survive_at_core_size() {
        rt().block_on(async {
            let keep_alive = Duration::from_secs(10);
            let pool = DispatchPool::new("test", &pool_config(|c| {
                c.min_workers = 2;
                c.max_workers = 2;
                c.keep_alive = keep_alive;
            }));
            let record = Arc::new(Mutex::new(Vec::new()));

            pool.submit(recording_task(1, &record));
            pool.submit(recording_task(2, &record));
            breathe().await;
            assert_eq!(pool.live_workers(), 2);

            tokio::time::sleep(3 * keep_alive).await;
            assert_eq!(pool.live_workers(), 2);

            pool.submit(recording_task(3, &record));
            breathe().await;
            assert_eq!(recorded(&record), vec![1, 2, 3]);
        });
    }
}
