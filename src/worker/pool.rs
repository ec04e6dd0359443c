//! Worker pool and dispatcher

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;

use super::reaper::{self, TimerMsg};
use super::{Routable, TenantKey};

/// Work handed to executor threads
enum Job {
    /// Drain the queue of this tenant (`None` is the root queue)
    Run(Option<TenantKey>),
    Stop,
}

struct Worker<T> {
    queue: VecDeque<T>,
    /// A `Job::Run` for this queue is pending or executing
    scheduled: bool,
    /// On the idle list
    idle: bool,
    last_active: Instant,
}

impl<T> Worker<T> {
    fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            scheduled: false,
            idle: false,
            last_active: Instant::now(),
        }
    }
}

struct PoolState<T> {
    workers: HashMap<TenantKey, Worker<T>>,
    root: Worker<T>,
    /// Idle tenant workers, oldest first
    idle: VecDeque<TenantKey>,
    created: u64,
    evicted: u64,
    degraded: u64,
}

/// Snapshot of pool counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    /// Live tenant workers (root excluded)
    pub tenants: usize,
    /// Tenant workers currently on the idle list
    pub idle: usize,
    /// Tenant workers created since start
    pub created: u64,
    /// Tenant workers reaped since start
    pub evicted: u64,
    /// Items re-tagged to the root queue because no worker could be made
    pub degraded: u64,
}

pub(crate) struct PoolShared<T> {
    name: String,
    state: Mutex<PoolState<T>>,
    jobs: Sender<Job>,
    timer: Sender<TimerMsg>,
    handler: Box<dyn Fn(T) + Send + Sync>,
    idle_timeout: Duration,
    max_workers: usize,
}

impl<T: Routable> PoolShared<T> {
    fn queue(&self, mut item: T) {
        let mut state = self.state.lock();

        let key = match item.tenant() {
            Some(key) if !key.is_root() => {
                if state.workers.contains_key(&key) {
                    Some(key)
                } else if state.workers.len() >= self.max_workers
                    || state.workers.try_reserve(1).is_err()
                {
                    // No room for another worker: run it as root rather than fail it
                    tracing::debug!(pool = %self.name, tenant = key.raw(), "degrading to root queue");
                    item.clear_tenant();
                    state.degraded += 1;
                    None
                } else {
                    state.workers.insert(key, Worker::new());
                    state.created += 1;
                    tracing::debug!(pool = %self.name, tenant = key.raw(), "created tenant worker");
                    Some(key)
                }
            }
            _ => None,
        };

        // Pull a reused worker off the idle list before queueing so the
        // reaper cannot free it underneath the new item.
        if let Some(key) = key {
            let was_idle = state.workers.get(&key).map_or(false, |w| w.idle);
            if was_idle {
                state.idle.retain(|k| *k != key);
                if let Some(worker) = state.workers.get_mut(&key) {
                    worker.idle = false;
                }
            }
        }

        let worker = match key {
            Some(key) => match state.workers.get_mut(&key) {
                Some(worker) => worker,
                None => return,
            },
            None => &mut state.root,
        };
        worker.queue.push_back(item);
        if worker.scheduled {
            return;
        }
        worker.scheduled = true;

        if self.jobs.send(Job::Run(key)).is_err() {
            // Executors are gone; drop what was queued so completions fire
            let orphaned: Vec<T> = worker.queue.drain(..).collect();
            worker.scheduled = false;
            drop(state);
            tracing::warn!(pool = %self.name, count = orphaned.len(), "pool stopped, dropping queued items");
            drop(orphaned);
        }
    }

    /// Drain one queue. Only one executor runs a given key at a time.
    fn run(&self, key: Option<TenantKey>) {
        loop {
            let item = {
                let mut state = self.state.lock();
                let worker = match key {
                    Some(key) => match state.workers.get_mut(&key) {
                        Some(worker) => worker,
                        None => return,
                    },
                    None => &mut state.root,
                };
                match worker.queue.pop_front() {
                    Some(item) => item,
                    None => {
                        worker.scheduled = false;
                        if let Some(key) = key {
                            let now = Instant::now();
                            worker.last_active = now;
                            worker.idle = true;
                            state.idle.push_back(key);
                            let _ = self.timer.send(TimerMsg::Arm(now + self.idle_timeout));
                        }
                        return;
                    }
                }
            };
            (self.handler)(item);
        }
    }

    /// Free every idle worker whose timeout has passed at `now`.
    ///
    /// Returns when the next sweep is due, if any worker is still idle.
    pub(crate) fn sweep_idle(&self, now: Instant) -> Option<Instant> {
        let mut state = self.state.lock();
        while let Some(&key) = state.idle.front() {
            let expired = state
                .workers
                .get(&key)
                .map_or(true, |w| w.last_active + self.idle_timeout <= now);
            if !expired {
                break;
            }
            state.idle.pop_front();
            state.workers.remove(&key);
            state.evicted += 1;
            tracing::debug!(pool = %self.name, tenant = key.raw(), "evicted idle tenant worker");
        }
        let next = state.idle.front().copied()?;
        state
            .workers
            .get(&next)
            .map(|w| w.last_active + self.idle_timeout)
    }

    fn stats(&self) -> WorkerStats {
        let state = self.state.lock();
        WorkerStats {
            tenants: state.workers.len(),
            idle: state.idle.len(),
            created: state.created,
            evicted: state.evicted,
            degraded: state.degraded,
        }
    }

    fn has_worker(&self, key: TenantKey) -> bool {
        self.state.lock().workers.contains_key(&key)
    }
}

/// Cheap handle for queueing work into a running pool
pub struct Dispatcher<T> {
    shared: Arc<PoolShared<T>>,
}

impl<T> Clone for Dispatcher<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Routable> Dispatcher<T> {
    /// Route an item to its tenant's queue
    pub fn queue(&self, item: T) {
        self.shared.queue(item);
    }
}

/// A running pool: executor threads plus the idle reaper
pub struct WorkerPool<T> {
    shared: Arc<PoolShared<T>>,
    executors: Vec<JoinHandle<()>>,
    reaper: Option<JoinHandle<()>>,
}

impl<T: Routable> WorkerPool<T> {
    /// Start `threads` executors running `handler` on queued items
    pub fn start<F>(
        name: &str,
        threads: usize,
        idle_timeout: Duration,
        max_workers: usize,
        handler: F,
    ) -> io::Result<Self>
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        let (job_tx, job_rx) = channel::unbounded();
        let (timer_tx, timer_rx) = channel::unbounded();

        let shared = Arc::new(PoolShared {
            name: name.to_string(),
            state: Mutex::new(PoolState {
                workers: HashMap::new(),
                root: Worker::new(),
                idle: VecDeque::new(),
                created: 0,
                evicted: 0,
                degraded: 0,
            }),
            jobs: job_tx,
            timer: timer_tx,
            handler: Box::new(handler),
            idle_timeout,
            max_workers,
        });

        let mut pool = Self {
            shared: shared.clone(),
            executors: Vec::with_capacity(threads),
            reaper: None,
        };

        // On a spawn failure `pool` drops here and stops what did start
        for i in 0..threads.max(1) {
            let shared = shared.clone();
            let rx: Receiver<Job> = job_rx.clone();
            let handle = thread::Builder::new()
                .name(format!("{}-w{}", name, i))
                .spawn(move || executor_loop(shared, rx))?;
            pool.executors.push(handle);
        }

        let reaper_shared = shared;
        pool.reaper = Some(
            thread::Builder::new()
                .name(format!("{}-reaper", name))
                .spawn(move || reaper::run(reaper_shared, timer_rx))?,
        );

        tracing::debug!(pool = name, threads, "worker pool started");
        Ok(pool)
    }

    pub fn dispatcher(&self) -> Dispatcher<T> {
        Dispatcher {
            shared: self.shared.clone(),
        }
    }

    pub fn stats(&self) -> WorkerStats {
        self.shared.stats()
    }

    /// Whether a dedicated worker exists for `key`
    pub fn has_worker(&self, key: TenantKey) -> bool {
        self.shared.has_worker(key)
    }

    #[cfg(test)]
    pub(crate) fn sweep_idle_at(&self, now: Instant) -> Option<Instant> {
        self.shared.sweep_idle(now)
    }
}

impl<T> Drop for WorkerPool<T> {
    fn drop(&mut self) {
        for _ in &self.executors {
            let _ = self.shared.jobs.send(Job::Stop);
        }
        let _ = self.shared.timer.send(TimerMsg::Stop);
        for handle in self.executors.drain(..) {
            let _ = handle.join();
        }
        if let Some(handle) = self.reaper.take() {
            let _ = handle.join();
        }
        tracing::debug!(pool = %self.shared.name, "worker pool stopped");
    }
}

fn executor_loop<T: Routable>(shared: Arc<PoolShared<T>>, jobs: Receiver<Job>) {
    while let Ok(job) = jobs.recv() {
        match job {
            Job::Run(key) => shared.run(key),
            Job::Stop => break,
        }
    }
}
