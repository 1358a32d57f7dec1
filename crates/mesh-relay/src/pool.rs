// Numan Thabit 2025
//! Bounded, resizable task pool. One instance per upstream node runs the
//! notification and session-validation tasks for that node's servicers.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_queue::SegQueue;
use futures::FutureExt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

type Task = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// When a submission should start an additional worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStrategy {
    /// Spawn whenever no worker is idle.
    Eager,
    /// Spawn only once queued tasks reach the running worker count.
    Lazy,
    /// Spawn when queued tasks exceed idle workers plus half the running ones.
    #[default]
    Balanced,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub strategy: WorkerStrategy,
    pub min_workers: usize,
    pub max_workers: usize,
    pub max_capacity: usize,
    pub idle_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("worker pool {0} is stopped")]
    Stopped(String),
    #[error("worker pool {name} queue is full ({capacity} tasks)")]
    QueueFull { name: String, capacity: usize },
    #[error("task in worker pool {0} panicked")]
    Panicked(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
pub struct PoolCounters {
    pub running: usize,
    pub idle: usize,
    pub waiting: usize,
    pub submitted: u64,
    pub successful: u64,
    pub failed: u64,
    pub completed: u64,
}

struct Shared {
    name: String,
    queue: SegQueue<Task>,
    notify: Notify,
    drained: Notify,
    limits: RwLock<PoolConfig>,
    running: AtomicUsize,
    idle: AtomicUsize,
    waiting: AtomicUsize,
    submitted: AtomicU64,
    successful: AtomicU64,
    failed: AtomicU64,
    stopped: AtomicBool,
    cancel: CancellationToken,
}

impl Shared {
    fn try_reserve_worker(&self, max_workers: usize) -> bool {
        let mut current = self.running.load(Ordering::Acquire);
        loop {
            if current >= max_workers {
                return false;
            }
            match self.running.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Give back a worker slot if the pool holds more than `floor` workers.
    fn try_retire(&self, floor: usize) -> bool {
        let mut current = self.running.load(Ordering::Acquire);
        loop {
            if current <= floor {
                return false;
            }
            match self.running.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    if current == 1 {
                        self.drained.notify_waiters();
                    }
                    return true;
                }
                Err(actual) => current = actual,
            }
        }
    }

    async fn run(&self, task: Task) {
        match AssertUnwindSafe(task).catch_unwind().await {
            Ok(()) => {
                self.successful.fetch_add(1, Ordering::Relaxed);
            }
            Err(panic) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                warn!(pool = %self.name, panic = %panic_message(&*panic), "worker task panicked");
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

async fn worker_loop(shared: Arc<Shared>) {
    loop {
        if let Some(task) = shared.queue.pop() {
            shared.waiting.fetch_sub(1, Ordering::AcqRel);
            shared.run(task).await;
            let max = shared.limits.read().max_workers;
            if shared.try_retire(max) {
                debug!(pool = %shared.name, "worker retired after resize");
                return;
            }
            continue;
        }
        if shared.stopped.load(Ordering::Acquire) {
            break;
        }

        let idle_timeout = shared.limits.read().idle_timeout;
        let notified = shared.notify.notified();
        shared.idle.fetch_add(1, Ordering::AcqRel);
        let woken = tokio::select! {
            _ = notified => true,
            _ = shared.cancel.cancelled() => true,
            _ = tokio::time::sleep(idle_timeout) => false,
        };
        shared.idle.fetch_sub(1, Ordering::AcqRel);

        if !woken && shared.queue.is_empty() {
            let min = shared.limits.read().min_workers;
            if shared.try_retire(min) {
                return;
            }
        }
    }

    if shared.running.fetch_sub(1, Ordering::AcqRel) == 1 {
        shared.drained.notify_waiters();
    }
}

/// Cloneable handle to a pool of tokio worker tasks.
#[derive(Clone)]
pub struct WorkerPool {
    shared: Arc<Shared>,
}

impl WorkerPool {
    /// Must be called from within a tokio runtime; `min_workers` are started
    /// immediately.
    pub fn new(name: impl Into<String>, config: PoolConfig) -> Self {
        let min = config.min_workers;
        let pool = Self {
            shared: Arc::new(Shared {
                name: name.into(),
                queue: SegQueue::new(),
                notify: Notify::new(),
                drained: Notify::new(),
                limits: RwLock::new(config),
                running: AtomicUsize::new(0),
                idle: AtomicUsize::new(0),
                waiting: AtomicUsize::new(0),
                submitted: AtomicU64::new(0),
                successful: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                stopped: AtomicBool::new(false),
                cancel: CancellationToken::new(),
            }),
        };
        for _ in 0..min {
            pool.spawn_worker(min);
        }
        pool
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::Acquire)
    }

    /// Token cancelled when the pool stops; long-running tasks watch it.
    pub fn cancellation(&self) -> CancellationToken {
        self.shared.cancel.clone()
    }

    /// Queue a fire-and-forget task. A panic inside it is caught and counted
    /// as failed without affecting other tasks.
    pub fn submit<F>(&self, task: F) -> Result<(), PoolError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.is_stopped() {
            return Err(PoolError::Stopped(self.shared.name.clone()));
        }
        let limits = self.shared.limits.read().clone();
        let waiting = self.shared.waiting.fetch_add(1, Ordering::AcqRel) + 1;
        if waiting > limits.max_capacity {
            self.shared.waiting.fetch_sub(1, Ordering::AcqRel);
            return Err(PoolError::QueueFull {
                name: self.shared.name.clone(),
                capacity: limits.max_capacity,
            });
        }
        self.shared.queue.push(Box::pin(task));
        self.shared.submitted.fetch_add(1, Ordering::Relaxed);

        if self.should_spawn(&limits, waiting) {
            self.spawn_worker(limits.max_workers);
        }
        self.shared.notify.notify_one();
        Ok(())
    }

    /// Queue a task and wait for its output.
    pub async fn submit_and_wait<F, T>(&self, task: F) -> Result<T, PoolError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.submit(async move {
            let output = task.await;
            let _ = tx.send(output);
        })?;
        rx.await
            .map_err(|_| PoolError::Panicked(self.shared.name.clone()))
    }

    fn should_spawn(&self, limits: &PoolConfig, waiting: usize) -> bool {
        let running = self.shared.running.load(Ordering::Acquire);
        if running == 0 || running < limits.min_workers {
            return true;
        }
        let idle = self.shared.idle.load(Ordering::Acquire);
        match limits.strategy {
            WorkerStrategy::Eager => idle == 0,
            WorkerStrategy::Lazy => waiting >= running,
            WorkerStrategy::Balanced => waiting > idle + running / 2,
        }
    }

    fn spawn_worker(&self, max_workers: usize) -> bool {
        if !self.shared.try_reserve_worker(max_workers.max(1)) {
            return false;
        }
        tokio::spawn(worker_loop(self.shared.clone()));
        true
    }

    /// Apply new sizing. Surplus workers retire after their current task.
    pub fn resize(&self, config: PoolConfig) {
        let min = config.min_workers;
        debug!(
            pool = %self.shared.name,
            max_workers = config.max_workers,
            max_capacity = config.max_capacity,
            "resizing worker pool"
        );
        *self.shared.limits.write() = config;
        while self.shared.running.load(Ordering::Acquire) < min {
            if !self.spawn_worker(min) {
                break;
            }
        }
        // Wake idle workers so surplus ones notice the new ceiling.
        self.shared.notify.notify_waiters();
    }

    pub fn config(&self) -> PoolConfig {
        self.shared.limits.read().clone()
    }

    pub fn counters(&self) -> PoolCounters {
        let successful = self.shared.successful.load(Ordering::Relaxed);
        let failed = self.shared.failed.load(Ordering::Relaxed);
        PoolCounters {
            running: self.shared.running.load(Ordering::Acquire),
            idle: self.shared.idle.load(Ordering::Acquire),
            waiting: self.shared.waiting.load(Ordering::Acquire),
            submitted: self.shared.submitted.load(Ordering::Relaxed),
            successful,
            failed,
            completed: successful + failed,
        }
    }

    /// Stop accepting tasks, drop queued ones and let in-flight tasks finish.
    pub async fn stop_and_wait(&self) {
        if self.shared.stopped.swap(true, Ordering::AcqRel) {
            return self.wait_drained().await;
        }
        let mut dropped = 0usize;
        while self.shared.queue.pop().is_some() {
            self.shared.waiting.fetch_sub(1, Ordering::AcqRel);
            dropped += 1;
        }
        if dropped > 0 {
            debug!(pool = %self.shared.name, dropped, "dropped queued tasks on stop");
        }
        self.shared.cancel.cancel();
        self.wait_drained().await;
    }

    async fn wait_drained(&self) {
        loop {
            let drained = self.shared.drained.notified();
            if self.shared.running.load(Ordering::Acquire) == 0 {
                return;
            }
            drained.await;
        }
    }
}
