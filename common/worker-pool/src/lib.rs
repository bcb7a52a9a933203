use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Scheduling classes, highest first. `LongTerm` is reserved for jobs whose
/// runtime is on the order of the scheduling interval or longer; they get
/// dedicated workers so they never starve the short-job classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobPriority {
    High,
    Normal,
    Low,
    LongTerm,
}

impl JobPriority {
    pub const ALL: [JobPriority; 4] = [
        JobPriority::High,
        JobPriority::Normal,
        JobPriority::Low,
        JobPriority::LongTerm,
    ];

    fn index(self) -> usize {
        match self {
            JobPriority::High => 0,
            JobPriority::Normal => 1,
            JobPriority::Low => 2,
            JobPriority::LongTerm => 3,
        }
    }
}

type JobFn = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send>;

/// A single-shot unit of work with a name for logging.
pub struct Job {
    name: String,
    priority: JobPriority,
    run: JobFn,
}

impl Job {
    pub fn new<F, Fut>(priority: JobPriority, name: impl Into<String>, f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            priority,
            run: Box::new(move || Box::pin(f())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn priority(&self) -> JobPriority {
        self.priority
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("worker pool is not accepting jobs")]
    NotAccepting,
    #[error("no worker accepts {0:?} jobs")]
    NoEligibleWorker(JobPriority),
}

/// Per-priority worker counts. At least one LongTerm worker is always
/// created, whatever `long_term_workers` says.
#[derive(Debug, Clone, Default)]
pub struct PoolConfig {
    pub high_workers: usize,
    pub normal_workers: usize,
    pub low_workers: usize,
    pub long_term_workers: usize,
}

struct Shared {
    queues: Mutex<[VecDeque<Job>; 4]>,
    notify: Notify,
    accepting: AtomicBool,
    stopping: CancellationToken,
}

impl Shared {
    fn pop_eligible(&self, accepts: &[JobPriority]) -> Option<Job> {
        let mut queues = self.queues.lock().expect("job queue lock poisoned");
        for priority in JobPriority::ALL {
            if accepts.contains(&priority) {
                if let Some(job) = queues[priority.index()].pop_front() {
                    return Some(job);
                }
            }
        }
        None
    }
}

/// Priority-tagged job scheduler. Workers each declare the subset of
/// priorities they will take; a pushed job is only ever dispatched to a
/// worker whose accept-set contains the job's priority.
pub struct WorkerPool {
    shared: Arc<Shared>,
    accept_sets: Vec<Vec<JobPriority>>,
    eligible: [bool; 4],
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(config: PoolConfig) -> Self {
        let mut accept_sets: Vec<Vec<JobPriority>> = Vec::new();
        for _ in 0..config.high_workers {
            accept_sets.push(vec![JobPriority::High]);
        }
        for _ in 0..config.normal_workers {
            accept_sets.push(vec![JobPriority::Normal, JobPriority::High]);
        }
        for _ in 0..config.low_workers {
            accept_sets.push(vec![JobPriority::Low]);
        }
        for _ in 0..config.long_term_workers.max(1) {
            accept_sets.push(vec![JobPriority::LongTerm]);
        }

        let mut eligible = [false; 4];
        for set in &accept_sets {
            for priority in set {
                eligible[priority.index()] = true;
            }
        }

        Self {
            shared: Arc::new(Shared {
                queues: Mutex::new(std::array::from_fn(|_| VecDeque::new())),
                notify: Notify::new(),
                accepting: AtomicBool::new(true),
                stopping: CancellationToken::new(),
            }),
            accept_sets,
            eligible,
            handles: Vec::new(),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.accept_sets.len()
    }

    /// Spawn one task per worker. Idempotent only in the sense that calling
    /// it twice would double the workers; callers start once.
    pub fn start(&mut self) {
        for (index, accepts) in self.accept_sets.iter().cloned().enumerate() {
            let shared = self.shared.clone();
            self.handles
                .push(tokio::spawn(worker_loop(shared, accepts, index)));
        }
        info!(workers = self.handles.len(), "worker pool started");
    }

    /// Enqueue a job for dispatch. Fails once the pool is stopping, or when
    /// no worker's accept-set covers the job's priority.
    pub fn push(&self, job: Job) -> Result<(), PoolError> {
        if !self.shared.accepting.load(Ordering::SeqCst) {
            return Err(PoolError::NotAccepting);
        }
        if !self.eligible[job.priority.index()] {
            return Err(PoolError::NoEligibleWorker(job.priority));
        }
        {
            let mut queues = self.shared.queues.lock().expect("job queue lock poisoned");
            queues[job.priority.index()].push_back(job);
        }
        self.shared.notify.notify_waiters();
        Ok(())
    }

    /// Stop accepting, let in-flight jobs finish, and join every worker.
    /// Jobs still queued but never started are discarded.
    pub async fn stop(&mut self) {
        self.shared.accepting.store(false, Ordering::SeqCst);
        self.shared.stopping.cancel();
        self.shared.notify.notify_waiters();
        for handle in self.handles.drain(..) {
            if let Err(err) = handle.await {
                error!("worker task join failed: {err}");
            }
        }
        info!("worker pool stopped");
    }
}

async fn worker_loop(shared: Arc<Shared>, accepts: Vec<JobPriority>, index: usize) {
    loop {
        if shared.stopping.is_cancelled() {
            break;
        }

        // Register interest before the queue check so a push landing in
        // between cannot be missed.
        let notified = shared.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if let Some(job) = shared.pop_eligible(&accepts) {
            debug!(worker = index, job = %job.name, "job started");
            match (job.run)().await {
                Ok(()) => debug!(worker = index, job = %job.name, "job finished"),
                Err(err) => error!(worker = index, job = %job.name, "job failed: {err:#}"),
            }
            continue;
        }

        tokio::select! {
            _ = &mut notified => {}
            _ = shared.stopping.cancelled() => {}
        }
    }
    debug!(worker = index, "worker exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    fn reporting_job(
        priority: JobPriority,
        name: &str,
        tx: mpsc::UnboundedSender<String>,
    ) -> Job {
        let tag = name.to_string();
        Job::new(priority, name, move || async move {
            tx.send(tag).unwrap();
            Ok(())
        })
    }

    #[tokio::test]
    async fn dispatches_to_matching_worker() {
        let mut pool = WorkerPool::new(PoolConfig {
            high_workers: 1,
            ..Default::default()
        });
        pool.start();

        let (tx, mut rx) = mpsc::unbounded_channel();
        pool.push(reporting_job(JobPriority::High, "high", tx)).unwrap();

        let ran = timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(ran.as_deref(), Some("high"));
        pool.stop().await;
    }

    #[tokio::test]
    async fn normal_workers_also_take_high_jobs() {
        let mut pool = WorkerPool::new(PoolConfig {
            normal_workers: 1,
            ..Default::default()
        });
        pool.start();

        let (tx, mut rx) = mpsc::unbounded_channel();
        pool.push(reporting_job(JobPriority::High, "high", tx)).unwrap();

        let ran = timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(ran.as_deref(), Some("high"));
        pool.stop().await;
    }

    #[tokio::test]
    async fn high_jobs_run_before_normal_on_a_shared_worker() {
        let mut pool = WorkerPool::new(PoolConfig {
            normal_workers: 1,
            ..Default::default()
        });

        // Queue before starting so the single worker sees both at once.
        let (tx, mut rx) = mpsc::unbounded_channel();
        pool.push(reporting_job(JobPriority::Normal, "normal", tx.clone()))
            .unwrap();
        pool.push(reporting_job(JobPriority::High, "high", tx)).unwrap();
        pool.start();

        let first = timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        let second = timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(first.as_deref(), Some("high"));
        assert_eq!(second.as_deref(), Some("normal"));
        pool.stop().await;
    }

    #[tokio::test]
    async fn rejects_priorities_no_worker_accepts() {
        let pool = WorkerPool::new(PoolConfig {
            high_workers: 1,
            ..Default::default()
        });
        let job = Job::new(JobPriority::Low, "low", || async { Ok(()) });
        match pool.push(job) {
            Err(PoolError::NoEligibleWorker(JobPriority::Low)) => {}
            other => panic!("unexpected push result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn long_term_worker_is_always_present() {
        let mut pool = WorkerPool::new(PoolConfig::default());
        assert_eq!(pool.worker_count(), 1);
        pool.start();

        let (tx, mut rx) = mpsc::unbounded_channel();
        pool.push(reporting_job(JobPriority::LongTerm, "flush", tx))
            .unwrap();
        let ran = timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(ran.as_deref(), Some("flush"));
        pool.stop().await;
    }

    #[tokio::test]
    async fn push_fails_after_stop() {
        let mut pool = WorkerPool::new(PoolConfig {
            normal_workers: 1,
            ..Default::default()
        });
        pool.start();
        pool.stop().await;

        let job = Job::new(JobPriority::Normal, "late", || async { Ok(()) });
        assert!(matches!(pool.push(job), Err(PoolError::NotAccepting)));
    }

    #[tokio::test]
    async fn stop_waits_for_in_flight_jobs() {
        let mut pool = WorkerPool::new(PoolConfig {
            normal_workers: 1,
            ..Default::default()
        });
        pool.start();

        let (tx, mut rx) = mpsc::unbounded_channel();
        pool.push(Job::new(JobPriority::Normal, "slow", move || async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            tx.send("done".to_string()).unwrap();
            Ok(())
        }))
        .unwrap();

        // Give the worker a chance to pick the job up, then stop.
        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.stop().await;
        assert_eq!(rx.try_recv().ok().as_deref(), Some("done"));
    }
}
