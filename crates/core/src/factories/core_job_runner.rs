//! The core job runner module.
//!
//! Durable requests get a [CheckpointJobRunner]: a single task that runs
//! one job at a time, high priority queue first, and asks the
//! [Checkpointer] to persist state every few dirty jobs and whenever the
//! queues drain. The runner can be paused while an external checkpoint is
//! taken.
//!
//! Ephemeral requests get an [ImmediateJobRunner], which spawns every job
//! on the tokio executor straight away.

use blockswarm_api::*;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

/// CoreJobRunner configuration types.
pub mod config {
    /// Configuration parameters for [CoreJobRunnerFactory](super::CoreJobRunnerFactory).
    #[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
    #[serde(default, rename_all = "camelCase")]
    pub struct CoreJobRunnerConfig {
        /// How many normal priority jobs may wait before
        /// `queue_normal_or_drop` starts dropping. Default: 1024.
        pub normal_queue_capacity: usize,

        /// Checkpoint after this many jobs that changed durable state.
        /// Default: 32.
        pub checkpoint_every_jobs: u32,
    }

    impl Default for CoreJobRunnerConfig {
        fn default() -> Self {
            Self {
                normal_queue_capacity: 1024,
                checkpoint_every_jobs: 32,
            }
        }
    }

    /// Module-level configuration for CoreJobRunner.
    #[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
    #[serde(default, rename_all = "camelCase")]
    pub struct CoreJobRunnerModConfig {
        /// CoreJobRunner configuration.
        pub core_job_runner: CoreJobRunnerConfig,
    }
}

pub use config::*;

/// The production job runner factory.
#[derive(Debug)]
pub struct CoreJobRunnerFactory {}

impl CoreJobRunnerFactory {
    /// Construct a new CoreJobRunnerFactory.
    pub fn create() -> DynJobRunnerFactory {
        Arc::new(Self {})
    }
}

impl JobRunnerFactory for CoreJobRunnerFactory {
    fn default_config(&self, config: &mut Config) -> SwarmResult<()> {
        config.set_module_config(&CoreJobRunnerModConfig::default())?;
        Ok(())
    }

    fn validate_config(&self, config: &Config) -> SwarmResult<()> {
        let config: CoreJobRunnerModConfig = config.get_module_config()?;
        if config.core_job_runner.normal_queue_capacity == 0 {
            return Err(SwarmError::other(
                "coreJobRunner.normalQueueCapacity must be at least 1",
            ));
        }
        if config.core_job_runner.checkpoint_every_jobs == 0 {
            return Err(SwarmError::other(
                "coreJobRunner.checkpointEveryJobs must be at least 1",
            ));
        }
        Ok(())
    }

    fn create(
        &self,
        builder: Arc<Builder>,
        persistence: Persistence,
    ) -> BoxFut<'static, SwarmResult<DynJobRunner>> {
        Box::pin(async move {
            let config: CoreJobRunnerModConfig =
                builder.config.get_module_config()?;
            let out: DynJobRunner = match persistence {
                Persistence::Durable => Arc::new(CheckpointJobRunner::new(
                    config.core_job_runner,
                    builder.checkpointer.clone(),
                )),
                Persistence::Ephemeral => Arc::new(ImmediateJobRunner::new()),
            };
            Ok(out)
        })
    }
}

/// A checkpointer that does nothing, for nodes that keep no durable
/// request state.
#[derive(Debug, Default)]
pub struct NoopCheckpointer;

impl Checkpointer for NoopCheckpointer {
    fn checkpoint(&self) -> SwarmResult<()> {
        Ok(())
    }
}

fn run_caught(job: Job) -> bool {
    match std::panic::catch_unwind(AssertUnwindSafe(job)) {
        Ok(dirty) => dirty,
        Err(err) => {
            let msg = err
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| err.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            tracing::error!("job panicked: {msg}");
            false
        }
    }
}

/// Serializes durable state mutations with checkpointing.
#[derive(Debug)]
pub struct CheckpointJobRunner {
    high_tx: UnboundedSender<Job>,
    normal_tx: UnboundedSender<Job>,
    low_tx: UnboundedSender<Job>,
    normal_len: Arc<AtomicUsize>,
    normal_capacity: usize,
    pause: Arc<tokio::sync::Mutex<()>>,
}

impl CheckpointJobRunner {
    /// Construct a runner and spawn its task. The task exits once the
    /// runner is dropped and the queues are drained.
    pub fn new(config: CoreJobRunnerConfig, checkpointer: DynCheckpointer) -> Self {
        let (high_tx, high_rx) = unbounded_channel();
        let (normal_tx, normal_rx) = unbounded_channel();
        let (low_tx, low_rx) = unbounded_channel();
        let normal_len = Arc::new(AtomicUsize::new(0));
        let pause = Arc::new(tokio::sync::Mutex::new(()));

        tokio::spawn(Self::run(
            Queues {
                high: high_rx,
                normal: normal_rx,
                low: low_rx,
                normal_len: normal_len.clone(),
                pending: Default::default(),
            },
            pause.clone(),
            checkpointer,
            config.checkpoint_every_jobs.max(1),
        ));

        Self {
            high_tx,
            normal_tx,
            low_tx,
            normal_len,
            normal_capacity: config.normal_queue_capacity,
            pause,
        }
    }

    /// Hold the runner idle. No job starts until the guard is dropped.
    /// A job that is already running completes first.
    pub async fn pause(&self) -> tokio::sync::OwnedMutexGuard<()> {
        self.pause.clone().lock_owned().await
    }

    /// Number of normal priority jobs waiting.
    pub fn normal_queue_len(&self) -> usize {
        self.normal_len.load(Ordering::Acquire)
    }

    async fn run(
        mut queues: Queues,
        pause: Arc<tokio::sync::Mutex<()>>,
        checkpointer: DynCheckpointer,
        checkpoint_every_jobs: u32,
    ) {
        let mut dirty = 0u32;
        while queues.wait().await {
            // Jobs queued while paused are picked up in priority order
            // once the pause ends.
            let _guard = pause.lock().await;
            let Some(job) = queues.take_next() else {
                continue;
            };
            if run_caught(job) {
                dirty += 1;
            }
            if dirty >= checkpoint_every_jobs
                || (dirty > 0 && queues.is_empty())
            {
                match checkpointer.checkpoint() {
                    Ok(()) => dirty = 0,
                    Err(err) => tracing::error!("checkpoint failed: {err}"),
                }
            }
        }
        if dirty > 0 {
            if let Err(err) = checkpointer.checkpoint() {
                tracing::error!("final checkpoint failed: {err}");
            }
        }
        tracing::debug!("checkpoint job runner stopped");
    }
}

const HIGH: usize = 0;
const NORMAL: usize = 1;
const LOW: usize = 2;

struct Queues {
    high: UnboundedReceiver<Job>,
    normal: UnboundedReceiver<Job>,
    low: UnboundedReceiver<Job>,
    normal_len: Arc<AtomicUsize>,
    pending: [VecDeque<Job>; 3],
}

impl Queues {
    /// Wait until a job is available. Returns false once every sender is
    /// gone and nothing is left to run.
    async fn wait(&mut self) -> bool {
        if self.pending.iter().any(|q| !q.is_empty()) {
            return true;
        }
        let (prio, job) = tokio::select! {
            biased;
            Some(job) = self.high.recv() => (HIGH, job),
            Some(job) = self.normal.recv() => (NORMAL, job),
            Some(job) = self.low.recv() => (LOW, job),
            else => return false,
        };
        self.pending[prio].push_back(job);
        true
    }

    fn take_next(&mut self) -> Option<Job> {
        self.pull_ready();
        for (prio, queue) in self.pending.iter_mut().enumerate() {
            if let Some(job) = queue.pop_front() {
                if prio == NORMAL {
                    self.normal_len.fetch_sub(1, Ordering::AcqRel);
                }
                return Some(job);
            }
        }
        None
    }

    fn is_empty(&mut self) -> bool {
        self.pull_ready();
        self.pending.iter().all(|q| q.is_empty())
    }

    fn pull_ready(&mut self) {
        while let Ok(job) = self.high.try_recv() {
            self.pending[HIGH].push_back(job);
        }
        while let Ok(job) = self.normal.try_recv() {
            self.pending[NORMAL].push_back(job);
        }
        while let Ok(job) = self.low.try_recv() {
            self.pending[LOW].push_back(job);
        }
    }
}

impl JobRunner for CheckpointJobRunner {
    fn queue(&self, job: Job, priority: JobPriority) -> SwarmResult<()> {
        let res = match priority {
            JobPriority::High => self.high_tx.send(job),
            JobPriority::Normal => {
                self.normal_len.fetch_add(1, Ordering::AcqRel);
                let res = self.normal_tx.send(job);
                if res.is_err() {
                    self.normal_len.fetch_sub(1, Ordering::AcqRel);
                }
                res
            }
            JobPriority::Low => self.low_tx.send(job),
        };
        res.map_err(|_| SwarmError::other("checkpoint job runner shut down"))
    }

    fn queue_normal_or_drop(&self, job: Job) -> bool {
        if self.normal_len.load(Ordering::Acquire) >= self.normal_capacity {
            tracing::debug!("normal job queue full, dropping job");
            return false;
        }
        self.queue(job, JobPriority::Normal).is_ok()
    }

    fn is_persistent(&self) -> bool {
        true
    }
}

/// Runs every job on the tokio executor as soon as it is queued.
#[derive(Debug, Default)]
pub struct ImmediateJobRunner;

impl ImmediateJobRunner {
    /// Construct a new ImmediateJobRunner.
    pub fn new() -> Self {
        Self
    }
}

impl JobRunner for ImmediateJobRunner {
    fn queue(&self, job: Job, _priority: JobPriority) -> SwarmResult<()> {
        let rt = tokio::runtime::Handle::try_current()
            .map_err(|err| SwarmError::other_src("no runtime to run job", err))?;
        rt.spawn(async move {
            run_caught(job);
        });
        Ok(())
    }

    fn queue_normal_or_drop(&self, job: Job) -> bool {
        self.queue(job, JobPriority::Normal).is_ok()
    }

    fn is_persistent(&self) -> bool {
        false
    }
}
