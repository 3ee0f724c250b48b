//! Job runners: where state mutations triggered by the scheduler execute.
//!
//! Mutations of durable request state must be serialized with
//! checkpointing, so that a restart never observes half an update. Those
//! go through a persistent runner. Ephemeral requests use a runner that
//! simply executes the job on the async executor. Which runner a request
//! uses is decided once, when the scheduler is built, not at every
//! callback site.

use crate::{builder, config, BoxFut, Persistence, SwarmResult};
use std::sync::Arc;

/// A unit of work. Returns true if it changed durable state and a
/// checkpoint should eventually be taken.
pub type Job = Box<dyn FnOnce() -> bool + 'static + Send>;

/// Priority hint for a queued job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum JobPriority {
    /// Run before anything else queued. Internal error reports use this.
    High,
    /// Completion callbacks.
    Normal,
    /// Housekeeping such as cooldown notifications.
    Low,
}

/// Runs jobs that mutate request state.
pub trait JobRunner: 'static + Send + Sync + std::fmt::Debug {
    /// Queue a job. Never blocks. Only fails if the runner has shut down.
    fn queue(&self, job: Job, priority: JobPriority) -> SwarmResult<()>;

    /// Queue a job at normal priority, dropping it if the runner is
    /// backed up. Returns false if the job was dropped.
    fn queue_normal_or_drop(&self, job: Job) -> bool;

    /// Whether jobs run by this runner are checkpointed.
    fn is_persistent(&self) -> bool;
}

/// Trait-object [JobRunner].
pub type DynJobRunner = Arc<dyn JobRunner>;

/// Takes a consistent checkpoint of durable state.
pub trait Checkpointer: 'static + Send + Sync + std::fmt::Debug {
    /// Persist everything mutated by jobs run so far.
    fn checkpoint(&self) -> SwarmResult<()>;
}

/// Trait-object [Checkpointer].
pub type DynCheckpointer = Arc<dyn Checkpointer>;

/// A factory for constructing [JobRunner] instances.
pub trait JobRunnerFactory: 'static + Send + Sync + std::fmt::Debug {
    /// Help the builder construct a default config from the chosen
    /// module factories.
    fn default_config(&self, config: &mut config::Config) -> SwarmResult<()>;

    /// Validate configuration.
    fn validate_config(&self, config: &config::Config) -> SwarmResult<()>;

    /// Construct the runner for requests of the given persistence.
    fn create(
        &self,
        builder: Arc<builder::Builder>,
        persistence: Persistence,
    ) -> BoxFut<'static, SwarmResult<DynJobRunner>>;
}

/// Trait-object [JobRunnerFactory].
pub type DynJobRunnerFactory = Arc<dyn JobRunnerFactory>;
