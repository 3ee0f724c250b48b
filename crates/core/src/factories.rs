//! Factories for generating instances of the scheduler's collaborators.

pub mod core_job_runner;
pub use core_job_runner::{
    CheckpointJobRunner, CoreJobRunnerFactory, ImmediateJobRunner,
    NoopCheckpointer,
};

pub mod mem_datastore_checker;
pub use mem_datastore_checker::{
    MemBlockStore, MemDatastoreChecker, MemDatastoreCheckerFactory,
};
