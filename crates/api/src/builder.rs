//! Builder-related types.

use crate::*;
use std::sync::Arc;

/// The general blockswarm builder.
/// This contains both configuration and factory instances,
/// allowing construction of the scheduler's collaborators.
#[derive(Debug)]
pub struct Builder {
    /// The module configuration to be used when building modules.
    /// This can be loaded from disk or modified before freezing the builder.
    pub config: config::Config,

    /// The [Checkpointer] the durable job runner calls to persist
    /// request state.
    pub checkpointer: DynCheckpointer,

    /// The [JobRunnerFactory] to be used for creating the durable and
    /// ephemeral [JobRunner] instances.
    pub job_runner: DynJobRunnerFactory,

    /// The [DatastoreCheckerFactory] to be used for creating the
    /// [DatastoreChecker] instance.
    pub datastore_checker: DynDatastoreCheckerFactory,
}

impl Builder {
    /// Construct a default config given the configured module factories.
    /// Note, this should be called before freezing the Builder instance
    /// in an Arc<>.
    pub fn with_default_config(mut self) -> SwarmResult<Self> {
        {
            let Self {
                config,
                checkpointer: _,
                job_runner,
                datastore_checker,
            } = &mut self;

            job_runner.default_config(config)?;
            datastore_checker.default_config(config)?;
        }

        self.validate_config()?;

        Ok(self)
    }

    /// Validate the current configuration with every module factory.
    pub fn validate_config(&self) -> SwarmResult<()> {
        self.job_runner.validate_config(&self.config)?;
        self.datastore_checker.validate_config(&self.config)?;

        Ok(())
    }

    /// Freeze the builder so modules can be created from it.
    pub fn build(self) -> Arc<Self> {
        Arc::new(self)
    }
}
