#![deny(missing_docs)]
//! Blockswarm request scheduling core.
//!
//! Decides which low-level block fetch or insert a node sends next, out
//! of everything its client requests want. See
//! [scheduler::ClientRequestScheduler] for the scheduling rules and
//! [registry::SchedulerRegistry] for the full set of schedulers a node
//! runs.

use blockswarm_api::{builder::Builder, config::Config};
use std::sync::Arc;

/// Construct a production-ready default builder.
///
/// - `checkpointer` - The default checkpointer is
///   [factories::NoopCheckpointer].
/// - `job_runner` - The default job runner is
///   [factories::CoreJobRunnerFactory].
/// - `datastore_checker` - The default datastore checker is
///   [factories::MemDatastoreCheckerFactory].
pub fn default_builder() -> Builder {
    Builder {
        config: Config::default(),
        checkpointer: Arc::new(factories::NoopCheckpointer),
        job_runner: factories::CoreJobRunnerFactory::create(),
        datastore_checker: factories::MemDatastoreCheckerFactory::create(),
    }
}

/// Construct a default builder for testing.
///
/// Like [default_builder], but priority classes are strictly ordered and
/// cooldowns last milliseconds rather than seconds.
pub fn default_test_builder() -> Builder {
    let builder = default_builder();
    let test_config = scheduler::CoreSchedulerModConfig {
        core_scheduler: scheduler::CoreSchedulerConfig {
            priority_policy: scheduler::PriorityPolicy::Hard,
            first_cooldown_ms: 10,
            last_cooldown_ms: 100,
            num_cooldown_intervals: 4,
            starter_poll_interval_ms: 5,
            ..Default::default()
        },
    };
    if let Err(err) = builder.config.set_module_config(&test_config) {
        tracing::error!("could not apply the test scheduler config: {err}");
    }
    builder
}

pub mod factories;
pub mod registry;
pub mod scheduler;
pub mod starter;
