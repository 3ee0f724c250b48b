//! The datastore checker: looks for a get's blocks locally before the get
//! competes for network slots.

use crate::*;
use std::sync::Arc;

/// Blocks found locally for a get's items.
#[derive(Debug, Default, Clone)]
pub struct StoreCheckResult {
    /// Items whose block is already available, with that block.
    pub found: Vec<(ItemToken, KeyBlock)>,
}

/// Checks whether data for a get is already available locally.
pub trait DatastoreChecker: 'static + Send + Sync + std::fmt::Debug {
    /// Queue a get for checking against `block_set` (if any) and the
    /// local store. The future resolves once the check is done.
    ///
    /// If the request is removed with [DatastoreChecker::remove_request]
    /// before the check runs, the result is empty.
    fn queue_request(
        &self,
        get: DynSendableGet,
        block_set: Option<Arc<BlockSet>>,
    ) -> BoxFut<'static, SwarmResult<StoreCheckResult>>;

    /// Forget a queued request. Called when a request is unregistered so
    /// no orphaned entries remain.
    fn remove_request(&self, id: RequestId);

    /// Number of requests waiting for a check.
    fn queued_count(&self) -> usize;
}

/// Trait-object [DatastoreChecker].
pub type DynDatastoreChecker = Arc<dyn DatastoreChecker>;

/// A factory for constructing [DatastoreChecker] instances.
pub trait DatastoreCheckerFactory: 'static + Send + Sync + std::fmt::Debug {
    /// Help the builder construct a default config from the chosen
    /// module factories.
    fn default_config(&self, config: &mut config::Config) -> SwarmResult<()>;

    /// Validate configuration.
    fn validate_config(&self, config: &config::Config) -> SwarmResult<()>;

    /// Construct a datastore checker instance.
    fn create(
        &self,
        builder: Arc<builder::Builder>,
    ) -> BoxFut<'static, SwarmResult<DynDatastoreChecker>>;
}

/// Trait-object [DatastoreCheckerFactory].
pub type DynDatastoreCheckerFactory = Arc<dyn DatastoreCheckerFactory>;
