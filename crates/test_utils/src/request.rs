//! In-memory sendable requests that record every outcome they receive.

use blockswarm_api::*;
use std::sync::{Arc, Mutex};

/// Construct request attributes for a bulk content-hash request.
pub fn test_common(
    persistence: Persistence,
    priority: PriorityClass,
) -> RequestCommon {
    RequestCommon::new(persistence, TrafficClass::Bulk, KeyType::Chk, priority)
}

/// An outcome reported to a [TestGet].
#[derive(Debug, Clone, PartialEq)]
pub enum GetOutcome {
    /// The item's block arrived.
    Success(ItemToken, KeyBlock),
    /// The item failed for good.
    Failure(ItemToken, FetchError),
}

/// A get over a fixed list of keys. Item tokens are the key's index.
///
/// Items are dropped when an outcome is reported, like a real multi-block
/// fetch would.
#[derive(Debug)]
pub struct TestGet {
    common: RequestCommon,
    items: Mutex<Vec<RequestItem>>,
    outcomes: Mutex<Vec<GetOutcome>>,
    cooldowns: Mutex<Vec<(ItemToken, Option<Timestamp>)>>,
    retry_policy: RetryPolicy,
    fetch_flags: FetchFlags,
    resolved: bool,
}

impl TestGet {
    /// Construct a get for these keys.
    pub fn new(common: RequestCommon, keys: Vec<NodeKey>) -> Self {
        let items = keys
            .into_iter()
            .enumerate()
            .map(|(i, key)| RequestItem::new(ItemToken(i as u64), key))
            .collect();
        Self {
            common,
            items: Mutex::new(items),
            outcomes: Mutex::new(Vec::new()),
            cooldowns: Mutex::new(Vec::new()),
            retry_policy: RetryPolicy::default(),
            fetch_flags: FetchFlags::default(),
            resolved: false,
        }
    }

    /// Use this retry policy.
    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    /// Use these fetch flags.
    pub fn with_fetch_flags(mut self, fetch_flags: FetchFlags) -> Self {
        self.fetch_flags = fetch_flags;
        self
    }

    /// Report the data as already resolved from the pre-registration hook.
    pub fn already_resolved(mut self) -> Self {
        self.resolved = true;
        self
    }

    /// Freeze into a trait object, keeping a typed handle.
    pub fn build(self) -> (Arc<TestGet>, DynSendableGet) {
        let get = Arc::new(self);
        let dyn_get: DynSendableGet = get.clone();
        (get, dyn_get)
    }

    /// All outcomes so far, in delivery order.
    pub fn outcomes(&self) -> Vec<GetOutcome> {
        self.outcomes.lock().unwrap().clone()
    }

    /// Tokens of items that succeeded.
    pub fn successes(&self) -> Vec<ItemToken> {
        self.outcomes()
            .into_iter()
            .filter_map(|o| match o {
                GetOutcome::Success(t, _) => Some(t),
                _ => None,
            })
            .collect()
    }

    /// Items that failed, with the failure.
    pub fn failures(&self) -> Vec<(ItemToken, FetchError)> {
        self.outcomes()
            .into_iter()
            .filter_map(|o| match o {
                GetOutcome::Failure(t, e) => Some((t, e)),
                _ => None,
            })
            .collect()
    }

    /// Cooldown notifications received.
    pub fn cooldown_notifications(&self) -> Vec<(ItemToken, Option<Timestamp>)> {
        self.cooldowns.lock().unwrap().clone()
    }

    fn drop_item(&self, item: ItemToken) {
        self.items.lock().unwrap().retain(|i| i.token != item);
    }
}

impl SendableGet for TestGet {
    fn common(&self) -> &RequestCommon {
        &self.common
    }

    fn list_items(&self) -> Vec<RequestItem> {
        self.items.lock().unwrap().clone()
    }

    fn fetch_flags(&self) -> FetchFlags {
        self.fetch_flags
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.retry_policy
    }

    fn pre_register(&self) -> bool {
        self.resolved
    }

    fn on_success(&self, item: ItemToken, block: KeyBlock) {
        self.drop_item(item);
        self.outcomes
            .lock()
            .unwrap()
            .push(GetOutcome::Success(item, block));
    }

    fn on_failure(&self, item: ItemToken, err: FetchError) {
        self.drop_item(item);
        self.outcomes
            .lock()
            .unwrap()
            .push(GetOutcome::Failure(item, err));
    }

    fn on_cooldown_changed(&self, item: ItemToken, wakeup: Option<Timestamp>) {
        self.cooldowns.lock().unwrap().push((item, wakeup));
    }
}

/// An outcome reported to a [TestInsert].
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    /// The item was inserted.
    Success(ItemToken, NodeKey),
    /// The item failed for good.
    Failure(ItemToken, InsertError),
}

/// An insert over a fixed list of keys. Item tokens are the key's index.
#[derive(Debug)]
pub struct TestInsert {
    common: RequestCommon,
    items: Mutex<Vec<RequestItem>>,
    outcomes: Mutex<Vec<InsertOutcome>>,
    retry_policy: RetryPolicy,
}

impl TestInsert {
    /// Construct an insert for these keys.
    pub fn new(common: RequestCommon, keys: Vec<NodeKey>) -> Self {
        let items = keys
            .into_iter()
            .enumerate()
            .map(|(i, key)| RequestItem::new(ItemToken(i as u64), key))
            .collect();
        Self {
            common,
            items: Mutex::new(items),
            outcomes: Mutex::new(Vec::new()),
            retry_policy: RetryPolicy::default(),
        }
    }

    /// Use this retry policy.
    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    /// Freeze into a trait object, keeping a typed handle.
    pub fn build(self) -> (Arc<TestInsert>, DynSendableInsert) {
        let insert = Arc::new(self);
        let dyn_insert: DynSendableInsert = insert.clone();
        (insert, dyn_insert)
    }

    /// All outcomes so far, in delivery order.
    pub fn outcomes(&self) -> Vec<InsertOutcome> {
        self.outcomes.lock().unwrap().clone()
    }
}

impl SendableInsert for TestInsert {
    fn common(&self) -> &RequestCommon {
        &self.common
    }

    fn list_items(&self) -> Vec<RequestItem> {
        self.items.lock().unwrap().clone()
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.retry_policy
    }

    fn on_success(&self, item: ItemToken, key: NodeKey) {
        self.items.lock().unwrap().retain(|i| i.token != item);
        self.outcomes
            .lock()
            .unwrap()
            .push(InsertOutcome::Success(item, key));
    }

    fn on_failure(&self, item: ItemToken, err: InsertError) {
        self.items.lock().unwrap().retain(|i| i.token != item);
        self.outcomes
            .lock()
            .unwrap()
            .push(InsertOutcome::Failure(item, err));
    }
}
