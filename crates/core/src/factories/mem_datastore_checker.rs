//! An in-memory [DatastoreChecker], backed by a [MemBlockStore].

use blockswarm_api::*;
use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
};

/// A shareable in-memory block store.
#[derive(Debug, Default, Clone)]
pub struct MemBlockStore(Arc<Mutex<HashMap<NodeKey, KeyBlock>>>);

impl MemBlockStore {
    /// Construct an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a block, replacing any block under the same key.
    pub fn put(&self, block: KeyBlock) {
        self.0.lock().unwrap().insert(block.key.clone(), block);
    }

    /// Get a block by key.
    pub fn get(&self, key: &NodeKey) -> Option<KeyBlock> {
        self.0.lock().unwrap().get(key).cloned()
    }

    /// Number of stored blocks.
    pub fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }

    /// Returns true if no blocks are stored.
    pub fn is_empty(&self) -> bool {
        self.0.lock().unwrap().is_empty()
    }
}

/// A factory for creating [MemDatastoreChecker] instances.
#[derive(Debug)]
pub struct MemDatastoreCheckerFactory {
    store: MemBlockStore,
}

impl MemDatastoreCheckerFactory {
    /// Construct a factory whose checkers look in a fresh, empty store.
    pub fn create() -> DynDatastoreCheckerFactory {
        Self::with_store(MemBlockStore::new())
    }

    /// Construct a factory whose checkers look in `store`.
    pub fn with_store(store: MemBlockStore) -> DynDatastoreCheckerFactory {
        let out: DynDatastoreCheckerFactory = Arc::new(Self { store });
        out
    }
}

impl DatastoreCheckerFactory for MemDatastoreCheckerFactory {
    fn default_config(&self, _config: &mut Config) -> SwarmResult<()> {
        Ok(())
    }

    fn validate_config(&self, _config: &Config) -> SwarmResult<()> {
        Ok(())
    }

    fn create(
        &self,
        _builder: Arc<Builder>,
    ) -> BoxFut<'static, SwarmResult<DynDatastoreChecker>> {
        let store = self.store.clone();
        Box::pin(async move {
            let out: DynDatastoreChecker =
                Arc::new(MemDatastoreChecker::new(store));
            Ok(out)
        })
    }
}

/// Looks for a get's blocks in its block set, then in a [MemBlockStore].
#[derive(Debug)]
pub struct MemDatastoreChecker {
    store: MemBlockStore,
    pending: Arc<Mutex<HashSet<RequestId>>>,
}

impl MemDatastoreChecker {
    /// Construct a checker over `store`.
    pub fn new(store: MemBlockStore) -> Self {
        Self {
            store,
            pending: Default::default(),
        }
    }
}

impl DatastoreChecker for MemDatastoreChecker {
    fn queue_request(
        &self,
        get: DynSendableGet,
        block_set: Option<Arc<BlockSet>>,
    ) -> BoxFut<'static, SwarmResult<StoreCheckResult>> {
        let id = get.common().id();
        self.pending.lock().unwrap().insert(id);
        let pending = self.pending.clone();
        let store = self.store.clone();

        Box::pin(async move {
            tokio::task::yield_now().await;

            if !pending.lock().unwrap().remove(&id) {
                tracing::debug!("store check for {id} dropped, request removed");
                return Ok(StoreCheckResult::default());
            }

            let ignore_store = get.fetch_flags().ignore_store;
            let found = get
                .list_items()
                .into_iter()
                .filter_map(|item| {
                    let block = block_set
                        .as_ref()
                        .and_then(|set| set.get(&item.key))
                        .or_else(|| {
                            if ignore_store {
                                None
                            } else {
                                store.get(&item.key)
                            }
                        })?;
                    Some((item.token, block))
                })
                .collect();

            Ok(StoreCheckResult { found })
        })
    }

    fn remove_request(&self, id: RequestId) {
        self.pending.lock().unwrap().remove(&id);
    }

    fn queued_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use blockswarm_test_utils::{id::create_chk_list, request::*};

    fn block(key: &NodeKey) -> KeyBlock {
        KeyBlock::new(key.clone(), vec![1, 2, 3])
    }

    #[tokio::test]
    async fn finds_blocks_in_set_and_store() {
        let keys = create_chk_list(3);
        let store = MemBlockStore::new();
        store.put(block(&keys[0]));
        let set = Arc::new(BlockSet::new());
        set.add(block(&keys[1]));

        let checker = MemDatastoreChecker::new(store);
        let (_, get) = TestGet::new(
            test_common(Persistence::Ephemeral, PriorityClass::Update),
            keys.clone(),
        )
        .build();

        let fut = checker.queue_request(get, Some(set));
        assert_eq!(1, checker.queued_count());
        let mut found: Vec<ItemToken> =
            fut.await.unwrap().found.into_iter().map(|(t, _)| t).collect();
        found.sort();
        assert_eq!(vec![ItemToken(0), ItemToken(1)], found);
        assert_eq!(0, checker.queued_count());
    }

    #[tokio::test]
    async fn ignore_store_only_uses_block_set() {
        let keys = create_chk_list(1);
        let store = MemBlockStore::new();
        store.put(block(&keys[0]));
        let checker = MemDatastoreChecker::new(store);
        let (_, get) = TestGet::new(
            test_common(Persistence::Ephemeral, PriorityClass::Update),
            keys,
        )
        .with_fetch_flags(FetchFlags {
            ignore_store: true,
            ..Default::default()
        })
        .build();

        let res = checker.queue_request(get, None).await.unwrap();
        assert!(res.found.is_empty());
    }

    #[tokio::test]
    async fn removed_request_gets_nothing() {
        let keys = create_chk_list(1);
        let store = MemBlockStore::new();
        store.put(block(&keys[0]));
        let checker = MemDatastoreChecker::new(store);
        let (_, get) = TestGet::new(
            test_common(Persistence::Durable, PriorityClass::Update),
            keys,
        )
        .build();
        let id = get.common().id();

        let fut = checker.queue_request(get, None);
        checker.remove_request(id);
        assert_eq!(0, checker.queued_count());
        assert!(fut.await.unwrap().found.is_empty());
    }
}
