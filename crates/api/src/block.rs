//! Block types handed between the network layer, the store and requests.

use crate::NodeKey;
use std::collections::HashMap;
use std::sync::Mutex;

/// A block of data together with the low-level key it was fetched or
/// stored under.
///
/// Verification against the key is the job of the block/key layer; by the
/// time a block reaches the scheduler it is trusted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyBlock {
    /// The key this block is stored under.
    pub key: NodeKey,

    /// The raw block bytes.
    pub data: bytes::Bytes,
}

impl KeyBlock {
    /// Construct a new key block.
    pub fn new(key: NodeKey, data: impl Into<bytes::Bytes>) -> Self {
        Self {
            key,
            data: data.into(),
        }
    }
}

/// A set of blocks carried along with a registration, checked before the
/// datastore. A multi-block request uses this to hand over blocks it
/// already holds, for example from a previous attempt.
#[derive(Debug, Default)]
pub struct BlockSet(Mutex<HashMap<NodeKey, KeyBlock>>);

impl BlockSet {
    /// Construct an empty block set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a block to the set, replacing any block with the same key.
    pub fn add(&self, block: KeyBlock) {
        self.0.lock().unwrap().insert(block.key.clone(), block);
    }

    /// Get a block by key.
    pub fn get(&self, key: &NodeKey) -> Option<KeyBlock> {
        self.0.lock().unwrap().get(key).cloned()
    }

    /// Number of blocks in this set.
    pub fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }

    /// Returns true if this set holds no blocks.
    pub fn is_empty(&self) -> bool {
        self.0.lock().unwrap().is_empty()
    }
}
