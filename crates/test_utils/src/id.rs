//! Test utilities associated with ids and keys.

use blockswarm_api::{ClientKey, Id, KeyType, NodeKey};
use bytes::Bytes;

use crate::random_bytes;

/// Create a random id.
pub fn random_id() -> Id {
    Id(Bytes::from(random_bytes(32)))
}

/// Create a random node key of the given type.
pub fn random_node_key(key_type: KeyType) -> NodeKey {
    NodeKey::new(key_type, random_id())
}

/// Create a random content-hash node key.
pub fn random_chk() -> NodeKey {
    random_node_key(KeyType::Chk)
}

/// Create a list of random content-hash node keys.
pub fn create_chk_list(num_keys: u16) -> Vec<NodeKey> {
    (0..num_keys).map(|_| random_chk()).collect()
}

/// Create a random client key for a node key.
pub fn random_client_key(node_key: NodeKey) -> ClientKey {
    ClientKey {
        node_key,
        crypto_key: random_id(),
    }
}
