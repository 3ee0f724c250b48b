//! Types dealing with key and request identity.

use std::sync::atomic::{AtomicU64, Ordering};

/// Base data identity type meant for newtyping or embedding in keys.
///
/// These bytes should ONLY be the hash bytes (or public key hash) being
/// tracked, without prefix or suffix.
#[derive(
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct Id(#[serde(with = "crate::serde_bytes_base64")] pub bytes::Bytes);

impl std::ops::Deref for Id {
    type Target = bytes::Bytes;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<bytes::Bytes> for Id {
    fn from(b: bytes::Bytes) -> Self {
        Id(b)
    }
}

/// Ids display as url-safe base64.
/// This makes debugging so much easier than rust's default of decimal array.
impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use base64::prelude::*;
        f.write_str(&BASE64_URL_SAFE_NO_PAD.encode(&self.0))
    }
}

impl std::fmt::Debug for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(self, f)
    }
}

/// The family a key belongs to.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub enum KeyType {
    /// Content-hash key. The routing key is the hash of the block.
    Chk,

    /// Signed-subspace key. The routing key is derived from a public key
    /// and a document name, and the block carries a signature.
    Ssk,
}

impl KeyType {
    /// All key types, in a stable order.
    pub const ALL: [KeyType; 2] = [KeyType::Chk, KeyType::Ssk];

    /// Short upper-case name as used in key display.
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyType::Chk => "CHK",
            KeyType::Ssk => "SSK",
        }
    }
}

impl std::fmt::Display for KeyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A low-level key: what the network routes on and what the block store
/// indexes by.
///
/// Deduplication of in-flight fetches happens on this type.
#[derive(
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub struct NodeKey {
    /// The family of this key.
    pub key_type: KeyType,

    /// The routing key bytes.
    pub routing_key: Id,
}

impl NodeKey {
    /// Construct a new node key.
    pub fn new(key_type: KeyType, routing_key: impl Into<Id>) -> Self {
        Self {
            key_type,
            routing_key: routing_key.into(),
        }
    }
}

impl std::fmt::Display for NodeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.key_type, self.routing_key)
    }
}

impl std::fmt::Debug for NodeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(self, f)
    }
}

/// A client-level key: a [NodeKey] plus the material needed to decode
/// the block once fetched. Decoding itself is not done here.
#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub struct ClientKey {
    /// The low-level key this client key resolves to.
    pub node_key: NodeKey,

    /// Decryption key material.
    pub crypto_key: Id,
}

/// Identifies one low-level key operation within a sendable request,
/// e.g. one block of a multi-block fetch.
///
/// Unique within its owning request only.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(transparent)]
pub struct ItemToken(pub u64);

impl std::fmt::Display for ItemToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a sendable request.
///
/// The scheduler refers to requests by this id only; it never relies on
/// pointer identity.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(transparent)]
pub struct RequestId(pub u64);

impl RequestId {
    /// Allocate a fresh request id.
    pub fn next() -> Self {
        Self(NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn node_key_display() {
        let key = NodeKey::new(
            KeyType::Chk,
            bytes::Bytes::from_static(&[0xfb, 0xff, 0x00]),
        );
        assert_eq!("CHK@-_8A", key.to_string());
        assert_eq!("CHK@-_8A", format!("{key:?}"));
    }

    #[test]
    fn node_key_serde_uses_base64() {
        let key = NodeKey::new(KeyType::Ssk, bytes::Bytes::from_static(b"ab"));
        let enc = serde_json::to_string(&key).unwrap();
        assert_eq!(r#"{"keyType":"ssk","routingKey":"YWI"}"#, enc);
        let dec: NodeKey = serde_json::from_str(&enc).unwrap();
        assert_eq!(key, dec);
    }

    #[test]
    fn request_ids_are_unique() {
        let a = RequestId::next();
        let b = RequestId::next();
        assert_ne!(a, b);
        assert!(b > a);
    }

    #[test]
    fn same_routing_key_different_type_is_different_key() {
        let chk = NodeKey::new(KeyType::Chk, bytes::Bytes::from_static(b"x"));
        let ssk = NodeKey::new(KeyType::Ssk, bytes::Bytes::from_static(b"x"));
        assert_ne!(chk, ssk);
    }
}
