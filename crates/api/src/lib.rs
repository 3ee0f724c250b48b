#![deny(missing_docs)]
//! Blockswarm API contains the types and collaborator traits required to
//! schedule low-level block fetches and inserts.
//!
//! If you want the scheduler itself, please see the blockswarm_core crate.

/// Boxed future type.
pub type BoxFut<'a, T> =
    std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;

pub(crate) mod serde_bytes_base64 {
    pub fn serialize<S>(
        b: &bytes::Bytes,
        serializer: S,
    ) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use base64::prelude::*;
        serializer.serialize_str(&BASE64_URL_SAFE_NO_PAD.encode(b))
    }

    pub fn deserialize<'de, D, T: From<bytes::Bytes>>(
        deserializer: D,
    ) -> Result<T, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use base64::prelude::*;
        let s: &'de str = serde::Deserialize::deserialize(deserializer)?;
        BASE64_URL_SAFE_NO_PAD
            .decode(s)
            .map(|v| bytes::Bytes::copy_from_slice(&v).into())
            .map_err(serde::de::Error::custom)
    }
}

pub mod builder;
pub use builder::Builder;

pub mod config;
pub use config::{Config, ModConfig};

mod error;
pub use error::*;

pub mod id;
pub use id::{ClientKey, Id, ItemToken, KeyType, NodeKey, RequestId};

mod timestamp;
pub use timestamp::*;

pub mod block;
pub use block::*;

pub mod priority;
pub use priority::*;

pub mod low_level;
pub use low_level::*;

pub mod request;
pub use request::*;

pub mod job;
pub use job::*;

pub mod datastore;
pub use datastore::*;

pub mod doc;
