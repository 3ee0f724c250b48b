//! Types for use when configuring blockswarm modules.

use crate::*;
use std::sync::Mutex;

/// helper transcode function
fn tc<S: serde::Serialize, D: serde::de::DeserializeOwned>(
    s: &S,
) -> SwarmResult<D> {
    serde_json::from_str(
        &serde_json::to_string(s)
            .map_err(|e| SwarmError::other_src("encode", e))?,
    )
    .map_err(|e| SwarmError::other_src("decode", e))
}

/// Denotes a type used to configure a specific blockswarm module.
///
/// A module config is a wrapper struct with a single camelCase field
/// named after the module, so that the configs of several modules can
/// live side by side in one json object:
///
/// ```json
/// { "coreScheduler": { "priorityPolicy": "hard" }, "coreJobRunner": {} }
/// ```
///
/// Note, the types defined in this struct are specifically for
/// configuration that cannot be changed at runtime, the likes of which
/// might be found in a configuration file. The serialization should be
/// tolerant to missing properties (`#[serde(default)]`), because the file
/// can be edited by humans.
pub trait ModConfig:
    'static
    + Sized
    + Default
    + std::fmt::Debug
    + serde::Serialize
    + serde::de::DeserializeOwned
    + Send
    + Sync
{
}

impl<T> ModConfig for T where
    T: 'static
        + Sized
        + Default
        + std::fmt::Debug
        + serde::Serialize
        + serde::de::DeserializeOwned
        + Send
        + Sync
{
}

type Map = serde_json::Map<String, serde_json::Value>;

/// Blockswarm configuration.
#[derive(Debug, Default)]
pub struct Config(Mutex<Map>);

impl serde::Serialize for Config {
    fn serialize<S: serde::Serializer>(
        &self,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        self.0.lock().unwrap().serialize(serializer)
    }
}

impl<'de> serde::Deserialize<'de> for Config {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Self, D::Error> {
        Ok(Self(Mutex::new(Map::deserialize(deserializer)?)))
    }
}

impl Config {
    /// Called by module factories while generating a default config.
    /// Refuses to overwrite a module that already has a config.
    pub fn add_default_module_config<M: ModConfig>(&self) -> SwarmResult<()> {
        let map: Map = tc(&M::default())?;
        let mut lock = self.0.lock().unwrap();
        for key in map.keys() {
            if lock.contains_key(key) {
                return Err(SwarmError::other(format!(
                    "Refusing to overwrite conflicting module name: {key}"
                )));
            }
        }
        lock.extend(map);
        Ok(())
    }

    /// Set (or replace) the config of a module.
    pub fn set_module_config<M: ModConfig>(&self, m: &M) -> SwarmResult<()> {
        let map: Map = tc(m)?;
        self.0.lock().unwrap().extend(map);
        Ok(())
    }

    /// Extract the config of a module. Missing modules and missing
    /// properties take their default values; properties belonging to
    /// other modules are ignored.
    pub fn get_module_config<M: ModConfig>(&self) -> SwarmResult<M> {
        let map = self.0.lock().unwrap().clone();
        tc(&map)
    }
}
