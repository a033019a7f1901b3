//! Cluster object lookup.
//!
//! Secret and config map volumes are resolved through a [`ResourceLookup`]
//! collaborator. A missing object is reported as
//! [`Error::ResourceNotFound`], which callers detect with
//! [`Error::is_not_found`].
//!
//! [`StaticResources`] is the in-memory implementation used by the CLI and
//! by tests.

use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

/// A secret: binary values by key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Secret {
    pub name: String,
    pub namespace: String,
    pub data: BTreeMap<String, Vec<u8>>,
}

/// A config map: text values by key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigMap {
    pub name: String,
    pub namespace: String,
    pub data: BTreeMap<String, String>,
}

/// Source of secrets and config maps.
#[async_trait]
pub trait ResourceLookup: Send + Sync {
    /// Fetches a secret; `ResourceNotFound` if it does not exist.
    async fn get_secret(&self, name: &str, namespace: &str) -> Result<Secret>;

    /// Fetches a config map; `ResourceNotFound` if it does not exist.
    async fn get_config_map(&self, name: &str, namespace: &str) -> Result<ConfigMap>;
}

type Key = (String, String);

/// In-memory [`ResourceLookup`].
#[derive(Default)]
pub struct StaticResources {
    secrets: RwLock<HashMap<Key, Secret>>,
    config_maps: RwLock<HashMap<Key, ConfigMap>>,
}

impl StaticResources {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a secret.
    pub fn insert_secret(&self, secret: Secret) -> Result<()> {
        let key = (secret.namespace.clone(), secret.name.clone());
        self.secrets.write()?.insert(key, secret);
        Ok(())
    }

    /// Adds or replaces a config map.
    pub fn insert_config_map(&self, config_map: ConfigMap) -> Result<()> {
        let key = (config_map.namespace.clone(), config_map.name.clone());
        self.config_maps.write()?.insert(key, config_map);
        Ok(())
    }
}

fn not_found(kind: &str, name: &str, namespace: &str) -> Error {
    Error::ResourceNotFound {
        kind: kind.to_string(),
        name: name.to_string(),
        namespace: namespace.to_string(),
    }
}

#[async_trait]
impl ResourceLookup for StaticResources {
    async fn get_secret(&self, name: &str, namespace: &str) -> Result<Secret> {
        self.secrets
            .read()?
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| not_found("secret", name, namespace))
    }

    async fn get_config_map(&self, name: &str, namespace: &str) -> Result<ConfigMap> {
        self.config_maps
            .read()?
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| not_found("configmap", name, namespace))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lookup_by_namespace() {
        let resources = StaticResources::new();
        resources
            .insert_secret(Secret {
                name: "creds".to_string(),
                namespace: "prod".to_string(),
                data: BTreeMap::from([("token".to_string(), b"abc".to_vec())]),
            })
            .unwrap();

        let secret = resources.get_secret("creds", "prod").await.unwrap();
        assert_eq!(secret.data["token"], b"abc");

        let missing = resources.get_secret("creds", "default").await.unwrap_err();
        assert!(missing.is_not_found());
        assert!(resources.get_config_map("creds", "prod").await.unwrap_err().is_not_found());
    }
}
