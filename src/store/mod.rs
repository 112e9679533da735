// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Backing stores for secret values.
//!
//! Stores only see opaque bytes keyed by a stable identifier; the bytes are the
//! JSON encoding of [`SecretData`].

use crate::error::{CourierError, Result};
use async_trait::async_trait;
use k8s_openapi::ByteString;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

pub mod kubernetes;
pub mod memory;

pub use kubernetes::KubernetesStore;
pub use memory::MemoryStore;

/// Key/value contract of a secret backing store
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Returns [`CourierError::DataNotFound`] when nothing is stored under `key`
    async fn get(&self, key: &str) -> Result<Vec<u8>>;

    async fn store(&self, key: &str, value: &[u8]) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;
}

/// Secret payload deployed to targets
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct SecretData {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,
    #[serde(default)]
    pub data: BTreeMap<String, ByteString>,
}

impl SecretData {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Supplies the secret data for one kind of owning resource.
#[async_trait]
pub trait DataGetter: Send + Sync {
    type Key: Send + Sync + ?Sized;

    async fn get_data(&self, key: &Self::Key) -> Result<SecretData>;
}

/// Reads secret data for DistributedSecrets, keyed by `namespace/name`.
#[derive(Clone)]
pub struct StoreDataGetter {
    store: Arc<dyn SecretStore>,
}

impl StoreDataGetter {
    pub fn new(store: Arc<dyn SecretStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl DataGetter for StoreDataGetter {
    type Key = str;

    async fn get_data(&self, key: &str) -> Result<SecretData> {
        let bytes = self.store.get(key).await?;
        SecretData::from_bytes(&bytes).map_err(|e| {
            CourierError::StoreError(format!("value stored under {} is not secret data: {}", key, e))
        })
    }
}
