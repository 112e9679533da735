// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Store keeping each value as a Secret in a dedicated namespace

use crate::error::{CourierError, Result};
use crate::store::{SecretData, SecretStore};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::{
    api::{DeleteParams, ObjectMeta, PostParams},
    Api, Client,
};
use tracing::{debug, instrument};

pub struct KubernetesStore {
    secrets: Api<Secret>,
}

impl KubernetesStore {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            secrets: Api::namespaced(client, namespace),
        }
    }
}

/// `namespace/name` becomes `namespace.name`; namespaces never contain dots.
pub fn secret_name_for_key(key: &str) -> Result<String> {
    match key.split_once('/') {
        Some((ns, name)) if !ns.is_empty() && !name.is_empty() && !name.contains('/') => {
            Ok(format!("{}.{}", ns, name))
        }
        _ => Err(CourierError::StoreError(format!(
            "key {} is not of the form namespace/name",
            key
        ))),
    }
}

#[async_trait]
impl SecretStore for KubernetesStore {
    #[instrument(skip(self))]
    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let name = secret_name_for_key(key)?;
        let Some(secret) = self.secrets.get_opt(&name).await? else {
            return Err(CourierError::DataNotFound(key.to_string()));
        };
        SecretData {
            type_: secret.type_,
            data: secret.data.unwrap_or_default(),
        }
        .to_bytes()
    }

    #[instrument(skip(self, value))]
    async fn store(&self, key: &str, value: &[u8]) -> Result<()> {
        let name = secret_name_for_key(key)?;
        let data = SecretData::from_bytes(value)?;
        let mut secret = Secret {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                ..Default::default()
            },
            data: Some(data.data),
            type_: data.type_,
            ..Default::default()
        };

        match self.secrets.get_opt(&name).await? {
            Some(existing) => {
                secret.metadata.resource_version = existing.metadata.resource_version;
                self.secrets.replace(&name, &PostParams::default(), &secret).await?;
            }
            None => {
                self.secrets.create(&PostParams::default(), &secret).await?;
            }
        }
        debug!("Stored value for {} in secret {}", key, name);
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete(&self, key: &str) -> Result<()> {
        let name = secret_name_for_key(key)?;
        match self.secrets.delete(&name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
