// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Resolution and caching of clients for the cluster hosting a target

use crate::constants::{labels, DEPLOYER_TOKEN_SECS, KUBECONFIG_KEY};
use crate::error::{CourierError, Result};
use crate::kubernetes::cache::ExpiringCache;
use crate::types::ClusterTarget;
use async_trait::async_trait;
use k8s_openapi::api::authentication::v1::{TokenRequest, TokenRequestSpec};
use k8s_openapi::api::core::v1::{Secret, ServiceAccount};
use kube::{
    api::{ListParams, PostParams},
    config::{AuthInfo, KubeConfigOptions, Kubeconfig},
    Api, Client, Config as KConfig, ResourceExt,
};
use sha2::{Digest, Sha256};
use std::time::Duration;
use tracing::{debug, info, instrument};
use url::Url;

/// Source of clients for target clusters
#[async_trait]
pub trait TargetClients: Send + Sync {
    async fn get_client(&self, current_namespace: &str, target: &ClusterTarget<'_>) -> Result<Client>;
}

/// Hands out clients able to reach a target's cluster and namespace.
pub struct ClientFactory {
    local: Client,
    /// Connection settings of the local cluster, reused for impersonated clients
    local_config: KConfig,
    cache: ExpiringCache<Client>,
    max_ttl: Duration,
}

impl ClientFactory {
    pub fn new(local: Client, local_config: KConfig, max_ttl: Duration) -> Self {
        Self {
            local,
            local_config,
            cache: ExpiringCache::new(),
            max_ttl,
        }
    }

    /// Client for `target`, where `current_namespace` owns the reconciled resource.
    #[instrument(skip(self, target), fields(api_url = %target.api_url, namespace = %target.namespace))]
    pub async fn get_client(&self, current_namespace: &str, target: &ClusterTarget<'_>) -> Result<Client> {
        if target.api_url.is_empty() && target.namespace == current_namespace {
            return Ok(self.local.clone());
        }

        if let Some(secret_name) = target.credential_secret {
            return self.kubeconfig_client(current_namespace, secret_name).await;
        }

        if self.is_local_api(target.api_url) {
            return self.deployer_client(current_namespace).await;
        }

        Err(CourierError::ConfigurationError(format!(
            "target {} in namespace {} is on a remote cluster but names no cluster credential secret",
            target.api_url, target.namespace
        )))
    }

    /// Drops the cached client minted for a deployer service account.
    pub async fn invalidate_service_account(&self, namespace: &str, name: &str) -> bool {
        let evicted = self.cache.evict(&service_account_key(namespace, name)).await;
        if evicted {
            info!("Evicted cached client for deployer {}/{}", namespace, name);
        }
        evicted
    }

    pub async fn cached_clients(&self) -> usize {
        self.cache.len().await
    }

    fn is_local_api(&self, api_url: &str) -> bool {
        if api_url.is_empty() {
            return true;
        }
        match Url::parse(api_url) {
            Ok(url) => {
                let local = &self.local_config.cluster_url;
                url.host_str() == local.host()
                    && url.port_or_known_default() == local.port_u16().or(Some(443))
            }
            Err(_) => false,
        }
    }

    async fn kubeconfig_client(&self, namespace: &str, secret_name: &str) -> Result<Client> {
        let kubeconfig = get_kubeconfig(&self.local, namespace, secret_name).await?;
        let key = format!("kubeconfig:{:x}", Sha256::digest(kubeconfig.as_bytes()));

        if let Some(client) = self.cache.get(&key).await {
            debug!("Using cached client for credential secret {}/{}", namespace, secret_name);
            return Ok(client);
        }

        let client = create_client_from_kubeconfig(&kubeconfig).await?;
        self.cache.insert(key, client.clone(), self.max_ttl).await;
        Ok(client)
    }

    async fn deployer_client(&self, namespace: &str) -> Result<Client> {
        let deployer = find_deployer(&self.local, namespace).await?;
        let key = service_account_key(namespace, &deployer);

        if let Some(client) = self.cache.get(&key).await {
            debug!("Using cached client for deployer {}/{}", namespace, deployer);
            return Ok(client);
        }

        let (token, lifetime) = request_token(&self.local, namespace, &deployer).await?;
        let mut config = self.local_config.clone();
        config.auth_info = AuthInfo {
            token: Some(token.into()),
            ..Default::default()
        };
        let client = Client::try_from(config)
            .map_err(|e| CourierError::KubeconfigError(format!("Failed to create client: {}", e)))?;

        let ttl = lifetime.min(self.max_ttl);
        self.cache.insert(key, client.clone(), ttl).await;
        info!("Minted client for deployer {}/{}", namespace, deployer);
        Ok(client)
    }
}

#[async_trait]
impl TargetClients for ClientFactory {
    async fn get_client(&self, current_namespace: &str, target: &ClusterTarget<'_>) -> Result<Client> {
        ClientFactory::get_client(self, current_namespace, target).await
    }
}

fn service_account_key(namespace: &str, name: &str) -> String {
    format!("serviceaccount:{}/{}", namespace, name)
}

/// The one service account labeled as deployer in `namespace`.
async fn find_deployer(client: &Client, namespace: &str) -> Result<String> {
    let accounts: Api<ServiceAccount> = Api::namespaced(client.clone(), namespace);
    let lp = ListParams::default().labels(&format!("{}=true", labels::DEPLOYER));
    let found = accounts.list(&lp).await?.items;

    match found.as_slice() {
        [deployer] => Ok(deployer.name_any()),
        [] => Err(CourierError::ConfigurationError(format!(
            "no deployer service account labeled {}=true in namespace {}",
            labels::DEPLOYER,
            namespace
        ))),
        many => Err(CourierError::ConfigurationError(format!(
            "{} deployer service accounts in namespace {}, expected exactly one: {}",
            many.len(),
            namespace,
            many.iter().map(|sa| sa.name_any()).collect::<Vec<_>>().join(", ")
        ))),
    }
}

/// Token for the service account and how long it stays valid
async fn request_token(
    client: &Client,
    namespace: &str,
    name: &str,
) -> Result<(String, Duration)> {
    let accounts: Api<ServiceAccount> = Api::namespaced(client.clone(), namespace);
    let request = TokenRequest {
        spec: TokenRequestSpec {
            expiration_seconds: Some(DEPLOYER_TOKEN_SECS),
            ..Default::default()
        },
        ..Default::default()
    };

    let response: TokenRequest = accounts
        .create_subresource("token", name, &PostParams::default(), serde_json::to_vec(&request)?)
        .await?;
    let status = response.status.ok_or_else(|| {
        CourierError::KubeconfigError(format!("token request for {}/{} returned no status", namespace, name))
    })?;

    Ok((status.token, remaining_lifetime(status.expiration_timestamp.0, chrono::Utc::now())))
}

/// Time left until `expiry`, zero once it has passed
fn remaining_lifetime(expiry: chrono::DateTime<chrono::Utc>, now: chrono::DateTime<chrono::Utc>) -> Duration {
    (expiry - now).to_std().unwrap_or(Duration::ZERO)
}

/// Get the kubeconfig stored in a cluster credential secret
#[instrument(skip(client))]
async fn get_kubeconfig(client: &Client, namespace: &str, secret_name: &str) -> Result<String> {
    let secrets: Api<Secret> = Api::namespaced(client.clone(), namespace);

    let secret = secrets.get(secret_name).await.map_err(|e| {
        CourierError::KubeconfigError(format!(
            "Failed to get cluster credential secret {}/{}: {}",
            namespace, secret_name, e
        ))
    })?;

    let Some(kubeconfig_data) = secret.data.as_ref().and_then(|d| d.get(KUBECONFIG_KEY)) else {
        return Err(CourierError::KubeconfigError(format!(
            "Cluster credential secret {}/{} does not contain '{}' key",
            namespace, secret_name, KUBECONFIG_KEY
        )));
    };

    String::from_utf8(kubeconfig_data.0.clone()).map_err(|e| {
        CourierError::KubeconfigError(format!(
            "Failed to decode kubeconfig in {}/{}: {}",
            namespace, secret_name, e
        ))
    })
}

/// Create a Kubernetes client from a kubeconfig string
async fn create_client_from_kubeconfig(kubeconfig: &str) -> Result<Client> {
    let kubeconfig_parsed: Kubeconfig = serde_yaml::from_str(kubeconfig)
        .map_err(|e| CourierError::KubeconfigError(format!("Failed to parse kubeconfig: {}", e)))?;

    let client_config = KConfig::from_custom_kubeconfig(kubeconfig_parsed, &KubeConfigOptions::default())
        .await
        .map_err(|e| CourierError::KubeconfigError(format!("Failed to create config: {}", e)))?;

    Client::try_from(client_config)
        .map_err(|e| CourierError::KubeconfigError(format!("Failed to create client: {}", e)))
}
