// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0
use anyhow::Result;
use kube::{Client, Config as KConfig};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use courier::config::{Config, StoreBackend};
use courier::kubernetes::{wait_for_distributed_secret_crd, ClientFactory};
use courier::reconcilers::{DeployerReconciler, DistributedSecretReconciler};
use courier::store::{KubernetesStore, MemoryStore, SecretStore, StoreDataGetter};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting Courier operator");

    // Load configuration
    let config = Config::from_env()?;
    info!(
        "Configuration loaded: store_backend={:?}, worker_concurrency={}, client_cache_max_ttl={:?}",
        config.store_backend, config.worker_concurrency, config.client_cache_max_ttl
    );

    // Create Kubernetes client
    let kube_config = KConfig::infer().await?;
    let client = Client::try_from(kube_config.clone())?;
    info!("Connected to Kubernetes cluster");

    info!("Waiting for DistributedSecret CRD to become available...");
    wait_for_distributed_secret_crd(&client).await?;

    let store: Arc<dyn SecretStore> = match config.store_backend {
        StoreBackend::Memory => {
            warn!("Using the in-memory store, secret data is lost on restart");
            Arc::new(MemoryStore::new())
        }
        StoreBackend::Kubernetes => Arc::new(KubernetesStore::new(client.clone(), &config.store_namespace)),
    };

    let clients = Arc::new(ClientFactory::new(
        client.clone(),
        kube_config,
        config.client_cache_max_ttl,
    ));

    let secret_reconciler = DistributedSecretReconciler::new(
        client.clone(),
        clients.clone(),
        StoreDataGetter::new(store),
        &config,
    );
    let deployer_reconciler = DeployerReconciler::new(client, clients);

    info!("Starting reconcilers...");

    tokio::try_join!(secret_reconciler.run(), deployer_reconciler.run())?;

    // This should never be reached as reconcilers run forever
    warn!("All reconcilers stopped unexpectedly");
    Ok(())
}
