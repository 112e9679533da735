// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Deployer reconciler - evicts cached clients when a deployer service account changes.

use crate::constants::labels;
use crate::error::{CourierError, Result};
use crate::kubernetes::ClientFactory;
use futures::StreamExt;
use k8s_openapi::api::core::v1::ServiceAccount;
use kube::{
    runtime::{controller::Action, watcher, Controller},
    Api, Client, ResourceExt,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

pub struct DeployerReconciler {
    client: Client,
    clients: Arc<ClientFactory>,
}

impl DeployerReconciler {
    pub fn new(client: Client, clients: Arc<ClientFactory>) -> Self {
        Self { client, clients }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let accounts: Api<ServiceAccount> = Api::all(self.client.clone());
        let selector = format!("{}=true", labels::DEPLOYER);
        let context = Arc::new(self);

        Controller::new(accounts, watcher::Config::default().labels(&selector))
            .run(reconcile, error_policy, context)
            .for_each(|res| async move {
                match res {
                    Ok(o) => debug!("Reconciled deployer: {:?}", o),
                    Err(e) => warn!("Reconciliation error: {:?}", e),
                }
            })
            .await;

        Ok(())
    }
}

async fn reconcile(sa: Arc<ServiceAccount>, ctx: Arc<DeployerReconciler>) -> Result<Action> {
    let namespace = sa
        .namespace()
        .ok_or(CourierError::MissingObjectKey(".metadata.namespace"))?;
    evict(&ctx.clients, &namespace, &sa.name_any()).await;

    // The watcher reports the next edit
    Ok(Action::await_change())
}

async fn evict(clients: &ClientFactory, namespace: &str, name: &str) {
    if !clients.invalidate_service_account(namespace, name).await {
        debug!("No cached client for deployer {}/{}", namespace, name);
    }
}

fn error_policy(_sa: Arc<ServiceAccount>, error: &CourierError, _ctx: Arc<DeployerReconciler>) -> Action {
    error!("Reconciliation error: {}", error);
    Action::requeue(Duration::from_secs(60))
}
