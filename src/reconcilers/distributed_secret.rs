// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! DistributedSecret reconciler - deploys the secret to every declared target.
//!
//! Each pass probes the secret data, classifies declared against recorded
//! targets, cleans up removed targets and then syncs the remaining ones. Status
//! is persisted after both stages since it is the only record of what exists.

use crate::config::Config;
use crate::constants::{requeue, FINALIZER, OPERATOR_NAME};
use crate::error::{CourierError, Result};
use crate::kubernetes::{RetryPolicy, TargetClients};
use crate::store::{DataGetter, StoreDataGetter};
use crate::sync::{classify, DependentsHandler, ObjectMarker, TargetKey, TargetScope};
use crate::types::{DistributedSecret, DistributedSecretStatus, Phase, Target, TargetStatus};
use futures::StreamExt;
use kube::{
    api::{Patch, PatchParams},
    runtime::{
        controller::{self, Action},
        finalizer::{finalizer, Event},
        watcher, Controller,
    },
    Api, Client, ResourceExt,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

/// Shared by every reconciliation
pub struct Context {
    pub client: Client,
    pub clients: Arc<dyn TargetClients>,
    pub getter: StoreDataGetter,
    pub retry: RetryPolicy,
}

pub struct DistributedSecretReconciler {
    context: Arc<Context>,
    concurrency: u16,
}

impl DistributedSecretReconciler {
    pub fn new(
        client: Client,
        clients: Arc<dyn TargetClients>,
        getter: StoreDataGetter,
        config: &Config,
    ) -> Self {
        Self {
            context: Arc::new(Context {
                client,
                clients,
                getter,
                retry: config.retry_policy(),
            }),
            concurrency: config.worker_concurrency,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let secrets: Api<DistributedSecret> = Api::all(self.context.client.clone());

        Controller::new(secrets, watcher::Config::default())
            .with_config(controller::Config::default().concurrency(self.concurrency))
            .run(reconcile, error_policy, self.context)
            .for_each(|res| async move {
                match res {
                    Ok(o) => debug!("Reconciled distributed secret: {:?}", o),
                    Err(e) => warn!("Reconciliation error: {:?}", e),
                }
            })
            .await;

        Ok(())
    }
}

async fn reconcile(ds: Arc<DistributedSecret>, ctx: Arc<Context>) -> Result<Action> {
    let namespace = ds
        .namespace()
        .ok_or(CourierError::MissingObjectKey(".metadata.namespace"))?;
    let api: Api<DistributedSecret> = Api::namespaced(ctx.client.clone(), &namespace);

    finalizer(&api, FINALIZER, ds, |event| async {
        match event {
            Event::Apply(ds) => apply(&ds, &ctx).await,
            Event::Cleanup(ds) => cleanup(&ds, &ctx).await,
        }
    })
    .await
    .map_err(|e| CourierError::FinalizerError(Box::new(e)))
}

fn error_policy(ds: Arc<DistributedSecret>, error: &CourierError, _ctx: Arc<Context>) -> Action {
    error!("Reconciliation of {} failed: {}", ds.owner_id(), error);
    Action::requeue(Duration::from_secs(requeue::FAILED_SECS))
}

/// One reconciliation of a live DistributedSecret.
#[instrument(skip(ds, ctx), fields(owner = %ds.owner_id()))]
pub async fn apply(ds: &DistributedSecret, ctx: &Context) -> Result<Action> {
    let owner = ds.owner_id();
    let namespace = ds.namespace().unwrap_or_default();
    let api: Api<DistributedSecret> = Api::namespaced(ctx.client.clone(), &namespace);
    let recorded = ds.recorded_targets().to_vec();

    if let Err(e) = ctx.getter.get_data(&owner).await {
        if !e.is_data_unavailable() {
            return Err(e);
        }
        info!("No secret data stored for {} yet", owner);
        let status = DistributedSecretStatus {
            phase: Some(Phase::AwaitingData),
            message: Some(e.to_string()),
            targets: recorded,
        };
        persist_status(&api, &ds.name_any(), &status).await?;
        return Ok(Action::requeue(Duration::from_secs(requeue::AWAITING_DATA_SECS)));
    }

    let declared: Vec<TargetKey> = ds.spec.targets.iter().map(|t| ds.target_key(t)).collect();
    let recorded_keys: Vec<TargetKey> = recorded.iter().map(TargetStatus::key).collect();
    let classification = classify(&declared, &recorded_keys);
    let marker = ObjectMarker::new(owner.clone());

    // Stage 1: targets no longer declared.
    let mut retained = Vec::new();
    for &j in &classification.remove {
        let previous = &recorded[j];
        if !previous.may_have_deployed() {
            debug!("Skipping cleanup of {} which never deployed", previous.namespace);
            continue;
        }
        if let Err(e) = remove_target(ctx, &namespace, &marker, previous).await {
            warn!("Failed to clean up target namespace {}: {}", previous.namespace, e);
            retained.push(TargetStatus {
                error: e.to_string(),
                ..previous.clone()
            });
        }
    }
    if !classification.duplicates.orphans.is_empty() {
        debug!("Dropping {} orphaned duplicate entries", classification.duplicates.orphans.len());
    }

    let mut interim: Vec<TargetStatus> = classification
        .sync
        .values()
        .flatten()
        .chain(classification.duplicates.entries.iter().filter_map(|d| d.recorded.as_ref()))
        .map(|&j| recorded[j].clone())
        .collect();
    interim.extend(retained.iter().cloned());
    let phase = ds.status.as_ref().and_then(|s| s.phase);
    persist_status(
        &api,
        &ds.name_any(),
        &DistributedSecretStatus {
            phase,
            message: None,
            targets: interim,
        },
    )
    .await?;

    // Stage 2: declared targets, in declaration order.
    let mut slots: Vec<Option<TargetStatus>> = vec![None; ds.spec.targets.len()];
    let mut failure = None;
    let mut awaiting_data = false;
    for (&i, &j) in &classification.sync {
        let previous = j.map(|j| &recorded[j]);
        let (status, result) = sync_target(ds, ctx, &namespace, &marker, &ds.spec.targets[i], previous).await;
        if let Err(e) = result {
            if e.is_data_unavailable() {
                awaiting_data = true;
            } else if !e.is_structural() && failure.is_none() {
                failure = Some(e);
            }
        }
        slots[i] = Some(status);
    }
    for duplicate in &classification.duplicates.entries {
        let target = &ds.spec.targets[duplicate.declared];
        warn!("Target namespace {} is declared more than once", target.namespace);
        slots[duplicate.declared] = Some(TargetStatus {
            error: CourierError::Inconsistent(format!(
                "duplicate of target #{} ({})",
                duplicate.original, target.namespace
            ))
            .to_string(),
            ..TargetStatus::for_target(target)
        });
    }

    // Declaration order keeps every original ahead of its duplicates, so the
    // entry that owns the deployment stays canonical on the next pass.
    let mut targets: Vec<TargetStatus> = slots.into_iter().flatten().collect();
    targets.extend(retained);
    let errors = targets.iter().filter(|t| !t.error.is_empty()).count();
    let status = DistributedSecretStatus {
        phase: Some(if awaiting_data {
            Phase::AwaitingData
        } else if errors > 0 {
            Phase::Degraded
        } else {
            Phase::Ready
        }),
        message: (errors > 0).then(|| format!("{} of {} targets failed", errors, targets.len())),
        targets,
    };
    persist_status(&api, &ds.name_any(), &status).await?;

    match failure {
        Some(e) => Err(e),
        None => Ok(Action::requeue(Duration::from_secs(requeue::SYNCED_SECS))),
    }
}

/// Checkpoint, sync and revert on failure. The status keeps what the checkpoint
/// saw whenever the sync does not complete.
async fn sync_target(
    ds: &DistributedSecret,
    ctx: &Context,
    namespace: &str,
    marker: &ObjectMarker,
    target: &Target,
    previous: Option<&TargetStatus>,
) -> (TargetStatus, Result<()>) {
    let mut status = TargetStatus::for_target(target);
    if let Some(previous) = previous {
        status.deployed_secret_name = previous.deployed_secret_name.clone();
        status.identity_names = previous.identity_names.clone();
    }

    let client = match ctx.clients.get_client(namespace, &target.cluster()).await {
        Ok(client) => client,
        Err(e) => {
            status.error = e.to_string();
            return (status, Err(e));
        }
    };

    let scope = TargetScope {
        namespace: target.namespace.clone(),
        template: ds.effective_template(target),
        links: ds.effective_links(target).to_vec(),
        deployed_secret_name: status.deployed_secret_name.clone(),
        identity_names: status.identity_names.clone(),
    };
    let handler = DependentsHandler::new(client, marker.clone(), scope, ctx.retry.clone());

    let checkpoint = match handler.checkpoint().await {
        Ok(checkpoint) => checkpoint,
        Err(e) => {
            status.error = e.to_string();
            return (status, Err(e));
        }
    };

    match handler.sync(&ctx.getter, marker.owner()).await {
        Ok(dependents) => {
            info!("Synced target namespace {}", target.namespace);
            status.deployed_secret_name = dependents.secret_name();
            status.identity_names = dependents.identity_names();
            (status, Ok(()))
        }
        Err(sync_error) => {
            warn!("Sync of target namespace {} failed: {}", target.namespace, sync_error);
            let error = match handler.revert_to(&checkpoint).await {
                Ok(()) => sync_error,
                Err(revert_error) => {
                    error!("Revert of target namespace {} failed: {}", target.namespace, revert_error);
                    CourierError::RevertFailed {
                        sync: Box::new(sync_error),
                        revert: Box::new(revert_error),
                    }
                }
            };
            status.deployed_secret_name = checkpoint.secret_name().to_string();
            status.identity_names = checkpoint.identity_names().map(str::to_string).collect();
            status.error = error.to_string();
            (status, Err(error))
        }
    }
}

async fn remove_target(
    ctx: &Context,
    namespace: &str,
    marker: &ObjectMarker,
    previous: &TargetStatus,
) -> Result<()> {
    let client = ctx.clients.get_client(namespace, &previous.cluster()).await?;
    let scope = TargetScope {
        namespace: previous.namespace.clone(),
        deployed_secret_name: previous.deployed_secret_name.clone(),
        identity_names: previous.identity_names.clone(),
        ..Default::default()
    };
    DependentsHandler::new(client, marker.clone(), scope, ctx.retry.clone())
        .cleanup()
        .await
}

/// Removes every recorded target before the finalizer is released.
#[instrument(skip(ds, ctx), fields(owner = %ds.owner_id()))]
pub async fn cleanup(ds: &DistributedSecret, ctx: &Context) -> Result<Action> {
    let namespace = ds.namespace().unwrap_or_default();
    let marker = ObjectMarker::new(ds.owner_id());

    let mut failed = Vec::new();
    for previous in ds.recorded_targets() {
        if !previous.may_have_deployed() {
            continue;
        }
        if let Err(e) = remove_target(ctx, &namespace, &marker, previous).await {
            warn!("Failed to clean up target namespace {}: {}", previous.namespace, e);
            failed.push(TargetStatus {
                error: e.to_string(),
                ..previous.clone()
            });
        }
    }

    if failed.is_empty() {
        info!("Cleaned up all targets of {}", ds.owner_id());
        return Ok(Action::await_change());
    }

    let api: Api<DistributedSecret> = Api::namespaced(ctx.client.clone(), &namespace);
    let message = format!("cleanup failed for {} targets", failed.len());
    let status = DistributedSecretStatus {
        phase: Some(Phase::Degraded),
        message: Some(message.clone()),
        targets: failed,
    };
    persist_status(&api, &ds.name_any(), &status).await?;
    Err(CourierError::CleanupFailed(vec![message]))
}

async fn persist_status(
    api: &Api<DistributedSecret>,
    name: &str,
    status: &DistributedSecretStatus,
) -> Result<()> {
    let patch = json!({
        "status": {
            "phase": status.phase,
            "message": status.message,
            "targets": status.targets,
        }
    });
    let pp = PatchParams {
        field_manager: Some(OPERATOR_NAME.to_string()),
        ..Default::default()
    };
    api.patch_status(name, &pp, &Patch::Merge(&patch)).await?;
    Ok(())
}
