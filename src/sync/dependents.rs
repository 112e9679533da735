// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Per-target synchronization of the secret and its service accounts.
//!
//! There is no multi-object transaction to lean on. A sync is preceded by a
//! [`CheckPoint`] and a failed sync is compensated by [`DependentsHandler::revert_to`],
//! which can itself fail.

use crate::error::{CourierError, Result};
use crate::kubernetes::retry::RetryPolicy;
use crate::store::DataGetter;
use crate::sync::identities::{set_links, IdentitySyncHandler, LinkKinds};
use crate::sync::marker::ObjectMarker;
use crate::sync::secrets::SecretSyncHandler;
use crate::types::{SecretTemplate, ServiceAccountLink};
use k8s_openapi::api::core::v1::{Secret, ServiceAccount};
use kube::{Client, ResourceExt};
use std::collections::BTreeMap;
use tracing::{debug, info, instrument, warn};

/// What is known about one target before touching it
#[derive(Clone, Debug, Default)]
pub struct TargetScope {
    pub namespace: String,
    pub template: SecretTemplate,
    pub links: Vec<ServiceAccountLink>,
    /// As recorded in status, empty for first-time targets
    pub deployed_secret_name: String,
    pub identity_names: Vec<String>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct IdentityState {
    links: LinkKinds,
    managed: bool,
}

/// Snapshot of a target's dependents taken before a sync. Never persisted.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CheckPoint {
    secret_name: String,
    identities: BTreeMap<String, IdentityState>,
}

impl CheckPoint {
    pub fn secret_name(&self) -> &str {
        &self.secret_name
    }

    pub fn identity_names(&self) -> impl Iterator<Item = &str> {
        self.identities.keys().map(String::as_str)
    }
}

/// Outcome of a successful sync
#[derive(Clone, Debug)]
pub struct Dependents {
    pub secret: Secret,
    pub identities: Vec<ServiceAccount>,
}

impl Dependents {
    pub fn secret_name(&self) -> String {
        self.secret.name_any()
    }

    pub fn identity_names(&self) -> Vec<String> {
        self.identities.iter().map(|sa| sa.name_any()).collect()
    }
}

pub struct DependentsHandler {
    namespace: String,
    marker: ObjectMarker,
    secrets: SecretSyncHandler,
    identities: IdentitySyncHandler,
    deployed_secret_name: String,
    identity_names: Vec<String>,
}

impl DependentsHandler {
    pub fn new(client: Client, marker: ObjectMarker, scope: TargetScope, retry: RetryPolicy) -> Self {
        let secrets = SecretSyncHandler::new(
            client.clone(),
            &scope.namespace,
            marker.clone(),
            scope.template,
            &scope.deployed_secret_name,
            retry.clone(),
        );
        let identities = IdentitySyncHandler::new(
            client,
            &scope.namespace,
            marker.clone(),
            scope.links,
            scope.identity_names.clone(),
            retry,
        );
        Self {
            namespace: scope.namespace,
            marker,
            secrets,
            identities,
            deployed_secret_name: scope.deployed_secret_name,
            identity_names: scope.identity_names,
        }
    }

    #[instrument(skip(self), fields(namespace = %self.namespace))]
    pub async fn checkpoint(&self) -> Result<CheckPoint> {
        let mut identities = BTreeMap::new();
        for name in &self.identity_names {
            let Some(sa) = self.identities.api().get_opt(name).await? else {
                continue;
            };
            let links = if self.deployed_secret_name.is_empty() {
                LinkKinds::default()
            } else {
                LinkKinds::of(&sa, &self.deployed_secret_name)
            };
            identities.insert(
                name.clone(),
                IdentityState {
                    links,
                    managed: self.marker.is_managed_by(&sa),
                },
            );
        }
        Ok(CheckPoint {
            secret_name: self.deployed_secret_name.clone(),
            identities,
        })
    }

    /// Service accounts, then the secret, then the links between them.
    #[instrument(skip(self, getter, key), fields(namespace = %self.namespace))]
    pub async fn sync<G>(&self, getter: &G, key: &G::Key) -> Result<Dependents>
    where
        G: DataGetter + ?Sized,
    {
        let identities = self.identities.sync().await?;

        let stale = self.secrets.get_stale().await?;
        if let Some(stale) = &stale {
            info!("Secret {}/{} was renamed, recreating", self.namespace, stale.name_any());
        }
        let secret = self.secrets.sync(getter, key, stale.is_some()).await?;
        let secret_name = secret.name_any();

        let linked = self.identities.link_to_secret(&identities, &secret_name).await?;

        if let Err(e) = self.prune(&secret_name, &linked).await {
            warn!("Failed to prune stale dependents in {}: {}", self.namespace, e);
        }

        Ok(Dependents {
            secret,
            identities: linked,
        })
    }

    /// Release dependents that the last sync no longer uses.
    async fn prune(&self, keep_secret: &str, keep_identities: &[ServiceAccount]) -> Result<()> {
        let stale: Vec<String> = self
            .secrets
            .list()
            .await?
            .iter()
            .map(|s| s.name_any())
            .filter(|n| n != keep_secret)
            .collect();
        let keep: Vec<String> = keep_identities.iter().map(|sa| sa.name_any()).collect();

        for sa in self.identities.list().await? {
            let name = sa.name_any();
            if keep.contains(&name) {
                if stale.iter().any(|s| LinkKinds::of(&sa, s) != LinkKinds::default()) {
                    self.identities
                        .update(&name, |sa| unlink_all(sa, &stale))
                        .await?;
                }
            } else if self.marker.is_managed_by(&sa) {
                self.identities.delete(&name).await?;
            } else {
                self.release(&name, &stale, Some(keep_secret)).await?;
            }
        }

        for name in &stale {
            self.secrets.delete(name).await?;
            debug!("Pruned stale secret {}/{}", self.namespace, name);
        }
        Ok(())
    }

    /// Unlink from the given secrets and drop our reference mark.
    async fn release(&self, name: &str, secrets: &[String], also: Option<&str>) -> Result<()> {
        let marker = &self.marker;
        let result = self
            .identities
            .update(name, |sa| {
                let mut changed = unlink_all(sa, secrets);
                if let Some(extra) = also.filter(|s| !s.is_empty()) {
                    changed |= set_links(sa, extra, LinkKinds::default());
                }
                changed |= marker.unmark_referenced(sa);
                changed
            })
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Remove everything this target deployed to the namespace.
    ///
    /// Keeps going past individual failures and reports all of them at the end.
    #[instrument(skip(self), fields(namespace = %self.namespace))]
    pub async fn cleanup(&self) -> Result<()> {
        let secrets: Vec<String> = self.secrets.list().await?.iter().map(|s| s.name_any()).collect();
        let mut failures = Vec::new();

        for sa in self.identities.list().await? {
            let name = sa.name_any();
            let result = if self.marker.is_managed_by(&sa) {
                self.identities.delete(&name).await
            } else {
                self.release(&name, &secrets, None).await
            };
            if let Err(e) = result {
                failures.push(format!("service account {}/{}: {}", self.namespace, name, e));
            }
        }

        for name in &secrets {
            if let Err(e) = self.secrets.delete(name).await {
                failures.push(format!("secret {}/{}: {}", self.namespace, name, e));
            }
        }

        if failures.is_empty() {
            info!("Cleaned up target namespace {}", self.namespace);
            Ok(())
        } else {
            Err(CourierError::CleanupFailed(failures))
        }
    }

    /// Compensate a failed sync so the target looks like it did at `checkpoint`.
    #[instrument(skip(self, checkpoint), fields(namespace = %self.namespace))]
    pub async fn revert_to(&self, checkpoint: &CheckPoint) -> Result<()> {
        let discard: Vec<String> = self
            .secrets
            .list()
            .await?
            .iter()
            .map(|s| s.name_any())
            .filter(|n| *n != checkpoint.secret_name)
            .collect();

        for sa in self.identities.list().await? {
            let name = sa.name_any();
            match checkpoint.identities.get(&name) {
                Some(state) => {
                    let marker = &self.marker;
                    self.identities
                        .update(&name, |sa| restore(sa, marker, &discard, &checkpoint.secret_name, *state))
                        .await?;
                }
                None if self.marker.is_managed_by(&sa) => {
                    self.identities.delete(&name).await?;
                }
                None => {
                    self.release(&name, &discard, Some(checkpoint.secret_name.as_str())).await?;
                }
            }
        }

        for name in &discard {
            self.secrets.delete(name).await?;
        }
        debug!("Reverted {} to checkpoint", self.namespace);
        Ok(())
    }
}

fn unlink_all(sa: &mut ServiceAccount, secrets: &[String]) -> bool {
    secrets
        .iter()
        .fold(false, |changed, s| set_links(sa, s, LinkKinds::default()) || changed)
}

fn restore(
    sa: &mut ServiceAccount,
    marker: &ObjectMarker,
    discard: &[String],
    secret_name: &str,
    state: IdentityState,
) -> bool {
    let mut changed = unlink_all(sa, discard);
    if !secret_name.is_empty() {
        changed |= set_links(sa, secret_name, state.links);
    }
    if state.managed {
        changed |= marker.mark_managed(sa);
    } else {
        changed |= marker.mark_referenced(sa);
        changed |= marker.unmark_managed(sa);
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{annotations, labels};
    use crate::store::{MemoryStore, SecretData, SecretStore, StoreDataGetter};
    use crate::test_utils::FakeApiServer;
    use crate::types::{LinkMode, LinkType};
    use k8s_openapi::ByteString;
    use std::sync::Arc;
    use std::time::Duration;

    const OWNER: &str = "apps/db-creds";

    async fn getter() -> StoreDataGetter {
        let store = Arc::new(MemoryStore::new());
        let value = SecretData {
            type_: None,
            data: BTreeMap::from([("password".to_string(), ByteString(b"hunter2".to_vec()))]),
        };
        store.store(OWNER, &value.to_bytes().unwrap()).await.unwrap();
        StoreDataGetter::new(store)
    }

    fn links() -> Vec<ServiceAccountLink> {
        vec![
            ServiceAccountLink {
                name: Some("builder".to_string()),
                ..Default::default()
            },
            ServiceAccountLink {
                name: Some("default".to_string()),
                link_type: LinkType::ImagePullSecret,
                mode: LinkMode::Referenced,
                ..Default::default()
            },
        ]
    }

    fn scope(secret: &str, deployed: &str, identities: &[&str]) -> TargetScope {
        TargetScope {
            namespace: "a".to_string(),
            template: SecretTemplate {
                name: Some(secret.to_string()),
                ..Default::default()
            },
            links: links(),
            deployed_secret_name: deployed.to_string(),
            identity_names: identities.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn handler(server: &FakeApiServer, scope: TargetScope) -> DependentsHandler {
        let retry = RetryPolicy {
            attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        };
        DependentsHandler::new(server.client(), ObjectMarker::new(OWNER), scope, retry)
    }

    fn server_with_default_account() -> FakeApiServer {
        let server = FakeApiServer::new();
        server.insert_service_account("a", "default", None, None);
        server
    }

    fn has_marks(sa: &ServiceAccount) -> bool {
        sa.labels().contains_key(labels::REFERENCED)
            || sa.annotations().contains_key(annotations::REFERENCED_BY)
            || sa.annotations().contains_key(annotations::MANAGED_BY)
    }

    #[tokio::test]
    async fn test_sync_creates_and_links_dependents() {
        let server = server_with_default_account();

        let dependents = handler(&server, scope("db", "", &[]))
            .sync(&getter().await, OWNER)
            .await
            .unwrap();

        assert_eq!(dependents.secret_name(), "db");
        assert_eq!(dependents.identity_names(), vec!["builder", "default"]);
        let builder = server.service_account("a", "builder").unwrap();
        let default = server.service_account("a", "default").unwrap();
        assert_eq!(LinkKinds::of(&builder, "db"), LinkKinds { secret: true, pull: false });
        assert_eq!(LinkKinds::of(&default, "db"), LinkKinds { secret: false, pull: true });
        assert!(ObjectMarker::new(OWNER).is_managed_by(&builder));
        assert!(!ObjectMarker::new(OWNER).is_managed_by(&default));
    }

    #[tokio::test]
    async fn test_checkpoint_then_revert_is_noop() {
        let server = server_with_default_account();
        handler(&server, scope("db", "", &[]))
            .sync(&getter().await, OWNER)
            .await
            .unwrap();
        server.clear_requests();

        let handler = handler(&server, scope("db", "db", &["builder", "default"]));
        let checkpoint = handler.checkpoint().await.unwrap();
        handler.revert_to(&checkpoint).await.unwrap();

        assert_eq!(checkpoint.secret_name(), "db");
        assert_eq!(checkpoint.identity_names().collect::<Vec<_>>(), vec!["builder", "default"]);
        assert_eq!(server.mutation_count(), 0);
    }

    #[tokio::test]
    async fn test_revert_after_failed_first_sync_removes_new_objects() {
        let server = server_with_default_account();
        server.inject_error("PUT", "/api/v1/namespaces/a/serviceaccounts/builder", 500, 1);
        let handler = handler(&server, scope("db", "", &[]));
        let checkpoint = handler.checkpoint().await.unwrap();

        let err = handler.sync(&getter().await, OWNER).await.unwrap_err();
        assert!(!err.is_conflict());
        handler.revert_to(&checkpoint).await.unwrap();

        assert!(server.names("a", "secrets").is_empty());
        assert_eq!(server.names("a", "serviceaccounts"), vec!["default"]);
        assert!(!has_marks(&server.service_account("a", "default").unwrap()));
    }

    #[tokio::test]
    async fn test_revert_after_failed_rename_restores_previous_secret() {
        let server = server_with_default_account();
        handler(&server, scope("db", "", &[]))
            .sync(&getter().await, OWNER)
            .await
            .unwrap();
        server.inject_error("PUT", "/api/v1/namespaces/a/serviceaccounts/builder", 500, 1);

        let handler = handler(&server, scope("db-v2", "db", &["builder", "default"]));
        let checkpoint = handler.checkpoint().await.unwrap();
        assert!(handler.sync(&getter().await, OWNER).await.is_err());
        handler.revert_to(&checkpoint).await.unwrap();

        assert_eq!(server.names("a", "secrets"), vec!["db"]);
        let builder = server.service_account("a", "builder").unwrap();
        let default = server.service_account("a", "default").unwrap();
        assert_eq!(LinkKinds::of(&builder, "db"), LinkKinds { secret: true, pull: false });
        assert_eq!(LinkKinds::of(&default, "db"), LinkKinds { secret: false, pull: true });
        assert_eq!(LinkKinds::of(&default, "db-v2"), LinkKinds::default());
        assert!(ObjectMarker::new(OWNER).is_managed_by(&builder));
    }

    #[tokio::test]
    async fn test_successful_rename_prunes_old_secret() {
        let server = server_with_default_account();
        handler(&server, scope("db", "", &[]))
            .sync(&getter().await, OWNER)
            .await
            .unwrap();

        handler(&server, scope("db-v2", "db", &["builder", "default"]))
            .sync(&getter().await, OWNER)
            .await
            .unwrap();

        assert_eq!(server.names("a", "secrets"), vec!["db-v2"]);
        let default = server.service_account("a", "default").unwrap();
        assert_eq!(LinkKinds::of(&default, "db"), LinkKinds::default());
        assert!(LinkKinds::of(&default, "db-v2").pull);
    }

    #[tokio::test]
    async fn test_dropped_link_is_released() {
        let server = server_with_default_account();
        handler(&server, scope("db", "", &[]))
            .sync(&getter().await, OWNER)
            .await
            .unwrap();

        let mut narrowed = scope("db", "db", &["builder", "default"]);
        narrowed.links.truncate(1);
        handler(&server, narrowed).sync(&getter().await, OWNER).await.unwrap();

        let default = server.service_account("a", "default").unwrap();
        assert!(!has_marks(&default));
        assert_eq!(LinkKinds::of(&default, "db"), LinkKinds::default());
    }

    #[tokio::test]
    async fn test_cleanup_removes_only_our_dependents() {
        let server = server_with_default_account();
        server.insert_secret("a", "unrelated", &[("k", "v")], None, None);
        handler(&server, scope("db", "", &[]))
            .sync(&getter().await, OWNER)
            .await
            .unwrap();

        handler(&server, scope("db", "db", &["builder", "default"]))
            .cleanup()
            .await
            .unwrap();

        assert_eq!(server.names("a", "secrets"), vec!["unrelated"]);
        assert_eq!(server.names("a", "serviceaccounts"), vec!["default"]);
        let default = server.service_account("a", "default").unwrap();
        assert!(!has_marks(&default));
        assert_eq!(LinkKinds::of(&default, "db"), LinkKinds::default());
    }

    #[tokio::test]
    async fn test_cleanup_reports_every_failure() {
        let server = server_with_default_account();
        handler(&server, scope("db", "", &[]))
            .sync(&getter().await, OWNER)
            .await
            .unwrap();
        server.inject_error("DELETE", "/api/v1/namespaces/a/secrets/db", 500, 1);

        let err = handler(&server, scope("db", "db", &["builder", "default"]))
            .cleanup()
            .await
            .unwrap_err();

        assert!(matches!(&err, CourierError::CleanupFailed(f) if f.len() == 1));
        assert_eq!(server.names("a", "serviceaccounts"), vec!["default"]);
        assert_eq!(server.names("a", "secrets"), vec!["db"]);
    }
}
