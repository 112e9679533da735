// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Service accounts linked to the deployed secret

use crate::error::{CourierError, Result};
use crate::kubernetes::retry::{update_with_retry, RetryPolicy};
use crate::sync::marker::{self, ObjectMarker};
use crate::types::{LinkMode, LinkType, ServiceAccountLink};
use k8s_openapi::api::core::v1::{LocalObjectReference, ObjectReference, Secret, ServiceAccount};
use kube::{
    api::{DeleteParams, ObjectMeta, PostParams},
    Api, Client, ResourceExt,
};
use tracing::{debug, info, instrument};

pub struct IdentitySyncHandler {
    api: Api<ServiceAccount>,
    namespace: String,
    marker: ObjectMarker,
    links: Vec<ServiceAccountLink>,
    /// Identity names recorded in status, used to find generated names again
    recorded: Vec<String>,
    retry: RetryPolicy,
}

impl IdentitySyncHandler {
    pub fn new(
        client: Client,
        namespace: &str,
        marker: ObjectMarker,
        links: Vec<ServiceAccountLink>,
        recorded: Vec<String>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            namespace: namespace.to_string(),
            marker,
            links,
            recorded,
            retry,
        }
    }

    pub fn api(&self) -> &Api<ServiceAccount> {
        &self.api
    }

    /// Ensure every configured service account exists and carries our marks.
    #[instrument(skip(self), fields(namespace = %self.namespace))]
    pub async fn sync(&self) -> Result<Vec<(ServiceAccount, LinkType)>> {
        let mut synced = Vec::with_capacity(self.links.len());
        for link in &self.links {
            let sa = match link.mode {
                LinkMode::Referenced => self.sync_referenced(link).await?,
                LinkMode::Managed => self.sync_managed(link).await?,
            };
            synced.push((sa, link.link_type));
        }
        Ok(synced)
    }

    async fn sync_referenced(&self, link: &ServiceAccountLink) -> Result<ServiceAccount> {
        let Some(name) = link.name.as_deref().filter(|n| !n.is_empty()) else {
            return Err(CourierError::ConfigurationError(
                "referenced service accounts need a name".to_string(),
            ));
        };
        let marker = &self.marker;
        update_with_retry(&self.api, name, &self.retry, |sa| {
            let mut changed = marker.mark_referenced(sa);
            // Switching from managed to referenced gives up ownership.
            changed |= marker.unmark_managed(sa);
            changed
        })
        .await
    }

    async fn sync_managed(&self, link: &ServiceAccountLink) -> Result<ServiceAccount> {
        let existing = self.find_managed(link).await?;

        let Some(existing) = existing else {
            let mut sa = ServiceAccount {
                metadata: ObjectMeta {
                    name: link.name.clone().filter(|n| !n.is_empty()),
                    generate_name: link.generate_name.clone().filter(|n| !n.is_empty()),
                    namespace: Some(self.namespace.clone()),
                    labels: Some(link.labels.clone()),
                    annotations: Some(link.annotations.clone()),
                    ..Default::default()
                },
                ..Default::default()
            };
            if sa.metadata.name.is_none() && sa.metadata.generate_name.is_none() {
                return Err(CourierError::ConfigurationError(
                    "managed service accounts need a name or generateName".to_string(),
                ));
            }
            self.marker.mark_managed(&mut sa);
            let created = self.api.create(&PostParams::default(), &sa).await?;
            info!("Created service account {}/{}", self.namespace, created.name_any());
            return Ok(created);
        };

        if !self.marker.is_referenced_by(&existing) {
            if let Some(other) = marker::manager(&existing).filter(|m| *m != self.marker.owner()) {
                return Err(CourierError::Inconsistent(format!(
                    "service account {}/{} is managed by {}",
                    self.namespace,
                    existing.name_any(),
                    other
                )));
            }
        }

        let marker = &self.marker;
        update_with_retry(&self.api, &existing.name_any(), &self.retry, |sa| {
            let mut changed = marker.mark_managed(sa);
            for (k, v) in &link.labels {
                if sa.labels().get(k) != Some(v) {
                    sa.labels_mut().insert(k.clone(), v.clone());
                    changed = true;
                }
            }
            for (k, v) in &link.annotations {
                if sa.annotations().get(k) != Some(v) {
                    sa.annotations_mut().insert(k.clone(), v.clone());
                    changed = true;
                }
            }
            changed
        })
        .await
    }

    /// By name, or by generateName among the recorded identities.
    async fn find_managed(&self, link: &ServiceAccountLink) -> Result<Option<ServiceAccount>> {
        if let Some(name) = link.name.as_deref().filter(|n| !n.is_empty()) {
            return Ok(self.api.get_opt(name).await?);
        }
        let Some(prefix) = link.generate_name.as_deref().filter(|n| !n.is_empty()) else {
            return Ok(None);
        };
        for name in self.recorded.iter().filter(|n| n.starts_with(prefix)) {
            if let Some(sa) = self.api.get_opt(name).await? {
                if self.marker.is_managed_by(&sa) {
                    return Ok(Some(sa));
                }
            }
        }
        Ok(None)
    }

    /// Point each identity at `secret_name` with its configured link kind.
    #[instrument(skip(self, identities), fields(namespace = %self.namespace))]
    pub async fn link_to_secret(
        &self,
        identities: &[(ServiceAccount, LinkType)],
        secret_name: &str,
    ) -> Result<Vec<ServiceAccount>> {
        let mut linked = Vec::with_capacity(identities.len());
        for (sa, link_type) in identities {
            let updated = update_with_retry(&self.api, &sa.name_any(), &self.retry, |sa| {
                set_links(sa, secret_name, LinkKinds::only(*link_type))
            })
            .await?;
            debug!("Linked service account {} to secret {}", updated.name_any(), secret_name);
            linked.push(updated);
        }
        Ok(linked)
    }

    /// Drops every reference to `secret`. Not persisted.
    pub fn unlink(&self, secret: &Secret, sa: &mut ServiceAccount) -> bool {
        self.unlink_by_name(&secret.name_any(), sa)
    }

    /// Drops every reference to the named secret. Not persisted.
    pub fn unlink_by_name(&self, secret_name: &str, sa: &mut ServiceAccount) -> bool {
        set_links(sa, secret_name, LinkKinds::default())
    }

    /// Service accounts in the namespace referenced by this target
    #[instrument(skip(self), fields(namespace = %self.namespace))]
    pub async fn list(&self) -> Result<Vec<ServiceAccount>> {
        let accounts = self.api.list(&self.marker.list_referenced_selector()).await?;
        Ok(accounts
            .items
            .into_iter()
            .filter(|sa| self.marker.is_referenced_by(sa))
            .collect())
    }

    #[instrument(skip(self), fields(namespace = %self.namespace))]
    pub async fn delete(&self, name: &str) -> Result<()> {
        match self.api.delete(name, &DeleteParams::default()).await {
            Ok(_) => {
                info!("Deleted service account {}/{}", self.namespace, name);
                Ok(())
            }
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Read-modify-write of a service account under conflict retries
    pub async fn update<F>(&self, name: &str, mutate: F) -> Result<ServiceAccount>
    where
        F: Fn(&mut ServiceAccount) -> bool,
    {
        update_with_retry(&self.api, name, &self.retry, mutate).await
    }
}

/// Which references a service account holds to one secret
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LinkKinds {
    /// Listed under `secrets`
    pub secret: bool,
    /// Listed under `imagePullSecrets`
    pub pull: bool,
}

impl LinkKinds {
    pub fn only(link_type: LinkType) -> Self {
        match link_type {
            LinkType::Secret => LinkKinds { secret: true, pull: false },
            LinkType::ImagePullSecret => LinkKinds { secret: false, pull: true },
        }
    }

    pub fn of(sa: &ServiceAccount, secret_name: &str) -> Self {
        LinkKinds {
            secret: has_secret_link(sa, secret_name),
            pull: has_pull_link(sa, secret_name),
        }
    }
}

fn has_secret_link(sa: &ServiceAccount, secret_name: &str) -> bool {
    sa.secrets
        .iter()
        .flatten()
        .any(|r| r.name.as_deref() == Some(secret_name))
}

fn has_pull_link(sa: &ServiceAccount, secret_name: &str) -> bool {
    let wanted = pull_reference(secret_name);
    sa.image_pull_secrets.iter().flatten().any(|r| *r == wanted)
}

fn pull_reference(secret_name: &str) -> LocalObjectReference {
    LocalObjectReference {
        name: secret_name.to_owned().into(),
    }
}

/// Make the references to `secret_name` exactly `kinds`. Returns true when changed.
pub fn set_links(sa: &mut ServiceAccount, secret_name: &str, kinds: LinkKinds) -> bool {
    let mut changed = false;

    let has_secret = has_secret_link(sa, secret_name);
    if kinds.secret && !has_secret {
        sa.secrets.get_or_insert_with(Vec::new).push(ObjectReference {
            name: Some(secret_name.to_string()),
            ..Default::default()
        });
        changed = true;
    } else if !kinds.secret && has_secret {
        if let Some(refs) = sa.secrets.as_mut() {
            refs.retain(|r| r.name.as_deref() != Some(secret_name));
        }
        changed = true;
    }

    let has_pull = has_pull_link(sa, secret_name);
    let wanted = pull_reference(secret_name);
    if kinds.pull && !has_pull {
        sa.image_pull_secrets.get_or_insert_with(Vec::new).push(wanted);
        changed = true;
    } else if !kinds.pull && has_pull {
        if let Some(refs) = sa.image_pull_secrets.as_mut() {
            refs.retain(|r| *r != wanted);
        }
        changed = true;
    }

    changed
}
