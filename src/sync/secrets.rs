// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Create, update and list the secret deployed to one target

use crate::constants::{PLATFORM_INJECTED_KEYS, SERVICE_ACCOUNT_TOKEN_TYPE};
use crate::error::{CourierError, Result};
use crate::kubernetes::retry::{update_with_retry, RetryPolicy};
use crate::store::{DataGetter, SecretData};
use crate::sync::classify::TargetKey;
use crate::sync::marker::{self, ObjectMarker};
use crate::types::SecretTemplate;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::{
    api::{DeleteParams, ObjectMeta, PostParams},
    Api, Client, ResourceExt,
};
use std::collections::BTreeMap;
use tracing::{debug, info, instrument};

pub struct SecretSyncHandler {
    api: Api<Secret>,
    namespace: String,
    marker: ObjectMarker,
    template: SecretTemplate,
    /// Name recorded in status by the last successful sync, may be empty
    deployed_name: String,
    retry: RetryPolicy,
}

impl SecretSyncHandler {
    pub fn new(
        client: Client,
        namespace: &str,
        marker: ObjectMarker,
        template: SecretTemplate,
        deployed_name: &str,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            namespace: namespace.to_string(),
            marker,
            template,
            deployed_name: deployed_name.to_string(),
            retry,
        }
    }

    fn template_name(&self) -> &str {
        self.template.name.as_deref().unwrap_or_default()
    }

    fn template_generate_name(&self) -> &str {
        self.template.generate_name.as_deref().unwrap_or_default()
    }

    /// Whether the recorded name still satisfies the template's name or generateName.
    fn deployed_name_current(&self) -> bool {
        if self.deployed_name.is_empty() {
            return false;
        }
        let wanted = TargetKey::new("", &self.namespace, self.template_name(), self.template_generate_name());
        let deployed = TargetKey::new("", &self.namespace, &self.deployed_name, "");
        wanted.corresponds_to(&deployed)
    }

    /// The live deployed secret when its name no longer matches the template.
    #[instrument(skip(self), fields(namespace = %self.namespace, deployed = %self.deployed_name))]
    pub async fn get_stale(&self) -> Result<Option<Secret>> {
        if self.deployed_name.is_empty() || self.deployed_name_current() {
            return Ok(None);
        }
        let stale = self.api.get_opt(&self.deployed_name).await?;
        if stale.is_some() {
            debug!("Deployed secret {} no longer matches its template", self.deployed_name);
        }
        Ok(stale)
    }

    /// Ensure the secret exists with the data `getter` returns for `key`.
    ///
    /// The recorded name is kept unless it no longer matches the template or
    /// `force_recreate` is set, in which case a secret is created from the template name.
    #[instrument(skip(self, getter, key), fields(namespace = %self.namespace))]
    pub async fn sync<G>(&self, getter: &G, key: &G::Key, force_recreate: bool) -> Result<Secret>
    where
        G: DataGetter + ?Sized,
    {
        let data = getter.get_data(key).await?;

        let name = if !force_recreate && self.deployed_name_current() {
            self.deployed_name.as_str()
        } else {
            self.template_name()
        };

        let existing = if name.is_empty() {
            None
        } else {
            self.api.get_opt(name).await?
        };

        let Some(existing) = existing else {
            let mut desired = self.build(name, &data);
            self.marker.mark_managed(&mut desired);
            let created = self.api.create(&PostParams::default(), &desired).await?;
            info!("Created secret {}/{}", self.namespace, created.name_any());
            return Ok(created);
        };

        if !self.marker.is_referenced_by(&existing) {
            if let Some(other) = marker::manager(&existing).filter(|m| *m != self.marker.owner()) {
                return Err(CourierError::Inconsistent(format!(
                    "secret {}/{} is managed by {}",
                    self.namespace, name, other
                )));
            }
        }

        if !self.needs_update(&existing, &data) {
            debug!("Secret {}/{} is up to date", self.namespace, name);
            return Ok(existing);
        }

        let updated = update_with_retry(&self.api, name, &self.retry, |live| self.apply(live, &data)).await?;
        info!("Updated secret {}/{}", self.namespace, name);
        Ok(updated)
    }

    /// Secrets in the namespace managed by this target
    #[instrument(skip(self), fields(namespace = %self.namespace))]
    pub async fn list(&self) -> Result<Vec<Secret>> {
        let secrets = self.api.list(&self.marker.list_managed_selector()).await?;
        Ok(secrets
            .items
            .into_iter()
            .filter(|s| self.marker.is_managed_by(s))
            .collect())
    }

    /// Delete a secret, a missing one counts as deleted
    #[instrument(skip(self), fields(namespace = %self.namespace))]
    pub async fn delete(&self, name: &str) -> Result<()> {
        match self.api.delete(name, &DeleteParams::default()).await {
            Ok(_) => {
                info!("Deleted secret {}/{}", self.namespace, name);
                Ok(())
            }
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn desired_type(&self, data: &SecretData) -> Option<String> {
        self.template.type_.clone().or_else(|| data.type_.clone())
    }

    fn build(&self, name: &str, data: &SecretData) -> Secret {
        let (name, generate_name) = if name.is_empty() {
            (None, self.template.generate_name.clone())
        } else {
            (Some(name.to_string()), None)
        };
        Secret {
            metadata: ObjectMeta {
                name,
                generate_name,
                namespace: Some(self.namespace.clone()),
                labels: Some(self.template.labels.clone()),
                annotations: Some(self.template.annotations.clone()),
                ..Default::default()
            },
            data: Some(data.data.clone()),
            type_: self.desired_type(data),
            ..Default::default()
        }
    }

    fn needs_update(&self, live: &Secret, data: &SecretData) -> bool {
        let desired_type = self.desired_type(data);
        let type_differs = desired_type.is_some() && live.type_ != desired_type;
        let labels_differ = self
            .template
            .labels
            .iter()
            .any(|(k, v)| live.labels().get(k) != Some(v));
        let annotations_differ = self
            .template
            .annotations
            .iter()
            .any(|(k, v)| live.annotations().get(k) != Some(v));

        type_differs
            || labels_differ
            || annotations_differ
            || !self.marker.is_managed_by(live)
            || data_differs(live, &data.data)
    }

    fn apply(&self, live: &mut Secret, data: &SecretData) -> bool {
        if !self.needs_update(live, data) {
            return false;
        }
        let mut merged = data.data.clone();
        if is_token_secret(live) {
            if let Some(current) = &live.data {
                for key in PLATFORM_INJECTED_KEYS {
                    if let Some(value) = current.get(key) {
                        merged.entry(key.to_string()).or_insert_with(|| value.clone());
                    }
                }
            }
        }
        live.data = Some(merged);
        if let Some(type_) = self.desired_type(data) {
            live.type_ = Some(type_);
        }
        live.labels_mut().extend(self.template.labels.clone());
        live.annotations_mut().extend(self.template.annotations.clone());
        self.marker.mark_managed(live);
        true
    }
}

fn is_token_secret(secret: &Secret) -> bool {
    secret.type_.as_deref() == Some(SERVICE_ACCOUNT_TOKEN_TYPE)
}

/// Compares data, leaving out keys the platform injects into token secrets.
fn data_differs(live: &Secret, desired: &BTreeMap<String, ByteString>) -> bool {
    let empty = BTreeMap::new();
    let current = live.data.as_ref().unwrap_or(&empty);
    if !is_token_secret(live) {
        return current != desired;
    }
    let relevant = |m: &BTreeMap<String, ByteString>| -> BTreeMap<String, ByteString> {
        m.iter()
            .filter(|(k, _)| !PLATFORM_INJECTED_KEYS.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    };
    relevant(current) != relevant(desired)
}
