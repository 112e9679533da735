// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0
use kube::{CustomResource, ResourceExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::sync::classify::TargetKey;

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, schemars::JsonSchema)]
#[kube(
    group = "courier.geeko.me",
    version = "v1alpha1",
    kind = "DistributedSecret",
    shortname = "dsec"
)]
#[kube(namespaced)]
#[kube(status = "DistributedSecretStatus")]
#[serde(rename_all = "camelCase")]
pub struct DistributedSecretSpec {
    /// Shape of the secret deployed to every target
    #[serde(default)]
    pub secret: SecretTemplate,
    /// Service accounts linked to the deployed secret
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub service_accounts: Vec<ServiceAccountLink>,
    #[serde(default)]
    pub targets: Vec<Target>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretTemplate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generate_name: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl SecretTemplate {
    fn has_name(&self) -> bool {
        self.name.as_deref().is_some_and(|n| !n.is_empty())
            || self.generate_name.as_deref().is_some_and(|n| !n.is_empty())
    }

    /// Layer `over` on top of self. Name and generateName travel together.
    pub fn merged(&self, over: &SecretTemplate) -> SecretTemplate {
        let (name, generate_name) = if over.has_name() {
            (over.name.clone(), over.generate_name.clone())
        } else {
            (self.name.clone(), self.generate_name.clone())
        };

        let mut labels = self.labels.clone();
        labels.extend(over.labels.clone());
        let mut annotations = self.annotations.clone();
        annotations.extend(over.annotations.clone());

        SecretTemplate {
            name,
            generate_name,
            type_: over.type_.clone().or_else(|| self.type_.clone()),
            labels,
            annotations,
        }
    }
}

/// How a service account points at the deployed secret
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, schemars::JsonSchema)]
pub enum LinkType {
    /// Listed under `secrets` (mountable)
    #[default]
    Secret,
    /// Listed under `imagePullSecrets`
    ImagePullSecret,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, schemars::JsonSchema)]
pub enum LinkMode {
    /// Created (or adopted) and owned by this DistributedSecret
    #[default]
    Managed,
    /// Pre-existing, only referenced
    Referenced,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServiceAccountLink {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generate_name: Option<String>,
    #[serde(default)]
    pub link_type: LinkType,
    #[serde(default)]
    pub mode: LinkMode,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    /// API server of the target cluster; empty means the local cluster
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,
    pub namespace: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret: Option<SecretTemplate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_accounts: Option<Vec<ServiceAccountLink>>,
    /// Secret in the DistributedSecret's namespace holding a kubeconfig for the target
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster_credential_secret: Option<String>,
}

impl Target {
    pub fn api_url(&self) -> &str {
        self.api_url.as_deref().unwrap_or_default()
    }

    pub fn cluster(&self) -> ClusterTarget<'_> {
        ClusterTarget {
            api_url: self.api_url(),
            namespace: &self.namespace,
            credential_secret: self.cluster_credential_secret.as_deref(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DistributedSecretStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub targets: Vec<TargetStatus>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, schemars::JsonSchema)]
pub enum Phase {
    AwaitingData,
    Ready,
    Degraded,
}

/// What was deployed to one target during the last reconciliation
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TargetStatus {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_url: String,
    pub namespace: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub deployed_secret_name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub identity_names: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cluster_credential_secret: String,
    /// Non-empty means nothing is guaranteed to exist in this target
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

impl TargetStatus {
    pub fn for_target(target: &Target) -> Self {
        TargetStatus {
            api_url: target.api_url().to_string(),
            namespace: target.namespace.clone(),
            cluster_credential_secret: target.cluster_credential_secret.clone().unwrap_or_default(),
            ..Default::default()
        }
    }

    pub fn key(&self) -> TargetKey {
        TargetKey::new(&self.api_url, &self.namespace, &self.deployed_secret_name, "")
    }

    pub fn cluster(&self) -> ClusterTarget<'_> {
        ClusterTarget {
            api_url: &self.api_url,
            namespace: &self.namespace,
            credential_secret: Some(self.cluster_credential_secret.as_str())
                .filter(|s| !s.is_empty()),
        }
    }

    /// Whether a removal has anything to clean up
    pub fn may_have_deployed(&self) -> bool {
        self.error.is_empty() || !self.deployed_secret_name.is_empty()
    }
}

/// Where a target lives, as needed to obtain a client for it
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClusterTarget<'a> {
    pub api_url: &'a str,
    pub namespace: &'a str,
    pub credential_secret: Option<&'a str>,
}

impl DistributedSecret {
    /// Identifier stamped on dependents, `namespace/name`
    pub fn owner_id(&self) -> String {
        format!("{}/{}", self.namespace().unwrap_or_default(), self.name_any())
    }

    /// Secret shape for a target, falling back to the resource name
    pub fn effective_template(&self, target: &Target) -> SecretTemplate {
        let mut template = match &target.secret {
            Some(over) => self.spec.secret.merged(over),
            None => self.spec.secret.clone(),
        };
        if !template.has_name() {
            template.name = Some(self.name_any());
        }
        template
    }

    pub fn effective_links<'a>(&'a self, target: &'a Target) -> &'a [ServiceAccountLink] {
        target
            .service_accounts
            .as_deref()
            .unwrap_or(&self.spec.service_accounts)
    }

    pub fn target_key(&self, target: &Target) -> TargetKey {
        let template = self.effective_template(target);
        TargetKey::new(
            target.api_url(),
            &target.namespace,
            template.name.as_deref().unwrap_or_default(),
            template.generate_name.as_deref().unwrap_or_default(),
        )
    }

    pub fn recorded_targets(&self) -> &[TargetStatus] {
        self.status
            .as_ref()
            .map(|s| s.targets.as_slice())
            .unwrap_or_default()
    }
}
