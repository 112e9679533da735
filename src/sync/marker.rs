// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Ownership marks on dependent objects.
//!
//! Native owner references cannot span namespaces or clusters, so every
//! dependent carries a referenced-by set and at most one manager instead.
//! An object is only ever managed by a DistributedSecret that also references it.

use crate::constants::{annotations, labels};
use kube::{api::ListParams, Resource, ResourceExt};

/// Reads and stamps the marks of one DistributedSecret. Mutations stay in memory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectMarker {
    owner: String,
}

impl ObjectMarker {
    /// `owner` is the `namespace/name` of the DistributedSecret
    pub fn new(owner: impl Into<String>) -> Self {
        Self { owner: owner.into() }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Returns true when the object changed.
    pub fn mark_referenced<K: Resource>(&self, obj: &mut K) -> bool {
        let mut referencing = get_referencing_targets(obj);
        let mut changed = false;
        if !referencing.iter().any(|t| t == &self.owner) {
            referencing.push(self.owner.clone());
            obj.annotations_mut().insert(
                annotations::REFERENCED_BY.to_string(),
                join_tokens(&referencing),
            );
            changed = true;
        }
        if obj.labels().get(labels::REFERENCED).map(String::as_str) != Some("true") {
            obj.labels_mut()
                .insert(labels::REFERENCED.to_string(), "true".to_string());
            changed = true;
        }
        changed
    }

    /// Marks referenced first, then records this owner as the sole manager.
    pub fn mark_managed<K: Resource>(&self, obj: &mut K) -> bool {
        let mut changed = self.mark_referenced(obj);
        if !self.is_managed_by(obj) {
            obj.annotations_mut()
                .insert(annotations::MANAGED_BY.to_string(), self.owner.clone());
            changed = true;
        }
        changed
    }

    /// Only clears the manager when it is this owner.
    pub fn unmark_managed<K: Resource>(&self, obj: &mut K) -> bool {
        if !self.is_managed_by(obj) {
            return false;
        }
        obj.annotations_mut().remove(annotations::MANAGED_BY);
        true
    }

    pub fn unmark_referenced<K: Resource>(&self, obj: &mut K) -> bool {
        let before = get_referencing_targets(obj);
        let remaining: Vec<String> = before.iter().filter(|t| *t != &self.owner).cloned().collect();
        let mut changed = remaining.len() != before.len();

        if remaining.is_empty() {
            changed |= obj.annotations_mut().remove(annotations::REFERENCED_BY).is_some();
            changed |= obj.labels_mut().remove(labels::REFERENCED).is_some();
            // Nothing can be managed without being referenced.
            changed |= obj.annotations_mut().remove(annotations::MANAGED_BY).is_some();
        } else if changed {
            obj.annotations_mut()
                .insert(annotations::REFERENCED_BY.to_string(), join_tokens(&remaining));
            if self.is_managed_by(obj) {
                obj.annotations_mut().remove(annotations::MANAGED_BY);
            }
        }
        changed
    }

    pub fn is_managed_by<K: Resource>(&self, obj: &K) -> bool {
        manager(obj) == Some(self.owner.as_str())
    }

    pub fn is_referenced_by<K: Resource>(&self, obj: &K) -> bool {
        get_referencing_targets(obj).iter().any(|t| t == &self.owner)
    }

    /// Narrows a list to objects referenced by anyone. Combine with [`Self::is_managed_by`].
    pub fn list_managed_selector(&self) -> ListParams {
        self.list_referenced_selector()
    }

    /// Narrows a list to objects referenced by anyone. Combine with [`Self::is_referenced_by`].
    pub fn list_referenced_selector(&self) -> ListParams {
        ListParams::default().labels(&format!("{}=true", labels::REFERENCED))
    }
}

/// Current manager of an object, if any
pub fn manager<K: Resource>(obj: &K) -> Option<&str> {
    obj.annotations()
        .get(annotations::MANAGED_BY)
        .map(String::as_str)
        .filter(|m| !m.is_empty())
}

pub fn get_referencing_targets<K: Resource>(obj: &K) -> Vec<String> {
    obj.annotations()
        .get(annotations::REFERENCED_BY)
        .map(|v| {
            v.split(annotations::DELIMITER)
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn join_tokens(tokens: &[String]) -> String {
    tokens.join(&annotations::DELIMITER.to_string())
}
