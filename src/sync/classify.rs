// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Matching of declared targets against the targets recorded in status.
//!
//! Targets are addressed by cluster and namespace, never by their position in
//! either list, so both lists may be reordered freely between reconciliations.

use std::collections::{BTreeMap, HashMap};

/// Comparable identity of a target.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct TargetKey {
    pub api_url: String,
    pub namespace: String,
    pub secret_name: String,
    pub secret_generate_name: String,
}

impl TargetKey {
    pub fn new(api_url: &str, namespace: &str, secret_name: &str, generate_name: &str) -> Self {
        TargetKey {
            api_url: normalize_api_url(api_url),
            namespace: namespace.to_string(),
            secret_name: secret_name.to_string(),
            secret_generate_name: generate_name.to_string(),
        }
    }

    /// Cluster and namespace, the unit targets are bucketed by.
    pub fn bucket(&self) -> (&str, &str) {
        (&self.api_url, &self.namespace)
    }

    /// Directional match of this key against a candidate.
    ///
    /// A concrete name only matches the identical name. A generate-name matches a
    /// candidate whose concrete name carries it as prefix. A key with neither only
    /// matches another key with neither.
    pub fn corresponds_to(&self, other: &TargetKey) -> bool {
        if self.bucket() != other.bucket() {
            return false;
        }
        if !self.secret_name.is_empty() {
            return self.secret_name == other.secret_name;
        }
        if !self.secret_generate_name.is_empty() {
            if !other.secret_name.is_empty() {
                return other.secret_name.starts_with(&self.secret_generate_name);
            }
            return other.secret_generate_name == self.secret_generate_name;
        }
        other.secret_name.is_empty() && other.secret_generate_name.is_empty()
    }
}

fn normalize_api_url(api_url: &str) -> String {
    api_url.trim().trim_end_matches('/').to_string()
}

/// A declared target that shares its bucket with an earlier declared target.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Duplicate {
    pub declared: usize,
    /// Declared index of the first target in the same bucket
    pub original: usize,
    /// Recorded duplicate paired with this one, if any
    pub recorded: Option<usize>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Duplicates {
    pub entries: Vec<Duplicate>,
    /// Recorded duplicates with no declared counterpart
    pub orphans: Vec<usize>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Classification {
    /// Declared index to recorded index, `None` for first-time targets
    pub sync: BTreeMap<usize, Option<usize>>,
    /// Recorded indices with no declared counterpart
    pub remove: Vec<usize>,
    pub duplicates: Duplicates,
}

#[derive(Default)]
struct Bucket {
    canonical: Option<usize>,
    rest: Vec<usize>,
}

/// Buckets in first-seen order; the first occurrence in each bucket is canonical.
fn bucket(keys: &[TargetKey]) -> (Vec<(String, String)>, HashMap<(String, String), Bucket>) {
    let mut order = Vec::new();
    let mut buckets: HashMap<(String, String), Bucket> = HashMap::new();
    for (i, key) in keys.iter().enumerate() {
        let id = (key.api_url.clone(), key.namespace.clone());
        let bucket = buckets.entry(id.clone()).or_insert_with(|| {
            order.push(id);
            Bucket::default()
        });
        match bucket.canonical {
            None => bucket.canonical = Some(i),
            Some(_) => bucket.rest.push(i),
        }
    }
    (order, buckets)
}

/// Partition declared and recorded targets.
pub fn classify(declared: &[TargetKey], recorded: &[TargetKey]) -> Classification {
    let (declared_order, declared_buckets) = bucket(declared);
    let (recorded_order, mut recorded_buckets) = bucket(recorded);

    let mut result = Classification::default();

    for id in &declared_order {
        let bucket = &declared_buckets[id];
        let Some(original) = bucket.canonical else {
            continue;
        };
        let mut recorded_bucket = recorded_buckets.remove(id);

        let recorded_canonical = recorded_bucket.as_mut().and_then(|b| b.canonical.take());
        result.sync.insert(original, recorded_canonical);

        // Duplicates carry no distinguishing state, pair them in encounter order.
        let mut recorded_rest = recorded_bucket
            .map(|b| b.rest)
            .unwrap_or_default()
            .into_iter();
        for &declared_dup in &bucket.rest {
            result.duplicates.entries.push(Duplicate {
                declared: declared_dup,
                original,
                recorded: recorded_rest.next(),
            });
        }
        result.duplicates.orphans.extend(recorded_rest);
    }

    for id in &recorded_order {
        if let Some(bucket) = recorded_buckets.remove(id) {
            result.remove.extend(bucket.canonical);
            result.duplicates.orphans.extend(bucket.rest);
        }
    }

    result.remove.sort_unstable();
    result.duplicates.orphans.sort_unstable();
    result
}
