// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Optimistic-concurrency retries for writes to shared objects.

use crate::error::{CourierError, Result};
use kube::{api::PostParams, Api, Resource};
use serde::{de::DeserializeOwned, Serialize};
use std::fmt::Debug;
use std::future::Future;
use std::time::Duration;
use tokio_retry2::{strategy::ExponentialBackoff, Retry, RetryError};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 10,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    fn backoff(&self) -> impl Iterator<Item = Duration> {
        // Delays grow as base_delay * 2^n, capped at max_delay.
        let factor = (self.base_delay.as_millis() as u64 / 2).max(1);
        ExponentialBackoff::from_millis(2)
            .factor(factor)
            .max_delay(self.max_delay)
            .take(self.attempts.saturating_sub(1))
    }
}

/// Runs `op` until it succeeds, fails with a non-conflict error, or the attempts run out.
pub async fn retry_on_conflict<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    Retry::spawn(policy.backoff(), || {
        let attempt = op();
        async move {
            attempt.await.map_err(|e| {
                if e.is_conflict() {
                    debug!("Write conflicted, retrying: {}", e);
                    RetryError::transient(e)
                } else {
                    RetryError::permanent(e)
                }
            })
        }
    })
    .await
}

/// Read-modify-write of a named object. `mutate` returns whether it changed anything;
/// unchanged objects are not written.
pub async fn update_with_retry<K, F>(
    api: &Api<K>,
    name: &str,
    policy: &RetryPolicy,
    mutate: F,
) -> Result<K>
where
    K: Resource + Clone + DeserializeOwned + Serialize + Debug,
    F: Fn(&mut K) -> bool,
{
    let mutate = &mutate;
    retry_on_conflict(policy, move || async move {
        let mut obj = api.get(name).await?;
        if !mutate(&mut obj) {
            return Ok(obj);
        }
        api.replace(name, &PostParams::default(), &obj)
            .await
            .map_err(CourierError::from)
    })
    .await
}
