// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0
use anyhow::{bail, Context, Result};
use std::env;
use std::time::Duration;

use crate::kubernetes::retry::RetryPolicy;

/// Which backing store holds the secret values
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    Kubernetes,
}

/// Operator configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Upper bound for how long a built downstream client stays cached
    pub client_cache_max_ttl: Duration,
    /// Attempts for writes that hit optimistic-concurrency conflicts
    pub conflict_retry_attempts: usize,
    /// Number of DistributedSecrets reconciled concurrently
    pub worker_concurrency: u16,
    pub store_backend: StoreBackend,
    /// Namespace holding the secret values when using the kubernetes store
    pub store_namespace: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            client_cache_max_ttl: Duration::from_secs(30),
            conflict_retry_attempts: 10,
            worker_concurrency: 4,
            store_backend: StoreBackend::Kubernetes,
            store_namespace: "courier-system".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Config::default();

        let client_cache_max_ttl = match lookup("CLIENT_CACHE_MAX_TTL_SECS") {
            Some(v) => Duration::from_secs(
                v.parse()
                    .context("CLIENT_CACHE_MAX_TTL_SECS must be a number of seconds")?,
            ),
            None => defaults.client_cache_max_ttl,
        };

        let conflict_retry_attempts = match lookup("CONFLICT_RETRY_ATTEMPTS") {
            Some(v) => v
                .parse()
                .context("CONFLICT_RETRY_ATTEMPTS must be a positive number")?,
            None => defaults.conflict_retry_attempts,
        };
        if conflict_retry_attempts == 0 {
            bail!("CONFLICT_RETRY_ATTEMPTS must be at least 1");
        }

        let worker_concurrency = match lookup("WORKER_CONCURRENCY") {
            Some(v) => v
                .parse()
                .context("WORKER_CONCURRENCY must be a positive number")?,
            None => defaults.worker_concurrency,
        };

        let store_backend = match lookup("STORE_BACKEND").as_deref() {
            None | Some("kubernetes") => StoreBackend::Kubernetes,
            Some("memory") => StoreBackend::Memory,
            Some(other) => bail!("Unknown STORE_BACKEND '{}'", other),
        };

        let store_namespace = lookup("STORE_NAMESPACE").unwrap_or(defaults.store_namespace);

        Ok(Config {
            client_cache_max_ttl,
            conflict_retry_attempts,
            worker_concurrency,
            store_backend,
            store_namespace,
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.conflict_retry_attempts,
            ..RetryPolicy::default()
        }
    }
}
