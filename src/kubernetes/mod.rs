// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Kubernetes utilities for CRD discovery, target clients and conflict retries.

pub mod cache;
pub mod client;
pub mod crd;
pub mod retry;

pub use client::{ClientFactory, TargetClients};
pub use crd::wait_for_distributed_secret_crd;
pub use retry::{retry_on_conflict, update_with_retry, RetryPolicy};
