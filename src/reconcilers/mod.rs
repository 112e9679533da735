// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Kubernetes reconcilers that react to watch events.

pub mod deployer;
pub mod distributed_secret;

pub use deployer::DeployerReconciler;
pub use distributed_secret::DistributedSecretReconciler;
