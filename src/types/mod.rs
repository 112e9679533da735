// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Custom resource types.

pub mod distributed_secret;

pub use distributed_secret::{
    ClusterTarget, DistributedSecret, DistributedSecretSpec, DistributedSecretStatus, LinkMode,
    LinkType, Phase, SecretTemplate, ServiceAccountLink, Target, TargetStatus,
};
