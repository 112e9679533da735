// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Target reconciliation: classification, ownership marks and dependents.

pub mod classify;
pub mod dependents;
pub mod identities;
pub mod marker;
pub mod secrets;

pub use classify::{classify, Classification, Duplicate, Duplicates, TargetKey};
pub use dependents::{CheckPoint, Dependents, DependentsHandler, TargetScope};
pub use identities::{IdentitySyncHandler, LinkKinds};
pub use marker::ObjectMarker;
pub use secrets::SecretSyncHandler;
