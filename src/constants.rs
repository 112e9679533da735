// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

/// Labels stamped on dependent objects. Consumers outside the operator rely on these.
pub mod labels {
    /// "true" when at least one DistributedSecret target references the object
    pub const REFERENCED: &str = "courier.geeko.me/referenced";
    /// Marks the service account a namespace trusts for deploying into the local cluster
    pub const DEPLOYER: &str = "courier.geeko.me/deployer";
}

/// Annotation keys used by Courier
pub mod annotations {
    /// Comma-delimited `namespace/name` tokens of every referencing DistributedSecret
    pub const REFERENCED_BY: &str = "courier.geeko.me/referenced-by";
    /// `namespace/name` of the single DistributedSecret allowed to own the object
    pub const MANAGED_BY: &str = "courier.geeko.me/managed-by";
    /// Separator between tokens in REFERENCED_BY
    pub const DELIMITER: char = ',';
}

/// The operator name used as field manager
pub const OPERATOR_NAME: &str = "courier";

/// Finalizer guarding cleanup of deployed targets
pub const FINALIZER: &str = "courier.geeko.me/cleanup";

/// Key inside a cluster credential secret holding the kubeconfig
pub const KUBECONFIG_KEY: &str = "kubeconfig";

/// Secret type whose data the platform partially populates
pub const SERVICE_ACCOUNT_TOKEN_TYPE: &str = "kubernetes.io/service-account-token";

/// Keys injected by the platform into service account token secrets
pub const PLATFORM_INJECTED_KEYS: [&str; 3] = ["ca.crt", "namespace", "token"];

/// Requested lifetime for deployer service account tokens (API minimum)
pub const DEPLOYER_TOKEN_SECS: i64 = 600;

/// CRD polling configuration
pub mod crd {
    /// Initial polling interval in seconds when waiting for CRD
    pub const POLL_INTERVAL_SECS: u64 = 10;
    /// Maximum polling interval in seconds (exponential backoff cap)
    pub const POLL_MAX_INTERVAL_SECS: u64 = 60;
}

/// Requeue intervals for the DistributedSecret reconciler
pub mod requeue {
    pub const SYNCED_SECS: u64 = 300;
    pub const FAILED_SECS: u64 = 60;
    pub const AWAITING_DATA_SECS: u64 = 120;
}
