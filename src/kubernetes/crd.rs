// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! CRD availability checking utilities

use crate::constants::crd::{POLL_INTERVAL_SECS, POLL_MAX_INTERVAL_SECS};
use crate::error::Result;
use crate::types::DistributedSecret;
use kube::{discovery::Discovery, Client, Resource};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

/// Wait for the DistributedSecret CRD to be served by the API server.
/// This uses exponential backoff starting at POLL_INTERVAL_SECS seconds.
pub async fn wait_for_distributed_secret_crd(client: &Client) -> Result<()> {
    let mut interval = POLL_INTERVAL_SECS;
    let group = DistributedSecret::group(&());
    let version = DistributedSecret::version(&());

    loop {
        match check_crd_exists(client).await {
            Ok(true) => {
                info!("DistributedSecret CRD ({}/{}) is available", group, version);
                return Ok(());
            }
            Ok(false) => {
                info!(
                    "DistributedSecret CRD ({}/{}) not yet available, waiting {} seconds...",
                    group, version, interval
                );
            }
            Err(e) => {
                warn!(
                    "Error checking for DistributedSecret CRD: {}, retrying in {} seconds...",
                    e, interval
                );
            }
        }

        sleep(Duration::from_secs(interval)).await;

        // Exponential backoff with max cap
        interval = (interval * 2).min(POLL_MAX_INTERVAL_SECS);
    }
}

async fn check_crd_exists(client: &Client) -> Result<bool> {
    let group = DistributedSecret::group(&());
    let discovery = Discovery::new(client.clone())
        .filter(&[group.as_ref()])
        .run()
        .await?;

    let found = discovery
        .groups()
        .filter(|g| g.name() == group)
        .flat_map(|g| g.recommended_resources())
        .any(|(ar, _)| ar.kind == DistributedSecret::kind(&()) && ar.version == DistributedSecret::version(&()));
    Ok(found)
}
