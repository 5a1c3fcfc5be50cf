//! Namespace transfer.
//!
//! Moves a host-side VLAN link into the workload's network namespace,
//! renames it to the workload-visible name and brings it up in there. The
//! reverse operation, [`restore_to_host`], is the compensation the engine
//! runs when a later stage fails: an orphaned link inside a namespace that
//! is about to be torn down would be unrecoverable.

use attach_common::{AttachError, AttachResult};
use tracing::{info, warn};

use crate::link::{LinkTable, VlanLink};

/// Validated handle to a target network namespace.
#[derive(Debug, Clone)]
pub struct NetnsPath(String);

impl NetnsPath {
    /// Opens (validates) a namespace path handed over by the runtime.
    pub async fn open(path: &str) -> AttachResult<Self> {
        if path.is_empty() {
            return Err(AttachError::namespace("open", "namespace path is empty"));
        }
        tokio::fs::metadata(path)
            .await
            .map_err(|e| AttachError::namespace("open", format!("{}: {}", path, e)))?;
        Ok(Self(path.to_string()))
    }

    /// Returns the namespace path.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Moves the link into the namespace, renames it to the workload-visible
/// name and brings it up.
///
/// If the move succeeded but a later step fails, the link is moved back to
/// the host before the error is reported, so the caller never sees a
/// failure with the device stranded inside the namespace.
pub async fn transfer_to_namespace(
    links: &dyn LinkTable,
    link: &VlanLink,
    netns: &NetnsPath,
    ifname: &str,
) -> AttachResult<()> {
    links.move_to_namespace(&link.name, netns.as_str()).await?;

    let mut current_name = link.name.as_str();

    let result = async {
        links
            .ns_rename(netns.as_str(), &link.name, ifname)
            .await?;
        current_name = ifname;
        links.ns_set_up(netns.as_str(), ifname).await
    }
    .await;

    if let Err(err) = result {
        restore_to_host(links, netns, current_name, &link.name).await;
        return Err(err);
    }

    info!(
        "Transferred {} into {} as {}",
        link.name,
        netns.as_str(),
        ifname
    );
    Ok(())
}

/// Best-effort compensation: move the link back to the host namespace and
/// give it back its deterministic name so a retry can reuse it.
///
/// Failures are logged, never surfaced: compensation runs on an error path
/// that already has a primary error to report.
pub async fn restore_to_host(
    links: &dyn LinkTable,
    netns: &NetnsPath,
    current_name: &str,
    host_name: &str,
) {
    // Rename inside the namespace first: the workload-visible name (often
    // "eth0") would collide with a host device of the same name.
    let mut name = current_name;
    if current_name != host_name {
        match links.ns_rename(netns.as_str(), current_name, host_name).await {
            Ok(()) => name = host_name,
            Err(err) => warn!(
                "Could not rename {} back to {} before restoring: {}",
                current_name, host_name, err
            ),
        }
    }

    if let Err(err) = links.ns_move_to_host(netns.as_str(), name).await {
        warn!(
            "Failed to restore {} from {} to host: {}",
            name,
            netns.as_str(),
            err
        );
        return;
    }

    if name != host_name {
        if let Err(err) = links.rename(name, host_name).await {
            warn!(
                "Restored link {} but failed to rename it back to {}: {}",
                name, host_name, err
            );
            return;
        }
    }

    info!("Restored link {} to the host namespace", host_name);
}
