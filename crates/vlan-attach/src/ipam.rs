//! Address binding via the external address-management collaborator.
//!
//! The engine does not allocate addresses itself: it delegates to the IPAM
//! plugin named in the attachment configuration, invoking it with the
//! standard environment and the original configuration document on stdin,
//! then applies the returned lease (addresses and routes) on the workload
//! interface inside its namespace.

use async_trait::async_trait;
use attach_common::{AttachError, AttachResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::NetConf;
use crate::link::LinkTable;
use crate::netns::NetnsPath;
use crate::types::{CmdArgs, Route};

/// Bound on a single delegate invocation. Expiry is a failure, not a wait.
const DELEGATE_TIMEOUT: Duration = Duration::from_secs(30);

/// A workload-bound address allocation returned by the collaborator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AddressLease {
    /// Leased addresses.
    #[serde(default)]
    pub ips: Vec<LeasedIp>,
    /// Routes to configure alongside the addresses.
    #[serde(default)]
    pub routes: Vec<Route>,
}

/// One leased address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeasedIp {
    /// Address with prefix length.
    pub address: String,
    /// Gateway for this address.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
}

/// Capability trait for the address-management collaborator.
///
/// `release` is idempotent: releasing a never-allocated or already-released
/// lease is a success, so DEL stays safely retriable.
#[async_trait]
pub trait AddressAllocator: Send + Sync {
    /// Leases addresses and routes for the workload identity.
    async fn allocate(&self, args: &CmdArgs, conf: &NetConf) -> AttachResult<AddressLease>;

    /// Releases the workload's lease.
    async fn release(&self, args: &CmdArgs, conf: &NetConf) -> AttachResult<()>;

    /// Verifies a lease exists for the workload identity.
    async fn check(&self, args: &CmdArgs, conf: &NetConf) -> AttachResult<()>;
}

/// Production allocator delegating to the configured IPAM plugin binary.
pub struct DelegateIpam {
    plugin_dirs: Vec<PathBuf>,
    timeout: Duration,
}

impl DelegateIpam {
    /// Creates a delegate searching the given plugin directories.
    pub fn new(plugin_dirs: Vec<PathBuf>) -> Self {
        Self {
            plugin_dirs,
            timeout: DELEGATE_TIMEOUT,
        }
    }

    /// Overrides the invocation timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn find_plugin(&self, name: &str) -> Option<PathBuf> {
        self.plugin_dirs
            .iter()
            .map(|dir| dir.join(name))
            .find(|candidate| candidate.is_file())
    }

    async fn invoke(
        &self,
        operation: &str,
        command: &str,
        args: &CmdArgs,
        conf: &NetConf,
    ) -> AttachResult<String> {
        let ipam = conf
            .ipam
            .as_ref()
            .ok_or_else(|| AttachError::ipam(operation, "no IPAM configuration present"))?;

        let plugin = self.find_plugin(&ipam.ipam_type).ok_or_else(|| {
            AttachError::ipam(
                operation,
                format!("delegate '{}' not found on plugin path", ipam.ipam_type),
            )
        })?;

        debug!(plugin = %plugin.display(), command, "Invoking IPAM delegate");

        let mut child = Command::new(&plugin)
            .env("CNI_COMMAND", command)
            .env("CNI_CONTAINERID", &args.container_id)
            .env("CNI_NETNS", &args.netns)
            .env("CNI_IFNAME", &args.ifname)
            .env("CNI_PATH", &args.path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                AttachError::ipam(operation, format!("spawn {}: {}", plugin.display(), e))
            })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| AttachError::ipam(operation, "delegate stdin unavailable"))?;
        stdin
            .write_all(&args.stdin_data)
            .await
            .map_err(|e| AttachError::ipam(operation, format!("write config: {}", e)))?;
        drop(stdin);

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                AttachError::ipam(
                    operation,
                    format!("delegate did not respond within {:?}", self.timeout),
                )
            })?
            .map_err(|e| AttachError::ipam(operation, e.to_string()))?;

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let detail = if stdout.is_empty() { stderr } else { stdout };
            return Err(AttachError::ipam(
                operation,
                format!(
                    "delegate exited with {}: {}",
                    output.status.code().unwrap_or(-1),
                    detail
                ),
            ));
        }

        Ok(stdout)
    }
}

#[async_trait]
impl AddressAllocator for DelegateIpam {
    async fn allocate(&self, args: &CmdArgs, conf: &NetConf) -> AttachResult<AddressLease> {
        let stdout = self.invoke("allocate", "ADD", args, conf).await?;

        let lease: AddressLease = serde_json::from_str(&stdout)
            .map_err(|e| AttachError::ipam("allocate", format!("decode lease: {}", e)))?;

        if lease.ips.is_empty() {
            return Err(AttachError::ipam(
                "allocate",
                "delegate returned no addresses",
            ));
        }

        info!(
            container_id = %args.container_id,
            addresses = lease.ips.len(),
            "Leased addresses for workload"
        );
        Ok(lease)
    }

    async fn release(&self, args: &CmdArgs, conf: &NetConf) -> AttachResult<()> {
        self.invoke("release", "DEL", args, conf).await?;
        info!(container_id = %args.container_id, "Released address lease");
        Ok(())
    }

    async fn check(&self, args: &CmdArgs, conf: &NetConf) -> AttachResult<()> {
        self.invoke("check", "CHECK", args, conf).await?;
        Ok(())
    }
}

/// Applies a lease on the workload interface inside its namespace.
pub async fn apply_lease(
    links: &dyn LinkTable,
    netns: &NetnsPath,
    ifname: &str,
    lease: &AddressLease,
) -> AttachResult<()> {
    for ip in &lease.ips {
        links
            .ns_add_address(netns.as_str(), ifname, &ip.address)
            .await?;
    }
    for route in &lease.routes {
        links
            .ns_add_route(netns.as_str(), &route.dst, route.gw.as_deref(), ifname)
            .await?;
    }
    Ok(())
}
