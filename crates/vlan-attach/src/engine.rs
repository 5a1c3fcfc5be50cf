//! Attachment orchestrator.
//!
//! Sequences policy authorization, link creation, namespace transfer and
//! address binding for ADD, and owns the only failure-recovery logic in the
//! engine: compensation is derived mechanically from the highest [`Stage`]
//! reached, running in strict reverse order of the completed stages. Once
//! kernel state mutation has begun, an operation runs to a terminal state;
//! cancellation is not honored mid-flight.

use attach_common::{AttachError, AttachResult};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::config::NetConf;
use crate::ipam::{apply_lease, AddressAllocator};
use crate::link::{ensure_vlan_link, vlan_link_name, LinkTable, VlanLink};
use crate::netns::{restore_to_host, transfer_to_namespace, NetnsPath};
use crate::policy::PolicyGate;
use crate::types::{AttachmentReply, CmdArgs, Interface, IpConfig};

/// Stages of an ADD, in completion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    /// Nothing done yet.
    Init,
    /// Policy gate allowed the attachment.
    Authorized,
    /// Host-side VLAN link exists, up, correct MTU.
    LinkReady,
    /// Link lives in the target namespace under the workload name.
    Transferred,
    /// Address lease allocated for the workload.
    Bound,
    /// Attachment finished.
    Complete,
}

/// Progress record for one ADD, consumed by [`AttachEngine::rollback`].
struct AddProgress {
    stage: Stage,
    link: Option<VlanLink>,
    netns: Option<NetnsPath>,
}

impl AddProgress {
    fn new() -> Self {
        Self {
            stage: Stage::Init,
            link: None,
            netns: None,
        }
    }
}

/// The attachment engine.
pub struct AttachEngine {
    links: Arc<dyn LinkTable>,
    policy: Arc<dyn PolicyGate>,
    ipam: Arc<dyn AddressAllocator>,
}

impl AttachEngine {
    /// Creates an engine over the given capability implementations.
    pub fn new(
        links: Arc<dyn LinkTable>,
        policy: Arc<dyn PolicyGate>,
        ipam: Arc<dyn AddressAllocator>,
    ) -> Self {
        Self {
            links,
            policy,
            ipam,
        }
    }

    /// Attaches the workload: authorize, create link, transfer, bind.
    ///
    /// On failure every completed stage is compensated before the error is
    /// surfaced; the caller is never told "failed" while host state remains
    /// partially mutated.
    #[instrument(skip(self, args, conf), fields(container_id = %args.container_id, tenant = %conf.tenant, vlan = conf.vlan))]
    pub async fn add(&self, args: &CmdArgs, conf: &NetConf) -> AttachResult<AttachmentReply> {
        let mut progress = AddProgress::new();
        match self.run_add(args, conf, &mut progress).await {
            Ok(reply) => {
                info!("Attachment complete");
                Ok(reply)
            }
            Err(err) => {
                warn!(stage = ?progress.stage, error = %err, "Attachment failed, compensating");
                self.rollback(&progress, args, conf).await;
                Err(err)
            }
        }
    }

    async fn run_add(
        &self,
        args: &CmdArgs,
        conf: &NetConf,
        progress: &mut AddProgress,
    ) -> AttachResult<AttachmentReply> {
        // Security boundary: no host mutation happens before an explicit
        // allow. Unreachable authority is a deny.
        self.policy
            .authorize(&conf.tenant, conf.vlan)
            .await
            .into_result()?;
        progress.stage = Stage::Authorized;

        let link = ensure_vlan_link(self.links.as_ref(), conf).await?;
        progress.link = Some(link.clone());
        progress.stage = Stage::LinkReady;

        let netns = NetnsPath::open(&args.netns).await?;
        progress.netns = Some(netns.clone());

        transfer_to_namespace(self.links.as_ref(), &link, &netns, &args.ifname).await?;
        progress.stage = Stage::Transferred;

        let mut reply = AttachmentReply::new(&conf.cni_version);
        reply.interfaces.push(Interface {
            name: args.ifname.clone(),
            sandbox: Some(args.netns.clone()),
        });

        if conf.ipam.is_some() {
            let lease = self.ipam.allocate(args, conf).await?;
            progress.stage = Stage::Bound;

            apply_lease(self.links.as_ref(), &netns, &args.ifname, &lease).await?;

            for ip in &lease.ips {
                reply.ips.push(IpConfig {
                    interface: Some(0),
                    address: ip.address.clone(),
                    gateway: ip.gateway.clone(),
                });
            }
            reply.routes = lease.routes.clone();
        }

        progress.stage = Stage::Complete;
        Ok(reply)
    }

    /// Compensates completed stages in reverse order.
    async fn rollback(&self, progress: &AddProgress, args: &CmdArgs, conf: &NetConf) {
        if progress.stage >= Stage::Bound {
            if let Err(err) = self.ipam.release(args, conf).await {
                warn!("Compensation: failed to release address lease: {}", err);
            }
        }

        if progress.stage >= Stage::Transferred {
            if let (Some(link), Some(netns)) = (&progress.link, &progress.netns) {
                restore_to_host(self.links.as_ref(), netns, &args.ifname, &link.name).await;
            }
        }

        if progress.stage == Stage::LinkReady {
            // A host-side link that never left is reusable on retry.
            debug!("Leaving VLAN link in place for retry");
        }
    }

    /// Detaches the workload.
    ///
    /// Teardown never consults the policy gate and never fails on "nothing
    /// to do": every sub-step treats absence as success so DEL stays
    /// retriable. Only a genuine address-release failure is surfaced.
    #[instrument(skip(self, args, conf), fields(container_id = %args.container_id, vlan = conf.vlan))]
    pub async fn del(&self, args: &CmdArgs, conf: &NetConf) -> AttachResult<()> {
        if conf.ipam.is_some() {
            self.ipam.release(args, conf).await?;
        }

        // The VLAN device dies with its namespace; if the namespace is
        // still around, delete the interface instead of waiting for that.
        if !args.netns.is_empty() {
            if let Ok(netns) = NetnsPath::open(&args.netns).await {
                if let Err(err) = self.links.ns_del_link(netns.as_str(), &args.ifname).await {
                    warn!(
                        "Failed to delete {} in {}: {}",
                        args.ifname, args.netns, err
                    );
                }
            }
        }

        self.reap_stranded_link(conf).await;
        Ok(())
    }

    /// Removes a host-resident VLAN link left behind by a crashed ADD for
    /// this request. At rest no VLAN link belongs on the host.
    async fn reap_stranded_link(&self, conf: &NetConf) {
        let host_name = vlan_link_name(&conf.master, conf.vlan);
        match self.links.link_info(&host_name).await {
            Ok(Some(info))
                if info.parent.as_deref() == Some(conf.master.as_str())
                    && info.vlan_id == Some(conf.vlan) =>
            {
                match self.links.del_link(&host_name).await {
                    Ok(()) => info!("Reaped stranded VLAN link {}", host_name),
                    Err(err) => warn!("Failed to reap stranded link {}: {}", host_name, err),
                }
            }
            Ok(_) => {}
            Err(err) => warn!("Could not inspect host link {}: {}", host_name, err),
        }
    }

    /// Verifies the attachment without mutating anything.
    ///
    /// Re-authorizes with ADD semantics, then checks that the workload
    /// interface exists in the namespace with the expected tag and MTU and
    /// that the address lease is in place.
    #[instrument(skip(self, args, conf), fields(container_id = %args.container_id, tenant = %conf.tenant, vlan = conf.vlan))]
    pub async fn check(&self, args: &CmdArgs, conf: &NetConf) -> AttachResult<AttachmentReply> {
        self.policy
            .authorize(&conf.tenant, conf.vlan)
            .await
            .into_result()?;

        let netns = NetnsPath::open(&args.netns).await?;

        let info = self
            .links
            .ns_link_info(netns.as_str(), &args.ifname)
            .await?
            .ok_or_else(|| {
                AttachError::namespace(
                    "check",
                    format!("interface {} not found in {}", args.ifname, args.netns),
                )
            })?;

        if info.vlan_id != Some(conf.vlan) {
            return Err(AttachError::tag_collision(
                &args.ifname,
                format!(
                    "interface carries VLAN {:?}, expected {}",
                    info.vlan_id, conf.vlan
                ),
            ));
        }

        if !info.up {
            return Err(AttachError::link_op(
                &args.ifname,
                "interface is administratively down",
            ));
        }

        // Expected MTU mirrors the ADD-time clamp against the uplink.
        let uplink = self
            .links
            .link_info(&conf.master)
            .await?
            .ok_or_else(|| AttachError::uplink_not_found(&conf.master))?;
        let expected_mtu = conf.mtu.map_or(uplink.mtu, |m| m.min(uplink.mtu));
        if info.mtu != expected_mtu {
            return Err(AttachError::link_op(
                &args.ifname,
                format!("interface MTU {} does not match expected {}", info.mtu, expected_mtu),
            ));
        }

        let mut reply = AttachmentReply::new(&conf.cni_version);
        reply.interfaces.push(Interface {
            name: args.ifname.clone(),
            sandbox: Some(args.netns.clone()),
        });

        if let Some(ipam) = &conf.ipam {
            let addrs = self.links.ns_addresses(netns.as_str(), &args.ifname).await?;
            if addrs.is_empty() {
                return Err(AttachError::ipam("check", "interface has no addresses"));
            }

            if let Some(subnet) = &ipam.subnet {
                let in_subnet = addrs.iter().any(|addr| {
                    addr.split('/')
                        .next()
                        .and_then(|ip| ip.parse::<std::net::IpAddr>().ok())
                        .is_some_and(|ip| subnet.contains(&ip))
                });
                if !in_subnet {
                    return Err(AttachError::ipam(
                        "check",
                        format!("no address on {} lies inside {}", args.ifname, subnet),
                    ));
                }
            }

            // Lease existence at the authority of record.
            self.ipam.check(args, conf).await?;

            for addr in addrs {
                reply.ips.push(IpConfig {
                    interface: Some(0),
                    address: addr,
                    gateway: ipam.gateway.map(|g| g.to_string()),
                });
            }
        }

        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_ordering() {
        assert!(Stage::Init < Stage::Authorized);
        assert!(Stage::Authorized < Stage::LinkReady);
        assert!(Stage::LinkReady < Stage::Transferred);
        assert!(Stage::Transferred < Stage::Bound);
        assert!(Stage::Bound < Stage::Complete);
    }
}
