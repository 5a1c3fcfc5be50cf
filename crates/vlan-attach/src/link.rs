//! Host-side VLAN link management.
//!
//! The kernel is driven through the narrow [`LinkTable`] capability trait so
//! the engine can be exercised without real network privileges. The
//! production implementation shells out to `ip(8)`/`nsenter(1)`; tests use
//! an in-memory table.
//!
//! Creation is idempotent by design: the kernel's own link-table atomicity
//! decides races, and the loser re-derives state through the lookup path
//! instead of failing. No lock is taken.

use async_trait::async_trait;
use attach_common::shell::{self, IP_CMD, NSENTER_CMD};
use attach_common::{AttachError, AttachResult};
use tracing::{debug, info, warn};

use crate::config::NetConf;

/// Derives the deterministic device name for an (uplink, tag) pair.
///
/// Uniqueness of this name per host is what keeps one tag on one device.
pub fn vlan_link_name(uplink: &str, vlan_id: u16) -> String {
    format!("{}.{}", uplink, vlan_id)
}

/// A host-kernel VLAN device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VlanLink {
    /// Device name, `<uplink>.<tag>`.
    pub name: String,
    /// Parent uplink name.
    pub uplink: String,
    /// VLAN tag.
    pub vlan_id: u16,
    /// Effective MTU after clamping to the uplink.
    pub mtu: u32,
}

/// Attributes of an existing link, host-side or inside a namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkInfo {
    /// Device name.
    pub name: String,
    /// Parent device, for VLAN sub-interfaces.
    pub parent: Option<String>,
    /// VLAN tag, when the device is a VLAN sub-interface.
    pub vlan_id: Option<u16>,
    /// Current MTU.
    pub mtu: u32,
    /// Administrative state.
    pub up: bool,
}

/// Outcome of a VLAN link creation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    /// The device was created by this invocation.
    Created,
    /// The kernel reported the device (or the tag on this uplink) as
    /// already existing.
    AlreadyExists,
}

/// Narrow capability trait over kernel link state.
///
/// `netns` parameters are namespace paths as handed over by the runtime.
#[async_trait]
pub trait LinkTable: Send + Sync {
    /// Looks up a host-side link. `Ok(None)` means the device does not
    /// exist.
    async fn link_info(&self, name: &str) -> AttachResult<Option<LinkInfo>>;

    /// Attempts to create a VLAN sub-interface on the uplink.
    async fn create_vlan(
        &self,
        uplink: &str,
        name: &str,
        vlan_id: u16,
    ) -> AttachResult<CreateOutcome>;

    /// Sets a host-side link's MTU.
    async fn set_mtu(&self, name: &str, mtu: u32) -> AttachResult<()>;

    /// Brings a host-side link administratively up.
    async fn set_up(&self, name: &str) -> AttachResult<()>;

    /// Renames a host-side link.
    async fn rename(&self, from: &str, to: &str) -> AttachResult<()>;

    /// Deletes a host-side link.
    async fn del_link(&self, name: &str) -> AttachResult<()>;

    /// Moves a host-side link into the target namespace.
    async fn move_to_namespace(&self, name: &str, netns: &str) -> AttachResult<()>;

    /// Looks up a link inside a namespace. `Ok(None)` means the device does
    /// not exist there.
    async fn ns_link_info(&self, netns: &str, name: &str) -> AttachResult<Option<LinkInfo>>;

    /// Renames a link inside a namespace.
    async fn ns_rename(&self, netns: &str, from: &str, to: &str) -> AttachResult<()>;

    /// Brings a link up inside a namespace.
    async fn ns_set_up(&self, netns: &str, name: &str) -> AttachResult<()>;

    /// Moves a link from a namespace back to the host namespace.
    async fn ns_move_to_host(&self, netns: &str, name: &str) -> AttachResult<()>;

    /// Deletes a link inside a namespace.
    async fn ns_del_link(&self, netns: &str, name: &str) -> AttachResult<()>;

    /// Adds an address (CIDR notation) to a link inside a namespace.
    async fn ns_add_address(&self, netns: &str, name: &str, address: &str) -> AttachResult<()>;

    /// Adds a route inside a namespace.
    async fn ns_add_route(
        &self,
        netns: &str,
        dst: &str,
        gw: Option<&str>,
        dev: &str,
    ) -> AttachResult<()>;

    /// Lists the addresses (CIDR notation) on a link inside a namespace.
    async fn ns_addresses(&self, netns: &str, name: &str) -> AttachResult<Vec<String>>;
}

/// Creates or rediscovers the VLAN sub-interface for the request.
///
/// Safe to call concurrently for the same (uplink, tag) pair from
/// independent invocations: exactly one caller creates the device, the
/// other verifies it through the lookup path.
pub async fn ensure_vlan_link(links: &dyn LinkTable, conf: &NetConf) -> AttachResult<VlanLink> {
    let uplink = links
        .link_info(&conf.master)
        .await?
        .ok_or_else(|| AttachError::uplink_not_found(&conf.master))?;

    if !uplink.up {
        return Err(AttachError::uplink_down(&conf.master));
    }

    let name = vlan_link_name(&conf.master, conf.vlan);

    // Sub-interface MTU cannot exceed the uplink MTU.
    let mtu = match conf.mtu {
        Some(requested) if requested > uplink.mtu => {
            warn!(
                "Requested MTU {} exceeds uplink {} MTU {}, using uplink MTU",
                requested, conf.master, uplink.mtu
            );
            uplink.mtu
        }
        Some(requested) => requested,
        None => uplink.mtu,
    };

    match links.create_vlan(&conf.master, &name, conf.vlan).await? {
        CreateOutcome::Created => {
            info!("Created VLAN link {} on {}", name, conf.master);
        }
        CreateOutcome::AlreadyExists => match links.link_info(&name).await? {
            Some(existing) => {
                if existing.parent.as_deref() != Some(conf.master.as_str())
                    || existing.vlan_id != Some(conf.vlan)
                {
                    return Err(AttachError::tag_collision(
                        &name,
                        format!(
                            "existing device has parent {:?} vlan {:?}, expected parent {} vlan {}",
                            existing.parent, existing.vlan_id, conf.master, conf.vlan
                        ),
                    ));
                }
                // Leftover from a crashed run or a benign creation race.
                info!("Reusing existing VLAN link {}", name);
            }
            None => {
                // The tag is registered on the uplink but the device is not
                // visible on the host: it already belongs to some namespace.
                return Err(AttachError::tag_collision(
                    &name,
                    format!(
                        "VLAN {} on {} is in use but the device is not present on the host",
                        conf.vlan, conf.master
                    ),
                ));
            }
        },
    }

    links.set_mtu(&name, mtu).await?;
    links.set_up(&name).await?;

    Ok(VlanLink {
        name,
        uplink: conf.master.clone(),
        vlan_id: conf.vlan,
        mtu,
    })
}

/// Production [`LinkTable`] driving the kernel through `ip(8)`.
pub struct HostLinkTable;

impl HostLinkTable {
    fn missing_device(result: &shell::ExecResult) -> bool {
        let text = result.combined_output();
        text.contains("does not exist") || text.contains("Cannot find device")
    }

    fn already_exists(result: &shell::ExecResult) -> bool {
        result.combined_output().contains("File exists")
    }
}

#[async_trait]
impl LinkTable for HostLinkTable {
    async fn link_info(&self, name: &str) -> AttachResult<Option<LinkInfo>> {
        let cmd = format!(
            "{} -d -j link show dev {}",
            IP_CMD,
            shell::shellquote(name)
        );
        let result = shell::exec(&cmd).await?;
        if !result.success() {
            if Self::missing_device(&result) {
                return Ok(None);
            }
            return Err(AttachError::link_op(name, result.combined_output()));
        }
        Ok(parse_link_json(&result.stdout))
    }

    async fn create_vlan(
        &self,
        uplink: &str,
        name: &str,
        vlan_id: u16,
    ) -> AttachResult<CreateOutcome> {
        let cmd = format!(
            "{} link add link {} name {} type vlan id {}",
            IP_CMD,
            shell::shellquote(uplink),
            shell::shellquote(name),
            vlan_id
        );
        let result = shell::exec(&cmd).await?;
        if result.success() {
            Ok(CreateOutcome::Created)
        } else if Self::already_exists(&result) {
            debug!("VLAN link {} already exists", name);
            Ok(CreateOutcome::AlreadyExists)
        } else {
            Err(AttachError::link_op(name, result.combined_output()))
        }
    }

    async fn set_mtu(&self, name: &str, mtu: u32) -> AttachResult<()> {
        let cmd = format!(
            "{} link set dev {} mtu {}",
            IP_CMD,
            shell::shellquote(name),
            mtu
        );
        let result = shell::exec(&cmd).await?;
        if !result.success() {
            return Err(AttachError::link_op(name, result.combined_output()));
        }
        Ok(())
    }

    async fn set_up(&self, name: &str) -> AttachResult<()> {
        let cmd = format!("{} link set dev {} up", IP_CMD, shell::shellquote(name));
        let result = shell::exec(&cmd).await?;
        if !result.success() {
            return Err(AttachError::link_op(name, result.combined_output()));
        }
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> AttachResult<()> {
        let cmd = format!(
            "{} link set dev {} name {}",
            IP_CMD,
            shell::shellquote(from),
            shell::shellquote(to)
        );
        let result = shell::exec(&cmd).await?;
        if !result.success() {
            return Err(AttachError::link_op(from, result.combined_output()));
        }
        Ok(())
    }

    async fn del_link(&self, name: &str) -> AttachResult<()> {
        let cmd = format!("{} link del dev {}", IP_CMD, shell::shellquote(name));
        let result = shell::exec(&cmd).await?;
        if !result.success() && !Self::missing_device(&result) {
            return Err(AttachError::link_op(name, result.combined_output()));
        }
        Ok(())
    }

    async fn move_to_namespace(&self, name: &str, netns: &str) -> AttachResult<()> {
        let cmd = format!(
            "{} link set dev {} netns {}",
            IP_CMD,
            shell::shellquote(name),
            shell::shellquote(netns)
        );
        let result = shell::exec(&cmd).await?;
        if !result.success() {
            return Err(AttachError::namespace("move", result.combined_output()));
        }
        Ok(())
    }

    async fn ns_link_info(&self, netns: &str, name: &str) -> AttachResult<Option<LinkInfo>> {
        let cmd = format!(
            "{} --net={} {} -d -j link show dev {}",
            NSENTER_CMD,
            shell::shellquote(netns),
            IP_CMD,
            shell::shellquote(name)
        );
        let result = shell::exec(&cmd).await?;
        if !result.success() {
            if Self::missing_device(&result) {
                return Ok(None);
            }
            return Err(AttachError::namespace("lookup", result.combined_output()));
        }
        Ok(parse_link_json(&result.stdout))
    }

    async fn ns_rename(&self, netns: &str, from: &str, to: &str) -> AttachResult<()> {
        let cmd = format!(
            "{} --net={} {} link set dev {} name {}",
            NSENTER_CMD,
            shell::shellquote(netns),
            IP_CMD,
            shell::shellquote(from),
            shell::shellquote(to)
        );
        let result = shell::exec(&cmd).await?;
        if !result.success() {
            return Err(AttachError::namespace("rename", result.combined_output()));
        }
        Ok(())
    }

    async fn ns_set_up(&self, netns: &str, name: &str) -> AttachResult<()> {
        let cmd = format!(
            "{} --net={} {} link set dev {} up",
            NSENTER_CMD,
            shell::shellquote(netns),
            IP_CMD,
            shell::shellquote(name)
        );
        let result = shell::exec(&cmd).await?;
        if !result.success() {
            return Err(AttachError::namespace("bring-up", result.combined_output()));
        }
        Ok(())
    }

    async fn ns_move_to_host(&self, netns: &str, name: &str) -> AttachResult<()> {
        // PID 1 anchors the host network namespace.
        let cmd = format!(
            "{} --net={} {} link set dev {} netns 1",
            NSENTER_CMD,
            shell::shellquote(netns),
            IP_CMD,
            shell::shellquote(name)
        );
        let result = shell::exec(&cmd).await?;
        if !result.success() {
            return Err(AttachError::namespace(
                "move-to-host",
                result.combined_output(),
            ));
        }
        Ok(())
    }

    async fn ns_del_link(&self, netns: &str, name: &str) -> AttachResult<()> {
        let cmd = format!(
            "{} --net={} {} link del dev {}",
            NSENTER_CMD,
            shell::shellquote(netns),
            IP_CMD,
            shell::shellquote(name)
        );
        let result = shell::exec(&cmd).await?;
        if !result.success() && !Self::missing_device(&result) {
            return Err(AttachError::namespace("delete", result.combined_output()));
        }
        Ok(())
    }

    async fn ns_add_address(&self, netns: &str, name: &str, address: &str) -> AttachResult<()> {
        let cmd = format!(
            "{} --net={} {} address add {} dev {}",
            NSENTER_CMD,
            shell::shellquote(netns),
            IP_CMD,
            shell::shellquote(address),
            shell::shellquote(name)
        );
        let result = shell::exec(&cmd).await?;
        if !result.success() {
            return Err(AttachError::ipam("apply-address", result.combined_output()));
        }
        Ok(())
    }

    async fn ns_add_route(
        &self,
        netns: &str,
        dst: &str,
        gw: Option<&str>,
        dev: &str,
    ) -> AttachResult<()> {
        let cmd = match gw {
            Some(gw) => format!(
                "{} --net={} {} route add {} via {}",
                NSENTER_CMD,
                shell::shellquote(netns),
                IP_CMD,
                shell::shellquote(dst),
                shell::shellquote(gw)
            ),
            None => format!(
                "{} --net={} {} route add {} dev {}",
                NSENTER_CMD,
                shell::shellquote(netns),
                IP_CMD,
                shell::shellquote(dst),
                shell::shellquote(dev)
            ),
        };
        let result = shell::exec(&cmd).await?;
        if !result.success() {
            return Err(AttachError::ipam("apply-route", result.combined_output()));
        }
        Ok(())
    }

    async fn ns_addresses(&self, netns: &str, name: &str) -> AttachResult<Vec<String>> {
        let cmd = format!(
            "{} --net={} {} -j addr show dev {}",
            NSENTER_CMD,
            shell::shellquote(netns),
            IP_CMD,
            shell::shellquote(name)
        );
        let result = shell::exec(&cmd).await?;
        if !result.success() {
            if Self::missing_device(&result) {
                return Ok(Vec::new());
            }
            return Err(AttachError::namespace(
                "address-list",
                result.combined_output(),
            ));
        }
        Ok(parse_address_json(&result.stdout))
    }
}

/// Parses a single-device `ip -d -j link show` document.
fn parse_link_json(raw: &str) -> Option<LinkInfo> {
    let list: serde_json::Value = serde_json::from_str(raw).ok()?;
    let obj = list.as_array()?.first()?;

    let name = obj.get("ifname")?.as_str()?.to_string();
    let mtu = obj.get("mtu").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
    let up = obj
        .get("flags")
        .and_then(|v| v.as_array())
        .map(|flags| flags.iter().any(|f| f.as_str() == Some("UP")))
        .unwrap_or(false);
    let parent = obj.get("link").and_then(|v| v.as_str()).map(String::from);

    let is_vlan = obj.pointer("/linkinfo/info_kind").and_then(|v| v.as_str()) == Some("vlan");
    let vlan_id = if is_vlan {
        obj.pointer("/linkinfo/info_data/id")
            .and_then(|v| v.as_u64())
            .map(|v| v as u16)
    } else {
        None
    };

    Some(LinkInfo {
        name,
        parent,
        vlan_id,
        mtu,
        up,
    })
}

/// Parses `ip -j addr show` output into `addr/prefix` strings.
fn parse_address_json(raw: &str) -> Vec<String> {
    let Ok(list) = serde_json::from_str::<serde_json::Value>(raw) else {
        return Vec::new();
    };
    let Some(devices) = list.as_array() else {
        return Vec::new();
    };

    let mut out = Vec::new();
    for dev in devices {
        let Some(addr_info) = dev.get("addr_info").and_then(|v| v.as_array()) else {
            continue;
        };
        for addr in addr_info {
            if let (Some(local), Some(prefix)) = (
                addr.get("local").and_then(|v| v.as_str()),
                addr.get("prefixlen").and_then(|v| v.as_u64()),
            ) {
                out.push(format!("{}/{}", local, prefix));
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const VLAN_LINK_JSON: &str = r#"[{
        "ifindex": 5,
        "link": "eth0",
        "ifname": "eth0.100",
        "flags": ["BROADCAST", "MULTICAST", "UP", "LOWER_UP"],
        "mtu": 1500,
        "operstate": "UP",
        "linkinfo": {
            "info_kind": "vlan",
            "info_data": {"protocol": "802.1Q", "id": 100}
        }
    }]"#;

    const PLAIN_LINK_JSON: &str = r#"[{
        "ifindex": 2,
        "ifname": "eth0",
        "flags": ["BROADCAST", "MULTICAST"],
        "mtu": 9100,
        "operstate": "DOWN"
    }]"#;

    #[test]
    fn test_vlan_link_name() {
        assert_eq!(vlan_link_name("eth0", 100), "eth0.100");
        assert_eq!(vlan_link_name("bond0", 4094), "bond0.4094");
    }

    #[test]
    fn test_parse_vlan_link() {
        let info = parse_link_json(VLAN_LINK_JSON).unwrap();
        assert_eq!(info.name, "eth0.100");
        assert_eq!(info.parent.as_deref(), Some("eth0"));
        assert_eq!(info.vlan_id, Some(100));
        assert_eq!(info.mtu, 1500);
        assert!(info.up);
    }

    #[test]
    fn test_parse_plain_link() {
        let info = parse_link_json(PLAIN_LINK_JSON).unwrap();
        assert_eq!(info.name, "eth0");
        assert_eq!(info.parent, None);
        assert_eq!(info.vlan_id, None);
        assert!(!info.up);
    }

    #[test]
    fn test_parse_garbage() {
        assert!(parse_link_json("").is_none());
        assert!(parse_link_json("[]").is_none());
        assert!(parse_link_json("{\"ifname\": \"x\"}").is_none());
    }

    #[test]
    fn test_parse_addresses() {
        let raw = r#"[{
            "ifname": "eth0",
            "addr_info": [
                {"family": "inet", "local": "10.100.0.5", "prefixlen": 24},
                {"family": "inet6", "local": "fe80::1", "prefixlen": 64}
            ]
        }]"#;
        let addrs = parse_address_json(raw);
        assert_eq!(addrs, vec!["10.100.0.5/24", "fe80::1/64"]);
    }

    #[test]
    fn test_parse_addresses_empty() {
        assert!(parse_address_json("[]").is_empty());
        assert!(parse_address_json("garbage").is_empty());
    }
}
