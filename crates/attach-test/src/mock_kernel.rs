//! In-memory kernel link table.
//!
//! Models the parts of kernel link state the engine touches: the host link
//! table, per-namespace link tables, and the per-uplink VLAN tag registry
//! that makes duplicate tag creation fail with "already exists" no matter
//! which namespace currently holds the device. All mutations happen under
//! one mutex, matching the atomicity of the kernel's own link table.

use async_trait::async_trait;
use attach_common::{AttachError, AttachResult};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use vlan_attach::link::{CreateOutcome, LinkInfo, LinkTable};

/// A mock link, host-side or inside a namespace.
#[derive(Debug, Clone)]
pub struct MockLink {
    /// Parent device, for VLAN sub-interfaces.
    pub parent: Option<String>,
    /// VLAN tag, for VLAN sub-interfaces.
    pub vlan_id: Option<u16>,
    /// Current MTU.
    pub mtu: u32,
    /// Administrative state.
    pub up: bool,
    /// Addresses in CIDR notation.
    pub addresses: Vec<String>,
    /// Routes, recorded as "dst via gw" / "dst dev <name>" strings.
    pub routes: Vec<String>,
}

impl MockLink {
    /// A plain (non-VLAN) link, e.g. an uplink.
    pub fn plain(mtu: u32, up: bool) -> Self {
        Self {
            parent: None,
            vlan_id: None,
            mtu,
            up,
            addresses: Vec::new(),
            routes: Vec::new(),
        }
    }

    /// A VLAN sub-interface.
    pub fn vlan(parent: &str, vlan_id: u16, mtu: u32) -> Self {
        Self {
            parent: Some(parent.to_string()),
            vlan_id: Some(vlan_id),
            mtu,
            up: false,
            addresses: Vec::new(),
            routes: Vec::new(),
        }
    }

    fn to_info(&self, name: &str) -> LinkInfo {
        LinkInfo {
            name: name.to_string(),
            parent: self.parent.clone(),
            vlan_id: self.vlan_id,
            mtu: self.mtu,
            up: self.up,
        }
    }
}

#[derive(Default)]
struct MockState {
    host: HashMap<String, MockLink>,
    namespaces: HashMap<String, HashMap<String, MockLink>>,
    ops: Vec<String>,
    fail_ops: HashSet<String>,
}

impl MockState {
    /// True if the (uplink, tag) pair is registered anywhere, host or
    /// namespace. This is what makes creation idempotent across moves.
    fn tag_in_use(&self, uplink: &str, vlan_id: u16) -> bool {
        let matches = |link: &MockLink| {
            link.parent.as_deref() == Some(uplink) && link.vlan_id == Some(vlan_id)
        };
        self.host.values().any(matches)
            || self
                .namespaces
                .values()
                .any(|ns| ns.values().any(matches))
    }
}

/// In-memory [`LinkTable`] with operation logging and failure injection.
#[derive(Default)]
pub struct MockLinkTable {
    state: Mutex<MockState>,
}

impl MockLinkTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a table with one uplink that is up.
    pub fn with_uplink(name: &str, mtu: u32) -> Self {
        let table = Self::new();
        table.add_host_link(name, MockLink::plain(mtu, true));
        table
    }

    /// Inserts a host-side link.
    pub fn add_host_link(&self, name: &str, link: MockLink) {
        self.state
            .lock()
            .unwrap()
            .host
            .insert(name.to_string(), link);
    }

    /// Inserts a link inside a namespace.
    pub fn add_ns_link(&self, netns: &str, name: &str, link: MockLink) {
        self.state
            .lock()
            .unwrap()
            .namespaces
            .entry(netns.to_string())
            .or_default()
            .insert(name.to_string(), link);
    }

    /// Makes the named operation fail from now on.
    pub fn fail_on(&self, op: &str) {
        self.state.lock().unwrap().fail_ops.insert(op.to_string());
    }

    /// Clears an injected failure.
    pub fn heal(&self, op: &str) {
        self.state.lock().unwrap().fail_ops.remove(op);
    }

    /// Returns the recorded operation log.
    pub fn ops(&self) -> Vec<String> {
        self.state.lock().unwrap().ops.clone()
    }

    /// Returns the names of host-side links.
    pub fn host_links(&self) -> Vec<String> {
        let mut names: Vec<_> = self.state.lock().unwrap().host.keys().cloned().collect();
        names.sort();
        names
    }

    /// Returns a host-side link.
    pub fn host_link(&self, name: &str) -> Option<MockLink> {
        self.state.lock().unwrap().host.get(name).cloned()
    }

    /// Returns the names of links inside a namespace.
    pub fn ns_links(&self, netns: &str) -> Vec<String> {
        let state = self.state.lock().unwrap();
        let mut names: Vec<_> = state
            .namespaces
            .get(netns)
            .map(|ns| ns.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Returns a link inside a namespace.
    pub fn ns_link(&self, netns: &str, name: &str) -> Option<MockLink> {
        self.state
            .lock()
            .unwrap()
            .namespaces
            .get(netns)
            .and_then(|ns| ns.get(name))
            .cloned()
    }

    fn record(state: &mut MockState, op: String) {
        state.ops.push(op);
    }

    fn injected(state: &MockState, op: &str, target: &str) -> AttachResult<()> {
        if !state.fail_ops.contains(op) {
            return Ok(());
        }
        Err(match op {
            "move_to_namespace" | "ns_rename" | "ns_set_up" | "ns_move_to_host"
            | "ns_link_info" | "ns_del_link" | "ns_addresses" => {
                AttachError::namespace(op, format!("injected failure on {}", target))
            }
            "ns_add_address" | "ns_add_route" => {
                AttachError::ipam(op, format!("injected failure on {}", target))
            }
            _ => AttachError::link_op(target, format!("injected failure on {}", op)),
        })
    }
}

#[async_trait]
impl LinkTable for MockLinkTable {
    async fn link_info(&self, name: &str) -> AttachResult<Option<LinkInfo>> {
        let state = self.state.lock().unwrap();
        Self::injected(&state, "link_info", name)?;
        Ok(state.host.get(name).map(|l| l.to_info(name)))
    }

    async fn create_vlan(
        &self,
        uplink: &str,
        name: &str,
        vlan_id: u16,
    ) -> AttachResult<CreateOutcome> {
        let mut state = self.state.lock().unwrap();
        Self::injected(&state, "create_vlan", name)?;
        Self::record(&mut state, format!("create_vlan {}", name));

        if state.host.contains_key(name) || state.tag_in_use(uplink, vlan_id) {
            return Ok(CreateOutcome::AlreadyExists);
        }

        let parent_mtu = state.host.get(uplink).map(|l| l.mtu).unwrap_or(1500);
        state.host.insert(
            name.to_string(),
            MockLink::vlan(uplink, vlan_id, parent_mtu),
        );
        Ok(CreateOutcome::Created)
    }

    async fn set_mtu(&self, name: &str, mtu: u32) -> AttachResult<()> {
        let mut state = self.state.lock().unwrap();
        Self::injected(&state, "set_mtu", name)?;
        Self::record(&mut state, format!("set_mtu {} {}", name, mtu));
        match state.host.get_mut(name) {
            Some(link) => {
                link.mtu = mtu;
                Ok(())
            }
            None => Err(AttachError::link_op(name, "does not exist")),
        }
    }

    async fn set_up(&self, name: &str) -> AttachResult<()> {
        let mut state = self.state.lock().unwrap();
        Self::injected(&state, "set_up", name)?;
        Self::record(&mut state, format!("set_up {}", name));
        match state.host.get_mut(name) {
            Some(link) => {
                link.up = true;
                Ok(())
            }
            None => Err(AttachError::link_op(name, "does not exist")),
        }
    }

    async fn rename(&self, from: &str, to: &str) -> AttachResult<()> {
        let mut state = self.state.lock().unwrap();
        Self::injected(&state, "rename", from)?;
        Self::record(&mut state, format!("rename {} {}", from, to));
        match state.host.remove(from) {
            Some(link) => {
                state.host.insert(to.to_string(), link);
                Ok(())
            }
            None => Err(AttachError::link_op(from, "does not exist")),
        }
    }

    async fn del_link(&self, name: &str) -> AttachResult<()> {
        let mut state = self.state.lock().unwrap();
        Self::injected(&state, "del_link", name)?;
        Self::record(&mut state, format!("del_link {}", name));
        state.host.remove(name);
        Ok(())
    }

    async fn move_to_namespace(&self, name: &str, netns: &str) -> AttachResult<()> {
        let mut state = self.state.lock().unwrap();
        Self::injected(&state, "move_to_namespace", name)?;
        Self::record(&mut state, format!("move_to_namespace {} {}", name, netns));
        match state.host.remove(name) {
            Some(link) => {
                state
                    .namespaces
                    .entry(netns.to_string())
                    .or_default()
                    .insert(name.to_string(), link);
                Ok(())
            }
            None => Err(AttachError::namespace(
                "move",
                format!("{} does not exist", name),
            )),
        }
    }

    async fn ns_link_info(&self, netns: &str, name: &str) -> AttachResult<Option<LinkInfo>> {
        let state = self.state.lock().unwrap();
        Self::injected(&state, "ns_link_info", name)?;
        Ok(state
            .namespaces
            .get(netns)
            .and_then(|ns| ns.get(name))
            .map(|l| l.to_info(name)))
    }

    async fn ns_rename(&self, netns: &str, from: &str, to: &str) -> AttachResult<()> {
        let mut state = self.state.lock().unwrap();
        Self::injected(&state, "ns_rename", from)?;
        Self::record(&mut state, format!("ns_rename {} {} {}", netns, from, to));
        let ns = state
            .namespaces
            .entry(netns.to_string())
            .or_default();
        match ns.remove(from) {
            Some(link) => {
                ns.insert(to.to_string(), link);
                Ok(())
            }
            None => Err(AttachError::namespace(
                "rename",
                format!("{} does not exist in {}", from, netns),
            )),
        }
    }

    async fn ns_set_up(&self, netns: &str, name: &str) -> AttachResult<()> {
        let mut state = self.state.lock().unwrap();
        Self::injected(&state, "ns_set_up", name)?;
        Self::record(&mut state, format!("ns_set_up {} {}", netns, name));
        match state
            .namespaces
            .get_mut(netns)
            .and_then(|ns| ns.get_mut(name))
        {
            Some(link) => {
                link.up = true;
                Ok(())
            }
            None => Err(AttachError::namespace(
                "bring-up",
                format!("{} does not exist in {}", name, netns),
            )),
        }
    }

    async fn ns_move_to_host(&self, netns: &str, name: &str) -> AttachResult<()> {
        let mut state = self.state.lock().unwrap();
        Self::injected(&state, "ns_move_to_host", name)?;
        Self::record(&mut state, format!("ns_move_to_host {} {}", netns, name));
        let removed = state
            .namespaces
            .get_mut(netns)
            .and_then(|ns| ns.remove(name));
        match removed {
            Some(link) => {
                state.host.insert(name.to_string(), link);
                Ok(())
            }
            None => Err(AttachError::namespace(
                "move-to-host",
                format!("{} does not exist in {}", name, netns),
            )),
        }
    }

    async fn ns_del_link(&self, netns: &str, name: &str) -> AttachResult<()> {
        let mut state = self.state.lock().unwrap();
        Self::injected(&state, "ns_del_link", name)?;
        Self::record(&mut state, format!("ns_del_link {} {}", netns, name));
        if let Some(ns) = state.namespaces.get_mut(netns) {
            ns.remove(name);
        }
        Ok(())
    }

    async fn ns_add_address(&self, netns: &str, name: &str, address: &str) -> AttachResult<()> {
        let mut state = self.state.lock().unwrap();
        Self::injected(&state, "ns_add_address", name)?;
        Self::record(
            &mut state,
            format!("ns_add_address {} {} {}", netns, name, address),
        );
        match state
            .namespaces
            .get_mut(netns)
            .and_then(|ns| ns.get_mut(name))
        {
            Some(link) => {
                link.addresses.push(address.to_string());
                Ok(())
            }
            None => Err(AttachError::ipam(
                "apply-address",
                format!("{} does not exist in {}", name, netns),
            )),
        }
    }

    async fn ns_add_route(
        &self,
        netns: &str,
        dst: &str,
        gw: Option<&str>,
        dev: &str,
    ) -> AttachResult<()> {
        let mut state = self.state.lock().unwrap();
        Self::injected(&state, "ns_add_route", dev)?;
        let route = match gw {
            Some(gw) => format!("{} via {}", dst, gw),
            None => format!("{} dev {}", dst, dev),
        };
        Self::record(&mut state, format!("ns_add_route {} {}", netns, route));
        match state
            .namespaces
            .get_mut(netns)
            .and_then(|ns| ns.get_mut(dev))
        {
            Some(link) => {
                link.routes.push(route);
                Ok(())
            }
            None => Err(AttachError::ipam(
                "apply-route",
                format!("{} does not exist in {}", dev, netns),
            )),
        }
    }

    async fn ns_addresses(&self, netns: &str, name: &str) -> AttachResult<Vec<String>> {
        let state = self.state.lock().unwrap();
        Self::injected(&state, "ns_addresses", name)?;
        Ok(state
            .namespaces
            .get(netns)
            .and_then(|ns| ns.get(name))
            .map(|l| l.addresses.clone())
            .unwrap_or_default())
    }
}
