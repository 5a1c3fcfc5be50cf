//! Attachment fixtures for engine tests.

use std::collections::HashMap;
use tempfile::NamedTempFile;

use vlan_attach::config::NetConf;
use vlan_attach::types::CmdArgs;

/// Builds a validated configuration without addressing.
pub fn conf(tenant: &str, master: &str, vlan: u16) -> NetConf {
    let json = format!(
        r#"{{
            "cniVersion": "1.0.0",
            "name": "test-net",
            "type": "vlan-attach",
            "tenant": "{}",
            "master": "{}",
            "vlan": {}
        }}"#,
        tenant, master, vlan
    );
    NetConf::parse(json.as_bytes()).expect("fixture configuration must parse")
}

/// Builds a validated configuration with host-local style addressing.
pub fn conf_with_ipam(tenant: &str, master: &str, vlan: u16, subnet: &str) -> NetConf {
    let json = format!(
        r#"{{
            "cniVersion": "1.0.0",
            "name": "test-net",
            "type": "vlan-attach",
            "tenant": "{}",
            "master": "{}",
            "vlan": {},
            "ipam": {{"type": "host-local", "subnet": "{}"}}
        }}"#,
        tenant, master, vlan, subnet
    );
    NetConf::parse(json.as_bytes()).expect("fixture configuration must parse")
}

/// Builds invocation arguments for a workload.
pub fn cmd_args(container_id: &str, netns: &str, ifname: &str) -> CmdArgs {
    CmdArgs {
        container_id: container_id.to_string(),
        netns: netns.to_string(),
        ifname: ifname.to_string(),
        args: HashMap::new(),
        path: String::new(),
        stdin_data: b"{}".to_vec(),
    }
}

/// A stand-in namespace handle: a real file on disk, so path validation
/// passes without network privileges.
pub struct FakeNetns {
    file: NamedTempFile,
}

impl FakeNetns {
    /// Creates the stand-in namespace.
    pub fn new() -> Self {
        Self {
            file: NamedTempFile::new().expect("could not create fake namespace file"),
        }
    }

    /// Returns the namespace path.
    pub fn path(&self) -> &str {
        self.file.path().to_str().expect("temp path is valid UTF-8")
    }
}

impl Default for FakeNetns {
    fn default() -> Self {
        Self::new()
    }
}
