//! Invocation arguments and the result/error documents.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Out-of-band invocation arguments, taken from the environment.
#[derive(Debug, Clone)]
pub struct CmdArgs {
    /// Workload identity, used as the address lease key.
    pub container_id: String,
    /// Target network namespace path. May be empty on DEL when the
    /// namespace is already gone.
    pub netns: String,
    /// Workload-visible interface name.
    pub ifname: String,
    /// Extra `K=V;K=V` arguments.
    pub args: HashMap<String, String>,
    /// Colon-separated plugin search path.
    pub path: String,
    /// Raw attachment configuration as read from stdin. Forwarded verbatim
    /// to the address-management delegate.
    pub stdin_data: Vec<u8>,
}

impl CmdArgs {
    /// Returns the plugin search path as individual directories.
    pub fn plugin_dirs(&self) -> Vec<PathBuf> {
        self.path
            .split(':')
            .filter(|p| !p.is_empty())
            .map(PathBuf::from)
            .collect()
    }
}

/// Result document printed on successful ADD/CHECK.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentReply {
    /// Protocol version echoed from the request.
    #[serde(rename = "cniVersion")]
    pub cni_version: String,
    /// Interfaces created or verified.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub interfaces: Vec<Interface>,
    /// Assigned addresses.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub ips: Vec<IpConfig>,
    /// Configured routes.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub routes: Vec<Route>,
}

impl AttachmentReply {
    /// Creates an empty reply for the given protocol version.
    pub fn new(cni_version: impl Into<String>) -> Self {
        Self {
            cni_version: cni_version.into(),
            interfaces: Vec::new(),
            ips: Vec::new(),
            routes: Vec::new(),
        }
    }

    /// Serializes the reply to pretty JSON.
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).expect("reply serialization cannot fail")
    }
}

/// An interface entry in the result document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interface {
    /// Interface name inside the sandbox.
    pub name: String,
    /// Sandbox (network namespace) path.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<String>,
}

/// An assigned address in the result document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpConfig {
    /// Index into `interfaces` this address is bound to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interface: Option<usize>,
    /// Address with prefix length.
    pub address: String,
    /// Gateway for this address.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
}

/// A route in the result document and in the attachment configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Route {
    /// Destination CIDR.
    pub dst: String,
    /// Gateway for this route; routes without one go out the device.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gw: Option<String>,
}

/// Structured error document printed on failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorReply {
    /// Protocol version.
    #[serde(rename = "cniVersion")]
    pub cni_version: String,
    /// Numeric error code.
    pub code: u32,
    /// Machine-readable error kind.
    pub msg: String,
    /// Human-readable reason.
    pub details: String,
}

impl ErrorReply {
    /// Builds the error document from an attachment error.
    pub fn from_error(err: &attach_common::AttachError) -> Self {
        Self {
            cni_version: crate::commands::PROTOCOL_VERSION.to_string(),
            code: err.code(),
            msg: err.kind().to_string(),
            details: err.to_string(),
        }
    }

    /// Serializes the error document to JSON.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("error serialization cannot fail")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plugin_dirs() {
        let args = CmdArgs {
            container_id: "c1".to_string(),
            netns: "/var/run/netns/c1".to_string(),
            ifname: "eth0".to_string(),
            args: HashMap::new(),
            path: "/opt/cni/bin:/usr/lib/cni".to_string(),
            stdin_data: Vec::new(),
        };
        assert_eq!(
            args.plugin_dirs(),
            vec![PathBuf::from("/opt/cni/bin"), PathBuf::from("/usr/lib/cni")]
        );
    }

    #[test]
    fn test_reply_serialization_skips_empty() {
        let reply = AttachmentReply::new("1.0.0");
        let json = reply.to_json();
        assert!(json.contains("cniVersion"));
        assert!(!json.contains("interfaces"));
        assert!(!json.contains("ips"));
    }

    #[test]
    fn test_reply_roundtrip() {
        let mut reply = AttachmentReply::new("1.0.0");
        reply.interfaces.push(Interface {
            name: "eth0".to_string(),
            sandbox: Some("/var/run/netns/c1".to_string()),
        });
        reply.ips.push(IpConfig {
            interface: Some(0),
            address: "10.100.0.5/24".to_string(),
            gateway: Some("10.100.0.1".to_string()),
        });

        let parsed: AttachmentReply = serde_json::from_str(&reply.to_json()).unwrap();
        assert_eq!(parsed.interfaces.len(), 1);
        assert_eq!(parsed.ips[0].address, "10.100.0.5/24");
    }

    #[test]
    fn test_error_reply() {
        let err = attach_common::AttachError::policy_denied("tenant finance lacks vlan 100");
        let reply = ErrorReply::from_error(&err);
        assert_eq!(reply.code, 8);
        assert_eq!(reply.msg, "PolicyError");
        assert!(reply.details.contains("finance"));
    }
}
