//! Attachment configuration parsing and validation.
//!
//! `NetConf` is the strongly-typed form of the declarative attachment
//! document read from stdin. Parsing validates everything that can be
//! checked without touching kernel state; uplink-relative constraints
//! (existence, admin state, MTU bound) belong to the link manager.

use attach_common::{AttachError, AttachResult};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;

use crate::types::Route;

/// Smallest MTU the kernel accepts for an IPv4-capable interface.
const MTU_FLOOR: u32 = 68;

/// Default policy authority socket path.
const DEFAULT_POLICY_SOCKET: &str = "/run/vlan-attach/policy.sock";

/// Default policy authority timeout in milliseconds.
const DEFAULT_POLICY_TIMEOUT_MS: u64 = 2000;

/// Network configuration for a VLAN attachment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetConf {
    /// Protocol version of the request.
    #[serde(rename = "cniVersion")]
    pub cni_version: String,
    /// Name of the network.
    pub name: String,
    /// Plugin type selector.
    #[serde(rename = "type")]
    pub plugin_type: String,
    /// Tenant identity the policy gate authorizes against.
    pub tenant: String,
    /// Uplink interface the tagged sub-interface is created on.
    pub master: String,
    /// VLAN tag (1-4094).
    pub vlan: u16,
    /// Interface MTU. Defaults to the uplink MTU when absent.
    pub mtu: Option<u32>,
    /// Address-management parameters. Attachments without addressing are
    /// legal; the workload gets a bare L2 interface.
    pub ipam: Option<IpamConf>,
    /// Policy authority channel parameters.
    #[serde(default)]
    pub policy: PolicyConf,
}

/// Address-management (IPAM) parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpamConf {
    /// Name of the address-management delegate.
    #[serde(rename = "type")]
    pub ipam_type: String,
    /// Subnet to allocate from.
    pub subnet: Option<IpNet>,
    /// Gateway inside the subnet.
    pub gateway: Option<IpAddr>,
    /// Additional routes to configure on the workload interface.
    pub routes: Option<Vec<Route>>,
}

/// Policy authority channel parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConf {
    /// Unix socket the authority listens on.
    #[serde(default = "default_policy_socket")]
    pub socket: PathBuf,
    /// Query timeout in milliseconds. Expiry is a deny.
    #[serde(default = "default_policy_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_policy_socket() -> PathBuf {
    PathBuf::from(DEFAULT_POLICY_SOCKET)
}

fn default_policy_timeout_ms() -> u64 {
    DEFAULT_POLICY_TIMEOUT_MS
}

impl Default for PolicyConf {
    fn default() -> Self {
        Self {
            socket: default_policy_socket(),
            timeout_ms: default_policy_timeout_ms(),
        }
    }
}

impl NetConf {
    /// Parses and validates an attachment document.
    pub fn parse(bytes: &[u8]) -> AttachResult<Self> {
        let conf: NetConf = serde_json::from_slice(bytes)
            .map_err(|e| AttachError::invalid_config("netconf", e.to_string()))?;

        if conf.vlan < 1 || conf.vlan > 4094 {
            return Err(AttachError::invalid_config(
                "vlan",
                format!("invalid VLAN ID {} (must be between 1 and 4094)", conf.vlan),
            ));
        }

        if conf.master.is_empty() {
            return Err(AttachError::invalid_config(
                "master",
                "uplink interface name is required",
            ));
        }

        if conf.tenant.is_empty() {
            return Err(AttachError::invalid_config(
                "tenant",
                "tenant identity is required",
            ));
        }

        if let Some(mtu) = conf.mtu {
            if mtu < MTU_FLOOR {
                return Err(AttachError::invalid_config(
                    "mtu",
                    format!("MTU {} is below the minimum of {}", mtu, MTU_FLOOR),
                ));
            }
        }

        if let Some(ipam) = &conf.ipam {
            if ipam.ipam_type.is_empty() {
                return Err(AttachError::invalid_config(
                    "ipam.type",
                    "address-management delegate name is required",
                ));
            }
            if let (Some(subnet), Some(gateway)) = (&ipam.subnet, &ipam.gateway) {
                if !subnet.contains(gateway) {
                    return Err(AttachError::invalid_config(
                        "ipam.gateway",
                        format!("gateway {} is outside subnet {}", gateway, subnet),
                    ));
                }
            }
        }

        Ok(conf)
    }

    /// Creates a minimal configuration, mainly for tests and fixtures.
    pub fn new_default(name: &str, tenant: &str, master: &str, vlan: u16) -> Self {
        Self {
            cni_version: crate::commands::PROTOCOL_VERSION.to_string(),
            name: name.to_string(),
            plugin_type: "vlan-attach".to_string(),
            tenant: tenant.to_string(),
            master: master.to_string(),
            vlan,
            mtu: None,
            ipam: None,
            policy: PolicyConf::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_json() -> String {
        r#"{
            "cniVersion": "1.0.0",
            "name": "tenant-net",
            "type": "vlan-attach",
            "tenant": "finance",
            "master": "eth0",
            "vlan": 100,
            "ipam": {
                "type": "host-local",
                "subnet": "10.100.0.0/24",
                "gateway": "10.100.0.1"
            }
        }"#
        .to_string()
    }

    #[test]
    fn test_parse_valid() {
        let conf = NetConf::parse(sample_json().as_bytes()).unwrap();
        assert_eq!(conf.tenant, "finance");
        assert_eq!(conf.master, "eth0");
        assert_eq!(conf.vlan, 100);
        assert_eq!(conf.policy.timeout_ms, 2000);

        let ipam = conf.ipam.unwrap();
        assert_eq!(ipam.ipam_type, "host-local");
        assert_eq!(ipam.subnet.unwrap().to_string(), "10.100.0.0/24");
    }

    #[test]
    fn test_parse_rejects_vlan_out_of_range() {
        for vlan in ["0", "4095"] {
            let json = sample_json().replace("\"vlan\": 100", &format!("\"vlan\": {}", vlan));
            let err = NetConf::parse(json.as_bytes()).unwrap_err();
            assert_eq!(err.kind(), "ConfigError");
        }
    }

    #[test]
    fn test_parse_accepts_vlan_bounds() {
        for vlan in ["1", "4094"] {
            let json = sample_json().replace("\"vlan\": 100", &format!("\"vlan\": {}", vlan));
            assert!(NetConf::parse(json.as_bytes()).is_ok());
        }
    }

    #[test]
    fn test_parse_rejects_empty_master() {
        let json = sample_json().replace("\"master\": \"eth0\"", "\"master\": \"\"");
        let err = NetConf::parse(json.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("uplink"));
    }

    #[test]
    fn test_parse_rejects_empty_tenant() {
        let json = sample_json().replace("\"tenant\": \"finance\"", "\"tenant\": \"\"");
        assert!(NetConf::parse(json.as_bytes()).is_err());
    }

    #[test]
    fn test_parse_rejects_gateway_outside_subnet() {
        let json = sample_json().replace("10.100.0.1", "10.200.0.1");
        let err = NetConf::parse(json.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("outside subnet"));
    }

    #[test]
    fn test_parse_rejects_bad_subnet() {
        let json = sample_json().replace("10.100.0.0/24", "not-a-subnet");
        let err = NetConf::parse(json.as_bytes()).unwrap_err();
        assert_eq!(err.kind(), "ConfigError");
    }

    #[test]
    fn test_parse_rejects_tiny_mtu() {
        let json = sample_json().replace("\"vlan\": 100", "\"vlan\": 100, \"mtu\": 42");
        let err = NetConf::parse(json.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("below the minimum"));
    }

    #[test]
    fn test_parse_garbage() {
        assert!(NetConf::parse(b"not json").is_err());
        assert!(NetConf::parse(b"{}").is_err());
    }

    #[test]
    fn test_policy_defaults() {
        let conf = NetConf::parse(sample_json().as_bytes()).unwrap();
        assert_eq!(
            conf.policy.socket,
            PathBuf::from("/run/vlan-attach/policy.sock")
        );
    }

    #[test]
    fn test_policy_partial_section_gets_defaults() {
        let json = sample_json().replace(
            "\"vlan\": 100",
            "\"vlan\": 100, \"policy\": {\"socket\": \"/run/custom/authority.sock\"}",
        );
        let conf = NetConf::parse(json.as_bytes()).unwrap();
        assert_eq!(
            conf.policy.socket,
            PathBuf::from("/run/custom/authority.sock")
        );
        assert_eq!(conf.policy.timeout_ms, 2000);
    }
}
