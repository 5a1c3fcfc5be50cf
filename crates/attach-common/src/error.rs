//! Error types for attachment operations.
//!
//! This module defines the error taxonomy used throughout the attachment
//! engine. All errors implement `std::error::Error` via `thiserror` and map
//! to a machine-readable kind plus a numeric code for the structured error
//! document emitted on failure.

use std::io;
use thiserror::Error;

/// Result type alias for attachment operations.
pub type AttachResult<T> = Result<T, AttachError>;

/// Errors that can occur during attachment operations.
#[derive(Debug, Error)]
pub enum AttachError {
    /// Malformed or out-of-range attachment configuration.
    #[error("Invalid configuration for {field}: {message}")]
    InvalidConfig {
        /// The field that failed validation.
        field: String,
        /// Error message.
        message: String,
    },

    /// The policy authority denied the (tenant, vlan) pair.
    #[error("Authorization denied: {reason}")]
    PolicyDenied {
        /// The authority's stated reason.
        reason: String,
    },

    /// The policy authority could not be consulted. Treated as a deny.
    #[error("Authorization unavailable: {message}")]
    PolicyUnavailable {
        /// What went wrong while consulting the authority.
        message: String,
    },

    /// Uplink interface does not exist on the host.
    #[error("Uplink interface '{uplink}' not found")]
    UplinkNotFound {
        /// The uplink interface name.
        uplink: String,
    },

    /// Uplink interface exists but is administratively down.
    #[error("Uplink interface '{uplink}' is down")]
    UplinkDown {
        /// The uplink interface name.
        uplink: String,
    },

    /// A device with the deterministic VLAN name exists but does not carry
    /// the expected parent/tag.
    #[error("Tag collision on device '{device}': {message}")]
    TagCollision {
        /// The conflicting device name.
        device: String,
        /// Description of the mismatch.
        message: String,
    },

    /// A host-side link operation failed.
    #[error("Link operation failed on '{device}': {message}")]
    LinkOp {
        /// The device the operation targeted.
        device: String,
        /// Error message, usually the kernel's.
        message: String,
    },

    /// A namespace open/move/rename/bring-up step failed.
    #[error("Namespace operation failed: {operation}: {message}")]
    Namespace {
        /// The step that failed.
        operation: String,
        /// Error message.
        message: String,
    },

    /// The address-management collaborator failed.
    #[error("IPAM operation failed: {operation}: {message}")]
    Ipam {
        /// The operation that failed ("allocate", "release", "check").
        operation: String,
        /// Error message.
        message: String,
    },

    /// Failed to spawn a shell command.
    #[error("Failed to execute command '{command}': {source}")]
    ShellExec {
        /// The command that failed to execute.
        command: String,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },

    /// Internal error (unexpected state).
    #[error("Internal error: {message}")]
    Internal {
        /// Error message.
        message: String,
    },
}

impl AttachError {
    /// Creates an invalid configuration error.
    pub fn invalid_config(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Creates a policy denial error.
    pub fn policy_denied(reason: impl Into<String>) -> Self {
        Self::PolicyDenied {
            reason: reason.into(),
        }
    }

    /// Creates a policy-unreachable error.
    pub fn policy_unavailable(message: impl Into<String>) -> Self {
        Self::PolicyUnavailable {
            message: message.into(),
        }
    }

    /// Creates an uplink-not-found error.
    pub fn uplink_not_found(uplink: impl Into<String>) -> Self {
        Self::UplinkNotFound {
            uplink: uplink.into(),
        }
    }

    /// Creates an uplink-down error.
    pub fn uplink_down(uplink: impl Into<String>) -> Self {
        Self::UplinkDown {
            uplink: uplink.into(),
        }
    }

    /// Creates a tag collision error.
    pub fn tag_collision(device: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TagCollision {
            device: device.into(),
            message: message.into(),
        }
    }

    /// Creates a link operation error.
    pub fn link_op(device: impl Into<String>, message: impl Into<String>) -> Self {
        Self::LinkOp {
            device: device.into(),
            message: message.into(),
        }
    }

    /// Creates a namespace operation error.
    pub fn namespace(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Namespace {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Creates an IPAM operation error.
    pub fn ipam(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Ipam {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns the machine-readable error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            AttachError::InvalidConfig { .. } => "ConfigError",
            AttachError::PolicyDenied { .. } | AttachError::PolicyUnavailable { .. } => {
                "PolicyError"
            }
            AttachError::UplinkNotFound { .. }
            | AttachError::UplinkDown { .. }
            | AttachError::TagCollision { .. }
            | AttachError::LinkOp { .. } => "InterfaceError",
            AttachError::Namespace { .. } => "NamespaceError",
            AttachError::Ipam { .. } => "IPAMError",
            AttachError::ShellExec { .. } | AttachError::Internal { .. } => "InternalError",
        }
    }

    /// Returns the numeric code used in the error document and as the
    /// process exit status.
    pub fn code(&self) -> u32 {
        match self.kind() {
            "ConfigError" => 7,
            "PolicyError" => 8,
            "InterfaceError" => 9,
            "NamespaceError" => 10,
            "IPAMError" => 11,
            _ => 12,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = AttachError::uplink_not_found("eth0");
        assert_eq!(err.to_string(), "Uplink interface 'eth0' not found");
    }

    #[test]
    fn test_invalid_config() {
        let err = AttachError::invalid_config("vlan", "must be between 1 and 4094");
        assert_eq!(
            err.to_string(),
            "Invalid configuration for vlan: must be between 1 and 4094"
        );
        assert_eq!(err.kind(), "ConfigError");
        assert_eq!(err.code(), 7);
    }

    #[test]
    fn test_policy_kinds() {
        assert_eq!(AttachError::policy_denied("no label").kind(), "PolicyError");
        assert_eq!(
            AttachError::policy_unavailable("connection refused").kind(),
            "PolicyError"
        );
        assert_eq!(AttachError::policy_denied("no label").code(), 8);
    }

    #[test]
    fn test_interface_kinds() {
        assert_eq!(AttachError::uplink_down("eth0").kind(), "InterfaceError");
        assert_eq!(
            AttachError::tag_collision("eth0.100", "vlan id 200 != 100").kind(),
            "InterfaceError"
        );
        assert_eq!(AttachError::link_op("eth0.100", "EPERM").code(), 9);
    }

    #[test]
    fn test_namespace_and_ipam_codes() {
        assert_eq!(AttachError::namespace("move", "gone").code(), 10);
        assert_eq!(AttachError::ipam("allocate", "pool exhausted").code(), 11);
        assert_eq!(AttachError::internal("bug").code(), 12);
    }
}
