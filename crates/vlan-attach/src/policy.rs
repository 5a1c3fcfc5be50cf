//! Tenant policy gate.
//!
//! Every ADD (and CHECK) consults an external policy authority for an
//! allow/deny decision on the (tenant, vlan) pair before any host mutation.
//! Decisions are never cached. The gate fails closed: an unreachable,
//! stalled, or garbled authority is a deny. DEL never consults the gate so
//! teardown can always proceed.

use async_trait::async_trait;
use attach_common::{AttachError, AttachResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tracing::{debug, warn};

use crate::config::PolicyConf;

/// Outcome of a policy query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    /// The authority allows the attachment.
    Allow,
    /// The authority explicitly denies the attachment.
    Deny {
        /// The authority's stated reason.
        reason: String,
    },
    /// The authority could not be consulted.
    Unreachable {
        /// What went wrong.
        message: String,
    },
}

impl PolicyDecision {
    /// Maps the decision to the engine's fail-closed result: anything but
    /// an explicit allow is an error of kind `PolicyError`.
    pub fn into_result(self) -> AttachResult<()> {
        match self {
            PolicyDecision::Allow => Ok(()),
            PolicyDecision::Deny { reason } => Err(AttachError::policy_denied(reason)),
            PolicyDecision::Unreachable { message } => {
                Err(AttachError::policy_unavailable(message))
            }
        }
    }
}

/// Capability trait for the policy authority channel.
#[async_trait]
pub trait PolicyGate: Send + Sync {
    /// Queries the authority for the (tenant, vlan) pair.
    async fn authorize(&self, tenant: &str, vlan_id: u16) -> PolicyDecision;
}

#[derive(Serialize)]
struct PolicyRequest<'a> {
    tenant: &'a str,
    vlan_tag: u16,
}

#[derive(Deserialize)]
struct PolicyResponse {
    allow: bool,
    #[serde(default)]
    reason: String,
}

/// Policy gate speaking one JSON request/response over a Unix socket.
pub struct SocketPolicyGate {
    socket_path: PathBuf,
    timeout: Duration,
}

impl SocketPolicyGate {
    /// Creates a gate for the configured authority channel.
    pub fn new(conf: &PolicyConf) -> Self {
        Self {
            socket_path: conf.socket.clone(),
            timeout: Duration::from_millis(conf.timeout_ms),
        }
    }

    async fn query(&self, tenant: &str, vlan_id: u16) -> Result<PolicyResponse, String> {
        let mut stream = UnixStream::connect(&self.socket_path)
            .await
            .map_err(|e| format!("connect {}: {}", self.socket_path.display(), e))?;

        let request = serde_json::to_vec(&PolicyRequest {
            tenant,
            vlan_tag: vlan_id,
        })
        .map_err(|e| format!("encode request: {}", e))?;

        stream
            .write_all(&request)
            .await
            .map_err(|e| format!("send request: {}", e))?;
        stream
            .shutdown()
            .await
            .map_err(|e| format!("send request: {}", e))?;

        let mut raw = Vec::new();
        stream
            .read_to_end(&mut raw)
            .await
            .map_err(|e| format!("read response: {}", e))?;

        serde_json::from_slice(&raw).map_err(|e| format!("decode response: {}", e))
    }
}

#[async_trait]
impl PolicyGate for SocketPolicyGate {
    async fn authorize(&self, tenant: &str, vlan_id: u16) -> PolicyDecision {
        debug!(tenant, vlan_id, "Querying policy authority");

        let response = match tokio::time::timeout(self.timeout, self.query(tenant, vlan_id)).await
        {
            Ok(Ok(response)) => response,
            Ok(Err(message)) => {
                warn!(tenant, vlan_id, %message, "Policy authority unreachable");
                return PolicyDecision::Unreachable { message };
            }
            Err(_) => {
                warn!(tenant, vlan_id, "Policy authority timed out");
                return PolicyDecision::Unreachable {
                    message: format!("no response within {:?}", self.timeout),
                };
            }
        };

        if response.allow {
            debug!(tenant, vlan_id, "Policy authority allowed attachment");
            PolicyDecision::Allow
        } else {
            let reason = if response.reason.is_empty() {
                format!("tenant '{}' not authorized for VLAN {}", tenant, vlan_id)
            } else {
                response.reason
            };
            PolicyDecision::Deny { reason }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UnixListener;

    fn gate_for(path: &std::path::Path, timeout_ms: u64) -> SocketPolicyGate {
        SocketPolicyGate::new(&PolicyConf {
            socket: path.to_path_buf(),
            timeout_ms,
        })
    }

    async fn serve_one(listener: UnixListener, response: &'static str) {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.unwrap();
        let request: serde_json::Value = serde_json::from_slice(&buf).unwrap();
        assert!(request.get("tenant").is_some());
        assert!(request.get("vlan_tag").is_some());
        stream.write_all(response.as_bytes()).await.unwrap();
    }

    #[tokio::test]
    async fn test_allow() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let server = tokio::spawn(serve_one(listener, r#"{"allow": true, "reason": ""}"#));

        let gate = gate_for(&path, 2000);
        assert_eq!(gate.authorize("finance", 100).await, PolicyDecision::Allow);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_deny_with_reason() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let server = tokio::spawn(serve_one(
            listener,
            r#"{"allow": false, "reason": "vlan 100 reserved"}"#,
        ));

        let gate = gate_for(&path, 2000);
        let decision = gate.authorize("finance", 100).await;
        assert_eq!(
            decision,
            PolicyDecision::Deny {
                reason: "vlan 100 reserved".to_string()
            }
        );
        assert_eq!(decision.into_result().unwrap_err().kind(), "PolicyError");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_deny_without_reason_gets_generic_one() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let server = tokio::spawn(serve_one(listener, r#"{"allow": false}"#));

        let gate = gate_for(&path, 2000);
        match gate.authorize("finance", 100).await {
            PolicyDecision::Deny { reason } => {
                assert!(reason.contains("finance"));
                assert!(reason.contains("100"));
            }
            other => panic!("expected deny, got {:?}", other),
        }
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_absent_socket_is_unreachable() {
        let dir = tempfile::tempdir().unwrap();
        let gate = gate_for(&dir.path().join("nope.sock"), 200);

        match gate.authorize("finance", 100).await {
            PolicyDecision::Unreachable { .. } => {}
            other => panic!("expected unreachable, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stalled_authority_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.sock");
        let listener = UnixListener::bind(&path).unwrap();
        // Accept but never answer.
        let server = tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let gate = gate_for(&path, 100);
        let decision = gate.authorize("finance", 100).await;
        match decision {
            PolicyDecision::Unreachable { ref message } => {
                assert!(message.contains("no response"))
            }
            ref other => panic!("expected unreachable, got {:?}", other),
        }
        assert_eq!(decision.into_result().unwrap_err().kind(), "PolicyError");
        server.abort();
    }

    #[tokio::test]
    async fn test_garbled_response_is_unreachable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let server = tokio::spawn(serve_one(listener, "not json at all"));

        let gate = gate_for(&path, 2000);
        match gate.authorize("finance", 100).await {
            PolicyDecision::Unreachable { message } => assert!(message.contains("decode")),
            other => panic!("expected unreachable, got {:?}", other),
        }
        server.await.unwrap();
    }
}
