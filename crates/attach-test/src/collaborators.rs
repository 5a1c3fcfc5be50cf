//! Canned policy gate and address allocator doubles.

use async_trait::async_trait;
use attach_common::{AttachError, AttachResult};
use std::collections::HashSet;
use std::sync::Mutex;

use vlan_attach::config::NetConf;
use vlan_attach::ipam::{AddressAllocator, AddressLease, LeasedIp};
use vlan_attach::policy::{PolicyDecision, PolicyGate};
use vlan_attach::types::{CmdArgs, Route};

/// Policy gate returning a fixed decision, recording every query.
pub struct StaticPolicyGate {
    decision: PolicyDecision,
    queries: Mutex<Vec<(String, u16)>>,
}

impl StaticPolicyGate {
    /// Gate that allows everything.
    pub fn allow() -> Self {
        Self::with_decision(PolicyDecision::Allow)
    }

    /// Gate that denies everything with the given reason.
    pub fn deny(reason: &str) -> Self {
        Self::with_decision(PolicyDecision::Deny {
            reason: reason.to_string(),
        })
    }

    /// Gate that simulates an unreachable authority.
    pub fn unreachable(message: &str) -> Self {
        Self::with_decision(PolicyDecision::Unreachable {
            message: message.to_string(),
        })
    }

    fn with_decision(decision: PolicyDecision) -> Self {
        Self {
            decision,
            queries: Mutex::new(Vec::new()),
        }
    }

    /// Returns the recorded (tenant, vlan) queries.
    pub fn queries(&self) -> Vec<(String, u16)> {
        self.queries.lock().unwrap().clone()
    }
}

#[async_trait]
impl PolicyGate for StaticPolicyGate {
    async fn authorize(&self, tenant: &str, vlan_id: u16) -> PolicyDecision {
        self.queries
            .lock()
            .unwrap()
            .push((tenant.to_string(), vlan_id));
        self.decision.clone()
    }
}

/// In-memory address allocator with a fixed lease and failure switches.
pub struct MockIpam {
    lease: AddressLease,
    fail_allocate: bool,
    fail_release: bool,
    leases: Mutex<HashSet<String>>,
    release_calls: Mutex<u32>,
}

impl MockIpam {
    /// Allocator handing out one address in 10.100.0.0/24 with a default
    /// route.
    pub fn new() -> Self {
        Self {
            lease: AddressLease {
                ips: vec![LeasedIp {
                    address: "10.100.0.5/24".to_string(),
                    gateway: Some("10.100.0.1".to_string()),
                }],
                routes: vec![Route {
                    dst: "0.0.0.0/0".to_string(),
                    gw: Some("10.100.0.1".to_string()),
                }],
            },
            fail_allocate: false,
            fail_release: false,
            leases: Mutex::new(HashSet::new()),
            release_calls: Mutex::new(0),
        }
    }

    /// Overrides the lease handed out on allocate.
    pub fn with_lease(mut self, lease: AddressLease) -> Self {
        self.lease = lease;
        self
    }

    /// Makes allocation fail.
    pub fn failing_allocate(mut self) -> Self {
        self.fail_allocate = true;
        self
    }

    /// Makes release fail.
    pub fn failing_release(mut self) -> Self {
        self.fail_release = true;
        self
    }

    /// Pre-registers a lease, as if a previous ADD allocated it.
    pub fn with_existing_lease(self, container_id: &str) -> Self {
        self.leases.lock().unwrap().insert(container_id.to_string());
        self
    }

    /// Returns the outstanding lease keys.
    pub fn outstanding(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.leases.lock().unwrap().iter().cloned().collect();
        keys.sort();
        keys
    }

    /// Returns how many times release was called.
    pub fn release_calls(&self) -> u32 {
        *self.release_calls.lock().unwrap()
    }
}

impl Default for MockIpam {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AddressAllocator for MockIpam {
    async fn allocate(&self, args: &CmdArgs, _conf: &NetConf) -> AttachResult<AddressLease> {
        if self.fail_allocate {
            return Err(AttachError::ipam("allocate", "injected allocation failure"));
        }
        self.leases
            .lock()
            .unwrap()
            .insert(args.container_id.clone());
        Ok(self.lease.clone())
    }

    async fn release(&self, args: &CmdArgs, _conf: &NetConf) -> AttachResult<()> {
        *self.release_calls.lock().unwrap() += 1;
        if self.fail_release {
            return Err(AttachError::ipam("release", "injected release failure"));
        }
        // Releasing an absent lease is a no-op success.
        self.leases.lock().unwrap().remove(&args.container_id);
        Ok(())
    }

    async fn check(&self, args: &CmdArgs, _conf: &NetConf) -> AttachResult<()> {
        if self.leases.lock().unwrap().contains(&args.container_id) {
            Ok(())
        } else {
            Err(AttachError::ipam(
                "check",
                format!("no lease for workload {}", args.container_id),
            ))
        }
    }
}
