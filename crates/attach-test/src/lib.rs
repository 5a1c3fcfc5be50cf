//! Test infrastructure for the vlan-attach engine
//!
//! Provides:
//! - An in-memory kernel link table with failure injection
//! - Canned policy gate and address allocator doubles
//! - Attachment configuration fixtures

pub mod collaborators;
pub mod fixtures;
mod mock_kernel;

pub use collaborators::{MockIpam, StaticPolicyGate};
pub use fixtures::*;
pub use mock_kernel::{MockLink, MockLinkTable};
