//! vlan-attach - tenant-gated VLAN attachment engine for container
//! workloads
//!
//! Provisions a VLAN-tagged sub-interface on a host uplink for each attach
//! event, moves it into the workload's network namespace, binds an address
//! through an external address-management delegate, and gates the whole
//! operation behind a fail-closed tenant policy check.

pub mod commands;
pub mod config;
pub mod engine;
pub mod ipam;
pub mod link;
pub mod netns;
pub mod policy;
pub mod types;

pub use config::NetConf;
pub use engine::AttachEngine;
