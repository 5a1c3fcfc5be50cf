//! attach-common - shared infrastructure for the vlan-attach plugin
//!
//! Provides the error taxonomy used across the attachment engine and the
//! shell command execution layer that drives `ip(8)`/`nsenter(1)`.

pub mod error;
pub mod shell;

pub use error::{AttachError, AttachResult};
