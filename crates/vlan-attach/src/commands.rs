//! Invocation protocol.
//!
//! The plugin is a short-lived process driven by the container runtime: the
//! operation comes from `CNI_COMMAND`, the out-of-band parameters from the
//! other `CNI_*` environment variables, and the attachment configuration
//! from stdin. The result or error document goes to stdout.

use attach_common::{AttachError, AttachResult};
use serde_json::json;
use std::collections::HashMap;
use std::env;
use std::io::Read;
use std::sync::Arc;
use tracing::info;

use crate::config::NetConf;
use crate::engine::AttachEngine;
use crate::ipam::DelegateIpam;
use crate::link::HostLinkTable;
use crate::policy::SocketPolicyGate;
use crate::types::CmdArgs;

/// Protocol version this plugin speaks.
pub const PROTOCOL_VERSION: &str = "1.0.0";

/// Protocol versions accepted from the runtime.
pub const SUPPORTED_VERSIONS: &[&str] = &["0.3.0", "0.3.1", "0.4.0", "1.0.0"];

fn required_env(name: &str) -> AttachResult<String> {
    env::var(name).map_err(|_| {
        AttachError::invalid_config("env", format!("{} not found in environment", name))
    })
}

/// Parses the out-of-band invocation arguments from the environment and
/// reads the attachment configuration from stdin.
pub fn parse_args() -> AttachResult<CmdArgs> {
    let container_id = required_env("CNI_CONTAINERID")?;
    let ifname = required_env("CNI_IFNAME")?;

    // The namespace may legitimately be gone by DEL time.
    let netns = env::var("CNI_NETNS").unwrap_or_default();
    let path = env::var("CNI_PATH").unwrap_or_default();
    let args = parse_extra_args(&env::var("CNI_ARGS").unwrap_or_default());

    let mut stdin_data = Vec::new();
    std::io::stdin()
        .read_to_end(&mut stdin_data)
        .map_err(|e| AttachError::invalid_config("stdin", e.to_string()))?;

    Ok(CmdArgs {
        container_id,
        netns,
        ifname,
        args,
        path,
        stdin_data,
    })
}

/// Parses a `K=V;K=V` argument string into key-value pairs.
fn parse_extra_args(raw: &str) -> HashMap<String, String> {
    let mut args = HashMap::new();
    for pair in raw.split(';') {
        if let Some(idx) = pair.find('=') {
            args.insert(pair[..idx].to_string(), pair[idx + 1..].to_string());
        }
    }
    args
}

fn build_engine(args: &CmdArgs, conf: &NetConf) -> AttachEngine {
    AttachEngine::new(
        Arc::new(HostLinkTable),
        Arc::new(SocketPolicyGate::new(&conf.policy)),
        Arc::new(DelegateIpam::new(args.plugin_dirs())),
    )
}

/// Returns the version document printed for VERSION.
pub fn version_document() -> String {
    json!({
        "cniVersion": PROTOCOL_VERSION,
        "supportedVersions": SUPPORTED_VERSIONS,
    })
    .to_string()
}

/// Dispatches one plugin invocation.
pub async fn run() -> AttachResult<()> {
    let command = required_env("CNI_COMMAND")?;

    if command == "VERSION" {
        println!("{}", version_document());
        return Ok(());
    }

    let args = parse_args()?;
    let conf = NetConf::parse(&args.stdin_data)?;
    let engine = build_engine(&args, &conf);

    match command.as_str() {
        "ADD" => {
            let reply = engine.add(&args, &conf).await?;
            println!("{}", reply.to_json());
        }
        "DEL" => {
            engine.del(&args, &conf).await?;
            info!(container_id = %args.container_id, "Detachment complete");
        }
        "CHECK" => {
            let reply = engine.check(&args, &conf).await?;
            println!("{}", reply.to_json());
        }
        other => {
            return Err(AttachError::invalid_config(
                "env",
                format!("unknown command: {}", other),
            ));
        }
    }

    Ok(())
}
