//! vlan-attach - plugin entry point.

use std::process::ExitCode;
use tracing::error;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use vlan_attach::commands;
use vlan_attach::types::ErrorReply;

/// Initializes tracing. Logs go to stderr: stdout carries the result
/// document.
fn init_logging() {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .with_target(true)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();

    match commands::run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{}", err);
            println!("{}", ErrorReply::from_error(&err).to_json());
            ExitCode::from(err.code().min(u8::MAX as u32) as u8)
        }
    }
}
