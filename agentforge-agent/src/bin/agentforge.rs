//! `agentforge` binary: drives one conformance violation through the fix
//! loop per invocation.

use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt::init();
    agentforge_agent::cli::run().await
}
