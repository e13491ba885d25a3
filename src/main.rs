//! echo-harness: a loopback TCP echo server that runs a client under test
//!
//! The harness binds an echo server to an ephemeral port on 127.0.0.1,
//! prints `Listening on IP <ip> and port <port>`, then launches the
//! program under test as `<program> <ip> <port>` and exits with the
//! program's exit code.
//!
//! Features:
//! - Raw byte echo, one task per connection
//! - Optional memory checker wrapper (valgrind by default)
//! - Optional shared library injection for fault injection testing
//! - Configuration via CLI arguments or TOML file

mod config;
mod harness;
mod server;

use config::Config;
use std::process::ExitCode;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging; stdout belongs to the listening line and the program
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    info!(
        program = %config.program.display(),
        memcheck = ?config.memcheck.as_ref().map(|m| &m.tool),
        inject_library = ?config.injection.as_ref().map(|i| &i.library),
        "Starting echo harness"
    );

    let code = harness::run(&config).await?;

    Ok(ExitCode::from(u8::try_from(code).unwrap_or(1)))
}
