//! Process harness.
//!
//! Starts the echo server on a loopback ephemeral port, then runs the
//! program under test with the server's host and port as its arguments and
//! hands back the program's exit code. The program may be wrapped in a
//! memory checker, and a shared library may be injected into it through
//! dynamic-loader environment variables. Those variables are set on the
//! child's command only; the harness's own environment is never touched.

use crate::config::{Config, Injection, Memcheck};
use crate::server::EchoServer;
use std::ffi::OsString;
use std::io::{self, Write};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::process::ExitStatus;
use tokio::process::Command;
use tracing::{debug, info};

/// Address the echo server listens on
pub const LOOPBACK: Ipv4Addr = Ipv4Addr::LOCALHOST;

/// Preload variable for ELF dynamic loaders
pub const ENV_LD_PRELOAD: &str = "LD_PRELOAD";
/// Preload variable for the macOS dynamic loader
pub const ENV_DYLD_INSERT_LIBRARIES: &str = "DYLD_INSERT_LIBRARIES";
/// Makes the macOS loader resolve symbols through the inserted library
pub const ENV_DYLD_FORCE_FLAT_NAMESPACE: &str = "DYLD_FORCE_FLAT_NAMESPACE";
/// Verbosity of the injected library
pub const ENV_MOCKEAGAIN_VERBOSE: &str = "MOCKEAGAIN_VERBOSE";
/// Operations the injected library mocks (`r`, `w` or `rw`)
pub const ENV_MOCKEAGAIN: &str = "MOCKEAGAIN";
/// Write timeout pattern for the injected library
pub const ENV_MOCKEAGAIN_WRITE_TIMEOUT_PATTERN: &str = "MOCKEAGAIN_WRITE_TIMEOUT_PATTERN";

/// Harness errors
#[derive(Debug)]
pub enum HarnessError {
    Bind(SocketAddr, io::Error),
    Announce(io::Error),
    Spawn(OsString, io::Error),
    Wait(io::Error),
}

impl std::fmt::Display for HarnessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HarnessError::Bind(addr, e) => write!(f, "Failed to bind echo server on {addr}: {e}"),
            HarnessError::Announce(e) => write!(f, "Failed to write listening address: {e}"),
            HarnessError::Spawn(program, e) => {
                write!(f, "Failed to launch '{}': {}", program.to_string_lossy(), e)
            }
            HarnessError::Wait(e) => write!(f, "Failed to wait for program: {e}"),
        }
    }
}

impl std::error::Error for HarnessError {}

/// Command line and environment overlay for the program under test.
#[derive(Debug, Clone)]
pub struct ChildCommand {
    argv: Vec<OsString>,
    env: Vec<(&'static str, OsString)>,
}

impl ChildCommand {
    /// `[program, host, port]`, prefixed with the memcheck invocation when
    /// one is given.
    pub fn new(program: &Path, server: SocketAddr, memcheck: Option<&Memcheck>) -> Self {
        let mut argv = Vec::new();
        if let Some(memcheck) = memcheck {
            argv.push(OsString::from(&memcheck.tool));
            argv.extend(memcheck.args.iter().map(OsString::from));
        }
        argv.push(program.as_os_str().to_owned());
        argv.push(OsString::from(server.ip().to_string()));
        argv.push(OsString::from(server.port().to_string()));

        ChildCommand {
            argv,
            env: Vec::new(),
        }
    }

    /// Add the library injection variables to the overlay.
    pub fn with_injection(mut self, injection: &Injection) -> Self {
        self.env.extend(injection_env(injection));
        self
    }

    pub fn argv(&self) -> &[OsString] {
        &self.argv
    }

    /// Variables set for the child on top of the inherited environment
    pub fn env(&self) -> &[(&'static str, OsString)] {
        &self.env
    }

    /// Launch the command and wait for it to exit.
    pub async fn status(&self) -> Result<ExitStatus, HarnessError> {
        let mut child = Command::new(&self.argv[0])
            .args(&self.argv[1..])
            .envs(self.env.iter().map(|(key, value)| (*key, value)))
            .spawn()
            .map_err(|e| HarnessError::Spawn(self.argv[0].clone(), e))?;

        debug!(pid = ?child.id(), "Program launched");

        child.wait().await.map_err(HarnessError::Wait)
    }
}

/// Environment overlay that injects `injection.library` into a child.
pub fn injection_env(injection: &Injection) -> Vec<(&'static str, OsString)> {
    let library = injection.library.as_os_str();
    let mut env = vec![
        (ENV_LD_PRELOAD, library.to_owned()),
        (ENV_DYLD_INSERT_LIBRARIES, library.to_owned()),
        (ENV_DYLD_FORCE_FLAT_NAMESPACE, OsString::from("1")),
        (
            ENV_MOCKEAGAIN_VERBOSE,
            OsString::from(injection.verbose.to_string()),
        ),
    ];

    if let Some(mock) = injection.mock {
        env.push((ENV_MOCKEAGAIN, OsString::from(mock.env_value())));
    }
    if let Some(ref pattern) = injection.write_timeout_pattern {
        env.push((ENV_MOCKEAGAIN_WRITE_TIMEOUT_PATTERN, OsString::from(pattern)));
    }

    env
}

/// Exit code to report for a finished child.
///
/// Death by signal is reported as the negated signal number truncated to
/// eight bits, e.g. 247 for `SIGKILL`.
pub fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return (256 - signal) & 0xff;
        }
    }

    1
}

/// Print the line clients and test drivers look for on stdout.
fn announce<W: Write>(out: &mut W, addr: SocketAddr) -> io::Result<()> {
    writeln!(out, "Listening on IP {} and port {}", addr.ip(), addr.port())?;
    out.flush()
}

/// Start the echo server, run the configured program against it and
/// return the program's exit code.
pub async fn run(config: &Config) -> Result<i32, HarnessError> {
    run_with(config, io::stdout()).await
}

/// Like [`run`], announcing the listening address on `out`. The line is
/// flushed before the program is launched.
pub async fn run_with<W: Write>(config: &Config, mut out: W) -> Result<i32, HarnessError> {
    let bind_addr = SocketAddr::from((LOOPBACK, 0));
    let server = EchoServer::bind(bind_addr).map_err(|e| HarnessError::Bind(bind_addr, e))?;
    let addr = server.local_addr();

    announce(&mut out, addr).map_err(HarnessError::Announce)?;

    // Detached: dropped along with the runtime once the program is done
    server.spawn();

    let mut command = ChildCommand::new(&config.program, addr, config.memcheck.as_ref());
    if let Some(ref injection) = config.injection {
        command = command.with_injection(injection);
    }

    info!(
        argv = ?command.argv(),
        env = ?command.env(),
        "Launching program"
    );

    let status = command.status().await?;
    let code = exit_code(status);
    info!(code, status = %status, "Program exited");

    Ok(code)
}
