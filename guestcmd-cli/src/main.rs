//! CLI that runs a command inside a guest VM as if it ran locally.

#![allow(clippy::print_stderr, clippy::missing_docs_in_private_items)]

use std::io::{self, Write};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
#[cfg(unix)]
use guestcmd::{Client, Request, UnixTransport};
use guestcmd::{DEFAULT_MAX_RETRIES, DEFAULT_PORT};
use tracing_subscriber::EnvFilter;

/// Exit status for failures on this side of the socket.
///
/// Remote exit codes pass through untouched, so a guest command that itself
/// exits 125 looks the same to the caller; the `guestcmd:` line on stderr
/// tells them apart. A guest command killed by a signal reports -1, which
/// the OS truncates to 255.
const EXIT_LOCAL_FAILURE: i32 = 125;

#[derive(Debug, Parser)]
#[command(name = "guestcmd", version, about = "Run a command in a guest VM")]
struct Cli {
    /// Unix socket exposed by the vsock multiplexer.
    #[arg(long, env = "GUESTCMD_SOCKET")]
    socket: PathBuf,

    /// Guest vsock port the agent listens on.
    #[arg(short, long, env = "GUESTCMD_PORT", default_value_t = DEFAULT_PORT)]
    port: u32,

    /// Attempts before giving up on connection resets.
    #[arg(long, default_value_t = DEFAULT_MAX_RETRIES)]
    retries: u32,

    /// Delay between attempts, in milliseconds.
    #[arg(long, default_value_t = 1000)]
    retry_delay_ms: u64,

    /// Give up if the multiplexer does not acknowledge within this many
    /// milliseconds (default: wait forever).
    #[arg(long)]
    handshake_timeout_ms: Option<u64>,

    /// Command to run; words are joined with spaces.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
    command: Vec<String>,
}

#[cfg(not(unix))]
fn main() {
    eprintln!("guestcmd: Unix domain sockets are required");
    std::process::exit(EXIT_LOCAL_FAILURE);
}

#[cfg(unix)]
fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    match cli.run(&mut io::stdout().lock(), &mut io::stderr().lock()) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("guestcmd: {e:#}");
            std::process::exit(EXIT_LOCAL_FAILURE);
        }
    }
}

#[cfg(unix)]
impl Cli {
    fn client(&self) -> Client<UnixTransport> {
        Client::builder(UnixTransport::new(&self.socket))
            .max_retries(self.retries)
            .retry_delay(Duration::from_millis(self.retry_delay_ms))
            .handshake_timeout(self.handshake_timeout_ms.map(Duration::from_millis))
            .build()
    }

    fn request(&self) -> Result<Request> {
        Ok(Request::new(self.port, self.command.join(" "))?)
    }

    /// Runs the command and writes its output; returns the remote exit code.
    fn run(&self, out: &mut impl Write, err: &mut impl Write) -> Result<i32> {
        let req = self.request()?;
        tracing::debug!(socket = %self.socket.display(), port = self.port, "running guest command");
        let result = self.client().execute(&req)?;
        Ok(guestcmd::emit(&result, out, err)?)
    }
}
