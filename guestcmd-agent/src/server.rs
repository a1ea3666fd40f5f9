//! Vsock listener and per-connection command sessions.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use guestcmd_proto::{DEFAULT_PORT, READ_CHUNK};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_vsock::{VsockAddr, VsockListener};
use tracing::{debug, error, info};

use crate::exec::{self, Shell};

/// Command-line arguments of the agent.
#[derive(Debug, clap::Parser)]
#[command(name = "guestcmd-agent", version, about = "Run host commands inside this guest")]
pub struct Args {
    /// Context ID to bind (default: any).
    #[arg(short, long)]
    cid: Option<u32>,

    /// Vsock port to listen on.
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u32,

    /// Shell that runs each command, read from stdin.
    #[arg(short, long, default_value = "/bin/sh")]
    shell: String,

    /// Per-command time limit in seconds (0 disables).
    #[arg(short, long, default_value_t = 10)]
    timeout: u64,
}

impl Args {
    /// Validates the arguments into a runtime [`Config`].
    pub fn into_config(self) -> anyhow::Result<Config> {
        let shell = Shell::parse(&self.shell)
            .with_context(|| format!("invalid shell command line: {:?}", self.shell))?;
        Ok(Config {
            cid: self.cid.unwrap_or(libc::VMADDR_CID_ANY),
            port: self.port,
            shell,
            timeout: (self.timeout > 0).then(|| Duration::from_secs(self.timeout)),
        })
    }
}

/// Agent settings shared by all sessions.
#[derive(Debug, Clone)]
pub struct Config {
    /// Context ID to bind.
    pub cid: u32,
    /// Vsock port to bind.
    pub port: u32,
    /// Shell used to run commands.
    pub shell: Shell,
    /// Per-command time limit.
    pub timeout: Option<Duration>,
}

/// Binds the vsock listener and serves connections until an accept fails.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let listener = VsockListener::bind(VsockAddr::new(config.cid, config.port))
        .with_context(|| format!("cannot bind vsock cid {} port {}", config.cid, config.port))?;
    info!(cid = config.cid, port = config.port, shell = ?config.shell, "listening on vsock");

    let config = Arc::new(config);
    loop {
        let (stream, peer) = listener.accept().await.context("vsock accept failed")?;
        let config = Arc::clone(&config);
        tokio::spawn(async move {
            debug!(?peer, "accepted connection");
            if let Err(e) = session(stream, &config).await {
                error!(?peer, error = %e, "session failed");
            }
        });
    }
}

/// Serves one connection: read the command, run it, reply, close.
///
/// The first read is the whole command. The reply is written once and the
/// write side is shut down so the host sees end-of-stream.
pub async fn session<S>(mut stream: S, config: &Config) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK];
    let n = stream.read(&mut buf).await?;
    if n == 0 {
        debug!("peer closed before sending a command");
        return Ok(());
    }

    let command = String::from_utf8_lossy(&buf[..n]);
    let command = command.trim();
    info!(command, "running command");

    let result = exec::run(&config.shell, command, config.timeout).await;
    debug!(exit_code = result.exit_code, "command finished");

    let payload = result.to_vec().map_err(io::Error::other)?;
    stream.write_all(&payload).await?;
    stream.shutdown().await
}
