//! Host-side client for running commands inside a guest.
//!
//! Each invocation dials the multiplexer, binds the guest channel with a
//! `CONNECT` handshake, sends the command text and drains the response
//! until the guest closes its write side. Connection resets while reading
//! are retried on a fresh connection after a flat delay; everything else
//! is terminal.

use std::io::{self, Read, Write};
use std::thread;
use std::time::Duration;

use guestcmd_proto::{CmdResult, HANDSHAKE_CHUNK, READ_CHUNK};
use tracing::{debug, trace, warn};

use crate::error::{self, Error, Result};
use crate::transport::{Stream, Transport};

/// Default number of attempts per invocation.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default pause between attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// A command to run on a guest channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Guest vsock port behind the multiplexer.
    channel: u32,
    /// Command line handed verbatim to the guest shell.
    command: String,
}

impl Request {
    /// Creates a request. Fails with [`Error::InvalidChannel`] for channel 0.
    pub fn new(channel: u32, command: impl Into<String>) -> Result<Self> {
        if channel == 0 {
            return Err(Error::InvalidChannel);
        }
        Ok(Self {
            channel,
            command: command.into(),
        })
    }

    /// Guest channel id.
    pub const fn channel(&self) -> u32 {
        self.channel
    }

    /// Command text.
    pub fn command(&self) -> &str {
        &self.command
    }
}

/// Bounds on how connection resets are retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per invocation, including the first. Zero counts as one.
    pub max_attempts: u32,
    /// Flat delay slept after each reset before reconnecting.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_RETRIES,
            delay: DEFAULT_RETRY_DELAY,
        }
    }
}

/// Builder for [`Client`].
#[derive(Debug)]
#[must_use = "a ClientBuilder does nothing until .build() is called"]
pub struct ClientBuilder<T> {
    /// Transport used to open connections.
    transport: T,
    /// Retry bounds.
    retry: RetryPolicy,
    /// Optional bound on the handshake read.
    handshake_timeout: Option<Duration>,
}

impl<T: Transport> ClientBuilder<T> {
    /// Sets the maximum number of attempts.
    pub fn max_retries(mut self, n: u32) -> Self {
        self.retry.max_attempts = n;
        self
    }

    /// Sets the delay between attempts.
    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry.delay = delay;
        self
    }

    /// Replaces the whole retry policy.
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Bounds the wait for the handshake acknowledgement.
    ///
    /// `None` (the default) or a zero duration waits indefinitely. Response
    /// reads are never bounded: guest commands may legitimately run for a
    /// long time.
    pub fn handshake_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.handshake_timeout = timeout.filter(|t| !t.is_zero());
        self
    }

    /// Finishes the builder.
    pub fn build(self) -> Client<T> {
        Client {
            transport: self.transport,
            retry: self.retry,
            handshake_timeout: self.handshake_timeout,
        }
    }
}

/// Runs commands in a guest through a multiplexing transport.
#[derive(Debug)]
pub struct Client<T> {
    /// Transport used to open one connection per attempt.
    transport: T,
    /// Retry bounds.
    retry: RetryPolicy,
    /// Optional bound on the handshake read.
    handshake_timeout: Option<Duration>,
}

/// How a single attempt ended, short of a terminal error.
enum Attempt {
    /// The guest answered with a complete result.
    Done(CmdResult),
    /// The connection was reset while reading.
    Reset(io::Error),
}

impl<T: Transport> Client<T> {
    /// Starts building a client over `transport`.
    pub fn builder(transport: T) -> ClientBuilder<T> {
        ClientBuilder {
            transport,
            retry: RetryPolicy::default(),
            handshake_timeout: None,
        }
    }

    /// Returns the retry policy in effect.
    pub const fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Runs `req` in the guest and returns its complete result.
    ///
    /// Blocks until the guest closes the connection. Nothing from a reset
    /// attempt is ever returned; only the final attempt's result is.
    pub fn execute(&self, req: &Request) -> Result<CmdResult> {
        let max = self.retry.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            debug!(
                attempt,
                max,
                channel = req.channel,
                address = %self.transport.address().display(),
                "starting guest command attempt"
            );

            match self.attempt(req)? {
                Attempt::Done(result) => {
                    debug!(attempt, exit_code = result.exit_code, "guest command finished");
                    return Ok(result);
                }
                Attempt::Reset(source) if attempt >= max => {
                    warn!(attempt, error = %source, "connection reset, no attempts left");
                    return Err(Error::Exhausted {
                        attempts: attempt,
                        source,
                    });
                }
                Attempt::Reset(source) => {
                    warn!(
                        attempt,
                        delay = ?self.retry.delay,
                        error = %source,
                        "connection reset, retrying"
                    );
                    thread::sleep(self.retry.delay);
                }
            }
        }
    }

    /// Runs `req` and returns only the guest's stdout.
    pub fn output(&self, req: &Request) -> Result<String> {
        self.execute(req).map(|r| r.stdout)
    }

    /// One connection's worth of work. The stream is dropped on return.
    fn attempt(&self, req: &Request) -> Result<Attempt> {
        let mut stream = self.transport.open().map_err(|source| Error::Open {
            path: self.transport.address(),
            source,
        })?;

        stream.set_read_timeout(self.handshake_timeout)?;
        stream.write_all(guestcmd_proto::connect_line(req.channel).as_bytes())?;

        let mut ack = [0u8; HANDSHAKE_CHUNK];
        let n = match read_chunk(&mut stream, &mut ack) {
            Ok(n) => n,
            Err(e) => match (self.handshake_timeout, error::is_timeout(&e)) {
                (Some(timeout), true) => return Err(Error::HandshakeTimeout { timeout }),
                _ => return classify(e),
            },
        };
        if !guestcmd_proto::is_ack(&ack[..n], req.channel) {
            return Err(Error::Handshake {
                channel: req.channel,
                received: String::from_utf8_lossy(&ack[..n]).into_owned(),
            });
        }
        trace!(channel = req.channel, "handshake acknowledged");

        if self.handshake_timeout.is_some() {
            stream.set_read_timeout(None)?;
        }

        stream.write_all(req.command.as_bytes())?;
        stream.flush()?;

        let buf = match drain(&mut stream) {
            Ok(buf) => buf,
            Err(e) => return classify(e),
        };
        drop(stream);

        Ok(Attempt::Done(CmdResult::from_slice(&buf)?))
    }
}

/// Maps a read error to a retryable reset or a terminal error.
fn classify(e: io::Error) -> Result<Attempt> {
    if error::is_reset(&e) {
        Ok(Attempt::Reset(e))
    } else {
        Err(Error::Io(e))
    }
}

/// Performs a single read, retrying if interrupted by a signal.
fn read_chunk(r: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        match r.read(buf) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            res => return res,
        }
    }
}

/// Reads until end-of-stream and returns everything received.
fn drain(r: &mut impl Read) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        let n = read_chunk(r, &mut chunk)?;
        if n == 0 {
            trace!(total = buf.len(), "guest closed the stream");
            return Ok(buf);
        }
        trace!(bytes = n, "received response chunk");
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Writes a result the way a local command would have.
///
/// Stdout is written verbatim; stderr only when non-empty. Returns the
/// guest's exit code for the caller to use as its own status.
pub fn emit(result: &CmdResult, out: &mut impl Write, err: &mut impl Write) -> io::Result<i32> {
    out.write_all(result.stdout.as_bytes())?;
    out.flush()?;
    if !result.stderr.is_empty() {
        err.write_all(result.stderr.as_bytes())?;
        err.flush()?;
    }
    Ok(result.exit_code)
}

/// Runs `command` on `channel_id` behind the multiplexer socket at `address`.
///
/// One-shot form of [`Client::execute`] over a [`UnixTransport`](crate::UnixTransport).
#[cfg(unix)]
pub fn execute(
    address: impl AsRef<std::path::Path>,
    channel_id: u32,
    command: &str,
    max_retries: u32,
    retry_delay: Duration,
) -> Result<CmdResult> {
    let req = Request::new(channel_id, command)?;
    Client::builder(crate::UnixTransport::new(address))
        .max_retries(max_retries)
        .retry_delay(retry_delay)
        .build()
        .execute(&req)
}
