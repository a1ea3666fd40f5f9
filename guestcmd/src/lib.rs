//! Run shell commands inside a guest VM over a vsock multiplexer.
//!
//! `guestcmd` talks to the Unix socket that a vsock multiplexer (for example
//! `vhost-device-vsock` or libkrun's port mapping) exposes on the host. Each
//! invocation performs a `CONNECT <port>` handshake, sends the command text,
//! drains the guest's JSON reply until end-of-stream and decodes it into a
//! [`CmdResult`].
//!
//! # Quick start
//!
//! ```no_run
//! use std::time::Duration;
//!
//! let result = guestcmd::execute("/tmp/vm0/vsocket", 12341234, "uname -a", 3, Duration::from_secs(1))
//!     .expect("guest command failed");
//! print!("{}", result.stdout);
//! std::process::exit(result.exit_code);
//! ```
//!
//! Connection resets while reading are retried on a fresh connection after
//! a flat delay. Every other failure is terminal; see [`Error`].

mod client;
mod error;
mod transport;

#[cfg(unix)]
pub use client::execute;
pub use client::{
    Client, ClientBuilder, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_DELAY, Request, RetryPolicy, emit,
};
pub use error::{Error, Result};
pub use guestcmd_proto::{CmdResult, DEFAULT_PORT};
#[cfg(unix)]
pub use transport::UnixTransport;
pub use transport::{Stream, Transport};
