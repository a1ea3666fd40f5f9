//! Wire protocol for guestcmd host↔guest command execution.
//!
//! The host talks to a local multiplexing Unix socket that bridges to a
//! guest vsock port. One connection carries exactly one exchange:
//!
//! 1. host → mux: `CONNECT <port>\n`
//! 2. mux → host: a chunk containing `OK <port>`
//! 3. host → guest: the raw command text, no framing
//! 4. guest → host: a JSON [`CmdResult`], then end-of-stream

mod handshake;
mod result;

pub use handshake::{connect_line, is_ack, ok_line};
pub use result::CmdResult;

/// Default vsock port the guest agent listens on.
pub const DEFAULT_PORT: u32 = 12_341_234;

/// Maximum size of the handshake acknowledgement read.
pub const HANDSHAKE_CHUNK: usize = 4096;

/// Size of each read while draining a response or a command.
pub const READ_CHUNK: usize = 64 * 1024;
