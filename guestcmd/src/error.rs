//! Error types for guest command invocations.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

/// Alias for `Result<T, guestcmd::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Terminal failures of a guest command invocation.
///
/// Connection resets are not represented here: they are retried, and
/// surface as [`Error::Exhausted`] once the retry budget is spent.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Channel id 0 is not a valid vsock port for a request.
    #[error("invalid channel id 0")]
    InvalidChannel,

    /// The multiplexer socket could not be opened.
    #[error("cannot open {}: {source}", path.display())]
    Open {
        /// Socket path that was dialed.
        path: PathBuf,
        /// Underlying connect error.
        source: io::Error,
    },

    /// The multiplexer did not acknowledge the requested channel.
    #[error("handshake failed: expected `OK {channel}`, got {received:?}")]
    Handshake {
        /// Requested channel id.
        channel: u32,
        /// Lossy text of the acknowledgement chunk actually received.
        received: String,
    },

    /// The multiplexer did not acknowledge within the configured bound.
    #[error("no handshake acknowledgement within {timeout:?}")]
    HandshakeTimeout {
        /// Configured handshake timeout.
        timeout: Duration,
    },

    /// Every attempt ended in a connection reset.
    #[error("failed to connect after multiple attempts ({attempts}): {source}")]
    Exhausted {
        /// Number of attempts made.
        attempts: u32,
        /// The reset seen on the last attempt.
        source: io::Error,
    },

    /// The response was not a valid result payload.
    #[error("malformed guest response: {0}")]
    Decode(#[from] serde_json::Error),

    /// Any other transport error.
    #[error("transport error: {0}")]
    Io(#[from] io::Error),
}

/// Returns `true` if `e` means the peer severed an established connection.
pub(crate) fn is_reset(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted
    )
}

/// Returns `true` if `e` is the expiry of a socket read timeout.
pub(crate) fn is_timeout(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
    )
}
