//! The structured payload the guest returns for every command.

use serde::{Deserialize, Serialize};

/// Output of one command executed inside the guest.
///
/// Serialized as a single JSON object with exactly these three fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CmdResult {
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error, possibly empty.
    pub stderr: String,
    /// Exit status reported by the guest shell (`-1` if killed by signal).
    pub exit_code: i32,
}

impl CmdResult {
    /// Decodes a complete response buffer.
    pub fn from_slice(buf: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(buf)
    }

    /// Encodes the result as the JSON wire payload.
    pub fn to_vec(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Returns `true` if the guest command exited with status 0.
    pub const fn success(&self) -> bool {
        self.exit_code == 0
    }
}
