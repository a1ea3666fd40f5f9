//! `CONNECT` / `OK` line helpers for the vsock multiplexer handshake.

/// Builds the line that asks the multiplexer to bind `port`.
pub fn connect_line(port: u32) -> String {
    format!("CONNECT {port}\n")
}

/// Builds the acknowledgement a multiplexer sends once `port` is bound.
pub fn ok_line(port: u32) -> String {
    format!("OK {port}\n")
}

/// Returns `true` if `chunk` acknowledges a connection to `port`.
///
/// The chunk must contain `OK <port>` where the port number is not
/// immediately followed by another digit, so `OK 1234` never acknowledges
/// port `123`.
pub fn is_ack(chunk: &[u8], port: u32) -> bool {
    let text = String::from_utf8_lossy(chunk);
    let needle = format!("OK {port}");

    text.match_indices(&needle).any(|(at, _)| {
        !text[at + needle.len()..]
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_digit())
    })
}
