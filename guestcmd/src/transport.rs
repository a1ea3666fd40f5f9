//! Byte-stream transports to the guest multiplexer.
//!
//! A [`Transport`] dials a fresh [`Stream`] per attempt. The stream is
//! closed when dropped, so every attempt releases its connection on every
//! exit path.

use std::io::{self, Read, Write};
use std::time::Duration;

/// A connected, bidirectional byte stream.
pub trait Stream: Read + Write {
    /// Sets the read timeout; `None` blocks indefinitely.
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;
}

/// Something that can open new connections to the multiplexer.
pub trait Transport {
    /// Stream type produced by [`Transport::open`].
    type Stream: Stream;

    /// Opens a new connection.
    fn open(&self) -> io::Result<Self::Stream>;

    /// Human-readable address for logs and errors.
    fn address(&self) -> std::path::PathBuf;
}

#[cfg(unix)]
mod unix {
    use std::io;
    use std::os::unix::net::UnixStream;
    use std::path::{Path, PathBuf};
    use std::time::Duration;

    use super::{Stream, Transport};

    impl Stream for UnixStream {
        fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
            Self::set_read_timeout(self, timeout)
        }
    }

    /// Connects to a multiplexer listening on a Unix socket path.
    ///
    /// The socket must already exist; it is never created or searched for.
    #[derive(Debug, Clone)]
    pub struct UnixTransport {
        /// Path of the listening socket.
        path: PathBuf,
    }

    impl UnixTransport {
        /// Creates a transport for the socket at `path`.
        pub fn new(path: impl AsRef<Path>) -> Self {
            Self {
                path: path.as_ref().to_path_buf(),
            }
        }
    }

    impl Transport for UnixTransport {
        type Stream = UnixStream;

        fn open(&self) -> io::Result<UnixStream> {
            UnixStream::connect(&self.path)
        }

        fn address(&self) -> PathBuf {
            self.path.clone()
        }
    }
}

#[cfg(unix)]
pub use unix::UnixTransport;

#[cfg(all(test, unix))]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::io::{BufRead, BufReader, Read, Write};
    use std::os::unix::net::{UnixListener, UnixStream};
    use std::thread::{self, JoinHandle};
    use std::time::Duration;

    use super::*;
    use crate::{Client, Error, Request};

    const PORT: u32 = 12_341_234;

    /// Accepts one connection and reads the `CONNECT` line from it.
    fn accept_connect(listener: &UnixListener) -> (BufReader<UnixStream>, String) {
        let (stream, _) = listener.accept().unwrap();
        let mut r = BufReader::new(stream);
        let mut line = String::new();
        r.read_line(&mut line).unwrap();
        (r, line)
    }

    fn mux(
        listener: UnixListener,
        serve: impl FnOnce(BufReader<UnixStream>, String) + Send + 'static,
    ) -> JoinHandle<()> {
        thread::spawn(move || {
            let (r, line) = accept_connect(&listener);
            serve(r, line);
        })
    }

    fn client(path: &std::path::Path) -> Client<UnixTransport> {
        Client::builder(UnixTransport::new(path))
            .retry_delay(Duration::ZERO)
            .build()
    }

    #[test]
    fn round_trip_over_unix_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vsocket");
        let listener = UnixListener::bind(&path).unwrap();

        let server = mux(listener, |mut r, line| {
            assert_eq!(line, "CONNECT 12341234\n");
            r.get_mut()
                .write_all(guestcmd_proto::ok_line(PORT).as_bytes())
                .unwrap();

            let mut cmd = [0u8; 64];
            let n = r.read(&mut cmd).unwrap();
            assert_eq!(&cmd[..n], b"echo hi");

            let w = r.get_mut();
            for part in [r#"{"stdout":"#, r#""hi\n","stderr":"","#, r#""exit_code":0}"#] {
                w.write_all(part.as_bytes()).unwrap();
                w.flush().unwrap();
                thread::sleep(Duration::from_millis(5));
            }
        });

        let req = Request::new(PORT, "echo hi").unwrap();
        let result = client(&path).execute(&req).unwrap();
        server.join().unwrap();

        assert_eq!(result.stdout, "hi\n");
        assert_eq!(result.stderr, "");
        assert_eq!(result.exit_code, 0);
    }

    #[test]
    fn zero_handshake_timeout_is_accepted_by_unix_sockets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vsocket");
        let listener = UnixListener::bind(&path).unwrap();

        let server = mux(listener, |mut r, _| {
            let w = r.get_mut();
            w.write_all(guestcmd_proto::ok_line(PORT).as_bytes())
                .unwrap();
            let mut cmd = [0u8; 16];
            let _ = w.read(&mut cmd).unwrap();
            w.write_all(br#"{"stdout":"ok","stderr":"","exit_code":0}"#)
                .unwrap();
        });

        let c = Client::builder(UnixTransport::new(&path))
            .handshake_timeout(Some(Duration::ZERO))
            .build();
        let result = c.execute(&Request::new(PORT, "true").unwrap()).unwrap();
        server.join().unwrap();

        assert_eq!(result.stdout, "ok");
    }

    #[test]
    fn wrong_ack_stops_before_command() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vsocket");
        let listener = UnixListener::bind(&path).unwrap();

        let server = mux(listener, |mut r, _| {
            r.get_mut().write_all(b"OK 999\n").unwrap();
            let mut rest = Vec::new();
            r.read_to_end(&mut rest).unwrap();
            assert!(rest.is_empty(), "command was sent after a bad handshake");
        });

        let req = Request::new(PORT, "echo hi").unwrap();
        let err = client(&path).execute(&req).unwrap_err();
        server.join().unwrap();

        assert!(matches!(err, Error::Handshake { channel: PORT, .. }));
    }

    #[test]
    fn mux_closing_without_ack_is_a_handshake_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vsocket");
        let listener = UnixListener::bind(&path).unwrap();

        let server = mux(listener, |r, _| drop(r));

        let req = Request::new(PORT, "ls").unwrap();
        let err = client(&path).execute(&req).unwrap_err();
        server.join().unwrap();

        match err {
            Error::Handshake { received, .. } => assert!(received.is_empty()),
            other => panic!("expected handshake failure, got {other:?}"),
        }
    }

    #[test]
    fn missing_socket_is_an_open_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent");

        let req = Request::new(PORT, "ls").unwrap();
        match client(&path).execute(&req) {
            Err(Error::Open { path: p, source }) => {
                assert_eq!(p, path);
                assert_eq!(source.kind(), std::io::ErrorKind::NotFound);
            }
            other => panic!("expected open failure, got {other:?}"),
        }
    }

    #[test]
    fn one_shot_execute() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vsocket");
        let listener = UnixListener::bind(&path).unwrap();

        let server = mux(listener, |mut r, _| {
            let w = r.get_mut();
            w.write_all(b"OK 7\n").unwrap();
            let mut cmd = [0u8; 16];
            let _ = w.read(&mut cmd).unwrap();
            w.write_all(br#"{"stdout":"","stderr":"boom\n","exit_code":1}"#)
                .unwrap();
        });

        let result = crate::execute(&path, 7, "false", 3, Duration::ZERO).unwrap();
        server.join().unwrap();

        assert_eq!(result.exit_code, 1);
        assert_eq!(result.stderr, "boom\n");
    }
}
