//! Byte transports underneath a [`Connection`](crate::ipc::Connection).
//!
//! A transport moves raw bytes and nothing else: framing and correlation
//! live above it. Two real implementations are provided:
//!
//! - [`StreamTransport`] wraps any blocking reader/writer pair. A reader
//!   thread moves incoming chunks into a channel so that reads can honour a
//!   deadline.
//! - [`ProcessTransport`] spawns the server with piped stdin/stdout and
//!   drives it through a `StreamTransport`.
//!
//! See [`FakeTransport`](crate::ipc::FakeTransport) for an in-memory one.

use std::io::{self, Read, Write};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::ipc::error::IpcError;

/// Size of each read issued by the reader thread.
const READER_CHUNK_SIZE: usize = 8 * 1024;

/// Polls of `try_wait` before the server process is killed.
const EXIT_POLL_ATTEMPTS: u32 = 10;
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Byte-level duplex stream used by a connection.
///
/// All methods are called with the connection lock held, so implementations
/// never see concurrent calls.
pub trait Transport: Send {
    /// Write all of `data`, blocking if the peer is slow to drain it.
    ///
    /// An error permanently fails the connection.
    fn write(&mut self, data: &[u8]) -> io::Result<()>;

    /// Read up to `max_bytes`.
    ///
    /// Returns as soon as at least one byte is available, or with an empty
    /// vector once `deadline` passes. With no deadline it blocks until data
    /// arrives. An empty result means "nothing yet", never end of stream:
    /// end of stream is reported as an `ErrorKind::UnexpectedEof` error.
    fn read(&mut self, max_bytes: usize, deadline: Option<Instant>) -> io::Result<Vec<u8>>;

    /// Tear down the underlying stream, blocking until it is released.
    fn close(&mut self) -> io::Result<()>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        (**self).write(data)
    }

    fn read(&mut self, max_bytes: usize, deadline: Option<Instant>) -> io::Result<Vec<u8>> {
        (**self).read(max_bytes, deadline)
    }

    fn close(&mut self) -> io::Result<()> {
        (**self).close()
    }
}

fn end_of_stream() -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, "Connection closed by server")
}

type ShutdownHook = Box<dyn FnMut() -> io::Result<()> + Send>;

// =============================================================================
// Stream Transport
// =============================================================================

/// Transport over a blocking reader and writer.
pub struct StreamTransport {
    writer: Option<Box<dyn Write + Send>>,
    chunks: Receiver<io::Result<Vec<u8>>>,
    /// Bytes from a chunk larger than the caller's `max_bytes`.
    leftover: Vec<u8>,
    eof: bool,
    reader: Option<JoinHandle<()>>,
    shutdown: Option<ShutdownHook>,
}

impl StreamTransport {
    /// Wrap a reader/writer pair and start the reader thread.
    ///
    /// Without a [`with_shutdown`](Self::with_shutdown) hook, `close` only
    /// drops the writer: the reader thread keeps blocking until the peer
    /// ends the stream, and is detached rather than joined. Owners that can
    /// end the stream themselves (a child process exiting, a socket
    /// shutdown) should install a hook or join afterwards, as
    /// `ProcessTransport` does.
    pub fn new<R, W>(reader: R, writer: W) -> io::Result<Self>
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let handle = thread::Builder::new()
            .name("xaprun-reader".to_string())
            .spawn(move || Self::reader_thread(reader, tx))?;

        Ok(Self {
            writer: Some(Box::new(writer)),
            chunks: rx,
            leftover: Vec::new(),
            eof: false,
            reader: Some(handle),
            shutdown: None,
        })
    }

    /// Run `hook` on close to unblock the reader thread (e.g. socket shutdown).
    ///
    /// With a hook installed, `close` also joins the reader thread.
    pub fn with_shutdown<F>(mut self, hook: F) -> Self
    where
        F: FnMut() -> io::Result<()> + Send + 'static,
    {
        self.shutdown = Some(Box::new(hook));
        self
    }

    /// Transport over an already connected Unix stream.
    #[cfg(unix)]
    pub fn from_unix_stream(stream: std::os::unix::net::UnixStream) -> io::Result<Self> {
        let reader = stream.try_clone()?;
        let control = stream.try_clone()?;
        Ok(Self::new(reader, stream)?
            .with_shutdown(move || control.shutdown(std::net::Shutdown::Both)))
    }

    /// Connect to a server listening on a Unix domain socket.
    #[cfg(unix)]
    pub fn connect_unix(path: &Path) -> Result<Self, IpcError> {
        let stream =
            std::os::unix::net::UnixStream::connect(path).map_err(IpcError::ConnectionFailed)?;
        info!("Connected to {}", path.display());
        Self::from_unix_stream(stream).map_err(IpcError::ConnectionFailed)
    }

    /// Reader thread: forwards chunks until end of stream or a read error.
    ///
    /// Dropping the sender on exit is how end of stream reaches `read`.
    fn reader_thread<R: Read>(mut reader: R, tx: mpsc::Sender<io::Result<Vec<u8>>>) {
        let mut buf = vec![0u8; READER_CHUNK_SIZE];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => {
                    debug!("Reader reached end of stream");
                    return;
                }
                Ok(n) => {
                    if tx.send(Ok(buf[..n].to_vec())).is_err() {
                        return;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("Transport read failed: {}", e);
                    let _ = tx.send(Err(e));
                    return;
                }
            }
        }
    }

    fn take_leftover(&mut self, max_bytes: usize) -> Vec<u8> {
        if self.leftover.len() <= max_bytes {
            std::mem::take(&mut self.leftover)
        } else {
            let rest = self.leftover.split_off(max_bytes);
            std::mem::replace(&mut self.leftover, rest)
        }
    }

    /// Drop the write half so the peer sees end of input.
    fn close_writer(&mut self) -> io::Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        }
        Ok(())
    }

    fn join_reader(&mut self) {
        if let Some(handle) = self.reader.take() {
            if handle.join().is_err() {
                warn!("Reader thread panicked");
            }
        }
    }
}

impl Transport for StreamTransport {
    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        let writer = self.writer.as_mut().ok_or_else(|| {
            io::Error::new(io::ErrorKind::BrokenPipe, "Transport already closed")
        })?;
        writer.write_all(data)?;
        writer.flush()
    }

    fn read(&mut self, max_bytes: usize, deadline: Option<Instant>) -> io::Result<Vec<u8>> {
        if !self.leftover.is_empty() {
            return Ok(self.take_leftover(max_bytes));
        }
        if self.eof {
            return Err(end_of_stream());
        }

        let received = match deadline {
            None => self.chunks.recv().map_err(|_| RecvTimeoutError::Disconnected),
            Some(deadline) => self
                .chunks
                .recv_timeout(deadline.saturating_duration_since(Instant::now())),
        };

        match received {
            Ok(Ok(chunk)) => {
                self.leftover = chunk;
                Ok(self.take_leftover(max_bytes))
            }
            Ok(Err(e)) => {
                self.eof = true;
                Err(e)
            }
            Err(RecvTimeoutError::Timeout) => Ok(Vec::new()),
            Err(RecvTimeoutError::Disconnected) => {
                self.eof = true;
                Err(end_of_stream())
            }
        }
    }

    fn close(&mut self) -> io::Result<()> {
        let flushed = self.close_writer();
        if let Some(mut hook) = self.shutdown.take() {
            if let Err(e) = hook() {
                // Peer may already be gone
                debug!("Stream shutdown failed: {}", e);
            }
            self.join_reader();
        }
        flushed
    }
}

// =============================================================================
// Process Transport
// =============================================================================

/// Transport talking to a server process over its stdin/stdout.
///
/// The transport owns the child process; closing or dropping it closes the
/// server's stdin and waits for it to exit, killing it if it lingers.
pub struct ProcessTransport {
    stream: StreamTransport,
    child: Option<Child>,
}

impl ProcessTransport {
    /// Spawn `program` with `args`, piping stdin and stdout.
    ///
    /// # Errors
    ///
    /// Returns `IpcError::ConnectionFailed` if the process cannot be started.
    pub fn spawn<S: AsRef<str>>(program: &Path, args: &[S]) -> Result<Self, IpcError> {
        info!("Starting xaprun server: {}", program.display());

        let mut child = Command::new(program)
            .args(args.iter().map(|arg| AsRef::<str>::as_ref(arg)))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(IpcError::ConnectionFailed)?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(IpcError::ConnectionFailed(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "Failed to get stdio handles for xaprun server",
            )));
        };

        let stream = match StreamTransport::new(stdout, stdin) {
            Ok(stream) => stream,
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(IpcError::ConnectionFailed(e));
            }
        };

        debug!("xaprun server started (pid {})", child.id());
        Ok(Self {
            stream,
            child: Some(child),
        })
    }

    /// Process id of the server, while it is running.
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }

    fn wait_for_exit(child: &mut Child) -> io::Result<()> {
        for _ in 0..EXIT_POLL_ATTEMPTS {
            match child.try_wait()? {
                Some(status) => {
                    debug!("xaprun server exited: {}", status);
                    return Ok(());
                }
                None => thread::sleep(EXIT_POLL_INTERVAL),
            }
        }

        warn!("xaprun server didn't exit gracefully, killing");
        child.kill()?;
        child.wait()?;
        Ok(())
    }
}

impl Transport for ProcessTransport {
    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.stream.write(data)
    }

    fn read(&mut self, max_bytes: usize, deadline: Option<Instant>) -> io::Result<Vec<u8>> {
        self.stream.read(max_bytes, deadline)
    }

    fn close(&mut self) -> io::Result<()> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        if let Err(e) = self.stream.close_writer() {
            debug!("Failed to flush server stdin: {}", e);
        }
        let waited = Self::wait_for_exit(&mut child);
        // stdout is closed once the process is gone, so the reader ends
        self.stream.join_reader();
        info!("xaprun server stopped");
        waited
    }
}

impl Drop for ProcessTransport {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Error stopping xaprun server: {}", e);
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::os::unix::net::UnixStream;

    /// Test timeout to prevent hanging tests.
    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    fn deadline() -> Option<Instant> {
        Some(Instant::now() + TEST_TIMEOUT)
    }

    #[test]
    fn test_stream_read_returns_available_bytes() {
        let (client, mut server) = UnixStream::pair().expect("Failed to create socket pair");
        let mut transport = StreamTransport::from_unix_stream(client).unwrap();

        server.write_all(b"6 0 S0.1").unwrap();
        let mut received = Vec::new();
        while received.len() < 8 {
            received.extend(transport.read(1024, deadline()).unwrap());
        }
        assert_eq!(received, b"6 0 S0.1".to_vec());
        transport.close().unwrap();
    }

    #[test]
    fn test_stream_read_respects_max_bytes() {
        let (client, mut server) = UnixStream::pair().unwrap();
        let mut transport = StreamTransport::from_unix_stream(client).unwrap();

        server.write_all(b"abcdef").unwrap();
        let mut received = Vec::new();
        while received.len() < 6 {
            let chunk = transport.read(4, deadline()).unwrap();
            assert!(chunk.len() <= 4);
            received.extend(chunk);
        }
        assert_eq!(received, b"abcdef".to_vec());
    }

    #[test]
    fn test_stream_read_times_out_empty() {
        let (client, _server) = UnixStream::pair().unwrap();
        let mut transport = StreamTransport::from_unix_stream(client).unwrap();

        let start = Instant::now();
        let chunk = transport
            .read(1024, Some(Instant::now() + Duration::from_millis(50)))
            .unwrap();
        assert!(chunk.is_empty());
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn test_stream_end_is_an_error_not_empty() {
        let (client, server) = UnixStream::pair().unwrap();
        let mut transport = StreamTransport::from_unix_stream(client).unwrap();
        drop(server);

        let err = transport.read(1024, deadline()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
        // And stays that way
        let err = transport.read(1024, deadline()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_stream_write_after_close_fails() {
        let (client, _server) = UnixStream::pair().unwrap();
        let mut transport = StreamTransport::from_unix_stream(client).unwrap();
        transport.close().unwrap();

        let err = transport.write(b"11 0 Gversion ").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[test]
    fn test_close_with_shutdown_hook_joins_reader() {
        let (client, _server) = UnixStream::pair().unwrap();
        let mut transport = StreamTransport::from_unix_stream(client).unwrap();
        assert!(transport.reader.is_some());

        transport.close().unwrap();
        assert!(transport.reader.is_none());
    }

    #[test]
    fn test_close_without_hook_detaches_reader_until_peer_ends() {
        let (client, server) = UnixStream::pair().unwrap();
        let reader = client.try_clone().unwrap();
        let mut transport = StreamTransport::new(reader, client).unwrap();

        transport.close().unwrap();
        let handle = transport.reader.take().expect("reader still running");
        assert!(!handle.is_finished());

        drop(server);
        handle.join().unwrap();
    }

    #[test]
    fn test_spawn_missing_binary_fails_at_construction() {
        let result = ProcessTransport::spawn(Path::new("/nonexistent/xaprun"), &["--stdio"]);
        assert!(matches!(result, Err(IpcError::ConnectionFailed(_))));
    }

    #[test]
    fn test_process_transport_echoes_through_cat() {
        let Ok(mut transport) = ProcessTransport::spawn(Path::new("cat"), &[] as &[&str]) else {
            println!("Skipping process transport test (cat not available)");
            return;
        };
        assert!(transport.pid().is_some());

        transport.write(b"11 0 Gversion ").unwrap();
        let mut received = Vec::new();
        while received.len() < 14 {
            received.extend(transport.read(1024, deadline()).unwrap());
        }
        assert_eq!(received, b"11 0 Gversion ".to_vec());

        transport.close().unwrap();
        assert!(transport.pid().is_none());
        // Second close is a no-op
        transport.close().unwrap();
    }
}
