//! Request/response correlation over a single transport.
//!
//! A [`Connection`] assigns every request a fresh decimal id, remembers the
//! callback waiting on it, and dispatches each decoded response frame to the
//! callback with the matching id. Responses may therefore arrive in any
//! order relative to requests.
//!
//! # Locking
//!
//! All connection state (pending table, id counter, read buffer, closed flag
//! and the transport itself) sits behind one mutex, held for the whole of
//! every public operation, including while blocked on transport I/O. Only one
//! call is ever inside the connection. This caps throughput at one in-flight
//! I/O operation per connection, which is plenty for a single local server.
//!
//! Callbacks run with the lock held: they must not call back into the same
//! connection.
//!
//! # Abandoned requests
//!
//! There is no cancellation. A request whose caller stops polling stays in the
//! pending table until its response arrives or the connection closes.

use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::ipc::error::IpcError;
use crate::ipc::framing::{decode_response, encode_request, FrameDecoder, Method};
use crate::ipc::response::{Failure, FailureCode, Response};
use crate::ipc::transport::{ProcessTransport, Transport};

/// Default number of bytes requested from the transport per read.
pub const DEFAULT_READ_CHUNK: usize = 1024;

/// Callback invoked exactly once with the outcome of a request.
pub type Callback = Box<dyn FnOnce(Response) + Send>;

/// Connection to a server process spawned over stdio.
pub type LocalConnection = Connection<ProcessTransport>;

/// Everything guarded by the connection lock.
struct Inner<T> {
    transport: T,
    /// Callbacks keyed by the id text exactly as written on the wire.
    pending: HashMap<String, Callback>,
    next_id: u64,
    decoder: FrameDecoder,
    closed: bool,
}

/// Thread-safe client connection.
///
/// All methods take `&self`; share a connection between threads with `Arc`.
///
/// # Example
///
/// ```ignore
/// use xaprun_client::ipc::{Connection, Method, Response};
///
/// let conn = Connection::spawn(&config)?;
/// conn.send(Method::Get, "version", b"", |response| println!("{:?}", response))?;
/// conn.check(Some(Duration::from_secs(1)))?;
/// ```
pub struct Connection<T: Transport> {
    inner: Mutex<Inner<T>>,
    read_chunk: usize,
}

impl Connection<ProcessTransport> {
    /// Start the configured server binary and connect to it over stdio.
    ///
    /// # Errors
    ///
    /// Returns `IpcError::ConnectionFailed` if the server cannot be started.
    pub fn spawn(config: &ClientConfig) -> Result<Self, IpcError> {
        let transport = ProcessTransport::spawn(&config.server_path, &config.server_args)?;
        Ok(Self::new(transport).with_read_chunk(config.read_chunk))
    }
}

impl<T: Transport> Connection<T> {
    pub fn new(transport: T) -> Self {
        Self {
            inner: Mutex::new(Inner {
                transport,
                pending: HashMap::new(),
                next_id: 0,
                decoder: FrameDecoder::new(),
                closed: false,
            }),
            read_chunk: DEFAULT_READ_CHUNK,
        }
    }

    /// Set the maximum number of bytes requested per transport read.
    pub fn with_read_chunk(mut self, read_chunk: usize) -> Self {
        self.read_chunk = read_chunk.max(1);
        self
    }

    /// Acquire the connection lock.
    ///
    /// A panicking callback poisons the mutex; the state it guards is still
    /// consistent because entries are removed before their callback runs.
    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Send a request; `callback` later receives its response.
    ///
    /// `target` must already be escaped and contain no spaces. May block
    /// while the transport drains.
    ///
    /// If the connection is closed, `callback` runs immediately with a
    /// "Connection closed" failure and nothing is written.
    ///
    /// # Errors
    ///
    /// - `IpcError::InvalidTarget` if `target` contains a space; the callback
    ///   is dropped without being registered.
    /// - `IpcError::Io` if the write fails. The callback has already received
    ///   a `Transport` failure and the connection is closed.
    pub fn send<F>(
        &self,
        method: Method,
        target: &str,
        payload: &[u8],
        callback: F,
    ) -> Result<(), IpcError>
    where
        F: FnOnce(Response) + Send + 'static,
    {
        if target.contains(' ') {
            return Err(IpcError::InvalidTarget(target.to_string()));
        }

        let mut inner = self.lock();
        if inner.closed {
            callback(Response::Failure(Failure::connection_closed()));
            return Ok(());
        }

        let id = inner.next_id.to_string();
        inner.next_id += 1;
        let frame = encode_request(&id, method, target, payload);
        inner.pending.insert(id.clone(), Box::new(callback));
        debug!("Sending request {} {} {} ({} bytes)", id, method, target, payload.len());

        if let Err(e) = inner.transport.write(&frame) {
            warn!("Failed to send request {}: {}", id, e);
            if let Some(callback) = inner.pending.remove(&id) {
                callback(Response::failure(
                    FailureCode::Transport,
                    format!("Failed to send request: {}", e),
                ));
            }
            if let Err(close_err) = Self::shutdown(&mut inner) {
                debug!("Transport close after write failure: {}", close_err);
            }
            return Err(IpcError::Io(e));
        }
        Ok(())
    }

    /// Wait up to `timeout` for one response and dispatch it.
    ///
    /// Returns `Ok(true)` if a callback ran, `Ok(false)` if the time ran out
    /// first. Partially received frames stay buffered for the next call.
    /// `None` waits indefinitely. The transport is always polled at least
    /// once, so a zero timeout still picks up data that is already waiting.
    ///
    /// # Errors
    ///
    /// - `IpcError::Protocol` if the stream is desynchronized (bad length
    ///   prefix, missing id, or a response for an unknown id). No callback
    ///   runs; the connection should be rebuilt.
    /// - `IpcError::ConnectionLost` if the server closed the stream. The
    ///   connection closes and every pending callback receives a
    ///   "Connection closed" failure.
    pub fn check(&self, timeout: Option<Duration>) -> Result<bool, IpcError> {
        let deadline = deadline_after(timeout);
        let mut inner = self.lock();
        self.poll_one(&mut inner, deadline)
    }

    /// Send a request and block until its response arrives.
    ///
    /// `timeout` bounds the whole call: one deadline is computed up front and
    /// shared by every poll, so responses to other requests dispatched along
    /// the way do not extend the wait. Like `check`, the transport is
    /// polled at least once, so a zero timeout still picks up a reply that
    /// is already waiting.
    ///
    /// # Errors
    ///
    /// - `IpcError::Timeout` when the deadline passes first. The request
    ///   stays pending; its response is discarded when it arrives.
    /// - Any error from [`send`](Self::send) or [`check`](Self::check).
    pub fn sendwait(
        &self,
        method: Method,
        target: &str,
        payload: &[u8],
        timeout: Option<Duration>,
    ) -> Result<Response, IpcError> {
        let deadline = deadline_after(timeout);
        let (tx, rx) = mpsc::channel();
        self.send(method, target, payload, move |response| {
            let _ = tx.send(response);
        })?;

        let mut polled = false;
        loop {
            // The slot is inspected under the lock, so a response dispatched
            // by another thread's check cannot slip past unnoticed.
            let mut inner = self.lock();
            if let Ok(response) = rx.try_recv() {
                return Ok(response);
            }
            if let (true, Some(deadline), Some(timeout)) = (polled, deadline, timeout) {
                if Instant::now() >= deadline {
                    debug!("Request {} {} timed out after {:?}", method, target, timeout);
                    return Err(IpcError::Timeout(timeout));
                }
            }
            self.poll_one(&mut inner, deadline)?;
            polled = true;
        }
    }

    /// Close the connection. Idempotent.
    ///
    /// The first call closes the transport, then fails every pending
    /// callback with "Connection closed". Later calls do nothing.
    ///
    /// # Errors
    ///
    /// Returns the transport's close error, if any. The connection is closed
    /// and all callbacks have run regardless.
    pub fn close(&self) -> Result<(), IpcError> {
        let mut inner = self.lock();
        Self::shutdown(&mut inner).map_err(IpcError::Io)
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Number of requests still waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    /// Bytes read from the transport but not yet consumed as a frame.
    pub fn buffered_bytes(&self) -> usize {
        self.lock().decoder.buffered()
    }

    /// Dispatch at most one response, reading until `deadline` if needed.
    fn poll_one(&self, inner: &mut Inner<T>, deadline: Option<Instant>) -> Result<bool, IpcError> {
        if inner.closed {
            return Ok(false);
        }

        let mut polled = false;
        loop {
            let frame = inner.decoder.next_frame().inspect_err(|e| {
                warn!("Framing error: {}", e);
            })?;
            if let Some(frame) = frame {
                let (id, response) = decode_response(&frame)?;
                let Some(callback) = inner.pending.remove(&id) else {
                    warn!("Response for unknown message id {:?}", id);
                    return Err(IpcError::Protocol(format!(
                        "Response for unknown message id ({:?})",
                        id
                    )));
                };
                debug!("Dispatching response for request {}", id);
                callback(response);
                return Ok(true);
            }

            if polled && deadline.is_some_and(|d| Instant::now() >= d) {
                return Ok(false);
            }

            let chunk = match inner.transport.read(self.read_chunk, deadline) {
                Ok(chunk) => chunk,
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    warn!("Server closed the stream with {} requests pending", inner.pending.len());
                    if let Err(close_err) = Self::shutdown(inner) {
                        debug!("Transport close after end of stream: {}", close_err);
                    }
                    return Err(IpcError::ConnectionLost);
                }
                Err(e) => return Err(IpcError::Io(e)),
            };
            polled = true;
            inner.decoder.push(&chunk);
        }
    }

    /// Close the transport and fail everything still pending, once.
    fn shutdown(inner: &mut Inner<T>) -> std::io::Result<()> {
        if inner.closed {
            return Ok(());
        }
        inner.closed = true;
        let result = inner.transport.close();

        let mut pending: Vec<(String, Callback)> = inner.pending.drain().collect();
        // Fail in issue order
        pending.sort_by(|(a, _), (b, _)| a.len().cmp(&b.len()).then_with(|| a.cmp(b)));
        if !pending.is_empty() {
            info!("Failing {} pending requests: connection closed", pending.len());
        }
        for (_, callback) in pending {
            callback(Response::Failure(Failure::connection_closed()));
        }
        result
    }
}

impl<T: Transport> Drop for Connection<T> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Error closing connection: {}", e);
        }
    }
}

/// Absolute deadline for a relative timeout; `None` waits forever.
fn deadline_after(timeout: Option<Duration>) -> Option<Instant> {
    timeout.and_then(|t| Instant::now().checked_add(t))
}
