//! In-memory transport for tests.
//!
//! [`FakeTransport`] is handed to a `Connection`; the paired [`FakeServer`]
//! handle stays with the test and plays the server: it queues inbound bytes,
//! inspects what the client wrote, and can answer requests automatically.
//!
//! ```ignore
//! let (transport, server) = FakeTransport::new();
//! server.respond_with(|req| (req.target == "version").then(|| "S0.1".to_string()));
//! let conn = Connection::new(transport);
//! let response = conn.sendwait(Method::Get, "version", b"", None)?;
//! ```

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::warn;

use crate::ipc::framing::{FrameDecoder, Method};
use crate::ipc::transport::Transport;

/// How often a blocked read re-checks the inbound queue.
const POLL_INTERVAL: Duration = Duration::from_millis(1);

type Responder = Box<dyn FnMut(&FakeRequest) -> Option<String> + Send>;

/// A request frame as seen by the fake server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeRequest {
    pub id: String,
    pub method: Method,
    pub target: String,
    pub payload: Vec<u8>,
}

impl FakeRequest {
    /// Parse a request frame body (`<id> <method><target> <payload>`).
    pub fn parse(body: &[u8]) -> Option<Self> {
        let id_end = body.iter().position(|&b| b == b' ')?;
        let rest = &body[id_end + 1..];
        let (&code, rest) = rest.split_first()?;
        let target_end = rest.iter().position(|&b| b == b' ')?;
        Some(Self {
            id: String::from_utf8(body[..id_end].to_vec()).ok()?,
            method: Method::from_code(code)?,
            target: String::from_utf8(rest[..target_end].to_vec()).ok()?,
            payload: rest[target_end + 1..].to_vec(),
        })
    }
}

/// Frame a response the way the server does: `<len> <id> <tag><rest>`.
pub fn encode_response(id: &str, tagged_body: &[u8]) -> Vec<u8> {
    let len = id.len() + 1 + tagged_body.len();
    let mut frame = format!("{} {} ", len, id).into_bytes();
    frame.extend_from_slice(tagged_body);
    frame
}

#[derive(Default)]
struct FakeState {
    inbound: VecDeque<u8>,
    written: Vec<u8>,
    requests: Vec<FakeRequest>,
    decoder: FrameDecoder,
    responder: Option<Responder>,
    read_chunk: Option<usize>,
    close_calls: usize,
    reads: usize,
    eof: bool,
    fail_writes: bool,
}

fn lock(state: &Mutex<FakeState>) -> MutexGuard<'_, FakeState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Client half of the fake: implements [`Transport`].
pub struct FakeTransport {
    state: Arc<Mutex<FakeState>>,
}

/// Test half of the fake: scripts what the client reads.
#[derive(Clone)]
pub struct FakeServer {
    state: Arc<Mutex<FakeState>>,
}

impl FakeTransport {
    pub fn new() -> (FakeTransport, FakeServer) {
        let state = Arc::new(Mutex::new(FakeState::default()));
        (
            FakeTransport {
                state: Arc::clone(&state),
            },
            FakeServer { state },
        )
    }

    fn take_inbound(state: &mut FakeState, max_bytes: usize) -> Vec<u8> {
        let limit = state.read_chunk.unwrap_or(usize::MAX).min(max_bytes);
        let n = limit.min(state.inbound.len());
        state.inbound.drain(..n).collect()
    }
}

impl Transport for FakeTransport {
    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        let mut guard = lock(&self.state);
        let state = &mut *guard;
        if state.fail_writes {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "fake write failure"));
        }
        state.written.extend_from_slice(data);
        state.decoder.push(data);

        while let Some(body) = state
            .decoder
            .next_frame()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?
        {
            let Some(request) = FakeRequest::parse(&body) else {
                warn!("Fake server got an unparseable request frame");
                continue;
            };
            if let Some(responder) = state.responder.as_mut() {
                if let Some(reply) = responder(&request) {
                    state
                        .inbound
                        .extend(encode_response(&request.id, reply.as_bytes()));
                }
            }
            state.requests.push(request);
        }
        Ok(())
    }

    fn read(&mut self, max_bytes: usize, deadline: Option<Instant>) -> io::Result<Vec<u8>> {
        loop {
            {
                let mut state = lock(&self.state);
                state.reads += 1;
                if !state.inbound.is_empty() {
                    return Ok(Self::take_inbound(&mut state, max_bytes));
                }
                if state.eof {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "fake server closed the stream",
                    ));
                }
            }

            let Some(deadline) = deadline else {
                // Nothing will ever arrive; fail instead of hanging the test
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "fake transport has no data and no deadline",
                ));
            };
            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            thread::sleep(POLL_INTERVAL.min(deadline - now));
        }
    }

    fn close(&mut self) -> io::Result<()> {
        lock(&self.state).close_calls += 1;
        Ok(())
    }
}

impl FakeServer {
    /// Queue raw bytes for the client to read.
    pub fn push_bytes(&self, data: &[u8]) {
        lock(&self.state).inbound.extend(data.iter().copied());
    }

    /// Queue a framed response, e.g. `push_response("0", "S0.1")`.
    pub fn push_response(&self, id: &str, tagged_body: &str) {
        self.push_bytes(&encode_response(id, tagged_body.as_bytes()));
    }

    /// Answer every subsequent request with the tagged body `f` returns.
    ///
    /// Returning `None` leaves the request unanswered.
    pub fn respond_with<F>(&self, f: F)
    where
        F: FnMut(&FakeRequest) -> Option<String> + Send + 'static,
    {
        lock(&self.state).responder = Some(Box::new(f));
    }

    /// Hand out at most `n` bytes per read, to exercise partial frames.
    pub fn set_read_chunk(&self, n: usize) {
        lock(&self.state).read_chunk = Some(n.max(1));
    }

    /// Report end of stream once the inbound queue drains.
    pub fn hang_up(&self) {
        lock(&self.state).eof = true;
    }

    /// Make every subsequent write fail.
    pub fn fail_writes(&self) {
        lock(&self.state).fail_writes = true;
    }

    /// Everything the client has written so far.
    pub fn written(&self) -> Vec<u8> {
        lock(&self.state).written.clone()
    }

    /// Requests decoded from the client's writes, in order.
    pub fn requests(&self) -> Vec<FakeRequest> {
        lock(&self.state).requests.clone()
    }

    pub fn close_calls(&self) -> usize {
        lock(&self.state).close_calls
    }

    /// Number of `read` attempts made by the client (including polls).
    pub fn reads(&self) -> usize {
        lock(&self.state).reads
    }

    pub fn inbound_len(&self) -> usize {
        lock(&self.state).inbound.len()
    }
}
