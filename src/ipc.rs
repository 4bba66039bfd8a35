//! Connection layer for talking to an xaprun server.
//!
//! This module owns everything between raw bytes and callbacks: framing,
//! request-id correlation, deadline-bounded polling and the single lock that
//! makes a connection safe to share between threads.
//!
//! # Architecture
//!
//! ```text
//!   caller ──send──► Connection ──encode──► framing ──write──► Transport ──► xaprun
//!                        │                                         │
//!   callback ◄─dispatch──┴──decode◄── FrameDecoder ◄──read─────────┘
//! ```
//!
//! `send` registers a callback under a fresh id and writes the request.
//! `check` reads until one complete response frame is decoded and runs the
//! callback registered under its id. `sendwait` loops on `check` until its
//! own response has arrived.
//!
//! # Protocol
//!
//! Length-prefixed frames, decimal length then a space:
//!
//! ```text
//! 11 0 Gversion        (request: id 0, GET "version", empty payload)
//! 6 0 S0.1             (response: id 0, plain text "0.1")
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use xaprun_client::config::ClientConfig;
//! use xaprun_client::ipc::{Connection, Method};
//!
//! let conn = Connection::spawn(&ClientConfig::default())?;
//! let response = conn.sendwait(Method::Get, "version", b"", None)?;
//! ```

mod connection;
mod error;
mod fake;
mod framing;
mod response;
mod transport;

pub use connection::{Callback, Connection, LocalConnection, DEFAULT_READ_CHUNK};
pub use error::IpcError;
pub use fake::{encode_response, FakeRequest, FakeServer, FakeTransport};
pub use framing::{decode_response, encode_request, FrameDecoder, Method, MAX_FRAME_SIZE};
pub use response::{Failure, FailureCode, Response, CONNECTION_CLOSED};
pub use transport::{ProcessTransport, StreamTransport, Transport};
