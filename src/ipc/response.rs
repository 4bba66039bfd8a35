//! Response values delivered to request callbacks.
//!
//! A response is a closed set of outcomes: plain text, a structured JSON
//! document, or a failure. Failures are data, never panics; callers that
//! prefer `?` can convert them with [`Response::check`].

use std::fmt;

use serde_json::Value;

use crate::ipc::error::IpcError;

/// Message used for every failure synthesized by closing a connection.
pub const CONNECTION_CLOSED: &str = "Connection closed";

/// Why a request failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureCode {
    /// The connection was closed before (or while) the request was pending.
    ConnectionClosed,
    /// The request bytes could not be written to the transport.
    Transport,
    /// The response frame carried an id but no tag.
    EmptyResponse,
    /// The response tag was not one this client understands.
    UnknownTag,
    /// The response body could not be decoded (bad JSON or non-UTF-8 text).
    Malformed,
    /// The server reported an error (`E` tag, or a document with `ok != 1`).
    Server,
}

impl FailureCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCode::ConnectionClosed => "connection-closed",
            FailureCode::Transport => "transport",
            FailureCode::EmptyResponse => "empty-response",
            FailureCode::UnknownTag => "unknown-tag",
            FailureCode::Malformed => "malformed",
            FailureCode::Server => "server",
        }
    }
}

impl fmt::Display for FailureCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed request: a code plus a human-readable message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub code: FailureCode,
    pub message: String,
}

impl Failure {
    pub fn new(code: FailureCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// The failure handed to every callback when the connection closes.
    pub fn connection_closed() -> Self {
        Self::new(FailureCode::ConnectionClosed, CONNECTION_CLOSED)
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}

/// Outcome of a single request.
///
/// `Text` comes from an `S` tagged frame, `Document` from a `J` tagged frame.
/// Everything else, including synthetic results produced locally when the
/// connection closes, is a `Failure`.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Text(String),
    Document(Value),
    Failure(Failure),
}

impl Response {
    pub fn failure(code: FailureCode, message: impl Into<String>) -> Self {
        Response::Failure(Failure::new(code, message))
    }

    pub fn is_success(&self) -> bool {
        !matches!(self, Response::Failure(_))
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Response::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_document(&self) -> Option<&Value> {
        match self {
            Response::Document(doc) => Some(doc),
            _ => None,
        }
    }

    pub fn as_failure(&self) -> Option<&Failure> {
        match self {
            Response::Failure(failure) => Some(failure),
            _ => None,
        }
    }

    /// Turn application-level failures into an error.
    ///
    /// Returns `IpcError::Server` for a `Failure`, and for a document whose
    /// `ok` field is present but not `1`; the document's `msg` field becomes
    /// the error message. Successful responses pass through unchanged.
    pub fn check(self) -> Result<Response, IpcError> {
        match self {
            Response::Failure(failure) => Err(IpcError::Server {
                code: failure.code,
                message: failure.message,
            }),
            Response::Document(doc) => {
                if doc.get("ok").and_then(Value::as_i64) != Some(1) {
                    let message = doc
                        .get("msg")
                        .and_then(Value::as_str)
                        .unwrap_or("Unspecified error in server")
                        .to_string();
                    return Err(IpcError::Server {
                        code: FailureCode::Server,
                        message,
                    });
                }
                Ok(Response::Document(doc))
            }
            text => Ok(text),
        }
    }

    /// Check the response and pull a single item out of it.
    ///
    /// A text response is its own `msg` item; for documents the named key
    /// is looked up and cloned.
    pub fn item(self, key: &str) -> Result<Value, IpcError> {
        match self.check()? {
            Response::Text(text) if key == "msg" => Ok(Value::String(text)),
            Response::Document(mut doc) => doc
                .get_mut(key)
                .map(Value::take)
                .ok_or_else(|| {
                    IpcError::Protocol(format!("Expected key '{}' missing from response", key))
                }),
            _ => Err(IpcError::Protocol(format!(
                "Expected key '{}' missing from response",
                key
            ))),
        }
    }
}
