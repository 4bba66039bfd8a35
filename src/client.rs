//! Document-store API over a [`Connection`].
//!
//! Every call here is a blocking `sendwait` followed by [`Response::check`],
//! so server-side failures surface as `IpcError::Server`.
//!
//! | Call | Request |
//! |------|---------|
//! | `version()` | `GET version` |
//! | `db(n).insert(doc)` | `PUT db/<n>/docs` |
//! | `db(n).get(id)` | `GET db/<n>/docs/<id>` |
//! | `db(n).delete(id)` | `DELETE db/<n>/docs/<id>` |
//! | `db(n).schema()` | `GET db/<n>/schema` |
//! | `db(n).set_schema(s)` | `PUT db/<n>/schema` |

use std::time::Duration;

use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::config::{ClientConfig, DEFAULT_TIMEOUT_SECS};
use crate::ipc::{Connection, IpcError, Method, ProcessTransport, Response, Transport};

/// Base used only to borrow the URL path-segment encoder.
const TARGET_BASE: &str = "xaprun:///";

/// Join path components into a request target, percent-escaping each one.
///
/// The result never contains a literal space. `.` and `..` components are
/// rejected with `IpcError::InvalidTarget`, since the URL path encoder would
/// otherwise drop or resolve them.
pub fn build_target(components: &[&str]) -> Result<String, IpcError> {
    if let Some(dot) = components.iter().find(|c| matches!(**c, "." | "..")) {
        return Err(IpcError::InvalidTarget(format!(
            "{} (dot segment {:?})",
            components.join("/"),
            dot
        )));
    }
    let mut url =
        Url::parse(TARGET_BASE).map_err(|e| IpcError::InvalidTarget(e.to_string()))?;
    url.path_segments_mut()
        .map_err(|_| IpcError::InvalidTarget(components.join("/")))?
        .pop_if_empty()
        .extend(components);
    Ok(url.path().trim_start_matches('/').to_string())
}

/// Blocking client for the xaprun document server.
pub struct Client<T: Transport = ProcessTransport> {
    conn: Connection<T>,
    timeout: Option<Duration>,
}

impl Client<ProcessTransport> {
    /// Start the configured server and connect to it.
    pub fn spawn(config: &ClientConfig) -> Result<Self, IpcError> {
        Ok(Self::new(Connection::spawn(config)?).with_timeout(config.timeout()))
    }
}

impl<T: Transport> Client<T> {
    pub fn new(conn: Connection<T>) -> Self {
        Self {
            conn,
            timeout: Some(Duration::from_secs(DEFAULT_TIMEOUT_SECS)),
        }
    }

    /// Set the per-request timeout; `None` waits indefinitely.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// The underlying connection, for asynchronous `send`/`check` use.
    pub fn connection(&self) -> &Connection<T> {
        &self.conn
    }

    /// Send one request and check the response for application errors.
    pub fn request(
        &self,
        method: Method,
        target: &str,
        payload: &[u8],
    ) -> Result<Response, IpcError> {
        debug!("{} {}", method, target);
        self.conn
            .sendwait(method, target, payload, self.timeout)?
            .check()
    }

    /// Server version string.
    pub fn version(&self) -> Result<String, IpcError> {
        let msg = self.request(Method::Get, "version", b"")?.item("msg")?;
        as_string(msg, "msg")
    }

    /// Handle on a named database.
    pub fn db(&self, name: &str) -> Database<'_, T> {
        Database {
            client: self,
            name: name.to_string(),
        }
    }
}

/// A database on the server, addressed by name.
pub struct Database<'a, T: Transport> {
    client: &'a Client<T>,
    name: String,
}

impl<T: Transport> Database<'_, T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    fn target(&self, rest: &[&str]) -> Result<String, IpcError> {
        let mut components = vec!["db", self.name.as_str()];
        components.extend_from_slice(rest);
        build_target(&components)
    }

    /// Store a document and return the id the server assigned.
    pub fn insert(&self, doc: &Value) -> Result<String, IpcError> {
        let target = self.target(&["docs"])?;
        let payload = doc.to_string();
        let docid = self
            .client
            .request(Method::Put, &target, payload.as_bytes())?
            .item("docid")?;
        as_string(docid, "docid")
    }

    /// Fetch a document by id.
    pub fn get(&self, docid: &str) -> Result<Value, IpcError> {
        let target = self.target(&["docs", docid])?;
        self.client.request(Method::Get, &target, b"")?.item("doc")
    }

    /// Remove a document by id.
    pub fn delete(&self, docid: &str) -> Result<(), IpcError> {
        let target = self.target(&["docs", docid])?;
        self.client.request(Method::Delete, &target, b"")?;
        Ok(())
    }

    /// Current schema of the database.
    pub fn schema(&self) -> Result<Value, IpcError> {
        let target = self.target(&["schema"])?;
        self.client.request(Method::Get, &target, b"")?.item("schema")
    }

    /// Replace the schema of the database.
    pub fn set_schema(&self, schema: &Value) -> Result<(), IpcError> {
        let target = self.target(&["schema"])?;
        let payload = schema.to_string();
        self.client
            .request(Method::Put, &target, payload.as_bytes())?;
        Ok(())
    }
}

fn as_string(value: Value, key: &str) -> Result<String, IpcError> {
    match value {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(IpcError::Protocol(format!(
            "Expected '{}' to be a string, got {}",
            key, other
        ))),
    }
}
