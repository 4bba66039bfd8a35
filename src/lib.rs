//! xaprun client library
//!
//! This library talks to an xaprun document server over its length-prefixed
//! request/response protocol:
//!
//! - `ipc` - Connection core: framing, request-id correlation, transports
//! - `client` - Blocking document-store API (version, insert, get, schema)
//! - `config` - Client configuration from file and environment
//!
//! # Quick start
//!
//! ```ignore
//! use xaprun_client::client::Client;
//! use xaprun_client::config::ClientConfig;
//!
//! let config = ClientConfig::resolve(None)?;
//! let client = Client::spawn(&config)?;
//! println!("server version {}", client.version()?);
//! ```

pub mod client;
pub mod config;
pub mod ipc;
