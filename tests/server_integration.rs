//! Integration tests against a real xaprun server.
//!
//! The server is started over stdio for each test, exactly as the CLI does.
//!
//! # Requirements
//!
//! Point `XAPRUN_PATH` at a server binary. Without it every test here
//! returns early.
//!
//! # Running
//!
//! ```bash
//! XAPRUN_PATH=/usr/local/bin/xaprun cargo test --test server_integration -- --nocapture
//! ```

use std::time::Duration;

use serde_json::json;

use xaprun_client::client::Client;
use xaprun_client::config::{ClientConfig, ENV_SERVER_PATH};
use xaprun_client::ipc::{Connection, IpcError, Method, Response};

/// Config for the server named by `XAPRUN_PATH`, if set.
fn server_config() -> Option<ClientConfig> {
    if std::env::var(ENV_SERVER_PATH).is_err() {
        eprintln!("Skipping: {} not set", ENV_SERVER_PATH);
        return None;
    }
    ClientConfig::default()
        .with_env(|key| std::env::var(key).ok())
        .ok()
        .map(|config| ClientConfig {
            timeout_secs: 10,
            ..config
        })
}

/// Database name unique to this test run.
fn test_db(test_name: &str) -> String {
    format!("xaprun-client-test-{}-{}", test_name, std::process::id())
}

#[test]
fn test_version() {
    let Some(config) = server_config() else {
        return;
    };
    let client = Client::spawn(&config).expect("Failed to start server");
    let version = client.version().expect("version request failed");
    assert!(!version.is_empty());
    println!("Server version: {}", version);
}

#[test]
fn test_document_lifecycle() {
    let Some(config) = server_config() else {
        return;
    };
    let client = Client::spawn(&config).expect("Failed to start server");
    let db = client.db(&test_db("lifecycle"));

    let docid = db.insert(&json!({"text": "hello world"})).unwrap();
    let doc = db.get(&docid).unwrap();
    assert!(doc.is_object());

    db.delete(&docid).unwrap();
    assert!(matches!(db.get(&docid), Err(IpcError::Server { .. })));
}

#[test]
fn test_pipelined_requests() {
    let Some(config) = server_config() else {
        return;
    };
    let conn = Connection::spawn(&config).expect("Failed to start server");

    let (tx, rx) = std::sync::mpsc::channel();
    for _ in 0..5 {
        let tx = tx.clone();
        conn.send(Method::Get, "version", b"", move |response| {
            let _ = tx.send(response);
        })
        .unwrap();
    }
    for _ in 0..5 {
        assert!(conn.check(Some(Duration::from_secs(10))).unwrap());
    }

    let responses: Vec<Response> = rx.try_iter().collect();
    assert_eq!(responses.len(), 5);
    assert!(responses.iter().all(Response::is_success));
    conn.close().unwrap();
}
