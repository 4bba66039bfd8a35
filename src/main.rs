//! xaprun-client - command-line access to an xaprun server.
//!
//! Spawns the server over stdio, sends one request and prints the result.
//!
//! ```text
//! xaprun-client [--config PATH] [--server PATH] [--timeout SECS] <command>
//!
//! commands:
//!   version                       print the server version
//!   insert <db> <json>            store a document, print its id
//!   get <db> <docid>              print a document
//!   delete <db> <docid>           remove a document
//!   schema <db> [json]            print or replace the schema
//!   raw <method> <target> [body]  send a raw request, print the response
//! ```

use std::path::PathBuf;

use anyhow::{anyhow, bail, Context, Result};
use serde_json::Value;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use xaprun_client::client::Client;
use xaprun_client::config::ClientConfig;
use xaprun_client::ipc::{Method, Response};

const USAGE: &str = "usage: xaprun-client [--config PATH] [--server PATH] [--timeout SECS] \
<version | insert DB JSON | get DB DOCID | delete DB DOCID | schema DB [JSON] | raw METHOD TARGET [BODY]>";

/// Parsed command line.
#[derive(Debug, Default)]
struct Args {
    config: Option<PathBuf>,
    server: Option<PathBuf>,
    timeout_secs: Option<u64>,
    command: Vec<String>,
}

fn parse_args(mut raw: impl Iterator<Item = String>) -> Result<Args> {
    let mut args = Args::default();
    while let Some(arg) = raw.next() {
        match arg.as_str() {
            "--config" => {
                args.config = Some(raw.next().context("--config needs a path")?.into());
            }
            "--server" => {
                args.server = Some(raw.next().context("--server needs a path")?.into());
            }
            "--timeout" => {
                let secs = raw.next().context("--timeout needs a value")?;
                args.timeout_secs = Some(
                    secs.parse()
                        .with_context(|| format!("Invalid timeout: {}", secs))?,
                );
            }
            "-h" | "--help" => bail!(USAGE),
            _ => {
                args.command.push(arg);
                args.command.extend(raw.by_ref());
            }
        }
    }
    if args.command.is_empty() {
        bail!(USAGE);
    }
    Ok(args)
}

fn parse_json(text: &str) -> Result<Value> {
    serde_json::from_str(text).with_context(|| format!("Invalid JSON: {}", text))
}

fn print_response(response: &Response) -> Result<()> {
    match response {
        Response::Text(text) => println!("{}", text),
        Response::Document(doc) => println!("{}", serde_json::to_string_pretty(doc)?),
        Response::Failure(failure) => bail!("{}", failure),
    }
    Ok(())
}

fn run(client: &Client, command: &[String]) -> Result<()> {
    let arg = |i: usize| {
        command
            .get(i)
            .map(String::as_str)
            .ok_or_else(|| anyhow!(USAGE))
    };

    match arg(0)? {
        "version" => println!("{}", client.version()?),
        "insert" => {
            let doc = parse_json(arg(2)?)?;
            println!("{}", client.db(arg(1)?).insert(&doc)?);
        }
        "get" => {
            let doc = client.db(arg(1)?).get(arg(2)?)?;
            println!("{}", serde_json::to_string_pretty(&doc)?);
        }
        "delete" => client.db(arg(1)?).delete(arg(2)?)?,
        "schema" => {
            let db = client.db(arg(1)?);
            match command.get(2) {
                Some(json) => db.set_schema(&parse_json(json)?)?,
                None => println!("{}", serde_json::to_string_pretty(&db.schema()?)?),
            }
        }
        "raw" => {
            let method =
                Method::parse(arg(1)?).ok_or_else(|| anyhow!("Unknown method: {}", command[1]))?;
            let body = command.get(3).map(String::as_str).unwrap_or("");
            let response = client.connection().sendwait(
                method,
                arg(2)?,
                body.as_bytes(),
                client.timeout(),
            )?;
            print_response(&response)?;
        }
        other => bail!("Unknown command: {}\n{}", other, USAGE),
    }
    Ok(())
}

fn main() -> Result<()> {
    // Initialize logging (stderr, so command output stays clean)
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "xaprun_client=info".into()),
        ))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let args = parse_args(std::env::args().skip(1))?;

    let mut config = ClientConfig::resolve(args.config.as_deref())?;
    if let Some(server) = args.server {
        config.server_path = server;
    }
    if let Some(secs) = args.timeout_secs {
        config.timeout_secs = secs;
    }
    tracing::info!("xaprun-client v{}", env!("CARGO_PKG_VERSION"));

    let client = Client::spawn(&config)
        .with_context(|| format!("Couldn't start {}", config.server_path.display()))?;
    let result = run(&client, &args.command);

    if let Err(e) = client.connection().close() {
        tracing::warn!("Error closing connection: {}", e);
    }
    result
}
