//! The management protocol: JSON request/response envelopes carried over
//! the admin Unix socket (and, optionally, a SCRAM-SHA-256-gated remote TCP
//! listener), serving `pgrelay-cli`.
//!
//! Wire shape: `{"header": {"command": "..."}, "request": {...}}` in,
//! `{"header": {"command": "...", "success": bool}, "response": {...}}` out
//! — one JSON line per request/response, grounded in `sqlx_cli`'s
//! subcommand split (`examples/launchbadge-sqlx/sqlx-cli/src/opt.rs`) for
//! the *set* of administrative verbs, re-expressed as a wire protocol since
//! pgrelay's management interface talks to an already-running daemon
//! rather than spawning a one-shot process.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tracing::{info, warn};

use pgrelay_core::auth::scram;
use pgrelay_core::metrics::RegistryMetrics;
use pgrelay_core::model::UserTable;

use crate::supervisor::Supervisor;

#[derive(Debug, Deserialize)]
struct RequestEnvelope {
    header: RequestHeader,
    #[serde(default)]
    request: Value,
}

#[derive(Debug, Deserialize)]
struct RequestHeader {
    command: String,
}

#[derive(Debug, Serialize)]
struct ResponseEnvelope {
    header: ResponseHeader,
    response: Value,
}

#[derive(Debug, Serialize)]
struct ResponseHeader {
    command: String,
    success: bool,
}

/// One administrative request, parsed out of a [`RequestEnvelope`]'s
/// `header.command` + `request` fields.
#[derive(Debug)]
pub enum Command {
    Flush { database: Option<String> },
    EnableDb { database: String },
    DisableDb { database: String },
    Gracefully,
    Shutdown,
    CancelShutdown,
    Status,
    Details,
    Ping,
    Clear { database: Option<String> },
    ClearServer { server: String },
    SwitchTo { server: String },
    Reload,
    ConfigLs,
    ConfigGet { key: String },
    ConfigSet { key: String, value: String },
    ConfigAlias { alias: String, key: String },
    GetPassword { username: String },
}

impl Command {
    fn parse(command: &str, request: &Value) -> Result<Command> {
        let field = |name: &str| -> Option<String> {
            request.get(name).and_then(Value::as_str).map(str::to_owned)
        };
        let require = |name: &str| -> Result<String> {
            field(name).ok_or_else(|| anyhow::anyhow!("request missing field {name:?}"))
        };

        Ok(match command {
            "FLUSH" => Command::Flush { database: field("database") },
            "ENABLEDB" => Command::EnableDb { database: require("database")? },
            "DISABLEDB" => Command::DisableDb { database: require("database")? },
            "GRACEFULLY" => Command::Gracefully,
            "SHUTDOWN" => Command::Shutdown,
            "CANCEL_SHUTDOWN" => Command::CancelShutdown,
            "STATUS" => Command::Status,
            "DETAILS" => Command::Details,
            "PING" => Command::Ping,
            "CLEAR" => Command::Clear { database: field("database") },
            "CLEAR_SERVER" => Command::ClearServer { server: require("server")? },
            "SWITCH_TO" => Command::SwitchTo { server: require("server")? },
            "RELOAD" => Command::Reload,
            "CONFIG_LS" => Command::ConfigLs,
            "CONFIG_GET" => Command::ConfigGet { key: require("key")? },
            "CONFIG_SET" => Command::ConfigSet {
                key: require("key")?,
                value: require("value")?,
            },
            "CONFIG_ALIAS" => Command::ConfigAlias {
                alias: require("alias")?,
                key: require("key")?,
            },
            "GET_PASSWORD" => Command::GetPassword { username: require("username")? },
            other => bail!("unknown management command {other:?}"),
        })
    }

}

struct Outcome {
    success: bool,
    body: Value,
}

impl Outcome {
    fn ok() -> Self {
        Outcome { success: true, body: json!({}) }
    }

    fn ok_message(message: impl Into<String>) -> Self {
        Outcome {
            success: true,
            body: json!({ "message": message.into() }),
        }
    }

    fn ok_value(value: Value) -> Self {
        Outcome { success: true, body: value }
    }

    fn err(message: impl Into<String>) -> Self {
        Outcome {
            success: false,
            body: json!({ "message": message.into() }),
        }
    }
}

/// Accepts connections on the admin Unix socket until the listener is
/// dropped, handling one JSON request per connection.
pub async fn serve_unix(listener: UnixListener, supervisor: &Supervisor) {
    loop {
        let (stream, _) = match listener.accept().await {
            Ok(pair) => pair,
            Err(err) => {
                warn!(error = %err, "management socket accept failed");
                continue;
            }
        };
        if let Err(err) = handle_connection(stream, supervisor).await {
            warn!(error = %err, "management request failed");
        }
    }
}

async fn handle_connection(stream: UnixStream, supervisor: &Supervisor) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();
    reader.read_line(&mut line).await.context("reading management request")?;
    if line.trim().is_empty() {
        return Ok(());
    }

    let encoded = dispatch_line(supervisor, line.trim()).await;
    let mut bytes = encoded.into_bytes();
    bytes.push(b'\n');
    write_half.write_all(&bytes).await.context("writing management response")?;
    Ok(())
}

/// Parses one request line, runs the command, and serializes the response
/// envelope — shared by the Unix and (SCRAM-authenticated) remote-TCP
/// listeners.
pub async fn dispatch_line(supervisor: &Supervisor, line: &str) -> String {
    let envelope: RequestEnvelope = match serde_json::from_str(line) {
        Ok(envelope) => envelope,
        Err(err) => {
            let response = ResponseEnvelope {
                header: ResponseHeader {
                    command: "UNKNOWN".into(),
                    success: false,
                },
                response: json!({ "message": format!("malformed request: {err}") }),
            };
            return serde_json::to_string(&response).unwrap_or_default();
        }
    };

    let command_name = envelope.header.command.clone();
    let outcome = match Command::parse(&envelope.header.command, &envelope.request) {
        Ok(command) => handle_command(supervisor, command).await,
        Err(err) => Outcome::err(err.to_string()),
    };

    let response = ResponseEnvelope {
        header: ResponseHeader {
            command: command_name,
            success: outcome.success,
        },
        response: outcome.body,
    };
    serde_json::to_string(&response).unwrap_or_default()
}

/// Executes one administrative command against the running supervisor
/// state.
async fn handle_command(supervisor: &Supervisor, command: Command) -> Outcome {
    match command {
        Command::Ping => Outcome::ok_message("pong"),

        Command::Flush { database } => {
            let reclaimed = supervisor.flush(database.as_deref());
            Outcome::ok_message(format!("flushed {reclaimed} slot(s)"))
        }

        Command::EnableDb { database } => {
            supervisor.set_database_disabled(&database, false);
            info!(database = %database, "database enabled via management command");
            Outcome::ok()
        }

        Command::DisableDb { database } => {
            supervisor.set_database_disabled(&database, true);
            info!(database = %database, "database disabled via management command");
            Outcome::ok()
        }

        Command::Gracefully => {
            supervisor.gracefully.store(true, Ordering::Release);
            info!("graceful shutdown requested via management command");
            Outcome::ok()
        }

        Command::CancelShutdown => {
            supervisor.gracefully.store(false, Ordering::Release);
            Outcome::ok()
        }

        Command::Shutdown => {
            supervisor.shutdown.notify_waiters();
            Outcome::ok()
        }

        Command::Status => Outcome::ok_value(json!({ "databases": supervisor.database_summaries() })),

        Command::Details => Outcome::ok_value(json!({
            "message": supervisor.details_text(),
            "databases": supervisor.database_summaries(),
        })),

        Command::Clear { database } => {
            let reclaimed = supervisor.flush(database.as_deref());
            Outcome::ok_message(format!("cleared {reclaimed} slot(s)"))
        }

        Command::ClearServer { server } => match supervisor.clear_server(&server) {
            Ok(()) => Outcome::ok(),
            Err(err) => Outcome::err(err.to_string()),
        },

        Command::SwitchTo { server } => match supervisor.switch_to(&server) {
            Ok(()) => Outcome::ok(),
            Err(err) => Outcome::err(err.to_string()),
        },

        Command::Reload => match supervisor.reload().await {
            Ok(()) => Outcome::ok_message("configuration reloaded"),
            Err(err) => Outcome::err(format!("reload failed: {err}")),
        },

        Command::ConfigLs => Outcome::ok_value(json!({ "message": supervisor.config_ls() })),

        Command::ConfigGet { key } => match supervisor.config_get(&key) {
            Some(value) => Outcome::ok_value(json!({ "value": value })),
            None => Outcome::err(format!("unknown configuration key {key:?}")),
        },

        Command::ConfigSet { key, value } => match supervisor.config_set(&key, &value) {
            Ok(()) => Outcome::ok(),
            Err(err) => Outcome::err(err.to_string()),
        },

        Command::ConfigAlias { alias, key } => match supervisor.config_alias(&alias, &key) {
            Ok(()) => Outcome::ok(),
            Err(err) => Outcome::err(err.to_string()),
        },

        Command::GetPassword { username } => match supervisor.get_password(&username) {
            Some(password) => Outcome::ok_value(json!({ "value": password })),
            None => Outcome::err(format!("no credential on file for {username:?}")),
        },
    }
}

/// The metrics listener: every connection gets the current text snapshot
/// and is closed, the way a Prometheus scrape expects
/// (`RegistryMetrics::encode_prometheus_text` stands in for a full encoder;
/// see `pgrelay_core::metrics`).
pub async fn serve_metrics(listener: TcpListener, metrics: Arc<RegistryMetrics>) {
    loop {
        let (mut stream, _) = match listener.accept().await {
            Ok(pair) => pair,
            Err(err) => {
                warn!(error = %err, "metrics socket accept failed");
                continue;
            }
        };
        let metrics = metrics.clone();
        tokio::spawn(async move {
            // Drain whatever the client sent (an HTTP request line, if any)
            // without trying to parse it — the stub exposes one fixed body
            // regardless of path, matching a bare `/metrics` scrape target.
            let mut discard = [0u8; 1024];
            let _ = tokio::time::timeout(std::time::Duration::from_millis(200), stream.read(&mut discard)).await;
            let body = metrics.encode_prometheus_text();
            let response = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: text/plain; version=0.0.4\r\ncontent-length: {}\r\n\r\n{}",
                body.len(),
                body
            );
            let _ = stream.write_all(response.as_bytes()).await;
        });
    }
}

/// Remote management: a TCP listener carrying the same JSON
/// request/response protocol as the local Unix socket, but gated by a
/// SCRAM-SHA-256 exchange against the admins table before the first
/// command is accepted.
pub async fn serve_tcp(listener: TcpListener, supervisor: &Supervisor) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(err) => {
                warn!(error = %err, "remote management socket accept failed");
                continue;
            }
        };
        if let Err(err) = handle_tcp_connection(stream, supervisor).await {
            warn!(error = %err, peer = %peer, "remote management session failed");
        }
    }
}

async fn handle_tcp_connection(stream: TcpStream, supervisor: &Supervisor) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let admins = supervisor.admins();
    if !scram_gate(&mut reader, &mut write_half, &admins).await? {
        return Ok(());
    }

    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await.context("reading remote management request")?;
        if n == 0 || line.trim().is_empty() {
            return Ok(());
        }
        let encoded = dispatch_line(supervisor, line.trim()).await;
        let mut bytes = encoded.into_bytes();
        bytes.push(b'\n');
        write_half.write_all(&bytes).await.context("writing remote management response")?;
    }
}

/// One JSON-line SCRAM-SHA-256 handshake gating the remote TCP listener,
/// checked against the admins table. Reuses the same primitives
/// `pgrelay_core::auth::engine::authenticate_client` drives for the
/// PostgreSQL-wire SCRAM path, re-orchestrated over plain JSON lines since
/// this channel carries the management protocol, not the PostgreSQL wire
/// protocol.
///
/// Request/response shape, one JSON object per line:
///   -> {"user": "...", "client-first": "n,,n=...,r=<nonce>"}
///   <- {"server-first": "r=...,s=...,i=..."}
///   -> {"client-final": "c=biws,r=...,p=..."}
///   <- {"ok": true, "server-final": "v=..."} | {"ok": false}
async fn scram_gate(
    reader: &mut BufReader<tokio::net::tcp::OwnedReadHalf>,
    writer: &mut tokio::net::tcp::OwnedWriteHalf,
    admins: &UserTable,
) -> Result<bool> {
    let mut first_line = String::new();
    if reader.read_line(&mut first_line).await.context("reading SCRAM client-first")? == 0 {
        return Ok(false);
    }
    let first: Value = serde_json::from_str(first_line.trim()).context("parsing SCRAM client-first")?;
    let username = first.get("user").and_then(Value::as_str).unwrap_or_default().to_owned();
    let client_first = first.get("client-first").and_then(Value::as_str).unwrap_or_default();
    let client_first_bare = client_first.strip_prefix(scram::GS2_HEADER).unwrap_or(client_first);
    let client_nonce = scram::parse_attributes(client_first_bare)
        .into_iter()
        .find(|(k, _)| *k == 'r')
        .map(|(_, v)| v)
        .unwrap_or_default();

    let Some(record) = admins.get(&username) else {
        write_json_line(writer, &json!({ "ok": false, "message": "unknown admin user" })).await?;
        return Ok(false);
    };

    let salt = scram::random_salt();
    let iterations = scram::DEFAULT_ITERATIONS;
    let server_nonce_suffix = scram::random_nonce();
    let server_first = scram::server_first_message(&client_nonce, &server_nonce_suffix, &salt, iterations);
    write_json_line(writer, &json!({ "server-first": server_first })).await?;

    let mut final_line = String::new();
    if reader.read_line(&mut final_line).await.context("reading SCRAM client-final")? == 0 {
        return Ok(false);
    }
    let final_req: Value = serde_json::from_str(final_line.trim()).context("parsing SCRAM client-final")?;
    let client_final = final_req.get("client-final").and_then(Value::as_str).unwrap_or_default();
    let parsed = scram::parse_client_final(client_final)?;

    let auth_message = scram::auth_message(client_first_bare, &server_first, &parsed.without_proof);
    let salted = scram::salted_password(&record.password, &salt, iterations);
    let stored_key = scram::stored_key(scram::client_key(salted));

    if !scram::verify_client_proof(parsed.proof, stored_key, &auth_message) {
        write_json_line(writer, &json!({ "ok": false })).await?;
        return Ok(false);
    }

    let server_key = scram::server_key(salted);
    let signature = scram::server_signature(server_key, &auth_message);
    write_json_line(
        writer,
        &json!({ "ok": true, "server-final": scram::server_final_message(signature) }),
    )
    .await?;
    Ok(true)
}

async fn write_json_line(writer: &mut tokio::net::tcp::OwnedWriteHalf, value: &Value) -> Result<()> {
    let mut bytes = serde_json::to_vec(value).context("encoding SCRAM message")?;
    bytes.push(b'\n');
    writer.write_all(&bytes).await.context("writing SCRAM message")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_flush_with_database() {
        let command = Command::parse("FLUSH", &json!({ "database": "app" })).unwrap();
        assert!(matches!(command, Command::Flush { database: Some(d) } if d == "app"));
    }

    #[test]
    fn parses_ping_with_empty_request() {
        let command = Command::parse("PING", &Value::Null).unwrap();
        assert!(matches!(command, Command::Ping));
    }

    #[test]
    fn enabledb_requires_database_field() {
        assert!(Command::parse("ENABLEDB", &json!({})).is_err());
    }

    #[test]
    fn rejects_unknown_command() {
        assert!(Command::parse("FROBNICATE", &Value::Null).is_err());
    }

    async fn drive_scram_gate(password_tried: &str, record_password: &str) -> bool {
        use pgrelay_core::model::UserRecord;

        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();

        let admins = UserTable::new(vec![UserRecord {
            username: "admin".into(),
            password: record_password.into(),
        }]);

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut reader = BufReader::new(read_half);
            scram_gate(&mut reader, &mut write_half, &admins).await.unwrap()
        });

        let client = TcpStream::connect(addr).await.unwrap();
        let (read_half, mut write_half) = client.into_split();
        let mut reader = BufReader::new(read_half);

        let client_nonce = scram::random_nonce();
        let client_first_bare = scram::client_first_bare(&client_nonce);
        write_half
            .write_all(
                format!(
                    "{}\n",
                    json!({ "user": "admin", "client-first": format!("{}{}", scram::GS2_HEADER, client_first_bare) })
                )
                .as_bytes(),
            )
            .await
            .unwrap();

        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        let server_first_resp: Value = serde_json::from_str(line.trim()).unwrap();
        let server_first = server_first_resp["server-first"].as_str().unwrap().to_owned();
        let parsed_first = scram::parse_server_first(&server_first).unwrap();

        let without_proof = scram::client_final_without_proof(&parsed_first.nonce);
        let auth_message = scram::auth_message(&client_first_bare, &server_first, &without_proof);
        let salted = scram::salted_password(password_tried, &parsed_first.salt, parsed_first.iterations);
        let client_key = scram::client_key(salted);
        let stored_key = scram::stored_key(client_key);
        let proof = scram::client_proof(client_key, stored_key, &auth_message);
        let client_final = scram::client_final_message(&without_proof, proof);

        write_half
            .write_all(format!("{}\n", json!({ "client-final": client_final })).as_bytes())
            .await
            .unwrap();

        let mut final_line = String::new();
        reader.read_line(&mut final_line).await.unwrap();
        let final_resp: Value = serde_json::from_str(final_line.trim()).unwrap();

        let gate_result = server.await.unwrap();
        assert_eq!(final_resp["ok"].as_bool().unwrap(), gate_result);
        gate_result
    }

    #[tokio::test]
    async fn scram_gate_accepts_matching_password() {
        assert!(drive_scram_gate("hunter2", "hunter2").await);
    }

    #[tokio::test]
    async fn scram_gate_rejects_wrong_password() {
        assert!(!drive_scram_gate("wrong-password", "hunter2").await);
    }
}
