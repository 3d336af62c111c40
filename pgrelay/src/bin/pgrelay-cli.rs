//! `pgrelay-cli`: a thin administrative client that sends one JSON request
//! line to a running daemon's management socket and prints the response.
//!
//! Grounded in `sqlx-cli/src/opt.rs`'s subcommand-per-verb style — one enum
//! variant per administrative action, each a struct of just the fields that
//! verb needs — adapted from `clap`'s old `Clap` derive to the `Parser`/
//! `Subcommand` derive pair the rest of this workspace already depends on.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

#[derive(Parser, Debug)]
#[command(name = "pgrelay-cli", version, about = "Administrative client for a running pgrelay daemon")]
struct Opt {
    #[command(subcommand)]
    command: Command,

    /// Path to the management Unix socket. Defaults to the conventional
    /// `<unix-socket-dir>/.s.pgrelay.<port>` name.
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Directory the daemon's sockets live in, used to derive `--socket`
    /// when it isn't given directly.
    #[arg(long, default_value = "/tmp")]
    unix_socket_dir: PathBuf,

    /// Port the daemon is listening on, used to derive `--socket`.
    #[arg(short, long, default_value_t = 2345)]
    port: u16,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Kill every idle (`Free`) pooled connection, optionally scoped to one database.
    Flush { database: Option<String> },
    /// Re-enable new connections to a database.
    EnableDb { database: String },
    /// Refuse new connections to a database; existing ones are left alone.
    DisableDb { database: String },
    /// Request a graceful drain: stop accepting new clients, let current ones finish.
    Gracefully,
    /// Cancel a pending graceful-drain request.
    CancelShutdown,
    /// Shut the daemon down immediately.
    Shutdown,
    /// Check the daemon is alive.
    Ping,
    /// Summarize every known database's pool usage.
    Status,
    /// Full supervisor state dump.
    Details,
    /// Kill every idle connection, optionally scoped to one database (alias of `flush`).
    Clear { database: Option<String> },
    /// Mark a server `NotInit`, killing connections currently pinned to it.
    ClearServer { server: String },
    /// Promote `server` to primary, demoting whichever server currently holds that role.
    SwitchTo { server: String },
    /// Re-read `pgrelay.toml` and its credential/HBA files.
    Reload,
    /// List the effective runtime configuration.
    ConfigLs,
    /// Read one configuration key.
    ConfigGet { key: String },
    /// Override one configuration key until the next reload.
    ConfigSet { key: String, value: String },
    /// Alias one configuration key name to another.
    ConfigAlias { alias: String, key: String },
    /// Look up the (decrypted) password on file for a user.
    GetPassword { username: String },
}

impl Command {
    fn wire_name(&self) -> &'static str {
        match self {
            Command::Flush { .. } => "FLUSH",
            Command::EnableDb { .. } => "ENABLEDB",
            Command::DisableDb { .. } => "DISABLEDB",
            Command::Gracefully => "GRACEFULLY",
            Command::CancelShutdown => "CANCEL_SHUTDOWN",
            Command::Shutdown => "SHUTDOWN",
            Command::Ping => "PING",
            Command::Status => "STATUS",
            Command::Details => "DETAILS",
            Command::Clear { .. } => "CLEAR",
            Command::ClearServer { .. } => "CLEAR_SERVER",
            Command::SwitchTo { .. } => "SWITCH_TO",
            Command::Reload => "RELOAD",
            Command::ConfigLs => "CONFIG_LS",
            Command::ConfigGet { .. } => "CONFIG_GET",
            Command::ConfigSet { .. } => "CONFIG_SET",
            Command::ConfigAlias { .. } => "CONFIG_ALIAS",
            Command::GetPassword { .. } => "GET_PASSWORD",
        }
    }

    fn request_body(&self) -> Value {
        match self {
            Command::Flush { database } | Command::Clear { database } => json!({ "database": database }),
            Command::EnableDb { database } | Command::DisableDb { database } => json!({ "database": database }),
            Command::ClearServer { server } | Command::SwitchTo { server } => json!({ "server": server }),
            Command::ConfigGet { key } => json!({ "key": key }),
            Command::ConfigSet { key, value } => json!({ "key": key, "value": value }),
            Command::ConfigAlias { alias, key } => json!({ "alias": alias, "key": key }),
            Command::GetPassword { username } => json!({ "username": username }),
            Command::Gracefully
            | Command::CancelShutdown
            | Command::Shutdown
            | Command::Ping
            | Command::Status
            | Command::Details
            | Command::Reload
            | Command::ConfigLs => Value::Null,
        }
    }
}

#[tokio::main]
async fn main() {
    let opt = Opt::parse();
    if let Err(err) = run(opt).await {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

async fn run(opt: Opt) -> Result<()> {
    let socket_path = opt
        .socket
        .clone()
        .unwrap_or_else(|| opt.unix_socket_dir.join(format!(".s.pgrelay.{}", opt.port)));

    let request = json!({
        "header": { "command": opt.command.wire_name() },
        "request": opt.command.request_body(),
    });
    let mut line = serde_json::to_string(&request).context("encoding request")?;
    line.push('\n');

    let stream = UnixStream::connect(&socket_path)
        .await
        .with_context(|| format!("connecting to management socket {}", socket_path.display()))?;
    let (read_half, mut write_half) = stream.into_split();
    write_half.write_all(line.as_bytes()).await.context("writing request")?;

    let mut reader = BufReader::new(read_half);
    let mut response_line = String::new();
    reader
        .read_line(&mut response_line)
        .await
        .context("reading response")?;

    let response: Value = serde_json::from_str(response_line.trim()).context("decoding response")?;
    let success = response
        .get("header")
        .and_then(|h| h.get("success"))
        .and_then(Value::as_bool)
        .unwrap_or(false);

    println!("{}", serde_json::to_string_pretty(&response.get("response").unwrap_or(&Value::Null))?);
    if !success {
        anyhow::bail!("command failed");
    }
    Ok(())
}
