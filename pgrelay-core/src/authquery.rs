//! The superuser auth-query connection. A single superuser connection,
//! serialized behind the caller's own lock, runs
//! `SELECT * FROM public.pgrelay_get_password($1)` and hands back
//! whatever shadow value the function returns (a plaintext password or a
//! `SCRAM-SHA-256$...` verifier string, as pgrelay's own docs tell operators
//! to shape the function).
//!
//! Grounded in `sqlx_core::postgres::connection::establish` for opening one
//! plain client-role connection, and in [`crate::auth::engine`] for the
//! extended-query-free `Query`/`DataRow` round trip already used by
//! [`crate::pool::Pool`]'s validation query.

use std::time::Duration;

use crate::auth::AuthEngine;
use crate::error::{Error, Result};
use crate::model::{Endpoint, Server};
use crate::net::{MaybeTlsStream, Socket};
use crate::protocol::backend::{DataRow, ErrorResponse};
use crate::protocol::codec::{PgCodec, ReadOutcome};
use crate::protocol::frontend::Query;
use crate::protocol::message::{Direction, MessageFormat};
use crate::protocol::StartupMessage;

/// Opens a fresh connection to `server` as `superuser_username`, runs the
/// lookup query for `target_username`, and closes the connection. Returns
/// `None` when the function returns zero rows or a SQL `NULL` (no such
/// user).
pub async fn lookup_password(
    server: &Server,
    superuser_username: &str,
    superuser_password: Option<&str>,
    target_username: &str,
    timeout: Duration,
) -> Result<Option<String>> {
    let socket = match &server.endpoint {
        Endpoint::Tcp { host, port } => Socket::connect_tcp(host, *port).await?,
        Endpoint::Unix { path } => Socket::connect_unix(path).await?,
    };

    let startup = StartupMessage {
        params: vec![
            ("user".into(), superuser_username.into()),
            ("database".into(), "postgres".into()),
        ],
    };
    let mut codec = PgCodec::new(MaybeTlsStream::Raw(socket));
    codec.write_raw(&startup.encode());
    codec.flush().await?;

    AuthEngine::backend_login(&mut codec, superuser_username, superuser_password, timeout).await?;

    codec
        .write_and_flush(
            MessageFormat::Query,
            &Query {
                sql: format!(
                    "SELECT * FROM public.pgrelay_get_password('{}')",
                    escape_literal(target_username)
                ),
            },
        )
        .await?;

    let mut shadow = None;
    loop {
        match codec.read_timeout(timeout).await? {
            ReadOutcome::Frame(frame) => {
                let message = frame.to_message(Direction::Backend)?;
                match message.format {
                    MessageFormat::DataRow => {
                        let row: DataRow = message.decode()?;
                        if let Some(Some(value)) = row.columns.first() {
                            shadow = String::from_utf8(value.to_vec()).ok();
                        }
                    }
                    MessageFormat::ErrorResponse => {
                        let err: ErrorResponse = message.decode()?;
                        return Err(Error::Database(err.message.unwrap_or_default()));
                    }
                    MessageFormat::ReadyForQuery => break,
                    _ => {}
                }
            }
            ReadOutcome::Timeout => return Err(Error::Timeout("auth-query timed out".into())),
            ReadOutcome::Eof => return Err(Error::Io(std::io::ErrorKind::UnexpectedEof.into())),
        }
    }

    let _ = codec
        .write_and_flush(MessageFormat::Terminate, &crate::protocol::frontend::Terminate)
        .await;

    Ok(shadow)
}

/// `pgrelay_get_password` takes a plain `text` argument; single-quote the
/// usual way since this is the only place pgrelay ever builds SQL text
/// itself — there is no general query parsing anywhere else in this crate.
fn escape_literal(s: &str) -> String {
    s.replace('\'', "''")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_embedded_quotes() {
        assert_eq!(escape_literal("o'brien"), "o''brien");
    }
}
