//! The three forwarding pipelines: performance, session, and transaction.
//! Each owns the splice between an already-authenticated client connection
//! and the backend socket held by a pool slot; they differ only in how long
//! a client keeps its slot and what extra policy (TLS, idle cutoff, failover,
//! prepared-statement tracking) applies while it does.
//!
//! Grounded in `sqlx_core::postgres::connection::worker`'s message loop shape
//! (read a frame, act on a handful of kinds, relay the rest) generalized from
//! sqlx's single-connection-owns-everything model to pgrelay's
//! client-socket/backend-slot split.

pub mod performance;
pub mod session;
pub mod transaction;

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::error::Result;
use crate::metrics::Metrics;
use crate::pool::Pool;
use crate::protocol::codec::PgCodec;
use crate::slot::Slot;

/// Which pipeline a limit rule or database binds its clients to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineKind {
    Performance,
    Session,
    Transaction,
}

/// Per-connection policy the supervisor resolves once (from config) and
/// hands to whichever pipeline runs the client.
#[derive(Debug, Clone)]
pub struct PipelinePolicy {
    pub kind: PipelineKind,
    pub disconnect_client: Option<Duration>,
    pub track_prepared_statements: bool,
}

/// Everything a pipeline needs to run one client to completion.
pub struct PipelineContext {
    pub client: PgCodec,
    pub pool: Arc<Pool>,
    pub metrics: Arc<dyn Metrics>,
    pub username: String,
    pub database: String,
    pub policy: PipelinePolicy,
}

/// Runs the pipeline named by `ctx.policy.kind` until the client disconnects
/// or a fatal relay error occurs. Errors are logged and swallowed here — a
/// worker's errors never escape past the task boundary.
pub async fn run(mut ctx: PipelineContext) {
    let result = match ctx.policy.kind {
        PipelineKind::Performance => performance::run(&mut ctx).await,
        PipelineKind::Session => session::run(&mut ctx).await,
        PipelineKind::Transaction => transaction::run(&mut ctx).await,
    };
    match result {
        Ok(()) => info!(username = %ctx.username, database = %ctx.database, "client session ended"),
        Err(err) => warn!(username = %ctx.username, database = %ctx.database, error = %err, "client session ended with error"),
    }
}

/// Forwards a freshly bound slot's cached startup tail — `BackendKeyData`,
/// each `ParameterStatus`, and the backend's own `ReadyForQuery` — to the
/// client that just authenticated onto it.
///
/// `AuthEngine::backend_login` reads this tail straight off the backend
/// socket while setting the slot up, and a client's own auth handshake never
/// produces these frames on its own (mode B/D replay only ever writes
/// `AuthenticationOk`). Without this step the client is left waiting forever
/// for a `ReadyForQuery` that already came and went on the backend side.
/// `CapturedFrame::is_auth_frame` filters out the backend's own
/// `Authentication` challenge/`Ok` frames, which belong to the backend login
/// that already happened and must never be replayed to the client.
pub(super) async fn replay_startup_tail(client: &mut PgCodec, slot: &Slot) -> Result<()> {
    let tail: Vec<Vec<u8>> = {
        let occupant = slot.occupant.lock().unwrap();
        occupant
            .security_messages
            .iter()
            .filter(|frame| !frame.is_auth_frame())
            .map(|frame| frame.raw.clone())
            .collect()
    };
    if tail.is_empty() {
        return Ok(());
    }
    for raw in &tail {
        client.write_raw(raw);
    }
    client.flush().await?;
    Ok(())
}
