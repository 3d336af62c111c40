//! The transaction pipeline: a slot is held only between `BEGIN` and the
//! matching `ReadyForQuery('I')`. Outside a transaction the worker gives the
//! slot back after every client message and re-borrows (possibly a
//! different slot, even a different backend) on the next one.

use crate::error::Result;
use crate::pool::AcquiredSlot;
use crate::protocol::backend::TransactionStatus;
use crate::protocol::codec::{PgCodec, ReadOutcome};
use crate::protocol::message::{Direction, MessageFormat};

use super::{replay_startup_tail, PipelineContext};

/// Counts outstanding `Parse`d statements/portals so a held slot isn't
/// released while the client still expects them to exist server-side when
/// `track_prepared_statements` is enabled.
#[derive(Default)]
struct PreparedTracker {
    open: u32,
}

impl PreparedTracker {
    fn observe_frontend(&mut self, format: MessageFormat) {
        match format {
            MessageFormat::Parse => self.open += 1,
            MessageFormat::Close => self.open = self.open.saturating_sub(1),
            _ => {}
        }
    }
}

pub async fn run(ctx: &mut PipelineContext) -> Result<()> {
    send_initial_ready(ctx).await?;

    let mut held: Option<(AcquiredSlot, PgCodec)> = None;
    let mut tracker = PreparedTracker::default();

    let result = run_inner(ctx, &mut held, &mut tracker).await;

    // Whatever ended the loop — clean EOF, a protocol error, a dead backend
    // — a still-held slot must not leak as permanently `InUse`. A healthy
    // exit (clean client EOF) releases it; anything else kills it, since its
    // backend state is no longer trustworthy.
    if let Some((acquired, backend)) = held.take() {
        let slot = ctx.pool.slot(acquired.index);
        slot.occupant.lock().unwrap().stream = Some(backend.into_stream());
        match &result {
            Ok(()) => ctx.pool.release(acquired.index),
            Err(_) => ctx.pool.kill(acquired.index),
        }
    }

    result
}

/// Borrows a slot just long enough to replay its cached startup tail to the
/// client, then gives it straight back. Unlike performance/session, this
/// pipeline doesn't otherwise touch a slot until the client's first message
/// — but the client is blocked waiting for its own `ReadyForQuery` before it
/// will send one, so that first borrow can't wait for `BEGIN`.
async fn send_initial_ready(ctx: &mut PipelineContext) -> Result<()> {
    let acquired = ctx
        .pool
        .get_connection(&ctx.username, &ctx.database, true)
        .await?;
    let slot = ctx.pool.slot(acquired.index).clone();
    let result = replay_startup_tail(&mut ctx.client, &slot).await;
    match &result {
        Ok(()) => ctx.pool.release(acquired.index),
        Err(_) => ctx.pool.kill(acquired.index),
    }
    result
}

async fn run_inner(
    ctx: &mut PipelineContext,
    held: &mut Option<(AcquiredSlot, PgCodec)>,
    tracker: &mut PreparedTracker,
) -> Result<()> {
    loop {
        let frame = match ctx.client.read_block_or_eof().await? {
            ReadOutcome::Frame(frame) => frame,
            ReadOutcome::Eof => return Ok(()),
            ReadOutcome::Timeout => unreachable!(),
        };

        if ctx.policy.track_prepared_statements {
            if let Ok(message) = frame.to_message(Direction::Frontend) {
                tracker.observe_frontend(message.format);
            }
        }

        if held.is_none() {
            let acquired = ctx
                .pool
                .get_connection(&ctx.username, &ctx.database, true)
                .await?;
            let slot = ctx.pool.slot(acquired.index).clone();
            let stream = slot
                .occupant
                .lock()
                .unwrap()
                .stream
                .take()
                .expect("InUse slot always has a live backend stream");
            *held = Some((acquired, PgCodec::new(stream)));
        }

        let (acquired, backend) = held.as_mut().unwrap();
        backend.write_raw(&frame.encode_raw());
        backend.flush().await?;

        let status = relay_backend_reply(&mut ctx.client, backend).await?;

        if let Some(status) = status {
            let transaction_open = status != TransactionStatus::Idle;
            let may_release = !transaction_open && (!ctx.policy.track_prepared_statements || tracker.open == 0);
            if may_release {
                let (acquired, backend) = held.take().unwrap();
                let slot = ctx.pool.slot(acquired.index);
                slot.occupant.lock().unwrap().stream = Some(backend.into_stream());
                ctx.pool.release(acquired.index);
            }
        }
    }
}

/// Relays every frame the backend sends in response to one client message,
/// stopping at (and returning the status byte of) `ReadyForQuery` — the only
/// frame this pipeline inspects post-auth.
async fn relay_backend_reply(client: &mut PgCodec, backend: &mut PgCodec) -> Result<Option<TransactionStatus>> {
    loop {
        let frame = backend.read_block().await?;
        let status = frame
            .to_message(Direction::Backend)
            .ok()
            .filter(|m| m.format == MessageFormat::ReadyForQuery)
            .and_then(|m| m.contents.first().copied())
            .and_then(|b| TransactionStatus::from_byte(b).ok());

        client.write_raw(&frame.encode_raw());
        client.flush().await?;

        if status.is_some() {
            return Ok(status);
        }
    }
}
