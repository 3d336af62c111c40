//! The session pipeline: same one-client-one-slot lifetime as performance,
//! plus a `disconnect_client` idle cutoff and one failover retry if the
//! backend connection dies mid-session.

use tracing::warn;

use crate::error::{Error, Result};
use crate::protocol::codec::{PgCodec, ReadOutcome};

use super::performance::relay_until_close;
use super::{replay_startup_tail, PipelineContext};

pub async fn run(ctx: &mut PipelineContext) -> Result<()> {
    let mut attempt = 0;
    loop {
        attempt += 1;
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
        let mut backend = PgCodec::new(stream);

        let result = async {
            replay_startup_tail(&mut ctx.client, &slot).await?;
            match ctx.policy.disconnect_client {
                Some(idle) => relay_with_idle_cutoff(&mut ctx.client, &mut backend, idle).await,
                None => relay_until_close(&mut ctx.client, &mut backend).await,
            }
        }
        .await;

        slot.occupant.lock().unwrap().stream = Some(backend.into_stream());

        match result {
            Ok(()) => {
                ctx.pool.release(acquired.index);
                return Ok(());
            }
            Err(Error::Io(io_err)) if attempt == 1 => {
                // One failover retry: the backend connection itself failed,
                // not the client — kill the slot and try once more against
                // whichever server the registry picks next.
                ctx.pool.kill(acquired.index);
                warn!(
                    username = %ctx.username,
                    database = %ctx.database,
                    error = %io_err,
                    "session pipeline retrying after backend failure"
                );
                continue;
            }
            Err(err) => {
                ctx.pool.kill(acquired.index);
                return Err(err);
            }
        }
    }
}

/// Like [`relay_until_close`] but force-closes on `disconnect_client`
/// inactivity rather than bounding the whole session. The cutoff only runs
/// while the client owes the next request — i.e. since the last
/// `ReadyForQuery` reached it with nothing sent back yet. A frame from the
/// client disarms it; the next `ReadyForQuery` forwarded from the backend
/// rearms it with a fresh deadline. A session that keeps sending queries,
/// however long it runs, is never force-closed by this.
async fn relay_with_idle_cutoff(client: &mut PgCodec, backend: &mut PgCodec, idle: std::time::Duration) -> Result<()> {
    let mut waiting_for_client = true;
    let mut deadline = tokio::time::Instant::now() + idle;
    loop {
        let idle_timer = tokio::time::sleep_until(deadline);
        tokio::select! {
            _ = idle_timer, if waiting_for_client => {
                return Err(Error::Timeout("disconnect_client idle cutoff reached".into()));
            }
            outcome = client.read_block_or_eof() => {
                match outcome? {
                    ReadOutcome::Frame(frame) => {
                        waiting_for_client = false;
                        backend.write_raw(&frame.encode_raw());
                        backend.flush().await?;
                    }
                    ReadOutcome::Eof => return Ok(()),
                    ReadOutcome::Timeout => unreachable!(),
                }
            }
            outcome = backend.read_block_or_eof() => {
                match outcome? {
                    ReadOutcome::Frame(frame) => {
                        if frame.kind == b'Z' {
                            waiting_for_client = true;
                            deadline = tokio::time::Instant::now() + idle;
                        }
                        client.write_raw(&frame.encode_raw());
                        client.flush().await?;
                    }
                    ReadOutcome::Eof => return Ok(()),
                    ReadOutcome::Timeout => unreachable!(),
                }
            }
        }
    }
}
