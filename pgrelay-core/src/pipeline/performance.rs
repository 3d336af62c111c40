//! The performance pipeline: one client, one slot, for the life of the
//! connection. No TLS, no idle cutoff, no failover — the cheapest possible
//! relay, byte-for-byte but frame-aware so a malformed or oversize frame is
//! still rejected rather than silently corrupting the stream.

use crate::error::Result;
use crate::protocol::codec::{PgCodec, ReadOutcome};

use super::{replay_startup_tail, PipelineContext};

pub async fn run(ctx: &mut PipelineContext) -> Result<()> {
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
        relay_until_close(&mut ctx.client, &mut backend).await
    }
    .await;

    slot.occupant.lock().unwrap().stream = Some(backend.into_stream());
    match &result {
        Ok(()) => ctx.pool.release(acquired.index),
        Err(_) => ctx.pool.kill(acquired.index),
    }
    result
}

/// Relays frames in both directions until either side disconnects or a
/// protocol error surfaces. Used by the performance pipeline directly, and
/// by the session pipeline whenever no `disconnect_client` idle cutoff is
/// configured (see `session.rs`'s `relay_with_idle_cutoff` for the cutoff
/// variant).
pub(super) async fn relay_until_close(client: &mut PgCodec, backend: &mut PgCodec) -> Result<()> {
    loop {
        tokio::select! {
            outcome = client.read_block_or_eof() => {
                match outcome? {
                    ReadOutcome::Frame(frame) => {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::{MaybeTlsStream, Socket};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn frame(kind: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![kind];
        out.extend_from_slice(&(payload.len() as i32 + 4).to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    #[tokio::test]
    async fn relays_a_single_frame_then_closes_on_client_eof() {
        let (client_near, mut client_far) = Socket::test_pair();
        let (backend_near, mut backend_far) = Socket::test_pair();

        let mut client = PgCodec::new(MaybeTlsStream::Raw(client_near));
        let mut backend = PgCodec::new(MaybeTlsStream::Raw(backend_near));

        client_far.write_all(&frame(b'Q', b"select 1\0")).await.unwrap();
        client_far.shutdown().await.unwrap();

        relay_until_close(&mut client, &mut backend).await.unwrap();

        let mut received = vec![0u8; 64];
        let n = backend_far.read(&mut received).await.unwrap();
        assert_eq!(&received[..n], &frame(b'Q', b"select 1\0")[..]);
    }
}
