//! Framed reads/writes over a [`MaybeTlsStream`](crate::net::MaybeTlsStream):
//! `read_timeout`, `read_block`, `write`, `extract_message`,
//! `extract_message_offset`.
//!
//! Grounded in `sqlx_core::net::socket::buffered::BufferedSocket` — same
//! "accumulate into a `BytesMut`, split off a frame once enough has
//! arrived" discipline, rebuilt without the `ProtocolDecode`/`Context`
//! generics sqlx needs for its encode/decode-with-options dance (pgrelay's
//! messages don't need per-call context).

use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::net::MaybeTlsStream;

use super::io::{Decode, Encode};
use super::message::{Direction, Message, MessageFormat};

const DEFAULT_BUF_SIZE: usize = 8192;

/// A single decoded frame, kind byte plus its length-delimited contents.
/// Distinguished from [`Message`] only in that it carries the raw kind byte
/// before `MessageFormat::try_from_u8` resolves it against a [`Direction`] —
/// callers that just want to relay bytes (the pipelines) stay at this level.
#[derive(Debug, Clone)]
pub struct Frame {
    pub kind: u8,
    pub contents: Bytes,
}

impl Frame {
    /// The full wire bytes of this frame (`kind` + `length` + `contents`),
    /// as captured for a slot's `security_messages` or relayed verbatim by
    /// a pipeline.
    pub fn raw_len(&self) -> usize {
        1 + 4 + self.contents.len()
    }

    pub fn to_message(&self, direction: Direction) -> Result<Message> {
        Ok(Message {
            format: MessageFormat::try_from_u8(direction, self.kind)?,
            contents: self.contents.clone(),
        })
    }

    pub fn encode_raw(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.raw_len());
        buf.extend_from_slice(&[self.kind]);
        buf.extend_from_slice(&(self.contents.len() as i32 + 4).to_be_bytes());
        buf.extend_from_slice(&self.contents);
        buf
    }
}

pub struct PgCodec {
    stream: MaybeTlsStream,
    read_buf: BytesMut,
    write_buf: BytesMut,
}

pub enum ReadOutcome {
    Frame(Frame),
    Timeout,
    Eof,
}

impl PgCodec {
    pub fn new(stream: MaybeTlsStream) -> Self {
        PgCodec {
            stream,
            read_buf: BytesMut::with_capacity(DEFAULT_BUF_SIZE),
            write_buf: BytesMut::with_capacity(DEFAULT_BUF_SIZE),
        }
    }

    pub fn into_stream(self) -> MaybeTlsStream {
        self.stream
    }

    pub fn stream_mut(&mut self) -> &mut MaybeTlsStream {
        &mut self.stream
    }

    pub fn is_tls(&self) -> bool {
        self.stream.is_tls()
    }

    /// `read_timeout(t)`: blocks up to `timeout`, returning a decoded frame,
    /// [`ReadOutcome::Timeout`], or [`ReadOutcome::Eof`] on clean backend/client
    /// disconnect.
    pub async fn read_timeout(&mut self, timeout: Duration) -> Result<ReadOutcome> {
        match tokio::time::timeout(timeout, self.read_block_raw()).await {
            Ok(result) => result,
            Err(_) => Ok(ReadOutcome::Timeout),
        }
    }

    /// `read_block`: blocks until one full frame is available.
    pub async fn read_block(&mut self) -> Result<Frame> {
        match self.read_block_raw().await? {
            ReadOutcome::Frame(f) => Ok(f),
            ReadOutcome::Timeout => unreachable!("read_block_raw never times out"),
            ReadOutcome::Eof => Err(Error::Io(std::io::ErrorKind::UnexpectedEof.into())),
        }
    }

    /// Like [`Self::read_block`] but surfaces a clean disconnect as
    /// [`ReadOutcome::Eof`] instead of an error — what the pipelines want
    /// while relaying, since "the peer hung up" ends a session, it doesn't
    /// fail one.
    pub async fn read_block_or_eof(&mut self) -> Result<ReadOutcome> {
        self.read_block_raw().await
    }

    async fn read_block_raw(&mut self) -> Result<ReadOutcome> {
        loop {
            if let Some(frame) = self.try_parse_frame()? {
                return Ok(ReadOutcome::Frame(frame));
            }

            let mut chunk = [0u8; DEFAULT_BUF_SIZE];
            let n = self.stream.read(&mut chunk).await?;
            if n == 0 {
                return Ok(ReadOutcome::Eof);
            }
            self.read_buf.extend_from_slice(&chunk[..n]);
        }
    }

    fn try_parse_frame(&mut self) -> Result<Option<Frame>> {
        if self.read_buf.len() < 5 {
            return Ok(None);
        }
        let kind = self.read_buf[0];
        let len = i32::from_be_bytes(self.read_buf[1..5].try_into().unwrap());
        if len < 4 {
            return Err(Error::protocol(format!("negative/short frame length: {len}")));
        }
        let total = 1 + len as usize;
        if self.read_buf.len() < total {
            return Ok(None);
        }

        let mut frame_buf = self.read_buf.split_to(total);
        frame_buf.advance(5);
        Ok(Some(Frame {
            kind,
            contents: frame_buf.freeze(),
        }))
    }

    /// `write(msg)`: buffers one fully-encoded frame; caller flushes
    /// explicitly to batch writes the way `sqlx`'s `BufferedSocket` does.
    pub fn write_frame(&mut self, format: MessageFormat, body: &impl Encode) {
        self.write_buf.extend_from_slice(&super::frontend::frame(format, body));
    }

    pub fn write_raw(&mut self, bytes: &[u8]) {
        self.write_buf.extend_from_slice(bytes);
    }

    pub async fn flush(&mut self) -> Result<()> {
        while !self.write_buf.is_empty() {
            let n = self.stream.write(&self.write_buf).await?;
            self.write_buf.advance(n);
        }
        self.stream.flush().await?;
        Ok(())
    }

    pub async fn write_and_flush(&mut self, format: MessageFormat, body: &impl Encode) -> Result<()> {
        self.write_frame(format, body);
        self.flush().await
    }
}

/// `extract_message(kind, buffer)`: scans a concatenation of already-framed
/// messages and returns the decoded contents of the first matching `kind`.
pub fn extract_message<T: Decode>(kind: u8, buffer: &[u8]) -> Result<Option<T>> {
    extract_message_offset(0, kind, buffer).map(|found| found.map(|(_, value)| value))
}

/// `extract_message_offset(offset, buffer)`: same scan, but starting at
/// `offset` and also returning the offset *past* the matched frame, so a
/// caller can keep iterating server parameters.
pub fn extract_message_offset<T: Decode>(
    offset: usize,
    kind: u8,
    buffer: &[u8],
) -> Result<Option<(usize, T)>> {
    let mut pos = offset;
    while pos + 5 <= buffer.len() {
        let this_kind = buffer[pos];
        let len = i32::from_be_bytes(buffer[pos + 1..pos + 5].try_into().unwrap());
        if len < 4 {
            return Err(Error::protocol("negative/short frame length while scanning"));
        }
        let total = 1 + len as usize;
        if pos + total > buffer.len() {
            break;
        }
        if this_kind == kind {
            let contents = Bytes::copy_from_slice(&buffer[pos + 5..pos + total]);
            let value = T::decode(contents)?;
            return Ok(Some((pos + total, value)));
        }
        pos += total;
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::backend::BackendKeyData;

    fn frame_bytes(kind: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![kind];
        out.extend_from_slice(&(payload.len() as i32 + 4).to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn extract_message_finds_matching_kind() {
        let mut buf = Vec::new();
        buf.extend(frame_bytes(b'S', b"application_name\0psql\0"));
        let mut key_data = Vec::new();
        key_data.extend_from_slice(&42i32.to_be_bytes());
        key_data.extend_from_slice(&99i32.to_be_bytes());
        buf.extend(frame_bytes(b'K', &key_data));

        let found: Option<BackendKeyData> = extract_message(b'K', &buf).unwrap();
        let found = found.unwrap();
        assert_eq!(found.process_id, 42);
        assert_eq!(found.secret_key, 99);
    }

    #[test]
    fn extract_message_offset_iterates() {
        let mut buf = Vec::new();
        buf.extend(frame_bytes(b'S', b"a\0b\0"));
        buf.extend(frame_bytes(b'S', b"c\0d\0"));

        let (offset, first): (usize, super::super::backend::ParameterStatus) =
            extract_message_offset(0, b'S', &buf).unwrap().unwrap();
        assert_eq!(first.name, "a");
        let (_offset2, second): (usize, super::super::backend::ParameterStatus) =
            extract_message_offset(offset, b'S', &buf).unwrap().unwrap();
        assert_eq!(second.name, "c");
    }
}
