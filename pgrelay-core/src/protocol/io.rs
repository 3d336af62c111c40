//! Small extensions over the `bytes` crate's `Buf`/`BufMut` for the bits of
//! wire encoding PostgreSQL needs that aren't expressible generically: nul
//! terminated strings and length-prefixed frames. All wire integers are
//! big-endian.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use memchr::memchr;

use crate::error::{Error, Result};

pub trait PgBufMutExt: BufMut {
    fn put_str_nul(&mut self, s: &str);

    /// Writes a placeholder `i32` length, runs `f`, then backpatches the
    /// placeholder with the number of bytes `f` wrote (length field included,
    /// per postgres framing).
    fn put_length_prefixed<F>(&mut self, f: F)
    where
        F: FnOnce(&mut Self);
}

impl PgBufMutExt for BytesMut {
    fn put_str_nul(&mut self, s: &str) {
        self.put_slice(s.as_bytes());
        self.put_u8(0);
    }

    fn put_length_prefixed<F>(&mut self, f: F)
    where
        F: FnOnce(&mut Self),
    {
        let start = self.len();
        self.put_i32(0);
        f(self);
        let len = (self.len() - start) as i32;
        self[start..start + 4].copy_from_slice(&len.to_be_bytes());
    }
}

pub trait PgBufExt: Buf {
    fn get_str_nul(&mut self) -> Result<String>;
    fn get_str(&mut self, len: usize) -> Result<String>;
}

impl PgBufExt for Bytes {
    fn get_str_nul(&mut self) -> Result<String> {
        let slice = self.as_ref();
        let nul = memchr(0, slice).ok_or_else(|| Error::protocol("unterminated string"))?;
        let s = std::str::from_utf8(&slice[..nul])
            .map_err(|_| Error::protocol("string was not valid utf-8"))?
            .to_owned();
        self.advance(nul + 1);
        Ok(s)
    }

    fn get_str(&mut self, len: usize) -> Result<String> {
        if self.remaining() < len {
            return Err(Error::protocol("buffer underrun reading fixed-length string"));
        }
        let s = std::str::from_utf8(&self.as_ref()[..len])
            .map_err(|_| Error::protocol("string was not valid utf-8"))?
            .to_owned();
        self.advance(len);
        Ok(s)
    }
}

/// Encodes a complete message body into an owned buffer.
pub trait Encode {
    fn encode(&self, buf: &mut BytesMut);
}

/// Decodes a message body from its (already length-delimited) contents.
pub trait Decode: Sized {
    fn decode(buf: Bytes) -> Result<Self>;
}
