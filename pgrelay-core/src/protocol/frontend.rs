//! Message bodies pgrelay decodes/encodes when acting as the server side of
//! the wire protocol toward a connected client (modes B/C).

use bytes::{Buf, Bytes, BytesMut};

use crate::error::Error;

use super::io::{Decode, Encode, PgBufExt, PgBufMutExt};
use super::message::MessageFormat;

/// `PasswordMessage` (`'p'`): cleartext, MD5, or the first/continuing SASL
/// frame, all sharing the same kind byte — interpretation depends on which
/// `Authentication` request preceded it.
#[derive(Debug, Clone)]
pub struct PasswordMessage {
    pub payload: Bytes,
}

impl Decode for PasswordMessage {
    fn decode(buf: Bytes) -> Result<Self, Error> {
        Ok(PasswordMessage { payload: buf })
    }
}

impl PasswordMessage {
    /// Cleartext/MD5 password messages are a single nul-terminated string.
    pub fn as_password_str(&self) -> Result<String, Error> {
        let mut buf = self.payload.clone();
        buf.get_str_nul()
    }
}

impl Encode for PasswordMessage {
    fn encode(&self, buf: &mut BytesMut) {
        buf.extend_from_slice(&self.payload);
    }
}

/// `SASLInitialResponse` (`'p'`): `name\0`, `i32` response length, response bytes.
#[derive(Debug, Clone)]
pub struct SaslInitialResponse {
    pub mechanism: String,
    pub data: Bytes,
}

impl Decode for SaslInitialResponse {
    fn decode(mut buf: Bytes) -> Result<Self, Error> {
        let mechanism = buf.get_str_nul()?;
        let len = buf.get_i32();
        let data = if len < 0 {
            Bytes::new()
        } else {
            buf.split_to(len as usize)
        };
        Ok(SaslInitialResponse { mechanism, data })
    }
}

/// `SASLResponse` (`'p'`): raw SASL data, no further framing.
#[derive(Debug, Clone)]
pub struct SaslResponse {
    pub data: Bytes,
}

impl Decode for SaslResponse {
    fn decode(buf: Bytes) -> Result<Self, Error> {
        Ok(SaslResponse { data: buf })
    }
}

impl Encode for SaslResponse {
    fn encode(&self, buf: &mut BytesMut) {
        buf.extend_from_slice(&self.data);
    }
}

/// `Query` (`'Q'`): a single nul-terminated SQL string. pgrelay only ever
/// sends the empty-string validation query; it never parses a query it
/// relays from a client.
#[derive(Debug, Clone)]
pub struct Query {
    pub sql: String,
}

impl Encode for Query {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_str_nul(&self.sql);
    }
}

impl Decode for Query {
    fn decode(mut buf: Bytes) -> Result<Self, Error> {
        Ok(Query {
            sql: buf.get_str_nul()?,
        })
    }
}

/// `Terminate` (`'X'`): no body.
pub struct Terminate;

impl Encode for Terminate {
    fn encode(&self, _buf: &mut BytesMut) {}
}

/// Wraps a message body with its kind byte and length prefix, ready to
/// write to a socket: `(kind, length, payload)`.
pub fn frame<T: Encode>(format: MessageFormat, body: &T) -> BytesMut {
    let mut buf = BytesMut::new();
    buf.put_u8(format.to_u8());
    buf.put_length_prefixed(|buf| body.encode(buf));
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_sasl_initial_response() {
        let mut raw = BytesMut::new();
        raw.put_str_nul("SCRAM-SHA-256");
        let data = b"n,,n=,r=abc";
        raw.put_i32(data.len() as i32);
        raw.extend_from_slice(data);
        let decoded = SaslInitialResponse::decode(raw.freeze()).unwrap();
        assert_eq!(decoded.mechanism, "SCRAM-SHA-256");
        assert_eq!(&decoded.data[..], data);
    }
}
