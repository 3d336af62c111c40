//! The handful of packets that precede the normal kind-byte framing:
//! `(length: i32, code: i32, ...)` — protocol v3 (196608), plus `SSLRequest`
//! (80877103), `GSSENCRequest` (80877104), and `CancelRequest` (80877102).

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::AsyncReadExt;

use crate::error::{Error, Result};

use super::io::{PgBufExt, PgBufMutExt};

pub const PROTOCOL_VERSION_3: i32 = 196608;
pub const SSL_REQUEST_CODE: i32 = 80877103;
pub const GSSENC_REQUEST_CODE: i32 = 80877104;
pub const CANCEL_REQUEST_CODE: i32 = 80877102;

/// The first packet of a new frontend connection, before any kind byte is
/// in play.
#[derive(Debug)]
pub enum StartupPacket {
    Startup(StartupMessage),
    Ssl,
    GssEnc,
    Cancel(CancelRequest),
}

impl StartupPacket {
    /// Reads the length-prefixed body (the caller has already consumed the
    /// 4-byte length and is handing us exactly `length - 4` bytes).
    pub fn decode(mut buf: Bytes) -> Result<Self> {
        let code = buf.get_i32();
        match code {
            SSL_REQUEST_CODE => Ok(StartupPacket::Ssl),
            GSSENC_REQUEST_CODE => Ok(StartupPacket::GssEnc),
            CANCEL_REQUEST_CODE => {
                let process_id = buf.get_i32();
                let secret_key = buf.get_i32();
                Ok(StartupPacket::Cancel(CancelRequest {
                    process_id,
                    secret_key,
                }))
            }
            PROTOCOL_VERSION_3 => Ok(StartupPacket::Startup(StartupMessage::decode_params(buf)?)),
            other => Err(Error::protocol(format!(
                "unsupported startup/negotiation code: {other}"
            ))),
        }
    }
}

/// `StartupMessage` — parameters are a sequence of nul-terminated
/// `name, value` pairs terminated by an empty string.
#[derive(Debug, Default, Clone)]
pub struct StartupMessage {
    pub params: Vec<(String, String)>,
}

impl StartupMessage {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn user(&self) -> Option<&str> {
        self.get("user")
    }

    pub fn database(&self) -> Option<&str> {
        self.get("database").or_else(|| self.get("user"))
    }

    fn decode_params(mut buf: Bytes) -> Result<Self> {
        let mut params = Vec::new();
        loop {
            let name = buf.get_str_nul()?;
            if name.is_empty() {
                break;
            }
            let value = buf.get_str_nul()?;
            params.push((name, value));
        }
        Ok(StartupMessage { params })
    }

    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_length_prefixed(|buf| {
            buf.put_i32(PROTOCOL_VERSION_3);
            for (k, v) in &self.params {
                buf.put_str_nul(k);
                buf.put_str_nul(v);
            }
            buf.put_u8(0);
        });
        buf
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CancelRequest {
    pub process_id: i32,
    pub secret_key: i32,
}

impl CancelRequest {
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_length_prefixed(|buf| {
            buf.put_i32(CANCEL_REQUEST_CODE);
            buf.put_i32(self.process_id);
            buf.put_i32(self.secret_key);
        });
        buf
    }
}

pub fn encode_ssl_request() -> BytesMut {
    let mut buf = BytesMut::new();
    buf.put_length_prefixed(|buf| buf.put_i32(SSL_REQUEST_CODE));
    buf
}

pub fn encode_gssenc_request() -> BytesMut {
    let mut buf = BytesMut::new();
    buf.put_length_prefixed(|buf| buf.put_i32(GSSENC_REQUEST_CODE));
    buf
}

/// Reads one startup-phase packet directly off a raw stream: a new
/// connection's first bytes have no kind byte, so this can't go through
/// [`super::codec::PgCodec`], which assumes the normal `(kind, length,
/// body)` framing. Used once per connection, and again after an
/// `SSLRequest` accept to read the real `StartupMessage` over the
/// now-TLS-wrapped stream.
pub async fn read_startup_packet<S>(stream: &mut S) -> Result<StartupPacket>
where
    S: AsyncReadExt + Unpin,
{
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = i32::from_be_bytes(len_buf);
    if len < 4 {
        return Err(Error::protocol(format!("negative/short startup packet length: {len}")));
    }
    let mut body = vec![0u8; (len - 4) as usize];
    stream.read_exact(&mut body).await?;
    StartupPacket::decode(Bytes::from(body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_startup_params() {
        let msg = StartupMessage {
            params: vec![
                ("user".into(), "alice".into()),
                ("database".into(), "postgres".into()),
            ],
        };
        let mut encoded = msg.encode();
        let _len = encoded.get_i32();
        let decoded = StartupPacket::decode(encoded.freeze()).unwrap();
        match decoded {
            StartupPacket::Startup(s) => {
                assert_eq!(s.user(), Some("alice"));
                assert_eq!(s.database(), Some("postgres"));
            }
            _ => panic!("expected StartupMessage"),
        }
    }

    #[test]
    fn recognizes_ssl_request_code() {
        let mut encoded = encode_ssl_request();
        let _len = encoded.get_i32();
        assert!(matches!(
            StartupPacket::decode(encoded.freeze()).unwrap(),
            StartupPacket::Ssl
        ));
    }
}
