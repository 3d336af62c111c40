//! Message bodies pgrelay decodes when acting as a client against an
//! upstream PostgreSQL server.
//!
//! Grounded in `sqlx_core::postgres::message::authentication` /
//! `backend_key_data` / `ready_for_query` / `response` — the shapes are the
//! same, generalized to also support the server role pgrelay plays toward
//! its own clients (see [`crate::auth`]).

use bytes::{Buf, BufMut, Bytes, BytesMut};
use memchr::memchr;

use crate::error::Error;

use super::io::{Decode, Encode, PgBufExt, PgBufMutExt};

/// `AuthenticationXXX` (`'R'`), decoded from the 4-byte method code onward.
#[derive(Debug, Clone)]
pub enum Authentication {
    Ok,
    CleartextPassword,
    Md5Password { salt: [u8; 4] },
    Sasl { mechanisms: Vec<String> },
    SaslContinue(Bytes),
    SaslFinal(Bytes),
}

impl Decode for Authentication {
    fn decode(mut buf: Bytes) -> Result<Self, Error> {
        Ok(match buf.get_i32() {
            0 => Authentication::Ok,
            3 => Authentication::CleartextPassword,
            5 => {
                let mut salt = [0u8; 4];
                buf.copy_to_slice(&mut salt);
                Authentication::Md5Password { salt }
            }
            10 => {
                let mut mechanisms = Vec::new();
                loop {
                    let rest = buf.as_ref();
                    let nul = memchr(0, rest).ok_or_else(|| {
                        Error::protocol("unterminated SASL mechanism list")
                    })?;
                    if nul == 0 {
                        buf.advance(1);
                        break;
                    }
                    let name = std::str::from_utf8(&rest[..nul])
                        .map_err(|_| Error::protocol("SASL mechanism name was not utf-8"))?
                        .to_owned();
                    buf.advance(nul + 1);
                    mechanisms.push(name);
                }
                Authentication::Sasl { mechanisms }
            }
            11 => Authentication::SaslContinue(buf),
            12 => Authentication::SaslFinal(buf),
            other => {
                return Err(Error::protocol(format!(
                    "unsupported authentication method code: {other}"
                )))
            }
        })
    }
}

/// `BackendKeyData` (`'K'`): the `(pid, secret)` pair honored by
/// `CancelRequest`.
#[derive(Debug, Clone, Copy)]
pub struct BackendKeyData {
    pub process_id: i32,
    pub secret_key: i32,
}

impl Decode for BackendKeyData {
    fn decode(mut buf: Bytes) -> Result<Self, Error> {
        Ok(BackendKeyData {
            process_id: buf.get_i32(),
            secret_key: buf.get_i32(),
        })
    }
}

/// `ReadyForQuery` (`'Z'`): the one-byte transaction-status indicator the
/// transaction pipeline inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Idle,
    InTransaction,
    Failed,
}

impl TransactionStatus {
    pub fn from_byte(b: u8) -> Result<Self, Error> {
        match b {
            b'I' => Ok(TransactionStatus::Idle),
            b'T' => Ok(TransactionStatus::InTransaction),
            b'E' => Ok(TransactionStatus::Failed),
            other => Err(Error::protocol(format!(
                "unknown transaction status byte: {:?}",
                other as char
            ))),
        }
    }

    pub fn to_byte(self) -> u8 {
        match self {
            TransactionStatus::Idle => b'I',
            TransactionStatus::InTransaction => b'T',
            TransactionStatus::Failed => b'E',
        }
    }
}

impl Decode for TransactionStatus {
    fn decode(mut buf: Bytes) -> Result<Self, Error> {
        TransactionStatus::from_byte(buf.get_u8())
    }
}

/// `ParameterStatus` (`'S'`): `(name, value)`, replayed verbatim to clients
/// from a slot's cached `security_messages` tail.
#[derive(Debug, Clone)]
pub struct ParameterStatus {
    pub name: String,
    pub value: String,
}

impl Decode for ParameterStatus {
    fn decode(mut buf: Bytes) -> Result<Self, Error> {
        Ok(ParameterStatus {
            name: buf.get_str_nul()?,
            value: buf.get_str_nul()?,
        })
    }
}

/// `ErrorResponse`/`NoticeResponse` (`'E'`/`'N'`): a sequence of
/// `(field_code, value)` pairs terminated by a nul byte.
#[derive(Debug, Clone, Default)]
pub struct ErrorResponse {
    pub severity: Option<String>,
    pub code: Option<String>,
    pub message: Option<String>,
}

impl Decode for ErrorResponse {
    fn decode(mut buf: Bytes) -> Result<Self, Error> {
        let mut out = ErrorResponse::default();
        loop {
            if !buf.has_remaining() {
                break;
            }
            let field = buf.get_u8();
            if field == 0 {
                break;
            }
            let value = buf.get_str_nul()?;
            match field {
                b'S' => out.severity = Some(value),
                b'C' => out.code = Some(value),
                b'M' => out.message = Some(value),
                _ => {}
            }
        }
        Ok(out)
    }
}

impl ErrorResponse {
    pub fn sqlstate_or(&self, default: &str) -> String {
        self.code.clone().unwrap_or_else(|| default.to_owned())
    }

    /// Builds the `ErrorResponse` pgrelay sends to a client directly (HBA
    /// reject, disabled database, graceful-drain refusal).
    pub fn simple(severity: &str, code: &str, message: impl Into<String>) -> Self {
        ErrorResponse {
            severity: Some(severity.to_owned()),
            code: Some(code.to_owned()),
            message: Some(message.into()),
        }
    }
}

impl Encode for ErrorResponse {
    fn encode(&self, buf: &mut BytesMut) {
        if let Some(severity) = &self.severity {
            buf.put_u8(b'S');
            buf.put_str_nul(severity);
        }
        if let Some(code) = &self.code {
            buf.put_u8(b'C');
            buf.put_str_nul(code);
        }
        if let Some(message) = &self.message {
            buf.put_u8(b'M');
            buf.put_str_nul(message);
        }
        buf.put_u8(0);
    }
}

/// `DataRow` (`'D'`): one row of the auth-query result set (mode D —
/// `SELECT * FROM public.pgrelay_get_password($1)`).
#[derive(Debug, Clone)]
pub struct DataRow {
    pub columns: Vec<Option<Bytes>>,
}

impl Decode for DataRow {
    fn decode(mut buf: Bytes) -> Result<Self, Error> {
        let n = buf.get_i16() as usize;
        let mut columns = Vec::with_capacity(n);
        for _ in 0..n {
            let len = buf.get_i32();
            if len < 0 {
                columns.push(None);
            } else {
                columns.push(Some(buf.split_to(len as usize)));
            }
        }
        Ok(DataRow { columns })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_md5_challenge() {
        let mut buf = bytes::BytesMut::new();
        buf.extend_from_slice(&5i32.to_be_bytes());
        buf.extend_from_slice(&[1, 2, 3, 4]);
        match Authentication::decode(buf.freeze()).unwrap() {
            Authentication::Md5Password { salt } => assert_eq!(salt, [1, 2, 3, 4]),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn decodes_sasl_mechanism_list() {
        let mut buf = bytes::BytesMut::new();
        buf.extend_from_slice(&10i32.to_be_bytes());
        buf.extend_from_slice(b"SCRAM-SHA-256\0\0");
        match Authentication::decode(buf.freeze()).unwrap() {
            Authentication::Sasl { mechanisms } => {
                assert_eq!(mechanisms, vec!["SCRAM-SHA-256".to_owned()])
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
