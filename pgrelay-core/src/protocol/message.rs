//! The message envelope shared by every decoded frame: a one-byte kind tag
//! plus its already length-delimited contents. Startup-phase packets
//! (`StartupMessage`, `SSLRequest`, `CancelRequest`, `GSSENCRequest`) have no
//! kind byte and are handled separately in [`super::startup`].
//!
//! PostgreSQL reuses kind bytes across directions (`'C'` is `CommandComplete`
//! from the backend but `Close` from the frontend), so decoding is always
//! relative to a `Direction` — pgrelay reads frontend frames from clients and
//! backend frames from servers, never both through the same decoder.

use bytes::Bytes;

use crate::error::{Error, Result};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Direction {
    Frontend,
    Backend,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MessageFormat {
    // backend
    Authentication,
    BackendKeyData,
    BindComplete,
    CloseComplete,
    CommandComplete,
    CopyInResponse,
    CopyOutResponse,
    CopyBothResponse,
    DataRow,
    EmptyQueryResponse,
    ErrorResponse,
    NoData,
    NoticeResponse,
    NotificationResponse,
    ParameterDescription,
    ParameterStatus,
    ParseComplete,
    PortalSuspended,
    ReadyForQuery,
    RowDescription,
    CopyData,
    CopyDone,

    // frontend
    Bind,
    Close,
    CopyFail,
    Describe,
    Execute,
    Flush,
    Parse,
    PasswordMessage,
    Query,
    Sync,
    Terminate,
    FunctionCall,
}

impl MessageFormat {
    pub fn try_from_u8(direction: Direction, kind: u8) -> Result<Self> {
        // https://www.postgresql.org/docs/current/protocol-message-formats.html
        use Direction::*;
        Ok(match (direction, kind) {
            (Backend, b'R') => MessageFormat::Authentication,
            (Backend, b'K') => MessageFormat::BackendKeyData,
            (Backend, b'2') => MessageFormat::BindComplete,
            (Backend, b'3') => MessageFormat::CloseComplete,
            (Backend, b'C') => MessageFormat::CommandComplete,
            (Backend, b'G') => MessageFormat::CopyInResponse,
            (Backend, b'H') => MessageFormat::CopyOutResponse,
            (Backend, b'W') => MessageFormat::CopyBothResponse,
            (_, b'd') => MessageFormat::CopyData,
            (_, b'c') => MessageFormat::CopyDone,
            (Backend, b'D') => MessageFormat::DataRow,
            (Backend, b'I') => MessageFormat::EmptyQueryResponse,
            (Backend, b'E') => MessageFormat::ErrorResponse,
            (Backend, b'n') => MessageFormat::NoData,
            (Backend, b'N') => MessageFormat::NoticeResponse,
            (Backend, b'A') => MessageFormat::NotificationResponse,
            (Backend, b't') => MessageFormat::ParameterDescription,
            (Backend, b'S') => MessageFormat::ParameterStatus,
            (Backend, b'1') => MessageFormat::ParseComplete,
            (Backend, b's') => MessageFormat::PortalSuspended,
            (Backend, b'Z') => MessageFormat::ReadyForQuery,
            (Backend, b'T') => MessageFormat::RowDescription,

            (Frontend, b'B') => MessageFormat::Bind,
            (Frontend, b'C') => MessageFormat::Close,
            (Frontend, b'f') => MessageFormat::CopyFail,
            (Frontend, b'D') => MessageFormat::Describe,
            (Frontend, b'E') => MessageFormat::Execute,
            (Frontend, b'H') => MessageFormat::Flush,
            (Frontend, b'P') => MessageFormat::Parse,
            (Frontend, b'p') => MessageFormat::PasswordMessage,
            (Frontend, b'Q') => MessageFormat::Query,
            (Frontend, b'S') => MessageFormat::Sync,
            (Frontend, b'X') => MessageFormat::Terminate,
            (Frontend, b'F') => MessageFormat::FunctionCall,

            (dir, other) => {
                return Err(Error::protocol(format!(
                    "unknown {:?} message kind byte: {:?} ({})",
                    dir, other as char, other
                )))
            }
        })
    }

    pub fn to_u8(self) -> u8 {
        match self {
            MessageFormat::Authentication => b'R',
            MessageFormat::BackendKeyData => b'K',
            MessageFormat::BindComplete => b'2',
            MessageFormat::CloseComplete => b'3',
            MessageFormat::CommandComplete => b'C',
            MessageFormat::CopyInResponse => b'G',
            MessageFormat::CopyOutResponse => b'H',
            MessageFormat::CopyBothResponse => b'W',
            MessageFormat::CopyData => b'd',
            MessageFormat::CopyDone => b'c',
            MessageFormat::DataRow => b'D',
            MessageFormat::EmptyQueryResponse => b'I',
            MessageFormat::ErrorResponse => b'E',
            MessageFormat::NoData => b'n',
            MessageFormat::NoticeResponse => b'N',
            MessageFormat::NotificationResponse => b'A',
            MessageFormat::ParameterDescription => b't',
            MessageFormat::ParameterStatus => b'S',
            MessageFormat::ParseComplete => b'1',
            MessageFormat::PortalSuspended => b's',
            MessageFormat::ReadyForQuery => b'Z',
            MessageFormat::RowDescription => b'T',
            MessageFormat::Bind => b'B',
            MessageFormat::Close => b'C',
            MessageFormat::CopyFail => b'f',
            MessageFormat::Describe => b'D',
            MessageFormat::Execute => b'E',
            MessageFormat::Flush => b'H',
            MessageFormat::Parse => b'P',
            MessageFormat::PasswordMessage => b'p',
            MessageFormat::Query => b'Q',
            MessageFormat::Sync => b'S',
            MessageFormat::Terminate => b'X',
            MessageFormat::FunctionCall => b'F',
        }
    }
}

/// A single, already-framed wire message: `(kind, length, payload)` with the
/// kind/length already stripped off by the codec.
#[derive(Debug, Clone)]
pub struct Message {
    pub format: MessageFormat,
    pub contents: Bytes,
}

impl Message {
    pub fn decode<T: super::io::Decode>(&self) -> Result<T> {
        T::decode(self.contents.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_kind_bytes_disambiguate_by_direction() {
        assert_eq!(
            MessageFormat::try_from_u8(Direction::Backend, b'C').unwrap(),
            MessageFormat::CommandComplete
        );
        assert_eq!(
            MessageFormat::try_from_u8(Direction::Frontend, b'C').unwrap(),
            MessageFormat::Close
        );
    }
}
