//! The PostgreSQL wire protocol v3: frame envelopes, startup/negotiation
//! packets, and the backend/frontend message bodies the auth engine and
//! pipelines need to inspect.
//!
//! pgrelay never parses SQL and only decodes the handful of message kinds
//! the core touches directly (authentication frames, `ReadyForQuery`,
//! `ErrorResponse`); everything else moves through the pipelines as opaque
//! framed bytes (see [`codec::Frame`]).

pub mod backend;
pub mod codec;
pub mod frontend;
pub mod io;
pub mod message;
pub mod startup;

pub use codec::{Frame, PgCodec};
pub use io::{Decode, Encode};
pub use message::{Direction, Message, MessageFormat};
pub use startup::{
    read_startup_packet, CancelRequest, StartupMessage, StartupPacket, CANCEL_REQUEST_CODE,
    GSSENC_REQUEST_CODE, PROTOCOL_VERSION_3, SSL_REQUEST_CODE,
};

/// Upper bound on a single captured authentication frame
/// (`security_messages[0..4]` on a slot). A fixed buffer per captured frame
/// keeps a slot's memory footprint bounded; 512 bytes comfortably covers
/// `AuthenticationMD5Password`/`AuthenticationSASL*`/`BackendKeyData` plus a
/// typical `ParameterStatus` tail entry.
pub const SECURITY_BUFFER_SIZE: usize = 512;

/// Bound on a password's length in Unicode scalar values, enforced at
/// config-load time.
pub const MAX_PASSWORD_CHARS: usize = 256;
