//! Drives the four authentication modes (server pass-through, frontend
//! replay, frontend password, auth-query) over a [`PgCodec`]. Pure crypto
//! lives in [`super::md5`]/[`super::scram`]; this module is the
//! message-sequencing layer on top, the analogue of
//! `sqlx_core::postgres::connection::establish` generalized to also play
//! the server role.

use std::time::Duration;

use bytes::{Bytes, BytesMut};

use crate::error::{AuthFailure, AuthOutcome, Error, Result};
use crate::hba::AuthMethod;
use crate::protocol::backend::{Authentication, BackendKeyData, ErrorResponse};
use crate::protocol::codec::{Frame, PgCodec, ReadOutcome};
use crate::protocol::frontend::{PasswordMessage, SaslInitialResponse, SaslResponse};
use crate::protocol::message::{Direction, MessageFormat};
use crate::protocol::SECURITY_BUFFER_SIZE;

use super::md5;
use super::scram::{self, ScramVerifier};

/// Which authentication flavor ultimately succeeded for a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityKind {
    Trust,
    Password,
    Md5,
    Scram256,
    Invalid,
}

/// One of the auth and post-auth frames captured into a slot while it logs
/// into its backend, kept verbatim so a later client reusing the slot can
/// be replayed the same exchange (and the same startup tail) without a
/// fresh backend round trip. `kind` is the wire message kind byte, used to
/// pick the post-auth tail (`BackendKeyData`/`ParameterStatus`/
/// `ReadyForQuery`) back out of the captured sequence. `sasl_bare` holds
/// the already-decoded bare SCRAM string when this frame is a SASL
/// initial/continue message, so replay never has to re-derive it from a
/// brittle fixed byte offset.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    pub kind: u8,
    pub raw: Vec<u8>,
    pub sasl_bare: Option<String>,
}

impl CapturedFrame {
    pub fn from_frame(frame: &Frame, sasl_bare: Option<String>) -> Result<Self> {
        let raw = frame.encode_raw().to_vec();
        if raw.len() > SECURITY_BUFFER_SIZE {
            return Err(Error::protocol(format!(
                "captured auth frame of {} bytes exceeds SECURITY_BUFFER_SIZE ({SECURITY_BUFFER_SIZE})",
                raw.len()
            )));
        }
        Ok(CapturedFrame { kind: frame.kind, raw, sasl_bare })
    }

    /// Whether this is one of the server's `Authentication` (`'R'`) frames
    /// rather than part of the post-auth startup tail. A fresh client
    /// authenticates on its own terms (trust, replay, or frontend
    /// password) and must never see the backend's own challenge/`Ok`
    /// frames — only the tail that follows them.
    pub fn is_auth_frame(&self) -> bool {
        self.kind == b'R'
    }
}

/// The outcome of driving a backend (client-role) login — mode A (a fresh
/// slot's pass-through login), and the client-role connections prefill and
/// auth-query also open.
pub struct BackendLogin {
    pub security: SecurityKind,
    pub captured: Vec<CapturedFrame>,
    pub backend_pid: i32,
    pub backend_secret: i32,
}

pub struct AuthEngine;

impl AuthEngine {
    /// Authenticates pgrelay, as a client, against an upstream server using
    /// a known plaintext password. Used for prefill and the auth-query
    /// superuser connection, where there is no real client to relay bytes
    /// from/to.
    pub async fn backend_login(
        codec: &mut PgCodec,
        username: &str,
        password: Option<&str>,
        timeout: Duration,
    ) -> Result<BackendLogin> {
        let mut captured = Vec::new();
        let frame = Self::recv_timeout(codec, timeout).await?;
        let auth: Authentication = frame.to_message(Direction::Backend)?.decode()?;
        captured.push(CapturedFrame::from_frame(&frame, None)?);

        let security = match auth {
            Authentication::Ok => SecurityKind::Trust,
            Authentication::CleartextPassword => {
                let password = password.ok_or(Error::Auth(AuthFailure::Error))?;
                codec
                    .write_and_flush(
                        MessageFormat::PasswordMessage,
                        &PasswordMessage {
                            payload: Bytes::from(format!("{password}\0")),
                        },
                    )
                    .await?;
                SecurityKind::Password
            }
            Authentication::Md5Password { salt } => {
                let password = password.ok_or(Error::Auth(AuthFailure::Error))?;
                let resp = md5::response(username, password, salt);
                codec
                    .write_and_flush(
                        MessageFormat::PasswordMessage,
                        &PasswordMessage {
                            payload: Bytes::from(format!("{resp}\0")),
                        },
                    )
                    .await?;
                SecurityKind::Md5
            }
            Authentication::Sasl { mechanisms } => {
                if !mechanisms.iter().any(|m| m == "SCRAM-SHA-256") {
                    return Err(Error::protocol("server does not offer SCRAM-SHA-256"));
                }
                let password = password.ok_or(Error::Auth(AuthFailure::Error))?;
                Self::client_scram_exchange(codec, username, password, timeout, &mut captured).await?;
                SecurityKind::Scram256
            }
            Authentication::SaslContinue(_) | Authentication::SaslFinal(_) => {
                return Err(Error::protocol("unexpected SASL frame before initial response"));
            }
        };

        if security != SecurityKind::Trust {
            let reply = Self::recv_timeout(codec, timeout).await?;
            match reply.to_message(Direction::Backend)?.decode::<Authentication>()? {
                Authentication::Ok => {}
                _ => return Err(Error::Auth(AuthFailure::BadPassword)),
            }
            captured.push(CapturedFrame::from_frame(&reply, None)?);
        }

        // BackendKeyData, then ParameterStatus* until ReadyForQuery.
        let mut backend_pid = 0;
        let mut backend_secret = 0;
        loop {
            let frame = Self::recv_timeout(codec, timeout).await?;
            let message = frame.to_message(Direction::Backend)?;
            match message.format {
                MessageFormat::BackendKeyData => {
                    let key: BackendKeyData = message.decode()?;
                    backend_pid = key.process_id;
                    backend_secret = key.secret_key;
                    captured.push(CapturedFrame::from_frame(&frame, None)?);
                }
                MessageFormat::ParameterStatus => {
                    captured.push(CapturedFrame::from_frame(&frame, None)?);
                }
                MessageFormat::ReadyForQuery => {
                    captured.push(CapturedFrame::from_frame(&frame, None)?);
                    break;
                }
                MessageFormat::ErrorResponse => {
                    let err: ErrorResponse = message.decode()?;
                    return Err(Error::Database(err.message.unwrap_or_default()));
                }
                _ => captured.push(CapturedFrame::from_frame(&frame, None)?),
            }
        }

        Ok(BackendLogin {
            security,
            captured,
            backend_pid,
            backend_secret,
        })
    }

    async fn client_scram_exchange(
        codec: &mut PgCodec,
        _username: &str,
        password: &str,
        timeout: Duration,
        captured: &mut Vec<CapturedFrame>,
    ) -> Result<()> {
        let nonce = scram::random_nonce();
        let client_first_bare = scram::client_first_bare(&nonce);
        codec
            .write_and_flush(
                MessageFormat::PasswordMessage,
                &SaslInitialResponse {
                    mechanism: "SCRAM-SHA-256".to_owned(),
                    data: Bytes::from(scram::client_first_message(&nonce)),
                },
            )
            .await?;

        let frame = Self::recv_timeout(codec, timeout).await?;
        let message = frame.to_message(Direction::Backend)?;
        let continue_bytes = match message.format {
            MessageFormat::Authentication => match message.decode::<Authentication>()? {
                Authentication::SaslContinue(bytes) => bytes,
                _ => return Err(Error::protocol("expected AuthenticationSASLContinue")),
            },
            _ => return Err(Error::protocol("expected AuthenticationSASLContinue")),
        };
        let server_first_raw = String::from_utf8(continue_bytes.to_vec())
            .map_err(|_| Error::protocol("server-first message was not utf-8"))?;
        captured.push(CapturedFrame::from_frame(&frame, Some(server_first_raw.clone()))?);

        let server_first = scram::parse_server_first(&server_first_raw)?;
        let salted = scram::salted_password(password, &server_first.salt, server_first.iterations);
        let client_key = scram::client_key(salted);
        let stored_key = scram::stored_key(client_key);
        let server_key = scram::server_key(salted);

        let without_proof = scram::client_final_without_proof(&server_first.nonce);
        let auth_message = scram::auth_message(&client_first_bare, &server_first_raw, &without_proof);
        let proof = scram::client_proof(client_key, stored_key, &auth_message);
        let final_message = scram::client_final_message(&without_proof, proof);

        codec
            .write_and_flush(
                MessageFormat::PasswordMessage,
                &SaslResponse {
                    data: Bytes::from(final_message),
                },
            )
            .await?;

        let frame = Self::recv_timeout(codec, timeout).await?;
        let message = frame.to_message(Direction::Backend)?;
        match message.format {
            MessageFormat::Authentication => match message.decode::<Authentication>()? {
                Authentication::SaslFinal(bytes) => {
                    let raw = String::from_utf8(bytes.to_vec())
                        .map_err(|_| Error::protocol("server-final message was not utf-8"))?;
                    let signature = scram::parse_server_final(&raw)?;
                    let expected = scram::server_signature(server_key, &auth_message);
                    if signature != expected {
                        return Err(Error::Auth(AuthFailure::BadPassword));
                    }
                    captured.push(CapturedFrame::from_frame(&frame, Some(raw))?);
                    Ok(())
                }
                _ => Err(Error::protocol("expected AuthenticationSASLFinal")),
            },
            _ => Err(Error::protocol("expected AuthenticationSASLFinal")),
        }
    }

    async fn recv_timeout(codec: &mut PgCodec, timeout: Duration) -> Result<Frame> {
        match codec.read_timeout(timeout).await? {
            ReadOutcome::Frame(frame) => Ok(frame),
            ReadOutcome::Timeout => Err(Error::Auth(AuthFailure::Timeout)),
            ReadOutcome::Eof => Err(Error::Io(std::io::ErrorKind::UnexpectedEof.into())),
        }
    }
}

/// A credential known directly to pgrelay, used to drive the server role
/// against a frontend password or an auth-query shadow.
pub enum Credential<'a> {
    Trust,
    Plaintext(&'a str),
    /// An already-hashed `"md5..."` shadow, as returned by an auth-query
    /// lookup, for a user whose stored credential is MD5 rather than
    /// SCRAM. Verified via
    /// [`md5::verify_stored_hash`] without ever recovering the plaintext.
    Md5StoredHash(&'a str),
    ScramVerifier(ScramVerifier),
}

/// Drives the server role of one authentication method against a connected
/// client, given a credential pgrelay already knows (mode C: frontend
/// password; mode D: auth-query shadow). Mode B (pure replay) is handled
/// separately by [`replay_cached`] since it never evaluates a credential at
/// all — it trusts the frame capture from the original mode-A exchange.
pub async fn authenticate_client(
    codec: &mut PgCodec,
    method: AuthMethod,
    username: &str,
    credential: Credential<'_>,
    timeout: Duration,
) -> Result<AuthOutcome> {
    use crate::protocol::frontend::frame as encode_frame;

    match (method, &credential) {
        (AuthMethod::Trust, _) => {
            send_auth_ok(codec).await?;
            Ok(AuthOutcome::Success)
        }
        (AuthMethod::Password, Credential::Plaintext(expected)) => {
            let mut buf = BytesMut::new();
            buf.extend_from_slice(&encode_frame(
                MessageFormat::Authentication,
                &AuthRequestCleartext,
            ));
            codec.write_raw(&buf);
            codec.flush().await?;

            let frame = recv_password(codec, timeout).await?;
            let pm: PasswordMessage = frame.to_message(Direction::Frontend)?.decode()?;
            let received = pm.as_password_str()?;
            use subtle::ConstantTimeEq;
            if bool::from(received.as_bytes().ct_eq(expected.as_bytes())) {
                send_auth_ok(codec).await?;
                Ok(AuthOutcome::Success)
            } else {
                Ok(AuthOutcome::Failure(AuthFailure::BadPassword))
            }
        }
        (AuthMethod::Md5, Credential::Plaintext(expected_password)) => {
            let mut salt = [0u8; 4];
            rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut salt);
            let mut buf = BytesMut::new();
            buf.extend_from_slice(&encode_frame(
                MessageFormat::Authentication,
                &AuthRequestMd5 { salt },
            ));
            codec.write_raw(&buf);
            codec.flush().await?;

            let frame = recv_password(codec, timeout).await?;
            let pm: PasswordMessage = frame.to_message(Direction::Frontend)?.decode()?;
            let received = pm.as_password_str()?;
            if md5::verify(username, expected_password, salt, &received) {
                send_auth_ok(codec).await?;
                Ok(AuthOutcome::Success)
            } else {
                Ok(AuthOutcome::Failure(AuthFailure::BadPassword))
            }
        }
        (AuthMethod::Md5, Credential::Md5StoredHash(stored_hash)) => {
            let mut salt = [0u8; 4];
            rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut salt);
            let mut buf = BytesMut::new();
            buf.extend_from_slice(&encode_frame(
                MessageFormat::Authentication,
                &AuthRequestMd5 { salt },
            ));
            codec.write_raw(&buf);
            codec.flush().await?;

            let frame = recv_password(codec, timeout).await?;
            let pm: PasswordMessage = frame.to_message(Direction::Frontend)?.decode()?;
            let received = pm.as_password_str()?;
            if md5::verify_stored_hash(stored_hash, salt, &received) {
                send_auth_ok(codec).await?;
                Ok(AuthOutcome::Success)
            } else {
                Ok(AuthOutcome::Failure(AuthFailure::BadPassword))
            }
        }
        (AuthMethod::ScramSha256, Credential::Plaintext(password)) => {
            let salt = scram::random_salt();
            let verifier = ScramVerifier::from_password(password, &salt, scram::DEFAULT_ITERATIONS);
            server_scram_exchange(codec, &verifier, timeout).await
        }
        (AuthMethod::ScramSha256, Credential::ScramVerifier(verifier)) => {
            server_scram_exchange(codec, verifier, timeout).await
        }
        (AuthMethod::Reject, _) => Ok(AuthOutcome::Failure(AuthFailure::HbaReject)),
        (AuthMethod::All, _) => Err(Error::protocol(
            "`all` HBA method must be resolved against the backend's demand before calling authenticate_client",
        )),
        _ => Err(Error::protocol("credential does not match requested auth method")),
    }
}

async fn server_scram_exchange(
    codec: &mut PgCodec,
    verifier: &ScramVerifier,
    timeout: Duration,
) -> Result<AuthOutcome> {
    use crate::protocol::frontend::frame as encode_frame;

    let mut buf = BytesMut::new();
    buf.extend_from_slice(&encode_frame(MessageFormat::Authentication, &AuthRequestSasl));
    codec.write_raw(&buf);
    codec.flush().await?;

    let frame = recv_password(codec, timeout).await?;
    let initial: SaslInitialResponse = frame.to_message(Direction::Frontend)?.decode()?;
    if initial.mechanism != "SCRAM-SHA-256" {
        return Err(Error::protocol("client selected an unsupported SASL mechanism"));
    }
    let client_first_raw = String::from_utf8(initial.data.to_vec())
        .map_err(|_| Error::protocol("client-first message was not utf-8"))?;
    let client_first_bare = client_first_raw
        .strip_prefix(scram::GS2_HEADER)
        .ok_or_else(|| Error::protocol("client-first message missing GS2 header"))?
        .to_owned();
    let client_attrs = scram::parse_attributes(&client_first_bare);
    let client_nonce = client_attrs
        .iter()
        .find(|(k, _)| *k == 'r')
        .map(|(_, v)| v.clone())
        .ok_or_else(|| Error::protocol("client-first message missing nonce"))?;

    let server_nonce_suffix = scram::random_nonce();
    let server_first_raw =
        scram::server_first_message(&client_nonce, &server_nonce_suffix, &verifier.salt, verifier.iterations);

    let mut buf = BytesMut::new();
    buf.extend_from_slice(&encode_frame(
        MessageFormat::Authentication,
        &AuthContinue(Bytes::from(server_first_raw.clone())),
    ));
    codec.write_raw(&buf);
    codec.flush().await?;

    let frame = recv_password(codec, timeout).await?;
    let response: SaslResponse = frame.to_message(Direction::Frontend)?.decode()?;
    let client_final_raw = String::from_utf8(response.data.to_vec())
        .map_err(|_| Error::protocol("client-final message was not utf-8"))?;
    let client_final = scram::parse_client_final(&client_final_raw)?;

    let combined_nonce = format!("{client_nonce}{server_nonce_suffix}");
    if client_final.nonce != combined_nonce {
        return Ok(AuthOutcome::Failure(AuthFailure::BadPassword));
    }

    let auth_message = scram::auth_message(&client_first_bare, &server_first_raw, &client_final.without_proof);
    if !scram::verify_client_proof(client_final.proof, verifier.stored_key, &auth_message) {
        return Ok(AuthOutcome::Failure(AuthFailure::BadPassword));
    }

    let signature = scram::server_signature(verifier.server_key, &auth_message);
    let final_raw = scram::server_final_message(signature);
    let mut buf = BytesMut::new();
    buf.extend_from_slice(&encode_frame(
        MessageFormat::Authentication,
        &AuthFinal(Bytes::from(final_raw)),
    ));
    codec.write_raw(&buf);
    codec.flush().await?;

    send_auth_ok(codec).await?;
    Ok(AuthOutcome::Success)
}

/// The cached material a slot keeps to re-authenticate a new client without
/// contacting the backend.
///
/// Byte-exact replay only works for MD5/cleartext,
/// which are deterministic given `(password, username, salt)` — the same
/// salt replayed to a different client still produces the same response
/// bytes iff the password matches, so a constant-time string compare is a
/// correct password check. SCRAM mandates a fresh client nonce each
/// handshake, so a literal byte replay is not meaningful there; this
/// implementation instead drives a *live* SCRAM exchange reusing the
/// `ScramVerifier` captured when the slot was created (itself only
/// possible because the backend/frontend user tables hold the plaintext,
/// matching real deployments where frontend re-authentication exists
/// specifically to avoid contacting the backend, not to avoid knowing the
/// credential).
#[derive(Debug, Clone)]
pub enum CachedChallenge {
    Trust,
    Md5 {
        salt: [u8; 4],
        expected_response: String,
    },
    Password {
        expected: String,
    },
    Scram(ScramVerifier),
}

/// Builds the `CachedChallenge` a fresh slot installs for future replay
/// reuse, given the plaintext password pgrelay already knows for this user
/// (from the frontend- or backend-users table).
/// `AuthMethod::Trust`/`Reject`/`All` never produce a useful cached
/// challenge: trust needs none, reject admits no slot, and `all` only makes
/// sense evaluated per-connection against the live HBA decision.
pub fn build_cached_challenge(
    method: AuthMethod,
    username: &str,
    password: &str,
) -> Option<CachedChallenge> {
    match method {
        AuthMethod::Trust => Some(CachedChallenge::Trust),
        AuthMethod::Password => Some(CachedChallenge::Password {
            expected: password.to_owned(),
        }),
        AuthMethod::Md5 => {
            let salt = md5::random_salt();
            let expected_response = md5::response(username, password, salt);
            Some(CachedChallenge::Md5 {
                salt,
                expected_response,
            })
        }
        AuthMethod::ScramSha256 => {
            let salt = scram::random_salt();
            Some(CachedChallenge::Scram(ScramVerifier::from_password(
                password,
                &salt,
                scram::DEFAULT_ITERATIONS,
            )))
        }
        AuthMethod::Reject | AuthMethod::All => None,
    }
}

/// Mode B: replay a cached challenge at a new client reusing a pooled slot.
pub async fn replay_cached(
    codec: &mut PgCodec,
    username: &str,
    challenge: &CachedChallenge,
    timeout: Duration,
) -> Result<AuthOutcome> {
    match challenge {
        CachedChallenge::Trust => {
            send_auth_ok(codec).await?;
            Ok(AuthOutcome::Success)
        }
        CachedChallenge::Md5 {
            salt,
            expected_response,
        } => {
            use crate::protocol::frontend::frame as encode_frame;
            let mut buf = BytesMut::new();
            buf.extend_from_slice(&encode_frame(
                MessageFormat::Authentication,
                &AuthRequestMd5 { salt: *salt },
            ));
            codec.write_raw(&buf);
            codec.flush().await?;

            let frame = recv_password(codec, timeout).await?;
            let pm: PasswordMessage = frame.to_message(Direction::Frontend)?.decode()?;
            let received = pm.as_password_str()?;
            use subtle::ConstantTimeEq;
            if bool::from(received.as_bytes().ct_eq(expected_response.as_bytes())) {
                send_auth_ok(codec).await?;
                Ok(AuthOutcome::Success)
            } else {
                Ok(AuthOutcome::Failure(AuthFailure::BadPassword))
            }
        }
        CachedChallenge::Password { expected } => {
            authenticate_client(
                codec,
                AuthMethod::Password,
                username,
                Credential::Plaintext(expected),
                timeout,
            )
            .await
        }
        CachedChallenge::Scram(verifier) => {
            server_scram_exchange(codec, verifier, timeout).await
        }
    }
}

async fn recv_password(codec: &mut PgCodec, timeout: Duration) -> Result<Frame> {
    AuthEngine::recv_timeout(codec, timeout).await
}

async fn send_auth_ok(codec: &mut PgCodec) -> Result<()> {
    codec
        .write_and_flush(MessageFormat::Authentication, &AuthOk)
        .await
}

// --- tiny Encode adapters for the server-issued halves of each exchange ---

struct AuthOk;
impl crate::protocol::Encode for AuthOk {
    fn encode(&self, buf: &mut BytesMut) {
        buf.extend_from_slice(&0i32.to_be_bytes());
    }
}

struct AuthRequestCleartext;
impl crate::protocol::Encode for AuthRequestCleartext {
    fn encode(&self, buf: &mut BytesMut) {
        buf.extend_from_slice(&3i32.to_be_bytes());
    }
}

struct AuthRequestMd5 {
    salt: [u8; 4],
}
impl crate::protocol::Encode for AuthRequestMd5 {
    fn encode(&self, buf: &mut BytesMut) {
        buf.extend_from_slice(&5i32.to_be_bytes());
        buf.extend_from_slice(&self.salt);
    }
}

struct AuthRequestSasl;
impl crate::protocol::Encode for AuthRequestSasl {
    fn encode(&self, buf: &mut BytesMut) {
        buf.extend_from_slice(&10i32.to_be_bytes());
        buf.extend_from_slice(b"SCRAM-SHA-256\0\0");
    }
}

struct AuthContinue(Bytes);
impl crate::protocol::Encode for AuthContinue {
    fn encode(&self, buf: &mut BytesMut) {
        buf.extend_from_slice(&11i32.to_be_bytes());
        buf.extend_from_slice(&self.0);
    }
}

struct AuthFinal(Bytes);
impl crate::protocol::Encode for AuthFinal {
    fn encode(&self, buf: &mut BytesMut) {
        buf.extend_from_slice(&12i32.to_be_bytes());
        buf.extend_from_slice(&self.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captured_frame_rejects_oversize() {
        let frame = Frame {
            kind: b'S',
            contents: Bytes::from(vec![0u8; SECURITY_BUFFER_SIZE * 2]),
        };
        let err = CapturedFrame::from_frame(&frame, None).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }
}
