//! SCRAM-SHA-256 (RFC 5802), channel binding `n,,` (`biws` base64-encoded),
//! implemented for both roles pgrelay needs to play:
//!
//! - **client role** — when pgrelay itself opens a backend connection (slot
//!   creation, prefill) and the server demands SCRAM for the backend user;
//!   grounded in `sqlx_core::postgres::connection::sasl` (key derivation,
//!   message shapes), which only implements this role since a client
//!   library never needs the other side.
//! - **server role** — when pgrelay authenticates a *client* against a
//!   cached challenge (replay) or a directly-known password/verifier
//!   (frontend password, auth-query); this half has no sqlx analogue and
//!   is written from RFC 5802 directly, reusing the same primitives.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};
use stringprep::saslprep;
use subtle::ConstantTimeEq;

use crate::error::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

pub const DEFAULT_ITERATIONS: u32 = 4096;
/// `n,,` — "no channel binding", base64-encoded.
pub const GS2_HEADER: &str = "n,,";
pub const CHANNEL_BINDING_B64: &str = "biws";

fn hmac(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().as_slice().try_into().unwrap()
}

fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).as_slice().try_into().unwrap()
}

fn xor32(a: [u8; 32], b: [u8; 32]) -> [u8; 32] {
    let mut out = [0u8; 32];
    for i in 0..32 {
        out[i] = a[i] ^ b[i];
    }
    out
}

/// `SaltedPassword = Hi(Normalize(password), salt, i)`.
pub fn salted_password(password: &str, salt: &[u8], iterations: u32) -> [u8; 32] {
    let normalized = saslprep(password).unwrap_or_else(|_| password.into());
    let key = normalized.as_bytes();

    let mut u: [u8; 32] = hmac_chain(key, salt, &1u32.to_be_bytes());
    let mut result = u;
    for _ in 1..iterations {
        u = hmac_chain(key, &u, &[]);
        for i in 0..32 {
            result[i] ^= u[i];
        }
    }
    result
}

fn hmac_chain(key: &[u8], first: &[u8], second: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(first);
    if !second.is_empty() {
        mac.update(second);
    }
    mac.finalize().into_bytes().as_slice().try_into().unwrap()
}

pub fn client_key(salted_password: [u8; 32]) -> [u8; 32] {
    hmac(&salted_password, b"Client Key")
}

pub fn server_key(salted_password: [u8; 32]) -> [u8; 32] {
    hmac(&salted_password, b"Server Key")
}

pub fn stored_key(client_key: [u8; 32]) -> [u8; 32] {
    sha256(&client_key)
}

pub fn client_signature(stored_key: [u8; 32], auth_message: &str) -> [u8; 32] {
    hmac(&stored_key, auth_message.as_bytes())
}

pub fn client_proof(client_key: [u8; 32], stored_key: [u8; 32], auth_message: &str) -> [u8; 32] {
    xor32(client_key, client_signature(stored_key, auth_message))
}

pub fn server_signature(server_key: [u8; 32], auth_message: &str) -> [u8; 32] {
    hmac(&server_key, auth_message.as_bytes())
}

/// Recomputes the client key from a received proof and verifies it against
/// `stored_key` in constant time (server-side verification).
pub fn verify_client_proof(
    received_proof: [u8; 32],
    stored_key: [u8; 32],
    auth_message: &str,
) -> bool {
    let candidate_client_key = xor32(received_proof, client_signature(stored_key, auth_message));
    let candidate_stored_key = self::stored_key(candidate_client_key);
    candidate_stored_key.ct_eq(&stored_key).into()
}

pub fn random_nonce() -> String {
    let mut bytes = [0u8; 18];
    rand::thread_rng().fill_bytes(&mut bytes);
    BASE64.encode(bytes)
}

pub fn random_salt() -> [u8; 16] {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

/// Parses `key=value` attributes separated by `,` (the shared grammar of
/// every SCRAM message after its header).
pub fn parse_attributes(s: &str) -> Vec<(char, String)> {
    s.split(',')
        .filter_map(|kv| {
            let mut chars = kv.chars();
            let key = chars.next()?;
            if chars.next() != Some('=') {
                return None;
            }
            Some((key, chars.as_str().to_owned()))
        })
        .collect()
}

fn attr<'a>(attrs: &'a [(char, String)], key: char) -> Result<&'a str> {
    attrs
        .iter()
        .find(|(k, _)| *k == key)
        .map(|(_, v)| v.as_str())
        .ok_or_else(|| Error::protocol(format!("SCRAM message missing attribute {key:?}")))
}

/// `client-first-message-bare` — the part after the GS2 header, which both
/// sides must reproduce byte-for-byte inside `AuthMessage`.
pub fn client_first_bare(nonce: &str) -> String {
    format!("n=,r={nonce}")
}

pub fn client_first_message(nonce: &str) -> String {
    format!("{GS2_HEADER}{}", client_first_bare(nonce))
}

#[derive(Debug, Clone)]
pub struct ServerFirst {
    pub nonce: String,
    pub salt: Vec<u8>,
    pub iterations: u32,
    pub raw: String,
}

pub fn parse_server_first(message: &str) -> Result<ServerFirst> {
    let attrs = parse_attributes(message);
    let nonce = attr(&attrs, 'r')?.to_owned();
    let salt = BASE64
        .decode(attr(&attrs, 's')?)
        .map_err(|_| Error::protocol("SCRAM server-first salt was not valid base64"))?;
    let iterations: u32 = attr(&attrs, 'i')?
        .parse()
        .map_err(|_| Error::protocol("SCRAM server-first iteration count was not an integer"))?;
    Ok(ServerFirst {
        nonce,
        salt,
        iterations,
        raw: message.to_owned(),
    })
}

pub fn server_first_message(client_nonce: &str, server_nonce_suffix: &str, salt: &[u8], iterations: u32) -> String {
    format!(
        "r={client_nonce}{server_nonce_suffix},s={},i={iterations}",
        BASE64.encode(salt)
    )
}

/// `client-final-message-without-proof`.
pub fn client_final_without_proof(combined_nonce: &str) -> String {
    format!("c={CHANNEL_BINDING_B64},r={combined_nonce}")
}

pub fn auth_message(client_first_bare: &str, server_first: &str, client_final_without_proof: &str) -> String {
    format!("{client_first_bare},{server_first},{client_final_without_proof}")
}

pub fn client_final_message(without_proof: &str, proof: [u8; 32]) -> String {
    format!("{without_proof},p={}", BASE64.encode(proof))
}

#[derive(Debug, Clone)]
pub struct ClientFinal {
    pub without_proof: String,
    pub proof: [u8; 32],
    pub nonce: String,
}

pub fn parse_client_final(message: &str) -> Result<ClientFinal> {
    let attrs = parse_attributes(message);
    let nonce = attr(&attrs, 'r')?.to_owned();
    let proof_b64 = attr(&attrs, 'p')?;
    let proof_bytes = BASE64
        .decode(proof_b64)
        .map_err(|_| Error::protocol("SCRAM client-final proof was not valid base64"))?;
    let proof: [u8; 32] = proof_bytes
        .as_slice()
        .try_into()
        .map_err(|_| Error::protocol("SCRAM client-final proof had the wrong length"))?;
    let comma_p = message
        .rfind(",p=")
        .ok_or_else(|| Error::protocol("SCRAM client-final message missing proof"))?;
    Ok(ClientFinal {
        without_proof: message[..comma_p].to_owned(),
        proof,
        nonce,
    })
}

pub fn server_final_message(signature: [u8; 32]) -> String {
    format!("v={}", BASE64.encode(signature))
}

pub fn parse_server_final(message: &str) -> Result<[u8; 32]> {
    let attrs = parse_attributes(message);
    if let Ok(err) = attr(&attrs, 'e') {
        return Err(Error::protocol(format!("SCRAM server rejected authentication: {err}")));
    }
    let sig = BASE64
        .decode(attr(&attrs, 'v')?)
        .map_err(|_| Error::protocol("SCRAM server-final signature was not valid base64"))?;
    sig.as_slice()
        .try_into()
        .map_err(|_| Error::protocol("SCRAM server-final signature had the wrong length").into())
}

/// A verifier as stored at rest (what an auth-query lookup returns for a
/// SCRAM user, matching `pg_authid.rolpassword`'s
/// `SCRAM-SHA-256$<iterations>:<salt>$<storedkey>:<serverkey>` shape).
#[derive(Debug, Clone)]
pub struct ScramVerifier {
    pub iterations: u32,
    pub salt: Vec<u8>,
    pub stored_key: [u8; 32],
    pub server_key: [u8; 32],
}

impl ScramVerifier {
    pub const PREFIX: &'static str = "SCRAM-SHA-256$";

    pub fn from_password(password: &str, salt: &[u8], iterations: u32) -> Self {
        let sp = salted_password(password, salt, iterations);
        ScramVerifier {
            iterations,
            salt: salt.to_vec(),
            stored_key: stored_key(client_key(sp)),
            server_key: server_key(sp),
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        let rest = s
            .strip_prefix(Self::PREFIX)
            .ok_or_else(|| Error::protocol("not a SCRAM-SHA-256 verifier"))?;
        let (params, keys) = rest
            .split_once('$')
            .ok_or_else(|| Error::protocol("malformed SCRAM verifier"))?;
        let (iterations, salt_b64) = params
            .split_once(':')
            .ok_or_else(|| Error::protocol("malformed SCRAM verifier parameters"))?;
        let (stored_b64, server_b64) = keys
            .split_once(':')
            .ok_or_else(|| Error::protocol("malformed SCRAM verifier keys"))?;
        let iterations: u32 = iterations
            .parse()
            .map_err(|_| Error::protocol("SCRAM verifier iteration count was not an integer"))?;
        let salt = BASE64
            .decode(salt_b64)
            .map_err(|_| Error::protocol("SCRAM verifier salt was not valid base64"))?;
        let stored_key: [u8; 32] = BASE64
            .decode(stored_b64)
            .map_err(|_| Error::protocol("SCRAM verifier stored key was not valid base64"))?
            .try_into()
            .map_err(|_| Error::protocol("SCRAM verifier stored key had the wrong length"))?;
        let server_key: [u8; 32] = BASE64
            .decode(server_b64)
            .map_err(|_| Error::protocol("SCRAM verifier server key was not valid base64"))?
            .try_into()
            .map_err(|_| Error::protocol("SCRAM verifier server key had the wrong length"))?;
        Ok(ScramVerifier {
            iterations,
            salt,
            stored_key,
            server_key,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_exchange_round_trips() {
        let password = "s3cret!";
        let salt = random_salt();
        let iterations = DEFAULT_ITERATIONS;

        let sp = salted_password(password, &salt, iterations);
        let ck = client_key(sp);
        let sk = stored_key(ck);
        let svk = server_key(sp);

        let client_nonce = random_nonce();
        let server_nonce_suffix = random_nonce();
        let c_first_bare = client_first_bare(&client_nonce);
        let s_first = server_first_message(&client_nonce, &server_nonce_suffix, &salt, iterations);
        let parsed_first = parse_server_first(&s_first).unwrap();
        assert_eq!(parsed_first.iterations, iterations);

        let combined_nonce = parsed_first.nonce.clone();
        let c_final_without_proof = client_final_without_proof(&combined_nonce);
        let am = auth_message(&c_first_bare, &s_first, &c_final_without_proof);

        let proof = client_proof(ck, sk, &am);
        let c_final = client_final_message(&c_final_without_proof, proof);

        let parsed_final = parse_client_final(&c_final).unwrap();
        assert!(verify_client_proof(parsed_final.proof, sk, &am));

        let sig = server_signature(svk, &am);
        let s_final = server_final_message(sig);
        let parsed_sig = parse_server_final(&s_final).unwrap();
        assert_eq!(parsed_sig, sig);
    }

    #[test]
    fn wrong_password_fails_verification() {
        let salt = random_salt();
        let iterations = DEFAULT_ITERATIONS;
        let sp_good = salted_password("correct", &salt, iterations);
        let sk = stored_key(client_key(sp_good));

        let sp_bad = salted_password("incorrect", &salt, iterations);
        let ck_bad = client_key(sp_bad);
        let am = "irrelevant-but-fixed-auth-message";
        let proof = client_proof(ck_bad, stored_key(ck_bad), am);

        assert!(!verify_client_proof(proof, sk, am));
    }

    #[test]
    fn verifier_round_trips_through_text_format() {
        let verifier = ScramVerifier::from_password("hunter2", &random_salt(), 4096);
        let text = format!(
            "{}{}:{}${}:{}",
            ScramVerifier::PREFIX,
            verifier.iterations,
            BASE64.encode(&verifier.salt),
            BASE64.encode(verifier.stored_key),
            BASE64.encode(verifier.server_key),
        );
        let parsed = ScramVerifier::parse(&text).unwrap();
        assert_eq!(parsed.stored_key, verifier.stored_key);
        assert_eq!(parsed.server_key, verifier.server_key);
        assert_eq!(parsed.iterations, 4096);
    }
}
