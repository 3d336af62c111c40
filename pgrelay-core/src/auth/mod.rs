//! The authentication engine: drives trust, cleartext
//! password, MD5, and SCRAM-SHA-256 in both directions — as the server role
//! toward pgrelay's clients, and as the client role toward upstream
//! PostgreSQL servers.

pub mod engine;
pub mod md5;
pub mod scram;

pub use engine::{
    authenticate_client, build_cached_challenge, replay_cached, AuthEngine, BackendLogin,
    CachedChallenge, CapturedFrame, Credential, SecurityKind,
};
