//! The static-ish configuration tables the pool core consults: servers,
//! credential tables, and limit rules.
//!
//! These are populated by the daemon crate's config loader and then held
//! behind an [`arc_swap::ArcSwap`] so a reload can swap them in atomically
//! without disturbing live slots — mirrors how `sqlx_core::pool::PoolInner`
//! holds its `PoolOptions` behind an `ArcSwap`-free but atomically-swapped
//! snapshot; pgrelay needs the swap because HBA/limit tables really do
//! change shape on reload, not just options.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A server's lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServerState {
    NotInit = 0,
    NotInitPrimary = 1,
    Primary = 2,
    Replica = 3,
    Failover = 4,
    Failed = 5,
}

impl ServerState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ServerState::NotInit,
            1 => ServerState::NotInitPrimary,
            2 => ServerState::Primary,
            3 => ServerState::Replica,
            4 => ServerState::Failover,
            _ => ServerState::Failed,
        }
    }
}

/// Atomic wrapper so the supervisor and server-probe paths can CAS the
/// state without a lock — mutated only by the supervisor and by
/// server-probe paths.
#[derive(Debug)]
pub struct AtomicServerState(AtomicU8);

impl AtomicServerState {
    pub fn new(state: ServerState) -> Self {
        AtomicServerState(AtomicU8::new(state as u8))
    }

    pub fn load(&self) -> ServerState {
        ServerState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, state: ServerState) {
        self.0.store(state as u8, Ordering::Release);
    }

    pub fn compare_exchange(&self, current: ServerState, new: ServerState) -> bool {
        self.0
            .compare_exchange(
                current as u8,
                new as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

/// A configured upstream server: identity, endpoint, optional per-server TLS.
#[derive(Debug)]
pub struct Server {
    pub name: String,
    pub endpoint: Endpoint,
    pub tls: Option<ServerTls>,
    pub state: AtomicServerState,
    /// Whether this server may be selected for read-only (`Replica`)
    /// acquisitions when no `Primary` is available.
    pub accepts_replica_reads: bool,
}

#[derive(Debug, Clone)]
pub enum Endpoint {
    Tcp { host: String, port: u16 },
    Unix { path: String },
}

#[derive(Debug, Clone)]
pub struct ServerTls {
    pub cert: Option<String>,
    pub key: Option<String>,
    pub ca: Option<String>,
}

/// A `(username, password)` pair, already decrypted.
#[derive(Debug, Clone)]
pub struct UserRecord {
    pub username: String,
    pub password: String,
}

/// One of the four disjoint credential tables: backend, frontend, admin,
/// superuser.
#[derive(Debug, Clone, Default)]
pub struct UserTable {
    by_username: HashMap<String, UserRecord>,
}

impl UserTable {
    pub fn new(records: Vec<UserRecord>) -> Self {
        let by_username = records
            .into_iter()
            .map(|r| (r.username.clone(), r))
            .collect();
        UserTable { by_username }
    }

    pub fn get(&self, username: &str) -> Option<&UserRecord> {
        self.by_username.get(username)
    }

    pub fn contains(&self, username: &str) -> bool {
        self.by_username.contains_key(username)
    }

    pub fn len(&self) -> usize {
        self.by_username.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_username.is_empty()
    }

    pub fn usernames(&self) -> Vec<String> {
        self.by_username.keys().cloned().collect()
    }
}

/// A per-`(database, username)` connection limit rule.
#[derive(Debug)]
pub struct LimitRule {
    pub database: String,
    pub username: String,
    pub min_size: u32,
    pub initial_size: u32,
    pub max_size: u32,
    pub aliases: Vec<String>,
    pub active_connections: AtomicU32,
}

impl LimitRule {
    /// `(database, username, min_size, initial_size, max_size)` with no
    /// aliases — the common case in tests and small configs.
    pub fn new(database: impl Into<String>, username: impl Into<String>, min_size: u32, initial_size: u32, max_size: u32) -> Self {
        LimitRule {
            database: database.into(),
            username: username.into(),
            min_size,
            initial_size,
            max_size,
            aliases: Vec::new(),
            active_connections: AtomicU32::new(0),
        }
    }

    pub fn matches(&self, database: &str, username: &str) -> bool {
        let db_matches = self.database == "all"
            || self.database == database
            || self.aliases.iter().any(|a| a == database);
        let user_matches = self.username == "all" || self.username == username;
        db_matches && user_matches
    }

    pub fn active(&self) -> u32 {
        self.active_connections.load(Ordering::Acquire)
    }
}

/// Immutable view of every limit rule plus the alias → canonical-database
/// resolution table.
#[derive(Debug, Default)]
pub struct LimitRules {
    pub rules: Vec<Arc<LimitRule>>,
}

impl LimitRules {
    pub fn new(rules: Vec<LimitRule>) -> Result<Self> {
        let rules: Vec<Arc<LimitRule>> = rules.into_iter().map(Arc::new).collect();
        validate_limit_rules(&rules)?;
        Ok(LimitRules { rules })
    }

    /// Resolve a client-supplied database name through any rule's alias
    /// list back to the canonical database the rule is keyed on, so two
    /// clients connecting via an alias and the canonical name land on the
    /// same limit rule and the same pooled slots.
    pub fn resolve_alias<'a>(&'a self, database: &'a str) -> &'a str {
        for rule in &self.rules {
            if rule.database != "all" && rule.aliases.iter().any(|a| a == database) {
                return rule.database.as_str();
            }
        }
        database
    }

    pub fn find_rule(&self, database: &str, username: &str) -> Option<&Arc<LimitRule>> {
        self.rules
            .iter()
            .find(|r| r.matches(database, username) && r.database != "all")
            .or_else(|| self.rules.iter().find(|r| r.matches(database, username)))
    }

    pub fn total_max(&self) -> u64 {
        self.rules.iter().map(|r| r.max_size as u64).sum()
    }
}

fn validate_limit_rules(rules: &[Arc<LimitRule>]) -> Result<()> {
    let mut seen_db_alias: HashMap<&str, &str> = HashMap::new();
    for rule in rules {
        if !(rule.min_size <= rule.initial_size && rule.initial_size <= rule.max_size) {
            return Err(Error::config(format!(
                "limit rule {}/{} violates 0 <= min_size <= initial_size <= max_size",
                rule.database, rule.username
            )));
        }
        for name in std::iter::once(rule.database.as_str()).chain(rule.aliases.iter().map(|a| a.as_str())) {
            if let Some(owner) = seen_db_alias.insert(name, rule.username.as_str()) {
                if owner != rule.username {
                    return Err(Error::config(format!(
                        "database/alias {name:?} is claimed by more than one limit rule"
                    )));
                }
            }
        }
    }
    Ok(())
}

/// The four disjoint credential tables a daemon loads.
#[derive(Debug, Default)]
pub struct Credentials {
    pub backend_users: UserTable,
    pub frontend_users: UserTable,
    pub admins: UserTable,
    pub superuser: Option<UserRecord>,
}

/// `management` command envelopes reuse this for `ENABLEDB`/`DISABLEDB`
/// responses and `STATUS`/`DETAILS` payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSummary {
    pub database: String,
    pub active_connections: u32,
    pub max_size: u32,
    pub disabled: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_out_of_order_limit_bounds() {
        let err = LimitRules::new(vec![LimitRule::new("db", "user", 5, 2, 10)]).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn rejects_alias_collision_across_rules() {
        let mut a = LimitRule::new("db_a", "alice", 0, 0, 5);
        a.aliases.push("shared".into());
        let mut b = LimitRule::new("db_b", "bob", 0, 0, 5);
        b.aliases.push("shared".into());
        let err = LimitRules::new(vec![a, b]).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn finds_specific_rule_over_all_bucket() {
        let rules = LimitRules::new(vec![
            LimitRule::new("all", "all", 0, 0, 100),
            LimitRule::new("postgres", "alice", 0, 1, 5),
        ])
        .unwrap();
        let found = rules.find_rule("postgres", "alice").unwrap();
        assert_eq!(found.database, "postgres");
    }
}
