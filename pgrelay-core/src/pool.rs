//! The slot pool: acquisition, return, kill, prefill, and the
//! idle/max-age/validation sweep.
//!
//! Grounded in `sqlx_core::pool::inner::PoolInner` for the overall shape
//! (`Vec` of slots behind atomics, a CAS scan for a free one, a
//! `Semaphore`/`Notify`-style wait when none is free) generalized to a
//! richer per-slot state machine and two extra dimensions sqlx's pool never
//! needs: multiple backend servers and per-`(user, db)` limit rules rather
//! than one pool-wide cap.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::auth::{build_cached_challenge, AuthEngine, CachedChallenge};
use crate::error::{Error, Result};
use crate::hba::AuthMethod;
use crate::model::{Endpoint, LimitRule, LimitRules, Server, UserTable};
use crate::net::{build_client_tls_config, MaybeTlsStream, Socket};
use crate::protocol::codec::PgCodec;
use crate::server_registry::{ServerRegistry, ServerRole};
use crate::slot::{Slot, SlotState};
use crate::metrics::Metrics;

/// A borrowed slot. Pipelines return it explicitly via [`Pool::release`] or
/// [`Pool::kill`] — this is deliberately not an RAII guard with an async
/// `Drop`, since async `Drop` doesn't exist; forgetting to return a slot is
/// a pipeline bug, not a type-system-enforced invariant.
pub struct AcquiredSlot {
    pub index: usize,
    /// Whether this acquisition created a fresh backend connection (mode A
    /// just ran) as opposed to reusing an already-authenticated `Free`
    /// slot (modes B/C/D apply).
    pub fresh: bool,
}

pub struct PoolConfig {
    pub max_connections: u32,
    pub blocking_timeout: Duration,
    pub authentication_timeout: Duration,
}

pub struct Pool {
    slots: Vec<Arc<Slot>>,
    limit_rules: ArcSwap<LimitRules>,
    servers: Arc<ServerRegistry>,
    /// The credential pgrelay presents to each backend server when opening
    /// a fresh connection (mode A). Looked up by username; a username with
    /// no entry authenticates as `Trust`.
    backend_users: ArcSwap<UserTable>,
    /// The credential used to pre-seed a fresh slot's mode-B replay
    /// challenge — tried before falling back to `backend_users`, since an
    /// operator running both tables usually wants the frontend password to
    /// be the one clients actually type.
    frontend_users: ArcSwap<UserTable>,
    active_connections: AtomicU32,
    config: PoolConfig,
    notify: Notify,
    metrics: Arc<dyn Metrics>,
}

impl Pool {
    pub fn new(
        config: PoolConfig,
        limit_rules: LimitRules,
        servers: Arc<ServerRegistry>,
        backend_users: UserTable,
        frontend_users: UserTable,
        metrics: Arc<dyn Metrics>,
    ) -> Self {
        let slots = (0..config.max_connections as usize)
            .map(|i| Arc::new(Slot::new(i)))
            .collect();
        Pool {
            slots,
            limit_rules: ArcSwap::new(Arc::new(limit_rules)),
            servers,
            backend_users: ArcSwap::new(Arc::new(backend_users)),
            frontend_users: ArcSwap::new(Arc::new(frontend_users)),
            active_connections: AtomicU32::new(0),
            config,
            notify: Notify::new(),
            metrics,
        }
    }

    pub fn replace_backend_users(&self, users: UserTable) {
        self.backend_users.store(Arc::new(users));
    }

    pub fn replace_frontend_users(&self, users: UserTable) {
        self.frontend_users.store(Arc::new(users));
    }

    pub fn frontend_users(&self) -> Arc<UserTable> {
        self.frontend_users.load_full()
    }

    /// Mode B: peek whether an existing `Free` slot for `(username,
    /// database)` already carries a replay challenge, without consuming the
    /// slot. The worker uses this purely to decide which client-facing auth
    /// mode to run; the subsequent [`Pool::get_connection`] call does the
    /// real acquisition and may land on a different (but, by construction,
    /// credential-equivalent) slot.
    pub fn cached_challenge_for(&self, username: &str, database: &str) -> Option<CachedChallenge> {
        for slot in &self.slots {
            if slot.state.load() != SlotState::Free {
                continue;
            }
            let occupant = slot.occupant.lock().unwrap();
            if occupant.username == username && occupant.database == database {
                if let Some(challenge) = &occupant.cached_challenge {
                    return Some(challenge.clone());
                }
            }
        }
        None
    }

    pub fn slot(&self, index: usize) -> &Arc<Slot> {
        &self.slots[index]
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn servers(&self) -> &Arc<ServerRegistry> {
        &self.servers
    }

    pub fn active_connections(&self) -> u32 {
        self.active_connections.load(Ordering::Acquire)
    }

    pub fn limit_rules(&self) -> Arc<LimitRules> {
        self.limit_rules.load_full()
    }

    pub fn replace_limit_rules(&self, rules: LimitRules) {
        self.limit_rules.store(Arc::new(rules));
    }

    /// Finds the slot currently holding a given backend's `(pid, secret)`
    /// pair, for `CancelRequest` forwarding.
    pub fn find_slot_by_backend_key(&self, pid: i32, secret: i32) -> Option<usize> {
        self.slots.iter().position(|slot| {
            let occupant = slot.occupant.lock().unwrap();
            occupant.backend_pid == pid && occupant.backend_secret == secret
        })
    }

    /// `get_connection(user, db, allow_new) -> (slot, ssl)`: scan for a
    /// reusable `Free` slot first, open a fresh one if allowed and capacity
    /// permits, otherwise wait for either to become true.
    pub async fn get_connection(
        &self,
        username: &str,
        database: &str,
        allow_new: bool,
    ) -> Result<AcquiredSlot> {
        let deadline = if self.config.blocking_timeout.is_zero() {
            None
        } else {
            Some(Instant::now() + self.config.blocking_timeout)
        };

        loop {
            let rules = self.limit_rules.load();
            let resolved_db = rules.resolve_alias(database).to_owned();
            let rule = rules
                .find_rule(&resolved_db, username)
                .cloned()
                .ok_or_else(|| Error::config(format!("no limit rule matches {username}@{resolved_db}")))?;

            if let Some(index) = self.scan_free_slot(username, &resolved_db) {
                self.slot(index).mark_used_now();
                return Ok(AcquiredSlot { index, fresh: false });
            }

            if allow_new && self.has_capacity(&rule) {
                match self
                    .create_slot(username, &resolved_db, &rule, self.config.authentication_timeout)
                    .await
                {
                    Ok(index) => return Ok(AcquiredSlot { index, fresh: true }),
                    Err(err) => {
                        self.metrics.connection_error();
                        return Err(err);
                    }
                }
            }

            self.metrics.pool_full();
            match deadline {
                None => return Err(Error::PoolFull),
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(Error::Timeout("blocking_timeout exceeded acquiring a slot".into()));
                    }
                    let _ = tokio::time::timeout(remaining, self.notify.notified()).await;
                }
            }
        }
    }

    fn has_capacity(&self, rule: &LimitRule) -> bool {
        self.active_connections() < self.config.max_connections && rule.active() < rule.max_size
    }

    fn scan_free_slot(&self, username: &str, database: &str) -> Option<usize> {
        let start = hash_seed(username, database) % self.slots.len().max(1) as u64;
        let len = self.slots.len();
        for offset in 0..len {
            let index = (start as usize + offset) % len;
            let slot = &self.slots[index];
            if slot.state.load() != SlotState::Free {
                continue;
            }
            let matches = {
                let occupant = slot.occupant.lock().unwrap();
                occupant.username == username && occupant.database == database
            };
            if !matches {
                continue;
            }
            if slot.state.compare_exchange(SlotState::Free, SlotState::InUse) {
                return Some(index);
            }
        }
        None
    }

    async fn create_slot(
        &self,
        username: &str,
        database: &str,
        rule: &Arc<LimitRule>,
        timeout: Duration,
    ) -> Result<usize> {
        rule.active_connections.fetch_add(1, Ordering::AcqRel);
        let vacant = self.find_vacant_slot();
        let index = match vacant {
            Some(i) => i,
            None => {
                rule.active_connections.fetch_sub(1, Ordering::AcqRel);
                return Err(Error::PoolFull);
            }
        };
        let slot = self.slot(index).clone();

        let result = self
            .open_and_authenticate(&slot, username, database, timeout)
            .await;

        match result {
            Ok(()) => {
                slot.state.store(SlotState::InUse);
                slot.mark_created_now();
                self.active_connections.fetch_add(1, Ordering::AcqRel);
                Ok(index)
            }
            Err(err) => {
                slot.state.store(SlotState::NotInit);
                rule.active_connections.fetch_sub(1, Ordering::AcqRel);
                Err(err)
            }
        }
    }

    fn find_vacant_slot(&self) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.state.compare_exchange(SlotState::NotInit, SlotState::Init))
    }

    async fn open_and_authenticate(
        &self,
        slot: &Arc<Slot>,
        username: &str,
        database: &str,
        timeout: Duration,
    ) -> Result<()> {
        let server = self.servers.select(ServerRole::ReadWrite)?;
        let socket = self.servers.connect_with_failover(&server, self.metrics.as_ref()).await?;
        let stream = negotiate_backend_tls(socket, &server).await?;

        let startup = crate::protocol::StartupMessage {
            params: vec![
                ("user".into(), username.into()),
                ("database".into(), database.into()),
            ],
        };
        let mut codec = PgCodec::new(stream);
        codec.write_raw(&startup.encode());
        codec.flush().await?;

        let backend_users = self.backend_users.load();
        let password = backend_users.get(username).map(|r| r.password.as_str());
        let login = AuthEngine::backend_login(&mut codec, username, password, timeout).await?;

        if matches!(
            server.state.load(),
            crate::model::ServerState::NotInit | crate::model::ServerState::NotInitPrimary
        ) {
            match probe_recovery_state(&mut codec, timeout).await {
                Ok(in_recovery) => self.servers.record_probe_result(&server, in_recovery),
                Err(err) => warn!(server = %server.name, error = %err, "pg_is_in_recovery probe failed"),
            }
        }

        let replay_password = self
            .frontend_users
            .load()
            .get(username)
            .or_else(|| backend_users.get(username))
            .map(|r| r.password.clone());
        let cached_challenge = replay_password
            .as_deref()
            .and_then(|password| build_cached_challenge(AuthMethod::Md5, username, password));

        {
            let mut occupant = slot.occupant.lock().unwrap();
            occupant.server = self.server_index(&server);
            occupant.stream = Some(codec.into_stream());
            occupant.backend_pid = login.backend_pid;
            occupant.backend_secret = login.backend_secret;
            occupant.username = username.to_owned();
            occupant.database = database.to_owned();
        }
        slot.install_security(login.security, login.captured, cached_challenge);
        debug!(slot = slot.index, server = %server.name, "slot created and authenticated");
        Ok(())
    }

    fn server_index(&self, server: &Arc<crate::model::Server>) -> usize {
        self.servers
            .servers
            .iter()
            .position(|s| Arc::ptr_eq(s, server))
            .unwrap_or(0)
    }

    /// Return a slot to the `Free` pool.
    pub fn release(&self, index: usize) {
        let slot = self.slot(index);
        if slot.state.compare_exchange(SlotState::InUse, SlotState::Free) {
            slot.mark_used_now();
            self.notify.notify_waiters();
        }
    }

    /// Kill a poisoned slot.
    pub fn kill(&self, index: usize) {
        let slot = self.slot(index);
        let prior = slot.state.load();
        slot.state.store(SlotState::Remove);
        let (database, username) = {
            let mut occupant = slot.occupant.lock().unwrap();
            occupant.stream = None;
            (occupant.database.clone(), occupant.username.clone())
        };
        slot.reset();
        slot.state.store(SlotState::NotInit);
        if !matches!(prior, SlotState::NotInit | SlotState::Init) {
            self.active_connections.fetch_sub(1, Ordering::AcqRel);
            if let Some(rule) = self.limit_rules.load().find_rule(&database, &username) {
                rule.active_connections.fetch_sub(1, Ordering::AcqRel);
            }
        }
        self.notify.notify_waiters();
        warn!(slot = index, "slot killed and returned to NotInit");
    }

    /// At startup and after every successful reload, eagerly create
    /// `initial_size` authenticated slots per limit rule.
    pub async fn prefill(&self, max_retries: u32) {
        let rules = self.limit_rules.load_full();
        for rule in &rules.rules {
            for _ in 0..rule.initial_size {
                let mut attempt = 0;
                loop {
                    attempt += 1;
                    match self
                        .create_slot(
                            &rule.username,
                            &rule.database,
                            rule,
                            self.config.authentication_timeout,
                        )
                        .await
                    {
                        Ok(index) => {
                            self.release(index);
                            break;
                        }
                        Err(err) if attempt < max_retries => {
                            warn!(
                                database = %rule.database,
                                username = %rule.username,
                                attempt,
                                error = %err,
                                "prefill attempt failed, retrying"
                            );
                        }
                        Err(err) => {
                            warn!(
                                database = %rule.database,
                                username = %rule.username,
                                error = %err,
                                "prefill exhausted retries"
                            );
                            break;
                        }
                    }
                }
            }
        }
        info!(active = self.active_connections(), "prefill complete");
    }

    /// One sweep of the idle/max-age/validation periodic task. Returns the
    /// number of slots reclaimed.
    pub async fn sweep(
        &self,
        idle_timeout: Option<Duration>,
        max_connection_age: Option<Duration>,
        validate: bool,
    ) -> usize {
        let mut reclaimed = 0;
        for index in 0..self.slots.len() {
            let slot = self.slot(index);
            if slot.state.load() != SlotState::Free {
                continue;
            }

            if let Some(max_age) = max_connection_age {
                if slot.age() >= max_age
                    && slot.state.compare_exchange(SlotState::Free, SlotState::MaxConnectionAge)
                {
                    self.kill(index);
                    reclaimed += 1;
                    continue;
                }
            }

            if let Some(idle) = idle_timeout {
                if slot.idle_for() >= idle
                    && slot.state.compare_exchange(SlotState::Free, SlotState::IdleCheck)
                {
                    self.kill(index);
                    reclaimed += 1;
                    continue;
                }
            }

            if validate && slot.state.compare_exchange(SlotState::Free, SlotState::Validation) {
                let ok = self.validate_slot(index).await;
                if ok {
                    slot.state.store(SlotState::Free);
                } else {
                    self.kill(index);
                    reclaimed += 1;
                }
            }
        }
        reclaimed
    }

    /// Sends an empty `Query("")` and expects `ReadyForQuery`.
    async fn validate_slot(&self, index: usize) -> bool {
        use crate::protocol::backend::ErrorResponse;
        use crate::protocol::codec::ReadOutcome;
        use crate::protocol::frontend::Query;
        use crate::protocol::message::{Direction, MessageFormat};

        let stream = {
            let mut occupant = self.slot(index).occupant.lock().unwrap();
            occupant.stream.take()
        };
        let Some(stream) = stream else { return false };
        let mut codec = PgCodec::new(stream);

        let sent = codec
            .write_and_flush(MessageFormat::Query, &Query { sql: String::new() })
            .await;
        if sent.is_err() {
            return false;
        }

        let ok = loop {
            match codec.read_timeout(Duration::from_secs(5)).await {
                Ok(ReadOutcome::Frame(frame)) => {
                    let Ok(message) = frame.to_message(Direction::Backend) else {
                        break false;
                    };
                    match message.format {
                        MessageFormat::ReadyForQuery => break true,
                        MessageFormat::ErrorResponse => {
                            let _: Result<ErrorResponse> = message.decode();
                            break false;
                        }
                        _ => continue,
                    }
                }
                _ => break false,
            }
        };

        self.slot(index).occupant.lock().unwrap().stream = Some(codec.into_stream());
        ok
    }
}

/// Negotiates server-side TLS for a fresh backend connection when the
/// server entry carries a TLS triple: emits `SSLRequest` and, on `'S'`,
/// performs a client-side handshake. A Unix-domain endpoint never
/// negotiates TLS even if a TLS triple is configured — there is no PKI
/// identity to validate a filesystem path against.
async fn negotiate_backend_tls(mut socket: Socket, server: &Server) -> Result<MaybeTlsStream> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let Some(tls) = &server.tls else {
        return Ok(MaybeTlsStream::Raw(socket));
    };
    let Endpoint::Tcp { host, .. } = &server.endpoint else {
        return Ok(MaybeTlsStream::Raw(socket));
    };

    let request = crate::protocol::startup::encode_ssl_request();
    socket.write_all(&request).await.map_err(Error::Io)?;
    let mut response = [0u8; 1];
    socket.read_exact(&mut response).await.map_err(Error::Io)?;
    if response[0] != b'S' {
        return Err(Error::Protocol(format!(
            "server {:?} refused SSLRequest but a TLS triple is configured for it",
            server.name
        )));
    }

    let config = build_client_tls_config(tls).map_err(Error::Io)?;
    let server_name = rustls::pki_types::ServerName::try_from(host.clone())
        .map_err(|_| Error::Protocol(format!("server {host:?} is not a valid TLS server name")))?;
    MaybeTlsStream::connect_client(socket, config, server_name)
        .await
        .map_err(Error::Io)
}

/// Runs `SELECT pg_is_in_recovery()` over a freshly authenticated backend
/// connection and reports whether it answered `t`. Only needed once per
/// server — callers gate this on `NotInit`/`NotInitPrimary` so a settled
/// `Primary`/`Replica` server never pays the extra round trip on every slot
/// creation.
async fn probe_recovery_state(codec: &mut PgCodec, timeout: Duration) -> Result<bool> {
    use crate::protocol::backend::{DataRow, ErrorResponse};
    use crate::protocol::codec::ReadOutcome;
    use crate::protocol::frontend::Query;
    use crate::protocol::message::{Direction, MessageFormat};

    codec
        .write_and_flush(
            MessageFormat::Query,
            &Query {
                sql: "SELECT pg_is_in_recovery()".to_owned(),
            },
        )
        .await?;

    let mut in_recovery = false;
    loop {
        match codec.read_timeout(timeout).await? {
            ReadOutcome::Frame(frame) => {
                let message = frame.to_message(Direction::Backend)?;
                match message.format {
                    MessageFormat::DataRow => {
                        let row: DataRow = message.decode()?;
                        if let Some(Some(value)) = row.columns.first() {
                            in_recovery = value.as_ref() == b"t";
                        }
                    }
                    MessageFormat::ErrorResponse => {
                        let err: ErrorResponse = message.decode()?;
                        return Err(Error::Database(err.message.unwrap_or_default()));
                    }
                    MessageFormat::ReadyForQuery => break,
                    _ => {}
                }
            }
            ReadOutcome::Timeout => return Err(Error::Timeout("pg_is_in_recovery probe timed out".into())),
            ReadOutcome::Eof => return Err(Error::Io(std::io::ErrorKind::UnexpectedEof.into())),
        }
    }
    Ok(in_recovery)
}

/// Deterministic hash-seeded starting point for the round-robin free-slot
/// scan.
fn hash_seed(username: &str, database: &str) -> u64 {
    let mut hash: u64 = 1469598103934665603; // FNV-1a offset basis
    for byte in username.bytes().chain(std::iter::once(b'\0')).chain(database.bytes()) {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(1099511628211);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AtomicServerState, Endpoint, Server, ServerState};

    fn test_registry() -> Arc<ServerRegistry> {
        Arc::new(ServerRegistry::new(
            vec![Server {
                name: "primary".into(),
                endpoint: Endpoint::Tcp {
                    host: "127.0.0.1".into(),
                    port: 5432,
                },
                tls: None,
                state: AtomicServerState::new(ServerState::Primary),
                accepts_replica_reads: false,
            }],
            false,
            None,
        ))
    }

    fn test_pool(max_connections: u32) -> Pool {
        let rules = LimitRules::new(vec![LimitRule::new("postgres", "alice", 0, 0, max_connections)]).unwrap();
        Pool::new(
            PoolConfig {
                max_connections,
                blocking_timeout: Duration::ZERO,
                authentication_timeout: Duration::from_secs(5),
            },
            rules,
            test_registry(),
            UserTable::default(),
            UserTable::default(),
            Arc::new(crate::metrics::NoopMetrics),
        )
    }

    #[test]
    fn hash_seed_is_deterministic() {
        assert_eq!(hash_seed("alice", "postgres"), hash_seed("alice", "postgres"));
    }

    #[tokio::test]
    async fn release_makes_slot_reusable_by_scan() {
        let pool = test_pool(2);
        let slot = pool.slot(0);
        slot.state.store(SlotState::InUse);
        {
            let mut occupant = slot.occupant.lock().unwrap();
            occupant.username = "alice".into();
            occupant.database = "postgres".into();
        }
        pool.release(0);
        assert_eq!(slot.state.load(), SlotState::Free);
        let found = pool.scan_free_slot("alice", "postgres");
        assert_eq!(found, Some(0));
    }

    #[test]
    fn kill_resets_slot_to_notinit() {
        let pool = test_pool(1);
        pool.slot(0).state.store(SlotState::InUse);
        pool.active_connections.fetch_add(1, Ordering::SeqCst);
        pool.kill(0);
        assert_eq!(pool.slot(0).state.load(), SlotState::NotInit);
        assert_eq!(pool.active_connections(), 0);
    }

    #[test]
    fn frontend_users_reflects_latest_replacement() {
        let pool = test_pool(1);
        assert!(pool.frontend_users().is_empty());
        pool.replace_frontend_users(UserTable::new(vec![crate::model::UserRecord {
            username: "alice".into(),
            password: "s3cret".into(),
        }]));
        assert!(pool.frontend_users().contains("alice"));
    }

    #[tokio::test]
    async fn negotiate_backend_tls_passes_through_when_server_has_no_tls() {
        let (client, _server) = Socket::test_pair();
        let server_entry = Server {
            name: "primary".into(),
            endpoint: Endpoint::Tcp {
                host: "127.0.0.1".into(),
                port: 5432,
            },
            tls: None,
            state: AtomicServerState::new(ServerState::Primary),
            accepts_replica_reads: false,
        };
        // no TLS triple configured, so no SSLRequest is ever written and the
        // raw socket comes back unchanged.
        let stream = negotiate_backend_tls(client, &server_entry).await.unwrap();
        assert!(!stream.is_tls());
    }
}
