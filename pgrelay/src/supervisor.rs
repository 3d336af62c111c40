//! The supervisor: accepts PostgreSQL clients, dispatches one worker task per
//! client, runs periodic maintenance, and answers the administrative surface
//! the management protocol (`management.rs`) drives.
//!
//! Grounded in `sqlx_core::pool::inner::PoolInner`'s background-task pattern
//! (a `tokio::spawn`ed maintenance loop alongside the foreground connection
//! path) generalized to also own the accept loop itself, since pgrelay (unlike
//! a client-side pool) terminates the listening side of the protocol.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use arc_swap::ArcSwap;
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use pgrelay_core::auth::{authenticate_client, replay_cached, Credential};
use pgrelay_core::authquery;
use pgrelay_core::error::{AuthFailure, AuthOutcome};
use pgrelay_core::hba::{AuthMethod, ConnectionContext};
use pgrelay_core::metrics::RegistryMetrics;
use pgrelay_core::model::DatabaseSummary;
use pgrelay_core::net::{MaybeTlsStream, Socket};
use pgrelay_core::pipeline::{self, PipelineContext, PipelineKind, PipelinePolicy};
use pgrelay_core::pool::{Pool, PoolConfig};
use pgrelay_core::protocol::backend::ErrorResponse;
use pgrelay_core::protocol::codec::PgCodec;
use pgrelay_core::protocol::startup::CancelRequest;
use pgrelay_core::protocol::{read_startup_packet, MessageFormat, StartupMessage, StartupPacket};

use crate::config::Config;

/// Runtime overrides to a handful of `general` settings applied via
/// `CONFIG_SET` without a full file reload; kept separate from [`Config`]
/// since they must survive independently of whatever `RELOAD` last parsed
/// off disk.
#[derive(Default)]
struct ConfigOverrides {
    values: HashMap<String, String>,
    aliases: HashMap<String, String>,
}

/// Owns every piece of mutable supervisor-wide state and the pool/config it
/// was built from.
pub struct Supervisor {
    config: ArcSwap<Config>,
    config_path: PathBuf,
    pool: Arc<Pool>,
    metrics: Arc<RegistryMetrics>,
    disabled: RwLock<std::collections::HashSet<String>>,
    all_disabled: AtomicBool,
    pub gracefully: AtomicBool,
    pub shutdown: Notify,
    overrides: Mutex<ConfigOverrides>,
    clients: Mutex<HashMap<u64, JoinHandle<()>>>,
    next_client_id: AtomicU64,
    /// Serializes auth-query (mode D) superuser sessions so at most one is
    /// open at a time.
    su_connection: tokio::sync::Mutex<()>,
}

impl Supervisor {
    pub fn new(config: Config) -> Arc<Supervisor> {
        let metrics = Arc::new(RegistryMetrics::new());
        let pool = Arc::new(Pool::new(
            PoolConfig {
                max_connections: config.max_connections,
                blocking_timeout: config.blocking_timeout,
                authentication_timeout: config.authentication_timeout,
            },
            clone_limit_rules(&config.limit_rules),
            config.servers.clone(),
            config.credentials.backend_users.clone(),
            config.credentials.frontend_users.clone(),
            metrics.clone(),
        ));
        Arc::new(Supervisor {
            config_path: PathBuf::new(),
            config: ArcSwap::new(Arc::new(config)),
            pool,
            metrics,
            disabled: RwLock::new(std::collections::HashSet::new()),
            all_disabled: AtomicBool::new(false),
            gracefully: AtomicBool::new(false),
            shutdown: Notify::new(),
            overrides: Mutex::new(ConfigOverrides::default()),
            clients: Mutex::new(HashMap::new()),
            next_client_id: AtomicU64::new(0),
            su_connection: tokio::sync::Mutex::new(()),
        })
    }

    pub fn with_config_path(mut self: Arc<Self>, path: PathBuf) -> Arc<Self> {
        // `Arc::get_mut` only succeeds before any clone has escaped, which is
        // true right after `new()` — callers are expected to chain this
        // immediately (`Supervisor::new(cfg).with_config_path(path)`).
        if let Some(this) = Arc::get_mut(&mut self) {
            this.config_path = path;
        }
        self
    }

    pub fn metrics(&self) -> Arc<RegistryMetrics> {
        self.metrics.clone()
    }

    pub fn pool(&self) -> Arc<Pool> {
        self.pool.clone()
    }

    fn config(&self) -> Arc<Config> {
        self.config.load_full()
    }

    /// Binds every configured listener and runs the accept/signal/timer loop
    /// until `shutdown` fires. Prefill runs first so the first client never
    /// pays the cost of a cold pool.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        self.pool.prefill(self.config().max_retries).await;

        let config = self.config();
        let pg_listener = TcpListener::bind((config.host.as_str(), config.port))
            .await
            .with_context(|| format!("binding PostgreSQL listener on {}:{}", config.host, config.port))?;
        info!(host = %config.host, port = config.port, "PostgreSQL listener bound");

        let unix_path = config.unix_socket_dir.join(format!(".s.PGSQL.{}", config.port));
        let _ = std::fs::remove_file(&unix_path);
        let pg_unix_listener = UnixListener::bind(&unix_path)
            .with_context(|| format!("binding PostgreSQL unix listener at {}", unix_path.display()))?;
        info!(path = %unix_path.display(), "PostgreSQL unix listener bound");

        let management_path = config.unix_socket_dir.join(format!(".s.pgrelay.{}", config.port));
        let _ = std::fs::remove_file(&management_path);
        let management_listener = UnixListener::bind(&management_path)
            .with_context(|| format!("binding management socket at {}", management_path.display()))?;
        info!(path = %management_path.display(), "management socket bound");

        let this = self.clone();
        let tcp_accept = tokio::spawn(async move { this.accept_tcp_loop(pg_listener).await });
        let this = self.clone();
        let unix_accept = tokio::spawn(async move { this.accept_unix_loop(pg_unix_listener).await });
        let this = self.clone();
        let management_task =
            tokio::spawn(async move { crate::management::serve_unix(management_listener, &this).await });
        let this = self.clone();
        let maintenance_task = tokio::spawn(async move { this.maintenance_loop().await });
        let this = self.clone();
        let signal_task = tokio::spawn(async move { this.signal_loop().await });
        let this = self.clone();
        let rotate_task = tokio::spawn(async move { this.rotate_frontend_password_loop().await });

        let metrics_task = if let Some(port) = config.metrics_port {
            let listener = TcpListener::bind((config.host.as_str(), port))
                .await
                .with_context(|| format!("binding metrics listener on {}:{port}", config.host))?;
            info!(host = %config.host, port, "metrics listener bound");
            let metrics = self.metrics.clone();
            Some(tokio::spawn(async move { crate::management::serve_metrics(listener, metrics).await }))
        } else {
            None
        };

        let management_tcp_task = if let Some(port) = config.management_port {
            let listener = TcpListener::bind((config.host.as_str(), port))
                .await
                .with_context(|| format!("binding remote management listener on {}:{port}", config.host))?;
            info!(host = %config.host, port, "remote management listener bound");
            let this = self.clone();
            Some(tokio::spawn(async move { crate::management::serve_tcp(listener, &this).await }))
        } else {
            None
        };

        self.shutdown.notified().await;
        info!("shutdown requested, draining");

        tcp_accept.abort();
        unix_accept.abort();
        management_task.abort();
        maintenance_task.abort();
        signal_task.abort();
        rotate_task.abort();
        if let Some(task) = metrics_task {
            task.abort();
        }
        if let Some(task) = management_tcp_task {
            task.abort();
        }

        let pending: Vec<JoinHandle<()>> = {
            let mut clients = self.clients.lock().unwrap();
            clients.drain().map(|(_, handle)| handle).collect()
        };
        for handle in pending {
            let _ = handle.await;
        }

        let _ = std::fs::remove_file(&unix_path);
        let _ = std::fs::remove_file(&management_path);
        Ok(())
    }

    async fn accept_tcp_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let _ = stream.set_nodelay(true);
                    self.clone().spawn_client(Socket::Tcp(stream), Some(peer));
                }
                Err(err) => warn!(error = %err, "PostgreSQL TCP accept failed"),
            }
        }
    }

    async fn accept_unix_loop(self: Arc<Self>, listener: UnixListener) {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => self.clone().spawn_client(Socket::Unix(stream), None),
                Err(err) => warn!(error = %err, "PostgreSQL unix accept failed"),
            }
        }
    }

    fn spawn_client(self: Arc<Self>, socket: Socket, peer: Option<SocketAddr>) {
        let client_id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
        let this = self.clone();
        let handle = tokio::spawn(async move {
            if let Err(err) = this.handle_client(socket, peer).await {
                warn!(client = client_id, error = %err, "client session ended with error");
            }
            this.clients.lock().unwrap().remove(&client_id);
        });
        self.clients.lock().unwrap().insert(client_id, handle);
    }

    /// Drives one client connection from its first byte through to either
    /// rejection or handoff into a pipeline.
    async fn handle_client(&self, socket: Socket, peer: Option<SocketAddr>) -> Result<()> {
        let config = self.config();
        let mut raw = socket;
        let mut tls = false;

        let startup = loop {
            let packet = read_startup_packet(&mut raw)
                .await
                .context("reading startup packet")?;
            match packet {
                StartupPacket::Ssl => {
                    if let Some(tls_config) = build_server_tls(&config)? {
                        use tokio::io::AsyncWriteExt;
                        raw.write_all(b"S").await?;
                        let accepted = MaybeTlsStream::accept_server(raw, tls_config)
                            .await
                            .context("TLS handshake with client failed")?;
                        return self.handle_tls_client(accepted, peer).await;
                    } else {
                        use tokio::io::AsyncWriteExt;
                        raw.write_all(b"N").await?;
                        continue;
                    }
                }
                StartupPacket::GssEnc => {
                    use tokio::io::AsyncWriteExt;
                    raw.write_all(b"N").await?;
                    continue;
                }
                StartupPacket::Cancel(cancel) => {
                    self.handle_cancel_request(cancel).await;
                    return Ok(());
                }
                StartupPacket::Startup(msg) => break msg,
            }
        };
        let _ = tls;
        self.serve_authenticated(PgCodec::new(MaybeTlsStream::Raw(raw)), startup, peer, false)
            .await
    }

    async fn handle_tls_client(&self, stream: MaybeTlsStream, peer: Option<SocketAddr>) -> Result<()> {
        let mut codec = PgCodec::new(stream);
        let startup = match read_startup_packet(codec.stream_mut()).await? {
            StartupPacket::Startup(msg) => msg,
            StartupPacket::Cancel(cancel) => {
                self.handle_cancel_request(cancel).await;
                return Ok(());
            }
            _ => bail!("unexpected negotiation packet after TLS handshake"),
        };
        self.serve_authenticated(codec, startup, peer, true).await
    }

    /// The HBA/auth-mode dispatch common to both the plain and TLS startup
    /// paths.
    async fn serve_authenticated(
        &self,
        mut codec: PgCodec,
        startup: StartupMessage,
        peer: Option<SocketAddr>,
        tls: bool,
    ) -> Result<()> {
        let config = self.config();
        let username = startup.user().unwrap_or_default().to_owned();
        let requested_database = startup.database().unwrap_or_default().to_owned();
        let database = config.limit_rules.resolve_alias(&requested_database).to_owned();

        if self.database_disabled(&database) {
            send_error(&mut codec, AuthFailure::DatabaseDisabled).await?;
            return Ok(());
        }
        if self.gracefully.load(Ordering::Acquire) {
            send_error(&mut codec, AuthFailure::Gracefully).await?;
            return Ok(());
        }

        let address = peer.map(|p| p.ip());
        let method = config.hba.decide(ConnectionContext {
            database: &database,
            username: &username,
            address,
            tls,
        });

        let timeout = config.authentication_timeout;
        let outcome = self
            .authenticate(&mut codec, method, &username, &database, timeout)
            .await?;

        match outcome {
            AuthOutcome::Success => {
                self.metrics.auth_user_success(&username);
            }
            AuthOutcome::Failure(failure) => {
                self.metrics.auth_user_bad_password(&username);
                send_error(&mut codec, failure).await?;
                return Ok(());
            }
        }

        let pipeline_kind = config
            .pipeline_overrides
            .iter()
            .find(|(db, _)| db == &database)
            .map(|(_, kind)| *kind)
            .unwrap_or(config.default_pipeline);

        let policy = PipelinePolicy {
            kind: pipeline_kind,
            disconnect_client: if matches!(pipeline_kind, PipelineKind::Session) {
                config.disconnect_client
            } else {
                None
            },
            track_prepared_statements: config.track_prepared_statements,
        };

        let ctx = PipelineContext {
            client: codec,
            pool: self.pool.clone(),
            metrics: self.metrics.clone(),
            username,
            database,
            policy,
        };
        pipeline::run(ctx).await;
        Ok(())
    }

    /// Resolves which of modes B/C/D/Trust applies and drives it: an
    /// already-cached replay challenge first (mode B, cheapest), then a
    /// known frontend password (mode C), then auth-query (mode D) if
    /// enabled, else trust/reject as the HBA rule demands.
    async fn authenticate(
        &self,
        codec: &mut PgCodec,
        method: AuthMethod,
        username: &str,
        database: &str,
        timeout: Duration,
    ) -> Result<AuthOutcome> {
        // `all` defers to whatever the backend demands; pgrelay has no way to
        // probe that ahead of the backend handshake, so it is treated as the
        // most common concrete method.
        let method = if matches!(method, AuthMethod::All) { AuthMethod::Md5 } else { method };

        if matches!(method, AuthMethod::Reject) {
            return Ok(AuthOutcome::Failure(AuthFailure::HbaReject));
        }
        if matches!(method, AuthMethod::Trust) {
            return Ok(authenticate_client(codec, method, username, Credential::Trust, timeout).await?);
        }

        if let Some(challenge) = self.pool.cached_challenge_for(username, database) {
            return Ok(replay_cached(codec, username, &challenge, timeout).await?);
        }

        let config = self.config();
        if let Some(record) = config.credentials.frontend_users.get(username) {
            return Ok(authenticate_client(
                codec,
                method,
                username,
                Credential::Plaintext(&record.password),
                timeout,
            )
            .await?);
        }

        if config.auth_query {
            if let Some(superuser) = &config.credentials.superuser {
                let server = config.servers.select(pgrelay_core::server_registry::ServerRole::ReadWrite)?;
                let shadow = {
                    let _guard = if config.blocking_timeout.is_zero() {
                        self.su_connection.lock().await
                    } else {
                        tokio::time::timeout(config.blocking_timeout, self.su_connection.lock())
                            .await
                            .context("timed out waiting for the auth-query superuser session")?
                    };
                    authquery::lookup_password(
                        &server,
                        &superuser.username,
                        Some(&superuser.password),
                        username,
                        timeout,
                    )
                    .await?
                };
                if let Some(shadow) = shadow {
                    return Ok(authenticate_shadow(codec, method, username, &shadow, timeout).await?);
                }
            }
        }

        Ok(AuthOutcome::Failure(AuthFailure::HbaReject))
    }

    /// `CancelRequest`: find the slot whose backend key matches and forward
    /// a raw cancel to that backend. No reply is expected or sent.
    async fn handle_cancel_request(&self, cancel: CancelRequest) {
        let Some(index) = self.pool.find_slot_by_backend_key(cancel.process_id, cancel.secret_key) else {
            debug!(pid = cancel.process_id, "cancel request matched no live slot");
            return;
        };
        let server_index = self.pool.slot(index).occupant.lock().unwrap().server;
        let servers = self.pool.servers();
        let Some(server) = servers.servers.get(server_index) else {
            return;
        };
        match servers.connect_with_failover(server, self.metrics.as_ref()).await {
            Ok(mut socket) => {
                use tokio::io::AsyncWriteExt;
                let buf = cancel.encode();
                if let Err(err) = socket.write_all(&buf).await {
                    warn!(error = %err, "failed to forward cancel request");
                }
            }
            Err(err) => warn!(error = %err, "failed to connect to backend to forward cancel request"),
        }
    }

    fn database_disabled(&self, database: &str) -> bool {
        if self.all_disabled.load(Ordering::Acquire) {
            return true;
        }
        self.disabled.read().unwrap().contains(database)
    }

    /// Periodic idle/max-age/validation sweep plus prefill top-up.
    async fn maintenance_loop(self: Arc<Self>) {
        let interval = self.config().background_interval;
        let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
        loop {
            ticker.tick().await;
            let config = self.config();
            let reclaimed = self
                .pool
                .sweep(config.idle_timeout, config.max_connection_age, config.validation)
                .await;
            if reclaimed > 0 {
                debug!(reclaimed, "maintenance sweep reclaimed slots");
            }
            self.pool.prefill(config.max_retries).await;
        }
    }

    /// `rotate_frontend_password_timeout`: regenerates every frontend
    /// user's password on a timer and swaps the new table into the pool so
    /// the next frontend-authenticated client picks it up; cached
    /// `security_messages` replay (mode B) is left untouched by a rotation,
    /// so a slot created before the rotation keeps replaying the
    /// pre-rotation password until it's recycled. A no-op when rotation is
    /// disabled or no frontend-users file is configured.
    async fn rotate_frontend_password_loop(self: Arc<Self>) {
        let Some(interval) = self.config().rotate_frontend_password_timeout else {
            std::future::pending::<()>().await;
            return;
        };
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // first tick fires immediately; skip it
        loop {
            ticker.tick().await;
            let config = self.config();
            let Some(path) = &config.frontend_users_path else {
                continue;
            };
            let current = self.pool.frontend_users();
            match crate::config::rotate_frontend_passwords(path, &config.master_key, &current) {
                Ok(rotated) => {
                    self.pool.replace_frontend_users(rotated);
                    info!("rotated frontend user passwords");
                }
                Err(err) => error!(error = %err, "failed to rotate frontend user passwords"),
            }
        }
    }

    /// SIGHUP reloads, SIGTERM/SIGINT shut down, SIGUSR2 requests a graceful
    /// drain (there's no signal with quite the right semantics on every
    /// platform Tokio supports, so SIGUSR2 stands in), SIGUSR1 is a
    /// services-only reload (same as SIGHUP here, since pgrelay's
    /// "services" config lives in the same file pgrelay.toml
    /// already reloads wholesale).
    async fn signal_loop(self: Arc<Self>) {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");
            let mut int = signal(SignalKind::interrupt()).expect("install SIGINT handler");
            let mut hup = signal(SignalKind::hangup()).expect("install SIGHUP handler");
            let mut usr1 = signal(SignalKind::user_defined1()).expect("install SIGUSR1 handler");
            let mut usr2 = signal(SignalKind::user_defined2()).expect("install SIGUSR2 handler");
            loop {
                tokio::select! {
                    _ = term.recv() => { info!("SIGTERM received"); self.shutdown.notify_waiters(); }
                    _ = int.recv() => { info!("SIGINT received"); self.shutdown.notify_waiters(); }
                    _ = hup.recv() => {
                        info!("SIGHUP received, reloading");
                        if let Err(err) = self.reload().await {
                            error!(error = %err, "reload on SIGHUP failed");
                        }
                    }
                    _ = usr1.recv() => {
                        info!("SIGUSR1 received, reloading");
                        if let Err(err) = self.reload().await {
                            error!(error = %err, "reload on SIGUSR1 failed");
                        }
                    }
                    _ = usr2.recv() => {
                        info!("SIGUSR2 received, requesting graceful drain");
                        self.gracefully.store(true, Ordering::Release);
                    }
                }
            }
        }
        #[cfg(not(unix))]
        {
            std::future::pending::<()>().await;
        }
    }

    // --- administrative surface consumed by `management.rs` ---

    /// `FLUSH`/`CLEAR`: kill every `Free` slot, optionally scoped to one
    /// database.
    pub fn flush(&self, database: Option<&str>) -> usize {
        let mut reclaimed = 0;
        for index in 0..self.pool.slot_count() {
            let slot = self.pool.slot(index);
            if slot.state.load() != pgrelay_core::slot::SlotState::Free {
                continue;
            }
            if let Some(db) = database {
                if slot.occupant.lock().unwrap().database != db {
                    continue;
                }
            }
            self.pool.kill(index);
            reclaimed += 1;
        }
        reclaimed
    }

    pub fn set_database_disabled(&self, database: &str, disabled: bool) {
        if database == "all" {
            self.all_disabled.store(disabled, Ordering::Release);
            return;
        }
        let mut set = self.disabled.write().unwrap();
        if disabled {
            set.insert(database.to_owned());
        } else {
            set.remove(database);
        }
    }

    pub fn database_summaries(&self) -> Vec<DatabaseSummary> {
        let rules = self.pool.limit_rules();
        rules
            .rules
            .iter()
            .filter(|r| r.database != "all")
            .map(|r| DatabaseSummary {
                database: r.database.clone(),
                active_connections: r.active(),
                max_size: r.max_size,
                disabled: self.database_disabled(&r.database),
            })
            .collect()
    }

    pub fn details_text(&self) -> String {
        format!(
            "pgrelay: active_connections={} gracefully={} all_disabled={}",
            self.pool.active_connections(),
            self.gracefully.load(Ordering::Acquire),
            self.all_disabled.load(Ordering::Acquire)
        )
    }

    pub fn clear_server(&self, server: &str) -> Result<()> {
        let servers = self.pool.servers();
        let target = servers
            .servers
            .iter()
            .find(|s| s.name == server)
            .ok_or_else(|| anyhow::anyhow!("unknown server {server:?}"))?;
        target.state.store(pgrelay_core::model::ServerState::NotInit);
        for index in 0..self.pool.slot_count() {
            let slot = self.pool.slot(index);
            let owns = slot.occupant.lock().unwrap().server
                == servers.servers.iter().position(|s| s.name == server).unwrap_or(usize::MAX);
            if owns && slot.state.load() != pgrelay_core::slot::SlotState::NotInit {
                self.pool.kill(index);
            }
        }
        Ok(())
    }

    pub fn switch_to(&self, server: &str) -> Result<()> {
        let servers = self.pool.servers();
        let target = servers
            .servers
            .iter()
            .find(|s| s.name == server)
            .ok_or_else(|| anyhow::anyhow!("unknown server {server:?}"))?;
        for s in &servers.servers {
            if s.name != server
                && matches!(
                    s.state.load(),
                    pgrelay_core::model::ServerState::Primary | pgrelay_core::model::ServerState::NotInitPrimary
                )
            {
                s.state.store(pgrelay_core::model::ServerState::Replica);
            }
        }
        target.state.store(pgrelay_core::model::ServerState::Primary);
        info!(server = %server, "switched primary via management command");
        Ok(())
    }

    /// Re-reads `pgrelay.toml` and its credential/HBA files, swapping in the
    /// new config, limit rules, HBA table, and credential tables atomically.
    /// Existing slots are left untouched, so a slot's cached frontend-auth
    /// challenge keeps replaying whatever password was current when the
    /// slot was created until the slot itself is recycled; only the prefill
    /// pass after this picks up any newly added limit rules.
    pub async fn reload(&self) -> Result<()> {
        if self.config_path.as_os_str().is_empty() {
            bail!("no config path recorded for this supervisor instance");
        }
        let new_config = Config::load(&self.config_path)?;
        self.pool.replace_limit_rules(clone_limit_rules(&new_config.limit_rules));
        self.pool.replace_backend_users(new_config.credentials.backend_users.clone());
        self.pool.replace_frontend_users(new_config.credentials.frontend_users.clone());
        self.config.store(Arc::new(new_config));
        self.pool.prefill(self.config().max_retries).await;
        info!("configuration reloaded");
        Ok(())
    }

    pub fn config_ls(&self) -> String {
        let config = self.config();
        format!(
            "host={} port={} max_connections={} pipeline={:?} auth_query={}",
            config.host, config.port, config.max_connections, config.default_pipeline, config.auth_query
        )
    }

    pub fn config_get(&self, key: &str) -> Option<String> {
        let overrides = self.overrides.lock().unwrap();
        let resolved_key = overrides.aliases.get(key).cloned().unwrap_or_else(|| key.to_owned());
        if let Some(value) = overrides.values.get(&resolved_key) {
            return Some(value.clone());
        }
        let config = self.config();
        match resolved_key.as_str() {
            "host" => Some(config.host.clone()),
            "port" => Some(config.port.to_string()),
            "max_connections" => Some(config.max_connections.to_string()),
            "auth_query" => Some(config.auth_query.to_string()),
            _ => None,
        }
    }

    pub fn config_set(&self, key: &str, value: &str) -> Result<()> {
        let mut overrides = self.overrides.lock().unwrap();
        let resolved_key = overrides.aliases.get(key).cloned().unwrap_or_else(|| key.to_owned());
        overrides.values.insert(resolved_key, value.to_owned());
        Ok(())
    }

    pub fn config_alias(&self, alias: &str, key: &str) -> Result<()> {
        let mut overrides = self.overrides.lock().unwrap();
        overrides.aliases.insert(alias.to_owned(), key.to_owned());
        Ok(())
    }

    /// Admin credential table, consulted by the remote-management TCP
    /// listener's SCRAM gate.
    pub fn admins(&self) -> Arc<pgrelay_core::model::UserTable> {
        Arc::new(self.config().credentials.admins.clone())
    }

    pub fn get_password(&self, username: &str) -> Option<String> {
        let config = self.config();
        config
            .credentials
            .frontend_users
            .get(username)
            .or_else(|| config.credentials.backend_users.get(username))
            .map(|record| record.password.clone())
    }
}

/// Dispatches an auth-query shadow value to the right server-role method: a
/// `SCRAM-SHA-256$...` prefix is a verifier string, anything else an md5
/// hash.
async fn authenticate_shadow(
    codec: &mut PgCodec,
    method: AuthMethod,
    username: &str,
    shadow: &str,
    timeout: Duration,
) -> pgrelay_core::error::Result<AuthOutcome> {
    if let Ok(verifier) = pgrelay_core::auth::scram::ScramVerifier::parse(shadow) {
        authenticate_client(codec, method, username, Credential::ScramVerifier(verifier), timeout).await
    } else {
        authenticate_client(codec, method, username, Credential::Md5StoredHash(shadow), timeout).await
    }
}

async fn send_error(codec: &mut PgCodec, failure: AuthFailure) -> Result<()> {
    let response = ErrorResponse::simple("FATAL", failure.sqlstate(), failure.to_string());
    codec
        .write_and_flush(MessageFormat::ErrorResponse, &response)
        .await
        .context("writing auth failure response")?;
    Ok(())
}

/// Builds a `rustls::ServerConfig` from the configured cert/key pair, or
/// `None` when TLS is not configured — in which case an `SSLRequest` is
/// answered `'N'` and the connection continues in plaintext.
fn build_server_tls(config: &Config) -> Result<Option<Arc<rustls::ServerConfig>>> {
    let (Some(cert_path), Some(key_path)) = (&config.tls_cert_file, &config.tls_key_file) else {
        return Ok(None);
    };
    let cert_file = std::fs::File::open(cert_path).with_context(|| format!("opening {}", cert_path.display()))?;
    let certs = rustls_pemfile::certs(&mut std::io::BufReader::new(cert_file))
        .collect::<std::result::Result<Vec<_>, _>>()
        .context("parsing TLS certificate chain")?;

    let key_file = std::fs::File::open(key_path).with_context(|| format!("opening {}", key_path.display()))?;
    let key = rustls_pemfile::private_key(&mut std::io::BufReader::new(key_file))
        .context("parsing TLS private key")?
        .ok_or_else(|| anyhow::anyhow!("no private key found in {}", key_path.display()))?;

    let server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("building TLS server config")?;
    Ok(Some(Arc::new(server_config)))
}

fn clone_limit_rules(rules: &pgrelay_core::model::LimitRules) -> pgrelay_core::model::LimitRules {
    use pgrelay_core::model::LimitRule;
    let cloned: Vec<LimitRule> = rules
        .rules
        .iter()
        .map(|r| {
            let mut rule = LimitRule::new(&r.database, &r.username, r.min_size, r.initial_size, r.max_size);
            rule.aliases = r.aliases.clone();
            rule
        })
        .collect();
    pgrelay_core::model::LimitRules::new(cloned).expect("already-validated limit rules re-validate cleanly")
}
