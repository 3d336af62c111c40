//! `pgrelay.toml` (+ `users.toml`/`frontend_users.toml`/`admins.toml`/
//! `superuser.toml`/`hba.toml`) loading.
//!
//! Grounded in `sqlx_core::config::Config` (a typed struct deserialized
//! with `serde`, `#[serde(default)]`, kebab-case keys) generalized from
//! sqlx's single `sqlx.toml` to pgrelay's multi-file layout, since
//! credentials live in separate files that are each independently
//! AES-256-CBC-encrypted under the master key rather than sitting in the
//! main config.

use std::collections::HashSet;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use base64::Engine;
use serde::{Deserialize, Serialize};

use pgrelay_core::hba::{AddressMatch, AuthMethod, HbaRule, HbaTable, HostType};
use pgrelay_core::model::{Credentials, Endpoint, LimitRule, LimitRules, Server, ServerState, ServerTls, UserRecord, UserTable};
use pgrelay_core::pipeline::PipelineKind;
use pgrelay_core::protocol::MAX_PASSWORD_CHARS;
use pgrelay_core::server_registry::ServerRegistry;

use crate::master_key::{self, MasterKey};

/// Top-level `pgrelay.toml` shape.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct RawConfig {
    pub general: General,
    #[serde(rename = "server")]
    pub servers: Vec<RawServer>,
    #[serde(rename = "limit")]
    pub limits: Vec<RawLimit>,
}

impl Default for RawConfig {
    fn default() -> Self {
        RawConfig {
            general: General::default(),
            servers: Vec::new(),
            limits: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct General {
    pub host: String,
    pub port: u16,
    pub unix_socket_dir: PathBuf,
    pub pidfile: Option<PathBuf>,
    pub max_connections: u32,
    pub pipeline: String,
    pub authentication_timeout_secs: u64,
    pub blocking_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub max_connection_age_secs: u64,
    pub disconnect_client_secs: u64,
    pub validation: String,
    pub background_interval_secs: u64,
    pub rotate_frontend_password_timeout_secs: u64,
    pub max_retries: u32,
    pub track_prepared_statements: bool,
    pub auth_query: bool,
    pub failover: bool,
    pub failover_script: Option<String>,
    pub management_port: Option<u16>,
    pub metrics_port: Option<u16>,
    pub tls_cert_file: Option<PathBuf>,
    pub tls_key_file: Option<PathBuf>,
    pub tls_ca_file: Option<PathBuf>,
    pub users_path: PathBuf,
    pub frontend_users_path: Option<PathBuf>,
    pub admins_path: Option<PathBuf>,
    pub superuser_path: Option<PathBuf>,
    pub hba_path: PathBuf,
}

impl Default for General {
    fn default() -> Self {
        General {
            host: "localhost".into(),
            port: 2345,
            unix_socket_dir: PathBuf::from("/tmp"),
            pidfile: None,
            max_connections: 100,
            pipeline: "performance".into(),
            authentication_timeout_secs: 5,
            blocking_timeout_secs: 0,
            idle_timeout_secs: 0,
            max_connection_age_secs: 0,
            disconnect_client_secs: 0,
            validation: "off".into(),
            background_interval_secs: 0,
            rotate_frontend_password_timeout_secs: 0,
            max_retries: 5,
            track_prepared_statements: false,
            auth_query: false,
            failover: false,
            failover_script: None,
            management_port: None,
            metrics_port: None,
            tls_cert_file: None,
            tls_key_file: None,
            tls_ca_file: None,
            users_path: PathBuf::from("pgrelay_users.conf"),
            frontend_users_path: None,
            admins_path: None,
            superuser_path: None,
            hba_path: PathBuf::from("pgrelay_hba.conf"),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RawServer {
    pub name: String,
    pub host: String,
    pub port: Option<u16>,
    #[serde(default)]
    pub primary: bool,
    pub tls_cert_file: Option<PathBuf>,
    pub tls_key_file: Option<PathBuf>,
    pub tls_ca_file: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RawLimit {
    pub database: String,
    pub username: String,
    #[serde(default)]
    pub min_size: u32,
    #[serde(default)]
    pub initial_size: u32,
    pub max_size: u32,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub pipeline: Option<String>,
}

/// One credential-table entry, as stored (encrypted) on disk.
#[derive(Debug, Deserialize, Serialize)]
pub struct RawUser {
    pub username: String,
    /// Base64 `iv || AES-256-CBC ciphertext` of the plaintext password,
    /// decrypted against the master key at load time.
    pub password: String,
}

#[derive(Debug, Deserialize, Serialize, Default)]
pub struct RawUserFile {
    #[serde(rename = "user", default)]
    pub users: Vec<RawUser>,
}

/// One `pgrelay_hba.conf`-equivalent rule, loaded as TOML rather than the
/// upstream line-oriented `pg_hba.conf` grammar. Parsing this file is this
/// module's job; the decision algorithm over the resulting table lives in
/// [`pgrelay_core::hba`].
#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RawHbaRule {
    #[serde(rename = "type")]
    pub host_type: String,
    pub database: String,
    pub username: String,
    pub address: String,
    pub method: String,
}

#[derive(Debug, Deserialize, Default)]
pub struct RawHbaFile {
    #[serde(rename = "rule", default)]
    pub rules: Vec<RawHbaRule>,
}

/// Everything [`crate::supervisor::Supervisor`] needs, parsed and
/// validated from disk.
pub struct Config {
    pub host: String,
    pub port: u16,
    pub unix_socket_dir: PathBuf,
    pub pidfile: PathBuf,
    pub max_connections: u32,
    pub default_pipeline: PipelineKind,
    pub authentication_timeout: Duration,
    pub blocking_timeout: Duration,
    pub idle_timeout: Option<Duration>,
    pub max_connection_age: Option<Duration>,
    pub disconnect_client: Option<Duration>,
    pub validation: bool,
    pub background_interval: Duration,
    /// `rotate_frontend_password_timeout`: periodic regeneration of every
    /// frontend user's password. `None` disables it (the default — most
    /// deployments don't enable frontend credential rotation).
    pub rotate_frontend_password_timeout: Option<Duration>,
    pub max_retries: u32,
    pub track_prepared_statements: bool,
    pub auth_query: bool,
    pub management_port: Option<u16>,
    pub metrics_port: Option<u16>,
    pub servers: Arc<ServerRegistry>,
    pub limit_rules: LimitRules,
    pub hba: HbaTable,
    pub credentials: Arc<Credentials>,
    /// Per-database pipeline override, resolved from `[[limit]] pipeline` —
    /// a database can be bound to a specific pipeline.
    pub pipeline_overrides: Vec<(String, PipelineKind)>,
    /// Frontend-facing TLS material for terminating a client's `SSLRequest`.
    /// Distinct from each [`ServerTls`] entry, which is the client-role
    /// certificate pgrelay presents to an upstream server.
    pub tls_cert_file: Option<PathBuf>,
    pub tls_key_file: Option<PathBuf>,
    /// Needed so frontend-password rotation can re-encrypt and persist the
    /// regenerated table back to disk; `None` when no frontend-users file is
    /// configured, in which case rotation is a no-op.
    pub frontend_users_path: Option<PathBuf>,
    pub master_key: Arc<MasterKey>,
}

impl Config {
    /// Loads `pgrelay.toml` at `path`, the credential files it names, and
    /// the master key, producing a fully validated [`Config`].
    pub fn load(path: &Path) -> Result<Config> {
        let raw_text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let raw: RawConfig = toml::from_str(&raw_text)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));

        let key = master_key::load(&master_key::default_path()?)
            .context("loading master key")?;

        let servers = build_servers(&raw.servers)?;
        let limit_rules = build_limit_rules(&raw.limits, raw.general.max_connections)?;
        let pipeline_overrides = raw
            .limits
            .iter()
            .filter_map(|l| {
                l.pipeline
                    .as_deref()
                    .map(parse_pipeline)
                    .transpose()
                    .ok()
                    .flatten()
                    .map(|kind| (l.database.clone(), kind))
            })
            .collect();

        let credentials = build_credentials(base_dir, &raw.general, &key)?;
        let hba = build_hba(&base_dir.join(&raw.general.hba_path))?;

        Ok(Config {
            host: raw.general.host,
            port: raw.general.port,
            unix_socket_dir: raw.general.unix_socket_dir.clone(),
            pidfile: raw
                .general
                .pidfile
                .unwrap_or_else(|| raw.general.unix_socket_dir.join(format!("pgrelay.{}.pid", raw.general.port))),
            max_connections: raw.general.max_connections,
            default_pipeline: parse_pipeline(&raw.general.pipeline)?,
            authentication_timeout: Duration::from_secs(raw.general.authentication_timeout_secs),
            blocking_timeout: Duration::from_secs(raw.general.blocking_timeout_secs),
            idle_timeout: non_zero_duration(raw.general.idle_timeout_secs),
            max_connection_age: non_zero_duration(raw.general.max_connection_age_secs),
            disconnect_client: non_zero_duration(raw.general.disconnect_client_secs),
            validation: raw.general.validation == "on",
            background_interval: Duration::from_secs(raw.general.background_interval_secs.max(1)),
            rotate_frontend_password_timeout: non_zero_duration(raw.general.rotate_frontend_password_timeout_secs),
            max_retries: raw.general.max_retries,
            track_prepared_statements: raw.general.track_prepared_statements,
            auth_query: raw.general.auth_query,
            management_port: raw.general.management_port,
            metrics_port: raw.general.metrics_port,
            servers: Arc::new(ServerRegistry::new(servers, raw.general.failover, raw.general.failover_script)),
            limit_rules,
            hba,
            credentials: Arc::new(credentials),
            pipeline_overrides,
            tls_cert_file: raw.general.tls_cert_file,
            tls_key_file: raw.general.tls_key_file,
            frontend_users_path: raw.general.frontend_users_path.map(|p| base_dir.join(p)),
            master_key: Arc::new(key),
        })
    }
}

fn non_zero_duration(secs: u64) -> Option<Duration> {
    if secs == 0 {
        None
    } else {
        Some(Duration::from_secs(secs))
    }
}

fn parse_pipeline(s: &str) -> Result<PipelineKind> {
    Ok(match s {
        "performance" => PipelineKind::Performance,
        "session" => PipelineKind::Session,
        "transaction" => PipelineKind::Transaction,
        other => bail!("unknown pipeline {other:?} (expected performance/session/transaction)"),
    })
}

fn build_servers(raw: &[RawServer]) -> Result<Vec<Server>> {
    let mut out = Vec::with_capacity(raw.len());
    for s in raw {
        let endpoint = if s.host.starts_with('/') {
            Endpoint::Unix { path: s.host.clone() }
        } else {
            Endpoint::Tcp {
                host: s.host.clone(),
                port: s.port.unwrap_or(5432),
            }
        };
        let tls = if s.tls_cert_file.is_some() || s.tls_key_file.is_some() || s.tls_ca_file.is_some() {
            Some(ServerTls {
                cert: s.tls_cert_file.as_ref().map(|p| p.display().to_string()),
                key: s.tls_key_file.as_ref().map(|p| p.display().to_string()),
                ca: s.tls_ca_file.as_ref().map(|p| p.display().to_string()),
            })
        } else {
            None
        };
        out.push(Server {
            name: s.name.clone(),
            endpoint,
            tls,
            state: pgrelay_core::model::AtomicServerState::new(if s.primary {
                ServerState::NotInitPrimary
            } else {
                ServerState::NotInit
            }),
            accepts_replica_reads: !s.primary,
        });
    }
    if out.is_empty() {
        bail!("configuration must declare at least one [[server]]");
    }
    Ok(out)
}

fn build_limit_rules(raw: &[RawLimit], max_connections: u32) -> Result<LimitRules> {
    let mut rules = Vec::with_capacity(raw.len());
    for l in raw {
        let mut rule = LimitRule::new(&l.database, &l.username, l.min_size, l.initial_size, l.max_size);
        rule.aliases = l.aliases.clone();
        rules.push(rule);
    }
    let built = LimitRules::new(rules).map_err(|e| anyhow::anyhow!(e.to_string()))?;
    if built.total_max() > max_connections as u64 {
        bail!(
            "sum of limit max_size ({}) exceeds max_connections ({max_connections})",
            built.total_max()
        );
    }
    Ok(built)
}

fn build_credentials(base_dir: &Path, general: &General, key: &MasterKey) -> Result<Credentials> {
    let backend_users = load_user_table(&base_dir.join(&general.users_path), key)?;
    let frontend_users = match &general.frontend_users_path {
        Some(p) => load_user_table(&base_dir.join(p), key)?,
        None => UserTable::default(),
    };
    let admins = match &general.admins_path {
        Some(p) => load_user_table(&base_dir.join(p), key)?,
        None => UserTable::default(),
    };
    let superuser = match &general.superuser_path {
        Some(p) => load_user_table(&base_dir.join(p), key)?.get("superuser").cloned(),
        None => None,
    };
    Ok(Credentials {
        backend_users,
        frontend_users,
        admins,
        superuser,
    })
}

fn load_user_table(path: &Path, key: &MasterKey) -> Result<UserTable> {
    if !path.exists() {
        return Ok(UserTable::default());
    }
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let raw: RawUserFile = toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    let mut records = Vec::with_capacity(raw.users.len());
    for u in raw.users {
        let password = master_key::decrypt(key, &u.password)
            .with_context(|| format!("decrypting password for user {:?} in {}", u.username, path.display()))?;
        validate_password(&password)
            .with_context(|| format!("validating password for user {:?} in {}", u.username, path.display()))?;
        records.push(UserRecord {
            username: u.username,
            password,
        });
    }
    Ok(UserTable::new(records))
}

/// Well-formed UTF-8 (guaranteed once this is a `String`) and bounded by
/// `MAX_PASSWORD_CHARS` scalar values, checked at load time rather than at
/// auth time.
fn validate_password(password: &str) -> Result<()> {
    if password.chars().count() > MAX_PASSWORD_CHARS {
        bail!("password exceeds MAX_PASSWORD_CHARS ({MAX_PASSWORD_CHARS})");
    }
    Ok(())
}

fn build_hba(path: &Path) -> Result<HbaTable> {
    if !path.exists() {
        return Ok(HbaTable::new(Vec::new()));
    }
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let raw: RawHbaFile = toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    let mut rules = Vec::with_capacity(raw.rules.len());
    for r in raw.rules {
        let host_type = match r.host_type.as_str() {
            "host" => HostType::Host,
            "hostssl" => HostType::HostSsl,
            other => bail!("unknown hba rule type {other:?} (expected host/hostssl)"),
        };
        let method = AuthMethod::parse(&r.method)
            .ok_or_else(|| anyhow::anyhow!("unknown hba method {:?}", r.method))?;
        let address = parse_address(&r.address)?;
        rules.push(HbaRule {
            host_type,
            database: r.database,
            username: r.username,
            address,
            method,
        });
    }
    Ok(HbaTable::new(rules))
}

fn parse_address(s: &str) -> Result<AddressMatch> {
    if s == "all" {
        return Ok(AddressMatch::All);
    }
    let (addr, bits) = s
        .split_once('/')
        .with_context(|| format!("hba address {s:?} must be \"all\" or CIDR notation"))?;
    let addr: IpAddr = addr.parse().with_context(|| format!("invalid hba address {addr:?}"))?;
    let bits: u8 = bits.parse().with_context(|| format!("invalid hba prefix length {bits:?}"))?;
    Ok(AddressMatch::Cidr(addr, bits))
}

/// `rotate_frontend_password_timeout`: generates a fresh random password
/// for every frontend user, persists the re-encrypted table back to `path`,
/// and returns the new in-memory table so the supervisor can swap it into
/// the pool immediately without waiting for a reload.
pub fn rotate_frontend_passwords(path: &Path, key: &MasterKey, current: &UserTable) -> Result<UserTable> {
    use rand::RngCore;
    let mut raw = RawUserFile::default();
    let mut records = Vec::new();
    for username in current.usernames() {
        let mut bytes = [0u8; 24];
        rand::thread_rng().fill_bytes(&mut bytes);
        let password = base64::engine::general_purpose::STANDARD.encode(bytes);
        raw.users.push(RawUser {
            username: username.clone(),
            password: master_key::encrypt(key, &password)?,
        });
        records.push(UserRecord { username, password });
    }
    let text = toml::to_string_pretty(&raw).context("serializing rotated frontend-users table")?;
    std::fs::write(path, text).with_context(|| format!("writing rotated frontend users to {}", path.display()))?;
    Ok(UserTable::new(records))
}

/// The set of databases that begin disabled — none by default; populated
/// only via the `DISABLEDB` management command at runtime, never from
/// config.
pub fn initial_disabled_set() -> HashSet<String> {
    HashSet::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_cidr_address() {
        match parse_address("10.0.0.0/8").unwrap() {
            AddressMatch::Cidr(addr, bits) => {
                assert_eq!(addr.to_string(), "10.0.0.0");
                assert_eq!(bits, 8);
            }
            AddressMatch::All => panic!("expected CIDR"),
        }
    }

    #[test]
    fn parses_all_address() {
        assert!(matches!(parse_address("all").unwrap(), AddressMatch::All));
    }

    #[test]
    fn rejects_unknown_pipeline() {
        assert!(parse_pipeline("query-cache").is_err());
    }

    #[test]
    fn rotate_frontend_passwords_changes_every_password_and_persists() {
        let key = MasterKey([7u8; 32]);
        let dir = std::env::temp_dir().join(format!("pgrelay-rotate-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("frontend-users.toml");

        let before = UserTable::new(vec![
            UserRecord { username: "alice".into(), password: "old-alice".into() },
            UserRecord { username: "bob".into(), password: "old-bob".into() },
        ]);

        let after = rotate_frontend_passwords(&path, &key, &before).unwrap();

        assert_eq!(after.len(), 2);
        assert_ne!(after.get("alice").unwrap().password, "old-alice");
        assert_ne!(after.get("bob").unwrap().password, "old-bob");

        let persisted: RawUserFile = toml::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(persisted.users.len(), 2);
        let decrypted = master_key::decrypt(&key, &persisted.users[0].password).unwrap();
        assert_eq!(decrypted, after.get(&persisted.users[0].username).unwrap().password);

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
