//! Ordered list of upstream PostgreSQL endpoints.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Command;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::model::{Endpoint, Server, ServerState};
use crate::net::Socket;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerRole {
    /// Only `Primary`/`NotInitPrimary` servers are acceptable.
    ReadWrite,
    /// `Primary` preferred, `Replica` acceptable.
    ReadOnly,
}

pub struct ServerRegistry {
    pub servers: Vec<Arc<Server>>,
    pub failover_enabled: bool,
    pub failover_script: Option<String>,
}

impl ServerRegistry {
    pub fn new(servers: Vec<Server>, failover_enabled: bool, failover_script: Option<String>) -> Self {
        ServerRegistry {
            servers: servers.into_iter().map(Arc::new).collect(),
            failover_enabled,
            failover_script,
        }
    }

    /// Select a server for a new backend connection.
    pub fn select(&self, role: ServerRole) -> Result<Arc<Server>> {
        if let Some(primary) = self.servers.iter().find(|s| {
            matches!(
                s.state.load(),
                ServerState::NotInitPrimary | ServerState::Primary
            )
        }) {
            return Ok(primary.clone());
        }
        if role == ServerRole::ReadOnly {
            if let Some(replica) = self
                .servers
                .iter()
                .find(|s| s.state.load() == ServerState::Replica && s.accepts_replica_reads)
            {
                return Ok(replica.clone());
            }
        }
        Err(Error::NoServer)
    }

    /// Attempts a TCP/Unix connect to `server`; on failure marks it
    /// `Failed`, emits the `server_error` metric, and — if failover is
    /// enabled — runs the configured script once and retries the connect.
    pub async fn connect_with_failover(
        &self,
        server: &Arc<Server>,
        metrics: &dyn crate::metrics::Metrics,
    ) -> Result<Socket> {
        match self.connect_once(server).await {
            Ok(socket) => Ok(socket),
            Err(err) => {
                server.state.store(ServerState::Failed);
                metrics.server_error(&server.name);
                warn!(server = %server.name, error = %err, "backend connect failed");

                if self.failover_enabled {
                    if let Some(script) = &self.failover_script {
                        run_failover_script(script, &server.name).await;
                    }
                    return self.connect_once(server).await;
                }
                Err(err)
            }
        }
    }

    async fn connect_once(&self, server: &Server) -> Result<Socket> {
        match &server.endpoint {
            Endpoint::Tcp { host, port } => Ok(Socket::connect_tcp(host, *port).await?),
            Endpoint::Unix { path } => Ok(Socket::connect_unix(path).await?),
        }
    }

    /// Probes `pg_is_in_recovery()` over an already-authenticated
    /// connection, CASing `NotInit -> Primary`/`Replica` accordingly. The
    /// query result itself is decided by the caller, which owns the live
    /// backend connection; this just records the outcome.
    pub fn record_probe_result(&self, server: &Arc<Server>, in_recovery: bool) {
        let target = if in_recovery {
            ServerState::Replica
        } else {
            ServerState::Primary
        };
        let _ = server
            .state
            .compare_exchange(ServerState::NotInit, target)
            || server
                .state
                .compare_exchange(ServerState::NotInitPrimary, target);
        info!(server = %server.name, state = ?server.state.load(), "server probe result recorded");
    }
}

async fn run_failover_script(script: &str, server_name: &str) {
    let result = tokio::time::timeout(
        Duration::from_secs(30),
        Command::new(script)
            .arg(server_name)
            .stdin(Stdio::null())
            .status(),
    )
    .await;
    match result {
        Ok(Ok(status)) if status.success() => info!(server = %server_name, "failover script completed"),
        Ok(Ok(status)) => warn!(server = %server_name, code = ?status.code(), "failover script exited non-zero"),
        Ok(Err(err)) => warn!(server = %server_name, error = %err, "failover script could not be spawned"),
        Err(_) => warn!(server = %server_name, "failover script timed out"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(name: &str, state: ServerState) -> Server {
        Server {
            name: name.into(),
            endpoint: Endpoint::Tcp {
                host: "127.0.0.1".into(),
                port: 5432,
            },
            tls: None,
            state: crate::model::AtomicServerState::new(state),
            accepts_replica_reads: true,
        }
    }

    #[test]
    fn prefers_primary_in_registry_order() {
        let registry = ServerRegistry::new(
            vec![
                server("replica", ServerState::Replica),
                server("primary", ServerState::Primary),
            ],
            false,
            None,
        );
        let chosen = registry.select(ServerRole::ReadWrite).unwrap();
        assert_eq!(chosen.name, "primary");
    }

    #[test]
    fn falls_back_to_replica_for_read_only() {
        let registry = ServerRegistry::new(vec![server("replica", ServerState::Replica)], false, None);
        let chosen = registry.select(ServerRole::ReadOnly).unwrap();
        assert_eq!(chosen.name, "replica");
    }

    #[test]
    fn no_server_when_all_failed() {
        let registry = ServerRegistry::new(vec![server("down", ServerState::Failed)], false, None);
        assert!(matches!(
            registry.select(ServerRole::ReadWrite),
            Err(Error::NoServer)
        ));
    }
}
