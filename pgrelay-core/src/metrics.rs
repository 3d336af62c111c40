//! Metrics collector interface.
//!
//! The Prometheus text-exposition format itself is a minimal stand-in
//! rather than a full encoder; this models the contract the
//! pool/supervisor use to update counters and gauges, with a `/metrics`
//! text encoder behind the same trait so the surface is complete even
//! though the encoding is bare-bones.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Anything the pool core can report counters/gauges to. A real deployment
/// wires this to a Prometheus text exporter; tests wire it to
/// [`NoopMetrics`] or inspect a [`RegistryMetrics`] directly.
pub trait Metrics: Send + Sync {
    fn connection_error(&self) {}
    fn auth_user_success(&self, _username: &str) {}
    fn auth_user_bad_password(&self, _username: &str) {}
    fn server_error(&self, _server: &str) {}
    fn pool_full(&self) {}
    fn slot_state_changed(&self, _index: usize) {}
    fn query_count(&self) {}
}

/// Discards everything — used where a `Metrics` is required but the
/// caller (a unit test, a CLI one-shot) doesn't care.
pub struct NoopMetrics;

impl Metrics for NoopMetrics {}

/// The default in-process collector: plain atomic counters behind a
/// registry, exposing a minimal Prometheus encoder.
#[derive(Default)]
pub struct RegistryMetrics {
    connection_errors: AtomicU64,
    auth_successes: Mutex<HashMap<String, u64>>,
    auth_bad_passwords: Mutex<HashMap<String, u64>>,
    server_errors: Mutex<HashMap<String, u64>>,
    pool_full_count: AtomicU64,
    query_count: AtomicU64,
}

impl RegistryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn bump(map: &Mutex<HashMap<String, u64>>, key: &str) {
        let mut map = map.lock().unwrap();
        *map.entry(key.to_owned()).or_insert(0) += 1;
    }

    pub fn connection_errors(&self) -> u64 {
        self.connection_errors.load(Ordering::Relaxed)
    }

    pub fn pool_full_count(&self) -> u64 {
        self.pool_full_count.load(Ordering::Relaxed)
    }

    pub fn auth_bad_password_count(&self, username: &str) -> u64 {
        *self
            .auth_bad_passwords
            .lock()
            .unwrap()
            .get(username)
            .unwrap_or(&0)
    }

    /// A minimal stand-in for the Prometheus text exposition format:
    /// gauge/counter lines only, no `HELP`/`TYPE` comments or histograms.
    pub fn encode_prometheus_text(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "pgrelay_connection_error_total {}\n",
            self.connection_errors()
        ));
        out.push_str(&format!(
            "pgrelay_pool_full_total {}\n",
            self.pool_full_count()
        ));
        for (server, count) in self.server_errors.lock().unwrap().iter() {
            out.push_str(&format!(
                "pgrelay_prometheus_server_error{{server=\"{server}\"}} {count}\n"
            ));
        }
        out
    }
}

impl Metrics for RegistryMetrics {
    fn connection_error(&self) {
        self.connection_errors.fetch_add(1, Ordering::Relaxed);
    }

    fn auth_user_success(&self, username: &str) {
        Self::bump(&self.auth_successes, username);
    }

    fn auth_user_bad_password(&self, username: &str) {
        Self::bump(&self.auth_bad_passwords, username);
    }

    fn server_error(&self, server: &str) {
        Self::bump(&self.server_errors, server);
    }

    fn pool_full(&self) {
        self.pool_full_count.fetch_add(1, Ordering::Relaxed);
    }

    fn query_count(&self) {
        self.query_count.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_bad_password_per_user() {
        let metrics = RegistryMetrics::new();
        metrics.auth_user_bad_password("alice");
        metrics.auth_user_bad_password("alice");
        metrics.auth_user_bad_password("bob");
        assert_eq!(metrics.auth_bad_password_count("alice"), 2);
        assert_eq!(metrics.auth_bad_password_count("bob"), 1);
    }
}
