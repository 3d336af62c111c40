//! The connection slot and its lifecycle state machine.
//!
//! Grounded in `sqlx_core::pool::inner`/`sqlx_core::pool::idle` for the
//! "fixed collection of connections behind atomics, CAS to claim" shape,
//! generalized from sqlx's single `Idle`/`Live` split into a ten-state
//! machine covering the age/validation/drain states a plain client-side
//! pool never needs.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::auth::{CachedChallenge, CapturedFrame, SecurityKind};
use crate::net::MaybeTlsStream;
use crate::protocol::codec::PgCodec;

/// A connection slot's lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SlotState {
    NotInit = 0,
    Init = 1,
    Free = 2,
    InUse = 3,
    Gracefully = 4,
    Flush = 5,
    IdleCheck = 6,
    MaxConnectionAge = 7,
    Validation = 8,
    Remove = 9,
}

impl SlotState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => SlotState::NotInit,
            1 => SlotState::Init,
            2 => SlotState::Free,
            3 => SlotState::InUse,
            4 => SlotState::Gracefully,
            5 => SlotState::Flush,
            6 => SlotState::IdleCheck,
            7 => SlotState::MaxConnectionAge,
            8 => SlotState::Validation,
            _ => SlotState::Remove,
        }
    }
}

/// Guards the legal-transition set with a single `compare_exchange`, so two
/// tasks racing the same slot have exactly one winner.
#[derive(Debug)]
pub struct AtomicSlotState(AtomicU8);

impl AtomicSlotState {
    pub fn new(state: SlotState) -> Self {
        AtomicSlotState(AtomicU8::new(state as u8))
    }

    pub fn load(&self) -> SlotState {
        SlotState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn compare_exchange(&self, current: SlotState, new: SlotState) -> bool {
        self.0
            .compare_exchange(
                current as u8,
                new as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub fn store(&self, state: SlotState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// The mutable, non-atomic identity of a slot's current occupant, guarded
/// by a plain `Mutex` since it only changes at state-transition boundaries
/// (never concurrently with another task touching the same slot — the CAS
/// on `state` is the real exclusion mechanism).
pub struct SlotOccupant {
    pub server: usize,
    pub stream: Option<MaybeTlsStream>,
    pub has_security: SecurityKind,
    pub security_messages: Vec<CapturedFrame>,
    pub cached_challenge: Option<CachedChallenge>,
    pub backend_pid: i32,
    pub backend_secret: i32,
    pub username: String,
    pub database: String,
    pub appname: String,
}

impl Default for SlotOccupant {
    fn default() -> Self {
        SlotOccupant {
            server: 0,
            stream: None,
            has_security: SecurityKind::Invalid,
            security_messages: Vec::new(),
            cached_challenge: None,
            backend_pid: 0,
            backend_secret: 0,
            username: String::new(),
            database: String::new(),
            appname: String::new(),
        }
    }
}

/// One entry in the pool's fixed-length array — a plain `Vec<Slot>` behind
/// an `Arc`, since pgrelay has one process and many tasks rather than many
/// processes sharing a `MAP_SHARED` region.
pub struct Slot {
    pub index: usize,
    pub state: AtomicSlotState,
    pub occupant: Mutex<SlotOccupant>,
    created_at: AtomicI64,
    last_used_at: AtomicI64,
    pub query_count: AtomicU64,
    /// Set once during `Init` and read-only thereafter until `Remove` —
    /// tracked separately from `occupant`'s mutex so replay paths can check
    /// it without taking the lock.
    pub security_installed: AtomicBool,
}

fn now_millis() -> i64 {
    // `std::time::SystemTime` rather than `Instant` so the value is
    // meaningful across process restarts for metrics export; monotonic
    // ordering within a run only ever compares two slots' own timestamps.
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

impl Slot {
    pub fn new(index: usize) -> Self {
        Slot {
            index,
            state: AtomicSlotState::new(SlotState::NotInit),
            occupant: Mutex::new(SlotOccupant::default()),
            created_at: AtomicI64::new(0),
            last_used_at: AtomicI64::new(0),
            query_count: AtomicU64::new(0),
            security_installed: AtomicBool::new(false),
        }
    }

    pub fn mark_created_now(&self) {
        let now = now_millis();
        self.created_at.store(now, Ordering::Release);
        self.last_used_at.store(now, Ordering::Release);
    }

    pub fn mark_used_now(&self) {
        self.last_used_at.store(now_millis(), Ordering::Release);
        self.query_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn age(&self) -> Duration {
        let created = self.created_at.load(Ordering::Acquire);
        Duration::from_millis((now_millis() - created).max(0) as u64)
    }

    pub fn idle_for(&self) -> Duration {
        let last = self.last_used_at.load(Ordering::Acquire);
        Duration::from_millis((now_millis() - last).max(0) as u64)
    }

    /// Installs the auth result on the first `NotInit -> Init` transition;
    /// panics (a programmer error, not a runtime one) if called on a slot
    /// whose security is already installed — a slot's security info is
    /// never rewritten once set.
    pub fn install_security(
        &self,
        security: SecurityKind,
        messages: Vec<CapturedFrame>,
        cached_challenge: Option<CachedChallenge>,
    ) {
        assert!(
            !self.security_installed.swap(true, Ordering::AcqRel),
            "security_messages installed twice for slot {}",
            self.index
        );
        let mut occupant = self.occupant.lock().unwrap();
        occupant.has_security = security;
        occupant.security_messages = messages;
        occupant.cached_challenge = cached_challenge;
    }

    /// Resets a slot back to its pristine state on `Remove -> NotInit`.
    pub fn reset(&self) {
        let mut occupant = self.occupant.lock().unwrap();
        *occupant = SlotOccupant::default();
        self.security_installed.store(false, Ordering::Release);
        self.query_count.store(0, Ordering::Release);
    }
}

/// A live, framed connection to a slot's backend, handed to whichever
/// pipeline currently owns the slot.
pub struct SlotConnection {
    pub codec: PgCodec,
}

impl SlotConnection {
    pub fn new(stream: MaybeTlsStream) -> Self {
        SlotConnection {
            codec: PgCodec::new(stream),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legal_transition_cas_succeeds_once() {
        let slot = Slot::new(0);
        assert!(slot.state.compare_exchange(SlotState::NotInit, SlotState::Init));
        assert!(!slot.state.compare_exchange(SlotState::NotInit, SlotState::Init));
        assert_eq!(slot.state.load(), SlotState::Init);
    }

    #[test]
    #[should_panic(expected = "installed twice")]
    fn installing_security_twice_panics() {
        let slot = Slot::new(0);
        slot.install_security(SecurityKind::Trust, Vec::new(), None);
        slot.install_security(SecurityKind::Trust, Vec::new(), None);
    }

    #[test]
    fn reset_clears_security_installed_flag() {
        let slot = Slot::new(0);
        slot.install_security(SecurityKind::Trust, Vec::new(), None);
        slot.reset();
        assert!(!slot.security_installed.load(Ordering::Acquire));
        slot.install_security(SecurityKind::Trust, Vec::new(), None);
    }
}
