//! Tracked connection registry.
//!
//! In-memory record of every connection the local pipeline believes is
//! alive. Each entry owns a lifecycle token (a child of the element's
//! shutdown token) and a generation number. Removing or superseding an
//! entry cancels its token, which aborts any heal running against it; a
//! heal only commits when the generation it started from is still current.
//!
//! The map is behind a `std::sync::Mutex`. The lock is never held across an
//! `.await`.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio_util::sync::CancellationToken;
use tracing::debug;

use meshgrid_core::{Connection, ConnectionId, NetworkServiceRequest};

/// One connection the local pipeline holds open.
#[derive(Debug, Clone)]
pub struct TrackedEntry {
    pub id: ConnectionId,
    /// Most recently accepted request; replayed verbatim on heal.
    pub last_request: NetworkServiceRequest,
    pub last_known_connection: Connection,
    pub heal_in_flight: bool,
    generation: u64,
    lifecycle: CancellationToken,
}

impl TrackedEntry {
    /// Generation this entry was created with. Bumped on every put or
    /// supersede.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Everything a heal task needs, captured when it wins the begin race.
#[derive(Debug, Clone)]
pub struct HealTicket {
    pub id: ConnectionId,
    pub request: NetworkServiceRequest,
    pub generation: u64,
    /// Cancelled when the entry is closed, superseded, or the element stops.
    pub lifecycle: CancellationToken,
}

/// Concurrent map of tracked connections.
pub struct TrackedRegistry {
    entries: Mutex<HashMap<ConnectionId, TrackedEntry>>,
    next_generation: AtomicU64,
    /// Parent of every entry's lifecycle token.
    root: CancellationToken,
}

impl TrackedRegistry {
    /// Create a registry whose entry tokens are children of `root`.
    pub fn new(root: CancellationToken) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
            root,
        }
    }

    /// Insert or overwrite the entry for `id`, clearing `heal_in_flight`.
    ///
    /// An overwritten entry's lifecycle token is cancelled.
    pub fn put(&self, id: &str, request: NetworkServiceRequest, connection: Connection) {
        let entry = TrackedEntry {
            id: id.to_string(),
            last_request: request,
            last_known_connection: connection,
            heal_in_flight: false,
            generation: self.bump_generation(),
            lifecycle: self.root.child_token(),
        };

        if let Some(old) = self.lock().insert(id.to_string(), entry) {
            old.lifecycle.cancel();
        }
    }

    /// Look up an entry.
    pub fn get(&self, id: &str) -> Option<TrackedEntry> {
        self.lock().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    /// Delete an entry and cancel its lifecycle token.
    pub fn remove(&self, id: &str) -> Option<TrackedEntry> {
        let removed = self.lock().remove(id);
        if let Some(ref entry) = removed {
            entry.lifecycle.cancel();
        }
        removed
    }

    /// Point-in-time set of tracked ids.
    pub fn snapshot_ids(&self) -> HashSet<ConnectionId> {
        self.lock().keys().cloned().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Atomically mark a heal as in flight. Returns `true` only for the
    /// single caller that flipped the flag.
    pub fn try_begin_heal(&self, id: &str) -> bool {
        self.begin_heal(id).is_some()
    }

    /// Like [`try_begin_heal`](Self::try_begin_heal), but hands the winner
    /// the request to replay and the entry's lifecycle.
    ///
    /// Returns `None` when the entry is missing or a heal is already in
    /// flight.
    pub fn begin_heal(&self, id: &str) -> Option<HealTicket> {
        let mut entries = self.lock();
        let entry = entries.get_mut(id)?;
        if entry.heal_in_flight {
            return None;
        }
        entry.heal_in_flight = true;

        Some(HealTicket {
            id: entry.id.clone(),
            request: entry.last_request.clone(),
            generation: entry.generation,
            lifecycle: entry.lifecycle.clone(),
        })
    }

    /// Record the result of a successful heal.
    ///
    /// Commits only if the entry still exists with the generation the heal
    /// started from; a closed or superseded entry is never resurrected.
    pub fn complete_heal(&self, id: &str, generation: u64, connection: Connection) -> bool {
        let mut entries = self.lock();
        match entries.get_mut(id) {
            Some(entry) if entry.generation == generation => {
                entry.last_known_connection = connection;
                entry.heal_in_flight = false;
                true
            }
            _ => {
                debug!(conn_id = %id, generation, "heal result discarded, entry closed or superseded");
                false
            }
        }
    }

    /// Clear `heal_in_flight` after a failed heal so a later trigger can
    /// retry. No-op if the entry has since been replaced.
    pub fn end_heal(&self, id: &str, generation: u64) {
        if let Some(entry) = self.lock().get_mut(id) {
            if entry.generation == generation {
                entry.heal_in_flight = false;
            }
        }
    }

    /// Supersede any heal in flight for `id` ahead of an explicit request.
    ///
    /// Cancels the entry's lifecycle token, issues a fresh one under a new
    /// generation, and clears `heal_in_flight`. Returns whether a heal was
    /// in flight, i.e. whether one was aborted.
    pub fn supersede(&self, id: &str) -> bool {
        let generation = self.bump_generation();
        let mut entries = self.lock();
        match entries.get_mut(id) {
            Some(entry) => {
                entry.lifecycle.cancel();
                entry.lifecycle = self.root.child_token();
                entry.generation = generation;
                std::mem::replace(&mut entry.heal_in_flight, false)
            }
            None => false,
        }
    }

    fn bump_generation(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::Relaxed)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ConnectionId, TrackedEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
