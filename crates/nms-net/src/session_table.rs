// crates/nms-net/src/session_table.rs

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tracing::debug;

struct Entry<V> {
    value: V,
    last_seen: Instant,
    ttl: Duration,
}

impl<V> Entry<V> {
    fn expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_seen) > self.ttl
    }
}

/// Per-peer state keyed by qualified remote identity (`address:port`).
///
/// Entries idle longer than their TTL are dropped lazily on access and in
/// bulk by [`SessionTable::expire`]. The table never holds more than
/// `max_entries`; inserting a new peer at capacity evicts the least
/// recently seen one.
pub struct SessionTable<V> {
    default_ttl: Duration,
    max_entries: usize,
    entries: HashMap<SocketAddr, Entry<V>>,
}

impl<V> SessionTable<V> {
    #[must_use]
    pub fn new(default_ttl: Duration, max_entries: usize) -> Self {
        Self {
            default_ttl,
            max_entries: max_entries.max(1),
            entries: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Insert or replace the state for `peer`. Returns the replaced value.
    pub fn insert(&mut self, peer: SocketAddr, value: V, now: Instant) -> Option<V> {
        if !self.entries.contains_key(&peer) && self.entries.len() >= self.max_entries {
            self.expire(now);
            if self.entries.len() >= self.max_entries {
                self.evict_oldest();
            }
        }
        self.entries
            .insert(
                peer,
                Entry {
                    value,
                    last_seen: now,
                    ttl: self.default_ttl,
                },
            )
            .map(|e| e.value)
    }

    /// Live state for `peer`; refreshes its idle timer.
    pub fn get_mut(&mut self, peer: &SocketAddr, now: Instant) -> Option<&mut V> {
        if self.entries.get(peer).is_some_and(|e| e.expired(now)) {
            debug!(%peer, "session expired");
            self.entries.remove(peer);
            return None;
        }
        let entry = self.entries.get_mut(peer)?;
        entry.last_seen = now;
        Some(&mut entry.value)
    }

    /// Live state for `peer` without touching its idle timer.
    pub fn get(&self, peer: &SocketAddr, now: Instant) -> Option<&V> {
        self.entries
            .get(peer)
            .filter(|e| !e.expired(now))
            .map(|e| &e.value)
    }

    /// Override the idle TTL of one entry (e.g. once a handshake completes).
    pub fn set_ttl(&mut self, peer: &SocketAddr, ttl: Duration) -> bool {
        match self.entries.get_mut(peer) {
            Some(e) => {
                e.ttl = ttl;
                true
            }
            None => false,
        }
    }

    pub fn evict(&mut self, peer: &SocketAddr) -> Option<V> {
        self.entries.remove(peer).map(|e| e.value)
    }

    /// Drop every expired entry, returning how many went.
    pub fn expire(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| !e.expired(now));
        before - self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn peers(&self) -> impl Iterator<Item = &SocketAddr> {
        self.entries.keys()
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|(_, e)| e.last_seen)
            .map(|(k, _)| *k);
        if let Some(peer) = oldest {
            debug!(%peer, "session table full, evicting oldest");
            self.entries.remove(&peer);
        }
    }
}
