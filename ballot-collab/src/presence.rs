//! Presence registry: which identities are connected, across all rooms.
//!
//! An identity stays present while at least one socket is open and for the
//! grace window after its last socket closes. Only the grace timer removes it.
//!
//! ```text
//! connect ──► Live(n sockets) ──last socket closes──► Lingering
//!                ▲                                       │
//!                └────────────── connect ◄───────────────┤
//!                                                        │ grace expires
//!                                                        ▼
//!                                                     removed
//! ```

use std::collections::HashMap;

#[derive(Debug, Clone)]
struct PresenceEntry {
    /// Open sockets for this identity. Zero while lingering.
    sockets: usize,
    /// First-seen sequence, used to keep snapshots in arrival order.
    seq: u64,
}

/// Result of a socket closing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// Other sockets of the same identity remain open.
    StillConnected,
    /// That was the last socket; the grace window should start.
    LastSocket,
    /// The identity was not registered.
    Unknown,
}

/// Identity → liveness. Exclusively owns presence entries.
#[derive(Debug, Default)]
pub struct PresenceRegistry {
    entries: HashMap<String, PresenceEntry>,
    next_seq: u64,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one open socket. Returns `true` if the identity was absent.
    pub fn connect(&mut self, identity: &str) -> bool {
        if let Some(entry) = self.entries.get_mut(identity) {
            entry.sockets += 1;
            return false;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries
            .insert(identity.to_string(), PresenceEntry { sockets: 1, seq });
        true
    }

    /// Record a closed socket. The identity is not removed here.
    pub fn disconnect(&mut self, identity: &str) -> Release {
        match self.entries.get_mut(identity) {
            Some(entry) => {
                entry.sockets = entry.sockets.saturating_sub(1);
                if entry.sockets == 0 {
                    Release::LastSocket
                } else {
                    Release::StillConnected
                }
            }
            None => Release::Unknown,
        }
    }

    /// Finalize removal after the grace window.
    ///
    /// Refuses to remove an identity that still has open sockets.
    pub fn remove(&mut self, identity: &str) -> bool {
        match self.entries.get(identity) {
            Some(entry) if entry.sockets == 0 => {
                self.entries.remove(identity);
                true
            }
            _ => false,
        }
    }

    /// Present, including while lingering inside the grace window.
    pub fn is_connected(&self, identity: &str) -> bool {
        self.entries.contains_key(identity)
    }

    pub fn socket_count(&self, identity: &str) -> usize {
        self.entries.get(identity).map_or(0, |e| e.sockets)
    }

    /// Present identities in arrival order, for `users:update`.
    pub fn snapshot(&self) -> Vec<String> {
        let mut present: Vec<_> = self.entries.iter().collect();
        present.sort_by_key(|(_, entry)| entry.seq);
        present.into_iter().map(|(id, _)| id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
