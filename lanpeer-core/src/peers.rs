//! Peer registry: known peers by self-declared name, with liveness timestamps.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info};

/// Default inactivity threshold after which a silent peer is evicted.
pub const DEFAULT_PEER_TIMEOUT: Duration = Duration::from_secs(10);

/// A known peer. The address is whatever datagram most recently claimed the name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub name: String,
    pub addr: SocketAddr,
    pub last_seen: Instant,
}

/// Peers keyed by name. Safe to share between the receive path and timers.
pub struct PeerRegistry {
    peers: DashMap<String, PeerRecord>,
    timeout: Duration,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_PEER_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            peers: DashMap::new(),
            timeout,
        }
    }

    /// Insert or refresh `name`. Returns true if the peer was not known.
    pub fn upsert(&self, name: &str, addr: SocketAddr, now: Instant) -> bool {
        match self.peers.entry(name.to_string()) {
            Entry::Occupied(mut e) => {
                let record = e.get_mut();
                record.last_seen = record.last_seen.max(now);
                if record.addr != addr {
                    debug!(peer = name, old = %record.addr, new = %addr, "peer address changed");
                    record.addr = addr;
                }
                false
            }
            Entry::Vacant(e) => {
                info!(peer = name, %addr, "peer discovered");
                e.insert(PeerRecord {
                    name: name.to_string(),
                    addr,
                    last_seen: now,
                });
                true
            }
        }
    }

    pub fn lookup(&self, name: &str) -> Option<PeerRecord> {
        self.peers.get(name).map(|r| r.clone())
    }

    /// Remove every peer silent for longer than the timeout. Returns the removed records.
    pub fn reap_expired(&self, now: Instant) -> Vec<PeerRecord> {
        let mut removed = Vec::new();
        self.peers.retain(|_, record| {
            let idle = now.saturating_duration_since(record.last_seen);
            if idle > self.timeout {
                removed.push(record.clone());
                false
            } else {
                true
            }
        });
        for record in &removed {
            info!(peer = %record.name, addr = %record.addr, "peer disconnected");
        }
        removed
    }

    /// Point-in-time view of all peers with their idle time at `now`.
    pub fn snapshot(&self, now: Instant) -> PeerSnapshot {
        let mut peers: Vec<PeerRecord> = self.peers.iter().map(|r| r.value().clone()).collect();
        peers.sort_by(|a, b| a.name.cmp(&b.name));
        PeerSnapshot { peers, now }
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Peers captured by [`PeerRegistry::snapshot`]; iterate as often as needed.
#[derive(Debug, Clone)]
pub struct PeerSnapshot {
    peers: Vec<PeerRecord>,
    now: Instant,
}

/// One row of a snapshot.
#[derive(Debug, Clone, Copy)]
pub struct PeerView<'a> {
    pub record: &'a PeerRecord,
    pub idle: Duration,
}

impl PeerSnapshot {
    pub fn iter(&self) -> impl Iterator<Item = PeerView<'_>> + '_ {
        self.peers.iter().map(move |record| PeerView {
            record,
            idle: self.now.saturating_duration_since(record.last_seen),
        })
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
