//! Duplicate suppression for TALK, FILE and CHUNK frames within a fixed time window.

use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::protocol::MessageId;

/// How long a processed message identity is remembered.
pub const DEFAULT_DEDUP_TTL: Duration = Duration::from_secs(5 * 60);

/// Identity of a processed message. Ids are only unique per sending process,
/// so the sender name is part of the key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DedupKey {
    Talk { sender: String, id: MessageId },
    File { sender: String, id: MessageId },
    Chunk { sender: String, id: MessageId, seq: u32 },
}

pub struct DedupWindow {
    seen: DashMap<DedupKey, Instant>,
    ttl: Duration,
}

impl DedupWindow {
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_DEDUP_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            seen: DashMap::new(),
            ttl,
        }
    }

    /// Record `key` if it is new and return false; return true for a repeat inside the window.
    /// A repeat does not extend the window. Expired entries are purged first.
    pub fn check_and_record(&self, key: DedupKey, now: Instant) -> bool {
        self.purge(now);
        match self.seen.entry(key) {
            Entry::Occupied(_) => true,
            Entry::Vacant(e) => {
                e.insert(now);
                false
            }
        }
    }

    /// Drop `key` so its next occurrence counts as new.
    pub fn forget(&self, key: &DedupKey) {
        self.seen.remove(key);
    }

    fn purge(&self, now: Instant) {
        self.seen
            .retain(|_, first_seen| now.saturating_duration_since(*first_seen) <= self.ttl);
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

impl Default for DedupWindow {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn talk(id: MessageId) -> DedupKey {
        DedupKey::Talk {
            sender: "alice".into(),
            id,
        }
    }

    #[test]
    fn first_seen_then_duplicate() {
        let window = DedupWindow::new();
        let t0 = Instant::now();
        assert!(!window.check_and_record(talk(1), t0));
        assert!(window.check_and_record(talk(1), t0 + Duration::from_secs(1)));
        assert!(window.check_and_record(talk(1), t0 + Duration::from_secs(299)));
    }

    #[test]
    fn key_is_new_again_after_ttl() {
        let window = DedupWindow::new();
        let t0 = Instant::now();
        assert!(!window.check_and_record(talk(1), t0));
        assert!(!window.check_and_record(talk(1), t0 + Duration::from_secs(301)));
        assert!(window.check_and_record(talk(1), t0 + Duration::from_secs(302)));
    }

    #[test]
    fn repeat_does_not_refresh_timestamp() {
        let window = DedupWindow::with_ttl(Duration::from_secs(10));
        let t0 = Instant::now();
        assert!(!window.check_and_record(talk(1), t0));
        assert!(window.check_and_record(talk(1), t0 + Duration::from_secs(9)));
        assert!(!window.check_and_record(talk(1), t0 + Duration::from_secs(11)));
    }

    #[test]
    fn kinds_senders_and_sequences_are_distinct() {
        let window = DedupWindow::new();
        let t0 = Instant::now();
        assert!(!window.check_and_record(talk(1), t0));
        assert!(!window.check_and_record(
            DedupKey::File {
                sender: "alice".into(),
                id: 1
            },
            t0
        ));
        assert!(!window.check_and_record(
            DedupKey::Talk {
                sender: "bob".into(),
                id: 1
            },
            t0
        ));
        for seq in 0..3 {
            assert!(!window.check_and_record(
                DedupKey::Chunk {
                    sender: "alice".into(),
                    id: 1,
                    seq
                },
                t0
            ));
        }
        assert_eq!(window.len(), 6);
    }

    #[test]
    fn forgotten_key_is_new_again() {
        let window = DedupWindow::new();
        let t0 = Instant::now();
        assert!(!window.check_and_record(talk(1), t0));
        window.forget(&talk(1));
        assert!(!window.check_and_record(talk(1), t0));
    }

    #[test]
    fn expired_entries_are_purged() {
        let window = DedupWindow::with_ttl(Duration::from_secs(1));
        let t0 = Instant::now();
        for id in 0..10 {
            window.check_and_record(talk(id), t0);
        }
        window.check_and_record(talk(100), t0 + Duration::from_secs(5));
        assert_eq!(window.len(), 1);
    }
}
