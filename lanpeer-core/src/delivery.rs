//! Delivery tracker: acknowledgment, retransmission and give-up for every ack-expecting send.
//!
//! Each tracked send moves `Sent -> Acked` or `Sent -> Retrying* -> Failed`. The
//! tracker never touches the network; [`DeliveryTracker::tick`] returns the
//! datagrams to resend and the host sends them.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::protocol::{FrameKind, MessageId};

/// Retransmissions allowed before a send is reported as failed.
pub const MAX_ATTEMPTS: u32 = 5;

/// Minimum age of the last transmission before a retransmit.
pub const DEFAULT_RETRANSMIT_AFTER: Duration = Duration::from_secs(1);

/// Correlates a send with its ACK: message id, chunk sequence and destination peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeliveryKey {
    pub id: MessageId,
    pub seq: Option<u32>,
    pub peer: String,
}

impl DeliveryKey {
    pub fn message(id: MessageId, peer: &str) -> Self {
        Self {
            id,
            seq: None,
            peer: peer.to_string(),
        }
    }

    pub fn chunk(id: MessageId, seq: u32, peer: &str) -> Self {
        Self {
            id,
            seq: Some(seq),
            peer: peer.to_string(),
        }
    }
}

/// Final state of a tracked send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Acked,
    /// The receiver answered with a NACK.
    Rejected(String),
    /// Attempts exhausted, or the send was cancelled.
    Failed,
}

/// Something the host must act on after a tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryEvent {
    /// Resend `bytes` unchanged to `key.peer`.
    Retransmit {
        key: DeliveryKey,
        kind: FrameKind,
        bytes: Vec<u8>,
        attempt: u32,
    },
    /// Gave up on `key` after the maximum number of attempts.
    Failed { key: DeliveryKey, kind: FrameKind },
}

struct PendingDelivery {
    kind: FrameKind,
    bytes: Vec<u8>,
    last_sent: Instant,
    attempts: u32,
    waiter: Option<oneshot::Sender<DeliveryOutcome>>,
}

impl PendingDelivery {
    fn resolve(&mut self, outcome: DeliveryOutcome) {
        if let Some(tx) = self.waiter.take() {
            // Nobody waiting on plain TALK sends; a closed receiver is fine.
            let _ = tx.send(outcome);
        }
    }
}

/// Resolves once the tracked send is acked, rejected or given up.
pub struct AckWaiter {
    rx: oneshot::Receiver<DeliveryOutcome>,
}

impl AckWaiter {
    pub async fn wait(self) -> DeliveryOutcome {
        self.rx.await.unwrap_or(DeliveryOutcome::Failed)
    }

    /// Wait at most `limit`. `None` means the send is still unresolved.
    pub async fn wait_timeout(self, limit: Duration) -> Option<DeliveryOutcome> {
        tokio::time::timeout(limit, self.wait()).await.ok()
    }
}

/// Pending deliveries keyed by [`DeliveryKey`]. Each key is mutated under its
/// shard lock, so an ACK racing a retransmit decision cannot be lost.
pub struct DeliveryTracker {
    pending: DashMap<DeliveryKey, PendingDelivery>,
    retransmit_after: Duration,
    max_attempts: u32,
}

impl DeliveryTracker {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_RETRANSMIT_AFTER, MAX_ATTEMPTS)
    }

    pub fn with_limits(retransmit_after: Duration, max_attempts: u32) -> Self {
        Self {
            pending: DashMap::new(),
            retransmit_after,
            max_attempts,
        }
    }

    /// Start tracking a send. The caller transmits `bytes` right after registering.
    pub fn register(
        &self,
        key: DeliveryKey,
        kind: FrameKind,
        bytes: Vec<u8>,
        now: Instant,
    ) -> AckWaiter {
        let (tx, rx) = oneshot::channel();
        let entry = PendingDelivery {
            kind,
            bytes,
            last_sent: now,
            attempts: 0,
            waiter: Some(tx),
        };
        if let Some(mut old) = self.pending.insert(key, entry) {
            old.resolve(DeliveryOutcome::Failed);
        }
        AckWaiter { rx }
    }

    /// Complete the send acknowledged by `from`. Returns the kind of the acked
    /// frame, or `None` for an unknown or late ACK.
    pub fn on_ack(&self, id: MessageId, seq: Option<u32>, from: &str) -> Option<FrameKind> {
        let key = DeliveryKey {
            id,
            seq,
            peer: from.to_string(),
        };
        match self.pending.remove(&key) {
            Some((_, mut entry)) => {
                entry.resolve(DeliveryOutcome::Acked);
                Some(entry.kind)
            }
            None => {
                debug!(id, ?seq, peer = from, "ack for nothing pending");
                None
            }
        }
    }

    /// A NACK carries no sequence, so it can only settle a non-chunk send.
    pub fn on_nack(&self, id: MessageId, from: &str, reason: &str) -> Option<FrameKind> {
        let (_, mut entry) = self.pending.remove(&DeliveryKey::message(id, from))?;
        entry.resolve(DeliveryOutcome::Rejected(reason.to_string()));
        Some(entry.kind)
    }

    /// Stop tracking `key` without waiting for an ACK.
    pub fn cancel(&self, key: &DeliveryKey) -> bool {
        match self.pending.remove(key) {
            Some((_, mut entry)) => {
                entry.resolve(DeliveryOutcome::Failed);
                true
            }
            None => false,
        }
    }

    /// Retransmit overdue sends and give up on exhausted ones.
    pub fn tick(&self, now: Instant) -> Vec<DeliveryEvent> {
        let mut events = Vec::new();
        self.pending.retain(|key, entry| {
            if entry.attempts >= self.max_attempts {
                warn!(
                    kind = %entry.kind,
                    id = key.id,
                    seq = ?key.seq,
                    peer = %key.peer,
                    attempts = entry.attempts,
                    "delivery failed"
                );
                entry.resolve(DeliveryOutcome::Failed);
                events.push(DeliveryEvent::Failed {
                    key: key.clone(),
                    kind: entry.kind,
                });
                return false;
            }
            if now.saturating_duration_since(entry.last_sent) >= self.retransmit_after {
                entry.attempts += 1;
                entry.last_sent = now;
                info!(
                    kind = %entry.kind,
                    id = key.id,
                    seq = ?key.seq,
                    peer = %key.peer,
                    attempt = entry.attempts,
                    "retransmitting"
                );
                events.push(DeliveryEvent::Retransmit {
                    key: key.clone(),
                    kind: entry.kind,
                    bytes: entry.bytes.clone(),
                    attempt: entry.attempts,
                });
            }
            true
        });
        events
    }

    pub fn contains(&self, key: &DeliveryKey) -> bool {
        self.pending.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl Default for DeliveryTracker {
    fn default() -> Self {
        Self::new()
    }
}
