//! Host-driven node: the host feeds datagrams and timer ticks in, and sends the
//! datagrams that come back out. Commands (`talk`, `sendfile`) send through the
//! host's [`Outbox`].

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::dedup::{DedupKey, DedupWindow, DEFAULT_DEDUP_TTL};
use crate::delivery::{
    AckWaiter, DeliveryEvent, DeliveryKey, DeliveryTracker, DEFAULT_RETRANSMIT_AFTER,
    MAX_ATTEMPTS,
};
use crate::peers::{PeerRecord, PeerRegistry, PeerSnapshot, DEFAULT_PEER_TIMEOUT};
use crate::protocol::{Frame, MessageId};
use crate::transfer::{self, FileReceiver, ReceiveError, TransferReport};
use crate::wire::{self, FrameDecodeError};

/// Default wait for the ACK of a FILE or END frame.
pub const DEFAULT_CONTROL_ACK_TIMEOUT: Duration = Duration::from_millis(3500);

/// Default spacing between consecutive CHUNK sends.
pub const DEFAULT_CHUNK_PACING: Duration = Duration::from_millis(50);

/// Where the host sends datagrams. Implementations must not block.
pub trait Outbox: Send + Sync {
    fn send_to(&self, addr: SocketAddr, bytes: Vec<u8>) -> io::Result<()>;
}

/// A datagram the host should send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub to: SocketAddr,
    pub bytes: Vec<u8>,
}

/// Tunables for timing, limits and directories.
#[derive(Debug, Clone)]
pub struct NodeOptions {
    pub peer_timeout: Duration,
    pub dedup_ttl: Duration,
    pub retransmit_after: Duration,
    pub max_attempts: u32,
    pub control_ack_timeout: Duration,
    pub chunk_pacing: Duration,
    pub incoming_dir: PathBuf,
    pub outgoing_dir: PathBuf,
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self {
            peer_timeout: DEFAULT_PEER_TIMEOUT,
            dedup_ttl: DEFAULT_DEDUP_TTL,
            retransmit_after: DEFAULT_RETRANSMIT_AFTER,
            max_attempts: MAX_ATTEMPTS,
            control_ack_timeout: DEFAULT_CONTROL_ACK_TIMEOUT,
            chunk_pacing: DEFAULT_CHUNK_PACING,
            incoming_dir: PathBuf::from("received_files"),
            outgoing_dir: PathBuf::from("files"),
        }
    }
}

/// One peer process: its name, the shared stores and the outbox.
pub struct Node {
    name: String,
    options: NodeOptions,
    outbox: Arc<dyn Outbox>,
    next_id: AtomicU32,
    peers: PeerRegistry,
    dedup: DedupWindow,
    tracker: DeliveryTracker,
    receiver: FileReceiver,
}

impl Node {
    pub fn new(name: impl Into<String>, options: NodeOptions, outbox: Arc<dyn Outbox>) -> Self {
        Self {
            name: name.into(),
            peers: PeerRegistry::with_timeout(options.peer_timeout),
            dedup: DedupWindow::with_ttl(options.dedup_ttl),
            tracker: DeliveryTracker::with_limits(options.retransmit_after, options.max_attempts),
            receiver: FileReceiver::with_ttl(options.incoming_dir.clone(), options.dedup_ttl),
            next_id: AtomicU32::new(1),
            options,
            outbox,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &NodeOptions {
        &self.options
    }

    pub fn peers(&self) -> &PeerRegistry {
        &self.peers
    }

    pub fn tracker(&self) -> &DeliveryTracker {
        &self.tracker
    }

    /// Whether `name` is this process (for display only).
    pub fn is_local(&self, name: &str) -> bool {
        self.name == name
    }

    pub fn next_message_id(&self) -> MessageId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Bytes of the discovery broadcast.
    pub fn heartbeat(&self) -> Vec<u8> {
        wire::encode_frame(&Frame::Heartbeat {
            sender: self.name.clone(),
        })
    }

    /// Process one inbound datagram and return the replies to send.
    pub fn on_datagram(
        &self,
        from: SocketAddr,
        bytes: &[u8],
        now: Instant,
    ) -> Result<Vec<Datagram>, MessageError> {
        let frame = wire::decode_frame(bytes)?;
        self.peers.upsert(frame.sender(), from, now);

        let mut out = Vec::new();
        match frame {
            Frame::Heartbeat { .. } => {}
            Frame::Talk { id, sender, text } => {
                let key = DedupKey::Talk {
                    sender: sender.clone(),
                    id,
                };
                if self.dedup.check_and_record(key, now) {
                    info!(peer = %sender, id, "duplicate TALK dropped");
                } else {
                    info!(peer = %sender, %from, id, "TALK: {text}");
                }
                out.push(self.ack(from, id, None));
            }
            Frame::Ack { id, seq, sender } => match self.tracker.on_ack(id, seq, &sender) {
                Some(kind) => info!(peer = %sender, id, ?seq, "ACK for {kind}"),
                None => debug!(peer = %sender, id, ?seq, "unmatched ACK ignored"),
            },
            Frame::Nack { id, reason, sender } => {
                warn!(peer = %sender, id, %reason, "NACK received");
                self.tracker.on_nack(id, &sender, &reason);
            }
            Frame::File {
                id,
                filename,
                size,
                sender,
            } => {
                let key = DedupKey::File {
                    sender: sender.clone(),
                    id,
                };
                if self.dedup.check_and_record(key.clone(), now) {
                    info!(peer = %sender, id, "duplicate FILE dropped");
                    out.push(self.ack(from, id, None));
                } else {
                    let reply = self.receiver.on_file(&sender, id, &filename, size).map(|_| ());
                    out.push(self.reply(from, id, None, reply, key));
                }
            }
            Frame::Chunk {
                id,
                seq,
                data,
                sender,
            } => {
                let key = DedupKey::Chunk {
                    sender: sender.clone(),
                    id,
                    seq,
                };
                if self.dedup.check_and_record(key.clone(), now) {
                    info!(peer = %sender, id, seq, "duplicate CHUNK dropped");
                    out.push(self.ack(from, id, Some(seq)));
                } else {
                    let reply = self.receiver.on_chunk(&sender, id, seq, &data).map(|_| ());
                    out.push(self.reply(from, id, Some(seq), reply, key));
                }
            }
            Frame::End { id, hash, sender } => {
                let reply = match self.receiver.on_end(&sender, id, &hash) {
                    Ok(_) => self.ack(from, id, None),
                    Err(e) => self.nack(from, id, &e),
                };
                out.push(reply);
            }
        }
        Ok(out)
    }

    /// [`Node::on_datagram`] at the current time, replies sent through the outbox.
    /// Bad datagrams are logged and dropped.
    pub fn handle_datagram(&self, from: SocketAddr, bytes: &[u8]) {
        match self.on_datagram(from, bytes, Instant::now()) {
            Ok(replies) => self.dispatch(replies),
            Err(e) => warn!(%from, error = %e, "dropping datagram"),
        }
    }

    /// Evict silent peers and forget stale incoming file names.
    pub fn reap(&self, now: Instant) -> Vec<PeerRecord> {
        let stale = self.receiver.purge_expired(now);
        if stale > 0 {
            debug!(stale, "expired incoming file names");
        }
        self.peers.reap_expired(now)
    }

    /// Run the delivery tracker and resolve retransmissions to current peer addresses.
    pub fn retransmit_tick(&self, now: Instant) -> Vec<Datagram> {
        let mut out = Vec::new();
        for event in self.tracker.tick(now) {
            match event {
                DeliveryEvent::Retransmit { key, bytes, .. } => match self.peers.lookup(&key.peer) {
                    Some(peer) => out.push(Datagram {
                        to: peer.addr,
                        bytes,
                    }),
                    None => debug!(peer = %key.peer, id = key.id, "peer unknown, retransmit skipped"),
                },
                DeliveryEvent::Failed { .. } => {}
            }
        }
        out
    }

    /// Send datagrams through the outbox; failures are logged per datagram.
    pub fn dispatch(&self, datagrams: Vec<Datagram>) {
        for d in datagrams {
            if let Err(e) = self.outbox.send_to(d.to, d.bytes) {
                warn!(to = %d.to, error = %e, "send failed");
            }
        }
    }

    /// Peers with idle time, for the `devices` listing.
    pub fn devices(&self, now: Instant) -> PeerSnapshot {
        self.peers.snapshot(now)
    }

    /// Send a text message expecting an ACK. Returns the message id.
    pub fn talk(&self, peer: &str, text: &str) -> Result<MessageId, CommandError> {
        let record = self
            .peers
            .lookup(peer)
            .ok_or_else(|| CommandError::PeerNotFound(peer.to_string()))?;
        let id = self.next_message_id();
        let frame = Frame::Talk {
            id,
            sender: self.name.clone(),
            text: text.to_string(),
        };
        // Plain messages are fire-and-track; nobody awaits the outcome.
        drop(self.send_tracked(&record, DeliveryKey::message(id, peer), &frame));
        info!(id, peer, "TALK sent");
        Ok(id)
    }

    /// Transfer a file from the outgoing directory. Blocks the caller until the
    /// END frame is answered or its wait runs out.
    pub async fn send_file(
        &self,
        peer: &str,
        filename: &str,
    ) -> Result<TransferReport, CommandError> {
        transfer::send_file(self, peer, filename).await
    }

    /// Register an ack-expecting frame with the tracker, then send it once.
    pub(crate) fn send_tracked(
        &self,
        peer: &PeerRecord,
        key: DeliveryKey,
        frame: &Frame,
    ) -> AckWaiter {
        let bytes = wire::encode_frame(frame);
        let waiter = self
            .tracker
            .register(key, frame.kind(), bytes.clone(), Instant::now());
        if let Err(e) = self.outbox.send_to(peer.addr, bytes) {
            warn!(peer = %peer.name, kind = %frame.kind(), error = %e, "send failed, will retransmit");
        }
        waiter
    }

    fn ack(&self, to: SocketAddr, id: MessageId, seq: Option<u32>) -> Datagram {
        Datagram {
            to,
            bytes: wire::encode_frame(&Frame::Ack {
                id,
                seq,
                sender: self.name.clone(),
            }),
        }
    }

    fn nack(&self, to: SocketAddr, id: MessageId, err: &ReceiveError) -> Datagram {
        warn!(%to, id, error = %err, "sending NACK");
        Datagram {
            to,
            bytes: wire::encode_frame(&Frame::Nack {
                id,
                // The reason is a middle field and must not contain the separator.
                reason: err.to_string().replace(':', ";"),
                sender: self.name.clone(),
            }),
        }
    }

    /// ACK on success. On failure NACK and forget the dedup entry, so that a
    /// retransmission is processed again rather than treated as done.
    fn reply(
        &self,
        to: SocketAddr,
        id: MessageId,
        seq: Option<u32>,
        result: Result<(), ReceiveError>,
        key: DedupKey,
    ) -> Datagram {
        match result {
            Ok(()) => self.ack(to, id, seq),
            Err(e) => {
                self.dedup.forget(&key);
                self.nack(to, id, &e)
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("failed to decode frame: {0}")]
    Decode(#[from] FrameDecodeError),
}

/// Why a user command could not be carried out.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("peer not found: {0}")]
    PeerNotFound(String),
    #[error("file not found: {0}")]
    FileNotFound(String),
    #[error("invalid file name {0:?}: must be non-empty and must not contain ':'")]
    InvalidFilename(String),
    #[error("file header {file_id} was not acknowledged, transfer aborted")]
    HeaderNotAcknowledged { file_id: MessageId },
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}
