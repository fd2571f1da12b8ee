//! Chunked file transfer: the receiving state machine (FILE / CHUNK / END) and
//! the sending sequence driven by `sendfile`.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use dashmap::DashMap;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

use crate::core::{CommandError, Node};
use crate::dedup::DEFAULT_DEDUP_TTL;
use crate::delivery::{DeliveryKey, DeliveryOutcome};
use crate::integrity::{self, ContentHasher};
use crate::protocol::{Frame, MessageId, CHUNK_SIZE};

/// Why the receiver refused a FILE, CHUNK or END. The display text is the NACK reason.
#[derive(Debug, thiserror::Error)]
pub enum ReceiveError {
    #[error("invalid encoding")]
    InvalidEncoding,
    #[error("write failed")]
    Write(#[source] io::Error),
    #[error("file not found")]
    UnknownFile,
    #[error("file not found on disk")]
    MissingOnDisk,
    #[error("hash check failed")]
    Read(#[source] io::Error),
    #[error("hash mismatch / corrupted")]
    HashMismatch,
}

struct Declared {
    name: String,
    at: Instant,
}

/// Receiving side of every transfer: declared names and positional chunk writes
/// into the incoming directory. A declared name is kept for `ttl`, long enough
/// to answer a retransmitted END.
pub struct FileReceiver {
    dir: PathBuf,
    ttl: Duration,
    names: DashMap<(String, MessageId), Declared>,
}

impl FileReceiver {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self::with_ttl(dir, DEFAULT_DEDUP_TTL)
    }

    pub fn with_ttl(dir: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            dir: dir.into(),
            ttl,
            names: DashMap::new(),
        }
    }

    /// Drop declared names older than the ttl. Returns how many were dropped.
    pub fn purge_expired(&self, now: Instant) -> usize {
        let before = self.names.len();
        self.names
            .retain(|_, d| now.saturating_duration_since(d.at) <= self.ttl);
        before.saturating_sub(self.names.len())
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// FILE header: remember the name and start from an empty file.
    pub fn on_file(
        &self,
        sender: &str,
        id: MessageId,
        filename: &str,
        size: u64,
    ) -> Result<PathBuf, ReceiveError> {
        let name = local_name(filename).unwrap_or_else(|| temp_name(id));
        fs::create_dir_all(&self.dir).map_err(ReceiveError::Write)?;
        let path = self.dir.join(&name);
        File::create(&path).map_err(ReceiveError::Write)?;
        info!(peer = sender, id, file = %name, size, "incoming file");
        self.names.insert(
            (sender.to_string(), id),
            Declared {
                name,
                at: Instant::now(),
            },
        );
        Ok(path)
    }

    /// CHUNK: decode and write at `seq * CHUNK_SIZE`. Returns the decoded length.
    pub fn on_chunk(
        &self,
        sender: &str,
        id: MessageId,
        seq: u32,
        data: &str,
    ) -> Result<usize, ReceiveError> {
        let bytes = STANDARD
            .decode(data)
            .map_err(|_| ReceiveError::InvalidEncoding)?;
        fs::create_dir_all(&self.dir).map_err(ReceiveError::Write)?;
        let path = self.path_for(sender, id);
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(ReceiveError::Write)?;
        file.seek(SeekFrom::Start(u64::from(seq) * CHUNK_SIZE as u64))
            .map_err(ReceiveError::Write)?;
        file.write_all(&bytes).map_err(ReceiveError::Write)?;
        debug!(peer = sender, id, seq, len = bytes.len(), "chunk written");
        Ok(bytes.len())
    }

    /// END: verify the reassembled file against the declared hash; delete it on mismatch.
    pub fn on_end(
        &self,
        sender: &str,
        id: MessageId,
        declared_hash: &str,
    ) -> Result<PathBuf, ReceiveError> {
        let name = self
            .names
            .get(&(sender.to_string(), id))
            .map(|d| d.name.clone())
            .ok_or(ReceiveError::UnknownFile)?;
        let path = self.dir.join(name);
        if !path.is_file() {
            return Err(ReceiveError::MissingOnDisk);
        }
        let computed = integrity::hash_file(&path).map_err(ReceiveError::Read)?;
        if integrity::digest_matches(&computed, declared_hash) {
            info!(peer = sender, id, path = %path.display(), "file received and verified");
            Ok(path)
        } else {
            warn!(peer = sender, id, path = %path.display(), "hash mismatch, deleting file");
            if let Err(e) = fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "could not delete corrupted file");
            }
            Err(ReceiveError::HashMismatch)
        }
    }

    fn path_for(&self, sender: &str, id: MessageId) -> PathBuf {
        let name = self
            .names
            .get(&(sender.to_string(), id))
            .map(|d| d.name.clone())
            .unwrap_or_else(|| temp_name(id));
        self.dir.join(name)
    }
}

/// Last path component of a declared filename; never escapes the incoming directory.
fn local_name(declared: &str) -> Option<String> {
    Path::new(declared)
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty())
        .map(str::to_string)
}

fn temp_name(id: MessageId) -> String {
    format!("temp_{id}.part")
}

/// How the receiver answered the END frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndStatus {
    /// Receiver recomputed the hash and it matched.
    Verified,
    /// Receiver answered with a NACK.
    Rejected(String),
    /// No answer within the wait; the receiver's verdict is unknown.
    Unacknowledged,
}

/// Result of one `sendfile` invocation.
#[derive(Debug, Clone)]
pub struct TransferReport {
    pub file_id: MessageId,
    pub size: u64,
    pub chunks: u32,
    pub failed_chunks: Vec<u32>,
    pub hash: String,
    pub end: EndStatus,
}

/// Send `filename` from the outgoing directory to `peer`: header, paced chunks,
/// completion wait, END.
pub(crate) async fn send_file(
    node: &Node,
    peer: &str,
    filename: &str,
) -> Result<TransferReport, CommandError> {
    // The filename travels in a middle field of the FILE header.
    if filename.is_empty() || filename.contains(':') {
        return Err(CommandError::InvalidFilename(filename.to_string()));
    }
    let options = node.options();
    let path = options.outgoing_dir.join(filename);
    let mut file = match tokio::fs::File::open(&path).await {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(CommandError::FileNotFound(filename.to_string()))
        }
        Err(e) => return Err(CommandError::Io(e)),
    };
    let record = node
        .peers()
        .lookup(peer)
        .ok_or_else(|| CommandError::PeerNotFound(peer.to_string()))?;
    let size = file.metadata().await?.len();
    let file_id = node.next_message_id();
    let sender = node.name().to_string();

    let header_key = DeliveryKey::message(file_id, peer);
    let header = Frame::File {
        id: file_id,
        filename: filename.to_string(),
        size,
        sender: sender.clone(),
    };
    info!(id = file_id, file = filename, size, peer, "sending file header");
    let waiter = node.send_tracked(&record, header_key.clone(), &header);
    match waiter.wait_timeout(options.control_ack_timeout).await {
        Some(DeliveryOutcome::Acked) => {}
        _ => {
            node.tracker().cancel(&header_key);
            return Err(CommandError::HeaderNotAcknowledged { file_id });
        }
    }

    let mut hasher = ContentHasher::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut waiters = Vec::new();
    let mut seq: u32 = 0;
    loop {
        let n = read_block(&mut file, &mut buf).await?;
        if n == 0 {
            break;
        }
        let block = &buf[..n];
        hasher.update(block);
        if seq > 0 {
            tokio::time::sleep(options.chunk_pacing).await;
        }
        let chunk = Frame::Chunk {
            id: file_id,
            seq,
            data: STANDARD.encode(block),
            sender: sender.clone(),
        };
        debug!(id = file_id, seq, len = n, "sending chunk");
        waiters.push((
            seq,
            node.send_tracked(&record, DeliveryKey::chunk(file_id, seq, peer), &chunk),
        ));
        seq += 1;
    }
    let chunks = seq;

    let mut failed_chunks = Vec::new();
    for (seq, waiter) in waiters {
        if waiter.wait().await != DeliveryOutcome::Acked {
            failed_chunks.push(seq);
        }
    }
    if failed_chunks.is_empty() {
        info!(id = file_id, chunks, "all chunks acknowledged");
    } else {
        warn!(
            id = file_id,
            failed = ?failed_chunks,
            "some chunks were never acknowledged, finishing anyway"
        );
    }

    let hash = hasher.finish_hex();
    let end_frame = Frame::End {
        id: file_id,
        hash: hash.clone(),
        sender,
    };
    let waiter = node.send_tracked(&record, DeliveryKey::message(file_id, peer), &end_frame);
    let end = match waiter.wait_timeout(options.control_ack_timeout).await {
        Some(DeliveryOutcome::Acked) => {
            info!(id = file_id, peer, "transfer verified by receiver");
            EndStatus::Verified
        }
        Some(DeliveryOutcome::Rejected(reason)) => {
            warn!(id = file_id, peer, %reason, "receiver rejected the file");
            EndStatus::Rejected(reason)
        }
        Some(DeliveryOutcome::Failed) | None => {
            warn!(id = file_id, peer, "END not acknowledged, receiver state unknown");
            EndStatus::Unacknowledged
        }
    };

    Ok(TransferReport {
        file_id,
        size,
        chunks,
        failed_chunks,
        hash,
        end,
    })
}

/// Fill `buf` unless the file ends first; returns the number of bytes read.
async fn read_block(file: &mut tokio::fs::File, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::seq::SliceRandom;

    fn encode(block: &[u8]) -> String {
        STANDARD.encode(block)
    }

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 256) as u8).collect()
    }

    fn deliver(receiver: &FileReceiver, data: &[u8], order: &[usize]) {
        let blocks: Vec<&[u8]> = data.chunks(CHUNK_SIZE).collect();
        for &seq in order {
            receiver
                .on_chunk("alice", 1, seq as u32, &encode(blocks[seq]))
                .unwrap();
        }
    }

    #[test]
    fn reversed_chunks_reassemble_identically() {
        let dir = tempfile::tempdir().unwrap();
        let receiver = FileReceiver::new(dir.path());
        let data = sample(5 * CHUNK_SIZE + 17);
        receiver.on_file("alice", 1, "out.bin", data.len() as u64).unwrap();
        let order: Vec<usize> = (0..6).rev().collect();
        deliver(&receiver, &data, &order);
        assert_eq!(fs::read(dir.path().join("out.bin")).unwrap(), data);
        receiver
            .on_end("alice", 1, &integrity::hash_bytes(&data))
            .unwrap();
    }

    #[test]
    fn shuffled_chunks_reassemble_identically() {
        let dir = tempfile::tempdir().unwrap();
        let receiver = FileReceiver::new(dir.path());
        let data = sample(20 * CHUNK_SIZE + 300);
        receiver.on_file("alice", 1, "out.bin", data.len() as u64).unwrap();
        let mut order: Vec<usize> = (0..21).collect();
        order.shuffle(&mut rand::thread_rng());
        deliver(&receiver, &data, &order);
        assert_eq!(fs::read(dir.path().join("out.bin")).unwrap(), data);
    }

    #[test]
    fn chunk_before_header_uses_temp_name() {
        let dir = tempfile::tempdir().unwrap();
        let receiver = FileReceiver::new(dir.path());
        receiver.on_chunk("alice", 42, 0, &encode(b"abc")).unwrap();
        assert_eq!(fs::read(dir.path().join("temp_42.part")).unwrap(), b"abc");
    }

    #[test]
    fn invalid_base64_is_rejected_without_write() {
        let dir = tempfile::tempdir().unwrap();
        let receiver = FileReceiver::new(dir.path());
        receiver.on_file("alice", 1, "x.txt", 3).unwrap();
        let err = receiver.on_chunk("alice", 1, 0, "%%%not-base64").unwrap_err();
        assert!(matches!(err, ReceiveError::InvalidEncoding));
        assert_eq!(err.to_string(), "invalid encoding");
        assert!(fs::read(dir.path().join("x.txt")).unwrap().is_empty());
    }

    #[test]
    fn end_for_undeclared_file() {
        let dir = tempfile::tempdir().unwrap();
        let receiver = FileReceiver::new(dir.path());
        let err = receiver.on_end("alice", 9, "00").unwrap_err();
        assert_eq!(err.to_string(), "file not found");
    }

    #[test]
    fn end_when_file_vanished() {
        let dir = tempfile::tempdir().unwrap();
        let receiver = FileReceiver::new(dir.path());
        let path = receiver.on_file("alice", 1, "gone.txt", 0).unwrap();
        fs::remove_file(path).unwrap();
        let err = receiver.on_end("alice", 1, "00").unwrap_err();
        assert_eq!(err.to_string(), "file not found on disk");
    }

    #[test]
    fn hash_mismatch_deletes_file() {
        let dir = tempfile::tempdir().unwrap();
        let receiver = FileReceiver::new(dir.path());
        let data = sample(3000);
        receiver.on_file("alice", 1, "doc.bin", 3000).unwrap();
        deliver(&receiver, &data, &[0, 1, 2]);
        let mut other = data.clone();
        other[1500] ^= 0xff;
        let err = receiver
            .on_end("alice", 1, &integrity::hash_bytes(&other))
            .unwrap_err();
        assert!(matches!(err, ReceiveError::HashMismatch));
        assert_eq!(err.to_string(), "hash mismatch / corrupted");
        assert!(!dir.path().join("doc.bin").exists());
    }

    #[test]
    fn declared_path_cannot_escape_directory() {
        let dir = tempfile::tempdir().unwrap();
        let incoming = dir.path().join("in");
        let receiver = FileReceiver::new(&incoming);
        let path = receiver.on_file("alice", 1, "../../etc/passwd", 0).unwrap();
        assert_eq!(path, incoming.join("passwd"));
        let path = receiver.on_file("alice", 2, "..", 0).unwrap();
        assert_eq!(path, incoming.join("temp_2.part"));
    }

    #[test]
    fn same_id_from_different_senders_is_kept_apart() {
        let dir = tempfile::tempdir().unwrap();
        let receiver = FileReceiver::new(dir.path());
        receiver.on_file("alice", 1, "a.txt", 1).unwrap();
        receiver.on_file("bob", 1, "b.txt", 1).unwrap();
        receiver.on_chunk("alice", 1, 0, &encode(b"A")).unwrap();
        receiver.on_chunk("bob", 1, 0, &encode(b"B")).unwrap();
        assert_eq!(fs::read(dir.path().join("a.txt")).unwrap(), b"A");
        assert_eq!(fs::read(dir.path().join("b.txt")).unwrap(), b"B");
    }

    #[test]
    fn declared_names_expire_after_ttl() {
        let dir = tempfile::tempdir().unwrap();
        let receiver = FileReceiver::with_ttl(dir.path(), Duration::from_secs(60));
        receiver.on_file("alice", 1, "old.txt", 0).unwrap();
        assert_eq!(receiver.purge_expired(Instant::now()), 0);
        assert_eq!(receiver.len(), 1);

        let later = Instant::now() + Duration::from_secs(61);
        assert_eq!(receiver.purge_expired(later), 1);
        assert!(receiver.is_empty());
        let err = receiver.on_end("alice", 1, "00").unwrap_err();
        assert!(matches!(err, ReceiveError::UnknownFile));
    }
}
