//! lanpeer protocol implementation: LAN messaging and chunked file transfer over
//! an unreliable datagram transport.
//! Host-driven: no sockets; the host passes datagrams and ticks in and sends what comes out.

pub mod core;
pub mod dedup;
pub mod delivery;
pub mod integrity;
pub mod peers;
pub mod protocol;
pub mod transfer;
pub mod wire;

pub use crate::core::{CommandError, Datagram, MessageError, Node, NodeOptions, Outbox};
pub use dedup::{DedupKey, DedupWindow};
pub use delivery::{AckWaiter, DeliveryEvent, DeliveryKey, DeliveryOutcome, DeliveryTracker};
pub use peers::{PeerRecord, PeerRegistry, PeerSnapshot, PeerView};
pub use protocol::{Frame, FrameKind, MessageId, CHUNK_SIZE, DEFAULT_PORT};
pub use transfer::{EndStatus, FileReceiver, ReceiveError, TransferReport};
pub use wire::{decode_frame, encode_frame, FrameDecodeError};
