//! lanpeer wire protocol: frame kinds and protocol constants.

use std::fmt;

/// Default UDP port shared by every peer on the LAN.
pub const DEFAULT_PORT: u16 = 8080;

/// Size of one file chunk before encoding.
pub const CHUNK_SIZE: usize = 1024;

/// Sequence value carried by ACK frames that acknowledge a non-chunk message.
pub const NO_SEQUENCE: i64 = -1;

/// Message id assigned by the sending process, monotonically increasing from 1.
pub type MessageId = u32;

/// All wire frames. Encoding is colon-delimited UTF-8 text (see wire module).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Discovery broadcast: announces the sender's name.
    Heartbeat { sender: String },
    /// Text message; `text` may contain colons.
    Talk {
        id: MessageId,
        sender: String,
        text: String,
    },
    /// Acknowledges message `id`; `seq` is `None` for non-chunk messages.
    Ack {
        id: MessageId,
        seq: Option<u32>,
        sender: String,
    },
    /// Negative acknowledgment with a human-readable reason.
    Nack {
        id: MessageId,
        reason: String,
        sender: String,
    },
    /// File header, sent before any chunk of file `id`.
    File {
        id: MessageId,
        filename: String,
        size: u64,
        sender: String,
    },
    /// One base64-encoded block of file `id` at position `seq`.
    Chunk {
        id: MessageId,
        seq: u32,
        data: String,
        sender: String,
    },
    /// End of file `id`, carrying the hex SHA-256 of the whole content.
    End {
        id: MessageId,
        hash: String,
        sender: String,
    },
}

impl Frame {
    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::Heartbeat { .. } => FrameKind::Heartbeat,
            Frame::Talk { .. } => FrameKind::Talk,
            Frame::Ack { .. } => FrameKind::Ack,
            Frame::Nack { .. } => FrameKind::Nack,
            Frame::File { .. } => FrameKind::File,
            Frame::Chunk { .. } => FrameKind::Chunk,
            Frame::End { .. } => FrameKind::End,
        }
    }

    /// Name the frame's author declared for itself.
    pub fn sender(&self) -> &str {
        match self {
            Frame::Heartbeat { sender }
            | Frame::Talk { sender, .. }
            | Frame::Ack { sender, .. }
            | Frame::Nack { sender, .. }
            | Frame::File { sender, .. }
            | Frame::Chunk { sender, .. }
            | Frame::End { sender, .. } => sender,
        }
    }
}

/// Frame tag, without payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    Heartbeat,
    Talk,
    Ack,
    Nack,
    File,
    Chunk,
    End,
}

impl FrameKind {
    /// Tag as written at the start of a frame.
    pub fn tag(self) -> &'static str {
        match self {
            FrameKind::Heartbeat => "HEARTBEAT",
            FrameKind::Talk => "TALK",
            FrameKind::Ack => "ACK",
            FrameKind::Nack => "NACK",
            FrameKind::File => "FILE",
            FrameKind::Chunk => "CHUNK",
            FrameKind::End => "END",
        }
    }
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sender_of_every_variant() {
        let frames = [
            Frame::Heartbeat { sender: "a".into() },
            Frame::Ack {
                id: 1,
                seq: None,
                sender: "a".into(),
            },
            Frame::End {
                id: 1,
                hash: "00".into(),
                sender: "a".into(),
            },
        ];
        assert!(frames.iter().all(|f| f.sender() == "a"));
    }
}
