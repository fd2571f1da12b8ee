//! Framing: `TAG:field:...:last`, UTF-8, one frame per datagram.
//!
//! Decoding splits at most as many colons as the frame kind has fields, so the
//! last field keeps any colons it contains (TALK text, sender names).

use std::str::FromStr;

use crate::protocol::{Frame, FrameKind, NO_SEQUENCE};

/// Encode a frame into the bytes of a single datagram.
pub fn encode_frame(frame: &Frame) -> Vec<u8> {
    let tag = frame.kind().tag();
    let text = match frame {
        Frame::Heartbeat { sender } => format!("{tag}:{sender}"),
        Frame::Talk { id, sender, text } => format!("{tag}:{id}:{sender}:{text}"),
        Frame::Ack { id, seq, sender } => {
            let seq = seq.map_or(NO_SEQUENCE, i64::from);
            format!("{tag}:{id}:{seq}:{sender}")
        }
        Frame::Nack { id, reason, sender } => format!("{tag}:{id}:{reason}:{sender}"),
        Frame::File {
            id,
            filename,
            size,
            sender,
        } => format!("{tag}:{id}:{filename}:{size}:{sender}"),
        Frame::Chunk {
            id,
            seq,
            data,
            sender,
        } => format!("{tag}:{id}:{seq}:{data}:{sender}"),
        Frame::End { id, hash, sender } => format!("{tag}:{id}:{hash}:{sender}"),
    };
    text.into_bytes()
}

/// Decode one datagram into a frame.
pub fn decode_frame(bytes: &[u8]) -> Result<Frame, FrameDecodeError> {
    let text = std::str::from_utf8(bytes).map_err(|_| FrameDecodeError::NotUtf8)?;
    let (tag, rest) = text
        .split_once(':')
        .ok_or_else(|| FrameDecodeError::UnknownTag(text.chars().take(16).collect()))?;
    let kind = match tag {
        "HEARTBEAT" => FrameKind::Heartbeat,
        "TALK" => FrameKind::Talk,
        "ACK" => FrameKind::Ack,
        "NACK" => FrameKind::Nack,
        "FILE" => FrameKind::File,
        "CHUNK" => FrameKind::Chunk,
        "END" => FrameKind::End,
        other => return Err(FrameDecodeError::UnknownTag(other.to_string())),
    };
    let mut fields = Fields::new(kind, rest);
    let frame = match kind {
        FrameKind::Heartbeat => Frame::Heartbeat {
            sender: fields.last("sender")?,
        },
        FrameKind::Talk => Frame::Talk {
            id: fields.number("id")?,
            sender: fields.text("sender")?,
            text: fields.rest(),
        },
        FrameKind::Ack => {
            let id = fields.number("id")?;
            let seq: i64 = fields.number("seq")?;
            let seq = if seq == NO_SEQUENCE {
                None
            } else {
                Some(u32::try_from(seq).map_err(|_| FrameDecodeError::BadNumber {
                    kind,
                    field: "seq",
                })?)
            };
            Frame::Ack {
                id,
                seq,
                sender: fields.last("sender")?,
            }
        }
        FrameKind::Nack => Frame::Nack {
            id: fields.number("id")?,
            reason: fields.text("reason")?,
            sender: fields.last("sender")?,
        },
        FrameKind::File => Frame::File {
            id: fields.number("id")?,
            filename: fields.text("filename")?,
            size: fields.number("size")?,
            sender: fields.last("sender")?,
        },
        FrameKind::Chunk => Frame::Chunk {
            id: fields.number("id")?,
            seq: fields.number("seq")?,
            data: fields.text("data")?,
            sender: fields.last("sender")?,
        },
        FrameKind::End => Frame::End {
            id: fields.number("id")?,
            hash: fields.text("hash")?,
            sender: fields.last("sender")?,
        },
    };
    Ok(frame)
}

/// Cursor over the colon-separated fields after the tag.
struct Fields<'a> {
    kind: FrameKind,
    rest: Option<&'a str>,
}

impl<'a> Fields<'a> {
    fn new(kind: FrameKind, rest: &'a str) -> Self {
        Self {
            kind,
            rest: Some(rest),
        }
    }

    fn next(&mut self, field: &'static str) -> Result<&'a str, FrameDecodeError> {
        let rest = self.rest.ok_or(FrameDecodeError::MissingField {
            kind: self.kind,
            field,
        })?;
        match rest.split_once(':') {
            Some((head, tail)) => {
                self.rest = Some(tail);
                Ok(head)
            }
            None => Err(FrameDecodeError::MissingField {
                kind: self.kind,
                field,
            }),
        }
    }

    fn text(&mut self, field: &'static str) -> Result<String, FrameDecodeError> {
        self.next(field).map(str::to_string)
    }

    fn number<T: FromStr>(&mut self, field: &'static str) -> Result<T, FrameDecodeError> {
        let kind = self.kind;
        self.next(field)?
            .parse()
            .map_err(|_| FrameDecodeError::BadNumber { kind, field })
    }

    /// Final field that must be present and non-empty (sender names).
    fn last(&mut self, field: &'static str) -> Result<String, FrameDecodeError> {
        match self.rest.take() {
            Some(s) if !s.is_empty() => Ok(s.to_string()),
            _ => Err(FrameDecodeError::MissingField {
                kind: self.kind,
                field,
            }),
        }
    }

    /// Final free-text field, taken verbatim (may be empty).
    fn rest(&mut self) -> String {
        self.rest.take().unwrap_or_default().to_string()
    }
}

/// Error decoding a datagram into a frame.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameDecodeError {
    #[error("frame is not valid UTF-8")]
    NotUtf8,
    #[error("unknown frame tag {0:?}")]
    UnknownTag(String),
    #[error("{kind} frame is missing field `{field}`")]
    MissingField {
        kind: FrameKind,
        field: &'static str,
    },
    #[error("{kind} frame has non-numeric `{field}`")]
    BadNumber {
        kind: FrameKind,
        field: &'static str,
    },
}
