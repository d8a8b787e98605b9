//! Self-describing frames exchanged between participants.
//!
//! Layout (little endian):
//!
//! ```text
//! +------------------------------------------------------------------+
//! | [u32 total_len][u8 kind][u8 ver][u16 flags]                      |
//! | [u32 sender][u32 channel][u32 serial][i32 arg]                   |
//! | [u64 object][u64 aux]                                            |
//! | [payload ...][pad → 4 bytes]                                     |
//! +------------------------------------------------------------------+
//! ```
//!
//! `total_len` covers header and payload but not the padding. Frames sit back
//! to back in a byte stream, so a reader that only has part of a frame keeps
//! buffering until the whole padded frame is available.

use thiserror::Error;

use crate::ids::ParticipantId;

/// Version byte written into every frame.
pub const WIRE_VERSION: u8 = 1;
/// Bytes occupied by the fixed header.
pub const HEADER_LEN: usize = 40;
/// Frames are padded to this alignment.
pub const FRAME_ALIGN: usize = 4;
/// Largest frame accepted by any backend.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Flag bits carried in the frame header.
pub mod flags {
    /// The sender does not wait for a reply.
    pub const ONEWAY: u16 = 1 << 0;
    /// The departing participant did not clean up after itself.
    pub const EMERGENCY: u16 = 1 << 1;
}

/// Discriminant of a frame.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// No-op wakeup.
    Send = 0,
    /// Membership request carrying an archived `EnterRequest`.
    Enter = 1,
    /// Master's answer to [`MessageKind::Enter`].
    EnterAck = 2,
    /// The sender left (or was found dead).
    Leave = 3,
    /// Call invocation; `object` is the call id, `arg` the argument.
    Call = 4,
    /// Call invocation with a payload.
    Call3 = 5,
    /// Result of a call; `serial` matches the request, `channel` holds the status.
    CallReturn = 6,
    /// Reactor publish; `object` is the reactor, `aux` the subscription.
    Reactor = 7,
}

impl MessageKind {
    /// Decodes the kind byte.
    pub fn from_u8(raw: u8) -> Option<Self> {
        Some(match raw {
            0 => MessageKind::Send,
            1 => MessageKind::Enter,
            2 => MessageKind::EnterAck,
            3 => MessageKind::Leave,
            4 => MessageKind::Call,
            5 => MessageKind::Call3,
            6 => MessageKind::CallReturn,
            7 => MessageKind::Reactor,
            _ => return None,
        })
    }
}

/// Decoding failures. A reader skips the offending frame where it can.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("frame truncated: have {have} bytes, need {need}")]
    Truncated { have: usize, need: usize },

    #[error("frame length {0} is out of range")]
    BadLength(usize),

    #[error("unknown message kind {0}")]
    UnknownKind(u8),

    #[error("unsupported wire version {0}")]
    Version(u8),

    #[error("payload rejected: {0}")]
    Payload(String),
}

/// One decoded frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageKind,
    pub flags: u16,
    pub sender: ParticipantId,
    pub channel: u32,
    pub serial: u32,
    pub arg: i32,
    pub object: u64,
    pub aux: u64,
    pub payload: Vec<u8>,
}

impl Message {
    /// Creates an empty message of `kind` attributed to `sender`.
    pub fn new(kind: MessageKind, sender: ParticipantId) -> Self {
        Self {
            kind,
            flags: 0,
            sender,
            channel: 0,
            serial: 0,
            arg: 0,
            object: 0,
            aux: 0,
            payload: Vec::new(),
        }
    }

    /// Harmless message used to kick a blocked receiver.
    pub fn wakeup(sender: ParticipantId) -> Self {
        Self::new(MessageKind::Send, sender)
    }

    pub fn with_flags(mut self, flags: u16) -> Self {
        self.flags |= flags;
        self
    }

    pub fn with_channel(mut self, channel: u32) -> Self {
        self.channel = channel;
        self
    }

    pub fn with_serial(mut self, serial: u32) -> Self {
        self.serial = serial;
        self
    }

    pub fn with_arg(mut self, arg: i32) -> Self {
        self.arg = arg;
        self
    }

    pub fn with_object(mut self, object: u64) -> Self {
        self.object = object;
        self
    }

    pub fn with_aux(mut self, aux: u64) -> Self {
        self.aux = aux;
        self
    }

    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }

    /// True when every bit of `flag` is set.
    pub fn has_flag(&self, flag: u16) -> bool {
        self.flags & flag == flag
    }

    /// Unpadded frame length.
    pub fn frame_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }

    /// Encodes into a fresh, padded buffer.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let mut out = Vec::with_capacity(align_up(self.frame_len(), FRAME_ALIGN));
        self.encode_into(&mut out)?;
        Ok(out)
    }

    /// Appends the padded frame to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) -> Result<(), WireError> {
        let total = self.frame_len();
        if total > MAX_FRAME_LEN {
            return Err(WireError::BadLength(total));
        }

        out.extend_from_slice(&(total as u32).to_le_bytes());
        out.push(self.kind as u8);
        out.push(WIRE_VERSION);
        out.extend_from_slice(&self.flags.to_le_bytes());
        out.extend_from_slice(&self.sender.raw().to_le_bytes());
        out.extend_from_slice(&self.channel.to_le_bytes());
        out.extend_from_slice(&self.serial.to_le_bytes());
        out.extend_from_slice(&self.arg.to_le_bytes());
        out.extend_from_slice(&self.object.to_le_bytes());
        out.extend_from_slice(&self.aux.to_le_bytes());
        out.extend_from_slice(&self.payload);

        let padded = align_up(total, FRAME_ALIGN);
        out.resize(out.len() + (padded - total), 0);
        Ok(())
    }

    /// Decodes exactly one frame from the start of `frame`.
    ///
    /// Trailing padding is ignored; datagram backends hand one frame per call.
    pub fn decode(frame: &[u8]) -> Result<Message, WireError> {
        if frame.len() < HEADER_LEN {
            return Err(WireError::Truncated {
                have: frame.len(),
                need: HEADER_LEN,
            });
        }

        let total = read_u32(frame, 0) as usize;
        if !(HEADER_LEN..=MAX_FRAME_LEN).contains(&total) {
            return Err(WireError::BadLength(total));
        }
        if frame.len() < total {
            return Err(WireError::Truncated {
                have: frame.len(),
                need: total,
            });
        }
        if frame[5] != WIRE_VERSION {
            return Err(WireError::Version(frame[5]));
        }
        let kind = MessageKind::from_u8(frame[4]).ok_or(WireError::UnknownKind(frame[4]))?;

        Ok(Message {
            kind,
            flags: u16::from_le_bytes([frame[6], frame[7]]),
            sender: ParticipantId(read_u32(frame, 8)),
            channel: read_u32(frame, 12),
            serial: read_u32(frame, 16),
            arg: read_u32(frame, 20) as i32,
            object: read_u64(frame, 24),
            aux: read_u64(frame, 32),
            payload: frame[HEADER_LEN..total].to_vec(),
        })
    }
}

/// Reassembles frames out of an arbitrary chunked byte stream.
#[derive(Debug, Default)]
pub struct FrameReader {
    buf: Vec<u8>,
    start: usize,
}

impl FrameReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends freshly read bytes.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes buffered but not yet returned as frames.
    pub fn buffered(&self) -> usize {
        self.buf.len() - self.start
    }

    /// Returns the next complete frame, `None` when more bytes are needed.
    ///
    /// A frame with an unknown kind is consumed and reported as an error so
    /// the caller can log it and keep going. A corrupt length cannot be
    /// resynchronised; the buffer is dropped.
    pub fn next_message(&mut self) -> Option<Result<Message, WireError>> {
        let avail = &self.buf[self.start..];
        if avail.len() < 4 {
            return None;
        }

        let total = read_u32(avail, 0) as usize;
        if !(HEADER_LEN..=MAX_FRAME_LEN).contains(&total) {
            self.buf.clear();
            self.start = 0;
            return Some(Err(WireError::BadLength(total)));
        }

        let advance = align_up(total, FRAME_ALIGN);
        if avail.len() < advance {
            return None;
        }

        let result = Message::decode(&avail[..total]);
        self.start += advance;
        if self.start == self.buf.len() {
            self.buf.clear();
            self.start = 0;
        } else if self.start >= MAX_FRAME_LEN {
            self.buf.drain(..self.start);
            self.start = 0;
        }
        Some(result)
    }
}

pub(crate) fn align_up(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (value + (align - 1)) & !(align - 1)
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&data[offset..offset + 4]);
    u32::from_le_bytes(raw)
}

fn read_u64(data: &[u8], offset: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&data[offset..offset + 8]);
    u64::from_le_bytes(raw)
}
