//! WebSocket wire format (RFC 6455 section 5), server role.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |             (16/64)           |
//! |N|V|V|V|       |S|             |   (if payload len==126/127)   |
//! +-+-+-+-+-------+-+-------------+ - - - - - - - - - - - - - - - +
//! |     Extended payload length continued, if payload len == 127  |
//! + - - - - - - - - - - - - - - - +-------------------------------+
//! |                               |Masking-key, if MASK set to 1  |
//! +-------------------------------+-------------------------------+
//! | Masking-key (continued)       |          Payload Data         |
//! +-------------------------------- - - - - - - - - - - - - - - - +
//! ```
//!
//! Decoding is whole-frame: [`decode`] consumes nothing until a complete
//! frame is buffered, so a short read simply yields `Ok(None)`. Frames from
//! clients must be masked; frames we emit never are.

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Largest client payload accepted before the connection is dropped.
pub const MAX_PAYLOAD_BYTES: usize = 16 * 1024 * 1024;

/// Frame opcode (4 bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    /// Continuation of a fragmented message.
    Continuation = 0x0,
    /// UTF-8 text frame.
    Text = 0x1,
    /// Binary frame.
    Binary = 0x2,
    /// Close control frame.
    Close = 0x8,
    /// Ping control frame.
    Ping = 0x9,
    /// Pong control frame.
    Pong = 0xA,
}

impl Opcode {
    fn from_u4(value: u8) -> Result<Self, WsError> {
        match value {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            other => Err(WsError::InvalidOpcode(other)),
        }
    }

    /// True for Close, Ping, and Pong.
    #[must_use]
    pub const fn is_control(self) -> bool {
        matches!(self, Self::Close | Self::Ping | Self::Pong)
    }
}

/// WebSocket protocol errors that doom the offending connection.
#[derive(Debug, thiserror::Error)]
pub enum WsError {
    /// Opcode value is reserved or unknown.
    #[error("invalid opcode 0x{0:X}")]
    InvalidOpcode(u8),
    /// RSV bits set without a negotiated extension.
    #[error("reserved bits set without extension")]
    ReservedBits,
    /// Client frames must be masked.
    #[error("client frame is not masked")]
    UnmaskedClientFrame,
    /// Control frames may not be fragmented.
    #[error("fragmented control frame")]
    FragmentedControlFrame,
    /// Control frame payloads are capped at 125 bytes.
    #[error("control frame payload of {0} bytes exceeds 125")]
    ControlFrameTooLarge(usize),
    /// Payload exceeds [`MAX_PAYLOAD_BYTES`].
    #[error("payload of {size} bytes exceeds maximum {max}")]
    PayloadTooLarge {
        /// Declared payload length.
        size: u64,
        /// Configured maximum.
        max: usize,
    },
    /// Text message is not valid UTF-8.
    #[error("text message is not valid UTF-8")]
    InvalidUtf8,
    /// Continuation frame arrived with no fragmented message in progress.
    #[error("continuation frame without a message in progress")]
    UnexpectedContinuation,
    /// A new data frame arrived while a fragmented message was in progress.
    #[error("data frame interleaved with a fragmented message")]
    InterleavedDataFrame,
}

/// A single decoded (or to-be-encoded) frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// FIN bit: final fragment of the message.
    pub fin: bool,
    /// Frame opcode.
    pub opcode: Opcode,
    /// Unmasked payload.
    pub payload: Bytes,
}

impl Frame {
    /// A final text frame.
    #[must_use]
    pub fn text(payload: impl Into<Bytes>) -> Self {
        Self {
            fin: true,
            opcode: Opcode::Text,
            payload: payload.into(),
        }
    }

    /// A final binary frame.
    #[must_use]
    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self {
            fin: true,
            opcode: Opcode::Binary,
            payload: payload.into(),
        }
    }

    /// A pong answering the given ping payload.
    ///
    /// Ping payloads are validated to 125 bytes at decode, so the echo is
    /// always a legal control frame.
    #[must_use]
    pub fn pong(payload: Bytes) -> Self {
        Self {
            fin: true,
            opcode: Opcode::Pong,
            payload,
        }
    }

    /// A close frame with status code and reason (reason truncated to fit
    /// the 125-byte control limit).
    #[must_use]
    pub fn close(code: u16, reason: &str) -> Self {
        let reason = &reason.as_bytes()[..reason.len().min(123)];
        let mut payload = BytesMut::with_capacity(2 + reason.len());
        payload.put_u16(code);
        payload.put_slice(reason);
        Self {
            fin: true,
            opcode: Opcode::Close,
            payload: payload.freeze(),
        }
    }

    /// A close frame echoing the peer's close payload.
    #[must_use]
    pub fn close_echo(payload: Bytes) -> Self {
        Self {
            fin: true,
            opcode: Opcode::Close,
            payload,
        }
    }

    /// Appends this frame, unmasked, to `dst`.
    pub fn write_to(&self, dst: &mut BytesMut) {
        let first = u8::from(self.fin) << 7 | self.opcode as u8;
        dst.put_u8(first);
        match self.payload.len() {
            len @ 0..=125 => dst.put_u8(len as u8),
            len @ 126..=0xFFFF => {
                dst.put_u8(126);
                dst.put_u16(len as u16);
            }
            len => {
                dst.put_u8(127);
                dst.put_u64(len as u64);
            }
        }
        dst.put_slice(&self.payload);
    }
}

/// Decodes one client frame from `src`, consuming it only when complete.
///
/// Returns `Ok(None)` until the whole frame is buffered. The payload comes
/// back unmasked.
pub fn decode(src: &mut BytesMut) -> Result<Option<Frame>, WsError> {
    if src.len() < 2 {
        return Ok(None);
    }
    let first = src[0];
    let second = src[1];

    if first & 0x70 != 0 {
        return Err(WsError::ReservedBits);
    }
    let fin = first & 0x80 != 0;
    let opcode = Opcode::from_u4(first & 0x0F)?;
    if second & 0x80 == 0 {
        return Err(WsError::UnmaskedClientFrame);
    }
    let len7 = second & 0x7F;

    if opcode.is_control() {
        if !fin {
            return Err(WsError::FragmentedControlFrame);
        }
        if len7 > 125 {
            return Err(WsError::ControlFrameTooLarge(len7 as usize));
        }
    }

    let (payload_len, length_bytes) = match len7 {
        126 => {
            if src.len() < 4 {
                return Ok(None);
            }
            (u64::from(u16::from_be_bytes([src[2], src[3]])), 2)
        }
        127 => {
            if src.len() < 10 {
                return Ok(None);
            }
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&src[2..10]);
            (u64::from_be_bytes(raw), 8)
        }
        len => (u64::from(len), 0),
    };

    if payload_len > MAX_PAYLOAD_BYTES as u64 {
        return Err(WsError::PayloadTooLarge {
            size: payload_len,
            max: MAX_PAYLOAD_BYTES,
        });
    }
    let payload_len = payload_len as usize;

    let header_len = 2 + length_bytes + 4;
    if src.len() < header_len + payload_len {
        return Ok(None);
    }

    src.advance(2 + length_bytes);
    let mut key = [0u8; 4];
    key.copy_from_slice(&src.split_to(4));
    let mut payload = src.split_to(payload_len);
    apply_mask(&mut payload, key);

    Ok(Some(Frame {
        fin,
        opcode,
        payload: payload.freeze(),
    }))
}

fn apply_mask(buf: &mut [u8], key: [u8; 4]) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}
