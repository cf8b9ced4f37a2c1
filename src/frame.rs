use crate::error::Error;

// Bits of the first header byte. RSV1 is reused by permessage-deflate to
// mark the first frame of a compressed message, RSV2 and RSV3 stay reserved.
pub const FIN_BIT: u8 = 0x80;
pub const RSV1_BIT: u8 = 0x40;
pub const RSV2_BIT: u8 = 0x20;
pub const RSV3_BIT: u8 = 0x10;
// First bit of the second header byte.
pub const MASK_BIT: u8 = 0x80;

/// Control frames (Ping, Pong, Close) are limited to this payload size.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    pub fn from(byte: u8) -> Result<Self, Error> {
        match byte {
            0x0 => Ok(OpCode::Continuation),
            0x1 => Ok(OpCode::Text),
            0x2 => Ok(OpCode::Binary),
            0x8 => Ok(OpCode::Close),
            0x9 => Ok(OpCode::Ping),
            0xA => Ok(OpCode::Pong),
            _ => Err(Error::UnknownOpcode(byte)),
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
        }
    }

    pub fn is_control(&self) -> bool {
        matches!(self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }
}

/// Close status codes as they appear on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseStatus {
    Normal,
    GoingAway,
    ProtocolError,
    /// Internal default when a received Close frame carries no body,
    /// per RFC 6455 this value is never sent inside a frame we build
    /// ourselves.
    NoStatusReceived,
    AbnormalClosure,
    InvalidPayload,
    PolicyViolation,
    MessageTooBig,
    InternalError,
    TlsHandshake,
}

impl CloseStatus {
    pub fn as_u16(&self) -> u16 {
        match self {
            CloseStatus::Normal => 1000,
            CloseStatus::GoingAway => 1001,
            CloseStatus::ProtocolError => 1002,
            CloseStatus::NoStatusReceived => 1005,
            CloseStatus::AbnormalClosure => 1006,
            CloseStatus::InvalidPayload => 1007,
            CloseStatus::PolicyViolation => 1008,
            CloseStatus::MessageTooBig => 1009,
            CloseStatus::InternalError => 1011,
            CloseStatus::TlsHandshake => 1015,
        }
    }
}

/// Builds the header for an outbound frame. The server side never masks, so
/// the header is 2, 4 or 10 bytes depending only on the payload length.
pub fn frame_header(compressed: bool, opcode: OpCode, payload_len: usize) -> Vec<u8> {
    // The first byte carries the final fragment bit, the reserved bits and
    // the opcode. Every frame we produce is a final fragment, fragmentation
    // on the write side is left to the broker's own chunking.
    let mut first_byte = FIN_BIT | opcode.as_u8();
    if compressed {
        first_byte |= RSV1_BIT;
    }

    // Lengths up to 125 fit in the second byte, larger ones spill into two
    // or eight additional big-endian bytes behind the 126/127 magic values.
    if payload_len <= 125 {
        vec![first_byte, payload_len as u8]
    } else if payload_len < 65536 {
        vec![first_byte, 126, (payload_len >> 8) as u8, payload_len as u8]
    } else {
        let bytes = (payload_len as u64).to_be_bytes();
        vec![
            first_byte, 127, bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6],
            bytes[7],
        ]
    }
}

/// Builds the payload of a Close frame: two big-endian status bytes followed
/// by the body. Bodies that would not fit in a control frame are cut and get
/// a trailing "..." so the receiver still sees the beginning of the reason.
pub fn create_close_message(status: u16, body: &[u8]) -> Vec<u8> {
    let mut truncated;
    let mut body = body;
    if body.len() > MAX_CONTROL_PAYLOAD {
        truncated = body[..MAX_CONTROL_PAYLOAD - 3].to_vec();
        truncated.extend_from_slice(b"...");
        body = &truncated;
    }

    let mut payload = Vec::with_capacity(2 + body.len());
    payload.extend_from_slice(&status.to_be_bytes());
    payload.extend_from_slice(body);
    payload
}
