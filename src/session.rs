use crate::compression;
use crate::error::Error;
use crate::frame::{frame_header, CloseStatus, OpCode};
use crate::outbound::OutboundQueue;
use std::sync::Arc;

/// Why the broker is tearing a session down. The transport owns the one
/// authoritative translation from these reasons to wire close statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    ClientClosed,
    AuthenticationTimeout,
    AuthenticationViolation,
    AuthenticationExpired,
    AuthorizationViolation,
    AccountMissing,
    Revocation,
    SlowConsumer,
    MaxConnectionsExceeded,
    MaxSubscriptionsExceeded,
    MaxPayloadExceeded,
    TlsHandshakeFailure,
    ParseError,
    ProtocolViolation,
    BadClientProtocolVersion,
    ServerShutdown,
    WriteError,
    ReadError,
    StaleConnection,
    InternalError,
}

impl DisconnectReason {
    pub fn close_status(&self) -> CloseStatus {
        match self {
            DisconnectReason::ClientClosed => CloseStatus::Normal,
            DisconnectReason::AuthenticationTimeout
            | DisconnectReason::AuthenticationViolation
            | DisconnectReason::AuthenticationExpired
            | DisconnectReason::AuthorizationViolation
            | DisconnectReason::AccountMissing
            | DisconnectReason::Revocation
            | DisconnectReason::SlowConsumer
            | DisconnectReason::MaxConnectionsExceeded
            | DisconnectReason::MaxSubscriptionsExceeded => CloseStatus::PolicyViolation,
            DisconnectReason::MaxPayloadExceeded => CloseStatus::MessageTooBig,
            DisconnectReason::TlsHandshakeFailure => CloseStatus::TlsHandshake,
            DisconnectReason::ParseError
            | DisconnectReason::ProtocolViolation
            | DisconnectReason::BadClientProtocolVersion => CloseStatus::ProtocolError,
            DisconnectReason::ServerShutdown => CloseStatus::GoingAway,
            DisconnectReason::WriteError
            | DisconnectReason::ReadError
            | DisconnectReason::StaleConnection => CloseStatus::AbnormalClosure,
            DisconnectReason::InternalError => CloseStatus::InternalError,
        }
    }

    /// Human-readable name, used as the body of the Close frame.
    pub fn name(&self) -> &'static str {
        match self {
            DisconnectReason::ClientClosed => "client closed",
            DisconnectReason::AuthenticationTimeout => "authentication timeout",
            DisconnectReason::AuthenticationViolation => "authentication violation",
            DisconnectReason::AuthenticationExpired => "authentication expired",
            DisconnectReason::AuthorizationViolation => "authorization violation",
            DisconnectReason::AccountMissing => "account missing",
            DisconnectReason::Revocation => "credentials revoked",
            DisconnectReason::SlowConsumer => "slow consumer",
            DisconnectReason::MaxConnectionsExceeded => "maximum connections exceeded",
            DisconnectReason::MaxSubscriptionsExceeded => "maximum subscriptions exceeded",
            DisconnectReason::MaxPayloadExceeded => "maximum payload exceeded",
            DisconnectReason::TlsHandshakeFailure => "tls handshake failure",
            DisconnectReason::ParseError => "parse error",
            DisconnectReason::ProtocolViolation => "protocol violation",
            DisconnectReason::BadClientProtocolVersion => "bad client protocol version",
            DisconnectReason::ServerShutdown => "server shutdown",
            DisconnectReason::WriteError => "write error",
            DisconnectReason::ReadError => "read error",
            DisconnectReason::StaleConnection => "stale connection",
            DisconnectReason::InternalError => "internal error",
        }
    }
}

/// Builds an outbound frame: the header and the payload that goes with it.
/// Control frames are never compressed regardless of what was requested;
/// data frames are routed through a pooled compressor when compression was
/// negotiated for the session.
pub fn create_frame_and_payload(
    opcode: OpCode,
    compress: bool,
    level: i32,
    payload: Vec<u8>,
) -> Result<(Vec<u8>, Vec<u8>), Error> {
    let compress = compress && !opcode.is_control();

    if compress {
        let mut compressor = compression::acquire_compressor(level);
        let result = compression::compress_frame_payload(&mut compressor, &payload);
        compression::release_compressor(level, compressor);
        let compressed = result?;
        let header = frame_header(true, opcode, compressed.len());
        Ok((header, compressed))
    } else {
        let header = frame_header(false, opcode, payload.len());
        Ok((header, payload))
    }
}

/// Broker-facing handle to one session's outbound path. Clones share the
/// same queue, so the broker can fan a handle out to whatever tasks need
/// to write to the client.
#[derive(Clone)]
pub struct SessionWriter {
    queue: Arc<OutboundQueue>,
    compression: bool,
    compression_level: i32,
}

impl SessionWriter {
    pub(crate) fn new(queue: Arc<OutboundQueue>, compression: bool, compression_level: i32) -> Self {
        Self {
            queue,
            compression,
            compression_level,
        }
    }

    /// Whether permessage-deflate was negotiated during the handshake.
    pub fn compression_enabled(&self) -> bool {
        self.compression
    }

    /// Enqueues one broker message as a single Binary frame, compressed
    /// when the session negotiated it.
    pub fn enqueue_message(&self, payload: Vec<u8>) -> Result<(), Error> {
        let (header, payload) = create_frame_and_payload(
            OpCode::Binary,
            self.compression,
            self.compression_level,
            payload,
        )?;
        self.queue.enqueue_frame(header, payload);
        Ok(())
    }

    /// Enqueues a Ping, used by the broker's stale-connection probing.
    pub fn enqueue_ping(&self, payload: Vec<u8>) {
        self.queue.enqueue_control(OpCode::Ping, payload);
    }

    pub fn enqueue_pong(&self, payload: Vec<u8>) {
        self.queue.enqueue_control(OpCode::Pong, payload);
    }

    /// Closes the session for the given broker-level reason, mapping it to
    /// the matching wire status with the reason's name as body. Only the
    /// first Close wins, later calls are no-ops.
    pub fn close(&self, reason: DisconnectReason) {
        self.queue
            .enqueue_close(reason.close_status().as_u16(), reason.name().as_bytes());
    }

    pub fn close_with_status(&self, status: u16, body: &[u8]) {
        self.queue.enqueue_close(status, body);
    }
}
