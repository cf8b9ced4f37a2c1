use crate::handshake::HandshakeError;
use std::io;
use thiserror::Error;
use tokio::time::error::Elapsed;

#[derive(Error, Debug)]
pub enum Error {
    // General Errors
    #[error("{source}")]
    Timeout {
        #[from]
        source: Elapsed,
    },

    #[error("IO Error happened: {source}")]
    IOError {
        #[from]
        source: io::Error,
    },

    #[error("channel communication error")]
    CommunicationError,

    // Handshake Errors
    #[error("websocket handshake error: {source}")]
    Handshake {
        #[from]
        source: HandshakeError,
    },

    // Framing Errors
    #[error("mask bit missing")]
    MaskMissing,

    #[error("control frame length bigger than maximum allowed")]
    ControlFrameTooBig,

    #[error("control frame does not have the final flag set")]
    ControlFrameNotFinal,

    #[error("new message started before final frame for previous message was received")]
    MessageBeforeFinalFrame,

    #[error("invalid continuation frame")]
    InvalidContinuationFrame,

    #[error("unknown opcode {0}")]
    UnknownOpcode(u8),

    // Compression / Decompression Errors
    #[error("{source}")]
    CompressionError {
        #[from]
        source: flate2::CompressError,
    },

    #[error("{source}")]
    DecompressionError {
        #[from]
        source: flate2::DecompressError,
    },

    // Returned by the decoder once the peer's Close frame has been handled,
    // after every payload decoded before it was delivered to the caller.
    #[error("session closed")]
    SessionClosed,

    // Configuration Errors
    #[error("compression level `{0}` should be a value between -2 and 9")]
    InvalidCompressionLevel(i32),

    #[error("invalid websocket port `{0}`")]
    InvalidPort(i32),

    #[error("websocket transport is not enabled")]
    TransportDisabled,

    #[error("{source}")]
    TlsError {
        #[from]
        source: rustls::Error,
    },
}

impl Error {
    /// True for violations of the framing rules, the class of failures that
    /// must be answered with a Close frame carrying status 1002.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Error::MaskMissing
                | Error::ControlFrameTooBig
                | Error::ControlFrameNotFinal
                | Error::MessageBeforeFinalFrame
                | Error::InvalidContinuationFrame
                | Error::UnknownOpcode(_)
        )
    }
}
