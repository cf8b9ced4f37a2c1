//! WebSocket transport layer for a publish/subscribe messaging broker.
//!
//! This library accepts browser-originated WebSocket connections carrying a
//! broker's line-oriented text protocol: it performs the opening HTTP/1.1
//! upgrade exchange and thereafter multiplexes broker messages onto
//! [RFC 6455](https://datatracker.ietf.org/doc/html/rfc6455) data frames,
//! with optional permessage-deflate compression
//! ([RFC 7692](https://datatracker.ietf.org/doc/html/rfc7692)) in
//! no-context-takeover mode.
//!
//! It's an async library based on the tokio runtime. Inbound bytes run
//! through a resumable frame decoder that unmasks, reassembles and inflates
//! client frames into payload slices for the broker's own parser; outbound
//! messages are framed, optionally deflated through process-wide compressor
//! pools, and drained to the socket by a per-session write task.

mod compression;
mod fetch;
mod mask;
mod outbound;
mod read;
mod stream;

pub mod config;
pub mod error;
pub mod event;
pub mod frame;
pub mod handshake;
pub mod server;
pub mod session;
