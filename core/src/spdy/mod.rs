//! SPDY/3.1 client transport.
//!
//! The API server's port-forward endpoint speaks SPDY/3.1 after the HTTP
//! upgrade. [`SpdyConnection`] runs a reader and a writer task over the
//! upgraded socket and hands out [`SpdyStream`]s, each an independent
//! byte stream with its own FIN and reset handling.

mod connection;
mod dictionary;
mod frame;
mod header;
mod stream;

use thiserror::Error;

pub use connection::{ConnectionOptions, SpdyConnection, STREAM_BUFFER_BYTES};
pub use frame::{rst_status, Frame, FrameCodec, FLAG_FIN, SPDY_VERSION};
pub use header::{HeaderDecoder, HeaderEncoder, Headers};
pub use stream::SpdyStream;

/// Protocol token sent in the `Upgrade` header.
pub const SPDY_PROTOCOL: &str = "SPDY/3.1";

/// Errors raised by the SPDY layer.
#[derive(Error, Debug)]
pub enum SpdyError {
    #[error("unsupported SPDY version {0}")]
    UnsupportedVersion(u16),

    #[error("malformed {frame}: {reason}")]
    Malformed { frame: &'static str, reason: String },

    #[error("frame payload of {0} bytes exceeds the 24-bit limit")]
    FrameTooLarge(usize),

    #[error("header compression failed: {0}")]
    Compression(String),

    #[error("stream {stream_id} was reset by the peer (status {status})")]
    Reset { stream_id: u32, status: u32 },

    #[error("no reply for stream {0} in time")]
    ReplyTimeout(u32),

    #[error("stream ids exhausted")]
    StreamIdsExhausted,

    #[error("peer sent GOAWAY")]
    GoingAway,

    #[error("connection closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
