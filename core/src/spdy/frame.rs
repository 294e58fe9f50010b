//! SPDY/3.1 frame codec.
//!
//! Every frame starts with an 8 byte header. Control frames carry the
//! control bit, the protocol version and a type; data frames carry a stream
//! id. Both end with flags and a 24-bit payload length. Header blocks stay
//! compressed here; the connection owns the stateful zlib contexts.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::SpdyError;

pub const SPDY_VERSION: u16 = 3;

/// Last frame the sender will emit on this stream.
pub const FLAG_FIN: u8 = 0x01;

pub(crate) const FRAME_HEADER_LEN: usize = 8;
pub(crate) const MAX_FRAME_LENGTH: usize = 0x00FF_FFFF;
const CONTROL_BIT: u32 = 0x8000_0000;
const STREAM_ID_MASK: u32 = 0x7FFF_FFFF;

/// RST_STREAM status codes used by this crate.
pub mod rst_status {
    pub const PROTOCOL_ERROR: u32 = 1;
    pub const REFUSED_STREAM: u32 = 3;
    pub const CANCEL: u32 = 5;
}

mod frame_type {
    pub const SYN_STREAM: u16 = 1;
    pub const SYN_REPLY: u16 = 2;
    pub const RST_STREAM: u16 = 3;
    pub const SETTINGS: u16 = 4;
    pub const PING: u16 = 6;
    pub const GOAWAY: u16 = 7;
    pub const HEADERS: u16 = 8;
    pub const WINDOW_UPDATE: u16 = 9;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    SynStream {
        stream_id: u32,
        associated_stream_id: u32,
        priority: u8,
        flags: u8,
        header_block: Bytes,
    },
    SynReply {
        stream_id: u32,
        flags: u8,
        header_block: Bytes,
    },
    RstStream {
        stream_id: u32,
        status: u32,
    },
    Settings {
        flags: u8,
        payload: Bytes,
    },
    Ping {
        id: u32,
    },
    GoAway {
        last_good_stream_id: u32,
        status: u32,
    },
    Headers {
        stream_id: u32,
        flags: u8,
        header_block: Bytes,
    },
    WindowUpdate {
        stream_id: u32,
        delta: u32,
    },
    Data {
        stream_id: u32,
        flags: u8,
        data: Bytes,
    },
    /// Control frame of a type this crate does not act on (e.g. CREDENTIAL).
    Unknown {
        frame_type: u16,
        flags: u8,
        payload: Bytes,
    },
}

impl Frame {
    pub fn is_fin(&self) -> bool {
        match self {
            Frame::SynStream { flags, .. }
            | Frame::SynReply { flags, .. }
            | Frame::Headers { flags, .. }
            | Frame::Data { flags, .. } => flags & FLAG_FIN != 0,
            _ => false,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Frame::SynStream { .. } => "SYN_STREAM",
            Frame::SynReply { .. } => "SYN_REPLY",
            Frame::RstStream { .. } => "RST_STREAM",
            Frame::Settings { .. } => "SETTINGS",
            Frame::Ping { .. } => "PING",
            Frame::GoAway { .. } => "GOAWAY",
            Frame::Headers { .. } => "HEADERS",
            Frame::WindowUpdate { .. } => "WINDOW_UPDATE",
            Frame::Data { .. } => "DATA",
            Frame::Unknown { .. } => "UNKNOWN",
        }
    }
}

fn malformed(frame: &'static str, reason: impl Into<String>) -> SpdyError {
    SpdyError::Malformed {
        frame,
        reason: reason.into(),
    }
}

fn require_len(frame: &'static str, payload: &Bytes, min: usize) -> Result<(), SpdyError> {
    if payload.len() < min {
        return Err(malformed(
            frame,
            format!("payload of {} bytes, need at least {min}", payload.len()),
        ));
    }
    Ok(())
}

/// Stateless codec for use with `FramedRead` / `FramedWrite`.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = SpdyError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, SpdyError> {
        if src.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        let first = u32::from_be_bytes([src[0], src[1], src[2], src[3]]);
        let flags = src[4];
        let length = u32::from_be_bytes([0, src[5], src[6], src[7]]) as usize;

        if src.len() < FRAME_HEADER_LEN + length {
            src.reserve(FRAME_HEADER_LEN + length - src.len());
            return Ok(None);
        }

        src.advance(FRAME_HEADER_LEN);
        let mut payload = src.split_to(length).freeze();

        if first & CONTROL_BIT == 0 {
            return Ok(Some(Frame::Data {
                stream_id: first & STREAM_ID_MASK,
                flags,
                data: payload,
            }));
        }

        let version = ((first >> 16) & 0x7FFF) as u16;
        if version != SPDY_VERSION {
            return Err(SpdyError::UnsupportedVersion(version));
        }

        let frame = match (first & 0xFFFF) as u16 {
            frame_type::SYN_STREAM => {
                require_len("SYN_STREAM", &payload, 10)?;
                let stream_id = payload.get_u32() & STREAM_ID_MASK;
                let associated_stream_id = payload.get_u32() & STREAM_ID_MASK;
                let priority = payload.get_u8() >> 5;
                let _slot = payload.get_u8();
                Frame::SynStream {
                    stream_id,
                    associated_stream_id,
                    priority,
                    flags,
                    header_block: payload,
                }
            }
            frame_type::SYN_REPLY => {
                require_len("SYN_REPLY", &payload, 4)?;
                Frame::SynReply {
                    stream_id: payload.get_u32() & STREAM_ID_MASK,
                    flags,
                    header_block: payload,
                }
            }
            frame_type::RST_STREAM => {
                require_len("RST_STREAM", &payload, 8)?;
                Frame::RstStream {
                    stream_id: payload.get_u32() & STREAM_ID_MASK,
                    status: payload.get_u32(),
                }
            }
            frame_type::SETTINGS => Frame::Settings { flags, payload },
            frame_type::PING => {
                require_len("PING", &payload, 4)?;
                Frame::Ping {
                    id: payload.get_u32(),
                }
            }
            frame_type::GOAWAY => {
                require_len("GOAWAY", &payload, 4)?;
                let last_good_stream_id = payload.get_u32() & STREAM_ID_MASK;
                let status = if payload.remaining() >= 4 {
                    payload.get_u32()
                } else {
                    0
                };
                Frame::GoAway {
                    last_good_stream_id,
                    status,
                }
            }
            frame_type::HEADERS => {
                require_len("HEADERS", &payload, 4)?;
                Frame::Headers {
                    stream_id: payload.get_u32() & STREAM_ID_MASK,
                    flags,
                    header_block: payload,
                }
            }
            frame_type::WINDOW_UPDATE => {
                require_len("WINDOW_UPDATE", &payload, 8)?;
                Frame::WindowUpdate {
                    stream_id: payload.get_u32() & STREAM_ID_MASK,
                    delta: payload.get_u32() & STREAM_ID_MASK,
                }
            }
            other => Frame::Unknown {
                frame_type: other,
                flags,
                payload,
            },
        };

        Ok(Some(frame))
    }
}

fn put_control_header(dst: &mut BytesMut, frame_type: u16, flags: u8, length: usize) {
    dst.put_u32(CONTROL_BIT | (u32::from(SPDY_VERSION) << 16) | u32::from(frame_type));
    dst.put_u32((u32::from(flags) << 24) | length as u32);
}

impl Encoder<Frame> for FrameCodec {
    type Error = SpdyError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), SpdyError> {
        let payload_len = match &frame {
            Frame::SynStream { header_block, .. } => 10 + header_block.len(),
            Frame::SynReply { header_block, .. } | Frame::Headers { header_block, .. } => {
                4 + header_block.len()
            }
            Frame::RstStream { .. } | Frame::GoAway { .. } | Frame::WindowUpdate { .. } => 8,
            Frame::Ping { .. } => 4,
            Frame::Settings { payload, .. } | Frame::Unknown { payload, .. } => payload.len(),
            Frame::Data { data, .. } => data.len(),
        };
        if payload_len > MAX_FRAME_LENGTH {
            return Err(SpdyError::FrameTooLarge(payload_len));
        }
        tracing::trace!(frame = frame.name(), len = payload_len, "encoding frame");

        dst.reserve(FRAME_HEADER_LEN + payload_len);
        match frame {
            Frame::SynStream {
                stream_id,
                associated_stream_id,
                priority,
                flags,
                header_block,
            } => {
                put_control_header(dst, frame_type::SYN_STREAM, flags, payload_len);
                dst.put_u32(stream_id & STREAM_ID_MASK);
                dst.put_u32(associated_stream_id & STREAM_ID_MASK);
                dst.put_u8((priority & 0x07) << 5);
                dst.put_u8(0);
                dst.extend_from_slice(&header_block);
            }
            Frame::SynReply {
                stream_id,
                flags,
                header_block,
            } => {
                put_control_header(dst, frame_type::SYN_REPLY, flags, payload_len);
                dst.put_u32(stream_id & STREAM_ID_MASK);
                dst.extend_from_slice(&header_block);
            }
            Frame::RstStream { stream_id, status } => {
                put_control_header(dst, frame_type::RST_STREAM, 0, payload_len);
                dst.put_u32(stream_id & STREAM_ID_MASK);
                dst.put_u32(status);
            }
            Frame::Settings { flags, payload } => {
                put_control_header(dst, frame_type::SETTINGS, flags, payload_len);
                dst.extend_from_slice(&payload);
            }
            Frame::Ping { id } => {
                put_control_header(dst, frame_type::PING, 0, payload_len);
                dst.put_u32(id);
            }
            Frame::GoAway {
                last_good_stream_id,
                status,
            } => {
                put_control_header(dst, frame_type::GOAWAY, 0, payload_len);
                dst.put_u32(last_good_stream_id & STREAM_ID_MASK);
                dst.put_u32(status);
            }
            Frame::Headers {
                stream_id,
                flags,
                header_block,
            } => {
                put_control_header(dst, frame_type::HEADERS, flags, payload_len);
                dst.put_u32(stream_id & STREAM_ID_MASK);
                dst.extend_from_slice(&header_block);
            }
            Frame::WindowUpdate { stream_id, delta } => {
                put_control_header(dst, frame_type::WINDOW_UPDATE, 0, payload_len);
                dst.put_u32(stream_id & STREAM_ID_MASK);
                dst.put_u32(delta & STREAM_ID_MASK);
            }
            Frame::Data {
                stream_id,
                flags,
                data,
            } => {
                dst.put_u32(stream_id & STREAM_ID_MASK);
                dst.put_u32((u32::from(flags) << 24) | payload_len as u32);
                dst.extend_from_slice(&data);
            }
            Frame::Unknown {
                frame_type,
                flags,
                payload,
            } => {
                put_control_header(dst, frame_type, flags, payload_len);
                dst.extend_from_slice(&payload);
            }
        }
        Ok(())
    }
}
