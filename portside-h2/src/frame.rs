//! HTTP/2 frame encoding and decoding (RFC 7540 Section 4).
//!
//! Every frame starts with a 9-byte header: 24-bit payload length, type,
//! flags, and a 31-bit stream identifier. Decoding is incremental: a frame
//! is only returned once its full payload is buffered.
//!
//! Server-side detail: DATA frames report their *flow-controlled* length
//! (payload plus padding plus the pad-length octet), because receive
//! windows are charged for the whole frame payload, not just the data that
//! survives padding removal.

use crate::error::{ErrorCode, H2Error};
use crate::settings::Settings;

/// Frame header size in bytes.
pub const FRAME_HEADER_LEN: usize = 9;

// Frame type octets (RFC 7540 Section 6).
pub const FRAME_DATA: u8 = 0x0;
pub const FRAME_HEADERS: u8 = 0x1;
pub const FRAME_PRIORITY: u8 = 0x2;
pub const FRAME_RST_STREAM: u8 = 0x3;
pub const FRAME_SETTINGS: u8 = 0x4;
pub const FRAME_PUSH_PROMISE: u8 = 0x5;
pub const FRAME_PING: u8 = 0x6;
pub const FRAME_GOAWAY: u8 = 0x7;
pub const FRAME_WINDOW_UPDATE: u8 = 0x8;
pub const FRAME_CONTINUATION: u8 = 0x9;

// Flag bits.
pub const FLAG_END_STREAM: u8 = 0x1;
pub const FLAG_ACK: u8 = 0x1;
pub const FLAG_END_HEADERS: u8 = 0x4;
pub const FLAG_PADDED: u8 = 0x8;
pub const FLAG_PRIORITY: u8 = 0x20;

/// One decoded HTTP/2 frame.
#[derive(Debug, Clone)]
pub enum Frame {
    Data {
        stream_id: u32,
        payload: Vec<u8>,
        /// Bytes charged against flow-control windows: payload + padding.
        flow_len: u32,
        end_stream: bool,
    },
    Headers {
        stream_id: u32,
        /// HPACK header block fragment.
        fragment: Vec<u8>,
        end_stream: bool,
        end_headers: bool,
    },
    Priority {
        stream_id: u32,
    },
    RstStream {
        stream_id: u32,
        error_code: ErrorCode,
    },
    Settings {
        ack: bool,
        settings: Settings,
    },
    PushPromise {
        stream_id: u32,
    },
    Ping {
        ack: bool,
        opaque_data: [u8; 8],
    },
    GoAway {
        last_stream_id: u32,
        error_code: ErrorCode,
        debug_data: Vec<u8>,
    },
    WindowUpdate {
        stream_id: u32,
        increment: u32,
    },
    Continuation {
        stream_id: u32,
        fragment: Vec<u8>,
        end_headers: bool,
    },
    /// Unknown frame types are ignored per spec.
    Unknown {
        frame_type: u8,
    },
}

/// Decoded 9-byte frame header.
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    pub length: u32,
    pub frame_type: u8,
    pub flags: u8,
    pub stream_id: u32,
}

// -- Byte helpers --

fn put_u24(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&[(v >> 16) as u8, (v >> 8) as u8, v as u8]);
}

fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_be_bytes());
}

fn get_u32(buf: &[u8]) -> u32 {
    u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]])
}

/// Write a frame header for a payload of `len` bytes.
pub fn put_frame_header(buf: &mut Vec<u8>, len: u32, frame_type: u8, flags: u8, stream_id: u32) {
    put_u24(buf, len);
    buf.push(frame_type);
    buf.push(flags);
    put_u32(buf, stream_id & 0x7fff_ffff);
}

/// Read a frame header from the start of `buf`, if enough bytes are present.
pub fn peek_frame_header(buf: &[u8]) -> Option<FrameHeader> {
    if buf.len() < FRAME_HEADER_LEN {
        return None;
    }
    Some(FrameHeader {
        length: (u32::from(buf[0]) << 16) | (u32::from(buf[1]) << 8) | u32::from(buf[2]),
        frame_type: buf[3],
        flags: buf[4],
        stream_id: get_u32(&buf[5..9]) & 0x7fff_ffff,
    })
}

// -- Encoding --

/// Append a DATA frame.
pub fn put_data(buf: &mut Vec<u8>, stream_id: u32, data: &[u8], end_stream: bool) {
    let flags = if end_stream { FLAG_END_STREAM } else { 0 };
    put_frame_header(buf, data.len() as u32, FRAME_DATA, flags, stream_id);
    buf.extend_from_slice(data);
}

/// Append a HEADERS frame (optionally followed by CONTINUATIONs) carrying a
/// complete HPACK block, split to `max_frame_size`.
pub fn put_header_block(
    buf: &mut Vec<u8>,
    stream_id: u32,
    block: &[u8],
    end_stream: bool,
    max_frame_size: u32,
) {
    let max = max_frame_size as usize;
    let mut first = true;
    let mut rest = block;
    loop {
        let take = rest.len().min(max);
        let (part, tail) = rest.split_at(take);
        rest = tail;
        let last = rest.is_empty();

        let mut flags = 0u8;
        if last {
            flags |= FLAG_END_HEADERS;
        }
        if first && end_stream {
            flags |= FLAG_END_STREAM;
        }
        let frame_type = if first { FRAME_HEADERS } else { FRAME_CONTINUATION };
        put_frame_header(buf, part.len() as u32, frame_type, flags, stream_id);
        buf.extend_from_slice(part);

        first = false;
        if last {
            break;
        }
    }
}

/// Append an RST_STREAM frame.
pub fn put_rst_stream(buf: &mut Vec<u8>, stream_id: u32, code: ErrorCode) {
    put_frame_header(buf, 4, FRAME_RST_STREAM, 0, stream_id);
    put_u32(buf, code as u32);
}

/// Append a SETTINGS frame (or a SETTINGS ACK when `settings` is `None`).
pub fn put_settings(buf: &mut Vec<u8>, settings: Option<&Settings>) {
    match settings {
        Some(s) => {
            let payload = s.encode_to_vec();
            put_frame_header(buf, payload.len() as u32, FRAME_SETTINGS, 0, 0);
            buf.extend_from_slice(&payload);
        }
        None => put_frame_header(buf, 0, FRAME_SETTINGS, FLAG_ACK, 0),
    }
}

/// Append a PING frame.
pub fn put_ping(buf: &mut Vec<u8>, ack: bool, opaque_data: [u8; 8]) {
    let flags = if ack { FLAG_ACK } else { 0 };
    put_frame_header(buf, 8, FRAME_PING, flags, 0);
    buf.extend_from_slice(&opaque_data);
}

/// Append a GOAWAY frame.
pub fn put_goaway(buf: &mut Vec<u8>, last_stream_id: u32, code: ErrorCode) {
    put_frame_header(buf, 8, FRAME_GOAWAY, 0, 0);
    put_u32(buf, last_stream_id & 0x7fff_ffff);
    put_u32(buf, code as u32);
}

/// Append a WINDOW_UPDATE frame.
pub fn put_window_update(buf: &mut Vec<u8>, stream_id: u32, increment: u32) {
    put_frame_header(buf, 4, FRAME_WINDOW_UPDATE, 0, stream_id);
    put_u32(buf, increment & 0x7fff_ffff);
}

// -- Decoding --

/// Decode one frame from the start of `buf`.
///
/// `Ok(Some((frame, consumed)))` on success, `Ok(None)` when more bytes are
/// needed, `Err` on a connection-fatal framing error.
pub fn decode_frame(buf: &[u8], max_frame_size: u32) -> Result<Option<(Frame, usize)>, H2Error> {
    let header = match peek_frame_header(buf) {
        Some(h) => h,
        None => return Ok(None),
    };

    if header.length > max_frame_size {
        return Err(H2Error::FrameSizeError);
    }

    let total = FRAME_HEADER_LEN + header.length as usize;
    if buf.len() < total {
        return Ok(None);
    }

    let payload = &buf[FRAME_HEADER_LEN..total];
    let flags = header.flags;
    let stream_id = header.stream_id;

    let frame = match header.frame_type {
        FRAME_DATA => {
            if stream_id == 0 {
                return Err(H2Error::ProtocolError("DATA on stream 0".into()));
            }
            let data = unpad(payload, flags)?;
            Frame::Data {
                stream_id,
                payload: data.to_vec(),
                flow_len: header.length,
                end_stream: flags & FLAG_END_STREAM != 0,
            }
        }
        FRAME_HEADERS => {
            if stream_id == 0 {
                return Err(H2Error::ProtocolError("HEADERS on stream 0".into()));
            }
            let data = unpad(payload, flags)?;
            // A priority section may precede the block; the server ignores
            // its contents but must skip it.
            let fragment = if flags & FLAG_PRIORITY != 0 {
                if data.len() < 5 {
                    return Err(H2Error::FrameSizeError);
                }
                &data[5..]
            } else {
                data
            };
            Frame::Headers {
                stream_id,
                fragment: fragment.to_vec(),
                end_stream: flags & FLAG_END_STREAM != 0,
                end_headers: flags & FLAG_END_HEADERS != 0,
            }
        }
        FRAME_PRIORITY => {
            if stream_id == 0 {
                return Err(H2Error::ProtocolError("PRIORITY on stream 0".into()));
            }
            if payload.len() != 5 {
                return Err(H2Error::FrameSizeError);
            }
            Frame::Priority { stream_id }
        }
        FRAME_RST_STREAM => {
            if stream_id == 0 {
                return Err(H2Error::ProtocolError("RST_STREAM on stream 0".into()));
            }
            if payload.len() != 4 {
                return Err(H2Error::FrameSizeError);
            }
            Frame::RstStream {
                stream_id,
                error_code: ErrorCode::from_u32(get_u32(payload)),
            }
        }
        FRAME_SETTINGS => {
            if stream_id != 0 {
                return Err(H2Error::ProtocolError("SETTINGS on non-zero stream".into()));
            }
            if flags & FLAG_ACK != 0 {
                if !payload.is_empty() {
                    return Err(H2Error::FrameSizeError);
                }
                Frame::Settings {
                    ack: true,
                    settings: Settings::default(),
                }
            } else {
                Frame::Settings {
                    ack: false,
                    settings: Settings::decode(payload)?,
                }
            }
        }
        FRAME_PUSH_PROMISE => {
            if stream_id == 0 {
                return Err(H2Error::ProtocolError("PUSH_PROMISE on stream 0".into()));
            }
            Frame::PushPromise { stream_id }
        }
        FRAME_PING => {
            if stream_id != 0 {
                return Err(H2Error::ProtocolError("PING on non-zero stream".into()));
            }
            if payload.len() != 8 {
                return Err(H2Error::FrameSizeError);
            }
            let mut data = [0u8; 8];
            data.copy_from_slice(payload);
            Frame::Ping {
                ack: flags & FLAG_ACK != 0,
                opaque_data: data,
            }
        }
        FRAME_GOAWAY => {
            if stream_id != 0 {
                return Err(H2Error::ProtocolError("GOAWAY on non-zero stream".into()));
            }
            if payload.len() < 8 {
                return Err(H2Error::FrameSizeError);
            }
            Frame::GoAway {
                last_stream_id: get_u32(&payload[0..4]) & 0x7fff_ffff,
                error_code: ErrorCode::from_u32(get_u32(&payload[4..8])),
                debug_data: payload[8..].to_vec(),
            }
        }
        FRAME_WINDOW_UPDATE => {
            if payload.len() != 4 {
                return Err(H2Error::FrameSizeError);
            }
            let increment = get_u32(payload) & 0x7fff_ffff;
            if increment == 0 {
                return Err(H2Error::ProtocolError("WINDOW_UPDATE of zero".into()));
            }
            Frame::WindowUpdate {
                stream_id,
                increment,
            }
        }
        FRAME_CONTINUATION => {
            if stream_id == 0 {
                return Err(H2Error::ProtocolError("CONTINUATION on stream 0".into()));
            }
            Frame::Continuation {
                stream_id,
                fragment: payload.to_vec(),
                end_headers: flags & FLAG_END_HEADERS != 0,
            }
        }
        other => Frame::Unknown { frame_type: other },
    };

    Ok(Some((frame, total)))
}

/// Remove padding when the PADDED flag is set.
fn unpad(payload: &[u8], flags: u8) -> Result<&[u8], H2Error> {
    if flags & FLAG_PADDED == 0 {
        return Ok(payload);
    }
    if payload.is_empty() {
        return Err(H2Error::FrameSizeError);
    }
    let pad = payload[0] as usize;
    if pad >= payload.len() {
        return Err(H2Error::ProtocolError("padding exceeds payload".into()));
    }
    Ok(&payload[1..payload.len() - pad])
}
