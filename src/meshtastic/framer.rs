//! Length-prefixed stream framing for the Meshtastic serial API.
//!
//! On the wire every protobuf message is preceded by a four byte header:
//!
//!   `0x94 0xC3 <len_hi> <len_lo>`
//!
//! The radio also prints plain-text debug output on the same port, so the decoder must be
//! able to skip arbitrary garbage and resynchronise on the next magic pair.
use bytes::{Buf, BytesMut};

pub const START1: u8 = 0x94;
pub const START2: u8 = 0xC3;
const HEADER_LEN: usize = 4;

/// Largest payload the firmware will emit or accept.
pub const MAX_PAYLOAD: usize = 512;

/// Incremental decoder: feed arbitrary chunks, pull out whole payloads.
#[derive(Debug, Default)]
pub struct StreamFramer {
    buf: BytesMut,
}

impl StreamFramer {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(1024),
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes currently buffered (partial frame or unsynchronised text).
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Extract the next complete payload, if one is buffered.
    ///
    /// Garbage before a header is discarded. A header announcing a zero or oversize length
    /// is treated as a false match: one byte is dropped and scanning continues.
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        loop {
            match self.buf.iter().position(|&b| b == START1) {
                Some(0) => {}
                Some(pos) => self.buf.advance(pos),
                None => {
                    self.buf.clear();
                    return None;
                }
            }
            if self.buf.len() < 2 {
                return None;
            }
            if self.buf[1] != START2 {
                self.buf.advance(1);
                continue;
            }
            if self.buf.len() < HEADER_LEN {
                return None;
            }
            let declared = ((self.buf[2] as usize) << 8) | self.buf[3] as usize;
            if declared == 0 || declared > MAX_PAYLOAD {
                self.buf.advance(1);
                continue;
            }
            if self.buf.len() < HEADER_LEN + declared {
                return None;
            }
            self.buf.advance(HEADER_LEN);
            return Some(self.buf.split_to(declared).to_vec());
        }
    }
}

/// Prefix `payload` with the stream header. Returns `None` when it exceeds [`MAX_PAYLOAD`].
pub fn encode_frame(payload: &[u8]) -> Option<Vec<u8>> {
    if payload.is_empty() || payload.len() > MAX_PAYLOAD {
        return None;
    }
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.push(START1);
    out.push(START2);
    out.push(((payload.len() >> 8) & 0xFF) as u8);
    out.push((payload.len() & 0xFF) as u8);
    out.extend_from_slice(payload);
    Some(out)
}
