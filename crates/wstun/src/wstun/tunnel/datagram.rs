use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::wstun::tunnel::frame::MAX_CHUNK;

/// Datagram framing over the direct-mode byte stream.
///
/// Each datagram is encoded as `u16be len` + `payload`. Records may be split or concatenated
/// arbitrarily across client messages, so bytes are accumulated and complete records are pulled
/// out one at a time.
#[derive(Debug, Default)]
pub struct DatagramReassembler {
    buf: BytesMut,
}

impl DatagramReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Takes the next complete datagram, leaving any partial record buffered.
    pub fn next_datagram(&mut self) -> Option<Bytes> {
        if self.buf.len() < 2 {
            return None;
        }
        let len = u16::from_be_bytes([self.buf[0], self.buf[1]]) as usize;
        if self.buf.len() < 2 + len {
            return None;
        }
        self.buf.advance(2);
        Some(self.buf.split_to(len).freeze())
    }

    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

/// Encodes `payload` as one or more length-prefixed records of at most [`MAX_CHUNK`] bytes.
pub fn encode_records(payload: &[u8]) -> impl Iterator<Item = Bytes> + '_ {
    payload.chunks(MAX_CHUNK).map(|chunk| {
        let mut out = BytesMut::with_capacity(2 + chunk.len());
        out.put_u16(chunk.len() as u16);
        out.put_slice(chunk);
        out.freeze()
    })
}
