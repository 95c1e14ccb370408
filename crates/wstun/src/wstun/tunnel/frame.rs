//! Multiplexed-mode framing.
//!
//! ```text
//! [metaLen u16be][streamId u16be][cmd u8][hasExtra u8][cmd args...]
//! [extraLen u16be][extra]            (only when hasExtra == 1)
//! ```
//!
//! The same layout is used in both directions. Open commands carry the destination address
//! (see [`crate::wstun::tunnel::address`]) as command args inside the meta block.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::wstun::tunnel::address::{self, AddressError, Destination};

/// streamId(2) + cmd(1) + hasExtra(1)
pub const FIXED_META_LEN: usize = 4;
/// Largest payload a single frame (or direct-mode UDP record) can carry.
pub const MAX_CHUNK: usize = u16::MAX as usize;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("meta too short: {0} bytes")]
    MetaTooShort(usize),
    #[error("unknown command {0}")]
    UnknownCommand(u8),
    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),
    #[error("address: {0}")]
    Address(#[from] AddressError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Open,
    Data,
    Close,
}

impl Command {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Command::Open),
            2 => Some(Command::Data),
            3 => Some(Command::Close),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Command::Open => 1,
            Command::Data => 2,
            Command::Close => 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub stream_id: u16,
    pub command: Command,
    /// Meta bytes after the fixed 4-byte prefix; only open commands use them.
    pub args: Bytes,
    pub extra: Option<Bytes>,
}

#[derive(Debug)]
pub enum Decoded {
    /// Not enough bytes for a whole frame yet; nothing may be consumed.
    Incomplete,
    Frame { frame: Frame, consumed: usize },
    /// A complete but unusable frame. Its bytes should be dropped.
    Skip { consumed: usize, err: FrameError },
}

/// Decodes at most one frame from the front of `buf`.
pub fn decode(buf: &[u8]) -> Decoded {
    if buf.len() < 2 {
        return Decoded::Incomplete;
    }
    let meta_len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
    let Some(meta) = buf.get(2..2 + meta_len) else {
        return Decoded::Incomplete;
    };
    let mut consumed = 2 + meta_len;

    // hasExtra is only known for a well-formed meta; a short one is skipped on its own.
    let has_extra = meta.len() >= FIXED_META_LEN && meta[3] == 1;
    let extra = if has_extra {
        let Some(len) = buf.get(consumed..consumed + 2) else {
            return Decoded::Incomplete;
        };
        let extra_len = u16::from_be_bytes([len[0], len[1]]) as usize;
        consumed += 2;
        let Some(extra) = buf.get(consumed..consumed + extra_len) else {
            return Decoded::Incomplete;
        };
        consumed += extra_len;
        Some(Bytes::copy_from_slice(extra))
    } else {
        None
    };

    if meta.len() < FIXED_META_LEN {
        return Decoded::Skip {
            consumed,
            err: FrameError::MetaTooShort(meta.len()),
        };
    }

    let Some(command) = Command::from_u8(meta[2]) else {
        return Decoded::Skip {
            consumed,
            err: FrameError::UnknownCommand(meta[2]),
        };
    };

    Decoded::Frame {
        frame: Frame {
            stream_id: u16::from_be_bytes([meta[0], meta[1]]),
            command,
            args: Bytes::copy_from_slice(&meta[FIXED_META_LEN..]),
            extra,
        },
        consumed,
    }
}

/// Encodes a frame without command args.
pub fn encode(stream_id: u16, command: Command, extra: Option<&[u8]>) -> Result<Bytes, FrameError> {
    encode_with_args(stream_id, command, &[], extra)
}

/// Encodes an open command for `dest`.
pub fn encode_open(
    stream_id: u16,
    dest: &Destination,
    extra: Option<&[u8]>,
) -> Result<Bytes, FrameError> {
    let mut args = BytesMut::new();
    address::encode(dest, &mut args)?;
    encode_with_args(stream_id, Command::Open, &args, extra)
}

fn encode_with_args(
    stream_id: u16,
    command: Command,
    args: &[u8],
    extra: Option<&[u8]>,
) -> Result<Bytes, FrameError> {
    let meta_len = FIXED_META_LEN + args.len();
    if meta_len > MAX_CHUNK {
        return Err(FrameError::PayloadTooLarge(meta_len));
    }
    if let Some(extra) = extra {
        if extra.len() > MAX_CHUNK {
            return Err(FrameError::PayloadTooLarge(extra.len()));
        }
    }

    let extra_len = extra.map(|e| 2 + e.len()).unwrap_or(0);
    let mut out = BytesMut::with_capacity(2 + meta_len + extra_len);
    out.put_u16(meta_len as u16);
    out.put_u16(stream_id);
    out.put_u8(command.as_u8());
    out.put_u8(u8::from(extra.is_some()));
    out.put_slice(args);
    if let Some(extra) = extra {
        out.put_u16(extra.len() as u16);
        out.put_slice(extra);
    }
    Ok(out.freeze())
}

/// Splits `payload` into data frames of at most [`MAX_CHUNK`] bytes each, in order.
pub fn data_frames(stream_id: u16, payload: &[u8]) -> impl Iterator<Item = Bytes> + '_ {
    payload.chunks(MAX_CHUNK).map(move |chunk| {
        let mut out = BytesMut::with_capacity(2 + FIXED_META_LEN + 2 + chunk.len());
        out.put_u16(FIXED_META_LEN as u16);
        out.put_u16(stream_id);
        out.put_u8(Command::Data.as_u8());
        out.put_u8(1);
        out.put_u16(chunk.len() as u16);
        out.put_slice(chunk);
        out.freeze()
    })
}

/// A close notification for `stream_id`.
pub fn close_frame(stream_id: u16) -> Bytes {
    let mut out = BytesMut::with_capacity(2 + FIXED_META_LEN);
    out.put_u16(FIXED_META_LEN as u16);
    out.put_u16(stream_id);
    out.put_u8(Command::Close.as_u8());
    out.put_u8(0);
    out.freeze()
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use super::*;
    use crate::wstun::tunnel::address::{Host, Transport};

    fn expect_frame(d: Decoded) -> (Frame, usize) {
        match d {
            Decoded::Frame { frame, consumed } => (frame, consumed),
            other => panic!("expected frame, got {other:?}"),
        }
    }

    #[test]
    fn roundtrip_with_and_without_extra() {
        for (sid, cmd, extra) in [
            (0u16, Command::Data, Some(&b"hello"[..])),
            (7, Command::Close, None),
            (u16::MAX, Command::Data, Some(&b""[..])),
        ] {
            let b = encode(sid, cmd, extra).unwrap();
            let (f, n) = expect_frame(decode(&b));
            assert_eq!(n, b.len());
            assert_eq!(f.stream_id, sid);
            assert_eq!(f.command, cmd);
            assert_eq!(f.extra.as_deref(), extra);
            assert!(f.args.is_empty());
        }
    }

    #[test]
    fn split_at_every_boundary_is_incomplete_until_whole() {
        let dest = Destination::new(Transport::Tcp, Host::Domain("example.com".into()), 443);
        let b = encode_open(7, &dest, Some(b"GET / HTTP/1.1\r\n\r\n")).unwrap();
        let (whole, whole_n) = expect_frame(decode(&b));

        for cut in 0..b.len() {
            assert!(
                matches!(decode(&b[..cut]), Decoded::Incomplete),
                "cut at {cut}"
            );
        }

        let (f, n) = expect_frame(decode(&b));
        assert_eq!(f, whole);
        assert_eq!(n, whole_n);

        let (got, _) = address::decode(&f.args).unwrap().unwrap();
        assert_eq!(got, dest);
    }

    #[test]
    fn decode_consumes_exactly_one_frame() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encode(1, Command::Data, Some(b"a")).unwrap());
        buf.extend_from_slice(&close_frame(2));
        buf.extend_from_slice(&[0x00]);

        let (f, n) = expect_frame(decode(&buf));
        assert_eq!(f.stream_id, 1);
        let rest = &buf[n..];
        let (f, n2) = expect_frame(decode(rest));
        assert_eq!(f.command, Command::Close);
        assert_eq!(f.stream_id, 2);
        assert!(matches!(decode(&rest[n2..]), Decoded::Incomplete));
    }

    #[test]
    fn short_meta_and_unknown_command_are_skipped() {
        let buf = [0x00, 0x02, 0x00, 0x01, 0xff];
        match decode(&buf) {
            Decoded::Skip { consumed, err } => {
                assert_eq!(consumed, 4);
                assert!(matches!(err, FrameError::MetaTooShort(2)));
            }
            other => panic!("unexpected: {other:?}"),
        }

        let buf = [0x00, 0x04, 0x00, 0x01, 0x09, 0x00];
        match decode(&buf) {
            Decoded::Skip { consumed, err } => {
                assert_eq!(consumed, 6);
                assert!(matches!(err, FrameError::UnknownCommand(9)));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn chunks_large_payloads() {
        let payload: Vec<u8> = (0..150_000u32).map(|i| (i % 251) as u8).collect();
        let frames: Vec<Bytes> = data_frames(3, &payload).collect();
        assert_eq!(frames.len(), 3);

        let mut joined = Vec::new();
        for b in &frames {
            let (f, n) = expect_frame(decode(b));
            assert_eq!(n, b.len());
            assert_eq!(f.stream_id, 3);
            assert_eq!(f.command, Command::Data);
            let extra = f.extra.unwrap();
            assert!(extra.len() <= MAX_CHUNK);
            joined.extend_from_slice(&extra);
        }
        assert_eq!(joined, payload);
    }

    #[test]
    fn encode_rejects_oversized_extra() {
        let big = vec![0u8; MAX_CHUNK + 1];
        assert!(matches!(
            encode(1, Command::Data, Some(&big)),
            Err(FrameError::PayloadTooLarge(n)) if n == MAX_CHUNK + 1
        ));

        let dest = Destination::new(
            Transport::Udp,
            Host::Ip(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8))),
            53,
        );
        assert!(encode_open(1, &dest, None).is_ok());
    }
}
