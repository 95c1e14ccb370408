//! Handshake engine: the first bytes of every client connection.
//!
//! ```text
//! [version u8][id 16 bytes][optLen u8][options][command u8]
//! command 1 (tcp) / 2 (udp): [transport u8][port u16be][atyp u8][addr][initial payload...]
//! command 3 (mux):           [frames...]
//! ```
//!
//! The engine answers a successful handshake with [`SUCCESS`] and hands the connection to the
//! direct or multiplexed relay together with whatever bytes followed the header.

use std::{sync::Arc, time::Duration};

use bytes::{Bytes, BytesMut};
use thiserror::Error;

use crate::wstun::{
    telemetry,
    tunnel::{
        address::{self, AddressError, Destination, Transport},
        conn::{ClientClosed, ClientConn, ConnMode},
        direct, mux,
        outbound::ConnectorOptions,
        resolver::{self, SharedResolver},
    },
};

/// Nothing is parsed before this many bytes have arrived.
pub const MIN_HEADER_LEN: usize = 24;
pub const SUCCESS: [u8; 2] = [0x00, 0x00];

const ID_LEN: usize = 16;
const OPT_LEN_AT: usize = 1 + ID_LEN;

const CMD_TCP: u8 = 1;
const CMD_UDP: u8 = 2;
const CMD_MUX: u8 = 3;

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("unknown command {0}")]
    UnknownCommand(u8),
    #[error("address: {0}")]
    Address(#[from] AddressError),
    #[error("invalid destination {0}")]
    InvalidDestination(String),
    #[error("handshake exceeds {0} bytes")]
    TooLarge(usize),
    #[error("handshake timed out after {0:?}")]
    Timeout(Duration),
    #[error("client closed during handshake")]
    Closed,
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("handshake: {0}")]
    Handshake(#[from] HandshakeError),
    #[error(transparent)]
    ClientClosed(#[from] ClientClosed),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Direct(Transport),
    Multiplexed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub id: [u8; ID_LEN],
    pub options: Bytes,
    pub mode: Mode,
    /// Offset of the first byte after the command byte.
    pub body_offset: usize,
}

/// Parses the fixed part of the handshake. `Ok(None)` means more bytes are needed.
pub fn parse_header(buf: &[u8]) -> Result<Option<Header>, HandshakeError> {
    if buf.len() < MIN_HEADER_LEN {
        return Ok(None);
    }

    let opt_len = buf[OPT_LEN_AT] as usize;
    let cmd_at = OPT_LEN_AT + 1 + opt_len;
    let Some(&cmd) = buf.get(cmd_at) else {
        return Ok(None);
    };

    let mode = match cmd {
        CMD_TCP => Mode::Direct(Transport::Tcp),
        CMD_UDP => Mode::Direct(Transport::Udp),
        CMD_MUX => Mode::Multiplexed,
        other => return Err(HandshakeError::UnknownCommand(other)),
    };

    let mut id = [0u8; ID_LEN];
    id.copy_from_slice(&buf[1..1 + ID_LEN]);

    Ok(Some(Header {
        version: buf[0],
        id,
        options: Bytes::copy_from_slice(&buf[OPT_LEN_AT + 1..cmd_at]),
        mode,
        body_offset: cmd_at + 1,
    }))
}

#[derive(Debug, Clone)]
pub struct RelayOptions {
    pub connector: ConnectorOptions,
    pub handshake_timeout: Duration,
    pub max_handshake_bytes: usize,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            connector: ConnectorOptions::default(),
            handshake_timeout: Duration::from_secs(10),
            max_handshake_bytes: 64 * 1024,
        }
    }
}

/// Everything a client connection needs from the process.
pub struct RelayContext {
    pub opts: RelayOptions,
    pub resolver: SharedResolver,
    pub conns: telemetry::SharedConnections,
}

impl std::fmt::Debug for RelayContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayContext")
            .field("opts", &self.opts)
            .finish_non_exhaustive()
    }
}

enum Established {
    Direct { dest: Destination, rest: Bytes },
    Multiplexed { rest: Bytes },
}

/// Runs one client connection from handshake to teardown.
pub async fn serve(ctx: Arc<RelayContext>, mut conn: ClientConn) -> Result<(), RelayError> {
    let timeout = ctx.opts.handshake_timeout;
    let est = match tokio::time::timeout(timeout, read_handshake(&ctx, &mut conn)).await {
        Ok(Ok(est)) => est,
        Ok(Err(err)) => {
            conn.close().await;
            return Err(err.into());
        }
        Err(_) => {
            conn.close().await;
            return Err(HandshakeError::Timeout(timeout).into());
        }
    };

    match est {
        Established::Multiplexed { rest } => {
            conn.send(Bytes::from_static(&SUCCESS)).await?;
            ctx.conns.set_mode(conn.id, ConnMode::Multiplexed, "");
            tracing::debug!(conn = conn.id, client = %conn.peer, "handshake: multiplexed");
            mux::run(&ctx, &mut conn, rest).await
        }
        Established::Direct { dest, rest } => {
            let dest = resolver::resolve(ctx.resolver.as_ref(), dest).await;
            if !dest.is_valid() {
                tracing::debug!(conn = conn.id, dest = %dest, "handshake: invalid destination");
                conn.close().await;
                return Err(HandshakeError::InvalidDestination(dest.to_string()).into());
            }
            conn.send(Bytes::from_static(&SUCCESS)).await?;
            ctx.conns.set_mode(conn.id, ConnMode::Direct, &dest.to_string());
            tracing::debug!(conn = conn.id, client = %conn.peer, dest = %dest, "handshake: direct");
            direct::run(&ctx, &mut conn, dest, rest).await
        }
    }
}

async fn read_handshake(
    ctx: &RelayContext,
    conn: &mut ClientConn,
) -> Result<Established, HandshakeError> {
    let mut buf = BytesMut::new();
    loop {
        let Some(msg) = conn.recv().await else {
            return Err(HandshakeError::Closed);
        };
        buf.extend_from_slice(&msg);

        if let Some(est) = try_establish(&buf)? {
            return Ok(est);
        }
        if buf.len() > ctx.opts.max_handshake_bytes {
            return Err(HandshakeError::TooLarge(ctx.opts.max_handshake_bytes));
        }
    }
}

fn try_establish(buf: &[u8]) -> Result<Option<Established>, HandshakeError> {
    let Some(header) = parse_header(buf)? else {
        return Ok(None);
    };
    tracing::trace!(
        version = header.version,
        id = ?header.id,
        options = header.options.len(),
        "handshake: header"
    );
    let body = &buf[header.body_offset..];

    match header.mode {
        Mode::Multiplexed => Ok(Some(Established::Multiplexed {
            rest: Bytes::copy_from_slice(body),
        })),
        Mode::Direct(transport) => {
            let Some((mut dest, used)) = address::decode(body)? else {
                return Ok(None);
            };
            if dest.transport != transport {
                tracing::debug!(
                    command = %transport,
                    tagged = %dest.transport,
                    "handshake: address transport differs from command, using command"
                );
                dest.transport = transport;
            }
            Ok(Some(Established::Direct {
                dest,
                rest: Bytes::copy_from_slice(&body[used..]),
            }))
        }
    }
}
