use bytes::{Buf, Bytes, BytesMut};
use tokio::sync::mpsc;

use crate::wstun::tunnel::{
    address,
    conn::ClientConn,
    frame::{self, Command, Decoded, Frame},
    handshake::{RelayContext, RelayError},
    outbound::ConnectorEvent,
    resolver,
    session::{SessionKey, SessionRegistry},
};

const EVENT_QUEUE: usize = 256;

/// Runs the multiplexed relay until the client goes away.
///
/// `residual` holds whatever followed the handshake header and is decoded before any new message.
pub async fn run(
    ctx: &RelayContext,
    conn: &mut ClientConn,
    residual: Bytes,
) -> Result<(), RelayError> {
    let (ev_tx, mut ev_rx) = mpsc::channel::<(SessionKey, ConnectorEvent)>(EVENT_QUEUE);
    let mut registry = SessionRegistry::new(conn.id, ctx.opts.connector.clone(), ev_tx);
    let mut buf = BytesMut::from(&residual[..]);

    let res = relay(ctx, conn, &mut registry, &mut buf, &mut ev_rx).await;
    registry.close_all();
    res
}

async fn relay(
    ctx: &RelayContext,
    conn: &mut ClientConn,
    registry: &mut SessionRegistry,
    buf: &mut BytesMut,
    events: &mut mpsc::Receiver<(SessionKey, ConnectorEvent)>,
) -> Result<(), RelayError> {
    process(ctx, conn, registry, buf).await?;
    loop {
        tokio::select! {
            msg = conn.recv() => {
                let Some(data) = msg else {
                    tracing::debug!(conn = conn.id, sessions = registry.len(), "mux: client closed");
                    return Ok(());
                };
                buf.extend_from_slice(&data);
                process(ctx, conn, registry, buf).await?;
            }
            // The registry holds a sender, so this never yields None while it lives.
            Some((key, ev)) = events.recv() => {
                for out in registry.on_event(key, ev) {
                    conn.send(out).await?;
                }
            }
        }
    }
}

/// Decodes and applies every complete frame in `buf`, keeping a trailing partial frame.
async fn process(
    ctx: &RelayContext,
    conn: &ClientConn,
    registry: &mut SessionRegistry,
    buf: &mut BytesMut,
) -> Result<(), RelayError> {
    loop {
        match frame::decode(&buf[..]) {
            Decoded::Incomplete => return Ok(()),
            Decoded::Skip { consumed, err } => {
                tracing::warn!(conn = conn.id, err = %err, "mux: skipping malformed frame");
                buf.advance(consumed);
            }
            Decoded::Frame { frame, consumed } => {
                buf.advance(consumed);
                apply(ctx, conn, registry, frame).await?;
            }
        }
    }
}

async fn apply(
    ctx: &RelayContext,
    conn: &ClientConn,
    registry: &mut SessionRegistry,
    frame: Frame,
) -> Result<(), RelayError> {
    let sid = frame.stream_id;
    match frame.command {
        Command::Open => {
            if registry.contains(sid) {
                tracing::warn!(conn = conn.id, stream = sid, "mux: open for a live stream ignored");
                return Ok(());
            }

            let dest = match address::decode(&frame.args) {
                Ok(Some((dest, _))) => dest,
                Ok(None) => {
                    tracing::debug!(conn = conn.id, stream = sid, "mux: truncated open");
                    return conn.send(frame::close_frame(sid)).await.map_err(Into::into);
                }
                Err(err) => {
                    tracing::debug!(conn = conn.id, stream = sid, err = %err, "mux: bad open");
                    return conn.send(frame::close_frame(sid)).await.map_err(Into::into);
                }
            };

            let dest = resolver::resolve(ctx.resolver.as_ref(), dest).await;
            if let Err(err) = registry.open(sid, dest, frame.extra) {
                tracing::debug!(conn = conn.id, stream = sid, err = %err, "mux: open rejected");
                conn.send(frame::close_frame(sid)).await?;
            }
        }
        Command::Data => {
            if let Some(data) = frame.extra {
                if !registry.data(sid, data) {
                    tracing::trace!(conn = conn.id, stream = sid, "mux: data for unknown stream dropped");
                }
            }
        }
        Command::Close => {
            if let Some(ack) = registry.close(sid, frame.extra) {
                conn.send(ack).await?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{
        net::{IpAddr, Ipv4Addr, Ipv6Addr},
        sync::Arc,
        time::Duration,
    };

    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };

    use super::*;
    use crate::wstun::tunnel::{
        address::{Destination, Host, Transport},
        conn::ClientMessage,
        handshake::{
            self, RelayOptions, SUCCESS,
            tests::{client_pair, context, header, next_message},
        },
        resolver::{SystemResolver, tests::StaticResolver},
    };

    const CMD_MUX: u8 = 3;

    fn open(sid: u16, dest: &Destination, extra: Option<&[u8]>) -> Bytes {
        frame::encode_open(sid, dest, extra).unwrap()
    }

    fn data(sid: u16, payload: &[u8]) -> Bytes {
        frame::encode(sid, Command::Data, Some(payload)).unwrap()
    }

    fn local(port: u16) -> Destination {
        Destination::new(Transport::Tcp, Host::Ip(IpAddr::V4(Ipv4Addr::LOCALHOST)), port)
    }

    fn decode_one(msg: ClientMessage) -> Frame {
        let ClientMessage::Data(bytes) = msg else {
            panic!("expected data, got close");
        };
        match frame::decode(&bytes) {
            Decoded::Frame { frame, consumed } => {
                assert_eq!(consumed, bytes.len());
                frame
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn open_to_aaaa_only_domain_then_close() {
        let Ok(ln) = TcpListener::bind("[::1]:0").await else {
            eprintln!("skipping: no IPv6 loopback");
            return;
        };
        let port = ln.local_addr().unwrap().port();

        let mut r = StaticResolver::default();
        r.aaaa.insert("example.com".into(), vec![Ipv6Addr::LOCALHOST]);
        let ctx = context(Arc::new(r), RelayOptions::default());
        let (conn, in_tx, mut out_rx) = client_pair(&ctx);
        let task = tokio::spawn(handshake::serve(ctx.clone(), conn));

        in_tx.send(Bytes::from(header(&[], CMD_MUX))).await.unwrap();
        // Header alone is shorter than the minimum; the open frame completes it.
        let dest = Destination::new(Transport::Tcp, Host::Domain("example.com".into()), port);
        in_tx.send(open(7, &dest, None)).await.unwrap();
        assert_eq!(
            next_message(&mut out_rx).await,
            ClientMessage::Data(Bytes::from_static(&SUCCESS))
        );

        let (mut peer, from) = ln.accept().await.unwrap();
        assert!(from.is_ipv6());

        in_tx.send(data(7, b"hello ")).await.unwrap();
        in_tx.send(data(7, b"world")).await.unwrap();
        let mut got = [0u8; 11];
        peer.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"hello world");

        peer.write_all(b"back").await.unwrap();
        let f = decode_one(next_message(&mut out_rx).await);
        assert_eq!((f.stream_id, f.command), (7, Command::Data));
        assert_eq!(f.extra.as_deref(), Some(&b"back"[..]));

        in_tx
            .send(frame::encode(7, Command::Close, None).unwrap())
            .await
            .unwrap();
        in_tx.send(data(7, b"ignored")).await.unwrap();

        let mut rest = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), peer.read_to_end(&mut rest))
            .await
            .unwrap()
            .unwrap();
        assert!(rest.is_empty());

        // The close is acknowledged exactly once, even after the connector reports its own close.
        let f = decode_one(next_message(&mut out_rx).await);
        assert_eq!((f.stream_id, f.command, f.extra), (7, Command::Close, None));
        assert!(
            tokio::time::timeout(Duration::from_millis(200), out_rx.recv())
                .await
                .is_err()
        );

        drop(in_tx);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn invalid_open_gets_close_frame_and_connection_survives() {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = ln.local_addr().unwrap().port();

        let ctx = context(Arc::new(SystemResolver::new()), RelayOptions::default());
        let (conn, in_tx, mut out_rx) = client_pair(&ctx);
        let _task = tokio::spawn(handshake::serve(ctx.clone(), conn));

        let mut hello = header(&[], CMD_MUX);
        hello.extend_from_slice(&open(1, &local(0), None));
        in_tx.send(Bytes::from(hello)).await.unwrap();
        assert_eq!(
            next_message(&mut out_rx).await,
            ClientMessage::Data(Bytes::from_static(&SUCCESS))
        );

        let f = decode_one(next_message(&mut out_rx).await);
        assert_eq!((f.stream_id, f.command, f.extra), (1, Command::Close, None));

        // Unknown address type inside an open.
        let bad = frame::encode(2, Command::Open, None).unwrap();
        let mut raw = bad.to_vec();
        raw[1] += 4;
        raw.extend_from_slice(&[1, 0, 80, 9]);
        in_tx.send(Bytes::from(raw)).await.unwrap();
        let f = decode_one(next_message(&mut out_rx).await);
        assert_eq!((f.stream_id, f.command), (2, Command::Close));

        in_tx.send(open(3, &local(port), Some(b"ok"))).await.unwrap();
        let (mut peer, _) = ln.accept().await.unwrap();
        let mut got = [0u8; 2];
        peer.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"ok");
    }

    #[tokio::test]
    async fn frames_after_header_are_replayed_and_split_frames_reassembled() {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = ln.local_addr().unwrap().port();

        let ctx = context(Arc::new(SystemResolver::new()), RelayOptions::default());
        let (conn, in_tx, mut out_rx) = client_pair(&ctx);
        let _task = tokio::spawn(handshake::serve(ctx.clone(), conn));

        let mut wire = header(&[], CMD_MUX);
        wire.extend_from_slice(&open(4, &local(port), Some(b"a")));
        // A malformed frame (meta of 2 bytes) is skipped without disturbing the stream.
        wire.extend_from_slice(&[0, 2, 0xff, 0xff]);
        wire.extend_from_slice(&data(4, b"bc"));
        let tail = wire.split_off(wire.len() - 3);
        in_tx.send(Bytes::from(wire)).await.unwrap();
        assert_eq!(
            next_message(&mut out_rx).await,
            ClientMessage::Data(Bytes::from_static(&SUCCESS))
        );
        in_tx.send(Bytes::from(tail)).await.unwrap();

        let (mut peer, _) = ln.accept().await.unwrap();
        let mut got = [0u8; 3];
        peer.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"abc");
    }

    #[tokio::test]
    async fn destination_close_sends_close_frame_and_stream_can_reopen() {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = ln.local_addr().unwrap().port();

        let ctx = context(Arc::new(SystemResolver::new()), RelayOptions::default());
        let (conn, in_tx, mut out_rx) = client_pair(&ctx);
        let _task = tokio::spawn(handshake::serve(ctx.clone(), conn));

        let mut hello = header(&[], CMD_MUX);
        hello.extend_from_slice(&open(9, &local(port), None));
        in_tx.send(Bytes::from(hello)).await.unwrap();
        assert_eq!(
            next_message(&mut out_rx).await,
            ClientMessage::Data(Bytes::from_static(&SUCCESS))
        );

        let (peer, _) = ln.accept().await.unwrap();
        drop(peer);
        let f = decode_one(next_message(&mut out_rx).await);
        assert_eq!((f.stream_id, f.command), (9, Command::Close));

        in_tx.send(open(9, &local(port), Some(b"again"))).await.unwrap();
        let (mut peer, _) = ln.accept().await.unwrap();
        let mut got = [0u8; 5];
        peer.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"again");
    }

    #[tokio::test]
    async fn duplicate_open_keeps_first_session() {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = ln.local_addr().unwrap().port();

        let ctx = context(Arc::new(SystemResolver::new()), RelayOptions::default());
        let (conn, in_tx, mut out_rx) = client_pair(&ctx);
        let _task = tokio::spawn(handshake::serve(ctx.clone(), conn));

        let mut hello = header(&[], CMD_MUX);
        hello.extend_from_slice(&open(5, &local(port), Some(b"1")));
        in_tx.send(Bytes::from(hello)).await.unwrap();
        assert_eq!(
            next_message(&mut out_rx).await,
            ClientMessage::Data(Bytes::from_static(&SUCCESS))
        );
        let (mut peer, _) = ln.accept().await.unwrap();

        in_tx.send(open(5, &local(port), Some(b"x"))).await.unwrap();
        in_tx.send(data(5, b"2")).await.unwrap();

        let mut got = [0u8; 2];
        peer.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"12");
        assert!(
            tokio::time::timeout(Duration::from_millis(200), ln.accept())
                .await
                .is_err()
        );
        assert!(
            tokio::time::timeout(Duration::from_millis(100), out_rx.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn client_close_closes_every_session() {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = ln.local_addr().unwrap().port();

        let ctx = context(Arc::new(SystemResolver::new()), RelayOptions::default());
        let (conn, in_tx, mut out_rx) = client_pair(&ctx);
        let task = tokio::spawn(handshake::serve(ctx.clone(), conn));

        let mut hello = header(&[], CMD_MUX);
        hello.extend_from_slice(&open(1, &local(port), None));
        hello.extend_from_slice(&open(2, &local(port), None));
        in_tx.send(Bytes::from(hello)).await.unwrap();
        assert_eq!(
            next_message(&mut out_rx).await,
            ClientMessage::Data(Bytes::from_static(&SUCCESS))
        );
        let (mut a, _) = ln.accept().await.unwrap();
        let (mut b, _) = ln.accept().await.unwrap();

        drop(in_tx);
        task.await.unwrap().unwrap();

        let mut sink = Vec::new();
        a.read_to_end(&mut sink).await.unwrap();
        b.read_to_end(&mut sink).await.unwrap();
        assert!(sink.is_empty());
    }
}
