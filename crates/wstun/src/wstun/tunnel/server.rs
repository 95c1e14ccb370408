use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{mpsc, watch},
};
use tokio_tungstenite::tungstenite::{
    Message,
    handshake::server::{ErrorResponse, Request, Response},
    http::StatusCode,
};

use crate::wstun::tunnel::{
    conn::{ClientConn, ClientMessage},
    handshake::{self, RelayContext, RelayError},
};

const INBOUND_QUEUE: usize = 64;
const OUTBOUND_QUEUE: usize = 256;
const WRITER_DRAIN: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub listen_addr: SocketAddr,
    /// Only upgrade requests for this path; empty accepts any path.
    pub path: String,
    pub relay: Arc<RelayContext>,
}

/// WebSocket front end: accepts clients and hands each one to the relay.
pub struct Server {
    opts: ServerOptions,
    listener: TcpListener,
}

impl Server {
    pub async fn bind(opts: ServerOptions) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(opts.listen_addr)
            .await
            .with_context(|| format!("tunnel: bind {}", opts.listen_addr))?;
        Ok(Self { opts, listener })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn listen_and_serve(self, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        tracing::info!(
            addr = %self.local_addr()?,
            path = %self.opts.path,
            "tunnel: listening"
        );

        let mut shutdown = shutdown;
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(v) => v,
                        Err(err) => {
                            tracing::warn!(err = %err, "tunnel: accept failed");
                            continue;
                        }
                    };
                    let ctx = self.opts.relay.clone();
                    let path = self.opts.path.clone();
                    tokio::spawn(async move {
                        if let Err(err) = handle_client(ctx, stream, peer, path).await {
                            tracing::debug!(client = %peer, err = %err, "tunnel: upgrade failed");
                        }
                    });
                }
            }
        }

        tracing::info!("tunnel: listener stopped");
        Ok(())
    }
}

async fn handle_client(
    ctx: Arc<RelayContext>,
    stream: TcpStream,
    peer: SocketAddr,
    path: String,
) -> anyhow::Result<()> {
    let _ = stream.set_nodelay(true);

    let ws = if path.is_empty() {
        tokio_tungstenite::accept_async(stream).await?
    } else {
        let check = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            if req.uri().path() == path {
                Ok(resp)
            } else {
                let mut reject = ErrorResponse::new(None);
                *reject.status_mut() = StatusCode::NOT_FOUND;
                Err(reject)
            }
        };
        tokio_tungstenite::accept_hdr_async(stream, check).await?
    };

    let id = ctx.conns.next_id();
    ctx.conns.add(id, peer.to_string());
    metrics::counter!("wstun_connections_total").increment(1);
    metrics::gauge!("wstun_active_connections").increment(1.0);
    tracing::debug!(conn = id, client = %peer, "tunnel: client connected");

    let (mut sink, mut source) = ws.split();
    let (in_tx, in_rx) = mpsc::channel::<Bytes>(INBOUND_QUEUE);
    let (out_tx, mut out_rx) = mpsc::channel::<ClientMessage>(OUTBOUND_QUEUE);
    let conn = ClientConn::new(id, peer.to_string(), in_rx, out_tx);

    let writer = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            let res = match msg {
                ClientMessage::Data(data) => sink.send(Message::Binary(data.to_vec())).await,
                ClientMessage::Close => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            };
            if res.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut relay = tokio::spawn(handshake::serve(ctx.clone(), conn));
    let mut relay_done = false;

    loop {
        tokio::select! {
            res = &mut relay => {
                relay_done = true;
                log_relay_end(id, res);
                break;
            }
            msg = source.next() => {
                let data = match msg {
                    Some(Ok(Message::Binary(b))) => Bytes::from(b),
                    Some(Ok(Message::Text(t))) => Bytes::from(t.into_bytes()),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => {
                        tracing::debug!(conn = id, err = %err, "tunnel: read failed");
                        break;
                    }
                };
                if in_tx.send(data).await.is_err() {
                    break;
                }
            }
        }
    }

    drop(in_tx);
    if !relay_done {
        log_relay_end(id, relay.await);
    }
    if tokio::time::timeout(WRITER_DRAIN, writer).await.is_err() {
        tracing::debug!(conn = id, "tunnel: writer did not drain in time");
    }

    ctx.conns.remove(id);
    metrics::gauge!("wstun_active_connections").decrement(1.0);
    tracing::debug!(conn = id, client = %peer, "tunnel: client disconnected");
    Ok(())
}

fn log_relay_end(id: u64, res: Result<Result<(), RelayError>, tokio::task::JoinError>) {
    match res {
        Ok(Ok(())) => {}
        Ok(Err(err)) => tracing::debug!(conn = id, err = %err, "tunnel: relay ended with error"),
        Err(err) => tracing::warn!(conn = id, err = %err, "tunnel: relay task failed"),
    }
}

#[cfg(test)]
mod tests {
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };

    use super::*;
    use crate::wstun::tunnel::{
        address::ATYP_IPV4,
        handshake::{
            RelayOptions, SUCCESS,
            tests::{context, header},
        },
        resolver::SystemResolver,
    };

    async fn start(path: &str) -> (SocketAddr, Arc<RelayContext>, watch::Sender<bool>, tokio::task::JoinHandle<anyhow::Result<()>>) {
        let ctx = context(Arc::new(SystemResolver::new()), RelayOptions::default());
        let server = Server::bind(ServerOptions {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            path: path.to_string(),
            relay: ctx.clone(),
        })
        .await
        .unwrap();
        let addr = server.local_addr().unwrap();
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(server.listen_and_serve(rx));
        (addr, ctx, tx, task)
    }

    #[tokio::test]
    async fn direct_tcp_over_websocket() {
        let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = echo.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut s, _) = echo.accept().await.unwrap();
            let mut buf = [0u8; 64];
            loop {
                let n = s.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                s.write_all(&buf[..n]).await.unwrap();
            }
        });

        let (addr, ctx, _tx, _task) = start("/ws").await;
        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
            .await
            .unwrap();

        let mut hello = header(&[], 1);
        hello.push(1);
        hello.extend_from_slice(&port.to_be_bytes());
        hello.extend_from_slice(&[ATYP_IPV4, 127, 0, 0, 1]);
        hello.extend_from_slice(b"ping");
        ws.send(Message::Binary(hello)).await.unwrap();

        let mut got = Vec::new();
        while got.len() < 6 {
            match ws.next().await.unwrap().unwrap() {
                Message::Binary(b) => got.extend_from_slice(&b),
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(&got[..2], &SUCCESS);
        assert_eq!(&got[2..], b"ping");
        assert_eq!(ctx.conns.len(), 1);

        ws.close(None).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while !ctx.conns.is_empty() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn wrong_path_is_rejected() {
        let (addr, ctx, _tx, _task) = start("/ws").await;
        assert!(
            tokio_tungstenite::connect_async(format!("ws://{addr}/other"))
                .await
                .is_err()
        );
        assert!(ctx.conns.is_empty());
    }

    #[tokio::test]
    async fn stops_on_shutdown() {
        let (_addr, _ctx, tx, task) = start("").await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
