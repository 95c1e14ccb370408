//! Outbound connectors: one real TCP or UDP socket per session.
//!
//! A connector is a task owning the socket plus a handle used to feed it. Bytes sent through the
//! handle are queued in order and written once the socket is connected. Everything the socket
//! receives is reported to the owner as [`ConnectorEvent::Data`], followed by exactly one
//! [`ConnectorEvent::Closed`] when the task ends for any reason.

use std::{
    fmt,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
    time::Duration,
};

use bytes::Bytes;
use thiserror::Error;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpSocket, TcpStream, UdpSocket},
    sync::mpsc,
    time::{Instant, MissedTickBehavior},
};

use crate::wstun::tunnel::{
    address::{Destination, Host, Transport},
    frame::MAX_CHUNK,
};

const UDP_RECV_BUFFER: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("no address for {0}")]
    NoAddress(String),
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy)]
pub struct UdpIdlePolicy {
    pub timeout: Duration,
    pub check_interval: Duration,
}

impl Default for UdpIdlePolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            check_interval: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectorOptions {
    pub connect_timeout: Duration,
    pub read_buffer_size: usize,
    pub udp_idle: UdpIdlePolicy,
}

impl Default for ConnectorOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            read_buffer_size: 32 * 1024,
            udp_idle: UdpIdlePolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectorEvent {
    Data(Bytes),
    Closed,
}

/// Handle to a running connector task.
///
/// Dropping the handle has the same effect as [`Connector::close`].
///
/// The send queue is unbounded: bytes for a slow or still-connecting destination accumulate in
/// memory until written. There is no backpressure towards the client.
pub struct Connector {
    tx: Option<mpsc::UnboundedSender<Bytes>>,
    dest: Destination,
}

impl fmt::Debug for Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connector")
            .field("dest", &self.dest.to_string())
            .field("closed", &self.tx.is_none())
            .finish()
    }
}

impl Connector {
    /// Starts a connector for `dest`. Events are tagged with `key` so one owner can multiplex
    /// many connectors over a single channel.
    pub fn open<K>(
        dest: Destination,
        opts: ConnectorOptions,
        key: K,
        events: mpsc::Sender<(K, ConnectorEvent)>,
    ) -> Self
    where
        K: Clone + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel::<Bytes>();

        let task_dest = dest.clone();
        tokio::spawn(async move {
            let transport = task_dest.transport;
            metrics::counter!("wstun_sessions_total", "transport" => transport.name()).increment(1);
            metrics::gauge!("wstun_active_sessions").increment(1.0);

            let res = match transport {
                Transport::Tcp => run_tcp(&task_dest, &opts, key.clone(), &events, rx).await,
                Transport::Udp => run_udp(&task_dest, &opts, key.clone(), &events, rx).await,
            };

            metrics::gauge!("wstun_active_sessions").decrement(1.0);
            match res {
                Ok(()) => tracing::debug!(dest = %task_dest, "outbound: closed"),
                Err(err) => tracing::debug!(dest = %task_dest, err = %err, "outbound: closed with error"),
            }

            let _ = events.send((key, ConnectorEvent::Closed)).await;
        });

        Self { tx: Some(tx), dest }
    }

    pub fn destination(&self) -> &Destination {
        &self.dest
    }

    /// Queues `data` for the destination. Returns false once the connector is closed.
    pub fn send(&self, data: Bytes) -> bool {
        match &self.tx {
            Some(tx) => tx.send(data).is_ok(),
            None => false,
        }
    }

    /// Closes the connector after already queued bytes are flushed.
    pub fn close(&mut self) {
        self.tx.take();
    }
}

async fn socket_addr(dest: &Destination) -> Result<SocketAddr, ConnectorError> {
    match &dest.host {
        Host::Ip(ip) => Ok(SocketAddr::new(*ip, dest.port)),
        Host::Domain(name) => tokio::net::lookup_host((name.as_str(), dest.port))
            .await?
            .next()
            .ok_or_else(|| ConnectorError::NoAddress(name.clone())),
    }
}

async fn connect_tcp(addr: SocketAddr) -> std::io::Result<TcpStream> {
    let sock = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    sock.set_keepalive(true)?;
    let stream = sock.connect(addr).await?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

async fn run_tcp<K: Clone>(
    dest: &Destination,
    opts: &ConnectorOptions,
    key: K,
    events: &mpsc::Sender<(K, ConnectorEvent)>,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
) -> Result<(), ConnectorError> {
    let addr = socket_addr(dest).await?;
    let stream = tokio::time::timeout(opts.connect_timeout, connect_tcp(addr))
        .await
        .map_err(|_| ConnectorError::ConnectTimeout(opts.connect_timeout))??;
    tracing::debug!(dest = %dest, addr = %addr, "outbound: tcp connected");

    let (mut rd, mut wr) = stream.into_split();
    let mut buf = vec![0u8; opts.read_buffer_size.max(1024)];

    loop {
        tokio::select! {
            msg = rx.recv() => {
                let Some(data) = msg else {
                    break;
                };
                wr.write_all(&data).await?;
                metrics::counter!("wstun_bytes_egress_total").increment(data.len() as u64);
            }
            res = rd.read(&mut buf) => {
                let n = res?;
                if n == 0 {
                    break;
                }
                metrics::counter!("wstun_bytes_ingress_total").increment(n as u64);
                let chunk = Bytes::copy_from_slice(&buf[..n]);
                if events.send((key.clone(), ConnectorEvent::Data(chunk))).await.is_err() {
                    break;
                }
            }
        }
    }

    let _ = wr.shutdown().await;
    Ok(())
}

async fn run_udp<K: Clone>(
    dest: &Destination,
    opts: &ConnectorOptions,
    key: K,
    events: &mpsc::Sender<(K, ConnectorEvent)>,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
) -> Result<(), ConnectorError> {
    let addr = socket_addr(dest).await?;
    let bind: SocketAddr = if addr.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    // Unconnected: any source may reply, and ICMP errors never end the session.
    let sock = UdpSocket::bind(bind).await?;
    tracing::debug!(dest = %dest, addr = %addr, local = ?sock.local_addr().ok(), "outbound: udp ready");

    let idle = opts.udp_idle;
    let mut tick = tokio::time::interval(idle.check_interval.max(Duration::from_millis(10)));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_activity = Instant::now();
    let mut buf = vec![0u8; UDP_RECV_BUFFER];

    loop {
        tokio::select! {
            msg = rx.recv() => {
                let Some(data) = msg else {
                    break;
                };
                last_activity = Instant::now();
                match sock.send_to(&data, addr).await {
                    Ok(n) => metrics::counter!("wstun_bytes_egress_total").increment(n as u64),
                    Err(err) => tracing::debug!(dest = %dest, err = %err, "outbound: udp send failed"),
                }
            }
            res = sock.recv_from(&mut buf) => {
                let n = match res {
                    Ok((n, _from)) => n,
                    Err(err) => {
                        tracing::debug!(dest = %dest, err = %err, "outbound: udp recv failed");
                        continue;
                    }
                };
                last_activity = Instant::now();
                metrics::counter!("wstun_bytes_ingress_total").increment(n as u64);
                for chunk in buf[..n].chunks(MAX_CHUNK) {
                    let chunk = Bytes::copy_from_slice(chunk);
                    if events.send((key.clone(), ConnectorEvent::Data(chunk))).await.is_err() {
                        return Ok(());
                    }
                }
            }
            _ = tick.tick() => {
                if last_activity.elapsed() >= idle.timeout {
                    tracing::debug!(dest = %dest, idle = ?idle.timeout, "outbound: udp idle timeout");
                    break;
                }
            }
        }
    }

    Ok(())
}
