use bytes::Bytes;
use tokio::sync::mpsc;

use crate::wstun::tunnel::{
    address::{Destination, Transport},
    conn::ClientConn,
    datagram::{self, DatagramReassembler},
    handshake::{RelayContext, RelayError},
    outbound::{Connector, ConnectorEvent},
};

const EVENT_QUEUE: usize = 64;

/// Relays one client connection to a single destination until either side closes.
///
/// TCP bytes pass through untouched. For UDP the client stream carries `u16be len` records: each
/// complete record becomes one datagram, and every datagram coming back is returned as records.
pub async fn run(
    ctx: &RelayContext,
    conn: &mut ClientConn,
    dest: Destination,
    initial: Bytes,
) -> Result<(), RelayError> {
    let (ev_tx, mut ev_rx) = mpsc::channel::<((), ConnectorEvent)>(EVENT_QUEUE);
    let transport = dest.transport;
    let mut connector = Connector::open(dest, ctx.opts.connector.clone(), (), ev_tx);
    let mut datagrams = DatagramReassembler::new();

    forward(&connector, transport, &mut datagrams, initial);

    let res = loop {
        tokio::select! {
            msg = conn.recv() => {
                let Some(data) = msg else {
                    tracing::debug!(
                        conn = conn.id,
                        partial_record = datagrams.pending(),
                        "direct: client closed"
                    );
                    break Ok(());
                };
                forward(&connector, transport, &mut datagrams, data);
            }
            ev = ev_rx.recv() => {
                match ev {
                    Some(((), ConnectorEvent::Data(data))) => {
                        let sent = match transport {
                            Transport::Tcp => conn.send(data).await,
                            Transport::Udp => send_records(conn, &data).await,
                        };
                        if let Err(err) = sent {
                            break Err(err.into());
                        }
                    }
                    Some(((), ConnectorEvent::Closed)) | None => {
                        tracing::debug!(conn = conn.id, "direct: destination closed");
                        conn.close().await;
                        break Ok(());
                    }
                }
            }
        }
    };

    connector.close();
    res
}

fn forward(
    connector: &Connector,
    transport: Transport,
    datagrams: &mut DatagramReassembler,
    data: Bytes,
) {
    match transport {
        Transport::Tcp => {
            if !data.is_empty() {
                connector.send(data);
            }
        }
        Transport::Udp => {
            datagrams.push(&data);
            while let Some(dgram) = datagrams.next_datagram() {
                connector.send(dgram);
            }
        }
    }
}

async fn send_records(
    conn: &ClientConn,
    data: &[u8],
) -> Result<(), crate::wstun::tunnel::conn::ClientClosed> {
    for rec in datagram::encode_records(data) {
        conn.send(rec).await?;
    }
    Ok(())
}
