use bytes::Bytes;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;

/// Something to deliver to the client over its message channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    Data(Bytes),
    Close,
}

#[derive(Debug, Error)]
#[error("client connection closed")]
pub struct ClientClosed;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnMode {
    Unestablished,
    Direct,
    Multiplexed,
}

/// The relay's view of one inbound client channel.
///
/// The transport (WebSocket, or plain channels in tests) feeds `inbound` with every message the
/// client sends and drains `outbound`. Dropping the inbound sender is how the transport reports
/// that the client went away.
#[derive(Debug)]
pub struct ClientConn {
    pub id: u64,
    pub peer: String,
    inbound: mpsc::Receiver<Bytes>,
    outbound: mpsc::Sender<ClientMessage>,
}

impl ClientConn {
    pub fn new(
        id: u64,
        peer: impl Into<String>,
        inbound: mpsc::Receiver<Bytes>,
        outbound: mpsc::Sender<ClientMessage>,
    ) -> Self {
        Self {
            id,
            peer: peer.into(),
            inbound,
            outbound,
        }
    }

    pub async fn recv(&mut self) -> Option<Bytes> {
        self.inbound.recv().await
    }

    pub async fn send(&self, data: Bytes) -> Result<(), ClientClosed> {
        self.outbound
            .send(ClientMessage::Data(data))
            .await
            .map_err(|_| ClientClosed)
    }

    /// Asks the transport to close the client side. Idempotent from the relay's point of view.
    pub async fn close(&self) {
        let _ = self.outbound.send(ClientMessage::Close).await;
    }
}
