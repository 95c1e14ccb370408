use std::collections::HashMap;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::wstun::tunnel::{
    address::Destination,
    frame,
    outbound::{Connector, ConnectorEvent, ConnectorOptions},
};

/// Connector events are tagged with the stream id and the generation of the session that
/// produced them.
pub type SessionKey = (u16, u64);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("stream {0} is already open")]
    StreamInUse(u16),
    #[error("invalid destination {0}")]
    InvalidDestination(String),
}

#[derive(Debug)]
struct Session {
    generation: u64,
    connector: Connector,
}

/// Live sessions of one multiplexed client connection, keyed by stream id.
///
/// The registry is owned by the connection's task. Connectors report back through the shared
/// `events` channel; [`SessionRegistry::on_event`] turns those reports into frames for the client.
#[derive(Debug)]
pub struct SessionRegistry {
    conn_id: u64,
    next_generation: u64,
    sessions: HashMap<u16, Session>,
    opts: ConnectorOptions,
    events: mpsc::Sender<(SessionKey, ConnectorEvent)>,
}

impl SessionRegistry {
    pub fn new(
        conn_id: u64,
        opts: ConnectorOptions,
        events: mpsc::Sender<(SessionKey, ConnectorEvent)>,
    ) -> Self {
        Self {
            conn_id,
            next_generation: 1,
            sessions: HashMap::new(),
            opts,
            events,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn contains(&self, stream_id: u16) -> bool {
        self.sessions.contains_key(&stream_id)
    }

    /// Opens a session for `stream_id`. A stream id that is still live is rejected and the
    /// existing session is left as it is.
    pub fn open(
        &mut self,
        stream_id: u16,
        dest: Destination,
        initial: Option<Bytes>,
    ) -> Result<(), RegistryError> {
        if self.sessions.contains_key(&stream_id) {
            return Err(RegistryError::StreamInUse(stream_id));
        }
        if !dest.is_valid() {
            return Err(RegistryError::InvalidDestination(dest.to_string()));
        }

        let generation = self.next_generation;
        self.next_generation += 1;

        tracing::debug!(conn = self.conn_id, stream = stream_id, dest = %dest, "mux: open");
        let connector = Connector::open(
            dest,
            self.opts.clone(),
            (stream_id, generation),
            self.events.clone(),
        );
        if let Some(data) = initial {
            connector.send(data);
        }

        self.sessions.insert(
            stream_id,
            Session {
                generation,
                connector,
            },
        );
        Ok(())
    }

    /// Forwards `data` to the session's destination. Data for unknown streams is dropped.
    pub fn data(&mut self, stream_id: u16, data: Bytes) -> bool {
        match self.sessions.get(&stream_id) {
            Some(s) => s.connector.send(data),
            None => false,
        }
    }

    /// Sends `last` (if any), then closes and forgets the session.
    ///
    /// Returns the close frame to acknowledge the client with, or `None` for an unknown stream.
    /// The connector's own `Closed` report then belongs to a retired generation and is dropped.
    pub fn close(&mut self, stream_id: u16, last: Option<Bytes>) -> Option<Bytes> {
        let mut s = self.sessions.remove(&stream_id)?;
        if let Some(data) = last {
            s.connector.send(data);
        }
        s.connector.close();
        tracing::debug!(
            conn = self.conn_id,
            stream = stream_id,
            dest = %s.connector.destination(),
            "mux: closed by client"
        );
        Some(frame::close_frame(stream_id))
    }

    /// Turns a connector event into frames for the client.
    ///
    /// Events from sessions that are no longer registered (closed by the client, or replaced by
    /// a later open of the same stream id) produce nothing.
    pub fn on_event(&mut self, key: SessionKey, event: ConnectorEvent) -> Vec<Bytes> {
        let (stream_id, generation) = key;
        let current = self
            .sessions
            .get(&stream_id)
            .is_some_and(|s| s.generation == generation);
        if !current {
            return Vec::new();
        }

        match event {
            ConnectorEvent::Data(data) => frame::data_frames(stream_id, &data).collect(),
            ConnectorEvent::Closed => {
                self.sessions.remove(&stream_id);
                tracing::debug!(conn = self.conn_id, stream = stream_id, "mux: closed by destination");
                vec![frame::close_frame(stream_id)]
            }
        }
    }

    /// Closes every session. Used when the client connection goes away.
    pub fn close_all(&mut self) {
        if !self.sessions.is_empty() {
            tracing::debug!(conn = self.conn_id, sessions = self.sessions.len(), "mux: closing all sessions");
        }
        for (_, mut s) in self.sessions.drain() {
            s.connector.close();
        }
    }
}
