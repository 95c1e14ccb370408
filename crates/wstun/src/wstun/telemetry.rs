use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::Context;
use dashmap::DashMap;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Serialize;

use crate::wstun::tunnel::conn::ConnMode;

/// Installs a Prometheus recorder for the `metrics` crate and returns a handle used to render
/// the exposition format.
///
/// This should be called once per process at startup.
pub fn init_prometheus() -> anyhow::Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .context("metrics: install Prometheus recorder")
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub id: u64,
    pub peer: String,
    pub mode: ConnMode,
    /// Set for direct connections only.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub destination: String,
    pub started_at_unix_ms: u64,
}

/// Live client connections, for the admin API.
#[derive(Debug)]
pub struct ConnectionRegistry {
    next_id: AtomicU64,
    conns: DashMap<u64, ConnectionInfo>,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            conns: DashMap::new(),
        }
    }

    /// Allocates a connection id, unique for the process lifetime.
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn add(&self, id: u64, peer: impl Into<String>) {
        self.conns.insert(
            id,
            ConnectionInfo {
                id,
                peer: peer.into(),
                mode: ConnMode::Unestablished,
                destination: String::new(),
                started_at_unix_ms: now_unix_ms(),
            },
        );
    }

    pub fn set_mode(&self, id: u64, mode: ConnMode, destination: &str) {
        if let Some(mut c) = self.conns.get_mut(&id) {
            c.mode = mode;
            c.destination = destination.to_string();
        }
    }

    pub fn remove(&self, id: u64) {
        self.conns.remove(&id);
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    pub fn snapshot(&self) -> Vec<ConnectionInfo> {
        let mut out: Vec<ConnectionInfo> = self.conns.iter().map(|c| c.value().clone()).collect();
        out.sort_by_key(|c| (c.started_at_unix_ms, c.id));
        out
    }
}

pub fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub type SharedConnections = Arc<ConnectionRegistry>;
