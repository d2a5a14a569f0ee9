use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::Context;
use dashmap::DashMap;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Serialize;

/// Installs a Prometheus recorder for the `metrics` crate and returns a handle used to render
/// the exposition format.
///
/// This should be called once per process at startup.
pub fn init_prometheus() -> anyhow::Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .context("metrics: install Prometheus recorder")
}

/// A live logical connection, as reported on the admin endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ConnInfo {
    pub id: String,
    pub side: &'static str,
    /// Tunnel name (server side only).
    pub tunnel: String,
    /// Public peer (server) or local service address (client).
    pub peer: String,
    pub local_port: u16,
    pub started_at_unix_ms: u64,
}

#[derive(Debug, Default)]
pub struct ConnRegistry {
    conns: DashMap<String, ConnInfo>,
}

impl ConnRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, c: ConnInfo) {
        metrics::counter!("revtun_connections_opened_total", "side" => c.side).increment(1);
        self.conns.insert(c.id.clone(), c);
    }

    pub fn remove(&self, id: &str) {
        if let Some((_, c)) = self.conns.remove(id) {
            metrics::counter!("revtun_connections_closed_total", "side" => c.side).increment(1);
        }
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn snapshot(&self) -> Vec<ConnInfo> {
        let mut out = Vec::with_capacity(self.conns.len());
        for c in self.conns.iter() {
            out.push(c.value().clone());
        }
        out.sort_by(|a, b| a.started_at_unix_ms.cmp(&b.started_at_unix_ms));
        out
    }
}

pub fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub type SharedPrometheusHandle = Arc<PrometheusHandle>;
