//! Per-session table of logical connections.
//!
//! Each entry owns the queue feeding that connection's single socket writer and a
//! stop signal for its socket reader. Removing an entry is the only way a logical
//! connection dies, and `remove` reports whether the caller was the one that did
//! it, which keeps teardown (and the `Close` notification) exactly-once.

use std::collections::HashMap;

use bytes::Bytes;
use tokio::sync::{RwLock, mpsc, watch};

use crate::revtun::tunnel::protocol::ConnectionId;

/// Chunks a connection may have queued for its socket before `deliver` waits.
///
/// Once full, the dispatch loop stops reading the control connection, so a
/// socket that does not drain pushes back on the peer through TCP.
pub const LINK_QUEUE_CHUNKS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// No such connection (never opened or already closed).
    Unknown,
}

struct Link {
    tx: mpsc::Sender<Bytes>,
    stop: watch::Sender<bool>,
}

/// Handles given to the relay worker that owns one logical connection.
pub struct LinkEnds {
    pub id: ConnectionId,
    /// Chunks to write to the physical socket, in arrival order.
    pub rx: mpsc::Receiver<Bytes>,
    /// Flips to `true` (or closes) when the connection is removed from the table.
    pub stop: watch::Receiver<bool>,
}

#[derive(Default)]
pub struct LinkTable {
    links: RwLock<HashMap<ConnectionId, Link>>,
}

impl std::fmt::Debug for LinkTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkTable").finish_non_exhaustive()
    }
}

impl LinkTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new logical connection. Returns `None` if the id is already in use.
    ///
    /// The entry exists before its socket does; chunks delivered meanwhile wait in the queue.
    pub async fn insert(&self, id: ConnectionId) -> Option<LinkEnds> {
        let mut links = self.links.write().await;
        if links.contains_key(&id) {
            return None;
        }
        let (tx, rx) = mpsc::channel(LINK_QUEUE_CHUNKS);
        let (stop_tx, stop_rx) = watch::channel(false);
        links.insert(
            id.clone(),
            Link {
                tx,
                stop: stop_tx,
            },
        );
        Some(LinkEnds {
            id,
            rx,
            stop: stop_rx,
        })
    }

    /// Queues a chunk for the connection's writer, waiting while its queue is full.
    ///
    /// The table lock is not held while waiting.
    pub async fn deliver(&self, id: &ConnectionId, payload: Bytes) -> Delivery {
        let tx = {
            let links = self.links.read().await;
            match links.get(id) {
                Some(link) => link.tx.clone(),
                None => return Delivery::Unknown,
            }
        };
        if tx.send(payload).await.is_err() {
            // Writer already gone; the worker is tearing the entry down.
            return Delivery::Unknown;
        }
        Delivery::Queued
    }

    /// Whether the connection is still registered (not closed by either side).
    pub async fn is_open(&self, id: &ConnectionId) -> bool {
        self.links.read().await.contains_key(id)
    }

    /// Removes the connection and signals its reader to stop.
    ///
    /// Returns `true` only for the caller that actually removed the entry.
    pub async fn remove(&self, id: &ConnectionId) -> bool {
        let removed = self.links.write().await.remove(id);
        match removed {
            Some(link) => {
                let _ = link.stop.send(true);
                true
            }
            None => false,
        }
    }

    /// Removes every connection; used when the owning control session ends.
    pub async fn close_all(&self) -> usize {
        let drained: Vec<Link> = {
            let mut links = self.links.write().await;
            links.drain().map(|(_, l)| l).collect()
        };
        for link in &drained {
            let _ = link.stop.send(true);
        }
        drained.len()
    }

    pub async fn len(&self) -> usize {
        self.links.read().await.len()
    }
}
