use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Instant,
};

use tokio::sync::RwLock;

use crate::revtun::telemetry;
use crate::revtun::tunnel::{links::LinkTable, transport::MessageWriter};

#[derive(Debug, Clone, serde::Serialize)]
pub struct SessionSnapshot {
    pub id: String,
    pub remote: String,
    pub primary: bool,
    pub connections: usize,
    pub started_at_unix_ms: u64,
}

/// An authenticated control session as seen by public-connection workers.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub id: String,
    pub writer: MessageWriter,
    pub links: Arc<LinkTable>,
}

struct ControlSession {
    handle: SessionHandle,
    remote: String,
    started: Instant,
    started_at_unix_ms: u64,
}

struct State {
    sessions: HashMap<String, ControlSession>,
    primary: Option<String>,
}

/// Registry of authenticated control sessions.
///
/// Routing policy: the earliest authenticated live session receives every new public
/// connection. When it goes away, the oldest remaining session is promoted.
pub struct Manager {
    id_seq: AtomicU64,
    state: RwLock<State>,
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager").finish_non_exhaustive()
    }
}

impl Default for Manager {
    fn default() -> Self {
        Self::new()
    }
}

impl Manager {
    pub fn new() -> Self {
        Self {
            id_seq: AtomicU64::new(1),
            state: RwLock::new(State {
                sessions: HashMap::new(),
                primary: None,
            }),
        }
    }

    pub fn next_session_id(&self) -> String {
        let n = self.id_seq.fetch_add(1, Ordering::Relaxed);
        format!("c-{n}")
    }

    pub async fn register(
        &self,
        id: String,
        writer: MessageWriter,
        links: Arc<LinkTable>,
        remote: Option<SocketAddr>,
    ) -> anyhow::Result<()> {
        if id.trim().is_empty() {
            anyhow::bail!("tunnel: empty session id");
        }

        let sess = ControlSession {
            handle: SessionHandle {
                id: id.clone(),
                writer,
                links,
            },
            remote: remote.map(|a| a.to_string()).unwrap_or_default(),
            started: Instant::now(),
            started_at_unix_ms: telemetry::now_unix_ms(),
        };

        let mut st = self.state.write().await;
        if st.sessions.contains_key(&id) {
            anyhow::bail!("tunnel: duplicate session id {id}");
        }
        st.sessions.insert(id.clone(), sess);
        // First writer wins.
        if st.primary.is_none() {
            st.primary = Some(id);
        }
        let n = st.sessions.len();
        drop(st);

        metrics::gauge!("revtun_control_sessions").set(n as f64);
        Ok(())
    }

    /// Drops the session and closes every logical connection it carried.
    pub async fn unregister(&self, id: &str) {
        let mut st = self.state.write().await;
        let Some(old) = st.sessions.remove(id) else {
            return;
        };
        if st.primary.as_deref() == Some(id) {
            st.primary = None;
            promote_primary_locked(&mut st);
        }
        let n = st.sessions.len();
        drop(st);

        let closed = old.handle.links.close_all().await;
        old.handle.writer.close().await;
        if closed > 0 {
            tracing::debug!(session=%id, closed, "tunnel: abandoned logical connections");
        }

        metrics::gauge!("revtun_control_sessions").set(n as f64);
    }

    /// Picks the session that should carry a new public connection.
    pub async fn select(&self) -> Option<SessionHandle> {
        let st = self.state.read().await;
        let id = st.primary.as_ref()?;
        st.sessions.get(id).map(|s| s.handle.clone())
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.sessions.len()
    }

    pub async fn snapshot(&self) -> Vec<SessionSnapshot> {
        let handles: Vec<(SessionSnapshot, Arc<LinkTable>)> = {
            let st = self.state.read().await;
            st.sessions
                .values()
                .map(|s| {
                    (
                        SessionSnapshot {
                            id: s.handle.id.clone(),
                            remote: s.remote.clone(),
                            primary: st.primary.as_deref() == Some(s.handle.id.as_str()),
                            connections: 0,
                            started_at_unix_ms: s.started_at_unix_ms,
                        },
                        s.handle.links.clone(),
                    )
                })
                .collect()
        };

        let mut out = Vec::with_capacity(handles.len());
        for (mut snap, links) in handles {
            snap.connections = links.len().await;
            out.push(snap);
        }
        out.sort_by(|a, b| a.started_at_unix_ms.cmp(&b.started_at_unix_ms));
        out
    }
}

fn promote_primary_locked(st: &mut State) {
    // Choose the oldest live session.
    let chosen = st
        .sessions
        .values()
        .min_by_key(|s| s.started)
        .map(|s| s.handle.id.clone());
    st.primary = chosen;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::revtun::tunnel::transport;

    fn writer() -> MessageWriter {
        let (a, _b) = tokio::io::duplex(64);
        let (_rd, wr) = transport::split(Box::new(a), None);
        wr
    }

    #[tokio::test]
    async fn select_is_none_without_sessions() {
        let mgr = Manager::new();
        assert!(mgr.select().await.is_none());
        assert_eq!(mgr.len().await, 0);
    }

    #[tokio::test]
    async fn earliest_session_is_primary_and_next_oldest_is_promoted() {
        let mgr = Manager::new();

        let a = mgr.next_session_id();
        let b = mgr.next_session_id();
        let c = mgr.next_session_id();
        for id in [&a, &b, &c] {
            mgr.register(id.clone(), writer(), Arc::new(LinkTable::new()), None)
                .await
                .unwrap();
            // Distinct start instants.
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }

        assert_eq!(mgr.select().await.unwrap().id, a);

        // Removing a non-primary session keeps routing stable.
        mgr.unregister(&c).await;
        assert_eq!(mgr.select().await.unwrap().id, a);

        mgr.unregister(&a).await;
        assert_eq!(mgr.select().await.unwrap().id, b);

        let snap = mgr.snapshot().await;
        assert_eq!(snap.len(), 1);
        assert!(snap[0].primary);

        mgr.unregister(&b).await;
        assert!(mgr.select().await.is_none());
    }

    #[tokio::test]
    async fn unregister_closes_session_links() {
        let mgr = Manager::new();
        let links = Arc::new(LinkTable::new());
        let cid = crate::revtun::tunnel::protocol::ConnectionId::generate();
        let mut ends = links.insert(cid).await.unwrap();

        let id = mgr.next_session_id();
        mgr.register(id.clone(), writer(), links.clone(), None)
            .await
            .unwrap();
        mgr.unregister(&id).await;

        assert_eq!(links.len().await, 0);
        assert!(*ends.stop.borrow_and_update());
    }

    #[tokio::test]
    async fn duplicate_session_ids_are_rejected() {
        let mgr = Manager::new();
        mgr.register("c-9".into(), writer(), Arc::new(LinkTable::new()), None)
            .await
            .unwrap();
        assert!(
            mgr.register("c-9".into(), writer(), Arc::new(LinkTable::new()), None)
                .await
                .is_err()
        );
    }
}
