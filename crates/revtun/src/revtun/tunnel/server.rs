use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use subtle::ConstantTimeEq;
use tokio::net::{TcpListener, TcpStream};

use crate::revtun::config::Tunnel;
use crate::revtun::net;
use crate::revtun::telemetry::{self, ConnRegistry};
use crate::revtun::tunnel::{
    links::{Delivery, LinkTable},
    manager::Manager,
    protocol::{ConnectionId, Message, ProtocolError},
    relay::{self, Side},
    transport::{self, MessageReader},
};

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub host: String,
    pub control_port: u16,
    pub secret: String,
    pub tunnels: Vec<Tunnel>,
    pub auth_timeout: Duration,
    pub manager: Arc<Manager>,
    pub conns: Arc<ConnRegistry>,
}

pub struct Server {
    opts: ServerOptions,
}

/// A server with every socket bound, ready to serve.
pub struct Listening {
    opts: ServerOptions,
    control: TcpListener,
    tunnels: Vec<(Tunnel, TcpListener)>,
}

impl Server {
    pub fn new(mut opts: ServerOptions) -> anyhow::Result<Self> {
        if opts.secret.is_empty() {
            anyhow::bail!("tunnel: server secret is required");
        }
        if opts.auth_timeout <= Duration::from_millis(0) {
            opts.auth_timeout = Duration::from_secs(10);
        }
        Ok(Self { opts })
    }

    pub async fn bind(&self) -> anyhow::Result<Listening> {
        let control_addr = net::join_host_port(&self.opts.host, self.opts.control_port);
        let control = TcpListener::bind(&control_addr)
            .await
            .with_context(|| format!("tunnel: bind control {control_addr}"))?;

        let mut tunnels = Vec::with_capacity(self.opts.tunnels.len());
        for t in &self.opts.tunnels {
            let addr = net::join_host_port(&self.opts.host, t.server_port);
            let ln = TcpListener::bind(&addr)
                .await
                .with_context(|| format!("tunnel: bind {} on {addr}", t.name))?;
            tunnels.push((t.clone(), ln));
        }

        Ok(Listening {
            opts: self.opts.clone(),
            control,
            tunnels,
        })
    }
}

impl Listening {
    pub fn control_addr(&self) -> Option<SocketAddr> {
        self.control.local_addr().ok()
    }

    pub fn tunnel_addr(&self, name: &str) -> Option<SocketAddr> {
        self.tunnels
            .iter()
            .find(|(t, _)| t.name == name)
            .and_then(|(_, ln)| ln.local_addr().ok())
    }

    pub async fn serve(self, shutdown: tokio::sync::watch::Receiver<bool>) -> anyhow::Result<()> {
        let Listening {
            opts,
            control,
            tunnels,
        } = self;

        let mut tasks = tokio::task::JoinSet::new();
        for (t, ln) in tunnels {
            tracing::info!(
                tunnel=%t.name,
                addr=?ln.local_addr().ok(),
                client_port=t.client_port,
                "tunnel: public listener ready"
            );
            let mgr = opts.manager.clone();
            let conns = opts.conns.clone();
            let shutdown = shutdown.clone();
            tasks.spawn(async move { run_tunnel_listener(ln, t, mgr, conns, shutdown).await });
        }

        tracing::info!(addr=?control.local_addr().ok(), "tunnel: control listening");
        run_control_listener(control, &opts, shutdown).await;

        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
        Ok(())
    }
}

async fn run_control_listener(
    ln: TcpListener,
    opts: &ServerOptions,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            res = shutdown.changed() => {
                if res.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            res = ln.accept() => {
                let (c, peer) = match res {
                    Ok(v) => v,
                    Err(err) => {
                        tracing::warn!(err=%err, "tunnel: control accept failed");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        continue;
                    }
                };
                let mgr = opts.manager.clone();
                let secret = opts.secret.clone();
                let auth_timeout = opts.auth_timeout;
                tokio::spawn(async move {
                    if let Err(err) = handle_control(mgr, c, peer, secret, auth_timeout).await {
                        tracing::warn!(client=%peer, err=%format!("{err:#}"), "tunnel: session ended with error");
                    }
                });
            }
        }
    }
}

fn secret_matches(got: &str, want: &str) -> bool {
    got.as_bytes().ct_eq(want.as_bytes()).into()
}

async fn handle_control(
    mgr: Arc<Manager>,
    c: TcpStream,
    peer: SocketAddr,
    secret: String,
    auth_timeout: Duration,
) -> anyhow::Result<()> {
    let (mut rd, wr) = transport::split_tcp(c);

    // First message must be auth.
    let rejected = match tokio::time::timeout(auth_timeout, rd.recv()).await {
        Err(_) => Some("timeout"),
        Ok(Err(_)) => Some("malformed"),
        Ok(Ok(Message::Auth { secret: got })) => {
            if secret_matches(&got, &secret) {
                None
            } else {
                Some("bad_secret")
            }
        }
        Ok(Ok(_)) => Some("not_auth"),
    };
    if let Some(reason) = rejected {
        tracing::warn!(client=%peer, reason, "tunnel: auth rejected");
        metrics::counter!("revtun_auth_failures_total", "reason" => reason).increment(1);
        wr.close().await;
        return Ok(());
    }

    let sid = mgr.next_session_id();
    let links = Arc::new(LinkTable::new());
    mgr.register(sid.clone(), wr, links.clone(), Some(peer))
        .await?;
    tracing::info!(session=%sid, client=%peer, "tunnel: client connected");

    let res = dispatch(&mut rd, &links, &sid).await;

    mgr.unregister(&sid).await;
    tracing::info!(session=%sid, client=%peer, "tunnel: client disconnected");
    res
}

/// Applies client messages to this session's logical connections until the transport fails.
async fn dispatch(rd: &mut MessageReader, links: &LinkTable, sid: &str) -> anyhow::Result<()> {
    loop {
        let msg = match rd.recv().await {
            Ok(m) => m,
            Err(ProtocolError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Ok(());
            }
            Err(err) => return Err(anyhow::Error::new(err).context("tunnel: control receive failed")),
        };

        match msg {
            Message::Data {
                connection_id,
                payload,
            } => {
                if links.deliver(&connection_id, payload).await == Delivery::Unknown {
                    tracing::debug!(session=%sid, conn=%connection_id, "tunnel: data for unknown connection dropped");
                }
            }
            Message::Close { connection_id } => {
                if links.remove(&connection_id).await {
                    tracing::debug!(session=%sid, conn=%connection_id, "tunnel: closed by client");
                }
            }
            other => {
                tracing::debug!(session=%sid, kind=other.kind_name(), "tunnel: unexpected message ignored");
            }
        }
    }
}

async fn run_tunnel_listener(
    ln: TcpListener,
    tunnel: Tunnel,
    mgr: Arc<Manager>,
    conns: Arc<ConnRegistry>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let tunnel = Arc::new(tunnel);
    loop {
        tokio::select! {
            res = shutdown.changed() => {
                if res.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            res = ln.accept() => {
                let (c, peer) = match res {
                    Ok(v) => v,
                    Err(err) => {
                        tracing::warn!(tunnel=%tunnel.name, err=%err, "tunnel: public accept failed");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        continue;
                    }
                };
                let mgr = mgr.clone();
                let conns = conns.clone();
                let tunnel = tunnel.clone();
                tokio::spawn(async move {
                    handle_public_conn(mgr, conns, &tunnel, c, peer).await;
                });
            }
        }
    }
}

async fn handle_public_conn(
    mgr: Arc<Manager>,
    conns: Arc<ConnRegistry>,
    tunnel: &Tunnel,
    c: TcpStream,
    peer: SocketAddr,
) {
    let Some(sess) = mgr.select().await else {
        tracing::debug!(tunnel=%tunnel.name, client=%peer, "tunnel: no client connected; dropping");
        metrics::counter!("revtun_public_rejected_total").increment(1);
        return;
    };

    let ends = loop {
        if let Some(ends) = sess.links.insert(ConnectionId::generate()).await {
            break ends;
        }
    };
    let id = ends.id.clone();

    let open = Message::TunnelOpen {
        connection_id: id.clone(),
        local_port: tunnel.client_port,
    };
    if let Err(err) = sess.writer.send(&open).await {
        tracing::debug!(session=%sess.id, conn=%id, err=%err, "tunnel: open not delivered");
        sess.links.remove(&id).await;
        return;
    }

    conns.add(telemetry::ConnInfo {
        id: id.to_string(),
        side: Side::Server.as_str(),
        tunnel: tunnel.name.clone(),
        peer: peer.to_string(),
        local_port: tunnel.client_port,
        started_at_unix_ms: telemetry::now_unix_ms(),
    });
    tracing::debug!(session=%sess.id, conn=%id, tunnel=%tunnel.name, client=%peer, "tunnel: public connection open");

    let end = relay::run(c, ends, sess.links.clone(), sess.writer.clone(), Side::Server).await;

    conns.remove(id.as_str());
    tracing::debug!(session=%sess.id, conn=%id, end=?end, "tunnel: public connection closed");
}
