use std::{sync::Arc, time::Duration};

use anyhow::Context;
use async_trait::async_trait;
use tokio::net::TcpStream;

use crate::revtun::telemetry::{self, ConnRegistry};
use crate::revtun::tunnel::{
    links::{Delivery, LinkTable},
    protocol::{ConnectionId, Message, ProtocolError},
    reconnect::{Attempt, Clock, ConnState, ReconnectPolicy, TokioClock},
    relay::{self, Side},
    transport::{self, MessageReader, MessageWriter},
};

/// Dials the local service behind a `TunnelOpen`.
#[async_trait]
pub trait LocalDialer: Send + Sync {
    async fn dial(&self, port: u16) -> std::io::Result<TcpStream>;
}

#[derive(Debug, Clone)]
pub struct TcpDialer {
    pub host: String,
    pub timeout: Duration,
}

#[async_trait]
impl LocalDialer for TcpDialer {
    async fn dial(&self, port: u16) -> std::io::Result<TcpStream> {
        let connect = TcpStream::connect((self.host.as_str(), port));
        match tokio::time::timeout(self.timeout, connect).await {
            Ok(res) => res,
            Err(_) => Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "local dial timed out",
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub server_addr: String,
    pub secret: String,
    pub local_host: String,
    pub dial_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    pub conns: Arc<ConnRegistry>,
}

pub struct Client {
    opts: ClientOptions,
    clock: Arc<dyn Clock>,
    dialer: Arc<dyn LocalDialer>,
    state: tokio::sync::watch::Sender<ConnState>,
}

enum SessionEnd {
    Shutdown,
    Dropped(anyhow::Error),
}

impl Client {
    pub fn new(mut opts: ClientOptions) -> anyhow::Result<Self> {
        if opts.server_addr.trim().is_empty() {
            anyhow::bail!("tunnel: client server address is required");
        }
        if opts.secret.is_empty() {
            anyhow::bail!("tunnel: client secret is required");
        }
        if opts.dial_timeout <= Duration::from_millis(0) {
            opts.dial_timeout = Duration::from_secs(5);
        }
        if opts.local_host.trim().is_empty() {
            opts.local_host = "localhost".into();
        }

        let dialer = Arc::new(TcpDialer {
            host: opts.local_host.trim().to_string(),
            timeout: opts.dial_timeout,
        });
        let (state, _rx) = tokio::sync::watch::channel(ConnState::Disconnected);

        Ok(Self {
            opts,
            clock: Arc::new(TokioClock),
            dialer,
            state,
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_dialer(mut self, dialer: Arc<dyn LocalDialer>) -> Self {
        self.dialer = dialer;
        self
    }

    #[cfg(test)]
    fn subscribe(&self) -> tokio::sync::watch::Receiver<ConnState> {
        self.state.subscribe()
    }

    /// Keeps a session to the server alive until shutdown.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) -> anyhow::Result<()> {
        loop {
            if *shutdown.borrow() {
                self.set_state(ConnState::Disconnected);
                return Ok(());
            }

            self.set_state(ConnState::Connecting);
            let attempt = match self.connect().await {
                Err(err) => {
                    tracing::warn!(
                        server=%self.opts.server_addr,
                        err=%format!("{err:#}"),
                        retry=%humantime::format_duration(self.opts.reconnect.delay_after(Attempt::DialFailed)),
                        "tunnel: dial failed; retrying"
                    );
                    Attempt::DialFailed
                }
                Ok((rd, wr)) => {
                    self.set_state(ConnState::Connected);
                    tracing::info!(server=%self.opts.server_addr, "tunnel: connected");
                    match self.serve_session(rd, wr, shutdown.clone()).await {
                        SessionEnd::Shutdown => {
                            self.set_state(ConnState::Disconnected);
                            return Ok(());
                        }
                        SessionEnd::Dropped(err) => {
                            tracing::warn!(
                                server=%self.opts.server_addr,
                                err=%err,
                                retry=%humantime::format_duration(self.opts.reconnect.delay_after(Attempt::SessionEnded)),
                                "tunnel: disconnected; retrying"
                            );
                        }
                    }
                    Attempt::SessionEnded
                }
            };

            self.set_state(ConnState::Disconnected);
            let delay = self.opts.reconnect.delay_after(attempt);
            tokio::select! {
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        return Ok(());
                    }
                }
                _ = self.clock.sleep(delay) => {}
            }
        }
    }

    async fn connect(&self) -> anyhow::Result<(MessageReader, MessageWriter)> {
        let addr = self.opts.server_addr.trim();
        let c = tokio::time::timeout(self.opts.dial_timeout, TcpStream::connect(addr))
            .await
            .context("dial timed out")?
            .with_context(|| format!("dial {addr}"))?;

        let (rd, wr) = transport::split_tcp(c);
        wr.send(&Message::Auth {
            secret: self.opts.secret.clone(),
        })
        .await
        .context("send auth")?;
        Ok((rd, wr))
    }

    async fn serve_session(
        &self,
        mut rd: MessageReader,
        wr: MessageWriter,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> SessionEnd {
        let links = Arc::new(LinkTable::new());

        let end = loop {
            tokio::select! {
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break SessionEnd::Shutdown;
                    }
                }
                msg = rd.recv() => {
                    let msg = match msg {
                        Ok(m) => m,
                        Err(err) => break SessionEnd::Dropped(session_error(err)),
                    };
                    match msg {
                        Message::TunnelOpen { connection_id, local_port } => {
                            self.open(connection_id, local_port, &links, &wr).await;
                        }
                        Message::Data { connection_id, payload } => {
                            if links.deliver(&connection_id, payload).await == Delivery::Unknown {
                                tracing::debug!(conn=%connection_id, "tunnel: data for unknown connection dropped");
                            }
                        }
                        Message::Close { connection_id } => {
                            if links.remove(&connection_id).await {
                                tracing::debug!(conn=%connection_id, "tunnel: closed by server");
                            }
                        }
                        Message::Auth { .. } => {
                            break SessionEnd::Dropped(anyhow::anyhow!("tunnel: unexpected auth from server"));
                        }
                    }
                }
            }
        };

        let closed = links.close_all().await;
        if closed > 0 {
            tracing::debug!(closed, "tunnel: closed local connections after session end");
        }
        wr.close().await;
        end
    }

    async fn open(
        &self,
        id: ConnectionId,
        local_port: u16,
        links: &Arc<LinkTable>,
        wr: &MessageWriter,
    ) {
        // Registered before the dial so data arriving meanwhile is queued, not lost.
        let Some(ends) = links.insert(id.clone()).await else {
            tracing::warn!(conn=%id, "tunnel: duplicate open ignored");
            return;
        };

        let links = links.clone();
        let wr = wr.clone();
        let dialer = self.dialer.clone();
        let conns = self.opts.conns.clone();
        tokio::spawn(async move {
            let local = match dialer.dial(local_port).await {
                Ok(c) => c,
                Err(err) => {
                    tracing::warn!(conn=%id, port=local_port, err=%err, "tunnel: local dial failed");
                    metrics::counter!("revtun_local_dial_failures_total").increment(1);
                    if links.remove(&id).await {
                        wr.send_close(&id).await;
                    }
                    return;
                }
            };

            if !links.is_open(&id).await {
                tracing::debug!(conn=%id, "tunnel: closed before local dial completed");
                return;
            }

            conns.add(telemetry::ConnInfo {
                id: id.to_string(),
                side: Side::Client.as_str(),
                tunnel: String::new(),
                peer: local.peer_addr().map(|a| a.to_string()).unwrap_or_default(),
                local_port,
                started_at_unix_ms: telemetry::now_unix_ms(),
            });
            tracing::debug!(conn=%id, port=local_port, "tunnel: local connection open");

            let end = relay::run(local, ends, links, wr, Side::Client).await;

            conns.remove(id.as_str());
            tracing::debug!(conn=%id, end=?end, "tunnel: local connection closed");
        });
    }

    fn set_state(&self, s: ConnState) {
        let prev = self.state.send_replace(s);
        if prev != s {
            tracing::debug!(from=?prev, to=?s, "tunnel: client state");
        }
    }
}

fn session_error(err: ProtocolError) -> anyhow::Error {
    match err {
        ProtocolError::Io(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            anyhow::anyhow!("tunnel: server closed the connection")
        }
        other => anyhow::Error::new(other).context("tunnel: control receive failed"),
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
        sync::mpsc,
    };

    use super::*;
    use crate::revtun::tunnel::protocol::read_message;

    /// Records requested delays and returns immediately.
    struct RecordingClock {
        tx: mpsc::UnboundedSender<Duration>,
    }

    #[async_trait]
    impl Clock for RecordingClock {
        async fn sleep(&self, d: Duration) {
            let _ = self.tx.send(d);
            tokio::task::yield_now().await;
        }
    }

    /// Waits before connecting, to hold a connection in the dialing state.
    struct SlowDialer {
        delay: Duration,
        inner: TcpDialer,
    }

    #[async_trait]
    impl LocalDialer for SlowDialer {
        async fn dial(&self, port: u16) -> std::io::Result<TcpStream> {
            tokio::time::sleep(self.delay).await;
            self.inner.dial(port).await
        }
    }

    fn opts(server_addr: String) -> ClientOptions {
        ClientOptions {
            server_addr,
            secret: "S".into(),
            local_host: "127.0.0.1".into(),
            dial_timeout: Duration::from_secs(2),
            reconnect: ReconnectPolicy::default(),
            conns: Arc::new(ConnRegistry::new()),
        }
    }

    async fn unused_addr() -> String {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap().to_string();
        drop(ln);
        addr
    }

    async fn expect_auth(c: &mut TcpStream) {
        match read_message(c).await.unwrap() {
            Message::Auth { secret } => assert_eq!(secret, "S"),
            other => panic!("expected auth, got {other:?}"),
        }
    }

    async fn send(c: &mut TcpStream, m: Message) {
        c.write_all(&m.encode().unwrap()).await.unwrap();
    }

    #[test]
    fn requires_secret_and_server() {
        let mut o = opts("127.0.0.1:1".into());
        o.secret.clear();
        assert!(Client::new(o).is_err());
        assert!(Client::new(opts("  ".into())).is_err());
    }

    #[tokio::test]
    async fn dial_failures_retry_with_fixed_delay() {
        let (tx, mut delays) = mpsc::unbounded_channel();
        let client = Client::new(opts(unused_addr().await))
            .unwrap()
            .with_clock(Arc::new(RecordingClock { tx }));

        let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
        let task = tokio::spawn(async move { client.run(stop_rx).await });

        for _ in 0..3 {
            assert_eq!(delays.recv().await.unwrap(), Duration::from_secs(5));
        }

        stop_tx.send(true).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn reconnects_and_reauthenticates_after_session_drop() {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (tx, mut delays) = mpsc::unbounded_channel();
        let client = Client::new(opts(ln.local_addr().unwrap().to_string()))
            .unwrap()
            .with_clock(Arc::new(RecordingClock { tx }));
        let mut state = client.subscribe();

        let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
        let task = tokio::spawn(async move { client.run(stop_rx).await });

        let (mut first, _) = ln.accept().await.unwrap();
        expect_auth(&mut first).await;
        drop(first);

        assert_eq!(delays.recv().await.unwrap(), Duration::from_secs(2));

        let (mut second, _) = ln.accept().await.unwrap();
        expect_auth(&mut second).await;

        tokio::time::timeout(
            Duration::from_secs(2),
            state.wait_for(|s| *s == ConnState::Connected),
        )
        .await
        .unwrap()
        .unwrap();

        stop_tx.send(true).unwrap();
        task.await.unwrap().unwrap();
        assert_eq!(*state.borrow(), ConnState::Disconnected);
    }

    #[tokio::test]
    async fn data_before_slow_dial_is_delivered_in_order() {
        let control = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let service = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let service_port = service.local_addr().unwrap().port();

        let client = Client::new(opts(control.local_addr().unwrap().to_string()))
            .unwrap()
            .with_dialer(Arc::new(SlowDialer {
                delay: Duration::from_millis(300),
                inner: TcpDialer {
                    host: "127.0.0.1".into(),
                    timeout: Duration::from_secs(2),
                },
            }));

        let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
        let task = tokio::spawn(async move { client.run(stop_rx).await });

        let (mut srv, _) = control.accept().await.unwrap();
        expect_auth(&mut srv).await;

        let cid = ConnectionId::generate();
        send(
            &mut srv,
            Message::TunnelOpen {
                connection_id: cid.clone(),
                local_port: service_port,
            },
        )
        .await;

        let mut want = Vec::with_capacity(10 * 4096);
        for i in 0..10u8 {
            let chunk = vec![i; 4096];
            want.extend_from_slice(&chunk);
            send(
                &mut srv,
                Message::Data {
                    connection_id: cid.clone(),
                    payload: Bytes::from(chunk),
                },
            )
            .await;
        }

        let (mut local, _) = service.accept().await.unwrap();
        let mut got = vec![0u8; want.len()];
        tokio::time::timeout(Duration::from_secs(5), local.read_exact(&mut got))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, want);

        stop_tx.send(true).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn close_kills_the_id_and_later_data_is_dropped() {
        let control = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let service = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let service_port = service.local_addr().unwrap().port();

        let conns = Arc::new(ConnRegistry::new());
        let mut o = opts(control.local_addr().unwrap().to_string());
        o.conns = conns.clone();
        let client = Client::new(o).unwrap();

        let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
        let task = tokio::spawn(async move { client.run(stop_rx).await });

        let (mut srv, _) = control.accept().await.unwrap();
        expect_auth(&mut srv).await;

        let cid = ConnectionId::generate();
        send(
            &mut srv,
            Message::TunnelOpen {
                connection_id: cid.clone(),
                local_port: service_port,
            },
        )
        .await;
        send(
            &mut srv,
            Message::Data {
                connection_id: cid.clone(),
                payload: Bytes::from_static(b"a"),
            },
        )
        .await;

        let (mut local, _) = service.accept().await.unwrap();
        let mut one = [0u8; 1];
        local.read_exact(&mut one).await.unwrap();
        assert_eq!(&one, b"a");

        send(
            &mut srv,
            Message::Close {
                connection_id: cid.clone(),
            },
        )
        .await;
        send(
            &mut srv,
            Message::Data {
                connection_id: cid.clone(),
                payload: Bytes::from_static(b"b"),
            },
        )
        .await;

        // The local socket sees EOF and never the late chunk.
        let mut rest = Vec::new();
        tokio::time::timeout(Duration::from_secs(2), local.read_to_end(&mut rest))
            .await
            .unwrap()
            .unwrap();
        assert!(rest.is_empty());

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while conns.len() != 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(conns.len(), 0);

        stop_tx.send(true).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn local_eof_and_dial_failure_send_close_upstream() {
        let control = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let service = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let service_port = service.local_addr().unwrap().port();
        let dead_port: u16 = unused_addr().await.rsplit(':').next().unwrap().parse().unwrap();

        let client = Client::new(opts(control.local_addr().unwrap().to_string())).unwrap();
        let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
        let task = tokio::spawn(async move { client.run(stop_rx).await });

        let (mut srv, _) = control.accept().await.unwrap();
        expect_auth(&mut srv).await;

        // Dial failure.
        let dead = ConnectionId::generate();
        send(
            &mut srv,
            Message::TunnelOpen {
                connection_id: dead.clone(),
                local_port: dead_port,
            },
        )
        .await;
        match read_message(&mut srv).await.unwrap() {
            Message::Close { connection_id } => assert_eq!(connection_id, dead),
            other => panic!("expected close, got {other:?}"),
        }

        // Local service replies and hangs up.
        let live = ConnectionId::generate();
        send(
            &mut srv,
            Message::TunnelOpen {
                connection_id: live.clone(),
                local_port: service_port,
            },
        )
        .await;
        let (mut local, _) = service.accept().await.unwrap();
        local.write_all(b"bye").await.unwrap();
        drop(local);

        let mut got = Vec::new();
        loop {
            match read_message(&mut srv).await.unwrap() {
                Message::Data {
                    connection_id,
                    payload,
                } => {
                    assert_eq!(connection_id, live);
                    got.extend_from_slice(&payload);
                }
                Message::Close { connection_id } => {
                    assert_eq!(connection_id, live);
                    break;
                }
                other => panic!("unexpected message: {other:?}"),
            }
        }
        assert_eq!(got, b"bye");

        stop_tx.send(true).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn stalled_local_service_pushes_back_on_the_server() {
        let control = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let service = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let service_port = service.local_addr().unwrap().port();

        let client = Client::new(opts(control.local_addr().unwrap().to_string())).unwrap();
        let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
        let task = tokio::spawn(async move { client.run(stop_rx).await });

        let (mut srv, _) = control.accept().await.unwrap();
        expect_auth(&mut srv).await;

        let cid = ConnectionId::generate();
        send(
            &mut srv,
            Message::TunnelOpen {
                connection_id: cid.clone(),
                local_port: service_port,
            },
        )
        .await;
        // Accepted, never read.
        let (local, _) = service.accept().await.unwrap();

        const LIMIT: usize = 64 << 20;
        let frame = Message::Data {
            connection_id: cid.clone(),
            payload: Bytes::from(vec![7u8; 4096]),
        }
        .encode()
        .unwrap();
        let mut pushed = 0usize;
        let push = async {
            while pushed < LIMIT {
                srv.write_all(&frame).await.unwrap();
                pushed += 4096;
            }
        };
        let res = tokio::time::timeout(Duration::from_secs(3), push).await;
        assert!(res.is_err(), "sender never blocked");
        assert!(pushed < LIMIT);

        // Hanging up the local side releases the session.
        drop(local);
        stop_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn local_reset_sends_exactly_one_close() {
        let control = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let service = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let service_port = service.local_addr().unwrap().port();

        let client = Client::new(opts(control.local_addr().unwrap().to_string())).unwrap();
        let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
        let task = tokio::spawn(async move { client.run(stop_rx).await });

        let (mut srv, _) = control.accept().await.unwrap();
        expect_auth(&mut srv).await;

        let cid = ConnectionId::generate();
        send(
            &mut srv,
            Message::TunnelOpen {
                connection_id: cid.clone(),
                local_port: service_port,
            },
        )
        .await;
        let (local, _) = service.accept().await.unwrap();
        local.set_linger(Some(Duration::ZERO)).unwrap();
        drop(local);

        for _ in 0..20 {
            send(
                &mut srv,
                Message::Data {
                    connection_id: cid.clone(),
                    payload: Bytes::from_static(b"after reset"),
                },
            )
            .await;
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        match tokio::time::timeout(Duration::from_secs(2), read_message(&mut srv))
            .await
            .unwrap()
            .unwrap()
        {
            Message::Close { connection_id } => assert_eq!(connection_id, cid),
            other => panic!("expected close, got {other:?}"),
        }
        assert!(
            tokio::time::timeout(Duration::from_millis(300), read_message(&mut srv))
                .await
                .is_err(),
            "only one close per connection"
        );

        stop_tx.send(true).unwrap();
        task.await.unwrap().unwrap();
    }
}
