use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::task::JoinSet;

use crate::revtun::{admin, config, logging, net, telemetry, tunnel};

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Mode {
    Server,
    Client,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Server => "server",
            Mode::Client => "client",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub mode: Mode,
    pub logging: config::LoggingConfig,
    /// Empty disables the admin endpoint.
    pub admin_addr: String,

    // server
    pub host: String,
    pub port: u16,
    pub server_secret: String,
    pub config_path: PathBuf,
    pub auth_timeout: Duration,

    // client
    pub server_addr: String,
    pub secret: String,
    pub local_host: String,
    pub dial_timeout: Duration,
}

enum Role {
    Server(config::ServerConfig),
    Client(config::ClientConfig),
}

pub async fn run(opts: RunOptions) -> anyhow::Result<()> {
    let logrt = logging::init(&opts.logging)?;
    let _logrt_guard = logrt; // keep alive

    let role = match resolve_role(&opts) {
        Ok(role) => role,
        Err(err) => {
            tracing::error!(mode = opts.mode.as_str(), err = %format!("{err:#}"), "revtun: fatal");
            return Err(err);
        }
    };

    match &role {
        Role::Server(sc) => tracing::info!(
            mode = "server",
            host = %sc.host,
            port = sc.port,
            tunnels = sc.tunnels.len(),
            admin_addr = %opts.admin_addr,
            "revtun: starting"
        ),
        Role::Client(cc) => tracing::info!(
            mode = "client",
            server = %cc.server_addr,
            local_host = %cc.local_host,
            admin_addr = %opts.admin_addr,
            "revtun: starting"
        ),
    }

    let prom = Arc::new(telemetry::init_prometheus()?);
    let conns: Arc<telemetry::ConnRegistry> = Arc::new(telemetry::ConnRegistry::new());
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let mut tasks = JoinSet::new();

    match role {
        Role::Server(sc) => {
            let manager = Arc::new(tunnel::manager::Manager::new());
            let server = tunnel::server::Server::new(tunnel::server::ServerOptions {
                host: sc.host,
                control_port: sc.port,
                secret: sc.secret,
                tunnels: sc.tunnels,
                auth_timeout: sc.auth_timeout,
                manager: manager.clone(),
                conns: conns.clone(),
            })?;
            // Bind up front so a taken port fails startup instead of a background task.
            let listening = server.bind().await?;

            spawn_admin(&mut tasks, &opts, prom, conns, Some(manager), &shutdown_rx)?;

            let shutdown = shutdown_rx.clone();
            tasks.spawn(async move { listening.serve(shutdown).await });
        }
        Role::Client(cc) => {
            let client = tunnel::client::Client::new(tunnel::client::ClientOptions {
                server_addr: cc.server_addr,
                secret: cc.secret,
                local_host: cc.local_host,
                dial_timeout: cc.dial_timeout,
                reconnect: cc.reconnect,
                conns: conns.clone(),
            })?;

            spawn_admin(&mut tasks, &opts, prom, conns, None, &shutdown_rx)?;

            let client = Arc::new(client);
            let shutdown = shutdown_rx.clone();
            tasks.spawn(async move { client.run(shutdown).await });
        }
    }

    // Wait for shutdown signal (Ctrl-C / SIGTERM) or unexpected task termination.
    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown: signal");
            let _ = shutdown_tx.send(true);
        }
        res = tasks.join_next() => {
            if let Some(res) = res {
                match res {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        let _ = shutdown_tx.send(true);
                        return Err(err);
                    }
                    Err(join_err) => return Err(join_err.into()),
                }
            }
            let _ = shutdown_tx.send(true);
        }
    }

    let drain = async { while tasks.join_next().await.is_some() {} };
    if tokio::time::timeout(Duration::from_secs(5), drain)
        .await
        .is_err()
    {
        tracing::warn!("shutdown: drain timed out; aborting tasks");
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    Ok(())
}

fn resolve_role(opts: &RunOptions) -> anyhow::Result<Role> {
    match opts.mode {
        Mode::Server => {
            if opts.server_secret.is_empty() {
                anyhow::bail!("server secret is required (--server-secret)");
            }
            let tunnels = config::load_tunnels(&opts.config_path)
                .with_context(|| format!("load tunnels: {}", opts.config_path.display()))?;
            Ok(Role::Server(config::ServerConfig {
                host: opts.host.clone(),
                port: opts.port,
                secret: opts.server_secret.clone(),
                tunnels,
                auth_timeout: opts.auth_timeout,
            }))
        }
        Mode::Client => {
            if opts.secret.is_empty() {
                anyhow::bail!("client secret is required (--secret)");
            }
            Ok(Role::Client(config::ClientConfig {
                server_addr: opts.server_addr.clone(),
                secret: opts.secret.clone(),
                local_host: opts.local_host.clone(),
                dial_timeout: opts.dial_timeout,
                reconnect: tunnel::reconnect::ReconnectPolicy::default(),
            }))
        }
    }
}

fn spawn_admin(
    tasks: &mut JoinSet<anyhow::Result<()>>,
    opts: &RunOptions,
    prom: telemetry::SharedPrometheusHandle,
    conns: Arc<telemetry::ConnRegistry>,
    manager: Option<Arc<tunnel::manager::Manager>>,
    shutdown: &tokio::sync::watch::Receiver<bool>,
) -> anyhow::Result<()> {
    if opts.admin_addr.trim().is_empty() {
        return Ok(());
    }
    let addr: SocketAddr = net::normalize_bind_addr(&opts.admin_addr)
        .parse()
        .with_context(|| format!("invalid admin_addr: {}", opts.admin_addr))?;

    let state = admin::AdminState {
        mode: opts.mode.as_str(),
        prom,
        conns,
        manager,
    };
    let shutdown = shutdown.clone();
    tasks.spawn(async move { admin::serve_with_shutdown(addr, state, shutdown).await });
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(err = %err, "shutdown: SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
