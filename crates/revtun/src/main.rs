mod revtun;

use std::{path::PathBuf, time::Duration};

use clap::Parser;

use crate::revtun::{app, config::LoggingConfig};

#[derive(Debug, Parser)]
#[command(
    name = "revtun",
    version,
    about = "revtun - expose local TCP services through a public server over one control connection"
)]
struct Cli {
    /// Run as the public-facing server or as the client next to the local services.
    #[arg(long, value_enum, env = "REVTUN_MODE")]
    mode: app::Mode,

    /// Server: interface for the control port and every public tunnel port.
    #[arg(long, env = "REVTUN_HOST", default_value = "localhost")]
    host: String,

    /// Server: control port clients connect to.
    #[arg(long, env = "REVTUN_PORT", default_value_t = 8080)]
    port: u16,

    /// Server: shared secret clients must present.
    #[arg(long, env = "REVTUN_SERVER_SECRET", default_value = "", hide_env_values = true)]
    server_secret: String,

    /// Server: tunnel table (`name,server_port,client_port` rows, or .toml/.yaml).
    #[arg(long, env = "REVTUN_CONFIG", default_value = "config.csv")]
    config: PathBuf,

    /// Server: how long a new control connection may take to authenticate.
    #[arg(long, env = "REVTUN_AUTH_TIMEOUT_MS", default_value_t = 10_000)]
    auth_timeout_ms: u64,

    /// Client: control address of the server.
    #[arg(long, env = "REVTUN_SERVER", default_value = "localhost:8080")]
    server: String,

    /// Client: shared secret.
    #[arg(long, env = "REVTUN_SECRET", default_value = "", hide_env_values = true)]
    secret: String,

    /// Client: host the local services listen on.
    #[arg(long, env = "REVTUN_LOCAL_HOST", default_value = "localhost")]
    local_host: String,

    /// Client: timeout for dialing the server and local services.
    #[arg(long, env = "REVTUN_DIAL_TIMEOUT_MS", default_value_t = 5_000)]
    dial_timeout_ms: u64,

    #[arg(long, env = "REVTUN_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// text | json
    #[arg(long, env = "REVTUN_LOG_FORMAT", default_value = "text")]
    log_format: String,

    /// stderr | stdout | discard | <file path>
    #[arg(long, env = "REVTUN_LOG_OUTPUT", default_value = "stderr")]
    log_output: String,

    #[arg(long, env = "REVTUN_LOG_SOURCE")]
    log_source: bool,

    /// Admin HTTP listen address (e.g. `:9090`). Empty disables it.
    #[arg(long, env = "REVTUN_ADMIN_ADDR", default_value = "")]
    admin_addr: String,
}

impl Cli {
    fn into_options(self) -> app::RunOptions {
        app::RunOptions {
            mode: self.mode,
            logging: LoggingConfig {
                level: self.log_level,
                format: self.log_format,
                output: self.log_output,
                add_source: self.log_source,
            },
            admin_addr: self.admin_addr,
            host: self.host,
            port: self.port,
            server_secret: self.server_secret,
            config_path: self.config,
            auth_timeout: Duration::from_millis(self.auth_timeout_ms),
            server_addr: self.server,
            secret: self.secret,
            local_host: self.local_host,
            dial_timeout: Duration::from_millis(self.dial_timeout_ms),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    revtun::run(cli.into_options()).await
}
