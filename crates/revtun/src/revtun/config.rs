use std::{collections::HashSet, fs, path::Path, time::Duration};

use serde::Deserialize;
use thiserror::Error;

use crate::revtun::tunnel::reconnect::ReconnectPolicy;

/// One exposed service: public `server_port` on the server, `client_port` on the client host.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Tunnel {
    pub name: String,
    pub server_port: u16,
    pub client_port: u16,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("row {row} must have exactly 3 columns (got {got})")]
    Columns { row: usize, got: usize },
    #[error("invalid {field} in row {row}: {value:?}")]
    Port {
        row: usize,
        field: &'static str,
        value: String,
    },
    #[error("unterminated quote in row {row}")]
    Quote { row: usize },
    #[error("duplicate server_port {port} in row {row}")]
    DuplicatePort { row: usize, port: u16 },
    #[error("parse toml: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("parse yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Loads the tunnel table. `.toml` and `.yaml`/`.yml` are structured; anything else is
/// read as delimited `name,server_port,client_port` rows.
pub fn load_tunnels(path: &Path) -> Result<Vec<Tunnel>, ConfigError> {
    let data = fs::read(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    let s = String::from_utf8_lossy(&data);

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    let rows: Vec<FileTunnel> = match ext.as_str() {
        "toml" => toml::from_str::<FileTable>(&s)?.tunnels,
        "yaml" | "yml" => serde_yaml::from_str::<FileTable>(&s)?.tunnels,
        _ => return parse_tunnel_table(&s),
    };

    let mut out = Vec::with_capacity(rows.len());
    for (i, r) in rows.into_iter().enumerate() {
        out.push(Tunnel {
            name: r.name.trim().to_string(),
            server_port: r.server_port,
            client_port: r.client_port,
        });
        check_duplicate(&out, i + 1)?;
    }
    Ok(out)
}

/// Parses delimited rows. Blank lines are skipped; fields are trimmed and may be
/// double-quoted (`""` inside quotes is a literal quote).
pub fn parse_tunnel_table(s: &str) -> Result<Vec<Tunnel>, ConfigError> {
    let mut out = Vec::new();
    let mut row = 0;
    for line in s.lines() {
        if line.trim().is_empty() {
            continue;
        }
        row += 1;

        let fields = split_record(line).ok_or(ConfigError::Quote { row })?;
        if fields.len() != 3 {
            return Err(ConfigError::Columns {
                row,
                got: fields.len(),
            });
        }

        out.push(Tunnel {
            name: fields[0].trim().to_string(),
            server_port: parse_port(&fields[1], row, "server_port")?,
            client_port: parse_port(&fields[2], row, "client_port")?,
        });
        check_duplicate(&out, row)?;
    }
    Ok(out)
}

fn parse_port(raw: &str, row: usize, field: &'static str) -> Result<u16, ConfigError> {
    raw.trim().parse::<u16>().map_err(|_| ConfigError::Port {
        row,
        field,
        value: raw.trim().to_string(),
    })
}

fn check_duplicate(tunnels: &[Tunnel], row: usize) -> Result<(), ConfigError> {
    let Some(last) = tunnels.last() else {
        return Ok(());
    };
    // Port 0 asks the OS for an ephemeral port, so it never collides.
    if last.server_port == 0 {
        return Ok(());
    }
    let mut seen = HashSet::new();
    for t in &tunnels[..tunnels.len() - 1] {
        seen.insert(t.server_port);
    }
    if seen.contains(&last.server_port) {
        return Err(ConfigError::DuplicatePort {
            row,
            port: last.server_port,
        });
    }
    Ok(())
}

fn split_record(line: &str) -> Option<Vec<String>> {
    let mut fields = Vec::new();
    let mut cur = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes => {
                if chars.peek() == Some(&'"') {
                    cur.push('"');
                    chars.next();
                } else {
                    in_quotes = false;
                }
            }
            '"' if cur.trim().is_empty() => {
                cur.clear();
                in_quotes = true;
            }
            ',' if !in_quotes => fields.push(std::mem::take(&mut cur)),
            _ => cur.push(c),
        }
    }
    if in_quotes {
        return None;
    }
    fields.push(cur);
    Some(fields)
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileTable {
    #[serde(default)]
    tunnels: Vec<FileTunnel>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileTunnel {
    name: String,
    server_port: u16,
    client_port: u16,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
            output: "stderr".into(),
            add_source: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub secret: String,
    pub tunnels: Vec<Tunnel>,
    pub auth_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_addr: String,
    pub secret: String,
    pub local_host: String,
    pub dial_timeout: Duration,
    pub reconnect: ReconnectPolicy,
}
