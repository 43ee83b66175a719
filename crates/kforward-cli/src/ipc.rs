//! IPC between the CLI and a running daemon
//!
//! Newline-delimited JSON over a Unix domain socket. The daemon listens on
//! the socket and the CLI connects to query status or send commands.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::debug;

/// IPC request from CLI to daemon
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IpcRequest {
    /// Check if the daemon is alive
    Ping,

    /// Status of every configured forward
    Status,

    /// Start a forward by id
    Start { id: String },

    /// Stop a forward by id
    Stop { id: String },

    /// Re-read the configuration file and reconcile
    Reload,

    /// Restart every running forward
    RestartAll,

    /// Activate a project, or deactivate with `None`
    Activate { project: Option<String> },

    /// Stop all forwards and exit
    Shutdown,
}

/// IPC response from daemon to CLI
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IpcResponse {
    Pong,

    Status {
        active_project: Option<String>,
        forwards: Vec<ForwardStatusInfo>,
    },

    Ok { message: Option<String> },

    Error { message: String },
}

/// Status of one configured forward
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ForwardStatusInfo {
    pub id: String,
    pub context: String,
    pub namespace: String,
    pub service: String,
    pub port_local: u16,
    pub port_remote: u16,
    pub running: bool,
    pub pid: Option<u32>,
    pub uptime_seconds: Option<u64>,
}

/// Path of the daemon socket
pub fn socket_path() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Failed to get home directory")?;
    Ok(home.join(".kforward").join("daemon.sock"))
}

/// One JSON value per line over a socket, in both directions
struct JsonLines {
    stream: BufReader<UnixStream>,
    line: String,
}

impl JsonLines {
    fn new(stream: UnixStream) -> Self {
        Self {
            stream: BufReader::new(stream),
            line: String::new(),
        }
    }

    async fn write<T: Serialize>(&mut self, value: &T) -> Result<()> {
        let mut frame = serde_json::to_vec(value).context("Failed to encode message")?;
        frame.push(b'\n');

        let socket = self.stream.get_mut();
        socket
            .write_all(&frame)
            .await
            .context("Failed to send message")?;
        socket.flush().await.context("Failed to flush message")
    }

    /// Next value, or `None` once the peer has closed its end
    async fn read<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        self.line.clear();
        if self
            .stream
            .read_line(&mut self.line)
            .await
            .context("Failed to read message")?
            == 0
        {
            return Ok(None);
        }
        serde_json::from_str(&self.line)
            .map(Some)
            .context("Failed to parse message")
    }
}

/// IPC client for the CLI
pub struct IpcClient {
    lines: JsonLines,
}

impl IpcClient {
    /// Connect to the daemon socket
    pub async fn connect() -> Result<Self> {
        Self::connect_to(&socket_path()?).await
    }

    pub async fn connect_to(path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(path)
            .await
            .with_context(|| format!("Failed to connect to daemon socket at {:?}", path))?;
        Ok(Self {
            lines: JsonLines::new(stream),
        })
    }

    /// Send a request and wait for its response
    pub async fn request(&mut self, req: &IpcRequest) -> Result<IpcResponse> {
        self.lines.write(req).await?;
        self.lines
            .read()
            .await?
            .context("Daemon closed the connection without responding")
    }
}

/// IPC server for the daemon; the socket file is removed on drop
pub struct IpcServer {
    listener: UnixListener,
    socket_path: PathBuf,
}

impl IpcServer {
    /// Bind to the daemon socket
    pub async fn bind() -> Result<Self> {
        Self::bind_to(&socket_path()?).await
    }

    /// Bind to a specific socket path
    ///
    /// A leftover socket file nobody listens on is replaced. One with a live
    /// listener belongs to another daemon and binding fails.
    pub async fn bind_to(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create socket directory: {:?}", parent))?;
        }

        if has_listener(path).await {
            anyhow::bail!("Another daemon is already running (socket at {:?} is active)", path);
        }
        if path.exists() {
            debug!("Removing stale socket {:?}", path);
            std::fs::remove_file(path)
                .with_context(|| format!("Failed to remove stale socket {:?}", path))?;
        }

        let listener = UnixListener::bind(path)
            .with_context(|| format!("Failed to bind to socket at {:?}", path))?;

        Ok(Self {
            listener,
            socket_path: path.to_path_buf(),
        })
    }

    pub async fn accept(&self) -> Result<IpcConnection> {
        let (stream, _) = self
            .listener
            .accept()
            .await
            .context("Failed to accept IPC connection")?;
        Ok(IpcConnection {
            lines: JsonLines::new(stream),
        })
    }

    pub fn path(&self) -> &Path {
        &self.socket_path
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

async fn has_listener(path: &Path) -> bool {
    path.exists() && UnixStream::connect(path).await.is_ok()
}

/// One client connection; it may carry any number of requests
pub struct IpcConnection {
    lines: JsonLines,
}

impl IpcConnection {
    /// Receive a request; `None` when the client closed the connection
    pub async fn recv(&mut self) -> Result<Option<IpcRequest>> {
        self.lines.read().await
    }

    pub async fn send(&mut self, response: &IpcResponse) -> Result<()> {
        self.lines.write(response).await
    }
}

/// Compact uptime such as `45s`, `12m 3s`, `5h 20m` or `2d 4h`
pub fn format_uptime(seconds: u64) -> String {
    let uptime = chrono::Duration::seconds(seconds.min(i64::MAX as u64 / 1000) as i64);
    let (days, hours, minutes, secs) = (
        uptime.num_days(),
        uptime.num_hours() % 24,
        uptime.num_minutes() % 60,
        uptime.num_seconds() % 60,
    );
    match (days, uptime.num_hours(), uptime.num_minutes()) {
        (d, _, _) if d > 0 => format!("{}d {}h", d, hours),
        (_, h, _) if h > 0 => format!("{}h {}m", h, minutes),
        (_, _, m) if m > 0 => format!("{}m {}s", m, secs),
        _ => format!("{}s", secs),
    }
}

/// Print status table to stdout
pub fn print_status_table(active_project: Option<&str>, forwards: &[ForwardStatusInfo]) {
    if let Some(project) = active_project {
        println!("Active project: {}", project);
    }

    if forwards.is_empty() {
        println!("No port forwards configured.");
        return;
    }

    println!(
        "{:<20} {:<16} {:<28} {:<14} STATUS",
        "ID", "CONTEXT", "SERVICE", "PORTS"
    );

    for info in forwards {
        let context = if info.context.is_empty() {
            "-"
        } else {
            info.context.as_str()
        };
        let service = format!("{}/{}", info.namespace, info.service);
        let ports = format!("{}->{}", info.port_local, info.port_remote);
        let status = if info.running {
            let pid = info.pid.map(|p| format!(" pid {}", p)).unwrap_or_default();
            let uptime = info
                .uptime_seconds
                .map(|s| format!(" ({})", format_uptime(s)))
                .unwrap_or_default();
            format!("● Running{}{}", pid, uptime)
        } else {
            "○ Stopped".to_string()
        };

        println!(
            "{:<20} {:<16} {:<28} {:<14} {}",
            info.id, context, service, ports, status
        );
    }
}
