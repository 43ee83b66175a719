//! Daemon mode for supervising port forwards
//!
//! Owns one [`Supervisor`] and one [`ConfigStore`] and processes commands
//! from a channel. The supervisor is blocking, so every call that may launch
//! or kill a process runs on the blocking thread pool. CLI requests arrive
//! over IPC and are turned into the same commands.

use anyhow::{Context, Result};
use chrono::Utc;
use kforward_core::{ReconciliationResult, RestartResult, Supervisor, TunnelDefinition, TunnelError};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::ipc::{ForwardStatusInfo, IpcConnection, IpcRequest, IpcResponse, IpcServer};
use crate::store::ConfigStore;

/// Reply channel carried by a command
pub type Reply<T> = oneshot::Sender<Result<T>>;

/// Daemon command
pub enum DaemonCommand {
    /// Start a forward by id
    Start(String, Reply<()>),
    /// Stop a forward by id
    Stop(String, Reply<()>),
    /// Reload the configuration file and reconcile
    Reload(Reply<Report>),
    /// Restart every running forward with its current definition
    RestartAll(Reply<Report>),
    /// Switch to a project (`None` deactivates)
    ActivateProject(Option<String>, Reply<Report>),
    /// Status of every forward
    Status(oneshot::Sender<DaemonStatus>),
    /// Stop everything and exit the loop
    Shutdown,
}

/// What a daemon operation did, per forward id
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Report {
    pub started: Vec<String>,
    pub stopped: Vec<String>,
    pub updated: Vec<String>,
    pub added: Vec<String>,
    pub restarted: usize,
    pub errors: BTreeMap<String, String>,
}

impl Report {
    fn from_reconciliation(result: &ReconciliationResult) -> Self {
        Self {
            stopped: result.stopped.clone(),
            updated: result.updated.clone(),
            added: result.added.clone(),
            errors: errors_to_strings(&result.errors),
            ..Self::default()
        }
    }

    fn from_restart(result: &RestartResult) -> Self {
        Self {
            restarted: result.restarted,
            errors: errors_to_strings(&result.errors),
            ..Self::default()
        }
    }
}

fn errors_to_strings(errors: &BTreeMap<String, TunnelError>) -> BTreeMap<String, String> {
    errors
        .iter()
        .map(|(id, e)| (id.clone(), e.to_string()))
        .collect()
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        for (label, ids) in [
            ("started", &self.started),
            ("stopped", &self.stopped),
            ("updated", &self.updated),
            ("added", &self.added),
        ] {
            if !ids.is_empty() {
                parts.push(format!("{}: {}", label, ids.join(", ")));
            }
        }
        if self.restarted > 0 {
            parts.push(format!("restarted: {}", self.restarted));
        }
        if parts.is_empty() {
            parts.push("no changes".to_string());
        }
        write!(f, "{}", parts.join("; "))?;

        for (id, error) in &self.errors {
            write!(f, "\n  ✗ {}: {}", id, error)?;
        }
        Ok(())
    }
}

/// Daemon-wide status snapshot
#[derive(Debug, Clone, PartialEq)]
pub struct DaemonStatus {
    pub active_project: Option<String>,
    pub forwards: Vec<ForwardStatusInfo>,
}

/// Daemon for supervising port forwards
pub struct Daemon {
    store: ConfigStore,
    supervisor: Arc<Supervisor>,
}

impl Daemon {
    pub fn new(store: ConfigStore, supervisor: Arc<Supervisor>) -> Self {
        Self { store, supervisor }
    }

    pub fn store(&self) -> &ConfigStore {
        &self.store
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    /// Run the command loop until shutdown
    ///
    /// Every forward is stopped when the loop exits, whether through
    /// [`DaemonCommand::Shutdown`] or because all senders are gone.
    pub async fn run(mut self, mut command_rx: mpsc::Receiver<DaemonCommand>) -> Result<()> {
        info!(
            forwards = self.store.definitions().len(),
            "✅ Daemon ready"
        );

        while let Some(command) = command_rx.recv().await {
            match command {
                DaemonCommand::Start(id, reply) => {
                    let _ = reply.send(self.start_forward(&id).await);
                }
                DaemonCommand::Stop(id, reply) => {
                    let _ = reply.send(self.stop_forward(&id).await);
                }
                DaemonCommand::Reload(reply) => {
                    let _ = reply.send(self.reload().await);
                }
                DaemonCommand::RestartAll(reply) => {
                    let _ = reply.send(self.restart_all().await);
                }
                DaemonCommand::ActivateProject(project, reply) => {
                    let _ = reply.send(self.activate_project(project).await);
                }
                DaemonCommand::Status(reply) => {
                    let _ = reply.send(self.status());
                }
                DaemonCommand::Shutdown => {
                    info!("Shutting down daemon...");
                    break;
                }
            }
        }

        self.shutdown().await;

        info!("✅ Daemon stopped");
        Ok(())
    }

    /// Run a supervisor call on the blocking pool
    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Supervisor) -> T + Send + 'static,
        T: Send + 'static,
    {
        let supervisor = Arc::clone(&self.supervisor);
        tokio::task::spawn_blocking(move || f(&supervisor))
            .await
            .context("Supervisor task failed")
    }

    /// Start one forward by id
    pub async fn start_forward(&self, id: &str) -> Result<()> {
        let definition = self
            .store
            .get(id)
            .cloned()
            .with_context(|| format!("Port forward '{}' not found", id))?;

        info!(tunnel = %id, "Starting forward: {}", definition);
        self.blocking(move |s| s.start(&definition))
            .await?
            .with_context(|| format!("Failed to start '{}'", id))
    }

    /// Stop one forward by id
    pub async fn stop_forward(&self, id: &str) -> Result<()> {
        if self.store.get(id).is_none() && !self.supervisor.is_running(id) {
            anyhow::bail!("Port forward '{}' not found", id);
        }

        let slot = id.to_string();
        self.blocking(move |s| s.stop(&slot))
            .await?
            .with_context(|| format!("Failed to stop '{}'", id))
    }

    /// Start definitions concurrently, skipping those already running
    async fn start_many(&self, definitions: Vec<TunnelDefinition>, report: &mut Report) {
        let mut tasks = JoinSet::new();
        for definition in definitions {
            if self.supervisor.is_running(&definition.id) {
                debug!(tunnel = %definition.id, "Already running, not starting again");
                continue;
            }
            let supervisor = Arc::clone(&self.supervisor);
            tasks.spawn_blocking(move || {
                let result = supervisor.start(&definition);
                (definition.id, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((id, Ok(()))) => report.started.push(id),
                Ok((id, Err(e))) => {
                    report.errors.insert(id, e.to_string());
                }
                Err(e) => error!("Start task failed: {}", e),
            }
        }
        report.started.sort();
    }

    /// Start every forward in the desired set
    pub async fn start_all(&self) -> Report {
        let mut report = Report::default();
        self.start_many(self.store.desired(), &mut report).await;
        info!(
            started = report.started.len(),
            failed = report.errors.len(),
            "Started desired forwards"
        );
        report
    }

    /// Re-read the configuration and reconcile running forwards
    ///
    /// Every configured forward is reconciled, whether or not it belongs to
    /// the active project. Changed forwards that were stopped are started
    /// again with their new definition. Added forwards are started only when
    /// they belong to the active project.
    pub async fn reload(&mut self) -> Result<Report> {
        info!("Reloading configuration...");

        self.store.reload()?;
        let previous = self.store.previous().to_vec();
        let current = self.store.definitions().to_vec();

        let result = self
            .blocking(move |s| s.reconcile(&previous, &current))
            .await??;
        let mut report = Report::from_reconciliation(&result);

        let mut restart: HashSet<&str> = result
            .stopped
            .iter()
            .filter(|id| result.updated.contains(id))
            .map(String::as_str)
            .collect();
        let project_members: HashSet<String> = match self.store.active_project() {
            Some(_) => self.store.desired().into_iter().map(|d| d.id).collect(),
            None => HashSet::new(),
        };
        restart.extend(
            result
                .added
                .iter()
                .filter(|id| project_members.contains(id.as_str()))
                .map(String::as_str),
        );

        let to_start: Vec<TunnelDefinition> = self
            .store
            .definitions()
            .iter()
            .filter(|d| restart.contains(d.id.as_str()))
            .cloned()
            .collect();
        self.start_many(to_start, &mut report).await;

        info!("Reload complete: {}", report);
        Ok(report)
    }

    /// Restart every running forward with its current definition
    pub async fn restart_all(&self) -> Result<Report> {
        let definitions = self.store.definitions().to_vec();
        let result = self
            .blocking(move |s| s.restart_running(&definitions))
            .await?;
        let report = Report::from_restart(&result);

        info!("Restart complete: {}", report);
        Ok(report)
    }

    /// Switch the active project
    ///
    /// Running forwards outside the new project are stopped first, then
    /// every forward of the project is started. Deactivating stops all.
    pub async fn activate_project(&mut self, project: Option<String>) -> Result<Report> {
        let target = match &project {
            Some(name) => self.store.project_definitions(name)?,
            None => Vec::new(),
        };
        let keep: HashSet<String> = target.iter().map(|d| d.id.clone()).collect();

        let to_stop: Vec<String> = self
            .supervisor
            .running_slots()
            .into_iter()
            .filter(|id| !keep.contains(id))
            .collect();
        let stopped = self
            .blocking(move |s| {
                to_stop
                    .into_iter()
                    .map(|id| {
                        let result = s.stop(&id);
                        (id, result)
                    })
                    .collect::<Vec<_>>()
            })
            .await?;

        let mut report = Report::default();
        for (id, result) in stopped {
            match result {
                Ok(()) => report.stopped.push(id),
                Err(e) => {
                    report.errors.insert(id, e.to_string());
                }
            }
        }

        self.store.set_active_project(project.as_deref())?;
        match &project {
            Some(name) => info!(project = %name, "Activated project"),
            None => info!("Deactivated project"),
        }

        self.start_many(target, &mut report).await;

        Ok(report)
    }

    /// Status of every configured forward plus any orphaned running one
    pub fn status(&self) -> DaemonStatus {
        let mut running: HashMap<String, _> = self
            .supervisor
            .snapshot()
            .into_iter()
            .map(|s| (s.id.clone(), s))
            .collect();
        let now = Utc::now();
        let uptime = |started: chrono::DateTime<Utc>| (now - started).num_seconds().max(0) as u64;

        let mut forwards: Vec<ForwardStatusInfo> = self
            .store
            .definitions()
            .iter()
            .map(|d| {
                let snapshot = running.remove(&d.id);
                ForwardStatusInfo {
                    id: d.id.clone(),
                    context: d.context.clone(),
                    namespace: d.namespace.clone(),
                    service: d.service.clone(),
                    port_local: d.port_local,
                    port_remote: d.port_remote,
                    running: snapshot.is_some(),
                    pid: snapshot.as_ref().and_then(|s| s.pid),
                    uptime_seconds: snapshot.map(|s| uptime(s.started_at)),
                }
            })
            .collect();

        let mut orphans: Vec<_> = running.into_values().collect();
        orphans.sort_by(|a, b| a.id.cmp(&b.id));
        for snapshot in orphans {
            forwards.push(ForwardStatusInfo {
                id: snapshot.id,
                context: String::new(),
                namespace: "-".to_string(),
                service: "-".to_string(),
                port_local: snapshot.port,
                port_remote: 0,
                running: true,
                pid: snapshot.pid,
                uptime_seconds: Some(uptime(snapshot.started_at)),
            });
        }

        DaemonStatus {
            active_project: self.store.active_project().map(str::to_string),
            forwards,
        }
    }

    async fn shutdown(&self) {
        let count = self.supervisor.running_count();
        if count > 0 {
            info!(count, "Stopping all forwards");
        }
        if let Err(e) = self.blocking(|s| s.cleanup_all()).await {
            error!("Cleanup failed: {}", e);
        }
    }
}

/// Ask the daemon to shut down once `signal` resolves
///
/// Used for Ctrl+C and SIGTERM so both run the same cleanup.
pub fn shutdown_on<F>(
    signal: F,
    name: &'static str,
    command_tx: mpsc::Sender<DaemonCommand>,
) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        signal.await;
        info!("Received {}, shutting down", name);
        if command_tx.send(DaemonCommand::Shutdown).await.is_err() {
            debug!("Daemon already stopped");
        }
    })
}

/// Accept IPC connections and forward their requests to the daemon
pub async fn serve_ipc(server: IpcServer, command_tx: mpsc::Sender<DaemonCommand>) {
    info!("IPC server listening at {:?}", server.path());
    loop {
        match server.accept().await {
            Ok(conn) => {
                tokio::spawn(handle_connection(conn, command_tx.clone()));
            }
            Err(e) => {
                error!("IPC accept error: {}", e);
                tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
            }
        }
    }
}

async fn handle_connection(mut conn: IpcConnection, command_tx: mpsc::Sender<DaemonCommand>) {
    loop {
        let request = match conn.recv().await {
            Ok(Some(request)) => request,
            Ok(None) => return,
            Err(e) => {
                warn!("IPC recv error: {}", e);
                let _ = conn
                    .send(&IpcResponse::Error {
                        message: format!("{:#}", e),
                    })
                    .await;
                return;
            }
        };

        debug!(?request, "IPC request");
        let response = dispatch(request, &command_tx).await;

        if let Err(e) = conn.send(&response).await {
            warn!("IPC send error: {}", e);
            return;
        }
    }
}

/// Send a command and wait for its reply
async fn ask<T>(
    command_tx: &mpsc::Sender<DaemonCommand>,
    make: impl FnOnce(Reply<T>) -> DaemonCommand,
) -> Result<T> {
    let (reply, rx) = oneshot::channel();
    command_tx
        .send(make(reply))
        .await
        .map_err(|_| anyhow::anyhow!("Daemon is shutting down"))?;
    rx.await.context("Daemon dropped the request")?
}

fn to_response(result: Result<String>) -> IpcResponse {
    match result {
        Ok(message) => IpcResponse::Ok {
            message: Some(message),
        },
        Err(e) => IpcResponse::Error {
            message: format!("{:#}", e),
        },
    }
}

/// Translate one IPC request into a daemon command
pub async fn dispatch(request: IpcRequest, command_tx: &mpsc::Sender<DaemonCommand>) -> IpcResponse {
    match request {
        IpcRequest::Ping => IpcResponse::Pong,

        IpcRequest::Status => {
            let (reply, rx) = oneshot::channel();
            if command_tx.send(DaemonCommand::Status(reply)).await.is_err() {
                return to_response(Err(anyhow::anyhow!("Daemon is shutting down")));
            }
            match rx.await {
                Ok(status) => IpcResponse::Status {
                    active_project: status.active_project,
                    forwards: status.forwards,
                },
                Err(_) => to_response(Err(anyhow::anyhow!("Daemon dropped the request"))),
            }
        }

        IpcRequest::Start { id } => {
            let slot = id.clone();
            to_response(
                ask(command_tx, |reply| DaemonCommand::Start(slot, reply))
                    .await
                    .map(|()| format!("Started '{}'", id)),
            )
        }

        IpcRequest::Stop { id } => {
            let slot = id.clone();
            to_response(
                ask(command_tx, |reply| DaemonCommand::Stop(slot, reply))
                    .await
                    .map(|()| format!("Stopped '{}'", id)),
            )
        }

        IpcRequest::Reload => to_response(
            ask(command_tx, DaemonCommand::Reload)
                .await
                .map(|report| report.to_string()),
        ),

        IpcRequest::RestartAll => to_response(
            ask(command_tx, DaemonCommand::RestartAll)
                .await
                .map(|report| report.to_string()),
        ),

        IpcRequest::Activate { project } => to_response(
            ask(command_tx, |reply| DaemonCommand::ActivateProject(project, reply))
                .await
                .map(|report| report.to_string()),
        ),

        IpcRequest::Shutdown => {
            if command_tx.send(DaemonCommand::Shutdown).await.is_err() {
                return to_response(Err(anyhow::anyhow!("Daemon is already shutting down")));
            }
            IpcResponse::Ok {
                message: Some("Daemon shutting down".to_string()),
            }
        }
    }
}
