//! kforward - keep kubectl port-forwards running from one declarative file

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use kforward_cli::config::SettingsManager;
use kforward_cli::daemon::{self, Daemon, DaemonCommand};
use kforward_cli::ipc::{self, IpcClient, IpcRequest, IpcResponse, IpcServer};
use kforward_cli::store::ConfigStore;
use kforward_core::{Supervisor, TunnelDefinition};

/// kforward - supervise kubectl port-forwards
#[derive(Parser, Debug)]
#[command(name = "kforward")]
#[command(about = "Supervise kubectl port-forwards from a declarative config", long_about = None)]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (default: ~/.kforward/config.yaml)
    #[arg(long, global = true, env = "KFORWARD_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the daemon in the foreground
    Daemon {
        /// Activate a project on startup
        #[arg(long)]
        project: Option<String>,
        /// Start every configured forward on startup
        #[arg(long, conflicts_with = "project")]
        start_all: bool,
        /// Also write logs to ~/.kforward/logs/kforward.log
        #[arg(long)]
        log_file: bool,
    },
    /// List configured port forwards
    List,
    /// Show the status of every forward in the running daemon
    Status,
    /// Start a port forward
    Start {
        /// Port forward id
        id: String,
    },
    /// Stop a port forward
    Stop {
        /// Port forward id
        id: String,
    },
    /// Reload the configuration file in the running daemon
    Reload,
    /// Restart every running port forward
    Restart,
    /// Manage projects
    Project {
        #[command(subcommand)]
        command: ProjectCommands,
    },
    /// Add a port forward to the configuration
    Add {
        /// Port forward id
        id: String,
        /// Kubernetes context (current context when omitted)
        #[arg(long, default_value = "")]
        context: String,
        #[arg(long)]
        namespace: String,
        /// Service name (without the svc/ prefix)
        #[arg(long)]
        service: String,
        #[arg(long)]
        remote_port: u16,
        #[arg(long)]
        local_port: u16,
    },
    /// Remove a port forward from the configuration
    Remove {
        /// Port forward id
        id: String,
    },
    /// Manage global settings
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand, Debug)]
enum ProjectCommands {
    /// List projects
    List,
    /// Activate a project in the running daemon
    Activate {
        /// Project name
        name: String,
    },
    /// Deactivate the current project and stop its forwards
    Deactivate,
    /// Create a project from existing forward ids
    Create {
        /// Project name
        name: String,
        /// Port forward ids
        forwards: Vec<String>,
    },
    /// Delete a project
    Delete {
        /// Project name
        name: String,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Show the current settings
    Show,
    /// Set the kubectl binary
    SetKubectl {
        /// Path to kubectl
        path: PathBuf,
    },
    /// Set how long to wait after spawning before checking kubectl
    SetSettle {
        /// Milliseconds
        millis: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_file = match &cli.command {
        Commands::Daemon { log_file: true, .. } => Some(log_file_path()?),
        _ => None,
    };
    init_logging(&cli.log_level, log_file.as_deref())?;

    let config_path = match cli.config {
        Some(path) => path,
        None => ConfigStore::default_path()?,
    };

    match cli.command {
        Commands::Daemon {
            project, start_all, ..
        } => run_daemon(&config_path, project, start_all).await,
        Commands::List => handle_list(&config_path),
        Commands::Status => handle_status().await,
        Commands::Start { id } => send_request(IpcRequest::Start { id }).await,
        Commands::Stop { id } => send_request(IpcRequest::Stop { id }).await,
        Commands::Reload => send_request(IpcRequest::Reload).await,
        Commands::Restart => send_request(IpcRequest::RestartAll).await,
        Commands::Project { command } => handle_project_command(&config_path, command).await,
        Commands::Add {
            id,
            context,
            namespace,
            service,
            remote_port,
            local_port,
        } => {
            let definition =
                TunnelDefinition::new(id, context, namespace, service, remote_port, local_port);
            handle_add(&config_path, definition)
        }
        Commands::Remove { id } => handle_remove(&config_path, &id),
        Commands::Config { command } => handle_config_command(command),
    }
}

async fn run_daemon(config_path: &Path, project: Option<String>, start_all: bool) -> Result<()> {
    info!("🚀 Daemon starting...");

    let settings = SettingsManager::load()?;
    let launcher = settings.launcher();
    info!(
        "Using kubectl at {:?} (settle {} ms)",
        launcher.program(),
        settings.settle_millis
    );

    let store = ConfigStore::open(config_path)?;
    let supervisor = Arc::new(Supervisor::new(Arc::new(launcher)));
    let mut daemon = Daemon::new(store, supervisor);

    let server = IpcServer::bind()
        .await
        .context("Failed to start IPC server")?;

    let (command_tx, command_rx) = mpsc::channel(32);
    let ipc_task = tokio::spawn(daemon::serve_ipc(server, command_tx.clone()));

    // Ctrl+C and SIGTERM shut down
    daemon::shutdown_on(
        async {
            if tokio::signal::ctrl_c().await.is_err() {
                std::future::pending::<()>().await;
            }
        },
        "Ctrl+C",
        command_tx.clone(),
    );
    let mut terminate =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    daemon::shutdown_on(
        async move {
            terminate.recv().await;
        },
        "SIGTERM",
        command_tx.clone(),
    );

    // SIGHUP reloads
    let mut hangup = signal(SignalKind::hangup())
        .context("Failed to install SIGHUP handler")?;
    let reload_tx = command_tx.clone();
    tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            info!("Received SIGHUP, reloading configuration");
            let (reply, rx) = oneshot::channel();
            if reload_tx.send(DaemonCommand::Reload(reply)).await.is_err() {
                break;
            }
            match rx.await {
                Ok(Ok(report)) => info!("Reload: {}", report),
                Ok(Err(e)) => error!("Reload failed: {:#}", e),
                Err(_) => break,
            }
        }
    });

    // Signals queued during startup are handled once the loop runs
    if let Some(name) = project {
        let report = daemon.activate_project(Some(name)).await?;
        info!("Project activated: {}", report);
    } else if start_all {
        let report = daemon.start_all().await;
        info!("Startup: {}", report);
    }

    drop(command_tx);
    daemon.run(command_rx).await?;

    ipc_task.abort();
    let _ = ipc_task.await;
    Ok(())
}

async fn connect() -> Result<IpcClient> {
    IpcClient::connect()
        .await
        .context("Daemon is not running (start it with 'kforward daemon')")
}

async fn send_request(request: IpcRequest) -> Result<()> {
    let mut client = connect().await?;
    match client.request(&request).await? {
        IpcResponse::Ok { message } => {
            if let Some(message) = message {
                println!("✅ {}", message);
            }
            Ok(())
        }
        IpcResponse::Error { message } => Err(anyhow::anyhow!(message)),
        other => Err(anyhow::anyhow!("Unexpected response from daemon: {:?}", other)),
    }
}

async fn handle_status() -> Result<()> {
    let mut client = connect().await?;
    match client.request(&IpcRequest::Status).await? {
        IpcResponse::Status {
            active_project,
            forwards,
        } => {
            ipc::print_status_table(active_project.as_deref(), &forwards);
            Ok(())
        }
        IpcResponse::Error { message } => Err(anyhow::anyhow!(message)),
        other => Err(anyhow::anyhow!("Unexpected response from daemon: {:?}", other)),
    }
}

fn handle_list(config_path: &Path) -> Result<()> {
    let store = ConfigStore::open(config_path)?;

    if store.definitions().is_empty() {
        println!("No port forwards configured in {:?}", store.path());
        return Ok(());
    }

    println!(
        "{:<20} {:<16} {:<28} PORTS",
        "ID", "CONTEXT", "SERVICE"
    );
    for definition in store.definitions() {
        let context = if definition.context.is_empty() {
            "-"
        } else {
            definition.context.as_str()
        };
        println!(
            "{:<20} {:<16} {:<28} {}->{}",
            definition.id,
            context,
            format!("{}/{}", definition.namespace, definition.service),
            definition.port_local,
            definition.port_remote
        );
    }

    Ok(())
}

async fn handle_project_command(config_path: &Path, command: ProjectCommands) -> Result<()> {
    match command {
        ProjectCommands::List => {
            let store = ConfigStore::open(config_path)?;
            if store.projects().is_empty() {
                println!("No projects configured.");
                return Ok(());
            }

            // The active project lives in the daemon; show it when one is running
            let active = match IpcClient::connect().await {
                Ok(mut client) => match client.request(&IpcRequest::Status).await {
                    Ok(IpcResponse::Status { active_project, .. }) => active_project,
                    _ => None,
                },
                Err(_) => None,
            };

            for project in store.projects() {
                let marker = if active.as_deref() == Some(project.name.as_str()) {
                    "●"
                } else {
                    " "
                };
                println!(
                    "{} {:<20} {}",
                    marker,
                    project.name,
                    project.forwards.join(", ")
                );
            }
            Ok(())
        }
        ProjectCommands::Activate { name } => {
            send_request(IpcRequest::Activate {
                project: Some(name),
            })
            .await
        }
        ProjectCommands::Deactivate => send_request(IpcRequest::Activate { project: None }).await,
        ProjectCommands::Create { name, forwards } => {
            let mut store = ConfigStore::open(config_path)?;
            store.create_project(&name, forwards)?;
            store.save()?;
            println!("✅ Project '{}' created", name.trim());
            Ok(())
        }
        ProjectCommands::Delete { name } => {
            let mut store = ConfigStore::open(config_path)?;
            store.delete_project(&name)?;
            store.save()?;
            println!("✅ Project '{}' deleted", name);
            Ok(())
        }
    }
}

fn handle_add(config_path: &Path, definition: TunnelDefinition) -> Result<()> {
    let mut store = ConfigStore::open(config_path)?;
    let summary = definition.to_string();
    store.add_forward(definition)?;
    store.save()?;
    println!("✅ Added {}", summary);
    println!("   Run 'kforward reload' to make a running daemon pick it up");
    Ok(())
}

fn handle_remove(config_path: &Path, id: &str) -> Result<()> {
    let mut store = ConfigStore::open(config_path)?;
    store.remove_forward(id)?;
    store.save()?;
    println!("✅ Removed '{}'", id);
    println!("   Run 'kforward reload' to stop it in a running daemon");
    Ok(())
}

fn handle_config_command(command: ConfigCommands) -> Result<()> {
    match command {
        ConfigCommands::Show => {
            let settings = SettingsManager::load()?;
            println!("Settings file: {:?}", SettingsManager::settings_path()?);
            println!(
                "{}",
                serde_json::to_string_pretty(&settings).context("Failed to serialize settings")?
            );
            println!("Effective kubectl: {:?}", settings.kubectl_program());
            Ok(())
        }
        ConfigCommands::SetKubectl { path } => {
            SettingsManager::set_kubectl(path.clone())?;
            println!("✅ kubectl set to {:?}", path);
            Ok(())
        }
        ConfigCommands::SetSettle { millis } => {
            SettingsManager::set_settle(millis)?;
            println!("✅ Settle window set to {} ms", millis);
            Ok(())
        }
    }
}

fn log_file_path() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Failed to get home directory")?;
    Ok(home.join(".kforward").join("logs").join("kforward.log"))
}

fn init_logging(log_level: &str, log_file: Option<&Path>) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))
        .context("Failed to initialize logging filter")?;

    let file_layer = match log_file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create log directory: {:?}", parent))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file: {:?}", path))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();

    Ok(())
}
