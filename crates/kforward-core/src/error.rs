//! Error taxonomy for tunnel supervision

use thiserror::Error;

/// Classified failures returned by the supervisor and the launcher
#[derive(Debug, Error)]
pub enum TunnelError {
    /// Something outside this supervisor is already bound to the local port
    #[error("local port {port} is already in use")]
    PortInUse { port: u16 },

    /// Another forward owned by this supervisor holds the local port
    #[error("local port {port} is already reserved by active forward '{holder}'")]
    PortReserved { port: u16, holder: String },

    /// A start for the same forward has not returned yet
    #[error("forward '{id}' is already starting")]
    StartInProgress { id: String },

    /// The forwarding process could not be started or reported an early error
    #[error("{}", launch_failed_message(.message, .source))]
    LaunchFailed {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// The forwarding process exited before it could do any work
    #[error("port-forward exited immediately (stderr: {})", stderr_or_empty(.stderr))]
    ProcessExitedImmediately { stderr: String },

    /// Sending the termination signal to a tracked process failed
    #[error("failed to kill port-forward for '{id}': {source}")]
    Kill {
        id: String,
        #[source]
        source: std::io::Error,
    },

    /// A desired-state list contains the same identifier twice
    #[error("duplicate forward id '{0}' in desired state")]
    DuplicateId(String),

    /// A running forward has no definition in the current desired state
    #[error("forward '{0}' is no longer configured")]
    NotConfigured(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TunnelError {
    /// Whether the failure is a local port conflict (external or internal)
    pub fn is_port_conflict(&self) -> bool {
        matches!(
            self,
            TunnelError::PortInUse { .. } | TunnelError::PortReserved { .. }
        )
    }
}

fn launch_failed_message(message: &str, source: &Option<std::io::Error>) -> String {
    match source {
        Some(source) if message.is_empty() => format!("kubectl start failed: {}", source),
        Some(source) => format!("kubectl start failed (stderr: {}): {}", message, source),
        None => message.to_string(),
    }
}

fn stderr_or_empty(stderr: &str) -> &str {
    if stderr.is_empty() {
        "<empty>"
    } else {
        stderr
    }
}
