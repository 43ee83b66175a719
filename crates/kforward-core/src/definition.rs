//! Desired-state tunnel definitions

use serde::{Deserialize, Serialize};
use std::fmt;

/// A single desired port-forward: one remote service port exposed on one local port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelDefinition {
    /// Human-readable unique identifier, also the supervisor slot key
    pub id: String,

    /// Kubernetes context (empty means the current kubectl context)
    #[serde(default)]
    pub context: String,

    pub namespace: String,

    pub service: String,

    /// Target port on the service
    pub port_remote: u16,

    /// Local port the forward listens on
    pub port_local: u16,
}

impl TunnelDefinition {
    pub fn new(
        id: impl Into<String>,
        context: impl Into<String>,
        namespace: impl Into<String>,
        service: impl Into<String>,
        port_remote: u16,
        port_local: u16,
    ) -> Self {
        Self {
            id: id.into(),
            context: context.into(),
            namespace: namespace.into(),
            service: service.into(),
            port_remote,
            port_local,
        }
    }

    /// Whether any parameter that affects the running process differs
    pub fn params_changed(&self, other: &TunnelDefinition) -> bool {
        self.context != other.context
            || self.namespace != other.namespace
            || self.service != other.service
            || self.port_remote != other.port_remote
            || self.port_local != other.port_local
            || self.id != other.id
    }
}

impl fmt::Display for TunnelDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let context = if self.context.is_empty() {
            "(current context)"
        } else {
            &self.context
        };
        write!(
            f,
            "{} [{}] {}/{} {} -> {}",
            self.id, context, self.namespace, self.service, self.port_local, self.port_remote
        )
    }
}
