//! Supervision of local `kubectl port-forward` tunnels
//!
//! The [`Supervisor`] owns every live forwarding process and the table of
//! local ports they hold. Processes are started through a [`Launcher`], which
//! is [`KubectlLauncher`] outside of tests.

pub mod definition;
pub mod error;
pub mod launcher;
pub mod probe;
pub mod reconcile;
pub mod supervisor;

pub use definition::TunnelDefinition;
pub use error::TunnelError;
pub use launcher::{ForwardProcess, KubectlLauncher, KubectlProcess, Launcher, DEFAULT_SETTLE};
pub use probe::is_port_available;
pub use reconcile::ReconciliationResult;
pub use supervisor::{RestartResult, RunningSnapshot, Supervisor};
