//! Tunnel supervisor
//!
//! Owns the reservation table (local port → slot) and the running map
//! (slot → live process). Both live behind one mutex so that a reservation
//! and its running entry always change together. The only long operation,
//! the launch, runs with the lock released.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, info, warn};

use crate::definition::TunnelDefinition;
use crate::error::TunnelError;
use crate::launcher::{ForwardProcess, Launcher};

/// A live process bound to one slot
pub(crate) struct RunningTunnel {
    pub(crate) process: Box<dyn ForwardProcess>,
    pub(crate) port: u16,
    pub(crate) started_at: DateTime<Utc>,
}

#[derive(Default)]
pub(crate) struct State {
    pub(crate) reservations: HashMap<u16, String>,
    pub(crate) running: HashMap<String, RunningTunnel>,
}

/// Point-in-time view of one running forward
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunningSnapshot {
    pub id: String,
    pub port: u16,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
}

/// Outcome of [`Supervisor::restart_running`]
#[derive(Debug, Default)]
pub struct RestartResult {
    pub restarted: usize,
    pub errors: BTreeMap<String, TunnelError>,
}

/// Supervises forwarding processes, one per slot, one slot per local port
pub struct Supervisor {
    launcher: Arc<dyn Launcher + Send + Sync>,
    state: Mutex<State>,
}

impl Supervisor {
    pub fn new(launcher: Arc<dyn Launcher + Send + Sync>) -> Self {
        Self {
            launcher,
            state: Mutex::new(State::default()),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start the forward for a definition
    ///
    /// A no-op when the slot is already running. The local port is reserved
    /// before the launch and released again if the launch fails.
    pub fn start(&self, definition: &TunnelDefinition) -> Result<(), TunnelError> {
        let id = definition.id.as_str();
        let port = definition.port_local;

        {
            let mut state = self.lock();

            if state.running.contains_key(id) {
                debug!(tunnel = %id, "Start requested but forward is already running");
                return Ok(());
            }

            if let Some(holder) = state.reservations.get(&port) {
                if holder != id {
                    warn!(tunnel = %id, port, holder = %holder, "Local port reserved by another forward");
                    return Err(TunnelError::PortReserved {
                        port,
                        holder: holder.clone(),
                    });
                }
            }

            if state.reservations.values().any(|holder| holder == id) {
                debug!(tunnel = %id, "Start requested while a start is already in flight");
                return Err(TunnelError::StartInProgress { id: id.to_string() });
            }

            state.reservations.insert(port, id.to_string());
            debug!(tunnel = %id, port, "Reserved local port");
        }

        let outcome = self.launcher.launch(definition);

        let mut state = self.lock();
        match outcome {
            Err(e) => {
                if state.reservations.get(&port).map(String::as_str) == Some(id) {
                    state.reservations.remove(&port);
                    debug!(tunnel = %id, port, "Released reservation after failed start");
                }
                error!(tunnel = %id, port, "Failed to start forward: {}", e);
                Err(e)
            }
            Ok(mut process) => {
                match state.reservations.get(&port) {
                    Some(holder) if holder != id => {
                        let holder = holder.clone();
                        drop(state);
                        warn!(tunnel = %id, port, holder = %holder, "Reservation taken over during start, discarding new process");
                        if let Err(e) = process.kill() {
                            warn!(tunnel = %id, "Failed to kill discarded process: {}", e);
                        }
                        return Err(TunnelError::PortReserved { port, holder });
                    }
                    Some(_) => {}
                    None => {
                        debug!(tunnel = %id, port, "Re-claiming reservation cleared during start");
                        state.reservations.insert(port, id.to_string());
                    }
                }

                let pid = process.pid();
                state.running.insert(
                    id.to_string(),
                    RunningTunnel {
                        process,
                        port,
                        started_at: Utc::now(),
                    },
                );
                info!(tunnel = %id, port, pid = ?pid, "✅ Forward started");
                Ok(())
            }
        }
    }

    /// Stop the forward in a slot; a no-op when it is not running
    pub fn stop(&self, id: &str) -> Result<(), TunnelError> {
        let mut state = self.lock();
        Self::stop_locked(&mut state, id)
    }

    /// Stop path shared by every caller that already holds the lock
    ///
    /// The reservation is released before the kill and the slot is removed
    /// even when the kill fails.
    pub(crate) fn stop_locked(state: &mut State, id: &str) -> Result<(), TunnelError> {
        let Some(mut tunnel) = state.running.remove(id) else {
            debug!(tunnel = %id, "Stop requested but forward is not running");
            return Ok(());
        };

        if state.reservations.get(&tunnel.port).map(String::as_str) == Some(id) {
            state.reservations.remove(&tunnel.port);
        }

        match tunnel.process.kill() {
            Ok(()) => {
                info!(tunnel = %id, port = tunnel.port, "Forward stopped");
                Ok(())
            }
            Err(source) => {
                error!(tunnel = %id, port = tunnel.port, "Failed to kill forward process: {}", source);
                Err(TunnelError::Kill {
                    id: id.to_string(),
                    source,
                })
            }
        }
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.lock().running.contains_key(id)
    }

    /// Stop every running forward and reset all bookkeeping
    pub fn cleanup_all(&self) {
        let mut state = self.lock();
        let mut ids: Vec<String> = state.running.keys().cloned().collect();
        ids.sort();

        if !ids.is_empty() {
            info!(count = ids.len(), "Cleaning up all forwards");
        }

        for id in ids {
            if let Err(e) = Self::stop_locked(&mut state, &id) {
                warn!(tunnel = %id, "Error during cleanup: {}", e);
            }
        }

        state.running.clear();
        state.reservations.clear();
    }

    /// Stop and start every running forward with its current definition
    pub fn restart_running(&self, current: &[TunnelDefinition]) -> RestartResult {
        let ids = self.running_slots();
        let index: HashMap<&str, &TunnelDefinition> =
            current.iter().map(|d| (d.id.as_str(), d)).collect();
        let mut result = RestartResult::default();

        info!(count = ids.len(), "Restarting running forwards");

        for id in ids {
            if let Err(e) = self.stop(&id) {
                result.errors.insert(id, e);
                continue;
            }

            match index.get(id.as_str()) {
                None => {
                    warn!(tunnel = %id, "Running forward has no current definition, left stopped");
                    result
                        .errors
                        .insert(id.clone(), TunnelError::NotConfigured(id));
                }
                Some(definition) => match self.start(definition) {
                    Ok(()) => result.restarted += 1,
                    Err(e) => {
                        result.errors.insert(id, e);
                    }
                },
            }
        }

        result
    }

    pub fn running_count(&self) -> usize {
        self.lock().running.len()
    }

    /// Ids of all running slots, sorted
    pub fn running_slots(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().running.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn snapshot(&self) -> Vec<RunningSnapshot> {
        let state = self.lock();
        let mut snapshot: Vec<RunningSnapshot> = state
            .running
            .iter()
            .map(|(id, tunnel)| RunningSnapshot {
                id: id.clone(),
                port: tunnel.port,
                pid: tunnel.process.pid(),
                started_at: tunnel.started_at,
            })
            .collect();
        snapshot.sort_by(|a, b| a.id.cmp(&b.id));
        snapshot
    }

    /// Current holder of a local port reservation
    pub fn reservation_holder(&self, port: u16) -> Option<String> {
        self.lock().reservations.get(&port).cloned()
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.cleanup_all();
    }
}
