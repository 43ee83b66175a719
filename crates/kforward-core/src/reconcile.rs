//! Reconciliation between two desired-state lists
//!
//! Stops are eager and starts are lazy: anything removed or changed is
//! stopped in this pass, while added and updated slots are only reported so
//! the caller can start them explicitly.

use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info, warn};

use crate::definition::TunnelDefinition;
use crate::error::TunnelError;
use crate::supervisor::Supervisor;

/// What a reconciliation pass did
#[derive(Debug, Default)]
pub struct ReconciliationResult {
    /// Slots whose process was stopped
    pub stopped: Vec<String>,
    /// Slots present in both lists with changed parameters
    pub updated: Vec<String>,
    /// Slots only present in the new list (not started)
    pub added: Vec<String>,
    /// Slots whose stop failed
    pub errors: BTreeMap<String, TunnelError>,
}

impl ReconciliationResult {
    pub fn is_noop(&self) -> bool {
        self.stopped.is_empty()
            && self.updated.is_empty()
            && self.added.is_empty()
            && self.errors.is_empty()
    }
}

fn index_by_id(list: &[TunnelDefinition]) -> Result<HashMap<&str, &TunnelDefinition>, TunnelError> {
    let mut index = HashMap::with_capacity(list.len());
    for definition in list {
        if index.insert(definition.id.as_str(), definition).is_some() {
            return Err(TunnelError::DuplicateId(definition.id.clone()));
        }
    }
    Ok(index)
}

impl Supervisor {
    /// Move the running set from the `old` desired list to the `new` one
    ///
    /// Holds the supervisor lock for the whole pass. Fails with
    /// [`TunnelError::DuplicateId`] before touching anything if either list
    /// repeats an id.
    pub fn reconcile(
        &self,
        old: &[TunnelDefinition],
        new: &[TunnelDefinition],
    ) -> Result<ReconciliationResult, TunnelError> {
        let old_index = index_by_id(old)?;
        let new_index = index_by_id(new)?;

        let mut result = ReconciliationResult::default();
        let mut state = self.lock();

        for previous in old {
            let id = previous.id.as_str();
            let changed = match new_index.get(id) {
                Some(current) => previous.params_changed(current),
                None => true,
            };
            if !changed || !state.running.contains_key(id) {
                continue;
            }

            match Self::stop_locked(&mut state, id) {
                Ok(()) => result.stopped.push(id.to_string()),
                Err(e) => {
                    warn!(tunnel = %id, "Failed to stop forward during reconcile: {}", e);
                    result.errors.insert(id.to_string(), e);
                }
            }
        }

        for current in new {
            let id = current.id.as_str();
            match old_index.get(id) {
                Some(previous) if previous.params_changed(current) => {
                    debug!(tunnel = %id, "Forward definition changed");
                    result.updated.push(id.to_string());
                }
                Some(_) => {}
                None => {
                    debug!(tunnel = %id, "Forward definition added");
                    result.added.push(id.to_string());
                }
            }
        }

        info!(
            stopped = result.stopped.len(),
            updated = result.updated.len(),
            added = result.added.len(),
            errors = result.errors.len(),
            "Reconciliation complete"
        );

        Ok(result)
    }
}
