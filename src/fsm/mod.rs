//! Finite state machine processes driving multi-signer operations.
//!
//! A process is a named directed graph of transitions keyed by source
//! state. Each transition carries three step functions: a precondition
//! (verifies externally observable state, usually via live signer
//! queries), an action (side-effectful updates against signers), and a
//! post-condition (a declared extension point, currently always
//! satisfied). The registry is populated from compiled-in definitions at
//! startup and immutable thereafter.

pub mod add;
pub mod engine;
pub mod leave;

use futures::future::BoxFuture;
use futures::FutureExt;
use hickory_proto::rr::{Name, Record, RecordType};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use crate::model::{Signer, SignerGroup, Zone};
use crate::store::ZoneStore;
use crate::updater::UpdaterRegistry;

pub use engine::{FsmEngine, StepOutcome};

/// The distinguished sink state every process ends in.
pub const STOP_STATE: &str = "stop";

/// Why a step did not complete.
#[derive(Debug)]
pub enum StepError {
    /// The precondition or action did not hold; the step will be retried.
    /// Carries the human-readable stop reason recorded on the zone.
    Blocked(String),
    /// An invariant is violated; the zone is stopped until an operator
    /// intervenes.
    Fatal(String),
}

/// Result of one step function.
pub type StepResult = std::result::Result<(), StepError>;

/// A precondition, action, or post-condition over a zone.
pub type StepFn = for<'a> fn(&'a StepCtx) -> BoxFuture<'a, StepResult>;

/// One step of a process.
pub struct Transition {
    /// Step name, for logs.
    pub name: &'static str,
    /// Source state.
    pub from: &'static str,
    /// Target state committed when the step succeeds.
    pub to: &'static str,
    /// Human description of the step.
    pub description: &'static str,
    /// Precondition; may perform live signer queries.
    pub pre: StepFn,
    /// Action; performs signer updates.
    pub action: StepFn,
    /// Post-condition; reserved, currently always satisfied.
    pub post: StepFn,
}

/// A named process: a graph of transitions with one initial state.
pub struct Process {
    /// Process name as stored on zones.
    pub name: &'static str,
    /// State a zone starts in when entering this process.
    pub initial: &'static str,
    /// Whether the process is parameterized on `Zone.fsm_signer`.
    pub requires_signer: bool,
    /// The transitions, keyed by their `from` state.
    pub transitions: &'static [Transition],
}

impl Process {
    /// The transition leaving the given state, if any.
    pub fn transition_from(&self, state: &str) -> Option<&'static Transition> {
        self.transitions.iter().find(|t| t.from == state)
    }
}

/// Immutable collection of the compiled-in processes.
pub struct ProcessRegistry {
    processes: HashMap<&'static str, &'static Process>,
}

impl ProcessRegistry {
    /// The standard registry: ADD-SIGNER and REMOVE-SIGNER.
    pub fn standard() -> Self {
        let mut processes = HashMap::new();
        for p in [&add::ADD_SIGNER, &leave::REMOVE_SIGNER] {
            processes.insert(p.name, p);
        }
        Self { processes }
    }

    /// Look up a process by name.
    pub fn process(&self, name: &str) -> Option<&'static Process> {
        self.processes.get(name).copied()
    }

    /// Names of all registered processes.
    pub fn names(&self) -> Vec<&'static str> {
        self.processes.keys().copied().collect()
    }
}

/// Everything a step function needs: the zone snapshot and handles to the
/// store and updater registry.
pub struct StepCtx {
    /// Snapshot of the zone being stepped.
    pub zone: Zone,
    /// The zone store.
    pub store: Arc<dyn ZoneStore>,
    /// Updaters, selected per signer method.
    pub updaters: Arc<UpdaterRegistry>,
    /// TTL for records this system publishes.
    pub record_ttl: u32,
}

impl StepCtx {
    /// The zone apex as a parsed name.
    pub fn apex(&self) -> std::result::Result<Name, StepError> {
        Name::from_ascii(&self.zone.name)
            .map_err(|e| StepError::Fatal(format!("zone name {} invalid: {e}", self.zone.name)))
    }

    /// The zone's signer group; a zone without one is unrecoverable.
    pub fn group(&self) -> std::result::Result<SignerGroup, StepError> {
        self.store.signer_group(&self.zone.signer_group).ok_or_else(|| {
            StepError::Fatal(format!(
                "zone {} in process {} not attached to any signer group",
                self.zone.name, self.zone.fsm
            ))
        })
    }

    /// The signer parameterizing this process (joining or leaving),
    /// resolved through the store regardless of group membership.
    pub fn process_signer(&self) -> std::result::Result<Signer, StepError> {
        let name = self
            .zone
            .fsm_signer
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                StepError::Fatal(format!("process signer for zone {} unset", self.zone.name))
            })?;
        self.store
            .signer(name)
            .ok_or_else(|| StepError::Fatal(format!("unable to get process signer {name}")))
    }

    /// Resolve the group's member signers, optionally skipping one (a
    /// leaving signer may or may not still appear in the member set; steps
    /// always skip it there and address it explicitly instead).
    pub fn member_signers(
        &self,
        group: &SignerGroup,
        skip: Option<&str>,
    ) -> std::result::Result<Vec<Signer>, StepError> {
        group
            .members
            .iter()
            .filter(|name| skip != Some(name.as_str()))
            .map(|name| {
                self.store.signer(name).ok_or_else(|| {
                    StepError::Fatal(format!(
                        "group {} references unknown signer {name}",
                        group.name
                    ))
                })
            })
            .collect()
    }

    /// Members plus the joining signer, deduplicated. The joining signer is
    /// usually still in `pending_add` and so absent from the member set.
    pub fn signers_with(
        &self,
        group: &SignerGroup,
        extra: &Signer,
    ) -> std::result::Result<Vec<Signer>, StepError> {
        let mut signers = self.member_signers(group, Some(&extra.name))?;
        signers.push(extra.clone());
        Ok(signers)
    }

    /// Fetch one RRset from one signer through its updater. A failure
    /// blocks the step with a reason naming the signer.
    pub async fn fetch(
        &self,
        signer: &Signer,
        rtype: RecordType,
    ) -> std::result::Result<Vec<Record>, StepError> {
        let updater = self
            .updaters
            .get(signer.method)
            .map_err(|e| StepError::Fatal(e.to_string()))?;
        updater
            .fetch_rrset(signer, &self.zone.name, &self.zone.name, rtype)
            .await
            .map_err(|e| {
                StepError::Blocked(format!(
                    "unable to fetch {rtype} from {}: {e}",
                    signer.name
                ))
            })
    }

    /// Publish inserts/removes to one signer through its updater.
    pub async fn publish(
        &self,
        signer: &Signer,
        inserts: &[Record],
        removes: &[Record],
        what: &str,
    ) -> std::result::Result<(), StepError> {
        let updater = self
            .updaters
            .get(signer.method)
            .map_err(|e| StepError::Fatal(e.to_string()))?;
        updater
            .update(signer, &self.zone.name, &self.zone.name, inserts, removes)
            .await
            .map_err(|e| {
                StepError::Blocked(format!(
                    "unable to update {} with {what}: {e}",
                    signer.name
                ))
            })?;
        info!(zone = %self.zone.name, signer = %signer.name, what, "signer updated");
        Ok(())
    }

    /// Remove whole RRsets at the apex of one signer.
    pub async fn remove_rrsets(
        &self,
        signer: &Signer,
        rtypes: &[RecordType],
        what: &str,
    ) -> std::result::Result<(), StepError> {
        let updater = self
            .updaters
            .get(signer.method)
            .map_err(|e| StepError::Fatal(e.to_string()))?;
        updater
            .remove_rrset(signer, &self.zone.name, &self.zone.name, rtypes)
            .await
            .map_err(|e| {
                StepError::Blocked(format!(
                    "unable to remove {what} from {}: {e}",
                    signer.name
                ))
            })
    }
}

/// Precondition used by steps with no criteria.
pub fn pre_true(_ctx: &StepCtx) -> BoxFuture<'_, StepResult> {
    async { Ok(()) }.boxed()
}

/// Post-condition placeholder; every transition currently uses it.
pub fn post_true(_ctx: &StepCtx) -> BoxFuture<'_, StepResult> {
    async { Ok(()) }.boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_registry_contents() {
        let registry = ProcessRegistry::standard();
        let mut names = registry.names();
        names.sort();
        assert_eq!(names, vec!["ADD-SIGNER", "REMOVE-SIGNER"]);
        assert!(registry.process("GROUP-SYNC").is_none());
    }

    #[test]
    fn test_process_graphs_reach_stop() {
        // every process must walk from its initial state to the stop sink
        for process in [&add::ADD_SIGNER, &leave::REMOVE_SIGNER] {
            let mut state = process.initial;
            let mut hops = 0;
            while state != STOP_STATE {
                let transition = process
                    .transition_from(state)
                    .unwrap_or_else(|| panic!("{}: dead end at {state}", process.name));
                state = transition.to;
                hops += 1;
                assert!(hops <= process.transitions.len(), "{}: cycle", process.name);
            }
        }
    }

    #[test]
    fn test_transition_sources_unique() {
        for process in [&add::ADD_SIGNER, &leave::REMOVE_SIGNER] {
            let mut sources: Vec<&str> = process.transitions.iter().map(|t| t.from).collect();
            let len = sources.len();
            sources.sort();
            sources.dedup();
            assert_eq!(sources.len(), len, "{}: duplicate source state", process.name);
        }
    }
}
