//! The FSM engine: attempt the next transition for one zone.

use std::sync::Arc;
use tracing::{info, warn};

use super::{ProcessRegistry, StepCtx, StepError, STOP_STATE};
use crate::error::{EnsembleError, Result};
use crate::metrics::{self, StepResult as StepMetric};
use crate::model::FsmStatus;
use crate::store::ZoneStore;
use crate::updater::UpdaterRegistry;

/// What one [`FsmEngine::step`] call did to a zone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// The transition's precondition, action, and post-condition all held;
    /// the target state was committed.
    Advanced {
        /// Process the zone is in.
        process: String,
        /// State stepped out of.
        from: String,
        /// State committed.
        to: String,
    },
    /// Precondition or action did not hold; state unchanged, status blocked.
    Blocked {
        /// The recorded stop reason.
        reason: String,
    },
    /// An invariant is violated; status stop, operator intervention needed.
    Stopped {
        /// The recorded stop reason.
        reason: String,
    },
    /// Nothing to do: the zone is idle or already at the stop sink.
    Idle,
}

/// Deterministic transition engine over the compiled-in process registry.
pub struct FsmEngine {
    registry: ProcessRegistry,
    store: Arc<dyn ZoneStore>,
    updaters: Arc<UpdaterRegistry>,
    record_ttl: u32,
}

impl FsmEngine {
    /// Create an engine over the standard process registry.
    pub fn new(store: Arc<dyn ZoneStore>, updaters: Arc<UpdaterRegistry>, record_ttl: u32) -> Self {
        Self {
            registry: ProcessRegistry::standard(),
            store,
            updaters,
            record_ttl,
        }
    }

    /// Attempt the next transition for the named zone.
    ///
    /// Exactly one of two states can be written: the declared target on
    /// success, or the unchanged source otherwise. Fatal conditions stop
    /// the zone; everything else blocks it with a reason and is retried on
    /// the next pass.
    pub async fn step(&self, zone_name: &str) -> Result<StepOutcome> {
        let timer = metrics::Timer::start();
        let zone = self
            .store
            .zone(zone_name)
            .ok_or_else(|| EnsembleError::not_found("zone", zone_name))?;

        if zone.fsm.is_empty() {
            return Ok(StepOutcome::Idle);
        }

        let Some(process) = self.registry.process(&zone.fsm) else {
            let reason = format!("unknown process {}", zone.fsm);
            self.stop_zone(zone_name, &reason);
            metrics::record_step(&zone.fsm, StepMetric::Stopped, timer.elapsed());
            return Ok(StepOutcome::Stopped { reason });
        };

        let state = if zone.fsm_state.is_empty() {
            process.initial
        } else {
            zone.fsm_state.as_str()
        };
        if state == STOP_STATE {
            self.store.set_fsm_status(zone_name, FsmStatus::Stop);
            metrics::record_step(process.name, StepMetric::Idle, timer.elapsed());
            return Ok(StepOutcome::Idle);
        }

        let Some(transition) = process.transition_from(state) else {
            let reason = format!("no transition from state {state} in process {}", process.name);
            self.stop_zone(zone_name, &reason);
            metrics::record_step(process.name, StepMetric::Stopped, timer.elapsed());
            return Ok(StepOutcome::Stopped { reason });
        };

        // a per-signer process without its signer set must not touch any
        // signer, not even in debug mode
        if process.requires_signer
            && zone.fsm_signer.as_deref().unwrap_or("").is_empty()
        {
            let reason = format!(
                "process {} requires a signer on zone {zone_name}, but none is set",
                process.name
            );
            self.stop_zone(zone_name, &reason);
            metrics::record_step(process.name, StepMetric::Stopped, timer.elapsed());
            return Ok(StepOutcome::Stopped { reason });
        }

        if zone.is_debug() {
            info!(
                zone = zone_name,
                transition = transition.name,
                "debug zone, transition automatically ok"
            );
            self.commit(zone_name, transition.to);
            metrics::record_step(process.name, StepMetric::Advanced, timer.elapsed());
            return Ok(StepOutcome::Advanced {
                process: process.name.to_string(),
                from: state.to_string(),
                to: transition.to.to_string(),
            });
        }

        let ctx = StepCtx {
            zone: zone.clone(),
            store: self.store.clone(),
            updaters: self.updaters.clone(),
            record_ttl: self.record_ttl,
        };

        for (phase, step_fn) in [
            ("precondition", transition.pre),
            ("action", transition.action),
            ("post-condition", transition.post),
        ] {
            match step_fn(&ctx).await {
                Ok(()) => {}
                Err(StepError::Blocked(reason)) => {
                    warn!(
                        zone = zone_name,
                        transition = transition.name,
                        phase,
                        reason, "step blocked"
                    );
                    self.store.set_fsm_status(zone_name, FsmStatus::Blocked);
                    self.store.set_stop_reason(zone_name, Some(&reason));
                    metrics::record_step(process.name, StepMetric::Blocked, timer.elapsed());
                    return Ok(StepOutcome::Blocked { reason });
                }
                Err(StepError::Fatal(reason)) => {
                    warn!(
                        zone = zone_name,
                        transition = transition.name,
                        phase,
                        reason, "step fatal"
                    );
                    self.stop_zone(zone_name, &reason);
                    metrics::record_step(process.name, StepMetric::Stopped, timer.elapsed());
                    return Ok(StepOutcome::Stopped { reason });
                }
            }
        }

        self.commit(zone_name, transition.to);
        info!(
            zone = zone_name,
            process = process.name,
            from = state,
            to = transition.to,
            "zone transitioned"
        );
        metrics::record_step(process.name, StepMetric::Advanced, timer.elapsed());
        Ok(StepOutcome::Advanced {
            process: process.name.to_string(),
            from: state.to_string(),
            to: transition.to.to_string(),
        })
    }

    fn commit(&self, zone: &str, to: &str) {
        self.store.set_fsm_state(zone, to);
        self.store.set_stop_reason(zone, None);
        if to == STOP_STATE {
            self.store.set_fsm_status(zone, FsmStatus::Stop);
        } else {
            self.store.set_fsm_status(zone, FsmStatus::Ok);
        }
    }

    fn stop_zone(&self, zone: &str, reason: &str) {
        self.store.set_fsm_status(zone, FsmStatus::Stop);
        self.store.set_stop_reason(zone, Some(reason));
    }
}
