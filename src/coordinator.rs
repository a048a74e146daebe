//! Coordinator: composition root and auto-push scheduler.
//!
//! Owns the updater registry and the rate-limited op managers, and
//! periodically drives every `auto` zone one FSM step forward per pass.
//! Zones that reach stop are left alone until externally unblocked.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::ProviderApi;
use crate::config::Config;
use crate::dns::DdnsClient;
use crate::error::{EnsembleError, Result};
use crate::fsm::{FsmEngine, StepOutcome};
use crate::metrics::{self, Timer};
use crate::model::SignerMethod;
use crate::ratelimit::OpManager;
use crate::store::ZoneStore;
use crate::updater::{
    DdnsExecutor, DdnsUpdater, NoneUpdater, QueuedUpdater, RestExecutor, UpdaterRegistry,
};

/// Interval for emitting state metrics.
const METRICS_INTERVAL: Duration = Duration::from_secs(10);

/// Build the process-wide updater registry: one updater per method tag,
/// with rate-limited lanes spawned for the throttled transports.
pub fn build_updaters(
    config: &Config,
    shutdown: CancellationToken,
) -> Result<UpdaterRegistry> {
    let client = DdnsClient::new(Duration::from_secs(config.engine.dns_timeout_secs));
    let mut registry = UpdaterRegistry::new();

    registry.register(
        SignerMethod::Ddns,
        Arc::new(DdnsUpdater::new(client.clone())),
    );
    registry.register(
        SignerMethod::None,
        Arc::new(NoneUpdater::new(client.clone())),
    );

    let ddns_manager = OpManager::spawn(
        "rlddns",
        Arc::new(DdnsExecutor::new(client)),
        config.signers.ddns.limits,
        shutdown.child_token(),
    );
    registry.register(
        SignerMethod::RlDdns,
        Arc::new(QueuedUpdater::new(ddns_manager)),
    );

    for (name, provider_config) in config.providers.configured() {
        let api = Arc::new(ProviderApi::new(name, provider_config, &config.tls)?);
        let manager = OpManager::spawn(
            name,
            Arc::new(RestExecutor::new(api, config.engine.record_ttl)),
            provider_config.limits,
            shutdown.child_token(),
        );
        let method = match name {
            "desec" => SignerMethod::Desec,
            "google" => SignerMethod::Google,
            "aws" => SignerMethod::Aws,
            other => {
                return Err(EnsembleError::Config(format!(
                    "unknown provider {other}"
                )))
            }
        };
        registry.register(method, Arc::new(QueuedUpdater::new(manager)));
    }

    Ok(registry)
}

/// Periodically emit store metrics.
async fn metrics_loop(store: Arc<dyn ZoneStore>, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(METRICS_INTERVAL);

    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                debug!("metrics loop shutting down");
                return;
            }

            _ = interval.tick() => {
                let (zones, signers, groups) = store.counts();
                metrics::record_state_counts(zones, signers, groups);
                let (ok, blocked, stopped) = store.status_counts();
                metrics::record_zone_status_counts(ok, blocked, stopped);
            }
        }
    }
}

/// The multi-signer coordination daemon.
pub struct Coordinator {
    config: Config,
    store: Arc<dyn ZoneStore>,
}

impl Coordinator {
    /// Create a coordinator over the given store.
    pub fn new(config: Config, store: Arc<dyn ZoneStore>) -> Self {
        Self { config, store }
    }

    /// Run the coordinator until the shutdown token is cancelled.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        info!(
            push_interval_secs = self.config.engine.push_interval_secs,
            "starting ensemble-dns coordinator"
        );

        let updaters = Arc::new(build_updaters(&self.config, shutdown.clone())?);
        let engine = Arc::new(FsmEngine::new(
            self.store.clone(),
            updaters,
            self.config.engine.record_ttl,
        ));

        let metrics_handle = tokio::spawn(metrics_loop(self.store.clone(), shutdown.clone()));

        let mut interval =
            tokio::time::interval(Duration::from_secs(self.config.engine.push_interval_secs));
        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!("coordinator shutdown requested");
                    break;
                }

                _ = interval.tick() => {
                    push_zones(&engine, self.store.as_ref()).await;
                }
            }
        }

        let _ = metrics_handle.await;
        info!("coordinator stopped");
        Ok(())
    }
}

/// One pass: a single step attempt per auto zone.
async fn push_zones(engine: &FsmEngine, store: &dyn ZoneStore) {
    let timer = Timer::start();
    let zones = store.auto_zones();
    if zones.is_empty() {
        return;
    }

    debug!(count = zones.len(), "pushing auto zones");
    for zone in &zones {
        match engine.step(&zone.name).await {
            Ok(StepOutcome::Advanced { from, to, .. }) => {
                info!(zone = %zone.name, from, to, "zone advanced");
            }
            Ok(StepOutcome::Blocked { reason }) => {
                debug!(zone = %zone.name, reason, "zone blocked");
            }
            Ok(StepOutcome::Stopped { reason }) => {
                warn!(zone = %zone.name, reason, "zone stopped");
            }
            Ok(StepOutcome::Idle) => {}
            Err(e) => {
                warn!(zone = %zone.name, error = %e, "step failed");
            }
        }
    }
    metrics::record_push_pass(zones.len(), timer.elapsed());
}
