//! Rate-limited signer op manager.
//!
//! Per transport there are two independent lanes, fetch and update, each
//! with an ops-per-minute cap. A lane owns an inbound channel, a FIFO
//! queue, and a 60-second ticker; each tick resets the budget and drains up
//! to `limit` ops. When the remote end signals throttling the worker sleeps
//! for the hinted hold and retries the same op without consuming another
//! slot, so within a lane ops always complete in enqueue order.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use hickory_proto::rr::{Record, RecordType};

use crate::config::RateLimits;
use crate::error::{EnsembleError, Result};
use crate::metrics::{self, OpResult};
use crate::model::Signer;

/// Channel capacity for each lane's inbound queue.
const LANE_CHANNEL_CAPACITY: usize = 256;

/// Interval between lane ticks.
const TICK_PERIOD: Duration = Duration::from_secs(60);

/// What a signer op does once it reaches the front of its lane.
#[derive(Debug)]
pub enum OpKind {
    /// Fetch one RRset.
    Fetch {
        /// Record type to query.
        rtype: RecordType,
    },
    /// Apply inserts, single-RR removes, and whole-RRset removes.
    Update {
        /// Records to insert.
        inserts: Vec<Record>,
        /// Records to remove individually.
        removes: Vec<Record>,
        /// RRset types to remove entirely.
        remove_rrsets: Vec<RecordType>,
    },
}

/// A reified fetch/update request against one signer.
#[derive(Debug)]
pub struct SignerOp {
    /// The signer to talk to.
    pub signer: Signer,
    /// The zone the op belongs to.
    pub zone: String,
    /// Owner name the op addresses.
    pub owner: String,
    /// Fetch or update.
    pub kind: OpKind,
    /// Single-use response slot; written exactly once.
    pub reply: oneshot::Sender<Result<SignerOpResult>>,
}

/// The completion value written to an op's response slot.
#[derive(Debug, Default)]
pub struct SignerOpResult {
    /// Fetched records; empty for updates.
    pub rrs: Vec<Record>,
}

/// Outcome of one execution attempt, as seen by the lane worker.
#[derive(Debug)]
pub enum OpDisposition {
    /// The op finished (successfully or not); release it to the caller.
    Done(Result<SignerOpResult>),
    /// The remote asked us to wait; retry the same op after the hold.
    Throttled {
        /// Seconds to sleep before retrying.
        hold: Duration,
    },
}

/// Performs the actual network call for ops of one transport.
#[async_trait]
pub trait OpExecutor: Send + Sync + 'static {
    /// Execute one attempt of the op.
    async fn execute(&self, op: &SignerOp) -> OpDisposition;
}

/// Handle to one transport's pair of lanes.
#[derive(Debug, Clone)]
pub struct OpManager {
    transport: &'static str,
    fetch_tx: mpsc::Sender<SignerOp>,
    update_tx: mpsc::Sender<SignerOp>,
}

impl OpManager {
    /// Spawn the fetch and update lane workers for one transport.
    pub fn spawn(
        transport: &'static str,
        executor: Arc<dyn OpExecutor>,
        limits: RateLimits,
        shutdown: CancellationToken,
    ) -> Self {
        let (fetch_tx, fetch_rx) = mpsc::channel(LANE_CHANNEL_CAPACITY);
        let (update_tx, update_rx) = mpsc::channel(LANE_CHANNEL_CAPACITY);

        tokio::spawn(lane_worker(
            transport,
            "fetch",
            fetch_rx,
            limits.fetch,
            executor.clone(),
            shutdown.clone(),
        ));
        tokio::spawn(lane_worker(
            transport,
            "update",
            update_rx,
            limits.update,
            executor,
            shutdown,
        ));

        info!(
            transport,
            fetch_limit = limits.fetch,
            update_limit = limits.update,
            "rate-limited op manager started"
        );

        Self {
            transport,
            fetch_tx,
            update_tx,
        }
    }

    /// Box a request as a [`SignerOp`], enqueue it on the right lane, and
    /// wait for its response slot. Blocks for up to a full tick period plus
    /// any throttle holds the remote imposes.
    pub async fn submit(
        &self,
        signer: Signer,
        zone: &str,
        owner: &str,
        kind: OpKind,
    ) -> Result<SignerOpResult> {
        let signer_name = signer.name.clone();
        let (reply, reply_rx) = oneshot::channel();
        let op = SignerOp {
            signer,
            zone: zone.to_string(),
            owner: owner.to_string(),
            kind,
            reply,
        };

        let lane = match op.kind {
            OpKind::Fetch { .. } => &self.fetch_tx,
            OpKind::Update { .. } => &self.update_tx,
        };
        lane.send(op).await.map_err(|_| {
            EnsembleError::Transport(format!(
                "{} op manager is shut down (op for {signer_name})",
                self.transport
            ))
        })?;
        match reply_rx.await {
            Ok(result) => result,
            Err(_) => Err(EnsembleError::Transport(format!(
                "{} op manager dropped the op for {signer_name}",
                self.transport
            ))),
        }
    }
}

/// One lane: accept ops, and on each tick drain up to `limit` of them.
async fn lane_worker(
    transport: &'static str,
    lane: &'static str,
    mut rx: mpsc::Receiver<SignerOp>,
    limit: u32,
    executor: Arc<dyn OpExecutor>,
    shutdown: CancellationToken,
) {
    let mut queue: VecDeque<SignerOp> = VecDeque::new();
    // first tick fires a full period from now, like the original minute ticker
    let mut ticker =
        tokio::time::interval_at(tokio::time::Instant::now() + TICK_PERIOD, TICK_PERIOD);

    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                info!(transport, lane, queued = queue.len(), "lane worker shutting down");
                return;
            }

            maybe_op = rx.recv() => {
                match maybe_op {
                    Some(op) => queue.push_back(op),
                    None => {
                        debug!(transport, lane, "all op senders dropped, lane worker exiting");
                        return;
                    }
                }
            }

            _ = ticker.tick() => {
                metrics::record_lane_depth(transport, lane, queue.len());
                debug!(transport, lane, queued = queue.len(), limit, "lane tick");

                let mut budget = limit;
                while budget > 0 {
                    let Some(op) = queue.pop_front() else { break };
                    budget -= 1;
                    run_op(transport, lane, op, executor.as_ref()).await;
                }
            }
        }
    }
}

/// Execute one op to completion, looping on throttle holds, then write its
/// response slot.
async fn run_op(transport: &'static str, lane: &'static str, op: SignerOp, executor: &dyn OpExecutor) {
    let result = loop {
        match executor.execute(&op).await {
            OpDisposition::Done(result) => break result,
            OpDisposition::Throttled { hold } => {
                warn!(
                    transport,
                    lane,
                    signer = %op.signer.name,
                    hold_secs = hold.as_secs(),
                    "remote throttled, holding before retry"
                );
                metrics::record_throttle(transport, lane, hold.as_secs());
                tokio::time::sleep(hold).await;
            }
        }
    };

    metrics::record_op(
        transport,
        lane,
        if result.is_ok() {
            OpResult::Success
        } else {
            OpResult::Error
        },
    );

    let SignerOp { reply, .. } = op;
    let _ = reply.send(result);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SignerMethod;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_signer() -> Signer {
        Signer {
            name: "s1.example.".to_string(),
            method: SignerMethod::RlDdns,
            address: "10.0.0.1".to_string(),
            port: 53,
            auth: "key:c2VjcmV0".to_string(),
        }
    }

    struct CountingExecutor {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl OpExecutor for CountingExecutor {
        async fn execute(&self, _op: &SignerOp) -> OpDisposition {
            self.calls.fetch_add(1, Ordering::SeqCst);
            OpDisposition::Done(Ok(SignerOpResult::default()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_ops_wait_for_tick() {
        let executor = Arc::new(CountingExecutor {
            calls: AtomicUsize::new(0),
        });
        let shutdown = CancellationToken::new();
        let manager = OpManager::spawn(
            "test",
            executor.clone(),
            RateLimits {
                fetch: 10,
                update: 10,
            },
            shutdown.clone(),
        );

        let submit = tokio::spawn({
            let manager = manager.clone();
            async move {
                manager
                    .submit(
                        test_signer(),
                        "example.com.",
                        "example.com.",
                        OpKind::Fetch {
                            rtype: RecordType::DNSKEY,
                        },
                    )
                    .await
            }
        });

        // nothing runs before the first tick
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(executor.calls.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(31)).await;
        submit.await.unwrap().unwrap();
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);

        shutdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_refuses_new_ops() {
        let executor = Arc::new(CountingExecutor {
            calls: AtomicUsize::new(0),
        });
        let shutdown = CancellationToken::new();
        let manager = OpManager::spawn(
            "test",
            executor,
            RateLimits {
                fetch: 1,
                update: 1,
            },
            shutdown.clone(),
        );

        shutdown.cancel();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let result = manager
            .submit(
                test_signer(),
                "example.com.",
                "example.com.",
                OpKind::Fetch {
                    rtype: RecordType::DNSKEY,
                },
            )
            .await;
        assert!(result.is_err());
    }
}
