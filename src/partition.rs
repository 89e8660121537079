//! Per-source partition initialization
//!
//! The first record seen for a source triggers one `ensure_partitions` call per
//! metric table. Each source owns an [`InitLatch`]; the latch table is built
//! from the routing table at startup and never changes afterwards, so lookups
//! need no lock and sources never contend with each other.
//!
//! Callers that lose the race wait for the winner, so no record of a source is
//! written before its initialization attempt has finished. The attempt runs
//! on its own task: a request that is cancelled while initializing does not
//! cancel the initialization. Failures are logged and not retried; the
//! attempt still counts.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::document::MetricTable;
use crate::error::DrainError;
use crate::routing::RoutingTable;
use crate::store::MetricStore;

const UNSTARTED: u8 = 0;
const RUNNING: u8 = 1;
const DONE: u8 = 2;

/// How a caller got past the latch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatchOutcome {
    /// This caller ran the initialization.
    Ran,
    /// Another caller ran it; this one waited for it to finish.
    Waited,
    /// Initialization had already finished.
    AlreadyDone,
}

/// Run-once latch: `unstarted -> running -> done`.
#[derive(Debug, Default)]
pub struct InitLatch {
    state: AtomicU8,
    done: Notify,
}

/// Marks the latch done when dropped, including when the initialization task
/// panics or is torn down with the runtime, so waiters are always released.
struct DoneOnDrop<'a>(&'a InitLatch);

impl Drop for DoneOnDrop<'_> {
    fn drop(&mut self) {
        self.0.state.store(DONE, Ordering::Release);
        self.0.done.notify_waiters();
    }
}

impl InitLatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_done(&self) -> bool {
        self.state.load(Ordering::Acquire) == DONE
    }

    /// Run `init` if no caller has started it yet, otherwise wait until the
    /// running attempt completes.
    ///
    /// `init` is spawned onto the runtime and owns the `running -> done`
    /// transition, so dropping the returned future never leaves the latch
    /// half-run.
    pub async fn run_once<F, Fut>(self: &Arc<Self>, init: F) -> LatchOutcome
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        match self
            .state
            .compare_exchange(UNSTARTED, RUNNING, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                let latch = Arc::clone(self);
                let attempt = init();
                let task = tokio::spawn(async move {
                    let _guard = DoneOnDrop(&latch);
                    attempt.await;
                });
                if let Err(e) = task.await {
                    warn!("Partition initialization task did not complete: {}", e);
                }
                LatchOutcome::Ran
            }
            Err(DONE) => LatchOutcome::AlreadyDone,
            Err(_) => {
                self.wait_done().await;
                LatchOutcome::Waited
            }
        }
    }

    async fn wait_done(&self) {
        loop {
            let notified = self.done.notified();
            tokio::pin!(notified);
            // Register before re-checking so a notify_waiters between
            // the check and the await is not lost.
            notified.as_mut().enable();
            if self.is_done() {
                return;
            }
            notified.await;
        }
    }
}

/// Result of [`PartitionInitializer::ensure_once`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitOutcome {
    /// This call performed the initialization; `failures` tables could not be ensured.
    Initialized { failures: usize },
    /// Another call performed it.
    Skipped(LatchOutcome),
    /// The source has no latch (not in the routing table).
    UnknownSource,
}

/// Owns one latch per configured source.
pub struct PartitionInitializer {
    latches: HashMap<String, Arc<InitLatch>>,
    store: Arc<dyn MetricStore>,
}

impl PartitionInitializer {
    pub fn new(routes: &RoutingTable, store: Arc<dyn MetricStore>) -> Self {
        let latches = routes
            .sources()
            .map(|source| (source.to_string(), Arc::new(InitLatch::new())))
            .collect();
        Self { latches, store }
    }

    /// Ensure partitions for every metric table the first time `source` is seen.
    pub async fn ensure_once(&self, source: &str, at: DateTime<Utc>) -> InitOutcome {
        let Some(latch) = self.latches.get(source) else {
            return InitOutcome::UnknownSource;
        };

        let failures = Arc::new(AtomicUsize::new(0));
        let failed = Arc::clone(&failures);
        let store = Arc::clone(&self.store);
        let source_tag = source.to_string();
        let outcome = latch
            .run_once(move || async move {
                let source = source_tag.as_str();
                info!(source, %at, "Creating metric tables and partitions if missing");
                for table in MetricTable::ALL {
                    if let Err(e) = store.ensure_partitions(table.table_name(), at).await {
                        let err = DrainError::PartitionError {
                            metric: table.table_name().to_string(),
                            source: e,
                        };
                        warn!(source, "{}", err);
                        failed.fetch_add(1, Ordering::Relaxed);
                    }
                }
            })
            .await;

        match outcome {
            LatchOutcome::Ran => InitOutcome::Initialized {
                failures: failures.load(Ordering::Relaxed),
            },
            other => {
                debug!(source, ?other, "Partitions already handled for source");
                InitOutcome::Skipped(other)
            }
        }
    }
}
