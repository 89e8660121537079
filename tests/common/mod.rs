use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::Semaphore;

use pgstats_drain::{IngestMetrics, Ingestor, MetricStore, MetricTable, RoutingTable, StorageError};

#[allow(dead_code)]
pub const PROC_ID: &str = "heroku-postgres";

#[allow(dead_code)]
pub const FULL_BODY: &str = "source=DATABASE addon=postgresql-defined-24903 \
sample#load-avg-1m=0.285 sample#load-avg-5m=0.345 sample#load-avg-15m=0.39 \
sample#read-iops=0 sample#write-iops=2.597 sample#tmp-disk-used=543633408 \
sample#tmp-disk-available=72435159040 sample#memory-total=3944484kB \
sample#memory-free=74980kB sample#memory-cached=2984436kB \
sample#memory-postgres=33960kB sample#wal-percentage-used=0.0665";

/// One storage call, in the order the store saw it.
#[derive(Debug, Clone)]
pub enum StoreCall {
    Ensure {
        metric: String,
        at: DateTime<Utc>,
    },
    Write {
        table: MetricTable,
        at: DateTime<Utc>,
        tenant: String,
        data: Value,
    },
}

/// In-memory store that records every call.
#[derive(Default)]
pub struct RecordingStore {
    calls: Mutex<Vec<StoreCall>>,
    held: Mutex<HashMap<DateTime<Utc>, Arc<Semaphore>>>,
    failing: Mutex<HashSet<MetricTable>>,
}

#[allow(dead_code)]
impl RecordingStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Block `ensure_partitions` calls for `at` until the returned gate gets permits.
    pub fn hold_init_at(&self, at: DateTime<Utc>) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        self.held.lock().unwrap().insert(at, gate.clone());
        gate
    }

    pub fn fail_writes_to(&self, table: MetricTable) {
        self.failing.lock().unwrap().insert(table);
    }

    pub fn calls(&self) -> Vec<StoreCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn ensures(&self) -> Vec<(String, DateTime<Utc>)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                StoreCall::Ensure { metric, at } => Some((metric, at)),
                _ => None,
            })
            .collect()
    }

    pub fn writes(&self) -> Vec<(MetricTable, String, Value)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                StoreCall::Write { table, tenant, data, .. } => Some((table, tenant, data)),
                _ => None,
            })
            .collect()
    }

    pub fn writes_for(&self, tenant: &str) -> Vec<(MetricTable, Value)> {
        self.writes()
            .into_iter()
            .filter(|(_, t, _)| t == tenant)
            .map(|(table, _, data)| (table, data))
            .collect()
    }
}

#[async_trait]
impl MetricStore for RecordingStore {
    async fn ping(&self) -> Result<(), StorageError> {
        Ok(())
    }

    async fn ensure_partitions(&self, metric: &str, at: DateTime<Utc>) -> Result<(), StorageError> {
        let gate = self.held.lock().unwrap().get(&at).cloned();
        if let Some(gate) = gate {
            let permit = gate
                .acquire()
                .await
                .map_err(|e| StorageError::Unavailable(e.to_string()))?;
            permit.forget();
        }

        self.calls.lock().unwrap().push(StoreCall::Ensure {
            metric: metric.to_string(),
            at,
        });
        Ok(())
    }

    async fn write_metric(
        &self,
        table: MetricTable,
        at: DateTime<Utc>,
        tenant: &str,
        payload: &[u8],
    ) -> Result<(), StorageError> {
        if self.failing.lock().unwrap().contains(&table) {
            return Err(StorageError::Unavailable(format!("{} rejected the insert", table)));
        }

        let data = serde_json::from_slice(payload).map_err(|e| StorageError::Payload(e.to_string()))?;
        self.calls.lock().unwrap().push(StoreCall::Write {
            table,
            at,
            tenant: tenant.to_string(),
            data,
        });
        Ok(())
    }
}

/// Octet-counted syslog frame from the metrics process.
#[allow(dead_code)]
pub fn pg_frame(timestamp: &str, body: &str) -> String {
    frame(PROC_ID, timestamp, body)
}

#[allow(dead_code)]
pub fn frame(proc_id: &str, timestamp: &str, body: &str) -> String {
    let message = format!("<134>1 {} host app {} - {}", timestamp, proc_id, body);
    format!("{} {}\n", message.len(), message)
}

#[allow(dead_code)]
pub fn routes(pairs: &[(&str, &str)]) -> RoutingTable {
    pairs
        .iter()
        .map(|(source, tenant)| (source.to_string(), tenant.to_string()))
        .collect()
}

#[allow(dead_code)]
pub fn ingestor(routes: RoutingTable, store: Arc<RecordingStore>) -> Ingestor {
    let metrics = Arc::new(IngestMetrics::new().expect("metrics registry"));
    Ingestor::new(routes, store, metrics)
}
