//! Metric document writer
//! Persists the narrow and wide documents of a record, each independently

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error};

use crate::document::{self, MetricTable};
use crate::error::{DrainError, Result};
use crate::extract::MetricRecord;
use crate::store::MetricStore;

/// Per-table results of one [`MetricWriter::write`] call.
#[derive(Debug)]
pub struct WriteOutcome {
    pub narrow: Result<()>,
    pub wide: Result<()>,
}

impl WriteOutcome {
    /// Tables whose write failed.
    pub fn failed_tables(&self) -> Vec<MetricTable> {
        let mut failed = Vec::new();
        if self.narrow.is_err() {
            failed.push(MetricTable::Narrow);
        }
        if self.wide.is_err() {
            failed.push(MetricTable::Wide);
        }
        failed
    }

    /// First error, narrow table first.
    pub fn into_result(self) -> Result<()> {
        self.narrow?;
        self.wide
    }
}

pub struct MetricWriter {
    store: Arc<dyn MetricStore>,
}

impl MetricWriter {
    pub fn new(store: Arc<dyn MetricStore>) -> Self {
        Self { store }
    }

    /// Write both documents for `record`. A failure on one table does not
    /// stop the other; nothing is retried.
    pub async fn write(&self, record: &MetricRecord, at: DateTime<Utc>, tenant: &str) -> WriteOutcome {
        let narrow = self.write_table(MetricTable::Narrow, record, at, tenant).await;
        let wide = self.write_table(MetricTable::Wide, record, at, tenant).await;
        WriteOutcome { narrow, wide }
    }

    async fn write_table(
        &self,
        table: MetricTable,
        record: &MetricRecord,
        at: DateTime<Utc>,
        tenant: &str,
    ) -> Result<()> {
        let payload = document::encode(table, record).map_err(|e| {
            error!(%table, "could not marshal metric document: {}", e);
            DrainError::SerializationError {
                table,
                message: e.to_string(),
            }
        })?;

        match self.store.write_metric(table, at, tenant, &payload).await {
            Ok(()) => {
                debug!(%table, tenant, %at, bytes = payload.len(), "Metric document written");
                Ok(())
            }
            Err(source) => {
                error!(%table, tenant, "Metric write failed: {}", source);
                Err(DrainError::WriteError { table, source })
            }
        }
    }
}
