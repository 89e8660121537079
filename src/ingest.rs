//! Batch ingestion
//!
//! [`Ingestor::process_batch`] drives one drain request through the pipeline:
//! decode frames, keep those of the metrics process, extract a record, route
//! it to a tenant, initialize the tenant's partitions once and write both
//! metric documents. Frames are handled in order; nothing in a batch fails
//! the request.

use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::IngestConfig;
use crate::extract::{self, minute_bucket, parse_timestamp};
use crate::frame::{FrameReader, LogFrame, SyslogFrameCodec, DEFAULT_MAX_FRAME_LENGTH};
use crate::metrics::{DropReason, IngestMetrics};
use crate::partition::{InitOutcome, PartitionInitializer};
use crate::routing::RoutingTable;
use crate::store::MetricStore;
use crate::writer::MetricWriter;

pub const DEFAULT_PROC_ID: &str = "heroku-postgres";

/// Per-request counters, returned as the HTTP response body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub frames: usize,
    pub matched: usize,
    pub written: usize,
    pub timestamp_failures: usize,
    pub unrouted: usize,
    pub write_failures: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub framing_error: Option<String>,
}

enum RecordOutcome {
    Written,
    WriteFailed(usize),
    InvalidTimestamp,
    Unrouted,
}

pub struct Ingestor {
    routes: RoutingTable,
    partitions: PartitionInitializer,
    writer: MetricWriter,
    proc_id: String,
    max_frame_length: usize,
    metrics: Arc<IngestMetrics>,
}

impl Ingestor {
    pub fn new(routes: RoutingTable, store: Arc<dyn MetricStore>, metrics: Arc<IngestMetrics>) -> Self {
        let partitions = PartitionInitializer::new(&routes, store.clone());
        Self {
            routes,
            partitions,
            writer: MetricWriter::new(store),
            proc_id: DEFAULT_PROC_ID.to_string(),
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            metrics,
        }
    }

    pub fn from_config(config: &IngestConfig, store: Arc<dyn MetricStore>, metrics: Arc<IngestMetrics>) -> Self {
        Self::new(RoutingTable::from_json(&config.sources), store, metrics)
            .with_proc_id(&config.proc_id)
            .with_max_frame_length(config.max_frame_length)
    }

    pub fn with_proc_id(mut self, proc_id: &str) -> Self {
        self.proc_id = proc_id.to_string();
        self
    }

    pub fn with_max_frame_length(mut self, max_frame_length: usize) -> Self {
        self.max_frame_length = max_frame_length;
        self
    }

    pub fn routes(&self) -> &RoutingTable {
        &self.routes
    }

    pub fn metrics(&self) -> &Arc<IngestMetrics> {
        &self.metrics
    }

    /// Process one request body. Frames before a framing error are still
    /// processed; the error itself is reported in the summary.
    pub async fn process_batch(&self, body: Bytes) -> BatchSummary {
        let codec = SyslogFrameCodec::with_max_length(self.max_frame_length);
        let mut reader = FrameReader::with_codec(body, codec);
        let mut summary = BatchSummary::default();

        for frame in reader.by_ref() {
            summary.frames += 1;
            let header = &frame.header;
            debug!(
                prival_version = %header.prival_version_str(),
                time_bucket = ?parse_timestamp(&header.timestamp_str()).ok().map(|at| minute_bucket(&at)),
                hostname = %header.hostname_str(),
                app_name = %header.app_name_str(),
                proc_id = %header.proc_id_str(),
                msg_id = %header.msg_id_str(),
                "Decoded frame"
            );
            if frame.header.proc_id_str() != self.proc_id {
                continue;
            }
            summary.matched += 1;

            match self.process_frame(&frame).await {
                RecordOutcome::Written => summary.written += 1,
                RecordOutcome::WriteFailed(tables) => summary.write_failures += tables,
                RecordOutcome::InvalidTimestamp => summary.timestamp_failures += 1,
                RecordOutcome::Unrouted => summary.unrouted += 1,
            }
        }

        summary.framing_error = reader.into_error().map(|e| e.to_string());
        self.metrics.record_batch(
            summary.frames as u64,
            summary.matched as u64,
            summary.framing_error.is_some(),
        );

        debug!(
            frames = summary.frames,
            matched = summary.matched,
            written = summary.written,
            "Batch processed"
        );
        summary
    }

    async fn process_frame(&self, frame: &LogFrame) -> RecordOutcome {
        let extraction = extract::extract(&frame.body);
        if !extraction.rejected.is_empty() {
            debug!(
                source = %extraction.record.source,
                rejected = ?extraction.rejected,
                "Metric fields with unparsable values stored as zero"
            );
            self.metrics.record_rejected_fields(extraction.rejected.len());
        }
        let record = extraction.record;
        debug!(record = ?record, "Parsed metric record");

        let at = match parse_timestamp(&frame.header.timestamp_str()) {
            Ok(at) => at,
            Err(e) => {
                warn!(source = %record.source, "Dropping record: {}", e);
                self.metrics.record_dropped(DropReason::InvalidTimestamp);
                return RecordOutcome::InvalidTimestamp;
            }
        };

        let Some(tenant) = self.routes.resolve(&record.source) else {
            debug!(source = %record.source, "No tenant configured for source");
            self.metrics.record_dropped(DropReason::UnknownSource);
            return RecordOutcome::Unrouted;
        };

        if let InitOutcome::Initialized { failures } = self.partitions.ensure_once(&record.source, at).await {
            self.metrics.record_partition_init(failures);
        }

        let outcome = self.writer.write(&record, at, tenant).await;
        let failed = outcome.failed_tables();
        match outcome.into_result() {
            Ok(()) => {
                self.metrics.record_written();
                RecordOutcome::Written
            }
            Err(e) => {
                debug!(source = %record.source, tenant, "Record not fully stored: {}", e);
                for table in &failed {
                    self.metrics.record_write_failure(table.table_name());
                }
                RecordOutcome::WriteFailed(failed.len())
            }
        }
    }
}
