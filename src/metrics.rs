//! Ingestion counters exported in Prometheus text format

use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

use crate::error::Result;

/// Why a record did not reach the writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    InvalidTimestamp,
    UnknownSource,
}

impl DropReason {
    fn label(self) -> &'static str {
        match self {
            DropReason::InvalidTimestamp => "invalid_timestamp",
            DropReason::UnknownSource => "unknown_source",
        }
    }
}

pub struct IngestMetrics {
    registry: Registry,
    batches: IntCounter,
    framing_errors: IntCounter,
    frames: IntCounter,
    frames_matched: IntCounter,
    records_written: IntCounter,
    records_dropped: IntCounterVec,
    rejected_fields: IntCounter,
    write_failures: IntCounterVec,
    partition_inits: IntCounterVec,
}

impl IngestMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let batches = IntCounter::new("drain_batches_total", "Log drain requests processed")?;
        let framing_errors = IntCounter::new(
            "drain_framing_errors_total",
            "Batches whose frame decoding stopped on a malformed or truncated frame",
        )?;
        let frames = IntCounter::new("drain_frames_total", "Syslog frames decoded")?;
        let frames_matched = IntCounter::new(
            "drain_frames_matched_total",
            "Frames emitted by the database metrics process",
        )?;
        let records_written = IntCounter::new(
            "drain_records_written_total",
            "Metric records whose documents were all written",
        )?;
        let records_dropped = IntCounterVec::new(
            Opts::new("drain_records_dropped_total", "Metric records dropped before writing"),
            &["reason"],
        )?;
        let rejected_fields = IntCounter::new(
            "drain_rejected_fields_total",
            "Recognized metric samples with unparsable values (stored as zero)",
        )?;
        let write_failures = IntCounterVec::new(
            Opts::new("drain_write_failures_total", "Metric document writes that failed"),
            &["table"],
        )?;
        let partition_inits = IntCounterVec::new(
            Opts::new("drain_partition_inits_total", "Partition initialization attempts"),
            &["outcome"],
        )?;

        registry.register(Box::new(batches.clone()))?;
        registry.register(Box::new(framing_errors.clone()))?;
        registry.register(Box::new(frames.clone()))?;
        registry.register(Box::new(frames_matched.clone()))?;
        registry.register(Box::new(records_written.clone()))?;
        registry.register(Box::new(records_dropped.clone()))?;
        registry.register(Box::new(rejected_fields.clone()))?;
        registry.register(Box::new(write_failures.clone()))?;
        registry.register(Box::new(partition_inits.clone()))?;

        Ok(Self {
            registry,
            batches,
            framing_errors,
            frames,
            frames_matched,
            records_written,
            records_dropped,
            rejected_fields,
            write_failures,
            partition_inits,
        })
    }

    pub fn record_batch(&self, frames: u64, matched: u64, framing_error: bool) {
        self.batches.inc();
        self.frames.inc_by(frames);
        self.frames_matched.inc_by(matched);
        if framing_error {
            self.framing_errors.inc();
        }
    }

    pub fn record_written(&self) {
        self.records_written.inc();
    }

    pub fn record_dropped(&self, reason: DropReason) {
        self.records_dropped.with_label_values(&[reason.label()]).inc();
    }

    pub fn record_rejected_fields(&self, count: usize) {
        self.rejected_fields.inc_by(count as u64);
    }

    pub fn record_write_failure(&self, table: &str) {
        self.write_failures.with_label_values(&[table]).inc();
    }

    pub fn record_partition_init(&self, failures: usize) {
        let outcome = if failures == 0 { "ok" } else { "failed" };
        self.partition_inits.with_label_values(&[outcome]).inc();
    }

    /// Prometheus text exposition of every counter.
    pub fn export(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}
