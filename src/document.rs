//! Persisted metric documents
//! JSON payloads stored in the `data` column of the metric tables

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::extract::MetricRecord;

/// Destination table of a metric document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricTable {
    /// Load averages only (`cpu_load`).
    Narrow,
    /// Every extracted sample (`heroku_pg_stats`).
    Wide,
}

impl MetricTable {
    /// Partitions are ensured in this order on first sight of a source.
    pub const ALL: [MetricTable; 2] = [MetricTable::Wide, MetricTable::Narrow];

    pub fn table_name(self) -> &'static str {
        match self {
            MetricTable::Narrow => "cpu_load",
            MetricTable::Wide => "heroku_pg_stats",
        }
    }
}

impl fmt::Display for MetricTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table_name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CpuLoadDocument {
    pub load_1min: f64,
    pub load_5min: f64,
    pub load_15min: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PgStatsDocument {
    #[serde(flatten)]
    pub load: CpuLoadDocument,

    pub readiops: f64,
    pub writeiops: f64,

    pub tmpdiskused: i64,
    pub tmpdiskavailable: i64,

    pub memorytotal: i64,
    pub memoryfree: i64,
    pub memorycached: i64,
    pub memorypostgres: i64,

    pub walpercentageused: f64,
}

impl From<&MetricRecord> for CpuLoadDocument {
    fn from(record: &MetricRecord) -> Self {
        Self {
            load_1min: record.load_avg_1m,
            load_5min: record.load_avg_5m,
            load_15min: record.load_avg_15m,
        }
    }
}

impl From<&MetricRecord> for PgStatsDocument {
    fn from(record: &MetricRecord) -> Self {
        Self {
            load: CpuLoadDocument::from(record),
            readiops: record.read_iops,
            writeiops: record.write_iops,
            tmpdiskused: record.tmp_disk_used,
            tmpdiskavailable: record.tmp_disk_available,
            memorytotal: record.memory_total,
            memoryfree: record.memory_free,
            memorycached: record.memory_cached,
            memorypostgres: record.memory_postgres,
            walpercentageused: record.wal_percentage_used,
        }
    }
}

/// Serialize the document for `table` built from `record`.
pub fn encode(table: MetricTable, record: &MetricRecord) -> serde_json::Result<Vec<u8>> {
    match table {
        MetricTable::Narrow => serde_json::to_vec(&CpuLoadDocument::from(record)),
        MetricTable::Wide => serde_json::to_vec(&PgStatsDocument::from(record)),
    }
}
