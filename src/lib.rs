//! Postgres metrics log drain
//!
//! Receives batches of syslog frames from a platform log drain, extracts the
//! periodic database metric samples and stores them per tenant as narrow
//! (`cpu_load`) and wide (`heroku_pg_stats`) JSON documents.
//!
//! # Modules
//!
//! - `frame`: octet-counted syslog frame decoding
//! - `extract`: logfmt metric extraction and timestamp parsing
//! - `routing`: source tag to tenant mapping
//! - `partition`: once-per-source partition initialization
//! - `document`, `writer`: metric documents and their persistence
//! - `store`: storage trait and its PostgreSQL implementation
//! - `ingest`: per-request batch processing
//! - `receiver`: HTTP surface

pub mod config;
pub mod document;
pub mod error;
pub mod extract;
pub mod frame;
pub mod ingest;
pub mod metrics;
pub mod partition;
pub mod receiver;
pub mod routing;
pub mod store;
pub mod writer;

pub use config::Config;
pub use document::{CpuLoadDocument, MetricTable, PgStatsDocument};
pub use error::{DrainError, Result, StorageError};
pub use extract::{extract, parse_timestamp, Extraction, MetricField, MetricRecord};
pub use frame::{FrameError, FrameReader, LogFrame, SyslogFrameCodec};
pub use ingest::{BatchSummary, Ingestor};
pub use metrics::IngestMetrics;
pub use partition::{InitOutcome, PartitionInitializer};
pub use receiver::LogReceiver;
pub use routing::RoutingTable;
pub use store::{MetricStore, PgMetricStore};
pub use writer::{MetricWriter, WriteOutcome};
