//! Metric extraction from heroku-postgres log bodies
//!
//! A body is a sequence of logfmt `key=value` tokens. Only a fixed set of keys
//! is recognized; everything else is ignored. Extraction never fails: a value
//! that does not parse is stored as zero and reported in
//! [`Extraction::rejected`] so callers can log it.

use std::borrow::Cow;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{DrainError, Result};

/// Unit suffix carried by the memory samples.
const KILOBYTE_SUFFIX: &str = "kB";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldKind {
    Float,
    Integer,
    Kilobytes,
}

/// Numeric samples recognized in a metric line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricField {
    LoadAvg1m,
    LoadAvg5m,
    LoadAvg15m,
    ReadIops,
    WriteIops,
    TmpDiskUsed,
    TmpDiskAvailable,
    MemoryTotal,
    MemoryFree,
    MemoryCached,
    MemoryPostgres,
    WalPercentageUsed,
}

impl MetricField {
    pub const ALL: [MetricField; 12] = [
        MetricField::LoadAvg1m,
        MetricField::LoadAvg5m,
        MetricField::LoadAvg15m,
        MetricField::ReadIops,
        MetricField::WriteIops,
        MetricField::TmpDiskUsed,
        MetricField::TmpDiskAvailable,
        MetricField::MemoryTotal,
        MetricField::MemoryFree,
        MetricField::MemoryCached,
        MetricField::MemoryPostgres,
        MetricField::WalPercentageUsed,
    ];

    /// The logfmt key this field is read from.
    pub fn key(self) -> &'static str {
        match self {
            MetricField::LoadAvg1m => "sample#load-avg-1m",
            MetricField::LoadAvg5m => "sample#load-avg-5m",
            MetricField::LoadAvg15m => "sample#load-avg-15m",
            MetricField::ReadIops => "sample#read-iops",
            MetricField::WriteIops => "sample#write-iops",
            MetricField::TmpDiskUsed => "sample#tmp-disk-used",
            MetricField::TmpDiskAvailable => "sample#tmp-disk-available",
            MetricField::MemoryTotal => "sample#memory-total",
            MetricField::MemoryFree => "sample#memory-free",
            MetricField::MemoryCached => "sample#memory-cached",
            MetricField::MemoryPostgres => "sample#memory-postgres",
            MetricField::WalPercentageUsed => "sample#wal-percentage-used",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|field| field.key() == key)
    }

    fn kind(self) -> FieldKind {
        match self {
            MetricField::LoadAvg1m
            | MetricField::LoadAvg5m
            | MetricField::LoadAvg15m
            | MetricField::ReadIops
            | MetricField::WriteIops
            | MetricField::WalPercentageUsed => FieldKind::Float,
            MetricField::TmpDiskUsed | MetricField::TmpDiskAvailable => FieldKind::Integer,
            MetricField::MemoryTotal
            | MetricField::MemoryFree
            | MetricField::MemoryCached
            | MetricField::MemoryPostgres => FieldKind::Kilobytes,
        }
    }
}

/// Parsed content of one heroku-postgres metric line.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricRecord {
    /// Attachment name of the database (e.g. `DATABASE`); used for routing.
    pub source: String,
    pub addon: String,

    pub load_avg_1m: f64,
    pub load_avg_5m: f64,
    pub load_avg_15m: f64,

    pub read_iops: f64,
    pub write_iops: f64,

    pub tmp_disk_used: i64,
    pub tmp_disk_available: i64,

    /// Memory samples, in kB.
    pub memory_total: i64,
    pub memory_free: i64,
    pub memory_cached: i64,
    pub memory_postgres: i64,

    pub wal_percentage_used: f64,
}

/// A recognized field whose value could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedField {
    pub field: MetricField,
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extraction {
    pub record: MetricRecord,
    pub rejected: Vec<RejectedField>,
}

impl MetricRecord {
    fn set_float(&mut self, field: MetricField, value: f64) {
        match field {
            MetricField::LoadAvg1m => self.load_avg_1m = value,
            MetricField::LoadAvg5m => self.load_avg_5m = value,
            MetricField::LoadAvg15m => self.load_avg_15m = value,
            MetricField::ReadIops => self.read_iops = value,
            MetricField::WriteIops => self.write_iops = value,
            MetricField::WalPercentageUsed => self.wal_percentage_used = value,
            _ => {}
        }
    }

    fn set_integer(&mut self, field: MetricField, value: i64) {
        match field {
            MetricField::TmpDiskUsed => self.tmp_disk_used = value,
            MetricField::TmpDiskAvailable => self.tmp_disk_available = value,
            MetricField::MemoryTotal => self.memory_total = value,
            MetricField::MemoryFree => self.memory_free = value,
            MetricField::MemoryCached => self.memory_cached = value,
            MetricField::MemoryPostgres => self.memory_postgres = value,
            _ => {}
        }
    }

    /// Store `raw` into `field`. On a parse failure the field is reset to zero
    /// and `false` is returned.
    fn apply(&mut self, field: MetricField, raw: &str) -> bool {
        match field.kind() {
            FieldKind::Float => {
                let parsed = raw.parse::<f64>().ok().filter(|v| v.is_finite());
                self.set_float(field, parsed.unwrap_or(0.0));
                parsed.is_some()
            }
            FieldKind::Integer => {
                let parsed = raw.parse::<i64>().ok();
                self.set_integer(field, parsed.unwrap_or(0));
                parsed.is_some()
            }
            FieldKind::Kilobytes => {
                let digits = raw.strip_suffix(KILOBYTE_SUFFIX).unwrap_or(raw);
                let parsed = digits.parse::<i64>().ok();
                self.set_integer(field, parsed.unwrap_or(0));
                parsed.is_some()
            }
        }
    }
}

/// Extract a [`MetricRecord`] from a frame body. Later duplicates of a key win.
pub fn extract(body: &[u8]) -> Extraction {
    let text = String::from_utf8_lossy(body);
    let mut extraction = Extraction::default();

    for (key, value) in LogfmtPairs::new(&text) {
        match key {
            "source" => extraction.record.source = value.into_owned(),
            "addon" => extraction.record.addon = value.into_owned(),
            _ => {
                let Some(field) = MetricField::from_key(key) else {
                    continue;
                };
                extraction.rejected.retain(|r| r.field != field);
                if !extraction.record.apply(field, &value) {
                    extraction.rejected.push(RejectedField {
                        field,
                        value: value.into_owned(),
                    });
                }
            }
        }
    }

    extraction
}

/// Parse the RFC 3339 timestamp of a frame header.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|source| DrainError::TimestampError {
            value: raw.to_string(),
            source,
        })
}

/// Unix timestamp truncated to the start of its minute.
pub fn minute_bucket(ts: &DateTime<Utc>) -> i64 {
    ts.timestamp().div_euclid(60) * 60
}

/// Iterator over logfmt `key=value` pairs.
///
/// Bare keys yield an empty value. Quoted values support `\"` and `\\`
/// escapes; an unterminated quote runs to the end of the input.
pub struct LogfmtPairs<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> LogfmtPairs<'a> {
    pub fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn quoted_value(&mut self) -> Cow<'a, str> {
        let bytes = self.input.as_bytes();
        let start = self.pos;
        let mut has_escape = false;
        let mut i = start;
        let mut end = None;

        while i < bytes.len() {
            match bytes[i] {
                b'\\' => {
                    has_escape = true;
                    i += 2;
                }
                b'"' => {
                    end = Some(i);
                    break;
                }
                _ => i += 1,
            }
        }

        let raw = match end {
            Some(e) => {
                self.pos = e + 1;
                &self.input[start..e]
            }
            None => {
                self.pos = bytes.len();
                &self.input[start..]
            }
        };

        if !has_escape {
            return Cow::Borrowed(raw);
        }

        let mut out = String::with_capacity(raw.len());
        let mut chars = raw.chars();
        while let Some(c) = chars.next() {
            if c == '\\' {
                if let Some(escaped) = chars.next() {
                    out.push(escaped);
                }
            } else {
                out.push(c);
            }
        }
        Cow::Owned(out)
    }
}

impl<'a> Iterator for LogfmtPairs<'a> {
    type Item = (&'a str, Cow<'a, str>);

    fn next(&mut self) -> Option<Self::Item> {
        let bytes = self.input.as_bytes();

        while self.pos < bytes.len() && bytes[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }
        if self.pos >= bytes.len() {
            return None;
        }

        let key_start = self.pos;
        while self.pos < bytes.len() && !bytes[self.pos].is_ascii_whitespace() && bytes[self.pos] != b'=' {
            self.pos += 1;
        }
        let key = &self.input[key_start..self.pos];

        if self.pos >= bytes.len() || bytes[self.pos] != b'=' {
            return Some((key, Cow::Borrowed("")));
        }
        self.pos += 1;

        if self.pos < bytes.len() && bytes[self.pos] == b'"' {
            self.pos += 1;
            let value = self.quoted_value();
            return Some((key, value));
        }

        let value_start = self.pos;
        while self.pos < bytes.len() && !bytes[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }
        Some((key, Cow::Borrowed(&self.input[value_start..self.pos])))
    }
}
