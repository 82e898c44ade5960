//! Time buckets and downsampling levels.
//!
//! Buckets are integers whose decimal digits spell a UTC date at the level's
//! precision: `YYYYMMDDHHmm` for minutes, `YYYYMMDDHH` for hours, `YYYYMMDD`
//! for days and `YYYYMM` for months. Coarser buckets are obtained from a
//! minute bucket by integer division, which keeps the derivation total and
//! cheap on the hot path.

use crate::core::{Result, StrataError};
use chrono::{DateTime, Datelike, NaiveDateTime, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Time granularity of a persisted series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownSampling {
    Minute,
    Hour,
    Day,
    Month,
}

impl DownSampling {
    /// Every level, finest first.
    pub const ALL: [DownSampling; 4] = [
        DownSampling::Minute,
        DownSampling::Hour,
        DownSampling::Day,
        DownSampling::Month,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DownSampling::Minute => "minute",
            DownSampling::Hour => "hour",
            DownSampling::Day => "day",
            DownSampling::Month => "month",
        }
    }

    fn divisor(self) -> i64 {
        match self {
            DownSampling::Minute => 1,
            DownSampling::Hour => 100,
            DownSampling::Day => 10_000,
            DownSampling::Month => 1_000_000,
        }
    }

    /// Bucket of this level containing `minute_bucket`.
    pub fn from_minute_bucket(self, minute_bucket: i64) -> Result<i64> {
        validate_minute_bucket(minute_bucket)?;
        Ok(minute_bucket / self.divisor())
    }

    /// Storage table of `metric_type` at this level.
    pub fn table_name(self, metric_type: &str) -> String {
        format!("{}_{}", metric_type, self.as_str())
    }
}

impl fmt::Display for DownSampling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reject anything that is not a real `YYYYMMDDHHmm` instant.
pub fn validate_minute_bucket(bucket: i64) -> Result<()> {
    if !(100_000_000_000..=999_912_312_359).contains(&bucket) {
        return Err(StrataError::InvalidTimeBucket {
            bucket,
            reason: "expected 12 digits YYYYMMDDHHmm".to_string(),
        });
    }
    NaiveDateTime::parse_from_str(&bucket.to_string(), "%Y%m%d%H%M").map_err(|e| {
        StrataError::InvalidTimeBucket {
            bucket,
            reason: e.to_string(),
        }
    })?;
    Ok(())
}

/// Minute bucket of a UTC instant. Years outside `1000..=9999` have none.
pub fn minute_bucket(at: DateTime<Utc>) -> Result<i64> {
    let bucket = i64::from(at.year()) * 100_000_000
        + i64::from(at.month()) * 1_000_000
        + i64::from(at.day()) * 10_000
        + i64::from(at.hour()) * 100
        + i64::from(at.minute());
    validate_minute_bucket(bucket)?;
    Ok(bucket)
}

/// Minute bucket of a unix timestamp in milliseconds.
pub fn minute_bucket_from_millis(millis: i64) -> Result<i64> {
    match Utc.timestamp_millis_opt(millis).single() {
        Some(at) => minute_bucket(at),
        None => Err(StrataError::InvalidTimeBucket {
            bucket: millis,
            reason: "timestamp out of range".to_string(),
        }),
    }
}
