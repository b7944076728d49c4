//! Time-bucketed totals over stored frame records.
//!
//! Buckets are keyed by integer `(year, month, day, hour)` tuples and ordered
//! by that key, so day 2 sorts before day 10 no matter how the label reads.
//! All bucketing is done in UTC.

use std::collections::BTreeMap;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Timelike, Utc};
use serde::Serialize;

use crate::storage::{FrameRecord, ResultStore, TimeRange};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Hour,
    Day,
    Month,
}

impl Granularity {
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "hour" | "hourly" => Ok(Granularity::Hour),
            "day" | "daily" => Ok(Granularity::Day),
            "month" | "monthly" => Ok(Granularity::Month),
            other => Err(anyhow!("unknown granularity '{}'", other)),
        }
    }
}

/// Restricts a query to one day, month or year.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimeFilter {
    All,
    Day(NaiveDate),
    Month { year: i32, month: u32 },
    Year(i32),
}

impl TimeFilter {
    /// `YYYY-MM-DD`
    pub fn parse_day(value: &str) -> Result<Self> {
        NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d")
            .map(TimeFilter::Day)
            .map_err(|e| anyhow!("invalid date '{}': {}", value, e))
    }

    /// `YYYY-MM`
    pub fn parse_month(value: &str) -> Result<Self> {
        let (year, month) = value
            .trim()
            .split_once('-')
            .ok_or_else(|| anyhow!("invalid month '{}', expected YYYY-MM", value))?;
        let year: i32 = year
            .parse()
            .map_err(|_| anyhow!("invalid year in '{}'", value))?;
        let month: u32 = month
            .parse()
            .map_err(|_| anyhow!("invalid month in '{}'", value))?;
        NaiveDate::from_ymd_opt(year, month, 1)
            .ok_or_else(|| anyhow!("invalid month '{}'", value))?;
        Ok(TimeFilter::Month { year, month })
    }

    /// `YYYY`
    pub fn parse_year(value: &str) -> Result<Self> {
        let year: i32 = value
            .trim()
            .parse()
            .map_err(|_| anyhow!("invalid year '{}'", value))?;
        NaiveDate::from_ymd_opt(year, 1, 1).ok_or_else(|| anyhow!("invalid year '{}'", value))?;
        Ok(TimeFilter::Year(year))
    }

    pub fn range(&self) -> Option<TimeRange> {
        let (start, end) = match *self {
            TimeFilter::All => return None,
            TimeFilter::Day(day) => (day, day.succ_opt()?),
            TimeFilter::Month { year, month } => {
                let start = NaiveDate::from_ymd_opt(year, month, 1)?;
                let end = if month == 12 {
                    NaiveDate::from_ymd_opt(year + 1, 1, 1)?
                } else {
                    NaiveDate::from_ymd_opt(year, month + 1, 1)?
                };
                (start, end)
            }
            TimeFilter::Year(year) => (
                NaiveDate::from_ymd_opt(year, 1, 1)?,
                NaiveDate::from_ymd_opt(year + 1, 1, 1)?,
            ),
        };
        Some(TimeRange {
            start: midnight(start),
            end: midnight(end),
        })
    }
}

fn midnight(day: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&day.and_time(chrono::NaiveTime::MIN))
}

/// Chronological bucket key. Unused components are zero.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct BucketKey {
    pub year: i32,
    pub month: u32,
    pub day: u32,
    pub hour: u32,
}

impl BucketKey {
    pub fn of(timestamp: &DateTime<Utc>, granularity: Granularity) -> Self {
        let (day, hour) = match granularity {
            Granularity::Hour => (timestamp.day(), timestamp.hour()),
            Granularity::Day => (timestamp.day(), 0),
            Granularity::Month => (0, 0),
        };
        Self {
            year: timestamp.year(),
            month: timestamp.month(),
            day,
            hour,
        }
    }

    /// `YYYY-MM-DD HHh`, `YYYY-MM-DD` or `YYYY-MM`.
    pub fn label(&self, granularity: Granularity) -> String {
        match granularity {
            Granularity::Hour => format!(
                "{:04}-{:02}-{:02} {:02}h",
                self.year, self.month, self.day, self.hour
            ),
            Granularity::Day => format!("{:04}-{:02}-{:02}", self.year, self.month, self.day),
            Granularity::Month => format!("{:04}-{:02}", self.year, self.month),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StatBucket {
    pub key: BucketKey,
    pub label: String,
    pub total_count: u64,
}

/// Sums record counts per bucket. Buckets without detections are left out.
pub fn aggregate(records: &[FrameRecord], granularity: Granularity) -> Vec<StatBucket> {
    let mut totals: BTreeMap<BucketKey, u64> = BTreeMap::new();
    for record in records {
        *totals
            .entry(BucketKey::of(&record.timestamp, granularity))
            .or_default() += u64::from(record.count);
    }
    totals
        .into_iter()
        .filter(|(_, total)| *total > 0)
        .map(|(key, total_count)| StatBucket {
            key,
            label: key.label(granularity),
            total_count,
        })
        .collect()
}

/// Grouped totals from the store, in chronological order.
///
/// An empty vector means nothing was recorded in the filtered period; store
/// failures are returned as errors.
pub fn query_stats(
    store: &dyn ResultStore,
    granularity: Granularity,
    filter: TimeFilter,
) -> Result<Vec<StatBucket>> {
    let records = store.frame_records(filter.range())?;
    Ok(aggregate(&records, granularity))
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StatsSummary {
    pub total: u64,
    /// Mean bucket total; 0 when there are no buckets.
    pub mean: f64,
    pub max: Option<StatBucket>,
}

impl StatsSummary {
    pub fn from_buckets(buckets: &[StatBucket]) -> Self {
        let total: u64 = buckets.iter().map(|b| b.total_count).sum();
        let mean = if buckets.is_empty() {
            0.0
        } else {
            total as f64 / buckets.len() as f64
        };
        // First bucket wins ties so the earliest peak is reported.
        let max = buckets
            .iter()
            .fold(None::<&StatBucket>, |best, b| match best {
                Some(best) if best.total_count >= b.total_count => Some(best),
                _ => Some(b),
            })
            .cloned();
        Self { total, mean, max }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryResultStore;
    use crate::{FrameResult, InferenceRun, RunId, RunKind};

    fn record(day: u32, hour: u32, count: u32) -> FrameRecord {
        FrameRecord {
            run_id: RunId::from("run-test".to_string()),
            kind: RunKind::Video,
            timestamp: Utc.with_ymd_and_hms(2024, 3, day, hour, 30, 0).unwrap(),
            count,
        }
    }

    #[test]
    fn days_sort_numerically() {
        let records = vec![record(10, 1, 3), record(2, 1, 1), record(2, 5, 1)];
        let buckets = aggregate(&records, Granularity::Day);
        let labels: Vec<_> = buckets.iter().map(|b| b.label.as_str()).collect();
        assert_eq!(labels, vec!["2024-03-02", "2024-03-10"]);
        assert_eq!(buckets[0].total_count, 2);
    }

    #[test]
    fn insertion_order_does_not_change_buckets() {
        let mut records = vec![
            record(1, 23, 2),
            record(1, 3, 1),
            record(9, 12, 4),
            record(1, 3, 5),
        ];
        let forward = aggregate(&records, Granularity::Hour);
        records.reverse();
        assert_eq!(aggregate(&records, Granularity::Hour), forward);
        assert_eq!(forward[0].label, "2024-03-01 03h");
        assert_eq!(forward[0].total_count, 6);
    }

    #[test]
    fn zero_count_buckets_are_omitted() {
        assert!(aggregate(&[record(4, 4, 0)], Granularity::Month).is_empty());
        assert!(aggregate(&[], Granularity::Day).is_empty());
    }

    #[test]
    fn filters_map_to_half_open_ranges() {
        let range = TimeFilter::parse_month("2024-12").unwrap().range().unwrap();
        assert_eq!(range.start, Utc.with_ymd_and_hms(2024, 12, 1, 0, 0, 0).unwrap());
        assert_eq!(range.end, Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap());
        assert!(TimeFilter::parse_month("2024-13").is_err());
        assert!(TimeFilter::parse_day("2024-02-30").is_err());
        assert_eq!(TimeFilter::All.range(), None);
    }

    #[test]
    fn query_filters_by_day() {
        let store = InMemoryResultStore::new();
        let frames = vec![
            FrameResult {
                timestamp: Utc.with_ymd_and_hms(2024, 3, 9, 8, 0, 0).unwrap(),
                count: 2,
            },
            FrameResult {
                timestamp: Utc.with_ymd_and_hms(2024, 3, 10, 8, 0, 0).unwrap(),
                count: 7,
            },
        ];
        store
            .save_run(&InferenceRun::from_frames(RunId::generate(), RunKind::Video, frames, None))
            .unwrap();
        let day = TimeFilter::parse_day("2024-03-09").unwrap();
        let buckets = query_stats(&store, Granularity::Hour, day).unwrap();
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].label, "2024-03-09 08h");

        let empty = query_stats(&store, Granularity::Hour, TimeFilter::Year(2023)).unwrap();
        assert!(empty.is_empty());
    }

    #[test]
    fn summary_reports_total_mean_and_first_peak() {
        let buckets = aggregate(
            &[record(1, 0, 4), record(2, 0, 2), record(3, 0, 4)],
            Granularity::Day,
        );
        let summary = StatsSummary::from_buckets(&buckets);
        assert_eq!(summary.total, 10);
        assert!((summary.mean - 10.0 / 3.0).abs() < 1e-9);
        assert_eq!(summary.max.unwrap().label, "2024-03-01");
        assert_eq!(StatsSummary::from_buckets(&[]).max, None);
    }
}
