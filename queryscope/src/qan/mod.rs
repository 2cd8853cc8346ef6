//! Query analytics (QAN).
//!
//! Tick-driven analysis of the database slow log:
//!
//! ```text
//! Clock ──► IntervalIter ──► QanManager ──► workers (≤ max_workers)
//!                               │                │
//!                               │ rotation       │ per-class stats
//!                               ▼                ▼
//!                        pending-removal      QanReport ──► spool
//! ```
//!
//! The iterator turns ticks into `[start, end)` byte windows over the log
//! file; each window is parsed by one worker into per-query-class
//! statistics; the manager rotates the log when it grows past the
//! configured cap and defers removal of rotated files until the last
//! worker reading them finishes.

pub mod iter;
pub mod manager;
pub mod mock;
pub mod parser;
pub mod worker;

pub use iter::{
    FileIntervalIter, FileIterFactory, FilenameResolver, FixedPath, IterFactory, IterHandle,
    TimeIntervalIter, TimeIterFactory,
};
pub use manager::QanManager;
pub use parser::{class_id, fingerprint, LogEvent, LogParser, ParserFactory, TextParserFactory};
pub use worker::{SlowLogWorkerFactory, Worker, WorkerFactory};

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::mysql::Query;
use crate::proto::ServiceInstance;

/// Service tag of query analytics.
pub const SERVICE_NAME: &str = "qan";

/// Slow-log collection backend.
pub const COLLECT_FROM_SLOWLOG: &str = "slowlog";
/// Performance-schema collection backend.
pub const COLLECT_FROM_PERFSCHEMA: &str = "perfschema";

/// Errors internal to the QAN pipeline.
#[derive(Debug, Error)]
pub enum QanError {
    #[error("slow log I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("worker {0} has no interval; setup() not called")]
    NoInterval(String),
    #[error("worker: {0}")]
    Worker(String),
}

/// QAN service configuration as carried in `StartService` commands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct QanConfig {
    pub service_instance: ServiceInstance,
    /// Seconds between intervals.
    pub interval: u64,
    /// Rotate the slow log once an interval's end offset reaches this.
    pub max_slow_log_size: u64,
    /// Unlink rotated logs once their last reader finishes.
    pub remove_old_slow_logs: bool,
    /// Keep a sample query per class.
    pub example_queries: bool,
    /// Concurrent worker cap.
    pub max_workers: usize,
    /// Per-worker wall-clock budget in seconds.
    pub worker_run_time: u64,
    /// Top-N classes kept per report; the rest are folded into one.
    pub report_limit: usize,
    /// Settings statements to enable collection.
    pub start: Vec<Query>,
    /// Settings statements to disable collection.
    pub stop: Vec<Query>,
    pub collect_from: String,
}

impl Default for QanConfig {
    fn default() -> Self {
        Self {
            service_instance: ServiceInstance::default(),
            interval: 60,
            max_slow_log_size: 1 << 30,
            remove_old_slow_logs: false,
            example_queries: false,
            max_workers: 2,
            worker_run_time: 120,
            report_limit: 200,
            start: Vec::new(),
            stop: Vec::new(),
            collect_from: COLLECT_FROM_SLOWLOG.to_string(),
        }
    }
}

/// One half-open byte window `[start_offset, end_offset)` over the named
/// log file, covering wall-clock `[start_time, stop_time)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Interval {
    /// Strictly monotone per iterator.
    pub number: u64,
    pub filename: PathBuf,
    pub start_time: DateTime<Utc>,
    pub stop_time: DateTime<Utc>,
    pub start_offset: u64,
    pub end_offset: u64,
}

/// Streaming min/max/avg over one metric.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct MetricStats {
    pub cnt: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub avg: f64,
}

impl MetricStats {
    /// Folds one observation in.
    pub fn observe(&mut self, value: f64) {
        if self.cnt == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.cnt += 1;
        self.sum += value;
        self.avg = self.sum / self.cnt as f64;
    }

    /// Merges another stream in (used when folding low-rank classes).
    pub fn absorb(&mut self, other: &MetricStats) {
        if other.cnt == 0 {
            return;
        }
        if self.cnt == 0 {
            self.min = other.min;
            self.max = other.max;
        } else {
            self.min = self.min.min(other.min);
            self.max = self.max.max(other.max);
        }
        self.cnt += other.cnt;
        self.sum += other.sum;
        self.avg = self.sum / self.cnt as f64;
    }
}

/// Aggregated statistics for one query class.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct QueryClass {
    pub id: String,
    pub fingerprint: String,
    pub total_queries: u64,
    pub query_time: MetricStats,
    pub lock_time: MetricStats,
    pub rows_sent: MetricStats,
    pub rows_examined: MetricStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub example: Option<String>,
}

/// Whole-interval statistics.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct GlobalStats {
    pub total_queries: u64,
    pub unique_queries: u64,
    pub query_time: MetricStats,
    pub lock_time: MetricStats,
    pub rows_sent: MetricStats,
    pub rows_examined: MetricStats,
}

/// What one worker produced for one interval.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct QanResult {
    pub global: GlobalStats,
    pub classes: Vec<QueryClass>,
    /// Offset actually reached; `<= end_offset`, and `== start_offset`
    /// when the parser crashed before aggregating anything.
    pub stop_offset: u64,
    /// Empty on success.
    pub error: String,
}

/// The spooled per-interval report.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct QanReport {
    pub service_instance: ServiceInstance,
    pub start_ts: Option<DateTime<Utc>>,
    pub end_ts: Option<DateTime<Utc>>,
    pub slow_log_file: String,
    pub start_offset: u64,
    pub end_offset: u64,
    pub stop_offset: u64,
    pub global: GlobalStats,
    pub class: Vec<QueryClass>,
}

/// Query-class id of the synthetic bucket low-rank classes fold into.
pub const LOW_RANK_CLASS_ID: &str = "0";

/// Builds the spooled report: classes ranked by total query time, top
/// `report_limit` kept verbatim, the remainder folded into one bucket.
pub fn make_report(
    instance: ServiceInstance,
    interval: &Interval,
    result: QanResult,
    config: &QanConfig,
) -> QanReport {
    let mut classes = result.classes;
    classes.sort_by(|a, b| {
        b.query_time
            .sum
            .partial_cmp(&a.query_time.sum)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let limit = config.report_limit;
    if limit > 0 && classes.len() > limit {
        let rest = classes.split_off(limit);
        let mut bucket = QueryClass {
            id: LOW_RANK_CLASS_ID.to_string(),
            ..QueryClass::default()
        };
        for class in &rest {
            bucket.total_queries += class.total_queries;
            bucket.query_time.absorb(&class.query_time);
            bucket.lock_time.absorb(&class.lock_time);
            bucket.rows_sent.absorb(&class.rows_sent);
            bucket.rows_examined.absorb(&class.rows_examined);
        }
        classes.push(bucket);
    }

    QanReport {
        service_instance: instance,
        start_ts: Some(interval.start_time),
        end_ts: Some(interval.stop_time),
        slow_log_file: interval.filename.display().to_string(),
        start_offset: interval.start_offset,
        end_offset: interval.end_offset,
        stop_offset: result.stop_offset,
        global: result.global,
        class: classes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn class(id: &str, query_time_sum: f64, queries: u64) -> QueryClass {
        let mut qt = MetricStats::default();
        qt.observe(query_time_sum);
        QueryClass {
            id: id.to_string(),
            fingerprint: format!("select {}", id),
            total_queries: queries,
            query_time: qt,
            ..QueryClass::default()
        }
    }

    fn interval() -> Interval {
        Interval {
            number: 1,
            filename: PathBuf::from("/var/log/mysql/slow.log"),
            start_time: Utc::now(),
            stop_time: Utc::now(),
            start_offset: 0,
            end_offset: 1000,
        }
    }

    #[test]
    fn metric_stats_track_min_max_avg() {
        let mut stats = MetricStats::default();
        stats.observe(2.0);
        stats.observe(1.0);
        stats.observe(3.0);
        assert_eq!(stats.cnt, 3);
        assert_eq!(stats.min, 1.0);
        assert_eq!(stats.max, 3.0);
        assert_eq!(stats.sum, 6.0);
        assert_eq!(stats.avg, 2.0);
    }

    #[test]
    fn absorb_merges_streams() {
        let mut a = MetricStats::default();
        a.observe(1.0);
        let mut b = MetricStats::default();
        b.observe(3.0);
        b.observe(5.0);

        a.absorb(&b);
        assert_eq!(a.cnt, 3);
        assert_eq!(a.min, 1.0);
        assert_eq!(a.max, 5.0);
        assert_eq!(a.avg, 3.0);
    }

    #[test]
    fn report_ranks_classes_by_query_time() {
        let result = QanResult {
            classes: vec![class("a", 0.5, 1), class("b", 2.9, 3), class("c", 2.0, 2)],
            stop_offset: 1000,
            ..QanResult::default()
        };
        let report = make_report(
            ServiceInstance::default(),
            &interval(),
            result,
            &QanConfig::default(),
        );
        let ids: Vec<&str> = report.class.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c", "a"]);
    }

    #[test]
    fn report_limit_folds_low_rank_classes() {
        let result = QanResult {
            classes: vec![
                class("a", 2.9, 1),
                class("b", 2.0, 2),
                class("c", 1.0, 1),
                class("d", 0.5, 1),
            ],
            ..QanResult::default()
        };
        let config = QanConfig {
            report_limit: 2,
            ..QanConfig::default()
        };
        let report = make_report(ServiceInstance::default(), &interval(), result, &config);

        assert_eq!(report.class.len(), 3);
        assert_eq!(report.class[0].id, "a");
        assert_eq!(report.class[1].id, "b");

        let bucket = &report.class[2];
        assert_eq!(bucket.id, LOW_RANK_CLASS_ID);
        assert_eq!(bucket.total_queries, 2);
        assert_eq!(bucket.query_time.sum, 1.5);
        assert_eq!(bucket.query_time.min, 0.5);
        assert_eq!(bucket.query_time.max, 1.0);
    }

    #[test]
    fn config_wire_names() {
        let config = QanConfig {
            interval: 300,
            max_slow_log_size: 1073741824,
            remove_old_slow_logs: true,
            max_workers: 2,
            worker_run_time: 600,
            start: vec![Query::set("SET GLOBAL slow_query_log=ON")],
            ..QanConfig::default()
        };
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["Interval"], 300);
        assert_eq!(json["MaxSlowLogSize"], 1073741824u64);
        assert_eq!(json["RemoveOldSlowLogs"], true);
        assert_eq!(json["MaxWorkers"], 2);
        assert_eq!(json["WorkerRunTime"], 600);
        assert_eq!(json["Start"][0]["Set"], "SET GLOBAL slow_query_log=ON");
        assert_eq!(json["CollectFrom"], "slowlog");
    }

    #[test]
    fn config_defaults_fill_missing_fields() {
        let config: QanConfig = serde_json::from_str(r#"{"Interval": 60}"#).unwrap();
        assert_eq!(config.interval, 60);
        assert_eq!(config.max_workers, 2);
        assert_eq!(config.collect_from, COLLECT_FROM_SLOWLOG);
    }

    #[test]
    fn report_keeps_interval_bounds_and_stop_offset() {
        let result = QanResult {
            stop_offset: 736,
            ..QanResult::default()
        };
        let report = make_report(
            ServiceInstance::default(),
            &interval(),
            result,
            &QanConfig::default(),
        );
        assert_eq!(report.start_offset, 0);
        assert_eq!(report.end_offset, 1000);
        assert_eq!(report.stop_offset, 736);
        assert_eq!(report.slow_log_file, "/var/log/mysql/slow.log");
    }
}
