//! Interval workers.
//!
//! A worker parses one interval of the slow log into per-query-class
//! statistics. Parsing is blocking file I/O, so the run executes on the
//! blocking pool; cancellation is cooperative between events: a stopped
//! worker finalizes the event it is aggregating, refuses new ones, and
//! returns a partial result whose `stop_offset` is the last fully
//! aggregated boundary.
//!
//! A panicking parser is caught at the worker boundary: the result carries
//! `stop_offset = start_offset` and an error string, and the process keeps
//! running.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::parser::{class_id, fingerprint, ParserFactory};
use super::{GlobalStats, Interval, QanConfig, QanError, QanResult, QueryClass};
use crate::status::StatusRegistry;

/// One interval worker.
///
/// Lifecycle: `setup(interval)` → `run()` → `cleanup()`, with `stop_token`
/// cancellable at any point in between.
pub trait Worker: Send + 'static {
    fn name(&self) -> &str;

    /// Binds the worker to its interval.
    fn setup(&mut self, interval: &Interval) -> Result<(), QanError>;

    /// Parses the interval to a result. Runs at most once.
    fn run(&mut self) -> BoxFuture<'_, Result<QanResult, QanError>>;

    /// Token that requests a mid-run stop.
    fn stop_token(&self) -> CancellationToken;

    /// Releases per-run resources.
    fn cleanup(&mut self);

    /// Short status line.
    fn status(&self) -> String;
}

/// Builds workers for the manager's pool.
pub trait WorkerFactory: Send + Sync + 'static {
    fn make(&self, name: &str, config: &QanConfig) -> Box<dyn Worker>;
}

/// Production factory for [`SlowLogWorker`].
pub struct SlowLogWorkerFactory {
    parser_factory: Arc<dyn ParserFactory>,
    status: Arc<StatusRegistry>,
}

impl SlowLogWorkerFactory {
    pub fn new(parser_factory: Arc<dyn ParserFactory>, status: Arc<StatusRegistry>) -> Self {
        Self {
            parser_factory,
            status,
        }
    }
}

impl WorkerFactory for SlowLogWorkerFactory {
    fn make(&self, name: &str, config: &QanConfig) -> Box<dyn Worker> {
        Box::new(SlowLogWorker::new(
            name.to_string(),
            Arc::clone(&self.parser_factory),
            Arc::clone(&self.status),
            config,
        ))
    }
}

/// Parses slow-log intervals through an injected parser.
pub struct SlowLogWorker {
    name: String,
    parser_factory: Arc<dyn ParserFactory>,
    status: Arc<StatusRegistry>,
    example_queries: bool,
    run_time: Duration,
    stop: CancellationToken,
    interval: Option<Interval>,
}

impl SlowLogWorker {
    pub fn new(
        name: String,
        parser_factory: Arc<dyn ParserFactory>,
        status: Arc<StatusRegistry>,
        config: &QanConfig,
    ) -> Self {
        Self {
            name,
            parser_factory,
            status,
            example_queries: config.example_queries,
            run_time: Duration::from_secs(config.worker_run_time.max(1)),
            stop: CancellationToken::new(),
            interval: None,
        }
    }
}

impl Worker for SlowLogWorker {
    fn name(&self) -> &str {
        &self.name
    }

    fn setup(&mut self, interval: &Interval) -> Result<(), QanError> {
        self.status.update(
            &self.name,
            format!("Parsing {}", interval.filename.display()),
        );
        self.interval = Some(interval.clone());
        Ok(())
    }

    fn run(&mut self) -> BoxFuture<'_, Result<QanResult, QanError>> {
        Box::pin(async move {
            let interval = self
                .interval
                .clone()
                .ok_or_else(|| QanError::NoInterval(self.name.clone()))?;

            let factory = Arc::clone(&self.parser_factory);
            let example_queries = self.example_queries;
            let run_time = self.run_time;
            let stop = self.stop.clone();

            let worker_interval = interval.clone();
            let result = tokio::task::spawn_blocking(move || {
                let guarded = catch_unwind(AssertUnwindSafe(|| {
                    parse_interval(&*factory, &worker_interval, example_queries, run_time, &stop)
                }));
                match guarded {
                    Ok(result) => result,
                    Err(_) => QanResult {
                        stop_offset: worker_interval.start_offset,
                        error: format!(
                            "parser panicked on {}",
                            worker_interval.filename.display()
                        ),
                        ..QanResult::default()
                    },
                }
            })
            .await
            .map_err(|e| QanError::Worker(e.to_string()))?;

            self.status
                .update(&self.name, format!("Done interval {}", interval.number));
            Ok(result)
        })
    }

    fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    fn cleanup(&mut self) {
        self.interval = None;
    }

    fn status(&self) -> String {
        self.status.get(&self.name)
    }
}

fn parse_interval(
    factory: &dyn ParserFactory,
    interval: &Interval,
    example_queries: bool,
    run_time: Duration,
    stop: &CancellationToken,
) -> QanResult {
    let mut result = QanResult {
        stop_offset: interval.start_offset,
        ..QanResult::default()
    };

    let mut file = match File::open(&interval.filename) {
        Ok(file) => file,
        Err(e) => {
            result.error = format!("open {}: {}", interval.filename.display(), e);
            return result;
        }
    };
    if let Err(e) = file.seek(SeekFrom::Start(interval.start_offset)) {
        result.error = format!("seek {}: {}", interval.filename.display(), e);
        return result;
    }
    let window = interval.end_offset.saturating_sub(interval.start_offset);
    let reader = BufReader::new(file.take(window));
    let mut parser = factory.make(Box::new(reader), interval.start_offset);

    let started = Instant::now();
    let mut classes: HashMap<String, QueryClass> = HashMap::new();
    let mut global = GlobalStats::default();

    loop {
        if stop.is_cancelled() {
            debug!("worker stopped mid-run, returning partial result");
            break;
        }
        if started.elapsed() >= run_time {
            warn!(
                file = %interval.filename.display(),
                "worker run-time budget exhausted, returning partial result"
            );
            break;
        }

        let event = match parser.next_event() {
            Ok(Some(event)) => event,
            Ok(None) => break,
            Err(e) => {
                result.error = e.to_string();
                break;
            }
        };

        global.total_queries += 1;
        global.query_time.observe(event.query_time);
        global.lock_time.observe(event.lock_time);
        global.rows_sent.observe(event.rows_sent as f64);
        global.rows_examined.observe(event.rows_examined as f64);

        let fp = fingerprint(&event.query);
        let class = classes.entry(fp.clone()).or_insert_with(|| QueryClass {
            id: class_id(&fp),
            fingerprint: fp,
            ..QueryClass::default()
        });
        class.total_queries += 1;
        class.query_time.observe(event.query_time);
        class.lock_time.observe(event.lock_time);
        class.rows_sent.observe(event.rows_sent as f64);
        class.rows_examined.observe(event.rows_examined as f64);
        if example_queries {
            let keep = class
                .example
                .as_ref()
                .map(|_| class.query_time.max <= event.query_time)
                .unwrap_or(true);
            if keep {
                class.example = Some(event.query.clone());
            }
        }

        result.stop_offset = event.offset;
    }

    global.unique_queries = classes.len() as u64;
    result.global = global;
    result.classes = classes.into_values().collect();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::qan::parser::TextParserFactory;
    use chrono::Utc;
    use std::fs;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn event(query_time: f64, sql: &str) -> String {
        format!(
            "# Query_time: {}  Lock_time: 0.010000 Rows_sent: 1  Rows_examined: 10\n{};\n",
            query_time, sql
        )
    }

    fn write_log(events: &[String]) -> (TempDir, PathBuf, Vec<u64>) {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("slow.log");
        let mut content = String::new();
        let mut ends = Vec::new();
        for e in events {
            content.push_str(e);
            ends.push(content.len() as u64);
        }
        fs::write(&path, content).unwrap();
        (tmp, path, ends)
    }

    fn interval(path: &std::path::Path, start: u64, end: u64) -> Interval {
        Interval {
            number: 1,
            filename: path.to_path_buf(),
            start_time: Utc::now(),
            stop_time: Utc::now(),
            start_offset: start,
            end_offset: end,
        }
    }

    fn worker(name: &str, status: &Arc<StatusRegistry>) -> SlowLogWorker {
        let config = QanConfig {
            example_queries: true,
            ..QanConfig::default()
        };
        SlowLogWorker::new(
            name.to_string(),
            Arc::new(TextParserFactory),
            Arc::clone(status),
            &config,
        )
    }

    #[tokio::test]
    async fn aggregates_whole_interval() {
        let events = vec![
            event(1.5, "SELECT * FROM users WHERE id = 1"),
            event(0.5, "SELECT * FROM users WHERE id = 2"),
            event(2.0, "SELECT name FROM teams"),
        ];
        let (_tmp, path, ends) = write_log(&events);
        let status = Arc::new(StatusRegistry::new(&[]));

        let mut w = worker("qan-worker-1", &status);
        w.setup(&interval(&path, 0, ends[2])).unwrap();
        assert!(w.status().starts_with("Parsing"));

        let result = w.run().await.unwrap();
        w.cleanup();

        assert_eq!(result.error, "");
        assert_eq!(result.global.total_queries, 3);
        assert_eq!(result.global.unique_queries, 2);
        assert_eq!(result.stop_offset, ends[2]);
        assert_eq!(result.global.query_time.max, 2.0);

        let users = result
            .classes
            .iter()
            .find(|c| c.fingerprint.contains("users"))
            .unwrap();
        assert_eq!(users.total_queries, 2);
        assert_eq!(users.query_time.sum, 2.0);
        // Example keeps the slowest sample of the class.
        assert_eq!(
            users.example.as_deref(),
            Some("SELECT * FROM users WHERE id = 1")
        );

        assert_eq!(w.status(), "Done interval 1");
    }

    #[tokio::test]
    async fn stops_at_end_offset_and_resumes() {
        let events = vec![
            event(1.0, "SELECT * FROM a"),
            event(1.0, "SELECT * FROM b"),
        ];
        let (_tmp, path, ends) = write_log(&events);
        let status = Arc::new(StatusRegistry::new(&[]));

        // First half only.
        let mut w = worker("qan-worker-1", &status);
        w.setup(&interval(&path, 0, ends[0])).unwrap();
        let first = w.run().await.unwrap();
        assert_eq!(first.global.total_queries, 1);
        assert_eq!(first.stop_offset, ends[0]);

        // Resume exactly where the first run stopped.
        let mut w = worker("qan-worker-2", &status);
        w.setup(&interval(&path, first.stop_offset, ends[1])).unwrap();
        let second = w.run().await.unwrap();
        assert_eq!(second.global.total_queries, 1);
        assert_eq!(second.stop_offset, ends[1]);
        assert!(second.classes[0].fingerprint.contains("b"));
    }

    #[tokio::test]
    async fn pre_stopped_worker_returns_partial_at_start() {
        let events = vec![event(1.0, "SELECT * FROM a")];
        let (_tmp, path, ends) = write_log(&events);
        let status = Arc::new(StatusRegistry::new(&[]));

        let mut w = worker("qan-worker-1", &status);
        w.setup(&interval(&path, 0, ends[0])).unwrap();
        w.stop_token().cancel();

        let result = w.run().await.unwrap();
        assert_eq!(result.global.total_queries, 0);
        assert_eq!(result.stop_offset, 0, "nothing aggregated");
    }

    #[tokio::test]
    async fn run_without_setup_is_an_error() {
        let status = Arc::new(StatusRegistry::new(&[]));
        let mut w = worker("qan-worker-1", &status);
        let err = w.run().await.unwrap_err();
        assert!(matches!(err, QanError::NoInterval(_)));
    }

    #[tokio::test]
    async fn missing_file_yields_error_result_not_crash() {
        let status = Arc::new(StatusRegistry::new(&[]));
        let mut w = worker("qan-worker-1", &status);
        w.setup(&interval(std::path::Path::new("/no/such/slow.log"), 5, 100))
            .unwrap();

        let result = w.run().await.unwrap();
        assert!(result.error.contains("open"));
        assert_eq!(result.stop_offset, 5, "stop offset pinned to start");
    }

    struct PanickingFactory;

    impl ParserFactory for PanickingFactory {
        fn make(
            &self,
            _reader: Box<dyn std::io::BufRead + Send>,
            _start_offset: u64,
        ) -> Box<dyn crate::qan::parser::LogParser> {
            panic!("malformed state");
        }
    }

    #[tokio::test]
    async fn parser_panic_is_contained() {
        let events = vec![event(1.0, "SELECT 1")];
        let (_tmp, path, ends) = write_log(&events);
        let status = Arc::new(StatusRegistry::new(&[]));

        let mut w = SlowLogWorker::new(
            "qan-worker-1".to_string(),
            Arc::new(PanickingFactory),
            Arc::clone(&status),
            &QanConfig::default(),
        );
        w.setup(&interval(&path, 0, ends[0])).unwrap();

        let result = w.run().await.unwrap();
        assert!(result.error.contains("panicked"));
        assert_eq!(result.stop_offset, 0);
        assert!(result.classes.is_empty());
    }
}
