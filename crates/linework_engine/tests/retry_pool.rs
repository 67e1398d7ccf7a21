mod support;

use std::collections::HashMap;
use std::fs;
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use linework_engine::{
    EngineError, ExternalOperation, FailureKind, FetchSettings, OperationError,
    PageFetchOperation, PageSummaryTransform, RetryPool, RetryPoolConfig, SegmentFileOptions,
    SegmentFileSink, SourceId, Transform,
};
use pretty_assertions::assert_eq;
use support::{init_logging, RecordingSink};
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Fails each payload a scripted number of times before succeeding.
#[derive(Clone, Default)]
struct Scripted {
    failures: Arc<HashMap<String, u32>>,
    attempts: Arc<Mutex<HashMap<String, u32>>>,
    opened: Arc<AtomicUsize>,
    closed: Arc<AtomicUsize>,
}

impl Scripted {
    fn new(failures: &[(&str, u32)]) -> Self {
        Self {
            failures: Arc::new(
                failures
                    .iter()
                    .map(|(payload, n)| (payload.to_string(), *n))
                    .collect(),
            ),
            ..Self::default()
        }
    }

    fn attempts(&self, payload: &str) -> u32 {
        self.attempts
            .lock()
            .unwrap()
            .get(payload)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait::async_trait]
impl ExternalOperation for Scripted {
    type Session = usize;
    type Output = String;

    async fn open_session(&self) -> Result<usize, OperationError> {
        Ok(self.opened.fetch_add(1, Ordering::SeqCst))
    }

    async fn execute(
        &self,
        _session: &mut usize,
        payload: &[u8],
    ) -> Result<String, OperationError> {
        let payload = String::from_utf8_lossy(payload).into_owned();
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap();
            let entry = attempts.entry(payload.clone()).or_insert(0);
            *entry += 1;
            *entry
        };
        tokio::time::sleep(Duration::from_millis(2)).await;
        if attempt <= self.failures.get(&payload).copied().unwrap_or(0) {
            return Err(OperationError::new(FailureKind::Network, "scripted failure"));
        }
        Ok(payload)
    }

    async fn close_session(&self, _session: usize) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Never manages to open a session.
#[derive(Clone, Default)]
struct Unreachable {
    open_attempts: Arc<AtomicUsize>,
}

#[async_trait::async_trait]
impl ExternalOperation for Unreachable {
    type Session = ();
    type Output = String;

    async fn open_session(&self) -> Result<(), OperationError> {
        self.open_attempts.fetch_add(1, Ordering::SeqCst);
        Err(OperationError::new(FailureKind::Session, "driver unavailable"))
    }

    async fn execute(&self, _session: &mut (), payload: &[u8]) -> Result<String, OperationError> {
        Ok(String::from_utf8_lossy(payload).into_owned())
    }
}

fn fast_config(workers: usize) -> RetryPoolConfig {
    RetryPoolConfig {
        workers,
        retry_backoff: Duration::from_millis(20),
        ..RetryPoolConfig::default()
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn one_retry_then_drop_resolves_every_item() {
    init_logging();
    let op = Scripted::new(&[("2", 1), ("4", 1), ("5", 2)]);
    let sink = RecordingSink::<String>::default();
    let pool = RetryPool::new(fast_config(3), op.clone(), sink.clone());

    let report = tokio::time::timeout(
        Duration::from_secs(10),
        pool.run_stream(Cursor::new(b"1\n2\n3\n4\n5\n".to_vec())),
    )
    .await
    .expect("no task left blocked")
    .expect("run succeeds");

    let mut written = sink.written();
    written.sort();
    assert_eq!(written, vec!["1", "2", "3", "4"]);

    let source = &report.sources[0];
    assert_eq!(source.read, 5);
    assert_eq!(source.transformed, 4);
    assert_eq!(source.written, 4);
    assert_eq!(source.dropped, 1);

    assert_eq!(op.attempts("1"), 1);
    assert_eq!(op.attempts("2"), 2);
    assert_eq!(op.attempts("5"), 2);
    // 3 primary + 2 retry sessions, plus one replacement per failure
    assert_eq!(op.opened.load(Ordering::SeqCst), 9);
    assert_eq!(op.closed.load(Ordering::SeqCst), 9);
}

#[tokio::test(flavor = "multi_thread")]
async fn stream_results_are_never_rotated() {
    init_logging();
    let op = Scripted::new(&[]);
    let sink = RecordingSink::<String>::default();
    let config = RetryPoolConfig {
        segment_size: 3,
        ..fast_config(4)
    };
    let input: String = (0..8).map(|n| format!("{n}\n")).collect();

    let report = RetryPool::new(config, op, sink.clone())
        .run_stream(Cursor::new(input.into_bytes()))
        .await
        .expect("run succeeds");

    // the stream source is never rotated
    assert_eq!(report.sources[0].segments, 1);
    assert_eq!(sink.written().len(), 8);
}

#[tokio::test(flavor = "multi_thread")]
async fn file_results_are_segmented_unordered() {
    init_logging();
    let temp = TempDir::new().unwrap();
    let input = temp.path().join("jobs.txt");
    let output = temp.path().join("out");
    let payloads: Vec<String> = (0..25).map(|n| format!("job-{n:02}")).collect();
    fs::write(&input, payloads.join("\n")).unwrap();

    let config = RetryPoolConfig {
        input,
        output_dir: output.clone(),
        segment_size: 10,
        ..fast_config(5)
    };
    let sink = SegmentFileSink::new(output.clone(), SegmentFileOptions::default());
    let report = RetryPool::new(config, Scripted::new(&[("job-07", 1)]), sink)
        .run()
        .await
        .expect("run succeeds");

    let mut all = Vec::new();
    for (name, expected_rows) in [("jobs.txt", 10), ("jobs_1.txt", 10), ("jobs_2.txt", 5)] {
        let text = fs::read_to_string(output.join(name)).unwrap();
        let rows: Vec<String> = text.lines().map(str::to_string).collect();
        assert_eq!(rows.len(), expected_rows, "{name}");
        all.extend(rows);
    }
    all.sort();
    assert_eq!(all, payloads);
    assert_eq!(report.sources[0].segments, 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn cancelled_pool_without_sessions_drops_everything() {
    init_logging();
    let sink = RecordingSink::<String>::default();
    let pool = RetryPool::new(fast_config(2), Unreachable::default(), sink.clone());
    let cancel = pool.cancellation();
    let input: String = (0..10).map(|n| format!("{n}\n")).collect();

    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
    });
    let report = tokio::time::timeout(
        Duration::from_secs(10),
        pool.run_stream(Cursor::new(input.into_bytes())),
    )
    .await
    .expect("workers drain after cancellation")
    .expect("cancellation is not an error");
    canceller.await.unwrap();

    let source = &report.sources[0];
    assert_eq!(source.written, 0);
    assert_eq!(source.dropped, source.read);
    assert!(sink.written().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn run_finishes_when_no_session_ever_opens() {
    init_logging();
    let op = Unreachable::default();
    let sink = RecordingSink::<String>::default();
    let config = RetryPoolConfig {
        retry_backoff: Duration::from_millis(10),
        ..fast_config(2)
    };
    let pool = RetryPool::new(config, op.clone(), sink.clone());
    let cancel = pool.cancellation();

    let report = tokio::time::timeout(
        Duration::from_secs(5),
        pool.run_stream(Cursor::new(b"only\n".to_vec())),
    )
    .await
    .expect("run returns without cancellation")
    .expect("run succeeds");

    assert!(!cancel.is_cancelled());
    let source = &report.sources[0];
    assert_eq!((source.read, source.written, source.dropped), (1, 0, 1));
    assert!(sink.written().is_empty());
    // 4 workers open once each; the two that failed the item open once more
    assert_eq!(op.open_attempts.load(Ordering::SeqCst), 6);
}

#[tokio::test(flavor = "multi_thread")]
async fn run_finishes_on_empty_input_when_no_session_ever_opens() {
    init_logging();
    let sink = RecordingSink::<String>::default();
    let report = tokio::time::timeout(
        Duration::from_secs(5),
        RetryPool::new(fast_config(3), Unreachable::default(), sink)
            .run_stream(Cursor::new(Vec::new())),
    )
    .await
    .expect("run returns without cancellation")
    .expect("run succeeds");

    assert_eq!(report.total_read(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn sink_failure_cancels_and_drains_the_pool() {
    init_logging();
    let payloads: String = (0..500).map(|n| format!("{n}\n")).collect();
    let sink = RecordingSink::<String>::failing_on_write(2);
    let pool = RetryPool::new(fast_config(4), Scripted::new(&[]), sink.clone());
    let cancel = pool.cancellation();

    let result = tokio::time::timeout(
        Duration::from_secs(10),
        pool.run_stream(Cursor::new(payloads.into_bytes())),
    )
    .await
    .expect("every task terminates");

    let Err(EngineError::Sink {
        source_id, report, ..
    }) = result
    else {
        panic!("expected a sink failure, got {result:?}");
    };
    assert_eq!(source_id, SourceId::Stream);
    assert!(cancel.is_cancelled());
    assert_eq!(sink.written().len(), 1);

    let source = &report.sources[0];
    assert!(source.error.is_some());
    assert_eq!(source.written, 1);
    assert!(source.read < 500);
    // the rejected result counts as dropped
    assert!(source.transformed > source.written);
    assert_eq!(source.dropped, source.read - source.written);
}

#[tokio::test(flavor = "multi_thread")]
async fn flaky_pages_are_fetched_on_retry_and_summarized() {
    init_logging();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/flaky"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/flaky"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            "<html><head><title>Flaky</title></head><body><img src=\"/f.png\"></body></html>",
            "text/html; charset=utf-8",
        ))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/steady"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            "<html><head><title>Steady</title></head></html>",
            "text/html",
        ))
        .mount(&server)
        .await;

    let temp = TempDir::new().unwrap();
    let input = temp.path().join("urls.txt");
    let output = temp.path().join("out");
    fs::write(
        &input,
        format!("{0}/flaky\n{0}/steady\n", server.uri()),
    )
    .unwrap();

    let config = RetryPoolConfig {
        input,
        output_dir: output.clone(),
        ..fast_config(2)
    };
    let operation = PageFetchOperation::new(FetchSettings {
        dump_html: true,
        ..FetchSettings::default()
    });
    let sink = SegmentFileSink::new(output.clone(), SegmentFileOptions::default());
    let report = RetryPool::new(config, operation, sink)
        .run()
        .await
        .expect("run succeeds");
    assert_eq!(report.sources[0].written, 2);

    let text = fs::read_to_string(output.join("urls.txt")).unwrap();
    let mut summaries = Vec::new();
    for line in text.lines() {
        summaries.push(PageSummaryTransform.process(line.as_bytes()).await.unwrap());
    }
    summaries.sort_by(|a, b| a.title.cmp(&b.title));

    assert_eq!(summaries[0].title, "Flaky");
    assert_eq!(summaries[0].images, vec![format!("{}/f.png", server.uri())]);
    assert_eq!(summaries[1].title, "Steady");
    assert!(summaries[1].images.is_empty());
}
