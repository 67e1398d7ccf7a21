use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use engine_logging::{engine_debug, engine_error, engine_info, engine_warn};
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::RetryPoolConfig;
use crate::group::{CompletionGroup, Ticket};
use crate::queue::{self, SharedQueue};
use crate::segment::{sink_failed, SegmentWriter, WriterOutcome};
use crate::sink::Sink;
use crate::source::{enumerate_sources, feed_source, open_source, BoxedReader};
use crate::types::{EngineError, OperationError, RunReport, SourceId, SourceReport};

/// An operation against an external system that needs a live session, such
/// as an HTTP client or a browser driver.
///
/// Each worker owns one session at a time. A session that saw a failed
/// `execute` is closed and replaced before the worker takes another item.
#[async_trait::async_trait]
pub trait ExternalOperation: Send + Sync + 'static {
    type Session: Send + 'static;
    type Output: Send + 'static;

    async fn open_session(&self) -> Result<Self::Session, OperationError>;

    async fn execute(
        &self,
        session: &mut Self::Session,
        payload: &[u8],
    ) -> Result<Self::Output, OperationError>;

    async fn close_session(&self, _session: Self::Session) {}
}

/// One payload travelling through the retry pool.
///
/// The ticket resolves the item in its source's [`CompletionGroup`] when the
/// item completes, is given up, or is dropped on any other path.
struct WorkItem<T> {
    source: Arc<SourceId>,
    index: u64,
    payload: Bytes,
    attempted: bool,
    ticket: Ticket,
    results: mpsc::Sender<T>,
}

impl<T> WorkItem<T> {
    async fn complete(self, output: T) {
        let WorkItem {
            source,
            index,
            ticket,
            results,
            ..
        } = self;
        if results.send(output).await.is_err() {
            engine_debug!("Writer gone, result discarded source={} index={}", source, index);
        }
        ticket.resolve();
    }

    fn give_up(self) {
        engine_debug!("Dropping item source={} index={}", self.source, self.index);
        self.ticket.resolve();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Primary,
    Retry,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Primary => f.write_str("primary"),
            Role::Retry => f.write_str("retry"),
        }
    }
}

/// Runs an [`ExternalOperation`] over every record with one delayed retry.
///
/// A primary pool takes each record first. An item that fails there is handed
/// to a smaller retry pool after the configured backoff; a second failure
/// drops it. Results are written unordered as they arrive.
pub struct RetryPool<O: ExternalOperation, S> {
    config: RetryPoolConfig,
    operation: Arc<O>,
    sink: S,
    cancel: CancellationToken,
}

impl<O, S> RetryPool<O, S>
where
    O: ExternalOperation,
    S: Sink<O::Output> + Clone,
{
    pub fn new(config: RetryPoolConfig, operation: O, sink: S) -> Self {
        Self {
            config,
            operation: Arc::new(operation),
            sink,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn run(mut self) -> Result<RunReport, EngineError> {
        self.sink.prepare_once().map_err(EngineError::Prepare)?;
        let sources =
            enumerate_sources(&self.config.input).map_err(|error| EngineError::Enumeration {
                path: self.config.input.clone(),
                error,
                report: None,
            })?;
        self.drive(sources, None).await
    }

    /// Processes `reader` as the live stream source.
    pub async fn run_stream<R>(mut self, reader: R) -> Result<RunReport, EngineError>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        self.sink.prepare_once().map_err(EngineError::Prepare)?;
        let reader: BoxedReader = Box::new(reader);
        self.drive(vec![SourceId::Stream], Some(reader)).await
    }

    async fn drive(
        self,
        sources: Vec<SourceId>,
        mut injected: Option<BoxedReader>,
    ) -> Result<RunReport, EngineError> {
        let started = Instant::now();
        let primary_size = self.config.primary_pool_size();
        let retry_size = self.config.retry_pool_size();
        let (primary_tx, primary_queue) = queue::bounded(primary_size);
        let (retry_tx, retry_queue) = queue::bounded(retry_size);

        let mut pool = Vec::with_capacity(primary_size + retry_size);
        for worker in 0..primary_size {
            pool.push(self.spawn_worker(
                Role::Primary,
                worker,
                primary_queue.clone(),
                Some(retry_tx.clone()),
            ));
        }
        for worker in 0..retry_size {
            pool.push(self.spawn_worker(Role::Retry, worker, retry_queue.clone(), None));
        }
        // the retry queue closes once every primary worker and pending backoff is done
        drop(retry_tx);
        engine_info!(
            "Retry pool started sources={} primary={} retry={}",
            sources.len(),
            primary_size,
            retry_size
        );

        let mut writers = Vec::with_capacity(sources.len());
        let mut read_failure = None;
        for source in sources {
            if self.cancel.is_cancelled() {
                engine_warn!("Run cancelled, skipping source={}", source);
                break;
            }
            let reader = match injected.take() {
                Some(reader) => reader,
                None => match open_source(&source).await {
                    Ok(reader) => reader,
                    Err(error) => {
                        engine_error!("Failed to open source source={} err={}", source, error);
                        read_failure = Some((source.to_path_buf(), error));
                        self.cancel.cancel();
                        break;
                    }
                },
            };

            let source = Arc::new(source);
            let group = CompletionGroup::new();
            let (results_tx, results_rx) = mpsc::channel(self.config.result_capacity());
            let writer = spawn_unordered_writer(
                self.sink.clone(),
                Arc::clone(&source),
                self.config.segment_limit(),
                results_rx,
                self.cancel.clone(),
            );
            let make_item = |index, payload| WorkItem {
                source: Arc::clone(&source),
                index,
                payload,
                attempted: false,
                ticket: group.enlist(),
                results: results_tx.clone(),
            };
            let outcome =
                feed_source(&source, reader, &primary_tx, &self.cancel, make_item).await;
            drop(results_tx);
            let watcher = watch_group(Arc::clone(&source), group);
            writers.push((Arc::clone(&source), outcome.read, writer, watcher));

            if let Some(error) = outcome.error {
                read_failure = Some((source.to_path_buf(), error));
                self.cancel.cancel();
                break;
            }
        }

        drop(primary_tx);
        for worker in pool {
            if let Err(err) = worker.await {
                engine_error!("Worker task failed err={}", err);
            }
        }

        let mut sources = Vec::with_capacity(writers.len());
        let mut first_failure = None;
        for (source, read, writer, watcher) in writers {
            if let Err(err) = watcher.await {
                engine_error!("Group watcher failed source={} err={}", source, err);
            }
            let mut report = SourceReport::new(SourceId::clone(&source));
            report.read = read;
            match writer.await {
                Ok(outcome) => {
                    report.transformed = outcome.transformed;
                    report.written = outcome.stats.written;
                    report.segments = outcome.stats.segments;
                    report.dropped = read.saturating_sub(outcome.stats.written);
                    if let Some(error) = outcome.error {
                        report.error = Some(error.to_string());
                        if first_failure.is_none() {
                            first_failure = Some((SourceId::clone(&source), error));
                        }
                    }
                }
                Err(err) => {
                    engine_error!("Writer task failed source={} err={}", source, err);
                    report.error = Some(err.to_string());
                }
            }
            sources.push(report);
        }

        let report = RunReport {
            sources,
            elapsed: started.elapsed(),
        };
        engine_info!(
            "Retry pool finished read={} written={} elapsed={:?}",
            report.total_read(),
            report.total_written(),
            report.elapsed
        );

        if let Some((path, error)) = read_failure {
            return Err(EngineError::Enumeration {
                path,
                error,
                report: Some(report),
            });
        }
        if let Some((source_id, error)) = first_failure {
            return Err(EngineError::Sink {
                source_id,
                error,
                report,
            });
        }
        Ok(report)
    }

    fn spawn_worker(
        &self,
        role: Role,
        worker: usize,
        queue: SharedQueue<WorkItem<O::Output>>,
        retry: Option<mpsc::Sender<WorkItem<O::Output>>>,
    ) -> JoinHandle<()> {
        let worker = Worker {
            role,
            index: worker,
            operation: Arc::clone(&self.operation),
            queue,
            retry,
            backoff: self.config.retry_backoff,
            cancel: self.cancel.clone(),
        };
        tokio::spawn(worker.run())
    }
}

struct Worker<O: ExternalOperation> {
    role: Role,
    index: usize,
    operation: Arc<O>,
    queue: SharedQueue<WorkItem<O::Output>>,
    /// Present for primary workers only.
    retry: Option<mpsc::Sender<WorkItem<O::Output>>>,
    backoff: Duration,
    cancel: CancellationToken,
}

impl<O: ExternalOperation> Worker<O> {
    /// Opens a session, processes items until one fails, closes the session,
    /// and starts over until the queue is closed. Without a session, each
    /// attempt to open one costs the next queued item an attempt.
    async fn run(self) {
        loop {
            let mut session = match self.operation.open_session().await {
                Ok(session) => session,
                Err(err) => {
                    engine_warn!(
                        "Failed to open session role={} worker={} err={}",
                        self.role,
                        self.index,
                        err
                    );
                    if self.cancel.is_cancelled() {
                        self.drain().await;
                        return;
                    }
                    // the next item fails with the open error
                    let Some(item) = self.queue.next().await else {
                        engine_debug!("Worker exit role={} worker={}", self.role, self.index);
                        return;
                    };
                    self.fail(item, err);
                    tokio::select! {
                        _ = tokio::time::sleep(self.backoff) => {}
                        _ = self.cancel.cancelled() => {}
                    }
                    continue;
                }
            };
            engine_debug!("Session opened role={} worker={}", self.role, self.index);

            let open = self.serve(&mut session).await;
            self.operation.close_session(session).await;
            if !open {
                engine_debug!("Worker exit role={} worker={}", self.role, self.index);
                return;
            }
        }
    }

    /// Returns `false` once the queue is closed, `true` after a failure that
    /// calls for a fresh session.
    async fn serve(&self, session: &mut O::Session) -> bool {
        while let Some(item) = self.queue.next().await {
            match self.operation.execute(session, &item.payload).await {
                Ok(output) => item.complete(output).await,
                Err(err) => {
                    self.fail(item, err);
                    return true;
                }
            }
        }
        false
    }

    fn fail(&self, mut item: WorkItem<O::Output>, err: OperationError) {
        match (&self.retry, item.attempted) {
            (Some(retry), false) => {
                engine_warn!(
                    "Failed to execute, will retry role={} worker={} source={} index={} err={}",
                    self.role,
                    self.index,
                    item.source,
                    item.index,
                    err
                );
                item.attempted = true;
                schedule_retry(item, retry.clone(), self.backoff, self.cancel.clone());
            }
            _ => {
                engine_warn!(
                    "Failed to execute, giving up role={} worker={} source={} index={} err={}",
                    self.role,
                    self.index,
                    item.source,
                    item.index,
                    err
                );
                item.give_up();
            }
        }
    }

    /// Resolves everything still queued; used when no session can be opened
    /// after cancellation.
    async fn drain(&self) {
        let mut dropped = 0usize;
        while let Some(item) = self.queue.next().await {
            item.give_up();
            dropped += 1;
        }
        engine_warn!(
            "Drained queue without a session role={} worker={} dropped={}",
            self.role,
            self.index,
            dropped
        );
    }
}

/// Hands `item` to the retry queue after `backoff`, without holding up the
/// worker that failed it. Cancellation cuts the wait short but the item is
/// still handed over, so it is resolved by a retry worker.
fn schedule_retry<T: Send + 'static>(
    item: WorkItem<T>,
    retry: mpsc::Sender<WorkItem<T>>,
    backoff: Duration,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = cancel.cancelled() => {}
        }
        if let Err(mpsc::error::SendError(item)) = retry.send(item).await {
            engine_warn!(
                "Retry queue closed source={} index={}",
                item.source,
                item.index
            );
            item.give_up();
        }
    });
}

fn watch_group(source: Arc<SourceId>, group: CompletionGroup) -> JoinHandle<()> {
    tokio::spawn(async move {
        let started = Instant::now();
        group.wait().await;
        engine_info!(
            "All items resolved source={} elapsed={:?}",
            source,
            started.elapsed()
        );
    })
}

/// Writes results in arrival order; rotation is by written count only.
fn spawn_unordered_writer<T, S>(
    sink: S,
    source: Arc<SourceId>,
    segment_size: usize,
    mut results: mpsc::Receiver<T>,
    cancel: CancellationToken,
) -> JoinHandle<WriterOutcome>
where
    T: Send + 'static,
    S: Sink<T>,
{
    tokio::task::spawn_blocking(move || {
        let started = Instant::now();
        let mut outcome = WriterOutcome::default();
        let mut writer = match SegmentWriter::open(sink, Arc::clone(&source), segment_size) {
            Ok(writer) => Some(writer),
            Err(error) => {
                sink_failed(&source, &cancel, &error);
                outcome.error = Some(error);
                None
            }
        };

        while let Some(output) = results.blocking_recv() {
            outcome.transformed += 1;
            let Some(active) = writer.as_mut() else {
                outcome.drained += 1;
                continue;
            };
            if let Err(error) = active.write(output) {
                sink_failed(&source, &cancel, &error);
                outcome.drained += 1;
                outcome.stats = active.stats();
                outcome.error = Some(error);
                writer = None;
            }
        }

        if let Some(writer) = writer {
            outcome.stats = writer.stats();
            match writer.finish() {
                Ok(stats) => outcome.stats = stats,
                Err(error) => {
                    sink_failed(&source, &cancel, &error);
                    outcome.error = Some(error);
                }
            }
        }

        engine_info!(
            "Finished to write one source source={} written={} segments={} elapsed={:?}",
            source,
            outcome.stats.written,
            outcome.stats.segments,
            started.elapsed()
        );
        outcome
    })
}
