use std::sync::Arc;
use std::time::Instant;

use engine_logging::{engine_debug, engine_error, engine_info, engine_warn};
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::PipelineConfig;
use crate::pool::{spawn_transform_workers, Job};
use crate::queue;
use crate::reorder::ReorderBuffer;
use crate::segment::{sink_failed, SegmentWriter, WriterOutcome};
use crate::sink::Sink;
use crate::source::{enumerate_sources, feed_source, open_source, BoxedReader};
use crate::transform::Transform;
use crate::types::{EngineError, Record, RunReport, SourceId, SourceReport};

/// Transforms every record in parallel and writes the results of each source
/// in input order.
///
/// Sources are read one after another into a single worker queue; each source
/// has its own writer, which restores order with a [`ReorderBuffer`] and
/// rotates output through a [`SegmentWriter`]. A sink failure cancels the run;
/// the failed writer keeps draining its channel so no worker blocks on it.
pub struct OrderedPipeline<X: Transform, S> {
    config: PipelineConfig,
    transform: Arc<X>,
    sink: S,
    cancel: CancellationToken,
}

impl<X, S> OrderedPipeline<X, S>
where
    X: Transform,
    S: Sink<X::Output> + Clone,
{
    pub fn new(config: PipelineConfig, transform: X, sink: S) -> Self {
        Self {
            config,
            transform: Arc::new(transform),
            sink,
            cancel: CancellationToken::new(),
        }
    }

    /// Uses `cancel` as the run's cancellation token.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Processes every source named by the configured input.
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

    /// Processes `reader` as the live stream source, ignoring the configured
    /// input.
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
        let workers = self.config.worker_count();
        let (queue_tx, queue) = queue::bounded(workers);
        let pool = spawn_transform_workers(workers, Arc::clone(&self.transform), queue);
        engine_info!(
            "Pipeline started sources={} workers={}",
            sources.len(),
            workers
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
            let (reply_tx, reply_rx) = mpsc::channel(workers);
            let writer = spawn_ordered_writer(
                self.sink.clone(),
                Arc::clone(&source),
                self.config.segment_limit(),
                reply_rx,
                self.cancel.clone(),
            );
            let make_job = |index, raw| Job {
                record: Record::new(Arc::clone(&source), index, raw),
                reply: reply_tx.clone(),
            };
            let outcome = feed_source(&source, reader, &queue_tx, &self.cancel, make_job).await;
            drop(reply_tx);
            writers.push((Arc::clone(&source), outcome.read, writer));

            if let Some(error) = outcome.error {
                read_failure = Some((source.to_path_buf(), error));
                self.cancel.cancel();
                break;
            }
        }

        drop(queue_tx);
        for worker in pool {
            if let Err(err) = worker.await {
                engine_error!("Worker task failed err={}", err);
            }
        }

        let mut sources = Vec::with_capacity(writers.len());
        let mut first_failure = None;
        for (source, read, writer) in writers {
            let mut report = SourceReport::new(SourceId::clone(&source));
            report.read = read;
            match writer.await {
                Ok(outcome) => {
                    report.transformed = outcome.transformed;
                    report.written = outcome.stats.written;
                    report.segments = outcome.stats.segments;
                    report.dropped = outcome.transformed.saturating_sub(outcome.stats.written);
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
            "Pipeline finished read={} written={} elapsed={:?}",
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
}

/// Owns the reorder buffer and segment state of one source. Runs on a
/// blocking thread because sinks do synchronous I/O.
fn spawn_ordered_writer<T, S>(
    sink: S,
    source: Arc<SourceId>,
    segment_size: usize,
    mut results: mpsc::Receiver<Record<T>>,
    cancel: CancellationToken,
) -> JoinHandle<WriterOutcome>
where
    T: Send + 'static,
    S: Sink<T>,
{
    tokio::task::spawn_blocking(move || {
        let started = Instant::now();
        let mut outcome = WriterOutcome::default();
        let mut reorder = ReorderBuffer::new();

        let mut writer = match SegmentWriter::open(sink, Arc::clone(&source), segment_size) {
            Ok(writer) => Some(writer),
            Err(error) => {
                sink_failed(&source, &cancel, &error);
                outcome.error = Some(error);
                None
            }
        };

        while let Some(record) = results.blocking_recv() {
            if record.derived.is_some() {
                outcome.transformed += 1;
            }
            let Some(active) = writer.as_mut() else {
                outcome.drained += 1;
                continue;
            };

            let mut failure = None;
            for derived in reorder.accept(record.index, record.derived) {
                // a failed transform advances the cursor without a write
                let Some(item) = derived else {
                    continue;
                };
                if let Err(error) = active.write(item) {
                    failure = Some(error);
                    break;
                }
            }

            if let Some(error) = failure {
                sink_failed(&source, &cancel, &error);
                outcome.stats = active.stats();
                // the failed record plus everything still waiting on it
                outcome.drained += 1 + reorder.pending() as u64;
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

        if outcome.error.is_some() {
            engine_warn!(
                "Drained one source after failure source={} drained={} elapsed={:?}",
                source,
                outcome.drained,
                started.elapsed()
            );
        } else {
            engine_info!(
                "Finished to write one source source={} written={} segments={} elapsed={:?}",
                source,
                outcome.stats.written,
                outcome.stats.segments,
                started.elapsed()
            );
        }
        engine_debug!("Writer exit source={}", source);
        outcome
    })
}
