use std::sync::Arc;

use engine_logging::{engine_debug, engine_warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::queue::SharedQueue;
use crate::transform::Transform;
use crate::types::Record;

/// A record on its way to a worker, with the channel of its source's writer.
pub(crate) struct Job<T> {
    pub record: Record<T>,
    pub reply: mpsc::Sender<Record<T>>,
}

/// Starts `count` workers that apply `transform` to every queued record and
/// hand the result to the record's writer.
///
/// A failed transform is logged and the record is forwarded with no derived
/// payload, so the writer can advance past its index.
pub(crate) fn spawn_transform_workers<X: Transform>(
    count: usize,
    transform: Arc<X>,
    queue: SharedQueue<Job<X::Output>>,
) -> Vec<JoinHandle<()>> {
    (0..count)
        .map(|worker| {
            let transform = Arc::clone(&transform);
            let queue = queue.clone();
            tokio::spawn(async move {
                while let Some(Job { mut record, reply }) = queue.next().await {
                    match transform.process(&record.raw).await {
                        Ok(derived) => record.derived = Some(derived),
                        Err(err) => {
                            engine_warn!(
                                "Failed to transform record worker={} source={} index={} err={}",
                                worker,
                                record.source,
                                record.index,
                                err
                            );
                        }
                    }
                    if reply.send(record).await.is_err() {
                        engine_debug!("Writer gone, result discarded worker={}", worker);
                    }
                }
                engine_debug!("Worker exit worker={}", worker);
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue;
    use crate::types::{SourceId, TransformError};
    use bytes::Bytes;

    struct EvenOnly;

    #[async_trait::async_trait]
    impl Transform for EvenOnly {
        type Output = u64;

        async fn process(&self, raw: &[u8]) -> Result<u64, TransformError> {
            let text = std::str::from_utf8(raw)
                .map_err(|e| TransformError::Malformed(e.to_string()))?;
            let n: u64 = text
                .parse()
                .map_err(|_| TransformError::Malformed(text.to_string()))?;
            if n % 2 == 0 {
                Ok(n * 10)
            } else {
                Err(TransformError::Malformed("odd".into()))
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failures_are_forwarded_without_payload() {
        let (tx, queue) = queue::bounded(3);
        let workers = spawn_transform_workers(3, Arc::new(EvenOnly), queue);
        let (reply, mut results) = mpsc::channel(16);
        let source = Arc::new(SourceId::Stream);

        for index in 0..6u64 {
            let raw = Bytes::from(index.to_string());
            let record = Record::new(Arc::clone(&source), index, raw);
            tx.send(Job {
                record,
                reply: reply.clone(),
            })
            .await
            .unwrap();
        }
        drop(tx);
        drop(reply);
        for worker in workers {
            worker.await.unwrap();
        }

        let mut got = Vec::new();
        while let Some(record) = results.recv().await {
            got.push((record.index, record.derived));
        }
        got.sort_unstable();
        assert_eq!(
            got,
            vec![
                (0, Some(0)),
                (1, None),
                (2, Some(20)),
                (3, None),
                (4, Some(40)),
                (5, None),
            ]
        );
    }
}
