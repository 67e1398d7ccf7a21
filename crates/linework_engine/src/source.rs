use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Instant;

use bytes::Bytes;
use engine_logging::{engine_debug, engine_info, engine_warn};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::types::SourceId;

pub(crate) type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Expands the configured input into sources: the stream marker, a single
/// file, or every file below a directory in lexical order.
pub fn enumerate_sources(input: &Path) -> io::Result<Vec<SourceId>> {
    let source = SourceId::parse(input);
    if source.is_stream() {
        return Ok(vec![source]);
    }
    let meta = fs::metadata(input)?;
    if !meta.is_dir() {
        return Ok(vec![source]);
    }
    let mut files = Vec::new();
    walk_dir(input, &mut files)?;
    Ok(files.into_iter().map(SourceId::File).collect())
}

fn walk_dir(dir: &Path, files: &mut Vec<PathBuf>) -> io::Result<()> {
    let mut entries = fs::read_dir(dir)?.collect::<Result<Vec<_>, _>>()?;
    entries.sort_by_key(|entry| entry.file_name());
    for entry in entries {
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            walk_dir(&path, files)?;
        } else {
            files.push(path);
        }
    }
    Ok(())
}

pub(crate) async fn open_source(source: &SourceId) -> io::Result<BoxedReader> {
    match source {
        SourceId::Stream => Ok(Box::new(tokio::io::stdin())),
        SourceId::File(path) => {
            let file = tokio::fs::File::open(path).await?;
            Ok(Box::new(file))
        }
    }
}

/// Splits a byte stream into newline-delimited records.
///
/// The `\n` terminator and a preceding `\r` are stripped. A trailing line
/// without a terminator is still returned.
pub struct LineReader<R> {
    inner: BufReader<R>,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            inner: BufReader::new(reader),
            buf: Vec::new(),
        }
    }

    pub async fn next_line(&mut self) -> io::Result<Option<Bytes>> {
        self.buf.clear();
        let read = self.inner.read_until(b'\n', &mut self.buf).await?;
        if read == 0 {
            return Ok(None);
        }
        if self.buf.last() == Some(&b'\n') {
            self.buf.pop();
        }
        if self.buf.last() == Some(&b'\r') {
            self.buf.pop();
        }
        Ok(Some(Bytes::copy_from_slice(&self.buf)))
    }
}

#[derive(Debug)]
pub(crate) struct FeedOutcome {
    pub read: u64,
    pub error: Option<io::Error>,
}

/// Reads `reader` line by line and pushes one job per line into `queue`,
/// numbering lines from 0. Stops early, without error, once `cancel` fires.
pub(crate) async fn feed_source<R, J, F>(
    source: &SourceId,
    reader: R,
    queue: &mpsc::Sender<J>,
    cancel: &CancellationToken,
    mut make_job: F,
) -> FeedOutcome
where
    R: AsyncRead + Unpin,
    F: FnMut(u64, Bytes) -> J,
{
    let started = Instant::now();
    let mut lines = LineReader::new(reader);
    let mut read: u64 = 0;

    loop {
        if cancel.is_cancelled() {
            engine_warn!(
                "Partial finished to read one source source={} read={} elapsed={:?}",
                source,
                read,
                started.elapsed()
            );
            return FeedOutcome { read, error: None };
        }
        let raw = match lines.next_line().await {
            Ok(Some(raw)) => raw,
            Ok(None) => break,
            Err(err) => {
                engine_warn!(
                    "Failed to read line from source source={} read={} err={}",
                    source,
                    read,
                    err
                );
                return FeedOutcome {
                    read,
                    error: Some(err),
                };
            }
        };
        if queue.send(make_job(read, raw)).await.is_err() {
            engine_warn!("Worker queue closed while reading source={}", source);
            break;
        }
        read += 1;
    }

    engine_info!(
        "Finished to read one source source={} read={} elapsed={:?}",
        source,
        read,
        started.elapsed()
    );
    engine_debug!("Reader exit source={}", source);
    FeedOutcome { read, error: None }
}
