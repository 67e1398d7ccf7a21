use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::persist::PersistError;

/// Marker accepted in place of a path to read the live stream (stdin).
pub const STREAM_MARKER: &str = "-";

/// Identity of one logical input.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SourceId {
    /// The single live stream; output goes to the terminal, never rotated.
    Stream,
    File(PathBuf),
}

impl SourceId {
    pub fn parse(input: &Path) -> Self {
        if input.as_os_str() == STREAM_MARKER {
            SourceId::Stream
        } else {
            SourceId::File(input.to_path_buf())
        }
    }

    pub fn is_stream(&self) -> bool {
        matches!(self, SourceId::Stream)
    }

    pub fn path(&self) -> Option<&Path> {
        match self {
            SourceId::Stream => None,
            SourceId::File(path) => Some(path),
        }
    }

    /// The file path, or the stream marker as a path.
    pub fn to_path_buf(&self) -> PathBuf {
        match self {
            SourceId::Stream => PathBuf::from(STREAM_MARKER),
            SourceId::File(path) => path.clone(),
        }
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceId::Stream => f.write_str(STREAM_MARKER),
            SourceId::File(path) => write!(f, "{}", path.display()),
        }
    }
}

/// One line read from a source, travelling from the reader to the writer.
///
/// `derived` is filled by a worker; it stays `None` when the transform failed
/// so the writer can still account for the index.
#[derive(Debug, Clone)]
pub struct Record<T> {
    pub source: Arc<SourceId>,
    pub index: u64,
    pub raw: Bytes,
    pub derived: Option<T>,
}

impl<T> Record<T> {
    pub fn new(source: Arc<SourceId>, index: u64, raw: Bytes) -> Self {
        Self {
            source,
            index,
            raw,
            derived: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceReport {
    pub source: SourceId,
    /// Records pulled from the source and handed to the workers.
    pub read: u64,
    /// Records whose transform (or external operation) succeeded.
    pub transformed: u64,
    /// Records accepted by `Sink::write`.
    pub written: u64,
    /// Records that produced a result but were never written: rejected by a
    /// failed sink or drained after it. The retry pool also counts items it
    /// gave up on, so there `read == written + dropped`.
    pub dropped: u64,
    pub segments: usize,
    pub error: Option<String>,
}

impl SourceReport {
    pub fn new(source: SourceId) -> Self {
        Self {
            source,
            read: 0,
            transformed: 0,
            written: 0,
            dropped: 0,
            segments: 0,
            error: None,
        }
    }

    pub fn skipped(&self) -> u64 {
        self.read.saturating_sub(self.transformed)
    }

    pub fn is_complete(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub sources: Vec<SourceReport>,
    pub elapsed: Duration,
}

impl RunReport {
    pub fn source(&self, source: &SourceId) -> Option<&SourceReport> {
        self.sources.iter().find(|report| &report.source == source)
    }

    pub fn total_read(&self) -> u64 {
        self.sources.iter().map(|report| report.read).sum()
    }

    pub fn total_written(&self) -> u64 {
        self.sources.iter().map(|report| report.written).sum()
    }
}

/// Per-record failure; the record is skipped and the run continues.
#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    #[error("malformed record: {0}")]
    Malformed(String),
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Output failure; fatal to the owning source and cancels the run.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("persist error: {0}")]
    Persist(#[from] PersistError),
    #[error("no segment is open")]
    NoOpenSegment,
    #[error("sink rejected write: {0}")]
    Rejected(String),
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("failed to enumerate {path:?}: {error}")]
    Enumeration {
        path: PathBuf,
        #[source]
        error: io::Error,
        /// Sources finished before the failure; `None` if nothing was read.
        report: Option<RunReport>,
    },
    #[error("sink failed to prepare: {0}")]
    Prepare(#[source] SinkError),
    #[error("sink failed for source {source_id}: {error}")]
    Sink {
        source_id: SourceId,
        #[source]
        error: SinkError,
        report: RunReport,
    },
}

impl EngineError {
    /// Partial report of a run that failed after it started reading.
    pub fn report(&self) -> Option<&RunReport> {
        match self {
            EngineError::Sink { report, .. } => Some(report),
            EngineError::Enumeration { report, .. } => report.as_ref(),
            EngineError::Prepare(_) => None,
        }
    }
}

/// Failure of one external operation attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationError {
    pub kind: FailureKind,
    pub message: String,
}

impl OperationError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for OperationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for OperationError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    InvalidUrl,
    HttpStatus(u16),
    Timeout,
    RedirectLimitExceeded,
    TooLarge { max_bytes: u64, actual: Option<u64> },
    UnsupportedContentType { content_type: String },
    Decode { encoding: String },
    Session,
    Network,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::InvalidUrl => write!(f, "invalid url"),
            FailureKind::HttpStatus(code) => write!(f, "http status {code}"),
            FailureKind::Timeout => write!(f, "timeout"),
            FailureKind::RedirectLimitExceeded => write!(f, "redirect limit exceeded"),
            FailureKind::TooLarge { max_bytes, actual } => {
                write!(f, "response too large (max {max_bytes}, actual {actual:?})")
            }
            FailureKind::UnsupportedContentType { content_type } => {
                write!(f, "unsupported content type {content_type}")
            }
            FailureKind::Decode { encoding } => write!(f, "failed to decode body as {encoding}"),
            FailureKind::Session => write!(f, "session failure"),
            FailureKind::Network => write!(f, "network error"),
        }
    }
}
