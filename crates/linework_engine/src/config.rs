use std::path::PathBuf;
use std::time::Duration;

use crate::types::STREAM_MARKER;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Number of concurrent workers; also bounds read-ahead.
    pub workers: usize,
    /// File, directory, or `-` for the live stream.
    pub input: PathBuf,
    pub output_dir: PathBuf,
    /// Maximum successfully written records per output segment.
    pub segment_size: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: 10,
            input: PathBuf::from(STREAM_MARKER),
            output_dir: PathBuf::from("./output"),
            segment_size: 1000,
        }
    }
}

impl PipelineConfig {
    pub fn default_with_output(output_dir: PathBuf) -> Self {
        Self {
            output_dir,
            ..Self::default()
        }
    }

    pub(crate) fn worker_count(&self) -> usize {
        self.workers.max(1)
    }

    pub(crate) fn segment_limit(&self) -> usize {
        self.segment_size.max(1)
    }
}

#[derive(Debug, Clone)]
pub struct RetryPoolConfig {
    /// Size of the primary pool.
    pub workers: usize,
    /// Size of the retry pool; `workers / 2 + 1` when unset.
    pub retry_workers: Option<usize>,
    /// Delay before a failed item is handed to the retry pool. Also used
    /// between failed attempts to open a session.
    pub retry_backoff: Duration,
    pub input: PathBuf,
    pub output_dir: PathBuf,
    pub segment_size: usize,
}

impl Default for RetryPoolConfig {
    fn default() -> Self {
        Self {
            workers: 10,
            retry_workers: None,
            retry_backoff: Duration::from_secs(10),
            input: PathBuf::from(STREAM_MARKER),
            output_dir: PathBuf::from("./output"),
            segment_size: 10_000,
        }
    }
}

impl RetryPoolConfig {
    pub fn default_with_output(output_dir: PathBuf) -> Self {
        Self {
            output_dir,
            ..Self::default()
        }
    }

    pub fn primary_pool_size(&self) -> usize {
        self.workers.max(1)
    }

    pub fn retry_pool_size(&self) -> usize {
        self.retry_workers
            .unwrap_or(self.primary_pool_size() / 2 + 1)
            .max(1)
    }

    /// Capacity of each source's result channel: room for every worker of
    /// both pools to hand off a result without waiting.
    pub(crate) fn result_capacity(&self) -> usize {
        self.primary_pool_size() + self.primary_pool_size() / 2 + 1
    }

    pub(crate) fn segment_limit(&self) -> usize {
        self.segment_size.max(1)
    }
}
