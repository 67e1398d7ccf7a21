use std::marker::PhantomData;
use std::sync::Arc;

use engine_logging::engine_error;
use tokio_util::sync::CancellationToken;

use crate::sink::Sink;
use crate::types::{SinkError, SourceId};

/// Drives a sink through the segment lifecycle for one source.
///
/// `pre_write` is called before the first row of every segment and
/// `post_write` after its last row; a stream source has a single segment that
/// is never rotated. `finish` hands the partial trailing segment to
/// `after_write`.
pub struct SegmentWriter<T, S> {
    sink: S,
    source: Arc<SourceId>,
    /// `None` for the stream source.
    segment_size: Option<usize>,
    rows_in_segment: usize,
    segment_index: usize,
    written: u64,
    _item: PhantomData<fn(T)>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SegmentStats {
    pub written: u64,
    pub segments: usize,
}

impl<T, S: Sink<T>> SegmentWriter<T, S> {
    pub fn open(
        mut sink: S,
        source: Arc<SourceId>,
        segment_size: usize,
    ) -> Result<Self, SinkError> {
        sink.before_write(&source)?;
        let segment_size = if source.is_stream() {
            None
        } else {
            Some(segment_size.max(1))
        };
        Ok(Self {
            sink,
            source,
            segment_size,
            rows_in_segment: 0,
            segment_index: 0,
            written: 0,
            _item: PhantomData,
        })
    }

    pub fn source(&self) -> &SourceId {
        &self.source
    }

    pub fn write(&mut self, item: T) -> Result<(), SinkError> {
        if self.rows_in_segment == 0 {
            self.sink.pre_write(self.rows_in_segment)?;
        }
        self.sink.write(item)?;
        self.rows_in_segment += 1;
        self.written += 1;
        if Some(self.rows_in_segment) == self.segment_size {
            self.sink.post_write(self.rows_in_segment - 1)?;
            self.rows_in_segment = 0;
            self.segment_index += 1;
        }
        Ok(())
    }

    pub fn stats(&self) -> SegmentStats {
        SegmentStats {
            written: self.written,
            segments: self.segment_index + usize::from(self.rows_in_segment > 0),
        }
    }

    pub fn finish(mut self) -> Result<SegmentStats, SinkError> {
        self.sink.after_write()?;
        Ok(self.stats())
    }
}

/// What a writer task hands back when its source is done.
#[derive(Debug, Default)]
pub(crate) struct WriterOutcome {
    /// Results that carried a derived payload.
    pub transformed: u64,
    /// Results discarded after the sink failed, the rejected one included.
    pub drained: u64,
    pub stats: SegmentStats,
    pub error: Option<SinkError>,
}

/// Logs a sink failure and cancels the run.
pub(crate) fn sink_failed(source: &SourceId, cancel: &CancellationToken, error: &SinkError) {
    engine_error!("Sink failed source={} err={}", source, error);
    cancel.cancel();
}
