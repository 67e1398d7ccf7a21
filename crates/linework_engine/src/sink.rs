use std::fmt::Display;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use engine_logging::{engine_debug, engine_info};

use crate::persist::{ensure_output_dir, SegmentFile};
use crate::types::{SinkError, SourceId};

/// Output lifecycle driven by the segment writer.
///
/// One value is prepared once per run, then cloned for every source; each
/// clone sees `before_write` once, any number of `pre_write`/`write`/
/// `post_write` rounds, and `after_write` once.
pub trait Sink<T>: Send + 'static {
    /// Global one-time setup, called on the prototype before any source.
    fn prepare_once(&mut self) -> Result<(), SinkError>;

    /// Per-source setup.
    fn before_write(&mut self, source: &SourceId) -> Result<(), SinkError>;

    /// Opens a segment; called before row 0 of each segment.
    fn pre_write(&mut self, row: usize) -> Result<(), SinkError>;

    fn write(&mut self, item: T) -> Result<(), SinkError>;

    /// Closes a full segment; called after its last row.
    fn post_write(&mut self, row: usize) -> Result<(), SinkError>;

    /// Flushes a partial trailing segment and cleans up stale output.
    fn after_write(&mut self) -> Result<(), SinkError>;
}

#[derive(Debug, Clone)]
pub struct SegmentFileOptions {
    /// Extension of every segment file, including the dot.
    pub extension: String,
    /// Text written at the start of each segment.
    pub header: String,
    /// Text written at the end of each segment.
    pub footer: String,
}

impl Default for SegmentFileOptions {
    fn default() -> Self {
        Self {
            extension: ".txt".to_string(),
            header: String::new(),
            footer: String::new(),
        }
    }
}

type SharedStream = Arc<Mutex<Box<dyn Write + Send>>>;

enum Target {
    Unset,
    Stream { started: bool },
    Files { stem: String },
}

/// Writes each record as one line into numbered segment files.
///
/// For a source `dir/name.ext` segment 0 is `{output_dir}/name{extension}` and
/// segment `n` is `{output_dir}/name_{n}{extension}`. Segments are written to a
/// temporary file and renamed into place when closed. The stream source writes
/// to standard output (or the writer given to [`SegmentFileSink::with_stream`]).
pub struct SegmentFileSink {
    output_dir: PathBuf,
    options: Arc<SegmentFileOptions>,
    stream: SharedStream,
    target: Target,
    current: Option<SegmentFile>,
    next_segment: usize,
    last_segment: Option<usize>,
}

impl SegmentFileSink {
    pub fn new(output_dir: PathBuf, options: SegmentFileOptions) -> Self {
        Self {
            output_dir,
            options: Arc::new(options),
            stream: Arc::new(Mutex::new(Box::new(io::stdout()))),
            target: Target::Unset,
            current: None,
            next_segment: 0,
            last_segment: None,
        }
    }

    /// Replaces standard output as the destination of the stream source.
    pub fn with_stream(mut self, writer: impl Write + Send + 'static) -> Self {
        self.stream = Arc::new(Mutex::new(Box::new(writer)));
        self
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn segment_path(&self, stem: &str, segment: usize) -> PathBuf {
        let ext = &self.options.extension;
        if segment == 0 {
            self.output_dir.join(format!("{stem}{ext}"))
        } else {
            self.output_dir.join(format!("{stem}_{segment}{ext}"))
        }
    }

    fn write_stream(&self, text: &str) -> Result<(), SinkError> {
        let mut stream = self
            .stream
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        stream.write_all(text.as_bytes())?;
        Ok(())
    }

    fn flush_stream(&self) -> Result<(), SinkError> {
        let mut stream = self
            .stream
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        stream.flush()?;
        Ok(())
    }

    fn close_segment(&mut self) -> Result<(), SinkError> {
        let Target::Files { stem } = &self.target else {
            return Ok(());
        };
        let Some(mut segment) = self.current.take() else {
            return Ok(());
        };
        let Some(index) = self.last_segment else {
            return Err(SinkError::NoOpenSegment);
        };
        let target = self.segment_path(stem, index);
        segment.write_text(&self.options.footer)?;
        let path = segment.commit(&target)?;
        engine_debug!("Closed segment path={}", path.display());
        Ok(())
    }

    fn remove_stale_segments(&self, stem: &str) -> Result<(), SinkError> {
        let mut probe = self.last_segment.unwrap_or(0) + 1;
        loop {
            let path = self.segment_path(stem, probe);
            match fs::remove_file(&path) {
                Ok(()) => {
                    engine_info!("Removed stale segment path={}", path.display());
                    probe += 1;
                }
                Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
                Err(err) => return Err(err.into()),
            }
        }
    }
}

impl Clone for SegmentFileSink {
    /// Shares configuration and the stream writer; per-source state starts fresh.
    fn clone(&self) -> Self {
        Self {
            output_dir: self.output_dir.clone(),
            options: Arc::clone(&self.options),
            stream: Arc::clone(&self.stream),
            target: Target::Unset,
            current: None,
            next_segment: 0,
            last_segment: None,
        }
    }
}

impl<T: Display> Sink<T> for SegmentFileSink {
    fn prepare_once(&mut self) -> Result<(), SinkError> {
        ensure_output_dir(&self.output_dir)?;
        Ok(())
    }

    fn before_write(&mut self, source: &SourceId) -> Result<(), SinkError> {
        self.target = match source {
            SourceId::Stream => Target::Stream { started: false },
            SourceId::File(path) => {
                let stem = path
                    .file_stem()
                    .map(|stem| stem.to_string_lossy().into_owned())
                    .filter(|stem| !stem.is_empty())
                    .unwrap_or_else(|| "output".to_string());
                Target::Files { stem }
            }
        };
        Ok(())
    }

    fn pre_write(&mut self, _row: usize) -> Result<(), SinkError> {
        match &mut self.target {
            Target::Unset => Err(SinkError::NoOpenSegment),
            Target::Stream { started } => {
                if *started {
                    return Ok(());
                }
                *started = true;
                self.write_stream(&self.options.header)
            }
            Target::Files { .. } => {
                // a segment left open by a missing post_write is finalized first
                self.close_segment()?;
                let mut segment = SegmentFile::create(&self.output_dir)?;
                segment.write_text(&self.options.header)?;
                self.current = Some(segment);
                self.last_segment = Some(self.next_segment);
                self.next_segment += 1;
                Ok(())
            }
        }
    }

    fn write(&mut self, item: T) -> Result<(), SinkError> {
        match &self.target {
            Target::Unset => Err(SinkError::NoOpenSegment),
            Target::Stream { .. } => self.write_stream(&format!("{item}\n")),
            Target::Files { .. } => {
                let segment = self.current.as_mut().ok_or(SinkError::NoOpenSegment)?;
                segment.write_line(&item)?;
                Ok(())
            }
        }
    }

    fn post_write(&mut self, _row: usize) -> Result<(), SinkError> {
        match &self.target {
            Target::Files { .. } => self.close_segment(),
            // the stream footer is written once, by after_write
            Target::Stream { .. } | Target::Unset => Ok(()),
        }
    }

    fn after_write(&mut self) -> Result<(), SinkError> {
        match &self.target {
            Target::Unset => Ok(()),
            Target::Stream { started } => {
                if *started {
                    self.write_stream(&self.options.footer)?;
                }
                self.flush_stream()
            }
            Target::Files { stem } => {
                let stem = stem.clone();
                self.close_segment()?;
                self.remove_stale_segments(&stem)
            }
        }
    }
}
