use std::fmt::Display;
use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("output directory missing or not writable: {0}")]
    OutputDir(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Ensure output directory exists; create if missing.
pub fn ensure_output_dir(dir: &Path) -> Result<(), PersistError> {
    if dir.exists() {
        let meta = fs::metadata(dir).map_err(|e| PersistError::OutputDir(e.to_string()))?;
        if !meta.is_dir() {
            return Err(PersistError::OutputDir(format!(
                "{} is not a directory",
                dir.display()
            )));
        }
    } else {
        fs::create_dir_all(dir).map_err(|e| PersistError::OutputDir(e.to_string()))?;
    }
    // Writability probe; the temp file is removed on drop.
    NamedTempFile::new_in(dir).map_err(|e| PersistError::OutputDir(e.to_string()))?;
    Ok(())
}

/// One output segment under construction.
///
/// Lines go to a temporary file in the output directory; [`SegmentFile::commit`]
/// renames it over the final path, so a reader never sees a half-written
/// segment. Dropping an uncommitted segment removes the temporary file.
pub struct SegmentFile {
    out: BufWriter<NamedTempFile>,
}

impl SegmentFile {
    pub fn create(dir: &Path) -> Result<Self, PersistError> {
        let tmp = NamedTempFile::new_in(dir)?;
        Ok(Self {
            out: BufWriter::new(tmp),
        })
    }

    pub fn write_text(&mut self, text: &str) -> io::Result<()> {
        self.out.write_all(text.as_bytes())
    }

    pub fn write_line(&mut self, line: &impl Display) -> io::Result<()> {
        writeln!(self.out, "{line}")
    }

    pub fn commit(self, target: &Path) -> Result<PathBuf, PersistError> {
        let tmp = self.out.into_inner().map_err(|e| e.into_error())?;
        tmp.as_file().sync_all()?;

        // Replace existing file if present to keep determinism.
        if target.exists() {
            fs::remove_file(target)?;
        }
        tmp.persist(target).map_err(|e| PersistError::Io(e.error))?;
        Ok(target.to_path_buf())
    }
}
