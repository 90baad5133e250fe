//! Output sinks that can be abandoned
//!
//! A staged sink only exposes what was written once `commit` is called;
//! `discard` throws away everything written since the sink was opened.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared flag used to cancel an in-flight write from another thread.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// A writer whose output can be committed or thrown away as a whole.
pub trait StagedSink: Write {
    /// Publish everything written.
    fn commit(self) -> io::Result<()>;

    /// Remove everything written since the sink was opened.
    fn discard(self) -> io::Result<()>;
}

/// Appends to a `Vec<u8>`; discarding truncates back to the original length.
pub struct VecSink<'a> {
    vec: &'a mut Vec<u8>,
    start: usize,
}

impl<'a> VecSink<'a> {
    pub fn new(vec: &'a mut Vec<u8>) -> Self {
        let start = vec.len();
        Self { vec, start }
    }
}

impl Write for VecSink<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.vec.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl StagedSink for VecSink<'_> {
    fn commit(self) -> io::Result<()> {
        Ok(())
    }

    fn discard(self) -> io::Result<()> {
        self.vec.truncate(self.start);
        Ok(())
    }
}

/// Writes to `<path>.partial` and renames over `path` on commit.
pub struct StagedFile {
    file: File,
    temp_path: PathBuf,
    final_path: PathBuf,
}

impl StagedFile {
    pub fn create(path: impl AsRef<Path>) -> io::Result<Self> {
        let final_path = path.as_ref().to_path_buf();
        let mut name = final_path
            .file_name()
            .map(|n| n.to_os_string())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
        name.push(".partial");
        let temp_path = final_path.with_file_name(name);

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)?;
        Ok(Self {
            file,
            temp_path,
            final_path,
        })
    }

    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }
}

impl Write for StagedFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl StagedSink for StagedFile {
    fn commit(mut self) -> io::Result<()> {
        self.file.flush()?;
        self.file.sync_all()?;
        drop(self.file);
        std::fs::rename(&self.temp_path, &self.final_path)
    }

    fn discard(self) -> io::Result<()> {
        drop(self.file);
        std::fs::remove_file(&self.temp_path)
    }
}
