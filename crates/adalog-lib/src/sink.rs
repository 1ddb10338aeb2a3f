//! Durable append endpoints owned by panels during a session.
//!
//! Every sink flushes after each record so that a crash loses at most the
//! record being written. Sinks are opened on `start_recording` and closed on
//! `stop_recording`; a closed sink is never reopened.

use anyhow::{anyhow, Context, Result};
use csv::{Writer, WriterBuilder};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

pub trait RecordingSink {
    fn path(&self) -> &Path;
    fn is_open(&self) -> bool;
    /// Flush and release the file. Closing twice is a no-op.
    fn close(&mut self) -> Result<()>;
}

/// Append-only CSV file with header-once semantics.
pub struct CsvSink {
    path: PathBuf,
    writer: Option<Writer<File>>,
    rows: usize,
}

impl CsvSink {
    pub fn open(path: &Path, header: &[&str]) -> Result<Self> {
        let writer = open_appender(path, header)?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: Some(writer),
            rows: 0,
        })
    }

    pub fn append<I, T>(&mut self, record: I) -> Result<()>
    where
        I: IntoIterator<Item = T>,
        T: AsRef<[u8]>,
    {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| anyhow!("sink {} is closed", self.path.display()))?;
        writer
            .write_record(record)
            .with_context(|| format!("appending to {}", self.path.display()))?;
        writer.flush()?;
        self.rows += 1;
        Ok(())
    }

    /// Rows appended through this handle (the header is not counted).
    pub fn rows(&self) -> usize {
        self.rows
    }
}

impl RecordingSink for CsvSink {
    fn path(&self) -> &Path {
        &self.path
    }

    fn is_open(&self) -> bool {
        self.writer.is_some()
    }

    fn close(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer
                .flush()
                .with_context(|| format!("closing {}", self.path.display()))?;
        }
        Ok(())
    }
}

impl Drop for CsvSink {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// One-shot append: checks for the file before every write and emits the
/// header only when the file is new.
pub fn append_row<I, T>(path: &Path, header: &[&str], record: I) -> Result<()>
where
    I: IntoIterator<Item = T>,
    T: AsRef<[u8]>,
{
    let mut writer = open_appender(path, header)?;
    writer
        .write_record(record)
        .with_context(|| format!("appending to {}", path.display()))?;
    writer.flush()?;
    Ok(())
}

fn open_appender(path: &Path, header: &[&str]) -> Result<Writer<File>> {
    let write_header = !path.exists();
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("opening {}", path.display()))?;
    let mut writer = WriterBuilder::new().has_headers(false).from_writer(file);
    if write_header {
        writer.write_record(header)?;
        writer.flush()?;
    }
    Ok(writer)
}

/// Make an externally supplied name safe to use as a single path component.
pub fn sanitize_component(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| if c == '/' || c == '\\' { '_' } else { c })
        .collect();
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        return "_".into();
    }
    cleaned
}
