use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;

use crate::appender::Appender;
use crate::record::RecordView;

/// Appends formatted records to a text file, buffered.
pub struct TextFileAppender {
    name: String,
    writer: BufWriter<File>,
}

impl TextFileAppender {
    /// Opens (or creates) `path` for appending, creating parent
    /// directories as needed.
    pub fn open(name: String, path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            name,
            writer: BufWriter::new(file),
        })
    }
}

impl Appender for TextFileAppender {
    fn name(&self) -> &str {
        &self.name
    }

    fn write(&mut self, _record: &RecordView<'_>, formatted: &str) -> io::Result<()> {
        self.writer.write_all(formatted.as_bytes())?;
        self.writer.write_all(b"\n")
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

impl Drop for TextFileAppender {
    fn drop(&mut self) {
        let _ = self.writer.flush();
    }
}
