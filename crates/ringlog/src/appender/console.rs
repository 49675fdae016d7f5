use std::io::{self, Write};

use crate::appender::Appender;
use crate::level::Level;
use crate::record::RecordView;

/// Writes formatted records to the process console: stdout for routine
/// levels, stderr for errors and above.
pub struct ConsoleAppender {
    name: String,
}

impl ConsoleAppender {
    pub fn new(name: String) -> Self {
        Self { name }
    }
}

impl Appender for ConsoleAppender {
    fn name(&self) -> &str {
        &self.name
    }

    fn write(&mut self, record: &RecordView<'_>, formatted: &str) -> io::Result<()> {
        if record.level >= Level::Error {
            let mut err = io::stderr().lock();
            writeln!(err, "{formatted}")
        } else {
            let mut out = io::stdout().lock();
            writeln!(out, "{formatted}")
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stdout().lock().flush()
    }
}
