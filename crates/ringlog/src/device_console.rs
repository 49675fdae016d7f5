//! Last-resort diagnostics sink.
//!
//! Plain stderr writer used when the engine itself has something to say
//! (recovery rejected, an appender failing); never routed through the log
//! pipeline, so it works even when the pipeline is the problem.

use std::io::Write;

use crate::level::Level;

pub(crate) fn device_log(level: Level, message: &str) {
    let mut stderr = std::io::stderr().lock();
    let _ = writeln!(stderr, "[ringlog] {level}: {message}");
}

pub(crate) fn device_warn(message: &str) {
    device_log(Level::Warning, message);
}
