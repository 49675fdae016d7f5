//! Appender dispatch.
//!
//! The consumer formats each drained record once and hands it to every
//! enabled appender whose level bitmap and category mask admit it. A
//! failing appender is reported through the device console a single time
//! and then suppressed until it succeeds again; it never affects delivery
//! to its siblings.

mod console;
mod text_file;

pub use console::ConsoleAppender;
pub use text_file::TextFileAppender;

use std::io;

use crate::config::{AppenderConfig, AppenderKind, LogConfig};
use crate::device_console;
use crate::level::LevelMask;
use crate::record::RecordView;

/// A sink for formatted records. Implementations run on the consumer
/// thread only, so `&mut self` access is uncontended.
pub trait Appender: Send {
    fn name(&self) -> &str;

    /// Writes one record. `formatted` is the shared text layout; sinks
    /// wanting a custom layout can use the raw `record` instead.
    fn write(&mut self, record: &RecordView<'_>, formatted: &str) -> io::Result<()>;

    /// Flushes buffered output to the underlying device.
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// An appender plus its admission state.
pub(crate) struct AppenderSlot {
    pub appender: Box<dyn Appender>,
    pub level_mask: LevelMask,
    pub categories_mask: u64,
    pub enabled: bool,
    failing: bool,
}

impl AppenderSlot {
    pub(crate) fn new(appender: Box<dyn Appender>, level_mask: LevelMask, categories_mask: u64) -> Self {
        Self {
            appender,
            level_mask,
            categories_mask,
            enabled: true,
            failing: false,
        }
    }

    /// Whether this appender wants the record at all.
    pub(crate) fn admits(&self, record: &RecordView<'_>) -> bool {
        self.enabled
            && self.level_mask.admits(record.level)
            && admits_category(self.categories_mask, record.category)
    }

    /// Writes the record, applying the report-once failure policy.
    pub(crate) fn dispatch(&mut self, record: &RecordView<'_>, formatted: &str) {
        match self.appender.write(record, formatted) {
            Ok(()) => self.failing = false,
            Err(err) => {
                if !self.failing {
                    self.failing = true;
                    device_console::device_warn(&format!(
                        "appender '{}' failed to write: {err}",
                        self.appender.name()
                    ));
                }
            }
        }
    }

    pub(crate) fn flush(&mut self) {
        if let Err(err) = self.appender.flush() {
            if !self.failing {
                self.failing = true;
                device_console::device_warn(&format!(
                    "appender '{}' failed to flush: {err}",
                    self.appender.name()
                ));
            }
        }
    }
}

/// Category admission: bit `index` of the mask, with indices beyond the
/// 64-bit bitmap always admitted.
#[inline]
pub(crate) fn admits_category(mask: u64, category: u32) -> bool {
    category >= 64 || mask & (1u64 << category) != 0
}

/// Builds the appender slots described by a parsed config.
pub(crate) fn build_slots(config: &LogConfig, log_name: &str) -> Vec<AppenderSlot> {
    let mut slots = Vec::with_capacity(config.appenders.len());
    for appender_config in &config.appenders {
        match build_one(appender_config, log_name) {
            Ok(appender) => slots.push(AppenderSlot::new(
                appender,
                LevelMask::from_threshold(appender_config.level),
                appender_config.categories_mask.unwrap_or(config.categories_mask),
            )),
            Err(err) => device_console::device_warn(&format!(
                "appender '{}' for log '{log_name}' skipped: {err}",
                appender_config.name
            )),
        }
    }
    slots
}

fn build_one(config: &AppenderConfig, log_name: &str) -> io::Result<Box<dyn Appender>> {
    match config.kind {
        AppenderKind::Console => Ok(Box::new(ConsoleAppender::new(config.name.clone()))),
        AppenderKind::TextFile => {
            let path = config
                .path
                .clone()
                .unwrap_or_else(|| std::path::PathBuf::from(format!("{log_name}.log")));
            Ok(Box::new(TextFileAppender::open(config.name.clone(), &path)?))
        }
    }
}

/// Shared text layout: UTC timestamp, level tag, category index, thread
/// tag, message.
pub(crate) fn format_record(record: &RecordView<'_>) -> String {
    let (date, time_of_day) = split_epoch_ms(record.timestamp_ms);
    format!(
        "{date} {time_of_day} [{}] [c{}] [t{}] {}",
        record.level.tag(),
        record.category,
        record.thread,
        record.message_text()
    )
}

/// Splits epoch milliseconds into `YYYY-MM-DD` and `HH:MM:SS.mmm` (UTC).
fn split_epoch_ms(timestamp_ms: u64) -> (String, String) {
    let millis = timestamp_ms % 1000;
    let secs = timestamp_ms / 1000;
    let (seconds_of_day, days) = (secs % 86_400, secs / 86_400);

    let (hour, minute, second) = (
        seconds_of_day / 3600,
        (seconds_of_day % 3600) / 60,
        seconds_of_day % 60,
    );

    // Civil-from-days (Gregorian), days since 1970-01-01.
    let z = days as i64 + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let year = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = if month <= 2 { year + 1 } else { year };

    (
        format!("{year:04}-{month:02}-{day:02}"),
        format!("{hour:02}:{minute:02}:{second:02}.{millis:03}"),
    )
}
