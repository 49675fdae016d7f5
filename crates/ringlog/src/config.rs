//! Log configuration parsed from JSON text.
//!
//! The public API takes config as an opaque string so hosts and bindings
//! can store it wherever they like; only the knobs the engine consumes are
//! modeled here, unknown keys are ignored.

use std::path::PathBuf;

use serde::Deserialize;

use crate::level::Level;

/// Who drains the buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreadMode {
    /// A dedicated background consumer thread per log.
    Async,
    /// The caller steps the consumer via [`crate::Log::process`].
    Sync,
}

/// Whether buffers persist to a memory-mapped recovery file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReliableLevel {
    /// Memory only; in-flight records die with the process.
    Normal,
    /// Memory-mapped; committed records survive process termination.
    High,
}

/// Sink flavor of one appender entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppenderKind {
    Console,
    TextFile,
}

/// One configured appender.
#[derive(Debug, Clone, Deserialize)]
pub struct AppenderConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: AppenderKind,
    /// Admit this level and everything more severe.
    #[serde(default = "default_appender_level")]
    pub level: Level,
    /// Per-appender category bitmap; defaults to the log-wide mask.
    #[serde(default)]
    pub categories_mask: Option<u64>,
    /// Output path (text_file only).
    #[serde(default)]
    pub path: Option<PathBuf>,
}

fn default_appender_level() -> Level {
    Level::Info
}

/// Parsed log configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub thread_mode: ThreadMode,
    /// Desired buffer size in bytes, for the shared MPSC buffer and each
    /// per-thread buffer alike (rounded up to a power-of-two block count).
    pub buffer_size: u32,
    pub reliable_level: ReliableLevel,
    /// Directory for recovery files when `reliable_level` is `high`;
    /// defaults to the system temp directory.
    pub recovery_dir: Option<PathBuf>,
    /// How many per-thread buffers the log carves out.
    pub buffer_count: u16,
    /// Default category bitmap applied before appender masks.
    pub categories_mask: u64,
    /// Upper bound on the consumer's condition-variable wait, so a missed
    /// wake never delays draining indefinitely.
    pub poll_interval_ms: u64,
    pub appenders: Vec<AppenderConfig>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            thread_mode: ThreadMode::Async,
            buffer_size: 64 * 1024,
            reliable_level: ReliableLevel::Normal,
            recovery_dir: None,
            buffer_count: 8,
            categories_mask: u64::MAX,
            poll_interval_ms: 5,
            appenders: vec![AppenderConfig {
                name: "console".to_string(),
                kind: AppenderKind::Console,
                level: Level::Info,
                categories_mask: None,
                path: None,
            }],
        }
    }
}

impl LogConfig {
    /// Parses config text; an empty string yields the defaults.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(text)
    }
}
