//! ringlog: asynchronous structured logging engine.
//!
//! Producers write records into per-thread lock-free ring buffers (with a
//! shared MPSC fallback) and never block on I/O; a consumer per log drains
//! the buffers and fans every record out to its appenders. With
//! `reliable_level: high` the buffers live in a memory-mapped file, so
//! records committed before a crash are delivered on the next run.
//!
//! # Example
//!
//! ```no_run
//! use ringlog::{create_log, Level};
//!
//! let log = create_log(
//!     "app",
//!     r#"{
//!         "thread_mode": "async",
//!         "appenders": [{"name": "console", "type": "console", "level": "info"}]
//!     }"#,
//!     &["core", "net"],
//! )
//! .unwrap();
//!
//! let net = log.category_index("net").unwrap();
//! log.write(Level::Info, net, "listener up").ok();
//! log.flush();
//! ```
//!
//! Sync mode hands the consumer to the caller:
//!
//! ```
//! use ringlog::{create_log, Level};
//!
//! let log = create_log("tool", r#"{"thread_mode": "sync", "appenders": []}"#, &[]).unwrap();
//! log.log(Level::Debug, "step 1").ok();
//! let delivered = log.process(); // drains on this thread
//! assert_eq!(delivered, 1);
//! log.close();
//! ```

mod appender;
mod config;
mod console;
mod device_console;
mod error;
mod level;
mod log;
mod record;
mod registry;
mod scheduler;
mod snapshot;

pub use appender::{Appender, ConsoleAppender, TextFileAppender};
pub use config::{AppenderConfig, AppenderKind, LogConfig, ReliableLevel, ThreadMode};
pub use console::{
    fetch_console_entry, register_console_callback, set_console_fetch_enabled,
    unregister_console_callback, ConsoleEntry,
};
pub use error::EngineError;
pub use level::{Level, LevelMask};
pub use log::Log;
pub use record::{decode, encode_into, encoded_size, RecordView, RECORD_HEADER_SIZE};
pub use registry::{
    create_log, force_flush, force_flush_all, get_log, get_log_by_id, log_names, reset_config,
};

// Transport-level types callers of the raw chunk API interact with.
pub use ringlog_buffer::{AllocError, GroupWriteChunk, RecoveryOutcome};
