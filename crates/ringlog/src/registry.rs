//! Process-wide log registry.
//!
//! Lazily initialized on first touch (no static-init ordering to worry
//! about): the registry owns every live log and hands out [`Log`] handles
//! by name or id. Creating a log wires its buffer group, appenders and,
//! in async mode, its consumer thread.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use ringlog_buffer::{BufferGroup, GroupConfig};

use crate::config::{LogConfig, ReliableLevel, ThreadMode};
use crate::device_console;
use crate::error::EngineError;
use crate::log::{Log, LogInner};

struct Registry {
    logs: Mutex<Vec<Arc<LogInner>>>,
    next_id: AtomicU64,
}

fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(|| Registry {
        logs: Mutex::new(Vec::new()),
        next_id: AtomicU64::new(1),
    })
}

/// Creates a log from config text and a category name list, returning its
/// handle. Names must be unique among live logs.
pub fn create_log(
    name: &str,
    config_text: &str,
    categories: &[&str],
) -> Result<Log, EngineError> {
    let config = LogConfig::parse(config_text)?;
    let reg = registry();

    {
        let logs = reg.logs.lock().unwrap_or_else(PoisonError::into_inner);
        if logs.iter().any(|log| log.name == name) {
            return Err(EngineError::DuplicateName(name.to_string()));
        }
    }

    let map_path = recovery_path(name, &config);
    let group = BufferGroup::create(&GroupConfig {
        node_count: config.buffer_count,
        node_buffer_size: config.buffer_size,
        shared_buffer_size: config.buffer_size,
        map_path,
    })?;

    let id = reg.next_id.fetch_add(1, Ordering::Relaxed);
    let inner = Arc::new(LogInner::new(
        id,
        name.to_string(),
        group,
        categories.iter().map(|&category| category.to_string()).collect(),
        &config,
    ));

    inner.sched.start();
    if config.thread_mode == ThreadMode::Async {
        let worker_inner = Arc::clone(&inner);
        let handle = std::thread::Builder::new()
            .name(format!("ringlog-{name}"))
            .spawn(move || worker_inner.worker_loop())
            .map_err(ringlog_buffer::SetupError::Io)?;
        *inner.worker.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    {
        // Re-check under the lock: a racing create_log may have taken the
        // name while the group was being built.
        let mut logs = reg.logs.lock().unwrap_or_else(PoisonError::into_inner);
        if logs.iter().any(|log| log.name == name) {
            drop(logs);
            let log = Log {
                inner: Arc::clone(&inner),
            };
            log.close();
            return Err(EngineError::DuplicateName(name.to_string()));
        }
        logs.push(Arc::clone(&inner));
    }
    Ok(Log { inner })
}

fn recovery_path(name: &str, config: &LogConfig) -> Option<PathBuf> {
    match config.reliable_level {
        ReliableLevel::Normal => None,
        ReliableLevel::High => {
            let dir = config
                .recovery_dir
                .clone()
                .unwrap_or_else(std::env::temp_dir);
            Some(dir.join(format!("{name}.rbuf")))
        }
    }
}

/// Handle to a live log by name.
pub fn get_log(name: &str) -> Option<Log> {
    let logs = registry()
        .logs
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    logs.iter()
        .find(|log| log.name == name)
        .map(|inner| Log {
            inner: Arc::clone(inner),
        })
}

/// Handle to a live log by id.
pub fn get_log_by_id(id: u64) -> Option<Log> {
    let logs = registry()
        .logs
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    logs.iter().find(|log| log.id == id).map(|inner| Log {
        inner: Arc::clone(inner),
    })
}

/// Names of every live log.
pub fn log_names() -> Vec<String> {
    let logs = registry()
        .logs
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    logs.iter().map(|log| log.name.clone()).collect()
}

/// Re-parses config text for a live log and swaps what can change at
/// runtime: the appender set and the category masks. Buffer geometry,
/// reliability and thread mode are fixed at creation; differing values in
/// the new text are reported and ignored.
pub fn reset_config(name: &str, config_text: &str) -> Result<(), EngineError> {
    let config = LogConfig::parse(config_text)?;
    let log = get_log(name).ok_or_else(|| EngineError::UnknownLog(name.to_string()))?;

    if config.thread_mode != log.inner.thread_mode {
        device_console::device_warn(&format!(
            "reset_config('{name}'): thread_mode changes require recreating the log; ignored"
        ));
    }

    let slots = crate::appender::build_slots(&config, name);
    *log.inner
        .appenders
        .lock()
        .unwrap_or_else(PoisonError::into_inner) = slots;
    log.set_categories_mask(config.categories_mask);
    Ok(())
}

/// Flush request for one log id. The store itself is a plain atomic
/// flag, but the registry lookup takes a lock; signal handlers should
/// capture a [`Log`] handle up front and use [`Log::force_flush`], which
/// is lock-free end to end.
pub fn force_flush(id: u64) {
    let logs = registry()
        .logs
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    if let Some(inner) = logs.iter().find(|log| log.id == id) {
        inner.sched.request_flush();
    }
}

/// Requests a flush on every live log. Takes the registry lock; see
/// [`Log::force_flush`] for the signal-safe path.
pub fn force_flush_all() {
    let logs = registry()
        .logs
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    for inner in logs.iter() {
        inner.sched.request_flush();
    }
}

pub(crate) fn remove_log(id: u64) {
    let mut logs = registry()
        .logs
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    logs.retain(|log| log.id != id);
}
