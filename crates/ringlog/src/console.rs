//! Console callback fan-out and the host-consumed console buffer.
//!
//! Hosts (and language bindings) can observe formatted console output two
//! ways: register a callback invoked from the consumer thread, or enable
//! the bounded fetch buffer and poll [`fetch_console_entry`] from any
//! thread. Both carry the log id and level alongside the formatted text.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};

use crate::level::Level;

/// Formatted console output with its origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsoleEntry {
    pub log_id: u64,
    pub level: Level,
    pub text: String,
}

type Callback = Box<dyn Fn(&ConsoleEntry) + Send + Sync>;

struct ConsoleHub {
    callbacks: Mutex<Vec<(u64, Callback)>>,
    next_callback_id: AtomicU64,
    fetch_enabled: AtomicBool,
    fetch_queue: Mutex<FetchQueue>,
}

struct FetchQueue {
    entries: VecDeque<ConsoleEntry>,
    bytes: usize,
    budget: usize,
}

fn hub() -> &'static ConsoleHub {
    static HUB: OnceLock<ConsoleHub> = OnceLock::new();
    HUB.get_or_init(|| ConsoleHub {
        callbacks: Mutex::new(Vec::new()),
        next_callback_id: AtomicU64::new(1),
        fetch_enabled: AtomicBool::new(false),
        fetch_queue: Mutex::new(FetchQueue {
            entries: VecDeque::new(),
            bytes: 0,
            budget: 256 * 1024,
        }),
    })
}

/// Registers a console callback; returns a handle for unregistering.
pub fn register_console_callback(callback: impl Fn(&ConsoleEntry) + Send + Sync + 'static) -> u64 {
    let hub = hub();
    let id = hub.next_callback_id.fetch_add(1, Ordering::Relaxed);
    if let Ok(mut callbacks) = hub.callbacks.lock() {
        callbacks.push((id, Box::new(callback)));
    }
    id
}

/// Removes a previously registered callback. Unknown ids are ignored.
pub fn unregister_console_callback(id: u64) {
    if let Ok(mut callbacks) = hub().callbacks.lock() {
        callbacks.retain(|(callback_id, _)| *callback_id != id);
    }
}

/// Enables or disables the poll-based console buffer. Disabling drops any
/// queued entries.
pub fn set_console_fetch_enabled(enabled: bool) {
    let hub = hub();
    hub.fetch_enabled.store(enabled, Ordering::Release);
    if !enabled {
        if let Ok(mut queue) = hub.fetch_queue.lock() {
            queue.entries.clear();
            queue.bytes = 0;
        }
    }
}

/// Takes the oldest queued console entry, if any.
pub fn fetch_console_entry() -> Option<ConsoleEntry> {
    let hub = hub();
    let mut queue = hub.fetch_queue.lock().ok()?;
    let entry = queue.entries.pop_front()?;
    queue.bytes -= entry.text.len();
    Some(entry)
}

/// Delivers one formatted record to callbacks and the fetch buffer.
/// Called from consumer threads only.
pub(crate) fn dispatch(log_id: u64, level: Level, text: &str) {
    let hub = hub();

    if let Ok(callbacks) = hub.callbacks.lock() {
        if !callbacks.is_empty() {
            let entry = ConsoleEntry {
                log_id,
                level,
                text: text.to_string(),
            };
            for (_, callback) in callbacks.iter() {
                callback(&entry);
            }
        }
    }

    if hub.fetch_enabled.load(Ordering::Acquire) {
        if let Ok(mut queue) = hub.fetch_queue.lock() {
            while queue.bytes + text.len() > queue.budget {
                match queue.entries.pop_front() {
                    Some(evicted) => queue.bytes -= evicted.text.len(),
                    None => break,
                }
            }
            queue.bytes += text.len();
            queue.entries.push_back(ConsoleEntry {
                log_id,
                level,
                text: text.to_string(),
            });
        }
    }
}

/// `true` if any callback is registered or fetching is enabled; lets the
/// consumer skip formatting work nobody will see.
pub(crate) fn wants_output() -> bool {
    let hub = hub();
    hub.fetch_enabled.load(Ordering::Acquire)
        || hub
            .callbacks
            .lock()
            .map(|callbacks| !callbacks.is_empty())
            .unwrap_or(false)
}
