//! Snapshot ring of recently formatted output.
//!
//! A bounded byte-budgeted ring the host can query to display recent log
//! lines without touching any sink. Oldest lines are overwritten once the
//! budget is exceeded. Disabled by default; enabling costs one formatted
//! `String` clone per delivered record.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

pub(crate) struct SnapshotRing {
    enabled: AtomicBool,
    state: Mutex<SnapshotState>,
}

struct SnapshotState {
    lines: VecDeque<String>,
    bytes: usize,
    budget: usize,
}

impl SnapshotRing {
    pub(crate) fn new(budget: usize) -> Self {
        Self {
            enabled: AtomicBool::new(false),
            state: Mutex::new(SnapshotState {
                lines: VecDeque::new(),
                bytes: 0,
                budget,
            }),
        }
    }

    pub(crate) fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
        if !enabled {
            if let Ok(mut state) = self.state.lock() {
                state.lines.clear();
                state.bytes = 0;
            }
        }
    }

    #[inline]
    pub(crate) fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Appends a formatted line, evicting oldest lines past the budget.
    pub(crate) fn push(&self, line: &str) {
        if !self.is_enabled() {
            return;
        }
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        while state.bytes + line.len() > state.budget {
            match state.lines.pop_front() {
                Some(evicted) => state.bytes -= evicted.len(),
                None => break,
            }
        }
        state.bytes += line.len();
        state.lines.push_back(line.to_string());
    }

    /// The buffered lines, newest last, joined with newlines.
    pub(crate) fn take_text(&self) -> String {
        let Ok(state) = self.state.lock() else {
            return String::new();
        };
        let mut out = String::with_capacity(state.bytes + state.lines.len());
        for line in &state.lines {
            out.push_str(line);
            out.push('\n');
        }
        out
    }
}
