//! The per-log engine object: buffer group, consumer, appenders.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use ringlog_buffer::{AllocError, BufferGroup, GroupWriteChunk};

use crate::appender::{self, AppenderSlot};
use crate::config::{LogConfig, ThreadMode};
use crate::console;
use crate::device_console;
use crate::level::Level;
use crate::record;
use crate::scheduler::{Scheduler, SchedulerState};
use crate::snapshot::SnapshotRing;

/// Byte budget for the snapshot ring of recent formatted lines.
const SNAPSHOT_BUDGET: usize = 64 * 1024;

/// How long a blocking flush waits for the consumer before giving up.
const FLUSH_WAIT_LIMIT: Duration = Duration::from_secs(5);

pub(crate) struct LogInner {
    pub(crate) id: u64,
    pub(crate) name: String,
    pub(crate) group: BufferGroup,
    pub(crate) categories: Vec<String>,
    pub(crate) default_mask: AtomicU64,
    pub(crate) appenders: Mutex<Vec<AppenderSlot>>,
    pub(crate) snapshot: SnapshotRing,
    pub(crate) sched: Scheduler,
    pub(crate) thread_mode: ThreadMode,
    pub(crate) worker: Mutex<Option<JoinHandle<()>>>,
}

impl LogInner {
    pub(crate) fn new(
        id: u64,
        name: String,
        group: BufferGroup,
        categories: Vec<String>,
        config: &LogConfig,
    ) -> Self {
        Self {
            id,
            name: name.clone(),
            group,
            categories,
            default_mask: AtomicU64::new(config.categories_mask),
            appenders: Mutex::new(appender::build_slots(config, &name)),
            snapshot: SnapshotRing::new(SNAPSHOT_BUDGET),
            sched: Scheduler::new(Duration::from_millis(config.poll_interval_ms.max(1))),
            thread_mode: config.thread_mode,
            worker: Mutex::new(None),
        }
    }

    /// Drains every buffer once, fanning each record out to the enabled
    /// appenders, console observers and the snapshot ring. Returns the
    /// number of chunks delivered.
    pub(crate) fn drain_pass(&self) -> usize {
        let mut appenders = self
            .appenders
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let snapshot_on = self.snapshot.is_enabled();
        let console_on = console::wants_output();

        self.group.consume(|bytes| {
            let Some(decoded) = record::decode(bytes) else {
                device_console::device_warn("dropping undecodable record");
                return;
            };

            let any_sink = appenders.iter().any(|slot| slot.admits(&decoded));
            if !any_sink && !console_on && !snapshot_on {
                return;
            }
            let formatted = appender::format_record(&decoded);

            for slot in appenders.iter_mut() {
                if slot.admits(&decoded) {
                    slot.dispatch(&decoded, &formatted);
                }
            }
            if console_on {
                console::dispatch(self.id, decoded.level, &formatted);
            }
            if snapshot_on {
                self.snapshot.push(&formatted);
            }
        })
    }

    /// Flushes every sink and the recovery file.
    pub(crate) fn flush_sinks(&self) {
        let mut appenders = self
            .appenders
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for slot in appenders.iter_mut() {
            slot.flush();
        }
        drop(appenders);
        self.group.flush_map();
    }

    /// The background consumer loop (async mode).
    pub(crate) fn worker_loop(&self) {
        loop {
            let state = self.sched.state();
            match state {
                SchedulerState::Running | SchedulerState::PendingCancel => {}
                _ => break,
            }

            let drained = self.drain_pass();
            if self.sched.take_flush_request() {
                self.flush_sinks();
            }
            self.sched.complete_pass();

            if state == SchedulerState::PendingCancel {
                // Shutdown: one more pass to catch commits that raced the
                // cancel flag, then stop.
                self.drain_pass();
                self.sched.complete_pass();
                break;
            }

            if drained == 0 {
                self.sched.wait_for_work();
            }
        }
        self.flush_sinks();
        self.sched.finish();
    }
}

/// Handle to one log. Cheap to clone; all clones share the same engine
/// state. Producers on any thread may call [`write`](Log::write)
/// concurrently.
#[derive(Clone)]
pub struct Log {
    pub(crate) inner: Arc<LogInner>,
}

impl Log {
    /// Registry-assigned id, stable for the log's lifetime.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Category names registered at creation, in index order.
    pub fn categories(&self) -> &[String] {
        &self.inner.categories
    }

    /// Index of a category name, usable in [`write`](Log::write) and masks.
    pub fn category_index(&self, name: &str) -> Option<u32> {
        self.inner
            .categories
            .iter()
            .position(|category| category == name)
            .map(|index| index as u32)
    }

    /// Encodes and commits one record. Returns the allocation error when
    /// every buffer rejected the chunk; the record is dropped in that case.
    pub fn write(&self, level: Level, category: u32, message: &str) -> Result<(), AllocError> {
        if !appender::admits_category(self.inner.default_mask.load(Ordering::Relaxed), category) {
            return Ok(()); // filtered at the source
        }

        let size = record::encoded_size(message.len());
        let mut chunk = self.inner.group.alloc_write_chunk(size)?;
        record::encode_into(
            chunk.data(),
            level,
            category,
            ringlog_buffer::thread_tag(),
            epoch_millis(),
            message.as_bytes(),
        );
        self.commit_buffer_chunk(chunk);
        Ok(())
    }

    /// Convenience for uncategorized records.
    pub fn log(&self, level: Level, message: &str) -> Result<(), AllocError> {
        self.write(level, 0, message)
    }

    /// Raw transport surface: reserves a chunk the caller encodes itself
    /// (bindings use this to avoid double-buffering).
    pub fn alloc_buffer_chunk(&self, size: u32) -> Result<GroupWriteChunk<'_>, AllocError> {
        self.inner.group.alloc_write_chunk(size)
    }

    /// Commits a chunk from [`alloc_buffer_chunk`](Self::alloc_buffer_chunk),
    /// waking the consumer when the buffer was empty.
    pub fn commit_buffer_chunk(&self, chunk: GroupWriteChunk<'_>) {
        let was_empty = chunk.commit();
        if was_empty && self.inner.thread_mode == ThreadMode::Async {
            self.inner.sched.notify_wake();
        }
    }

    /// Signal-safe flush request: only stores atomic flags. The consumer
    /// performs the I/O on its own stack within one poll interval.
    pub fn force_flush(&self) {
        self.inner.sched.request_flush();
    }

    /// Requests a flush and waits until the consumer completed a full
    /// drain pass started after this call (bounded wait). In sync mode the
    /// caller is the consumer, so the work happens inline.
    pub fn flush(&self) {
        match self.inner.thread_mode {
            ThreadMode::Async => {
                let target = self.inner.sched.completed_passes() + 2;
                self.inner.sched.request_flush();
                self.inner.sched.notify_wake();
                if !self.inner.sched.wait_for_passes(target, FLUSH_WAIT_LIMIT) {
                    device_console::device_warn(&format!(
                        "flush of log '{}' timed out waiting for the consumer",
                        self.inner.name
                    ));
                }
            }
            ThreadMode::Sync => {
                self.inner.drain_pass();
                self.inner.flush_sinks();
                self.inner.sched.complete_pass();
            }
        }
    }

    /// Sync-mode step: drains every buffer once on the calling thread.
    /// Returns the number of records delivered; 0 (with a device-console
    /// warning) when the log runs its own consumer thread.
    pub fn process(&self) -> usize {
        if self.inner.thread_mode == ThreadMode::Async {
            device_console::device_warn(&format!(
                "process() ignored: log '{}' runs an async consumer",
                self.inner.name
            ));
            return 0;
        }
        let drained = self.inner.drain_pass();
        if self.inner.sched.take_flush_request() {
            self.inner.flush_sinks();
        }
        self.inner.sched.complete_pass();
        drained
    }

    /// Adds a custom appender alongside the configured ones. The appender
    /// runs on the consumer thread.
    pub fn add_appender(
        &self,
        appender: Box<dyn crate::appender::Appender>,
        level_mask: crate::level::LevelMask,
        categories_mask: u64,
    ) {
        self.inner
            .appenders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(AppenderSlot::new(appender, level_mask, categories_mask));
    }

    /// Enables or disables one appender by name. Returns `false` when no
    /// appender carries that name.
    pub fn set_appender_enable(&self, name: &str, enabled: bool) -> bool {
        let mut appenders = self
            .inner
            .appenders
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut found = false;
        for slot in appenders.iter_mut() {
            if slot.appender.name() == name {
                slot.enabled = enabled;
                found = true;
            }
        }
        found
    }

    /// Replaces the log-wide default category mask.
    pub fn set_categories_mask(&self, mask: u64) {
        self.inner.default_mask.store(mask, Ordering::Relaxed);
    }

    /// Enables or disables the snapshot ring.
    pub fn set_snapshot_enabled(&self, enabled: bool) {
        self.inner.snapshot.set_enabled(enabled);
    }

    /// The snapshot ring's current text, newest line last.
    pub fn take_snapshot(&self) -> String {
        self.inner.snapshot.take_text()
    }

    /// `true` if this log recovered in-flight records from a previous run.
    pub fn recovered_from_file(&self) -> bool {
        self.inner.group.recovery_outcome().is_recovered()
    }

    /// Stops the consumer without a final drain, leaving committed records
    /// in the buffers (and, with `reliable_level: high`, in the recovery
    /// file for the next run to deliver. In async mode a pass already in
    /// flight still delivers its records before the worker stops.
    pub fn abandon(&self) {
        self.inner.sched.finish();
        self.inner.sched.notify_wake();
        if let Some(handle) = self
            .inner
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            let _ = handle.join();
        }
        self.inner.group.flush_map();
        self.inner.sched.release();
        crate::registry::remove_log(self.inner.id);
    }

    /// Stops the consumer (draining once more), flushes sinks and removes
    /// the log from the registry. Further writes on surviving clones fail
    /// against full-drained buffers but are harmless.
    pub fn close(&self) {
        match self.inner.thread_mode {
            ThreadMode::Async => {
                self.inner.sched.cancel();
                let handle = self
                    .inner
                    .worker
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take();
                if let Some(handle) = handle {
                    let _ = handle.join();
                }
            }
            ThreadMode::Sync => {
                self.inner.drain_pass();
                self.inner.flush_sinks();
                self.inner.sched.finish();
            }
        }
        self.inner.sched.release();
        crate::registry::remove_log(self.inner.id);
    }
}

fn epoch_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}
