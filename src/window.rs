//! Tumbling windows and per-(window, key) accumulation.
//!
//! Rows are assigned to the epoch-aligned window covering their timestamp and
//! grouped by feature set reference. Groups are held in shards keyed by a hash
//! of the group key; a shard's mutex is only held for a single insert or
//! drain, never across an await.
//!
//! Closing is watermark driven. `close_until` first publishes the new
//! watermark and then drains each shard under its lock, while `add` checks the
//! watermark under the same lock. A row is therefore either part of the batch
//! drained for its window or rejected as late; it can't be left behind in a
//! group that was already emitted.

use std::collections::hash_map::RandomState;
use std::collections::HashMap;
use std::hash::BuildHasher;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tracing::debug;

use crate::record::FeatureRow;
use crate::registry::Counter;

const SHARDS: usize = 16;

/// Half-open interval `[start, end)` in milliseconds since the epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Window {
    pub start_ms: i64,
    pub end_ms: i64,
}

impl Window {
    /// The window of length `size` covering `timestamp_ms`.
    pub fn containing(timestamp_ms: i64, size: Duration) -> Self {
        let size_ms = i64::try_from(size.as_millis()).unwrap_or(i64::MAX).max(1);
        let start_ms = timestamp_ms.div_euclid(size_ms) * size_ms;
        Self {
            start_ms,
            end_ms: start_ms.saturating_add(size_ms),
        }
    }

    pub fn contains(&self, timestamp_ms: i64) -> bool {
        self.start_ms <= timestamp_ms && timestamp_ms < self.end_ms
    }
}

/// All rows seen for one key within one window.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupedBatch {
    pub window: Window,
    pub key: String,
    pub rows: Vec<FeatureRow>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Assignment {
    Accepted(Window),
    /// The row's window had already been closed; the row was dropped.
    Late(Window),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct GroupSlot {
    window: Window,
    key: String,
}

type Shard = HashMap<GroupSlot, Vec<FeatureRow>>;

pub struct WindowedGrouper {
    window_size: Duration,
    shards: Vec<Mutex<Shard>>,
    hasher: RandomState,
    closed_through: AtomicI64,
    late: Counter,
}

impl WindowedGrouper {
    pub fn new(window_size: Duration, late: Counter) -> Self {
        Self {
            window_size,
            shards: (0..SHARDS).map(|_| Mutex::new(HashMap::new())).collect(),
            hasher: RandomState::new(),
            closed_through: AtomicI64::new(i64::MIN),
            late,
        }
    }

    pub fn window_size(&self) -> Duration {
        self.window_size
    }

    /// Watermark up to which windows have been closed.
    pub fn closed_through(&self) -> i64 {
        self.closed_through.load(Ordering::SeqCst)
    }

    pub fn add(&self, row: FeatureRow, timestamp_ms: i64) -> Assignment {
        self.add_with(row, |_| timestamp_ms)
    }

    /// Like `add`, but the timestamp is taken once the row's shard is locked.
    pub fn add_with(
        &self,
        row: FeatureRow,
        timestamp: impl FnOnce(&FeatureRow) -> i64,
    ) -> Assignment {
        let mut shard = self.shard(row.key());
        // every watermark in `closed_through` was read from the clock before
        // it was stored, so a clock read taken after this load is never behind it
        let closed_through = self.closed_through.load(Ordering::SeqCst);
        let window = Window::containing(timestamp(&row), self.window_size);

        if window.end_ms <= closed_through {
            drop(shard);
            self.late.inc();
            debug!(
                key = row.key(),
                window_start = window.start_ms,
                "dropping row for closed window"
            );
            return Assignment::Late(window);
        }

        let slot = GroupSlot {
            window,
            key: row.feature_set.clone(),
        };
        shard.entry(slot).or_default().push(row);
        Assignment::Accepted(window)
    }

    /// Closes every window ending at or before `watermark_ms` and returns one
    /// batch per closed (window, key), ordered by window then key.
    pub fn close_until(&self, watermark_ms: i64) -> Vec<GroupedBatch> {
        let previous = self.closed_through.fetch_max(watermark_ms, Ordering::SeqCst);
        let watermark = previous.max(watermark_ms);

        let mut batches = Vec::new();
        for shard in &self.shards {
            let mut shard = shard.lock().unwrap_or_else(PoisonError::into_inner);
            let (closed, open): (Shard, Shard) = shard
                .drain()
                .partition(|(slot, _)| slot.window.end_ms <= watermark);
            *shard = open;
            batches.extend(closed.into_iter().map(|(slot, rows)| GroupedBatch {
                window: slot.window,
                key: slot.key,
                rows,
            }));
        }

        batches.sort_by(|a, b| (a.window, &a.key).cmp(&(b.window, &b.key)));
        batches
    }

    /// Closes all windows, as at the end of a bounded input.
    pub fn flush_all(&self) -> Vec<GroupedBatch> {
        self.close_until(i64::MAX)
    }

    /// Drops every open group without emitting it. Returns the number of rows
    /// discarded.
    pub fn discard(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| {
                let mut shard = shard.lock().unwrap_or_else(PoisonError::into_inner);
                let rows = shard.values().map(Vec::len).sum::<usize>();
                shard.clear();
                rows
            })
            .sum()
    }

    /// Number of (window, key) groups currently accumulating.
    pub fn open_groups(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| shard.lock().unwrap_or_else(PoisonError::into_inner).len())
            .sum()
    }

    fn shard(&self, key: &str) -> std::sync::MutexGuard<'_, Shard> {
        let index = (self.hasher.hash_one(key) as usize) % self.shards.len();
        self.shards[index]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
