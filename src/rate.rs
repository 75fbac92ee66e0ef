//! Sliding window bitrate estimation.

use std::time::Instant;

use crate::util::epoch_millis;

const DEFAULT_WINDOW_MS: u64 = 1000;
const DEFAULT_ITEMS: usize = 100;
const DEFAULT_SCALE: f32 = 8000.0;

/// Sliding-window rate estimator.
///
/// The window is a ring of sub-windows (1000 ms split into 100 items of
/// 10 ms by default). Samples land in the newest item; items older than
/// the window are subtracted as time advances. The reported rate is
/// `total_bytes * scale / window_ms`, i.e. bits per second with the
/// default scale.
#[derive(Debug, Clone)]
pub struct RateCalculator {
    window_ms: u64,
    item_ms: u64,
    scale: f32,
    items: Vec<Item>,
    newest: Option<usize>,
    newest_start: u64,
    oldest: Option<usize>,
    oldest_start: u64,
    total: u64,
    bytes: u64,
    last_rate: u32,
    last_at: u64,
}

#[derive(Debug, Clone, Copy, Default)]
struct Item {
    count: u64,
    time: u64,
}

impl Default for RateCalculator {
    fn default() -> Self {
        RateCalculator::new(DEFAULT_WINDOW_MS, DEFAULT_ITEMS, DEFAULT_SCALE)
    }
}

impl RateCalculator {
    /// A calculator over `window_ms`, split into `items` sub-windows.
    pub fn new(window_ms: u64, items: usize, scale: f32) -> Self {
        assert!(items > 0);
        RateCalculator {
            window_ms,
            item_ms: (window_ms / items as u64).max(1),
            scale,
            items: vec![Item::default(); items],
            newest: None,
            newest_start: 0,
            oldest: None,
            oldest_start: 0,
            total: 0,
            bytes: 0,
            last_rate: 0,
            last_at: 0,
        }
    }

    /// Feed a sample of `size` bytes observed at `now`.
    pub fn update(&mut self, size: usize, now: Instant) {
        let now_ms = epoch_millis(now);

        // Old data, should not happen.
        if now_ms < self.oldest_start {
            return;
        }

        self.bytes += size as u64;

        self.remove_old(now_ms);

        let start_new_item = match self.newest {
            None => true,
            Some(_) => now_ms - self.newest_start >= self.item_ms,
        };

        if start_new_item {
            let idx = self.newest.map(|i| (i + 1) % self.items.len()).unwrap_or(0);

            // Newest caught up with oldest, evict.
            if Some(idx) == self.oldest {
                let oldest = &mut self.items[idx];
                self.total -= oldest.count;
                *oldest = Item::default();

                let next = (idx + 1) % self.items.len();
                self.oldest = Some(next);
                self.oldest_start = self.items[next].time;
            }

            self.items[idx] = Item {
                count: size as u64,
                time: now_ms,
            };
            self.newest = Some(idx);
            self.newest_start = now_ms;
        } else {
            let idx = self.newest.unwrap();
            self.items[idx].count += size as u64;
        }

        if self.oldest.is_none() {
            self.oldest = self.newest;
            self.oldest_start = now_ms;
        }

        self.total += size as u64;

        // Force recalculation even within the same loop iteration.
        self.last_rate = 0;
        self.last_at = 0;
    }

    /// The current rate at `now`, in `scale` units (bits per second by
    /// default).
    pub fn rate(&mut self, now: Instant) -> u32 {
        let now_ms = epoch_millis(now);

        if now_ms == self.last_at {
            return self.last_rate;
        }

        self.remove_old(now_ms);

        let scale = self.scale / self.window_ms as f32;

        self.last_at = now_ms;
        self.last_rate = (self.total as f32 * scale + 0.5).trunc() as u32;

        self.last_rate
    }

    /// Total bytes ever fed.
    pub fn total_bytes(&self) -> u64 {
        self.bytes
    }

    fn remove_old(&mut self, now_ms: u64) {
        let (Some(_), Some(newest)) = (self.oldest, self.newest) else {
            return;
        };

        let new_oldest_time = now_ms.saturating_sub(self.window_ms);

        if new_oldest_time <= self.oldest_start {
            return;
        }

        // A whole window has elapsed since the last sample.
        if new_oldest_time > self.items[newest].time {
            self.reset();
            return;
        }

        while self.oldest_start < new_oldest_time {
            let idx = self.oldest.unwrap();
            let item = &mut self.items[idx];
            self.total -= item.count;
            *item = Item::default();

            let next = (idx + 1) % self.items.len();
            self.oldest = Some(next);
            self.oldest_start = self.items[next].time;
        }
    }

    fn reset(&mut self) {
        self.items.iter_mut().for_each(|i| *i = Item::default());
        self.newest = None;
        self.newest_start = 0;
        self.oldest = None;
        self.oldest_start = 0;
        self.total = 0;
    }
}

/// Packet counter wrapping a [`RateCalculator`].
#[derive(Debug, Clone, Default)]
pub struct RtpDataCounter {
    packets: u64,
    rate: RateCalculator,
}

impl RtpDataCounter {
    /// Count one packet of `size` bytes at `now`.
    pub fn update(&mut self, size: usize, now: Instant) {
        self.packets += 1;
        self.rate.update(size, now);
    }

    /// Current bitrate.
    pub fn bitrate(&mut self, now: Instant) -> u32 {
        self.rate.rate(now)
    }

    /// Total packets counted.
    pub fn packets(&self) -> u64 {
        self.packets
    }

    /// Total bytes counted.
    pub fn bytes(&self) -> u64 {
        self.rate.total_bytes()
    }
}
