//! Round-trip latency measurement.
//!
//! One measurement is live at a time: [`LatencyTracker::arm`] captures the
//! start tick right before a write and [`LatencyTracker::resolve`] closes it
//! when the response arrives. Re-arming overwrites the previous start tick.

use crate::ble::Tick;

/// A completed measurement.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LatencySample {
    pub start_tick: Tick,
    pub end_tick: Tick,
    pub elapsed_ms: u32,
}

/// Running summary of every sample taken.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LatencyStats {
    pub count: u32,
    pub min_ms: u32,
    pub max_ms: u32,
    pub total_ms: u64,
}

impl LatencyStats {
    pub fn record(&mut self, elapsed_ms: u32) {
        if self.count == 0 {
            self.min_ms = elapsed_ms;
            self.max_ms = elapsed_ms;
        } else {
            self.min_ms = self.min_ms.min(elapsed_ms);
            self.max_ms = self.max_ms.max(elapsed_ms);
        }
        self.count = self.count.saturating_add(1);
        self.total_ms = self.total_ms.saturating_add(u64::from(elapsed_ms));
    }

    /// Mean latency, `None` before the first sample.
    pub fn mean_ms(&self) -> Option<u32> {
        if self.count == 0 {
            return None;
        }
        Some((self.total_ms / u64::from(self.count)) as u32)
    }
}

#[derive(Clone, Debug, Default)]
pub struct LatencyTracker {
    start_tick: Option<Tick>,
    stats: LatencyStats,
}

impl LatencyTracker {
    pub const fn new() -> Self {
        Self {
            start_tick: None,
            stats: LatencyStats {
                count: 0,
                min_ms: 0,
                max_ms: 0,
                total_ms: 0,
            },
        }
    }

    /// Start a measurement at `now`.
    pub fn arm(&mut self, now: Tick) {
        self.start_tick = Some(now);
    }

    pub fn is_armed(&self) -> bool {
        self.start_tick.is_some()
    }

    /// Close the live measurement at `now`.
    ///
    /// `to_ms` converts a tick delta to milliseconds. A clock that appears to
    /// run backwards yields zero. Returns `None` if nothing was armed.
    pub fn resolve(&mut self, now: Tick, to_ms: impl FnOnce(u64) -> u32) -> Option<LatencySample> {
        let start_tick = self.start_tick.take()?;
        let elapsed_ms = to_ms(now.saturating_sub(start_tick));
        self.stats.record(elapsed_ms);
        Some(LatencySample {
            start_tick,
            end_tick: now,
            elapsed_ms,
        })
    }

    pub fn stats(&self) -> &LatencyStats {
        &self.stats
    }
}
