//! Discharge rate and time-to-empty over a sliding window of capacity drops.

use chrono::{DateTime, Utc};
use std::collections::VecDeque;

/// Maximum number of capacity deltas kept in the window.
pub const WINDOW_CAPACITY: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Estimate {
    /// Capacity units (mAh) lost per second, averaged over the window.
    pub drain_rate: Option<f64>,
    /// Seconds until the remaining capacity reaches zero at `drain_rate`.
    pub time_to_empty: Option<f64>,
    /// Number of deltas the estimate is based on.
    pub window_len: usize,
}

#[derive(Debug, Clone)]
pub struct Estimator {
    // (timestamp, capacity delta) pairs, oldest first
    window: VecDeque<(DateTime<Utc>, i64)>,
    window_sum: i64,
    capacity: usize,
    last: Option<(i64, DateTime<Utc>)>,
}

impl Default for Estimator {
    fn default() -> Self {
        Self::new()
    }
}

impl Estimator {
    pub fn new() -> Self {
        Self::with_capacity(WINDOW_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            window: VecDeque::new(),
            window_sum: 0,
            capacity: capacity.max(1),
            last: None,
        }
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    /// Deltas currently in the window, oldest first.
    pub fn deltas(&self) -> impl Iterator<Item = i64> + '_ {
        self.window.iter().map(|(_, delta)| *delta)
    }

    /// Records a capacity reading taken at `timestamp`.
    ///
    /// Each delta is stamped with the time of the reading that opened its
    /// interval, so the window spans the whole period the deltas cover.
    /// Increases in capacity (charging) count as a delta of zero.
    pub fn observe(&mut self, remaining_capacity: i64, timestamp: DateTime<Utc>) -> Estimate {
        let previous = self.last.replace((remaining_capacity, timestamp));
        let Some((last_capacity, last_timestamp)) = previous else {
            log::debug!("First capacity reading {remaining_capacity}, no estimate yet");
            return self.estimate(remaining_capacity, None);
        };

        let delta = (last_capacity - remaining_capacity).max(0);
        // Clocks may step backwards; keep the window ordered
        let stamp = match self.window.back() {
            Some((newest, _)) if *newest > last_timestamp => *newest,
            _ => last_timestamp,
        };
        self.window.push_back((stamp, delta));
        self.window_sum += delta;

        while self.window.len() > self.capacity {
            if let Some((_, evicted)) = self.window.pop_front() {
                self.window_sum -= evicted;
            }
        }

        let elapsed = self
            .window
            .front()
            .map(|(oldest, _)| timestamp.timestamp() - oldest.timestamp())
            .unwrap_or(0);
        let drain_rate = (elapsed > 0).then(|| self.window_sum as f64 / elapsed as f64);
        self.estimate(remaining_capacity, drain_rate)
    }

    fn estimate(&self, remaining_capacity: i64, drain_rate: Option<f64>) -> Estimate {
        let time_to_empty = drain_rate
            .filter(|rate| *rate > 0.0)
            .map(|rate| remaining_capacity as f64 / rate);
        log::trace!(
            "window={} drain_rate={drain_rate:?} time_to_empty={time_to_empty:?}",
            self.window.len()
        );
        Estimate {
            drain_rate,
            time_to_empty,
            window_len: self.window.len(),
        }
    }
}
