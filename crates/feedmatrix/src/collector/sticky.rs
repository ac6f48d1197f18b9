// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Timer wheel of total entries that lost their last subscriber.
//!
//! The sticky period is split into [`STICKY_BUCKETS`] ticks. An entry
//! released at tick `t` gets stamp `t + STICKY_BUCKETS` and lands in bucket
//! `stamp % STICKY_BUCKETS`. The stamp is also written to the total row;
//! re-subscription clears the row stamp, so an expiring item whose stamp
//! no longer matches its row is simply discarded.

use crate::config::STICKY_BUCKETS;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct StickyItem {
    pub key: i32,
    pub rid: usize,
    pub stamp: i64,
}

#[derive(Debug)]
pub(crate) struct StickyWheel {
    period: Duration,
    step: Duration,
    epoch: Instant,
    buckets: Vec<Vec<StickyItem>>,
    processed: i64,
}

impl StickyWheel {
    pub fn new(period: Duration) -> Self {
        let epoch = Instant::now();
        let mut wheel = Self {
            period: Duration::ZERO,
            step: Duration::from_millis(1),
            epoch,
            buckets: vec![Vec::new(); STICKY_BUCKETS],
            processed: 0,
        };
        wheel.configure(period);
        wheel
    }

    fn configure(&mut self, period: Duration) {
        self.period = period;
        self.step = (period / STICKY_BUCKETS as u32).max(Duration::from_millis(1));
    }

    pub fn is_enabled(&self) -> bool {
        !self.period.is_zero()
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.buckets.iter().map(Vec::len).sum()
    }

    /// Stamps start at 1 so that 0 can mean "not sticky" in the row.
    fn tick_at(&self, at: Instant) -> i64 {
        let elapsed = at.saturating_duration_since(self.epoch).as_nanos();
        (elapsed / self.step.as_nanos().max(1)) as i64 + 1
    }

    pub fn add(&mut self, key: i32, rid: usize) -> i64 {
        self.add_at(key, rid, Instant::now())
    }

    pub fn add_at(&mut self, key: i32, rid: usize, at: Instant) -> i64 {
        let stamp = self.tick_at(at) + STICKY_BUCKETS as i64;
        let bucket = (stamp as usize) % STICKY_BUCKETS;
        self.buckets[bucket].push(StickyItem { key, rid, stamp });
        stamp
    }

    pub fn take_expired(&mut self) -> Vec<StickyItem> {
        self.take_expired_at(Instant::now())
    }

    /// Removes and returns items whose stamp is due at `at`.
    pub fn take_expired_at(&mut self, at: Instant) -> Vec<StickyItem> {
        let now = self.tick_at(at);
        let mut due = Vec::new();
        if now <= self.processed {
            return due;
        }
        let span = (now - self.processed).min(STICKY_BUCKETS as i64);
        for tick in (now - span + 1)..=now {
            let bucket = &mut self.buckets[(tick as usize) % STICKY_BUCKETS];
            bucket.retain(|item| {
                if item.stamp <= now {
                    due.push(*item);
                    false
                } else {
                    true
                }
            });
        }
        self.processed = now;
        due
    }

    /// Empties the wheel.
    pub fn take_all(&mut self) -> Vec<StickyItem> {
        self.buckets.iter_mut().flat_map(std::mem::take).collect()
    }

    /// Switches to a new period and returns the items that were pending;
    /// the caller re-adds the ones still sticky.
    pub fn set_period(&mut self, period: Duration) -> Vec<StickyItem> {
        let items = self.take_all();
        self.epoch = Instant::now();
        self.processed = 0;
        self.configure(period);
        items
    }
}
