// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Agent output buffer: an append-only ring log with persistent positions.
//!
//! Every appended record gets a persistent position that only grows
//! (starting at [`BASE`]); records leave from the head on retrieval or on
//! overflow. History agents link each record to the previous record of the
//! same `(key, rid)` so a whole chain can be unlinked (skipped on
//! retrieval) or flagged at once. Positions are rebased back to [`BASE`]
//! once they exceed the rebase threshold; callers remap stored positions
//! through [`AgentBuffer::rebase`].

use crate::data::{EventFlags, RecordEvent, RecordSink, Symbol};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Persistent position of the first record ever written.
pub const BASE: i64 = 1;

/// Behavior when the buffer reaches its maximal size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowStrategy {
    /// Discard records from the head until the buffer fits.
    #[default]
    DropOldest,
    /// Refuse to enqueue new records.
    DropNewest,
    /// Stop distribution to this agent until it drains.
    Block,
}

/// Record stored in the buffer.
#[derive(Debug, Clone)]
pub struct BufferedRecord {
    pub event: RecordEvent,
    /// Persistent position of the previous record of the same entry, 0 if none.
    link: i64,
    unlinked: bool,
}

impl BufferedRecord {
    pub fn is_unlinked(&self) -> bool {
        self.unlinked
    }
}

/// Output buffer of one agent. Guarded by the agent lock.
#[derive(Debug)]
pub struct AgentBuffer {
    records: VecDeque<BufferedRecord>,
    first_position: i64,
    max_size: usize,
    strategy: OverflowStrategy,
    rebase_threshold: i64,
    blocked: bool,
    dropped_since_log: u64,
    total_dropped: u64,
    last_dropped: Option<(usize, Symbol)>,
    last_log: Option<Instant>,
}

impl AgentBuffer {
    pub fn new(max_size: usize, rebase_threshold: i64) -> Self {
        Self {
            records: VecDeque::new(),
            first_position: BASE,
            max_size,
            strategy: OverflowStrategy::default(),
            rebase_threshold,
            blocked: false,
            dropped_since_log: 0,
            total_dropped: 0,
            last_dropped: None,
            last_log: None,
        }
    }

    pub fn set_max_size(&mut self, max_size: usize) {
        self.max_size = max_size;
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn set_strategy(&mut self, strategy: OverflowStrategy) {
        self.strategy = strategy;
    }

    pub fn strategy(&self) -> OverflowStrategy {
        self.strategy
    }

    /// Number of stored records, unlinked ones included.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn has_next(&self) -> bool {
        !self.records.is_empty()
    }

    pub fn first_position(&self) -> i64 {
        self.first_position
    }

    /// Position the next appended record will get.
    pub fn next_position(&self) -> i64 {
        self.first_position + self.records.len() as i64
    }

    pub fn is_in_buffer(&self, position: i64) -> bool {
        position >= self.first_position && position < self.next_position()
    }

    fn slot(&self, position: i64) -> usize {
        (position - self.first_position) as usize
    }

    pub fn get(&self, position: i64) -> Option<&BufferedRecord> {
        if self.is_in_buffer(position) {
            self.records.get(self.slot(position))
        } else {
            None
        }
    }

    pub fn get_mut(&mut self, position: i64) -> Option<&mut BufferedRecord> {
        if self.is_in_buffer(position) {
            let slot = self.slot(position);
            self.records.get_mut(slot)
        } else {
            None
        }
    }

    /// Appends a record linked to `link` and returns its position.
    pub fn push(&mut self, event: RecordEvent, link: i64) -> i64 {
        let position = self.next_position();
        self.records.push_back(BufferedRecord {
            event,
            link,
            unlinked: false,
        });
        position
    }

    /// Marks the chain ending at `position` as unlinked.
    ///
    /// Returns `false` if a record in the chain was already unlinked.
    pub fn unlink_from(&mut self, position: i64) -> bool {
        let mut position = position;
        while let Some(record) = self.get_mut(position) {
            if record.unlinked {
                return false;
            }
            record.unlinked = true;
            if record.link == 0 {
                break;
            }
            position = record.link;
        }
        true
    }

    /// ORs `flags` into every record of the chain ending at `position`.
    pub fn flag_from(&mut self, position: i64, flags: EventFlags) -> bool {
        let mut position = position;
        while let Some(record) = self.get_mut(position) {
            if record.unlinked {
                return false;
            }
            record.event.flags |= flags;
            if record.link == 0 {
                break;
            }
            position = record.link;
        }
        true
    }

    /// Moves up to `limit` linked records into `sink` while it has
    /// capacity; unlinked records are skipped. Returns the count delivered.
    pub fn retrieve(&mut self, sink: &mut dyn RecordSink, limit: usize) -> usize {
        let mut count = 0;
        while count < limit && sink.has_capacity() {
            let Some(record) = self.records.pop_front() else {
                break;
            };
            self.first_position += 1;
            if !record.unlinked {
                sink.append(record.event);
                count += 1;
            }
        }
        count
    }

    // ========== Overflow ==========

    pub fn is_blocked(&self) -> bool {
        self.blocked
    }

    /// Clears the blocked state once the buffer is drained.
    pub fn unblock(&mut self) -> bool {
        if self.blocked && self.records.is_empty() {
            self.blocked = false;
            return true;
        }
        false
    }

    /// Drops the blocked state regardless of the buffer size.
    pub fn clear_blocked(&mut self) {
        self.blocked = false;
    }

    /// Under [`OverflowStrategy::Block`], marks the buffer blocked if full.
    pub fn block_new_record(&mut self) -> bool {
        if self.strategy != OverflowStrategy::Block || self.records.len() < self.max_size {
            return false;
        }
        self.blocked = true;
        true
    }

    /// Under [`OverflowStrategy::DropNewest`], refuses `event` if full.
    pub fn drop_new_record(&mut self, event: &RecordEvent) -> bool {
        if self.strategy != OverflowStrategy::DropNewest || self.records.len() < self.max_size {
            return false;
        }
        self.make_dropped(event.rid, &event.symbol);
        true
    }

    /// Under [`OverflowStrategy::DropOldest`], trims the head to fit.
    pub fn drop_old_records(&mut self) {
        if self.strategy != OverflowStrategy::DropOldest {
            return;
        }
        while self.records.len() > self.max_size {
            let Some(record) = self.records.pop_front() else {
                break;
            };
            self.first_position += 1;
            if !record.unlinked {
                self.make_dropped(record.event.rid, &record.event.symbol);
            }
        }
    }

    fn make_dropped(&mut self, rid: usize, symbol: &Symbol) {
        self.dropped_since_log += 1;
        self.total_dropped += 1;
        self.last_dropped = Some((rid, symbol.clone()));
    }

    /// Total records dropped due to overflow since creation.
    pub fn total_dropped(&self) -> u64 {
        self.total_dropped
    }

    /// Drops pending since the last report and the last dropped entry.
    ///
    /// Returns `None` while rate-limited by `interval`; the pending count
    /// is reset once returned.
    pub fn take_drop_report(&mut self, interval: Duration) -> Option<(u64, Option<(usize, Symbol)>)> {
        if self.dropped_since_log == 0 {
            return None;
        }
        let now = Instant::now();
        if let Some(last) = self.last_log {
            if now.duration_since(last) < interval {
                return None;
            }
        }
        self.last_log = Some(now);
        let dropped = std::mem::take(&mut self.dropped_since_log);
        Some((dropped, self.last_dropped.take()))
    }

    // ========== Maintenance ==========

    pub fn needs_rebase(&self) -> bool {
        self.first_position > self.rebase_threshold
    }

    /// Resets positions to start at [`BASE`]; returns the shift that
    /// callers subtract from positions they store (positions below the
    /// old head map to 0).
    pub fn rebase(&mut self) -> i64 {
        let shift = self.first_position - BASE;
        if shift == 0 {
            return 0;
        }
        let first = self.first_position;
        for record in &mut self.records {
            record.link = if record.link >= first {
                record.link - shift
            } else {
                0
            };
        }
        self.first_position = BASE;
        shift
    }

    /// Keeps only records accepted by `keep`; returns the number removed.
    pub fn retain(&mut self, mut keep: impl FnMut(&RecordEvent) -> bool) -> usize {
        let before = self.records.len();
        self.records.retain(|r| !r.unlinked && keep(&r.event));
        before - self.records.len()
    }

    pub fn clear(&mut self) {
        self.first_position += self.records.len() as i64;
        self.records.clear();
    }

    /// Iterates over stored records from head to tail.
    pub fn iter(&self) -> impl Iterator<Item = (i64, &BufferedRecord)> {
        let first = self.first_position;
        self.records
            .iter()
            .enumerate()
            .map(move |(i, r)| (first + i as i64, r))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(i: i64) -> RecordEvent {
        RecordEvent::new(0, Symbol::Cipher(0x4000_0001)).with_time(i)
    }

    fn times(events: &[RecordEvent]) -> Vec<i64> {
        events.iter().map(|e| e.time).collect()
    }

    #[test]
    fn test_drop_oldest_counts_drops() {
        let mut buf = AgentBuffer::new(3, 1 << 30);
        for i in 0..10 {
            buf.push(event(i), 0);
            buf.drop_old_records();
        }
        assert_eq!(buf.total_dropped(), 7);
        let mut out = Vec::new();
        buf.retrieve(&mut out, usize::MAX);
        assert_eq!(times(&out), vec![7, 8, 9]);
    }

    #[test]
    fn test_drop_newest_refuses() {
        let mut buf = AgentBuffer::new(2, 1 << 30);
        buf.set_strategy(OverflowStrategy::DropNewest);
        for i in 0..5 {
            let e = event(i);
            if !buf.drop_new_record(&e) {
                buf.push(e, 0);
            }
        }
        assert_eq!(buf.total_dropped(), 3);
        let mut out = Vec::new();
        buf.retrieve(&mut out, usize::MAX);
        assert_eq!(times(&out), vec![0, 1]);
    }

    #[test]
    fn test_block_and_unblock() {
        let mut buf = AgentBuffer::new(1, 1 << 30);
        buf.set_strategy(OverflowStrategy::Block);
        assert!(!buf.block_new_record());
        buf.push(event(1), 0);
        assert!(buf.block_new_record());
        assert!(buf.is_blocked());
        assert!(!buf.unblock());
        let mut out = Vec::new();
        buf.retrieve(&mut out, usize::MAX);
        assert!(buf.unblock());
        assert!(!buf.is_blocked());
    }

    #[test]
    fn test_unlinked_chain_is_skipped() {
        let mut buf = AgentBuffer::new(100, 1 << 30);
        let a = buf.push(event(1), 0);
        buf.push(event(2), 0);
        let c = buf.push(event(3), a);
        assert!(buf.unlink_from(c));
        assert!(!buf.unlink_from(a));
        let mut out = Vec::new();
        assert_eq!(buf.retrieve(&mut out, usize::MAX), 1);
        assert_eq!(times(&out), vec![2]);
    }

    #[test]
    fn test_flag_chain() {
        let mut buf = AgentBuffer::new(100, 1 << 30);
        let a = buf.push(event(1), 0);
        let b = buf.push(event(2), a);
        buf.push(event(3), 0);
        assert!(buf.flag_from(b, EventFlags::TX_PENDING));
        let mut out = Vec::new();
        buf.retrieve(&mut out, usize::MAX);
        let flagged: Vec<bool> = out
            .iter()
            .map(|e| e.flags.contains(EventFlags::TX_PENDING))
            .collect();
        assert_eq!(flagged, vec![true, true, false]);
    }

    #[test]
    fn test_retrieve_limit_and_positions() {
        let mut buf = AgentBuffer::new(100, 1 << 30);
        let first = buf.push(event(1), 0);
        assert_eq!(first, BASE);
        buf.push(event(2), 0);
        let mut out = Vec::new();
        assert_eq!(buf.retrieve(&mut out, 1), 1);
        assert!(!buf.is_in_buffer(first));
        assert!(buf.is_in_buffer(first + 1));
        assert_eq!(buf.next_position(), first + 2);
    }

    #[test]
    fn test_rebase_shifts_links() {
        let mut buf = AgentBuffer::new(100, 16);
        for i in 0..20 {
            buf.push(event(i), 0);
        }
        let mut sink = Vec::new();
        buf.retrieve(&mut sink, 18);
        let a = buf.push(event(100), 0);
        let b = buf.push(event(101), a);
        assert!(buf.needs_rebase());
        let shift = buf.rebase();
        assert_eq!(buf.first_position(), BASE);
        assert!(!buf.needs_rebase());
        assert!(buf.unlink_from(b - shift));
        let mut out = Vec::new();
        buf.retrieve(&mut out, usize::MAX);
        assert_eq!(times(&out), vec![18, 19]);
    }

    #[test]
    fn test_drop_report_rate_limited() {
        let mut buf = AgentBuffer::new(0, 1 << 30);
        buf.push(event(1), 0);
        buf.drop_old_records();
        let report = buf.take_drop_report(Duration::from_secs(3600));
        assert_eq!(report.map(|r| r.0), Some(1));
        buf.push(event(2), 0);
        buf.drop_old_records();
        assert!(buf.take_drop_report(Duration::from_secs(3600)).is_none());
        assert_eq!(buf.total_dropped(), 2);
    }
}
