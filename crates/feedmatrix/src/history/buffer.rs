// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-entry time-ordered record storage with the snapshot/transaction
//! state machine.
//!
//! # Architecture
//!
//! Records live in a cyclic slot array between the `min` and `max`
//! cursors. Slots in between may be inactive *gaps*; a gap carries the
//! time of the nearest live slot to its left, so slot times are
//! non-decreasing and binary search works across gaps. Slots at `min` and
//! `max - 1` are always live.
//!
//! - Append above max / prepend below min: O(1)
//! - Mid-range insert: reuse the gap before the right neighbour, else
//!   shift toward an inactive slot found by a bounded scan, else open a
//!   proportional gap by shifting the smaller side
//! - Removal turns a slot into a gap; once live density drops below one
//!   half the array is rebuilt with gaps redistributed every
//!   [`GAP_STRIDE`] records
//!
//! # Snapshot state
//!
//! `snapshot_time >= ever_snapshot_time >= snip_snapshot_time` always
//! holds, and every stored record has time `>= ever_snapshot_time`.

use crate::data::{EventFlags, RecordEvent, RecordSink, Symbol};
use std::time::Instant;

const INITIAL_CAPACITY: usize = 16;
/// Maximal distance of the inactive-slot scan around a mid insert.
const GAP_SCAN_LIMIT: usize = 8;
/// One gap slot per this many live records after a rebuild.
pub const GAP_STRIDE: usize = 8;
/// Rebuild is not considered below this span.
const MIN_COMPACT_SPAN: usize = 32;

const SNAPSHOT_BEGIN_SEEN: u8 = 0x01;
const SNAPSHOT_END_SEEN: u8 = 0x02;
const EVER_SNAPSHOT_MODE: u8 = 0x04;
const SWEEP_TX: u8 = 0x08;
const EXPLICIT_TX: u8 = 0x10;

#[derive(Debug, Clone, Default)]
struct Slot {
    time: i64,
    live: bool,
    values: Vec<i64>,
}

/// Identity of the entry the buffer belongs to, used to build events.
#[derive(Debug, Clone, Copy)]
pub struct EntryRef<'a> {
    pub rid: usize,
    pub symbol: &'a Symbol,
}

impl EntryRef<'_> {
    fn event(&self, time: i64, flags: EventFlags, values: Vec<i64>) -> RecordEvent {
        RecordEvent {
            rid: self.rid,
            symbol: self.symbol.clone(),
            time,
            flags,
            values,
        }
    }
}

/// Time-ordered storage of one `(key, rid)` entry.
#[derive(Debug)]
pub struct HistoryBuffer {
    slots: Vec<Slot>,
    mask: usize,
    min: usize,
    max: usize,
    live: usize,

    flags: u8,
    snapshot_time: i64,
    ever_snapshot_time: i64,
    snip_snapshot_time: i64,

    /// When the kept state of an unsubscribed entry expires.
    pub expiration: Option<Instant>,
    /// Number of events produced by the last retrieve-style examination.
    pub n_examined: usize,
    /// Time of the last examined event; valid when `n_examined > 0`.
    pub examined_time: i64,
}

impl Default for HistoryBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl HistoryBuffer {
    pub fn new() -> Self {
        Self {
            slots: vec![Slot::default(); INITIAL_CAPACITY],
            mask: INITIAL_CAPACITY - 1,
            min: 0,
            max: 0,
            live: 0,
            flags: 0,
            snapshot_time: i64::MAX,
            ever_snapshot_time: i64::MAX,
            snip_snapshot_time: i64::MIN,
            expiration: None,
            n_examined: 0,
            examined_time: 0,
        }
    }

    // ========== Slot geometry ==========

    #[inline]
    fn span(&self) -> usize {
        self.max.wrapping_sub(self.min) & self.mask
    }

    #[inline]
    fn phys(&self, off: usize) -> usize {
        (self.min + off) & self.mask
    }

    #[inline]
    fn slot(&self, off: usize) -> &Slot {
        &self.slots[self.phys(off)]
    }

    #[inline]
    fn slot_mut(&mut self, off: usize) -> &mut Slot {
        let p = self.phys(off);
        &mut self.slots[p]
    }

    #[inline]
    fn time_at(&self, off: usize) -> i64 {
        self.slot(off).time
    }

    fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// Largest offset whose slot time satisfies `pred`, given that `pred`
    /// holds on a prefix of the non-decreasing slot times.
    fn search_last(&self, pred: impl Fn(i64) -> bool) -> Option<usize> {
        let span = self.span();
        if span == 0 || !pred(self.time_at(0)) {
            return None;
        }
        let mut lo = 0;
        let mut hi = span - 1;
        if pred(self.time_at(hi)) {
            return Some(hi);
        }
        while hi - lo > 1 {
            let mid = lo + (hi - lo) / 2;
            if pred(self.time_at(mid)) {
                lo = mid;
            } else {
                hi = mid;
            }
        }
        Some(lo)
    }

    fn live_at_or_before(&self, mut off: usize) -> usize {
        while !self.slot(off).live {
            off -= 1;
        }
        off
    }

    /// Offset of the last live record with `time <= t`.
    fn last_live_le(&self, t: i64) -> Option<usize> {
        self.search_last(|time| time <= t)
            .map(|off| self.live_at_or_before(off))
    }

    /// Offset of the last live record with `time < t`.
    fn last_live_lt(&self, t: i64) -> Option<usize> {
        self.search_last(|time| time < t)
            .map(|off| self.live_at_or_before(off))
    }

    fn prev_live(&self, off: usize) -> Option<usize> {
        (0..off).rev().find(|&o| self.slot(o).live)
    }

    fn next_live(&self, off: usize) -> Option<usize> {
        (off + 1..self.span()).find(|&o| self.slot(o).live)
    }

    fn move_slot(&mut self, from: usize, to: usize) {
        let slot = std::mem::take(&mut self.slots[from]);
        self.slots[to] = slot;
    }

    fn capacity_for(live: usize) -> usize {
        let needed = live + live / GAP_STRIDE + 3;
        (needed * 2).next_power_of_two().max(INITIAL_CAPACITY)
    }

    /// Rebuilds storage with `capacity` slots, keeping live records only
    /// and spreading one gap after every [`GAP_STRIDE`] records.
    fn reallocate(&mut self, capacity: usize) {
        let mut slots = vec![Slot::default(); capacity];
        let mut n = 0;
        let mut copied = 0;
        let mut last_time = 0;
        for off in 0..self.span() {
            let p = self.phys(off);
            if !self.slots[p].live {
                continue;
            }
            if copied > 0 && copied % GAP_STRIDE == 0 {
                slots[n].time = last_time;
                n += 1;
            }
            last_time = self.slots[p].time;
            slots[n] = std::mem::take(&mut self.slots[p]);
            n += 1;
            copied += 1;
        }
        self.slots = slots;
        self.mask = capacity - 1;
        self.min = 0;
        self.max = n;
    }

    /// Guarantees room for `extra` more slots within the cyclic array.
    fn ensure_room(&mut self, extra: usize) {
        if self.span() + extra + 2 > self.capacity() {
            self.reallocate(Self::capacity_for(self.live + extra));
        }
    }

    fn compact_if_sparse(&mut self) {
        let span = self.span();
        if span > MIN_COMPACT_SPAN && self.live * 2 < span {
            self.reallocate(Self::capacity_for(self.live));
        }
    }

    fn gap_size(&self) -> usize {
        (self.live / 16).max(1)
    }

    // ========== Removal helpers ==========

    fn kill(&mut self, off: usize) {
        let slot = self.slot_mut(off);
        slot.live = false;
        slot.values = Vec::new();
        self.live -= 1;
    }

    /// Restores geometry after killing slots in `[lo, hi]` offsets.
    fn settle(&mut self, lo: usize, hi: usize) {
        if self.live == 0 {
            for off in 0..self.span() {
                let p = self.phys(off);
                self.slots[p] = Slot::default();
            }
            self.min = 0;
            self.max = 0;
            return;
        }
        // gaps take the time of the live slot to their left
        if lo > 0 {
            if let Some(prev) = self.prev_live(lo) {
                let mut time = self.time_at(prev);
                let span = self.span();
                let mut off = lo;
                while off < span && (off <= hi || !self.slot(off).live) {
                    if self.slot(off).live {
                        time = self.time_at(off);
                    } else {
                        self.slot_mut(off).time = time;
                    }
                    off += 1;
                }
            }
        }
        while !self.slots[self.max.wrapping_sub(1) & self.mask].live {
            self.max = self.max.wrapping_sub(1) & self.mask;
            self.slots[self.max] = Slot::default();
        }
        while !self.slots[self.min].live {
            self.slots[self.min] = Slot::default();
            self.min = (self.min + 1) & self.mask;
        }
    }

    fn remove_at(&mut self, off: usize) {
        self.kill(off);
        self.settle(off, off);
        self.compact_if_sparse();
    }

    // ========== Insertion ==========

    fn write(&mut self, off: usize, time: i64, values: Vec<i64>) {
        let slot = self.slot_mut(off);
        slot.time = time;
        slot.live = true;
        slot.values = values;
        self.live += 1;
    }

    fn append(&mut self, time: i64, values: Vec<i64>) {
        self.ensure_room(1);
        let off = self.span();
        self.max = (self.max + 1) & self.mask;
        self.write(off, time, values);
    }

    fn prepend(&mut self, time: i64, values: Vec<i64>) {
        self.ensure_room(1);
        self.min = self.min.wrapping_sub(1) & self.mask;
        self.write(0, time, values);
    }

    /// Inserts a record strictly between two existing ones; `time` must be
    /// inside the stored range and not present.
    fn insert_middle(&mut self, time: i64, values: Vec<i64>) {
        self.ensure_room(self.gap_size() + 1);
        let Some(l) = self.last_live_le(time) else {
            return self.prepend(time, values);
        };
        let Some(r) = self.next_live(l) else {
            return self.append(time, values);
        };
        if r - l > 1 {
            // gap already there; last gap slot keeps left neighbour's time rule
            return self.write(r - 1, time, values);
        }
        let span = self.span();
        // inactive slot to the right (or the free slot at max)
        for g in r + 1..=(r + GAP_SCAN_LIMIT).min(span) {
            if g == span || !self.slot(g).live {
                if g == span {
                    self.max = (self.max + 1) & self.mask;
                }
                for o in (r..g).rev() {
                    let (from, to) = (self.phys(o), self.phys(o + 1));
                    self.move_slot(from, to);
                }
                return self.write(r, time, values);
            }
        }
        // inactive slot to the left (or the free slot before min)
        for d in 1..=GAP_SCAN_LIMIT.min(l + 1) {
            let g = l + 1 - d; // candidate offset + 1
            if g == 0 || !self.slot(g - 1).live {
                let base = self.min;
                if g == 0 {
                    self.min = self.min.wrapping_sub(1) & self.mask;
                }
                // shift (g-1, l] one slot left relative to the old min
                let start = if g == 0 { 0 } else { g };
                for o in start..=l {
                    let from = (base + o) & self.mask;
                    let to = (base + o).wrapping_sub(1) & self.mask;
                    self.move_slot(from, to);
                }
                let off = if g == 0 { l + 1 } else { l };
                return self.write(off, time, values);
            }
        }
        // open a proportional gap by shifting the smaller side
        let gap = self.gap_size();
        let left_time = self.time_at(l);
        if l + 1 <= span - r {
            let base = self.min;
            self.min = self.min.wrapping_sub(gap) & self.mask;
            for o in 0..=l {
                let from = (base + o) & self.mask;
                let to = (base + o).wrapping_sub(gap) & self.mask;
                self.move_slot(from, to);
            }
            // offsets relative to the new min are unchanged for moved slots
            for o in l + 1..l + 1 + gap {
                let slot = self.slot_mut(o);
                slot.time = left_time;
                slot.live = false;
            }
            self.write(l + gap, time, values);
        } else {
            for o in (r..span).rev() {
                let (from, to) = (self.phys(o), self.phys(o + gap));
                self.move_slot(from, to);
            }
            self.max = (self.max + gap) & self.mask;
            for o in r..r + gap {
                let slot = self.slot_mut(o);
                slot.time = left_time;
                slot.live = false;
            }
            self.write(r + gap - 1, time, values);
        }
    }

    // ========== Transaction and snapshot getters ==========

    /// Whether any kind of transaction is in progress.
    pub fn is_tx(&self) -> bool {
        self.flags & (SWEEP_TX | EXPLICIT_TX) != 0
    }

    pub fn is_sweep_tx(&self) -> bool {
        self.flags & SWEEP_TX != 0
    }

    pub fn was_snapshot_begin_seen(&self) -> bool {
        self.flags & SNAPSHOT_BEGIN_SEEN != 0
    }

    pub fn was_snapshot_end_seen(&self) -> bool {
        self.flags & SNAPSHOT_END_SEEN != 0
    }

    pub fn was_ever_snapshot_mode(&self) -> bool {
        self.flags & EVER_SNAPSHOT_MODE != 0
    }

    pub fn is_waiting_for_snapshot_begin(&self) -> bool {
        self.flags & (EVER_SNAPSHOT_MODE | SNAPSHOT_BEGIN_SEEN | SNAPSHOT_END_SEEN)
            == EVER_SNAPSHOT_MODE
    }

    pub fn snapshot_time(&self) -> i64 {
        self.snapshot_time
    }

    pub fn ever_snapshot_time(&self) -> i64 {
        self.ever_snapshot_time
    }

    pub fn snip_snapshot_time(&self) -> i64 {
        self.snip_snapshot_time
    }

    pub fn is_snip_to_time(&self, time: i64) -> bool {
        time == self.snip_snapshot_time
    }

    /// Checks time marks against each other and against stored records.
    pub fn valid_times(&self) -> bool {
        self.snapshot_time >= self.ever_snapshot_time
            && self.ever_snapshot_time >= self.snip_snapshot_time
            && (self.live == 0 || self.time_at(0) >= self.ever_snapshot_time)
    }

    // ========== Transaction and snapshot transitions ==========

    /// Forgets begin/end seen; called when the total subscription changes.
    pub fn reset_snapshot(&mut self) {
        self.flags &= !(SNAPSHOT_BEGIN_SEEN | SNAPSHOT_END_SEEN);
    }

    /// Returns `true` when snapshot mode is entered for the first time.
    pub fn enter_snapshot_mode_first_time(&mut self) -> bool {
        debug_assert!(self.valid_times());
        if self.was_ever_snapshot_mode() {
            return false;
        }
        self.flags |= EVER_SNAPSHOT_MODE | SNAPSHOT_BEGIN_SEEN;
        true
    }

    pub fn enter_snapshot_mode_for_unconflated(&mut self) {
        self.flags |= EVER_SNAPSHOT_MODE | SNAPSHOT_BEGIN_SEEN;
    }

    /// Tracks explicit transactions; returns `true` at the transaction end.
    pub fn update_explicit_tx(&mut self, tx_pending: bool) -> bool {
        if tx_pending {
            self.flags |= EXPLICIT_TX;
            return false;
        }
        if self.flags & EXPLICIT_TX != 0 {
            self.flags &= !EXPLICIT_TX;
            return !self.is_tx();
        }
        false
    }

    pub fn snapshot_begin(&mut self) {
        self.snapshot_time = i64::MAX;
        debug_assert!(self.valid_times());
        self.flags |= SNAPSHOT_BEGIN_SEEN;
        self.flags &= !SNAPSHOT_END_SEEN;
    }

    /// Removes everything below `time` (times pushed to `removed` in
    /// decreasing order). Returns `false` if already snipped there.
    pub fn snapshot_snip_and_remove(&mut self, time: i64, removed: &mut Vec<i64>) -> bool {
        if self.is_snip_to_time(time) {
            return false;
        }
        let start = removed.len();
        while self.live > 0 && self.time_at(0) < time {
            removed.push(self.time_at(0));
            self.remove_at(0);
        }
        removed[start..].reverse();
        self.snip_snapshot_time = time;
        self.trim_snapshot_times(time);
        debug_assert!(self.valid_times());
        true
    }

    /// Lowers snapshot time to `max(time, trim_to_time)` and sweeps away
    /// records between the new and the previous snapshot time.
    ///
    /// Returns `true` when `ever_snapshot_time` moved down.
    pub fn update_snapshot_time_and_sweep_remove(
        &mut self,
        time: i64,
        trim_to_time: i64,
        removed: &mut Vec<i64>,
    ) -> bool {
        let trimmed = time.max(trim_to_time);
        if trimmed >= self.snapshot_time {
            return false;
        }
        if self.live > 0 {
            let to_time = if time < trim_to_time {
                trim_to_time - 1
            } else {
                time
            };
            self.sweep_remove_between(self.snapshot_time, to_time, removed);
        }
        self.snapshot_time = trimmed;
        let updated_ever = trimmed < self.ever_snapshot_time;
        if updated_ever {
            self.ever_snapshot_time = trimmed;
        }
        if trimmed < self.snip_snapshot_time {
            self.snip_snapshot_time = i64::MIN;
        }
        debug_assert!(self.valid_times());
        updated_ever
    }

    /// Removes records with `to_time < time < snapshot_time`.
    fn sweep_remove_between(&mut self, snapshot_time: i64, to_time: i64, removed: &mut Vec<i64>) {
        let mut doomed = Vec::new();
        let mut cur = self.last_live_lt(snapshot_time);
        while let Some(off) = cur {
            let time = self.time_at(off);
            if time <= to_time {
                break;
            }
            removed.push(time);
            doomed.push(off);
            cur = self.prev_live(off);
        }
        let (Some(&hi), Some(&lo)) = (doomed.first(), doomed.last()) else {
            return;
        };
        for &off in &doomed {
            self.kill(off);
        }
        self.settle(lo, hi);
        self.compact_if_sparse();
    }

    pub fn update_sweep_tx_on(&mut self) {
        self.flags |= SWEEP_TX;
    }

    /// Returns `true` when the snapshot end is seen for the first time.
    pub fn snapshot_end(&mut self) -> bool {
        if !self.was_snapshot_begin_seen() || self.was_snapshot_end_seen() {
            return false;
        }
        self.flags |= SNAPSHOT_END_SEEN;
        true
    }

    /// Returns `true` when no transaction remains after closing the sweep.
    pub fn update_sweep_tx_off(&mut self) -> bool {
        if !self.is_sweep_tx() {
            return false;
        }
        self.flags &= !SWEEP_TX;
        !self.is_tx()
    }

    // ========== Record transfer ==========

    /// Stores, updates or removes the record at `time`; returns whether
    /// anything changed.
    pub fn put_record(&mut self, time: i64, values: &[i64], remove: bool) -> bool {
        if self.live == 0 || time > self.time_at(self.span() - 1) {
            if remove {
                return false;
            }
            self.append(time, values.to_vec());
            return true;
        }
        if time < self.time_at(0) {
            if remove {
                return false;
            }
            self.prepend(time, values.to_vec());
            return true;
        }
        let Some(off) = self.last_live_le(time) else {
            return false;
        };
        if self.time_at(off) != time {
            if remove {
                return false;
            }
            self.insert_middle(time, values.to_vec());
            return true;
        }
        if remove {
            self.remove_at(off);
            return true;
        }
        let slot = self.slot_mut(off);
        if slot.values == values {
            return false;
        }
        slot.values = values.to_vec();
        true
    }

    /// Keeps at most `max_record_count` newest records; returns the number removed.
    pub fn enforce_max_record_count(&mut self, max_record_count: usize) -> usize {
        if self.live <= max_record_count {
            return 0;
        }
        let count = self.live - max_record_count;
        for _ in 0..count {
            self.remove_at(0);
        }
        count
    }

    /// Drops every record and releases storage.
    pub fn clear_all_records(&mut self) -> usize {
        let removed = self.live;
        self.slots = vec![Slot::default(); INITIAL_CAPACITY];
        self.mask = INITIAL_CAPACITY - 1;
        self.min = 0;
        self.max = 0;
        self.live = 0;
        self.trim_snapshot_times(i64::MAX);
        debug_assert!(self.valid_times());
        removed
    }

    /// Drops records below `time`; returns the number removed.
    pub fn remove_old_records(&mut self, time: i64) -> usize {
        let mut removed = 0;
        while self.live > 0 && self.time_at(0) < time {
            self.remove_at(0);
            removed += 1;
        }
        self.trim_snapshot_times(time);
        debug_assert!(self.valid_times());
        removed
    }

    fn trim_snapshot_times(&mut self, time: i64) {
        self.snapshot_time = self.snapshot_time.max(time);
        self.ever_snapshot_time = self.ever_snapshot_time.max(time);
    }

    // ========== Queries ==========

    /// Number of stored records.
    pub fn size(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn min_available_time(&self) -> i64 {
        if self.live == 0 {
            0
        } else {
            self.time_at(0)
        }
    }

    pub fn max_available_time(&self) -> i64 {
        if self.live == 0 {
            0
        } else {
            self.time_at(self.span() - 1)
        }
    }

    /// Number of records with time in `[start, end]` (bounds in any order).
    pub fn available_count(&self, start: i64, end: i64) -> usize {
        let (start, end) = if start > end { (end, start) } else { (start, end) };
        let mut count = 0;
        let mut cur = self.last_live_le(end);
        while let Some(off) = cur {
            if self.time_at(off) < start {
                break;
            }
            count += 1;
            cur = self.prev_live(off);
        }
        count
    }

    /// Stored times in increasing order.
    pub fn times(&self) -> Vec<i64> {
        (0..self.span())
            .filter(|&o| self.slot(o).live)
            .map(|o| self.time_at(o))
            .collect()
    }

    /// Values stored at `time`, if any.
    pub fn values_at(&self, time: i64) -> Option<&[i64]> {
        let off = self.last_live_le(time)?;
        let slot = self.slot(off);
        (slot.time == time).then_some(slot.values.as_slice())
    }

    /// Fraction of live slots within the occupied span.
    pub fn density(&self) -> f64 {
        match self.span() {
            0 => 1.0,
            span => self.live as f64 / span as f64,
        }
    }

    // ========== Examination ==========

    fn tx_flags(&self) -> EventFlags {
        if self.is_tx() {
            EventFlags::TX_PENDING
        } else {
            EventFlags::empty()
        }
    }

    fn examine_one(sink: &mut dyn RecordSink, event: RecordEvent) -> bool {
        if !sink.has_capacity() {
            return true;
        }
        sink.append(event);
        false
    }

    fn examine_snapshot_time(&self, entry: EntryRef<'_>, sink: &mut dyn RecordSink, time: i64) -> bool {
        let flags = EventFlags::REMOVE_EVENT | self.tx_flags();
        Self::examine_one(sink, entry.event(time, flags, Vec::new()))
    }

    /// Examines `end <= time <= start` from newest to oldest. Returns
    /// `true` if the sink ran out of capacity.
    pub fn examine_range_rtl(
        &self,
        entry: EntryRef<'_>,
        start: i64,
        end: i64,
        sink: &mut dyn RecordSink,
    ) -> bool {
        debug_assert!(start >= end);
        let in_snapshot_time = end.max(self.ever_snapshot_time);
        let in_snapshot = self.was_ever_snapshot_mode() && in_snapshot_time <= start;
        let mut cur = self.last_live_le(start);
        let mut last_time = None;
        while let Some(off) = cur {
            let time = self.time_at(off);
            if time < end {
                break;
            }
            last_time = Some(time);
            let values = self.slot(off).values.clone();
            if Self::examine_one(sink, entry.event(time, self.tx_flags(), values)) {
                return true;
            }
            cur = self.prev_live(off);
        }
        match last_time {
            Some(last) if in_snapshot && last > in_snapshot_time => {
                self.examine_snapshot_time(entry, sink, in_snapshot_time)
            }
            Some(_) => false,
            None if in_snapshot => self.examine_snapshot_time(entry, sink, in_snapshot_time),
            None => false,
        }
    }

    /// Examines `start <= time <= end` from oldest to newest.
    pub fn examine_range_ltr(
        &self,
        entry: EntryRef<'_>,
        start: i64,
        end: i64,
        sink: &mut dyn RecordSink,
    ) -> bool {
        debug_assert!(start <= end);
        let in_snapshot_time = start.max(self.ever_snapshot_time);
        let in_snapshot = self.was_ever_snapshot_mode() && in_snapshot_time <= end;
        let first = match self.last_live_lt(start) {
            Some(off) => self.next_live(off),
            None if self.live > 0 => Some(0),
            None => None,
        }
        .filter(|&off| self.time_at(off) <= end);
        let Some(first) = first else {
            return in_snapshot && self.examine_snapshot_time(entry, sink, in_snapshot_time);
        };
        if in_snapshot
            && self.time_at(first) > in_snapshot_time
            && self.examine_snapshot_time(entry, sink, in_snapshot_time)
        {
            return true;
        }
        let mut cur = Some(first);
        while let Some(off) = cur {
            let time = self.time_at(off);
            if time > end {
                break;
            }
            let values = self.slot(off).values.clone();
            if Self::examine_one(sink, entry.event(time, self.tx_flags(), values)) {
                return true;
            }
            cur = self.next_live(off);
        }
        false
    }

    /// Examines the whole consistent snapshot down to `to_time` with
    /// snapshot flags.
    pub fn examine_snapshot(&mut self, entry: EntryRef<'_>, to_time: i64, sink: &mut dyn RecordSink) -> bool {
        let end_flag = if to_time < self.snip_snapshot_time {
            EventFlags::SNAPSHOT_SNIP
        } else {
            EventFlags::SNAPSHOT_END
        };
        let to = to_time.max(self.ever_snapshot_time);
        self.examine_retrieve(
            entry,
            RetrieveRange {
                time_known: i64::MAX,
                to_time: to,
                limit: usize::MAX,
            },
            RetrieveFlags {
                event_flags: EventFlags::SNAPSHOT_BEGIN,
                end_flag,
                tx_end: false,
                use_flags: true,
            },
            sink,
        )
    }

    /// Examines records with `to_time <= time < time_known` from newest to
    /// oldest, appending a virtual end-of-snapshot event at `to_time` when
    /// needed. Sets `n_examined` and `examined_time`.
    ///
    /// Returns `true` if stopped by the limit or sink capacity.
    pub fn examine_retrieve(
        &mut self,
        entry: EntryRef<'_>,
        range: RetrieveRange,
        flags: RetrieveFlags,
        sink: &mut dyn RecordSink,
    ) -> bool {
        self.n_examined = 0;
        let RetrieveFlags {
            mut event_flags,
            mut end_flag,
            tx_end,
            use_flags,
        } = flags;
        if !self.was_ever_snapshot_mode() {
            event_flags = event_flags.without(EventFlags::SNAPSHOT_BEGIN);
            end_flag = end_flag.without(EventFlags::SNAPSHOT_END);
        }
        if self.is_tx() {
            event_flags |= EventFlags::TX_PENDING;
        }
        let mut cur = self.last_live_lt(range.time_known);
        while let Some(off) = cur {
            let time = self.time_at(off);
            if time < range.to_time {
                break;
            }
            if time == range.to_time {
                event_flags |= end_flag;
                if tx_end {
                    event_flags = event_flags.without(EventFlags::TX_PENDING);
                }
            }
            let out = if use_flags { event_flags } else { EventFlags::empty() };
            let values = self.slot(off).values.clone();
            if self.examine_one_retrieve(sink, range.limit, entry.event(time, out, values)) {
                return true;
            }
            event_flags = event_flags.without(EventFlags::SNAPSHOT_BEGIN);
            cur = self.prev_live(off);
        }
        if use_flags
            && !end_flag.is_empty()
            && (self.n_examined == 0 || self.examined_time > range.to_time)
        {
            event_flags |= end_flag;
            if tx_end {
                event_flags = event_flags.without(EventFlags::TX_PENDING);
            }
            let event = entry.event(
                range.to_time,
                event_flags | EventFlags::REMOVE_EVENT,
                Vec::new(),
            );
            return self.examine_one_retrieve(sink, range.limit, event);
        }
        false
    }

    fn examine_one_retrieve(&mut self, sink: &mut dyn RecordSink, limit: usize, event: RecordEvent) -> bool {
        if !sink.has_capacity() || self.n_examined >= limit {
            return true;
        }
        self.n_examined += 1;
        self.examined_time = event.time;
        sink.append(event);
        false
    }
}

/// Time range of [`HistoryBuffer::examine_retrieve`].
#[derive(Debug, Clone, Copy)]
pub struct RetrieveRange {
    /// Exclusive upper bound.
    pub time_known: i64,
    /// Inclusive lower bound.
    pub to_time: i64,
    pub limit: usize,
}

/// Flag policy of [`HistoryBuffer::examine_retrieve`].
#[derive(Debug, Clone, Copy)]
pub struct RetrieveFlags {
    /// Flags of the first event (SNAPSHOT_BEGIN is dropped after it).
    pub event_flags: EventFlags,
    /// SNAPSHOT_END or SNAPSHOT_SNIP for the event at `to_time`.
    pub end_flag: EventFlags,
    /// Clear TX_PENDING on the event at `to_time`.
    pub tx_end: bool,
    /// Emit flags at all.
    pub use_flags: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(symbol: &Symbol) -> EntryRef<'_> {
        EntryRef { rid: 0, symbol }
    }

    fn sym() -> Symbol {
        Symbol::Cipher(0x4000_0001)
    }

    fn put(hb: &mut HistoryBuffer, time: i64) -> bool {
        hb.put_record(time, &[time * 10], false)
    }

    fn check(hb: &HistoryBuffer) {
        let times = hb.times();
        assert!(times.windows(2).all(|w| w[0] < w[1]), "not ordered: {:?}", times);
        assert_eq!(times.len(), hb.size());
        for &t in &times {
            assert_eq!(hb.values_at(t), Some(&[t * 10][..]));
        }
    }

    #[test]
    fn test_append_prepend_middle() {
        let mut hb = HistoryBuffer::new();
        for t in [10, 20, 5, 15, 12, 17, 1, 30, 11] {
            assert!(put(&mut hb, t));
            check(&hb);
        }
        assert_eq!(hb.times(), vec![1, 5, 10, 11, 12, 15, 17, 20, 30]);
        assert_eq!(hb.min_available_time(), 1);
        assert_eq!(hb.max_available_time(), 30);
    }

    #[test]
    fn test_update_and_remove() {
        let mut hb = HistoryBuffer::new();
        put(&mut hb, 1);
        put(&mut hb, 2);
        assert!(!hb.put_record(2, &[20], false), "same values");
        assert!(hb.put_record(2, &[21], false));
        assert!(hb.put_record(2, &[], true));
        assert!(!hb.put_record(2, &[], true), "already removed");
        assert!(!hb.put_record(7, &[], true));
        assert_eq!(hb.times(), vec![1]);
    }

    #[test]
    fn test_randomized_against_model() {
        let mut rng = fastrand::Rng::with_seed(77);
        let mut hb = HistoryBuffer::new();
        let mut model = std::collections::BTreeSet::new();
        for _ in 0..20_000 {
            let t = rng.i64(0..2000);
            if rng.u8(0..4) == 0 {
                assert_eq!(hb.put_record(t, &[], true), model.remove(&t));
            } else {
                let changed = hb.put_record(t, &[t * 10], false);
                assert_eq!(changed, model.insert(t));
            }
        }
        check(&hb);
        assert_eq!(hb.times(), model.iter().copied().collect::<Vec<_>>());
    }

    #[test]
    fn test_compaction_keeps_density() {
        let mut hb = HistoryBuffer::new();
        for t in 0..1000 {
            put(&mut hb, t * 2);
        }
        for t in 0..1000 {
            if t % 10 != 0 {
                hb.put_record(t * 2, &[], true);
            }
        }
        check(&hb);
        assert_eq!(hb.size(), 100);
        assert!(hb.density() >= 0.5, "density {}", hb.density());
        // mid inserts reuse redistributed gaps
        for t in 0..100 {
            put(&mut hb, t * 20 + 1);
        }
        check(&hb);
        assert_eq!(hb.size(), 200);
    }

    #[test]
    fn test_snip_removes_below() {
        let mut hb = HistoryBuffer::new();
        let mut removed = Vec::new();
        for t in (1..=5).rev() {
            hb.update_snapshot_time_and_sweep_remove(t, i64::MIN, &mut removed);
            put(&mut hb, t);
        }
        assert!(removed.is_empty());
        assert!(hb.snapshot_snip_and_remove(3, &mut removed));
        assert_eq!(removed, vec![2, 1]);
        assert_eq!(hb.times(), vec![3, 4, 5]);
        assert_eq!(hb.snip_snapshot_time(), 3);
        assert!(!hb.snapshot_snip_and_remove(3, &mut removed));
        assert!(hb.valid_times());
    }

    #[test]
    fn test_sweep_between() {
        let mut hb = HistoryBuffer::new();
        let mut removed = Vec::new();
        for t in (1..=9).rev() {
            hb.update_snapshot_time_and_sweep_remove(t, i64::MIN, &mut removed);
            put(&mut hb, t);
        }
        assert_eq!(hb.ever_snapshot_time(), 1);
        // a new snapshot only sweeps what it skips over
        hb.snapshot_begin();
        assert!(!hb.update_snapshot_time_and_sweep_remove(8, i64::MIN, &mut removed));
        assert_eq!(removed, vec![9]);
        removed.clear();
        assert!(!hb.update_snapshot_time_and_sweep_remove(3, i64::MIN, &mut removed));
        assert_eq!(removed, vec![7, 6, 5, 4]);
        assert_eq!(hb.times(), vec![1, 2, 3, 8]);
        assert_eq!(hb.snapshot_time(), 3);
        assert_eq!(hb.ever_snapshot_time(), 1);
        // going up does nothing
        assert!(!hb.update_snapshot_time_and_sweep_remove(5, i64::MIN, &mut removed));
    }

    #[test]
    fn test_state_flags() {
        let mut hb = HistoryBuffer::new();
        assert!(!hb.is_waiting_for_snapshot_begin());
        assert!(hb.enter_snapshot_mode_first_time());
        assert!(!hb.enter_snapshot_mode_first_time());
        assert!(hb.snapshot_end());
        assert!(!hb.snapshot_end());
        hb.reset_snapshot();
        assert!(hb.is_waiting_for_snapshot_begin());
        assert!(!hb.update_explicit_tx(true));
        assert!(hb.is_tx());
        hb.update_sweep_tx_on();
        assert!(!hb.update_explicit_tx(false), "sweep still open");
        assert!(hb.update_sweep_tx_off());
        assert!(!hb.is_tx());
    }

    #[test]
    fn test_examine_snapshot_flags() {
        let symbol = sym();
        let mut hb = HistoryBuffer::new();
        hb.enter_snapshot_mode_first_time();
        let mut removed = Vec::new();
        for t in [30, 20, 10] {
            hb.update_snapshot_time_and_sweep_remove(t, i64::MIN, &mut removed);
            put(&mut hb, t);
        }
        let mut out = Vec::new();
        assert!(!hb.examine_snapshot(entry(&symbol), 0, &mut out));
        let got: Vec<(i64, EventFlags)> = out.iter().map(|e| (e.time, e.flags)).collect();
        assert_eq!(
            got,
            vec![
                (30, EventFlags::SNAPSHOT_BEGIN),
                (20, EventFlags::empty()),
                (10, EventFlags::SNAPSHOT_END),
            ]
        );
    }

    #[test]
    fn test_examine_snapshot_virtual_end() {
        let symbol = sym();
        let mut hb = HistoryBuffer::new();
        hb.enter_snapshot_mode_first_time();
        let mut removed = Vec::new();
        hb.update_snapshot_time_and_sweep_remove(5, i64::MIN, &mut removed);
        put(&mut hb, 8);
        let mut out = Vec::new();
        hb.examine_snapshot(entry(&symbol), 0, &mut out);
        assert_eq!(out.len(), 2);
        assert_eq!(out[1].time, 5);
        assert!(out[1].flags.contains(EventFlags::SNAPSHOT_END | EventFlags::REMOVE_EVENT));
    }

    #[test]
    fn test_examine_ranges() {
        let symbol = sym();
        let mut hb = HistoryBuffer::new();
        for t in 1..=6 {
            put(&mut hb, t);
        }
        let mut out = Vec::new();
        hb.examine_range_ltr(entry(&symbol), 2, 4, &mut out);
        assert_eq!(out.iter().map(|e| e.time).collect::<Vec<_>>(), vec![2, 3, 4]);
        out.clear();
        hb.examine_range_rtl(entry(&symbol), 5, 3, &mut out);
        assert_eq!(out.iter().map(|e| e.time).collect::<Vec<_>>(), vec![5, 4, 3]);
        assert_eq!(hb.available_count(5, 2), 4);
        assert_eq!(hb.available_count(100, 200), 0);
    }

    #[test]
    fn test_examine_limit_sets_counters() {
        let symbol = sym();
        let mut hb = HistoryBuffer::new();
        for t in 1..=6 {
            put(&mut hb, t);
        }
        let mut out = Vec::new();
        let more = hb.examine_retrieve(
            entry(&symbol),
            RetrieveRange {
                time_known: i64::MAX,
                to_time: 0,
                limit: 2,
            },
            RetrieveFlags {
                event_flags: EventFlags::empty(),
                end_flag: EventFlags::empty(),
                tx_end: false,
                use_flags: true,
            },
            &mut out,
        );
        assert!(more);
        assert_eq!(hb.n_examined, 2);
        assert_eq!(hb.examined_time, 5);
    }

    #[test]
    fn test_enforce_max_and_clear() {
        let mut hb = HistoryBuffer::new();
        hb.update_snapshot_time_and_sweep_remove(1, i64::MIN, &mut Vec::new());
        for t in 1..=10 {
            put(&mut hb, t);
        }
        assert_eq!(hb.enforce_max_record_count(3), 7);
        assert_eq!(hb.times(), vec![8, 9, 10]);
        assert_eq!(hb.remove_old_records(9), 1);
        assert_eq!(hb.clear_all_records(), 2);
        assert!(hb.is_empty());
        assert_eq!(hb.snapshot_time(), i64::MAX);
    }
}
