// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Distribution batch: which agents get which incoming records.
//!
//! Phase 1 (structural lock) only calls [`Distribution::add`]. Entries of
//! one agent form a singly linked list inside a shared flat array, index 0
//! being the null link. Phase 2 (agent locks) walks each agent's list; an
//! agent whose buffer blocks is parked with its resume index and retried
//! after it drains.

use crate::agent::AgentInner;
use crate::data::RecordEvent;
use parking_lot::{Condvar, Mutex};
use std::ops::{BitAnd, BitOr, BitOrAssign};
use std::sync::Arc;

/// Phase-1 findings carried to phase 2 for one entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct DistFlags(u8);

impl DistFlags {
    /// A transaction or snapshot finished with this event.
    pub const TX_END: Self = Self(0x01);
    /// History storage was snipped by this event.
    pub const UPDATED_SNIP: Self = Self(0x02);
    /// Snapshot mode started; snapshot agents get data via the queue.
    pub const SEND_SNAPSHOT: Self = Self(0x04);
    /// History storage changed at the event time.
    pub const UPDATED_RECORD: Self = Self(0x08);
    /// A sweep transaction is open in storage.
    pub const TX_SWEEP: Self = Self(0x10);
    /// Storage was in snapshot mode at some point.
    pub const HAD_SNAPSHOT: Self = Self(0x20);
    /// Last item of the agent row for this pass.
    pub const DEC_PENDING: Self = Self(0x40);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }
}

impl BitOr for DistFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for DistFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for DistFlags {
    type Output = Self;
    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

/// Where the record of an entry comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Source {
    /// Index in the incoming batch.
    Event(usize),
    /// Index in the distribution's own remove buffer.
    Removed(usize),
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct DistEntry {
    next: usize,
    pub source: Source,
    pub flags: DistFlags,
}

pub(crate) struct AgentSlot {
    pub agent: Arc<AgentInner>,
    /// Agent subscription generation when the slot was registered.
    pub sub_mod_count: u64,
    first: usize,
    last: usize,
}

pub(crate) struct Distribution {
    entries: Vec<DistEntry>,
    slots: Vec<AgentSlot>,
    slot_of: Vec<usize>,
    pending: Vec<usize>,
    blocked: Vec<usize>,
    removed: Vec<RecordEvent>,
    bucket: usize,
    version: u32,
}

impl Distribution {
    pub fn new(bucket: usize, version: u32) -> Self {
        Self {
            entries: vec![DistEntry {
                next: 0,
                source: Source::Event(0),
                flags: DistFlags::empty(),
            }],
            slots: Vec::new(),
            slot_of: Vec::new(),
            pending: Vec::new(),
            blocked: Vec::new(),
            removed: Vec::new(),
            bucket,
            version,
        }
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Whether phase 1 may keep adding entries.
    pub fn has_capacity(&self) -> bool {
        self.entries.len() <= self.bucket
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn add(&mut self, agent: &Arc<AgentInner>, source: Source, flags: DistFlags) {
        let index = self.entries.len();
        self.entries.push(DistEntry {
            next: 0,
            source,
            flags,
        });
        let number = agent.number;
        if number >= self.slot_of.len() {
            self.slot_of.resize(number + 1, 0);
        }
        match self.slot_of[number] {
            0 => {
                self.slots.push(AgentSlot {
                    agent: agent.clone(),
                    sub_mod_count: agent.sub_mod_count(),
                    first: index,
                    last: index,
                });
                self.slot_of[number] = self.slots.len();
                self.pending.push(self.slots.len() - 1);
            }
            slot => {
                let slot = &mut self.slots[slot - 1];
                self.entries[slot.last].next = index;
                slot.last = index;
            }
        }
    }

    /// Number of entries added so far.
    pub fn len(&self) -> usize {
        self.entries.len() - 1
    }

    /// Adds `flags` to the most recently added entry.
    pub fn mark_last(&mut self, flags: DistFlags) {
        if let Some(entry) = self.entries.last_mut() {
            entry.flags |= flags;
        }
    }

    pub fn push_removed(&mut self, event: RecordEvent) -> Source {
        self.removed.push(event);
        Source::Removed(self.removed.len() - 1)
    }

    pub fn removed(&self, index: usize) -> &RecordEvent {
        &self.removed[index]
    }

    pub fn slot(&self, slot: usize) -> &AgentSlot {
        &self.slots[slot]
    }

    pub fn first_index(&self, slot: usize) -> usize {
        self.slots[slot].first
    }

    pub fn next_index(&self, index: usize) -> usize {
        self.entries[index].next
    }

    pub fn entry(&self, index: usize) -> &DistEntry {
        &self.entries[index]
    }

    /// Slots still to be processed in phase 2; empties the list.
    pub fn take_pending(&mut self) -> Vec<usize> {
        std::mem::take(&mut self.pending)
    }

    /// Puts a slot back for the next round (its agent lock was busy).
    pub fn retry(&mut self, slot: usize) {
        self.pending.push(slot);
    }

    /// Parks a slot whose agent blocked at entry `index`.
    pub fn block(&mut self, slot: usize, index: usize) {
        self.slots[slot].first = index;
        self.blocked.push(slot);
    }

    pub fn has_blocked(&self) -> bool {
        !self.blocked.is_empty()
    }

    pub fn blocked_agents(&self) -> impl Iterator<Item = &Arc<AgentInner>> {
        self.blocked.iter().map(|&slot| &self.slots[slot].agent)
    }

    /// Moves parked slots back to pending.
    pub fn enqueue_blocked(&mut self) {
        let blocked = std::mem::take(&mut self.blocked);
        self.pending.extend(blocked);
    }
}

// ============================================================================
// Process versions
// ============================================================================

/// Process versions are 18-bit and never 0.
pub(crate) const PROCESS_VERSION_MASK: u32 = (1 << 18) - 1;

#[derive(Debug, Default)]
struct TrackerState {
    last: u32,
    in_process: Vec<u32>,
}

/// Hands out process versions and lets phase 1 wait until an earlier
/// phase 2 that still owns a row has finished.
#[derive(Debug, Default)]
pub(crate) struct ProcessVersionTracker {
    state: Mutex<TrackerState>,
    done: Condvar,
}

impl ProcessVersionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self) -> u32 {
        let mut state = self.state.lock();
        let mut version = state.last;
        loop {
            version = (version + 1) & PROCESS_VERSION_MASK;
            if version != 0 && !state.in_process.contains(&version) {
                break;
            }
        }
        state.last = version;
        state.in_process.push(version);
        version
    }

    pub fn end(&self, version: u32) {
        let mut state = self.state.lock();
        state.in_process.retain(|&v| v != version);
        self.done.notify_all();
    }

    #[cfg(test)]
    pub fn is_in_process(&self, version: u32) -> bool {
        self.state.lock().in_process.contains(&version)
    }

    pub fn wait_while_in_process(&self, version: u32) {
        let mut state = self.state.lock();
        while state.in_process.contains(&version) {
            self.done.wait(&mut state);
        }
    }
}

/// Ends its process version when dropped, including on unwinding.
pub(crate) struct VersionGuard<'a> {
    tracker: &'a ProcessVersionTracker,
    version: u32,
}

impl<'a> VersionGuard<'a> {
    pub fn new(tracker: &'a ProcessVersionTracker) -> Self {
        let version = tracker.begin();
        Self { tracker, version }
    }

    pub fn version(&self) -> u32 {
        self.version
    }
}

impl Drop for VersionGuard<'_> {
    fn drop(&mut self) {
        self.tracker.end(self.version);
    }
}
