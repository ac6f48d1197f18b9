// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-agent queue of subscription rows that have snapshot data to pull
//! from shared history storage.
//!
//! Links live in the agent's own rows ([`QUEUE_NEXT`], [`QUEUE_FRESH`]);
//! the queue itself only keeps head and tail. A row enters at the tail
//! marked *fresh*, meaning its next visit at the head starts a new
//! snapshot batch allowance.

use crate::collector::layout::{KEY, QUEUE_EOL, QUEUE_FRESH, QUEUE_NEXT, RID};
use crate::matrix::SubMatrix;

#[derive(Debug)]
pub(crate) struct SnapshotQueue {
    head: i64,
    tail: i64,
}

impl Default for SnapshotQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotQueue {
    pub fn new() -> Self {
        Self {
            head: QUEUE_EOL,
            tail: QUEUE_EOL,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head == QUEUE_EOL
    }

    pub fn head(&self) -> Option<usize> {
        (self.head != QUEUE_EOL).then_some(self.head as usize)
    }

    pub fn is_queued(sub: &SubMatrix, index: usize) -> bool {
        sub.get(index, QUEUE_NEXT) != 0
    }

    pub fn is_fresh(sub: &SubMatrix, index: usize) -> bool {
        sub.get(index, QUEUE_FRESH) != 0
    }

    pub fn reset_fresh(sub: &SubMatrix, index: usize) {
        sub.set(index, QUEUE_FRESH, 0);
    }

    /// Appends `index` unless already queued. Returns `true` when the
    /// queue was empty before.
    pub fn link(&mut self, sub: &SubMatrix, index: usize) -> bool {
        if Self::is_queued(sub, index) {
            return false;
        }
        let first = self.tail == QUEUE_EOL;
        if first {
            self.head = index as i64;
        } else {
            sub.set(self.tail as usize, QUEUE_NEXT, index as i64);
        }
        sub.set(index, QUEUE_NEXT, QUEUE_EOL);
        sub.set(index, QUEUE_FRESH, 1);
        self.tail = index as i64;
        first
    }

    /// Pops the head (which must be `index`) and returns the new head.
    pub fn pop(&mut self, sub: &SubMatrix, index: usize) -> Option<usize> {
        debug_assert_eq!(self.head, index as i64);
        let next = sub.get(index, QUEUE_NEXT);
        sub.set(index, QUEUE_NEXT, 0);
        sub.set(index, QUEUE_FRESH, 0);
        self.head = next;
        if next == QUEUE_EOL {
            self.tail = QUEUE_EOL;
        }
        self.head()
    }

    /// Moves the head (which must be `index`) to the tail marked fresh and
    /// returns the new head.
    pub fn move_to_tail(&mut self, sub: &SubMatrix, index: usize) -> Option<usize> {
        debug_assert_eq!(self.head, index as i64);
        let next = sub.get(index, QUEUE_NEXT);
        sub.set(index, QUEUE_FRESH, 1);
        if next == QUEUE_EOL {
            return Some(index);
        }
        sub.set(self.tail as usize, QUEUE_NEXT, index as i64);
        sub.set(index, QUEUE_NEXT, QUEUE_EOL);
        self.tail = index as i64;
        self.head = next;
        self.head()
    }

    /// Pops head rows for which `is_done` holds, starting only if `index`
    /// is the head.
    pub fn cleanup_empty_head(&mut self, sub: &SubMatrix, index: usize, is_done: impl Fn(usize) -> bool) {
        if self.head != index as i64 {
            return;
        }
        let mut cur = Some(index);
        while let Some(index) = cur {
            if !is_done(index) {
                break;
            }
            cur = self.pop(sub, index);
        }
    }

    /// Rebuilds links in `sub` after it was rehashed from `old`, keeping
    /// the fresh marks. Rows that did not survive the rehash drop out.
    pub fn fix(&mut self, sub: &SubMatrix, old: &SubMatrix) {
        let mut old_index = self.head;
        let mut last = 0usize;
        while old_index != QUEUE_EOL {
            let o = old_index as usize;
            let index = sub.get_index(old.key(o), old.rid(o));
            if index > 0 {
                if last == 0 {
                    self.head = index as i64;
                } else {
                    sub.set(last, QUEUE_NEXT, index as i64);
                }
                last = index;
            }
            old_index = old.get(o, QUEUE_NEXT);
        }
        if last == 0 {
            self.head = QUEUE_EOL;
            self.tail = QUEUE_EOL;
        } else {
            sub.set(last, QUEUE_NEXT, QUEUE_EOL);
            self.tail = last as i64;
        }
    }

    /// Rows in queue order.
    pub fn rows(&self, sub: &SubMatrix) -> Vec<usize> {
        let mut rows = Vec::new();
        let mut cur = self.head;
        while cur != QUEUE_EOL && rows.len() <= sub.len_cells() / sub.step() {
            rows.push(cur as usize);
            cur = sub.get(cur as usize, QUEUE_NEXT);
        }
        rows
    }

    /// `(key, rid)` of queued rows, for diagnostics.
    pub fn entries(&self, sub: &SubMatrix) -> Vec<(i32, usize)> {
        self.rows(sub)
            .into_iter()
            .map(|row| (sub.get(row, KEY) as i32, sub.get(row, RID) as usize))
            .collect()
    }
}
