// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Temporal storage: per-entry history buffers, the store that owns them
//! and the subscription filter hook.

pub mod buffer;

pub use buffer::{EntryRef, HistoryBuffer, RetrieveFlags, RetrieveRange};

use crate::data::Symbol;

/// Per-entry policy of a history collector.
pub trait HistorySubscriptionFilter: Send + Sync {
    /// Lowest time worth keeping; subscriptions asking for older data are
    /// trimmed to it and their snapshot ends with a snip.
    fn min_history_time(&self, _rid: usize, _symbol: &Symbol) -> i64 {
        i64::MIN
    }

    /// Maximal number of records kept for one entry.
    fn max_record_count(&self, _rid: usize, _symbol: &Symbol) -> usize {
        usize::MAX
    }
}

/// Slab of history buffers addressed by non-zero ids stored in total rows.
#[derive(Debug, Default)]
pub(crate) struct HistoryStore {
    buffers: Vec<Option<HistoryBuffer>>,
    free: Vec<usize>,
}

impl HistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, buffer: HistoryBuffer) -> i64 {
        match self.free.pop() {
            Some(slot) => {
                self.buffers[slot] = Some(buffer);
                slot as i64 + 1
            }
            None => {
                self.buffers.push(Some(buffer));
                self.buffers.len() as i64
            }
        }
    }

    fn slot(id: i64) -> Option<usize> {
        (id > 0).then(|| id as usize - 1)
    }

    pub fn get(&self, id: i64) -> Option<&HistoryBuffer> {
        self.buffers.get(Self::slot(id)?)?.as_ref()
    }

    pub fn get_mut(&mut self, id: i64) -> Option<&mut HistoryBuffer> {
        self.buffers.get_mut(Self::slot(id)?)?.as_mut()
    }

    pub fn remove(&mut self, id: i64) -> Option<HistoryBuffer> {
        let slot = Self::slot(id)?;
        let buffer = self.buffers.get_mut(slot)?.take()?;
        self.free.push(slot);
        Some(buffer)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.buffers.iter().flatten().count()
    }

    /// Total number of records over all buffers.
    pub fn record_count(&self) -> usize {
        self.buffers.iter().flatten().map(HistoryBuffer::size).sum()
    }
}
