// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Dual-keyed `(key, rid)` open-addressing table over a flat cell array.
//!
//! Each row occupies `step` consecutive `AtomicI64` cells; cell 0 is the
//! key and cell 1 the record id. Row 0 is the permanent "no entry"
//! sentinel. Removal is deferred: a row stops being payload when its
//! payload field(s) are cleared, but it stays in the probe chain until the
//! next rehash so unlocked readers never lose their way.
//!
//! Mutators take `&self` and rely on the caller holding the structural
//! lock (plus the owning agent's lock for agent tables). Unlocked readers
//! use [`SubMatrix::get_volatile_index`], which observes a key only after
//! every other cell of the row has been written.

use super::hashing::{self, MagicSequence};
use super::mapping::Mapper;
use crate::data::VALID_CIPHER;
use crate::error::FatalHandler;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Key offset in a row.
pub const KEY: usize = 0;
/// Record id offset in a row.
pub const RID: usize = 1;

/// Mixes the record id into the probe seed.
const MAGIC_RID: u32 = 0x5F3A_C769;

/// Which cells decide whether a row is live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadRule {
    /// Row is live as soon as its key is written.
    Key,
    /// Row is live while the field is non-zero.
    Field(usize),
    /// Row is live while either field is non-zero.
    EitherField(usize, usize),
}

#[inline]
fn is_interned(key: i32) -> bool {
    key & VALID_CIPHER == 0
}

/// Flat `(key, rid)` hash table.
pub struct SubMatrix {
    cells: Box<[AtomicI64]>,
    step: usize,
    magic: u32,
    shift: u32,
    max_shift: u32,
    seq: MagicSequence,
    rule: PayloadRule,
    overall_size: AtomicUsize,
    payload_size: AtomicUsize,
    mapper: Option<Arc<Mapper>>,
    fatal: Arc<FatalHandler>,
}

impl std::fmt::Debug for SubMatrix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubMatrix")
            .field("rows", &(self.cells.len() / self.step))
            .field("step", &self.step)
            .field("overall_size", &self.overall_size())
            .field("payload_size", &self.payload_size())
            .finish()
    }
}

impl SubMatrix {
    /// Creates a table for `capacity` rows.
    ///
    /// `mapper = None` disables key reference counting.
    pub fn new(
        mapper: Option<Arc<Mapper>>,
        step: usize,
        rule: PayloadRule,
        capacity: usize,
        prev_magic: u32,
        mut seq: MagicSequence,
        fatal: Arc<FatalHandler>,
    ) -> Self {
        let magic = seq.next_magic_for(prev_magic, capacity);
        let shift = hashing::get_shift(capacity)
            .unwrap_or_else(|| fatal.fatal(format!("Capacity is too large: {}", capacity)));
        let length = hashing::table_length(shift) * step;
        Self {
            cells: (0..length).map(|_| AtomicI64::new(0)).collect(),
            step,
            magic,
            shift,
            max_shift: hashing::MAX_SHIFT,
            seq,
            rule,
            overall_size: AtomicUsize::new(0),
            payload_size: AtomicUsize::new(0),
            mapper,
            fatal,
        }
    }

    #[inline]
    fn home(&self, key: i32, rid: usize) -> usize {
        let seed = (key as u32).wrapping_add((rid as u32).wrapping_mul(MAGIC_RID));
        hashing::home_slot(seed, self.magic, self.shift) * self.step
    }

    fn probe(&self, key: i32, rid: usize, want_free: bool, ordering: Ordering) -> usize {
        let mut index = self.home(key, rid);
        loop {
            let test_key = self.cells[index + KEY].load(ordering) as i32;
            if test_key == key && self.cells[index + RID].load(Ordering::Relaxed) == rid as i64 {
                return index;
            }
            if test_key == 0 {
                if index > 0 {
                    return if want_free { index } else { 0 };
                }
                index = self.cells.len();
            }
            index -= self.step;
        }
    }

    // ========== Read Access ==========

    /// Row of `(key, rid)` or 0. Requires the structural or owner lock.
    #[inline]
    pub fn get_index(&self, key: i32, rid: usize) -> usize {
        self.probe(key, rid, false, Ordering::Relaxed)
    }

    /// Row of `(key, rid)` or 0, safe without any lock.
    #[inline]
    pub fn get_volatile_index(&self, key: i32, rid: usize) -> usize {
        self.probe(key, rid, false, Ordering::Acquire)
    }

    #[inline]
    pub fn get(&self, index: usize, field: usize) -> i64 {
        self.cells[index + field].load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set(&self, index: usize, field: usize, value: i64) {
        self.cells[index + field].store(value, Ordering::Relaxed);
    }

    #[inline]
    pub fn key(&self, index: usize) -> i32 {
        self.cells[index + KEY].load(Ordering::Acquire) as i32
    }

    #[inline]
    pub fn rid(&self, index: usize) -> usize {
        self.cells[index + RID].load(Ordering::Relaxed) as usize
    }

    #[inline]
    pub fn is_payload(&self, index: usize) -> bool {
        match self.rule {
            PayloadRule::Key => self.get(index, KEY) != 0,
            PayloadRule::Field(f) => self.get(index, f) != 0,
            PayloadRule::EitherField(a, b) => self.get(index, a) != 0 || self.get(index, b) != 0,
        }
    }

    /// Whether `index` is a valid row start of this table.
    #[inline]
    pub fn contains_row(&self, index: usize) -> bool {
        index > 0 && index < self.cells.len() && index % self.step == 0
    }

    pub fn step(&self) -> usize {
        self.step
    }

    pub fn len_cells(&self) -> usize {
        self.cells.len()
    }

    pub fn overall_size(&self) -> usize {
        self.overall_size.load(Ordering::Relaxed)
    }

    pub fn payload_size(&self) -> usize {
        self.payload_size.load(Ordering::Relaxed)
    }

    pub fn magic(&self) -> u32 {
        self.magic
    }

    /// Row starts from the top of the table down to (excluding) row 0.
    pub fn rows(&self) -> impl Iterator<Item = usize> {
        let step = self.step;
        (1..self.cells.len() / step).rev().map(move |row| row * step)
    }

    // ========== Write Access ==========

    /// Finds or reserves the row for `(key, rid)` without publishing the
    /// key. Returns the row; new rows have their key cell still zero.
    pub fn add_index_begin(&self, key: i32, rid: usize) -> usize {
        let index = self.probe(key, rid, true, Ordering::Relaxed);
        if self.get(index, KEY) != 0 {
            return index;
        }
        if is_interned(key) {
            if let Some(mapper) = &self.mapper {
                mapper.inc_counter(key);
            }
        }
        self.overall_size.fetch_add(1, Ordering::Relaxed);
        if self.rule == PayloadRule::Key {
            self.update_added_payload();
        }
        self.set(index, RID, rid as i64);
        index
    }

    /// Publishes the key of a row reserved by [`SubMatrix::add_index_begin`].
    pub fn add_index_complete(&self, index: usize, key: i32) {
        if self.get(index, KEY) != 0 {
            return;
        }
        self.cells[index + KEY].store(i64::from(key), Ordering::Release);
    }

    pub fn add_index(&self, key: i32, rid: usize) -> usize {
        let index = self.add_index_begin(key, rid);
        self.add_index_complete(index, key);
        index
    }

    pub fn update_added_payload(&self) {
        let payload = self.payload_size.fetch_add(1, Ordering::Relaxed) + 1;
        if payload > self.overall_size() {
            self.fatal.fatal("Payload size overflow");
        }
    }

    pub fn update_removed_payload(&self) {
        if self.payload_size.fetch_sub(1, Ordering::Relaxed) == 0 {
            self.fatal.fatal("Payload size underflow");
        }
    }

    // ========== Maintenance ==========

    pub fn need_rehash(&self) -> bool {
        hashing::need_rehash(
            self.shift,
            self.overall_size(),
            self.payload_size(),
            self.max_shift,
        )
    }

    /// Copies live rows into a freshly sized table and releases keys of
    /// the discarded ones. The source stays intact for concurrent readers.
    pub fn rehash(&self) -> SubMatrix {
        let dest = SubMatrix::new(
            self.mapper.clone(),
            self.step,
            self.rule,
            self.payload_size(),
            self.magic,
            self.seq,
            self.fatal.clone(),
        );
        self.rehash_into(&dest);
        dest
    }

    fn rehash_into(&self, dest: &SubMatrix) {
        if self.overall_size() == 0 {
            return;
        }
        dest.overall_size.store(self.payload_size(), Ordering::Relaxed);
        for index in self.rows() {
            let key = self.get(index, KEY) as i32;
            if key == 0 {
                continue;
            }
            if self.is_payload(index) {
                let rid = self.rid(index);
                let dest_index = dest.probe(key, rid, true, Ordering::Relaxed);
                if dest.get(dest_index, KEY) != 0 {
                    self.fatal.fatal(format!("Repeated key detected: {:#x} rid {}", key, rid));
                }
                for field in (RID..self.step).rev() {
                    dest.set(dest_index, field, self.get(index, field));
                }
                dest.cells[dest_index + KEY].store(i64::from(key), Ordering::Release);
                dest.update_added_payload();
            } else if is_interned(key) {
                if let Some(mapper) = &self.mapper {
                    mapper.dec_counter(key);
                }
            }
        }
        if dest.payload_size() != self.payload_size() {
            self.fatal.fatal("Payload integrity corrupted");
        }
    }

    /// Releases every interned key held by this table.
    pub fn close(&self) {
        let Some(mapper) = &self.mapper else {
            return;
        };
        for index in self.rows() {
            let key = self.get(index, KEY) as i32;
            if key != 0 && is_interned(key) {
                mapper.dec_counter(key);
            }
        }
    }
}
