// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Symbol interning.
//!
//! [`Mapping`] is a bijection between string symbols and small integer keys
//! drawn cyclically from `[FIRST_KEY, LAST_KEY]`, with a usage counter per
//! key. [`Mapper`] publishes the current mapping through `ArcSwap` so that
//! lookups by symbol or key never take a lock; all mutation happens under
//! the collector's structural lock.
//!
//! # Architecture
//!
//! Two open-addressing tables share one magic multiplier:
//! - `keys/counters/symbols` indexed by hash of the key
//! - `indices` indexed by hash of the symbol, pointing into the first table
//!
//! A slot, once assigned within one mapping instance, is never reassigned;
//! keys whose counter dropped to zero are only collected by a rehash into a
//! fresh instance. Readers of an old instance therefore never observe a
//! slot changing meaning under them.

use super::hashing::{self, MagicSequence};
use crate::error::FatalHandler;
use arc_swap::ArcSwap;
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

/// All interned keys have this bit set.
pub const VALID_KEY: i32 = 0x2000_0000;
/// First key the mapping assigns.
pub const FIRST_KEY: i32 = 0x2000_0002;
/// Last key the mapping assigns before wrapping.
pub const LAST_KEY: i32 = 0x3FFF_FFFF;

/// Java-style polynomial string hash.
fn symbol_hash(symbol: &str) -> u32 {
    symbol
        .bytes()
        .fold(0u32, |h, b| h.wrapping_mul(31).wrapping_add(u32::from(b)))
}

/// One immutable-layout instance of the symbol table.
pub struct Mapping {
    magic: u32,
    shift: u32,
    seq: MagicSequence,
    keys: Box<[AtomicI32]>,
    counters: Box<[AtomicI32]>,
    symbols: Box<[OnceLock<Arc<str>>]>,
    indices: Box<[AtomicU32]>,
    overall_size: AtomicUsize,
    payload_size: AtomicUsize,
    last_assigned_key: AtomicI32,
    max_counter: AtomicI32,
}

impl std::fmt::Debug for Mapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mapping")
            .field("length", &self.keys.len())
            .field("overall_size", &self.overall_size())
            .field("payload_size", &self.payload_size())
            .finish()
    }
}

impl Mapping {
    fn new(capacity: usize, prev_magic: u32, mut seq: MagicSequence, fatal: &FatalHandler) -> Self {
        let magic = seq.next_magic_for(prev_magic, capacity);
        let shift = hashing::get_shift(capacity)
            .unwrap_or_else(|| fatal.fatal(format!("Capacity is too large: {}", capacity)));
        let length = hashing::table_length(shift);
        Self {
            magic,
            shift,
            seq,
            keys: (0..length).map(|_| AtomicI32::new(0)).collect(),
            counters: (0..length).map(|_| AtomicI32::new(0)).collect(),
            symbols: (0..length).map(|_| OnceLock::new()).collect(),
            indices: (0..length).map(|_| AtomicU32::new(0)).collect(),
            overall_size: AtomicUsize::new(0),
            payload_size: AtomicUsize::new(0),
            last_assigned_key: AtomicI32::new(LAST_KEY),
            max_counter: AtomicI32::new(0),
        }
    }

    // ========== Internal ==========

    /// Slot holding `key`, or the empty slot where it would go (0 on miss
    /// when `want_free` is false).
    fn index_of(&self, key: i32, want_free: bool) -> usize {
        let mut index = hashing::home_slot(key as u32, self.magic, self.shift);
        loop {
            let test_key = self.keys[index].load(Ordering::Acquire);
            if test_key == key {
                return index;
            }
            if test_key == 0 {
                if index > 0 {
                    return if want_free { index } else { 0 };
                }
                index = self.keys.len();
            }
            index -= 1;
        }
    }

    /// Position in `indices` for `symbol` (empty position on miss, or 0
    /// when `want_free` is false).
    fn position_of(&self, symbol: &str, want_free: bool) -> usize {
        let mut position = hashing::home_slot(symbol_hash(symbol), self.magic, self.shift);
        loop {
            let test_index = self.indices[position].load(Ordering::Acquire) as usize;
            if test_index == 0 && position != 0 {
                return if want_free { position } else { 0 };
            }
            if test_index != 0 && self.symbols[test_index].get().map(|s| &**s) == Some(symbol) {
                return position;
            }
            if position == 0 {
                position = self.indices.len();
            }
            position -= 1;
        }
    }

    // ========== Read Access - Unsynchronized ==========

    /// Key for `symbol`, or 0 if absent.
    pub fn get_key(&self, symbol: &str) -> i32 {
        let position = self.position_of(symbol, false);
        if position == 0 {
            return 0;
        }
        let index = self.indices[position].load(Ordering::Acquire) as usize;
        self.keys[index].load(Ordering::Acquire)
    }

    /// Symbol for `key`, or `None` if absent.
    pub fn symbol_if_present(&self, key: i32) -> Option<Arc<str>> {
        let index = self.index_of(key, false);
        if index == 0 {
            return None;
        }
        self.symbols[index].get().cloned()
    }

    /// Interned copy of `symbol` if present.
    pub fn interned(&self, symbol: &str) -> Option<Arc<str>> {
        let position = self.position_of(symbol, false);
        if position == 0 {
            return None;
        }
        let index = self.indices[position].load(Ordering::Acquire) as usize;
        self.symbols[index].get().cloned()
    }

    pub fn overall_size(&self) -> usize {
        self.overall_size.load(Ordering::Relaxed)
    }

    pub fn payload_size(&self) -> usize {
        self.payload_size.load(Ordering::Relaxed)
    }

    pub fn counter(&self, key: i32) -> i32 {
        match self.index_of(key, false) {
            0 => 0,
            index => self.counters[index].load(Ordering::Relaxed),
        }
    }

    pub fn max_counter(&self) -> i32 {
        self.max_counter.load(Ordering::Relaxed)
    }

    /// Iterates over `(key, counter, symbol)` of every assigned slot.
    pub fn entries(&self) -> impl Iterator<Item = (i32, i32, Arc<str>)> + '_ {
        (1..self.keys.len()).filter_map(move |index| {
            let key = self.keys[index].load(Ordering::Acquire);
            if key == 0 {
                return None;
            }
            let symbol = self.symbols[index].get()?.clone();
            Some((key, self.counters[index].load(Ordering::Relaxed), symbol))
        })
    }

    // ========== Write Access - Structural Lock ==========

    fn add_key(&self, symbol: &str, fatal: &FatalHandler) -> i32 {
        let position = self.position_of(symbol, true);
        let existing = self.indices[position].load(Ordering::Relaxed) as usize;
        if existing != 0 {
            return self.keys[existing].load(Ordering::Relaxed);
        }
        let mut key = self.last_assigned_key.load(Ordering::Relaxed);
        let index = loop {
            key = if key >= LAST_KEY { FIRST_KEY } else { key + 1 };
            let index = self.index_of(key, true);
            if self.keys[index].load(Ordering::Relaxed) == 0 {
                break index;
            }
        };
        if self.counters[index].load(Ordering::Relaxed) != 0 {
            fatal.fatal(format!("Dirty counter for key={:#x}, symbol={}", key, symbol));
        }
        if self.symbols[index].set(Arc::from(symbol)).is_err() {
            fatal.fatal(format!("Reused symbol slot for key={:#x}", key));
        }
        // key is published after the symbol; position last
        self.keys[index].store(key, Ordering::Release);
        self.indices[position].store(index as u32, Ordering::Release);
        self.overall_size.fetch_add(1, Ordering::Relaxed);
        self.last_assigned_key.store(key, Ordering::Relaxed);
        key
    }

    fn inc_counter(&self, key: i32, fatal: &FatalHandler) {
        let index = self.index_of(key, false);
        if index == 0 {
            fatal.fatal(format!("Unknown key={:#x}", key));
        }
        let old = self.counters[index].fetch_add(1, Ordering::Relaxed);
        if old == 0 {
            let payload = self.payload_size.fetch_add(1, Ordering::Relaxed) + 1;
            if payload > self.overall_size() {
                fatal.fatal(format!("Payload size overflow for key={:#x}", key));
            }
        }
        if old >= self.max_counter() {
            fatal.fatal(format!("Counter overflow for key={:#x}", key));
        }
    }

    fn dec_counter(&self, key: i32, fatal: &FatalHandler) {
        let index = self.index_of(key, false);
        if index == 0 {
            fatal.fatal(format!("Unknown key={:#x}", key));
        }
        let new = self.counters[index].fetch_sub(1, Ordering::Relaxed) - 1;
        if new < 0 {
            fatal.fatal(format!("Counter underflow for key={:#x}", key));
        }
        if new == 0 && self.payload_size.fetch_sub(1, Ordering::Relaxed) == 0 {
            fatal.fatal(format!("Payload size underflow for key={:#x}", key));
        }
    }

    fn need_rehash(&self) -> bool {
        hashing::need_rehash(
            self.shift,
            self.overall_size(),
            self.payload_size(),
            hashing::MAX_SHIFT,
        )
    }

    fn rehash(&self, fatal: &FatalHandler) -> Mapping {
        let dest = Mapping::new(self.payload_size(), self.magic, self.seq, fatal);
        let mut copied = 0;
        for index in (1..self.keys.len()).rev() {
            let counter = self.counters[index].load(Ordering::Relaxed);
            if counter == 0 {
                continue;
            }
            let key = self.keys[index].load(Ordering::Relaxed);
            let Some(symbol) = self.symbols[index].get() else {
                fatal.fatal(format!("Missing symbol for key={:#x}", key));
            };
            let dest_index = dest.index_of(key, true);
            if dest.keys[dest_index].load(Ordering::Relaxed) != 0 {
                fatal.fatal(format!("Repeated key={:#x}, symbol={}", key, symbol));
            }
            let dest_position = dest.position_of(symbol, true);
            if dest.indices[dest_position].load(Ordering::Relaxed) != 0 {
                fatal.fatal(format!("Repeated symbol={}, key={:#x}", symbol, key));
            }
            let _ = dest.symbols[dest_index].set(symbol.clone());
            dest.counters[dest_index].store(counter, Ordering::Relaxed);
            dest.keys[dest_index].store(key, Ordering::Relaxed);
            dest.indices[dest_position].store(dest_index as u32, Ordering::Relaxed);
            copied += 1;
        }
        if copied != self.payload_size() {
            fatal.fatal("Payload integrity corrupted");
        }
        dest.overall_size.store(copied, Ordering::Relaxed);
        dest.payload_size.store(copied, Ordering::Relaxed);
        dest.last_assigned_key.store(
            self.last_assigned_key.load(Ordering::Relaxed),
            Ordering::Relaxed,
        );
        dest.max_counter.store(self.max_counter(), Ordering::Relaxed);
        dest
    }
}

/// Owner of the current [`Mapping`].
pub struct Mapper {
    mapping: ArcSwap<Mapping>,
    fatal: Arc<FatalHandler>,
}

impl std::fmt::Debug for Mapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Mapper").field(&**self.mapping.load()).finish()
    }
}

impl Mapper {
    pub fn new(seed: u32, fatal: Arc<FatalHandler>) -> Self {
        let mapping = Mapping::new(0, 0, MagicSequence::new(seed), &fatal);
        Self {
            mapping: ArcSwap::from_pointee(mapping),
            fatal,
        }
    }

    /// Current mapping; safe to use without any lock.
    pub fn mapping(&self) -> Arc<Mapping> {
        self.mapping.load_full()
    }

    pub fn get_key(&self, symbol: &str) -> i32 {
        self.mapping.load().get_key(symbol)
    }

    /// Symbol for a key that the caller knows to be held.
    pub fn symbol(&self, key: i32) -> Arc<str> {
        match self.mapping.load().symbol_if_present(key) {
            Some(symbol) => symbol,
            None => self.fatal.fatal(format!("Unknown key={:#x}", key)),
        }
    }

    /// Returns key for `symbol`, assigning one if needed. Does not touch
    /// the usage counter. Requires the structural lock.
    pub fn add_key(&self, symbol: &str) -> i32 {
        let mapping = self.mapping.load();
        let key = mapping.get_key(symbol);
        if key != 0 {
            return key;
        }
        if mapping.need_rehash() {
            drop(mapping);
            self.rehash();
        }
        self.mapping.load().add_key(symbol, &self.fatal)
    }

    pub fn inc_counter(&self, key: i32) {
        self.mapping.load().inc_counter(key, &self.fatal);
    }

    pub fn dec_counter(&self, key: i32) {
        self.mapping.load().dec_counter(key, &self.fatal);
    }

    pub fn inc_max_counter(&self, delta: usize) {
        let mapping = self.mapping.load();
        let delta = i32::try_from(delta).unwrap_or(i32::MAX);
        let old = mapping.max_counter.load(Ordering::Relaxed);
        match old.checked_add(delta) {
            Some(value) => mapping.max_counter.store(value, Ordering::Relaxed),
            None => self.fatal.fatal("Maximum counter overflow"),
        }
    }

    pub fn dec_max_counter(&self, delta: usize) {
        let mapping = self.mapping.load();
        let delta = i32::try_from(delta).unwrap_or(i32::MAX);
        let value = mapping.max_counter.load(Ordering::Relaxed) - delta;
        if value < 0 {
            self.fatal.fatal("Maximum counter underflow");
        }
        mapping.max_counter.store(value, Ordering::Relaxed);
        if value == 0 && mapping.payload_size() != 0 {
            self.fatal.fatal("Excess payload");
        }
    }

    /// Drops keys with zero counters when the table is sparse or full.
    pub fn rehash_if_needed(&self) {
        if self.mapping.load().need_rehash() {
            self.rehash();
        }
    }

    fn rehash(&self) {
        let current = self.mapping.load_full();
        let dest = current.rehash(&self.fatal);
        log::trace!(
            "mapping rehash {} -> {} slots, {} keys",
            current.keys.len(),
            dest.keys.len(),
            dest.overall_size()
        );
        self.mapping.store(Arc::new(dest));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FatalPolicy;

    fn mapper() -> Mapper {
        let mapper = Mapper::new(7, Arc::new(FatalHandler::new("mapping", FatalPolicy::Panic)));
        mapper.inc_max_counter(100);
        mapper
    }

    #[test]
    fn test_add_key_is_idempotent() {
        let mapper = mapper();
        let key = mapper.add_key("microsoft");
        assert_ne!(key & VALID_KEY, 0);
        assert_eq!(mapper.add_key("microsoft"), key);
        assert_eq!(mapper.get_key("microsoft"), key);
        assert_eq!(&*mapper.symbol(key), "microsoft");
        assert_eq!(mapper.get_key("absent"), 0);
    }

    #[test]
    fn test_keys_assigned_round_robin() {
        let mapper = mapper();
        let a = mapper.add_key("alpha");
        let b = mapper.add_key("beta");
        assert_eq!(a, FIRST_KEY);
        assert_eq!(b, FIRST_KEY + 1);
    }

    #[test]
    fn test_rehash_collects_unused_keys() {
        let mapper = mapper();
        let mut held = Vec::new();
        for i in 0..200 {
            let key = mapper.add_key(&format!("sym{}", i));
            if i % 2 == 0 {
                mapper.inc_counter(key);
                held.push((key, format!("sym{}", i)));
            }
        }
        mapper.rehash();
        let mapping = mapper.mapping();
        assert_eq!(mapping.payload_size(), held.len());
        assert_eq!(mapping.overall_size(), held.len());
        for (key, symbol) in &held {
            assert_eq!(mapping.get_key(symbol), *key);
            assert_eq!(mapping.counter(*key), 1);
        }
        assert_eq!(mapping.get_key("sym1"), 0);
    }

    #[test]
    fn test_counters_track_payload() {
        let mapper = mapper();
        let key = mapper.add_key("x1");
        mapper.inc_counter(key);
        mapper.inc_counter(key);
        assert_eq!(mapper.mapping().payload_size(), 1);
        mapper.dec_counter(key);
        mapper.dec_counter(key);
        assert_eq!(mapper.mapping().payload_size(), 0);
    }

    #[test]
    fn test_counter_overflow_is_fatal() {
        let mapper = Mapper::new(7, Arc::new(FatalHandler::new("mapping", FatalPolicy::Panic)));
        mapper.inc_max_counter(1);
        let key = mapper.add_key("x1");
        mapper.inc_counter(key);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| mapper.inc_counter(key)));
        assert!(result.is_err());
    }

    #[test]
    fn test_counter_underflow_is_fatal() {
        let mapper = mapper();
        let key = mapper.add_key("x1");
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| mapper.dec_counter(key)));
        assert!(result.is_err());
    }
}
