// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Open-addressing sizing rules and multiplicative hash magic numbers.
//!
//! Tables have `1 << (32 - shift)` slots and compute the home slot of a
//! key as `(key * magic) >> shift` (32-bit wrapping arithmetic). Probing
//! walks downward and wraps at the end; slot 0 is never used.

/// Overall occupancy above this (scaled by `>> shift`) requires growth.
pub const THRESHOLD_UP: u32 = ((1u64 << 32) * 2 / 3) as u32;
/// Live payload below this (scaled by `>> shift`) allows shrinking.
pub const THRESHOLD_DOWN: u32 = ((1u64 << 32) * 2 / 9) as u32;
/// Allocation target: fill factor at creation lies in [5/18, 5/9].
pub const THRESHOLD_ALLOC_UP: u32 = ((1u64 << 32) * 5 / 9) as u32;
/// Largest shift, i.e. smallest table of 8 slots.
pub const MAX_SHIFT: u32 = 29;

/// Seed-driving multiplier of the magic generator.
const MAGIC: u32 = 0xB463_94CD;

/// Returns `shift` for a table that must hold `capacity` entries.
///
/// Returns `None` when the capacity cannot be represented.
pub fn get_shift(capacity: usize) -> Option<u32> {
    let mut shift = MAX_SHIFT;
    while ((THRESHOLD_ALLOC_UP >> shift) as usize) < capacity && shift > 1 {
        shift -= 1;
    }
    if shift <= 1 {
        None
    } else {
        Some(shift)
    }
}

/// Number of slots for a given shift.
#[inline]
pub fn table_length(shift: u32) -> usize {
    1usize << (32 - shift)
}

/// Whether a table with the given counters must be rehashed.
#[inline]
pub fn need_rehash(shift: u32, overall_size: usize, payload_size: usize, max_shift: u32) -> bool {
    overall_size > (THRESHOLD_UP >> shift) as usize
        || (payload_size < (THRESHOLD_DOWN >> shift) as usize && shift < max_shift)
}

/// Home slot of `hash` in a table of the given parameters.
#[inline]
pub fn home_slot(hash: u32, magic: u32, shift: u32) -> usize {
    (hash.wrapping_mul(magic) >> shift) as usize
}

/// Pseudo-random sequence of magic multipliers.
///
/// Each table owns one and hands its continuation to the table it is
/// rehashed into, so no process-wide state is involved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MagicSequence {
    seed: u32,
}

impl MagicSequence {
    /// Starts a sequence; a zero seed is replaced by a time-derived one.
    pub fn new(seed: u32) -> Self {
        let seed = if seed != 0 {
            seed
        } else {
            let nanos = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64)
                .unwrap_or(0x9E37_79B9);
            ((nanos >> 32) as u32) ^ (nanos as u32) | 1
        };
        Self { seed }
    }

    /// Generates next magic with good bit distribution that differs from
    /// `prev_magic` in every 8-bit window.
    pub fn next_magic(&mut self, prev_magic: u32) -> u32 {
        self.seed = self.seed.wrapping_mul(MAGIC).wrapping_add(1);
        let mut magic = self.seed | 1;
        // no run of four equal bits; top two bits differ
        let mut i: i32 = 30;
        while i >= 0 {
            let bits = (magic >> i) & 0x0F;
            if bits == 0 || bits == 0x0F {
                magic ^= 1 << i;
                i -= 2;
            }
            i -= 1;
        }
        if magic & 1 == 0 {
            magic ^= 3;
        }
        let mut i: i32 = 24;
        while i >= 0 {
            if ((magic ^ prev_magic) >> i) & 0xFF == 0 {
                magic ^= ((magic ^ (magic << 1)) & (4 << i)) ^ (2 << i);
                i -= 6;
            }
            i -= 1;
        }
        magic
    }

    /// Picks the best of several candidates; larger tables check more.
    pub fn next_magic_for(&mut self, prev_magic: u32, capacity: usize) -> u32 {
        let mut magic = self.next_magic(prev_magic);
        if capacity < 32 {
            return magic;
        }
        let mut eval = evaluate_continued_fraction(magic);
        let attempts = 30 - (capacity.min(u32::MAX as usize) as u32).leading_zeros();
        for _ in 0..attempts {
            let m = self.next_magic(prev_magic);
            let e = evaluate_continued_fraction(m);
            if e > eval {
                magic = m;
                eval = e;
            }
        }
        magic
    }
}

/// Quality of `magic` as the minimal normalized distance from
/// `magic / 2^32` to its continued-fraction approximations.
pub fn evaluate_continued_fraction(magic: u32) -> f64 {
    let x = f64::from(magic) / (1u64 << 32) as f64;
    let mut rem = x;
    let (mut p2, mut q2, mut p1, mut q1) = (1i64, 0i64, 0i64, 1i64);
    let mut grade = x;
    for _ in 0..20 {
        rem = 1.0 / rem;
        let a = rem as i64;
        rem -= a as f64;
        let p = a * p1 + p2;
        let q = a * q1 + q2;
        p2 = p1;
        q2 = q1;
        p1 = p;
        q1 = q;
        grade = grade.min((x * q as f64 - p as f64).abs() * q as f64);
        if grade < 1e-6 || rem < 1e-6 || q > (1 << 20) {
            break;
        }
    }
    grade
}
