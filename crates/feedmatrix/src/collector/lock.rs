// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Structural lock of a collector.
//!
//! A plain `parking_lot` mutex that remembers which operation took it
//! last, so long waits can be logged with the (advisory) holder. Priority
//! acquisition spins with exponential backoff before parking, which lets
//! distribution overtake queued subscription work.

use crossbeam::utils::Backoff;
use parking_lot::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

pub(crate) struct StructuralLock<T> {
    data: Mutex<T>,
    holder: Mutex<&'static str>,
    wait_threshold: Duration,
    priority_spins: u32,
}

impl<T> StructuralLock<T> {
    pub fn new(data: T, wait_threshold: Duration, priority_spins: u32) -> Self {
        Self {
            data: Mutex::new(data),
            holder: Mutex::new("none"),
            wait_threshold,
            priority_spins,
        }
    }

    pub fn lock(&self, op: &'static str) -> MutexGuard<'_, T> {
        if let Some(guard) = self.data.try_lock() {
            self.mark(op);
            return guard;
        }
        self.lock_slow(op)
    }

    /// Spins for a bounded number of attempts before parking.
    pub fn lock_priority(&self, op: &'static str) -> MutexGuard<'_, T> {
        let backoff = Backoff::new();
        for _ in 0..self.priority_spins {
            if let Some(guard) = self.data.try_lock() {
                self.mark(op);
                return guard;
            }
            if backoff.is_completed() {
                break;
            }
            backoff.snooze();
        }
        self.lock_slow(op)
    }

    pub fn last_holder(&self) -> &'static str {
        *self.holder.lock()
    }

    fn mark(&self, op: &'static str) {
        *self.holder.lock() = op;
    }

    fn lock_slow(&self, op: &'static str) -> MutexGuard<'_, T> {
        if self.wait_threshold.is_zero() {
            let guard = self.data.lock();
            self.mark(op);
            return guard;
        }
        let start = Instant::now();
        loop {
            if let Some(guard) = self.data.try_lock_for(self.wait_threshold) {
                let waited = start.elapsed();
                if waited >= self.wait_threshold {
                    log::warn!("[lock] {} acquired structural lock after {:?}", op, waited);
                }
                self.mark(op);
                return guard;
            }
            log::warn!(
                "[lock] {} waits for structural lock for {:?}, last holder: {}",
                op,
                start.elapsed(),
                self.last_holder()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_records_holder() {
        let lock = StructuralLock::new(0u32, Duration::from_millis(50), 8);
        {
            let mut guard = lock.lock("subscribe");
            *guard += 1;
        }
        assert_eq!(lock.last_holder(), "subscribe");
        *lock.lock_priority("process") += 1;
        assert_eq!(lock.last_holder(), "process");
        assert_eq!(*lock.lock("check"), 2);
    }

    #[test]
    fn test_contended_wait_completes() {
        let lock = Arc::new(StructuralLock::new(Vec::new(), Duration::from_millis(5), 4));
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let lock = lock.clone();
                thread::spawn(move || {
                    for j in 0..100 {
                        let mut guard = if j % 2 == 0 {
                            lock.lock("even")
                        } else {
                            lock.lock_priority("odd")
                        };
                        guard.push(i * 1000 + j);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("worker");
        }
        assert_eq!(lock.lock("count").len(), 400);
    }
}
