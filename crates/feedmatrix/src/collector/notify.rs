// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Notification bits, listener traits and the error handler they report to.

use crate::agent::Agent;
use crate::collector::Distributor;
use crate::error::{Error, Result};
use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};
use std::panic::{catch_unwind, AssertUnwindSafe};

/// Result bits of subscription and distribution calls.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct NotifyFlags(u32);

impl NotifyFlags {
    /// A total entry appeared; distributors have something to retrieve.
    pub const TOTAL_ADDED: Self = Self(0x01);
    /// A total entry went away.
    pub const TOTAL_REMOVED: Self = Self(0x02);
    /// History snapshot data became available to an agent.
    pub const SNAPSHOT_AVAILABLE: Self = Self(0x04);
    /// Records became available to an agent.
    pub const DATA_AVAILABLE: Self = Self(0x08);
    /// The call stopped on its step budget; call again with these flags.
    pub const HAS_MORE: Self = Self(0x10);
    /// Internal: subscription replacement is in its removal phase.
    pub(crate) const PHASE2: Self = Self(0x20);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn bits(self) -> u32 {
        self.0
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

    #[must_use]
    pub const fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    pub fn has_more(self) -> bool {
        self.contains(Self::HAS_MORE)
    }
}

impl BitOr for NotifyFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for NotifyFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for NotifyFlags {
    type Output = Self;
    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl fmt::Debug for NotifyFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(NotifyFlags, &str); 6] = [
            (NotifyFlags::TOTAL_ADDED, "TOTAL_ADDED"),
            (NotifyFlags::TOTAL_REMOVED, "TOTAL_REMOVED"),
            (NotifyFlags::SNAPSHOT_AVAILABLE, "SNAPSHOT_AVAILABLE"),
            (NotifyFlags::DATA_AVAILABLE, "DATA_AVAILABLE"),
            (NotifyFlags::HAS_MORE, "HAS_MORE"),
            (NotifyFlags::PHASE2, "PHASE2"),
        ];
        let names: Vec<&str> = NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        if names.is_empty() {
            f.write_str("0")
        } else {
            f.write_str(&names.join("|"))
        }
    }
}

// ============================================================================
// Listeners
// ============================================================================

/// Invoked with no lock held when records become available to an agent.
pub trait RecordListener: Send + Sync {
    fn records_available(&self, agent: &Agent) -> Result<()>;
}

impl<F> RecordListener for F
where
    F: Fn(&Agent) -> Result<()> + Send + Sync,
{
    fn records_available(&self, agent: &Agent) -> Result<()> {
        self(agent)
    }
}

/// Invoked with no lock held when a distributor's subscription changed.
pub trait SubscriptionListener: Send + Sync {
    fn subscription_available(&self, distributor: &Distributor) -> Result<()>;
}

impl<F> SubscriptionListener for F
where
    F: Fn(&Distributor) -> Result<()> + Send + Sync,
{
    fn subscription_available(&self, distributor: &Distributor) -> Result<()> {
        self(distributor)
    }
}

/// Receives listener failures; never interrupts the notifying batch.
pub trait ErrorHandler: Send + Sync {
    fn handle(&self, context: &str, error: &Error);
}

/// Default handler: logs the failure.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogErrorHandler;

impl ErrorHandler for LogErrorHandler {
    fn handle(&self, context: &str, error: &Error) {
        log::error!("[{}] {}", context, error);
    }
}

/// Runs a listener callback, turning errors and panics into handler calls.
pub(crate) fn guarded(handler: &dyn ErrorHandler, context: &str, call: impl FnOnce() -> Result<()>) {
    match catch_unwind(AssertUnwindSafe(call)) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => handler.handle(context, &e),
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "listener panicked".to_string());
            handler.handle(context, &Error::Listener(message));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    impl ErrorHandler for Recorder {
        fn handle(&self, context: &str, error: &Error) {
            self.0.lock().push(format!("{}: {}", context, error));
        }
    }

    #[test]
    fn test_flags_debug() {
        let flags = NotifyFlags::TOTAL_ADDED | NotifyFlags::HAS_MORE;
        assert_eq!(format!("{:?}", flags), "TOTAL_ADDED|HAS_MORE");
        assert_eq!(format!("{:?}", NotifyFlags::empty()), "0");
        assert!(flags.has_more());
        assert!(!flags.without(NotifyFlags::HAS_MORE).has_more());
    }

    #[test]
    fn test_guarded_routes_errors_and_panics() {
        let recorder = Arc::new(Recorder::default());
        guarded(&*recorder, "ok", || Ok(()));
        guarded(&*recorder, "err", || Err(Error::Listener("boom".into())));
        guarded(&*recorder, "panic", || panic!("kaput"));
        let seen = recorder.0.lock().clone();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], "err: Listener failed: boom");
        assert_eq!(seen[1], "panic: Listener failed: kaput");
    }
}
