// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Consumers of a collector.
//!
//! An [`Agent`] owns its subscription table, an output buffer and (for
//! history collectors) a queue of entries with snapshot data still to pull
//! from shared storage. All of it is guarded by the agent lock; the
//! collector mutates it under the structural lock plus the agent lock.
//!
//! Lifecycle: `Active -> Closing -> Closed`. Closing releases the
//! subscription in bounded steps, helped along by any thread doing
//! subscription work on the same collector.

pub mod buffer;
pub(crate) mod queue;

pub use buffer::{AgentBuffer, BufferedRecord, OverflowStrategy};

use crate::collector::notify::{NotifyFlags, RecordListener};
use crate::collector::{CollectorInner, SubscriptionCursor};
use crate::data::{RecordEvent, RecordSink, Symbol};
use crate::error::{Error, Result};
use crate::matrix::SubMatrix;
use arc_swap::ArcSwap;
use parking_lot::{Condvar, Mutex, RwLock};
use queue::SnapshotQueue;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

pub(crate) const ACTIVE: u8 = 0;
pub(crate) const CLOSING: u8 = 1;
pub(crate) const CLOSED: u8 = 2;

/// Agent state guarded by the agent lock.
#[derive(Debug)]
pub(crate) struct AgentLocal {
    pub buffer: AgentBuffer,
    pub queue: SnapshotQueue,
    /// Snapshot batch allowance left for the queue head.
    pub snapshot_rem: usize,
    /// Balance between snapshot and update retrieval.
    pub snapshot_credit: usize,
    pub retrieved: u64,
    /// Rows at cells below this value are still to be checked by the
    /// removal phase of a subscription replacement; 0 when idle.
    pub setter_cleanup: usize,
    /// Same for closing.
    pub close_cursor: usize,
    /// Subscription shrank during the current operation.
    pub reduced_sub: bool,
    /// Bits already reported to listeners since the last full retrieve.
    pub notified: NotifyFlags,
}

pub(crate) struct AgentInner {
    pub number: usize,
    pub use_history_snapshot: bool,
    pub sub: ArcSwap<SubMatrix>,
    pub local: Mutex<AgentLocal>,
    /// Signalled when a blocked buffer drains or the agent closes.
    pub drained: Condvar,
    state: AtomicU8,
    sub_mod_count: AtomicU64,
    listener: RwLock<Option<Arc<dyn RecordListener>>>,
    snapshot_listener: RwLock<Option<Arc<dyn RecordListener>>>,
}

impl AgentInner {
    pub fn new(number: usize, use_history_snapshot: bool, sub: SubMatrix, buffer: AgentBuffer) -> Self {
        Self {
            number,
            use_history_snapshot,
            sub: ArcSwap::from_pointee(sub),
            local: Mutex::new(AgentLocal {
                buffer,
                queue: SnapshotQueue::new(),
                snapshot_rem: 0,
                snapshot_credit: 0,
                retrieved: 0,
                setter_cleanup: 0,
                close_cursor: 0,
                reduced_sub: false,
                notified: NotifyFlags::empty(),
            }),
            drained: Condvar::new(),
            state: AtomicU8::new(ACTIVE),
            sub_mod_count: AtomicU64::new(0),
            listener: RwLock::new(None),
            snapshot_listener: RwLock::new(None),
        }
    }

    pub fn state(&self) -> u8 {
        self.state.load(Ordering::Acquire)
    }

    pub fn set_state(&self, state: u8) {
        self.state.store(state, Ordering::Release);
    }

    pub fn is_active(&self) -> bool {
        self.state() == ACTIVE
    }

    pub fn is_closed(&self) -> bool {
        self.state() == CLOSED
    }

    /// Generation of the subscription table, bumped by every change.
    pub fn sub_mod_count(&self) -> u64 {
        self.sub_mod_count.load(Ordering::Acquire)
    }

    pub fn bump_sub_mod_count(&self) {
        self.sub_mod_count.fetch_add(1, Ordering::AcqRel);
    }

    pub fn listener(&self) -> Option<Arc<dyn RecordListener>> {
        self.listener.read().clone()
    }

    pub fn snapshot_listener(&self) -> Option<Arc<dyn RecordListener>> {
        self.snapshot_listener.read().clone()
    }

    pub fn clear_listeners(&self) {
        *self.listener.write() = None;
        *self.snapshot_listener.write() = None;
    }
}

impl std::fmt::Debug for AgentInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("number", &self.number)
            .field("state", &self.state())
            .finish()
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Builder for an [`Agent`], obtained from
/// [`Collector::agent_builder`](crate::Collector::agent_builder).
pub struct AgentBuilder {
    collector: Arc<CollectorInner>,
    use_history_snapshot: bool,
    max_buffer_size: usize,
    strategy: OverflowStrategy,
}

impl AgentBuilder {
    pub(crate) fn new(collector: Arc<CollectorInner>) -> Self {
        let max_buffer_size = collector.config.agent_buffer_size;
        Self {
            collector,
            use_history_snapshot: true,
            max_buffer_size,
            strategy: OverflowStrategy::default(),
        }
    }

    /// Deliver history with snapshot and transaction flags (default).
    /// Without it the agent receives plain updates and explicit removals.
    #[must_use]
    pub fn history_snapshot(mut self, enabled: bool) -> Self {
        self.use_history_snapshot = enabled;
        self
    }

    #[must_use]
    pub fn max_buffer_size(mut self, size: usize) -> Self {
        self.max_buffer_size = size;
        self
    }

    #[must_use]
    pub fn overflow_strategy(mut self, strategy: OverflowStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn build(self) -> Result<Agent> {
        if self.max_buffer_size == 0 {
            return Err(Error::InvalidConfig("max_buffer_size must be positive".into()));
        }
        let inner = self.collector.create_agent(
            self.use_history_snapshot,
            self.max_buffer_size,
            self.strategy,
        );
        Ok(Agent {
            inner,
            collector: self.collector,
        })
    }
}

// ============================================================================
// Public handle
// ============================================================================

/// Handle of one consumer. Cheap to clone; closing any clone closes the
/// agent.
#[derive(Clone)]
pub struct Agent {
    pub(crate) inner: Arc<AgentInner>,
    pub(crate) collector: Arc<CollectorInner>,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(&*self.inner, f)
    }
}

impl Agent {
    /// Agent number, unique among live agents of the collector.
    pub fn number(&self) -> usize {
        self.inner.number
    }

    pub fn uses_history_snapshot(&self) -> bool {
        self.inner.use_history_snapshot
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Installs the listener called when records become available.
    /// Fires right away if records are already waiting.
    pub fn set_record_listener(&self, listener: impl RecordListener + 'static) {
        *self.inner.listener.write() = Some(Arc::new(listener));
        self.collector.renotify_agent(&self.inner);
    }

    /// Listener for snapshot availability; without it snapshot
    /// notifications go to the record listener.
    pub fn set_snapshot_listener(&self, listener: impl RecordListener + 'static) {
        *self.inner.snapshot_listener.write() = Some(Arc::new(listener));
        self.collector.renotify_agent(&self.inner);
    }

    pub fn clear_listeners(&self) {
        self.inner.clear_listeners();
    }

    // ========== Buffer ==========

    pub fn max_buffer_size(&self) -> usize {
        self.inner.local.lock().buffer.max_size()
    }

    pub fn set_max_buffer_size(&self, size: usize) -> Result<()> {
        if size == 0 {
            return Err(Error::InvalidConfig("max_buffer_size must be positive".into()));
        }
        let mut local = self.inner.local.lock();
        local.buffer.set_max_size(size);
        local.buffer.drop_old_records();
        Ok(())
    }

    pub fn overflow_strategy(&self) -> OverflowStrategy {
        self.inner.local.lock().buffer.strategy()
    }

    /// Switching away from [`OverflowStrategy::Block`] releases a blocked
    /// distribution.
    pub fn set_overflow_strategy(&self, strategy: OverflowStrategy) {
        let mut local = self.inner.local.lock();
        local.buffer.set_strategy(strategy);
        if strategy != OverflowStrategy::Block && local.buffer.is_blocked() {
            local.buffer.clear_blocked();
            self.inner.drained.notify_all();
        }
        local.buffer.drop_old_records();
    }

    /// Records dropped by the overflow strategy since creation.
    pub fn dropped_records(&self) -> u64 {
        self.inner.local.lock().buffer.total_dropped()
    }

    /// Records waiting in the local buffer.
    pub fn buffered_records(&self) -> usize {
        self.inner.local.lock().buffer.len()
    }

    /// Records retrieved since creation.
    pub fn retrieved_records(&self) -> u64 {
        self.inner.local.lock().retrieved
    }

    // ========== Subscription ==========

    /// Adds entries one step budget at a time. Call again with the
    /// returned flags while they contain [`NotifyFlags::HAS_MORE`].
    /// Entries flagged [`EventFlags::REMOVE_SYMBOL`](crate::EventFlags::REMOVE_SYMBOL)
    /// are removed instead.
    pub fn add_subscription_part(&self, cursor: &mut SubscriptionCursor<'_>, notify: NotifyFlags) -> Result<NotifyFlags> {
        self.collector.add_subscription_part(&self.inner, cursor, notify)
    }

    pub fn remove_subscription_part(&self, cursor: &mut SubscriptionCursor<'_>, notify: NotifyFlags) -> Result<NotifyFlags> {
        self.collector.remove_subscription_part(&self.inner, cursor, notify)
    }

    /// Replaces the subscription: adds every entry, then removes whatever
    /// was held before and is not in `cursor`.
    pub fn set_subscription_part(&self, cursor: &mut SubscriptionCursor<'_>, notify: NotifyFlags) -> Result<NotifyFlags> {
        self.collector.set_subscription_part(&self.inner, cursor, notify)
    }

    pub fn add_subscription(&self, entries: &[RecordEvent]) -> Result<NotifyFlags> {
        let mut cursor = SubscriptionCursor::new(entries);
        drive(|notify| self.add_subscription_part(&mut cursor, notify))
    }

    pub fn remove_subscription(&self, entries: &[RecordEvent]) -> Result<NotifyFlags> {
        let mut cursor = SubscriptionCursor::new(entries);
        drive(|notify| self.remove_subscription_part(&mut cursor, notify))
    }

    pub fn set_subscription(&self, entries: &[RecordEvent]) -> Result<NotifyFlags> {
        let mut cursor = SubscriptionCursor::new(entries);
        drive(|notify| self.set_subscription_part(&mut cursor, notify))
    }

    /// Performs one budget of closing work.
    pub fn close_part(&self, notify: NotifyFlags) -> NotifyFlags {
        self.collector.close_part(&self.inner, notify)
    }

    /// Closes the agent, releasing its subscription and buffer.
    pub fn close(&self) {
        let mut notify = NotifyFlags::empty();
        loop {
            notify = self.close_part(notify);
            if !notify.has_more() {
                break;
            }
        }
    }

    /// Whether the agent is subscribed to `symbol` of `rid` at `time`.
    /// Lock-free; concurrent changes may or may not be seen.
    pub fn is_subscribed(&self, rid: usize, symbol: &Symbol, time: i64) -> bool {
        self.collector.is_subscribed_agent(&self.inner, rid, symbol, time)
    }

    /// Approximate number of subscribed entries.
    pub fn subscription_size(&self) -> usize {
        self.inner.sub.load().payload_size()
    }

    /// Appends subscribed entries to `sink`; returns `true` if the sink
    /// ran out of capacity. Weakly consistent.
    pub fn examine_subscription(&self, sink: &mut dyn RecordSink) -> bool {
        self.collector.examine_agent_subscription(&self.inner, sink)
    }

    // ========== Retrieval ==========

    /// Moves available records into `sink` while it has capacity.
    /// Returns `true` if records remain.
    pub fn retrieve(&self, sink: &mut dyn RecordSink) -> bool {
        self.collector.retrieve(&self.inner, sink)
    }

    /// Resets buffer positions to their base right away.
    pub fn force_rebase(&self) {
        self.collector.force_rebase(&self.inner);
    }
}

/// Repeats a resumable call until it reports no more work.
fn drive(mut part: impl FnMut(NotifyFlags) -> Result<NotifyFlags>) -> Result<NotifyFlags> {
    let mut notify = NotifyFlags::empty();
    let mut seen = NotifyFlags::empty();
    loop {
        notify = part(notify)?;
        seen |= notify;
        if !notify.has_more() {
            return Ok(seen.without(NotifyFlags::HAS_MORE | NotifyFlags::PHASE2));
        }
    }
}
