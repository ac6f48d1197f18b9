// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The collector: aggregated ("total") subscription, agents and the
//! two-phase distribution of incoming records.
//!
//! # Architecture
//!
//! ```text
//!  Distributor::process(events)
//!        |
//!        v
//!  phase 1  (structural lock)   total row --> agent rows (chain) --> Distribution
//!        |                      history: mutate storage, stamp rows
//!        v
//!  phase 2  (agent locks)       Distribution --> agent buffers / snapshot queues
//!        |
//!        v
//!  listeners (no lock)          RecordListener::records_available
//! ```
//!
//! The total table holds one row per subscribed `(key, rid)`; its
//! `NEXT_AGENT`/`NEXT_INDEX` cells start a chain through the rows of every
//! subscribed agent. Tables and the symbol mapping are published through
//! `ArcSwap`, so lookups never take a lock.

mod examine;
mod history;
pub(crate) mod layout;
mod lock;
pub mod notify;
mod sticky;
mod stream;
mod subscription;

pub use notify::{ErrorHandler, LogErrorHandler, NotifyFlags, RecordListener, SubscriptionListener};
pub use subscription::SubscriptionCursor;

use crate::agent::{Agent, AgentBuffer, AgentBuilder, AgentInner, AgentLocal, OverflowStrategy};
use crate::config::{CollectorConfig, MIN_AGENT_NUMBER, TOTAL_AGENT_NUMBER};
use crate::data::{DataScheme, EventFlags, RecordEvent, RecordSink, Symbol, VALID_CIPHER};
use crate::distribution::{Distribution, Source, VersionGuard};
use crate::distribution::ProcessVersionTracker;
use crate::error::{Error, FatalHandler, Result};
use crate::history::{HistoryStore, HistorySubscriptionFilter};
use crate::matrix::{MagicSequence, Mapper, SubMatrix};
use arc_swap::ArcSwap;
use layout::*;
use lock::StructuralLock;
use parking_lot::{Mutex, RwLock};
use sticky::StickyWheel;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// Kind of data a collector keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Contract {
    /// Every update is delivered; nothing is stored.
    Stream,
    /// Time-ordered storage per entry with snapshot delivery.
    History,
}

// ============================================================================
// Counters
// ============================================================================

#[derive(Debug, Default)]
pub(crate) struct Counters {
    incoming: AtomicU64,
    outgoing: AtomicU64,
    retrieved: AtomicU64,
    dropped: AtomicU64,
    spins: AtomicU64,
}

impl Counters {
    pub fn add_outgoing(&self, n: u64) {
        self.outgoing.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_retrieved(&self, n: u64) {
        self.retrieved.fetch_add(n, Ordering::Relaxed);
    }
}

/// Snapshot of collector activity counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectorCounters {
    /// Records submitted to `process`.
    pub incoming_records: u64,
    /// Records appended to agent buffers.
    pub outgoing_records: u64,
    /// Records handed to agent sinks, snapshot data included.
    pub retrieved_records: u64,
    /// Records lost to buffer overflow.
    pub dropped_records: u64,
    /// Phase-2 rounds over pending agents.
    pub distribution_spins: u64,
}

// ============================================================================
// Builder
// ============================================================================

/// Builder for a [`Collector`].
pub struct CollectorBuilder {
    scheme: DataScheme,
    contract: Contract,
    config: CollectorConfig,
    filter: Option<Arc<dyn HistorySubscriptionFilter>>,
    error_handler: Arc<dyn ErrorHandler>,
}

impl CollectorBuilder {
    pub fn new(scheme: DataScheme, contract: Contract) -> Self {
        Self {
            scheme,
            contract,
            config: CollectorConfig::default(),
            filter: None,
            error_handler: Arc::new(LogErrorHandler),
        }
    }

    #[must_use]
    pub fn config(mut self, config: CollectorConfig) -> Self {
        self.config = config;
        self
    }

    /// Only used by history collectors.
    #[must_use]
    pub fn history_filter(mut self, filter: impl HistorySubscriptionFilter + 'static) -> Self {
        self.filter = Some(Arc::new(filter));
        self
    }

    #[must_use]
    pub fn error_handler(mut self, handler: impl ErrorHandler + 'static) -> Self {
        self.error_handler = Arc::new(handler);
        self
    }

    pub fn build(self) -> Result<Collector> {
        self.config.validate()?;
        let config = self.config;
        let scheme = self.scheme;
        let flag_records = |names: &[String], all_if_empty: bool| -> Result<Vec<bool>> {
            let mut flags = vec![all_if_empty && names.is_empty(); scheme.record_count()];
            for name in names {
                flags[scheme.rid(name)?] = true;
            }
            Ok(flags)
        };
        let store_everything = if config.store_everything {
            flag_records(&config.store_everything_records, true)?
        } else {
            vec![false; scheme.record_count()]
        };
        let unconflated = flag_records(&config.unconflated_records, false)?;

        let fatal = Arc::new(FatalHandler::new("collector", config.fatal_policy));
        let mapper = Arc::new(Mapper::new(config.hash_seed, fatal.clone()));
        mapper.inc_max_counter(scheme.record_count());
        let mut seq = MagicSequence::new(config.hash_seed);
        let total = SubMatrix::new(
            Some(mapper.clone()),
            TOTAL_STEP,
            TOTAL_RULE,
            0,
            0,
            MagicSequence::new(seq.next_magic(0)),
            fatal.clone(),
        );
        let core = Core {
            agents: Vec::new(),
            closing: VecDeque::new(),
            histories: HistoryStore::new(),
            distributors: Vec::new(),
            sticky: StickyWheel::new(config.sticky_period()),
            seq,
            steps: 0,
            notify: NotifyFlags::empty(),
            next_state_check: Instant::now() + config.state_keep_time(),
        };
        log::debug!(
            "[collector] {:?} collector created for {} records",
            self.contract,
            scheme.record_count()
        );
        let inner = CollectorInner {
            contract: self.contract,
            fatal,
            mapper,
            total: ArcSwap::from_pointee(total),
            core: StructuralLock::new(core, config.lock_wait_log_threshold(), config.priority_lock_spins),
            versions: ProcessVersionTracker::new(),
            counters: Counters::default(),
            error_handler: self.error_handler,
            filter: self.filter,
            store_everything,
            unconflated,
            scheme,
            config,
        };
        Ok(Collector {
            inner: Arc::new(inner),
        })
    }
}

// ============================================================================
// Shared state
// ============================================================================

/// State guarded by the structural lock.
pub(crate) struct Core {
    /// Agents by number; slots 0 and 1 stay empty.
    pub agents: Vec<Option<Arc<AgentInner>>>,
    pub closing: VecDeque<Arc<AgentInner>>,
    pub histories: HistoryStore,
    pub distributors: Vec<Weak<DistributorShared>>,
    pub sticky: StickyWheel,
    pub seq: MagicSequence,
    /// Step budget of the running subscription operation.
    pub steps: usize,
    /// Bits accumulated by the running operation.
    pub notify: NotifyFlags,
    /// Next scan for kept history entries past their keep time.
    pub next_state_check: Instant,
}

impl Core {
    pub fn agent(&self, number: usize, fatal: &FatalHandler) -> &Arc<AgentInner> {
        match self.agents.get(number).and_then(Option::as_ref) {
            Some(agent) => agent,
            None => fatal.fatal(format!("Agent #{} is missing from the chain", number)),
        }
    }

    /// Starts a subscription operation with `steps` of budget.
    pub fn start_batch(&mut self, steps: usize, notify: NotifyFlags) {
        self.steps = steps;
        self.notify = notify.without(NotifyFlags::HAS_MORE);
    }

    pub fn done_batch(&mut self) -> NotifyFlags {
        self.notify
    }
}

pub(crate) struct CollectorInner {
    pub scheme: DataScheme,
    pub contract: Contract,
    pub config: CollectorConfig,
    pub fatal: Arc<FatalHandler>,
    pub mapper: Arc<Mapper>,
    pub total: ArcSwap<SubMatrix>,
    pub core: StructuralLock<Core>,
    pub versions: ProcessVersionTracker,
    pub counters: Counters,
    pub error_handler: Arc<dyn ErrorHandler>,
    pub filter: Option<Arc<dyn HistorySubscriptionFilter>>,
    store_everything: Vec<bool>,
    unconflated: Vec<bool>,
}

impl CollectorInner {
    pub fn is_history(&self) -> bool {
        self.contract == Contract::History
    }

    pub fn should_store_everything(&self, rid: usize) -> bool {
        self.store_everything.get(rid).copied().unwrap_or(false)
    }

    pub fn is_unconflated(&self, rid: usize) -> bool {
        self.unconflated.get(rid).copied().unwrap_or(false)
    }

    // ========== Symbols ==========

    fn check_symbol(symbol: &Symbol) -> Result<()> {
        match symbol {
            Symbol::Cipher(c) if c & VALID_CIPHER == 0 => Err(Error::ReservedCipher(*c)),
            _ => Ok(()),
        }
    }

    /// Key of `symbol` without interning it; 0 if it was never interned.
    pub fn lookup_key(&self, symbol: &Symbol) -> i32 {
        match symbol {
            Symbol::Cipher(c) => *c,
            Symbol::Text(s) => match self.scheme.codec().encode(s) {
                0 => self.mapper.get_key(s),
                cipher => cipher,
            },
        }
    }

    /// Key of `symbol`, interning it. Requires the structural lock.
    pub fn add_key(&self, symbol: &Symbol) -> i32 {
        match self.lookup_key(symbol) {
            0 => match symbol {
                Symbol::Text(s) => self.mapper.add_key(s),
                Symbol::Cipher(c) => *c,
            },
            key => key,
        }
    }

    /// Symbol of a key held by a table. Requires the structural lock.
    pub fn symbol_of(&self, key: i32) -> Symbol {
        if key & VALID_CIPHER != 0 {
            Symbol::Cipher(key)
        } else {
            Symbol::Text(self.mapper.symbol(key))
        }
    }

    /// Lock-free variant of [`CollectorInner::symbol_of`].
    pub fn try_symbol_of(&self, key: i32) -> Option<Symbol> {
        if key & VALID_CIPHER != 0 {
            Some(Symbol::Cipher(key))
        } else {
            self.mapper.mapping().symbol_if_present(key).map(Symbol::Text)
        }
    }

    // ========== Validation ==========

    /// Checks subscription entries before anything is mutated.
    pub fn validate_subscription(&self, entries: &[RecordEvent]) -> Result<()> {
        for entry in entries {
            let record = self.scheme.record(entry.rid)?;
            Self::check_symbol(&entry.symbol)?;
            if self.is_history() && !record.has_time() {
                return Err(Error::RecordWithoutTime(record.name().to_string()));
            }
        }
        Ok(())
    }

    fn validate_data(&self, events: &[RecordEvent]) -> Result<()> {
        for event in events {
            self.scheme.record(event.rid)?;
            Self::check_symbol(&event.symbol)?;
            if self.is_history() && event.time == i64::MAX && !event.is_remove() {
                return Err(Error::InvalidTime(event.time));
            }
        }
        Ok(())
    }

    // ========== Agents ==========

    pub fn create_agent(&self, use_history_snapshot: bool, max_buffer_size: usize, strategy: OverflowStrategy) -> Arc<AgentInner> {
        let mut core = self.core.lock("create_agent");
        let number = (MIN_AGENT_NUMBER..)
            .find(|&n| core.agents.get(n).map_or(true, Option::is_none))
            .unwrap_or(MIN_AGENT_NUMBER);
        self.mapper.inc_max_counter(self.scheme.record_count());
        let step = if self.is_history() { HISTORY_STEP } else { STREAM_STEP };
        let seed = core.seq.next_magic(0);
        let sub = SubMatrix::new(
            Some(self.mapper.clone()),
            step,
            AGENT_RULE,
            0,
            0,
            MagicSequence::new(seed),
            self.fatal.clone(),
        );
        let mut buffer = AgentBuffer::new(max_buffer_size, self.config.rebase_threshold);
        buffer.set_strategy(strategy);
        let agent = Arc::new(AgentInner::new(
            number,
            use_history_snapshot && self.is_history(),
            sub,
            buffer,
        ));
        if core.agents.len() <= number {
            core.agents.resize(number + 1, None);
        }
        core.agents[number] = Some(agent.clone());
        log::debug!("[collector] agent #{} created", number);
        agent
    }

    // ========== Notifications ==========

    fn notification_bits(&self, local: &AgentLocal) -> NotifyFlags {
        if !local.queue.is_empty() {
            NotifyFlags::SNAPSHOT_AVAILABLE | NotifyFlags::DATA_AVAILABLE
        } else if local.buffer.has_next() {
            NotifyFlags::DATA_AVAILABLE
        } else {
            NotifyFlags::empty()
        }
    }

    /// Bits not yet reported since the last complete retrieve.
    fn take_new_notifications(&self, local: &mut AgentLocal, force: bool) -> NotifyFlags {
        let bits = self.notification_bits(local);
        let new = if force { bits } else { bits.without(local.notified) };
        local.notified |= new;
        new
    }

    /// Reports available records to the agent listener. Takes the agent
    /// lock; call with no lock held.
    pub fn notify_agent(self: &Arc<Self>, agent: &Arc<AgentInner>) {
        let new = self.take_new_notifications(&mut agent.local.lock(), false);
        self.fire_agent(agent, new);
    }

    /// Like [`CollectorInner::notify_agent`] but reports everything
    /// available, used when a listener is installed.
    pub fn renotify_agent(self: &Arc<Self>, agent: &Arc<AgentInner>) {
        if agent.is_closed() {
            return;
        }
        let new = self.take_new_notifications(&mut agent.local.lock(), true);
        self.fire_agent(agent, new);
    }

    fn fire_agent(self: &Arc<Self>, agent: &Arc<AgentInner>, new: NotifyFlags) {
        if new.is_empty() || !agent.is_active() {
            return;
        }
        let listener = if new.contains(NotifyFlags::SNAPSHOT_AVAILABLE) {
            agent.snapshot_listener().or_else(|| agent.listener())
        } else {
            agent.listener()
        };
        let Some(listener) = listener else {
            return;
        };
        let handle = Agent {
            inner: agent.clone(),
            collector: self.clone(),
        };
        notify::guarded(&*self.error_handler, "records_available", || {
            listener.records_available(&handle)
        });
    }

    /// Distributors with unreported subscription changes. Requires the
    /// structural lock; listeners are fired after it is released.
    pub fn take_pending_distributors(&self, core: &mut Core) -> Vec<Arc<DistributorShared>> {
        core.distributors.retain(|d| d.strong_count() > 0);
        core.distributors
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|d| d.pending_notify.swap(false, Ordering::AcqRel))
            .collect()
    }

    pub fn fire_distributors(self: &Arc<Self>, pending: Vec<Arc<DistributorShared>>) {
        for shared in pending {
            let listener = shared.listener.read().clone();
            if let Some(listener) = listener {
                let handle = Distributor {
                    shared: shared.clone(),
                    collector: self.clone(),
                };
                notify::guarded(&*self.error_handler, "subscription_available", || {
                    listener.subscription_available(&handle)
                });
            }
        }
    }

    /// Records a total entry that appeared (or lowered its time).
    pub fn distributors_added(&self, core: &mut Core, key: i32, rid: usize, time: i64) {
        let symbol = self.symbol_of(key);
        for shared in core.distributors.iter().filter_map(Weak::upgrade) {
            let mut changes = shared.changes.lock();
            changes.removed.remove(&(symbol.clone(), rid));
            changes.added.insert((symbol.clone(), rid), time);
            shared.pending_notify.store(true, Ordering::Release);
        }
        core.notify |= NotifyFlags::TOTAL_ADDED;
    }

    pub fn distributors_removed(&self, core: &mut Core, key: i32, rid: usize) {
        let symbol = self.symbol_of(key);
        for shared in core.distributors.iter().filter_map(Weak::upgrade) {
            let mut changes = shared.changes.lock();
            changes.added.remove(&(symbol.clone(), rid));
            changes.removed.insert((symbol.clone(), rid));
            shared.pending_notify.store(true, Ordering::Release);
        }
        core.notify |= NotifyFlags::TOTAL_REMOVED;
    }

    // ========== Distribution ==========

    pub fn process(self: &Arc<Self>, events: &[RecordEvent]) -> Result<()> {
        self.validate_data(events)?;
        self.counters
            .incoming
            .fetch_add(events.len() as u64, Ordering::Relaxed);
        let mut position = 0;
        while position < events.len() {
            let guard = VersionGuard::new(&self.versions);
            let mut dist = Distribution::new(self.config.distribution_bucket, guard.version());
            {
                let mut core = self.core.lock_priority("process");
                position = match self.contract {
                    Contract::Stream => self.stream_phase1(&mut core, events, position, &mut dist),
                    Contract::History => self.history_phase1(&mut core, events, position, &mut dist),
                };
            }
            if !dist.is_empty() {
                self.distribute(events, &mut dist);
            }
        }
        Ok(())
    }

    /// Phase 2: feeds every agent of `dist` under its own lock. Busy
    /// agents are retried in later rounds; blocked agents are waited for.
    fn distribute(self: &Arc<Self>, events: &[RecordEvent], dist: &mut Distribution) {
        let max_spins = self.config.max_distribution_spins.max(1);
        let log_interval = self.config.buffer_overflow_log_interval();
        loop {
            let mut round = 0;
            loop {
                let pending = dist.take_pending();
                if pending.is_empty() {
                    break;
                }
                let remaining = max_spins.saturating_sub(round).max(1);
                let ignorable = pending.len() * (remaining - 1) / remaining;
                let mut skipped = 0;
                for slot in pending {
                    let agent = dist.slot(slot).agent.clone();
                    let mut local = if skipped < ignorable {
                        match agent.local.try_lock() {
                            Some(local) => local,
                            None => {
                                skipped += 1;
                                dist.retry(slot);
                                continue;
                            }
                        }
                    } else {
                        agent.local.lock()
                    };
                    if !agent.is_active() {
                        continue;
                    }
                    let dropped_before = local.buffer.total_dropped();
                    let blocked = match self.contract {
                        Contract::Stream => self.stream_update(dist, events, slot, &agent, &mut local),
                        Contract::History => self.history_update(dist, events, slot, &agent, &mut local),
                    };
                    let dropped = local.buffer.total_dropped() - dropped_before;
                    if dropped > 0 {
                        self.counters.dropped.fetch_add(dropped, Ordering::Relaxed);
                    }
                    if let Some((count, last)) = local.buffer.take_drop_report(log_interval) {
                        let last = last
                            .map(|(rid, symbol)| {
                                format!(
                                    "{}:{}",
                                    self.scheme.record(rid).map(|r| r.name()).unwrap_or("?"),
                                    self.scheme.decode_symbol(&symbol)
                                )
                            })
                            .unwrap_or_default();
                        log::error!(
                            "[agent #{}] dropped {} records on buffer overflow, last {}",
                            agent.number,
                            count,
                            last
                        );
                    }
                    if let Some(index) = blocked {
                        dist.block(slot, index);
                    }
                    let new = self.take_new_notifications(&mut local, false);
                    drop(local);
                    self.fire_agent(&agent, new);
                }
                round += 1;
                self.counters.spins.fetch_add(1, Ordering::Relaxed);
            }
            if !dist.has_blocked() {
                break;
            }
            for agent in dist.blocked_agents() {
                let mut local = agent.local.lock();
                while local.buffer.is_blocked() && agent.is_active() {
                    agent
                        .drained
                        .wait_for(&mut local, Duration::from_millis(100));
                }
            }
            dist.enqueue_blocked();
        }
    }

    pub fn source_event<'a>(events: &'a [RecordEvent], dist: &'a Distribution, source: Source) -> &'a RecordEvent {
        match source {
            Source::Event(i) => &events[i],
            Source::Removed(i) => dist.removed(i),
        }
    }

    // ========== Retrieval ==========

    pub fn retrieve(self: &Arc<Self>, agent: &Arc<AgentInner>, sink: &mut dyn RecordSink) -> bool {
        if !agent.is_active() {
            return false;
        }
        let more = match self.contract {
            Contract::Stream => self.stream_retrieve(agent, sink),
            Contract::History => self.history_retrieve(agent, sink),
        };
        sink.flush();
        more
    }

    pub fn force_rebase(self: &Arc<Self>, agent: &Arc<AgentInner>) {
        match self.contract {
            Contract::Stream => self.stream_force_rebase(agent),
            Contract::History => self.history_force_rebase(agent),
        }
    }

    // ========== Queries ==========

    pub fn is_subscribed_agent(&self, agent: &AgentInner, rid: usize, symbol: &Symbol, time: i64) -> bool {
        let key = self.lookup_key(symbol);
        if key == 0 {
            return false;
        }
        let sub = agent.sub.load();
        let index = sub.get_volatile_index(key, rid);
        index != 0
            && sub.get(index, PREV_AGENT) != 0
            && (!self.is_history() || time >= sub.get(index, TIME_SUB))
    }

    fn is_subscribed_total(&self, rid: usize, symbol: &Symbol, time: i64) -> bool {
        let key = self.lookup_key(symbol);
        if key == 0 {
            return false;
        }
        let tsub = self.total.load();
        let index = tsub.get_volatile_index(key, rid);
        index != 0
            && tsub.get(index, NEXT_AGENT) > 0
            && (!self.is_history() || time >= tsub.get(index, TIME_TOTAL))
    }

    pub fn examine_agent_subscription(&self, agent: &AgentInner, sink: &mut dyn RecordSink) -> bool {
        let sub = agent.sub.load_full();
        for index in sub.rows() {
            if sub.get(index, PREV_AGENT) == 0 {
                continue;
            }
            let time = if self.is_history() { sub.get(index, TIME_SUB) } else { 0 };
            if self.examine_row(&sub, index, time, sink) {
                return true;
            }
        }
        sink.flush();
        false
    }

    fn examine_total_subscription(&self, sink: &mut dyn RecordSink) -> bool {
        let tsub = self.total.load_full();
        for index in tsub.rows() {
            if tsub.get(index, NEXT_AGENT) <= 0 {
                continue;
            }
            let time = if self.is_history() { tsub.get(index, TIME_TOTAL) } else { 0 };
            if self.examine_row(&tsub, index, time, sink) {
                return true;
            }
        }
        sink.flush();
        false
    }

    fn examine_row(&self, sub: &SubMatrix, index: usize, time: i64, sink: &mut dyn RecordSink) -> bool {
        let key = sub.key(index);
        if key == 0 {
            return false;
        }
        let Some(symbol) = self.try_symbol_of(key) else {
            return false;
        };
        if !sink.has_capacity() {
            sink.flush();
            return true;
        }
        sink.append(RecordEvent::subscription(sub.rid(index), symbol, time));
        false
    }

    // ========== Diagnostics ==========

    /// Checks chain integrity, payload counts and history time marks.
    fn verify(&self) -> Vec<String> {
        let core = self.core.lock("verify");
        let mut problems = Vec::new();
        let tsub = self.total.load_full();
        let mut links = vec![0usize; core.agents.len()];
        let mut payload = 0;
        for tindex in tsub.rows() {
            if !tsub.is_payload(tindex) {
                continue;
            }
            payload += 1;
            let key = tsub.key(tindex);
            let rid = tsub.rid(tindex);
            let mut prev = TOTAL_AGENT_NUMBER;
            let mut nagent = tsub.get(tindex, NEXT_AGENT);
            let mut nindex = tsub.get(tindex, NEXT_INDEX) as usize;
            let mut min_time = i64::MAX;
            while nagent > 0 {
                let number = nagent as usize;
                let Some(agent) = core.agents.get(number).and_then(Option::as_ref) else {
                    problems.push(format!("{:#x}/{}: chain refers to missing agent #{}", key, rid, number));
                    break;
                };
                let asub = agent.sub.load_full();
                if !asub.contains_row(nindex) || asub.key(nindex) != key || asub.rid(nindex) != rid {
                    problems.push(format!("{:#x}/{}: agent #{} row {} does not match", key, rid, number, nindex));
                    break;
                }
                if asub.get(nindex, PREV_AGENT) != prev as i64 {
                    problems.push(format!("{:#x}/{}: agent #{} has wrong previous agent", key, rid, number));
                }
                if self.is_history() {
                    min_time = min_time.min(asub.get(nindex, TIME_SUB));
                }
                links[number] += 1;
                prev = number;
                nagent = asub.get(nindex, NEXT_AGENT);
                nindex = asub.get(nindex, NEXT_INDEX) as usize;
            }
            if self.is_history() {
                if tsub.get(tindex, NEXT_AGENT) > 0 && tsub.get(tindex, TIME_TOTAL) != min_time {
                    problems.push(format!("{:#x}/{}: total time is not the minimal subscription time", key, rid));
                }
                if let Some(hb) = core.histories.get(tsub.get(tindex, HISTORY_ID)) {
                    if !hb.valid_times() {
                        problems.push(format!("{:#x}/{}: history time marks are inconsistent", key, rid));
                    }
                }
            }
        }
        if payload != tsub.payload_size() {
            problems.push(format!("total payload size {} != {} rows", tsub.payload_size(), payload));
        }
        for agent in core.agents.iter().flatten() {
            let asub = agent.sub.load_full();
            let rows = asub.rows().filter(|&i| asub.is_payload(i)).count();
            if rows != asub.payload_size() {
                problems.push(format!("agent #{} payload size {} != {} rows", agent.number, asub.payload_size(), rows));
            }
            if agent.is_active() && rows != links[agent.number] {
                problems.push(format!("agent #{} has {} rows but {} chain links", agent.number, rows, links[agent.number]));
            }
            if self.is_history() {
                let queued = agent.local.lock().queue.entries(&asub);
                if queued.len() > asub.len_cells() / asub.step() {
                    problems.push(format!("agent #{} snapshot queue does not terminate", agent.number));
                } else if let Some((_, rid)) = queued.iter().find(|(key, _)| *key == 0) {
                    problems.push(format!("agent #{} snapshot queue links an empty row of record {}", agent.number, rid));
                }
            }
        }
        let mapping = self.mapper.mapping();
        if mapping.payload_size() > mapping.overall_size() {
            problems.push("mapping payload exceeds its size".to_string());
        }
        problems
    }
}

// ============================================================================
// Public handles
// ============================================================================

/// Handle of a collector. Cheap to clone.
#[derive(Clone)]
pub struct Collector {
    inner: Arc<CollectorInner>,
}

impl std::fmt::Debug for Collector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collector")
            .field("contract", &self.inner.contract)
            .field("total", &**self.inner.total.load())
            .finish()
    }
}

impl Collector {
    pub fn builder(scheme: DataScheme, contract: Contract) -> CollectorBuilder {
        CollectorBuilder::new(scheme, contract)
    }

    /// Collector with default configuration.
    pub fn new(scheme: DataScheme, contract: Contract) -> Result<Self> {
        CollectorBuilder::new(scheme, contract).build()
    }

    pub fn contract(&self) -> Contract {
        self.inner.contract
    }

    pub fn scheme(&self) -> &DataScheme {
        &self.inner.scheme
    }

    pub fn config(&self) -> &CollectorConfig {
        &self.inner.config
    }

    pub fn agent_builder(&self) -> AgentBuilder {
        AgentBuilder::new(self.inner.clone())
    }

    /// Agent with default options.
    pub fn create_agent(&self) -> Result<Agent> {
        self.agent_builder().build()
    }

    /// Creates a distributor. Its added-subscription set starts with the
    /// current total subscription.
    pub fn distributor(&self) -> Distributor {
        let shared = Arc::new(DistributorShared {
            changes: Mutex::new(SubscriptionChanges::default()),
            listener: RwLock::new(None),
            pending_notify: AtomicBool::new(false),
        });
        {
            let mut core = self.inner.core.lock("distributor");
            let tsub = self.inner.total.load_full();
            let mut changes = shared.changes.lock();
            for index in tsub.rows() {
                let subscribed = tsub.get(index, NEXT_AGENT) > 0
                    || (tsub.get(index, NEXT_AGENT) == KEPT && tsub.get(index, STICKY_STAMP) != 0);
                if !subscribed {
                    continue;
                }
                let time = if self.inner.is_history() { tsub.get(index, TIME_TOTAL) } else { 0 };
                let symbol = self.inner.symbol_of(tsub.key(index));
                changes.added.insert((symbol, tsub.rid(index)), time);
            }
            drop(changes);
            core.distributors.push(Arc::downgrade(&shared));
        }
        Distributor {
            shared,
            collector: self.inner.clone(),
        }
    }

    /// Whether any agent subscribes to `symbol` of `rid` at `time`.
    /// Lock-free.
    pub fn is_subscribed(&self, rid: usize, symbol: &Symbol, time: i64) -> bool {
        self.inner.is_subscribed_total(rid, symbol, time)
    }

    /// Number of total entries with at least one subscribed agent.
    /// Weakly consistent.
    pub fn subscription_size(&self) -> usize {
        let tsub = self.inner.total.load_full();
        tsub.rows().filter(|&i| tsub.get(i, NEXT_AGENT) > 0).count()
    }

    /// Appends the total subscription to `sink`; returns `true` if the
    /// sink ran out of capacity. Weakly consistent.
    pub fn examine_subscription(&self, sink: &mut dyn RecordSink) -> bool {
        self.inner.examine_total_subscription(sink)
    }

    pub fn counters(&self) -> CollectorCounters {
        let c = &self.inner.counters;
        CollectorCounters {
            incoming_records: c.incoming.load(Ordering::Relaxed),
            outgoing_records: c.outgoing.load(Ordering::Relaxed),
            retrieved_records: c.retrieved.load(Ordering::Relaxed),
            dropped_records: c.dropped.load(Ordering::Relaxed),
            distribution_spins: c.spins.load(Ordering::Relaxed),
        }
    }

    /// Lists internal inconsistencies; empty when everything is sound.
    pub fn verify(&self) -> Vec<String> {
        self.inner.verify()
    }

    /// Releases sticky entries whose period has passed.
    pub fn expire_sticky_subscriptions(&self) {
        let pending = {
            let mut core = self.inner.core.lock("expire_sticky");
            self.inner.expire_sticky(&mut core);
            self.inner.take_pending_distributors(&mut core)
        };
        self.inner.fire_distributors(pending);
    }

    /// Changes the sticky period; zero releases every sticky entry.
    pub fn set_sticky_period(&self, period: Duration) {
        let pending = {
            let mut core = self.inner.core.lock("set_sticky_period");
            self.inner.set_sticky_period(&mut core, period);
            self.inner.take_pending_distributors(&mut core)
        };
        self.inner.fire_distributors(pending);
    }

    pub fn sticky_period(&self) -> Duration {
        self.inner.core.lock("sticky_period").sticky.period()
    }

    // ========== History queries ==========

    /// Time of the oldest stored record, 0 when nothing is stored.
    pub fn min_available_time(&self, rid: usize, symbol: &Symbol) -> Result<i64> {
        self.inner.with_history(rid, symbol, "min_time", |hb| hb.min_available_time(), 0)
    }

    /// Time of the newest stored record, 0 when nothing is stored.
    pub fn max_available_time(&self, rid: usize, symbol: &Symbol) -> Result<i64> {
        self.inner.with_history(rid, symbol, "max_time", |hb| hb.max_available_time(), 0)
    }

    /// Number of stored records with time between `start` and `end`
    /// inclusive, in either order.
    pub fn available_count(&self, rid: usize, symbol: &Symbol, start: i64, end: i64) -> Result<usize> {
        self.inner
            .with_history(rid, symbol, "available_count", |hb| hb.available_count(start, end), 0)
    }

    /// Appends stored records between `start` and `end` to `sink`; the
    /// direction follows the bounds. Returns `true` if the sink ran out
    /// of capacity.
    pub fn examine_data(&self, rid: usize, symbol: &Symbol, start: i64, end: i64, sink: &mut dyn RecordSink) -> Result<bool> {
        self.inner.examine_data(rid, symbol, start, end, sink)
    }

    /// Appends every stored snapshot with snapshot flags.
    pub fn examine_all_data(&self, sink: &mut dyn RecordSink) -> Result<bool> {
        self.inner.examine_all_data(sink)
    }

    /// Appends the stored snapshots of `entries`, each down to its time.
    pub fn examine_data_by_subscription(&self, entries: &[RecordEvent], sink: &mut dyn RecordSink) -> Result<bool> {
        self.inner.examine_data_by_subscription(entries, sink)
    }

    /// Drops stored records of `entries`; storage of subscribed entries
    /// starts over with the next record.
    pub fn remove(&self, entries: &[RecordEvent]) -> Result<()> {
        self.inner.remove_data(entries)
    }

    /// Number of stored records over all entries.
    pub fn stored_records(&self) -> usize {
        self.inner.core.lock("stored_records").histories.record_count()
    }
}

// ============================================================================
// Distributors
// ============================================================================

#[derive(Debug, Default)]
pub(crate) struct SubscriptionChanges {
    added: HashMap<(Symbol, usize), i64>,
    removed: HashSet<(Symbol, usize)>,
}

pub(crate) struct DistributorShared {
    changes: Mutex<SubscriptionChanges>,
    listener: RwLock<Option<Arc<dyn SubscriptionListener>>>,
    pending_notify: AtomicBool,
}

/// Producer handle: submits records and learns which entries are wanted.
#[derive(Clone)]
pub struct Distributor {
    shared: Arc<DistributorShared>,
    collector: Arc<CollectorInner>,
}

impl std::fmt::Debug for Distributor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let changes = self.shared.changes.lock();
        f.debug_struct("Distributor")
            .field("added", &changes.added.len())
            .field("removed", &changes.removed.len())
            .finish()
    }
}

impl Distributor {
    /// Distributes `events` to subscribed agents.
    pub fn process(&self, events: &[RecordEvent]) -> Result<()> {
        self.collector.process(events)
    }

    /// Installs the listener notified when subscription changes appear.
    /// Fires right away if changes are pending.
    pub fn set_subscription_listener(&self, listener: impl SubscriptionListener + 'static) {
        *self.shared.listener.write() = Some(Arc::new(listener));
        if self.has_changes() {
            self.collector.fire_distributors(vec![self.shared.clone()]);
        }
    }

    pub fn has_changes(&self) -> bool {
        let changes = self.shared.changes.lock();
        !changes.added.is_empty() || !changes.removed.is_empty()
    }

    /// Moves added entries (with their lower time bound) into `sink`.
    /// Returns `true` if more remain.
    pub fn retrieve_added_subscription(&self, sink: &mut dyn RecordSink) -> bool {
        let mut changes = self.shared.changes.lock();
        let keys: Vec<(Symbol, usize)> = changes.added.keys().cloned().collect();
        for key in keys {
            if !sink.has_capacity() {
                break;
            }
            if let Some(time) = changes.added.remove(&key) {
                let (symbol, rid) = key;
                sink.append(RecordEvent::subscription(rid, symbol, time));
            }
        }
        sink.flush();
        !changes.added.is_empty()
    }

    /// Moves removed entries into `sink`. Returns `true` if more remain.
    pub fn retrieve_removed_subscription(&self, sink: &mut dyn RecordSink) -> bool {
        let mut changes = self.shared.changes.lock();
        let keys: Vec<(Symbol, usize)> = changes.removed.iter().cloned().collect();
        for key in keys {
            if !sink.has_capacity() {
                break;
            }
            changes.removed.remove(&key);
            let (symbol, rid) = key;
            sink.append(
                RecordEvent::subscription(rid, symbol, 0).with_flags(EventFlags::REMOVE_SYMBOL),
            );
        }
        sink.flush();
        !changes.removed.is_empty()
    }
}
