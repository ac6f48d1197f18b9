// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! History contract: records are stored per entry and every agent gets a
//! consistent snapshot followed by updates.
//!
//! Phase 1 updates storage and decides which agents see which change.
//! Phase 2 applies those decisions to agent buffers, tracking for each
//! agent row how far down its snapshot has been delivered (`TIME_KNOWN`)
//! and whether an open transaction must be flagged (`TX_DIRTY`). Snapshot
//! delivery itself happens on retrieve, driven by the snapshot queue.

use super::layout::*;
use super::{CollectorInner, Core};
use crate::agent::queue::SnapshotQueue;
use crate::agent::{AgentInner, AgentLocal};
use crate::data::{EventFlags, RecordEvent, RecordSink};
use crate::distribution::{DistFlags, Distribution, Source};
use crate::history::{EntryRef, HistoryBuffer, RetrieveFlags, RetrieveRange};
use crate::matrix::SubMatrix;
use std::sync::Arc;

/// Outcome of one incoming record on storage.
struct StorageUpdate {
    flags: DistFlags,
    prev_snapshot_time: i64,
    ever_snapshot: bool,
}

/// Storage parameters of one entry.
struct StoragePolicy {
    time_total: i64,
    store_everything: bool,
    unconflated: bool,
    max_record_count: Option<usize>,
}

enum RetrieveStatus {
    Nothing,
    Snapshot,
    Update,
}

impl CollectorInner {
    // ========== Phase 1 ==========

    /// Stores each event and walks the chain of its total row. Returns the
    /// position of the first event left for the next pass.
    pub(super) fn history_phase1(&self, core: &mut Core, events: &[RecordEvent], start: usize, dist: &mut Distribution) -> usize {
        let mut position = start;
        let mut snip_removed = Vec::new();
        let mut sweep_removed = Vec::new();
        while position < events.len() && dist.has_capacity() {
            let event = &events[position];
            let source = Source::Event(position);
            position += 1;
            if !self.scheme.record(event.rid).map_or(false, |r| r.has_time()) {
                continue;
            }
            let store_everything = self.should_store_everything(event.rid);
            let Some(tindex) = self.history_total_row(core, event, store_everything) else {
                continue;
            };
            let tsub = self.total.load_full();
            let hid = self.history_buffer_id(core, &tsub, tindex);
            let policy = StoragePolicy {
                time_total: tsub.get(tindex, TIME_TOTAL),
                store_everything,
                unconflated: self.is_unconflated(event.rid),
                max_record_count: self
                    .filter
                    .as_ref()
                    .map(|f| f.max_record_count(event.rid, &event.symbol)),
            };
            snip_removed.clear();
            sweep_removed.clear();
            let Some(hb) = core.histories.get_mut(hid) else {
                self.fatal.fatal(format!("History buffer #{} is missing", hid));
            };
            let Some(update) = Self::update_storage(hb, event, &policy, &mut snip_removed, &mut sweep_removed) else {
                continue;
            };

            let sweep: Vec<(i64, Source)> = sweep_removed
                .iter()
                .map(|&t| (t, dist.push_removed(Self::removed_event(event, t))))
                .collect();
            let snip: Vec<(i64, Source)> = snip_removed
                .iter()
                .map(|&t| (t, dist.push_removed(Self::removed_event(event, t))))
                .collect();

            let mut terminate = false;
            let mut nagent = tsub.get(tindex, NEXT_AGENT);
            let mut nindex = tsub.get(tindex, NEXT_INDEX) as usize;
            while nagent > 0 {
                let agent = core.agent(nagent as usize, &self.fatal).clone();
                let asub = agent.sub.load_full();
                if self.distribute_to_agent(dist, &agent, &asub, nindex, event, source, &update, &sweep, &snip) {
                    terminate = true;
                }
                nagent = asub.get(nindex, NEXT_AGENT);
                nindex = asub.get(nindex, NEXT_INDEX) as usize;
            }
            if terminate {
                break;
            }
        }
        position
    }

    /// Total row that owns storage for `event`, created for entries stored
    /// regardless of subscription.
    fn history_total_row(&self, core: &mut Core, event: &RecordEvent, store_everything: bool) -> Option<usize> {
        if !store_everything {
            let key = self.lookup_key(&event.symbol);
            if key == 0 {
                return None;
            }
            let tsub = self.total.load();
            let tindex = tsub.get_index(key, event.rid);
            if tindex == 0 {
                return None;
            }
            let nagent = tsub.get(tindex, NEXT_AGENT);
            let kept_sticky = nagent == KEPT && tsub.get(tindex, STICKY_STAMP) != 0;
            return (nagent > 0 || kept_sticky).then_some(tindex);
        }
        let key = self.add_key(&event.symbol);
        let tsub = self.total.load_full();
        let tindex = tsub.get_index(key, event.rid);
        if tindex != 0 && tsub.get(tindex, NEXT_AGENT) != 0 {
            return Some(tindex);
        }
        self.rehash_total_if_needed(core);
        let tsub = self.total.load_full();
        let tindex = tsub.add_index_begin(key, event.rid);
        if tsub.get(tindex, NEXT_AGENT) == 0 {
            tsub.set(tindex, NEXT_AGENT, KEPT);
            tsub.set(tindex, TIME_TOTAL, i64::MAX);
            tsub.set(tindex, STICKY_STAMP, 0);
            tsub.add_index_complete(tindex, key);
            tsub.update_added_payload();
        }
        Some(tindex)
    }

    /// Applies `event` to storage. `None` when nothing observable changed.
    fn update_storage(
        hb: &mut HistoryBuffer,
        event: &RecordEvent,
        policy: &StoragePolicy,
        snip_removed: &mut Vec<i64>,
        sweep_removed: &mut Vec<i64>,
    ) -> Option<StorageUpdate> {
        let time = event.time;
        let incoming = event.flags;
        let mut flags = DistFlags::empty();

        if incoming.intersects(EventFlags::SNAPSHOT_BEGIN | EventFlags::SNAPSHOT_MODE) {
            if hb.enter_snapshot_mode_first_time() {
                flags |= DistFlags::SEND_SNAPSHOT;
            } else if policy.unconflated {
                hb.enter_snapshot_mode_for_unconflated();
                flags |= DistFlags::SEND_SNAPSHOT;
            }
        }
        if hb.update_explicit_tx(incoming.contains(EventFlags::TX_PENDING)) {
            flags |= DistFlags::TX_END;
        }
        if incoming.contains(EventFlags::SNAPSHOT_BEGIN) {
            hb.snapshot_begin();
        }
        let snip = incoming.contains(EventFlags::SNAPSHOT_SNIP);
        if snip && hb.snapshot_snip_and_remove(time, snip_removed) {
            flags |= DistFlags::UPDATED_SNIP;
        }

        let trim_to_time = if hb.is_waiting_for_snapshot_begin() {
            hb.ever_snapshot_time()
        } else if policy.store_everything {
            i64::MIN
        } else {
            policy.time_total
        };
        let prev_snapshot_time = hb.snapshot_time();
        let updated_ever = hb.update_snapshot_time_and_sweep_remove(time, trim_to_time, sweep_removed);
        if time >= trim_to_time && hb.put_record(time, &event.values, event.is_remove()) {
            flags |= DistFlags::UPDATED_RECORD;
        }
        if !sweep_removed.is_empty()
            || (flags.contains(DistFlags::UPDATED_RECORD)
                && time < prev_snapshot_time
                && time > policy.time_total
                && !updated_ever)
        {
            hb.update_sweep_tx_on();
        }
        let received_end = snip || time <= policy.time_total;
        if received_end {
            hb.snapshot_end();
            if hb.update_sweep_tx_off() {
                flags |= DistFlags::TX_END;
            }
        }
        if flags.is_empty()
            && snip_removed.is_empty()
            && sweep_removed.is_empty()
            && hb.snapshot_time() == prev_snapshot_time
        {
            return None;
        }
        if let Some(max) = policy.max_record_count {
            if !event.is_remove() && flags.contains(DistFlags::UPDATED_RECORD) {
                hb.enforce_max_record_count(max);
            }
        }
        if hb.is_sweep_tx() {
            flags |= DistFlags::TX_SWEEP;
        }
        let ever_snapshot = hb.was_ever_snapshot_mode();
        if ever_snapshot {
            flags |= DistFlags::HAD_SNAPSHOT;
        }
        Some(StorageUpdate {
            flags,
            prev_snapshot_time,
            ever_snapshot,
        })
    }

    fn removed_event(event: &RecordEvent, time: i64) -> RecordEvent {
        RecordEvent::new(event.rid, event.symbol.clone())
            .with_time(time)
            .with_flags(EventFlags::REMOVE_EVENT)
    }

    /// Adds the share of one agent row. Returns `true` when its pending
    /// counter is full and the pass must end.
    #[allow(clippy::too_many_arguments)]
    fn distribute_to_agent(
        &self,
        dist: &mut Distribution,
        agent: &Arc<AgentInner>,
        asub: &SubMatrix,
        aindex: usize,
        event: &RecordEvent,
        source: Source,
        update: &StorageUpdate,
        sweep: &[(i64, Source)],
        snip: &[(i64, Source)],
    ) -> bool {
        let time = event.time;
        let time_sub = asub.get(aindex, TIME_SUB);
        let use_hs = agent.use_history_snapshot;
        let flags = update.flags;
        let before = dist.len();

        if !sweep.is_empty() && (!use_hs || !flags.contains(DistFlags::SEND_SNAPSHOT)) {
            let mut removed_flags = DistFlags::UPDATED_RECORD | DistFlags::TX_SWEEP;
            if flags.contains(DistFlags::HAD_SNAPSHOT) {
                removed_flags |= DistFlags::HAD_SNAPSHOT;
            }
            for &(t, removed) in sweep {
                if t < time_sub {
                    break;
                }
                dist.add(agent, removed, removed_flags);
            }
        }
        let updated = time >= time_sub && flags.intersects(DistFlags::UPDATED_RECORD | DistFlags::UPDATED_SNIP);
        let snapshot_news = use_hs
            && (flags.intersects(DistFlags::TX_END | DistFlags::SEND_SNAPSHOT)
                || (time < update.prev_snapshot_time
                    && update.prev_snapshot_time > time_sub
                    && update.ever_snapshot));
        if updated || snapshot_news {
            dist.add(agent, source, flags);
        }
        if !use_hs {
            for &(t, removed) in snip {
                if t < time_sub {
                    break;
                }
                dist.add(agent, removed, DistFlags::UPDATED_RECORD);
            }
        }
        if dist.len() == before {
            return false;
        }

        let version = dist.version() as i64;
        let prev = asub.get(aindex, PROCESS_VERSION);
        let pending = if prev != version {
            if prev != 0 {
                self.versions.wait_while_in_process(prev as u32);
            }
            asub.set(aindex, PROCESS_VERSION, version);
            1
        } else {
            let pending = asub.get(aindex, PENDING);
            if pending >= MAX_PENDING {
                self.fatal.fatal(format!("[agent #{}] pending counter overflow", agent.number));
            }
            pending + 1
        };
        asub.set(aindex, PENDING, pending);
        dist.mark_last(DistFlags::DEC_PENDING);
        pending >= MAX_PENDING
    }

    // ========== Phase 2 ==========

    /// Applies the agent's share of `dist`. Returns the entry to resume
    /// from when the buffer blocks.
    pub(super) fn history_update(
        &self,
        dist: &Distribution,
        events: &[RecordEvent],
        slot: usize,
        agent: &AgentInner,
        local: &mut AgentLocal,
    ) -> Option<usize> {
        let sub = agent.sub.load_full();
        let version = dist.version() as i64;
        let mut added = 0;
        let mut index = dist.first_index(slot);
        while index != 0 {
            let entry = *dist.entry(index);
            let event = Self::source_event(events, dist, entry.source);
            let key = self.lookup_key(&event.symbol);
            let aindex = if key == 0 { 0 } else { sub.get_index(key, event.rid) };
            if aindex == 0 || sub.get(aindex, PROCESS_VERSION) != version {
                index = dist.next_index(index);
                continue;
            }
            if local.buffer.block_new_record() {
                self.counters.add_outgoing(added);
                return Some(index);
            }
            let removed = matches!(entry.source, Source::Removed(_));
            if self.update_agent_row(agent, local, &sub, aindex, event, entry.flags, removed) {
                added += 1;
            }
            index = dist.next_index(index);
        }
        local.buffer.drop_old_records();
        self.counters.add_outgoing(added);
        if local.buffer.needs_rebase() {
            self.rebuild_last_record_and_rebase(agent, local);
        }
        None
    }

    /// Returns `true` if a new record went into the buffer.
    #[allow(clippy::too_many_arguments)]
    fn update_agent_row(
        &self,
        agent: &AgentInner,
        local: &mut AgentLocal,
        sub: &SubMatrix,
        aindex: usize,
        event: &RecordEvent,
        mut dist_flags: DistFlags,
        removed: bool,
    ) -> bool {
        let use_hs = agent.use_history_snapshot;
        let time = event.time;
        let time_sub = sub.get(aindex, TIME_SUB);
        let mut time_known = sub.get(aindex, TIME_KNOWN);
        let mut dirty = sub.get(aindex, TX_DIRTY) != 0;
        let mut event_flags = if removed {
            EventFlags::REMOVE_EVENT
        } else {
            event.flags & (EventFlags::TX_PENDING | EventFlags::REMOVE_EVENT | EventFlags::SNAPSHOT_SNIP)
        };
        if dist_flags.contains(DistFlags::TX_SWEEP) && use_hs {
            event_flags |= EventFlags::TX_PENDING;
        }

        let mut no_more_pending = false;
        if dist_flags.contains(DistFlags::DEC_PENDING) {
            let pending = sub.get(aindex, PENDING);
            if pending <= 0 {
                self.fatal.fatal(format!("[agent #{}] pending counter underflow", agent.number));
            }
            sub.set(aindex, PENDING, pending - 1);
            if pending == 1 {
                sub.set(aindex, PROCESS_VERSION, 0);
                no_more_pending = true;
            }
        }

        if use_hs && dist_flags.contains(DistFlags::SEND_SNAPSHOT) {
            time_known = i64::MAX;
            sub.set(aindex, TIME_KNOWN, time_known);
            let last = sub.get(aindex, LAST_RECORD);
            if local.buffer.is_in_buffer(last) {
                local.buffer.unlink_from(last);
            }
            sub.set(aindex, LAST_RECORD, 0);
            sub.set(aindex, TX_DIRTY, 0);
            dirty = false;
        }
        if event_flags.contains(EventFlags::SNAPSHOT_SNIP) && time >= time_known {
            time_known = time_sub;
            sub.set(aindex, TIME_KNOWN, time_known);
        }
        if use_hs && dirty && !event_flags.contains(EventFlags::TX_PENDING) && time_known == time_sub && no_more_pending {
            dirty = false;
            sub.set(aindex, TX_DIRTY, 0);
            dist_flags |= DistFlags::TX_END;
        }

        let mut process_time = time;
        let mut virtual_end = false;
        if dist_flags.contains(DistFlags::TX_END) && time_known == time_sub && time < time_sub {
            process_time = time_sub;
            virtual_end = true;
            event_flags = EventFlags::REMOVE_EVENT;
        }
        if process_time < time_known {
            let below_snapshot = !event_flags.contains(EventFlags::REMOVE_EVENT) && process_time >= time_sub;
            if below_snapshot || (use_hs && !removed && time_sub < time_known) {
                local.queue.link(sub, aindex);
            }
            return false;
        }

        let last = sub.get(aindex, LAST_RECORD);
        let last_in_buffer = local.buffer.is_in_buffer(last);
        let updated = dist_flags.contains(DistFlags::UPDATED_RECORD)
            || (use_hs && dist_flags.contains(DistFlags::UPDATED_SNIP));
        if !updated {
            if !dist_flags.contains(DistFlags::TX_END) || dirty {
                return false;
            }
            if last_in_buffer {
                if let Some(record) = local.buffer.get_mut(last) {
                    record.event.flags = record.event.flags.without(EventFlags::TX_PENDING);
                }
                return false;
            }
        }
        if use_hs && !dirty && time_known > time_sub && dist_flags.contains(DistFlags::HAD_SNAPSHOT) {
            Self::make_dirty(local, sub, aindex);
            dirty = true;
        }
        if dirty {
            event_flags |= EventFlags::TX_PENDING;
        }
        if !use_hs {
            event_flags = event_flags & EventFlags::REMOVE_EVENT;
        }

        let out_time = if virtual_end { i64::MAX } else { time };
        if last_in_buffer && !self.is_unconflated(event.rid) {
            if let Some(record) = local.buffer.get_mut(last) {
                if record.event.time == out_time {
                    record.event.flags = event_flags;
                    if event_flags.contains(EventFlags::REMOVE_EVENT) {
                        record.event.values.clear();
                    } else {
                        record.event.values.clone_from(&event.values);
                    }
                    return false;
                }
            }
        }
        if local.buffer.drop_new_record(event) {
            return false;
        }
        let values = if virtual_end { Vec::new() } else { event.values.clone() };
        let out = RecordEvent::new(event.rid, event.symbol.clone())
            .with_time(out_time)
            .with_flags(event_flags)
            .with_values(values);
        let position = local.buffer.push(out, if last_in_buffer { last } else { 0 });
        sub.set(aindex, LAST_RECORD, position);
        true
    }

    /// Flags the agent row's buffered chain as part of an open transaction.
    fn make_dirty(local: &mut AgentLocal, sub: &SubMatrix, aindex: usize) {
        let last = sub.get(aindex, LAST_RECORD);
        if local.buffer.is_in_buffer(last) {
            local.buffer.flag_from(last, EventFlags::TX_PENDING);
        }
        sub.set(aindex, TX_DIRTY, 1);
    }

    /// Points `LAST_RECORD` of every row at its newest linked record and
    /// rebases the buffer.
    fn rebuild_last_record_and_rebase(&self, agent: &AgentInner, local: &mut AgentLocal) {
        let sub = agent.sub.load_full();
        for index in sub.rows() {
            if sub.is_payload(index) {
                sub.set(index, LAST_RECORD, 0);
            }
        }
        let lasts: Vec<(usize, i64)> = local
            .buffer
            .iter()
            .filter(|(_, record)| !record.is_unlinked())
            .filter_map(|(position, record)| {
                let key = self.lookup_key(&record.event.symbol);
                if key == 0 {
                    return None;
                }
                let index = sub.get_index(key, record.event.rid);
                (index != 0 && sub.is_payload(index)).then_some((index, position))
            })
            .collect();
        let shift = local.buffer.rebase();
        for (index, position) in lasts {
            sub.set(index, LAST_RECORD, position - shift);
        }
        log::trace!("[agent #{}] buffer rebased by {}", agent.number, shift);
    }

    pub(super) fn history_force_rebase(&self, agent: &Arc<AgentInner>) {
        let mut local = agent.local.lock();
        self.rebuild_last_record_and_rebase(agent, &mut local);
    }

    // ========== Retrieve ==========

    /// Delivers buffered updates under the agent lock alone; snapshot
    /// parts need the structural lock as well.
    pub(super) fn history_retrieve(self: &Arc<Self>, agent: &Arc<AgentInner>, sink: &mut dyn RecordSink) -> bool {
        {
            let mut local = agent.local.lock();
            loop {
                match self.check_retrieve_status(agent, &mut local) {
                    RetrieveStatus::Nothing => {
                        local.notified = Default::default();
                        return false;
                    }
                    RetrieveStatus::Update => {
                        if self.retrieve_update_batch(agent, &mut local, sink) {
                            return true;
                        }
                    }
                    RetrieveStatus::Snapshot => break,
                }
            }
        }
        let mut core = self.core.lock_priority("retrieve");
        let mut local = agent.local.lock();
        loop {
            match self.check_retrieve_status(agent, &mut local) {
                RetrieveStatus::Nothing => {
                    local.notified = Default::default();
                    return false;
                }
                RetrieveStatus::Update => {
                    if self.retrieve_update_batch(agent, &mut local, sink) {
                        return true;
                    }
                }
                RetrieveStatus::Snapshot => {
                    let (n, no_capacity) = self.retrieve_snapshot_batch(&mut core, agent, &mut local, sink);
                    local.snapshot_credit += n;
                    local.retrieved += n as u64;
                    self.counters.add_retrieved(n as u64);
                    if no_capacity {
                        return true;
                    }
                }
            }
        }
    }

    /// Snapshot and update batches alternate by credit so that neither
    /// starves the other.
    fn check_retrieve_status(&self, agent: &AgentInner, local: &mut AgentLocal) -> RetrieveStatus {
        if !agent.is_active() {
            return RetrieveStatus::Nothing;
        }
        let batch = self.config.retrieve_batch_size;
        let more_snapshot = !local.queue.is_empty();
        let more_update = local.buffer.has_next();
        if !more_update {
            local.snapshot_credit = 0;
            if !more_snapshot {
                return RetrieveStatus::Nothing;
            }
        }
        if local.snapshot_credit < batch && more_snapshot {
            return RetrieveStatus::Snapshot;
        }
        if !more_snapshot {
            local.snapshot_credit = batch;
        }
        RetrieveStatus::Update
    }

    /// Returns `true` if the sink ran out of capacity.
    fn retrieve_update_batch(&self, agent: &AgentInner, local: &mut AgentLocal, sink: &mut dyn RecordSink) -> bool {
        let credit = local.snapshot_credit;
        let n = local.buffer.retrieve(sink, credit);
        local.snapshot_credit -= n;
        local.retrieved += n as u64;
        self.counters.add_retrieved(n as u64);
        if local.buffer.needs_rebase() {
            self.rebuild_last_record_and_rebase(agent, local);
        }
        if local.buffer.unblock() {
            agent.drained.notify_all();
        }
        local.buffer.has_next() && n < credit
    }

    /// Examines stored records of queued rows. Returns the number
    /// delivered and whether the sink ran out of capacity.
    fn retrieve_snapshot_batch(
        &self,
        core: &mut Core,
        agent: &AgentInner,
        local: &mut AgentLocal,
        sink: &mut dyn RecordSink,
    ) -> (usize, bool) {
        let use_hs = agent.use_history_snapshot;
        let sub = agent.sub.load_full();
        let tsub = self.total.load_full();
        let mut limit = self.config.retrieve_batch_size;
        let mut n_retrieved = 0;
        let mut head = local.queue.head();
        while let Some(aindex) = head {
            if n_retrieved >= limit {
                break;
            }
            let time_known = sub.get(aindex, TIME_KNOWN);
            let time_sub = sub.get(aindex, TIME_SUB);
            if time_known == time_sub {
                head = local.queue.pop(&sub, aindex);
                continue;
            }
            let key = sub.key(aindex);
            let rid = sub.rid(aindex);
            let tindex = if key == 0 { 0 } else { tsub.get_index(key, rid) };
            let hid = if tindex == 0 { 0 } else { tsub.get(tindex, HISTORY_ID) };
            let Some(hb) = core.histories.get_mut(hid) else {
                head = local.queue.pop(&sub, aindex);
                continue;
            };
            let to_time = time_sub.max(hb.snapshot_time());
            if time_known <= to_time {
                head = local.queue.pop(&sub, aindex);
                continue;
            }
            if SnapshotQueue::is_fresh(&sub, aindex) {
                local.snapshot_rem = self.config.snapshot_batch_size;
            }
            limit = limit.min(local.snapshot_rem);

            let end_flag = if to_time == time_sub {
                if sub.get(aindex, SUB_SNIP) != 0 {
                    EventFlags::SNAPSHOT_SNIP
                } else {
                    EventFlags::SNAPSHOT_END
                }
            } else if hb.is_snip_to_time(to_time) {
                EventFlags::SNAPSHOT_SNIP
            } else {
                EventFlags::empty()
            };
            let processing = sub.get(aindex, PROCESS_VERSION) != 0;
            let last = sub.get(aindex, LAST_RECORD);
            let mut dirty = sub.get(aindex, TX_DIRTY) != 0;
            if use_hs && !dirty && hb.was_ever_snapshot_mode() && processing {
                Self::make_dirty(local, &sub, aindex);
                dirty = true;
            }
            let mut event_flags = EventFlags::empty();
            let mut no_more_dirty = false;
            let mut tx_end = false;
            if dirty {
                event_flags |= EventFlags::TX_PENDING;
                no_more_dirty = !end_flag.is_empty() && !hb.is_tx() && !processing;
                tx_end = no_more_dirty && !local.buffer.is_in_buffer(last);
            }
            if time_known == i64::MAX {
                event_flags |= EventFlags::SNAPSHOT_BEGIN;
            }

            let symbol = self.symbol_of(key);
            let has_more = hb.examine_retrieve(
                EntryRef { rid, symbol: &symbol },
                RetrieveRange {
                    time_known,
                    to_time,
                    limit: local.snapshot_rem,
                },
                RetrieveFlags {
                    event_flags,
                    end_flag,
                    tx_end,
                    use_flags: use_hs,
                },
                sink,
            );
            let n_examined = hb.n_examined;
            if n_examined > 0 {
                if hb.is_snip_to_time(hb.examined_time) {
                    hb.examined_time = time_sub;
                }
                sub.set(aindex, TIME_KNOWN, hb.examined_time);
                n_retrieved += n_examined;
            }
            if no_more_dirty && !has_more {
                sub.set(aindex, TX_DIRTY, 0);
                if !tx_end {
                    if let Some(record) = local.buffer.get_mut(last) {
                        record.event.flags = record.event.flags.without(EventFlags::TX_PENDING);
                    }
                }
            } else if use_hs && !dirty && n_examined > 0 && hb.is_tx() {
                Self::make_dirty(local, &sub, aindex);
            }

            if has_more {
                local.snapshot_rem = local.snapshot_rem.saturating_sub(n_examined);
                if n_examined < limit {
                    SnapshotQueue::reset_fresh(&sub, aindex);
                    return (n_retrieved, true);
                }
                if local.snapshot_rem > 0 {
                    SnapshotQueue::reset_fresh(&sub, aindex);
                    return (n_retrieved, false);
                }
                head = local.queue.move_to_tail(&sub, aindex);
            } else {
                head = local.queue.pop(&sub, aindex);
            }
        }
        (n_retrieved, false)
    }
}

#[cfg(test)]
mod tests {
    use crate::collector::{Collector, Contract};
    use crate::data::{DataScheme, EventFlags, RecordEvent, Symbol};

    fn collector() -> Collector {
        Collector::new(DataScheme::new(&[("Trade", true)]), Contract::History).unwrap()
    }

    fn aapl() -> Symbol {
        Symbol::Text("AAPL".into())
    }

    fn trade(time: i64, price: i64, flags: EventFlags) -> RecordEvent {
        RecordEvent::new(0, aapl())
            .with_time(time)
            .with_flags(flags)
            .with_values(vec![price])
    }

    #[test]
    fn test_plain_source_delivers_snapshot_then_updates() {
        let collector = collector();
        let agent = collector.create_agent().unwrap();
        agent.add_subscription(&[RecordEvent::subscription(0, aapl(), 0)]).unwrap();
        let distributor = collector.distributor();
        distributor
            .process(&[
                trade(3, 30, EventFlags::empty()),
                trade(2, 20, EventFlags::empty()),
                trade(1, 10, EventFlags::empty()),
            ])
            .unwrap();
        let mut out = Vec::new();
        assert!(!agent.retrieve(&mut out));
        assert_eq!(out.iter().map(|e| e.time).collect::<Vec<_>>(), vec![3, 2, 1]);
        assert!(out.iter().all(|e| e.flags.is_empty()));

        distributor.process(&[trade(4, 40, EventFlags::empty())]).unwrap();
        out.clear();
        agent.retrieve(&mut out);
        assert_eq!(out.len(), 1);
        assert_eq!((out[0].time, out[0].values[0]), (4, 40));
        assert_eq!(collector.stored_records(), 4);
    }

    #[test]
    fn test_snapshot_flags_only_for_snapshot_agents() {
        let collector = collector();
        let modern = collector.create_agent().unwrap();
        let legacy = collector.agent_builder().history_snapshot(false).build().unwrap();
        for agent in [&modern, &legacy] {
            agent.add_subscription(&[RecordEvent::subscription(0, aapl(), 10)]).unwrap();
        }
        collector
            .distributor()
            .process(&[
                trade(30, 3, EventFlags::SNAPSHOT_BEGIN),
                trade(20, 2, EventFlags::empty()),
                trade(10, 1, EventFlags::empty()),
            ])
            .unwrap();

        let mut out = Vec::new();
        modern.retrieve(&mut out);
        let flags: Vec<EventFlags> = out.iter().map(|e| e.flags).collect();
        assert_eq!(
            flags,
            vec![EventFlags::SNAPSHOT_BEGIN, EventFlags::empty(), EventFlags::SNAPSHOT_END]
        );

        out.clear();
        legacy.retrieve(&mut out);
        assert_eq!(out.iter().map(|e| e.time).collect::<Vec<_>>(), vec![30, 20, 10]);
        assert!(out.iter().all(|e| e.flags.is_empty()));
    }

    #[test]
    fn test_updates_conflate_in_buffer() {
        let collector = collector();
        let agent = collector.create_agent().unwrap();
        agent.add_subscription(&[RecordEvent::subscription(0, aapl(), 10)]).unwrap();
        let distributor = collector.distributor();
        distributor
            .process(&[
                trade(20, 2, EventFlags::SNAPSHOT_BEGIN),
                trade(10, 1, EventFlags::empty()),
            ])
            .unwrap();
        let mut out = Vec::new();
        agent.retrieve(&mut out);
        assert_eq!(out.len(), 2);

        distributor.process(&[trade(40, 4, EventFlags::empty())]).unwrap();
        distributor.process(&[trade(40, 5, EventFlags::empty())]).unwrap();
        out.clear();
        agent.retrieve(&mut out);
        assert_eq!(out.len(), 1);
        assert_eq!((out[0].time, out[0].values[0]), (40, 5));
    }

    #[test]
    fn test_conflation_survives_forced_rebase() {
        let collector = collector();
        let agent = collector.create_agent().unwrap();
        agent.add_subscription(&[RecordEvent::subscription(0, aapl(), 0)]).unwrap();
        let distributor = collector.distributor();
        for (time, price) in [(1, 1), (2, 2), (3, 3)] {
            distributor.process(&[trade(time, price, EventFlags::empty())]).unwrap();
        }
        let mut out = Vec::new();
        while agent.retrieve(&mut out) {}

        distributor.process(&[trade(4, 4, EventFlags::empty())]).unwrap();
        agent.force_rebase();
        distributor.process(&[trade(4, 5, EventFlags::empty())]).unwrap();
        out.clear();
        agent.retrieve(&mut out);
        assert_eq!(out.len(), 1);
        assert_eq!((out[0].time, out[0].values[0]), (4, 5));
    }

    #[test]
    fn test_remove_event_drops_stored_record() {
        let collector = collector();
        let agent = collector.create_agent().unwrap();
        agent.add_subscription(&[RecordEvent::subscription(0, aapl(), 0)]).unwrap();
        let distributor = collector.distributor();
        distributor
            .process(&[trade(2, 20, EventFlags::empty()), trade(1, 10, EventFlags::empty())])
            .unwrap();
        assert_eq!(collector.stored_records(), 2);
        distributor
            .process(&[RecordEvent::new(0, aapl()).with_time(2).with_flags(EventFlags::REMOVE_EVENT)])
            .unwrap();
        assert_eq!(collector.stored_records(), 1);
        assert_eq!(collector.max_available_time(0, &aapl()).unwrap(), 1);
    }

    #[test]
    fn test_unsubscribed_entries_are_not_stored() {
        let collector = collector();
        collector
            .distributor()
            .process(&[trade(1, 10, EventFlags::empty())])
            .unwrap();
        assert_eq!(collector.stored_records(), 0);
    }
}
