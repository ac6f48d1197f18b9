// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Subscription changes, agent closing, sticky and kept total entries,
//! and table rehashing.
//!
//! Every operation runs under the structural lock and then the agent lock,
//! and does at most `subscription_bucket` steps before returning
//! [`NotifyFlags::HAS_MORE`]. Leftover closing work of other agents is
//! helped along with whatever budget remains.

use super::layout::*;
use super::sticky::StickyItem;
use super::{CollectorInner, Core};
use crate::agent::{AgentInner, AgentLocal, CLOSED, CLOSING};
use crate::collector::notify::NotifyFlags;
use crate::config::TOTAL_AGENT_NUMBER;
use crate::data::{EventFlags, RecordEvent};
use crate::error::{Error, Result};
use crate::history::HistoryBuffer;
use crate::matrix::SubMatrix;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Resumable position in a list of subscription entries.
#[derive(Debug)]
pub struct SubscriptionCursor<'a> {
    entries: &'a [RecordEvent],
    position: usize,
    validated: bool,
}

impl<'a> SubscriptionCursor<'a> {
    pub fn new(entries: &'a [RecordEvent]) -> Self {
        Self {
            entries,
            position: 0,
            validated: false,
        }
    }

    /// Entries consumed so far.
    pub fn position(&self) -> usize {
        self.position
    }

    pub fn is_done(&self) -> bool {
        self.position >= self.entries.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Add,
    Remove,
    Set,
}

impl Op {
    fn name(self) -> &'static str {
        match self {
            Op::Add => "add_subscription",
            Op::Remove => "remove_subscription",
            Op::Set => "set_subscription",
        }
    }
}

impl CollectorInner {
    pub fn add_subscription_part(
        self: &Arc<Self>,
        agent: &Arc<AgentInner>,
        cursor: &mut SubscriptionCursor<'_>,
        notify: NotifyFlags,
    ) -> Result<NotifyFlags> {
        self.subscription_part(agent, cursor, notify, Op::Add)
    }

    pub fn remove_subscription_part(
        self: &Arc<Self>,
        agent: &Arc<AgentInner>,
        cursor: &mut SubscriptionCursor<'_>,
        notify: NotifyFlags,
    ) -> Result<NotifyFlags> {
        self.subscription_part(agent, cursor, notify, Op::Remove)
    }

    pub fn set_subscription_part(
        self: &Arc<Self>,
        agent: &Arc<AgentInner>,
        cursor: &mut SubscriptionCursor<'_>,
        notify: NotifyFlags,
    ) -> Result<NotifyFlags> {
        self.subscription_part(agent, cursor, notify, Op::Set)
    }

    fn subscription_part(
        self: &Arc<Self>,
        agent: &Arc<AgentInner>,
        cursor: &mut SubscriptionCursor<'_>,
        notify: NotifyFlags,
        op: Op,
    ) -> Result<NotifyFlags> {
        if !cursor.validated {
            self.validate_subscription(cursor.entries)?;
            cursor.validated = true;
        }
        if !agent.is_active() {
            return Err(Error::AgentClosed(agent.number));
        }
        let (flags, pending) = {
            let mut core = self.core.lock(op.name());
            core.start_batch(self.config.subscription_bucket, notify);
            self.expire_sticky(&mut core);
            let mut local = agent.local.lock();
            if !agent.is_active() {
                return Err(Error::AgentClosed(agent.number));
            }
            agent.bump_sub_mod_count();
            local.reduced_sub = false;
            let in_cleanup = op == Op::Set && notify.contains(NotifyFlags::PHASE2);
            if !in_cleanup && local.setter_cleanup != 0 {
                // an unfinished replacement is abandoned
                local.setter_cleanup = 0;
                core.notify = core.notify.without(NotifyFlags::PHASE2);
            }
            let done = match op {
                Op::Add => self.add_entries(&mut core, agent, &mut local, cursor, false),
                Op::Remove => self.remove_entries(&mut core, agent, &mut local, cursor),
                Op::Set => self.set_entries(&mut core, agent, &mut local, cursor, in_cleanup),
            };
            if !done {
                core.notify |= NotifyFlags::HAS_MORE;
            }
            self.subscription_change_complete(&mut core, agent, &mut local);
            drop(local);
            if core.steps > 0 {
                self.help_close(&mut core);
            }
            let pending = self.take_pending_distributors(&mut core);
            (core.done_batch(), pending)
        };
        self.fire_distributors(pending);
        self.notify_agent(agent);
        Ok(flags)
    }

    fn add_entries(
        &self,
        core: &mut Core,
        agent: &Arc<AgentInner>,
        local: &mut AgentLocal,
        cursor: &mut SubscriptionCursor<'_>,
        by_set: bool,
    ) -> bool {
        while !cursor.is_done() && core.steps > 0 {
            let entry = &cursor.entries[cursor.position];
            if !by_set && entry.flags.contains(EventFlags::REMOVE_SYMBOL) {
                self.remove_entry(core, agent, local, entry);
            } else {
                self.add_entry(core, agent, local, entry, by_set);
            }
            cursor.position += 1;
            core.steps -= 1;
        }
        cursor.is_done()
    }

    fn remove_entries(
        &self,
        core: &mut Core,
        agent: &Arc<AgentInner>,
        local: &mut AgentLocal,
        cursor: &mut SubscriptionCursor<'_>,
    ) -> bool {
        while !cursor.is_done() && core.steps > 0 {
            let entry = &cursor.entries[cursor.position];
            self.remove_entry(core, agent, local, entry);
            cursor.position += 1;
            core.steps -= 1;
        }
        cursor.is_done()
    }

    /// Adds everything marking rows, then walks the table removing rows
    /// that were not marked.
    fn set_entries(
        &self,
        core: &mut Core,
        agent: &Arc<AgentInner>,
        local: &mut AgentLocal,
        cursor: &mut SubscriptionCursor<'_>,
        in_cleanup: bool,
    ) -> bool {
        if !in_cleanup {
            if cursor.position == 0 {
                let sub = agent.sub.load_full();
                for index in sub.rows() {
                    sub.set(index, ADDED_BY_SET, 0);
                }
            }
            if !self.add_entries(core, agent, local, cursor, true) {
                return false;
            }
            local.setter_cleanup = agent.sub.load().len_cells();
            core.notify |= NotifyFlags::PHASE2;
        }
        let sub = agent.sub.load_full();
        while local.setter_cleanup > 0 && core.steps > 0 {
            local.setter_cleanup -= sub.step();
            let index = local.setter_cleanup;
            if index == 0 {
                break;
            }
            if sub.is_payload(index) {
                if sub.get(index, ADDED_BY_SET) != 0 {
                    sub.set(index, ADDED_BY_SET, 0);
                } else {
                    self.remove_sub_existing(core, local, &sub, index);
                    local.reduced_sub = true;
                }
            }
            core.steps -= 1;
        }
        if local.setter_cleanup == 0 {
            core.notify = core.notify.without(NotifyFlags::PHASE2);
            true
        } else {
            false
        }
    }

    /// Subscription time of `entry` after the history filter.
    fn filtered_time(&self, entry: &RecordEvent) -> (i64, bool) {
        if !self.is_history() {
            return (0, false);
        }
        match &self.filter {
            Some(filter) => {
                let min = filter.min_history_time(entry.rid, &entry.symbol);
                if entry.time < min {
                    (min, true)
                } else {
                    (entry.time, false)
                }
            }
            None => (entry.time, false),
        }
    }

    fn add_entry(&self, core: &mut Core, agent: &Arc<AgentInner>, local: &mut AgentLocal, entry: &RecordEvent, by_set: bool) {
        let rid = entry.rid;
        let key = self.add_key(&entry.symbol);
        let (time, snip) = self.filtered_time(entry);
        let history = self.is_history();

        self.rehash_agent_if_needed(core, agent, local);
        let sub = agent.sub.load_full();
        let aindex = sub.add_index_begin(key, rid);
        if sub.get(aindex, PREV_AGENT) != 0 {
            if by_set {
                sub.set(aindex, ADDED_BY_SET, 1);
            }
            if !history {
                return;
            }
            let prev = sub.get(aindex, TIME_SUB);
            if prev == time && (sub.get(aindex, SUB_SNIP) != 0) == snip {
                return;
            }
            sub.set(aindex, TIME_SUB, time);
            sub.set(aindex, SUB_SNIP, i64::from(snip));
            let tsub = self.total.load_full();
            let tindex = tsub.get_index(key, rid);
            if tindex == 0 {
                self.fatal.fatal("Subscribed agent entry misses its total entry");
            }
            let time_total = tsub.get(tindex, TIME_TOTAL);
            if time < time_total {
                tsub.set(tindex, TIME_TOTAL, time);
                self.total_record_added(core, &tsub, tindex, time);
            } else if time > prev && prev == time_total {
                self.reduce_time_total(core, &tsub, tindex);
            }
            self.enqueue_added_record(core, agent, local, &sub, aindex, tindex);
            return;
        }

        self.rehash_total_if_needed(core);
        let tsub = self.total.load_full();
        let tindex = tsub.add_index_begin(key, rid);
        let nagent = tsub.get(tindex, NEXT_AGENT);
        let was_sticky = nagent == KEPT && tsub.get(tindex, STICKY_STAMP) != 0;

        sub.set(aindex, PREV_AGENT, TOTAL_AGENT_NUMBER as i64);
        if nagent > 0 {
            let nindex = tsub.get(tindex, NEXT_INDEX);
            sub.set(aindex, NEXT_AGENT, nagent);
            sub.set(aindex, NEXT_INDEX, nindex);
            core.agent(nagent as usize, &self.fatal)
                .sub
                .load()
                .set(nindex as usize, PREV_AGENT, agent.number as i64);
        } else {
            sub.set(aindex, NEXT_AGENT, 0);
            sub.set(aindex, NEXT_INDEX, 0);
        }
        sub.set(aindex, ADDED_BY_SET, i64::from(by_set));
        if history {
            sub.set(aindex, TIME_SUB, time);
            sub.set(aindex, SUB_SNIP, i64::from(snip));
            sub.set(aindex, TIME_KNOWN, i64::MAX);
            sub.set(aindex, LAST_RECORD, 0);
            sub.set(aindex, TX_DIRTY, 0);
        }
        sub.add_index_complete(aindex, key);
        sub.update_added_payload();

        tsub.set(tindex, NEXT_AGENT, agent.number as i64);
        tsub.set(tindex, NEXT_INDEX, aindex as i64);
        tsub.set(tindex, STICKY_STAMP, 0);
        tsub.add_index_complete(tindex, key);
        if nagent == 0 {
            tsub.update_added_payload();
        }

        if history {
            if nagent > 0 {
                if time < tsub.get(tindex, TIME_TOTAL) {
                    tsub.set(tindex, TIME_TOTAL, time);
                    self.total_record_added(core, &tsub, tindex, time);
                }
            } else {
                tsub.set(tindex, TIME_TOTAL, time);
                self.total_record_added(core, &tsub, tindex, time);
            }
            self.enqueue_added_record(core, agent, local, &sub, aindex, tindex);
        } else if nagent == 0 || (nagent == KEPT && !was_sticky) {
            self.distributors_added(core, key, rid, 0);
        }
    }

    fn remove_entry(&self, core: &mut Core, agent: &Arc<AgentInner>, local: &mut AgentLocal, entry: &RecordEvent) {
        let key = self.lookup_key(&entry.symbol);
        if key == 0 {
            return;
        }
        let sub = agent.sub.load_full();
        let aindex = sub.get_index(key, entry.rid);
        if aindex == 0 || sub.get(aindex, PREV_AGENT) == 0 {
            return;
        }
        self.remove_sub_existing(core, local, &sub, aindex);
        local.reduced_sub = true;
    }

    /// Unlinks the agent row at `aindex` from its chain and settles the
    /// total entry.
    pub(super) fn remove_sub_existing(
        &self,
        core: &mut Core,
        local: &mut AgentLocal,
        sub: &SubMatrix,
        aindex: usize,
    ) {
        let key = sub.key(aindex);
        let rid = sub.rid(aindex);
        let prev = sub.get(aindex, PREV_AGENT) as usize;
        let nagent = sub.get(aindex, NEXT_AGENT);
        let nindex = sub.get(aindex, NEXT_INDEX);
        let tsub = self.total.load_full();
        let tindex = tsub.get_index(key, rid);
        if tindex == 0 {
            self.fatal.fatal("Subscribed agent entry misses its total entry");
        }

        if prev == TOTAL_AGENT_NUMBER {
            tsub.set(tindex, NEXT_AGENT, nagent);
            tsub.set(tindex, NEXT_INDEX, nindex);
        } else {
            let psub = core.agent(prev, &self.fatal).sub.load_full();
            let pindex = psub.get_index(key, rid);
            if pindex == 0 {
                self.fatal.fatal(format!("Previous agent #{} misses entry", prev));
            }
            psub.set(pindex, NEXT_AGENT, nagent);
            psub.set(pindex, NEXT_INDEX, nindex);
        }
        if nagent > 0 {
            core.agent(nagent as usize, &self.fatal)
                .sub
                .load()
                .set(nindex as usize, PREV_AGENT, prev as i64);
        }
        sub.set(aindex, PREV_AGENT, 0);
        sub.set(aindex, NEXT_AGENT, 0);
        sub.set(aindex, NEXT_INDEX, 0);
        sub.set(aindex, ADDED_BY_SET, 0);
        sub.update_removed_payload();

        if self.is_history() {
            let time_sub = sub.get(aindex, TIME_SUB);
            self.dequeue_record(local, sub, aindex);
            for field in [TIME_SUB, TIME_KNOWN] {
                sub.set(aindex, field, i64::MAX);
            }
            for field in [SUB_SNIP, LAST_RECORD, TX_DIRTY, PENDING, PROCESS_VERSION] {
                sub.set(aindex, field, 0);
            }
            if tsub.get(tindex, NEXT_AGENT) > 0 && time_sub == tsub.get(tindex, TIME_TOTAL) {
                self.reduce_time_total(core, &tsub, tindex);
            }
        }
        if tsub.get(tindex, NEXT_AGENT) == 0 && self.total_record_removed(core, &tsub, tindex) {
            tsub.update_removed_payload();
        }
    }

    // ========== Total entry hooks ==========

    /// Raises the total time to the minimum over the chain when no agent
    /// still sits at the current one.
    pub(super) fn reduce_time_total(&self, core: &mut Core, tsub: &SubMatrix, tindex: usize) {
        let time_total = tsub.get(tindex, TIME_TOTAL);
        let mut min = i64::MAX;
        let mut nagent = tsub.get(tindex, NEXT_AGENT);
        let mut nindex = tsub.get(tindex, NEXT_INDEX) as usize;
        while nagent > 0 {
            let asub = core.agent(nagent as usize, &self.fatal).sub.load_full();
            let time = asub.get(nindex, TIME_SUB);
            if time <= time_total {
                return;
            }
            min = min.min(time);
            nagent = asub.get(nindex, NEXT_AGENT);
            nindex = asub.get(nindex, NEXT_INDEX) as usize;
        }
        tsub.set(tindex, TIME_TOTAL, min);
        self.total_record_added(core, tsub, tindex, min);
    }

    /// Total entry appeared or changed its time.
    pub(super) fn total_record_added(&self, core: &mut Core, tsub: &SubMatrix, tindex: usize, time: i64) {
        let key = tsub.key(tindex);
        let rid = tsub.rid(tindex);
        if !self.should_store_everything(rid) {
            if let Some(hb) = core.histories.get_mut(tsub.get(tindex, HISTORY_ID)) {
                hb.expiration = None;
                hb.remove_old_records(time);
                let snapshot_time = hb.snapshot_time();
                if time < snapshot_time && !hb.is_snip_to_time(snapshot_time) {
                    hb.reset_snapshot();
                }
            }
        }
        self.distributors_added(core, key, rid, time);
    }

    /// Last agent left the entry. Returns `true` if the row stops being
    /// payload; otherwise it is kept with `NEXT_AGENT == KEPT`.
    fn total_record_removed(&self, core: &mut Core, tsub: &SubMatrix, tindex: usize) -> bool {
        if core.sticky.is_enabled() {
            let stamp = core.sticky.add(tsub.key(tindex), tsub.rid(tindex));
            tsub.set(tindex, STICKY_STAMP, stamp);
            tsub.set(tindex, NEXT_AGENT, KEPT);
            return false;
        }
        self.release_total(core, tsub, tindex)
    }

    /// Entry is no longer wanted. History storage goes away unless it is
    /// stored unconditionally or kept for the state keep time.
    fn release_total(&self, core: &mut Core, tsub: &SubMatrix, tindex: usize) -> bool {
        let key = tsub.key(tindex);
        let rid = tsub.rid(tindex);
        self.distributors_removed(core, key, rid);
        if !self.is_history() {
            tsub.set(tindex, NEXT_AGENT, 0);
            return true;
        }
        tsub.set(tindex, TIME_TOTAL, i64::MAX);
        if self.should_store_everything(rid) {
            tsub.set(tindex, NEXT_AGENT, KEPT);
            return false;
        }
        let hid = tsub.get(tindex, HISTORY_ID);
        let keep = self.config.state_keep_time();
        if let Some(hb) = core.histories.get_mut(hid) {
            if !keep.is_zero() {
                hb.clear_all_records();
                hb.expiration = Some(Instant::now() + keep);
                tsub.set(tindex, NEXT_AGENT, KEPT);
                return false;
            }
            core.histories.remove(hid);
        }
        tsub.set(tindex, HISTORY_ID, 0);
        tsub.set(tindex, NEXT_AGENT, 0);
        true
    }

    // ========== Sticky and kept entries ==========

    pub(super) fn expire_sticky(&self, core: &mut Core) {
        let mut changed = false;
        if core.sticky.is_enabled() {
            for item in core.sticky.take_expired() {
                changed |= self.release_sticky(core, item);
            }
        }
        if self.is_history() && Instant::now() >= core.next_state_check {
            changed |= self.expire_kept_totals(core, Instant::now());
            core.next_state_check = Instant::now() + self.config.state_keep_time().max(Duration::from_millis(100));
        }
        if changed {
            self.rehash_total_if_needed(core);
            self.mapper.rehash_if_needed();
        }
    }

    fn release_sticky(&self, core: &mut Core, item: StickyItem) -> bool {
        let tsub = self.total.load_full();
        let tindex = tsub.get_index(item.key, item.rid);
        if tindex == 0
            || tsub.get(tindex, NEXT_AGENT) != KEPT
            || tsub.get(tindex, STICKY_STAMP) != item.stamp
        {
            return false;
        }
        tsub.set(tindex, STICKY_STAMP, 0);
        if self.release_total(core, &tsub, tindex) {
            tsub.update_removed_payload();
            return true;
        }
        false
    }

    pub(super) fn set_sticky_period(&self, core: &mut Core, period: Duration) {
        let items = core.sticky.set_period(period);
        let enabled = core.sticky.is_enabled();
        let tsub = self.total.load_full();
        let mut changed = false;
        for item in items {
            let tindex = tsub.get_index(item.key, item.rid);
            if tindex == 0 || tsub.get(tindex, STICKY_STAMP) != item.stamp {
                continue;
            }
            if enabled {
                let stamp = core.sticky.add(item.key, item.rid);
                tsub.set(tindex, STICKY_STAMP, stamp);
            } else {
                changed |= self.release_sticky(core, item);
            }
        }
        log::debug!("[collector] sticky period set to {:?}", period);
        if changed {
            self.rehash_total_if_needed(core);
            self.mapper.rehash_if_needed();
        }
    }

    /// Drops kept history entries whose keep time has passed.
    fn expire_kept_totals(&self, core: &mut Core, now: Instant) -> bool {
        let tsub = self.total.load_full();
        let mut changed = false;
        for tindex in tsub.rows() {
            if tsub.get(tindex, NEXT_AGENT) != KEPT
                || tsub.get(tindex, STICKY_STAMP) != 0
                || self.should_store_everything(tsub.rid(tindex))
            {
                continue;
            }
            let hid = tsub.get(tindex, HISTORY_ID);
            let expired = core
                .histories
                .get(hid)
                .map_or(true, |hb| hb.expiration.map_or(false, |at| at <= now));
            if !expired {
                continue;
            }
            core.histories.remove(hid);
            tsub.set(tindex, HISTORY_ID, 0);
            tsub.set(tindex, NEXT_AGENT, 0);
            tsub.update_removed_payload();
            changed = true;
        }
        changed
    }

    // ========== History subscription helpers ==========

    /// Restarts snapshot delivery of an added or changed agent row.
    pub(super) fn enqueue_added_record(
        &self,
        core: &mut Core,
        agent: &AgentInner,
        local: &mut AgentLocal,
        sub: &SubMatrix,
        aindex: usize,
        tindex: usize,
    ) {
        let last = sub.get(aindex, LAST_RECORD);
        if last != 0 {
            local.buffer.unlink_from(last);
        }
        sub.set(aindex, LAST_RECORD, 0);
        sub.set(aindex, TIME_KNOWN, i64::MAX);
        let time_sub = sub.get(aindex, TIME_SUB);
        let tsub = self.total.load();
        let (count, snapshot_time) = match core.histories.get(tsub.get(tindex, HISTORY_ID)) {
            Some(hb) => (
                hb.available_count(time_sub.max(hb.snapshot_time()), i64::MAX),
                hb.snapshot_time(),
            ),
            None => (0, i64::MAX),
        };
        if count > 0 || (agent.use_history_snapshot && snapshot_time <= time_sub) {
            let buffer_empty = !local.buffer.has_next();
            if local.queue.link(sub, aindex) {
                core.notify |= NotifyFlags::SNAPSHOT_AVAILABLE;
                if buffer_empty {
                    core.notify |= NotifyFlags::DATA_AVAILABLE;
                }
            }
        }
    }

    /// Stops snapshot delivery for a row being removed.
    fn dequeue_record(&self, local: &mut AgentLocal, sub: &SubMatrix, aindex: usize) {
        let last = sub.get(aindex, LAST_RECORD);
        if last != 0 {
            local.buffer.unlink_from(last);
        }
        sub.set(aindex, LAST_RECORD, 0);
        sub.set(aindex, TIME_KNOWN, sub.get(aindex, TIME_SUB));
        local.queue.cleanup_empty_head(sub, aindex, |i| {
            sub.get(i, TIME_KNOWN) == sub.get(i, TIME_SUB)
        });
    }

    /// History buffer of a total row, created on first use.
    pub(super) fn history_buffer_id(&self, core: &mut Core, tsub: &SubMatrix, tindex: usize) -> i64 {
        let hid = tsub.get(tindex, HISTORY_ID);
        if hid != 0 {
            return hid;
        }
        let hid = core.histories.insert(HistoryBuffer::new());
        tsub.set(tindex, HISTORY_ID, hid);
        hid
    }

    // ========== Completion and rehash ==========

    fn subscription_change_complete(&self, core: &mut Core, agent: &Arc<AgentInner>, local: &mut AgentLocal) {
        if local.reduced_sub && !self.is_history() {
            let sub = agent.sub.load_full();
            let removed = local.buffer.retain(|event| {
                let key = self.lookup_key(&event.symbol);
                if key == 0 {
                    return false;
                }
                let index = sub.get_index(key, event.rid);
                index != 0 && sub.get(index, PREV_AGENT) != 0
            });
            if removed > 0 {
                log::trace!("[agent #{}] {} buffered records unsubscribed", agent.number, removed);
            }
        }
        local.reduced_sub = false;
        self.rehash_agent_if_needed(core, agent, local);
        self.rehash_total_if_needed(core);
        self.mapper.rehash_if_needed();
    }

    /// Rehashes the agent table, pointing previous chain rows at the new
    /// row indices. Skipped while a cursor walks the table.
    pub(super) fn rehash_agent_if_needed(&self, core: &Core, agent: &AgentInner, local: &mut AgentLocal) {
        if local.setter_cleanup != 0 || local.close_cursor != 0 {
            return;
        }
        let old = agent.sub.load_full();
        if !old.need_rehash() {
            return;
        }
        let new = old.rehash();
        let tsub = self.total.load_full();
        for index in new.rows() {
            if !new.is_payload(index) {
                continue;
            }
            let key = new.key(index);
            let rid = new.rid(index);
            let prev = new.get(index, PREV_AGENT) as usize;
            let psub = if prev == TOTAL_AGENT_NUMBER {
                tsub.clone()
            } else {
                core.agent(prev, &self.fatal).sub.load_full()
            };
            let pindex = psub.get_index(key, rid);
            if pindex == 0 {
                self.fatal.fatal(format!("Previous agent #{} misses entry", prev));
            }
            psub.set(pindex, NEXT_INDEX, index as i64);
        }
        local.queue.fix(&new, &old);
        log::trace!(
            "[agent #{}] subscription rehashed: {} -> {} cells",
            agent.number,
            old.len_cells(),
            new.len_cells()
        );
        agent.sub.store(Arc::new(new));
        agent.bump_sub_mod_count();
    }

    pub(super) fn rehash_total_if_needed(&self, core: &mut Core) {
        let old = self.total.load_full();
        if !old.need_rehash() {
            return;
        }
        if self.is_history() {
            self.expire_kept_totals(core, Instant::now());
        }
        let new = old.rehash();
        log::trace!(
            "[collector] total subscription rehashed: {} -> {} cells",
            old.len_cells(),
            new.len_cells()
        );
        self.total.store(Arc::new(new));
    }

    // ========== Closing ==========

    pub fn close_part(self: &Arc<Self>, agent: &Arc<AgentInner>, notify: NotifyFlags) -> NotifyFlags {
        let (flags, pending) = {
            let mut core = self.core.lock("close");
            core.start_batch(self.config.subscription_bucket, notify);
            self.expire_sticky(&mut core);
            if agent.is_active() {
                let mut local = agent.local.lock();
                agent.set_state(CLOSING);
                agent.bump_sub_mod_count();
                local.setter_cleanup = 0;
                local.close_cursor = agent.sub.load().len_cells();
                local.buffer.clear_blocked();
                agent.drained.notify_all();
                core.closing.push_back(agent.clone());
                log::debug!("[agent #{}] closing", agent.number);
            }
            self.help_close(&mut core);
            if !agent.is_closed() {
                core.notify |= NotifyFlags::HAS_MORE;
            }
            let pending = self.take_pending_distributors(&mut core);
            (core.done_batch(), pending)
        };
        self.fire_distributors(pending);
        flags
    }

    /// Spends the remaining step budget on agents being closed.
    pub(super) fn help_close(&self, core: &mut Core) {
        while let Some(agent) = core.closing.front().cloned() {
            if core.steps == 0 {
                return;
            }
            let mut local = agent.local.lock();
            agent.bump_sub_mod_count();
            let sub = agent.sub.load_full();
            while local.close_cursor > 0 && core.steps > 0 {
                local.close_cursor -= sub.step();
                let index = local.close_cursor;
                if index > 0 && sub.is_payload(index) {
                    self.remove_sub_existing(core, &mut local, &sub, index);
                }
                core.steps -= 1;
            }
            if local.close_cursor > 0 {
                return;
            }
            local.buffer.clear();
            local.queue = Default::default();
            local.notified = NotifyFlags::empty();
            sub.close();
            self.mapper.dec_max_counter(self.scheme.record_count());
            agent.set_state(CLOSED);
            agent.clear_listeners();
            agent.drained.notify_all();
            drop(local);
            core.closing.pop_front();
            if let Some(slot) = core.agents.get_mut(agent.number) {
                *slot = None;
            }
            log::debug!("[agent #{}] closed", agent.number);
            self.rehash_total_if_needed(core);
            self.mapper.rehash_if_needed();
        }
    }
}
