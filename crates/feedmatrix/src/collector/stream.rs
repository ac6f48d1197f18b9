// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Stream contract: every incoming record goes to every subscribed agent.

use super::layout::*;
use super::{CollectorInner, Core};
use crate::agent::{AgentInner, AgentLocal};
use crate::data::{RecordEvent, RecordSink};
use crate::distribution::{DistFlags, Distribution, Source};
use std::sync::Arc;

impl CollectorInner {
    /// Walks the chain of each event's total row. Returns the position of
    /// the first event left for the next pass.
    pub(super) fn stream_phase1(&self, core: &mut Core, events: &[RecordEvent], start: usize, dist: &mut Distribution) -> usize {
        let tsub = self.total.load_full();
        let mut position = start;
        while position < events.len() && dist.has_capacity() {
            let event = &events[position];
            let source = Source::Event(position);
            position += 1;
            let key = self.lookup_key(&event.symbol);
            if key == 0 {
                continue;
            }
            let tindex = tsub.get_index(key, event.rid);
            if tindex == 0 {
                continue;
            }
            let mut nagent = tsub.get(tindex, NEXT_AGENT);
            let mut nindex = tsub.get(tindex, NEXT_INDEX) as usize;
            while nagent > 0 {
                let agent = core.agent(nagent as usize, &self.fatal);
                dist.add(agent, source, DistFlags::empty());
                let asub = agent.sub.load();
                nagent = asub.get(nindex, NEXT_AGENT);
                nindex = asub.get(nindex, NEXT_INDEX) as usize;
            }
        }
        position
    }

    /// Appends the agent's share of `dist` to its buffer. Returns the
    /// entry to resume from when the buffer blocks.
    pub(super) fn stream_update(
        &self,
        dist: &Distribution,
        events: &[RecordEvent],
        slot: usize,
        agent: &AgentInner,
        local: &mut AgentLocal,
    ) -> Option<usize> {
        let recheck = dist.slot(slot).sub_mod_count != agent.sub_mod_count();
        let sub = agent.sub.load_full();
        let mut added = 0;
        let mut index = dist.first_index(slot);
        while index != 0 {
            let entry = dist.entry(index);
            let event = Self::source_event(events, dist, entry.source);
            if recheck {
                let key = self.lookup_key(&event.symbol);
                let aindex = if key == 0 { 0 } else { sub.get_volatile_index(key, event.rid) };
                if aindex == 0 || sub.get(aindex, PREV_AGENT) == 0 {
                    index = dist.next_index(index);
                    continue;
                }
            }
            if local.buffer.block_new_record() {
                self.counters.add_outgoing(added);
                return Some(index);
            }
            if !local.buffer.drop_new_record(event) {
                local.buffer.push(event.clone(), 0);
                added += 1;
            }
            index = dist.next_index(index);
        }
        local.buffer.drop_old_records();
        self.counters.add_outgoing(added);
        None
    }

    pub(super) fn stream_retrieve(&self, agent: &AgentInner, sink: &mut dyn RecordSink) -> bool {
        let mut local = agent.local.lock();
        let n = local.buffer.retrieve(sink, usize::MAX);
        local.retrieved += n as u64;
        self.counters.add_retrieved(n as u64);
        if local.buffer.needs_rebase() {
            local.buffer.rebase();
        }
        if local.buffer.unblock() {
            agent.drained.notify_all();
        }
        let more = local.buffer.has_next();
        if !more {
            local.notified = Default::default();
        }
        more
    }

    pub(super) fn stream_force_rebase(&self, agent: &Arc<AgentInner>) {
        agent.local.lock().buffer.rebase();
    }
}

#[cfg(test)]
mod tests {
    use crate::agent::OverflowStrategy;
    use crate::collector::{Collector, Contract};
    use crate::data::{DataScheme, RecordEvent, Symbol};

    fn scheme() -> DataScheme {
        DataScheme::new(&[("Quote", false)])
    }

    fn quote(symbol: &str, bid: i64) -> RecordEvent {
        RecordEvent::new(0, Symbol::Text(symbol.into())).with_values(vec![bid])
    }

    #[test]
    fn test_only_subscribed_records_arrive() {
        let collector = Collector::new(scheme(), Contract::Stream).unwrap();
        let agent = collector.create_agent().unwrap();
        agent
            .add_subscription(&[RecordEvent::subscription(0, Symbol::Text("AAPL".into()), 0)])
            .unwrap();
        let distributor = collector.distributor();
        distributor
            .process(&[quote("AAPL", 1), quote("MSFT", 2), quote("AAPL", 3)])
            .unwrap();
        let mut out = Vec::new();
        assert!(!agent.retrieve(&mut out));
        let bids: Vec<i64> = out.iter().map(|e| e.values[0]).collect();
        assert_eq!(bids, vec![1, 3]);
        assert_eq!(collector.counters().outgoing_records, 2);
    }

    #[test]
    fn test_drop_newest_keeps_head() {
        let collector = Collector::new(scheme(), Contract::Stream).unwrap();
        let agent = collector
            .agent_builder()
            .max_buffer_size(2)
            .overflow_strategy(OverflowStrategy::DropNewest)
            .build()
            .unwrap();
        agent
            .add_subscription(&[RecordEvent::subscription(0, Symbol::Text("AAPL".into()), 0)])
            .unwrap();
        let events: Vec<RecordEvent> = (0..5).map(|i| quote("AAPL", i)).collect();
        collector.distributor().process(&events).unwrap();
        let mut out = Vec::new();
        agent.retrieve(&mut out);
        assert_eq!(out.iter().map(|e| e.values[0]).collect::<Vec<_>>(), vec![0, 1]);
        assert_eq!(agent.dropped_records(), 3);
        assert_eq!(collector.counters().dropped_records, 3);
    }

    #[test]
    fn test_removal_filters_buffered_records() {
        let collector = Collector::new(scheme(), Contract::Stream).unwrap();
        let agent = collector.create_agent().unwrap();
        let subs = [
            RecordEvent::subscription(0, Symbol::Text("AAPL".into()), 0),
            RecordEvent::subscription(0, Symbol::Text("IBM".into()), 0),
        ];
        agent.add_subscription(&subs).unwrap();
        collector
            .distributor()
            .process(&[quote("AAPL", 1), quote("IBM", 2)])
            .unwrap();
        agent.remove_subscription(&subs[..1]).unwrap();
        let mut out = Vec::new();
        agent.retrieve(&mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].symbol, Symbol::Text("IBM".into()));
    }
}
