// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Read access to history storage and its explicit removal.

use super::layout::*;
use super::{CollectorInner, Contract};
use crate::data::{RecordEvent, RecordSink, Symbol};
use crate::error::{Error, Result};
use crate::history::{EntryRef, HistoryBuffer};

impl CollectorInner {
    fn require_history(&self, op: &'static str) -> Result<()> {
        match self.contract {
            Contract::History => Ok(()),
            Contract::Stream => Err(Error::Unsupported(op)),
        }
    }

    fn check_entry(&self, op: &'static str, rid: usize, symbol: &Symbol) -> Result<()> {
        self.require_history(op)?;
        let record = self.scheme.record(rid)?;
        if !record.has_time() {
            return Err(Error::RecordWithoutTime(record.name().to_string()));
        }
        Self::check_symbol(symbol)
    }

    /// Runs `f` on the storage of one entry under the structural lock, or
    /// returns `default` when nothing is stored for it.
    pub(super) fn with_history<T>(
        &self,
        rid: usize,
        symbol: &Symbol,
        op: &'static str,
        f: impl FnOnce(&mut HistoryBuffer) -> T,
        default: T,
    ) -> Result<T> {
        self.check_entry(op, rid, symbol)?;
        let key = self.lookup_key(symbol);
        if key == 0 {
            return Ok(default);
        }
        let mut core = self.core.lock(op);
        let tsub = self.total.load();
        let tindex = tsub.get_index(key, rid);
        if tindex == 0 {
            return Ok(default);
        }
        Ok(match core.histories.get_mut(tsub.get(tindex, HISTORY_ID)) {
            Some(hb) => f(hb),
            None => default,
        })
    }

    pub(super) fn examine_data(
        &self,
        rid: usize,
        symbol: &Symbol,
        start: i64,
        end: i64,
        sink: &mut dyn RecordSink,
    ) -> Result<bool> {
        let entry = EntryRef { rid, symbol };
        let more = self.with_history(
            rid,
            symbol,
            "examine_data",
            |hb| {
                if start > end {
                    hb.examine_range_rtl(entry, start, end, sink)
                } else {
                    hb.examine_range_ltr(entry, start, end, sink)
                }
            },
            false,
        );
        sink.flush();
        more
    }

    /// Each entry is examined under its own lock acquisition.
    pub(super) fn examine_all_data(&self, sink: &mut dyn RecordSink) -> Result<bool> {
        self.require_history("examine_all_data")?;
        let tsub = self.total.load_full();
        let mut in_batch = 0;
        for tindex in tsub.rows() {
            if !tsub.is_payload(tindex) || tsub.get(tindex, HISTORY_ID) == 0 {
                continue;
            }
            let mut core = self.core.lock("examine_all_data");
            let Some(hb) = core.histories.get_mut(tsub.get(tindex, HISTORY_ID)) else {
                continue;
            };
            let Some(symbol) = self.try_symbol_of(tsub.key(tindex)) else {
                continue;
            };
            let entry = EntryRef {
                rid: tsub.rid(tindex),
                symbol: &symbol,
            };
            let more = hb.examine_snapshot(entry, i64::MIN, sink);
            in_batch += hb.n_examined;
            drop(core);
            if more {
                sink.flush();
                return Ok(true);
            }
            if in_batch >= self.config.examine_batch_size {
                sink.flush();
                in_batch = 0;
            }
        }
        sink.flush();
        Ok(false)
    }

    /// Snapshot of each entry down to the entry's time.
    pub(super) fn examine_data_by_subscription(&self, entries: &[RecordEvent], sink: &mut dyn RecordSink) -> Result<bool> {
        for entry in entries {
            self.check_entry("examine_data_by_subscription", entry.rid, &entry.symbol)?;
        }
        let mut in_batch = 0;
        for entry in entries {
            let key = self.lookup_key(&entry.symbol);
            if key == 0 {
                continue;
            }
            let mut core = self.core.lock("examine_data_by_subscription");
            let tsub = self.total.load();
            let tindex = tsub.get_index(key, entry.rid);
            if tindex == 0 {
                continue;
            }
            let Some(hb) = core.histories.get_mut(tsub.get(tindex, HISTORY_ID)) else {
                continue;
            };
            let more = hb.examine_snapshot(
                EntryRef {
                    rid: entry.rid,
                    symbol: &entry.symbol,
                },
                entry.time,
                sink,
            );
            in_batch += hb.n_examined;
            drop(core);
            if more {
                sink.flush();
                return Ok(true);
            }
            if in_batch >= self.config.examine_batch_size {
                sink.flush();
                in_batch = 0;
            }
        }
        sink.flush();
        Ok(false)
    }

    /// Drops storage of `entries`. Rows kept only for storage go away with
    /// it; sticky rows stay.
    pub(super) fn remove_data(&self, entries: &[RecordEvent]) -> Result<()> {
        for entry in entries {
            self.check_entry("remove", entry.rid, &entry.symbol)?;
        }
        let mut core = self.core.lock("remove");
        let tsub = self.total.load_full();
        let mut removed = 0;
        for entry in entries {
            let key = self.lookup_key(&entry.symbol);
            if key == 0 {
                continue;
            }
            let tindex = tsub.get_index(key, entry.rid);
            if tindex == 0 {
                continue;
            }
            let hid = tsub.get(tindex, HISTORY_ID);
            if core.histories.remove(hid).is_some() {
                removed += 1;
            }
            tsub.set(tindex, HISTORY_ID, 0);
            if tsub.get(tindex, NEXT_AGENT) == KEPT && tsub.get(tindex, STICKY_STAMP) == 0 {
                tsub.set(tindex, NEXT_AGENT, 0);
                tsub.update_removed_payload();
            }
        }
        log::debug!("[collector] removed storage of {} entries", removed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::collector::{Collector, Contract};
    use crate::data::{DataScheme, EventFlags, RecordEvent, Symbol};
    use crate::error::Error;

    fn ibm() -> Symbol {
        Symbol::Text("IBM".into())
    }

    fn filled() -> (Collector, crate::agent::Agent) {
        let collector = Collector::new(DataScheme::new(&[("Candle", true)]), Contract::History).unwrap();
        let agent = collector.create_agent().unwrap();
        agent.add_subscription(&[RecordEvent::subscription(0, ibm(), 100)]).unwrap();
        let events: Vec<RecordEvent> = [300, 200, 100]
            .iter()
            .enumerate()
            .map(|(i, &t)| {
                let flags = if i == 0 { EventFlags::SNAPSHOT_BEGIN } else { EventFlags::empty() };
                RecordEvent::new(0, ibm()).with_time(t).with_flags(flags).with_values(vec![t / 10])
            })
            .collect();
        collector.distributor().process(&events).unwrap();
        (collector, agent)
    }

    #[test]
    fn test_range_direction_follows_bounds() {
        let (collector, _agent) = filled();
        let mut out = Vec::new();
        assert!(!collector.examine_data(0, &ibm(), 100, 250, &mut out).unwrap());
        assert_eq!(out.iter().map(|e| e.time).collect::<Vec<_>>(), vec![100, 200]);
        out.clear();
        collector.examine_data(0, &ibm(), 300, 150, &mut out).unwrap();
        // the snapshot covers 150, so its lower bound is reported as removed
        assert_eq!(out.iter().map(|e| e.time).collect::<Vec<_>>(), vec![300, 200, 150]);
        assert!(out[2].is_remove());
        assert_eq!(collector.available_count(0, &ibm(), 300, 150).unwrap(), 2);
        assert_eq!(collector.min_available_time(0, &ibm()).unwrap(), 100);
    }

    #[test]
    fn test_all_data_carries_snapshot_flags() {
        let (collector, _agent) = filled();
        let mut out = Vec::new();
        assert!(!collector.examine_all_data(&mut out).unwrap());
        assert_eq!(out.len(), 3);
        assert!(out[0].flags.contains(EventFlags::SNAPSHOT_BEGIN));
        assert!(out[2].flags.contains(EventFlags::SNAPSHOT_END));
    }

    #[test]
    fn test_by_subscription_stops_at_time() {
        let (collector, _agent) = filled();
        let mut out = Vec::new();
        collector
            .examine_data_by_subscription(&[RecordEvent::subscription(0, ibm(), 200)], &mut out)
            .unwrap();
        assert_eq!(out.iter().map(|e| e.time).collect::<Vec<_>>(), vec![300, 200]);
    }

    #[test]
    fn test_remove_drops_storage() {
        let (collector, _agent) = filled();
        collector.remove(&[RecordEvent::subscription(0, ibm(), 0)]).unwrap();
        assert_eq!(collector.stored_records(), 0);
        assert_eq!(collector.max_available_time(0, &ibm()).unwrap(), 0);
    }

    #[test]
    fn test_stream_collector_rejects_queries() {
        let collector = Collector::new(DataScheme::new(&[("Candle", true)]), Contract::Stream).unwrap();
        assert!(matches!(
            collector.min_available_time(0, &ibm()),
            Err(Error::Unsupported(_))
        ));
    }
}
