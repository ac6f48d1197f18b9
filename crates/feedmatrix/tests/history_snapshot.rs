// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

#![allow(clippy::uninlined_format_args)] // Test code readability over pedantic
#![allow(clippy::missing_panics_doc)] // Tests panic on failure

//! History contract end to end: transactions, snips, unconditional
//! storage, retention limits and cleanup on close.

use feedmatrix::{
    Agent, Collector, CollectorConfig, Contract, DataScheme, Error, EventFlags,
    HistorySubscriptionFilter, RecordBuffer, RecordEvent, Symbol,
};

const CANDLE: usize = 0;

fn scheme() -> DataScheme {
    DataScheme::new(&[("Candle", true), ("Quote", false)])
}

fn history() -> Collector {
    Collector::new(scheme(), Contract::History).expect("collector")
}

fn candle(collector: &Collector, time: i64, flags: EventFlags) -> RecordEvent {
    RecordEvent::new(CANDLE, collector.scheme().symbol("AAPL"))
        .with_time(time)
        .with_flags(flags)
        .with_values(vec![time / 10])
}

fn subscribe(collector: &Collector, agent: &Agent, time: i64) {
    agent
        .add_subscription(&[RecordEvent::subscription(CANDLE, collector.scheme().symbol("AAPL"), time)])
        .expect("subscribe");
}

fn drain(agent: &Agent) -> Vec<RecordEvent> {
    let mut out = Vec::new();
    while agent.retrieve(&mut out) {}
    out
}

fn times(events: &[RecordEvent]) -> Vec<i64> {
    events.iter().map(|e| e.time).collect()
}

#[test]
fn test_explicit_transaction_after_snapshot() {
    let collector = history();
    let agent = collector.create_agent().expect("agent");
    subscribe(&collector, &agent, 100);
    let distributor = collector.distributor();
    distributor
        .process(&[
            candle(&collector, 300, EventFlags::SNAPSHOT_BEGIN),
            candle(&collector, 200, EventFlags::empty()),
            candle(&collector, 100, EventFlags::empty()),
        ])
        .expect("snapshot");
    let snapshot = drain(&agent);
    assert_eq!(times(&snapshot), vec![300, 200, 100]);
    assert!(snapshot[2].flags.contains(EventFlags::SNAPSHOT_END));

    distributor
        .process(&[candle(&collector, 250, EventFlags::TX_PENDING)])
        .expect("tx start");
    distributor
        .process(&[candle(&collector, 150, EventFlags::empty())])
        .expect("tx end");
    let out = drain(&agent);
    assert_eq!(times(&out), vec![250, 150]);
    assert_eq!(
        out.iter().map(|e| e.flags).collect::<Vec<_>>(),
        vec![EventFlags::TX_PENDING, EventFlags::empty()]
    );
    assert_eq!(collector.stored_records(), 5);
}

#[test]
fn test_snip_reaches_legacy_agent_as_removal() {
    let collector = history();
    let agent = collector.agent_builder().history_snapshot(false).build().expect("agent");
    subscribe(&collector, &agent, 0);
    let distributor = collector.distributor();
    distributor
        .process(&[
            candle(&collector, 30, EventFlags::SNAPSHOT_BEGIN),
            candle(&collector, 20, EventFlags::empty()),
            candle(&collector, 10, EventFlags::empty()),
        ])
        .expect("snapshot");
    assert_eq!(times(&drain(&agent)), vec![30, 20, 10]);

    distributor
        .process(&[candle(&collector, 20, EventFlags::SNAPSHOT_SNIP)])
        .expect("snip");
    let out = drain(&agent);
    assert_eq!(times(&out), vec![10]);
    assert_eq!(out[0].flags, EventFlags::REMOVE_EVENT);
    assert_eq!(collector.stored_records(), 2);
    let aapl = collector.scheme().symbol("AAPL");
    assert_eq!(collector.min_available_time(CANDLE, &aapl).expect("min time"), 20);
}

#[test]
fn test_store_everything_serves_late_subscriber() {
    let collector = Collector::builder(scheme(), Contract::History)
        .config(CollectorConfig {
            store_everything: true,
            ..CollectorConfig::default()
        })
        .build()
        .expect("collector");
    collector
        .distributor()
        .process(&[
            candle(&collector, 3, EventFlags::empty()),
            candle(&collector, 2, EventFlags::empty()),
            candle(&collector, 1, EventFlags::empty()),
        ])
        .expect("process");
    assert_eq!(collector.stored_records(), 3);
    assert_eq!(collector.subscription_size(), 0);

    let agent = collector.create_agent().expect("agent");
    subscribe(&collector, &agent, 0);
    let out = drain(&agent);
    assert_eq!(times(&out), vec![3, 2, 1]);
    assert_eq!(out.iter().map(|e| e.values[0]).collect::<Vec<_>>(), vec![0, 0, 0]);

    agent.close();
    assert_eq!(collector.stored_records(), 3, "storage outlives subscribers");
    assert!(collector.verify().is_empty(), "{:?}", collector.verify());
}

struct KeepTwo;

impl HistorySubscriptionFilter for KeepTwo {
    fn max_record_count(&self, _rid: usize, _symbol: &Symbol) -> usize {
        2
    }
}

#[test]
fn test_filter_caps_stored_records() {
    let collector = Collector::builder(scheme(), Contract::History)
        .history_filter(KeepTwo)
        .build()
        .expect("collector");
    let agent = collector.create_agent().expect("agent");
    subscribe(&collector, &agent, 0);
    let distributor = collector.distributor();
    for time in 1..=4 {
        distributor
            .process(&[candle(&collector, time * 10, EventFlags::empty())])
            .expect("process");
    }
    let aapl = collector.scheme().symbol("AAPL");
    assert_eq!(collector.stored_records(), 2);
    assert_eq!(collector.min_available_time(CANDLE, &aapl).expect("min time"), 30);
    assert_eq!(collector.max_available_time(CANDLE, &aapl).expect("max time"), 40);
}

#[test]
fn test_close_releases_stored_records() {
    let collector = history();
    let agent = collector.create_agent().expect("agent");
    subscribe(&collector, &agent, 0);
    collector
        .distributor()
        .process(&[candle(&collector, 2, EventFlags::empty()), candle(&collector, 1, EventFlags::empty())])
        .expect("process");
    assert_eq!(collector.stored_records(), 2);

    agent.close();
    assert_eq!(collector.stored_records(), 0);
    assert_eq!(collector.subscription_size(), 0);
    assert!(collector.verify().is_empty(), "{:?}", collector.verify());
}

#[test]
fn test_records_without_time_are_rejected_for_queries() {
    let collector = history();
    let result = collector.examine_data(1, &collector.scheme().symbol("AAPL"), 0, 10, &mut Vec::new());
    assert!(matches!(result, Err(Error::RecordWithoutTime(_))));
}

/// Drains `agent` through a sink that holds only `limit` events at a time.
fn drain_in_batches(collector: &Collector, agent: &Agent, limit: usize) -> Result<Vec<RecordEvent>, String> {
    let mut out = Vec::new();
    let mut sink = RecordBuffer::with_limit(limit);
    while agent.retrieve(&mut sink) {
        if sink.len() > limit {
            return Err(format!("sink overfilled: {} > {}", sink.len(), limit));
        }
        out.extend(sink.events().iter().cloned());
        sink.clear();
        let problems = collector.verify();
        if !problems.is_empty() {
            return Err(format!("verify while draining: {:?}", problems));
        }
    }
    out.extend(sink.into_events());
    Ok(out)
}

#[test]
fn test_large_snapshot_reaches_late_subscriber_in_small_batches() -> Result<(), String> {
    const RECORDS: i64 = 5000;
    const SUB_TIME: i64 = 2500;
    let collector = history();
    let first = collector.create_agent().map_err(|e| e.to_string())?;
    subscribe(&collector, &first, 0);
    let snapshot: Vec<RecordEvent> = (0..RECORDS)
        .rev()
        .map(|time| {
            let flags = if time == RECORDS - 1 { EventFlags::SNAPSHOT_BEGIN } else { EventFlags::empty() };
            candle(&collector, time, flags)
        })
        .collect();
    collector.distributor().process(&snapshot).map_err(|e| e.to_string())?;
    drain(&first);

    let late = collector.create_agent().map_err(|e| e.to_string())?;
    subscribe(&collector, &late, SUB_TIME);
    let out = drain_in_batches(&collector, &late, 7)?;
    let expected: Vec<i64> = (SUB_TIME..RECORDS).rev().collect();
    if times(&out) != expected {
        return Err(format!(
            "late subscriber got {} records, first {:?}, last {:?}",
            out.len(),
            out.first().map(|e| e.time),
            out.last().map(|e| e.time)
        ));
    }
    let end = out.iter().position(|e| e.flags.contains(EventFlags::SNAPSHOT_END));
    if end != Some(out.len() - 1) {
        return Err(format!("snapshot end at {:?}, expected the last record", end));
    }
    Ok(())
}

const MARKERS: [EventFlags; 7] = [
    EventFlags::empty(),
    EventFlags::empty(),
    EventFlags::TX_PENDING,
    EventFlags::SNAPSHOT_BEGIN,
    EventFlags::SNAPSHOT_END,
    EventFlags::SNAPSHOT_SNIP,
    EventFlags::REMOVE_EVENT,
];

/// Stored records must be strictly time ordered; examined newest first.
fn check_order(collector: &Collector) -> Result<(), String> {
    let aapl = collector.scheme().symbol("AAPL");
    let mut stored = Vec::new();
    collector
        .examine_data(CANDLE, &aapl, i64::MAX / 2, 1, &mut stored)
        .map_err(|e| e.to_string())?;
    if let Some(pair) = times(&stored).windows(2).find(|w| w[0] <= w[1]) {
        return Err(format!("stored times out of order: {:?}", pair));
    }
    Ok(())
}

#[test]
fn test_random_markers_keep_history_consistent() -> Result<(), String> {
    for seed in 0..20u64 {
        let mut rng = fastrand::Rng::with_seed(seed);
        let collector = history();
        let modern = collector.create_agent().map_err(|e| e.to_string())?;
        let legacy = collector
            .agent_builder()
            .history_snapshot(false)
            .build()
            .map_err(|e| e.to_string())?;
        subscribe(&collector, &modern, 1);
        subscribe(&collector, &legacy, 50);
        let distributor = collector.distributor();

        for step in 0..300 {
            let time = rng.i64(1..200);
            let flags = MARKERS[rng.usize(..MARKERS.len())];
            distributor
                .process(&[candle(&collector, time, flags)])
                .map_err(|e| format!("seed {} step {}: {}", seed, step, e))?;
            let problems = collector.verify();
            if !problems.is_empty() {
                return Err(format!("seed {} step {}: {:?}", seed, step, problems));
            }
            check_order(&collector).map_err(|e| format!("seed {} step {}: {}", seed, step, e))?;
            if rng.u8(..4) == 0 {
                for agent in [&modern, &legacy] {
                    drain_in_batches(&collector, agent, 5)
                        .map_err(|e| format!("seed {} step {}: {}", seed, step, e))?;
                }
            }
        }
    }
    Ok(())
}
