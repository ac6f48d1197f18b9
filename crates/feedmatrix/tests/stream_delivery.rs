// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

#![allow(clippy::uninlined_format_args)] // Test code readability over pedantic
#![allow(clippy::cast_possible_wrap)] // Test conversions
#![allow(clippy::missing_panics_doc)] // Tests panic on failure

//! Stream contract end to end: subscription, fan-out, overflow policies,
//! listeners and distributor subscription tracking.

use feedmatrix::{
    Agent, Collector, Contract, DataScheme, Error, EventFlags, OverflowStrategy, RecordEvent,
    Symbol,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn quotes() -> Collector {
    Collector::new(DataScheme::new(&[("Quote", false), ("Trade", false)]), Contract::Stream)
        .expect("collector")
}

fn sym(collector: &Collector, name: &str) -> Symbol {
    collector.scheme().symbol(name)
}

fn quote(collector: &Collector, name: &str, bid: i64) -> RecordEvent {
    RecordEvent::new(0, sym(collector, name)).with_values(vec![bid])
}

fn subscribe(agent: &Agent, collector: &Collector, name: &str) {
    agent
        .add_subscription(&[RecordEvent::subscription(0, sym(collector, name), 0)])
        .expect("subscribe");
}

#[test]
fn test_quote_updates_arrive_in_order_until_close() {
    let collector = quotes();
    let agent = collector.create_agent().expect("agent");
    subscribe(&agent, &collector, "AAPL");
    assert!(collector.is_subscribed(0, &sym(&collector, "AAPL"), 0));

    let updates: Vec<RecordEvent> = (1..=3).map(|bid| quote(&collector, "AAPL", bid)).collect();
    collector.distributor().process(&updates).expect("process");

    let mut out = Vec::new();
    assert!(!agent.retrieve(&mut out));
    assert_eq!(out, updates);

    agent.close();
    assert!(agent.is_closed());
    collector
        .distributor()
        .process(&[quote(&collector, "AAPL", 4)])
        .expect("process after close");
    out.clear();
    assert!(!agent.retrieve(&mut out));
    assert!(out.is_empty());
    assert_eq!(collector.subscription_size(), 0);
    assert!(!collector.is_subscribed(0, &sym(&collector, "AAPL"), 0));
    assert!(collector.verify().is_empty(), "{:?}", collector.verify());
    assert!(matches!(
        agent.add_subscription(&[RecordEvent::subscription(0, sym(&collector, "IBM"), 0)]),
        Err(Error::AgentClosed(_))
    ));
}

#[test]
fn test_drop_oldest_keeps_newest_records() {
    const M: i64 = 10;
    const K: usize = 4;
    let collector = quotes();
    let agent = collector
        .agent_builder()
        .max_buffer_size(K)
        .overflow_strategy(OverflowStrategy::DropOldest)
        .build()
        .expect("agent");
    subscribe(&agent, &collector, "IBM");
    let events: Vec<RecordEvent> = (0..M).map(|i| quote(&collector, "IBM", i)).collect();
    collector.distributor().process(&events).expect("process");

    let mut out = Vec::new();
    agent.retrieve(&mut out);
    let bids: Vec<i64> = out.iter().map(|e| e.values[0]).collect();
    assert_eq!(bids, (M - K as i64..M).collect::<Vec<_>>());
    assert_eq!(agent.dropped_records(), (M as u64) - K as u64);
    assert_eq!(collector.counters().dropped_records, (M as u64) - K as u64);
}

#[test]
fn test_block_waits_for_consumer() {
    let collector = quotes();
    let agent = collector
        .agent_builder()
        .max_buffer_size(2)
        .overflow_strategy(OverflowStrategy::Block)
        .build()
        .expect("agent");
    subscribe(&agent, &collector, "MSFT");

    let consumer = {
        let agent = agent.clone();
        thread::spawn(move || {
            let mut out = Vec::new();
            while out.len() < 10 {
                agent.retrieve(&mut out);
                thread::sleep(Duration::from_millis(1));
            }
            out
        })
    };
    let events: Vec<RecordEvent> = (0..10).map(|i| quote(&collector, "MSFT", i)).collect();
    collector.distributor().process(&events).expect("process");
    let out = consumer.join().expect("consumer thread");
    assert_eq!(out.iter().map(|e| e.values[0]).collect::<Vec<_>>(), (0..10).collect::<Vec<_>>());
    assert_eq!(agent.dropped_records(), 0);
}

#[test]
fn test_listener_fires_once_per_drain() {
    let collector = quotes();
    let agent = collector.create_agent().expect("agent");
    subscribe(&agent, &collector, "AAPL");
    let calls = Arc::new(AtomicUsize::new(0));
    {
        let calls = calls.clone();
        agent.set_record_listener(move |_: &Agent| -> feedmatrix::Result<()> {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
    }
    let distributor = collector.distributor();
    distributor.process(&[quote(&collector, "AAPL", 1)]).expect("process");
    distributor.process(&[quote(&collector, "AAPL", 2)]).expect("process");
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let mut out = Vec::new();
    assert!(!agent.retrieve(&mut out));
    distributor.process(&[quote(&collector, "AAPL", 3)]).expect("process");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn test_distributor_sees_total_changes() {
    let collector = quotes();
    let distributor = collector.distributor();
    let agent = collector.create_agent().expect("agent");
    let other = collector.create_agent().expect("agent");
    subscribe(&agent, &collector, "IBM");
    subscribe(&agent, &collector, "MSFT");
    subscribe(&other, &collector, "IBM");
    assert!(distributor.has_changes());

    let mut added = Vec::new();
    assert!(!distributor.retrieve_added_subscription(&mut added));
    let mut names: Vec<String> = added
        .iter()
        .map(|e| collector.scheme().decode_symbol(&e.symbol))
        .collect();
    names.sort();
    assert_eq!(names, vec!["IBM", "MSFT"]);

    agent
        .remove_subscription(&[RecordEvent::subscription(0, sym(&collector, "IBM"), 0)])
        .expect("remove");
    let mut removed = Vec::new();
    distributor.retrieve_removed_subscription(&mut removed);
    assert!(removed.is_empty(), "IBM is still held by the other agent");

    other.close();
    distributor.retrieve_removed_subscription(&mut removed);
    assert_eq!(removed.len(), 1);
    assert_eq!(collector.scheme().decode_symbol(&removed[0].symbol), "IBM");
    assert!(removed[0].flags.contains(EventFlags::REMOVE_SYMBOL));
}

#[test]
fn test_reserved_cipher_is_rejected_without_changes() {
    let collector = quotes();
    let agent = collector.create_agent().expect("agent");
    let result = agent.add_subscription(&[
        RecordEvent::subscription(0, sym(&collector, "IBM"), 0),
        RecordEvent::subscription(0, Symbol::Cipher(0x1234), 0),
    ]);
    assert!(matches!(result, Err(Error::ReservedCipher(0x1234))));
    assert_eq!(agent.subscription_size(), 0);
    assert!(matches!(
        collector.distributor().process(&[RecordEvent::new(7, sym(&collector, "IBM"))]),
        Err(Error::UnknownRecord(_))
    ));
}
