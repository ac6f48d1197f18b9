// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

#![allow(clippy::uninlined_format_args)] // Test code readability over pedantic
#![allow(clippy::missing_panics_doc)] // Tests panic on failure

//! Total subscription invariants under randomized agent activity, plus
//! set semantics and sticky removal.

use feedmatrix::{Agent, Collector, CollectorConfig, Contract, DataScheme, RecordEvent, Symbol};
use std::collections::{BTreeSet, HashSet};
use std::thread;
use std::time::Duration;

const RECORDS: usize = 2;

fn collector_with(config: CollectorConfig) -> Collector {
    Collector::builder(DataScheme::new(&[("Quote", false), ("Trade", false)]), Contract::Stream)
        .config(config)
        .build()
        .expect("collector")
}

/// Long names do not fit the compact codec and go through the mapper.
fn pool() -> Vec<String> {
    let mut names: Vec<String> = (0..24).map(|i| format!("INSTRUMENT_{:03}", i)).collect();
    names.extend(["IBM", "MSFT", "AAPL", "GOOG"].iter().map(|s| (*s).to_string()));
    names
}

fn entry(collector: &Collector, rid: usize, name: &str) -> RecordEvent {
    RecordEvent::subscription(rid, collector.scheme().symbol(name), 0)
}

fn examined(collector: &Collector) -> BTreeSet<(usize, String)> {
    let mut out = Vec::new();
    collector.examine_subscription(&mut out);
    out.iter()
        .map(|e| (e.rid, collector.scheme().decode_symbol(&e.symbol)))
        .collect()
}

fn check(collector: &Collector, agents: &[Agent], model: &[HashSet<(usize, String)>], names: &[String]) -> Result<(), String> {
    let problems = collector.verify();
    if !problems.is_empty() {
        return Err(format!("verify: {:?}", problems));
    }
    let mut union = HashSet::new();
    for (agent, held) in agents.iter().zip(model) {
        union.extend(held.iter().cloned());
        for name in names {
            let symbol: Symbol = collector.scheme().symbol(name);
            for rid in 0..RECORDS {
                let expected = held.contains(&(rid, name.clone()));
                if agent.is_subscribed(rid, &symbol, 0) != expected {
                    return Err(format!("agent #{} {}/{} expected {}", agent.number(), rid, name, expected));
                }
            }
        }
    }
    for name in names {
        let symbol = collector.scheme().symbol(name);
        for rid in 0..RECORDS {
            let expected = union.contains(&(rid, name.clone()));
            if collector.is_subscribed(rid, &symbol, 0) != expected {
                return Err(format!("total {}/{} expected {}", rid, name, expected));
            }
        }
    }
    if collector.subscription_size() != union.len() {
        return Err(format!("size {} != {}", collector.subscription_size(), union.len()));
    }
    Ok(())
}

#[test]
fn test_random_activity_keeps_total_consistent() -> Result<(), String> {
    let collector = collector_with(CollectorConfig {
        subscription_bucket: 3,
        ..CollectorConfig::default()
    });
    let names = pool();
    let mut rng = fastrand::Rng::with_seed(7);
    let agents: Vec<Agent> = (0..4).map(|_| collector.create_agent().expect("agent")).collect();
    let mut model: Vec<HashSet<(usize, String)>> = vec![HashSet::new(); agents.len()];

    for step in 0..400 {
        let a = rng.usize(..agents.len());
        let n = rng.usize(1..6);
        let picked: Vec<(usize, String)> = (0..n)
            .map(|_| (rng.usize(..RECORDS), names[rng.usize(..names.len())].clone()))
            .collect();
        let entries: Vec<RecordEvent> = picked.iter().map(|(rid, name)| entry(&collector, *rid, name)).collect();
        match rng.u8(..10) {
            0..=4 => {
                agents[a].add_subscription(&entries).map_err(|e| e.to_string())?;
                model[a].extend(picked);
            }
            5..=8 => {
                agents[a].remove_subscription(&entries).map_err(|e| e.to_string())?;
                for p in &picked {
                    model[a].remove(p);
                }
            }
            _ => {
                agents[a].set_subscription(&entries).map_err(|e| e.to_string())?;
                model[a] = picked.into_iter().collect();
            }
        }
        if step % 20 == 0 {
            check(&collector, &agents, &model, &names).map_err(|e| format!("step {}: {}", step, e))?;
        }
    }
    check(&collector, &agents, &model, &names)?;

    for agent in &agents {
        agent.close();
    }
    if collector.subscription_size() != 0 {
        return Err(format!("{} entries left after close", collector.subscription_size()));
    }
    let problems = collector.verify();
    if !problems.is_empty() {
        return Err(format!("verify after close: {:?}", problems));
    }
    Ok(())
}

#[test]
fn test_subscribe_then_unsubscribe_restores_total() {
    let collector = collector_with(CollectorConfig::default());
    let base = collector.create_agent().expect("agent");
    base.add_subscription(&[entry(&collector, 0, "IBM")]).expect("add");
    let before = examined(&collector);

    let agent = collector.create_agent().expect("agent");
    let entries = [entry(&collector, 0, "IBM"), entry(&collector, 1, "INSTRUMENT_X")];
    agent.add_subscription(&entries).expect("add");
    assert_eq!(examined(&collector).len(), 2);
    agent.remove_subscription(&entries).expect("remove");
    assert_eq!(examined(&collector), before);
    assert!(collector.verify().is_empty());
}

#[test]
fn test_readding_is_noop() {
    let collector = collector_with(CollectorConfig::default());
    let agent = collector.create_agent().expect("agent");
    let entries = [entry(&collector, 0, "IBM"), entry(&collector, 0, "INSTRUMENT_Y")];
    agent.add_subscription(&entries).expect("add");
    agent.add_subscription(&entries).expect("add again");
    assert_eq!(agent.subscription_size(), 2);
    assert_eq!(collector.subscription_size(), 2);
    assert!(collector.verify().is_empty());
}

#[test]
fn test_set_subscription_replaces_previous_set() {
    let collector = collector_with(CollectorConfig {
        subscription_bucket: 1,
        ..CollectorConfig::default()
    });
    let agent = collector.create_agent().expect("agent");
    agent
        .set_subscription(&[entry(&collector, 0, "A"), entry(&collector, 0, "B")])
        .expect("set");
    agent
        .set_subscription(&[entry(&collector, 0, "B"), entry(&collector, 0, "C")])
        .expect("set");
    let mut out = Vec::new();
    agent.examine_subscription(&mut out);
    let held: BTreeSet<String> = out
        .iter()
        .map(|e| collector.scheme().decode_symbol(&e.symbol))
        .collect();
    assert_eq!(held, ["B", "C"].iter().map(|s| (*s).to_string()).collect());
    assert!(collector.verify().is_empty());
}

#[test]
fn test_sticky_entry_outlives_last_subscriber() {
    let collector = collector_with(CollectorConfig {
        sticky_period_ms: 100,
        ..CollectorConfig::default()
    });
    let distributor = collector.distributor();
    let agent = collector.create_agent().expect("agent");
    let ibm = [entry(&collector, 0, "IBM")];
    let msft = [entry(&collector, 0, "MSFT")];
    agent.add_subscription(&ibm).expect("add");
    agent.add_subscription(&msft).expect("add");

    agent.remove_subscription(&ibm).expect("remove");
    agent.remove_subscription(&msft).expect("remove");
    let mut removed = Vec::new();
    distributor.retrieve_removed_subscription(&mut removed);
    assert!(removed.is_empty());

    // resubscribing before expiry cancels the removal
    agent.add_subscription(&msft).expect("resubscribe");
    thread::sleep(Duration::from_millis(300));
    collector.expire_sticky_subscriptions();
    distributor.retrieve_removed_subscription(&mut removed);
    assert_eq!(removed.len(), 1);
    assert_eq!(collector.scheme().decode_symbol(&removed[0].symbol), "IBM");
    assert!(collector.is_subscribed(0, &collector.scheme().symbol("MSFT"), 0));
    assert!(collector.verify().is_empty());
}
