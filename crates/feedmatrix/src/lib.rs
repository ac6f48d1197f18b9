// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # feedmatrix - in-process market-data distribution
//!
//! Fans symbol-keyed records out from producers ([`Distributor`]) to many
//! concurrent consumers ([`Agent`]), each with its own subscription, and
//! optionally keeps per-symbol time-ordered history with consistent
//! snapshot delivery.
//!
//! ## Quick Start
//!
//! ```rust
//! use feedmatrix::{Collector, Contract, DataScheme, RecordEvent, Result, Symbol};
//!
//! fn main() -> Result<()> {
//!     let scheme = DataScheme::new(&[("Quote", false)]);
//!     let collector = Collector::new(scheme, Contract::Stream)?;
//!
//!     let agent = collector.create_agent()?;
//!     let aapl = Symbol::Text("AAPL".into());
//!     agent.add_subscription(&[RecordEvent::subscription(0, aapl.clone(), 0)])?;
//!
//!     collector
//!         .distributor()
//!         .process(&[RecordEvent::new(0, aapl).with_values(vec![101])])?;
//!
//!     let mut out = Vec::new();
//!     agent.retrieve(&mut out);
//!     assert_eq!(out.len(), 1);
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +---------------------------------------------------------------------+
//! |  Distributor::process            Agent::{add,remove,set}_subscription |
//! +---------------------------------------------------------------------+
//! |  Collector     total subscription, agent chains, closing, sticky    |
//! |                phase 1 under the structural lock                    |
//! +---------------------------------------------------------------------+
//! |  Agents        buffers, snapshot queues, overflow policies          |
//! |                phase 2 under per-agent locks                        |
//! +---------------------------------------------------------------------+
//! |  Storage       matrix tables, symbol mapping, history buffers       |
//! +---------------------------------------------------------------------+
//! ```
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Collector`] | Owns the total subscription and storage; factory for agents and distributors |
//! | [`Agent`] | Consumer with its own subscription and buffer |
//! | [`Distributor`] | Producer handle; learns which entries are wanted |
//! | [`RecordEvent`] | One record or one subscription entry |
//! | [`CollectorConfig`] | Buckets, batch sizes, retention and locking knobs |
//!
//! ## Modules Overview
//!
//! - [`collector`] - coordinator, contracts and listeners (start here)
//! - [`agent`] - consumer handles and buffers
//! - [`history`] - temporal storage and its snapshot state machine
//! - [`matrix`] - flat-array hash tables and symbol interning
//! - [`data`] - record scheme, symbols and events
//! - [`config`] - configuration and YAML loading

pub mod agent;
pub mod collector;
pub mod config;
pub mod data;
pub(crate) mod distribution;
pub mod error;
pub mod history;
pub mod matrix;

pub use agent::{Agent, AgentBuilder, OverflowStrategy};
pub use collector::{
    Collector, CollectorBuilder, CollectorCounters, Contract, Distributor, ErrorHandler,
    LogErrorHandler, NotifyFlags, RecordListener, SubscriptionCursor, SubscriptionListener,
};
pub use config::CollectorConfig;
pub use data::{
    CompactCodec, DataRecord, DataScheme, EventFlags, RecordBuffer, RecordEvent, RecordSink,
    Symbol, SymbolCodec,
};
pub use error::{Error, FatalError, FatalPolicy, Result};
pub use history::HistorySubscriptionFilter;
