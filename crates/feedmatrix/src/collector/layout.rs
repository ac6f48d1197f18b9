// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Row layout of the total and agent subscription matrices.
//!
//! Every row starts with `KEY` and `RID` (see [`crate::matrix::sub_matrix`]).
//! Chain links are an agent number plus a row index in that agent's
//! table; the backward link stores only the number, the row is found by
//! re-probing `(key, rid)`.

use crate::matrix::PayloadRule;

pub use crate::matrix::{KEY, RID};

// ---- shared by total and agent rows

/// Number of the next agent in the chain, 0 at the end.
pub const NEXT_AGENT: usize = 2;
/// Row of the next agent's entry in its own table.
pub const NEXT_INDEX: usize = 3;

// ---- total rows

/// Lowest subscription time among subscribed agents.
pub const TIME_TOTAL: usize = 4;
/// Id of the history buffer in the store, 0 if none.
pub const HISTORY_ID: usize = 5;
/// Sticky expiration tick, 0 when the entry is not sticky.
pub const STICKY_STAMP: usize = 6;
pub const TOTAL_STEP: usize = 7;

/// `NEXT_AGENT` value of a total row kept without subscribed agents.
pub const KEPT: i64 = -1;

// ---- agent rows

/// Number of the previous agent, [`crate::config::TOTAL_AGENT_NUMBER`]
/// when the row follows the total row. Non-zero while subscribed.
pub const PREV_AGENT: usize = 4;
/// Set by phase 1 of a subscription replacement.
pub const ADDED_BY_SET: usize = 5;
pub const STREAM_STEP: usize = 6;

/// Subscription lower time bound.
pub const TIME_SUB: usize = 6;
/// Lower bound was raised by the history subscription filter.
pub const SUB_SNIP: usize = 7;
/// Lowest time delivered (or being delivered) from history storage.
pub const TIME_KNOWN: usize = 8;
/// Buffer position of the last record of this entry, 0 if none.
pub const LAST_RECORD: usize = 9;
/// Agent is transaction-dirty for this entry.
pub const TX_DIRTY: usize = 10;
/// Snapshot queue link: 0 not queued, [`QUEUE_EOL`] at the tail.
pub const QUEUE_NEXT: usize = 11;
/// Entry starts a fresh snapshot batch when it reaches the queue head.
pub const QUEUE_FRESH: usize = 12;
/// Phase-2 items pending for this row.
pub const PENDING: usize = 13;
/// Process version that stamped `PENDING`, 0 if idle.
pub const PROCESS_VERSION: usize = 14;
pub const HISTORY_STEP: usize = 15;

/// End of the snapshot queue.
pub const QUEUE_EOL: i64 = -1;

/// Largest pending count before a distribution pass is cut.
pub const MAX_PENDING: i64 = 8191;

pub const TOTAL_RULE: PayloadRule = PayloadRule::Field(NEXT_AGENT);
pub const AGENT_RULE: PayloadRule = PayloadRule::Field(PREV_AGENT);
