// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Flat-array hash tables: sizing rules, symbol interning and the
//! `(key, rid)` subscription matrix.

pub mod hashing;
pub mod mapping;
pub mod sub_matrix;

pub use hashing::MagicSequence;
pub use mapping::{Mapper, Mapping};
pub use sub_matrix::{PayloadRule, SubMatrix, KEY, RID};
