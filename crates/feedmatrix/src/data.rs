// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Data model shared by producers, the collector and consumers.
//!
//! - [`DataScheme`]: fixed set of record kinds plus the symbol codec
//! - [`Symbol`]: either a cipher from the codec or an arbitrary string
//! - [`RecordEvent`]: one record instance (also used for subscription entries)
//! - [`RecordSink`]: destination for retrieval and examination

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};
use std::sync::Arc;

/// Mask of bits marking a valid cipher. Interned keys never have these bits.
pub const VALID_CIPHER: i32 = 0xC000_0000_u32 as i32;

// ============================================================================
// Symbol codec
// ============================================================================

/// Reversible encoding of common symbols into 31-bit ciphers.
pub trait SymbolCodec: Send + Sync + fmt::Debug {
    /// Returns the cipher for `symbol`, or 0 if it cannot be encoded.
    fn encode(&self, symbol: &str) -> i32;
    /// Decodes a cipher previously returned by [`SymbolCodec::encode`].
    fn decode(&self, cipher: i32) -> Option<String>;
}

/// Packs up to six characters of `[A-Z._$/-]` into five-bit groups.
#[derive(Debug, Default, Clone, Copy)]
pub struct CompactCodec;

const COMPACT_MARK: i32 = 0x4000_0000;
const COMPACT_CHARS: usize = 6;
const COMPACT_ALPHABET: &[u8; 31] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ._$/-";

impl CompactCodec {
    fn code(c: u8) -> Option<i32> {
        COMPACT_ALPHABET
            .iter()
            .position(|&a| a == c)
            .map(|p| p as i32 + 1)
    }
}

impl SymbolCodec for CompactCodec {
    fn encode(&self, symbol: &str) -> i32 {
        let bytes = symbol.as_bytes();
        if bytes.is_empty() || bytes.len() > COMPACT_CHARS {
            return 0;
        }
        let mut bits = 0;
        for (i, &c) in bytes.iter().enumerate() {
            match Self::code(c) {
                Some(code) => bits |= code << (5 * (COMPACT_CHARS - 1 - i)),
                None => return 0,
            }
        }
        COMPACT_MARK | bits
    }

    fn decode(&self, cipher: i32) -> Option<String> {
        if cipher & VALID_CIPHER != COMPACT_MARK {
            return None;
        }
        let mut out = String::with_capacity(COMPACT_CHARS);
        for i in 0..COMPACT_CHARS {
            let code = (cipher >> (5 * (COMPACT_CHARS - 1 - i))) & 0x1F;
            if code == 0 {
                break;
            }
            out.push(COMPACT_ALPHABET[(code - 1) as usize] as char);
        }
        if out.is_empty() {
            None
        } else {
            Some(out)
        }
    }
}

// ============================================================================
// Symbols and records
// ============================================================================

/// Symbol reference as carried by events.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Symbol {
    /// Encoded symbol; must carry [`VALID_CIPHER`] bits.
    Cipher(i32),
    /// Symbol that the codec cannot encode.
    Text(Arc<str>),
}

impl Symbol {
    pub fn cipher(&self) -> i32 {
        match self {
            Symbol::Cipher(c) => *c,
            Symbol::Text(_) => 0,
        }
    }

    pub fn text(&self) -> Option<&str> {
        match self {
            Symbol::Cipher(_) => None,
            Symbol::Text(s) => Some(s),
        }
    }
}

/// Descriptor of one record kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataRecord {
    id: usize,
    name: String,
    has_time: bool,
}

impl DataRecord {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether events of this kind are ordered by time within a symbol.
    pub fn has_time(&self) -> bool {
        self.has_time
    }
}

/// Immutable set of record kinds known at startup.
#[derive(Debug, Clone)]
pub struct DataScheme {
    records: Vec<DataRecord>,
    by_name: HashMap<String, usize>,
    codec: Arc<dyn SymbolCodec>,
}

impl DataScheme {
    /// Builds a scheme with the [`CompactCodec`].
    pub fn new<S: AsRef<str>>(records: &[(S, bool)]) -> Self {
        Self::with_codec(records, Arc::new(CompactCodec))
    }

    pub fn with_codec<S: AsRef<str>>(records: &[(S, bool)], codec: Arc<dyn SymbolCodec>) -> Self {
        let records: Vec<DataRecord> = records
            .iter()
            .enumerate()
            .map(|(id, (name, has_time))| DataRecord {
                id,
                name: name.as_ref().to_string(),
                has_time: *has_time,
            })
            .collect();
        let by_name = records.iter().map(|r| (r.name.clone(), r.id)).collect();
        Self {
            records,
            by_name,
            codec,
        }
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    pub fn record(&self, rid: usize) -> Result<&DataRecord> {
        self.records
            .get(rid)
            .ok_or_else(|| Error::UnknownRecord(format!("#{}", rid)))
    }

    pub fn records(&self) -> &[DataRecord] {
        &self.records
    }

    pub fn find_record(&self, name: &str) -> Option<&DataRecord> {
        self.by_name.get(name).map(|&rid| &self.records[rid])
    }

    /// Looks up the record id by name.
    pub fn rid(&self, name: &str) -> Result<usize> {
        self.by_name
            .get(name)
            .copied()
            .ok_or_else(|| Error::UnknownRecord(name.to_string()))
    }

    pub fn codec(&self) -> &Arc<dyn SymbolCodec> {
        &self.codec
    }

    /// Encodes `symbol` with the codec, falling back to text form.
    pub fn symbol(&self, symbol: &str) -> Symbol {
        match self.codec.encode(symbol) {
            0 => Symbol::Text(Arc::from(symbol)),
            cipher => Symbol::Cipher(cipher),
        }
    }

    /// Human-readable form of `symbol`.
    pub fn decode_symbol(&self, symbol: &Symbol) -> String {
        match symbol {
            Symbol::Cipher(c) => self
                .codec
                .decode(*c)
                .unwrap_or_else(|| format!("#{:08x}", c)),
            Symbol::Text(s) => s.to_string(),
        }
    }
}

// ============================================================================
// Event flags
// ============================================================================

/// Per-event transaction and snapshot flags.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct EventFlags(u32);

impl EventFlags {
    pub const TX_PENDING: Self = Self(0x01);
    pub const REMOVE_EVENT: Self = Self(0x02);
    pub const SNAPSHOT_BEGIN: Self = Self(0x04);
    pub const SNAPSHOT_END: Self = Self(0x08);
    pub const SNAPSHOT_SNIP: Self = Self(0x10);
    pub const SNAPSHOT_MODE: Self = Self(0x40);
    /// Only meaningful in subscription sources: remove instead of add.
    pub const REMOVE_SYMBOL: Self = Self(0x80);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    #[must_use]
    pub const fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    #[must_use]
    pub const fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }
}

impl BitOr for EventFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for EventFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for EventFlags {
    type Output = Self;
    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl fmt::Debug for EventFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(EventFlags, &str); 7] = [
            (EventFlags::TX_PENDING, "TX_PENDING"),
            (EventFlags::REMOVE_EVENT, "REMOVE_EVENT"),
            (EventFlags::SNAPSHOT_BEGIN, "SNAPSHOT_BEGIN"),
            (EventFlags::SNAPSHOT_END, "SNAPSHOT_END"),
            (EventFlags::SNAPSHOT_SNIP, "SNAPSHOT_SNIP"),
            (EventFlags::SNAPSHOT_MODE, "SNAPSHOT_MODE"),
            (EventFlags::REMOVE_SYMBOL, "REMOVE_SYMBOL"),
        ];
        let mut first = true;
        for (flag, name) in NAMES {
            if self.contains(flag) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        if first {
            f.write_str("0")?;
        }
        Ok(())
    }
}

// ============================================================================
// Events and sinks
// ============================================================================

/// One record instance, or one subscription entry when used as a
/// subscription source (values empty, `time` is the lower bound).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordEvent {
    pub rid: usize,
    pub symbol: Symbol,
    pub time: i64,
    pub flags: EventFlags,
    pub values: Vec<i64>,
}

impl RecordEvent {
    pub fn new(rid: usize, symbol: Symbol) -> Self {
        Self {
            rid,
            symbol,
            time: 0,
            flags: EventFlags::empty(),
            values: Vec::new(),
        }
    }

    /// Subscription entry with the given lower time bound.
    pub fn subscription(rid: usize, symbol: Symbol, time: i64) -> Self {
        Self::new(rid, symbol).with_time(time)
    }

    #[must_use]
    pub fn with_time(mut self, time: i64) -> Self {
        self.time = time;
        self
    }

    #[must_use]
    pub fn with_flags(mut self, flags: EventFlags) -> Self {
        self.flags = flags;
        self
    }

    #[must_use]
    pub fn with_values(mut self, values: Vec<i64>) -> Self {
        self.values = values;
        self
    }

    pub fn is_remove(&self) -> bool {
        self.flags.contains(EventFlags::REMOVE_EVENT)
    }
}

/// Destination of retrieved or examined events.
pub trait RecordSink {
    /// Whether the sink accepts more events.
    fn has_capacity(&self) -> bool {
        true
    }

    fn append(&mut self, event: RecordEvent);

    /// Called after a batch of appends.
    fn flush(&mut self) {}
}

impl RecordSink for Vec<RecordEvent> {
    fn append(&mut self, event: RecordEvent) {
        self.push(event);
    }
}

/// Growable event buffer with an optional capacity limit.
#[derive(Debug, Default, Clone)]
pub struct RecordBuffer {
    events: Vec<RecordEvent>,
    limit: Option<usize>,
    flushes: usize,
}

impl RecordBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer that reports no capacity once `limit` events are held.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::default()
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn events(&self) -> &[RecordEvent] {
        &self.events
    }

    pub fn flush_count(&self) -> usize {
        self.flushes
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    pub fn into_events(self) -> Vec<RecordEvent> {
        self.events
    }
}

impl RecordSink for RecordBuffer {
    fn has_capacity(&self) -> bool {
        self.limit.map_or(true, |limit| self.events.len() < limit)
    }

    fn append(&mut self, event: RecordEvent) {
        self.events.push(event);
    }

    fn flush(&mut self) {
        self.flushes += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compact_codec_round_trip() {
        let codec = CompactCodec;
        for symbol in ["A", "IBM", "AAPL", "BRK.B", "ES$_Z"] {
            let cipher = codec.encode(symbol);
            assert_ne!(cipher, 0, "{} must encode", symbol);
            assert_ne!(cipher & VALID_CIPHER, 0);
            assert_eq!(codec.decode(cipher).as_deref(), Some(symbol));
        }
    }

    #[test]
    fn test_compact_codec_rejects() {
        let codec = CompactCodec;
        assert_eq!(codec.encode(""), 0);
        assert_eq!(codec.encode("GOOGLEX"), 0);
        assert_eq!(codec.encode("msft"), 0);
        assert_eq!(codec.encode("7203.T"), 0);
    }

    #[test]
    fn test_scheme_lookup() -> std::result::Result<(), String> {
        let scheme = DataScheme::new(&[("Quote", false), ("Candle", true)]);
        assert_eq!(scheme.rid("Candle").map_err(|e| e.to_string())?, 1);
        assert!(scheme.find_record("Trade").is_none());
        assert!(matches!(scheme.rid("Trade"), Err(Error::UnknownRecord(_))));
        assert!(scheme.record(1).map_err(|e| e.to_string())?.has_time());
        assert!(matches!(scheme.symbol("AAPL"), Symbol::Cipher(_)));
        assert_eq!(scheme.symbol("aapl"), Symbol::Text(Arc::from("aapl")));
        assert_eq!(scheme.decode_symbol(&scheme.symbol("AAPL")), "AAPL");
        Ok(())
    }

    #[test]
    fn test_event_flags_ops() {
        let flags = EventFlags::SNAPSHOT_BEGIN | EventFlags::TX_PENDING;
        assert!(flags.contains(EventFlags::TX_PENDING));
        assert!(!flags.contains(EventFlags::SNAPSHOT_END));
        assert_eq!(flags.without(EventFlags::TX_PENDING), EventFlags::SNAPSHOT_BEGIN);
        assert_eq!(format!("{:?}", flags), "TX_PENDING|SNAPSHOT_BEGIN");
        assert_eq!(format!("{:?}", EventFlags::empty()), "0");
    }

    #[test]
    fn test_record_buffer_limit() {
        let mut buf = RecordBuffer::with_limit(1);
        assert!(buf.has_capacity());
        buf.append(RecordEvent::new(0, Symbol::Cipher(COMPACT_MARK | 1)));
        assert!(!buf.has_capacity());
        assert_eq!(buf.len(), 1);
    }
}
