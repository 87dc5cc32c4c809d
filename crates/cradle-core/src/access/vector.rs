//! Growable bit vector used for entry, content and user access vectors.
//!
//! Bit `k` stands for the entry whose `acvec_offset` is `k`. Bit 0 is the
//! shared default bit: every entry without an allocated offset maps onto it
//! and every user holds it.

use serde::{Serialize, Serializer};

const WORD_BITS: usize = 64;

/// Offset of the shared default bit.
pub const DEFAULT_OFFSET: i64 = 0;

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct AccessVector {
    // Little-endian words; trailing zero words are always trimmed so that
    // equal sets compare equal.
    words: Vec<u64>,
}

impl AccessVector {
    pub fn new() -> Self {
        Self { words: Vec::new() }
    }

    /// The vector of an object that references no entity.
    pub fn default_vector() -> Self {
        Self::with_bit(DEFAULT_OFFSET as usize)
    }

    pub fn with_bit(bit: usize) -> Self {
        let mut v = Self::new();
        v.set(bit);
        v
    }

    /// Vector for an entry's own offset. Negative offsets are clamped to the
    /// default bit.
    pub fn for_offset(offset: i64) -> Self {
        Self::with_bit(offset.max(DEFAULT_OFFSET) as usize)
    }

    pub fn set(&mut self, bit: usize) {
        let word = bit / WORD_BITS;
        if self.words.len() <= word {
            self.words.resize(word + 1, 0);
        }
        self.words[word] |= 1u64 << (bit % WORD_BITS);
    }

    pub fn contains(&self, bit: usize) -> bool {
        self.words
            .get(bit / WORD_BITS)
            .is_some_and(|w| w & (1u64 << (bit % WORD_BITS)) != 0)
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn len(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn union_with(&mut self, other: &AccessVector) {
        if self.words.len() < other.words.len() {
            self.words.resize(other.words.len(), 0);
        }
        for (dst, src) in self.words.iter_mut().zip(other.words.iter()) {
            *dst |= *src;
        }
    }

    /// True when every bit of `self` is also set in `other`.
    pub fn is_subset_of(&self, other: &AccessVector) -> bool {
        self.words.iter().enumerate().all(|(i, w)| {
            let theirs = other.words.get(i).copied().unwrap_or(0);
            w & !theirs == 0
        })
    }

    /// Indices of the set bits, ascending.
    pub fn bits(&self) -> impl Iterator<Item = usize> + '_ {
        self.words.iter().enumerate().flat_map(|(i, &w)| {
            (0..WORD_BITS)
                .filter(move |b| w & (1u64 << b) != 0)
                .map(move |b| i * WORD_BITS + b)
        })
    }

    /// Serialize to the BLOB layout stored in SQLite.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.words.len() * 8);
        for w in &self.words {
            out.extend_from_slice(&w.to_le_bytes());
        }
        while out.last() == Some(&0) {
            out.pop();
        }
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut words: Vec<u64> = bytes
            .chunks(8)
            .map(|chunk| {
                let mut buf = [0u8; 8];
                buf[..chunk.len()].copy_from_slice(chunk);
                u64::from_le_bytes(buf)
            })
            .collect();
        while words.last() == Some(&0) {
            words.pop();
        }
        Self { words }
    }
}

impl FromIterator<usize> for AccessVector {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        let mut v = AccessVector::new();
        for bit in iter {
            v.set(bit);
        }
        v
    }
}

impl Serialize for AccessVector {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.bits())
    }
}

impl rusqlite::types::ToSql for AccessVector {
    fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
        Ok(rusqlite::types::ToSqlOutput::from(self.to_bytes()))
    }
}

impl rusqlite::types::FromSql for AccessVector {
    fn column_result(value: rusqlite::types::ValueRef<'_>) -> rusqlite::types::FromSqlResult<Self> {
        match value {
            rusqlite::types::ValueRef::Null => Ok(AccessVector::default_vector()),
            other => other.as_blob().map(AccessVector::from_bytes),
        }
    }
}
