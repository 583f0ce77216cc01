// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    coding::{Decode, DecodeError, Encode, EncodeError},
    device::ShortId,
};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};
use varint_rs::{VarintReader, VarintWriter};

/// A single (short device id, counter) pair inside a version vector
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Counter {
    /// Shortened device id owning the counter
    pub id: ShortId,

    /// Monotonic change counter
    pub value: u64,
}

/// Causal relation between two version vectors
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Causality {
    /// Both vectors are identical
    Equal,

    /// The left vector strictly dominates the right
    Greater,

    /// The right vector strictly dominates the left
    Lesser,

    /// Neither dominates; the suffix is a deterministic tiebreak hint only
    ConcurrentGreater,

    /// Neither dominates; the suffix is a deterministic tiebreak hint only
    ConcurrentLesser,
}

/// A version vector: a mapping from short device id to a monotonic counter
///
/// Establishes causal order between file versions and detects concurrent
/// edits. Counters are kept sorted by id, so the encoding is deterministic.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Vector {
    counters: Vec<Counter>,
}

impl Vector {
    /// Creates an empty vector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the vector carries no counters.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    /// Returns the counter value for `id`, zero if absent.
    #[must_use]
    pub fn get(&self, id: ShortId) -> u64 {
        self.counters
            .iter()
            .find(|c| c.id == id)
            .map_or(0, |c| c.value)
    }

    /// Returns the counters, sorted by id.
    #[must_use]
    pub fn counters(&self) -> &[Counter] {
        &self.counters
    }

    /// Bumps the counter for `id`, creating it if absent, and returns the
    /// updated vector.
    #[must_use]
    pub fn update(mut self, id: ShortId) -> Self {
        match self.counters.binary_search_by_key(&id, |c| c.id) {
            Ok(idx) => {
                if let Some(c) = self.counters.get_mut(idx) {
                    c.value += 1;
                }
            }
            Err(idx) => self.counters.insert(idx, Counter { id, value: 1 }),
        }
        self
    }

    /// Sets the counter for `id` to `value`, returning the updated vector.
    ///
    /// Mostly useful to construct vectors in tests and at the wire boundary.
    #[must_use]
    pub fn with(mut self, id: ShortId, value: u64) -> Self {
        match self.counters.binary_search_by_key(&id, |c| c.id) {
            Ok(idx) => {
                if let Some(c) = self.counters.get_mut(idx) {
                    c.value = value;
                }
            }
            Err(idx) => self.counters.insert(idx, Counter { id, value }),
        }
        self
    }

    /// Merges `other` into the vector, keeping the maximum counter per id.
    #[must_use]
    pub fn merge(mut self, other: &Self) -> Self {
        for c in &other.counters {
            match self.counters.binary_search_by_key(&c.id, |s| s.id) {
                Ok(idx) => {
                    if let Some(s) = self.counters.get_mut(idx) {
                        s.value = s.value.max(c.value);
                    }
                }
                Err(idx) => self.counters.insert(idx, *c),
            }
        }
        self
    }

    /// Compares two vectors and returns their causal relation.
    ///
    /// The `Concurrent*` suffix is derived from the first differing counter
    /// on the merged, sorted id walk. It is deterministic but carries no
    /// semantic ordering; conflict resolution must consult the full file
    /// metadata instead.
    #[must_use]
    pub fn compare(&self, other: &Self) -> Causality {
        let mut left_bigger = false;
        let mut right_bigger = false;

        // Tracks which side the first differing id/value favoured
        let mut first_diff_left = None;

        let mut a = self.counters.iter().peekable();
        let mut b = other.counters.iter().peekable();

        loop {
            match (a.peek(), b.peek()) {
                (None, None) => break,
                (Some(_), None) => {
                    left_bigger = true;
                    first_diff_left.get_or_insert(true);
                    a.next();
                }
                (None, Some(_)) => {
                    right_bigger = true;
                    first_diff_left.get_or_insert(false);
                    b.next();
                }
                (Some(ca), Some(cb)) => match ca.id.cmp(&cb.id) {
                    std::cmp::Ordering::Less => {
                        left_bigger = true;
                        first_diff_left.get_or_insert(true);
                        a.next();
                    }
                    std::cmp::Ordering::Greater => {
                        right_bigger = true;
                        first_diff_left.get_or_insert(false);
                        b.next();
                    }
                    std::cmp::Ordering::Equal => {
                        match ca.value.cmp(&cb.value) {
                            std::cmp::Ordering::Less => {
                                right_bigger = true;
                                first_diff_left.get_or_insert(false);
                            }
                            std::cmp::Ordering::Greater => {
                                left_bigger = true;
                                first_diff_left.get_or_insert(true);
                            }
                            std::cmp::Ordering::Equal => {}
                        }
                        a.next();
                        b.next();
                    }
                },
            }
        }

        match (left_bigger, right_bigger) {
            (false, false) => Causality::Equal,
            (true, false) => Causality::Greater,
            (false, true) => Causality::Lesser,
            (true, true) => {
                if first_diff_left == Some(true) {
                    Causality::ConcurrentGreater
                } else {
                    Causality::ConcurrentLesser
                }
            }
        }
    }

    /// Returns `true` if the vector is causally greater than or equal to
    /// `other`.
    #[must_use]
    pub fn greater_equal(&self, other: &Self) -> bool {
        matches!(self.compare(other), Causality::Equal | Causality::Greater)
    }
}

impl Encode for Vector {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        // NOTE: Truncation is okay, a vector never holds 2^32 devices
        #[allow(clippy::cast_possible_truncation)]
        writer.write_u32_varint(self.counters.len() as u32)?;

        for c in &self.counters {
            writer.write_u32::<BigEndian>(c.id)?;
            writer.write_u64_varint(c.value)?;
        }

        Ok(())
    }
}

impl Decode for Vector {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let len = reader.read_u32_varint()? as usize;
        let mut counters = Vec::with_capacity(len.min(1_024));

        for _ in 0..len {
            let id = reader.read_u32::<BigEndian>()?;
            let value = reader.read_u64_varint()?;
            counters.push(Counter { id, value });
        }

        Ok(Self { counters })
    }
}
