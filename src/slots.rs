//! # Slot, Frame, and Spool Identifiers
//!
//! Newtype ids for the three kinds of runtime locations the builder
//! allocates, plus their monotonic generators. One generator of each kind
//! is owned by the builder instance and shared across the whole lowering
//! pass, so ids are unique within a build and assignment order follows
//! the requirements flow.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a value slot in the execution runtime.
///
/// Slot ids are non-zero; generators start at 1 so that 0 can never be a
/// valid binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SlotId(pub u64);

/// Identifier of a local-binding frame within a compiled expression
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FrameId(pub u64);

/// Identifier of a spool buffer shared between stages
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SpoolId(pub u64);

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "f{}", self.0)
    }
}

impl fmt::Display for SpoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sp{}", self.0)
    }
}

/// Monotonic factory for [`SlotId`]s
#[derive(Debug, Default)]
pub struct SlotIdGenerator {
    next: u64,
}

impl SlotIdGenerator {
    /// Create a generator whose first id is `s1`
    pub fn new() -> Self {
        SlotIdGenerator { next: 1 }
    }

    /// Allocate the next slot id
    pub fn generate(&mut self) -> SlotId {
        let id = SlotId(self.next);
        self.next += 1;
        id
    }

    /// Allocate `n` consecutive slot ids
    pub fn generate_many(&mut self, n: usize) -> Vec<SlotId> {
        (0..n).map(|_| self.generate()).collect()
    }
}

/// Monotonic factory for [`FrameId`]s
#[derive(Debug, Default)]
pub struct FrameIdGenerator {
    next: u64,
}

impl FrameIdGenerator {
    /// Create a generator whose first id is `f1`
    pub fn new() -> Self {
        FrameIdGenerator { next: 1 }
    }

    /// Allocate the next frame id
    pub fn generate(&mut self) -> FrameId {
        let id = FrameId(self.next);
        self.next += 1;
        id
    }
}

/// Monotonic factory for [`SpoolId`]s
#[derive(Debug, Default)]
pub struct SpoolIdGenerator {
    next: u64,
}

impl SpoolIdGenerator {
    /// Create a generator whose first id is `sp1`
    pub fn new() -> Self {
        SpoolIdGenerator { next: 1 }
    }

    /// Allocate the next spool id
    pub fn generate(&mut self) -> SpoolId {
        let id = SpoolId(self.next);
        self.next += 1;
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_ids_are_non_zero_and_monotonic() {
        let mut generator = SlotIdGenerator::new();
        let a = generator.generate();
        let b = generator.generate();

        assert_eq!(a, SlotId(1));
        assert_eq!(b, SlotId(2));
        assert!(a.0 != 0 && b.0 != 0);
    }

    #[test]
    fn test_generate_many_is_consecutive() {
        let mut generator = SlotIdGenerator::new();
        let slots = generator.generate_many(3);

        assert_eq!(slots, vec![SlotId(1), SlotId(2), SlotId(3)]);
        assert_eq!(generator.generate(), SlotId(4));
    }
}
