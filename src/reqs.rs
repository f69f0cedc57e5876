//! # Requirements and Slot Bindings
//!
//! The two halves of the translator contract:
//!
//! - [`PlanNodeReqs`] flows **down** the tree: which named slots a parent
//!   wants, which index-key components it wants as scalar slots, and the
//!   flags steering the tailable-union rewrite.
//! - [`PlanNodeSlots`] flows **up**: the slots the child actually
//!   materialized, exactly matching the parent's request.
//!
//! Requirements compose by copy-then-modify:
//!
//! ```rust
//! use slotplan::reqs::{PlanNodeReqs, SlotName};
//!
//! let reqs = PlanNodeReqs::new().set(SlotName::Result);
//! let child_reqs = reqs.clone().clear(SlotName::Result).set(SlotName::RecordId);
//! assert!(child_reqs.has(SlotName::RecordId));
//! ```

use crate::error::BuildError;
use crate::slots::SlotId;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// The closed set of named slots exchanged between translators
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SlotName {
    /// The materialized document
    Result,
    /// The storage record id
    RecordId,
    /// The index key that located the row (returnKey queries)
    ReturnKey,
    /// The latest oplog timestamp seen by the scan
    OplogTs,
}

impl SlotName {
    /// All names, in canonical order
    pub const ALL: [SlotName; 4] = [
        SlotName::Result,
        SlotName::RecordId,
        SlotName::ReturnKey,
        SlotName::OplogTs,
    ];

    /// Display name
    pub fn as_str(self) -> &'static str {
        match self {
            SlotName::Result => "result",
            SlotName::RecordId => "recordId",
            SlotName::ReturnKey => "returnKey",
            SlotName::OplogTs => "oplogTs",
        }
    }
}

impl fmt::Display for SlotName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Which positions of an index key pattern are wanted as scalar slots.
/// Fixed-width; key patterns are capped at 64 components.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IndexKeyBitset {
    bits: u64,
    len: usize,
}

impl IndexKeyBitset {
    /// Empty bitset over a pattern of `len` components
    pub fn new(len: usize) -> Self {
        debug_assert!(len <= 64, "key patterns are capped at 64 components");
        IndexKeyBitset { bits: 0, len }
    }

    /// Bitset with every position set
    pub fn all(len: usize) -> Self {
        let mut bitset = IndexKeyBitset::new(len);
        for pos in 0..len {
            bitset = bitset.set(pos);
        }
        bitset
    }

    /// Set one position
    pub fn set(mut self, pos: usize) -> Self {
        debug_assert!(pos < self.len);
        self.bits |= 1 << pos;
        self
    }

    /// Test one position
    pub fn test(&self, pos: usize) -> bool {
        pos < self.len && self.bits & (1 << pos) != 0
    }

    /// Number of pattern components the bitset ranges over
    pub fn len(&self) -> usize {
        self.len
    }

    /// True iff no position is set
    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    /// Number of set positions
    pub fn count_ones(&self) -> usize {
        self.bits.count_ones() as usize
    }

    /// Positionwise union; widths must match
    pub fn union(&self, other: &IndexKeyBitset) -> IndexKeyBitset {
        debug_assert_eq!(self.len, other.len);
        IndexKeyBitset {
            bits: self.bits | other.bits,
            len: self.len.max(other.len),
        }
    }

    /// Set positions in ascending order
    pub fn ones(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.len).filter(|pos| self.test(*pos))
    }
}

/// The downward contract a parent hands its child
#[derive(Debug, Clone, Default)]
pub struct PlanNodeReqs {
    names: BTreeSet<SlotName>,
    index_key_bitset: Option<IndexKeyBitset>,
    /// Set on both branches while a tailable union is being constructed,
    /// so the dispatcher does not re-divert into the union builder
    pub is_building_tailable_union: bool,
    /// Set only inside the resume branch; limit/skip translators suppress
    /// their operators there
    pub is_tailable_resume_branch: bool,
}

impl PlanNodeReqs {
    /// Empty requirements
    pub fn new() -> Self {
        PlanNodeReqs::default()
    }

    /// Request a named slot
    pub fn set(mut self, name: SlotName) -> Self {
        self.names.insert(name);
        self
    }

    /// Request a named slot when `cond` holds
    pub fn set_if(self, name: SlotName, cond: bool) -> Self {
        if cond {
            self.set(name)
        } else {
            self
        }
    }

    /// Drop a named slot request
    pub fn clear(mut self, name: SlotName) -> Self {
        self.names.remove(&name);
        self
    }

    /// True iff the name is requested
    pub fn has(&self, name: SlotName) -> bool {
        self.names.contains(&name)
    }

    /// Requested names in canonical order
    pub fn names(&self) -> impl Iterator<Item = SlotName> + '_ {
        self.names.iter().copied()
    }

    /// Request index-key components
    pub fn with_index_key_bitset(mut self, bitset: IndexKeyBitset) -> Self {
        self.index_key_bitset = Some(bitset);
        self
    }

    /// Drop the index-key request
    pub fn clear_index_key_bitset(mut self) -> Self {
        self.index_key_bitset = None;
        self
    }

    /// The requested index-key components, if any
    pub fn index_key_bitset(&self) -> Option<&IndexKeyBitset> {
        self.index_key_bitset.as_ref()
    }
}

/// The upward result: slots the subtree actually materialized
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlanNodeSlots {
    named: BTreeMap<SlotName, SlotId>,
    index_key_slots: Option<Vec<SlotId>>,
}

impl PlanNodeSlots {
    /// Empty bindings
    pub fn new() -> Self {
        PlanNodeSlots::default()
    }

    /// Bind a named slot
    pub fn set(&mut self, name: SlotName, slot: SlotId) {
        self.named.insert(name, slot);
    }

    /// Look up a named slot
    pub fn get(&self, name: SlotName) -> Option<SlotId> {
        self.named.get(&name).copied()
    }

    /// Look up a named slot that the contract guarantees present
    pub fn require(&self, name: SlotName, tag: u32) -> Result<SlotId, BuildError> {
        self.get(name)
            .ok_or_else(|| crate::contract_error!(tag, "missing required slot '{name}'"))
    }

    /// Bound names in canonical order
    pub fn names(&self) -> impl Iterator<Item = SlotName> + '_ {
        self.named.keys().copied()
    }

    /// Attach the ordered index-key slot vector
    pub fn set_index_key_slots(&mut self, slots: Vec<SlotId>) {
        self.index_key_slots = Some(slots);
    }

    /// The index-key slot vector, if present
    pub fn index_key_slots(&self) -> Option<&[SlotId]> {
        self.index_key_slots.as_deref()
    }

    /// Take the index-key slot vector, leaving `None`
    pub fn take_index_key_slots(&mut self) -> Option<Vec<SlotId>> {
        self.index_key_slots.take()
    }

    /// Every slot this binding mentions, named slots first (canonical
    /// order), then index-key slots in vector order. This is the slot
    /// correspondence order used by unions and sorted merges.
    pub fn all_slots(&self, reqs: &PlanNodeReqs) -> Vec<SlotId> {
        let mut slots: Vec<SlotId> = reqs.names().filter_map(|name| self.get(name)).collect();
        if let Some(key_slots) = &self.index_key_slots {
            slots.extend(key_slots.iter().copied());
        }
        slots
    }

    /// Contract check: the bindings satisfy the requirements that
    /// produced them — every requested name is bound, and the index-key
    /// slot vector is aligned 1:1 with the requested bitset.
    pub fn verify_satisfies(&self, reqs: &PlanNodeReqs, tag: u32) -> Result<(), BuildError> {
        for name in reqs.names() {
            crate::check_contract!(
                self.named.contains_key(&name),
                tag,
                "bindings missing requested slot '{name}'"
            );
        }
        if let Some(bitset) = reqs.index_key_bitset() {
            let vector_len = self.index_key_slots.as_ref().map_or(0, Vec::len);
            crate::check_contract!(
                vector_len == bitset.count_ones(),
                tag,
                "index-key slot vector length {vector_len} does not match bitset of {} bits",
                bitset.count_ones()
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_then_modify() {
        let reqs = PlanNodeReqs::new().set(SlotName::Result).set(SlotName::RecordId);
        let child = reqs.clone().clear(SlotName::Result);

        assert!(reqs.has(SlotName::Result));
        assert!(!child.has(SlotName::Result));
        assert!(child.has(SlotName::RecordId));
    }

    #[test]
    fn test_bitset_union_and_ones() {
        let a = IndexKeyBitset::new(4).set(0).set(2);
        let b = IndexKeyBitset::new(4).set(1);
        let u = a.union(&b);

        assert_eq!(u.ones().collect::<Vec<_>>(), vec![0, 1, 2]);
        assert_eq!(u.count_ones(), 3);
        assert!(!u.test(3));
    }

    #[test]
    fn test_bitset_all() {
        let all = IndexKeyBitset::all(3);
        assert_eq!(all.ones().collect::<Vec<_>>(), vec![0, 1, 2]);
    }

    #[test]
    fn test_verify_satisfies() {
        let reqs = PlanNodeReqs::new()
            .set(SlotName::Result)
            .with_index_key_bitset(IndexKeyBitset::new(2).set(1));

        let mut slots = PlanNodeSlots::new();
        slots.set(SlotName::Result, SlotId(4));
        assert!(slots.verify_satisfies(&reqs, 75_100).is_err());

        slots.set_index_key_slots(vec![SlotId(5)]);
        assert!(slots.verify_satisfies(&reqs, 75_100).is_ok());

        let mut missing = PlanNodeSlots::new();
        missing.set_index_key_slots(vec![SlotId(5)]);
        assert!(missing.verify_satisfies(&reqs, 75_100).is_err());
    }
}
