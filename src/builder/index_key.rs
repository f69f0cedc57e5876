//! Index-key rehydration.
//!
//! Given an index key pattern of dotted paths and the scalar slots
//! holding each component, emit a nested object-construction expression
//! that rebuilds the original document shape. A trie over the paths
//! drives emission; a path whose strict prefix is already bound as a
//! whole value is pruned, since the shorter binding subsumes it.

use crate::catalog::KeyPattern;
use crate::error::BuildError;
use crate::expr::{make_new_obj, Expr};
use crate::reqs::IndexKeyBitset;
use crate::slots::SlotId;
use tracing::warn;

/// Ordered trie over key-pattern paths. Children keep insertion order so
/// the rebuilt object preserves key-pattern field order.
#[derive(Debug, Default)]
struct KeyPathTrie {
    children: Vec<(String, KeyPathTrie)>,
    slot: Option<SlotId>,
}

impl KeyPathTrie {
    fn insert(&mut self, path: &str, slot: SlotId) {
        let mut node = self;
        let mut components = path.split('.').peekable();
        while let Some(component) = components.next() {
            if node.slot.is_some() {
                // A strict prefix of this path is already bound whole;
                // the index key for the prefix contains everything this
                // path would describe.
                warn!(path, "dropping key-pattern path dominated by a shorter prefix");
                return;
            }
            let position = node
                .children
                .iter()
                .position(|(name, _)| name == component);
            let index = match position {
                Some(index) => index,
                None => {
                    node.children
                        .push((component.to_string(), KeyPathTrie::default()));
                    node.children.len() - 1
                }
            };
            node = &mut node.children[index].1;
            if components.peek().is_none() {
                if node.slot.is_some() {
                    warn!(path, "duplicate key-pattern path; keeping the first binding");
                    return;
                }
                if !node.children.is_empty() {
                    // The shorter path wins over previously inserted
                    // longer ones rooted beneath it.
                    warn!(path, "key-pattern path subsumes longer paths; dropping them");
                    node.children.clear();
                }
                node.slot = Some(slot);
            }
        }
    }

    fn emit(&self) -> Expr {
        let pairs = self
            .children
            .iter()
            .map(|(name, child)| {
                let value = match child.slot {
                    Some(slot) => Expr::slot(slot),
                    None => child.emit(),
                };
                (name.clone(), value)
            })
            .collect();
        make_new_obj(pairs)
    }
}

/// Build the rehydration expression for the pattern components selected
/// by `bits`, whose values live in `slots` (aligned to `bits.ones()`).
pub(crate) fn rehydrate_index_key(
    pattern: &KeyPattern,
    bits: &IndexKeyBitset,
    slots: &[SlotId],
) -> Result<Expr, BuildError> {
    crate::check_contract!(
        slots.len() == bits.count_ones(),
        75_013,
        "rehydration slot vector length {} does not match bitset of {} bits",
        slots.len(),
        bits.count_ones()
    );

    let mut trie = KeyPathTrie::default();
    for (pos, slot) in bits.ones().zip(slots) {
        trie.insert(&pattern.parts()[pos].path, *slot);
    }
    Ok(trie.emit())
}

/// Narrow the scanned key-slot vector back to the components the parent
/// originally asked for, preserving pattern order.
pub(crate) fn index_key_slots_matching_parent_reqs(
    scan_bits: &IndexKeyBitset,
    parent_bits: &IndexKeyBitset,
    slots: &[SlotId],
) -> Result<Vec<SlotId>, BuildError> {
    let scanned: Vec<usize> = scan_bits.ones().collect();
    let mut visible = Vec::with_capacity(parent_bits.count_ones());
    for pos in parent_bits.ones() {
        let index = scanned
            .iter()
            .position(|candidate| *candidate == pos)
            .ok_or_else(|| {
                crate::contract_error!(
                    75_101,
                    "parent requested key component {pos} that was not scanned"
                )
            })?;
        visible.push(slots[index]);
    }
    Ok(visible)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(paths: &[&str]) -> KeyPattern {
        KeyPattern::parse(&paths.iter().map(|p| (*p, 1)).collect::<Vec<_>>())
    }

    #[test]
    fn test_rehydrate_nested_pattern() {
        // {a.b: 1, x: 1, a.c: 1} groups the two a-paths under one
        // nested object.
        let pattern = pattern(&["a.b", "x", "a.c"]);
        let bits = IndexKeyBitset::all(3);
        let slots = vec![SlotId(10), SlotId(11), SlotId(12)];

        let expr = rehydrate_index_key(&pattern, &bits, &slots).expect("rehydrate");
        assert_eq!(
            expr.to_string(),
            "newObj(\"a\", newObj(\"b\", s10, \"c\", s12), \"x\", s11)"
        );
    }

    #[test]
    fn test_shorter_prefix_dominates() {
        // {a: 1, a.b: 1}: the whole-value binding for "a" wins.
        let pattern = pattern(&["a", "a.b"]);
        let bits = IndexKeyBitset::all(2);
        let slots = vec![SlotId(20), SlotId(21)];

        let expr = rehydrate_index_key(&pattern, &bits, &slots).expect("rehydrate");
        assert_eq!(expr.to_string(), "newObj(\"a\", s20)");
    }

    #[test]
    fn test_shorter_prefix_dominates_when_inserted_second() {
        // {a.b: 1, a: 1}: inserting the shorter path afterwards drops
        // the longer one.
        let pattern = pattern(&["a.b", "a"]);
        let bits = IndexKeyBitset::all(2);
        let slots = vec![SlotId(30), SlotId(31)];

        let expr = rehydrate_index_key(&pattern, &bits, &slots).expect("rehydrate");
        assert_eq!(expr.to_string(), "newObj(\"a\", s31)");
    }

    #[test]
    fn test_narrowing_preserves_pattern_order() {
        let scan_bits = IndexKeyBitset::all(3);
        let parent_bits = IndexKeyBitset::new(3).set(0).set(2);
        let slots = vec![SlotId(1), SlotId(2), SlotId(3)];

        let visible =
            index_key_slots_matching_parent_reqs(&scan_bits, &parent_bits, &slots)
                .expect("narrow");
        assert_eq!(visible, vec![SlotId(1), SlotId(3)]);
    }

    #[test]
    fn test_narrowing_rejects_unscanned_component() {
        let scan_bits = IndexKeyBitset::new(3).set(0);
        let parent_bits = IndexKeyBitset::new(3).set(1);
        let slots = vec![SlotId(1)];

        assert!(
            index_key_slots_matching_parent_reqs(&scan_bits, &parent_bits, &slots).is_err()
        );
    }
}
