// Ordered-list patch engine.
//
// Applies positional add/remove/move/set operations to an ordered
// sequence. The same engine serves form question lists, attached file
// lists, and response item lists — elements are opaque to it.
//
// Out-of-range indices make a patch a no-op rather than an error: a
// client editing against slightly stale state should not have its
// whole batch rejected.

use serde::{Deserialize, Serialize};

/// One atomic positional mutation against an ordered sequence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ListPatch<T> {
    /// Append `item` to the end of the sequence.
    Add { item: T },
    /// Delete the element at `index`.
    Remove { index: usize },
    /// Relocate the element at `index` to `new_index`, preserving the
    /// relative order of all other elements.
    Move { index: usize, new_index: usize },
    /// Replace the element at `index` in place.
    Set { index: usize, item: T },
}

/// Apply one patch to `sequence`.
///
/// `Move` interprets `new_index` against the sequence *after* removal
/// (conventional splice semantics). Patches whose indices fall outside
/// the sequence leave it unchanged.
pub fn apply<T>(sequence: &mut Vec<T>, patch: ListPatch<T>) {
    match patch {
        ListPatch::Add { item } => sequence.push(item),
        ListPatch::Remove { index } => {
            if index < sequence.len() {
                sequence.remove(index);
            }
        }
        ListPatch::Move { index, new_index } => {
            if index < sequence.len() && new_index < sequence.len() {
                let item = sequence.remove(index);
                sequence.insert(new_index, item);
            }
        }
        ListPatch::Set { index, item } => {
            if index < sequence.len() {
                sequence[index] = item;
            }
        }
    }
}

/// Apply a batch of patches strictly in order.
///
/// Later patches observe the effects of earlier ones within the batch.
pub fn apply_all<T>(sequence: &mut Vec<T>, patches: impl IntoIterator<Item = ListPatch<T>>) {
    for patch in patches {
        apply(sequence, patch);
    }
}
