//! Fixed-size top-K ranked buffer.
//!
//! The buffer keeps K slots sorted by score in the requested direction.
//! Insertion is an O(K) bubble pass: the incoming item walks from index 0
//! and swaps into the first slot that is empty or strictly worse, then keeps
//! carrying the displaced item forward. Unfilled insertees are silently
//! dropped; producers mark valid items with `filled = true`.

use std::sync::Arc;

use crate::vector::Vector;

/// One scored candidate flowing through the pipeline and into the buffer.
#[derive(Debug, Clone)]
pub struct Hit {
    /// External id of the stored entry.
    pub id: u64,
    pub score: f64,
    pub filled: bool,
    /// Reference to the candidate vector, attached by the map stage.
    pub vector: Option<Arc<Vector>>,
}

impl Hit {
    pub fn new(id: u64, score: f64) -> Self {
        Self {
            id,
            score,
            filled: true,
            vector: None,
        }
    }

    fn empty() -> Self {
        Self {
            id: 0,
            score: 0.0,
            filled: false,
            vector: None,
        }
    }
}

/// K-slot sorted buffer. Empty slots sort worst.
#[derive(Debug, Clone)]
pub struct RankedBuffer {
    slots: Vec<Hit>,
}

impl RankedBuffer {
    pub fn new(k: usize) -> Self {
        // k = 0 would make every insert a no-op and every query empty.
        let k = k.max(1);
        Self {
            slots: (0..k).map(|_| Hit::empty()).collect(),
        }
    }

    pub fn k(&self) -> usize {
        self.slots.len()
    }

    /// Number of filled slots.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.filled).count()
    }

    pub fn is_empty(&self) -> bool {
        !self.slots[0].filled
    }

    /// All K slots are filled.
    pub fn is_full(&self) -> bool {
        self.slots[self.slots.len() - 1].filled
    }

    /// The current worst of the top K, i.e. the last slot. Only meaningful
    /// for early-stop checks once `is_full()` holds.
    pub fn worst(&self) -> &Hit {
        &self.slots[self.slots.len() - 1]
    }

    /// Bubble-insert preserving the sorted prefix invariant. Ascending means
    /// lower scores are better.
    pub fn insert(&mut self, item: Hit, ascending: bool) {
        let mut carry = item;
        for slot in self.slots.iter_mut() {
            if !carry.filled {
                break;
            }
            let replace = !slot.filled
                || (ascending && carry.score < slot.score)
                || (!ascending && carry.score > slot.score);
            if replace {
                std::mem::swap(slot, &mut carry);
            }
        }
    }

    /// Filled slots only, in order.
    pub fn trim(&self) -> Vec<Hit> {
        self.slots.iter().filter(|s| s.filled).cloned().collect()
    }

    /// External ids of filled slots, in order.
    pub fn to_ids(&self) -> Vec<u64> {
        self.slots
            .iter()
            .filter(|s| s.filled)
            .map(|s| s.id)
            .collect()
    }
}
