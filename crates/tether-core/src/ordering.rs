//! # Drain Ordering
//!
//! Decides the order in which pending operations are replayed.
//!
//! ## Rules
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Drain Order                                     │
//! │                                                                         │
//! │  1. Group by entity (type/id). No entity → a group of its own.         │
//! │  2. Inside a group: strict FIFO by (enqueued_at, sequence).            │
//! │  3. Across groups: pick the head of the group with                     │
//! │       a. highest effective priority (max over remaining ops)           │
//! │       b. earliest head enqueued_at                                     │
//! │       c. lowest head sequence                                          │
//! │                                                                         │
//! │  deal/42: [create(low), patch(high), patch(low)]   effective = high    │
//! │  note/7:  [update(medium)]                         effective = medium  │
//! │                                                                         │
//! │  → create, patch, patch, update                                        │
//! │                                                                         │
//! │  A failed op defers the rest of its group until the next pass, so a    │
//! │  later write never overtakes an earlier one for the same entity.       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::{HashMap, VecDeque};

use crate::types::{PendingOperation, Priority};

struct OperationGroup {
    key: String,
    ops: VecDeque<PendingOperation>,
}

impl OperationGroup {
    fn effective_priority(&self) -> Priority {
        self.ops
            .iter()
            .map(|op| op.priority)
            .max()
            .unwrap_or(Priority::Low)
    }
}

/// An ordered, consumable view over one snapshot of the pending set.
pub struct DrainPlan {
    groups: Vec<OperationGroup>,
}

impl DrainPlan {
    /// Builds a plan from the operations currently in the queue.
    pub fn from_pending(ops: Vec<PendingOperation>) -> Self {
        let mut index: HashMap<String, usize> = HashMap::new();
        let mut groups: Vec<OperationGroup> = Vec::new();

        for op in ops {
            let key = op.group_key();
            match index.get(&key) {
                Some(&i) => groups[i].ops.push_back(op),
                None => {
                    index.insert(key.clone(), groups.len());
                    groups.push(OperationGroup {
                        key,
                        ops: VecDeque::from([op]),
                    });
                }
            }
        }

        for group in &mut groups {
            group
                .ops
                .make_contiguous()
                .sort_by(|a, b| (a.enqueued_at, a.sequence).cmp(&(b.enqueued_at, b.sequence)));
        }

        DrainPlan { groups }
    }

    /// Pops the next operation to replay.
    pub fn next_operation(&mut self) -> Option<PendingOperation> {
        let best = self
            .groups
            .iter()
            .enumerate()
            .filter_map(|(i, g)| g.ops.front().map(|head| (i, g, head)))
            .min_by(|(_, ga, a), (_, gb, b)| {
                gb.effective_priority()
                    .cmp(&ga.effective_priority())
                    .then(a.enqueued_at.cmp(&b.enqueued_at))
                    .then(a.sequence.cmp(&b.sequence))
            })
            .map(|(i, _, _)| i)?;

        let op = self.groups[best].ops.pop_front();
        if self.groups[best].ops.is_empty() {
            self.groups.swap_remove(best);
        }
        op
    }

    /// Drops the remaining operations of a group from this pass.
    ///
    /// Returns how many operations were deferred.
    pub fn defer_group(&mut self, group_key: &str) -> usize {
        match self.groups.iter().position(|g| g.key == group_key) {
            Some(i) => self.groups.swap_remove(i).ops.len(),
            None => 0,
        }
    }

    pub fn len(&self) -> usize {
        self.groups.iter().map(|g| g.ops.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.iter().all(|g| g.ops.is_empty())
    }
}

impl Iterator for DrainPlan {
    type Item = PendingOperation;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_operation()
    }
}
