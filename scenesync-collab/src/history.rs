//! Bounded window of sequenced operations kept by the relay for catch-up.
//!
//! ```text
//!  ┌──────────────────────────────────────────────┐
//!  │ SequenceHistory (capacity N)                 │
//!  │                                              │
//!  │  evicted ◄── seq k ── seq k+1 ── … ── head   │
//!  │                                              │
//!  │  since(last) = ops (last, head]  if last ≥ k-1
//!  │              = None (send a snapshot) otherwise
//!  └──────────────────────────────────────────────┘
//! ```
//!
//! Reference: Kleppmann — DDIA, Chapter 11 (Log-based Message Brokers)

use std::collections::VecDeque;

use scenesync_core::Sequenced;

/// Default number of operations kept for replay.
pub const DEFAULT_HISTORY_CAPACITY: usize = 4096;

#[derive(Debug, Clone)]
pub struct SequenceHistory {
    capacity: usize,
    entries: VecDeque<Sequenced>,
    /// Sequence of the newest entry ever pushed, 0 when none
    head: u64,
    evicted: u64,
}

impl Default for SequenceHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

impl SequenceHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: VecDeque::new(),
            head: 0,
            evicted: 0,
        }
    }

    /// Append the next sequenced operation.
    pub fn push(&mut self, s: Sequenced) {
        debug_assert!(s.seq > self.head, "history must grow in sequence order");
        self.head = s.seq;
        self.entries.push_back(s);
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
            self.evicted += 1;
        }
    }

    /// Everything after `last_seq`, or `None` when part of it was evicted
    /// (or `last_seq` is from the future).
    pub fn since(&self, last_seq: u64) -> Option<Vec<Sequenced>> {
        if last_seq > self.head {
            return None;
        }
        if last_seq == self.head {
            return Some(Vec::new());
        }
        let first = self.first_seq()?;
        if last_seq + 1 < first {
            return None;
        }
        let skip = (last_seq + 1 - first) as usize;
        Some(self.entries.iter().skip(skip).cloned().collect())
    }

    /// Oldest replayable sequence.
    pub fn first_seq(&self) -> Option<u64> {
        self.entries.front().map(|s| s.seq)
    }

    /// Newest sequence pushed.
    pub fn head_seq(&self) -> u64 {
        self.head
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Operations dropped from the window so far.
    pub fn evicted(&self) -> u64 {
        self.evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scenesync_core::{EntityId, OpId, OpKind, Operation, SessionId};

    fn seq(n: u64) -> Sequenced {
        Sequenced::new(
            n,
            Operation::new(
                OpId {
                    session: SessionId::from_u128(1),
                    clock: n,
                },
                EntityId::from_u128(n as u128),
                0,
                OpKind::create_root(),
            ),
        )
    }

    #[test]
    fn test_since_within_window() {
        let mut h = SequenceHistory::new(8);
        for n in 1..=5 {
            h.push(seq(n));
        }
        let replay = h.since(2).unwrap();
        assert_eq!(replay.iter().map(|s| s.seq).collect::<Vec<_>>(), vec![3, 4, 5]);
        assert_eq!(h.since(0).unwrap().len(), 5);
        assert!(h.since(5).unwrap().is_empty());
    }

    #[test]
    fn test_since_outside_window() {
        let mut h = SequenceHistory::new(3);
        for n in 1..=10 {
            h.push(seq(n));
        }
        assert_eq!(h.first_seq(), Some(8));
        assert_eq!(h.evicted(), 7);
        assert!(h.since(6).is_none());
        assert_eq!(h.since(7).unwrap().len(), 3);
        assert!(h.since(11).is_none(), "a client ahead of the relay needs a snapshot");
    }
}
