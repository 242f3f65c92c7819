/// Vector clocks and the stamps derived from them
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::ActorId;

/// Vector clock for causality tracking across actors
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorClock {
    /// Map of actor ID to the highest sequence number observed
    clocks: BTreeMap<ActorId, u64>,
}

impl VectorClock {
    pub fn new() -> Self {
        Self {
            clocks: BTreeMap::new(),
        }
    }

    /// Increment the clock for an actor, returning the new sequence
    pub fn increment(&mut self, actor: ActorId) -> u64 {
        let entry = self.clocks.entry(actor).or_insert(0);
        *entry += 1;
        *entry
    }

    /// Get the current value for an actor
    pub fn get(&self, actor: ActorId) -> u64 {
        self.clocks.get(&actor).copied().unwrap_or(0)
    }

    /// Record that `seq` from `actor` has been observed. Never moves backwards.
    pub fn observe(&mut self, actor: ActorId, seq: u64) {
        if seq == 0 {
            return;
        }
        let current = self.clocks.entry(actor).or_insert(0);
        *current = (*current).max(seq);
    }

    /// Merge with another vector clock (take max)
    pub fn merge(&mut self, other: &VectorClock) {
        for (actor, &count) in &other.clocks {
            self.observe(*actor, count);
        }
    }

    /// Whether the given entry is already covered by this clock
    pub fn contains(&self, entry: ClockEntry) -> bool {
        self.get(entry.actor) >= entry.seq
    }

    /// Every entry of `other` is covered by `self`
    pub fn dominates(&self, other: &VectorClock) -> bool {
        other
            .clocks
            .iter()
            .all(|(actor, &count)| self.get(*actor) >= count)
    }

    /// Number of operations `other` has seen that `self` has not
    pub fn lag_behind(&self, other: &VectorClock) -> u64 {
        other
            .clocks
            .iter()
            .map(|(actor, &count)| count.saturating_sub(self.get(*actor)))
            .sum()
    }

    /// Total number of operations covered by this clock
    pub fn total(&self) -> u64 {
        self.clocks.values().sum()
    }

    pub fn actors(&self) -> BTreeSet<ActorId> {
        self.clocks.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = ClockEntry> + '_ {
        self.clocks
            .iter()
            .filter(|(_, &seq)| seq > 0)
            .map(|(&actor, &seq)| ClockEntry { actor, seq })
    }

    pub fn is_empty(&self) -> bool {
        self.clocks.values().all(|&seq| seq == 0)
    }
}

impl FromIterator<ClockEntry> for VectorClock {
    fn from_iter<T: IntoIterator<Item = ClockEntry>>(iter: T) -> Self {
        let mut clock = VectorClock::new();
        for entry in iter {
            clock.observe(entry.actor, entry.seq);
        }
        clock
    }
}

/// A single (actor, sequence) point in causal history
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClockEntry {
    pub actor: ActorId,
    pub seq: u64,
}

impl ClockEntry {
    pub fn new(actor: ActorId, seq: u64) -> Self {
        Self { actor, seq }
    }
}

/// Total order over operations used for last-writer-wins decisions.
///
/// `rank` is the size of the operation's causal past plus one, so an
/// operation always ranks above everything it depends on. Ties between
/// concurrent operations fall back to sequence, then actor. Comparing rank
/// before sequence keeps the order consistent with causality: a sequence
/// comparison alone could rank an operation below one it has already seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Stamp {
    pub rank: u64,
    pub seq: u64,
    pub actor: ActorId,
}

impl Stamp {
    pub fn for_operation(causal_past: &VectorClock, entry: ClockEntry) -> Self {
        Self {
            rank: causal_past.total() + 1,
            seq: entry.seq,
            actor: entry.actor,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observe_never_moves_backwards() {
        let actor = ActorId::new();
        let mut clock = VectorClock::new();
        clock.observe(actor, 5);
        clock.observe(actor, 3);
        assert_eq!(clock.get(actor), 5);
    }

    #[test]
    fn test_concurrency_and_dominance() {
        let a = ActorId::new();
        let b = ActorId::new();

        let mut left = VectorClock::new();
        left.increment(a);
        left.increment(a);

        let mut right = VectorClock::new();
        right.increment(b);

        assert!(!left.dominates(&right));
        assert!(!right.dominates(&left));

        right.merge(&left);
        assert!(right.dominates(&left));
        assert!(!left.dominates(&right));
        assert_eq!(left.lag_behind(&right), 1);
        assert_eq!(right.total(), 3);
    }

    #[test]
    fn test_stamp_ranks_above_causal_past() {
        let a = ActorId::new();
        let b = ActorId::new();
        let mut past = VectorClock::new();
        past.observe(a, 4);

        let later = Stamp::for_operation(&past, ClockEntry::new(b, 1));

        let mut own_past = VectorClock::new();
        own_past.observe(a, 3);
        let earlier = Stamp::for_operation(&own_past, ClockEntry::new(a, 4));
        assert!(later > earlier);
    }
}
