use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::ProcessId;

/// A vector of logical clocks keyed by process identity. A missing entry
/// reads as 0; counters never go below 0 by construction.
///
/// Clients use it as the vector clock driving causal delivery; the mutual
/// exclusion algorithm embeds one in the circulating token and keeps one for
/// the pending requests, hence the [`RequestVector`] alias.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorClock {
    entries: BTreeMap<ProcessId, u64>,
}

/// Map of process identity to the scalar clock of its last request or grant.
pub type RequestVector = VectorClock;

impl VectorClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// The clock value of a process, 0 when the process is unknown.
    pub fn entry(&self, key: ProcessId) -> u64 {
        self.entries.get(&key).copied().unwrap_or(0)
    }

    /// Sets the clock value of a process, inserting the entry if needed.
    pub fn set_entry(&mut self, key: ProcessId, value: u64) {
        self.entries.insert(key, value);
    }

    /// Increments the clock of a process, from 0 if the entry was missing.
    pub fn increment_entry(&mut self, key: ProcessId) {
        *self.entries.entry(key).or_insert(0) += 1;
    }

    /// True when every entry of this clock is at least the corresponding
    /// entry of `other` (comparison over the union of the key sets).
    pub fn dominates(&self, other: &VectorClock) -> bool {
        self.entries
            .keys()
            .chain(other.entries.keys())
            .all(|key| self.entry(*key) >= other.entry(*key))
    }

    /// Dominance with at least one strictly greater entry.
    pub fn strictly_dominates(&self, other: &VectorClock) -> bool {
        self.dominates(other)
            && self
                .entries
                .keys()
                .chain(other.entries.keys())
                .any(|key| self.entry(*key) > other.entry(*key))
    }

    /// Keys greater than or equal to `from`, in ascending order.
    pub fn keys_from(&self, from: ProcessId) -> impl Iterator<Item = ProcessId> + '_ {
        self.entries.range(from..).map(|(key, _)| *key)
    }

    /// Keys strictly lower than `to`, in ascending order.
    pub fn keys_below(&self, to: ProcessId) -> impl Iterator<Item = ProcessId> + '_ {
        self.entries.range(..to).map(|(key, _)| *key)
    }

    /// All keys except `pivot`, starting just after `pivot` and wrapping
    /// around the sorted identity space. This is the traversal order of the
    /// mutual-exclusion hand-off scan.
    pub fn wrapping_keys_after(&self, pivot: ProcessId) -> Vec<ProcessId> {
        self.keys_from(ProcessId(pivot.0 + 1))
            .chain(self.keys_below(pivot))
            .collect()
    }
}

impl fmt::Display for VectorClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (key, value)) in self.entries.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}={}", key, value)?;
        }
        write!(f, "}}")
    }
}
