//! Batches of add/remove/modify directives and their completion results.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::hash::Hash;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BatchDirective {
    Add,
    Remove,
    Modify,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchEntry<T> {
    pub directive: BatchDirective,
    pub target: T,
}

/// An ordered list of directives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOperation<T> {
    entries: Vec<BatchEntry<T>>,
}

impl<T> Default for BatchOperation<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<T> BatchOperation<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: Vec<BatchEntry<T>>) -> Self {
        Self { entries }
    }

    pub fn push(&mut self, directive: BatchDirective, target: T) {
        self.entries.push(BatchEntry { directive, target });
    }

    pub fn add(mut self, target: T) -> Self {
        self.push(BatchDirective::Add, target);
        self
    }

    pub fn remove(mut self, target: T) -> Self {
        self.push(BatchDirective::Remove, target);
        self
    }

    pub fn modify(mut self, target: T) -> Self {
        self.push(BatchDirective::Modify, target);
        self
    }

    pub fn entries(&self) -> &[BatchEntry<T>] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<BatchEntry<T>> {
        self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Splits the batch by `key`, keeping groups in first-seen order and
    /// entries in insertion order within each group.
    pub fn partition_by<K, F>(self, mut key: F) -> Vec<(K, BatchOperation<T>)>
    where
        K: Eq + Hash + Clone,
        F: FnMut(&T) -> K,
    {
        let mut index: HashMap<K, usize> = HashMap::new();
        let mut partitions: Vec<(K, BatchOperation<T>)> = Vec::new();
        for entry in self.entries {
            let k = key(&entry.target);
            let slot = match index.get(&k) {
                Some(slot) => *slot,
                None => {
                    index.insert(k.clone(), partitions.len());
                    partitions.push((k, BatchOperation::new()));
                    partitions.len() - 1
                }
            };
            partitions[slot].1.entries.push(entry);
        }
        partitions
    }
}

/// Lifecycle of a submitted batch. Terminal states never change again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum BatchState {
    Started = 0,
    Finished = 1,
    Cancelled = 2,
}

impl BatchState {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => BatchState::Started,
            1 => BatchState::Finished,
            _ => BatchState::Cancelled,
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, BatchState::Started)
    }
}

/// Result of a batch (or of one partition of it).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedBatchOperation<T> {
    pub success: bool,
    pub failed_items: Vec<T>,
}

impl<T> CompletedBatchOperation<T> {
    pub fn succeeded() -> Self {
        Self {
            success: true,
            failed_items: Vec::new(),
        }
    }

    pub fn failed(failed_items: Vec<T>) -> Self {
        Self {
            success: false,
            failed_items,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_preserves_order() {
        let batch = BatchOperation::new()
            .add(("a", 1))
            .remove(("b", 2))
            .add(("a", 3))
            .modify(("c", 4))
            .remove(("b", 5));

        let partitions = batch.partition_by(|(device, _)| *device);
        let keys: Vec<_> = partitions.iter().map(|(k, _)| *k).collect();
        assert_eq!(keys, vec!["a", "b", "c"]);

        let a: Vec<_> = partitions[0].1.entries().iter().map(|e| e.target.1).collect();
        assert_eq!(a, vec![1, 3]);
        let b: Vec<_> = partitions[1]
            .1
            .entries()
            .iter()
            .map(|e| (e.directive, e.target.1))
            .collect();
        assert_eq!(
            b,
            vec![(BatchDirective::Remove, 2), (BatchDirective::Remove, 5)]
        );
    }

    #[test]
    fn test_batch_state_round_trips_through_u8() {
        for state in [BatchState::Started, BatchState::Finished, BatchState::Cancelled] {
            assert_eq!(BatchState::from_u8(state as u8), state);
        }
        assert!(!BatchState::Started.is_terminal());
        assert!(BatchState::Finished.is_terminal());
        assert!(BatchState::Cancelled.is_terminal());
    }
}
