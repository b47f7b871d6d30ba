//! The partition list: the canonical index of partitions, newest first.

use crate::partition::SharedPartition;
use crate::{Result, TidemarkError};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A singly-linked list of partitions with explicit head and tail pointers.
///
/// The head is the newest partition. Ordering by decreasing minimum timestamp
/// is the engine's insertion discipline; the list itself does not enforce it.
/// Nodes are identified by pointer equality of their partition handles.
pub struct PartitionList {
    head: RwLock<Option<Arc<PartitionNode>>>,
    tail: RwLock<Option<Arc<PartitionNode>>>,
    mutation_lock: Mutex<()>,
    num_partitions: AtomicUsize,
}

struct PartitionNode {
    partition: SharedPartition,
    next: RwLock<Option<Arc<PartitionNode>>>,
}

impl PartitionList {
    /// Creates an empty list.
    pub fn new() -> Self {
        Self {
            head: RwLock::new(None),
            tail: RwLock::new(None),
            mutation_lock: Mutex::new(()),
            num_partitions: AtomicUsize::new(0),
        }
    }

    /// Prepends a partition as the new head.
    pub fn insert(&self, partition: SharedPartition) {
        let _mutation = self.mutation_lock.lock();

        let node = Arc::new(PartitionNode {
            partition,
            next: RwLock::new(self.head.read().clone()),
        });

        let mut tail = self.tail.write();
        if tail.is_none() {
            *tail = Some(node.clone());
        }
        drop(tail);

        *self.head.write() = Some(node);
        self.num_partitions.fetch_add(1, Ordering::SeqCst);
    }

    /// Unlinks the given partition and calls its `clean`.
    pub fn remove(&self, target: &SharedPartition) -> Result<()> {
        let _mutation = self.mutation_lock.lock();

        let mut prev: Option<Arc<PartitionNode>> = None;
        let mut current = self.head.read().clone();

        while let Some(node) = current {
            if !same_partitions(&node.partition, target) {
                current = node.next.read().clone();
                prev = Some(node);
                continue;
            }

            let next = node.next.read().clone();
            match &prev {
                None => *self.head.write() = next.clone(),
                Some(prev_node) => *prev_node.next.write() = next.clone(),
            }
            if next.is_none() {
                // Removed the tail node.
                *self.tail.write() = prev;
            }

            self.num_partitions.fetch_sub(1, Ordering::SeqCst);
            target.clean()?;
            return Ok(());
        }

        Err(TidemarkError::PartitionNotFound {
            timestamp: target.min_timestamp(),
        })
    }

    /// Replaces `old` with `new`, preserving the successor chain.
    pub fn swap(&self, old: &SharedPartition, new: SharedPartition) -> Result<()> {
        let _mutation = self.mutation_lock.lock();

        let mut prev: Option<Arc<PartitionNode>> = None;
        let mut current = self.head.read().clone();

        while let Some(node) = current {
            if !same_partitions(&node.partition, old) {
                current = node.next.read().clone();
                prev = Some(node);
                continue;
            }

            let next = node.next.read().clone();
            let new_node = Arc::new(PartitionNode {
                partition: new,
                next: RwLock::new(next.clone()),
            });
            match &prev {
                None => *self.head.write() = Some(new_node.clone()),
                Some(prev_node) => *prev_node.next.write() = Some(new_node.clone()),
            }
            if next.is_none() {
                *self.tail.write() = Some(new_node);
            }
            return Ok(());
        }

        Err(TidemarkError::PartitionNotFound {
            timestamp: old.min_timestamp(),
        })
    }

    /// Returns the newest partition.
    pub fn get_head(&self) -> Option<SharedPartition> {
        self.head.read().as_ref().map(|node| node.partition.clone())
    }

    /// Returns the oldest partition.
    pub fn get_tail(&self) -> Option<SharedPartition> {
        self.tail.read().as_ref().map(|node| node.partition.clone())
    }

    /// Returns the number of partitions.
    pub fn size(&self) -> usize {
        self.num_partitions.load(Ordering::SeqCst)
    }

    /// Iterates from the newest to the oldest partition.
    pub fn iter(&self) -> PartitionIter {
        PartitionIter {
            current: self.head.read().clone(),
        }
    }
}

impl Default for PartitionList {
    fn default() -> Self {
        Self::new()
    }
}

fn same_partitions(a: &SharedPartition, b: &SharedPartition) -> bool {
    Arc::ptr_eq(a, b)
}

/// Iterator over partitions, head to tail.
pub struct PartitionIter {
    current: Option<Arc<PartitionNode>>,
}

impl Iterator for PartitionIter {
    type Item = SharedPartition;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.current.take()?;
        self.current = node.next.read().clone();
        Some(node.partition.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::PartitionMeta;
    use crate::partition::Partition;
    use crate::{DataPoint, Label, Row};
    use std::sync::atomic::AtomicBool;

    struct StubPartition {
        min: i64,
        cleaned: AtomicBool,
    }

    impl StubPartition {
        fn shared(min: i64) -> (Arc<Self>, SharedPartition) {
            let inner = Arc::new(Self {
                min,
                cleaned: AtomicBool::new(false),
            });
            let shared: SharedPartition = inner.clone();
            (inner, shared)
        }
    }

    impl Partition for StubPartition {
        fn insert_rows(&self, _rows: &[Row]) -> Result<Vec<Row>> {
            Ok(Vec::new())
        }

        fn select_data_points(
            &self,
            _metric: &str,
            _labels: &[Label],
            _start: i64,
            _end: i64,
        ) -> Result<Vec<DataPoint>> {
            Ok(Vec::new())
        }

        fn min_timestamp(&self) -> i64 {
            self.min
        }

        fn max_timestamp(&self) -> i64 {
            self.min
        }

        fn size(&self) -> usize {
            1
        }

        fn active(&self) -> bool {
            false
        }

        fn expired(&self) -> bool {
            false
        }

        fn clean(&self) -> Result<()> {
            self.cleaned.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn flush_to_disk(&self) -> Result<Option<(Vec<u8>, PartitionMeta)>> {
            Ok(None)
        }
    }

    fn mins(list: &PartitionList) -> Vec<i64> {
        list.iter().map(|p| p.min_timestamp()).collect()
    }

    /// Builds [a(1) -> b(2) -> c(3)] from head to tail.
    fn three_node_list() -> (PartitionList, SharedPartition, SharedPartition, SharedPartition) {
        let list = PartitionList::new();
        let (_, a) = StubPartition::shared(1);
        let (_, b) = StubPartition::shared(2);
        let (_, c) = StubPartition::shared(3);
        list.insert(c.clone());
        list.insert(b.clone());
        list.insert(a.clone());
        (list, a, b, c)
    }

    #[test]
    fn test_insert_sets_head_and_tail() {
        let list = PartitionList::new();
        assert!(list.get_head().is_none());
        assert!(list.get_tail().is_none());
        assert_eq!(list.size(), 0);

        let (_, first) = StubPartition::shared(10);
        list.insert(first.clone());
        assert!(Arc::ptr_eq(&list.get_head().unwrap(), &first));
        assert!(Arc::ptr_eq(&list.get_tail().unwrap(), &first));

        let (_, second) = StubPartition::shared(20);
        list.insert(second.clone());
        assert!(Arc::ptr_eq(&list.get_head().unwrap(), &second));
        assert!(Arc::ptr_eq(&list.get_tail().unwrap(), &first));
        assert_eq!(list.size(), 2);
    }

    #[test]
    fn test_remove_middle_node() {
        let (list, a, b, c) = three_node_list();
        list.remove(&b).unwrap();

        assert_eq!(mins(&list), vec![1, 3]);
        assert_eq!(list.size(), 2);
        assert!(Arc::ptr_eq(&list.get_head().unwrap(), &a));
        assert!(Arc::ptr_eq(&list.get_tail().unwrap(), &c));
    }

    #[test]
    fn test_swap_middle_node_preserves_chain() {
        let (list, a, b, c) = three_node_list();
        let (_, b_new) = StubPartition::shared(2);
        list.swap(&b, b_new.clone()).unwrap();

        assert_eq!(mins(&list), vec![1, 2, 3]);
        assert_eq!(list.size(), 3);
        let nodes: Vec<_> = list.iter().collect();
        assert!(Arc::ptr_eq(&nodes[0], &a));
        assert!(Arc::ptr_eq(&nodes[1], &b_new));
        assert!(Arc::ptr_eq(&nodes[2], &c));
    }

    #[test]
    fn test_remove_absent_partition_fails() {
        let (list, _, _, _) = three_node_list();
        let (_, stranger) = StubPartition::shared(99);
        assert!(matches!(
            list.remove(&stranger),
            Err(TidemarkError::PartitionNotFound { timestamp: 99 })
        ));
        assert_eq!(list.size(), 3);
    }

    #[test]
    fn test_remove_from_empty_list_fails() {
        let list = PartitionList::new();
        let (_, p) = StubPartition::shared(1);
        assert!(matches!(
            list.remove(&p),
            Err(TidemarkError::PartitionNotFound { .. })
        ));
    }

    #[test]
    fn test_remove_head_and_tail_update_pointers() {
        let (list, a, b, c) = three_node_list();

        list.remove(&a).unwrap();
        assert!(Arc::ptr_eq(&list.get_head().unwrap(), &b));
        assert!(Arc::ptr_eq(&list.get_tail().unwrap(), &c));

        list.remove(&c).unwrap();
        assert!(Arc::ptr_eq(&list.get_head().unwrap(), &b));
        assert!(Arc::ptr_eq(&list.get_tail().unwrap(), &b));

        list.remove(&b).unwrap();
        assert!(list.get_head().is_none());
        assert!(list.get_tail().is_none());
        assert_eq!(list.size(), 0);
    }

    #[test]
    fn test_swap_tail_moves_tail_pointer() {
        let (list, _, _, c) = three_node_list();
        let (_, c_new) = StubPartition::shared(3);
        list.swap(&c, c_new.clone()).unwrap();
        assert!(Arc::ptr_eq(&list.get_tail().unwrap(), &c_new));
    }

    #[test]
    fn test_remove_calls_clean() {
        let list = PartitionList::new();
        let (inner, p) = StubPartition::shared(1);
        list.insert(p.clone());
        list.remove(&p).unwrap();
        assert!(inner.cleaned.load(Ordering::SeqCst));
    }

    #[test]
    fn test_identity_is_by_pointer_not_timestamp() {
        let list = PartitionList::new();
        let (first_inner, first) = StubPartition::shared(100);
        let (second_inner, second) = StubPartition::shared(100);
        list.insert(first.clone());
        list.insert(second.clone());

        list.remove(&first).unwrap();

        let remaining: Vec<_> = list.iter().collect();
        assert_eq!(remaining.len(), 1);
        assert!(Arc::ptr_eq(&remaining[0], &second));
        assert!(first_inner.cleaned.load(Ordering::SeqCst));
        assert!(!second_inner.cleaned.load(Ordering::SeqCst));
    }

    #[test]
    fn test_size_matches_reachable_count_after_mutations() {
        let (list, a, b, _c) = three_node_list();
        let (_, d) = StubPartition::shared(0);
        list.insert(d.clone());
        list.remove(&b).unwrap();
        let (_, a_new) = StubPartition::shared(1);
        list.swap(&a, a_new).unwrap();

        assert_eq!(list.iter().count(), list.size());
        let last = list.iter().last().unwrap();
        assert!(Arc::ptr_eq(&last, &list.get_tail().unwrap()));
    }
}
