use rustc_hash::FxHasher;
use std::hash::{Hash, Hasher};

use crate::Value;
use crate::memory::string_interner::StringHandle;

const LOAD_FACTOR_THRESHOLD: f64 = 0.75;
const MIN_CAPACITY: usize = 8;

#[derive(Debug, Clone, Copy, Default)]
pub struct Bucket {
    pub kind: BucketKind,
}

#[derive(Debug, Clone, Copy, Default)]
pub enum BucketKind {
    #[default]
    Empty,
    Occupied {
        key: StringHandle,
        value: Value,
    },
    Tombstone,
}

/// Open-addressed hash table keyed by interned strings. Interning makes
/// handle equality equivalent to content equality, so probing compares
/// handles directly and the probe hash is derived from the handle.
///
/// Capacity is always a power of two so the probe start is `hash & (cap - 1)`.
/// Deletions plant tombstones; lookups probe past them, and insertions reuse
/// the first tombstone seen on their probe path.
#[derive(Debug, Clone, Default)]
pub struct Table {
    buckets: Vec<Bucket>,
    count: usize, // occupied + tombstones
}

fn bucket_hash(key: StringHandle) -> u64 {
    let mut hasher = FxHasher::default();
    key.hash(&mut hasher);
    hasher.finish()
}

impl Table {
    pub fn new() -> Self {
        Self {
            buckets: Vec::new(),
            count: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }

    fn find_bucket(buckets: &[Bucket], key: StringHandle) -> usize {
        let mask = buckets.len() - 1;
        let mut index = bucket_hash(key) as usize & mask;
        let mut tombstone: Option<usize> = None;

        loop {
            match buckets[index].kind {
                BucketKind::Empty => {
                    return tombstone.unwrap_or(index);
                }
                BucketKind::Tombstone => {
                    if tombstone.is_none() {
                        tombstone = Some(index);
                    }
                }
                BucketKind::Occupied { key: existing, .. } => {
                    if existing == key {
                        return index;
                    }
                }
            }

            index = (index + 1) & mask;
        }
    }

    fn adjust_capacity(&mut self, capacity: usize) {
        let old_buckets = std::mem::replace(&mut self.buckets, vec![Bucket::default(); capacity]);
        self.count = 0;

        // Tombstones are dropped on the floor here, so `count` shrinks back
        // to the number of live entries.
        for bucket in old_buckets {
            if let BucketKind::Occupied { key, value } = bucket.kind {
                let index = Self::find_bucket(&self.buckets, key);
                self.buckets[index].kind = BucketKind::Occupied { key, value };
                self.count += 1;
            }
        }
    }

    /// Inserts or replaces. Returns true iff a new logical entry was created.
    pub fn set(&mut self, key: StringHandle, value: Value) -> bool {
        if (self.count + 1) as f64 > self.buckets.len() as f64 * LOAD_FACTOR_THRESHOLD {
            let capacity = (self.buckets.len() * 2).max(MIN_CAPACITY);
            self.adjust_capacity(capacity);
        }

        let index = Self::find_bucket(&self.buckets, key);
        let (is_new, was_empty) = match self.buckets[index].kind {
            BucketKind::Empty => (true, true),
            BucketKind::Tombstone => (true, false),
            BucketKind::Occupied { .. } => (false, false),
        };

        self.buckets[index].kind = BucketKind::Occupied { key, value };
        if was_empty {
            self.count += 1;
        }

        is_new
    }

    pub fn get(&self, key: StringHandle) -> Option<Value> {
        if self.buckets.is_empty() {
            return None;
        }

        let index = Self::find_bucket(&self.buckets, key);
        match self.buckets[index].kind {
            BucketKind::Occupied { value, .. } => Some(value),
            _ => None,
        }
    }

    /// Removes `key`, planting a tombstone so probe chains stay intact.
    pub fn delete(&mut self, key: StringHandle) -> bool {
        if self.buckets.is_empty() {
            return false;
        }

        let index = Self::find_bucket(&self.buckets, key);
        match self.buckets[index].kind {
            BucketKind::Occupied { .. } => {
                self.buckets[index].kind = BucketKind::Tombstone;
                true
            }
            _ => false,
        }
    }

    /// Copies every entry of `other` into `self`. Used by inheritance to
    /// seed a subclass's method table from its superclass.
    pub fn add_all_from(&mut self, other: &Table) {
        for (key, value) in other.iter() {
            self.set(key, value);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (StringHandle, Value)> + '_ {
        self.buckets.iter().filter_map(|bucket| match bucket.kind {
            BucketKind::Occupied { key, value } => Some((key, value)),
            _ => None,
        })
    }

    pub fn get_allocated_bytes(&self) -> usize {
        self.buckets.capacity() * std::mem::size_of::<Bucket>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_then_get() {
        let mut table = Table::new();
        assert!(table.set(0, Value::number(1.0)));
        assert_eq!(table.get(0), Some(Value::number(1.0)));
    }

    #[test]
    fn test_set_replaces_existing() {
        let mut table = Table::new();
        assert!(table.set(7, Value::number(1.0)));
        assert!(!table.set(7, Value::number(2.0)));
        assert_eq!(table.get(7), Some(Value::number(2.0)));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_delete_then_get_is_absent() {
        let mut table = Table::new();
        table.set(3, Value::boolean(true));
        assert!(table.delete(3));
        assert_eq!(table.get(3), None);
        assert!(!table.delete(3));
    }

    #[test]
    fn test_tombstone_is_reused_and_probed_past() {
        let mut table = Table::new();
        for key in 0..6 {
            table.set(key, Value::number(key as f64));
        }
        table.delete(2);

        // Entries inserted after a delete still resolve, and the vacated
        // slot is available again.
        assert!(table.set(2, Value::number(20.0)));
        for key in 0..6 {
            assert!(table.get(key).is_some());
        }
    }

    #[test]
    fn test_growth_preserves_entries() {
        let mut table = Table::new();
        for key in 0..100 {
            table.set(key, Value::number(key as f64));
        }

        assert_eq!(table.len(), 100);
        for key in 0..100 {
            assert_eq!(table.get(key), Some(Value::number(key as f64)));
        }
        assert!(table.get_allocated_bytes() > 0);
    }

    #[test]
    fn test_capacity_is_power_of_two() {
        let mut table = Table::new();
        for key in 0..50 {
            table.set(key, Value::nil());
        }
        assert!(table.buckets.len().is_power_of_two());
    }
}
