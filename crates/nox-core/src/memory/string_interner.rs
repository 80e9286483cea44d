use rustc_hash::{FxBuildHasher, FxHashMap, FxHasher};
use std::hash::{Hash, Hasher};

pub type StringHandle = u32;

#[derive(Debug, Clone)]
struct StringEntry {
    text: Box<str>,
    hash: u64,
    is_marked: bool,
}

/// The global string table. Every string the compiler or VM creates goes
/// through here, so equal content always yields the same handle and value
/// equality degenerates to handle equality.
///
/// Entries are weak with respect to the collector: tracing marks them, and
/// `sweep_unmarked` evicts whatever tracing did not reach.
#[derive(Debug, Clone, Default)]
pub struct StringInterner {
    map: FxHashMap<u64, Vec<StringHandle>>,
    entries: Vec<Option<StringEntry>>,
    free_list: Vec<StringHandle>,
    bytes: usize,
}

impl StringInterner {
    pub fn new() -> Self {
        Self::with_capacity(64)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            map: FxHashMap::with_capacity_and_hasher(capacity, FxBuildHasher),
            entries: Vec::with_capacity(capacity),
            free_list: Vec::new(),
            bytes: 0,
        }
    }

    pub fn hash_str(s: &str) -> u64 {
        let mut hasher = FxHasher::default();
        s.hash(&mut hasher);
        hasher.finish()
    }

    /// Interns a borrowed string, copying it only when it is new.
    pub fn intern(&mut self, s: &str) -> StringHandle {
        let hash = Self::hash_str(s);

        if let Some(bucket) = self.map.get(&hash) {
            for &handle in bucket {
                if self.get_string(handle) == s {
                    return handle;
                }
            }
        }

        self.insert_new(s.to_string().into_boxed_str(), hash)
    }

    /// Interns an owned string, taking ownership of its storage. This is the
    /// transfer path used by concatenation.
    pub fn intern_owned(&mut self, s: String) -> StringHandle {
        let hash = Self::hash_str(&s);

        if let Some(bucket) = self.map.get(&hash) {
            for &handle in bucket {
                if self.get_string(handle) == s {
                    return handle;
                }
            }
        }

        self.insert_new(s.into_boxed_str(), hash)
    }

    pub fn concat(&mut self, a: StringHandle, b: StringHandle) -> StringHandle {
        let mut result = String::with_capacity(
            self.get_string(a).len() + self.get_string(b).len(),
        );
        result.push_str(self.get_string(a));
        result.push_str(self.get_string(b));
        self.intern_owned(result)
    }

    fn insert_new(&mut self, text: Box<str>, hash: u64) -> StringHandle {
        self.bytes += text.len() + std::mem::size_of::<StringEntry>();
        let entry = StringEntry {
            text,
            hash,
            is_marked: false,
        };

        let handle = if let Some(handle) = self.free_list.pop() {
            self.entries[handle as usize] = Some(entry);
            handle
        } else {
            self.entries.push(Some(entry));
            (self.entries.len() - 1) as StringHandle
        };

        self.map.entry(hash).or_default().push(handle);
        handle
    }

    pub fn get_string(&self, handle: StringHandle) -> &str {
        self.entries[handle as usize]
            .as_ref()
            .map(|entry| &*entry.text)
            .expect("string was freed")
    }

    pub fn get_hash(&self, handle: StringHandle) -> u64 {
        self.entries[handle as usize]
            .as_ref()
            .map(|entry| entry.hash)
            .expect("string was freed")
    }

    pub fn mark(&mut self, handle: StringHandle) {
        if let Some(entry) = self.entries[handle as usize].as_mut() {
            entry.is_marked = true;
        }
    }

    /// Evicts every unmarked string and clears the mark bit of survivors.
    /// Runs between the trace and sweep phases of a collection, so freed
    /// strings are already known to be unreachable from any live object.
    pub fn sweep_unmarked(&mut self) {
        for index in 0..self.entries.len() {
            let handle = index as StringHandle;
            let (dead, hash, len) = match &mut self.entries[index] {
                Some(entry) => {
                    if entry.is_marked {
                        entry.is_marked = false;
                        continue;
                    }
                    (true, entry.hash, entry.text.len())
                }
                None => continue,
            };

            if dead {
                if let Some(bucket) = self.map.get_mut(&hash) {
                    bucket.retain(|h| *h != handle);
                    if bucket.is_empty() {
                        self.map.remove(&hash);
                    }
                }
                self.entries[index] = None;
                self.free_list.push(handle);
                self.bytes -= len + std::mem::size_of::<StringEntry>();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len() - self.free_list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get_allocated_bytes(&self) -> usize {
        self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_interning() {
        let mut interner = StringInterner::new();

        let handle1 = interner.intern("hello");
        let handle2 = interner.intern("world");
        let handle3 = interner.intern("hello");

        assert_eq!(handle1, handle3);
        assert_ne!(handle1, handle2);
        assert_eq!(interner.get_string(handle1), "hello");
        assert_eq!(interner.get_string(handle2), "world");
    }

    #[test]
    fn test_owned_and_borrowed_paths_agree() {
        let mut interner = StringInterner::new();

        let borrowed = interner.intern("foobar");
        let owned = interner.intern_owned("foobar".to_string());

        assert_eq!(borrowed, owned);
    }

    #[test]
    fn test_concat_interns_result() {
        let mut interner = StringInterner::new();

        let a = interner.intern("foo");
        let b = interner.intern("bar");
        let ab = interner.concat(a, b);
        let direct = interner.intern("foobar");

        assert_eq!(ab, direct);
        assert_eq!(interner.get_string(ab), "foobar");
    }

    #[test]
    fn test_sweep_frees_unmarked() {
        let mut interner = StringInterner::new();

        let keep = interner.intern("keep");
        let _drop = interner.intern("drop");
        assert_eq!(interner.len(), 2);

        interner.mark(keep);
        interner.sweep_unmarked();

        assert_eq!(interner.len(), 1);
        assert_eq!(interner.get_string(keep), "keep");

        // The freed slot is reused, and re-interning after eviction works.
        let again = interner.intern("drop");
        assert_eq!(interner.get_string(again), "drop");
    }

    #[test]
    fn test_sweep_clears_marks() {
        let mut interner = StringInterner::new();

        let handle = interner.intern("twice");
        interner.mark(handle);
        interner.sweep_unmarked();

        // Second sweep with no marks frees it.
        interner.sweep_unmarked();
        assert_eq!(interner.len(), 0);
    }

    #[test]
    fn test_many_strings() {
        let mut interner = StringInterner::new();

        let mut handles = Vec::new();
        for i in 0..1000 {
            let s = format!("string_{}", i);
            let handle = interner.intern(&s);
            handles.push((handle, s));
        }

        for (handle, expected) in handles {
            assert_eq!(interner.get_string(handle), expected);
        }
    }
}
