// Open-addressed hash table keyed by interned string identity (spec.md
// §4.D). Linear probing, tombstone deletion, grows at 75% load factor.
//
// Keys are `ObjRef` handles to interned strings; the table itself never
// looks at string bytes, callers supply the precomputed FNV-1a hash
// (stored on `ObjString` at intern time) so this module stays ignorant of
// `Heap`. The one exception is `find_string`, used only by the interner
// to resolve a fresh byte string to an existing handle by content; it
// takes a caller-supplied equality predicate instead of reaching into the
// heap itself.

use crate::object::ObjRef;
use crate::value::Value;

const MAX_LOAD: f64 = 0.75;
const INITIAL_CAPACITY: usize = 8;

#[derive(Clone)]
struct Entry {
    key: Option<ObjRef>,
    hash: u32,
    value: Value,
}

impl Entry {
    fn empty() -> Entry {
        Entry { key: None, hash: 0, value: Value::Nil }
    }

    fn is_tombstone(&self) -> bool {
        self.key.is_none() && !matches!(self.value, Value::Nil)
    }
}

pub struct Table {
    entries: Vec<Entry>,
    // Occupied slots plus tombstones; drives the load-factor growth check.
    count: usize,
}

impl Table {
    pub fn new() -> Table {
        Table { entries: Vec::new(), count: 0 }
    }

    fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Number of live key/value pairs (excludes tombstones).
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.key.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn find_entry(entries: &[Entry], capacity: usize, key: ObjRef, hash: u32) -> usize {
        let mut index = (hash as usize) % capacity;
        let mut tombstone: Option<usize> = None;
        loop {
            let entry = &entries[index];
            match entry.key {
                Some(k) if k == key => return index,
                Some(_) => {}
                None => {
                    if entry.is_tombstone() {
                        if tombstone.is_none() {
                            tombstone = Some(index);
                        }
                    } else {
                        return tombstone.unwrap_or(index);
                    }
                }
            }
            index = (index + 1) % capacity;
        }
    }

    fn adjust_capacity(&mut self, new_capacity: usize) {
        let mut new_entries = vec![Entry::empty(); new_capacity];
        let mut live = 0;
        for entry in self.entries.iter() {
            if let Some(key) = entry.key {
                let index = Self::find_entry(&new_entries, new_capacity, key, entry.hash);
                new_entries[index] = Entry { key: Some(key), hash: entry.hash, value: entry.value };
                live += 1;
            }
        }
        self.entries = new_entries;
        self.count = live;
    }

    /// Insert or overwrite. Returns true if this created a brand-new key.
    pub fn set(&mut self, key: ObjRef, hash: u32, value: Value) -> bool {
        if self.capacity() == 0 || (self.count + 1) as f64 > self.capacity() as f64 * MAX_LOAD {
            let new_capacity = if self.capacity() < INITIAL_CAPACITY {
                INITIAL_CAPACITY
            } else {
                self.capacity() * 2
            };
            self.adjust_capacity(new_capacity);
        }

        let index = Self::find_entry(&self.entries, self.capacity(), key, hash);
        let entry = &mut self.entries[index];
        let is_new_key = entry.key.is_none();
        if is_new_key && matches!(entry.value, Value::Nil) {
            self.count += 1;
        }
        entry.key = Some(key);
        entry.hash = hash;
        entry.value = value;
        is_new_key
    }

    pub fn get(&self, key: ObjRef, hash: u32) -> Option<Value> {
        if self.capacity() == 0 {
            return None;
        }
        let index = Self::find_entry(&self.entries, self.capacity(), key, hash);
        self.entries[index].key.map(|_| self.entries[index].value)
    }

    pub fn contains(&self, key: ObjRef, hash: u32) -> bool {
        self.get(key, hash).is_some()
    }

    /// Remove a key, leaving a tombstone so later probes keep working.
    pub fn delete(&mut self, key: ObjRef, hash: u32) -> bool {
        if self.capacity() == 0 {
            return false;
        }
        let index = Self::find_entry(&self.entries, self.capacity(), key, hash);
        if self.entries[index].key.is_none() {
            return false;
        }
        self.entries[index].key = None;
        self.entries[index].value = Value::Bool(true);
        true
    }

    pub fn iter(&self) -> impl Iterator<Item = (ObjRef, Value)> + '_ {
        self.entries.iter().filter_map(|e| e.key.map(|k| (k, e.value)))
    }

    /// Copy every live entry of `other` into `self`. Used by `OP_INHERIT`
    /// to snapshot a parent's method table into a child at declaration
    /// time (inheritance is static, spec.md §4.E, §9).
    pub fn copy_from(&mut self, other: &Table) {
        for entry in other.entries.iter() {
            if let Some(key) = entry.key {
                self.set(key, entry.hash, entry.value);
            }
        }
    }

    /// Resolve an interned string by content. Used only by the interner
    /// (`Heap::intern`) before a handle exists for the candidate bytes,
    /// everywhere else, keys are compared by handle equality per spec.md
    /// §3's "pointer-identity... suffices for strings due to interning".
    pub fn find_string(&self, hash: u32, mut bytes_match: impl FnMut(ObjRef) -> bool) -> Option<ObjRef> {
        if self.capacity() == 0 {
            return None;
        }
        let capacity = self.capacity();
        let mut index = (hash as usize) % capacity;
        loop {
            let entry = &self.entries[index];
            match entry.key {
                None if !entry.is_tombstone() => return None,
                Some(k) if entry.hash == hash && bytes_match(k) => return Some(k),
                _ => {}
            }
            index = (index + 1) % capacity;
        }
    }
}

impl Default for Table {
    fn default() -> Table {
        Table::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(n: u32) -> ObjRef {
        ObjRef(n)
    }

    #[test]
    fn set_get_roundtrip() {
        let mut t = Table::new();
        assert!(t.set(h(1), 11, Value::Number(1.0)));
        assert!(t.set(h(2), 22, Value::Number(2.0)));
        assert_eq!(t.get(h(1), 11), Some(Value::Number(1.0)));
        assert_eq!(t.get(h(2), 22), Some(Value::Number(2.0)));
        assert_eq!(t.get(h(3), 33), None);
    }

    #[test]
    fn overwrite_is_not_a_new_key() {
        let mut t = Table::new();
        assert!(t.set(h(1), 11, Value::Bool(true)));
        assert!(!t.set(h(1), 11, Value::Bool(false)));
        assert_eq!(t.get(h(1), 11), Some(Value::Bool(false)));
    }

    #[test]
    fn delete_then_reinsert() {
        let mut t = Table::new();
        t.set(h(1), 11, Value::Number(1.0));
        assert!(t.delete(h(1), 11));
        assert_eq!(t.get(h(1), 11), None);
        assert!(t.set(h(1), 11, Value::Number(9.0)));
        assert_eq!(t.get(h(1), 11), Some(Value::Number(9.0)));
    }

    #[test]
    fn grows_past_load_factor() {
        let mut t = Table::new();
        for i in 0..64u32 {
            t.set(h(i), i * 2654435761, Value::Number(i as f64));
        }
        for i in 0..64u32 {
            assert_eq!(t.get(h(i), i * 2654435761), Some(Value::Number(i as f64)));
        }
    }

    #[test]
    fn copy_from_snapshots_current_contents() {
        let mut parent = Table::new();
        parent.set(h(1), 11, Value::Number(1.0));
        let mut child = Table::new();
        child.copy_from(&parent);
        parent.set(h(2), 22, Value::Number(2.0));
        assert_eq!(child.get(h(1), 11), Some(Value::Number(1.0)));
        assert_eq!(child.get(h(2), 22), None);
    }
}
