//! Reference-counted key/value registry.
//!
//! Every lifecycle in the crate (shared connections, watch subscriptions) is
//! built on this map. It is plain data: owners wrap it in a mutex and never hold
//! that lock across an await point.

use std::borrow::Borrow;
use std::collections::{hash_map, HashMap};
use std::hash::Hash;

#[derive(Debug)]
struct Slot<V> {
    count: usize,
    value: V,
}

#[derive(Debug)]
pub struct RefCountMap<K, V> {
    entries: HashMap<K, Slot<V>>,
}

impl<K: Eq + Hash, V> Default for RefCountMap<K, V> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<K: Eq + Hash, V> RefCountMap<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the entry with a count of 1, or overwrites the value of an
    /// existing entry and bumps its count. Returns the new count.
    pub fn set(&mut self, key: K, value: V) -> usize {
        match self.entries.entry(key) {
            hash_map::Entry::Occupied(mut occupied) => {
                let slot = occupied.get_mut();
                slot.count += 1;
                slot.value = value;
                slot.count
            }
            hash_map::Entry::Vacant(vacant) => {
                vacant.insert(Slot { count: 1, value });
                1
            }
        }
    }

    /// Returns 0 when the key is absent (the caller must create it), otherwise
    /// the incremented count.
    pub fn inc<Q>(&mut self, key: &Q) -> usize
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        match self.entries.get_mut(key) {
            Some(entry) => {
                entry.count += 1;
                entry.count
            }
            None => 0,
        }
    }

    /// Decrements the count. The value is returned (and the entry removed) only
    /// when the count drops to zero.
    pub fn dec<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let entry = self.entries.get_mut(key)?;
        entry.count = entry.count.saturating_sub(1);
        if entry.count == 0 {
            self.entries.remove(key).map(|entry| entry.value)
        } else {
            None
        }
    }

    pub fn del<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.remove(key).map(|entry| entry.value)
    }

    pub fn get<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.get(key).map(|entry| &entry.value)
    }

    pub fn get_mut<Q>(&mut self, key: &Q) -> Option<&mut V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.get_mut(key).map(|entry| &mut entry.value)
    }

    pub fn has<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.contains_key(key)
    }

    pub fn count<Q>(&self, key: &Q) -> usize
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.get(key).map_or(0, |entry| entry.count)
    }

    /// Replaces the value without touching the count. Returns the previous
    /// value, or `None` (and does nothing) when the key is absent.
    pub fn modify<Q>(&mut self, key: &Q, value: V) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries
            .get_mut(key)
            .map(|entry| std::mem::replace(&mut entry.value, value))
    }

    /// Moves the entry at `from` to `to`. When `to` already exists the counts
    /// are summed, the value at `to` is kept and the displaced value from `from`
    /// is returned so the caller can release it.
    pub fn rename_key<Q>(&mut self, from: &Q, to: K) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let moved = self.entries.remove(from)?;
        match self.entries.entry(to) {
            hash_map::Entry::Occupied(mut existing) => {
                existing.get_mut().count += moved.count;
                Some(moved.value)
            }
            hash_map::Entry::Vacant(slot) => {
                slot.insert(moved);
                None
            }
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.entries.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.entries.iter().map(|(key, entry)| (key, &entry.value))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
