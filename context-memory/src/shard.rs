//! Sharded copy-on-write collections for graph snapshots
//!
//! A snapshot clone copies only the shard handles. A write through
//! `Arc::make_mut` copies the one shard it touches while other snapshots
//! still share it, so a commit costs a fraction of the graph instead of all
//! of it.

use std::borrow::Borrow;
use std::cmp::Reverse;
use std::collections::hash_map::DefaultHasher;
use std::collections::{btree_set, BTreeSet, BinaryHeap, HashMap};
use std::hash::{Hash, Hasher};
use std::ops::Bound;
use std::sync::Arc;

const SHARDS: usize = 64;

fn shard_of<Q: Hash + ?Sized>(key: &Q) -> usize {
    // Fixed-key SipHash keeps shard placement stable across clones
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % SHARDS as u64) as usize
}

/// Hash map split into independently shared shards
#[derive(Debug, Clone)]
pub(crate) struct ShardedMap<K, V> {
    shards: Vec<Arc<HashMap<K, V>>>,
    len: usize,
}

impl<K, V> Default for ShardedMap<K, V> {
    fn default() -> Self {
        Self {
            shards: (0..SHARDS).map(|_| Arc::new(HashMap::new())).collect(),
            len: 0,
        }
    }
}

impl<K, V> ShardedMap<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    pub fn get<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.shards[shard_of(key)].get(key)
    }

    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        let shard = Arc::make_mut(&mut self.shards[shard_of(&key)]);
        let old = shard.insert(key, value);
        if old.is_none() {
            self.len += 1;
        }
        old
    }

    pub fn remove<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let index = shard_of(key);
        // A miss must not copy a shared shard
        if !self.shards[index].contains_key(key) {
            return None;
        }
        let old = Arc::make_mut(&mut self.shards[index]).remove(key);
        if old.is_some() {
            self.len -= 1;
        }
        old
    }

    pub fn get_mut<Q>(&mut self, key: &Q) -> Option<&mut V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let index = shard_of(key);
        if !self.shards[index].contains_key(key) {
            return None;
        }
        Arc::make_mut(&mut self.shards[index]).get_mut(key)
    }

    /// Mutable value for `key`, inserting the default first if absent
    pub fn get_or_default(&mut self, key: K) -> &mut V
    where
        V: Default,
    {
        let index = shard_of(&key);
        if !self.shards[index].contains_key(&key) {
            self.len += 1;
        }
        Arc::make_mut(&mut self.shards[index])
            .entry(key)
            .or_default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.shards.iter().flat_map(|shard| shard.iter())
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.shards.iter().flat_map(|shard| shard.values())
    }

    /// Shards this map still shares with `other`
    #[cfg(test)]
    pub fn shared_with(&self, other: &Self) -> usize {
        self.shards
            .iter()
            .zip(other.shards.iter())
            .filter(|(a, b)| Arc::ptr_eq(a, b))
            .count()
    }
}

/// Ordered set split into shared shards; iteration merges the shards back
/// into one ascending sequence
#[derive(Debug, Clone)]
pub(crate) struct ShardedSet<T> {
    shards: Vec<Arc<BTreeSet<T>>>,
    len: usize,
}

impl<T> Default for ShardedSet<T> {
    fn default() -> Self {
        Self {
            shards: (0..SHARDS).map(|_| Arc::new(BTreeSet::new())).collect(),
            len: 0,
        }
    }
}

impl<T> ShardedSet<T>
where
    T: Ord + Hash + Clone,
{
    pub fn insert(&mut self, item: T) -> bool {
        let inserted = Arc::make_mut(&mut self.shards[shard_of(&item)]).insert(item);
        if inserted {
            self.len += 1;
        }
        inserted
    }

    pub fn remove(&mut self, item: &T) -> bool {
        let index = shard_of(item);
        if !self.shards[index].contains(item) {
            return false;
        }
        let removed = Arc::make_mut(&mut self.shards[index]).remove(item);
        if removed {
            self.len -= 1;
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// Every item, ascending
    pub fn iter(&self) -> Merged<'_, T> {
        Merged::new(
            self.shards
                .iter()
                .map(|shard| shard.range::<T, _>(..))
                .collect(),
        )
    }

    /// Items at or above `lower`, ascending
    pub fn iter_from(&self, lower: &T) -> Merged<'_, T> {
        Merged::new(
            self.shards
                .iter()
                .map(|shard| shard.range::<T, _>((Bound::Included(lower), Bound::Unbounded)))
                .collect(),
        )
    }
}

/// K-way merge over the shards of a [`ShardedSet`]
pub(crate) struct Merged<'a, T> {
    heads: BinaryHeap<Reverse<(&'a T, usize)>>,
    ranges: Vec<btree_set::Range<'a, T>>,
}

impl<'a, T: Ord> Merged<'a, T> {
    fn new(mut ranges: Vec<btree_set::Range<'a, T>>) -> Self {
        let heads = ranges
            .iter_mut()
            .enumerate()
            .filter_map(|(shard, range)| range.next().map(|item| Reverse((item, shard))))
            .collect();
        Self { heads, ranges }
    }
}

impl<'a, T: Ord> Iterator for Merged<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<&'a T> {
        let Reverse((item, shard)) = self.heads.pop()?;
        if let Some(next) = self.ranges[shard].next() {
            self.heads.push(Reverse((next, shard)));
        }
        Some(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_clone_shares_untouched_shards() {
        let mut map: ShardedMap<u32, String> = ShardedMap::default();
        for i in 0..1000 {
            map.insert(i, i.to_string());
        }
        let before = map.clone();
        map.insert(5, "five".into());
        map.remove(&7);
        map.remove(&5000);

        assert_eq!(before.get(&5).map(String::as_str), Some("5"));
        assert_eq!(map.get(&5).map(String::as_str), Some("five"));
        assert!(before.get(&7).is_some());
        assert!(map.get(&7).is_none());
        assert_eq!((before.len(), map.len()), (1000, 999));

        assert!(map.shared_with(&before) >= SHARDS - 2);
    }

    #[test]
    fn test_map_get_or_default_counts_new_keys() {
        let mut map: ShardedMap<&str, Vec<u32>> = ShardedMap::default();
        map.get_or_default("a").push(1);
        map.get_or_default("a").push(2);
        map.get_or_default("b").push(3);
        assert_eq!(map.len(), 2);
        assert_eq!(map.get("a"), Some(&vec![1, 2]));
        assert_eq!(map.values().map(Vec::len).sum::<usize>(), 3);
    }

    #[test]
    fn test_set_iterates_in_order_across_shards() {
        let mut set: ShardedSet<(u64, u32)> = ShardedSet::default();
        for i in (0..500u32).rev() {
            set.insert((u64::from(i % 50), i));
        }
        assert!(!set.insert((0, 0)));
        assert!(set.remove(&(1, 1)));
        assert!(!set.remove(&(1, 1)));
        assert_eq!(set.len(), 499);

        let items: Vec<_> = set.iter().copied().collect();
        let mut sorted = items.clone();
        sorted.sort();
        assert_eq!(items, sorted);
        assert_eq!(items.len(), 499);

        let after: Vec<_> = set.iter_from(&(49, 0)).copied().collect();
        assert_eq!(after.len(), 10);
        assert!(after.iter().all(|(g, _)| *g == 49));
    }
}
