//! Sorted multiset ordered by a derived key rather than the value itself.
//!
//! Ported from `examples/original_source/.../sortedlistwithkey.py`'s
//! `SortedKeyList`. Mirrors [`crate::SortedList`] structurally (parallel
//! value/key chunk arrays plus the same `maxes`/index-tree machinery) rather
//! than wrapping it, because the original itself duplicates nearly all of
//! `SortedList`'s methods instead of delegating to it. Unlike the plain
//! variant, a single key can match values spread across a chunk boundary,
//! so lookups that must find a specific value among same-key duplicates
//! (`contains`, `discard`, `count`) scan forward across chunks.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::fmt;

use log::debug;

use crate::bisect;
use crate::error::{err_at, Error, Result};
use crate::index_tree::IndexTree;
use crate::range_iter::{ChunkSpan, RangeIter};

const DEFAULT_LOAD: usize = 1000;

/// A sorted multiset ordered by `key_fn(value)`; values sharing a key keep
/// their relative insertion order.
pub struct SortedListByKey<V: Clone, K: Ord + Clone, F: Fn(&V) -> K> {
    load: usize,
    lists: Vec<Vec<V>>,
    keys: Vec<Vec<K>>,
    maxes: Vec<K>,
    index: RefCell<IndexTree>,
    len: usize,
    key_fn: F,
}

impl<V: Clone, K: Ord + Clone, F: Fn(&V) -> K + Clone> Clone for SortedListByKey<V, K, F> {
    fn clone(&self) -> Self {
        SortedListByKey {
            load: self.load,
            lists: self.lists.clone(),
            keys: self.keys.clone(),
            maxes: self.maxes.clone(),
            index: RefCell::new(self.index.borrow().clone()),
            len: self.len,
            key_fn: self.key_fn.clone(),
        }
    }
}

impl<V: Clone + fmt::Debug, K: Ord + Clone + fmt::Debug, F: Fn(&V) -> K> fmt::Debug
    for SortedListByKey<V, K, F>
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SortedListByKey")
            .field("load", &self.load)
            .field("values", &self.iter().collect::<Vec<_>>())
            .finish()
    }
}

// Construction.
impl<V: Clone, K: Ord + Clone, F: Fn(&V) -> K> SortedListByKey<V, K, F> {
    pub fn new(key_fn: F) -> SortedListByKey<V, K, F> {
        SortedListByKey::with_load(key_fn, DEFAULT_LOAD).expect("default load is valid")
    }

    pub fn with_load(key_fn: F, load: usize) -> Result<SortedListByKey<V, K, F>> {
        if load < 4 {
            return Err(err_at!(InvalidArgument, "load must be >= 4, got {}", load));
        }
        let load = if load % 2 == 1 { load + 1 } else { load };
        Ok(SortedListByKey {
            load,
            lists: Vec::new(),
            keys: Vec::new(),
            maxes: Vec::new(),
            index: RefCell::new(IndexTree::new()),
            len: 0,
            key_fn,
        })
    }

    pub fn from_values<I: IntoIterator<Item = V>>(iterable: I, key_fn: F) -> SortedListByKey<V, K, F> {
        let mut list = SortedListByKey::new(key_fn);
        list.update(iterable);
        list
    }

    pub fn load(&self) -> usize {
        self.load
    }

    pub fn key(&self, val: &V) -> K {
        (self.key_fn)(val)
    }
}

// Internal positional helpers.
impl<V: Clone, K: Ord + Clone, F: Fn(&V) -> K> SortedListByKey<V, K, F> {
    fn ensure_index_built(&self) {
        if self.index.borrow().is_stale() {
            let lengths: Vec<usize> = self.lists.iter().map(Vec::len).collect();
            self.index.borrow_mut().build(&lengths);
        }
    }

    fn pos_of(&self, idx: usize) -> (usize, usize) {
        if idx < self.lists[0].len() {
            return (0, idx);
        }
        let last = self.lists.len() - 1;
        let last_len = self.lists[last].len();
        if idx >= self.len - last_len {
            return (last, idx - (self.len - last_len));
        }
        self.ensure_index_built();
        self.index.borrow().pos(idx)
    }

    fn loc_of(&self, pos: usize, idx: usize) -> usize {
        if pos == 0 {
            return idx;
        }
        self.ensure_index_built();
        self.index.borrow().loc(pos, idx)
    }

    fn resolve_index(&self, idx: isize) -> Result<usize> {
        let n = self.len as isize;
        let resolved = if idx < 0 { idx + n } else { idx };
        if resolved < 0 || resolved >= n {
            return Err(Error::out_of_range(idx, self.len));
        }
        Ok(resolved as usize)
    }

    /// Step one `(chunk, offset)` cursor forward by one element, crossing
    /// chunk boundaries; returns `None` at the end of the container.
    fn step(&self, pos: (usize, usize)) -> Option<(usize, usize)> {
        let (c, i) = pos;
        if c >= self.lists.len() {
            return None;
        }
        if i + 1 < self.lists[c].len() {
            return Some((c, i + 1));
        }
        if c + 1 < self.lists.len() {
            return Some((c + 1, 0));
        }
        None
    }

    fn expand(&mut self, pos: usize) {
        let twice = self.load * 2;
        if self.lists[pos].len() > twice {
            debug!("splitting chunk {} (len {}, load {})", pos, self.lists[pos].len(), self.load);
            let tail_v = self.lists[pos].split_off(self.load);
            let tail_k = self.keys[pos].split_off(self.load);
            self.maxes[pos] = self.keys[pos].last().unwrap().clone();
            self.maxes.insert(pos + 1, tail_k.last().unwrap().clone());
            self.lists.insert(pos + 1, tail_v);
            self.keys.insert(pos + 1, tail_k);
            self.index.get_mut().invalidate();
        } else if !self.index.get_mut().is_stale() {
            self.index.get_mut().bump_path(pos, 1);
        }
    }

    fn delete_at(&mut self, pos: usize, idx: usize) -> V {
        self.keys[pos].remove(idx);
        let val = self.lists[pos].remove(idx);
        self.len -= 1;
        let half = self.load / 2;
        let new_len = self.lists[pos].len();

        if new_len > half {
            self.maxes[pos] = self.keys[pos].last().unwrap().clone();
            self.index.get_mut().bump_path(pos, -1);
        } else if self.lists.len() > 1 {
            let target = if pos == 0 { 0 } else { pos - 1 };
            let source = target + 1;
            debug!("merging chunk {} into chunk {} (shrunk below load/2)", source, target);
            let tail_v = self.lists.remove(source);
            let tail_k = self.keys.remove(source);
            self.lists[target].extend(tail_v);
            self.keys[target].extend(tail_k);
            self.maxes[target] = self.keys[target].last().unwrap().clone();
            self.maxes.remove(source);
            self.index.get_mut().invalidate();
            self.expand(target);
        } else if new_len > 0 {
            self.maxes[pos] = self.keys[pos].last().unwrap().clone();
        } else {
            self.lists.remove(pos);
            self.keys.remove(pos);
            self.maxes.remove(pos);
            self.index.get_mut().invalidate();
        }

        val
    }
}

// Mutating operations.
impl<V: Clone, K: Ord + Clone, F: Fn(&V) -> K> SortedListByKey<V, K, F> {
    pub fn add(&mut self, val: V) {
        let key = (self.key_fn)(&val);
        if self.lists.is_empty() {
            self.maxes.push(key.clone());
            self.keys.push(vec![key]);
            self.lists.push(vec![val]);
            self.len = 1;
            return;
        }

        let pos = bisect::bisect_right(&self.maxes, &key);
        let pos = if pos == self.maxes.len() {
            let pos = pos - 1;
            self.maxes[pos] = key.clone();
            self.keys[pos].push(key);
            self.lists[pos].push(val);
            pos
        } else {
            let idx = bisect::bisect_right(&self.keys[pos], &key);
            self.keys[pos].insert(idx, key);
            self.lists[pos].insert(idx, val);
            pos
        };

        self.len += 1;
        self.expand(pos);
    }

    /// Bulk-load `iterable`, sorting by key first; need not already be
    /// ordered.
    pub fn update<I: IntoIterator<Item = V>>(&mut self, iterable: I) {
        let mut values: Vec<V> = iterable.into_iter().collect();
        if values.is_empty() {
            return;
        }
        values.sort_by_key(|v| (self.key_fn)(v));

        if !self.maxes.is_empty() {
            if values.len() * 4 >= self.len {
                for chunk_v in self.lists.drain(..) {
                    values.extend(chunk_v);
                }
                self.keys.clear();
                values.sort_by_key(|v| (self.key_fn)(v));
                self.maxes.clear();
                self.index.get_mut().invalidate();
            } else {
                for v in values {
                    self.add(v);
                }
                return;
            }
        }

        let load = self.load;
        for chunk in values.chunks(load) {
            let keys: Vec<K> = chunk.iter().map(|v| (self.key_fn)(v)).collect();
            self.maxes.push(keys.last().unwrap().clone());
            self.keys.push(keys);
            self.lists.push(chunk.to_vec());
        }
        self.len = self.lists.iter().map(Vec::len).sum();
        self.index.get_mut().invalidate();
    }

    /// Append `values` whose keys must already be non-decreasing and must
    /// not violate order with the existing tail.
    pub fn extend<I: IntoIterator<Item = V>>(&mut self, values: I) -> Result<()> {
        let values: Vec<V> = values.into_iter().collect();
        if values.is_empty() {
            return Ok(());
        }
        let new_keys: Vec<K> = values.iter().map(|v| (self.key_fn)(v)).collect();
        for (i, w) in new_keys.windows(2).enumerate() {
            if w[0] > w[1] {
                return Err(Error::order_violation(self.len + i + 1, "given sequence not in key order".to_string()));
            }
        }

        let mut offset = 0usize;
        if !self.maxes.is_empty() {
            if new_keys[0] < *self.keys.last().unwrap().last().unwrap() {
                return Err(Error::order_violation(
                    self.len,
                    "key not in sort order at join with existing tail".into(),
                ));
            }
            let half = self.load / 2;
            if self.lists.last().unwrap().len() < half {
                let take = self.load.min(values.len());
                self.lists.last_mut().unwrap().extend(values[..take].iter().cloned());
                self.keys.last_mut().unwrap().extend(new_keys[..take].iter().cloned());
                *self.maxes.last_mut().unwrap() = self.keys.last().unwrap().last().unwrap().clone();
                offset = take;
            }
        }

        let len_lists_before = self.lists.len();
        let mut idx = offset;
        while idx < values.len() {
            let end = (idx + self.load).min(values.len());
            self.maxes.push(new_keys[end - 1].clone());
            self.keys.push(new_keys[idx..end].to_vec());
            self.lists.push(values[idx..end].to_vec());
            idx = end;
        }

        if len_lists_before == self.lists.len() {
            if !self.index.get_mut().is_stale() {
                let last = self.lists.len() - 1;
                self.index.get_mut().bump_path(last, values.len() as isize);
            }
        } else {
            self.index.get_mut().invalidate();
        }

        self.len += values.len();
        Ok(())
    }

    pub fn append(&mut self, val: V) -> Result<()> {
        let key = (self.key_fn)(&val);
        if self.maxes.is_empty() {
            self.maxes.push(key.clone());
            self.keys.push(vec![key]);
            self.lists.push(vec![val]);
            self.len = 1;
            return Ok(());
        }
        let pos = self.lists.len() - 1;
        if key < *self.keys[pos].last().unwrap() {
            return Err(Error::order_violation(self.len, "key precedes current tail".into()));
        }
        self.maxes[pos] = key.clone();
        self.keys[pos].push(key);
        self.lists[pos].push(val);
        self.len += 1;
        self.expand(pos);
        Ok(())
    }

    /// Insert `val` at position `idx`, keyed order permitting. Out-of-range
    /// indices clamp to the nearest valid bound.
    pub fn insert(&mut self, idx: isize, val: V) -> Result<()> {
        let n = self.len as isize;
        let idx = if idx < 0 { (idx + n).max(0) } else { idx };
        let idx = idx.min(n) as usize;
        let key = (self.key_fn)(&val);

        if self.maxes.is_empty() {
            self.maxes.push(key.clone());
            self.keys.push(vec![key]);
            self.lists.push(vec![val]);
            self.len = 1;
            return Ok(());
        }

        if idx == 0 {
            if key > self.keys[0][0] {
                return Err(Error::order_violation(0, "key exceeds current head".into()));
            }
            self.keys[0].insert(0, key);
            self.lists[0].insert(0, val);
            self.expand(0);
            self.len += 1;
            return Ok(());
        }

        if idx == self.len {
            let pos = self.lists.len() - 1;
            if *self.keys[pos].last().unwrap() > key {
                return Err(Error::order_violation(self.len, "key precedes current tail".into()));
            }
            self.maxes[pos] = key.clone();
            self.keys[pos].push(key);
            self.lists[pos].push(val);
            self.len += 1;
            self.expand(pos);
            return Ok(());
        }

        let (pos, off) = self.pos_of(idx);
        let (pos_before, idx_before) = if off == 0 {
            (pos - 1, self.keys[pos - 1].len() - 1)
        } else {
            (pos, off - 1)
        };

        let before = &self.keys[pos_before][idx_before];
        let after = &self.keys[pos][off];
        if before <= &key && &key <= after {
            self.keys[pos].insert(off, key);
            self.lists[pos].insert(off, val);
            self.expand(pos);
            self.len += 1;
            Ok(())
        } else {
            Err(Error::order_violation(idx, "key out of order at insertion point".into()))
        }
    }

    /// Remove the first value equal to `val` (compared by `eq`, since two
    /// distinct values may share a key); fails with `NotFound` if absent.
    pub fn remove<E: Fn(&V, &V) -> bool>(&mut self, val: &V, eq: E) -> Result<()> {
        if self.discard(val, eq) {
            Ok(())
        } else {
            Err(err_at!(NotFound, "value not in list"))
        }
    }

    /// Remove the first value equal to `val` under `eq`; returns `true` if
    /// removed. Scans forward across chunk boundaries within the matching
    /// key range, since a key group can straddle a split.
    pub fn discard<E: Fn(&V, &V) -> bool>(&mut self, val: &V, eq: E) -> bool {
        let key = (self.key_fn)(val);
        if self.maxes.is_empty() {
            return false;
        }
        let pos = bisect::bisect_left(&self.maxes, &key);
        if pos == self.maxes.len() {
            return false;
        }
        let idx = bisect::bisect_left(&self.keys[pos], &key);
        let mut cursor = Some((pos, idx));
        while let Some((c, i)) = cursor {
            if c >= self.keys.len() || self.keys[c][i] != key {
                break;
            }
            if eq(&self.lists[c][i], val) {
                self.delete_at(c, i);
                return true;
            }
            cursor = self.step((c, i));
        }
        false
    }

    pub fn pop(&mut self, idx: isize) -> Result<V> {
        let ridx = self.resolve_index(idx)?;
        let (pos, off) = self.pos_of(ridx);
        Ok(self.delete_at(pos, off))
    }

    pub fn pop_back(&mut self) -> Result<V> {
        self.pop(-1)
    }

    pub fn clear(&mut self) {
        self.lists.clear();
        self.keys.clear();
        self.maxes.clear();
        self.index.get_mut().invalidate();
        self.len = 0;
    }

    /// Delete the contiguous range `[range.start, range.end)`.
    pub fn delete_range(&mut self, range: std::ops::Range<usize>) -> Result<()> {
        let start = range.start.min(self.len);
        let stop = range.end.min(self.len);
        if start >= stop {
            return Ok(());
        }
        if start == 0 && stop == self.len {
            self.clear();
            return Ok(());
        }
        if self.len <= 8 * (stop - start) {
            let mut values: Vec<V> = self.islice(None, Some(start as isize), false).cloned().collect();
            if stop < self.len {
                values.extend(self.islice(Some(stop as isize), None, false).cloned());
            }
            self.clear();
            self.update(values);
            return Ok(());
        }
        for idx in (start..stop).rev() {
            let (pos, off) = self.pos_of(idx);
            self.delete_at(pos, off);
        }
        Ok(())
    }

    /// Delete an arbitrary set of positional indices (e.g. the result of a
    /// non-unit-stride slice), in one pass, greatest index first.
    pub fn delete_indices<I: IntoIterator<Item = usize>>(&mut self, indices: I) -> Result<()> {
        let mut idxs: Vec<usize> = indices.into_iter().collect();
        idxs.sort_unstable_by(|a, b| b.cmp(a));
        idxs.dedup();
        for idx in idxs {
            if idx >= self.len {
                return Err(Error::out_of_range(idx as isize, self.len));
            }
            let (pos, off) = self.pos_of(idx);
            self.delete_at(pos, off);
        }
        Ok(())
    }

    fn check_key_order_at(&self, idx: usize, key: &K) -> Result<()> {
        let (pos, loc) = self.pos_of(idx);

        if idx > 0 {
            let (pos_prev, idx_prev) = if loc == 0 {
                (pos - 1, self.keys[pos - 1].len() - 1)
            } else {
                (pos, loc - 1)
            };
            if &self.keys[pos_prev][idx_prev] > key {
                return Err(Error::order_violation(idx, "key is less than its predecessor".into()));
            }
        }

        if idx + 1 < self.len {
            let (pos_next, idx_next) = if loc + 1 == self.keys[pos].len() {
                (pos + 1, 0)
            } else {
                (pos, loc + 1)
            };
            if &self.keys[pos_next][idx_next] < key {
                return Err(Error::order_violation(idx, "key is greater than its successor".into()));
            }
        }

        Ok(())
    }

    /// Replace the value at `idx`, rejecting the write if its key would
    /// violate order relative to its neighbours.
    pub fn replace_at(&mut self, idx: isize, value: V) -> Result<()> {
        let ridx = self.resolve_index(idx)?;
        let key = (self.key_fn)(&value);
        self.check_key_order_at(ridx, &key)?;
        let (pos, off) = self.pos_of(ridx);
        self.lists[pos][off] = value;
        self.keys[pos][off] = key.clone();
        if off + 1 == self.keys[pos].len() {
            self.maxes[pos] = key;
        }
        Ok(())
    }

    /// Replace the contiguous range `[range.start, range.end)` with
    /// `values`. Validates that `values`' keys are themselves
    /// non-decreasing and join correctly at both seams before mutating.
    pub fn replace_range(&mut self, range: std::ops::Range<usize>, values: Vec<V>) -> Result<()> {
        let start = range.start.min(self.len);
        let stop = range.end.min(self.len);
        if start > stop {
            return Err(err_at!(InvalidArgument, "range start after end"));
        }
        if start == 0 && stop == self.len {
            self.clear();
            self.update(values);
            return Ok(());
        }

        let new_keys: Vec<K> = values.iter().map(|v| (self.key_fn)(v)).collect();
        for (i, w) in new_keys.windows(2).enumerate() {
            if w[0] > w[1] {
                return Err(Error::order_violation(start + i + 1, "given sequence not in key order".to_string()));
            }
        }
        if start > 0 {
            if let Some(first_key) = new_keys.first() {
                let prev = self.get(start as isize - 1)?;
                if (self.key_fn)(prev) > *first_key {
                    return Err(Error::order_violation(start, "replacement precedes its predecessor".into()));
                }
            }
        }
        if stop != self.len {
            if let Some(last_key) = new_keys.last() {
                let next = self.get(stop as isize)?;
                if (self.key_fn)(next) < *last_key {
                    return Err(Error::order_violation(stop, "replacement exceeds its successor".into()));
                }
            }
        }

        self.delete_range(start..stop)?;
        for (i, v) in values.into_iter().enumerate() {
            self.insert(start as isize + i as isize, v)?;
        }
        Ok(())
    }

    /// Replace values at arbitrary `indices` (e.g. a non-unit-stride
    /// slice). All writes are journaled and rolled back atomically if any
    /// resulting position would violate key order.
    pub fn replace_stride(&mut self, indices: &[usize], values: Vec<V>) -> Result<()> {
        if indices.len() != values.len() {
            return Err(err_at!(
                InvalidArgument,
                "attempt to assign sequence of size {} to extended slice of size {}",
                values.len(),
                indices.len()
            ));
        }

        let mut log: Vec<(usize, V, K, K)> = Vec::with_capacity(indices.len());
        for (&idx, val) in indices.iter().zip(values.into_iter()) {
            let (pos, off) = self.pos_of(idx);
            let old_val = self.lists[pos][off].clone();
            let old_key = self.keys[pos][off].clone();
            let new_key = (self.key_fn)(&val);
            self.lists[pos][off] = val;
            self.keys[pos][off] = new_key.clone();
            if off + 1 == self.keys[pos].len() {
                self.maxes[pos] = new_key.clone();
            }
            log.push((idx, old_val, old_key, new_key));
        }

        for (idx, _, _, newkey) in &log {
            if let Err(e) = self.check_key_order_at(*idx, newkey) {
                for (idx2, oldval2, oldkey2, _) in log {
                    let (pos, off) = self.pos_of(idx2);
                    self.lists[pos][off] = oldval2;
                    self.keys[pos][off] = oldkey2.clone();
                    if off + 1 == self.keys[pos].len() {
                        self.maxes[pos] = oldkey2;
                    }
                }
                return Err(e);
            }
        }
        Ok(())
    }
}

// Query operations.
impl<V: Clone, K: Ord + Clone, F: Fn(&V) -> K> SortedListByKey<V, K, F> {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether any stored value equals `val` under `eq`. Scans forward
    /// across the matching key range.
    pub fn contains<E: Fn(&V, &V) -> bool>(&self, val: &V, eq: E) -> bool {
        let key = (self.key_fn)(val);
        if self.maxes.is_empty() {
            return false;
        }
        let pos = bisect::bisect_left(&self.maxes, &key);
        if pos == self.maxes.len() {
            return false;
        }
        let idx = bisect::bisect_left(&self.keys[pos], &key);
        let mut cursor = Some((pos, idx));
        while let Some((c, i)) = cursor {
            if c >= self.keys.len() || self.keys[c][i] != key {
                return false;
            }
            if eq(&self.lists[c][i], val) {
                return true;
            }
            cursor = self.step((c, i));
        }
        false
    }

    /// Count of values equal to `val` under `eq` (not merely sharing a key).
    pub fn count<E: Fn(&V, &V) -> bool>(&self, val: &V, eq: E) -> usize {
        let key = (self.key_fn)(val);
        if self.maxes.is_empty() {
            return 0;
        }
        let pos = bisect::bisect_left(&self.maxes, &key);
        if pos == self.maxes.len() {
            return 0;
        }
        let idx = bisect::bisect_left(&self.keys[pos], &key);
        let mut cursor = Some((pos, idx));
        let mut n = 0;
        while let Some((c, i)) = cursor {
            if c >= self.keys.len() || self.keys[c][i] != key {
                break;
            }
            if eq(&self.lists[c][i], val) {
                n += 1;
            }
            cursor = self.step((c, i));
        }
        n
    }

    /// Count of values whose key equals `key` (regardless of value identity).
    pub fn count_key(&self, key: &K) -> usize {
        if self.maxes.is_empty() {
            return 0;
        }
        let pos_left = bisect::bisect_left(&self.maxes, key);
        if pos_left == self.maxes.len() {
            return 0;
        }
        let idx_left = bisect::bisect_left(&self.keys[pos_left], key);
        let pos_right = bisect::bisect_right(&self.maxes, key);
        if pos_right == self.maxes.len() {
            return self.len - self.loc_of(pos_left, idx_left);
        }
        let idx_right = bisect::bisect_right(&self.keys[pos_right], key);
        if pos_left == pos_right {
            idx_right - idx_left
        } else {
            self.loc_of(pos_right, idx_right) - self.loc_of(pos_left, idx_left)
        }
    }

    /// Leftmost index `k` with `start <= k < stop` and `self[k]` equal to
    /// `val` under `eq`.
    pub fn index_of<E: Fn(&V, &V) -> bool>(
        &self,
        val: &V,
        eq: E,
        start: Option<isize>,
        stop: Option<isize>,
    ) -> Result<usize> {
        let key = (self.key_fn)(val);
        if self.maxes.is_empty() {
            return Err(err_at!(NotFound, "value not in list"));
        }
        let n = self.len as isize;
        let start = start.map(|s| if s < 0 { s + n } else { s }).unwrap_or(0).max(0);
        let stop = stop.map(|s| if s < 0 { s + n } else { s }).unwrap_or(n).min(n);
        if stop <= start {
            return Err(err_at!(NotFound, "value not in list"));
        }

        let pos = bisect::bisect_left(&self.maxes, &key);
        if pos == self.maxes.len() {
            return Err(err_at!(NotFound, "value not in list"));
        }
        let idx = bisect::bisect_left(&self.keys[pos], &key);
        let mut cursor = Some((pos, idx));
        while let Some((c, i)) = cursor {
            if c >= self.keys.len() || self.keys[c][i] != key {
                break;
            }
            let abs = self.loc_of(c, i) as isize;
            if abs >= start && abs < stop && eq(&self.lists[c][i], val) {
                return Ok(abs as usize);
            }
            cursor = self.step((c, i));
        }
        Err(err_at!(NotFound, "value not in list"))
    }

    pub fn bisect_key_left(&self, key: &K) -> usize {
        if self.maxes.is_empty() {
            return 0;
        }
        let pos = bisect::bisect_left(&self.maxes, key);
        if pos == self.maxes.len() {
            return self.len;
        }
        let idx = bisect::bisect_left(&self.keys[pos], key);
        self.loc_of(pos, idx)
    }

    pub fn bisect_key_right(&self, key: &K) -> usize {
        if self.maxes.is_empty() {
            return 0;
        }
        let pos = bisect::bisect_right(&self.maxes, key);
        if pos == self.maxes.len() {
            return self.len;
        }
        let idx = bisect::bisect_right(&self.keys[pos], key);
        self.loc_of(pos, idx)
    }

    pub fn get(&self, idx: isize) -> Result<&V> {
        let ridx = self.resolve_index(idx)?;
        let (pos, off) = self.pos_of(ridx);
        Ok(&self.lists[pos][off])
    }

    /// Clone out the positional range `[range.start, range.end)`.
    pub fn get_range(&self, range: std::ops::Range<usize>) -> Vec<V> {
        self.islice(Some(range.start as isize), Some(range.end as isize), false).cloned().collect()
    }

    pub fn iter(&self) -> RangeIter<'_, V> {
        if self.lists.is_empty() {
            return RangeIter::new(ChunkSpan::empty(&self.lists), false);
        }
        let end = self.lists.len();
        RangeIter::new(ChunkSpan::new(&self.lists, (0, 0), (end, 0), self.len), false)
    }

    pub fn islice(&self, start: Option<isize>, stop: Option<isize>, reverse: bool) -> RangeIter<'_, V> {
        if self.len == 0 {
            return RangeIter::new(ChunkSpan::empty(&self.lists), false);
        }
        let n = self.len as isize;
        let clamp = |v: isize| -> isize {
            let v = if v < 0 { v + n } else { v };
            v.clamp(0, n)
        };
        let start = start.map(clamp).unwrap_or(0);
        let stop = stop.map(clamp).unwrap_or(n);
        if start >= stop {
            return RangeIter::new(ChunkSpan::empty(&self.lists), false);
        }
        let (start, stop) = (start as usize, stop as usize);
        let min = self.pos_of(start);
        let max = if stop == self.len {
            (self.lists.len(), 0)
        } else {
            self.pos_of(stop)
        };
        RangeIter::new(ChunkSpan::new(&self.lists, min, max, stop - start), reverse)
    }

    /// Value range `[min, max]` (or half-open per `inclusive`), projected
    /// through the key function and delegated to `irange_key`; `reverse`
    /// yields descending order.
    pub fn irange(
        &self,
        min: Option<&V>,
        max: Option<&V>,
        inclusive: (bool, bool),
        reverse: bool,
    ) -> RangeIter<'_, V> {
        let min_key = min.map(|v| (self.key_fn)(v));
        let max_key = max.map(|v| (self.key_fn)(v));
        self.irange_key(min_key.as_ref(), max_key.as_ref(), inclusive, reverse)
    }

    /// Key range `[min, max]` (or half-open per `inclusive`); `reverse`
    /// yields descending order.
    pub fn irange_key(
        &self,
        min: Option<&K>,
        max: Option<&K>,
        inclusive: (bool, bool),
        reverse: bool,
    ) -> RangeIter<'_, V> {
        if self.maxes.is_empty() {
            return RangeIter::new(ChunkSpan::empty(&self.lists), false);
        }
        let last_chunk = self.lists.len() - 1;
        let end_bound = (last_chunk, self.lists[last_chunk].len());

        let min_pos_idx = match min {
            None => Some((0, 0)),
            Some(k) if inclusive.0 => {
                let p = bisect::bisect_left(&self.maxes, k);
                if p == self.maxes.len() {
                    None
                } else {
                    Some((p, bisect::bisect_left(&self.keys[p], k)))
                }
            }
            Some(k) => {
                let p = bisect::bisect_right(&self.maxes, k);
                if p == self.maxes.len() {
                    None
                } else {
                    Some((p, bisect::bisect_right(&self.keys[p], k)))
                }
            }
        };
        let (min_pos, min_idx) = match min_pos_idx {
            Some(pair) => pair,
            None => return RangeIter::new(ChunkSpan::empty(&self.lists), false),
        };

        let (max_pos, max_idx) = match max {
            None => end_bound,
            Some(k) if inclusive.1 => {
                let p = bisect::bisect_right(&self.maxes, k);
                if p == self.maxes.len() {
                    end_bound
                } else {
                    (p, bisect::bisect_right(&self.keys[p], k))
                }
            }
            Some(k) => {
                let p = bisect::bisect_left(&self.maxes, k);
                if p == self.maxes.len() {
                    end_bound
                } else {
                    (p, bisect::bisect_left(&self.keys[p], k))
                }
            }
        };

        if min_pos > max_pos || (min_pos == max_pos && min_idx >= max_idx) {
            return RangeIter::new(ChunkSpan::empty(&self.lists), false);
        }

        let remaining = self.loc_of(max_pos, max_idx) - self.loc_of(min_pos, min_idx);
        RangeIter::new(ChunkSpan::new(&self.lists, (min_pos, min_idx), (max_pos, max_idx), remaining), reverse)
    }

    /// Validate every structural invariant (§3), including key/value chunk
    /// parallelism; O(n). Intended for tests and debug builds.
    #[cfg(any(test, feature = "check"))]
    pub fn check(&self) -> Result<()> {
        if self.load < 4 || self.load % 2 != 0 {
            return Err(err_at!(InvalidArgument, "load {} violates >=4 and even", self.load));
        }
        if self.maxes.is_empty() {
            if !self.lists.is_empty() || !self.keys.is_empty() {
                return Err(err_at!(InvalidArgument, "lists/keys non-empty with no maxes"));
            }
            return Ok(());
        }
        if self.maxes.len() != self.lists.len() || self.lists.len() != self.keys.len() {
            return Err(err_at!(InvalidArgument, "maxes/lists/keys length mismatch"));
        }
        for (chunk_v, chunk_k) in self.lists.iter().zip(self.keys.iter()) {
            if chunk_v.len() != chunk_k.len() {
                return Err(err_at!(InvalidArgument, "value/key chunk length mismatch"));
            }
            for w in chunk_k.windows(2) {
                if w[0] > w[1] {
                    return Err(err_at!(InvalidArgument, "chunk keys not sorted"));
                }
            }
            for (v, k) in chunk_v.iter().zip(chunk_k.iter()) {
                if (self.key_fn)(v) != *k {
                    return Err(err_at!(InvalidArgument, "cached key does not match key_fn(value)"));
                }
            }
        }
        for w in self.keys.windows(2) {
            if w[0].last().unwrap() > w[1].first().unwrap() {
                return Err(err_at!(InvalidArgument, "chunk boundary out of key order"));
            }
        }
        for (i, chunk_k) in self.keys.iter().enumerate() {
            if &self.maxes[i] != chunk_k.last().unwrap() {
                return Err(err_at!(InvalidArgument, "maxes[{}] mismatched", i));
            }
        }
        let twice = self.load * 2;
        let half = self.load / 2;
        for chunk_v in &self.lists {
            if chunk_v.len() > twice {
                return Err(err_at!(InvalidArgument, "chunk exceeds 2L"));
            }
        }
        for chunk_v in &self.lists[..self.lists.len() - 1] {
            if chunk_v.len() < half {
                return Err(err_at!(InvalidArgument, "non-final chunk below L/2"));
            }
        }
        let total: usize = self.lists.iter().map(Vec::len).sum();
        if total != self.len {
            return Err(err_at!(InvalidArgument, "len mismatch"));
        }
        if !self.index.borrow().is_stale() {
            let lengths: Vec<usize> = self.lists.iter().map(Vec::len).collect();
            let mut fresh = IndexTree::new();
            fresh.build(&lengths);
            if fresh.nodes() != self.index.borrow().nodes() || fresh.offset() != self.index.borrow().offset() {
                return Err(err_at!(InvalidArgument, "index tree inconsistent"));
            }
        }
        Ok(())
    }
}

impl<V: Clone, K: Ord + Clone, F: Fn(&V) -> K + Clone> SortedListByKey<V, K, F> {
    /// Build a new container from `self` concatenated with `other` (`other`
    /// need not be sorted by key; it is bulk-loaded). The building block
    /// `Add` reuses.
    pub fn concat<I: IntoIterator<Item = V>>(&self, other: I) -> SortedListByKey<V, K, F> {
        let mut out = SortedListByKey::with_load(self.key_fn.clone(), self.load).expect("load already validated");
        out.update(self.iter().cloned());
        out.update(other);
        out
    }
}

impl<V: Clone, K: Ord + Clone, F: Fn(&V) -> K> std::ops::Index<usize> for SortedListByKey<V, K, F> {
    type Output = V;
    fn index(&self, idx: usize) -> &V {
        self.get(idx as isize).expect("index out of bounds")
    }
}

impl<'a, V: Clone, K: Ord + Clone, F: Fn(&V) -> K> IntoIterator for &'a SortedListByKey<V, K, F> {
    type Item = &'a V;
    type IntoIter = RangeIter<'a, V>;
    fn into_iter(self) -> RangeIter<'a, V> {
        self.iter()
    }
}

impl<V: Clone + PartialEq, K: Ord + Clone, F: Fn(&V) -> K> PartialEq for SortedListByKey<V, K, F> {
    fn eq(&self, other: &Self) -> bool {
        self.len == other.len && self.iter().eq(other.iter())
    }
}

impl<V: Clone + Eq, K: Ord + Clone, F: Fn(&V) -> K> Eq for SortedListByKey<V, K, F> {}

impl<V: Clone + PartialOrd, K: Ord + Clone, F: Fn(&V) -> K> PartialOrd for SortedListByKey<V, K, F> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        self.iter().partial_cmp(other.iter())
    }
}

impl<V: Clone + Ord, K: Ord + Clone, F: Fn(&V) -> K> Ord for SortedListByKey<V, K, F> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.iter().cmp(other.iter())
    }
}

impl<V: Clone, K: Ord + Clone, F: Fn(&V) -> K + Clone> std::ops::Add for SortedListByKey<V, K, F> {
    type Output = SortedListByKey<V, K, F>;
    fn add(self, rhs: SortedListByKey<V, K, F>) -> SortedListByKey<V, K, F> {
        self.concat(rhs.lists.into_iter().flatten())
    }
}

impl<V: Clone, K: Ord + Clone, F: Fn(&V) -> K + Clone> std::ops::AddAssign for SortedListByKey<V, K, F> {
    fn add_assign(&mut self, rhs: SortedListByKey<V, K, F>) {
        self.update(rhs.lists.into_iter().flatten());
    }
}

impl<V: Clone, K: Ord + Clone, F: Fn(&V) -> K + Clone> std::ops::Mul<usize> for SortedListByKey<V, K, F> {
    type Output = SortedListByKey<V, K, F>;
    fn mul(self, rhs: usize) -> SortedListByKey<V, K, F> {
        let key_fn = self.key_fn.clone();
        let load = self.load;
        let values: Vec<V> = self.lists.into_iter().flatten().collect();
        let repeated: Vec<V> = values.iter().cloned().cycle().take(values.len() * rhs).collect();
        let mut out = SortedListByKey::with_load(key_fn, load).expect("load already validated");
        out.update(repeated);
        out
    }
}

impl<V: Clone, K: Ord + Clone, F: Fn(&V) -> K + Clone> std::ops::MulAssign<usize> for SortedListByKey<V, K, F> {
    fn mul_assign(&mut self, rhs: usize) {
        let values: Vec<V> = self.iter().cloned().collect();
        self.clear();
        let repeated: Vec<V> = values.iter().cloned().cycle().take(values.len() * rhs).collect();
        self.update(repeated);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
    struct Entry {
        priority: i32,
        name: &'static str,
    }

    fn by_priority(e: &Entry) -> i32 {
        e.priority
    }

    fn list_of(load: usize, entries: &[(i32, &'static str)]) -> SortedListByKey<Entry, i32, fn(&Entry) -> i32> {
        let mut list = SortedListByKey::with_load(by_priority as fn(&Entry) -> i32, load).unwrap();
        list.update(entries.iter().map(|&(priority, name)| Entry { priority, name }));
        list
    }

    #[test]
    fn orders_by_key_not_value() {
        let list = list_of(4, &[(3, "c"), (1, "a"), (2, "b"), (1, "a2")]);
        let keys: Vec<i32> = list.iter().map(|e| e.priority).collect();
        assert_eq!(keys, vec![1, 1, 2, 3]);
        list.check().unwrap();
    }

    #[test]
    fn same_key_preserves_insertion_order() {
        let list = list_of(4, &[(1, "a"), (1, "b"), (1, "c")]);
        let names: Vec<&str> = list.iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn discard_scans_across_key_group() {
        let mut list = list_of(4, &[(1, "a"), (1, "b"), (1, "c"), (2, "d")]);
        let removed = list.discard(&Entry { priority: 1, name: "c" }, |a, b| a.name == b.name);
        assert!(removed);
        let names: Vec<&str> = list.iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["a", "b", "d"]);
        list.check().unwrap();
    }

    #[test]
    fn irange_key_scenario() {
        let list = list_of(4, &[(5, "e"), (1, "a"), (3, "c"), (2, "b"), (4, "d")]);
        let keys: Vec<i32> = list.irange_key(Some(&2), Some(&4), (true, true), false).map(|e| e.priority).collect();
        assert_eq!(keys, vec![2, 3, 4]);
    }

    #[test]
    fn count_key_vs_count_value() {
        let list = list_of(4, &[(1, "a"), (1, "b"), (1, "a")]);
        assert_eq!(list.count_key(&1), 3);
        assert_eq!(list.count(&Entry { priority: 1, name: "a" }, |a, b| a.name == b.name), 2);
    }

    #[test]
    fn irange_by_value_projects_through_key() {
        let list = list_of(4, &[(5, "e"), (1, "a"), (3, "c"), (2, "b"), (4, "d")]);
        let keys: Vec<i32> = list
            .irange(Some(&Entry { priority: 2, name: "" }), Some(&Entry { priority: 4, name: "" }), (true, true), false)
            .map(|e| e.priority)
            .collect();
        assert_eq!(keys, vec![2, 3, 4]);
    }

    #[test]
    fn replace_range_scenario() {
        let mut list = list_of(4, &[(1, "a"), (2, "b"), (3, "c"), (4, "d"), (5, "e")]);
        list.replace_range(1..3, vec![Entry { priority: 2, name: "x" }]).unwrap();
        let keys: Vec<i32> = list.iter().map(|e| e.priority).collect();
        assert_eq!(keys, vec![1, 2, 4, 5]);
        list.check().unwrap();

        let err = list.replace_range(0..1, vec![Entry { priority: 9, name: "y" }]);
        assert!(err.is_err());
    }

    #[test]
    fn replace_stride_rollback_scenario() {
        let mut list = list_of(4, &[(1, "a"), (3, "b"), (5, "c"), (7, "d"), (9, "e")]);
        let before: Vec<i32> = list.iter().map(|e| e.priority).collect();
        let err = list.replace_stride(
            &[0, 2, 4],
            vec![
                Entry { priority: 2, name: "a2" },
                Entry { priority: 10, name: "c2" },
                Entry { priority: 8, name: "e2" },
            ],
        );
        assert!(err.is_err());
        let after: Vec<i32> = list.iter().map(|e| e.priority).collect();
        assert_eq!(before, after);
        list.check().unwrap();
    }

    #[test]
    fn delete_indices_scenario() {
        let mut list = list_of(4, &[(1, "a"), (2, "b"), (3, "c"), (4, "d"), (5, "e")]);
        list.delete_indices([0, 2, 4]).unwrap();
        let keys: Vec<i32> = list.iter().map(|e| e.priority).collect();
        assert_eq!(keys, vec![2, 4]);
        list.check().unwrap();
    }

    #[test]
    fn concat_and_add_scenario() {
        let a = list_of(4, &[(1, "a"), (3, "c")]);
        let b = list_of(4, &[(2, "b"), (4, "d")]);
        let combined = a.concat(b.iter().cloned());
        let keys: Vec<i32> = combined.iter().map(|e| e.priority).collect();
        assert_eq!(keys, vec![1, 2, 3, 4]);
        combined.check().unwrap();

        let added = a + b;
        let keys: Vec<i32> = added.iter().map(|e| e.priority).collect();
        assert_eq!(keys, vec![1, 2, 3, 4]);
    }

    #[test]
    fn comparisons_are_lexicographic_by_key() {
        let a = list_of(4, &[(1, "a"), (2, "b")]);
        let b = list_of(4, &[(1, "a"), (2, "b"), (3, "c")]);
        assert!(a < b);
        assert_ne!(a, b);
        let c = list_of(4, &[(1, "a"), (2, "b")]);
        assert_eq!(a, c);
    }
}
