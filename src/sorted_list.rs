//! Plain sorted multiset, ordered by natural comparison of stored values.
//!
//! Values live in fixed-size chunks (`Vec<Vec<V>>`) summarized by a
//! `maxes` array for binary-search routing, with a lazily-rebuilt index
//! tree layered on top for O(log n) positional lookups. Fallible
//! operations return `Result` rather than panicking.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::fmt;

use log::{debug, trace};

use crate::bisect;
use crate::error::{err_at, Error, Result};
use crate::index_tree::IndexTree;
use crate::range_iter::{ChunkSpan, RangeIter};

const DEFAULT_LOAD: usize = 1000;

/// A sorted multiset backed by a list of sorted sub-lists ("chunks") with a
/// `maxes` routing summary and a lazily-built implicit index tree.
///
/// See the crate-level documentation for the design; this type is the
/// "identity projection" instantiation — see [`crate::SortedListByKey`] for
/// the keyed variant.
pub struct SortedList<V: Ord + Clone> {
    load: usize,
    lists: Vec<Vec<V>>,
    maxes: Vec<V>,
    index: RefCell<IndexTree>,
    len: usize,
}

impl<V: Ord + Clone> Default for SortedList<V> {
    fn default() -> Self {
        SortedList::new()
    }
}

impl<V: Ord + Clone> Clone for SortedList<V> {
    fn clone(&self) -> Self {
        SortedList {
            load: self.load,
            lists: self.lists.clone(),
            maxes: self.maxes.clone(),
            index: RefCell::new(self.index.borrow().clone()),
            len: self.len,
        }
    }
}

impl<V: Ord + Clone + fmt::Debug> fmt::Debug for SortedList<V> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SortedList")
            .field("load", &self.load)
            .field("values", &self.iter().collect::<Vec<_>>())
            .finish()
    }
}

// Construction.
impl<V: Ord + Clone> SortedList<V> {
    /// Build an empty container with the default load factor (1000).
    pub fn new() -> SortedList<V> {
        SortedList::with_load(DEFAULT_LOAD).expect("default load is valid")
    }

    /// Build an empty container with a given load factor. `load` must be
    /// at least 4; an odd `load` is rounded up to the next even value
    /// rather than rejected (see `SPEC_FULL.md`'s REDESIGN FLAGS).
    pub fn with_load(load: usize) -> Result<SortedList<V>> {
        if load < 4 {
            return Err(err_at!(InvalidArgument, "load must be >= 4, got {}", load));
        }
        let load = if load % 2 == 1 { load + 1 } else { load };
        Ok(SortedList {
            load,
            lists: Vec::new(),
            maxes: Vec::new(),
            index: RefCell::new(IndexTree::new()),
            len: 0,
        })
    }

    /// Build a container from an unordered iterable, equivalent to
    /// `SortedList::new()` followed by `update(iterable)`.
    pub fn from_values<I: IntoIterator<Item = V>>(iterable: I) -> SortedList<V> {
        let mut list = SortedList::new();
        list.update(iterable);
        list
    }

    /// Return the configured load factor.
    pub fn load(&self) -> usize {
        self.load
    }
}

// Internal positional helpers.
impl<V: Ord + Clone> SortedList<V> {
    fn ensure_index_built(&self) {
        if self.index.borrow().is_stale() {
            let lengths: Vec<usize> = self.lists.iter().map(Vec::len).collect();
            self.index.borrow_mut().build(&lengths);
        }
    }

    /// Convert a resolved, in-range index into `(chunk, offset)`. Fast
    /// paths avoid building the index tree for the first/last chunk.
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

    fn expand(&mut self, pos: usize) {
        let twice = self.load * 2;
        if self.lists[pos].len() > twice {
            debug!("splitting chunk {} (len {}, load {})", pos, self.lists[pos].len(), self.load);
            let tail = self.lists[pos].split_off(self.load);
            self.maxes[pos] = self.lists[pos].last().unwrap().clone();
            self.maxes.insert(pos + 1, tail.last().unwrap().clone());
            self.lists.insert(pos + 1, tail);
            self.index.get_mut().invalidate();
        } else if !self.index.get_mut().is_stale() {
            trace!("bumping index tree path at chunk {}", pos);
            self.index.get_mut().bump_path(pos, 1);
        }
    }

    /// Remove and return the element at `(pos, idx)`, merging or dropping
    /// chunks as needed to keep the load invariant (§4.4).
    fn delete_at(&mut self, pos: usize, idx: usize) -> V {
        let val = self.lists[pos].remove(idx);
        self.len -= 1;
        let half = self.load / 2;
        let new_len = self.lists[pos].len();

        if new_len > half {
            self.maxes[pos] = self.lists[pos].last().unwrap().clone();
            self.index.get_mut().bump_path(pos, -1);
        } else if self.lists.len() > 1 {
            let target = if pos == 0 { 0 } else { pos - 1 };
            let source = target + 1;
            debug!("merging chunk {} into chunk {} (shrunk below load/2)", source, target);
            let tail = self.lists.remove(source);
            self.lists[target].extend(tail);
            self.maxes[target] = self.lists[target].last().unwrap().clone();
            self.maxes.remove(source);
            self.index.get_mut().invalidate();
            self.expand(target);
        } else if new_len > 0 {
            self.maxes[pos] = self.lists[pos].last().unwrap().clone();
        } else {
            self.lists.remove(pos);
            self.maxes.remove(pos);
            self.index.get_mut().invalidate();
        }

        val
    }

    fn check_order_at(&self, idx: usize, val: &V) -> Result<()> {
        let (pos, loc) = self.pos_of(idx);

        if idx > 0 {
            let (pos_prev, idx_prev) = if loc == 0 {
                (pos - 1, self.lists[pos - 1].len() - 1)
            } else {
                (pos, loc - 1)
            };
            if &self.lists[pos_prev][idx_prev] > val {
                return Err(Error::order_violation(
                    idx,
                    "value is less than its predecessor".into(),
                ));
            }
        }

        if idx + 1 < self.len {
            let (pos_next, idx_next) = if loc + 1 == self.lists[pos].len() {
                (pos + 1, 0)
            } else {
                (pos, loc + 1)
            };
            if &self.lists[pos_next][idx_next] < val {
                return Err(Error::order_violation(
                    idx,
                    "value is greater than its successor".into(),
                ));
            }
        }

        Ok(())
    }
}

// Mutating operations.
impl<V: Ord + Clone> SortedList<V> {
    /// Insert `val`, keeping the container sorted. `O(log n)` amortized.
    pub fn add(&mut self, val: V) {
        if self.lists.is_empty() {
            self.maxes.push(val.clone());
            self.lists.push(vec![val]);
            self.len = 1;
            return;
        }

        let pos = bisect::bisect_right(&self.maxes, &val);
        let pos = if pos == self.maxes.len() {
            let pos = pos - 1;
            self.maxes[pos] = val.clone();
            self.lists[pos].push(val);
            pos
        } else {
            let idx = bisect::bisect_right(&self.lists[pos], &val);
            self.lists[pos].insert(idx, val);
            pos
        };

        self.len += 1;
        self.expand(pos);
    }

    /// Bulk-load `iterable`, which need not be sorted (§4.5).
    pub fn update<I: IntoIterator<Item = V>>(&mut self, iterable: I) {
        let mut values: Vec<V> = iterable.into_iter().collect();
        if values.is_empty() {
            return;
        }
        values.sort();

        if !self.maxes.is_empty() {
            if values.len() * 4 >= self.len {
                for chunk in self.lists.drain(..) {
                    values.extend(chunk);
                }
                values.sort();
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
            self.maxes.push(chunk.last().unwrap().clone());
            self.lists.push(chunk.to_vec());
        }
        self.len = self.lists.iter().map(Vec::len).sum();
        self.index.get_mut().invalidate();
    }

    /// Append `values` which must already be non-decreasing and must not
    /// violate order with the existing tail (§4.5).
    pub fn extend<I: IntoIterator<Item = V>>(&mut self, values: I) -> Result<()> {
        let values: Vec<V> = values.into_iter().collect();
        if values.is_empty() {
            return Ok(());
        }
        for (i, w) in values.windows(2).enumerate() {
            if w[0] > w[1] {
                return Err(Error::order_violation(self.len + i + 1, "given sequence not in sort order".to_string()));
            }
        }

        let mut offset = 0usize;
        if !self.maxes.is_empty() {
            if values[0] < *self.lists.last().unwrap().last().unwrap() {
                return Err(Error::order_violation(
                    self.len,
                    "value not in sort order at join with existing tail".into(),
                ));
            }
            let half = self.load / 2;
            if self.lists.last().unwrap().len() < half {
                let take = self.load.min(values.len());
                let last = self.lists.last_mut().unwrap();
                last.extend(values[..take].iter().cloned());
                *self.maxes.last_mut().unwrap() = last.last().unwrap().clone();
                offset = take;
            }
        }

        let len_lists_before = self.lists.len();
        let mut idx = offset;
        while idx < values.len() {
            let end = (idx + self.load).min(values.len());
            let chunk = values[idx..end].to_vec();
            self.maxes.push(chunk.last().unwrap().clone());
            self.lists.push(chunk);
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

    /// Append a single value to the tail; fails if it would break order.
    pub fn append(&mut self, val: V) -> Result<()> {
        if self.maxes.is_empty() {
            self.maxes.push(val.clone());
            self.lists.push(vec![val]);
            self.len = 1;
            return Ok(());
        }
        let pos = self.lists.len() - 1;
        if val < *self.lists[pos].last().unwrap() {
            return Err(Error::order_violation(
                self.len,
                "value not in sort order at tail".into(),
            ));
        }
        self.maxes[pos] = val.clone();
        self.lists[pos].push(val);
        self.len += 1;
        self.expand(pos);
        Ok(())
    }

    /// Insert `val` at position `idx`. Out-of-range indices clamp to the
    /// nearest valid bound (matching the original's `list.insert` idiom);
    /// an order violation at that position is rejected.
    pub fn insert(&mut self, idx: isize, val: V) -> Result<()> {
        let n = self.len as isize;
        let idx = if idx < 0 { (idx + n).max(0) } else { idx };
        let idx = idx.min(n) as usize;

        if self.maxes.is_empty() {
            self.maxes.push(val.clone());
            self.lists.push(vec![val]);
            self.len = 1;
            return Ok(());
        }

        if idx == 0 {
            if val > self.lists[0][0] {
                return Err(Error::order_violation(0, "value exceeds current head".into()));
            }
            self.lists[0].insert(0, val);
            self.expand(0);
            self.len += 1;
            return Ok(());
        }

        if idx == self.len {
            let pos = self.lists.len() - 1;
            if *self.lists[pos].last().unwrap() > val {
                return Err(Error::order_violation(self.len, "value precedes current tail".into()));
            }
            self.maxes[pos] = val.clone();
            self.lists[pos].push(val);
            self.len += 1;
            self.expand(pos);
            return Ok(());
        }

        let (pos, off) = self.pos_of(idx);
        let (pos_before, idx_before) = if off == 0 {
            (pos - 1, self.lists[pos - 1].len() - 1)
        } else {
            (pos, off - 1)
        };

        let before = &self.lists[pos_before][idx_before];
        let after = &self.lists[pos][off];
        if before <= &val && &val <= after {
            self.lists[pos].insert(off, val);
            self.expand(pos);
            self.len += 1;
            Ok(())
        } else {
            Err(Error::order_violation(idx, "value out of order at insertion point".into()))
        }
    }

    /// Remove the first occurrence of `val`; fails with `NotFound` if absent.
    pub fn remove(&mut self, val: &V) -> Result<()> {
        if self.discard(val) {
            Ok(())
        } else {
            Err(err_at!(NotFound, "value not in list"))
        }
    }

    /// Remove the first occurrence of `val`; returns `true` if removed.
    pub fn discard(&mut self, val: &V) -> bool {
        if self.maxes.is_empty() {
            return false;
        }
        let pos = bisect::bisect_left(&self.maxes, val);
        if pos == self.maxes.len() {
            return false;
        }
        let idx = bisect::bisect_left(&self.lists[pos], val);
        if &self.lists[pos][idx] == val {
            self.delete_at(pos, idx);
            true
        } else {
            false
        }
    }

    /// Remove and return the element at `idx` (negative indices count from
    /// the end).
    pub fn pop(&mut self, idx: isize) -> Result<V> {
        let ridx = self.resolve_index(idx)?;
        let (pos, off) = self.pos_of(ridx);
        Ok(self.delete_at(pos, off))
    }

    /// Remove and return the last element.
    pub fn pop_back(&mut self) -> Result<V> {
        self.pop(-1)
    }

    /// Remove all elements.
    pub fn clear(&mut self) {
        self.lists.clear();
        self.maxes.clear();
        self.index.get_mut().invalidate();
        self.len = 0;
    }

    /// Delete the contiguous range `[range.start, range.end)`. Large
    /// deletions (≥ ⅛ of the container) fall back to a copy-complement
    /// rebuild for amortised linear cost; smaller ones delete element by
    /// element, from the greatest index down.
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

    /// Replace the element at `idx`, rejecting the write if it would
    /// violate order relative to its neighbours.
    pub fn replace_at(&mut self, idx: isize, value: V) -> Result<()> {
        let ridx = self.resolve_index(idx)?;
        self.check_order_at(ridx, &value)?;
        let (pos, off) = self.pos_of(ridx);
        self.lists[pos][off] = value.clone();
        if off + 1 == self.lists[pos].len() {
            self.maxes[pos] = value;
        }
        Ok(())
    }

    /// Replace the contiguous range `[range.start, range.end)` with
    /// `values`. Validates that `values` is itself non-decreasing and
    /// joins correctly at both seams before mutating.
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

        for (i, w) in values.windows(2).enumerate() {
            if w[0] > w[1] {
                return Err(Error::order_violation(start + i + 1, "given sequence not in sort order".to_string()));
            }
        }
        if start > 0 {
            if let Some(first) = values.first() {
                if self.get(start as isize - 1)? > first {
                    return Err(Error::order_violation(start, "replacement precedes its predecessor".into()));
                }
            }
        }
        if stop != self.len {
            if let Some(last) = values.last() {
                if self.get(stop as isize)? < last {
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
    /// resulting position would violate sort order.
    pub fn replace_stride(&mut self, indices: &[usize], values: Vec<V>) -> Result<()> {
        if indices.len() != values.len() {
            return Err(err_at!(
                InvalidArgument,
                "attempt to assign sequence of size {} to extended slice of size {}",
                values.len(),
                indices.len()
            ));
        }

        let mut log: Vec<(usize, V, V)> = Vec::with_capacity(indices.len());
        for (&idx, val) in indices.iter().zip(values.into_iter()) {
            let (pos, off) = self.pos_of(idx);
            let old = self.lists[pos][off].clone();
            self.lists[pos][off] = val.clone();
            if off + 1 == self.lists[pos].len() {
                self.maxes[pos] = val.clone();
            }
            log.push((idx, old, val));
        }

        for (idx, _, newval) in &log {
            if let Err(e) = self.check_order_at(*idx, newval) {
                for (idx2, oldval2, _) in log {
                    let (pos, off) = self.pos_of(idx2);
                    self.lists[pos][off] = oldval2.clone();
                    if off + 1 == self.lists[pos].len() {
                        self.maxes[pos] = oldval2;
                    }
                }
                return Err(e);
            }
        }
        Ok(())
    }
}

// Query operations.
impl<V: Ord + Clone> SortedList<V> {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn contains(&self, val: &V) -> bool {
        if self.maxes.is_empty() {
            return false;
        }
        let pos = bisect::bisect_left(&self.maxes, val);
        if pos == self.maxes.len() {
            return false;
        }
        let idx = bisect::bisect_left(&self.lists[pos], val);
        &self.lists[pos][idx] == val
    }

    pub fn count(&self, val: &V) -> usize {
        if self.maxes.is_empty() {
            return 0;
        }
        let pos_left = bisect::bisect_left(&self.maxes, val);
        if pos_left == self.maxes.len() {
            return 0;
        }
        let idx_left = bisect::bisect_left(&self.lists[pos_left], val);
        let pos_right = bisect::bisect_right(&self.maxes, val);
        if pos_right == self.maxes.len() {
            return self.len - self.loc_of(pos_left, idx_left);
        }
        let idx_right = bisect::bisect_right(&self.lists[pos_right], val);
        if pos_left == pos_right {
            idx_right - idx_left
        } else {
            self.loc_of(pos_right, idx_right) - self.loc_of(pos_left, idx_left)
        }
    }

    /// Leftmost index `k` with `start <= k < stop` and `self[k] == val`.
    pub fn index_of(&self, val: &V, start: Option<isize>, stop: Option<isize>) -> Result<usize> {
        if self.maxes.is_empty() {
            return Err(err_at!(NotFound, "value not in list"));
        }
        let n = self.len as isize;
        let start = start.map(|s| if s < 0 { s + n } else { s }).unwrap_or(0).max(0);
        let stop = stop.map(|s| if s < 0 { s + n } else { s }).unwrap_or(n).min(n);
        if stop <= start {
            return Err(err_at!(NotFound, "value not in list"));
        }
        let stop = stop - 1;

        let pos_left = bisect::bisect_left(&self.maxes, val);
        if pos_left == self.maxes.len() {
            return Err(err_at!(NotFound, "value not in list"));
        }
        let idx_left = bisect::bisect_left(&self.lists[pos_left], val);
        if &self.lists[pos_left][idx_left] != val {
            return Err(err_at!(NotFound, "value not in list"));
        }
        let left = self.loc_of(pos_left, idx_left) as isize;

        if start <= left {
            if left <= stop {
                return Ok(left as usize);
            }
        } else {
            let right = self.bisect_right(val) as isize - 1;
            if start <= right {
                return Ok(start as usize);
            }
        }
        Err(err_at!(NotFound, "value not in list"))
    }

    pub fn bisect_left(&self, val: &V) -> usize {
        if self.maxes.is_empty() {
            return 0;
        }
        let pos = bisect::bisect_left(&self.maxes, val);
        if pos == self.maxes.len() {
            return self.len;
        }
        let idx = bisect::bisect_left(&self.lists[pos], val);
        self.loc_of(pos, idx)
    }

    pub fn bisect_right(&self, val: &V) -> usize {
        if self.maxes.is_empty() {
            return 0;
        }
        let pos = bisect::bisect_right(&self.maxes, val);
        if pos == self.maxes.len() {
            return self.len;
        }
        let idx = bisect::bisect_right(&self.lists[pos], val);
        self.loc_of(pos, idx)
    }

    pub fn bisect(&self, val: &V) -> usize {
        self.bisect_right(val)
    }

    /// Checked positional access (negative indices count from the end).
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

    /// Positional range `[start, stop)`, each end defaulting to the
    /// container's bounds; `reverse` yields descending order.
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

    /// Value range `[min, max]` (or half-open per `inclusive`); `reverse`
    /// yields descending order.
    pub fn irange(
        &self,
        min: Option<&V>,
        max: Option<&V>,
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
            Some(v) if inclusive.0 => {
                let p = bisect::bisect_left(&self.maxes, v);
                if p == self.maxes.len() {
                    None
                } else {
                    Some((p, bisect::bisect_left(&self.lists[p], v)))
                }
            }
            Some(v) => {
                let p = bisect::bisect_right(&self.maxes, v);
                if p == self.maxes.len() {
                    None
                } else {
                    Some((p, bisect::bisect_right(&self.lists[p], v)))
                }
            }
        };
        let (min_pos, min_idx) = match min_pos_idx {
            Some(pair) => pair,
            None => return RangeIter::new(ChunkSpan::empty(&self.lists), false),
        };

        let (max_pos, max_idx) = match max {
            None => end_bound,
            Some(v) if inclusive.1 => {
                let p = bisect::bisect_right(&self.maxes, v);
                if p == self.maxes.len() {
                    end_bound
                } else {
                    (p, bisect::bisect_right(&self.lists[p], v))
                }
            }
            Some(v) => {
                let p = bisect::bisect_left(&self.maxes, v);
                if p == self.maxes.len() {
                    end_bound
                } else {
                    (p, bisect::bisect_left(&self.lists[p], v))
                }
            }
        };

        if min_pos > max_pos || (min_pos == max_pos && min_idx >= max_idx) {
            return RangeIter::new(ChunkSpan::empty(&self.lists), false);
        }

        let remaining = self.loc_of(max_pos, max_idx) - self.loc_of(min_pos, min_idx);
        RangeIter::new(ChunkSpan::new(&self.lists, (min_pos, min_idx), (max_pos, max_idx), remaining), reverse)
    }

    /// Build a new container from `self` concatenated with `other`
    /// (`other` need not be sorted; it is bulk-loaded).
    pub fn concat<I: IntoIterator<Item = V>>(&self, other: I) -> SortedList<V> {
        let mut out = SortedList::with_load(self.load).expect("load already validated");
        out.update(self.iter().cloned());
        out.update(other);
        out
    }

    /// Validate every structural invariant from §3; O(n). Intended for
    /// tests and debug builds.
    #[cfg(any(test, feature = "check"))]
    pub fn check(&self) -> Result<()> {
        if self.load < 4 || self.load % 2 != 0 {
            return Err(err_at!(InvalidArgument, "load {} violates >=4 and even", self.load));
        }
        if self.maxes.is_empty() {
            if !self.lists.is_empty() {
                return Err(err_at!(InvalidArgument, "lists non-empty with no maxes"));
            }
            return Ok(());
        }
        if self.maxes.len() != self.lists.len() {
            return Err(err_at!(InvalidArgument, "maxes/lists length mismatch"));
        }
        for sub in &self.lists {
            for w in sub.windows(2) {
                if w[0] > w[1] {
                    return Err(err_at!(InvalidArgument, "chunk not sorted"));
                }
            }
        }
        for w in self.lists.windows(2) {
            if w[0].last().unwrap() > w[1].first().unwrap() {
                return Err(err_at!(InvalidArgument, "chunk boundary out of order"));
            }
        }
        for (i, sub) in self.lists.iter().enumerate() {
            if &self.maxes[i] != sub.last().unwrap() {
                return Err(err_at!(InvalidArgument, "maxes[{}] mismatched", i));
            }
        }
        let twice = self.load * 2;
        let half = self.load / 2;
        for sub in &self.lists {
            if sub.len() > twice {
                return Err(err_at!(InvalidArgument, "chunk exceeds 2L"));
            }
        }
        for sub in &self.lists[..self.lists.len() - 1] {
            if sub.len() < half {
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

impl<V: Ord + Clone> std::ops::Index<usize> for SortedList<V> {
    type Output = V;
    fn index(&self, idx: usize) -> &V {
        self.get(idx as isize).expect("index out of bounds")
    }
}

impl<V: Ord + Clone> std::iter::FromIterator<V> for SortedList<V> {
    fn from_iter<I: IntoIterator<Item = V>>(iter: I) -> Self {
        SortedList::from_values(iter)
    }
}

impl<'a, V: Ord + Clone> IntoIterator for &'a SortedList<V> {
    type Item = &'a V;
    type IntoIter = RangeIter<'a, V>;
    fn into_iter(self) -> RangeIter<'a, V> {
        self.iter()
    }
}

impl<V: Ord + Clone> PartialEq for SortedList<V> {
    fn eq(&self, other: &Self) -> bool {
        self.len == other.len && self.iter().eq(other.iter())
    }
}

impl<V: Ord + Clone> Eq for SortedList<V> {}

impl<V: Ord + Clone> PartialOrd for SortedList<V> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<V: Ord + Clone> Ord for SortedList<V> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.iter().cmp(other.iter())
    }
}

impl<V: Ord + Clone> std::ops::Add for SortedList<V> {
    type Output = SortedList<V>;
    fn add(self, rhs: SortedList<V>) -> SortedList<V> {
        let mut out = SortedList::with_load(self.load).expect("load already validated");
        out.update(self.lists.into_iter().flatten());
        out.update(rhs.lists.into_iter().flatten());
        out
    }
}

impl<V: Ord + Clone> std::ops::AddAssign for SortedList<V> {
    fn add_assign(&mut self, rhs: SortedList<V>) {
        self.update(rhs.lists.into_iter().flatten());
    }
}

impl<V: Ord + Clone> std::ops::Mul<usize> for SortedList<V> {
    type Output = SortedList<V>;
    fn mul(self, rhs: usize) -> SortedList<V> {
        let values: Vec<V> = self.lists.into_iter().flatten().collect();
        let repeated: Vec<V> = values.iter().cloned().cycle().take(values.len() * rhs).collect();
        let mut out = SortedList::with_load(self.load).expect("load already validated");
        out.update(repeated);
        out
    }
}

impl<V: Ord + Clone> std::ops::MulAssign<usize> for SortedList<V> {
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

    fn list_of(load: usize, values: &[i32]) -> SortedList<i32> {
        let mut list = SortedList::with_load(load).unwrap();
        list.update(values.iter().copied());
        list
    }

    #[test]
    fn rank_select_scenario() {
        let list = list_of(4, &[5, 1, 3, 1, 4, 1, 5, 9, 2, 6]);
        let got: Vec<i32> = list.iter().copied().collect();
        assert_eq!(got, vec![1, 1, 1, 2, 3, 4, 5, 5, 6, 9]);
        assert_eq!(list.bisect_left(&5), 6);
        assert_eq!(list.bisect_right(&5), 8);
        assert_eq!(list.count(&1), 3);
        assert_eq!(list.index_of(&1, None, None).unwrap(), 0);
        assert_eq!(*list.get(3).unwrap(), 2);
        assert_eq!(*list.get(-1).unwrap(), 9);
        list.check().unwrap();
    }

    #[test]
    fn range_iteration_scenario() {
        let list = list_of(4, &[5, 1, 3, 1, 4, 1, 5, 9, 2, 6]);
        let got: Vec<i32> = list.irange(Some(&2), Some(&6), (true, true), false).copied().collect();
        assert_eq!(got, vec![2, 3, 4, 5, 5, 6]);

        let got: Vec<i32> = list.irange(Some(&2), Some(&6), (false, false), false).copied().collect();
        assert_eq!(got, vec![3, 4, 5, 5]);

        let got: Vec<i32> = list.irange(Some(&2), Some(&6), (true, true), true).copied().collect();
        assert_eq!(got, vec![6, 5, 5, 4, 3, 2]);
    }

    #[test]
    fn delete_range_scenario() {
        let mut list = list_of(10, &(0..100).collect::<Vec<_>>());
        list.delete_range(20..80).unwrap();
        let got: Vec<i32> = list.iter().copied().collect();
        let expected: Vec<i32> = (0..20).chain(80..100).collect();
        assert_eq!(got, expected);
        assert_eq!(list.len(), 40);
        list.check().unwrap();
    }

    #[test]
    fn insert_order_rejection() {
        let mut list = list_of(4, &[1, 3, 5]);
        assert!(matches!(list.insert(1, 4), Err(Error::OrderViolation { .. })));
        list.insert(1, 2).unwrap();
        assert_eq!(list.iter().copied().collect::<Vec<_>>(), vec![1, 2, 3, 5]);
        list.check().unwrap();
    }

    #[test]
    fn extended_stride_rollback() {
        let mut list = list_of(4, &[1, 3, 5, 7, 9]);
        let before: Vec<i32> = list.iter().copied().collect();
        let err = list.replace_stride(&[0, 2, 4], vec![2, 10, 8]);
        assert!(err.is_err());
        let after: Vec<i32> = list.iter().copied().collect();
        assert_eq!(before, after);
        list.check().unwrap();
    }

    #[test]
    fn split_and_merge_thresholds() {
        let mut list: SortedList<i32> = SortedList::with_load(4).unwrap();
        for _ in 0..9 {
            list.add(7);
        }
        list.check().unwrap();
        assert_eq!(list.len(), 9);

        while list.len() > 1 {
            list.remove(&7).unwrap();
            list.check().unwrap();
        }
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn empty_container_boundaries() {
        let list: SortedList<i32> = SortedList::new();
        assert!(!list.contains(&1));
        assert_eq!(list.bisect_left(&1), 0);
        assert_eq!(list.bisect_right(&1), 0);
        assert_eq!(list.iter().count(), 0);
    }

    #[test]
    fn pop_and_remove_roundtrip() {
        let mut list = list_of(4, &[3, 1, 2]);
        list.add(9);
        list.remove(&9).unwrap();
        assert_eq!(list.iter().copied().collect::<Vec<_>>(), vec![1, 2, 3]);

        let popped = list.pop_back().unwrap();
        assert_eq!(popped, 3);
        assert_eq!(list.iter().copied().collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn clone_is_independent() {
        let mut a = list_of(4, &[1, 2, 3]);
        let b = a.clone();
        a.add(4);
        assert_ne!(a, b);
        assert_eq!(b.iter().copied().collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[test]
    fn load_independent_of_results() {
        let values = [5, 1, 3, 1, 4, 1, 5, 9, 2, 6];
        let reference = list_of(1000, &values);
        for load in [4, 8, 100, 10000] {
            let list = list_of(load, &values);
            assert_eq!(list.iter().collect::<Vec<_>>(), reference.iter().collect::<Vec<_>>());
        }
    }

    #[test]
    fn comparisons_are_lexicographic() {
        let a = list_of(4, &[1, 2, 3]);
        let b = list_of(4, &[1, 2, 3, 4]);
        assert!(a < b);
        assert_ne!(a, b);
        let c = list_of(4, &[1, 2, 3]);
        assert_eq!(a, c);
    }

    #[test]
    fn load_below_minimum_rejected() {
        assert!(SortedList::<i32>::with_load(3).is_err());
    }

    #[test]
    fn odd_load_rounds_up() {
        let list: SortedList<i32> = SortedList::with_load(5).unwrap();
        assert_eq!(list.load(), 6);
    }
}
