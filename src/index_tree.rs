//! Lazily-built implicit segment tree mapping positional index to
//! `(chunk, offset)` and back, over the current lengths of a list of
//! chunks.
//!
//! Tree state is kept as a flat `Vec` indexed arithmetically rather than
//! as boxed nodes, the same way a complete binary tree maps onto an
//! array when every level is fully populated.

/// Dense-array segment tree over chunk lengths. Empty ⇔ stale; any
/// operation that needs positional lookups rebuilds it on demand.
use log::trace;

#[derive(Clone, Debug, Default)]
pub(crate) struct IndexTree {
    nodes: Vec<usize>,
    offset: usize,
}

impl IndexTree {
    pub(crate) fn new() -> IndexTree {
        IndexTree {
            nodes: Vec::new(),
            offset: 0,
        }
    }

    pub(crate) fn is_stale(&self) -> bool {
        self.nodes.is_empty()
    }

    pub(crate) fn invalidate(&mut self) {
        self.nodes.clear();
        self.offset = 0;
    }

    #[cfg(any(test, feature = "check"))]
    pub(crate) fn nodes(&self) -> &[usize] {
        &self.nodes
    }

    #[cfg(any(test, feature = "check"))]
    pub(crate) fn offset(&self) -> usize {
        self.offset
    }

    /// Rebuild from scratch given the current chunk lengths.
    pub(crate) fn build(&mut self, lengths: &[usize]) {
        trace!("rebuilding index tree over {} chunks", lengths.len());
        self.nodes.clear();

        if lengths.len() == 1 {
            self.nodes.extend_from_slice(lengths);
            self.offset = 0;
            return;
        }

        let mut row1 = fold_pairs(lengths);
        if lengths.len() % 2 == 1 {
            row1.push(lengths[lengths.len() - 1]);
        }

        if row1.len() == 1 {
            self.nodes.extend_from_slice(&row1);
            self.nodes.extend_from_slice(lengths);
            self.offset = 1;
            return;
        }

        let size = row1.len().next_power_of_two();
        row1.resize(size, 0);

        let mut rows: Vec<Vec<usize>> = vec![lengths.to_vec(), row1];
        while rows.last().unwrap().len() > 1 {
            let next = fold_pairs(rows.last().unwrap());
            rows.push(next);
        }

        for row in rows.iter().rev() {
            self.nodes.extend_from_slice(row);
        }
        self.offset = size * 2 - 1;
    }

    /// Convert a positional index (already resolved to `[0, n)`) into its
    /// `(chunk, offset-in-chunk)` pair. Assumes the tree is built.
    pub(crate) fn pos(&self, mut idx: usize) -> (usize, usize) {
        let mut p = 0usize;
        let mut child = 1usize;
        let len_index = self.nodes.len();

        while child < len_index {
            let index_child = self.nodes[child];
            if idx < index_child {
                p = child;
            } else {
                idx -= index_child;
                p = child + 1;
            }
            child = (p << 1) + 1;
        }

        (p - self.offset, idx)
    }

    /// Convert a `(chunk, offset-in-chunk)` pair back into a positional
    /// index. Assumes the tree is built.
    pub(crate) fn loc(&self, chunk: usize, offset_in_chunk: usize) -> usize {
        if chunk == 0 {
            return offset_in_chunk;
        }

        let mut total = 0usize;
        let mut p = chunk + self.offset;

        while p > 0 {
            if p % 2 == 0 {
                total += self.nodes[p - 1];
            }
            p = (p - 1) >> 1;
        }

        total + offset_in_chunk
    }

    /// Add `delta` to every ancestor on the path from leaf `chunk` to the
    /// root, in place. No-op if the tree is stale.
    pub(crate) fn bump_path(&mut self, chunk: usize, delta: isize) {
        if self.is_stale() {
            return;
        }

        let mut child = self.offset + chunk;
        loop {
            self.nodes[child] = apply_delta(self.nodes[child], delta);
            if child == 0 {
                break;
            }
            child = (child - 1) >> 1;
        }
    }
}

fn apply_delta(value: usize, delta: isize) -> usize {
    if delta >= 0 {
        value + delta as usize
    } else {
        value - (-delta) as usize
    }
}

/// Sum non-overlapping consecutive pairs, `(row[0]+row[1], row[2]+row[3], ...)`,
/// dropping a trailing unpaired element (the caller re-attaches it).
fn fold_pairs(row: &[usize]) -> Vec<usize> {
    let mut out = Vec::with_capacity(row.len() / 2 + 1);
    let mut it = row.chunks_exact(2);
    for pair in &mut it {
        out.push(pair[0] + pair[1]);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_chunk() {
        let mut t = IndexTree::new();
        t.build(&[7]);
        assert_eq!(t.nodes(), &[7]);
        assert_eq!(t.offset(), 0);
        assert_eq!(t.pos(3), (0, 3));
        assert_eq!(t.loc(0, 3), 3);
    }

    #[test]
    fn docstring_example() {
        // chunk lengths 3 2 4 5 -> index 14 5 9 3 2 4 5, offset 3
        let mut t = IndexTree::new();
        t.build(&[3, 2, 4, 5]);
        assert_eq!(t.nodes(), &[14, 5, 9, 3, 2, 4, 5]);
        assert_eq!(t.offset(), 3);

        // index 8 -> (pos 2, idx 3) per the docstring walk-through
        assert_eq!(t.pos(8), (2, 3));
        assert_eq!(t.loc(2, 3), 8);

        for idx in 0..14 {
            let (chunk, off) = t.pos(idx);
            assert_eq!(t.loc(chunk, off), idx, "round trip failed for idx {}", idx);
        }
    }

    #[test]
    fn two_chunks() {
        let mut t = IndexTree::new();
        t.build(&[4, 5]);
        assert_eq!(t.nodes(), &[9, 4, 5]);
        assert_eq!(t.offset(), 1);
        for idx in 0..9 {
            let (chunk, off) = t.pos(idx);
            assert_eq!(t.loc(chunk, off), idx);
        }
    }

    #[test]
    fn three_chunks_odd_carry() {
        let mut t = IndexTree::new();
        t.build(&[2, 3, 4]);
        assert_eq!(t.offset(), 3);
        for idx in 0..9 {
            let (chunk, off) = t.pos(idx);
            assert_eq!(t.loc(chunk, off), idx);
        }
    }

    #[test]
    fn bump_path_matches_rebuild() {
        let mut t = IndexTree::new();
        let mut lengths = vec![3, 2, 4, 5];
        t.build(&lengths);

        lengths[2] += 1;
        t.bump_path(2, 1);

        let mut rebuilt = IndexTree::new();
        rebuilt.build(&lengths);
        assert_eq!(t.nodes(), rebuilt.nodes());
    }

    #[test]
    fn many_chunk_counts_round_trip() {
        for n_chunks in 1..=37 {
            let lengths: Vec<usize> = (0..n_chunks).map(|i| (i % 5) + 1).collect();
            let total: usize = lengths.iter().sum();
            let mut t = IndexTree::new();
            t.build(&lengths);
            assert_eq!(t.nodes()[0], total);
            for idx in 0..total {
                let (chunk, off) = t.pos(idx);
                assert_eq!(t.loc(chunk, off), idx, "n_chunks={}, idx={}", n_chunks, idx);
                assert!(off < lengths[chunk]);
            }
        }
    }
}
