//! A sorted multiset backed by a list of small sorted chunks, with a lazily
//! rebuilt index tree for `O(log n)` rank/select. Two variants are
//! provided: [`SortedList`], ordered by the value itself, and
//! [`SortedListByKey`], ordered by a projection of the value.
//!
//! Both variants keep their chunk sizes within `[load/2, load*2]` by
//! splitting on growth and merging on shrinkage (`load` defaults to 1000,
//! tunable via `with_load`), and maintain a `maxes` summary array so that
//! routing a value to its chunk is a single binary search. Positional
//! operations (`get`, `insert`, `pop`, range slicing by index) additionally
//! consult an implicit segment tree over chunk lengths; the tree is
//! invalidated rather than incrementally repaired whenever a chunk splits,
//! merges, or the container bulk-loads, and is rebuilt lazily the next time
//! a positional query needs it.
//!
//! ```
//! use sorted_chunk_list::SortedList;
//!
//! let mut list = SortedList::from_values([5, 1, 4, 1, 5, 9, 2, 6]);
//! assert_eq!(list.iter().copied().collect::<Vec<_>>(), vec![1, 1, 2, 4, 5, 5, 6, 9]);
//! assert_eq!(list.bisect_left(&5), 4);
//! assert_eq!(list.count(&1), 2);
//! ```

mod bisect;
mod error;
mod index_tree;
mod range_iter;
mod sorted_list;
mod sorted_list_by_key;

pub use error::{Error, Result};
pub use range_iter::RangeIter;
pub use sorted_list::SortedList;
pub use sorted_list_by_key::SortedListByKey;
