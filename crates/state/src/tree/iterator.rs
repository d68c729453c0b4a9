// Path: crates/state/src/tree/iterator.rs

//! Ordered range iteration.

use crate::node::{Node, NodePointer};
use crate::store::TreeStore;
use bytes::Bytes;
use iavlx_types::Result;
use std::sync::Arc;

/// Iterates leaves with `start <= key < end` in key order, ascending or
/// descending. Persisted subtrees on the pending stack keep their
/// changesets pinned until the iterator is dropped or exhausted.
pub struct TreeIterator {
    store: Arc<TreeStore>,
    stack: Vec<Node>,
    start: Option<Bytes>,
    end: Option<Bytes>,
    ascending: bool,
    done: bool,
}

impl TreeIterator {
    pub(crate) fn new(
        store: Arc<TreeStore>,
        root: Option<&Arc<NodePointer>>,
        start: Option<Bytes>,
        end: Option<Bytes>,
        ascending: bool,
    ) -> Result<Self> {
        let empty_range = matches!((&start, &end), (Some(s), Some(e)) if s >= e);
        let mut stack = Vec::new();
        if let Some(root) = root.filter(|_| !empty_range) {
            stack.push(root.resolve(&store)?);
        }
        Ok(Self {
            store,
            stack,
            start,
            end,
            ascending,
            done: false,
        })
    }

    /// Whether iteration has not finished.
    pub fn valid(&self) -> bool {
        !self.done && !self.stack.is_empty()
    }

    fn after_start(&self, key: &[u8]) -> bool {
        self.start.as_deref().map_or(true, |s| key >= s)
    }

    fn before_end(&self, key: &[u8]) -> bool {
        self.end.as_deref().map_or(true, |e| key < e)
    }

    fn step(&mut self) -> Result<Option<(Bytes, Bytes)>> {
        while let Some(node) = self.stack.pop() {
            let key = node.key()?;
            if node.is_leaf() {
                if self.after_start(&key) && self.before_end(&key) {
                    return node.key_value().map(Some);
                }
                continue;
            }
            // Keys below `key` live on the left, keys from `key` up on the right.
            let want_left = self.start.as_deref().map_or(true, |s| s < key.as_ref());
            let want_right = self.before_end(&key);
            let (first, second) = if self.ascending {
                (want_right.then(|| node.right()), want_left.then(|| node.left()))
            } else {
                (want_left.then(|| node.left()), want_right.then(|| node.right()))
            };
            // Pushed in reverse so the nearer side pops first.
            for child in [first, second].into_iter().flatten() {
                self.stack.push(child?.resolve(&self.store)?);
            }
        }
        Ok(None)
    }
}

impl Iterator for TreeIterator {
    type Item = Result<(Bytes, Bytes)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.step() {
            Ok(Some(item)) => Some(Ok(item)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                self.stack.clear();
                Some(Err(e))
            }
        }
    }
}

impl std::fmt::Debug for TreeIterator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeIterator")
            .field("pending", &self.stack.len())
            .field("ascending", &self.ascending)
            .field("done", &self.done)
            .finish()
    }
}
