use std::collections::BTreeMap;

use engine_logging::engine_warn;

/// Restores input order for completions that arrive out of order.
///
/// Entries are `Option<T>`: `None` marks a record whose transform failed. It
/// is released in turn like any other entry so later indices never stall
/// behind it.
#[derive(Debug)]
pub struct ReorderBuffer<T> {
    next_expected: u64,
    cache: BTreeMap<u64, Option<T>>,
}

impl<T> Default for ReorderBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ReorderBuffer<T> {
    pub fn new() -> Self {
        Self {
            next_expected: 0,
            cache: BTreeMap::new(),
        }
    }

    pub fn next_expected(&self) -> u64 {
        self.next_expected
    }

    /// Number of completions held back waiting for a predecessor.
    pub fn pending(&self) -> usize {
        self.cache.len()
    }

    /// Accepts the completion for `index` and returns everything that is now
    /// deliverable, in index order. An out-of-order completion is cached and
    /// the returned iterator is empty.
    pub fn accept(&mut self, index: u64, payload: Option<T>) -> Ready<'_, T> {
        let head = if index == self.next_expected {
            Some(payload)
        } else {
            if index < self.next_expected || self.cache.contains_key(&index) {
                engine_warn!(
                    "Dropping duplicate completion index={} next_expected={}",
                    index,
                    self.next_expected
                );
            } else {
                self.cache.insert(index, payload);
            }
            None
        };
        Ready { buffer: self, head }
    }
}

/// Iterator over completions released by [`ReorderBuffer::accept`].
///
/// Each yielded item advances `next_expected`.
pub struct Ready<'a, T> {
    buffer: &'a mut ReorderBuffer<T>,
    head: Option<Option<T>>,
}

impl<T> Iterator for Ready<'_, T> {
    type Item = Option<T>;

    fn next(&mut self) -> Option<Self::Item> {
        let item = match self.head.take() {
            Some(item) => item,
            None => {
                let next = self.buffer.next_expected;
                self.buffer.cache.remove(&next)?
            }
        };
        self.buffer.next_expected += 1;
        Some(item)
    }
}
