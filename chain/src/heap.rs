//! An array-backed binary heap with a caller supplied priority and in-place
//! root replacement.

/// A binary heap whose root is the item for which `better` holds against
/// every other item.
pub struct Heap<T> {
    items: Vec<T>,
    better: fn(&T, &T) -> bool,
}

impl<T> Heap<T> {
    pub const fn new(better: fn(&T, &T) -> bool) -> Self {
        Self {
            items: Vec::new(),
            better,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn peek(&self) -> Option<&T> {
        self.items.first()
    }

    /// Items in heap order, which is not priority order.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    pub fn position(&self, predicate: impl Fn(&T) -> bool) -> Option<usize> {
        self.items.iter().position(predicate)
    }

    pub fn push(&mut self, item: T) {
        self.items.push(item);
        self.sift_up(self.items.len() - 1);
    }

    pub fn pop(&mut self) -> Option<T> {
        if self.items.is_empty() {
            return None;
        }
        Some(self.remove_at(0))
    }

    /// Swaps the root for `item` and restores the heap in one sift. Pushes
    /// when empty.
    pub fn replace_best(&mut self, item: T) -> Option<T> {
        if self.items.is_empty() {
            self.items.push(item);
            return None;
        }
        let best = std::mem::replace(&mut self.items[0], item);
        self.sift_down(0);
        Some(best)
    }

    /// Replaces the item at `index`, as found by [`Heap::position`].
    pub fn replace_at(&mut self, index: usize, item: T) -> T {
        let old = std::mem::replace(&mut self.items[index], item);
        self.restore(index);
        old
    }

    pub fn remove_at(&mut self, index: usize) -> T {
        let item = self.items.swap_remove(index);
        if index < self.items.len() {
            self.restore(index);
        }
        item
    }

    /// Empties the heap, yielding items in heap order.
    pub fn drain(&mut self) -> std::vec::Drain<'_, T> {
        self.items.drain(..)
    }

    fn restore(&mut self, index: usize) {
        if index > 0 && (self.better)(&self.items[index], &self.items[(index - 1) / 2]) {
            self.sift_up(index);
        } else {
            self.sift_down(index);
        }
    }

    fn sift_up(&mut self, mut index: usize) {
        while index > 0 {
            let parent = (index - 1) / 2;
            if !(self.better)(&self.items[index], &self.items[parent]) {
                break;
            }
            self.items.swap(index, parent);
            index = parent;
        }
    }

    fn sift_down(&mut self, mut index: usize) {
        let len = self.items.len();
        loop {
            let left = 2 * index + 1;
            let right = left + 1;
            let mut best = index;
            if left < len && (self.better)(&self.items[left], &self.items[best]) {
                best = left;
            }
            if right < len && (self.better)(&self.items[right], &self.items[best]) {
                best = right;
            }
            if best == index {
                break;
            }
            self.items.swap(index, best);
            index = best;
        }
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Heap<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(&self.items).finish()
    }
}
