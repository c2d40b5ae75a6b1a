// Copyright 2025 salon Project Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{
    collections::{HashSet, VecDeque},
    hash::Hash,
};

/// A FIFO queue that rejects duplicate elements and supports random removal.
///
/// Insertion order defines pop order. Removed slots are reclaimed lazily on pop.
pub struct UniqueQueue<T> {
    queue: VecDeque<T>,
    members: HashSet<T>,
}

impl<T> Default for UniqueQueue<T> {
    fn default() -> Self {
        Self {
            queue: VecDeque::new(),
            members: HashSet::new(),
        }
    }
}

impl<T> std::fmt::Debug for UniqueQueue<T>
where
    T: Hash + Eq + Clone,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UniqueQueue").field("len", &self.len()).finish()
    }
}

impl<T> UniqueQueue<T>
where
    T: Hash + Eq + Clone,
{
    /// Create an empty [`UniqueQueue`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Push an element to the tail of the queue.
    ///
    /// Returns `false` if an equal element is already queued.
    pub fn push(&mut self, elem: T) -> bool {
        if !self.members.insert(elem.clone()) {
            return false;
        }
        self.queue.push_back(elem);
        true
    }

    /// Pop an element from the head of the queue.
    pub fn pop(&mut self) -> Option<T> {
        while let Some(elem) = self.queue.pop_front() {
            // Skip slots invalidated by `remove`.
            if self.members.remove(&elem) {
                return Some(elem);
            }
        }
        None
    }

    /// Randomly remove the given element from the queue.
    ///
    /// Returns `true` if the element was queued. The slot itself is reclaimed on a
    /// later pop.
    pub fn remove(&mut self, elem: &T) -> bool {
        self.members.remove(elem)
    }

    /// Returns `true` if the element is queued.
    pub fn contains(&self, elem: &T) -> bool {
        self.members.contains(elem)
    }

    /// Remove and return all elements from the queue in order.
    pub fn clear(&mut self) -> Vec<T> {
        let mut res = Vec::with_capacity(self.members.len());
        while let Some(elem) = self.pop() {
            res.push(elem);
        }
        self.queue.clear();
        res
    }

    /// Returns the element count.
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Returns `true` if there is no element in the queue.
    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use itertools::Itertools;

    use super::*;

    #[test]
    fn test_unique_queue() {
        let mut queue = UniqueQueue::new();
        assert!(queue.is_empty());

        assert!(queue.push(1));
        assert!(queue.push(2));
        assert!(queue.push(3));
        assert!(!queue.push(2));
        assert_eq!(queue.len(), 3);

        assert_eq!(queue.pop(), Some(1));
        assert!(queue.push(1));
        assert_eq!(queue.len(), 3);

        // Pop order follows insertion order.
        assert_eq!(queue.pop(), Some(2));
        assert_eq!(queue.pop(), Some(3));
        assert_eq!(queue.pop(), Some(1));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn test_remove() {
        let mut queue = UniqueQueue::new();
        for i in 0..5 {
            queue.push(i);
        }

        assert!(queue.remove(&2));
        assert!(!queue.remove(&2));
        assert!(!queue.contains(&2));
        assert_eq!(queue.len(), 4);

        // A removed element can be queued again and keeps its new position.
        assert!(queue.push(2));
        assert_eq!(queue.clear(), vec![0, 1, 3, 4, 2]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_clear_skips_removed() {
        let mut queue = UniqueQueue::new();
        for i in 0..4 {
            queue.push(i);
        }
        queue.remove(&0);
        queue.remove(&3);
        assert_eq!(queue.clear(), (1..3).collect_vec());
    }
}
