use std::collections::VecDeque;

/// Unbounded FIFO holding tuples that have no room in a reservoir yet.
#[derive(Debug)]
pub struct EmergencyBuffer<T> {
    tuples: VecDeque<T>,
}

impl<T> Default for EmergencyBuffer<T> {
    fn default() -> Self {
        Self {
            tuples: VecDeque::new(),
        }
    }
}

impl<T> EmergencyBuffer<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, tuple: T) {
        self.tuples.push_back(tuple);
    }

    /// Returns a tuple taken by `pop` that could not be placed.
    pub fn push_front(&mut self, tuple: T) {
        self.tuples.push_front(tuple);
    }

    pub fn pop(&mut self) -> Option<T> {
        self.tuples.pop_front()
    }

    /// Removes up to `n` of the oldest tuples.
    pub fn take_front(&mut self, n: usize) -> Vec<T> {
        let n = n.min(self.tuples.len());
        self.tuples.drain(..n).collect()
    }

    pub fn len(&self) -> usize {
        self.tuples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tuples.is_empty()
    }

    pub fn clear(&mut self) {
        self.tuples.clear();
    }

    /// Removes the tuples matching `pred`, in order, keeping the rest in order.
    pub fn extract_if<F>(&mut self, mut pred: F) -> Vec<T>
    where
        F: FnMut(&T) -> bool,
    {
        let mut taken = Vec::new();
        let mut kept = VecDeque::with_capacity(self.tuples.len());
        for tuple in self.tuples.drain(..) {
            if pred(&tuple) {
                taken.push(tuple);
            } else {
                kept.push_back(tuple);
            }
        }
        self.tuples = kept;
        taken
    }
}
