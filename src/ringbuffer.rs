use std::{collections::VecDeque, num::NonZero};

/// Bounded FIFO that drops the oldest entry once full.
#[derive(Debug)]
pub(crate) struct RingBuffer<T> {
    inner: VecDeque<T>,
    capacity: NonZero<usize>,
}

impl<T> RingBuffer<T> {
    #[must_use]
    pub(crate) fn new(capacity: NonZero<usize>) -> Self {
        Self {
            inner: VecDeque::with_capacity(capacity.get()),
            capacity,
        }
    }

    pub(crate) fn push(&mut self, item: T) {
        if self.is_full() {
            self.inner.pop_front();
        }

        self.inner.push_back(item);

        debug_assert!(self.inner.len() <= self.capacity.get());
    }

    #[must_use]
    pub(crate) fn is_full(&self) -> bool {
        self.inner.len() == self.capacity.get()
    }

    #[must_use]
    pub(crate) fn iter(&self) -> std::collections::vec_deque::Iter<'_, T> {
        self.inner.iter()
    }
}
