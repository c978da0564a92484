//! Fixed-Capacity Circular Buffer for Rolling Windows
//!
//! ## Overview
//!
//! The stats aggregator keeps only the most recent entries per adapter. A
//! circular buffer gives that sliding window with bounded memory:
//! - O(1) insertion (overwrites oldest when full)
//! - O(1) access to most recent entry
//! - O(n) iteration oldest to newest
//!
//! ### Memory Layout
//!
//! ```text
//! CircularBuffer capacity 5, after 7 pushes (F, G overwrote A, B):
//! ┌─────┬─────┬─────┬─────┬─────┐
//! │  F  │  G  │  C  │  D  │  E  │  ← slots
//! └─────┴─────┴─────┴─────┴─────┘
//!             ↑
//!             └── write_pos = 2 (also the oldest entry once full)
//! ```
//!
//! Slots are allocated once at construction; capacity is a runtime value so
//! large windows (1000 stats entries) live on the heap.
//!
//! ## Usage Example
//!
//! ```rust
//! use slopeguard_core::buffer::CircularBuffer;
//!
//! let mut window = CircularBuffer::with_capacity(3);
//! for n in 0..5 {
//!     window.push(n);
//! }
//! let kept: Vec<_> = window.iter().copied().collect();
//! assert_eq!(kept, vec![2, 3, 4]);
//! assert_eq!(window.last(), Some(&4));
//! ```

/// Ring buffer that keeps the most recent `capacity` items
///
/// ## Internal Invariants
///
/// - `write_pos < capacity` (next write position is always valid)
/// - `len <= capacity`
/// - iteration yields items in insertion order
///
/// ## Thread Safety
///
/// Not thread-safe; the stats aggregator wraps it in a mutex.
#[derive(Debug, Clone)]
pub struct CircularBuffer<T> {
    data: Vec<Option<T>>,
    write_pos: usize,
    len: usize,
}

impl<T> CircularBuffer<T> {
    /// Create an empty buffer; a zero capacity is raised to one
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let mut data = Vec::with_capacity(capacity);
        data.resize_with(capacity, || None);

        Self {
            data,
            write_pos: 0,
            len: 0,
        }
    }

    /// Append an item, overwriting the oldest when full
    pub fn push(&mut self, item: T) {
        let capacity = self.capacity();
        self.data[self.write_pos] = Some(item);
        self.write_pos = (self.write_pos + 1) % capacity;

        if self.len < capacity {
            self.len += 1;
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == self.capacity()
    }

    /// Most recently pushed item
    pub fn last(&self) -> Option<&T> {
        if self.is_empty() {
            return None;
        }

        let idx = if self.write_pos == 0 {
            self.capacity() - 1
        } else {
            self.write_pos - 1
        };

        self.data[idx].as_ref()
    }

    /// Iterate oldest to newest
    pub fn iter(&self) -> CircularBufferIter<'_, T> {
        CircularBufferIter {
            buffer: self,
            index: 0,
        }
    }

    pub fn clear(&mut self) {
        for slot in self.data.iter_mut() {
            *slot = None;
        }
        self.write_pos = 0;
        self.len = 0;
    }

    /// Logical index 0 is the oldest entry
    ///
    /// ```text
    /// Physical:  [D, E, A, B, C]  (write_pos = 2, full)
    /// Logical:   [A, B, C, D, E]
    /// logical[i] = physical[(write_pos + i) % capacity]
    /// ```
    fn get(&self, index: usize) -> Option<&T> {
        if index >= self.len {
            return None;
        }

        let actual_index = if self.len < self.capacity() {
            index
        } else {
            (self.write_pos + index) % self.capacity()
        };

        self.data[actual_index].as_ref()
    }
}

/// Iterator over circular buffer contents
pub struct CircularBufferIter<'a, T> {
    buffer: &'a CircularBuffer<T>,
    index: usize,
}

impl<'a, T> Iterator for CircularBufferIter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.buffer.get(self.index)?;
        self.index += 1;
        Some(item)
    }
}
