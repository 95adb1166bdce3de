//! Fixed-capacity ring buffer
//!
//! Backs the per-server event logs in the status tracker: the newest
//! `capacity` entries are kept, older ones are overwritten in place.

/// A fixed-capacity ring buffer
///
/// When the buffer is full, the oldest entry is overwritten by the next
/// push, so memory stays bounded no matter how long a server is tracked.
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    /// The underlying storage, grows up to `capacity` then wraps
    data: Vec<T>,
    capacity: usize,
    /// Slot the next push lands in once the buffer is full
    write_pos: usize,
    /// Total entries ever pushed (may exceed capacity)
    total_written: usize,
}

impl<T> RingBuffer<T> {
    /// Create a ring buffer holding at most `capacity` entries.
    ///
    /// A zero capacity is bumped to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            data: Vec::with_capacity(capacity),
            capacity,
            write_pos: 0,
            total_written: 0,
        }
    }

    /// Append an entry, overwriting the oldest one when full.
    pub fn push(&mut self, item: T) {
        if self.data.len() < self.capacity {
            self.data.push(item);
        } else {
            self.data[self.write_pos] = item;
        }
        self.write_pos = (self.write_pos + 1) % self.capacity;
        self.total_written += 1;
    }

    /// Iterate entries oldest first.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> {
        let split = if self.has_wrapped() { self.write_pos } else { 0 };
        let (newer, older) = self.data.split_at(split);
        older.iter().chain(newer.iter())
    }

    /// Most recently pushed entry
    pub fn last(&self) -> Option<&T> {
        self.iter().next_back()
    }

    /// Number of entries currently stored
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Whether any entry has been overwritten
    pub fn has_wrapped(&self) -> bool {
        self.total_written > self.capacity
    }

    /// Total entries ever pushed (may exceed capacity)
    pub fn total_written(&self) -> usize {
        self.total_written
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.write_pos = 0;
        self.total_written = 0;
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl<T: Clone> RingBuffer<T> {
    /// Copy out all entries, oldest first.
    pub fn to_vec(&self) -> Vec<T> {
        self.iter().cloned().collect()
    }

    /// Copy out the newest `n` entries, oldest first.
    pub fn recent(&self, n: usize) -> Vec<T> {
        let skip = self.len().saturating_sub(n);
        self.iter().skip(skip).cloned().collect()
    }
}
