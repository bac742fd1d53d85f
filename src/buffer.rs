// Notes:
// - the writer and the display share one mutex; it is held for the copy only, never across a
//   hardware poll
// - a capacity change always goes through `reallocate`, old samples are not migrated

use std::sync::{Arc, Mutex, MutexGuard};

pub type SharedRing = Arc<Mutex<RingBuffer>>;

/// Fixed-capacity circular store of downsampled samples.
#[derive(Debug, Clone)]
pub struct RingBuffer {
    data: Vec<f32>,
    head: usize,
    filled: usize,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> RingBuffer {
        debug_assert!(capacity > 0);

        RingBuffer {
            data: vec![0.0; capacity.max(1)],
            head: 0,
            filled: 0,
        }
    }

    pub fn shared(capacity: usize) -> SharedRing {
        Arc::new(Mutex::new(RingBuffer::new(capacity)))
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn len(&self) -> usize {
        self.filled
    }

    pub fn head(&self) -> usize {
        self.head
    }

    pub fn is_empty(&self) -> bool {
        self.filled == 0
    }

    pub fn is_full(&self) -> bool {
        self.filled == self.capacity()
    }

    /// Appends samples, overwriting the oldest ones once full.
    ///
    /// When a single call carries at least `capacity` samples only the last `capacity` of them
    /// are kept, and the buffer ends up holding exactly those in order.
    pub fn write<T: Copy + Into<f32>>(&mut self, samples: &[T]) {
        let capacity = self.capacity();
        let n = samples.len();

        if n == 0 {
            return;
        }

        if n >= capacity {
            let tail = &samples[n - capacity..];
            for (slot, &sample) in self.data.iter_mut().zip(tail) {
                *slot = sample.into();
            }
            self.head = 0;
            self.filled = capacity;
            return;
        }

        let until_wrap = capacity - self.head;
        let first = n.min(until_wrap);

        for (slot, &sample) in self.data[self.head..self.head + first]
            .iter_mut()
            .zip(&samples[..first])
        {
            *slot = sample.into();
        }
        for (slot, &sample) in self.data[..n - first].iter_mut().zip(&samples[first..]) {
            *slot = sample.into();
        }

        self.head = (self.head + n) % capacity;
        self.filled = (self.filled + n).min(capacity);
    }

    /// Samples in chronological order.
    pub fn snapshot(&self) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.filled);
        self.snapshot_into(&mut out);
        out
    }

    /// Same as [`RingBuffer::snapshot`], reusing the allocation of `out`.
    pub fn snapshot_into(&self, out: &mut Vec<f32>) {
        out.clear();

        if self.filled < self.capacity() {
            out.extend_from_slice(&self.data[..self.filled]);
        } else {
            out.extend_from_slice(&self.data[self.head..]);
            out.extend_from_slice(&self.data[..self.head]);
        }
    }

    /// The most recent `n` samples (fewer if not that many were written), oldest first.
    pub fn latest(&self, n: usize) -> Vec<f32> {
        let n = n.min(self.filled);
        let capacity = self.capacity();
        let start = (self.head + capacity - n) % capacity;

        (0..n).map(|i| self.data[(start + i) % capacity]).collect()
    }

    /// Forgets every sample, keeping the allocation.
    pub fn reset(&mut self) {
        self.data.fill(0.0);
        self.head = 0;
        self.filled = 0;
    }

    /// Replaces the storage with an empty buffer of `capacity`. Returns whether it changed.
    pub fn reallocate(&mut self, capacity: usize) -> bool {
        if capacity == self.capacity() {
            return false;
        }

        *self = RingBuffer::new(capacity);
        true
    }
}

/// Locks the shared ring, recovering from a writer that panicked mid-copy.
pub fn lock(ring: &SharedRing) -> MutexGuard<'_, RingBuffer> {
    match ring.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            log::warn!("ring buffer lock poisoned, recovering");
            poisoned.into_inner()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seq(from: i16, to: i16) -> Vec<i16> {
        (from..to).collect()
    }

    fn floats(values: &[i16]) -> Vec<f32> {
        values.iter().map(|&v| v as f32).collect()
    }

    #[test]
    fn preserves_order_before_wrapping() {
        let mut ring = RingBuffer::new(10);
        ring.write(&seq(0, 3));
        ring.write(&seq(3, 7));

        assert_eq!(ring.len(), 7);
        assert_eq!(ring.head(), 7);
        assert_eq!(ring.snapshot(), floats(&seq(0, 7)));
    }

    #[test]
    fn basic_streaming_scenario() {
        let mut ring = RingBuffer::new(100);
        ring.write(&seq(0, 30));
        ring.write(&seq(30, 70));
        ring.write(&seq(70, 120));

        assert_eq!(ring.len(), 100);
        assert!(ring.is_full());
        assert_eq!(ring.head(), 20);
        assert_eq!(ring.snapshot(), floats(&seq(20, 120)));
    }

    #[test]
    fn oversized_write_keeps_the_tail() {
        let mut ring = RingBuffer::new(8);
        ring.write(&seq(0, 3));
        ring.write(&seq(100, 120));

        assert_eq!(ring.len(), 8);
        assert_eq!(ring.snapshot(), floats(&seq(112, 120)));

        ring.write(&seq(0, 2));
        assert_eq!(ring.snapshot(), floats(&[114, 115, 116, 117, 118, 119, 0, 1]));
    }

    #[test]
    fn exact_capacity_write() {
        let mut ring = RingBuffer::new(4);
        ring.write(&seq(1, 3));
        ring.write(&seq(10, 14));

        assert_eq!(ring.head(), 0);
        assert_eq!(ring.snapshot(), floats(&seq(10, 14)));
    }

    #[test]
    fn latest_and_snapshot_into() {
        let mut ring = RingBuffer::new(5);
        ring.write(&seq(0, 7));

        assert_eq!(ring.latest(3), floats(&[4, 5, 6]));
        assert_eq!(ring.latest(50), floats(&seq(2, 7)));

        let mut out = vec![42.0; 2];
        ring.snapshot_into(&mut out);
        assert_eq!(out, floats(&seq(2, 7)));
    }

    #[test]
    fn reset_keeps_capacity() {
        let mut ring = RingBuffer::new(6);
        ring.write(&seq(0, 9));
        ring.reset();

        assert!(ring.is_empty());
        assert_eq!(ring.head(), 0);
        assert_eq!(ring.capacity(), 6);
        assert!(ring.snapshot().is_empty());
    }

    #[test]
    fn reallocate_is_destructive() {
        let mut ring = RingBuffer::new(6);
        ring.write(&seq(0, 4));

        assert!(!ring.reallocate(6));
        assert_eq!(ring.len(), 4);

        assert!(ring.reallocate(12));
        assert_eq!(ring.capacity(), 12);
        assert!(ring.is_empty());
    }
}
