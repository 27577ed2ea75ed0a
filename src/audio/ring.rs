//! Lock-free sample handoff between capture tasks and the mixer frame pass.
//!
//! Capture-side tasks (cpal callbacks, bridge republishers, asset playback)
//! push samples through a `FeedProducer`; the frame pass drains the paired
//! `FeedConsumer` once per tick. Neither side ever blocks.

use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};

/// Create a producer/consumer pair with room for `capacity` samples.
pub fn feed_pair(capacity: usize) -> (FeedProducer, FeedConsumer) {
    let rb = HeapRb::<i16>::new(capacity);
    let (prod, cons) = rb.split();
    (FeedProducer { inner: prod }, FeedConsumer { inner: cons })
}

/// Write half of a sample feed. Drops samples when the ring is full.
pub struct FeedProducer {
    inner: HeapProd<i16>,
}

impl std::fmt::Debug for FeedProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedProducer")
            .field("free_space", &self.free_space())
            .finish()
    }
}

impl FeedProducer {
    /// Push samples without blocking; returns how many were dropped.
    pub fn push(&mut self, samples: &[i16]) -> usize {
        let written = self.inner.push_slice(samples);
        samples.len() - written
    }

    pub fn free_space(&self) -> usize {
        self.inner.vacant_len()
    }
}

/// Read half of a sample feed, drained frame-at-a-time by the mixer.
pub struct FeedConsumer {
    inner: HeapCons<i16>,
}

impl FeedConsumer {
    /// Read exactly `len` samples, padding with silence when the feed has
    /// fewer buffered (silence substitution for late or lost capture).
    pub fn read_frame(&mut self, len: usize) -> Vec<i16> {
        let mut out = vec![0i16; len];
        let read = self.inner.pop_slice(&mut out);
        debug_assert!(read <= len);
        out
    }

    /// Read up to `len` samples without silence padding.
    ///
    /// Returns `None` once the feed is empty and its producer is gone.
    pub fn drain_frame(&mut self, len: usize) -> Option<Vec<i16>> {
        let mut out = vec![0i16; len];
        let read = self.inner.pop_slice(&mut out);
        if read == 0 {
            return None;
        }
        out.truncate(read);
        Some(out)
    }

    pub fn available(&self) -> usize {
        self.inner.occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.available() == 0
    }
}
