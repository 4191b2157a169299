//! The Buffer Pool contract (spec §1, §3a, §5).
//!
//! The real buffer pool — a size-bucketed pool of page-aligned,
//! RDMA-registerable buffers, independently allocated and shared with the
//! reactor (spec §5, "Shared resources") — is out of scope here. This module
//! defines the trait the reactor posts reads against plus [`HeapBufferPool`],
//! a reference implementation good enough for tests and demos. A production
//! deployment swaps in a pool that hands back real RDMA-registered, page
//! aligned memory; the reactor only requires `PoolBuffer: DerefMut<Target =
//! [u8]> + Send`.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

/// Identifies one of the pool's size buckets (spec §3, "mrs: mapping from
/// buffer-pool-bucket id to registered memory region").
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BucketId(pub usize);

/// A bucket's free buffers plus a count of buffers currently checked out,
/// so starvation can be judged against buffers actually in hand rather than
/// the size of the (possibly still-empty) free list.
struct BucketState {
    free: Vec<Vec<u8>>,
    live: usize,
}

/// A borrowed buffer. Returns itself to the pool's free list on drop unless
/// ownership has been handed to a consumer (spec §5, "Shared resources":
/// buffer ownership transfers to the consumer upon delivery and is released
/// when the consumer unreferences the message — here, that's simply dropping
/// the `PoolBuffer`, whichever side holds it last).
pub struct PoolBuffer {
    bucket: BucketId,
    data: Vec<u8>,
    state: Option<Arc<Mutex<BucketState>>>,
}

impl PoolBuffer {
    pub fn bucket(&self) -> BucketId {
        self.bucket
    }
}

impl Deref for PoolBuffer {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for PoolBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Drop for PoolBuffer {
    fn drop(&mut self) {
        if let Some(state) = self.state.take() {
            let data = std::mem::take(&mut self.data);
            let mut guard = state.lock().unwrap();
            guard.live = guard.live.saturating_sub(1);
            guard.free.push(data);
        }
    }
}

/// The contract the reactor posts reads against (spec §4.4, "Posting Reads").
pub trait BufferPool: Send + Sync {
    /// Maps a byte size to the bucket that should hold it.
    fn bucket_for(&self, size: usize) -> BucketId;

    /// All buckets the pool is prepared to register memory regions for
    /// (spec §4.2, "Route resolved": registering every buffer-pool bucket).
    fn buckets(&self) -> &[BucketId];

    /// Borrows a buffer from `bucket`, or `None` on starvation (spec §3,
    /// "If buffer allocation fails at post time, the RR is destroyed and a
    /// starvation event is accounted separately").
    fn alloc(&self, bucket: BucketId) -> Option<PoolBuffer>;
}

/// A reference, heap-backed buffer pool for tests and demos.
pub struct HeapBufferPool {
    bucket_sizes: Vec<usize>,
    bucket_states: Vec<Arc<Mutex<BucketState>>>,
    buckets: Vec<BucketId>,
    capacity_per_bucket: usize,
}

impl HeapBufferPool {
    /// Creates a pool with one bucket per entry in `bucket_sizes` (ascending),
    /// each allowed to mint up to `capacity_per_bucket` live buffers before
    /// `alloc` starts returning `None`.
    pub fn new(bucket_sizes: Vec<usize>, capacity_per_bucket: usize) -> HeapBufferPool {
        let buckets = (0..bucket_sizes.len()).map(BucketId).collect();
        let bucket_states = bucket_sizes
            .iter()
            .map(|_| Arc::new(Mutex::new(BucketState { free: Vec::new(), live: 0 })))
            .collect();
        HeapBufferPool {
            bucket_sizes,
            bucket_states,
            buckets,
            capacity_per_bucket,
        }
    }
}

impl BufferPool for HeapBufferPool {
    fn bucket_for(&self, size: usize) -> BucketId {
        self.bucket_sizes
            .iter()
            .position(|&sz| sz >= size)
            .map(BucketId)
            .unwrap_or_else(|| BucketId(self.bucket_sizes.len() - 1))
    }

    fn buckets(&self) -> &[BucketId] {
        &self.buckets
    }

    fn alloc(&self, bucket: BucketId) -> Option<PoolBuffer> {
        let state = self.bucket_states.get(bucket.0)?;
        let size = *self.bucket_sizes.get(bucket.0)?;
        let mut guard = state.lock().unwrap();
        // Starvation is modeled as a ceiling on buffers currently checked out
        // (`live`), not on how many happen to be sitting in the free list:
        // the free list is empty until something is returned, so judging
        // capacity by its length would never actually cap concurrent use.
        if guard.live >= self.capacity_per_bucket {
            return None;
        }
        guard.live += 1;
        let data = guard.free.pop().unwrap_or_else(|| vec![0u8; size]);
        drop(guard);
        Some(PoolBuffer {
            bucket,
            data,
            state: Some(state.clone()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_for_picks_smallest_fitting_bucket() {
        let pool = HeapBufferPool::new(vec![64, 256, 1024], 4);
        assert_eq!(pool.bucket_for(10), BucketId(0));
        assert_eq!(pool.bucket_for(100), BucketId(1));
        assert_eq!(pool.bucket_for(1024), BucketId(2));
    }

    #[test]
    fn alloc_returns_buffer_of_bucket_size() {
        let pool = HeapBufferPool::new(vec![64], 4);
        let buf = pool.alloc(BucketId(0)).unwrap();
        assert_eq!(buf.len(), 64);
    }

    #[test]
    fn buffers_borrowed_equals_returned_plus_outstanding() {
        let pool = HeapBufferPool::new(vec![16], 2);
        let a = pool.alloc(BucketId(0)).unwrap();
        let b = pool.alloc(BucketId(0)).unwrap();
        assert!(pool.alloc(BucketId(0)).is_none(), "pool should be exhausted");
        drop(a);
        let c = pool.alloc(BucketId(0)).unwrap();
        drop(b);
        drop(c);
        // Both buffers returned; pool can mint up to capacity again.
        assert!(pool.alloc(BucketId(0)).is_some());
        assert!(pool.alloc(BucketId(0)).is_some());
    }
}
