//! Packet buffer pool.
//!
//! Buffers are fixed-size DMA regions. A buffer moves from the allocator
//! into exactly one ring slot and back; [`PacketBuffer`] is not `Clone`, so
//! a buffer cannot sit in two slots at once. The pool never shrinks.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::device::{DmaRegion, MemoryPool};
use crate::error::{CndmError, Result};

/// Default packet buffer size.
pub const PACKET_SIZE: usize = 4096;

static NEXT_ALLOCATOR_ID: AtomicU64 = AtomicU64::new(1);

/// A packet buffer owned by one allocator.
#[derive(Debug)]
pub struct PacketBuffer<G> {
    region: G,
    owner: u64,
}

impl<G: DmaRegion> PacketBuffer<G> {
    /// Buffer size in bytes.
    pub fn len(&self) -> usize {
        self.region.len()
    }

    /// `true` for a zero-length buffer.
    pub fn is_empty(&self) -> bool {
        self.region.is_empty()
    }

    /// Device address of byte `offset`.
    pub fn device_address(&self, offset: usize) -> u64 {
        self.region.device_address(offset)
    }

    /// Copy bytes out of the buffer.
    ///
    /// # Panics
    ///
    /// Panics if the range exceeds the buffer.
    pub fn read(&self, offset: usize, buf: &mut [u8]) {
        self.region.read(offset, buf);
    }

    /// Copy bytes into the buffer.
    ///
    /// # Panics
    ///
    /// Panics if the range exceeds the buffer.
    pub fn write(&self, offset: usize, data: &[u8]) {
        self.region.write(offset, data);
    }

    /// The first `len` bytes as an owned vector.
    ///
    /// # Panics
    ///
    /// Panics if `len` exceeds the buffer.
    pub fn to_vec(&self, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        self.region.read(0, &mut out);
        out
    }
}

#[derive(Debug)]
struct AllocState<G> {
    free: VecDeque<PacketBuffer<G>>,
    allocated: HashSet<u64>,
}

/// Allocate/release packet buffers with free-list reuse.
///
/// Operations take a short synchronous lock and never suspend.
pub struct PacketAllocator<P: MemoryPool> {
    id: u64,
    pool: Arc<P>,
    packet_size: usize,
    state: Mutex<AllocState<P::Region>>,
}

impl<P: MemoryPool> std::fmt::Debug for PacketAllocator<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketAllocator")
            .field("id", &self.id)
            .field("packet_size", &self.packet_size)
            .field("allocated", &self.allocated_count())
            .field("free", &self.free_count())
            .finish_non_exhaustive()
    }
}

impl<P: MemoryPool> PacketAllocator<P> {
    /// Allocator handing out `packet_size`-byte buffers from `pool`.
    pub fn new(pool: Arc<P>, packet_size: usize) -> Self {
        Self {
            id: NEXT_ALLOCATOR_ID.fetch_add(1, Ordering::Relaxed),
            pool,
            packet_size,
            state: Mutex::new(AllocState {
                free: VecDeque::new(),
                allocated: HashSet::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, AllocState<P::Region>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Buffer size.
    pub const fn packet_size(&self) -> usize {
        self.packet_size
    }

    /// Take a buffer from the free list, or allocate a new one.
    ///
    /// # Errors
    ///
    /// Returns [`CndmError::DmaFailed`] when the pool is exhausted.
    pub fn allocate(&self) -> Result<PacketBuffer<P::Region>> {
        let mut state = self.lock();
        if let Some(buffer) = state.free.pop_front() {
            return Ok(buffer);
        }
        let region = self.pool.alloc_region(self.packet_size)?;
        state.allocated.insert(region.device_address(0));
        tracing::trace!(
            "New packet buffer {:#x} ({} total)",
            region.device_address(0),
            state.allocated.len()
        );
        Ok(PacketBuffer {
            region,
            owner: self.id,
        })
    }

    /// Return a buffer to the free list.
    ///
    /// # Errors
    ///
    /// Returns [`CndmError::InvalidHandle`] if the buffer was not allocated
    /// here. The rejected buffer is dropped.
    pub fn release(&self, buffer: PacketBuffer<P::Region>) -> Result<()> {
        let addr = buffer.device_address(0);
        let mut state = self.lock();
        if buffer.owner != self.id || !state.allocated.contains(&addr) {
            return Err(CndmError::InvalidHandle { addr });
        }
        state.free.push_back(buffer);
        Ok(())
    }

    /// Buffers on the free list.
    pub fn free_count(&self) -> usize {
        self.lock().free.len()
    }

    /// Buffers ever allocated.
    pub fn allocated_count(&self) -> usize {
        self.lock().allocated.len()
    }

    /// Buffers currently handed out.
    pub fn outstanding(&self) -> usize {
        let state = self.lock();
        state.allocated.len() - state.free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dma::HostMemoryPool;

    #[test]
    fn reuses_released_buffers() {
        let alloc = PacketAllocator::new(Arc::new(HostMemoryPool::new()), PACKET_SIZE);
        let a = alloc.allocate().unwrap();
        let addr = a.device_address(0);
        assert_eq!(a.len(), PACKET_SIZE);
        alloc.release(a).unwrap();
        assert_eq!(alloc.free_count(), 1);

        let b = alloc.allocate().unwrap();
        assert_eq!(b.device_address(0), addr);
        assert_eq!(alloc.allocated_count(), 1);
        assert_eq!(alloc.outstanding(), 1);
        alloc.release(b).unwrap();
        assert_eq!(alloc.outstanding(), 0);
    }

    #[test]
    fn never_shrinks() {
        let alloc = PacketAllocator::new(Arc::new(HostMemoryPool::new()), 256);
        let bufs: Vec<_> = (0..8).map(|_| alloc.allocate().unwrap()).collect();
        for b in bufs {
            alloc.release(b).unwrap();
        }
        assert_eq!(alloc.allocated_count(), 8);
        assert_eq!(alloc.free_count(), 8);
    }

    #[test]
    fn rejects_foreign_buffer() {
        let pool = Arc::new(HostMemoryPool::new());
        let a = PacketAllocator::new(pool.clone(), 256);
        let b = PacketAllocator::new(pool, 256);
        let buf = b.allocate().unwrap();
        let addr = buf.device_address(0);
        let err = a.release(buf).unwrap_err();
        assert!(matches!(err, CndmError::InvalidHandle { addr: got } if got == addr));
        assert_eq!(a.free_count(), 0);
    }

    #[test]
    fn buffer_contents() {
        let alloc = PacketAllocator::new(Arc::new(HostMemoryPool::new()), 64);
        let buf = alloc.allocate().unwrap();
        buf.write(10, b"hello");
        assert_eq!(&buf.to_vec(15)[10..], b"hello");
    }
}
