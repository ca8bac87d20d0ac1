//! Host memory pool.
//!
//! Regions live in ordinary heap memory and receive synthetic device
//! addresses from a bump allocator. The pool keeps an address map so a
//! device model can reach region contents by device address, the way a bus
//! master reaches host memory through the root complex.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::device::{DmaRegion, MemoryPool};
use crate::error::{CndmError, Result};

/// First device address handed out.
pub const HOST_BASE_ADDRESS: u64 = 0x1_0000_0000;

/// Region alignment.
pub const REGION_ALIGN: u64 = 4096;

#[derive(Debug)]
struct Memory {
    base: u64,
    bytes: Mutex<Box<[u8]>>,
}

impl Memory {
    fn lock(&self) -> MutexGuard<'_, Box<[u8]>> {
        self.bytes.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug)]
struct PoolState {
    next: u64,
    regions: BTreeMap<u64, Weak<Memory>>,
}

#[derive(Debug)]
struct PoolInner {
    state: Mutex<PoolState>,
}

impl PoolInner {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Pool of heap-backed DMA regions.
#[derive(Debug, Clone)]
pub struct HostMemoryPool {
    inner: Arc<PoolInner>,
}

impl Default for HostMemoryPool {
    fn default() -> Self {
        Self::new()
    }
}

impl HostMemoryPool {
    /// Empty pool.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState {
                    next: HOST_BASE_ADDRESS,
                    regions: BTreeMap::new(),
                }),
            }),
        }
    }

    /// Live regions.
    #[must_use]
    pub fn region_count(&self) -> usize {
        self.inner.lock().regions.len()
    }

    fn resolve(&self, addr: u64, len: usize) -> Result<(Arc<Memory>, usize)> {
        let memory = {
            let state = self.inner.lock();
            state
                .regions
                .range(..=addr)
                .next_back()
                .and_then(|(_, weak)| weak.upgrade())
        };
        let fault = || CndmError::hardware_error(format!("DMA to unmapped address {addr:#x}+{len}"));
        let memory = memory.ok_or_else(fault)?;
        let offset = usize::try_from(addr - memory.base).map_err(|_| fault())?;
        let end = offset.checked_add(len).ok_or_else(fault)?;
        if end > memory.lock().len() {
            return Err(fault());
        }
        Ok((memory, offset))
    }

    /// Read host memory by device address (device side).
    ///
    /// # Errors
    ///
    /// Returns [`CndmError::HardwareError`] if the range is not inside one
    /// live region.
    pub fn dma_read(&self, addr: u64, buf: &mut [u8]) -> Result<()> {
        let (memory, offset) = self.resolve(addr, buf.len())?;
        buf.copy_from_slice(&memory.lock()[offset..offset + buf.len()]);
        Ok(())
    }

    /// Write host memory by device address (device side).
    ///
    /// # Errors
    ///
    /// Returns [`CndmError::HardwareError`] if the range is not inside one
    /// live region.
    pub fn dma_write(&self, addr: u64, data: &[u8]) -> Result<()> {
        let (memory, offset) = self.resolve(addr, data.len())?;
        memory.lock()[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }
}

impl MemoryPool for HostMemoryPool {
    type Region = HostRegion;

    fn alloc_region(&self, size: usize) -> Result<HostRegion> {
        if size == 0 {
            return Err(CndmError::dma_failed("zero-length region"));
        }
        let span = u64::try_from(size)
            .ok()
            .and_then(|s| s.checked_next_multiple_of(REGION_ALIGN))
            .ok_or_else(|| CndmError::dma_failed(format!("region of {size} bytes too large")))?;

        let mut state = self.inner.lock();
        let base = state.next;
        state.next = base
            .checked_add(span)
            .ok_or_else(|| CndmError::dma_failed("device address space exhausted"))?;
        let memory = Arc::new(Memory {
            base,
            bytes: Mutex::new(vec![0u8; size].into_boxed_slice()),
        });
        state.regions.insert(base, Arc::downgrade(&memory));
        drop(state);

        tracing::trace!("Allocated host region {:#x}+{:#x}", base, size);
        Ok(HostRegion {
            memory,
            pool: Arc::downgrade(&self.inner),
        })
    }
}

/// A heap-backed DMA region. Unmapped from the pool on drop.
#[derive(Debug)]
pub struct HostRegion {
    memory: Arc<Memory>,
    pool: Weak<PoolInner>,
}

impl DmaRegion for HostRegion {
    fn len(&self) -> usize {
        self.memory.lock().len()
    }

    fn device_address(&self, offset: usize) -> u64 {
        self.memory.base + offset as u64
    }

    fn read(&self, offset: usize, buf: &mut [u8]) {
        buf.copy_from_slice(&self.memory.lock()[offset..offset + buf.len()]);
    }

    fn write(&self, offset: usize, data: &[u8]) {
        self.memory.lock()[offset..offset + data.len()].copy_from_slice(data);
    }
}

impl Drop for HostRegion {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.upgrade() {
            pool.lock().regions.remove(&self.memory.base);
        }
    }
}
