//! Collaborator interfaces.
//!
//! The driver talks to hardware through three seams:
//!
//! ```text
//!   PciFunction ── enable / bus master / IRQ vectors
//!      ├── bar_window(0) ──▶ RegisterWindow   (32-bit MMIO, async)
//!      └── memory_pool() ──▶ MemoryPool ──▶ DmaRegion (host memory the
//!                                           device reaches by address)
//! ```
//!
//! [`crate::sim::SimDevice`] implements them in software,
//! [`crate::vfio::VfioDevice`] on a VFIO-bound PCIe function.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::error::Result;

/// 32-bit register window (a PCIe BAR).
///
/// Every access is a suspension point.
pub trait RegisterWindow: Send + Sync + 'static {
    /// Read the register at `offset`.
    fn read_dword(&self, offset: u32) -> impl Future<Output = Result<u32>> + Send;

    /// Write `value` to the register at `offset`.
    fn write_dword(&self, offset: u32, value: u32) -> impl Future<Output = Result<()>> + Send;
}

/// Host memory reachable by the device.
///
/// Accesses are synchronous: the memory is local, only the device side is
/// remote. Offsets are relative to the region start.
pub trait DmaRegion: Send + Sync + 'static {
    /// Region length in bytes.
    fn len(&self) -> usize;

    /// `true` for a zero-length region.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Device address of byte `offset`.
    fn device_address(&self, offset: usize) -> u64;

    /// Copy `buf.len()` bytes starting at `offset` into `buf`.
    ///
    /// # Panics
    ///
    /// Panics if the range exceeds the region.
    fn read(&self, offset: usize, buf: &mut [u8]);

    /// Copy `data` into the region starting at `offset`.
    ///
    /// # Panics
    ///
    /// Panics if the range exceeds the region.
    fn write(&self, offset: usize, data: &[u8]);

    /// Little-endian word at `offset`.
    fn read_u32(&self, offset: usize) -> u32 {
        let mut b = [0u8; 4];
        self.read(offset, &mut b);
        u32::from_le_bytes(b)
    }
}

/// Allocator of zero-filled DMA regions. Never suspends.
pub trait MemoryPool: Send + Sync + 'static {
    /// Region handle.
    type Region: DmaRegion;

    /// Allocate a zeroed region of `size` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`crate::CndmError::DmaFailed`] when memory cannot be
    /// allocated or mapped for the device.
    fn alloc_region(&self, size: usize) -> Result<Self::Region>;
}

/// Interrupt vectors granted to the driver.
#[derive(Debug)]
pub struct IrqVectors {
    /// Number of vectors granted.
    pub count: u32,
    /// Vector numbers as they fire.
    pub events: mpsc::UnboundedReceiver<u32>,
}

/// A PCIe function hosting a cndm NIC.
pub trait PciFunction: Send + Sync + 'static {
    /// Register window type.
    type Regs: RegisterWindow;
    /// Memory pool type.
    type Pool: MemoryPool;

    /// Enable memory decoding.
    fn enable_device(&self) -> impl Future<Output = Result<()>> + Send;

    /// Allow the function to master the bus (issue DMA).
    fn set_master(&self) -> impl Future<Output = Result<()>> + Send;

    /// Allocate between `min` and `max` interrupt vectors.
    fn alloc_irq_vectors(
        &self,
        min: u32,
        max: u32,
    ) -> impl Future<Output = Result<IrqVectors>> + Send;

    /// Register window of BAR `bar`.
    ///
    /// # Errors
    ///
    /// Fails when the BAR does not exist or cannot be mapped.
    fn bar_window(&self, bar: u32) -> Result<Arc<Self::Regs>>;

    /// Pool the driver allocates rings and packet buffers from.
    fn memory_pool(&self) -> Arc<Self::Pool>;
}
