//! VFIO backend: a cndm NIC driven from user space.
//!
//! Linux VFIO provides everything the driver needs from a PCIe function:
//!
//! - BAR0 mapped into the process ([`MappedBar`])
//! - pinned, IOMMU-mapped DMA memory ([`DmaBuffer`] from [`VfioDmaPool`])
//! - PCI command register access through the config space region
//! - MSI-X vectors signalled through eventfds
//!
//! # Requirements
//!
//! 1. IOMMU enabled in BIOS and kernel (`intel_iommu=on` or `amd_iommu=on`)
//! 2. Device bound to `vfio-pci` (see [`bind_to_vfio`])
//! 3. User in `vfio` group or root permissions
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │   Driver    │────▶│  VFIO API   │────▶│   IOMMU     │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!        ▲                   │                   │
//!        │ eventfd           ▼                   ▼
//!  ┌─────────────┐    ┌─────────────┐     ┌─────────────┐
//!  │ IRQ threads │◀───│   MSI-X     │     │ DMA buffers │
//!  └─────────────┘    └─────────────┘     └─────────────┘
//! ```
//!
//! mmap/mlock/eventfd/pread go through rustix; the VFIO ioctls use libc.

// VFIO structs carry fixed-width u32/u64 fields.
#![allow(clippy::cast_possible_truncation)]

use std::alloc::Layout;
use std::fs::{File, OpenOptions};
use std::os::fd::{AsFd, FromRawFd, OwnedFd};
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use rustix::event::{eventfd, EventfdFlags};
use rustix::mm::{mlock, munlock};
use tokio::sync::mpsc;

use crate::device::{DmaRegion, IrqVectors, MemoryPool, PciFunction};
use crate::error::{CndmError, Result};
use crate::mmio::{self, MappedBar};

/// VFIO ioctl numbers: `_IO(';', 100 + n)`.
mod ioctls {
    use std::os::raw::c_ulong;

    const fn io(ty: u8, nr: u8) -> c_ulong {
        ((ty as c_ulong) << 8) | (nr as c_ulong)
    }

    pub const VFIO_TYPE: u8 = b';';
    pub const VFIO_BASE: u8 = 100;

    pub const VFIO_GET_API_VERSION: c_ulong = io(VFIO_TYPE, VFIO_BASE);
    pub const VFIO_CHECK_EXTENSION: c_ulong = io(VFIO_TYPE, VFIO_BASE + 1);
    pub const VFIO_SET_IOMMU: c_ulong = io(VFIO_TYPE, VFIO_BASE + 2);

    pub const VFIO_GROUP_GET_STATUS: c_ulong = io(VFIO_TYPE, VFIO_BASE + 3);
    pub const VFIO_GROUP_SET_CONTAINER: c_ulong = io(VFIO_TYPE, VFIO_BASE + 4);
    pub const VFIO_GROUP_GET_DEVICE_FD: c_ulong = io(VFIO_TYPE, VFIO_BASE + 6);

    pub const VFIO_DEVICE_GET_INFO: c_ulong = io(VFIO_TYPE, VFIO_BASE + 7);
    pub const VFIO_DEVICE_GET_IRQ_INFO: c_ulong = io(VFIO_TYPE, VFIO_BASE + 9);
    pub const VFIO_DEVICE_SET_IRQS: c_ulong = io(VFIO_TYPE, VFIO_BASE + 10);

    pub const VFIO_IOMMU_MAP_DMA: c_ulong = io(VFIO_TYPE, VFIO_BASE + 13);
    pub const VFIO_IOMMU_UNMAP_DMA: c_ulong = io(VFIO_TYPE, VFIO_BASE + 14);

    pub const VFIO_API_VERSION: i32 = 0;
    pub const VFIO_TYPE1V2_IOMMU: u32 = 3;

    pub const VFIO_GROUP_FLAGS_VIABLE: u32 = 1 << 0;

    pub const VFIO_DMA_MAP_FLAG_READ: u32 = 1 << 0;
    pub const VFIO_DMA_MAP_FLAG_WRITE: u32 = 1 << 1;

    pub const VFIO_IRQ_SET_DATA_NONE: u32 = 1 << 0;
    pub const VFIO_IRQ_SET_DATA_EVENTFD: u32 = 1 << 2;
    pub const VFIO_IRQ_SET_ACTION_TRIGGER: u32 = 1 << 5;

    pub const VFIO_PCI_MSIX_IRQ_INDEX: u32 = 2;
    pub const VFIO_PCI_CONFIG_REGION_INDEX: u32 = 7;
}

/// PCI command register and bits.
mod pci {
    pub const COMMAND: u64 = 0x04;
    pub const COMMAND_MEMORY: u16 = 0x0002;
    pub const COMMAND_MASTER: u16 = 0x0004;
}

/// First IOVA handed to DMA buffers.
pub const IOVA_BASE: u64 = 0x1_0000_0000;

const PAGE: usize = 4096;

#[repr(C)]
#[derive(Debug, Default)]
struct VfioDeviceInfo {
    argsz: u32,
    flags: u32,
    num_regions: u32,
    num_irqs: u32,
}

#[repr(C)]
#[derive(Debug, Default)]
struct VfioGroupStatus {
    argsz: u32,
    flags: u32,
}

#[repr(C)]
#[derive(Debug, Default)]
struct VfioDmaMap {
    argsz: u32,
    flags: u32,
    vaddr: u64,
    iova: u64,
    size: u64,
}

#[repr(C)]
#[derive(Debug, Default)]
struct VfioDmaUnmap {
    argsz: u32,
    flags: u32,
    iova: u64,
    size: u64,
}

#[repr(C)]
#[derive(Debug, Default)]
struct VfioIrqInfo {
    argsz: u32,
    flags: u32,
    index: u32,
    count: u32,
}

/// Header of `struct vfio_irq_set`; eventfds follow it as `i32`s.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct VfioIrqSet {
    argsz: u32,
    flags: u32,
    index: u32,
    start: u32,
    count: u32,
}

fn ioctl_error(what: &str) -> CndmError {
    CndmError::capability_query_failed(format!("{what}: {}", std::io::Error::last_os_error()))
}

// ── DMA memory ───────────────────────────────────────────────────────────────

/// Pinned host memory mapped into the device's IOVA space.
#[derive(Debug)]
pub struct DmaBuffer {
    vaddr: *mut u8,
    iova: u64,
    len: usize,
    layout: Layout,
    container: Arc<File>,
}

// SAFETY: DmaBuffer owns its allocation; the pointer is never shared
// outside of bounds-checked copies.
unsafe impl Send for DmaBuffer {}

// SAFETY: all access goes through `read`/`write`, which copy bytes in and
// out. Concurrent writers to the same bytes (host and device) are ordered
// by the ring protocol, not by Rust references.
unsafe impl Sync for DmaBuffer {}

impl DmaBuffer {
    fn new(container: Arc<File>, len: usize, iova: u64) -> Result<Self> {
        let size = len.div_ceil(PAGE) * PAGE;
        let layout = Layout::from_size_align(size, PAGE)
            .map_err(|e| CndmError::dma_failed(format!("Invalid DMA buffer layout: {e}")))?;

        // SAFETY: layout has a non-zero size (len > 0 is checked by the
        // pool) and a power-of-two alignment. Freed in Drop with the same
        // layout.
        let vaddr = unsafe { std::alloc::alloc_zeroed(layout) };
        if vaddr.is_null() {
            return Err(CndmError::dma_failed("Failed to allocate DMA buffer"));
        }

        // SAFETY: [vaddr, vaddr + size) is the allocation made above.
        if let Err(e) = unsafe { mlock(vaddr.cast(), size) } {
            // SAFETY: allocated above with `layout`, never handed out.
            unsafe { std::alloc::dealloc(vaddr, layout) };
            return Err(CndmError::dma_failed(format!("Failed to lock DMA memory: {e}")));
        }

        let map = VfioDmaMap {
            argsz: std::mem::size_of::<VfioDmaMap>() as u32,
            flags: ioctls::VFIO_DMA_MAP_FLAG_READ | ioctls::VFIO_DMA_MAP_FLAG_WRITE,
            vaddr: vaddr as u64,
            iova,
            size: size as u64,
        };

        // SAFETY: the container fd is open with a Type1v2 IOMMU set; `map`
        // describes the locked allocation above and matches the kernel's
        // vfio_iommu_type1_dma_map layout.
        let ret = unsafe {
            libc::ioctl(
                container.as_raw_fd(),
                ioctls::VFIO_IOMMU_MAP_DMA as _,
                &raw const map,
            )
        };
        if ret < 0 {
            let err = std::io::Error::last_os_error();
            // SAFETY: allocation and lock made above; undo both.
            unsafe {
                let _ = munlock(vaddr.cast(), size);
                std::alloc::dealloc(vaddr, layout);
            }
            return Err(CndmError::dma_failed(format!("Failed to map DMA: {err}")));
        }

        tracing::debug!("DMA buffer vaddr={vaddr:p} iova={iova:#x} size={size:#x}");
        Ok(Self {
            vaddr,
            iova,
            len,
            layout,
            container,
        })
    }
}

impl DmaRegion for DmaBuffer {
    fn len(&self) -> usize {
        self.len
    }

    fn device_address(&self, offset: usize) -> u64 {
        self.iova + offset as u64
    }

    fn read(&self, offset: usize, buf: &mut [u8]) {
        assert!(offset + buf.len() <= self.len, "DMA read out of bounds");
        // SAFETY: the range is inside the allocation (asserted above) and
        // `buf` is a distinct Rust allocation.
        unsafe {
            std::ptr::copy_nonoverlapping(self.vaddr.add(offset), buf.as_mut_ptr(), buf.len());
        }
    }

    fn write(&self, offset: usize, data: &[u8]) {
        assert!(offset + data.len() <= self.len, "DMA write out of bounds");
        // SAFETY: as in `read`.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.vaddr.add(offset), data.len());
        }
    }

    fn read_u32(&self, offset: usize) -> u32 {
        assert!(offset % 4 == 0 && offset + 4 <= self.len, "DMA word out of bounds");
        // SAFETY: aligned and in bounds; volatile because the device writes
        // this memory behind the compiler's back.
        u32::from_le(unsafe { std::ptr::read_volatile(self.vaddr.add(offset).cast::<u32>()) })
    }
}

impl Drop for DmaBuffer {
    fn drop(&mut self) {
        let size = self.layout.size();
        let unmap = VfioDmaUnmap {
            argsz: std::mem::size_of::<VfioDmaUnmap>() as u32,
            flags: 0,
            iova: self.iova,
            size: size as u64,
        };
        // SAFETY: unmaps exactly the IOVA range mapped in `new`, before the
        // memory behind it is released.
        unsafe {
            libc::ioctl(
                self.container.as_raw_fd(),
                ioctls::VFIO_IOMMU_UNMAP_DMA as _,
                &raw const unmap,
            );
        }
        // SAFETY: allocation, lock and layout all come from `new`; no
        // references into the buffer outlive `self`.
        unsafe {
            let _ = munlock(self.vaddr.cast(), size);
            std::alloc::dealloc(self.vaddr, self.layout);
        }
        tracing::trace!("Freed DMA buffer at iova={:#x}", self.iova);
    }
}

/// Bump allocator of IOVA space backed by [`DmaBuffer`]s.
#[derive(Debug)]
pub struct VfioDmaPool {
    container: Arc<File>,
    next_iova: AtomicU64,
}

impl MemoryPool for VfioDmaPool {
    type Region = DmaBuffer;

    fn alloc_region(&self, size: usize) -> Result<DmaBuffer> {
        if size == 0 {
            return Err(CndmError::dma_failed("zero-length region"));
        }
        let span = (size.div_ceil(PAGE) * PAGE) as u64;
        let iova = self.next_iova.fetch_add(span, Ordering::Relaxed);
        DmaBuffer::new(self.container.clone(), size, iova)
    }
}

// ── Interrupts ───────────────────────────────────────────────────────────────

/// One thread per MSI-X vector, blocked on the vector's eventfd.
#[derive(Debug)]
struct IrqWorkers {
    stop: Arc<AtomicBool>,
    fds: Vec<Arc<OwnedFd>>,
    threads: Vec<JoinHandle<()>>,
}

impl IrqWorkers {
    fn spawn(fds: Vec<OwnedFd>, events: &mpsc::UnboundedSender<u32>) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let fds: Vec<Arc<OwnedFd>> = fds.into_iter().map(Arc::new).collect();
        let mut threads = Vec::with_capacity(fds.len());
        for (vector, fd) in fds.iter().enumerate() {
            let (fd, stop, events) = (fd.clone(), stop.clone(), events.clone());
            let vector = vector as u32;
            let thread = std::thread::Builder::new()
                .name(format!("cndm-irq{vector}"))
                .spawn(move || {
                    let mut count = [0u8; 8];
                    loop {
                        if let Err(e) = rustix::io::read(fd.as_fd(), &mut count) {
                            tracing::warn!("IRQ {} eventfd read: {}", vector, e);
                            return;
                        }
                        if stop.load(Ordering::Acquire) || events.send(vector).is_err() {
                            return;
                        }
                    }
                })?;
            threads.push(thread);
        }
        Ok(Self { stop, fds, threads })
    }

    fn raw_fds(&self) -> Vec<i32> {
        self.fds.iter().map(|fd| fd.as_raw_fd()).collect()
    }
}

impl Drop for IrqWorkers {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        for fd in &self.fds {
            let _ = rustix::io::write(fd.as_fd(), &1u64.to_ne_bytes());
        }
        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }
    }
}

// ── Device ───────────────────────────────────────────────────────────────────

/// A cndm NIC bound to `vfio-pci`.
#[derive(Debug)]
pub struct VfioDevice {
    pcie_address: String,
    /// Kept open for the lifetime of the device fd.
    _group: File,
    device: File,
    config_offset: u64,
    num_irqs: u32,
    bar0: Arc<MappedBar>,
    pool: Arc<VfioDmaPool>,
    irqs: Mutex<Option<IrqWorkers>>,
}

impl VfioDevice {
    /// Open the VFIO device at `pcie_address` and map BAR0.
    ///
    /// # Errors
    ///
    /// Returns [`CndmError::CapabilityQueryFailed`] for any failing step:
    /// IOMMU group lookup, container/group setup, device fd, BAR mapping.
    pub fn open(pcie_address: &str) -> Result<Self> {
        tracing::info!("Opening VFIO device {pcie_address}");

        let group_id = iommu_group(pcie_address)?;
        tracing::debug!("IOMMU group: {group_id}");

        let container = OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/vfio/vfio")
            .map_err(|e| {
                CndmError::capability_query_failed(format!("Cannot open /dev/vfio/vfio: {e}"))
            })?;

        // SAFETY: argument-less ioctl on the open container fd.
        let api_version =
            unsafe { libc::ioctl(container.as_raw_fd(), ioctls::VFIO_GET_API_VERSION as _) };
        if api_version != ioctls::VFIO_API_VERSION {
            return Err(CndmError::capability_query_failed(format!(
                "Unsupported VFIO API version: {api_version}"
            )));
        }

        // SAFETY: integer-argument ioctl on the open container fd.
        let has_type1 = unsafe {
            libc::ioctl(
                container.as_raw_fd(),
                ioctls::VFIO_CHECK_EXTENSION as _,
                ioctls::VFIO_TYPE1V2_IOMMU,
            )
        };
        if has_type1 != 1 {
            return Err(CndmError::capability_query_failed(
                "VFIO Type1v2 IOMMU not supported",
            ));
        }

        let group_path = format!("/dev/vfio/{group_id}");
        let group = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&group_path)
            .map_err(|e| {
                CndmError::capability_query_failed(format!("Cannot open {group_path}: {e}"))
            })?;

        let mut status = VfioGroupStatus {
            argsz: std::mem::size_of::<VfioGroupStatus>() as u32,
            flags: 0,
        };
        // SAFETY: the kernel fills `status`, whose layout matches
        // vfio_group_status.
        let ret = unsafe {
            libc::ioctl(
                group.as_raw_fd(),
                ioctls::VFIO_GROUP_GET_STATUS as _,
                &raw mut status,
            )
        };
        if ret < 0 || status.flags & ioctls::VFIO_GROUP_FLAGS_VIABLE == 0 {
            return Err(CndmError::capability_query_failed(
                "VFIO group not viable (all devices must be bound to vfio-pci)",
            ));
        }

        // SAFETY: the kernel reads one fd from the pointer.
        let ret = unsafe {
            libc::ioctl(
                group.as_raw_fd(),
                ioctls::VFIO_GROUP_SET_CONTAINER as _,
                std::ptr::from_ref(&container.as_raw_fd()),
            )
        };
        if ret < 0 {
            return Err(ioctl_error("Failed to set container"));
        }

        // SAFETY: integer-argument ioctl; the group is attached.
        let ret = unsafe {
            libc::ioctl(
                container.as_raw_fd(),
                ioctls::VFIO_SET_IOMMU as _,
                ioctls::VFIO_TYPE1V2_IOMMU,
            )
        };
        if ret < 0 {
            return Err(ioctl_error("Failed to set IOMMU"));
        }

        let name = std::ffi::CString::new(pcie_address).map_err(|e| {
            CndmError::capability_query_failed(format!("Invalid PCIe address: {e}"))
        })?;
        // SAFETY: the kernel reads a NUL-terminated device name.
        let device_fd = unsafe {
            libc::ioctl(
                group.as_raw_fd(),
                ioctls::VFIO_GROUP_GET_DEVICE_FD as _,
                name.as_ptr(),
            )
        };
        if device_fd < 0 {
            return Err(ioctl_error("Failed to get device fd"));
        }
        // SAFETY: `device_fd` is a fresh fd returned by the kernel; File
        // takes sole ownership.
        let device = unsafe { File::from_raw_fd(device_fd) };

        let mut info = VfioDeviceInfo {
            argsz: std::mem::size_of::<VfioDeviceInfo>() as u32,
            ..Default::default()
        };
        // SAFETY: the kernel fills `info`, whose layout matches
        // vfio_device_info.
        let ret = unsafe {
            libc::ioctl(
                device.as_raw_fd(),
                ioctls::VFIO_DEVICE_GET_INFO as _,
                &raw mut info,
            )
        };
        if ret < 0 {
            return Err(ioctl_error("Failed to get device info"));
        }
        tracing::info!(
            "VFIO device: {} regions, {} IRQ types",
            info.num_regions,
            info.num_irqs
        );

        let config_offset =
            mmio::region_info(&device, ioctls::VFIO_PCI_CONFIG_REGION_INDEX)?.offset;
        let bar0 = Arc::new(MappedBar::vfio(&device, 0)?);
        let container = Arc::new(container);
        let pool = Arc::new(VfioDmaPool {
            container: container.clone(),
            next_iova: AtomicU64::new(IOVA_BASE),
        });

        Ok(Self {
            pcie_address: pcie_address.to_string(),
            _group: group,
            device,
            config_offset,
            num_irqs: info.num_irqs,
            bar0,
            pool,
            irqs: Mutex::new(None),
        })
    }

    /// PCIe address.
    #[must_use]
    pub fn pcie_address(&self) -> &str {
        &self.pcie_address
    }

    fn config_read16(&self, reg: u64) -> Result<u16> {
        let mut b = [0u8; 2];
        rustix::io::pread(self.device.as_fd(), &mut b, self.config_offset + reg)?;
        Ok(u16::from_le_bytes(b))
    }

    fn config_write16(&self, reg: u64, value: u16) -> Result<()> {
        rustix::io::pwrite(self.device.as_fd(), &value.to_le_bytes(), self.config_offset + reg)?;
        Ok(())
    }

    fn set_command_bits(&self, bits: u16) -> Result<()> {
        let command = self.config_read16(pci::COMMAND)?;
        if command & bits != bits {
            self.config_write16(pci::COMMAND, command | bits)?;
        }
        tracing::debug!("PCI command {:#06x} -> {:#06x}", command, command | bits);
        Ok(())
    }

    fn msix_count(&self) -> Result<u32> {
        if self.num_irqs <= ioctls::VFIO_PCI_MSIX_IRQ_INDEX {
            return Ok(0);
        }
        let mut info = VfioIrqInfo {
            argsz: std::mem::size_of::<VfioIrqInfo>() as u32,
            index: ioctls::VFIO_PCI_MSIX_IRQ_INDEX,
            ..Default::default()
        };
        // SAFETY: the kernel fills `info`, whose layout matches
        // vfio_irq_info.
        let ret = unsafe {
            libc::ioctl(
                self.device.as_raw_fd(),
                ioctls::VFIO_DEVICE_GET_IRQ_INFO as _,
                &raw mut info,
            )
        };
        if ret < 0 {
            return Err(ioctl_error("Failed to get MSI-X info"));
        }
        Ok(info.count)
    }

    fn set_irqs(&self, flags: u32, fds: &[i32]) -> Result<()> {
        let header = VfioIrqSet {
            argsz: (std::mem::size_of::<VfioIrqSet>() + std::mem::size_of_val(fds)) as u32,
            flags,
            index: ioctls::VFIO_PCI_MSIX_IRQ_INDEX,
            start: 0,
            count: fds.len() as u32,
        };
        let mut buf = Vec::with_capacity(header.argsz as usize);
        for word in [header.argsz, header.flags, header.index, header.start, header.count] {
            buf.extend_from_slice(&word.to_ne_bytes());
        }
        for fd in fds {
            buf.extend_from_slice(&fd.to_ne_bytes());
        }
        // SAFETY: `buf` is a vfio_irq_set header followed by `count` i32
        // eventfds, argsz bytes in total.
        let ret = unsafe {
            libc::ioctl(
                self.device.as_raw_fd(),
                ioctls::VFIO_DEVICE_SET_IRQS as _,
                buf.as_ptr(),
            )
        };
        if ret < 0 {
            return Err(ioctl_error("Failed to set MSI-X vectors"));
        }
        Ok(())
    }

    fn disable_irqs(&self) {
        let _ = self.set_irqs(
            ioctls::VFIO_IRQ_SET_DATA_NONE | ioctls::VFIO_IRQ_SET_ACTION_TRIGGER,
            &[],
        );
    }
}

impl Drop for VfioDevice {
    fn drop(&mut self) {
        let workers = self
            .irqs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if workers.is_some() {
            self.disable_irqs();
        }
        drop(workers);
        tracing::debug!("Closed VFIO device {}", self.pcie_address);
    }
}

impl PciFunction for VfioDevice {
    type Regs = MappedBar;
    type Pool = VfioDmaPool;

    async fn enable_device(&self) -> Result<()> {
        self.set_command_bits(pci::COMMAND_MEMORY)
    }

    async fn set_master(&self) -> Result<()> {
        self.set_command_bits(pci::COMMAND_MASTER)
    }

    async fn alloc_irq_vectors(&self, min: u32, max: u32) -> Result<IrqVectors> {
        let available = self.msix_count()?;
        let count = max.min(available);
        if count < min || count == 0 {
            return Err(CndmError::hardware_error(format!(
                "{min} MSI-X vectors requested, {available} available"
            )));
        }

        let fds = (0..count)
            .map(|_| eventfd(0, EventfdFlags::CLOEXEC))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let workers = IrqWorkers::spawn(fds, &tx)?;
        self.set_irqs(
            ioctls::VFIO_IRQ_SET_DATA_EVENTFD | ioctls::VFIO_IRQ_SET_ACTION_TRIGGER,
            &workers.raw_fds(),
        )?;
        tracing::info!("{count} MSI-X vectors wired to eventfds");

        let previous = self
            .irqs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(workers);
        drop(previous);
        Ok(IrqVectors { count, events: rx })
    }

    fn bar_window(&self, bar: u32) -> Result<Arc<MappedBar>> {
        if bar != 0 {
            return Err(CndmError::capability_query_failed(format!(
                "BAR{bar} is not used by the driver"
            )));
        }
        Ok(self.bar0.clone())
    }

    fn memory_pool(&self) -> Arc<VfioDmaPool> {
        self.pool.clone()
    }
}

// ── VFIO device binding helpers ───────────────────────────────────────────────

/// Bind a device to `vfio-pci` through `driver_override`.
///
/// Requires root or CAP_SYS_ADMIN.
///
/// # Errors
///
/// Returns an error if any sysfs write fails (usually permission denied).
pub fn bind_to_vfio(pcie_address: &str) -> Result<()> {
    use std::path::Path;

    tracing::info!("Binding {} to vfio-pci", pcie_address);
    let device = format!("/sys/bus/pci/devices/{pcie_address}");

    let driver_unbind = format!("{device}/driver/unbind");
    if Path::new(&driver_unbind).exists() {
        std::fs::write(&driver_unbind, pcie_address).map_err(|e| {
            CndmError::hardware_error(format!("Cannot unbind {pcie_address}: {e}"))
        })?;
        tracing::info!("Unbound from existing driver");
    }

    std::fs::write(format!("{device}/driver_override"), "vfio-pci")
        .map_err(|e| CndmError::hardware_error(format!("Cannot set driver_override: {e}")))?;
    std::fs::write("/sys/bus/pci/drivers_probe", pcie_address)
        .map_err(|e| CndmError::hardware_error(format!("Cannot rebind {pcie_address}: {e}")))?;

    tracing::info!("{pcie_address} bound to vfio-pci");
    Ok(())
}

/// Unbind from `vfio-pci` and let the kernel pick the native driver again.
///
/// # Errors
///
/// Returns an error if sysfs writes fail.
pub fn unbind_from_vfio(pcie_address: &str) -> Result<()> {
    let device = format!("/sys/bus/pci/devices/{pcie_address}");

    std::fs::write("/sys/bus/pci/drivers/vfio-pci/unbind", pcie_address)
        .map_err(|e| CndmError::hardware_error(format!("Cannot unbind from vfio-pci: {e}")))?;
    std::fs::write(format!("{device}/driver_override"), "\n")
        .map_err(|e| CndmError::hardware_error(format!("Cannot clear driver_override: {e}")))?;
    std::fs::write("/sys/bus/pci/drivers_probe", pcie_address)
        .map_err(|e| CndmError::hardware_error(format!("Cannot rebind {pcie_address}: {e}")))?;

    tracing::info!("{pcie_address} released from vfio-pci");
    Ok(())
}

/// Find the IOMMU group number for a PCIe device.
///
/// # Errors
///
/// Returns [`CndmError::CapabilityQueryFailed`] if the sysfs symlink cannot
/// be read or parsed.
pub fn iommu_group(pcie_address: &str) -> Result<u32> {
    let link = format!("/sys/bus/pci/devices/{pcie_address}/iommu_group");
    let target = std::fs::read_link(&link).map_err(|e| {
        CndmError::capability_query_failed(format!(
            "Cannot read IOMMU group for {pcie_address}: {e}. Is IOMMU enabled?"
        ))
    })?;

    let group = target
        .file_name()
        .and_then(|n| n.to_str())
        .and_then(|s| s.parse::<u32>().ok())
        .ok_or_else(|| {
            CndmError::capability_query_failed(format!("Cannot parse IOMMU group from {target:?}"))
        })?;

    tracing::debug!("{pcie_address} → IOMMU group {group}");
    Ok(group)
}
