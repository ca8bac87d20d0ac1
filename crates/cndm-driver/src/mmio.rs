//! Memory-mapped BAR access.
//!
//! A BAR can be mapped two ways: through the sysfs `resourceN` file of a
//! PCIe function (read-only inspection with the kernel driver unbound), or
//! through a VFIO device region (full driver operation). Both end up as a
//! [`MappedBar`] implementing [`RegisterWindow`].
//!
//! rustix covers mmap/munmap; libc is used only for the VFIO region ioctl.

// MMIO registers are naturally aligned by hardware, so pointer casts are safe
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_ptr_alignment)]

use std::fs::{File, OpenOptions};
use std::os::unix::io::{AsFd, AsRawFd};
use std::ptr::NonNull;

use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};

use crate::device::RegisterWindow;
use crate::error::{CndmError, Result};

/// VFIO region info structure
#[repr(C)]
#[derive(Debug, Default)]
pub struct VfioRegionInfo {
    /// Size of this structure (for versioning)
    pub argsz: u32,
    /// Region flags (capabilities, permissions)
    pub flags: u32,
    /// Region index (BAR number)
    pub index: u32,
    /// Offset to extended capabilities
    pub cap_offset: u32,
    /// Size of the region in bytes
    pub size: u64,
    /// Offset from the device fd start
    pub offset: u64,
}

// _IOWR(';', 100 + 8, ...)
pub(crate) const VFIO_DEVICE_GET_REGION_INFO: libc::c_ulong = 0xc018_3b68;

/// Query a VFIO device region.
///
/// # Errors
///
/// Returns [`CndmError::CapabilityQueryFailed`] if the ioctl fails.
pub fn region_info(device_fd: &File, index: u32) -> Result<VfioRegionInfo> {
    let mut info = VfioRegionInfo {
        argsz: std::mem::size_of::<VfioRegionInfo>() as u32,
        index,
        ..Default::default()
    };

    // SAFETY: VFIO_DEVICE_GET_REGION_INFO fills `info`. The fd is an open
    // VFIO device, argsz matches the repr(C) layout the kernel expects and
    // the pointer is valid for the duration of the call.
    let ret = unsafe {
        libc::ioctl(
            device_fd.as_raw_fd(),
            VFIO_DEVICE_GET_REGION_INFO,
            &raw mut info,
        )
    };
    if ret < 0 {
        return Err(CndmError::capability_query_failed(format!(
            "Failed to get region {index} info: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(info)
}

/// A mapped BAR.
pub struct MappedBar {
    ptr: NonNull<u8>,
    size: usize,
    bar: u32,
    _file: Option<File>,
}

impl std::fmt::Debug for MappedBar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedBar")
            .field("ptr", &format_args!("{:p}", self.ptr))
            .field("size", &self.size)
            .field("bar", &self.bar)
            .finish()
    }
}

// SAFETY: the mapping is process-wide and owned by this value; moving it
// between threads does not invalidate it.
unsafe impl Send for MappedBar {}

// SAFETY: all access is through bounds-checked volatile 32-bit loads and
// stores, which the device serializes. No Rust references into the mapping
// are ever handed out.
unsafe impl Sync for MappedBar {}

impl MappedBar {
    /// Map BAR `bar` of the function at `pcie_address` through sysfs.
    ///
    /// # Errors
    ///
    /// Returns an error if the resource file cannot be opened, is empty, or
    /// cannot be mapped.
    pub fn sysfs(pcie_address: &str, bar: u32) -> Result<Self> {
        let path = format!("/sys/bus/pci/devices/{pcie_address}/resource{bar}");
        tracing::debug!("Mapping PCIe BAR: {path}");

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| {
                CndmError::capability_query_failed(format!(
                    "Cannot open {path}: {e}. Is device enabled?"
                ))
            })?;

        let size = file
            .metadata()
            .map_err(|e| CndmError::capability_query_failed(format!("Cannot stat BAR: {e}")))?
            .len() as usize;
        if size == 0 {
            return Err(CndmError::capability_query_failed(
                "BAR size is 0 (device not enabled?)",
            ));
        }

        let ptr = map(&file, size, 0, bar)?;
        Ok(Self {
            ptr,
            size,
            bar,
            _file: Some(file),
        })
    }

    /// Map BAR `bar` of an open VFIO device.
    ///
    /// # Errors
    ///
    /// Returns an error if the region query or the mapping fails.
    pub fn vfio(device_fd: &File, bar: u32) -> Result<Self> {
        let info = region_info(device_fd, bar)?;
        tracing::debug!(
            "BAR{}: size={:#x}, offset={:#x}, flags={:#x}",
            bar,
            info.size,
            info.offset,
            info.flags
        );
        if info.size == 0 {
            return Err(CndmError::capability_query_failed(format!(
                "BAR{bar} not implemented"
            )));
        }
        let size = info.size as usize;
        let ptr = map(device_fd, size, info.offset, bar)?;
        Ok(Self {
            ptr,
            size,
            bar,
            _file: None,
        })
    }

    /// BAR index.
    #[must_use]
    pub const fn bar(&self) -> u32 {
        self.bar
    }

    /// Mapping size in bytes.
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    fn check(&self, offset: u32) -> Result<usize> {
        let at = offset as usize;
        if at % 4 != 0 || at + 4 > self.size {
            return Err(CndmError::hardware_error(format!(
                "Register {offset:#x} outside BAR{} ({:#x} bytes)",
                self.bar, self.size
            )));
        }
        Ok(at)
    }

    /// Read the register at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`CndmError::HardwareError`] for an unaligned or out-of-range
    /// offset.
    pub fn read32(&self, offset: u32) -> Result<u32> {
        let at = self.check(offset)?;
        // SAFETY: `at + 4 <= size` and `at` is 4-byte aligned within a
        // page-aligned mapping that lives as long as `self`. Volatile
        // because the device changes register contents.
        Ok(unsafe { std::ptr::read_volatile(self.ptr.as_ptr().add(at).cast::<u32>()) })
    }

    /// Write the register at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`CndmError::HardwareError`] for an unaligned or out-of-range
    /// offset.
    pub fn write32(&self, offset: u32, value: u32) -> Result<()> {
        let at = self.check(offset)?;
        // SAFETY: as in `read32`. Volatile because the store has device
        // side effects.
        unsafe { std::ptr::write_volatile(self.ptr.as_ptr().add(at).cast::<u32>(), value) };
        Ok(())
    }
}

fn map(fd: &File, size: usize, offset: u64, bar: u32) -> Result<NonNull<u8>> {
    // SAFETY: maps `size` bytes of an open BAR file / VFIO device region at
    // the offset the kernel reported. The mapping is unmapped exactly once
    // in Drop.
    let ptr = unsafe {
        mmap(
            std::ptr::null_mut(),
            size,
            ProtFlags::READ | ProtFlags::WRITE,
            MapFlags::SHARED,
            fd.as_fd(),
            offset,
        )
    }
    .map_err(|e| CndmError::capability_query_failed(format!("Failed to mmap BAR{bar}: {e}")))?;

    tracing::info!("Mapped BAR{} at {:p}, size={:#x}", bar, ptr, size);
    NonNull::new(ptr.cast::<u8>())
        .ok_or_else(|| CndmError::capability_query_failed("mmap returned null"))
}

impl Drop for MappedBar {
    fn drop(&mut self) {
        // SAFETY: ptr/size are exactly the mapping created in `map`; no
        // references into it outlive `self`.
        unsafe {
            let _ = munmap(self.ptr.as_ptr().cast(), self.size);
        }
        tracing::debug!("Unmapped BAR{}", self.bar);
    }
}

impl RegisterWindow for MappedBar {
    async fn read_dword(&self, offset: u32) -> Result<u32> {
        self.read32(offset)
    }

    async fn write_dword(&self, offset: u32, value: u32) -> Result<()> {
        self.write32(offset, value)
    }
}
