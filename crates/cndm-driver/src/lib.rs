//! User-space driver for cndm NICs.
//!
//! A cndm function exposes a mailbox for queue management commands and, per
//! port, one receive and one transmit queue pair. Each work queue posts
//! 16-byte descriptors; each completion queue reports them back with a phase
//! bit that flips on every pass around the ring.
//!
//! # Layout
//!
//! ```text
//! Driver ── PortTable (BAR0 config registers)
//!   ├── CommandChannel   mailbox, one command at a time
//!   ├── PacketAllocator  fixed-size DMA buffers, shared by all ports
//!   ├── PhcClock         PTP hardware clock (optional)
//!   └── Port × N
//!         ├── RX: RQ 0 ──▶ CQ 0 ──▶ recv()
//!         └── TX: start_xmit() ──▶ SQ 0 ──▶ CQ 1
//! ```
//!
//! Hardware is reached through the [`device`] traits. Two implementations
//! ship with the crate:
//!
//! ```text
//!   SimDevice   — software model of the NIC (tests, selftest, loopback)
//!   VfioDevice  — a real function bound to vfio-pci
//! ```
//!
//! # Quick start
//!
//! ```no_run
//! use cndm_driver::prelude::*;
//!
//! # async fn run() -> cndm_driver::Result<()> {
//! let sim = SimDevice::new(SimConfig::default());
//! let driver = Driver::init(sim, DriverConfig::default()).await?;
//!
//! let port = driver.port(0)?;
//! port.start_xmit(&[0u8; 60]).await?;
//! let frame = port.recv().await?;
//! assert_eq!(frame.len(), 60);
//!
//! driver.shutdown().await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]

pub mod cmd;
pub mod config;
pub mod device;
pub mod dma;
pub mod driver;
mod error;
pub mod mmio;
pub mod pkt;
pub mod port;
pub mod ptp;
mod ring;
pub mod sim;
pub mod vfio;

pub use cmd::CommandChannel;
pub use config::{DriverConfig, MailboxConfig};
pub use device::{DmaRegion, IrqVectors, MemoryPool, PciFunction, RegisterWindow};
pub use dma::HostMemoryPool;
pub use driver::{DevicePort, Driver, PortTable};
pub use error::{CndmError, Result};
pub use mmio::MappedBar;
pub use pkt::{PacketAllocator, PacketBuffer};
pub use port::{Port, PortStats, RxFrame};
pub use ptp::{HwTimestamp, PhcClock};
pub use sim::{LinkMode, SimConfig, SimDevice};
pub use vfio::VfioDevice;

/// Command and ring formats (re-exported from cndm-chip).
pub mod chip {
    pub use cndm_chip::cmd::{Command, Opcode, QueueKind, Reply, Response};
    pub use cndm_chip::ring::RingGeometry;
}

/// Commonly used types.
pub mod prelude {
    pub use crate::chip::{Command, Opcode, QueueKind};
    pub use crate::{
        CndmError, Driver, DriverConfig, HwTimestamp, LinkMode, MailboxConfig, PciFunction, Port,
        Result, RxFrame, SimConfig, SimDevice, VfioDevice,
    };
}
