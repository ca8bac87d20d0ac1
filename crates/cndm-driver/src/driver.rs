//! Driver: device bring-up, ports and interrupt routing.

use std::sync::{Arc, Mutex, PoisonError};

use cndm_chip::regs;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cmd::CommandChannel;
use crate::config::DriverConfig;
use crate::device::{MemoryPool, PciFunction, RegisterWindow};
use crate::error::{CndmError, Result};
use crate::pkt::{PacketAllocator, PacketBuffer};
use crate::port::Port;
use crate::ptp::PhcClock;

/// Largest port count accepted from the device.
pub const MAX_PORTS: u32 = 256;

/// Port register table advertised by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortTable {
    /// Number of ports
    pub count: u32,
    /// Offset of the first per-port block
    pub offset: u32,
    /// Stride between per-port blocks
    pub stride: u32,
}

impl PortTable {
    /// Read the config registers.
    ///
    /// # Errors
    ///
    /// Register access errors, or [`CndmError::CapabilityQueryFailed`] for a
    /// port count above [`MAX_PORTS`].
    pub async fn read<R: RegisterWindow>(regs: &R) -> Result<Self> {
        let table = Self {
            count: regs.read_dword(regs::PORT_COUNT).await?,
            offset: regs.read_dword(regs::PORT_OFFSET).await?,
            stride: regs.read_dword(regs::PORT_STRIDE).await?,
        };
        info!("Port count: {}", table.count);
        info!("Port offset: {:#x}", table.offset);
        info!("Port stride: {:#x}", table.stride);
        if table.count > MAX_PORTS {
            return Err(CndmError::capability_query_failed(format!(
                "device reports {} ports (max {MAX_PORTS})",
                table.count
            )));
        }
        Ok(table)
    }
}

/// Port handle type of a driver over `D`.
pub type DevicePort<D> = Port<<D as PciFunction>::Regs, <D as PciFunction>::Pool>;

type Routes<D> = Arc<Vec<Vec<Arc<DevicePort<D>>>>>;

/// A running cndm NIC.
pub struct Driver<D: PciFunction> {
    device: Arc<D>,
    config: DriverConfig,
    commands: Arc<CommandChannel<D::Regs>>,
    packets: Arc<PacketAllocator<D::Pool>>,
    ports: Vec<Arc<DevicePort<D>>>,
    routes: Routes<D>,
    port_table: PortTable,
    phc: Option<Arc<PhcClock<D::Regs>>>,
    irq_task: Mutex<Option<JoinHandle<()>>>,
}

impl<D: PciFunction> std::fmt::Debug for Driver<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Driver")
            .field("port_table", &self.port_table)
            .field("irq_vectors", &self.routes.len())
            .field("packets", &self.packets)
            .finish_non_exhaustive()
    }
}

impl<D: PciFunction> Driver<D> {
    /// Bring up the device: enable, bus master, IRQ vectors, BAR0, port
    /// table, PTP clock (set from the system clock), then create and
    /// initialize every port.
    ///
    /// Must be called from within a Tokio runtime; interrupt dispatch runs
    /// as a spawned task.
    ///
    /// # Errors
    ///
    /// [`CndmError::InvalidConfig`] before touching the device, then the
    /// first failing bring-up step. Ports already up are shut down again.
    pub async fn init(device: D, config: DriverConfig) -> Result<Self> {
        config.validate()?;
        let device = Arc::new(device);

        device.enable_device().await?;
        device.set_master().await?;
        let irqs = device
            .alloc_irq_vectors(*config.irq_vectors.start(), *config.irq_vectors.end())
            .await?;
        let min = *config.irq_vectors.start();
        if irqs.count == 0 || irqs.count < min {
            return Err(CndmError::hardware_error(format!(
                "function granted {} interrupt vectors, {min} required",
                irqs.count
            )));
        }
        info!("Allocated {} interrupt vectors", irqs.count);

        let regs = device.bar_window(0)?;
        let pool = device.memory_pool();
        let commands = Arc::new(CommandChannel::new(regs.clone(), config.mailbox));
        let packets = Arc::new(PacketAllocator::new(pool.clone(), config.packet_size));

        let port_table = PortTable::read(regs.as_ref()).await?;

        let phc = match config.phc_offset {
            Some(base) => {
                let clock = PhcClock::new(regs.clone(), base);
                clock.set_from_system_clock().await?;
                Some(Arc::new(clock))
            }
            None => {
                debug!("No PTP hardware clock");
                None
            }
        };

        let mut ports: Vec<Arc<DevicePort<D>>> = Vec::with_capacity(port_table.count as usize);
        for k in 0..port_table.count {
            let result = async {
                let port = Port::new(
                    k,
                    regs.clone(),
                    commands.clone(),
                    packets.clone(),
                    pool.as_ref(),
                    phc.clone(),
                    &config,
                )?;
                port.init().await?;
                Ok::<_, CndmError>(port)
            }
            .await;
            match result {
                Ok(port) => ports.push(Arc::new(port)),
                Err(e) => {
                    error!("Port {} failed to initialize: {}", k, e);
                    for port in &ports {
                        if let Err(e) = port.shutdown().await {
                            warn!("Port {} teardown: {}", port.index(), e);
                        }
                    }
                    return Err(e);
                }
            }
        }

        let mut routes = vec![Vec::new(); irqs.count as usize];
        for port in &ports {
            let vector = port.index() % irqs.count;
            routes[vector as usize].push(port.clone());
            debug!("Port {} on vector {}", port.index(), vector);
        }
        let routes: Routes<D> = Arc::new(routes);
        let irq_task = tokio::spawn(dispatch_loop::<D>(routes.clone(), irqs.events));

        info!("cndm up with {} ports", ports.len());
        Ok(Self {
            device,
            config,
            commands,
            packets,
            ports,
            routes,
            port_table,
            phc,
            irq_task: Mutex::new(Some(irq_task)),
        })
    }

    /// The PCIe function.
    pub fn device(&self) -> &D {
        &self.device
    }

    /// Configuration in effect.
    pub const fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Mailbox.
    pub fn commands(&self) -> &CommandChannel<D::Regs> {
        &self.commands
    }

    /// Shared packet allocator.
    pub fn packets(&self) -> &PacketAllocator<D::Pool> {
        &self.packets
    }

    /// Config registers read at init.
    pub const fn port_table(&self) -> PortTable {
        self.port_table
    }

    /// PTP hardware clock, when configured.
    pub fn phc(&self) -> Option<&PhcClock<D::Regs>> {
        self.phc.as_deref()
    }

    /// Number of ports.
    pub fn port_count(&self) -> usize {
        self.ports.len()
    }

    /// All ports by index.
    pub fn ports(&self) -> &[Arc<DevicePort<D>>] {
        &self.ports
    }

    /// Port `index`.
    ///
    /// # Errors
    ///
    /// [`CndmError::InvalidPort`] when out of range.
    pub fn port(&self, index: usize) -> Result<&Arc<DevicePort<D>>> {
        self.ports.get(index).ok_or(CndmError::InvalidPort {
            index,
            count: self.ports.len(),
        })
    }

    /// Allocate a packet buffer.
    ///
    /// # Errors
    ///
    /// [`CndmError::DmaFailed`] when the pool is exhausted.
    pub fn alloc_pkt(&self) -> Result<PacketBuffer<<D::Pool as MemoryPool>::Region>> {
        self.packets.allocate()
    }

    /// Return a packet buffer.
    ///
    /// # Errors
    ///
    /// [`CndmError::InvalidHandle`] for a buffer from another driver.
    pub fn free_pkt(&self, buffer: PacketBuffer<<D::Pool as MemoryPool>::Region>) -> Result<()> {
        self.packets.release(buffer)
    }

    /// Run the interrupt handler of every port on `vector`.
    pub async fn dispatch_interrupt(&self, vector: u32) {
        dispatch(&self.routes, vector).await;
    }

    /// Stop interrupt dispatch and shut down every port.
    ///
    /// # Errors
    ///
    /// The first port teardown error; every port is still shut down.
    pub async fn shutdown(&self) -> Result<()> {
        self.stop_irq_task();
        let mut first_error = None;
        for port in &self.ports {
            if let Err(e) = port.shutdown().await {
                first_error.get_or_insert(e);
            }
        }
        info!(
            "cndm down, {} packet buffers outstanding",
            self.packets.outstanding()
        );
        first_error.map_or(Ok(()), Err)
    }

    fn stop_irq_task(&self) {
        let task = self
            .irq_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }
}

impl<D: PciFunction> Drop for Driver<D> {
    fn drop(&mut self) {
        self.stop_irq_task();
    }
}

async fn dispatch_loop<D: PciFunction>(routes: Routes<D>, mut events: mpsc::UnboundedReceiver<u32>) {
    while let Some(vector) = events.recv().await {
        dispatch(&routes, vector).await;
    }
    debug!("Interrupt source closed");
}

async fn dispatch<R: RegisterWindow, P: MemoryPool>(routes: &[Vec<Arc<Port<R, P>>>], vector: u32) {
    let Some(ports) = routes.get(vector as usize) else {
        warn!("Interrupt on unknown vector {}", vector);
        return;
    };
    for port in ports {
        debug!("Interrupt: vector {} port {}", vector, port.index());
        if let Err(e) = port.interrupt_handler().await {
            error!("Port {} interrupt handler: {}", port.index(), e);
        }
    }
}
