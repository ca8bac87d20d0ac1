//! Port: one RX and one TX queue pair.
//!
//! ```text
//!            start_xmit                        recv / recv_frame
//!                │                                   ▲
//!   TX ring ─────┘ (doorbell)          RX frame FIFO ┘
//!   TX CQ   ──▶ process_tx_cq        RX CQ ──▶ process_rx_cq ──▶ refill
//! ```
//!
//! RX and TX state sit behind separate async mutexes, so transmit and
//! receive processing only contend on the shared packet allocator.
//!
//! Received frames carry the completion timestamp, widened to full seconds
//! through the PTP clock when the device has one.

use std::sync::atomic::{fence, AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use cndm_chip::cmd::{Command, QueueKind, Reply};
use cndm_chip::desc::{Completion, Descriptor};
use cndm_chip::regs::DOORBELL_MASK;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

use crate::cmd::CommandChannel;
use crate::config::DriverConfig;
use crate::device::{MemoryPool, RegisterWindow};
use crate::error::{CndmError, Result};
use crate::pkt::{PacketAllocator, PacketBuffer};
use crate::ptp::{HwTimestamp, PhcClock, TimestampExtender};
use crate::ring::{CplRing, DescRing};

/// Completion queue serving the RX ring.
pub const RX_CQN: u32 = 0;
/// Completion queue serving the TX ring.
pub const TX_CQN: u32 = 1;
/// Receive queue number.
pub const RQN: u32 = 0;
/// Send queue number.
pub const SQN: u32 = 0;

type Slot<P> = Option<PacketBuffer<<P as MemoryPool>::Region>>;

/// Which queues the device currently holds for this port.
#[derive(Debug, Default, Clone, Copy)]
struct Created {
    cq: bool,
    wq: bool,
}

struct RxPath<P: MemoryPool> {
    ring: DescRing<P::Region>,
    cq: CplRing<P::Region>,
    info: Vec<Slot<P>>,
    doorbell: u32,
    created: Created,
    active: bool,
    stamps: TimestampExtender,
    deliver: Option<mpsc::UnboundedSender<RxFrame>>,
}

struct TxPath<P: MemoryPool> {
    ring: DescRing<P::Region>,
    cq: CplRing<P::Region>,
    info: Vec<Slot<P>>,
    doorbell: u32,
    created: Created,
    active: bool,
}

/// A received frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RxFrame {
    /// Payload, clamped to the buffer length
    pub data: Bytes,
    /// Hardware receive time, when RX timestamping is on
    pub timestamp: Option<HwTimestamp>,
}

/// Traffic counters of one port.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortStats {
    /// Frames posted for transmit
    pub tx_packets: u64,
    /// Payload bytes posted for transmit
    pub tx_bytes: u64,
    /// Frames received
    pub rx_packets: u64,
    /// Payload bytes received (after clamping)
    pub rx_bytes: u64,
    /// `start_xmit` calls rejected with `QueueFull`
    pub tx_queue_full: u64,
    /// RX completions longer than their buffer
    pub rx_truncated: u64,
}

#[derive(Debug, Default)]
struct Counters {
    tx_packets: AtomicU64,
    tx_bytes: AtomicU64,
    rx_packets: AtomicU64,
    rx_bytes: AtomicU64,
    tx_queue_full: AtomicU64,
    rx_truncated: AtomicU64,
}

impl Counters {
    fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    fn snapshot(&self) -> PortStats {
        PortStats {
            tx_packets: self.tx_packets.load(Ordering::Relaxed),
            tx_bytes: self.tx_bytes.load(Ordering::Relaxed),
            rx_packets: self.rx_packets.load(Ordering::Relaxed),
            rx_bytes: self.rx_bytes.load(Ordering::Relaxed),
            tx_queue_full: self.tx_queue_full.load(Ordering::Relaxed),
            rx_truncated: self.rx_truncated.load(Ordering::Relaxed),
        }
    }
}

/// A NIC port.
pub struct Port<R: RegisterWindow, P: MemoryPool> {
    index: u32,
    regs: Arc<R>,
    commands: Arc<CommandChannel<R>>,
    packets: Arc<PacketAllocator<P>>,
    headroom: usize,
    max_payload: usize,
    low_water: u32,
    phc: Option<Arc<PhcClock<R>>>,
    rx_timestamps: AtomicBool,
    rx: Mutex<RxPath<P>>,
    tx: Mutex<TxPath<P>>,
    received: Mutex<mpsc::UnboundedReceiver<RxFrame>>,
    counters: Counters,
}

impl<R: RegisterWindow, P: MemoryPool> std::fmt::Debug for Port<R, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Port")
            .field("index", &self.index)
            .field("stats", &self.counters.snapshot())
            .finish_non_exhaustive()
    }
}

impl<R: RegisterWindow, P: MemoryPool> Port<R, P> {
    /// Allocate the rings of port `index`. No device access happens until
    /// [`Self::init`]. `phc` widens RX timestamps to full seconds.
    ///
    /// # Errors
    ///
    /// Returns [`CndmError::InvalidConfig`] for a bad ring size and
    /// [`CndmError::DmaFailed`] if ring memory cannot be allocated.
    pub fn new(
        index: u32,
        regs: Arc<R>,
        commands: Arc<CommandChannel<R>>,
        packets: Arc<PacketAllocator<P>>,
        pool: &P,
        phc: Option<Arc<PhcClock<R>>>,
        config: &DriverConfig,
    ) -> Result<Self> {
        let rx_geometry = config.rx_ring()?;
        let tx_geometry = config.tx_ring()?;
        let (deliver, received) = mpsc::unbounded_channel();

        let rx = RxPath {
            ring: DescRing::alloc(pool, rx_geometry)?,
            cq: CplRing::alloc(pool, rx_geometry)?,
            info: (0..rx_geometry.size()).map(|_| None).collect(),
            doorbell: 0,
            created: Created::default(),
            active: false,
            stamps: TimestampExtender::default(),
            deliver: Some(deliver),
        };
        let tx = TxPath {
            ring: DescRing::alloc(pool, tx_geometry)?,
            cq: CplRing::alloc(pool, tx_geometry)?,
            info: (0..tx_geometry.size()).map(|_| None).collect(),
            doorbell: 0,
            created: Created::default(),
            active: false,
        };

        Ok(Self {
            index,
            regs,
            commands,
            packets,
            headroom: config.headroom,
            max_payload: config.max_payload(),
            low_water: config.refill_low_water,
            phc,
            rx_timestamps: AtomicBool::new(config.rx_timestamps),
            rx: Mutex::new(rx),
            tx: Mutex::new(tx),
            received: Mutex::new(received),
            counters: Counters::default(),
        })
    }

    /// Port index.
    pub const fn index(&self) -> u32 {
        self.index
    }

    /// Create the device queues and post the first RX buffers.
    ///
    /// Order: CREATE_CQ (RX), CREATE_RQ, CREATE_CQ (TX), CREATE_SQ, refill.
    /// Any failure aborts; queues already created are destroyed again.
    ///
    /// # Errors
    ///
    /// The first failing command or allocation.
    pub async fn init(&self) -> Result<()> {
        let result = self.create_queues().await;
        if let Err(e) = result {
            error!("Port {} init failed: {}", self.index, e);
            let mut rx = self.rx.lock().await;
            let mut tx = self.tx.lock().await;
            rx.active = false;
            tx.active = false;
            let _ = self.destroy_queues(&mut rx, &mut tx).await;
            self.free_rx_buf(&mut rx);
            return Err(e);
        }
        Ok(())
    }

    async fn create_queues(&self) -> Result<()> {
        let mut rx = self.rx.lock().await;
        let mut tx = self.tx.lock().await;

        let cmd = Command::create_cq(
            self.index,
            RX_CQN,
            0,
            rx.cq.geometry().log_size(),
            rx.cq.base_address(),
        );
        self.log_created(self.commands.execute_reply(&cmd).await?);
        rx.created.cq = true;

        let cmd = Command::create_rq(
            self.index,
            RQN,
            RX_CQN,
            rx.ring.geometry().log_size(),
            rx.ring.base_address(),
        );
        let rsp = self.commands.execute(&cmd).await?;
        rx.doorbell = rsp.doorbell_offset();
        rx.created.wq = true;
        self.log_created(rsp.decode(cmd.opcode));

        let cmd = Command::create_cq(
            self.index,
            TX_CQN,
            0,
            tx.cq.geometry().log_size(),
            tx.cq.base_address(),
        );
        self.log_created(self.commands.execute_reply(&cmd).await?);
        tx.created.cq = true;

        let cmd = Command::create_sq(
            self.index,
            SQN,
            TX_CQN,
            tx.ring.geometry().log_size(),
            tx.ring.base_address(),
        );
        let rsp = self.commands.execute(&cmd).await?;
        tx.doorbell = rsp.doorbell_offset();
        tx.created.wq = true;
        self.log_created(rsp.decode(cmd.opcode));

        rx.active = true;
        tx.active = true;

        self.refill(&mut rx).await?;
        info!(
            "Port {} up: RX doorbell {:#x}, TX doorbell {:#x}",
            self.index, rx.doorbell, tx.doorbell
        );
        Ok(())
    }

    fn log_created(&self, reply: Reply) {
        if let Reply::Created {
            kind,
            qn,
            doorbell_offset,
        } = reply
        {
            debug!(
                "Port {}: created {} {} (doorbell {:#x})",
                self.index, kind, qn, doorbell_offset
            );
        }
    }

    /// Queue one payload for transmit.
    ///
    /// The payload is copied into a fresh packet buffer at the configured
    /// headroom. If the TX ring is full, completed entries are reclaimed
    /// once before giving up.
    ///
    /// # Errors
    ///
    /// [`CndmError::EmptyPayload`], [`CndmError::PayloadTooLarge`] and
    /// [`CndmError::Disconnected`] before anything is posted;
    /// [`CndmError::QueueFull`] when no slot frees up; allocation or
    /// register errors.
    pub async fn start_xmit(&self, payload: &[u8]) -> Result<()> {
        if payload.is_empty() {
            return Err(CndmError::EmptyPayload);
        }
        if payload.len() > self.max_payload {
            return Err(CndmError::PayloadTooLarge {
                len: payload.len(),
                max: self.max_payload,
            });
        }

        let mut tx = self.tx.lock().await;
        if !tx.active {
            return Err(CndmError::Disconnected { port: self.index });
        }
        if tx.ring.is_full() {
            self.drain_tx(&mut tx)?;
            if tx.ring.is_full() {
                Counters::add(&self.counters.tx_queue_full, 1);
                return Err(CndmError::QueueFull {
                    port: self.index,
                    capacity: tx.ring.geometry().size(),
                });
            }
        }

        let buffer = self.packets.allocate()?;
        buffer.write(self.headroom, payload);
        let index = tx.ring.prod_index();
        #[allow(clippy::cast_possible_truncation)]
        tx.ring.post(Descriptor {
            len: payload.len() as u32,
            addr: buffer.device_address(self.headroom),
        });
        tx.info[index] = Some(buffer);

        // Descriptor and payload must be visible before the doorbell.
        fence(Ordering::Release);
        self.regs
            .write_dword(tx.doorbell, tx.ring.prod & DOORBELL_MASK)
            .await?;

        Counters::add(&self.counters.tx_packets, 1);
        Counters::add(&self.counters.tx_bytes, payload.len() as u64);
        debug!(
            "Port {} TX slot {} len {} prod {}",
            self.index,
            index,
            payload.len(),
            tx.ring.prod
        );
        Ok(())
    }

    /// Wait for the next received frame and its timestamp.
    ///
    /// # Errors
    ///
    /// [`CndmError::Disconnected`] once the port is shut down and the queue
    /// is drained.
    pub async fn recv_frame(&self) -> Result<RxFrame> {
        let mut received = self.received.lock().await;
        received
            .recv()
            .await
            .ok_or(CndmError::Disconnected { port: self.index })
    }

    /// Wait for the next received payload.
    ///
    /// # Errors
    ///
    /// As [`Self::recv_frame`].
    pub async fn recv(&self) -> Result<Bytes> {
        Ok(self.recv_frame().await?.data)
    }

    /// Next received frame without waiting.
    ///
    /// # Errors
    ///
    /// [`CndmError::WouldBlock`] when nothing is queued (or another task is
    /// inside [`Self::recv`]); [`CndmError::Disconnected`] after shutdown.
    pub fn try_recv_frame(&self) -> Result<RxFrame> {
        let mut received = self.received.try_lock().map_err(|_| CndmError::WouldBlock)?;
        received.try_recv().map_err(|e| match e {
            mpsc::error::TryRecvError::Empty => CndmError::WouldBlock,
            mpsc::error::TryRecvError::Disconnected => {
                CndmError::Disconnected { port: self.index }
            }
        })
    }

    /// Next received payload without waiting.
    ///
    /// # Errors
    ///
    /// As [`Self::try_recv_frame`].
    pub fn try_recv(&self) -> Result<Bytes> {
        Ok(self.try_recv_frame()?.data)
    }

    /// Turn RX timestamps on or off for frames completed from now on.
    pub fn set_rx_timestamping(&self, enabled: bool) {
        self.rx_timestamps.store(enabled, Ordering::Relaxed);
        debug!("Port {} RX timestamps {}", self.index, if enabled { "on" } else { "off" });
    }

    /// `true` while RX timestamps are attached.
    pub fn rx_timestamping(&self) -> bool {
        self.rx_timestamps.load(Ordering::Relaxed)
    }

    /// Wait at most `timeout` for the next received payload.
    ///
    /// # Errors
    ///
    /// [`CndmError::Timeout`] when nothing arrives in time; otherwise as
    /// [`Self::recv`].
    pub async fn recv_timeout(&self, timeout: Duration) -> Result<Bytes> {
        tokio::time::timeout(timeout, self.recv())
            .await
            .map_err(|_| CndmError::timeout(timeout))?
    }

    /// Reclaim buffers of completed transmits. Returns how many were
    /// reclaimed.
    ///
    /// # Errors
    ///
    /// [`CndmError::InvalidHandle`] if a slot holds a foreign buffer.
    pub async fn process_tx_cq(&self) -> Result<u32> {
        let mut tx = self.tx.lock().await;
        self.drain_tx(&mut tx)
    }

    fn drain_tx(&self, tx: &mut TxPath<P>) -> Result<u32> {
        let mut done = 0;
        while let Some(cpl) = tx.cq.peek() {
            if tx.ring.occupancy() == 0 {
                error!(
                    "Port {} TX completion with nothing outstanding (cq cons {})",
                    self.index, tx.cq.cons
                );
                break;
            }
            let index = tx.ring.cons_index();
            debug!(
                "Port {} TX CQ index {} slot {} ts {}.{:09}",
                self.index,
                tx.cq.geometry().index(tx.cq.cons),
                index,
                cpl.ts_s,
                cpl.ts_ns
            );
            if let Some(buffer) = tx.info[index].take() {
                self.packets.release(buffer)?;
            }
            tx.ring.advance_cons();
            tx.cq.advance();
            done += 1;
        }
        Ok(done)
    }

    /// Deliver received frames to the payload queue, then refill the RX
    /// ring. Returns how many frames were delivered.
    ///
    /// # Errors
    ///
    /// Allocation, release or doorbell errors.
    pub async fn process_rx_cq(&self) -> Result<u32> {
        let mut rx = self.rx.lock().await;
        let mut done = 0;

        while let Some(cpl) = rx.cq.peek() {
            let index = rx.ring.cons_index();
            let Some(buffer) = rx.info[index].take() else {
                error!(
                    "Port {} RX completion for empty slot {} (cq cons {})",
                    self.index, index, rx.cq.cons
                );
                break;
            };

            let mut len = cpl.len as usize;
            if len > buffer.len() {
                warn!(
                    "Port {} RX length {} exceeds {}-byte buffer",
                    self.index,
                    len,
                    buffer.len()
                );
                Counters::add(&self.counters.rx_truncated, 1);
                len = buffer.len();
            }
            let data = Bytes::from(buffer.to_vec(len));
            let timestamp = if self.rx_timestamping() {
                Some(self.rx_timestamp(&mut rx.stamps, &cpl).await)
            } else {
                None
            };
            debug!("Port {} RX slot {} len {}", self.index, index, len);

            rx.ring.advance_cons();
            rx.cq.advance();
            self.packets.release(buffer)?;

            Counters::add(&self.counters.rx_packets, 1);
            Counters::add(&self.counters.rx_bytes, len as u64);
            if let Some(deliver) = &rx.deliver {
                // The receiver lives in `self`; it cannot be gone while
                // the sender exists.
                let _ = deliver.send(RxFrame { data, timestamp });
            }
            done += 1;
        }

        if rx.active {
            self.refill(&mut rx).await?;
        }
        Ok(done)
    }

    async fn rx_timestamp(&self, stamps: &mut TimestampExtender, cpl: &Completion) -> HwTimestamp {
        if let Some(phc) = &self.phc {
            let generation = phc.generation();
            if stamps.is_stale(cpl.ts_s, generation) {
                match phc.seconds().await {
                    Ok(secs) => stamps.update(secs, generation),
                    Err(e) => warn!("Port {} PHC read failed: {}", self.index, e),
                }
            }
        }
        stamps.extend(cpl)
    }

    /// Top up the RX ring. Returns how many buffers were posted.
    ///
    /// # Errors
    ///
    /// Allocation or doorbell errors.
    pub async fn refill_rx_buffers(&self) -> Result<u32> {
        let mut rx = self.rx.lock().await;
        if !rx.active {
            return Err(CndmError::Disconnected { port: self.index });
        }
        self.refill(&mut rx).await
    }

    async fn refill(&self, rx: &mut RxPath<P>) -> Result<u32> {
        let missing = rx.ring.missing();
        if missing == 0 || missing < self.low_water {
            return Ok(0);
        }

        let mut posted = 0;
        for _ in 0..missing {
            let buffer = match self.packets.allocate() {
                Ok(buffer) => buffer,
                Err(e) if posted == 0 => return Err(e),
                Err(e) => {
                    warn!(
                        "Port {} RX refill stopped after {} of {}: {}",
                        self.index, posted, missing, e
                    );
                    break;
                }
            };
            let index = rx.ring.prod_index();
            #[allow(clippy::cast_possible_truncation)]
            rx.ring.post(Descriptor {
                len: buffer.len() as u32,
                addr: buffer.device_address(0),
            });
            rx.info[index] = Some(buffer);
            posted += 1;
        }

        fence(Ordering::Release);
        self.regs
            .write_dword(rx.doorbell, rx.ring.prod & DOORBELL_MASK)
            .await?;
        debug!(
            "Port {} RX refill posted {} prod {}",
            self.index, posted, rx.ring.prod
        );
        Ok(posted)
    }

    /// Interrupt service: RX completions, then TX completions.
    ///
    /// # Errors
    ///
    /// The first error of either pass; the TX pass runs regardless.
    pub async fn interrupt_handler(&self) -> Result<()> {
        let rx = self.process_rx_cq().await;
        let tx = self.process_tx_cq().await;
        rx?;
        tx?;
        Ok(())
    }

    /// Destroy the device queues and return every posted buffer.
    ///
    /// Idempotent. Pending received payloads stay readable; afterwards
    /// [`Self::recv`] reports [`CndmError::Disconnected`].
    ///
    /// # Errors
    ///
    /// The first failed DESTROY command. Teardown continues past it.
    pub async fn shutdown(&self) -> Result<()> {
        let mut rx = self.rx.lock().await;
        let mut tx = self.tx.lock().await;
        rx.active = false;
        tx.active = false;

        let result = self.destroy_queues(&mut rx, &mut tx).await;
        self.free_tx_buf(&mut tx);
        self.free_rx_buf(&mut rx);
        rx.deliver = None;
        info!("Port {} down", self.index);
        result
    }

    async fn destroy_queues(&self, rx: &mut RxPath<P>, tx: &mut TxPath<P>) -> Result<()> {
        let steps = [
            (QueueKind::Cq, RX_CQN, &mut rx.created.cq),
            (QueueKind::Rq, RQN, &mut rx.created.wq),
            (QueueKind::Cq, TX_CQN, &mut tx.created.cq),
            (QueueKind::Sq, SQN, &mut tx.created.wq),
        ];
        let mut first_error = None;
        for (kind, qn, created) in steps {
            if !*created {
                continue;
            }
            *created = false;
            if let Err(e) = self
                .commands
                .execute(&Command::destroy(kind, self.index, qn))
                .await
            {
                warn!("Port {}: destroy {} {} failed: {}", self.index, kind, qn, e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn free_tx_buf(&self, tx: &mut TxPath<P>) {
        while tx.ring.occupancy() > 0 {
            let index = tx.ring.cons_index();
            if let Some(buffer) = tx.info[index].take() {
                if let Err(e) = self.packets.release(buffer) {
                    error!("Port {} TX slot {}: {}", self.index, index, e);
                }
            }
            tx.ring.advance_cons();
        }
    }

    fn free_rx_buf(&self, rx: &mut RxPath<P>) {
        while rx.ring.occupancy() > 0 {
            let index = rx.ring.cons_index();
            if let Some(buffer) = rx.info[index].take() {
                if let Err(e) = self.packets.release(buffer) {
                    error!("Port {} RX slot {}: {}", self.index, index, e);
                }
            }
            rx.ring.advance_cons();
        }
    }

    /// Read back the device state of one of this port's queues.
    ///
    /// # Errors
    ///
    /// Command errors, including a non-zero status for an unknown queue.
    pub async fn query(&self, kind: QueueKind, qn: u32) -> Result<Reply> {
        self.commands
            .execute_reply(&Command::query(kind, self.index, qn))
            .await
    }

    /// Traffic counters.
    pub fn stats(&self) -> PortStats {
        self.counters.snapshot()
    }

    /// RX buffers currently posted to the device.
    pub async fn rx_posted(&self) -> u32 {
        self.rx.lock().await.ring.occupancy()
    }

    /// TX descriptors not yet reclaimed.
    pub async fn tx_outstanding(&self) -> u32 {
        self.tx.lock().await.ring.occupancy()
    }

    /// RX and TX doorbell register offsets.
    pub async fn doorbells(&self) -> (u32, u32) {
        let rx = self.rx.lock().await.doorbell;
        let tx = self.tx.lock().await.doorbell;
        (rx, tx)
    }
}
