//! Software model of a cndm NIC.
//!
//! `SimDevice` implements [`PciFunction`] against a [`HostMemoryPool`]: a
//! register window with the config registers and mailbox, a command
//! processor for the queue management opcodes, and per-port queue engines
//! that fetch descriptors, move frames and write completions with the
//! phase bit, then raise the port's interrupt vector.
//!
//! Frames leaving a port's SQ go wherever [`LinkMode`] says: back into the
//! same port, into the paired port, or into a capture list.
//!
//! Doorbell `k` of port `p` sits at `port_offset + p * port_stride`, with
//! RQ `n` at `+ 8n` and SQ `n` at `+ 8n + 4`.
//!
//! A device clock starting at zero stamps every completion. With
//! [`SimConfig::phc_offset`] set, its PTP register block is mapped there.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use cndm_chip::cmd::{self, Action, Command, Opcode, QueueKind, Response, CMD_LEN, STATUS_OK};
use cndm_chip::desc::{Completion, Descriptor, ENTRY_SIZE};
use cndm_chip::regs::{self, mbox, phc, MBOX_WORDS};
use cndm_chip::ring::RingGeometry;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::device::{IrqVectors, PciFunction, RegisterWindow};
use crate::dma::HostMemoryPool;
use crate::error::{CndmError, Result};
use crate::ptp::HwTimestamp;

/// Command status codes returned by the model.
pub mod status {
    /// Port index out of range.
    pub const INVALID_PORT: u16 = 0x0001;
    /// Queue does not exist, already exists or is referenced by another.
    pub const INVALID_QUEUE: u16 = 0x0002;
    /// Ring size out of range.
    pub const INVALID_SIZE: u16 = 0x0003;
    /// Opcode not supported.
    pub const UNSUPPORTED: u16 = 0x0004;
    /// Failure injected through [`super::SimConfig::fail_opcode`].
    pub const INJECTED: u16 = 0x00ff;
}

/// Queue numbers per kind and port.
const MAX_QUEUES: u32 = 16;

/// Where transmitted frames go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkMode {
    /// Each port receives its own frames.
    Loopback,
    /// Ports `2k` and `2k + 1` are cabled together. An unpaired last port
    /// loops back.
    Crossover,
    /// Frames are captured for [`SimDevice::take_tx_frames`].
    Wire,
}

/// Model parameters.
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Number of ports
    pub ports: u32,
    /// Offset of the per-port doorbell blocks
    pub port_offset: u32,
    /// Stride between per-port blocks
    pub port_stride: u32,
    /// Frame routing
    pub link: LinkMode,
    /// BUSY reads reported after every EXECUTE
    pub busy_polls: u32,
    /// Never complete a command
    pub hang: bool,
    /// Accept SQ doorbells but never fetch from the send queues
    pub stall_tx: bool,
    /// Yield to the scheduler inside every register access
    pub yield_on_access: bool,
    /// Vectors the function can grant
    pub irq_vectors: u32,
    /// Fail every command with this opcode
    pub fail_opcode: Option<Opcode>,
    /// Only fail `fail_opcode` on this port
    pub fail_port: Option<u32>,
    /// Most recent register writes and commands kept for inspection
    pub log_capacity: usize,
    /// Offset of the PTP clock block, `None` for no clock registers
    pub phc_offset: Option<u32>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            ports: 1,
            port_offset: 0x2_0000,
            port_stride: 0x100,
            link: LinkMode::Loopback,
            busy_polls: 0,
            hang: false,
            stall_tx: false,
            yield_on_access: false,
            irq_vectors: 32,
            fail_opcode: None,
            fail_port: None,
            log_capacity: 4096,
            phc_offset: None,
        }
    }
}

impl SimConfig {
    /// `ports` ports, everything else default.
    #[must_use]
    pub fn with_ports(ports: u32) -> Self {
        Self {
            ports,
            ..Self::default()
        }
    }
}

/// Model activity counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimStats {
    /// Mailbox commands executed
    pub commands: u64,
    /// BUSY reads of the mailbox control register
    pub busy_reads: u64,
    /// Frames fetched from send queues
    pub tx_frames: u64,
    /// Frames written to receive queues
    pub rx_frames: u64,
    /// Frames dropped for lack of an RX buffer
    pub rx_dropped: u64,
    /// Interrupts raised
    pub irqs: u64,
}

#[derive(Debug, Clone, Copy)]
struct CqState {
    base: u64,
    geometry: RingGeometry,
    prod: u32,
}

#[derive(Debug, Clone, Copy)]
struct WqState {
    base: u64,
    geometry: RingGeometry,
    cqn: u32,
    prod: u32,
    cons: u32,
}

#[derive(Debug, Default)]
struct PortState {
    eqs: HashMap<u32, CqState>,
    cqs: HashMap<u32, CqState>,
    sqs: HashMap<u32, WqState>,
    rqs: HashMap<u32, WqState>,
}

/// Device time: `base_ns` at `anchor`, running at host speed.
#[derive(Debug)]
struct SimClock {
    base_ns: i128,
    anchor: Instant,
    latched: HwTimestamp,
    set_ns: u32,
    set_sec_l: u32,
    period: u64,
}

impl SimClock {
    fn new() -> Self {
        Self {
            base_ns: 0,
            anchor: Instant::now(),
            latched: HwTimestamp::default(),
            set_ns: 0,
            set_sec_l: 0,
            period: phc::DEFAULT_PERIOD,
        }
    }

    #[allow(clippy::cast_sign_loss)]
    fn now(&self) -> HwTimestamp {
        let elapsed = i128::try_from(self.anchor.elapsed().as_nanos()).unwrap_or(i128::MAX);
        HwTimestamp::from_nanos(self.base_ns.saturating_add(elapsed).max(0) as u128)
    }

    fn load(&mut self, ts: HwTimestamp) {
        self.base_ns = i128::try_from(ts.as_nanos()).unwrap_or(i128::MAX);
        self.anchor = Instant::now();
    }

    #[allow(clippy::cast_possible_truncation)]
    fn read(&mut self, reg: u32) -> u32 {
        match reg {
            phc::CUR_SEC_L => self.now().secs as u32,
            phc::CUR_SEC_H => (self.now().secs >> 32) as u32,
            phc::SNAPSHOT => {
                self.latched = self.now();
                0
            }
            phc::GET_NS => self.latched.nanos,
            phc::GET_SEC_L => self.latched.secs as u32,
            phc::GET_SEC_H => (self.latched.secs >> 32) as u32,
            phc::NOM_PERIOD_L => phc::DEFAULT_PERIOD as u32,
            phc::NOM_PERIOD_H => (phc::DEFAULT_PERIOD >> 32) as u32,
            phc::PERIOD_L => self.period as u32,
            phc::PERIOD_H => (self.period >> 32) as u32,
            _ => 0,
        }
    }

    #[allow(clippy::cast_possible_wrap)]
    fn write(&mut self, reg: u32, value: u32) {
        match reg {
            phc::OFFSET_NS => self.base_ns += i128::from(value as i32),
            phc::SET_NS => self.set_ns = value,
            phc::SET_SEC_L => self.set_sec_l = value,
            phc::SET_SEC_H => {
                let secs = u64::from(value) << 32 | u64::from(self.set_sec_l);
                self.load(HwTimestamp::new(secs, self.set_ns));
            }
            phc::PERIOD_L => self.period = self.period & !0xffff_ffff | u64::from(value),
            phc::PERIOD_H => self.period = self.period & 0xffff_ffff | u64::from(value) << 32,
            _ => trace!("Sim: ignoring PHC write {:#x} to {:#x}", value, reg),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Doorbell {
    Rq { port: u32, qn: u32 },
    Sq { port: u32, qn: u32 },
}

#[derive(Debug)]
struct State {
    cmd: [u32; MBOX_WORDS],
    rsp: [u32; MBOX_WORDS],
    busy: u32,
    ports: Vec<PortState>,
    writes: VecDeque<(u32, u32)>,
    executed: VecDeque<Command>,
    captured: Vec<(u32, Vec<u8>)>,
    stats: SimStats,
    irq: Option<(mpsc::UnboundedSender<u32>, u32)>,
    clock: SimClock,
}

/// Register window of the model (BAR0).
#[derive(Debug)]
pub struct SimRegisters {
    config: SimConfig,
    pool: HostMemoryPool,
    state: Mutex<State>,
    master: AtomicBool,
}

impl SimRegisters {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn doorbell_offset(&self, port: u32, qn: u32, sq: bool) -> u32 {
        self.config.port_offset + port * self.config.port_stride + qn * 8 + if sq { 4 } else { 0 }
    }

    fn decode_doorbell(&self, offset: u32) -> Option<Doorbell> {
        let rel = offset.checked_sub(self.config.port_offset)?;
        let port = rel.checked_div(self.config.port_stride)?;
        let within = rel % self.config.port_stride;
        if port >= self.config.ports || within >= MAX_QUEUES * 8 || within % 4 != 0 {
            return None;
        }
        let qn = within / 8;
        Some(if within % 8 == 0 {
            Doorbell::Rq { port, qn }
        } else {
            Doorbell::Sq { port, qn }
        })
    }

    /// Register within the PTP block, if `offset` falls inside it.
    fn phc_register(&self, offset: u32) -> Option<u32> {
        let rel = offset.checked_sub(self.config.phc_offset?)?;
        (rel < phc::BLOCK_SIZE).then_some(rel)
    }

    fn read(&self, offset: u32) -> u32 {
        let mut state = self.lock();
        if let Some(reg) = self.phc_register(offset) {
            return state.clock.read(reg);
        }
        match offset {
            regs::PORT_COUNT => self.config.ports,
            regs::PORT_OFFSET => self.config.port_offset,
            regs::PORT_STRIDE => self.config.port_stride,
            regs::MBOX_CTRL => {
                if self.config.hang || state.busy > 0 {
                    state.busy = state.busy.saturating_sub(1);
                    state.stats.busy_reads += 1;
                    mbox::BUSY
                } else {
                    0
                }
            }
            o if (regs::MBOX_CMD..regs::MBOX_RSP).contains(&o) && o % 4 == 0 => {
                state.cmd[((o - regs::MBOX_CMD) / 4) as usize]
            }
            o if (regs::MBOX_RSP..regs::mbox_rsp_word(MBOX_WORDS)).contains(&o) && o % 4 == 0 => {
                state.rsp[((o - regs::MBOX_RSP) / 4) as usize]
            }
            _ => 0,
        }
    }

    fn write(&self, offset: u32, value: u32) {
        let mut state = self.lock();
        record(&mut state.writes, (offset, value), self.config.log_capacity);
        if let Some(reg) = self.phc_register(offset) {
            state.clock.write(reg, value);
            return;
        }
        match offset {
            regs::MBOX_CTRL if value & mbox::EXECUTE != 0 => self.execute(&mut state),
            o if (regs::MBOX_CMD..regs::MBOX_RSP).contains(&o) && o % 4 == 0 => {
                state.cmd[((o - regs::MBOX_CMD) / 4) as usize] = value;
            }
            o => match self.decode_doorbell(o) {
                Some(Doorbell::Rq { port, qn }) => self.rq_doorbell(&mut state, port, qn, value),
                Some(Doorbell::Sq { port, qn }) => self.sq_doorbell(&mut state, port, qn, value),
                None => trace!("Ignoring write {:#x} to {:#x}", value, o),
            },
        }
    }

    // ── Command processor ────────────────────────────────────────────────────

    fn execute(&self, state: &mut State) {
        state.busy = self.config.busy_polls;
        state.stats.commands += 1;

        let bytes = cmd::from_words(&state.cmd);
        let (status, record) = match Command::decode(&bytes) {
            Ok(command) => {
                record(&mut state.executed, command, self.config.log_capacity);
                self.run(state, command)
            }
            Err(unknown) => {
                warn!("Sim: {}", unknown);
                (status::UNSUPPORTED, Command::nop())
            }
        };
        let mut rsp = *Response::reply(status, &record).as_bytes();
        if status != STATUS_OK {
            rsp[4..CMD_LEN].copy_from_slice(&bytes[4..CMD_LEN]);
        }
        state.rsp = cmd::to_words(&rsp);
        debug!("Sim: {} -> status {:#x}", record.opcode, status);
    }

    fn run(&self, state: &mut State, command: Command) -> (u16, Command) {
        if self.config.fail_opcode == Some(command.opcode)
            && self.config.fail_port.map_or(true, |port| port == command.port)
        {
            return (status::INJECTED, command);
        }
        let (Some(action), Some(kind)) = (command.opcode.action(), command.opcode.kind()) else {
            return (STATUS_OK, command);
        };
        let Some(port) = state.ports.get_mut(command.port as usize) else {
            return (status::INVALID_PORT, command);
        };
        if command.qn >= MAX_QUEUES {
            return (status::INVALID_QUEUE, command);
        }

        let mut reply = command;
        let status = match action {
            Action::Create => {
                let Some(geometry) = RingGeometry::new(command.log_size) else {
                    return (status::INVALID_SIZE, command);
                };
                match kind {
                    QueueKind::Eq | QueueKind::Cq => {
                        let table = if kind == QueueKind::Eq { &mut port.eqs } else { &mut port.cqs };
                        if table.contains_key(&command.qn) {
                            status::INVALID_QUEUE
                        } else {
                            table.insert(
                                command.qn,
                                CqState {
                                    base: command.ptr1,
                                    geometry,
                                    prod: 0,
                                },
                            );
                            STATUS_OK
                        }
                    }
                    QueueKind::Sq | QueueKind::Rq => {
                        let has_cq = port.cqs.contains_key(&command.qn2);
                        let table = if kind == QueueKind::Sq { &mut port.sqs } else { &mut port.rqs };
                        if !has_cq || table.contains_key(&command.qn) {
                            status::INVALID_QUEUE
                        } else {
                            table.insert(
                                command.qn,
                                WqState {
                                    base: command.ptr1,
                                    geometry,
                                    cqn: command.qn2,
                                    prod: 0,
                                    cons: 0,
                                },
                            );
                            reply.dboffs =
                                self.doorbell_offset(command.port, command.qn, kind == QueueKind::Sq);
                            STATUS_OK
                        }
                    }
                }
            }
            Action::Modify => {
                if queue_exists(port, kind, command.qn) {
                    STATUS_OK
                } else {
                    status::INVALID_QUEUE
                }
            }
            Action::Query => match kind {
                QueueKind::Eq | QueueKind::Cq => {
                    let table = if kind == QueueKind::Eq { &port.eqs } else { &port.cqs };
                    match table.get(&command.qn) {
                        Some(cq) => {
                            reply.log_size = cq.geometry.log_size();
                            reply.ptr1 = cq.base;
                            reply.prod_ptr = cq.prod;
                            STATUS_OK
                        }
                        None => status::INVALID_QUEUE,
                    }
                }
                QueueKind::Sq | QueueKind::Rq => {
                    let table = if kind == QueueKind::Sq { &port.sqs } else { &port.rqs };
                    match table.get(&command.qn) {
                        Some(wq) => {
                            reply.log_size = wq.geometry.log_size();
                            reply.qn2 = wq.cqn;
                            reply.ptr1 = wq.base;
                            reply.prod_ptr = wq.prod;
                            reply.cons_ptr = wq.cons;
                            reply.dboffs =
                                self.doorbell_offset(command.port, command.qn, kind == QueueKind::Sq);
                            STATUS_OK
                        }
                        None => status::INVALID_QUEUE,
                    }
                }
            },
            Action::Destroy => {
                let removed = match kind {
                    QueueKind::Eq => port.eqs.remove(&command.qn).is_some(),
                    QueueKind::Cq => port.cqs.remove(&command.qn).is_some(),
                    QueueKind::Sq => port.sqs.remove(&command.qn).is_some(),
                    QueueKind::Rq => port.rqs.remove(&command.qn).is_some(),
                };
                if removed {
                    STATUS_OK
                } else {
                    status::INVALID_QUEUE
                }
            }
        };
        (status, reply)
    }

    // ── Queue engines ────────────────────────────────────────────────────────

    fn rq_doorbell(&self, state: &mut State, port: u32, qn: u32, value: u32) {
        if let Some(rq) = state.ports[port as usize].rqs.get_mut(&qn) {
            rq.prod = extend(rq.cons, value);
            trace!("Sim: port {} RQ {} prod {}", port, qn, rq.prod);
        } else {
            warn!("Sim: doorbell for missing RQ {} on port {}", qn, port);
        }
    }

    fn sq_doorbell(&self, state: &mut State, port: u32, qn: u32, value: u32) {
        let Some(sq) = state.ports[port as usize].sqs.get_mut(&qn) else {
            warn!("Sim: doorbell for missing SQ {} on port {}", qn, port);
            return;
        };
        sq.prod = extend(sq.cons, value);
        let mut sq = *sq;
        if self.config.stall_tx {
            return;
        }
        if !self.master.load(Ordering::Acquire) {
            warn!("Sim: SQ doorbell with bus mastering disabled");
            return;
        }

        let mut frames = Vec::new();
        while sq.cons != sq.prod {
            let mut entry = [0u8; ENTRY_SIZE];
            if let Err(e) = self
                .pool
                .dma_read(sq.base + sq.geometry.offset(sq.cons) as u64, &mut entry)
            {
                warn!("Sim: SQ descriptor fetch failed: {}", e);
                break;
            }
            let desc = Descriptor::decode(&entry);
            let mut frame = vec![0u8; desc.len as usize];
            if let Err(e) = self.pool.dma_read(desc.addr, &mut frame) {
                warn!("Sim: TX payload fetch failed: {}", e);
                break;
            }
            sq.cons = sq.cons.wrapping_add(1);
            if !self.complete(state, port, sq.cqn, desc.len) {
                break;
            }
            frames.push(frame);
        }
        if let Some(live) = state.ports[port as usize].sqs.get_mut(&qn) {
            live.cons = sq.cons;
        }

        let mut touched = vec![port];
        for frame in frames {
            state.stats.tx_frames += 1;
            match self.config.link {
                LinkMode::Wire => state.captured.push((port, frame)),
                LinkMode::Loopback => {
                    self.deliver(state, port, &frame);
                }
                LinkMode::Crossover => {
                    let peer = if port ^ 1 < self.config.ports { port ^ 1 } else { port };
                    self.deliver(state, peer, &frame);
                    if !touched.contains(&peer) {
                        touched.push(peer);
                    }
                }
            }
        }
        for port in touched {
            self.raise(state, port);
        }
    }

    /// Write one frame into the first RQ of `port`. Returns `false` when
    /// the frame is dropped.
    fn deliver(&self, state: &mut State, port: u32, frame: &[u8]) -> bool {
        let Some((qn, mut rq)) = state.ports[port as usize]
            .rqs
            .iter()
            .min_by_key(|(qn, _)| **qn)
            .map(|(qn, rq)| (*qn, *rq))
        else {
            state.stats.rx_dropped += 1;
            return false;
        };
        if rq.cons == rq.prod {
            debug!("Sim: port {} RX drop, no buffers", port);
            state.stats.rx_dropped += 1;
            return false;
        }

        let mut entry = [0u8; ENTRY_SIZE];
        if let Err(e) = self
            .pool
            .dma_read(rq.base + rq.geometry.offset(rq.cons) as u64, &mut entry)
        {
            warn!("Sim: RQ descriptor fetch failed: {}", e);
            state.stats.rx_dropped += 1;
            return false;
        }
        let desc = Descriptor::decode(&entry);
        let copy = frame.len().min(desc.len as usize);
        if let Err(e) = self.pool.dma_write(desc.addr, &frame[..copy]) {
            warn!("Sim: RX payload write failed: {}", e);
            state.stats.rx_dropped += 1;
            return false;
        }
        rq.cons = rq.cons.wrapping_add(1);
        if let Some(live) = state.ports[port as usize].rqs.get_mut(&qn) {
            live.cons = rq.cons;
        }
        // The completion reports the wire length, even when it was cut.
        #[allow(clippy::cast_possible_truncation)]
        let delivered = self.complete(state, port, rq.cqn, frame.len() as u32);
        if delivered {
            state.stats.rx_frames += 1;
        }
        delivered
    }

    /// Append a completion to CQ `cqn` of `port`.
    fn complete(&self, state: &mut State, port: u32, cqn: u32, len: u32) -> bool {
        let now = state.clock.now();
        let Some(cq) = state.ports[port as usize].cqs.get_mut(&cqn) else {
            warn!("Sim: completion for missing CQ {} on port {}", cqn, port);
            return false;
        };
        #[allow(clippy::cast_possible_truncation)]
        let cpl = Completion {
            len,
            ts_ns: now.nanos,
            ts_fns: 0,
            ts_s: now.secs as u8,
            phase: cq.geometry.device_phase(cq.prod),
        };
        let addr = cq.base + cq.geometry.offset(cq.prod) as u64;
        cq.prod = cq.prod.wrapping_add(1);
        if let Err(e) = self.pool.dma_write(addr, &cpl.encode()) {
            warn!("Sim: completion write failed: {}", e);
            return false;
        }
        true
    }

    fn raise(&self, state: &mut State, port: u32) {
        if let Some((irq, count)) = &state.irq {
            let vector = port % count;
            if irq.send(vector).is_ok() {
                state.stats.irqs += 1;
            }
        }
    }
}

/// Append to a bounded log, dropping the oldest entry when full.
fn record<T>(log: &mut VecDeque<T>, entry: T, capacity: usize) {
    if capacity == 0 {
        return;
    }
    if log.len() == capacity {
        log.pop_front();
    }
    log.push_back(entry);
}

/// Rebuild a full producer counter from the 16 doorbell bits.
fn extend(cons: u32, doorbell: u32) -> u32 {
    cons.wrapping_add(doorbell.wrapping_sub(cons) & regs::DOORBELL_MASK)
}

fn queue_exists(port: &PortState, kind: QueueKind, qn: u32) -> bool {
    match kind {
        QueueKind::Eq => port.eqs.contains_key(&qn),
        QueueKind::Cq => port.cqs.contains_key(&qn),
        QueueKind::Sq => port.sqs.contains_key(&qn),
        QueueKind::Rq => port.rqs.contains_key(&qn),
    }
}

impl RegisterWindow for SimRegisters {
    async fn read_dword(&self, offset: u32) -> Result<u32> {
        if self.config.yield_on_access {
            tokio::task::yield_now().await;
        }
        Ok(self.read(offset))
    }

    async fn write_dword(&self, offset: u32, value: u32) -> Result<()> {
        if self.config.yield_on_access {
            tokio::task::yield_now().await;
        }
        self.write(offset, value);
        Ok(())
    }
}

/// Simulated PCIe function.
#[derive(Debug, Clone)]
pub struct SimDevice {
    regs: Arc<SimRegisters>,
    pool: Arc<HostMemoryPool>,
    enabled: Arc<AtomicBool>,
}

impl SimDevice {
    /// A device with the given parameters.
    #[must_use]
    pub fn new(config: SimConfig) -> Self {
        let pool = HostMemoryPool::new();
        let ports = (0..config.ports).map(|_| PortState::default()).collect();
        let regs = SimRegisters {
            config,
            pool: pool.clone(),
            state: Mutex::new(State {
                cmd: [0; MBOX_WORDS],
                rsp: [0; MBOX_WORDS],
                busy: 0,
                ports,
                writes: VecDeque::new(),
                executed: VecDeque::new(),
                captured: Vec::new(),
                stats: SimStats::default(),
                irq: None,
                clock: SimClock::new(),
            }),
            master: AtomicBool::new(false),
        };
        Self {
            regs: Arc::new(regs),
            pool: Arc::new(pool),
            enabled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Model parameters.
    #[must_use]
    pub fn config(&self) -> &SimConfig {
        &self.regs.config
    }

    /// Activity counters.
    #[must_use]
    pub fn stats(&self) -> SimStats {
        self.regs.lock().stats
    }

    /// Register writes so far, oldest first, bounded by
    /// [`SimConfig::log_capacity`].
    #[must_use]
    pub fn register_writes(&self) -> Vec<(u32, u32)> {
        self.regs.lock().writes.iter().copied().collect()
    }

    /// Forget recorded register writes.
    pub fn clear_register_writes(&self) {
        self.regs.lock().writes.clear();
    }

    /// Decoded commands so far, oldest first, bounded by
    /// [`SimConfig::log_capacity`].
    #[must_use]
    pub fn executed_commands(&self) -> Vec<Command> {
        self.regs.lock().executed.iter().copied().collect()
    }

    /// Current device time.
    #[must_use]
    pub fn clock(&self) -> HwTimestamp {
        self.regs.lock().clock.now()
    }

    /// Clock period last programmed through the PTP registers, 32.32 ns.
    #[must_use]
    pub fn clock_period(&self) -> u64 {
        self.regs.lock().clock.period
    }

    /// Take the frames captured in [`LinkMode::Wire`].
    pub fn take_tx_frames(&self) -> Vec<(u32, Vec<u8>)> {
        std::mem::take(&mut self.regs.lock().captured)
    }

    /// Receive `frame` on `port` from the wire. Returns `false` if it was
    /// dropped (no RX buffer posted, or no such port).
    pub fn inject_rx(&self, port: u32, frame: &[u8]) -> bool {
        if port >= self.regs.config.ports {
            return false;
        }
        let mut state = self.regs.lock();
        let delivered = self.regs.deliver(&mut state, port, frame);
        if delivered {
            self.regs.raise(&mut state, port);
        }
        delivered
    }

    /// `true` after [`PciFunction::enable_device`].
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// `true` after [`PciFunction::set_master`].
    #[must_use]
    pub fn is_master(&self) -> bool {
        self.regs.master.load(Ordering::Acquire)
    }
}

impl PciFunction for SimDevice {
    type Regs = SimRegisters;
    type Pool = HostMemoryPool;

    async fn enable_device(&self) -> Result<()> {
        self.enabled.store(true, Ordering::Release);
        Ok(())
    }

    async fn set_master(&self) -> Result<()> {
        self.regs.master.store(true, Ordering::Release);
        Ok(())
    }

    async fn alloc_irq_vectors(&self, min: u32, max: u32) -> Result<IrqVectors> {
        let available = self.regs.config.irq_vectors;
        if available < min {
            return Err(CndmError::hardware_error(format!(
                "{min} interrupt vectors requested, {available} available"
            )));
        }
        let count = max.min(available);
        if count == 0 {
            return Err(CndmError::hardware_error("no interrupt vectors requested"));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.regs.lock().irq = Some((tx, count));
        Ok(IrqVectors { count, events: rx })
    }

    fn bar_window(&self, bar: u32) -> Result<Arc<SimRegisters>> {
        if bar != 0 {
            return Err(CndmError::capability_query_failed(format!(
                "BAR{bar} not implemented"
            )));
        }
        Ok(self.regs.clone())
    }

    fn memory_pool(&self) -> Arc<HostMemoryPool> {
        self.pool.clone()
    }
}
