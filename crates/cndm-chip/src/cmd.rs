//! Mailbox command format.
//!
//! Every command and every response is exactly 64 bytes, little endian:
//!
//! ```text
//! byte  0  u16  reserved
//! byte  2  u16  opcode (command) / status (response)
//! byte  4  u32  flags
//! byte  8  u32  port
//! byte 12  u32  qn        primary queue number
//! byte 16  u32  qn2       secondary queue number (cqn / eqn)
//! byte 20  u32  pd        protection domain
//! byte 24  u32  log_size  log2 of the ring entry count
//! byte 28  u32  dboffs    doorbell offset (word 7)
//! byte 32  u64  ptr1      ring base address
//! byte 40  u64  ptr2
//! byte 48  u32  prod_ptr
//! byte 52  u32  cons_ptr
//! byte 56  u32  reserved
//! byte 60  u32  reserved
//! ```

use std::fmt;

/// Size of a command and of a response in bytes.
pub const CMD_LEN: usize = 64;

/// Queue families addressed by the queue management opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    /// Event queue.
    Eq,
    /// Completion queue.
    Cq,
    /// Send (transmit) queue.
    Sq,
    /// Receive queue.
    Rq,
}

impl fmt::Display for QueueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Eq => write!(f, "EQ"),
            Self::Cq => write!(f, "CQ"),
            Self::Sq => write!(f, "SQ"),
            Self::Rq => write!(f, "RQ"),
        }
    }
}

/// Queue management verbs, encoded in the low nibble of the opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    /// Allocate and start a queue.
    Create,
    /// Change queue parameters.
    Modify,
    /// Read back queue state.
    Query,
    /// Stop and release a queue.
    Destroy,
}

/// Mailbox opcodes. The set is closed: anything else is rejected by
/// [`Opcode::from_raw`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Opcode {
    /// No operation.
    Nop = 0x0000,

    /// Create event queue.
    CreateEq = 0x0200,
    /// Modify event queue.
    ModifyEq = 0x0201,
    /// Query event queue.
    QueryEq = 0x0202,
    /// Destroy event queue.
    DestroyEq = 0x0203,

    /// Create completion queue.
    CreateCq = 0x0210,
    /// Modify completion queue.
    ModifyCq = 0x0211,
    /// Query completion queue.
    QueryCq = 0x0212,
    /// Destroy completion queue.
    DestroyCq = 0x0213,

    /// Create send queue.
    CreateSq = 0x0220,
    /// Modify send queue.
    ModifySq = 0x0221,
    /// Query send queue.
    QuerySq = 0x0222,
    /// Destroy send queue.
    DestroySq = 0x0223,

    /// Create receive queue.
    CreateRq = 0x0230,
    /// Modify receive queue.
    ModifyRq = 0x0231,
    /// Query receive queue.
    QueryRq = 0x0232,
    /// Destroy receive queue.
    DestroyRq = 0x0233,
}

/// Every opcode, in wire order.
pub const ALL_OPCODES: [Opcode; 17] = [
    Opcode::Nop,
    Opcode::CreateEq,
    Opcode::ModifyEq,
    Opcode::QueryEq,
    Opcode::DestroyEq,
    Opcode::CreateCq,
    Opcode::ModifyCq,
    Opcode::QueryCq,
    Opcode::DestroyCq,
    Opcode::CreateSq,
    Opcode::ModifySq,
    Opcode::QuerySq,
    Opcode::DestroySq,
    Opcode::CreateRq,
    Opcode::ModifyRq,
    Opcode::QueryRq,
    Opcode::DestroyRq,
];

impl Opcode {
    /// Build a queue management opcode.
    #[must_use]
    pub const fn queue(action: Action, kind: QueueKind) -> Self {
        match (action, kind) {
            (Action::Create, QueueKind::Eq) => Self::CreateEq,
            (Action::Modify, QueueKind::Eq) => Self::ModifyEq,
            (Action::Query, QueueKind::Eq) => Self::QueryEq,
            (Action::Destroy, QueueKind::Eq) => Self::DestroyEq,
            (Action::Create, QueueKind::Cq) => Self::CreateCq,
            (Action::Modify, QueueKind::Cq) => Self::ModifyCq,
            (Action::Query, QueueKind::Cq) => Self::QueryCq,
            (Action::Destroy, QueueKind::Cq) => Self::DestroyCq,
            (Action::Create, QueueKind::Sq) => Self::CreateSq,
            (Action::Modify, QueueKind::Sq) => Self::ModifySq,
            (Action::Query, QueueKind::Sq) => Self::QuerySq,
            (Action::Destroy, QueueKind::Sq) => Self::DestroySq,
            (Action::Create, QueueKind::Rq) => Self::CreateRq,
            (Action::Modify, QueueKind::Rq) => Self::ModifyRq,
            (Action::Query, QueueKind::Rq) => Self::QueryRq,
            (Action::Destroy, QueueKind::Rq) => Self::DestroyRq,
        }
    }

    /// Decode a raw opcode.
    #[must_use]
    pub fn from_raw(raw: u16) -> Option<Self> {
        ALL_OPCODES.iter().copied().find(|op| op.raw() == raw)
    }

    /// Raw 16-bit value.
    #[must_use]
    pub const fn raw(self) -> u16 {
        self as u16
    }

    /// Queue family, `None` for NOP.
    #[must_use]
    pub const fn kind(self) -> Option<QueueKind> {
        match self.raw() & 0xfff0 {
            0x0200 => Some(QueueKind::Eq),
            0x0210 => Some(QueueKind::Cq),
            0x0220 => Some(QueueKind::Sq),
            0x0230 => Some(QueueKind::Rq),
            _ => None,
        }
    }

    /// Verb, `None` for NOP.
    #[must_use]
    pub const fn action(self) -> Option<Action> {
        if self.kind().is_none() {
            return None;
        }
        match self.raw() & 0x000f {
            0 => Some(Action::Create),
            1 => Some(Action::Modify),
            2 => Some(Action::Query),
            _ => Some(Action::Destroy),
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.action(), self.kind()) {
            (Some(action), Some(kind)) => {
                let verb = match action {
                    Action::Create => "CREATE",
                    Action::Modify => "MODIFY",
                    Action::Query => "QUERY",
                    Action::Destroy => "DESTROY",
                };
                write!(f, "{verb}_{kind}")
            }
            _ => write!(f, "NOP"),
        }
    }
}

/// Raw command or response carried an opcode outside the closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnknownOpcode(pub u16);

impl fmt::Display for UnknownOpcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown mailbox opcode {:#06x}", self.0)
    }
}

impl std::error::Error for UnknownOpcode {}

/// A mailbox command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Command {
    /// Operation to perform.
    pub opcode: Opcode,
    /// Opcode specific flags.
    pub flags: u32,
    /// Port index.
    pub port: u32,
    /// Primary queue number.
    pub qn: u32,
    /// Secondary queue number (the CQ of an SQ/RQ, the EQ of a CQ).
    pub qn2: u32,
    /// Protection domain.
    pub pd: u32,
    /// log2 of the ring entry count.
    pub log_size: u32,
    /// Doorbell offset.
    pub dboffs: u32,
    /// Ring base device address.
    pub ptr1: u64,
    /// Secondary pointer.
    pub ptr2: u64,
    /// Producer pointer.
    pub prod_ptr: u32,
    /// Consumer pointer.
    pub cons_ptr: u32,
}

impl Command {
    /// A command with every field zero except the opcode.
    #[must_use]
    pub const fn new(opcode: Opcode) -> Self {
        Self {
            opcode,
            flags: 0,
            port: 0,
            qn: 0,
            qn2: 0,
            pd: 0,
            log_size: 0,
            dboffs: 0,
            ptr1: 0,
            ptr2: 0,
            prod_ptr: 0,
            cons_ptr: 0,
        }
    }

    /// NOP.
    #[must_use]
    pub const fn nop() -> Self {
        Self::new(Opcode::Nop)
    }

    fn create(kind: QueueKind, port: u32, qn: u32, qn2: u32, log_size: u32, base: u64) -> Self {
        Self {
            port,
            qn,
            qn2,
            log_size,
            ptr1: base,
            ..Self::new(Opcode::queue(Action::Create, kind))
        }
    }

    /// CREATE_EQ.
    #[must_use]
    pub fn create_eq(port: u32, eqn: u32, log_size: u32, base: u64) -> Self {
        Self::create(QueueKind::Eq, port, eqn, 0, log_size, base)
    }

    /// CREATE_CQ, attached to event queue `eqn`.
    #[must_use]
    pub fn create_cq(port: u32, cqn: u32, eqn: u32, log_size: u32, base: u64) -> Self {
        Self::create(QueueKind::Cq, port, cqn, eqn, log_size, base)
    }

    /// CREATE_SQ, completing into `cqn`.
    #[must_use]
    pub fn create_sq(port: u32, sqn: u32, cqn: u32, log_size: u32, base: u64) -> Self {
        Self::create(QueueKind::Sq, port, sqn, cqn, log_size, base)
    }

    /// CREATE_RQ, completing into `cqn`.
    #[must_use]
    pub fn create_rq(port: u32, rqn: u32, cqn: u32, log_size: u32, base: u64) -> Self {
        Self::create(QueueKind::Rq, port, rqn, cqn, log_size, base)
    }

    /// MODIFY for queue `qn` of `kind`. Callers fill in the fields to change.
    #[must_use]
    pub fn modify(kind: QueueKind, port: u32, qn: u32) -> Self {
        Self {
            port,
            qn,
            ..Self::new(Opcode::queue(Action::Modify, kind))
        }
    }

    /// QUERY for queue `qn` of `kind`.
    #[must_use]
    pub fn query(kind: QueueKind, port: u32, qn: u32) -> Self {
        Self {
            port,
            qn,
            ..Self::new(Opcode::queue(Action::Query, kind))
        }
    }

    /// DESTROY for queue `qn` of `kind`.
    #[must_use]
    pub fn destroy(kind: QueueKind, port: u32, qn: u32) -> Self {
        Self {
            port,
            qn,
            ..Self::new(Opcode::queue(Action::Destroy, kind))
        }
    }

    /// Encode to the 64-byte wire format.
    #[must_use]
    pub fn encode(&self) -> [u8; CMD_LEN] {
        encode_record(self.opcode.raw(), self)
    }

    /// Decode the 64-byte wire format (device side).
    ///
    /// # Errors
    ///
    /// Returns [`UnknownOpcode`] if the opcode field is outside the closed set.
    pub fn decode(bytes: &[u8; CMD_LEN]) -> Result<Self, UnknownOpcode> {
        let raw = u16_at(bytes, 2);
        let opcode = Opcode::from_raw(raw).ok_or(UnknownOpcode(raw))?;
        Ok(decode_record(opcode, bytes))
    }
}

/// Zero-pad a raw command to [`CMD_LEN`] bytes. Returns `None` if it is
/// longer than that.
#[must_use]
pub fn pad_raw(raw: &[u8]) -> Option<[u8; CMD_LEN]> {
    if raw.len() > CMD_LEN {
        return None;
    }
    let mut out = [0u8; CMD_LEN];
    out[..raw.len()].copy_from_slice(raw);
    Some(out)
}

/// Split a 64-byte record into its sixteen little-endian words.
#[must_use]
pub fn to_words(bytes: &[u8; CMD_LEN]) -> [u32; CMD_LEN / 4] {
    let mut words = [0u32; CMD_LEN / 4];
    for (k, word) in words.iter_mut().enumerate() {
        *word = u32_at(bytes, k * 4);
    }
    words
}

/// Join sixteen little-endian words into a 64-byte record.
#[must_use]
pub fn from_words(words: &[u32; CMD_LEN / 4]) -> [u8; CMD_LEN] {
    let mut bytes = [0u8; CMD_LEN];
    for (k, word) in words.iter().enumerate() {
        bytes[k * 4..k * 4 + 4].copy_from_slice(&word.to_le_bytes());
    }
    bytes
}

/// Status value of a successful command.
pub const STATUS_OK: u16 = 0;

/// A 64-byte mailbox response.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Response {
    bytes: [u8; CMD_LEN],
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status())
            .field("words", &self.words())
            .finish()
    }
}

impl Response {
    /// Wrap raw response bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; CMD_LEN]) -> Self {
        Self { bytes }
    }

    /// Build from the sixteen words read out of the response window.
    #[must_use]
    pub fn from_words(words: &[u32; CMD_LEN / 4]) -> Self {
        Self::from_bytes(from_words(words))
    }

    /// Build a response record (device side): the fields of `record` with
    /// `status` in the opcode slot.
    #[must_use]
    pub fn reply(status: u16, record: &Command) -> Self {
        Self::from_bytes(encode_record(status, record))
    }

    /// Raw bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; CMD_LEN] {
        &self.bytes
    }

    /// The sixteen words of the response.
    #[must_use]
    pub fn words(&self) -> [u32; CMD_LEN / 4] {
        to_words(&self.bytes)
    }

    /// Word `k` of the response.
    ///
    /// # Panics
    ///
    /// Panics if `k >= 16`.
    #[must_use]
    pub fn word(&self, k: usize) -> u32 {
        u32_at(&self.bytes, k * 4)
    }

    /// Completion status, [`STATUS_OK`] on success.
    #[must_use]
    pub fn status(&self) -> u16 {
        u16_at(&self.bytes, 2)
    }

    /// Doorbell offset (word 7). Meaningful for CREATE_RQ and CREATE_SQ.
    #[must_use]
    pub fn doorbell_offset(&self) -> u32 {
        self.word(7)
    }

    /// Decode the fields according to the opcode that produced this response.
    #[must_use]
    pub fn decode(&self, opcode: Opcode) -> Reply {
        let rec = decode_record(opcode, &self.bytes);
        match (opcode.action(), opcode.kind()) {
            (Some(Action::Create), Some(kind)) => Reply::Created {
                kind,
                qn: rec.qn,
                doorbell_offset: rec.dboffs,
            },
            (Some(Action::Modify), Some(kind)) => Reply::Modified { kind, qn: rec.qn },
            (Some(Action::Query), Some(kind)) => Reply::Queried {
                kind,
                qn: rec.qn,
                log_size: rec.log_size,
                base_address: rec.ptr1,
                producer: rec.prod_ptr,
                consumer: rec.cons_ptr,
            },
            (Some(Action::Destroy), Some(kind)) => Reply::Destroyed { kind, qn: rec.qn },
            _ => Reply::Nop,
        }
    }
}

/// Typed view of a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    /// NOP completed.
    Nop,
    /// A queue was created.
    Created {
        /// Queue family.
        kind: QueueKind,
        /// Queue number assigned by the device.
        qn: u32,
        /// Doorbell register offset (SQ/RQ only).
        doorbell_offset: u32,
    },
    /// A queue was modified.
    Modified {
        /// Queue family.
        kind: QueueKind,
        /// Queue number.
        qn: u32,
    },
    /// Queue state read back.
    Queried {
        /// Queue family.
        kind: QueueKind,
        /// Queue number.
        qn: u32,
        /// log2 of the ring entry count.
        log_size: u32,
        /// Ring base device address.
        base_address: u64,
        /// Device view of the producer pointer.
        producer: u32,
        /// Device view of the consumer pointer.
        consumer: u32,
    },
    /// A queue was destroyed.
    Destroyed {
        /// Queue family.
        kind: QueueKind,
        /// Queue number.
        qn: u32,
    },
}

fn encode_record(tag: u16, rec: &Command) -> [u8; CMD_LEN] {
    let mut b = [0u8; CMD_LEN];
    b[2..4].copy_from_slice(&tag.to_le_bytes());
    let words = [
        (4, rec.flags),
        (8, rec.port),
        (12, rec.qn),
        (16, rec.qn2),
        (20, rec.pd),
        (24, rec.log_size),
        (28, rec.dboffs),
        (48, rec.prod_ptr),
        (52, rec.cons_ptr),
    ];
    for (at, value) in words {
        b[at..at + 4].copy_from_slice(&value.to_le_bytes());
    }
    b[32..40].copy_from_slice(&rec.ptr1.to_le_bytes());
    b[40..48].copy_from_slice(&rec.ptr2.to_le_bytes());
    b
}

fn decode_record(opcode: Opcode, b: &[u8; CMD_LEN]) -> Command {
    Command {
        opcode,
        flags: u32_at(b, 4),
        port: u32_at(b, 8),
        qn: u32_at(b, 12),
        qn2: u32_at(b, 16),
        pd: u32_at(b, 20),
        log_size: u32_at(b, 24),
        dboffs: u32_at(b, 28),
        ptr1: u64_at(b, 32),
        ptr2: u64_at(b, 40),
        prod_ptr: u32_at(b, 48),
        cons_ptr: u32_at(b, 52),
    }
}

fn u16_at(b: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([b[at], b[at + 1]])
}

fn u32_at(b: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]])
}

fn u64_at(b: &[u8], at: usize) -> u64 {
    u64::from(u32_at(b, at)) | (u64::from(u32_at(b, at + 4)) << 32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_values() {
        assert_eq!(Opcode::Nop.raw(), 0x0000);
        assert_eq!(Opcode::CreateCq.raw(), 0x0210);
        assert_eq!(Opcode::DestroySq.raw(), 0x0223);
        assert_eq!(Opcode::QueryRq.raw(), 0x0232);
        assert_eq!(Opcode::queue(Action::Modify, QueueKind::Eq), Opcode::ModifyEq);
        assert_eq!(Opcode::from_raw(0x0240), None);
        assert_eq!(Opcode::Nop.kind(), None);
        assert_eq!(Opcode::Nop.action(), None);
        assert_eq!(Opcode::DestroyRq.to_string(), "DESTROY_RQ");
    }

    #[test]
    fn queue_opcodes_round_trip_kind_and_action() {
        let kinds = [QueueKind::Eq, QueueKind::Cq, QueueKind::Sq, QueueKind::Rq];
        let actions = [Action::Create, Action::Modify, Action::Query, Action::Destroy];
        for (k, kind) in kinds.into_iter().enumerate() {
            for (a, action) in actions.into_iter().enumerate() {
                let op = Opcode::queue(action, kind);
                assert_eq!(op.kind(), Some(kind));
                assert_eq!(op.action(), Some(action));
                assert_eq!(usize::from(op.raw()), 0x0200 + 0x10 * k + a);
            }
        }
    }

    #[test]
    fn every_opcode_encodes_to_64_bytes_and_decodes_back() {
        for op in ALL_OPCODES {
            let cmd = Command {
                flags: 0xa5a5_0001,
                port: 3,
                qn: 7,
                qn2: 1,
                pd: 2,
                log_size: 8,
                dboffs: 0x1234,
                ptr1: 0x0000_0012_3456_7000,
                ptr2: 0xdead_beef_0000_0000,
                prod_ptr: 11,
                cons_ptr: 12,
                ..Command::new(op)
            };
            let bytes = cmd.encode();
            assert_eq!(bytes.len(), CMD_LEN);
            assert_eq!(Command::decode(&bytes), Ok(cmd), "{op}");
        }
    }

    #[test]
    fn create_cq_layout_matches_wire_contract() {
        let bytes = Command::create_cq(1, 0, 0, 8, 0x1_0000_2000).encode();
        assert_eq!(&bytes[0..4], &[0x00, 0x00, 0x10, 0x02]);
        assert_eq!(u32_at(&bytes, 8), 1);
        assert_eq!(u32_at(&bytes, 24), 8);
        assert_eq!(u64_at(&bytes, 32), 0x1_0000_2000);
        assert!(bytes[56..].iter().all(|&b| b == 0));
    }

    #[test]
    fn decode_rejects_unknown_opcode() {
        let mut bytes = Command::nop().encode();
        bytes[2] = 0x41;
        bytes[3] = 0x02;
        assert_eq!(Command::decode(&bytes), Err(UnknownOpcode(0x0241)));
    }

    #[test]
    fn pad_raw_pads_and_rejects_oversize() {
        let padded = pad_raw(&[1, 2, 3]).unwrap();
        assert_eq!(&padded[..3], &[1, 2, 3]);
        assert!(padded[3..].iter().all(|&b| b == 0));
        assert!(pad_raw(&[0u8; 64]).is_some());
        assert!(pad_raw(&[0u8; 65]).is_none());
    }

    #[test]
    fn response_doorbell_is_word_seven() {
        let record = Command {
            qn: 4,
            dboffs: 0x8000,
            ..Command::new(Opcode::CreateRq)
        };
        let rsp = Response::reply(STATUS_OK, &record);
        assert_eq!(rsp.status(), STATUS_OK);
        assert_eq!(rsp.doorbell_offset(), 0x8000);
        assert_eq!(
            rsp.decode(Opcode::CreateRq),
            Reply::Created {
                kind: QueueKind::Rq,
                qn: 4,
                doorbell_offset: 0x8000
            }
        );
        assert_eq!(Response::from_words(&rsp.words()), rsp);
    }

    #[test]
    fn query_reply_carries_ring_state() {
        let record = Command {
            qn: 1,
            log_size: 8,
            ptr1: 0x4000,
            prod_ptr: 300,
            cons_ptr: 290,
            ..Command::new(Opcode::QueryCq)
        };
        let rsp = Response::reply(STATUS_OK, &record);
        assert_eq!(
            rsp.decode(Opcode::QueryCq),
            Reply::Queried {
                kind: QueueKind::Cq,
                qn: 1,
                log_size: 8,
                base_address: 0x4000,
                producer: 300,
                consumer: 290
            }
        );
    }
}
