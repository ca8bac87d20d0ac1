//! BAR0 register map.
//!
//! ```text
//! 0x00100  PORT_COUNT     number of ports                       (read)
//! 0x00104  PORT_OFFSET    offset of the per-port register table (read)
//! 0x00108  PORT_STRIDE    stride between per-port blocks        (read)
//! 0x00200  MBOX_CTRL      write 1 = execute, bit 0 = busy       (read/write)
//! 0x10000  MBOX_CMD       16 × u32 command words                (write)
//! 0x10040  MBOX_RSP       16 × u32 response words               (read)
//! ```
//!
//! All registers are 32 bits wide and little endian. Doorbell offsets are
//! not fixed; the device returns them in the CREATE_RQ / CREATE_SQ response.
//!
//! Devices with a PTP hardware clock map its block somewhere in BAR0; the
//! [`phc`] offsets are relative to that block.

// ── Device configuration ─────────────────────────────────────────────────────

/// Number of ports implemented by the device.
pub const PORT_COUNT: u32 = 0x0100;

/// Offset of the per-port register table.
pub const PORT_OFFSET: u32 = 0x0104;

/// Stride between consecutive per-port register blocks.
pub const PORT_STRIDE: u32 = 0x0108;

// ── Mailbox ──────────────────────────────────────────────────────────────────

/// Mailbox control register. Write [`mbox::EXECUTE`] to run the command
/// currently held in the command window; read back [`mbox::BUSY`].
pub const MBOX_CTRL: u32 = 0x0200;

/// Command window base: word `k` lives at `MBOX_CMD + 4 * k`.
pub const MBOX_CMD: u32 = 0x1_0000;

/// Response window base: word `k` lives at `MBOX_RSP + 4 * k`.
pub const MBOX_RSP: u32 = 0x1_0040;

/// Number of 32-bit words in the command and response windows.
pub const MBOX_WORDS: usize = 16;

/// Mailbox control bit definitions.
pub mod mbox {
    /// Written to [`super::MBOX_CTRL`] to start execution.
    pub const EXECUTE: u32 = 0x0000_0001;
    /// Set while the device is processing a command.
    pub const BUSY: u32 = 0x0000_0001;
}

/// Offset of command word `k`.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub const fn mbox_cmd_word(k: usize) -> u32 {
    MBOX_CMD + (k as u32) * 4
}

/// Offset of response word `k`.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub const fn mbox_rsp_word(k: usize) -> u32 {
    MBOX_RSP + (k as u32) * 4
}

/// Doorbells carry only the low 16 bits of the producer counter.
pub const DOORBELL_MASK: u32 = 0xffff;

// ── PTP hardware clock ───────────────────────────────────────────────────────

/// PTP hardware clock registers, relative to the clock block.
///
/// ```text
/// 0x18  CUR_SEC_L / 0x1C CUR_SEC_H   free-running seconds       (read)
/// 0x30  SNAPSHOT                     read latches GET_*         (read)
/// 0x34  GET_NS / 0x38 GET_SEC_L / 0x3C GET_SEC_H                (read)
/// 0x50  OFFSET_NS                    signed nanosecond step     (write)
/// 0x54  SET_NS / 0x58 SET_SEC_L / 0x5C SET_SEC_H (commits)      (write)
/// 0x70  NOM_PERIOD_L / 0x74 NOM_PERIOD_H  nominal period, 32.32 ns (read)
/// 0x78  PERIOD_L / 0x7C PERIOD_H          period in use           (write)
/// ```
pub mod phc {
    /// Current seconds, low word.
    pub const CUR_SEC_L: u32 = 0x18;
    /// Current seconds, high word.
    pub const CUR_SEC_H: u32 = 0x1C;
    /// Reading this latches the time into the `GET_*` registers.
    pub const SNAPSHOT: u32 = 0x30;
    /// Latched nanoseconds.
    pub const GET_NS: u32 = 0x34;
    /// Latched seconds, low word.
    pub const GET_SEC_L: u32 = 0x38;
    /// Latched seconds, high word.
    pub const GET_SEC_H: u32 = 0x3C;
    /// Atomic signed offset in nanoseconds.
    pub const OFFSET_NS: u32 = 0x50;
    /// New nanoseconds.
    pub const SET_NS: u32 = 0x54;
    /// New seconds, low word.
    pub const SET_SEC_L: u32 = 0x58;
    /// New seconds, high word. Writing it loads `SET_*` into the clock.
    pub const SET_SEC_H: u32 = 0x5C;
    /// Nominal period, low word.
    pub const NOM_PERIOD_L: u32 = 0x70;
    /// Nominal period, high word.
    pub const NOM_PERIOD_H: u32 = 0x74;
    /// Period in use, low word.
    pub const PERIOD_L: u32 = 0x78;
    /// Period in use, high word.
    pub const PERIOD_H: u32 = 0x7C;
    /// Size of the clock block.
    pub const BLOCK_SIZE: u32 = 0x80;

    /// Period assumed when the device reports no nominal period: 4 ns in
    /// 32.32 fixed point.
    pub const DEFAULT_PERIOD: u64 = 0x4_0000_0000;
}
