//! Ring entry layouts.
//!
//! ```text
//! Descriptor (16 bytes)             Completion (16 bytes)
//! byte  0  u16 rsvd                 word 0  reserved
//! byte  2  u16 csum_cmd (TX)        word 1  len
//! byte  4  u32 len                  word 2  ts_ns
//! byte  8  u64 addr                 word 3  ts_fns[15:0] ts_s[23:16] phase[31]
//! ```

/// Size of a descriptor and of a completion record.
pub const ENTRY_SIZE: usize = 16;

/// Phase bit in completion word 3.
pub const CPL_PHASE: u32 = 0x8000_0000;

/// A work queue descriptor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Descriptor {
    /// Buffer length in bytes.
    pub len: u32,
    /// Buffer device address.
    pub addr: u64,
}

impl Descriptor {
    /// Encode to wire format.
    #[must_use]
    pub fn encode(&self) -> [u8; ENTRY_SIZE] {
        let mut b = [0u8; ENTRY_SIZE];
        b[4..8].copy_from_slice(&self.len.to_le_bytes());
        b[8..16].copy_from_slice(&self.addr.to_le_bytes());
        b
    }

    /// Decode from wire format.
    #[must_use]
    pub fn decode(b: &[u8; ENTRY_SIZE]) -> Self {
        let mut addr = [0u8; 8];
        addr.copy_from_slice(&b[8..16]);
        Self {
            len: u32::from_le_bytes([b[4], b[5], b[6], b[7]]),
            addr: u64::from_le_bytes(addr),
        }
    }
}

/// A completion record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Completion {
    /// Received length (RX completions).
    pub len: u32,
    /// Timestamp nanoseconds.
    pub ts_ns: u32,
    /// Timestamp fractional nanoseconds.
    pub ts_fns: u16,
    /// Low byte of the timestamp seconds.
    pub ts_s: u8,
    /// Phase bit as written by the device.
    pub phase: bool,
}

impl Completion {
    /// Decode from the four little-endian words of a record.
    #[must_use]
    pub fn from_words(words: [u32; 4]) -> Self {
        Self {
            len: words[1],
            ts_ns: words[2],
            ts_fns: (words[3] & 0xffff) as u16,
            ts_s: ((words[3] >> 16) & 0xff) as u8,
            phase: words[3] & CPL_PHASE != 0,
        }
    }

    /// Decode from wire format.
    #[must_use]
    pub fn decode(b: &[u8; ENTRY_SIZE]) -> Self {
        Self::from_words(words(b))
    }

    /// Encode to wire format (device side).
    #[must_use]
    pub fn encode(&self) -> [u8; ENTRY_SIZE] {
        let mut w3 = u32::from(self.ts_fns) | (u32::from(self.ts_s) << 16);
        if self.phase {
            w3 |= CPL_PHASE;
        }
        let mut b = [0u8; ENTRY_SIZE];
        b[4..8].copy_from_slice(&self.len.to_le_bytes());
        b[8..12].copy_from_slice(&self.ts_ns.to_le_bytes());
        b[12..16].copy_from_slice(&w3.to_le_bytes());
        b
    }
}

/// The four little-endian words of a 16-byte record.
#[must_use]
pub fn words(b: &[u8; ENTRY_SIZE]) -> [u32; 4] {
    let mut out = [0u32; 4];
    for (k, w) in out.iter_mut().enumerate() {
        *w = u32::from_le_bytes([b[k * 4], b[k * 4 + 1], b[k * 4 + 2], b[k * 4 + 3]]);
    }
    out
}
