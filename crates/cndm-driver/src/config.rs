//! Driver configuration.
//!
//! Defaults reproduce the reference bring-up: 256-entry rings, 4 KiB packet
//! buffers, 10 bytes of TX headroom, refill in batches of at least 8 and
//! 32 interrupt vectors. No PTP clock is assumed; RX timestamps are on.

use std::ops::RangeInclusive;
use std::time::Duration;

use cndm_chip::regs::phc;
use cndm_chip::ring::{RingGeometry, MAX_LOG_SIZE};

use crate::error::{CndmError, Result};

/// Mailbox polling policy.
///
/// The first `spin_polls` busy reads only yield to the scheduler; later
/// reads sleep, doubling from `initial_backoff` up to `max_backoff`. A
/// command still busy after `max_polls` reads fails with
/// [`CndmError::DeviceTimeout`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MailboxConfig {
    /// Busy reads before giving up
    pub max_polls: u32,
    /// Busy reads answered with a plain yield
    pub spin_polls: u32,
    /// First sleep after the spin phase
    pub initial_backoff: Duration,
    /// Sleep ceiling
    pub max_backoff: Duration,
}

impl Default for MailboxConfig {
    fn default() -> Self {
        Self {
            max_polls: 10_000,
            spin_polls: 64,
            initial_backoff: Duration::from_micros(1),
            max_backoff: Duration::from_micros(100),
        }
    }
}

impl MailboxConfig {
    /// Sleep before busy read number `poll` (0-based), `None` during the
    /// spin phase.
    #[must_use]
    pub fn backoff(&self, poll: u32) -> Option<Duration> {
        let step = poll.checked_sub(self.spin_polls)?;
        let factor = 1u32.checked_shl(step.min(31)).unwrap_or(u32::MAX);
        Some(
            self.initial_backoff
                .saturating_mul(factor)
                .min(self.max_backoff),
        )
    }
}

/// Driver-wide configuration shared by every port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverConfig {
    /// log2 of the RX descriptor ring size (its completion ring matches)
    pub rx_ring_log_size: u32,

    /// log2 of the TX descriptor ring size (its completion ring matches)
    pub tx_ring_log_size: u32,

    /// Bytes per packet buffer
    pub packet_size: usize,

    /// Offset of the TX payload inside its buffer
    pub headroom: usize,

    /// Smallest RX refill batch
    pub refill_low_water: u32,

    /// Interrupt vectors requested as `min..=max`
    pub irq_vectors: RangeInclusive<u32>,

    /// Mailbox polling policy
    pub mailbox: MailboxConfig,

    /// BAR0 offset of the PTP hardware clock block, if the device has one
    pub phc_offset: Option<u32>,

    /// Attach completion timestamps to received frames
    pub rx_timestamps: bool,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            rx_ring_log_size: 8,
            tx_ring_log_size: 8,
            packet_size: 4096,
            headroom: 10,
            refill_low_water: 8,
            irq_vectors: 32..=32,
            mailbox: MailboxConfig::default(),
            phc_offset: None,
            rx_timestamps: true,
        }
    }
}

impl DriverConfig {
    /// Set both ring sizes.
    #[must_use]
    pub fn with_ring_log_size(mut self, log_size: u32) -> Self {
        self.rx_ring_log_size = log_size;
        self.tx_ring_log_size = log_size;
        self
    }

    /// Set the RX ring size.
    #[must_use]
    pub fn with_rx_ring_log_size(mut self, log_size: u32) -> Self {
        self.rx_ring_log_size = log_size;
        self
    }

    /// Set the TX ring size.
    #[must_use]
    pub fn with_tx_ring_log_size(mut self, log_size: u32) -> Self {
        self.tx_ring_log_size = log_size;
        self
    }

    /// Set the packet buffer size.
    #[must_use]
    pub fn with_packet_size(mut self, packet_size: usize) -> Self {
        self.packet_size = packet_size;
        self
    }

    /// Set the TX headroom.
    #[must_use]
    pub fn with_headroom(mut self, headroom: usize) -> Self {
        self.headroom = headroom;
        self
    }

    /// Set the RX refill low-water mark.
    #[must_use]
    pub fn with_refill_low_water(mut self, low_water: u32) -> Self {
        self.refill_low_water = low_water;
        self
    }

    /// Set the requested interrupt vector range.
    #[must_use]
    pub fn with_irq_vectors(mut self, vectors: RangeInclusive<u32>) -> Self {
        self.irq_vectors = vectors;
        self
    }

    /// Set the mailbox polling policy.
    #[must_use]
    pub fn with_mailbox(mut self, mailbox: MailboxConfig) -> Self {
        self.mailbox = mailbox;
        self
    }

    /// Use the PTP hardware clock at `offset`.
    #[must_use]
    pub fn with_phc(mut self, offset: u32) -> Self {
        self.phc_offset = Some(offset);
        self
    }

    /// Turn RX timestamps on or off.
    #[must_use]
    pub fn with_rx_timestamps(mut self, enabled: bool) -> Self {
        self.rx_timestamps = enabled;
        self
    }

    /// RX ring geometry.
    ///
    /// # Errors
    ///
    /// Returns [`CndmError::InvalidConfig`] above the largest ring.
    pub fn rx_ring(&self) -> Result<RingGeometry> {
        ring(self.rx_ring_log_size, "rx_ring_log_size")
    }

    /// TX ring geometry.
    ///
    /// # Errors
    ///
    /// Returns [`CndmError::InvalidConfig`] above the largest ring.
    pub fn tx_ring(&self) -> Result<RingGeometry> {
        ring(self.tx_ring_log_size, "tx_ring_log_size")
    }

    /// Usable TX payload bytes per buffer.
    #[must_use]
    pub fn max_payload(&self) -> usize {
        self.packet_size.saturating_sub(self.headroom)
    }

    /// Check the configuration before any hardware is touched.
    ///
    /// # Errors
    ///
    /// Returns [`CndmError::InvalidConfig`] describing the first violation.
    pub fn validate(&self) -> Result<()> {
        let rx = self.rx_ring()?;
        self.tx_ring()?;

        if self.packet_size == 0 || u32::try_from(self.packet_size).is_err() {
            return Err(CndmError::invalid_config(format!(
                "packet_size {} must be between 1 and u32::MAX",
                self.packet_size
            )));
        }
        if self.headroom >= self.packet_size {
            return Err(CndmError::invalid_config(format!(
                "headroom {} leaves no room in a {}-byte buffer",
                self.headroom, self.packet_size
            )));
        }
        if self.refill_low_water > rx.size() {
            return Err(CndmError::invalid_config(format!(
                "refill_low_water {} exceeds RX ring size {}",
                self.refill_low_water,
                rx.size()
            )));
        }
        let (min, max) = (*self.irq_vectors.start(), *self.irq_vectors.end());
        if min == 0 || min > max {
            return Err(CndmError::invalid_config(format!(
                "irq_vectors {min}..={max} must be a non-empty range starting at 1 or above"
            )));
        }
        if self.mailbox.max_polls == 0 {
            return Err(CndmError::invalid_config("mailbox.max_polls must be at least 1"));
        }
        if self.mailbox.initial_backoff > self.mailbox.max_backoff {
            return Err(CndmError::invalid_config(
                "mailbox.initial_backoff exceeds mailbox.max_backoff",
            ));
        }
        if let Some(offset) = self.phc_offset {
            if offset % 4 != 0 || offset.checked_add(phc::BLOCK_SIZE).is_none() {
                return Err(CndmError::invalid_config(format!(
                    "phc_offset {offset:#x} must be word aligned inside BAR0"
                )));
            }
        }
        Ok(())
    }
}

fn ring(log_size: u32, field: &str) -> Result<RingGeometry> {
    RingGeometry::new(log_size).ok_or_else(|| {
        CndmError::invalid_config(format!("{field} {log_size} exceeds {MAX_LOG_SIZE}"))
    })
}
