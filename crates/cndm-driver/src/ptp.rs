//! PTP hardware clock and completion timestamps.
//!
//! Completion records carry the nanoseconds and only the low byte of the
//! seconds counter. Each port keeps the full seconds value it last read
//! from the clock and rebuilds timestamps around it; the cache is re-read
//! when bits 4..8 disagree with a completion or the clock was stepped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use cndm_chip::desc::Completion;
use cndm_chip::regs::phc;
use tracing::{debug, info};

use crate::device::RegisterWindow;
use crate::error::Result;

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Steps up to this size go through the atomic offset register; larger
/// ones read, adjust and rewrite the clock.
pub const MAX_ATOMIC_STEP_NS: u64 = 536_000_000;

/// A hardware timestamp.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HwTimestamp {
    /// Seconds
    pub secs: u64,
    /// Nanoseconds within the second
    pub nanos: u32,
}

impl HwTimestamp {
    /// `secs` seconds and `nanos` nanoseconds.
    pub const fn new(secs: u64, nanos: u32) -> Self {
        Self { secs, nanos }
    }

    /// Total nanoseconds.
    #[allow(clippy::cast_lossless)]
    pub const fn as_nanos(self) -> u128 {
        self.secs as u128 * NANOS_PER_SEC + self.nanos as u128
    }

    /// Split a nanosecond count. Saturates past `u64::MAX` seconds.
    #[allow(clippy::cast_possible_truncation)]
    pub fn from_nanos(nanos: u128) -> Self {
        Self {
            secs: u64::try_from(nanos / NANOS_PER_SEC).unwrap_or(u64::MAX),
            nanos: (nanos % NANOS_PER_SEC) as u32,
        }
    }

    /// Shift by `delta` nanoseconds, clamping at zero.
    #[must_use]
    pub fn saturating_add_nanos(self, delta: i64) -> Self {
        let total = self.as_nanos();
        let moved = if delta < 0 {
            total.saturating_sub(u128::from(delta.unsigned_abs()))
        } else {
            total.saturating_add(u128::from(delta.unsigned_abs()))
        };
        Self::from_nanos(moved)
    }
}

impl From<Duration> for HwTimestamp {
    fn from(d: Duration) -> Self {
        Self::new(d.as_secs(), d.subsec_nanos())
    }
}

/// The clock block of a device.
#[derive(Debug)]
pub struct PhcClock<R: RegisterWindow> {
    regs: Arc<R>,
    base: u32,
    generation: AtomicU64,
}

impl<R: RegisterWindow> PhcClock<R> {
    /// Clock whose registers start at `base` in `regs`.
    pub fn new(regs: Arc<R>, base: u32) -> Self {
        Self {
            regs,
            base,
            generation: AtomicU64::new(0),
        }
    }

    /// Offset of the clock block.
    pub const fn base(&self) -> u32 {
        self.base
    }

    /// Bumped whenever the clock is set or stepped.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    async fn read(&self, reg: u32) -> Result<u32> {
        self.regs.read_dword(self.base + reg).await
    }

    async fn write(&self, reg: u32, value: u32) -> Result<()> {
        self.regs.write_dword(self.base + reg, value).await
    }

    async fn read_u64(&self, lo: u32, hi: u32) -> Result<u64> {
        let lo = self.read(lo).await?;
        let hi = self.read(hi).await?;
        Ok(u64::from(hi) << 32 | u64::from(lo))
    }

    /// Latch and read the current time.
    ///
    /// # Errors
    ///
    /// Register access errors.
    pub async fn time(&self) -> Result<HwTimestamp> {
        self.read(phc::SNAPSHOT).await?;
        let nanos = self.read(phc::GET_NS).await?;
        let secs = self.read_u64(phc::GET_SEC_L, phc::GET_SEC_H).await?;
        Ok(HwTimestamp::new(secs, nanos))
    }

    /// Seconds counter, without latching.
    ///
    /// # Errors
    ///
    /// Register access errors.
    pub async fn seconds(&self) -> Result<u64> {
        self.read_u64(phc::CUR_SEC_L, phc::CUR_SEC_H).await
    }

    /// Load `ts` into the clock.
    ///
    /// # Errors
    ///
    /// Register access errors.
    #[allow(clippy::cast_possible_truncation)]
    pub async fn set_time(&self, ts: HwTimestamp) -> Result<()> {
        self.write(phc::SET_NS, ts.nanos).await?;
        self.write(phc::SET_SEC_L, ts.secs as u32).await?;
        self.write(phc::SET_SEC_H, (ts.secs >> 32) as u32).await?;
        self.generation.fetch_add(1, Ordering::AcqRel);
        debug!("PHC set to {}.{:09}", ts.secs, ts.nanos);
        Ok(())
    }

    /// Step the clock by `delta_ns`.
    ///
    /// # Errors
    ///
    /// Register access errors.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub async fn adjust_time(&self, delta_ns: i64) -> Result<()> {
        debug!("PHC step {} ns", delta_ns);
        if delta_ns.unsigned_abs() > MAX_ATOMIC_STEP_NS {
            let now = self.time().await?;
            return self.set_time(now.saturating_add_nanos(delta_ns)).await;
        }
        self.write(phc::OFFSET_NS, delta_ns as u32).await?;
        self.generation.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Nominal clock period, 32.32 fixed-point nanoseconds.
    ///
    /// # Errors
    ///
    /// Register access errors.
    pub async fn nominal_period(&self) -> Result<u64> {
        let period = self.read_u64(phc::NOM_PERIOD_L, phc::NOM_PERIOD_H).await?;
        Ok(if period == 0 { phc::DEFAULT_PERIOD } else { period })
    }

    /// Tune the frequency by `scaled_ppm` (parts per million with a 16-bit
    /// fraction). Returns the period now in use.
    ///
    /// # Errors
    ///
    /// Register access errors.
    #[allow(clippy::cast_possible_truncation)]
    pub async fn adjust_fine(&self, scaled_ppm: i64) -> Result<u64> {
        let nominal = self.nominal_period().await?;
        let adj = (u128::from(nominal >> 16) * u128::from(scaled_ppm.unsigned_abs()) + 500_000)
            / 1_000_000;
        let adj = u64::try_from(adj).unwrap_or(u64::MAX);
        let period = if scaled_ppm < 0 {
            nominal.saturating_sub(adj)
        } else {
            nominal.saturating_add(adj)
        };
        self.write(phc::PERIOD_L, period as u32).await?;
        self.write(phc::PERIOD_H, (period >> 32) as u32).await?;
        debug!("PHC scaled_ppm {} period {:#x}", scaled_ppm, period);
        Ok(period)
    }

    /// Load the host's real-time clock. Returns the value written.
    ///
    /// # Errors
    ///
    /// Register access errors.
    pub async fn set_from_system_clock(&self) -> Result<HwTimestamp> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let ts = HwTimestamp::from(now);
        self.set_time(ts).await?;
        info!("PHC at {:#x} set from system clock", self.base);
        Ok(ts)
    }
}

/// Rebuilds full timestamps from completion records.
#[derive(Debug, Default, Clone, Copy)]
pub struct TimestampExtender {
    seconds: Option<(u64, u64)>,
}

impl TimestampExtender {
    /// `true` when the cached seconds cannot be trusted for a completion
    /// carrying `ts_s`, or were read before clock step `generation`.
    pub fn is_stale(&self, ts_s: u8, generation: u64) -> bool {
        self.seconds.map_or(true, |(secs, seen)| {
            seen != generation || (secs ^ u64::from(ts_s)) & 0xf0 != 0
        })
    }

    /// Cache `seconds` read from the clock at `generation`.
    pub fn update(&mut self, seconds: u64, generation: u64) {
        self.seconds = Some((seconds, generation));
    }

    /// Full timestamp of `cpl`: the seconds value nearest the cache whose
    /// low byte matches. Without a cache only the low byte is known.
    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    pub fn extend(&self, cpl: &Completion) -> HwTimestamp {
        let secs = match self.seconds {
            Some((cached, _)) => {
                let delta = cpl.ts_s.wrapping_sub(cached as u8) as i8;
                cached.wrapping_add_signed(i64::from(delta))
            }
            None => u64::from(cpl.ts_s),
        };
        HwTimestamp::new(secs, cpl.ts_ns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cpl(ts_s: u8, ts_ns: u32) -> Completion {
        Completion {
            ts_s,
            ts_ns,
            ..Completion::default()
        }
    }

    #[test]
    fn timestamp_arithmetic() {
        let ts = HwTimestamp::new(100, 999_999_999);
        assert_eq!(ts.as_nanos(), 100_999_999_999);
        assert_eq!(ts.saturating_add_nanos(1), HwTimestamp::new(101, 0));
        assert_eq!(
            ts.saturating_add_nanos(-2_000_000_000),
            HwTimestamp::new(98, 999_999_999)
        );
        assert_eq!(ts.saturating_add_nanos(i64::MIN), HwTimestamp::default());
        assert_eq!(
            HwTimestamp::from(Duration::from_millis(1500)),
            HwTimestamp::new(1, 500_000_000)
        );
    }

    #[test]
    fn extender_without_cache_uses_low_byte() {
        let ext = TimestampExtender::default();
        assert!(ext.is_stale(0x12, 0));
        assert_eq!(ext.extend(&cpl(0x12, 7)), HwTimestamp::new(0x12, 7));
    }

    #[test]
    fn extender_splices_nearest_seconds() {
        let mut ext = TimestampExtender::default();
        ext.update(0x6543_2134, 3);
        assert!(!ext.is_stale(0x35, 3));
        assert!(!ext.is_stale(0x3f, 3));
        assert!(ext.is_stale(0x45, 3));
        assert!(ext.is_stale(0x35, 4));
        assert_eq!(ext.extend(&cpl(0x35, 10)), HwTimestamp::new(0x6543_2135, 10));
        assert_eq!(ext.extend(&cpl(0x30, 0)).secs, 0x6543_2130);

        // Completions straddling a low-byte rollover.
        ext.update(0x1ff, 0);
        assert_eq!(ext.extend(&cpl(0x00, 0)).secs, 0x200);
        ext.update(0x200, 0);
        assert_eq!(ext.extend(&cpl(0xff, 0)).secs, 0x1ff);
    }
}
