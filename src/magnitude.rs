//! I/Q to magnitude conversion.
//!
//! Raw samples are interleaved unsigned 8-bit I/Q pairs biased around
//! 127.5. A 256×256 lookup table keyed directly on the raw bytes turns
//! each pair into a 16-bit magnitude without per-sample arithmetic.

use std::time::SystemTime;

use crate::decoder::{MODES_LONG_MSG_BITS, MODES_PREAMBLE_US};
use crate::signal::PowerLut;

/// Samples carried over from the tail of one block to the head of the
/// next so a frame straddling the boundary is never lost. Sized for a
/// full long frame plus preamble at 2.4 MHz, with scan margin.
pub const TRAILING_SAMPLES: usize = (MODES_PREAMBLE_US + MODES_LONG_MSG_BITS + 16) * 12 / 5;

/// New samples per block (I/Q byte count is twice this).
pub const MODES_ASYNC_BUF_SAMPLES: usize = 128 * 1024;

/// Magnitude lookup table indexed by the raw (I, Q) byte pair.
pub struct MagnitudeLut {
    table: Vec<u16>,
}

impl MagnitudeLut {
    pub fn new() -> Self {
        let mut table = vec![0u16; 256 * 256];
        for i in 0..256usize {
            for q in 0..256usize {
                let fi = (i as f64 - 127.5) / 127.5;
                let fq = (q as f64 - 127.5) / 127.5;
                // Full scale (|I| = |Q| = 1) maps to u16::MAX.
                let mag = (fi * fi + fq * fq).sqrt() / std::f64::consts::SQRT_2;
                table[(i << 8) | q] = (mag * 65535.0).round().min(65535.0) as u16;
            }
        }
        Self { table }
    }

    #[inline]
    pub fn lookup(&self, i: u8, q: u8) -> u16 {
        self.table[((i as usize) << 8) | q as usize]
    }
}

impl Default for MagnitudeLut {
    fn default() -> Self {
        Self::new()
    }
}

/// One demodulator input block: the previous block's tail followed by
/// freshly converted samples, plus the bookkeeping the demodulator and
/// the statistics need.
pub struct MagnitudeBuffer {
    /// `TRAILING_SAMPLES` carried over, then `length` new samples.
    pub data: Vec<u16>,
    /// Number of new samples in this block (valid scan starts).
    pub length: usize,
    /// 12 MHz clock timestamp of `data[0]`.
    pub sample_timestamp: u64,
    /// Wall-clock time at the start of the block.
    pub sys_timestamp: SystemTime,
    /// Mean of normalized (0..1) signal level over the new samples.
    pub mean_level: f64,
    /// Mean of normalized (0..1) power over the new samples.
    pub mean_power: f64,
    /// Samples the reader had to discard before this block.
    pub dropped: u64,
}

impl MagnitudeBuffer {
    pub fn new() -> Self {
        Self {
            data: vec![0u16; TRAILING_SAMPLES + MODES_ASYNC_BUF_SAMPLES],
            length: 0,
            sample_timestamp: 0,
            sys_timestamp: SystemTime::now(),
            mean_level: 0.0,
            mean_power: 0.0,
            dropped: 0,
        }
    }

    /// Convert one block of interleaved I/Q bytes, preserving the tail
    /// of the previous block at the front. `sample_timestamp` is the
    /// 12 MHz timestamp of the first *new* sample; the stored timestamp
    /// is backdated to cover the carried-over samples.
    pub fn fill(
        &mut self,
        iq: &[u8],
        lut: &MagnitudeLut,
        power: &PowerLut,
        sample_timestamp: u64,
    ) {
        debug_assert!(iq.len() % 2 == 0);
        let new_samples = iq.len() / 2;
        debug_assert!(new_samples <= MODES_ASYNC_BUF_SAMPLES);

        // Carry the previous tail forward.
        let prev_end = TRAILING_SAMPLES + self.length;
        if self.length >= TRAILING_SAMPLES {
            self.data.copy_within(prev_end - TRAILING_SAMPLES..prev_end, 0);
        } else {
            // First block (or a very short one): quiet history.
            self.data[..TRAILING_SAMPLES].fill(0);
        }

        let mut level_sum = 0.0f64;
        let mut power_sum = 0.0f64;
        for (out, pair) in self.data[TRAILING_SAMPLES..TRAILING_SAMPLES + new_samples]
            .iter_mut()
            .zip(iq.chunks_exact(2))
        {
            let m = lut.lookup(pair[0], pair[1]);
            *out = m;
            level_sum += m as f64 / 65535.0;
            power_sum += power.power(m) as f64;
        }
        // End-of-stream guard: anything past the new samples reads as
        // silence for the final scan.
        self.data[TRAILING_SAMPLES + new_samples..].fill(0);

        self.length = new_samples;
        self.sample_timestamp =
            sample_timestamp.saturating_sub(TRAILING_SAMPLES as u64 * 5); // 12 MHz ticks per sample
        self.sys_timestamp = SystemTime::now();
        if new_samples > 0 {
            self.mean_level = level_sum / new_samples as f64;
            self.mean_power = power_sum / new_samples as f64;
        } else {
            self.mean_level = 0.0;
            self.mean_power = 0.0;
        }
    }
}

impl Default for MagnitudeBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lut_extremes() {
        let lut = MagnitudeLut::new();
        // Both rails: full-scale magnitude.
        assert_eq!(lut.lookup(255, 255), lut.lookup(0, 0));
        assert!(lut.lookup(255, 255) > 65000);
        // Mid-rail: as quiet as it gets.
        assert!(lut.lookup(127, 127) < 400);
        assert!(lut.lookup(128, 128) < 400);
        // Single axis at the rail: 1/sqrt(2) of full scale.
        let single = lut.lookup(255, 127) as i32;
        assert!((single - 46341).abs() < 200);
    }

    #[test]
    fn fill_carries_tail_between_blocks() {
        let lut = MagnitudeLut::new();
        let power = PowerLut::new();
        let mut buf = MagnitudeBuffer::new();

        // Block 1: loud everywhere.
        let loud = vec![255u8; 1024 * 2];
        buf.fill(&loud, &lut, &power, 0);
        assert_eq!(buf.length, 1024);
        let tail_value = buf.data[TRAILING_SAMPLES + buf.length - 1];

        // Block 2: quiet; the head must be block 1's loud tail.
        let quiet = vec![127u8; 1024 * 2];
        buf.fill(&quiet, &lut, &power, 1024 * 5);
        assert_eq!(buf.data[TRAILING_SAMPLES - 1], tail_value);
        assert!(buf.data[TRAILING_SAMPLES] < 400);
        assert!(buf.mean_power < 1e-4);
    }
}
