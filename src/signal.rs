//! Signal power accounting.
//!
//! Magnitudes are 16-bit; squaring them on the hot path would cost a
//! multiply per sample, so a 65 536-entry table maps each magnitude to
//! its normalized power once. RSSI is reported in dBFS where 0 dBFS is
//! a full-scale (65535) sample.

/// Power above which a message counts as a strong signal (−3 dBFS).
pub const STRONG_SIGNAL_POWER: f64 = 0.50119;

/// Magnitude → normalized power, `(m / 65535)²`.
pub struct PowerLut {
    table: Vec<f32>,
}

impl PowerLut {
    pub fn new() -> Self {
        let mut table = vec![0.0f32; 65536];
        for (m, entry) in table.iter_mut().enumerate() {
            let f = m as f64 / 65535.0;
            *entry = (f * f) as f32;
        }
        Self { table }
    }

    #[inline]
    pub fn power(&self, magnitude: u16) -> f32 {
        self.table[magnitude as usize]
    }

    /// Mean normalized power over a span of magnitudes.
    pub fn mean_power(&self, magnitudes: &[u16]) -> f64 {
        if magnitudes.is_empty() {
            return 0.0;
        }
        let sum: f64 = magnitudes.iter().map(|&m| self.power(m) as f64).sum();
        sum / magnitudes.len() as f64
    }
}

impl Default for PowerLut {
    fn default() -> Self {
        Self::new()
    }
}

/// Normalized power → dBFS. Clamped at the bottom so silence reads as
/// a finite floor instead of −inf.
pub fn power_to_dbfs(power: f64) -> f64 {
    10.0 * power.max(1e-10).log10()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn power_of_full_scale_is_one() {
        let lut = PowerLut::new();
        assert!((lut.power(65535) - 1.0).abs() < 1e-6);
        assert_eq!(lut.power(0), 0.0);
        // Half-scale magnitude is quarter power.
        assert!((lut.power(32768) as f64 - 0.25).abs() < 1e-3);
    }

    #[test]
    fn dbfs_scale() {
        assert!((power_to_dbfs(1.0) - 0.0).abs() < 1e-9);
        assert!((power_to_dbfs(0.1) + 10.0).abs() < 1e-9);
        assert!((power_to_dbfs(STRONG_SIGNAL_POWER) + 3.0).abs() < 0.01);
        assert!(power_to_dbfs(0.0) < -90.0);
    }

    #[test]
    fn mean_power_over_span() {
        let lut = PowerLut::new();
        let span = [65535u16, 0, 65535, 0];
        assert!((lut.mean_power(&span) - 0.5).abs() < 1e-6);
    }
}
