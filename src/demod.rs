//! 2.4 MHz Mode S demodulator.
//!
//! At 2.4 MHz there are exactly 6 samples per 5 symbols: a symbol is
//! 500 ns, a sample 416.7 ns. The symbol boundary can sit at five
//! distinct sub-sample phases, tracked in units of 1/5 sample (1/12 of
//! a symbol). Each phase has its own correlation kernel for slicing a
//! manchester 1-0 pair, and a preamble candidate is tried at every
//! plausible phase; the best-scoring slice wins.

use std::fs::File;
use std::io::{BufReader, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::Sender;
use tracing::{debug, info};

use crate::config::Config;
use crate::crc::IcaoCache;
use crate::decoder::{
    self, DfBitsets, FixOptions, ModesMessage, MODES_LONG_MSG_BYTES, MODES_PREAMBLE_US,
};
use crate::magnitude::{MagnitudeBuffer, MagnitudeLut, MODES_ASYNC_BUF_SAMPLES};
use crate::signal::{PowerLut, STRONG_SIGNAL_POWER};
use crate::stats::Stats;

// The correlation kernels sum to (nearly) zero, so a DC offset in the
// input cancels out. Kernel 2 is slightly unbalanced on purpose.

#[inline]
fn slice_phase0(m: &[u16]) -> i32 {
    18 * m[0] as i32 - 15 * m[1] as i32 - 3 * m[2] as i32
}

#[inline]
fn slice_phase1(m: &[u16]) -> i32 {
    14 * m[0] as i32 - 5 * m[1] as i32 - 9 * m[2] as i32
}

#[inline]
fn slice_phase2(m: &[u16]) -> i32 {
    16 * m[0] as i32 + 5 * m[1] as i32 - 20 * m[2] as i32
}

#[inline]
fn slice_phase3(m: &[u16]) -> i32 {
    7 * m[0] as i32 + 11 * m[1] as i32 - 18 * m[2] as i32
}

#[inline]
fn slice_phase4(m: &[u16]) -> i32 {
    4 * m[0] as i32 + 15 * m[1] as i32 - 20 * m[2] as i32 + m[3] as i32
}

/// Slice one byte starting at `pos` with the given phase, advancing
/// both. Five bytes span 96 samples (40 µs), so the pointer advances
/// 19 samples for four of the phases and 20 for the fifth.
fn slice_byte(m: &[u16], pos: &mut usize, phase: &mut usize) -> u8 {
    let p = *pos;
    let byte = match *phase {
        0 => {
            *phase = 1;
            *pos = p + 19;
            (if slice_phase0(&m[p..]) > 0 { 0x80 } else { 0 })
                | (if slice_phase2(&m[p + 2..]) > 0 { 0x40 } else { 0 })
                | (if slice_phase4(&m[p + 4..]) > 0 { 0x20 } else { 0 })
                | (if slice_phase1(&m[p + 7..]) > 0 { 0x10 } else { 0 })
                | (if slice_phase3(&m[p + 9..]) > 0 { 0x08 } else { 0 })
                | (if slice_phase0(&m[p + 12..]) > 0 { 0x04 } else { 0 })
                | (if slice_phase2(&m[p + 14..]) > 0 { 0x02 } else { 0 })
                | (if slice_phase4(&m[p + 16..]) > 0 { 0x01 } else { 0 })
        }
        1 => {
            *phase = 2;
            *pos = p + 19;
            (if slice_phase1(&m[p..]) > 0 { 0x80 } else { 0 })
                | (if slice_phase3(&m[p + 2..]) > 0 { 0x40 } else { 0 })
                | (if slice_phase0(&m[p + 5..]) > 0 { 0x20 } else { 0 })
                | (if slice_phase2(&m[p + 7..]) > 0 { 0x10 } else { 0 })
                | (if slice_phase4(&m[p + 9..]) > 0 { 0x08 } else { 0 })
                | (if slice_phase1(&m[p + 12..]) > 0 { 0x04 } else { 0 })
                | (if slice_phase3(&m[p + 14..]) > 0 { 0x02 } else { 0 })
                | (if slice_phase0(&m[p + 17..]) > 0 { 0x01 } else { 0 })
        }
        2 => {
            *phase = 3;
            *pos = p + 19;
            (if slice_phase2(&m[p..]) > 0 { 0x80 } else { 0 })
                | (if slice_phase4(&m[p + 2..]) > 0 { 0x40 } else { 0 })
                | (if slice_phase1(&m[p + 5..]) > 0 { 0x20 } else { 0 })
                | (if slice_phase3(&m[p + 7..]) > 0 { 0x10 } else { 0 })
                | (if slice_phase0(&m[p + 10..]) > 0 { 0x08 } else { 0 })
                | (if slice_phase2(&m[p + 12..]) > 0 { 0x04 } else { 0 })
                | (if slice_phase4(&m[p + 14..]) > 0 { 0x02 } else { 0 })
                | (if slice_phase1(&m[p + 17..]) > 0 { 0x01 } else { 0 })
        }
        3 => {
            *phase = 4;
            *pos = p + 19;
            (if slice_phase3(&m[p..]) > 0 { 0x80 } else { 0 })
                | (if slice_phase0(&m[p + 3..]) > 0 { 0x40 } else { 0 })
                | (if slice_phase2(&m[p + 5..]) > 0 { 0x20 } else { 0 })
                | (if slice_phase4(&m[p + 7..]) > 0 { 0x10 } else { 0 })
                | (if slice_phase1(&m[p + 10..]) > 0 { 0x08 } else { 0 })
                | (if slice_phase3(&m[p + 12..]) > 0 { 0x04 } else { 0 })
                | (if slice_phase0(&m[p + 15..]) > 0 { 0x02 } else { 0 })
                | (if slice_phase2(&m[p + 17..]) > 0 { 0x01 } else { 0 })
        }
        _ => {
            *phase = 0;
            *pos = p + 20;
            (if slice_phase4(&m[p..]) > 0 { 0x80 } else { 0 })
                | (if slice_phase1(&m[p + 3..]) > 0 { 0x40 } else { 0 })
                | (if slice_phase3(&m[p + 5..]) > 0 { 0x20 } else { 0 })
                | (if slice_phase0(&m[p + 8..]) > 0 { 0x10 } else { 0 })
                | (if slice_phase2(&m[p + 10..]) > 0 { 0x08 } else { 0 })
                | (if slice_phase4(&m[p + 12..]) > 0 { 0x04 } else { 0 })
                | (if slice_phase1(&m[p + 15..]) > 0 { 0x02 } else { 0 })
                | (if slice_phase3(&m[p + 17..]) > 0 { 0x01 } else { 0 })
        }
    };
    byte
}

struct Candidate {
    score: i32,
    msg: [u8; MODES_LONG_MSG_BYTES],
    len: usize,
    phase: usize,
}

pub struct Demodulator {
    fix: FixOptions,
    bitsets: DfBitsets,
    preamble_threshold: i32,
    icao_cache: IcaoCache,
    power_lut: PowerLut,
    stats: Arc<Stats>,
    loops: u64,
}

impl Demodulator {
    pub fn new(config: &Config, stats: Arc<Stats>) -> Self {
        let fix = FixOptions {
            one_bit: config.fix_errors,
            two_bit: config.aggressive,
        };
        Self {
            fix,
            bitsets: DfBitsets::new(config.fix_errors),
            preamble_threshold: config.preamble_threshold as i32,
            icao_cache: IcaoCache::new(),
            power_lut: PowerLut::new(),
            stats,
            loops: config.loops,
        }
    }

    /// Demodulate one magnitude block, sending accepted frames in
    /// sample order.
    pub fn demodulate(&mut self, mag: &MagnitudeBuffer, tx: &Sender<ModesMessage>) {
        let m = &mag.data[..];
        let mlen = mag.length;
        let now = Instant::now();

        Stats::add(&self.stats.samples_processed, mlen as u64);
        if mag.dropped > 0 {
            Stats::add(&self.stats.samples_dropped, mag.dropped);
        }

        let mut j = 0usize;
        while j < mlen {
            // Cheap peak test: the bulk of the stream fails here.
            if !(m[j + 1] > m[j + 7] && m[j + 12] > m[j + 14] && m[j + 12] > m[j + 15]) {
                j += 1;
                continue;
            }

            // Noise reference from samples the preamble leaves quiet.
            let base_noise = m[j + 5] as i32
                + m[j + 8] as i32
                + m[j + 16] as i32
                + m[j + 17] as i32
                + m[j + 18] as i32;
            let ref_level = (base_noise * self.preamble_threshold) >> 5;

            // Ideal preamble sample shapes per phase (Xn = first data
            // symbol at phase offset n):
            //
            // sample#: 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0
            // phase 3: 2/4\0/5\1 0 0 0 0/5\1/3 3\0 0 0 0 0 0 X4
            // phase 4: 1/5\0/4\2 0 0 0 0/4\2 2/4\0 0 0 0 0 0 0 X0
            // phase 5: 0/5\1/3 3\0 0 0 0/3 3\1/5\0 0 0 0 0 0 0 X1
            // phase 6: 0/4\2 2/4\0 0 0 0 2/4\0/5\1 0 0 0 0 0 0 X2
            // phase 7: 0/3 3\1/5\0 0 0 0 1/5\0/4\2 0 0 0 0 0 0 X3
            let diff_2_3 = m[j + 2] as i32 - m[j + 3] as i32;
            let sum_1_4 = m[j + 1] as i32 + m[j + 4] as i32;
            let diff_10_11 = m[j + 10] as i32 - m[j + 11] as i32;
            let common = sum_1_4 - diff_2_3 + m[j + 9] as i32 + m[j + 12] as i32;

            let mut best: Option<Candidate> = None;
            let mut best_score = i32::MIN;
            let mut tried = false;

            if common - diff_10_11 >= ref_level {
                tried = true;
                self.try_phase(4, m, j, now, &mut best, &mut best_score);
                self.try_phase(5, m, j, now, &mut best, &mut best_score);
            }
            if common + diff_10_11 >= ref_level {
                tried = true;
                self.try_phase(6, m, j, now, &mut best, &mut best_score);
                self.try_phase(7, m, j, now, &mut best, &mut best_score);
            }
            if sum_1_4 + 2 * diff_2_3 + diff_10_11 + m[j + 12] as i32 >= ref_level {
                tried = true;
                self.try_phase(8, m, j, now, &mut best, &mut best_score);
            }

            if !tried {
                j += 1;
                continue;
            }
            Stats::inc(&self.stats.demod_preambles);

            let Some(candidate) = best.filter(|c| c.score >= 0) else {
                if best_score == -200 {
                    Stats::inc(&self.stats.demod_rejected_unknown_icao);
                } else {
                    Stats::inc(&self.stats.demod_rejected_bad);
                }
                j += 1;
                continue;
            };

            let mut mm = decoder::decode_modes_message(
                &candidate.msg[..candidate.len],
                self.fix,
                &mut self.icao_cache,
                now,
            );
            if !mm.crc_ok {
                if mm.score == -200 {
                    Stats::inc(&self.stats.demod_rejected_unknown_icao);
                } else {
                    Stats::inc(&self.stats.demod_rejected_bad);
                }
                j += 1;
                continue;
            }

            Stats::inc(&self.stats.demod_accepted[(mm.corrected_bits as usize).min(2)]);
            Stats::inc(&self.stats.demod_best_phase[candidate.phase - 4]);

            // Timestamp at the end of bit 56 on the 12 MHz clock, the
            // convention the Beast feeders use.
            mm.timestamp = mag.sample_timestamp
                + j as u64 * 5
                + ((MODES_PREAMBLE_US + 56) * 12) as u64
                + candidate.phase as u64;

            // Mean power over the message body.
            let signal_len = mm.msg_bits * 12 / 5;
            let span = &m[j + 19..(j + 19 + signal_len).min(m.len())];
            mm.signal_power = self.power_lut.mean_power(span);
            if mm.signal_power > STRONG_SIGNAL_POWER {
                Stats::inc(&self.stats.strong_signal_count);
            }

            // Skip only part of the message so a second frame whose
            // preamble clobbered our tail still gets detected.
            j += mm.msg_bits * 2;

            if tx.send(mm).is_err() {
                return;
            }
        }
    }

    fn try_phase(
        &self,
        try_phase: usize,
        m: &[u16],
        j: usize,
        now: Instant,
        best: &mut Option<Candidate>,
        best_score: &mut i32,
    ) {
        Stats::inc(&self.stats.demod_preamble_phase[try_phase - 4]);

        let mut pos = j + 19 + try_phase / 5;
        let mut phase = try_phase % 5;
        let mut msg = [0u8; MODES_LONG_MSG_BYTES];

        msg[0] = slice_byte(m, &mut pos, &mut phase);

        // Inspect the DF early; only slice the rest when it looks like
        // a frame we can use.
        let df = msg[0] >> 3;
        let Some(bytelen) = self.bitsets.message_len(df) else {
            *best_score = (*best_score).max(-2);
            return;
        };

        for byte in msg[1..bytelen].iter_mut() {
            *byte = slice_byte(m, &mut pos, &mut phase);
        }

        let score = decoder::score_modes_message(&msg[..bytelen], self.fix, &self.icao_cache, now);
        if score > *best_score {
            *best_score = score;
            *best = Some(Candidate {
                score,
                msg,
                len: bytelen,
                phase: try_phase,
            });
        }
    }

    /// Consume one IQ byte stream to its end.
    pub fn process_reader(
        &mut self,
        reader: &mut dyn Read,
        stream: &mut SampleStream,
        tx: &Sender<ModesMessage>,
        exit: &AtomicBool,
    ) -> std::io::Result<()> {
        loop {
            if exit.load(Ordering::Relaxed) {
                return Ok(());
            }

            let mut filled = 0;
            while filled < stream.iq.len() {
                let n = reader.read(&mut stream.iq[filled..])?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            if filled == 0 {
                return Ok(());
            }

            // Drop a trailing odd byte rather than skewing I/Q pairing.
            let filled = filled & !1;
            stream
                .buf
                .fill(&stream.iq[..filled], &stream.lut, &stream.power, stream.sample_timestamp);
            stream.sample_timestamp += (filled as u64 / 2) * 5;

            self.demodulate(&stream.buf, tx);
        }
    }

    /// Read 8-bit I/Q samples from a file (`-` for stdin) and run the
    /// demodulator over it, honouring the replay count.
    pub fn process_file(
        &mut self,
        filename: &str,
        tx: &Sender<ModesMessage>,
        exit: &AtomicBool,
    ) -> std::io::Result<()> {
        let mut stream = SampleStream::new();
        let mut remaining_loops = self.loops;

        loop {
            if filename == "-" {
                let stdin = std::io::stdin();
                let mut reader = stdin.lock();
                self.process_reader(&mut reader, &mut stream, tx, exit)?;
                info!("end of input");
                return Ok(());
            }

            let file = File::open(filename)?;
            let mut reader = BufReader::with_capacity(MODES_ASYNC_BUF_SAMPLES * 2, file);
            self.process_reader(&mut reader, &mut stream, tx, exit)?;

            if exit.load(Ordering::Relaxed) {
                return Ok(());
            }
            if self.loops == 0 || remaining_loops > 1 {
                remaining_loops = remaining_loops.saturating_sub(1);
                debug!("replaying {}", filename);
                continue;
            }
            info!("end of input");
            return Ok(());
        }
    }
}

/// Conversion state shared across replays of one sample source.
pub struct SampleStream {
    lut: MagnitudeLut,
    power: PowerLut,
    buf: MagnitudeBuffer,
    iq: Vec<u8>,
    sample_timestamp: u64,
}

impl SampleStream {
    pub fn new() -> Self {
        Self {
            lut: MagnitudeLut::new(),
            power: PowerLut::new(),
            buf: MagnitudeBuffer::new(),
            iq: vec![0u8; MODES_ASYNC_BUF_SAMPLES * 2],
            sample_timestamp: 0,
        }
    }
}

impl Default for SampleStream {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::magnitude::TRAILING_SAMPLES;
    use crossbeam_channel::unbounded;

    const KLM_FRAME: [u8; 14] = [
        0x8D, 0x48, 0x40, 0xD6, 0x20, 0x2C, 0xC3, 0x71, 0xC3, 0x2C, 0xE0, 0x57, 0x60, 0x98,
    ];

    /// Render a frame as ideal magnitudes at 2.4 MHz. The waveform is
    /// built on the 12 MHz grid (5 ticks per sample, 6 per symbol) and
    /// box-filtered into samples, with `phase_ticks` shifting the
    /// symbol boundary off the sample grid.
    fn synthesize(frame: &[u8], at_sample: usize, phase_ticks: usize, total: usize) -> Vec<u16> {
        let high: u32 = 40000;
        let mut ticks = vec![0u32; total * 5];

        let frame_start = at_sample * 5 + phase_ticks;
        let mut set_pulse = |start_tick: usize, len: usize| {
            for t in ticks[frame_start + start_tick..frame_start + start_tick + len].iter_mut() {
                *t = high;
            }
        };

        // Preamble pulses at 0, 1, 3.5 and 4.5 µs (12 ticks per µs).
        set_pulse(0, 6);
        set_pulse(12, 6);
        set_pulse(42, 6);
        set_pulse(54, 6);

        // Data bits from 8 µs: manchester, high-low for a one.
        for (i, byte) in frame.iter().enumerate() {
            for b in 0..8 {
                let bit = (byte >> (7 - b)) & 1;
                let bit_start = 96 + (i * 8 + b) * 12;
                if bit == 1 {
                    set_pulse(bit_start, 6);
                } else {
                    set_pulse(bit_start + 6, 6);
                }
            }
        }

        (0..total)
            .map(|s| {
                let sum: u32 = ticks[s * 5..s * 5 + 5].iter().sum();
                (sum / 5) as u16
            })
            .collect()
    }

    fn demod_synthesized(phase_ticks: usize) -> Vec<ModesMessage> {
        let total = 2000 + TRAILING_SAMPLES;
        let mut mag = MagnitudeBuffer::new();
        mag.data = synthesize(&KLM_FRAME, 500, phase_ticks, total);
        mag.length = 2000;
        mag.sample_timestamp = 0;
        mag.mean_power = 0.0;

        let config = Config::default();
        let stats = Arc::new(Stats::new());
        let mut demod = Demodulator::new(&config, Arc::clone(&stats));

        let (tx, rx) = unbounded();
        demod.demodulate(&mag, &tx);
        drop(tx);
        rx.into_iter().collect()
    }

    #[test]
    fn decodes_ideal_frame_at_every_phase() {
        for phase_ticks in 0..5 {
            let messages = demod_synthesized(phase_ticks);
            assert!(
                !messages.is_empty(),
                "no frame decoded at phase offset {}",
                phase_ticks
            );
            let mm = &messages[0];
            assert_eq!(mm.msg[..14], KLM_FRAME, "phase offset {}", phase_ticks);
            assert!(mm.crc_ok);
            assert_eq!(mm.icao_address(), 0x4840D6);
            assert_eq!(mm.flight, "KLM1023");
            assert_eq!(mm.corrected_bits, 0);
        }
    }

    #[test]
    fn signal_power_is_reported() {
        let messages = demod_synthesized(0);
        let mm = &messages[0];
        // Half the symbols are high at ~0.37 full-scale power.
        assert!(mm.signal_power > 0.05, "power {}", mm.signal_power);
        assert!(mm.rssi_dbfs() > -15.0);
    }

    #[test]
    fn damaged_frame_is_repaired_when_enabled() {
        let mut frame = KLM_FRAME;
        frame[5] ^= 0x20;

        let total = 2000 + TRAILING_SAMPLES;
        let mut mag = MagnitudeBuffer::new();
        mag.data = synthesize(&frame, 500, 0, total);
        mag.length = 2000;

        // Repair off: nothing comes out.
        let mut config = Config::default();
        config.fix_errors = false;
        let stats = Arc::new(Stats::new());
        let mut demod = Demodulator::new(&config, Arc::clone(&stats));
        let (tx, rx) = unbounded();
        demod.demodulate(&mag, &tx);
        drop(tx);
        assert_eq!(rx.into_iter().count(), 0);
        assert!(stats.demod_rejected_bad.load(std::sync::atomic::Ordering::Relaxed) > 0);

        // Repair on: the frame comes back with one corrected bit.
        let config = Config::default();
        let stats = Arc::new(Stats::new());
        let mut demod = Demodulator::new(&config, Arc::clone(&stats));
        let (tx, rx) = unbounded();
        demod.demodulate(&mag, &tx);
        drop(tx);
        let messages: Vec<_> = rx.into_iter().collect();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].msg[..14], KLM_FRAME);
        assert_eq!(messages[0].corrected_bits, 1);
        assert_eq!(
            stats.demod_accepted[1].load(std::sync::atomic::Ordering::Relaxed),
            1
        );
    }
}
