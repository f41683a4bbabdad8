//! Decoder and network counters.
//!
//! Everything is a relaxed atomic: the demodulator thread and the
//! network tasks bump counters independently, and the totals are only
//! read for the summary printed at exit (and the HTTP JSON).

use std::sync::atomic::{AtomicU64, Ordering};

pub const NUM_SERVICES: usize = 5;

#[derive(Default)]
pub struct ServiceStats {
    pub clients_accepted: AtomicU64,
    pub clients_denied: AtomicU64,
    pub clients_removed: AtomicU64,
    pub unique_clients: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub bytes_recv: AtomicU64,
    pub messages_sent: AtomicU64,
}

#[derive(Default)]
pub struct Stats {
    // Demodulator.
    pub samples_processed: AtomicU64,
    pub samples_dropped: AtomicU64,
    pub demod_preambles: AtomicU64,
    pub demod_rejected_bad: AtomicU64,
    pub demod_rejected_unknown_icao: AtomicU64,
    /// Accepted frames indexed by corrected bit count (0, 1, 2).
    pub demod_accepted: [AtomicU64; 3],
    /// Preamble candidates and winners per sub-sample phase.
    pub demod_preamble_phase: [AtomicU64; 5],
    pub demod_best_phase: [AtomicU64; 5],
    pub strong_signal_count: AtomicU64,
    pub messages_total: AtomicU64,

    // Position decoding.
    pub cpr_global_ok: AtomicU64,
    pub cpr_local_ok: AtomicU64,

    // Raw input parser.
    pub raw_good: AtomicU64,
    pub raw_unrecognized: AtomicU64,
    pub raw_empty: AtomicU64,

    // SBS input parser.
    pub sbs_good: AtomicU64,
    pub sbs_unrecognized: AtomicU64,

    pub services: [ServiceStats; NUM_SERVICES],
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn accepted_total(&self) -> u64 {
        self.demod_accepted
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .sum()
    }

    /// One-shot summary on stdout, printed at exit.
    pub fn print_summary(&self, service_names: [&str; NUM_SERVICES]) {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);

        println!("Statistics:");
        println!("  samples processed:        {}", load(&self.samples_processed));
        println!("  samples dropped:          {}", load(&self.samples_dropped));
        println!("  preambles:                {}", load(&self.demod_preambles));
        println!(
            "  accepted:                 {} ({} with 1-bit fix, {} with 2-bit fix)",
            self.accepted_total(),
            load(&self.demod_accepted[1]),
            load(&self.demod_accepted[2]),
        );
        println!("  rejected (bad CRC):       {}", load(&self.demod_rejected_bad));
        println!("  rejected (unknown ICAO):  {}", load(&self.demod_rejected_unknown_icao));
        println!("  strong signals (>-3dBFS): {}", load(&self.strong_signal_count));
        println!("  messages total:           {}", load(&self.messages_total));
        println!("  CPR positions:            {} global, {} local",
                 load(&self.cpr_global_ok), load(&self.cpr_local_ok));
        println!("  raw input:                {} good, {} unrecognized, {} empty",
                 load(&self.raw_good), load(&self.raw_unrecognized), load(&self.raw_empty));
        println!("  SBS input:                {} good, {} unrecognized",
                 load(&self.sbs_good), load(&self.sbs_unrecognized));

        for (name, s) in service_names.iter().zip(&self.services) {
            println!(
                "  {:<12} clients: {} accepted, {} denied, {} removed, {} unique; \
                 {} bytes out, {} bytes in, {} messages",
                name,
                load(&s.clients_accepted),
                load(&s.clients_denied),
                load(&s.clients_removed),
                load(&s.unique_clients),
                load(&s.bytes_sent),
                load(&s.bytes_recv),
                load(&s.messages_sent),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let stats = Stats::new();
        Stats::inc(&stats.demod_preambles);
        Stats::inc(&stats.demod_accepted[1]);
        Stats::add(&stats.samples_processed, 1000);
        assert_eq!(stats.demod_preambles.load(Ordering::Relaxed), 1);
        assert_eq!(stats.accepted_total(), 1);
        assert_eq!(stats.samples_processed.load(Ordering::Relaxed), 1000);
    }
}
