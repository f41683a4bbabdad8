//! CRC-24 checksum for Mode S messages.
//!
//! The checksum is computed by XORing precomputed values for each set
//! message bit. For DF 11/17/18 the final 24 bits carry the checksum
//! itself; for the other formats they carry checksum XOR ICAO, so the
//! syndrome of a clean frame *is* the transmitting address.

use std::time::{Duration, Instant};

/// Precomputed CRC table, one entry per bit position of a 112-bit
/// message. Short (56-bit) messages use the last 56 entries. The final
/// 24 entries are zero so the checksum field never feeds itself.
pub const MODES_CHECKSUM_TABLE: [u32; 112] = [
    0x3935ea, 0x1c9af5, 0xf1b77e, 0x78dbbf, 0xc397db, 0x9e31e9, 0xb0e2f0, 0x587178,
    0x2c38bc, 0x161c5e, 0x0b0e2f, 0xfa7d13, 0x82c48d, 0xbe9842, 0x5f4c21, 0xd05c14,
    0x682e0a, 0x341705, 0xe5f186, 0x72f8c3, 0xc68665, 0x9cb936, 0x4e5c9b, 0xd8d449,
    0x939020, 0x49c810, 0x24e408, 0x127204, 0x093902, 0x049c81, 0xfdb444, 0x7eda22,
    0x3f6d11, 0xe04c8c, 0x702646, 0x381323, 0xe3f395, 0x8e03ce, 0x4701e7, 0xdc7af7,
    0x91c77f, 0xb719bb, 0xa476d9, 0xadc168, 0x56e0b4, 0x2b705a, 0x15b82d, 0xf52612,
    0x7a9309, 0xc2b380, 0x6159c0, 0x30ace0, 0x185670, 0x0c2b38, 0x06159c, 0x030ace,
    0x018567, 0xff38b7, 0x80665f, 0xbfc92b, 0xa01e91, 0xaff54c, 0x57faa6, 0x2bfd53,
    0xea04ad, 0x8af852, 0x457c29, 0xdd4410, 0x6ea208, 0x375104, 0x1ba882, 0x0dd441,
    0xf91024, 0x7c8812, 0x3e4409, 0xe0d800, 0x706c00, 0x383600, 0x1c1b00, 0x0e0d80,
    0x0706c0, 0x038360, 0x01c1b0, 0x00e0d8, 0x00706c, 0x003836, 0x001c1b, 0xfff409,
    0x000000, 0x000000, 0x000000, 0x000000, 0x000000, 0x000000, 0x000000, 0x000000,
    0x000000, 0x000000, 0x000000, 0x000000, 0x000000, 0x000000, 0x000000, 0x000000,
    0x000000, 0x000000, 0x000000, 0x000000, 0x000000, 0x000000, 0x000000, 0x000000,
];

/// Compute the 24-bit checksum over a 56- or 112-bit message.
pub fn modes_checksum(msg: &[u8], bits: usize) -> u32 {
    debug_assert!(bits == 56 || bits == 112);
    debug_assert!(msg.len() >= bits / 8);

    let mut crc: u32 = 0;
    let offset = if bits == 112 { 0 } else { 112 - 56 };

    for j in 0..bits {
        let byte_idx = j / 8;
        // Bit 0 is the MSB of the first byte in Mode S numbering.
        let bitmask = 1u8 << (7 - (j % 8));
        if msg[byte_idx] & bitmask != 0 {
            crc ^= MODES_CHECKSUM_TABLE[j + offset];
        }
    }
    crc
}

/// The checksum field carried in the last 3 bytes of a message.
pub fn extract_crc(msg: &[u8], bits: usize) -> u32 {
    let len = bits / 8;
    debug_assert!(msg.len() >= len);
    ((msg[len - 3] as u32) << 16) | ((msg[len - 2] as u32) << 8) | (msg[len - 1] as u32)
}

/// Computed checksum XOR received checksum. Zero for a clean frame of a
/// standalone-CRC format; the transmitting ICAO for the XOR formats.
pub fn syndrome(msg: &[u8], bits: usize) -> u32 {
    modes_checksum(msg, bits) ^ extract_crc(msg, bits)
}

/// Try every single bit flip; on a CRC match the fix is applied in
/// place and the flipped bit position is returned.
pub fn fix_single_bit_errors(msg: &mut [u8], bits: usize) -> Option<usize> {
    let len = bits / 8;
    let mut aux = [0u8; 14];
    aux[..len].copy_from_slice(&msg[..len]);

    for j in 0..bits {
        let byte_idx = j / 8;
        let bitmask = 1u8 << (7 - (j % 8));

        aux[byte_idx] ^= bitmask;
        if extract_crc(&aux, bits) == modes_checksum(&aux, bits) {
            msg[..len].copy_from_slice(&aux[..len]);
            return Some(j);
        }
        aux[byte_idx] ^= bitmask;
    }
    None
}

/// Try every two-bit combination. Expensive, O(bits²); reserved for
/// DF 17 under the aggressive option.
pub fn fix_two_bit_errors(msg: &mut [u8], bits: usize) -> Option<(usize, usize)> {
    let len = bits / 8;
    let mut aux = [0u8; 14];

    for j in 0..bits {
        let byte1 = j / 8;
        let bitmask1 = 1u8 << (7 - (j % 8));

        for i in (j + 1)..bits {
            let byte2 = i / 8;
            let bitmask2 = 1u8 << (7 - (i % 8));

            aux[..len].copy_from_slice(&msg[..len]);
            aux[byte1] ^= bitmask1;
            aux[byte2] ^= bitmask2;

            if extract_crc(&aux, bits) == modes_checksum(&aux, bits) {
                msg[..len].copy_from_slice(&aux[..len]);
                return Some((j, i));
            }
        }
    }
    None
}

/// Number of slots in the recent-ICAO cache. Power of two.
const ICAO_CACHE_LEN: usize = 1024;
/// How long a cached address stays hot.
const ICAO_CACHE_TTL: Duration = Duration::from_secs(60);

/// Direct-mapped cache of recently seen ICAO addresses.
///
/// Brute-force address recovery for the XOR-checksummed formats
/// consults this set: a syndrome matching a recently active address is
/// almost certainly that aircraft, while a random syndrome is noise.
/// Collisions overwrite; the cache is a freshness filter, not a record.
pub struct IcaoCache {
    slots: Vec<Option<(u32, Instant)>>,
}

impl IcaoCache {
    pub fn new() -> Self {
        Self {
            slots: vec![None; ICAO_CACHE_LEN],
        }
    }

    fn index(addr: u32) -> usize {
        // Multiplicative hash; the low address bits alone are far from
        // uniform across real airframes.
        (addr.wrapping_mul(0x9e37_79b1) >> 22) as usize & (ICAO_CACHE_LEN - 1)
    }

    pub fn record(&mut self, addr: u32, now: Instant) {
        if addr != 0 {
            self.slots[Self::index(addr)] = Some((addr, now));
        }
    }

    pub fn recently_seen(&self, addr: u32, now: Instant) -> bool {
        match self.slots[Self::index(addr)] {
            Some((cached, when)) => cached == addr && now.duration_since(when) <= ICAO_CACHE_TTL,
            None => false,
        }
    }
}

impl Default for IcaoCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GOOD_DF17: [u8; 14] = [
        0x8D, 0x48, 0x40, 0xD6, 0x20, 0x2C, 0xC3, 0x71, 0xC3, 0x2C, 0xE0, 0x57, 0x60, 0x98,
    ];

    #[test]
    fn checksum_of_clean_frame_matches_field() {
        assert_eq!(modes_checksum(&GOOD_DF17, 112), extract_crc(&GOOD_DF17, 112));
        assert_eq!(syndrome(&GOOD_DF17, 112), 0);
    }

    #[test]
    fn single_bit_error_is_repaired() {
        let mut msg = GOOD_DF17;
        msg[5] ^= 0x04; // bit 45
        assert_eq!(fix_single_bit_errors(&mut msg, 112), Some(45));
        assert_eq!(msg, GOOD_DF17);
    }

    #[test]
    fn two_bit_error_is_repaired() {
        let mut msg = GOOD_DF17;
        msg[6] ^= 0x80; // bit 48
        msg[9] ^= 0x01; // bit 79
        assert_eq!(fix_two_bit_errors(&mut msg, 112), Some((48, 79)));
        assert_eq!(msg, GOOD_DF17);
    }

    #[test]
    fn icao_cache_expires() {
        let mut cache = IcaoCache::new();
        let t0 = Instant::now();
        cache.record(0x4840D6, t0);
        assert!(cache.recently_seen(0x4840D6, t0));
        assert!(cache.recently_seen(0x4840D6, t0 + Duration::from_secs(59)));
        assert!(!cache.recently_seen(0x4840D6, t0 + Duration::from_secs(61)));
        assert!(!cache.recently_seen(0x4840D7, t0));
    }
}
