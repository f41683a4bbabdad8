//! Mode S frame decoder.
//!
//! Turns raw 56/112-bit messages into structured data, applying the
//! CRC repair policy and the message score used to pick between phase
//! candidates during demodulation.

use std::fmt;
use std::time::Instant;

use chrono::Local;

use crate::crc::{self, extract_crc, syndrome, IcaoCache};

pub const MODES_LONG_MSG_BITS: usize = 112;
pub const MODES_SHORT_MSG_BITS: usize = 56;
pub const MODES_LONG_MSG_BYTES: usize = 14;
pub const MODES_SHORT_MSG_BYTES: usize = 7;
pub const MODES_PREAMBLE_US: usize = 8;

/// Unit of a decoded altitude.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AltitudeUnit {
    Feet,
    Meters,
}

/// Downlink formats decoded by this crate. Everything else is only
/// recognised by length.
const DECODED_SHORT_DFS: u32 = (1 << 0) | (1 << 4) | (1 << 5) | (1 << 11);
const DECODED_LONG_DFS: u32 = (1 << 16) | (1 << 17) | (1 << 18) | (1 << 20) | (1 << 21);

/// Sets of DF values worth slicing to the end. With 1-bit repair on,
/// long frames whose DF is a one-bit damage of 17 are also candidates.
#[derive(Debug, Clone, Copy)]
pub struct DfBitsets {
    pub short: u32,
    pub long: u32,
}

fn damage_set(df: u8, damage_bits: u32) -> u32 {
    let mut result = 1u32 << df;
    if damage_bits == 0 {
        return result;
    }
    for bit in 0..5 {
        result |= damage_set(df ^ (1 << bit), damage_bits - 1);
    }
    result
}

impl DfBitsets {
    pub fn new(fix_df: bool) -> Self {
        let mut long = DECODED_LONG_DFS;
        if fix_df {
            // Repairing the DF field itself is only worthwhile for the
            // format that carries most of the traffic.
            long |= damage_set(17, 1);
        }
        Self {
            short: DECODED_SHORT_DFS,
            long,
        }
    }

    /// Expected byte length if this DF is worth decoding, else None.
    pub fn message_len(&self, df: u8) -> Option<usize> {
        if df < 32 && self.long & (1 << df) != 0 {
            Some(MODES_LONG_MSG_BYTES)
        } else if df < 32 && self.short & (1 << df) != 0 {
            Some(MODES_SHORT_MSG_BYTES)
        } else {
            None
        }
    }
}

/// Message length in bits for a downlink format: all DFs with the high
/// bit set are long.
pub fn message_len_by_type(df: u8) -> usize {
    if df & 0x10 != 0 {
        MODES_LONG_MSG_BITS
    } else {
        MODES_SHORT_MSG_BITS
    }
}

/// Extract message bits `firstbit..=lastbit` (1-based, MSB-first) as an
/// integer. At most 32 bits.
#[inline]
pub fn getbits(data: &[u8], firstbit: usize, lastbit: usize) -> u32 {
    debug_assert!(firstbit <= lastbit && lastbit - firstbit < 32);
    let mut value = 0u32;
    for bit in firstbit..=lastbit {
        let bi = bit - 1;
        value = (value << 1) | ((data[bi / 8] >> (7 - (bi % 8))) as u32 & 1);
    }
    value
}

/// Decoded Mode S message.
#[derive(Debug, Clone)]
pub struct ModesMessage {
    /// Raw message bytes (repaired in place when a fix applied).
    pub msg: [u8; MODES_LONG_MSG_BYTES],
    pub msg_bits: usize,
    /// Downlink format.
    pub msg_type: u8,
    /// Checksum field as received.
    pub crc: u32,
    pub crc_ok: bool,
    /// Number of repaired bits (0, 1 or 2).
    pub corrected_bits: u8,
    pub error_bit: Option<usize>,
    pub error_bit2: Option<usize>,
    /// Acceptance score; negative means rejected.
    pub score: i32,
    /// ICAO address bytes.
    pub aa: [u8; 3],
    /// Capability (DF 11/17/18).
    pub ca: u8,
    /// Extended squitter typecode and subtype.
    pub me_type: u8,
    pub me_sub: u8,
    /// Flight status, downlink request, utility (DF 4/5/20/21).
    pub fs: u8,
    pub dr: u8,
    pub um: u8,
    /// Squawk as four octal digits packed decimally.
    pub identity: u16,
    pub altitude: i32,
    pub unit: AltitudeUnit,
    pub flight: String,
    pub aircraft_type: u8,
    /// CPR format flag (false = even, true = odd) and time flag.
    pub fflag: bool,
    pub tflag: bool,
    pub raw_latitude: u32,
    pub raw_longitude: u32,
    /// Position frame was a surface position (TC 5..=8).
    pub on_surface: bool,
    pub heading_is_valid: bool,
    pub heading: f64,
    pub ew_dir: u8,
    pub ew_velocity: u16,
    pub ns_dir: u8,
    pub ns_velocity: u16,
    pub vert_rate_source: u8,
    pub vert_rate_sign: u8,
    pub vert_rate: u16,
    /// Ground speed (subtypes 1-2) or airspeed (3-4), knots.
    pub velocity: u16,
    /// Comm-B MB field (DF 20/21).
    pub mb: Option<[u8; 7]>,
    /// Normalized signal power over the message, 0..1.
    pub signal_power: f64,
    /// 12 MHz sample clock at the end of bit 56.
    pub timestamp: u64,
}

impl Default for ModesMessage {
    fn default() -> Self {
        Self {
            msg: [0; MODES_LONG_MSG_BYTES],
            msg_bits: 0,
            msg_type: 0,
            crc: 0,
            crc_ok: false,
            corrected_bits: 0,
            error_bit: None,
            error_bit2: None,
            score: 0,
            aa: [0; 3],
            ca: 0,
            me_type: 0,
            me_sub: 0,
            fs: 0,
            dr: 0,
            um: 0,
            identity: 0,
            altitude: 0,
            unit: AltitudeUnit::Feet,
            flight: String::new(),
            aircraft_type: 0,
            fflag: false,
            tflag: false,
            raw_latitude: 0,
            raw_longitude: 0,
            on_surface: false,
            heading_is_valid: false,
            heading: 0.0,
            ew_dir: 0,
            ew_velocity: 0,
            ns_dir: 0,
            ns_velocity: 0,
            vert_rate_source: 0,
            vert_rate_sign: 0,
            vert_rate: 0,
            velocity: 0,
            mb: None,
            signal_power: 0.0,
            timestamp: 0,
        }
    }
}

/// Repair policy knobs, resolved from configuration once.
#[derive(Debug, Clone, Copy)]
pub struct FixOptions {
    /// Try single-bit repair.
    pub one_bit: bool,
    /// Try two-bit repair on DF 17.
    pub two_bit: bool,
}

const SCORE_ICAO_MATCH: i32 = 1000;
const SCORE_PER_CORRECTED_BIT: i32 = 50;
const SCORE_UNKNOWN_ICAO: i32 = -200;
const SCORE_INVALID_DF: i32 = -2;

/// Score a sliced candidate without committing to a decode. Higher is
/// better; negative rejects. `-200` specifically means "clean frame,
/// but the recovered address has not been heard recently".
pub fn score_modes_message(msg: &[u8], fix: FixOptions, cache: &IcaoCache, now: Instant) -> i32 {
    let df = msg[0] >> 3;
    let bits = message_len_by_type(df);
    if msg.len() < bits / 8 {
        return SCORE_INVALID_DF;
    }

    match df {
        11 | 17 | 18 => {
            let syn = syndrome(msg, bits);
            if syn == 0 || (df == 11 && syn < 0x80) {
                return SCORE_ICAO_MATCH;
            }
            if fix.one_bit {
                let mut aux = [0u8; MODES_LONG_MSG_BYTES];
                aux[..bits / 8].copy_from_slice(&msg[..bits / 8]);
                if crc::fix_single_bit_errors(&mut aux, bits).is_some() {
                    return SCORE_ICAO_MATCH - SCORE_PER_CORRECTED_BIT;
                }
                if fix.two_bit && df == 17 && crc::fix_two_bit_errors(&mut aux, bits).is_some() {
                    return SCORE_ICAO_MATCH - 2 * SCORE_PER_CORRECTED_BIT;
                }
            }
            SCORE_INVALID_DF
        }
        0 | 4 | 5 | 16 | 20 | 21 => {
            // Checksum is overlaid with the sender's address: the frame
            // is acceptable only if that address is a live aircraft.
            if cache.recently_seen(syndrome(msg, bits), now) {
                SCORE_ICAO_MATCH
            } else {
                SCORE_UNKNOWN_ICAO
            }
        }
        _ => {
            // Possibly a damaged DF 17; a single-bit fix may restore it.
            if fix.one_bit && df & 0x10 != 0 && msg.len() >= MODES_LONG_MSG_BYTES {
                let mut aux = [0u8; MODES_LONG_MSG_BYTES];
                aux.copy_from_slice(&msg[..MODES_LONG_MSG_BYTES]);
                if crc::fix_single_bit_errors(&mut aux, MODES_LONG_MSG_BITS).is_some()
                    && aux[0] >> 3 == 17
                {
                    return SCORE_ICAO_MATCH - SCORE_PER_CORRECTED_BIT;
                }
            }
            SCORE_INVALID_DF
        }
    }
}

/// Decode a raw message. Applies the repair policy, resolves the ICAO
/// address (direct or recovered from the checksum), updates the
/// recent-ICAO cache, and extracts all fields for the decoded formats.
pub fn decode_modes_message(
    raw_msg: &[u8],
    fix: FixOptions,
    cache: &mut IcaoCache,
    now: Instant,
) -> ModesMessage {
    let mut mm = ModesMessage::default();

    let len = raw_msg.len().min(MODES_LONG_MSG_BYTES);
    mm.msg[..len].copy_from_slice(&raw_msg[..len]);

    mm.msg_type = mm.msg[0] >> 3;
    mm.msg_bits = message_len_by_type(mm.msg_type);
    if len < mm.msg_bits / 8 {
        mm.score = SCORE_INVALID_DF;
        return mm;
    }

    match mm.msg_type {
        11 | 17 | 18 => decode_standalone_crc(&mut mm, fix, cache, now),
        0 | 4 | 5 | 16 | 20 | 21 => decode_overlaid_crc(&mut mm, cache, now),
        df if df & 0x10 != 0 && fix.one_bit => {
            // Try to repair a damaged DF field back into DF 17.
            if let Some(bit) = crc::fix_single_bit_errors(&mut mm.msg, MODES_LONG_MSG_BITS) {
                if mm.msg[0] >> 3 == 17 {
                    mm.msg_type = 17;
                    mm.error_bit = Some(bit);
                    mm.corrected_bits = 1;
                    decode_standalone_crc(&mut mm, FixOptions { one_bit: false, two_bit: false }, cache, now);
                    mm.score = SCORE_ICAO_MATCH - SCORE_PER_CORRECTED_BIT;
                } else {
                    mm.score = SCORE_INVALID_DF;
                    return mm;
                }
            } else {
                mm.score = SCORE_INVALID_DF;
                return mm;
            }
        }
        _ => {
            mm.crc = extract_crc(&mm.msg, mm.msg_bits);
            mm.score = SCORE_INVALID_DF;
            return mm;
        }
    }

    if !mm.crc_ok {
        return mm;
    }

    extract_fields(&mut mm);
    mm
}

fn decode_standalone_crc(mm: &mut ModesMessage, fix: FixOptions, cache: &mut IcaoCache, now: Instant) {
    let bits = mm.msg_bits;
    let mut syn = syndrome(&mm.msg, bits);

    if syn != 0 && fix.one_bit {
        if let Some(bit) = crc::fix_single_bit_errors(&mut mm.msg, bits) {
            mm.error_bit = Some(bit);
            mm.corrected_bits = 1;
            syn = 0;
        } else if fix.two_bit && mm.msg_type == 17 {
            if let Some((bit1, bit2)) = crc::fix_two_bit_errors(&mut mm.msg, bits) {
                mm.error_bit = Some(bit1);
                mm.error_bit2 = Some(bit2);
                mm.corrected_bits = 2;
                syn = 0;
            }
        }
    }

    mm.msg_type = mm.msg[0] >> 3;
    mm.crc = extract_crc(&mm.msg, bits);
    mm.aa = [mm.msg[1], mm.msg[2], mm.msg[3]];

    // A DF 11 syndrome below 0x80 is a clean all-call tagged with an
    // interrogator identifier.
    let iid_ok = mm.msg_type == 11 && syn < 0x80;
    mm.crc_ok = syn == 0 || iid_ok;

    if mm.crc_ok {
        mm.score = SCORE_ICAO_MATCH - mm.corrected_bits as i32 * SCORE_PER_CORRECTED_BIT;
        // Only unambiguous frames seed the address cache.
        if syn == 0 {
            mm.icao_into_cache(cache, now);
        }
    } else {
        mm.score = SCORE_INVALID_DF;
    }
}

fn decode_overlaid_crc(mm: &mut ModesMessage, cache: &mut IcaoCache, now: Instant) {
    let bits = mm.msg_bits;
    let addr = syndrome(&mm.msg, bits);

    mm.crc = extract_crc(&mm.msg, bits);
    mm.aa = [(addr >> 16) as u8, (addr >> 8) as u8, addr as u8];
    mm.crc_ok = cache.recently_seen(addr, now);
    mm.score = if mm.crc_ok { SCORE_ICAO_MATCH } else { SCORE_UNKNOWN_ICAO };
    if mm.crc_ok {
        cache.record(addr, now);
    }
}

/// AIS charset for callsign decoding, 6 bits per character.
const AIS_CHARSET: &[u8; 64] =
    b"?ABCDEFGHIJKLMNOPQRSTUVWXYZ????? 0123456789?????????????????????";

fn extract_fields(mm: &mut ModesMessage) {
    mm.ca = mm.msg[0] & 0x07;

    match mm.msg_type {
        4 | 5 | 20 | 21 => {
            mm.fs = mm.msg[0] & 0x07;
            mm.dr = (mm.msg[1] >> 3) & 0x1F;
            mm.um = ((mm.msg[1] & 0x07) << 3) | (mm.msg[2] >> 5);
        }
        _ => {}
    }

    match mm.msg_type {
        0 | 16 => {
            mm.altitude = decode_ac13_field(ac13_field(&mm.msg), &mut mm.unit);
        }
        4 | 20 => {
            mm.altitude = decode_ac13_field(ac13_field(&mm.msg), &mut mm.unit);
            if mm.msg_type == 20 {
                mm.mb = Some(mm.msg[4..11].try_into().unwrap());
            }
        }
        5 | 21 => {
            mm.identity = decode_id13_field(ac13_field(&mm.msg));
            if mm.msg_type == 21 {
                mm.mb = Some(mm.msg[4..11].try_into().unwrap());
            }
        }
        17 | 18 => decode_extended_squitter(mm),
        11 => {}
        _ => {}
    }
}

/// TIS-B (DF 18) carries the same ME payload as DF 17.
fn decode_extended_squitter(mm: &mut ModesMessage) {
    mm.me_type = mm.msg[4] >> 3;
    mm.me_sub = mm.msg[4] & 0x07;

    match mm.me_type {
        1..=4 => {
            mm.aircraft_type = mm.me_type - 1;
            let idx = [
                (mm.msg[5] >> 2) as usize,
                (((mm.msg[5] & 0x03) << 4) | (mm.msg[6] >> 4)) as usize,
                (((mm.msg[6] & 0x0F) << 2) | (mm.msg[7] >> 6)) as usize,
                (mm.msg[7] & 0x3F) as usize,
                (mm.msg[8] >> 2) as usize,
                (((mm.msg[8] & 0x03) << 4) | (mm.msg[9] >> 4)) as usize,
                (((mm.msg[9] & 0x0F) << 2) | (mm.msg[10] >> 6)) as usize,
                (mm.msg[10] & 0x3F) as usize,
            ];
            mm.flight = idx
                .iter()
                .map(|&i| AIS_CHARSET[i] as char)
                .collect::<String>()
                .trim()
                .to_string();
        }
        5..=8 => {
            // Surface position: ground movement and track instead of
            // an altitude field; CPR layout matches airborne.
            mm.on_surface = true;
            let movement = getbits(&mm.msg, 38, 44);
            if let Some(kt) = decode_movement_field(movement) {
                mm.velocity = kt.round() as u16;
            }
            if getbits(&mm.msg, 45, 45) != 0 {
                mm.heading_is_valid = true;
                mm.heading = getbits(&mm.msg, 46, 52) as f64 * 360.0 / 128.0;
            }
            extract_cpr(mm);
        }
        9..=18 | 20..=22 => {
            mm.altitude = decode_ac12_field(ac12_field(&mm.msg), &mut mm.unit);
            extract_cpr(mm);
        }
        19 if (1..=4).contains(&mm.me_sub) => decode_velocity(mm),
        _ => {}
    }
}

fn extract_cpr(mm: &mut ModesMessage) {
    mm.fflag = (mm.msg[6] & 0x04) != 0;
    mm.tflag = (mm.msg[6] & 0x08) != 0;
    mm.raw_latitude =
        (((mm.msg[6] & 0x03) as u32) << 15) | ((mm.msg[7] as u32) << 7) | ((mm.msg[8] >> 1) as u32);
    mm.raw_longitude =
        (((mm.msg[8] & 0x01) as u32) << 16) | ((mm.msg[9] as u32) << 8) | (mm.msg[10] as u32);
}

fn decode_velocity(mm: &mut ModesMessage) {
    // Supersonic subtypes scale the component fields by four.
    let scale: u16 = if mm.me_sub == 2 || mm.me_sub == 4 { 4 } else { 1 };

    if mm.me_sub == 1 || mm.me_sub == 2 {
        mm.ew_dir = (mm.msg[5] & 0x04) >> 2;
        mm.ew_velocity = ((((mm.msg[5] & 0x03) as u16) << 8) | (mm.msg[6] as u16)) * scale;
        mm.ns_dir = (mm.msg[7] & 0x80) >> 7;
        mm.ns_velocity =
            ((((mm.msg[7] & 0x7F) as u16) << 3) | (((mm.msg[8] & 0xE0) >> 5) as u16)) * scale;
        mm.vert_rate_source = (mm.msg[8] & 0x10) >> 4;
        mm.vert_rate_sign = (mm.msg[8] & 0x08) >> 3;
        mm.vert_rate = (((mm.msg[8] & 0x07) as u16) << 6) | (((mm.msg[9] & 0xFC) >> 2) as u16);

        let ewv = mm.ew_velocity as f64;
        let nsv = mm.ns_velocity as f64;
        mm.velocity = (ewv * ewv + nsv * nsv).sqrt().round() as u16;

        if mm.velocity > 0 {
            let ewv = if mm.ew_dir != 0 { -ewv } else { ewv };
            let nsv = if mm.ns_dir != 0 { -nsv } else { nsv };
            let mut heading = ewv.atan2(nsv).to_degrees();
            if heading < 0.0 {
                heading += 360.0;
            }
            mm.heading = heading;
            mm.heading_is_valid = true;
        }
    } else {
        // Airspeed and magnetic heading.
        mm.heading_is_valid = (mm.msg[5] & 0x04) != 0;
        mm.heading = (360.0 / 128.0)
            * (((((mm.msg[5] & 0x03) as u16) << 5) | ((mm.msg[6] >> 3) as u16)) as f64);
        let airspeed = (((mm.msg[7] & 0x7F) as u16) << 3) | (((mm.msg[8] & 0xE0) >> 5) as u16);
        if airspeed != 0 {
            mm.velocity = (airspeed - 1) * scale;
        }
    }
}

/// 13-bit AC/ID field of DF 0/4/5/16/20/21 (message bits 20..32).
fn ac13_field(msg: &[u8]) -> u16 {
    (((msg[2] & 0x1F) as u16) << 8) | msg[3] as u16
}

/// 12-bit AC field of an airborne position ME (ME bits 9..20).
fn ac12_field(msg: &[u8]) -> u16 {
    ((msg[5] as u16) << 4) | ((msg[6] as u16 & 0xF0) >> 4)
}

/// Decode the 13-bit altitude field. M set flags metres; M clear with Q
/// set is a 25 ft linear code; M and Q clear is the Gillham 100 ft code.
fn decode_ac13_field(ac13: u16, unit: &mut AltitudeUnit) -> i32 {
    let m_bit = ac13 & 0x0040 != 0;
    let q_bit = ac13 & 0x0010 != 0;

    if m_bit {
        *unit = AltitudeUnit::Meters;
        // Metric altitude: 12-bit field with the M bit removed.
        return (((ac13 & 0x1F80) >> 1) | (ac13 & 0x003F)) as i32;
    }

    *unit = AltitudeUnit::Feet;
    if q_bit {
        let n = (((ac13 & 0x1F80) >> 2) | ((ac13 & 0x0020) >> 1) | (ac13 & 0x000F)) as i32;
        return n * 25 - 1000;
    }

    match mode_a_to_mode_c(gillham_field(ac13 as u32)) {
        Some(n) if n >= -12 => n * 100,
        _ => 0,
    }
}

/// Decode the 12-bit AC field of airborne position frames (always feet).
fn decode_ac12_field(ac12: u16, unit: &mut AltitudeUnit) -> i32 {
    *unit = AltitudeUnit::Feet;
    let q_bit = ac12 & 0x10 != 0;

    if q_bit {
        let n = (((ac12 & 0x0FE0) >> 1) | (ac12 & 0x000F)) as i32;
        return n * 25 - 1000;
    }

    // Re-insert a zero M bit and decode as the 13-bit Gillham code.
    let ac13 = ((ac12 as u32 & 0x0FC0) << 1) | (ac12 as u32 & 0x003F);
    match mode_a_to_mode_c(gillham_field(ac13)) {
        Some(n) if n >= -12 => n * 100,
        _ => 0,
    }
}

/// Decode the 13-bit identity field into four octal squawk digits
/// packed decimally (e.g. 0o7700 -> 7700).
fn decode_id13_field(id13: u16) -> u16 {
    let h = gillham_field(id13 as u32);
    (((h & 0x7000) >> 12) * 1000 + ((h & 0x0700) >> 8) * 100 + ((h & 0x0070) >> 4) * 10
        + (h & 0x0007)) as u16
}

/// Unshuffle the interleaved 13-bit field into Gillham nibble order
/// `0 A4 A2 A1  0 B4 B2 B1  SPI C4 C2 C1  0 D4 D2 D1`.
///
/// ```plain
/// bit:    12 11 10  9  8  7  6  5  4  3  2  1  0
/// input:  C1 A1 C2 A2 C4 A4  X B1 D1 B2 D2 B4 D4
/// ```
fn gillham_field(field: u32) -> u32 {
    let mut h = 0u32;
    if field & 0x1000 != 0 { h |= 0x0010 } // C1
    if field & 0x0800 != 0 { h |= 0x1000 } // A1
    if field & 0x0400 != 0 { h |= 0x0020 } // C2
    if field & 0x0200 != 0 { h |= 0x2000 } // A2
    if field & 0x0100 != 0 { h |= 0x0040 } // C4
    if field & 0x0080 != 0 { h |= 0x4000 } // A4
    if field & 0x0020 != 0 { h |= 0x0100 } // B1
    if field & 0x0010 != 0 { h |= 0x0001 } // D1 (Q)
    if field & 0x0008 != 0 { h |= 0x0200 } // B2
    if field & 0x0004 != 0 { h |= 0x0002 } // D2
    if field & 0x0002 != 0 { h |= 0x0400 } // B4
    if field & 0x0001 != 0 { h |= 0x0004 } // D4
    h
}

/// Gray-decode a Gillham-packed Mode A value into 100 ft increments
/// relative to −1200 ft. None for the illegal code points.
fn mode_a_to_mode_c(mode_a: u32) -> Option<i32> {
    let mut five_hundreds = 0u32;
    let mut one_hundreds = 0u32;

    // D1 set or C bits all clear are not valid altitude codes.
    if mode_a & 0xFFFF_8889 != 0 || mode_a & 0x0000_00F0 == 0 {
        return None;
    }

    if mode_a & 0x0010 != 0 { one_hundreds ^= 0x007 } // C1
    if mode_a & 0x0020 != 0 { one_hundreds ^= 0x003 } // C2
    if mode_a & 0x0040 != 0 { one_hundreds ^= 0x001 } // C4

    // 5 and 7 swap in the reflected code.
    if one_hundreds & 5 == 5 {
        one_hundreds ^= 2;
    }
    if one_hundreds > 5 {
        return None;
    }

    if mode_a & 0x0002 != 0 { five_hundreds ^= 0x0FF } // D2
    if mode_a & 0x0004 != 0 { five_hundreds ^= 0x07F } // D4
    if mode_a & 0x1000 != 0 { five_hundreds ^= 0x03F } // A1
    if mode_a & 0x2000 != 0 { five_hundreds ^= 0x01F } // A2
    if mode_a & 0x4000 != 0 { five_hundreds ^= 0x00F } // A4
    if mode_a & 0x0100 != 0 { five_hundreds ^= 0x007 } // B1
    if mode_a & 0x0200 != 0 { five_hundreds ^= 0x003 } // B2
    if mode_a & 0x0400 != 0 { five_hundreds ^= 0x001 } // B4

    if five_hundreds & 1 != 0 {
        one_hundreds = 6 - one_hundreds;
    }

    Some(five_hundreds as i32 * 5 + one_hundreds as i32 - 13)
}

/// Ground movement field of a surface position frame, in knots.
/// None when the field carries no information.
fn decode_movement_field(movement: u32) -> Option<f64> {
    match movement {
        0 => None,
        1 => Some(0.0),
        2..=8 => Some(0.125 + (movement - 2) as f64 * 0.125),
        9..=12 => Some(1.0 + (movement - 9) as f64 * 0.25),
        13..=38 => Some(2.0 + (movement - 13) as f64 * 0.5),
        39..=93 => Some(15.0 + (movement - 39) as f64),
        94..=108 => Some(70.0 + (movement - 94) as f64 * 2.0),
        109..=123 => Some(100.0 + (movement - 109) as f64 * 5.0),
        124 => Some(175.0),
        _ => None,
    }
}

impl ModesMessage {
    /// The 24-bit ICAO address.
    pub fn icao_address(&self) -> u32 {
        ((self.aa[0] as u32) << 16) | ((self.aa[1] as u32) << 8) | (self.aa[2] as u32)
    }

    fn icao_into_cache(&self, cache: &mut IcaoCache, now: Instant) {
        cache.record(self.icao_address(), now);
    }

    /// Signal level in dBFS.
    pub fn rssi_dbfs(&self) -> f64 {
        crate::signal::power_to_dbfs(self.signal_power)
    }

    /// Raw wire form: `*<lowercase hex>;`
    pub fn to_raw_string(&self) -> String {
        use std::fmt::Write as _;

        let bytes = self.msg_bits / 8;
        let mut s = String::with_capacity(bytes * 2 + 2);
        s.push('*');
        for b in &self.msg[..bytes] {
            let _ = write!(s, "{:02x}", b);
        }
        s.push(';');
        s
    }

    /// SBS/BaseStation line (22 comma-separated fields, no terminator),
    /// or None for frames that have no SBS mapping.
    pub fn to_sbs_string(&self, position: Option<(f64, f64)>) -> Option<String> {
        let mut fields: [String; 22] = Default::default();

        let (msg_type, fill): (u8, fn(&ModesMessage, Option<(f64, f64)>, &mut [String; 22])) =
            match self.msg_type {
                0 | 16 => (7, fill_sbs_altitude),
                4 | 20 => (5, fill_sbs_altitude),
                5 | 21 => (6, fill_sbs_identity),
                11 => (8, fill_sbs_none),
                17 | 18 => match self.me_type {
                    1..=4 => (1, fill_sbs_callsign),
                    5..=8 | 9..=18 | 20..=22 => (3, fill_sbs_position),
                    19 if self.me_sub == 1 || self.me_sub == 2 => (4, fill_sbs_velocity),
                    _ => return None,
                },
                _ => return None,
            };

        let now = Local::now();
        fields[0] = "MSG".into();
        fields[1] = msg_type.to_string();
        fields[4] = format!("{:06X}", self.icao_address());
        fields[6] = now.format("%Y/%m/%d").to_string();
        fields[7] = now.format("%H:%M:%S%.3f").to_string();
        fields[8] = fields[6].clone();
        fields[9] = fields[7].clone();

        fill(self, position, &mut fields);
        Some(fields.join(","))
    }

    /// Ground-state flags for SBS fields 19..22: (alert, emergency,
    /// spi, is_on_ground), each -1 when set.
    fn flight_status_flags(&self) -> (i32, i32, i32, i32) {
        let emergency =
            if matches!(self.identity, 7500 | 7600 | 7700) { -1 } else { 0 };
        let ground = if self.fs == 1 || self.fs == 3 || self.on_surface { -1 } else { 0 };
        let alert = if matches!(self.fs, 2 | 3 | 4) { -1 } else { 0 };
        let spi = if self.fs == 4 || self.fs == 5 { -1 } else { 0 };
        (alert, emergency, spi, ground)
    }
}

fn fill_sbs_none(_mm: &ModesMessage, _pos: Option<(f64, f64)>, _f: &mut [String; 22]) {}

fn fill_sbs_altitude(mm: &ModesMessage, _pos: Option<(f64, f64)>, f: &mut [String; 22]) {
    f[11] = mm.altitude.to_string();
    let (alert, emergency, spi, ground) = mm.flight_status_flags();
    f[18] = alert.to_string();
    f[19] = emergency.to_string();
    f[20] = spi.to_string();
    f[21] = ground.to_string();
}

fn fill_sbs_identity(mm: &ModesMessage, _pos: Option<(f64, f64)>, f: &mut [String; 22]) {
    f[17] = format!("{:04}", mm.identity);
    let (alert, emergency, spi, ground) = mm.flight_status_flags();
    f[18] = alert.to_string();
    f[19] = emergency.to_string();
    f[20] = spi.to_string();
    f[21] = ground.to_string();
}

fn fill_sbs_zero_flags(f: &mut [String; 22]) {
    for field in &mut f[18..22] {
        *field = "0".to_string();
    }
}

fn fill_sbs_callsign(mm: &ModesMessage, _pos: Option<(f64, f64)>, f: &mut [String; 22]) {
    f[10] = mm.flight.clone();
    fill_sbs_zero_flags(f);
}

fn fill_sbs_position(mm: &ModesMessage, pos: Option<(f64, f64)>, f: &mut [String; 22]) {
    f[11] = mm.altitude.to_string();
    if let Some((lat, lon)) = pos {
        f[14] = format!("{:.5}", lat);
        f[15] = format!("{:.5}", lon);
    }
    fill_sbs_zero_flags(f);
    if mm.on_surface {
        f[21] = "-1".to_string();
    }
}

fn fill_sbs_velocity(mm: &ModesMessage, _pos: Option<(f64, f64)>, f: &mut [String; 22]) {
    f[12] = mm.velocity.to_string();
    f[13] = (mm.heading.round() as i32).to_string();
    let vr = if mm.vert_rate > 0 {
        (if mm.vert_rate_sign == 0 { 1 } else { -1 }) * (mm.vert_rate as i32 - 1) * 64
    } else {
        0
    };
    f[16] = vr.to_string();
    fill_sbs_zero_flags(f);
}

impl fmt::Display for ModesMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.to_raw_string())?;
        writeln!(
            f,
            "CRC: {:06x} ({})",
            self.crc,
            if self.crc_ok { "ok" } else { "wrong" }
        )?;
        if let Some(bit) = self.error_bit {
            writeln!(f, "Fixed bit {}", bit)?;
        }
        if let Some(bit) = self.error_bit2 {
            writeln!(f, "Fixed bit {}", bit)?;
        }

        let unit = if self.unit == AltitudeUnit::Meters { "meters" } else { "feet" };
        match self.msg_type {
            0 | 16 => {
                let name = if self.msg_type == 0 { "Short" } else { "Long" };
                writeln!(f, "DF {}: {} Air-Air Surveillance.", self.msg_type, name)?;
                writeln!(f, "  Altitude     : {} {}", self.altitude, unit)?;
                writeln!(f, "  ICAO Address : {:06x}", self.icao_address())?;
            }
            4 | 20 => {
                let name = if self.msg_type == 4 { "Surveillance" } else { "Comm-B" };
                writeln!(f, "DF {}: {}, Altitude Reply.", self.msg_type, name)?;
                writeln!(f, "  Flight Status: {}", flight_status_str(self.fs))?;
                writeln!(f, "  DR           : {}", self.dr)?;
                writeln!(f, "  UM           : {}", self.um)?;
                writeln!(f, "  Altitude     : {} {}", self.altitude, unit)?;
                writeln!(f, "  ICAO Address : {:06x}", self.icao_address())?;
                if let Some(mb) = self.mb {
                    write!(f, "  MB           : ")?;
                    for b in mb {
                        write!(f, "{:02x}", b)?;
                    }
                    writeln!(f)?;
                }
            }
            5 | 21 => {
                let name = if self.msg_type == 5 { "Surveillance" } else { "Comm-B" };
                writeln!(f, "DF {}: {}, Identity Reply.", self.msg_type, name)?;
                writeln!(f, "  Flight Status: {}", flight_status_str(self.fs))?;
                writeln!(f, "  DR           : {}", self.dr)?;
                writeln!(f, "  UM           : {}", self.um)?;
                writeln!(f, "  Squawk       : {:04}", self.identity)?;
                writeln!(f, "  ICAO Address : {:06x}", self.icao_address())?;
                if let Some(mb) = self.mb {
                    write!(f, "  MB           : ")?;
                    for b in mb {
                        write!(f, "{:02x}", b)?;
                    }
                    writeln!(f)?;
                }
            }
            11 => {
                writeln!(f, "DF 11: All Call Reply.")?;
                writeln!(f, "  Capability   : {}", self.ca)?;
                writeln!(f, "  ICAO Address : {:06x}", self.icao_address())?;
            }
            17 | 18 => {
                let name = if self.msg_type == 17 { "ADS-B message" } else { "TIS-B message" };
                writeln!(f, "DF {}: {}.", self.msg_type, name)?;
                writeln!(f, "  ICAO Address : {:06x}", self.icao_address())?;
                writeln!(f, "  Typecode     : {} / subtype {}", self.me_type, self.me_sub)?;
                match self.me_type {
                    1..=4 => {
                        let categories = ["D", "C", "B", "A"];
                        writeln!(
                            f,
                            "  Aircraft Type : {}",
                            categories.get(self.aircraft_type as usize).unwrap_or(&"?")
                        )?;
                        writeln!(f, "  Identification: {}", self.flight)?;
                    }
                    5..=8 => {
                        writeln!(f, "  Surface position ({})",
                                 if self.fflag { "odd" } else { "even" })?;
                        writeln!(f, "  Speed        : {} kt", self.velocity)?;
                    }
                    9..=18 | 20..=22 => {
                        writeln!(f, "  F flag       : {}", if self.fflag { "odd" } else { "even" })?;
                        writeln!(f, "  T flag       : {}", if self.tflag { "UTC" } else { "non-UTC" })?;
                        writeln!(f, "  Altitude     : {} feet", self.altitude)?;
                        writeln!(f, "  CPR lat/lon  : {} / {}", self.raw_latitude, self.raw_longitude)?;
                    }
                    19 => {
                        writeln!(f, "  Speed        : {} kt", self.velocity)?;
                        writeln!(f, "  Heading      : {:.1}", self.heading)?;
                        if self.me_sub == 1 || self.me_sub == 2 {
                            let vr = (if self.vert_rate_sign == 0 { 1 } else { -1 })
                                * (self.vert_rate.max(1) as i32 - 1)
                                * 64;
                            writeln!(f, "  Vertical rate: {} ft/min ({})",
                                     vr,
                                     if self.vert_rate_source == 0 { "GNSS" } else { "baro" })?;
                        }
                    }
                    _ => writeln!(f, "  Unrecognized typecode")?,
                }
            }
            _ => {
                writeln!(f, "DF {} (recognised by length only)", self.msg_type)?;
            }
        }
        Ok(())
    }
}

fn flight_status_str(fs: u8) -> &'static str {
    match fs {
        0 => "Normal, Airborne",
        1 => "Normal, On the ground",
        2 => "ALERT, Airborne",
        3 => "ALERT, On the ground",
        4 => "ALERT & Special Position Identification",
        5 => "Special Position Identification",
        _ => "Not assigned",
    }
}

/// Parse one `*<hex>;` framed message from raw network input.
/// Whitespace around the frame is tolerated.
pub fn decode_hex_message(
    line: &str,
    fix: FixOptions,
    cache: &mut IcaoCache,
    now: Instant,
) -> Option<ModesMessage> {
    let line = line.trim();
    if line.len() < 4 || !line.starts_with('*') || !line.ends_with(';') {
        return None;
    }

    let hex = &line[1..line.len() - 1];
    if hex.len() != MODES_SHORT_MSG_BYTES * 2 && hex.len() != MODES_LONG_MSG_BYTES * 2 {
        return None;
    }

    let mut msg = [0u8; MODES_LONG_MSG_BYTES];
    for (i, chunk) in hex.as_bytes().chunks_exact(2).enumerate() {
        let high = hex_digit_val(chunk[0])?;
        let low = hex_digit_val(chunk[1])?;
        msg[i] = (high << 4) | low;
    }

    Some(decode_modes_message(&msg[..hex.len() / 2], fix, cache, now))
}

fn hex_digit_val(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NO_FIX: FixOptions = FixOptions { one_bit: false, two_bit: false };
    const FIX_1: FixOptions = FixOptions { one_bit: true, two_bit: false };

    fn decode(raw: &[u8], fix: FixOptions) -> ModesMessage {
        let mut cache = IcaoCache::new();
        decode_modes_message(raw, fix, &mut cache, Instant::now())
    }

    #[test]
    fn identification_frame_decodes_callsign() {
        let msg = [
            0x8D, 0x48, 0x40, 0xD6, 0x20, 0x2C, 0xC3, 0x71, 0xC3, 0x2C, 0xE0, 0x57, 0x60, 0x98,
        ];
        let mm = decode(&msg, NO_FIX);
        assert!(mm.crc_ok);
        assert_eq!(mm.msg_type, 17);
        assert_eq!(mm.icao_address(), 0x4840D6);
        assert_eq!(mm.me_type, 4);
        assert_eq!(mm.flight, "KLM1023");
    }

    #[test]
    fn airborne_position_frame_decodes_altitude_and_cpr() {
        let msg = [
            0x8D, 0x40, 0x62, 0x1D, 0x58, 0xC3, 0x82, 0xD6, 0x90, 0xC8, 0xAC, 0x28, 0x63, 0xA7,
        ];
        let mm = decode(&msg, NO_FIX);
        assert!(mm.crc_ok);
        assert_eq!(mm.icao_address(), 0x40621D);
        assert_eq!(mm.me_type, 11);
        assert!(!mm.fflag);
        assert_eq!(mm.altitude, 38000);
        assert_eq!(mm.raw_latitude, 93000);
        assert_eq!(mm.raw_longitude, 51372);
    }

    #[test]
    fn velocity_frame_decodes_speed_and_heading() {
        let msg = [
            0x8D, 0x48, 0x50, 0x20, 0x99, 0x44, 0x09, 0x94, 0x08, 0x38, 0x17, 0x5B, 0x28, 0x4F,
        ];
        let mm = decode(&msg, NO_FIX);
        assert!(mm.crc_ok);
        assert_eq!(mm.me_type, 19);
        assert_eq!(mm.me_sub, 1);
        assert_eq!(mm.ew_velocity, 9);
        assert_eq!(mm.ns_velocity, 160);
        assert_eq!(mm.velocity, 160);
        assert!((mm.heading - 183.2).abs() < 0.1);
        assert!(mm.heading_is_valid);
        // 14 in the field, down: (14-1)*64 descending.
        assert_eq!(mm.vert_rate, 14);
        assert_eq!(mm.vert_rate_sign, 1);
    }

    #[test]
    fn squawk_unshuffles_to_octal_digits() {
        // DF 5 with identity field 0b0101010101010: A=7, B=7, C=0, D=0.
        let mut msg = [0u8; 7];
        msg[0] = 0x28;
        msg[2] = 0x0A;
        msg[3] = 0xAA;
        // Give it a valid overlaid CRC by pre-seeding the cache with
        // the syndrome address.
        let addr = syndrome(&msg, 56);
        let mut cache = IcaoCache::new();
        let now = Instant::now();
        cache.record(addr, now);
        let mm = decode_modes_message(&msg, NO_FIX, &mut cache, now);
        assert!(mm.crc_ok);
        assert_eq!(mm.identity, 7700);
    }

    #[test]
    fn gillham_coded_altitude() {
        // B2 C2 C1 set: five_hundreds gray 3, one_hundreds gray 4,
        // reflected -> 2; 3*5 + 2 - 13 = 4 (400 ft).
        assert_eq!(mode_a_to_mode_c(0x0230), Some(4));
        // All-zero C bits and a set D1 are not altitude codes.
        assert_eq!(mode_a_to_mode_c(0x0200), None);
        assert_eq!(mode_a_to_mode_c(0x0231), None);
    }

    #[test]
    fn single_bit_repair_is_applied_and_scored() {
        let mut msg = [
            0x8D, 0x48, 0x40, 0xD6, 0x20, 0x2C, 0xC3, 0x71, 0xC3, 0x2C, 0xE0, 0x57, 0x60, 0x98,
        ];
        msg[5] ^= 0x20; // bit 42
        let rejected = decode(&msg, NO_FIX);
        assert!(!rejected.crc_ok);

        let fixed = decode(&msg, FIX_1);
        assert!(fixed.crc_ok);
        assert_eq!(fixed.corrected_bits, 1);
        assert_eq!(fixed.error_bit, Some(42));
        assert_eq!(fixed.flight, "KLM1023");
        assert_eq!(fixed.score, 950);
    }

    #[test]
    fn overlaid_crc_requires_recent_icao() {
        // DF 0 from an address nobody has heard: rejected with the
        // unknown-ICAO score.
        let msg = [0x02u8, 0x81, 0x98, 0x10, 0xB0, 0x30, 0x30];
        let mut cache = IcaoCache::new();
        let now = Instant::now();
        let mm = decode_modes_message(&msg, NO_FIX, &mut cache, now);
        assert!(!mm.crc_ok);
        assert_eq!(mm.score, -200);

        // Once the address is hot, the same frame is accepted.
        cache.record(syndrome(&msg, 56), now);
        let mm = decode_modes_message(&msg, NO_FIX, &mut cache, now);
        assert!(mm.crc_ok);
        assert_eq!(mm.score, 1000);
    }

    #[test]
    fn score_matches_decode_outcome() {
        let good = [
            0x8D, 0x48, 0x40, 0xD6, 0x20, 0x2C, 0xC3, 0x71, 0xC3, 0x2C, 0xE0, 0x57, 0x60, 0x98,
        ];
        let cache = IcaoCache::new();
        let now = Instant::now();
        assert_eq!(score_modes_message(&good, NO_FIX, &cache, now), 1000);

        let mut damaged = good;
        damaged[10] ^= 0x01;
        assert_eq!(score_modes_message(&damaged, NO_FIX, &cache, now), -2);
        assert_eq!(score_modes_message(&damaged, FIX_1, &cache, now), 950);
    }

    #[test]
    fn raw_string_round_trips_through_hex_parser() {
        let msg = [
            0x8D, 0x48, 0x40, 0xD6, 0x20, 0x2C, 0xC3, 0x71, 0xC3, 0x2C, 0xE0, 0x57, 0x60, 0x98,
        ];
        let mm = decode(&msg, NO_FIX);
        let raw = mm.to_raw_string();
        assert_eq!(raw, "*8d4840d6202cc371c32ce0576098;");

        let mut cache = IcaoCache::new();
        let back = decode_hex_message(&raw, NO_FIX, &mut cache, Instant::now()).unwrap();
        assert_eq!(back.msg[..14], mm.msg[..14]);
        assert_eq!(back.icao_address(), 0x4840D6);
    }

    #[test]
    fn hex_parser_rejects_malformed_frames() {
        let mut cache = IcaoCache::new();
        let now = Instant::now();
        let fix = NO_FIX;
        assert!(decode_hex_message("8d4840d6202cc371c32ce0576098;", fix, &mut cache, now).is_none());
        assert!(decode_hex_message("*8d4840d6202cc371c32ce0576098", fix, &mut cache, now).is_none());
        assert!(decode_hex_message("*8d48;", fix, &mut cache, now).is_none());
        assert!(decode_hex_message("*zz4840d6202cc371c32ce0576098;", fix, &mut cache, now).is_none());
    }

    #[test]
    fn sbs_line_has_22_fields() {
        let msg = [
            0x8D, 0x48, 0x50, 0x20, 0x99, 0x44, 0x09, 0x94, 0x08, 0x38, 0x17, 0x5B, 0x28, 0x4F,
        ];
        let mm = decode(&msg, NO_FIX);
        let line = mm.to_sbs_string(None).unwrap();
        let fields: Vec<&str> = line.split(',').collect();
        assert_eq!(fields.len(), 22);
        assert_eq!(fields[0], "MSG");
        assert_eq!(fields[1], "4");
        assert_eq!(fields[4], "485020");
        assert_eq!(fields[12], "160");
        assert_eq!(fields[16], "-832");
    }

    #[test]
    fn sbs_position_line_carries_lat_lon() {
        let msg = [
            0x8D, 0x40, 0x62, 0x1D, 0x58, 0xC3, 0x82, 0xD6, 0x90, 0xC8, 0xAC, 0x28, 0x63, 0xA7,
        ];
        let mm = decode(&msg, NO_FIX);
        let line = mm.to_sbs_string(Some((51.47, -0.4543))).unwrap();
        let fields: Vec<&str> = line.split(',').collect();
        assert_eq!(fields[1], "3");
        assert_eq!(fields[11], "38000");
        assert_eq!(fields[14], "51.47000");
        assert_eq!(fields[15], "-0.45430");
    }

    #[test]
    fn df_bitsets_gate_slicing() {
        let plain = DfBitsets::new(false);
        assert_eq!(plain.message_len(17), Some(14));
        assert_eq!(plain.message_len(11), Some(7));
        assert_eq!(plain.message_len(3), None);
        assert_eq!(plain.message_len(19), None);

        let fixing = DfBitsets::new(true);
        // 19 = 17 ^ (1 << 1): accepted as possibly-damaged DF 17.
        assert_eq!(fixing.message_len(19), Some(14));
    }

    #[test]
    fn getbits_is_msb_first_one_based() {
        let data = [0b1010_0000u8, 0b0000_0001];
        assert_eq!(getbits(&data, 1, 1), 1);
        assert_eq!(getbits(&data, 1, 4), 0b1010);
        assert_eq!(getbits(&data, 9, 16), 1);
        assert_eq!(getbits(&data, 3, 10), 0b1000_0000);
    }
}
