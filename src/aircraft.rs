//! Aircraft registry and positional tracking.
//!
//! Keyed on the 24-bit ICAO address. Records are updated from decoded
//! frames (or synthetic SBS input updates), age out after the
//! interactive TTL, and walk a show-state machine the interactive view
//! uses to colour arrivals and departures.

use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tracing::debug;

use crate::cpr;
use crate::decoder::ModesMessage;
use crate::signal::power_to_dbfs;

const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Pairing window for a global CPR decode.
const CPR_AIRBORNE_WINDOW: Duration = Duration::from_secs(10);
const CPR_SURFACE_WINDOW: Duration = Duration::from_secs(50);

/// Display lifecycle of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShowState {
    /// Fresh aircraft, not yet painted.
    FirstTime,
    Normal,
    /// About to be evicted; painted once more.
    LastTime,
    None,
}

/// How a position fix was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionSource {
    Global,
    Local,
}

#[derive(Debug, Clone)]
pub struct Aircraft {
    pub addr: u32,
    pub hex_addr: String,
    pub flight: String,
    pub altitude: i32,
    pub speed: u16,
    pub heading: f64,
    pub heading_is_valid: bool,
    pub squawk: u16,
    pub seen_first: Instant,
    pub seen: Instant,
    pub seen_pos: Option<Instant>,
    pub messages: u64,
    /// Normalized signal power of the last four messages, ring-indexed.
    pub sig_levels: [f64; 4],
    pub sig_idx: usize,
    pub odd_cpr: Option<(u32, u32, Instant)>,
    pub even_cpr: Option<(u32, u32, Instant)>,
    pub on_surface: bool,
    pub position: Option<(f64, f64)>,
    /// Dead-reckoned position between fixes, advanced once a second.
    pub est_position: Option<(f64, f64)>,
    pub est_updated: Option<Instant>,
    pub distance: Option<f64>,
    pub est_distance: Option<f64>,
    pub show: ShowState,
}

impl Aircraft {
    fn new(addr: u32, now: Instant) -> Self {
        Self {
            addr,
            hex_addr: format!("{:06X}", addr),
            flight: String::new(),
            altitude: 0,
            speed: 0,
            heading: 0.0,
            heading_is_valid: false,
            squawk: 0,
            seen_first: now,
            seen: now,
            seen_pos: None,
            messages: 0,
            sig_levels: [0.0; 4],
            sig_idx: 0,
            odd_cpr: None,
            even_cpr: None,
            on_surface: false,
            position: None,
            est_position: None,
            est_updated: None,
            distance: None,
            est_distance: None,
            show: ShowState::FirstTime,
        }
    }

    /// Mean signal level of the RSSI ring, in dBFS.
    pub fn rssi_dbfs(&self) -> f64 {
        let n = self.messages.min(4).max(1) as f64;
        let sum: f64 = self.sig_levels.iter().sum();
        power_to_dbfs(sum / n)
    }
}

/// A synthetic update parsed from an SBS/BaseStation input line.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SbsUpdate {
    pub addr: u32,
    pub callsign: Option<String>,
    pub altitude: Option<i32>,
    pub ground_speed: Option<f64>,
    pub track: Option<f64>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub squawk: Option<u16>,
}

pub struct AircraftStore {
    aircraft: HashMap<u32, Aircraft>,
    ttl: Duration,
    home: Option<(f64, f64)>,
    last_est_update: Option<Instant>,
}

impl AircraftStore {
    pub fn new(ttl_secs: u64, home: Option<(f64, f64)>) -> Self {
        Self {
            aircraft: HashMap::new(),
            ttl: Duration::from_secs(ttl_secs),
            home,
            last_est_update: None,
        }
    }

    pub fn get(&self, addr: u32) -> Option<&Aircraft> {
        self.aircraft.get(&addr)
    }

    pub fn all(&self) -> impl Iterator<Item = &Aircraft> {
        self.aircraft.values()
    }

    pub fn len(&self) -> usize {
        self.aircraft.len()
    }

    pub fn is_empty(&self) -> bool {
        self.aircraft.is_empty()
    }

    /// Last confirmed fix for an aircraft, if any.
    pub fn position_of(&self, addr: u32) -> Option<(f64, f64)> {
        self.aircraft.get(&addr).and_then(|a| a.position)
    }

    /// Apply one decoded frame. Returns how a position fix was derived,
    /// when one was.
    pub fn update_from_message(
        &mut self,
        mm: &ModesMessage,
        now: Instant,
    ) -> Option<PositionSource> {
        let addr = mm.icao_address();
        let home = self.home;
        let a = self
            .aircraft
            .entry(addr)
            .or_insert_with(|| Aircraft::new(addr, now));

        a.seen = now;
        a.messages += 1;
        a.sig_levels[a.sig_idx] = mm.signal_power;
        a.sig_idx = (a.sig_idx + 1) % a.sig_levels.len();

        let mut outcome = None;
        match mm.msg_type {
            0 | 4 | 16 | 20 => {
                a.altitude = mm.altitude;
            }
            5 | 21 => {
                if mm.identity != 0 {
                    a.squawk = mm.identity;
                }
            }
            17 | 18 => match mm.me_type {
                1..=4 => {
                    a.flight = mm.flight.clone();
                }
                5..=8 => {
                    if mm.velocity > 0 {
                        a.speed = mm.velocity;
                    }
                    if mm.heading_is_valid {
                        a.heading = mm.heading;
                        a.heading_is_valid = true;
                    }
                    outcome = Self::apply_cpr(a, mm, true, home, now);
                }
                9..=18 | 20..=22 => {
                    a.altitude = mm.altitude;
                    outcome = Self::apply_cpr(a, mm, false, home, now);
                }
                19 => {
                    if mm.velocity > 0 || mm.me_sub == 1 || mm.me_sub == 2 {
                        a.speed = mm.velocity;
                    }
                    if mm.heading_is_valid {
                        a.heading = mm.heading;
                        a.heading_is_valid = true;
                    }
                }
                _ => {}
            },
            11 => {}
            _ => {}
        }
        outcome
    }

    fn apply_cpr(
        a: &mut Aircraft,
        mm: &ModesMessage,
        surface: bool,
        home: Option<(f64, f64)>,
        now: Instant,
    ) -> Option<PositionSource> {
        a.on_surface = surface;
        if mm.fflag {
            a.odd_cpr = Some((mm.raw_latitude, mm.raw_longitude, now));
        } else {
            a.even_cpr = Some((mm.raw_latitude, mm.raw_longitude, now));
        }

        let window = if surface { CPR_SURFACE_WINDOW } else { CPR_AIRBORNE_WINDOW };
        let reference = a.position.or(home);

        // Both parities fresh: global decode.
        if let (Some((elat, elon, etime)), Some((olat, olon, otime))) = (a.even_cpr, a.odd_cpr) {
            let age = if etime > otime { etime - otime } else { otime - etime };
            if age <= window {
                if let Some(pos) = cpr::decode_global(
                    (elat, elon),
                    (olat, olon),
                    otime > etime,
                    surface,
                    reference,
                ) {
                    Self::set_position(a, pos, home, now);
                    return Some(PositionSource::Global);
                }
                return None;
            }
        }

        // Single fresh frame: resolve against the last known position
        // or the receiver location.
        if let Some(reference) = reference {
            let raw = (mm.raw_latitude, mm.raw_longitude);
            if let Some(pos) = cpr::decode_local(raw, mm.fflag, surface, reference) {
                Self::set_position(a, pos, home, now);
                return Some(PositionSource::Local);
            }
        }
        None
    }

    fn set_position(a: &mut Aircraft, pos: (f64, f64), home: Option<(f64, f64)>, now: Instant) {
        a.position = Some(pos);
        a.seen_pos = Some(now);
        a.est_position = Some(pos);
        a.est_updated = Some(now);
        if let Some(home) = home {
            let d = great_circle_dist(pos, home);
            a.distance = Some(d);
            a.est_distance = Some(d);
        }
    }

    /// Apply a synthetic update from SBS input.
    pub fn update_from_sbs(&mut self, update: &SbsUpdate, now: Instant) {
        let home = self.home;
        let a = self
            .aircraft
            .entry(update.addr)
            .or_insert_with(|| Aircraft::new(update.addr, now));

        a.seen = now;
        a.messages += 1;

        if let Some(ref callsign) = update.callsign {
            a.flight = callsign.clone();
        }
        if let Some(altitude) = update.altitude {
            a.altitude = altitude;
        }
        if let Some(gs) = update.ground_speed {
            a.speed = gs.round() as u16;
        }
        if let Some(track) = update.track {
            a.heading = track;
            a.heading_is_valid = true;
        }
        if let Some(squawk) = update.squawk {
            a.squawk = squawk;
        }
        if let (Some(lat), Some(lon)) = (update.lat, update.lon) {
            Self::set_position(a, (lat, lon), home, now);
        }
    }

    /// Periodic housekeeping, called every 125 ms: advance show-states,
    /// evict silent aircraft, and (once a second) dead-reckon estimated
    /// positions forward.
    pub fn tick(&mut self, now: Instant) {
        let ttl = self.ttl;
        self.aircraft.retain(|_, a| {
            let idle = now.duration_since(a.seen);
            match a.show {
                ShowState::FirstTime => {
                    a.show = ShowState::Normal;
                    true
                }
                ShowState::Normal => {
                    // A silent aircraft gets one more paint in its
                    // last-time state before it goes.
                    if idle + Duration::from_secs(1) >= ttl {
                        a.show = ShowState::LastTime;
                    }
                    true
                }
                ShowState::LastTime => {
                    if idle > ttl {
                        a.show = ShowState::None;
                        debug!(
                            "dropping {} after {}s tracked, {} messages",
                            a.hex_addr,
                            now.duration_since(a.seen_first).as_secs(),
                            a.messages
                        );
                        false
                    } else {
                        true
                    }
                }
                ShowState::None => false,
            }
        });

        let advance = match self.last_est_update {
            Some(t) => now.duration_since(t) >= Duration::from_secs(1),
            None => true,
        };
        if advance {
            let dt = self
                .last_est_update
                .map(|t| now.duration_since(t).as_secs_f64())
                .unwrap_or(0.0);
            self.last_est_update = Some(now);
            if dt > 0.0 {
                let home = self.home;
                for a in self.aircraft.values_mut() {
                    estimate_position(a, dt, home);
                }
            }
        }
    }

    /// Legacy aircraft array (the `data.json` shape).
    pub fn legacy_json(&self) -> String {
        let entries: Vec<LegacyAircraft> = self
            .aircraft
            .values()
            .filter_map(|a| {
                let (lat, lon) = a.position?;
                Some(LegacyAircraft {
                    hex: a.hex_addr.clone(),
                    flight: a.flight.clone(),
                    lat,
                    lon,
                    altitude: a.altitude,
                    track: a.heading.round() as i32,
                    speed: a.speed,
                })
            })
            .collect();
        serde_json::to_string(&entries).unwrap_or_else(|_| "[]".into())
    }

    /// Extended aircraft list (the `aircraft.json` shape).
    pub fn aircraft_json(&self, now: Instant, messages_total: u64) -> String {
        let unix_now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);

        let aircraft: Vec<AircraftJson> = self
            .aircraft
            .values()
            .map(|a| {
                let (lat, lon) = match a.position {
                    Some((lat, lon)) => (Some(lat), Some(lon)),
                    None => (None, None),
                };
                AircraftJson {
                    hex: a.hex_addr.to_lowercase(),
                    flight: if a.flight.is_empty() { None } else { Some(a.flight.clone()) },
                    squawk: if a.squawk != 0 { Some(format!("{:04}", a.squawk)) } else { None },
                    alt_baro: if a.altitude != 0 { Some(a.altitude) } else { None },
                    gs: if a.speed != 0 { Some(a.speed) } else { None },
                    track: if a.heading_is_valid { Some(round1(a.heading)) } else { None },
                    lat,
                    lon,
                    seen: round1(now.duration_since(a.seen).as_secs_f64()),
                    seen_pos: a
                        .seen_pos
                        .map(|t| round1(now.duration_since(t).as_secs_f64())),
                    rssi: round1(a.rssi_dbfs()),
                    messages: a.messages,
                    dist: a
                        .est_distance
                        .or(a.distance)
                        .map(|d| round1(d / 1000.0)),
                }
            })
            .collect();

        let doc = AircraftJsonDoc {
            now: unix_now,
            messages: messages_total,
            aircraft,
        };
        serde_json::to_string(&doc).unwrap_or_else(|_| "{}".into())
    }
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

#[derive(Serialize)]
struct LegacyAircraft {
    hex: String,
    flight: String,
    lat: f64,
    lon: f64,
    altitude: i32,
    track: i32,
    speed: u16,
}

#[derive(Serialize)]
struct AircraftJsonDoc {
    now: f64,
    messages: u64,
    aircraft: Vec<AircraftJson>,
}

#[derive(Serialize)]
struct AircraftJson {
    hex: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    flight: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    squawk: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    alt_baro: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    gs: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    track: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    lat: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    lon: Option<f64>,
    seen: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    seen_pos: Option<f64>,
    rssi: f64,
    messages: u64,
    /// Distance from the receiver in km, when a home position is set.
    #[serde(skip_serializing_if = "Option::is_none")]
    dist: Option<f64>,
}

/// Great-circle distance between two (lat, lon) positions, in metres.
pub fn great_circle_dist(a: (f64, f64), b: (f64, f64)) -> f64 {
    let (lat1, lon1) = (a.0.to_radians(), a.1.to_radians());
    let (lat2, lon2) = (b.0.to_radians(), b.1.to_radians());

    let angle =
        (lat1.sin() * lat2.sin() + lat1.cos() * lat2.cos() * (lon2 - lon1).cos()).clamp(-1.0, 1.0);
    EARTH_RADIUS_M * angle.acos()
}

/// Advance the dead-reckoned position along the last heading at the
/// last speed. Knots to metres per second is 1852/3600.
fn estimate_position(a: &mut Aircraft, dt: f64, home: Option<(f64, f64)>) {
    if a.speed == 0 || !a.heading_is_valid {
        return;
    }
    let Some((lat, lon)) = a.est_position else {
        return;
    };

    let dist = a.speed as f64 * (1852.0 / 3600.0) * dt;
    let heading = a.heading.to_radians();
    let dlat = (dist * heading.cos() / EARTH_RADIUS_M).to_degrees();
    let cos_lat = lat.to_radians().cos().max(1e-6);
    let dlon = (dist * heading.sin() / (EARTH_RADIUS_M * cos_lat)).to_degrees();

    let next = (lat + dlat, lon + dlon);
    a.est_position = Some(next);
    a.est_updated = a.est_updated.map(|t| t + Duration::from_secs_f64(dt));
    if let Some(home) = home {
        a.est_distance = Some(great_circle_dist(next, home));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::{decode_modes_message, FixOptions};
    use crate::crc::IcaoCache;

    const NO_FIX: FixOptions = FixOptions { one_bit: false, two_bit: false };

    fn decode(raw: &[u8]) -> ModesMessage {
        let mut cache = IcaoCache::new();
        decode_modes_message(raw, NO_FIX, &mut cache, Instant::now())
    }

    #[test]
    fn identification_updates_flight() {
        let mut store = AircraftStore::new(60, None);
        let mm = decode(&[
            0x8D, 0x48, 0x40, 0xD6, 0x20, 0x2C, 0xC3, 0x71, 0xC3, 0x2C, 0xE0, 0x57, 0x60, 0x98,
        ]);
        store.update_from_message(&mm, Instant::now());
        let a = store.get(0x4840D6).unwrap();
        assert_eq!(a.flight, "KLM1023");
        assert_eq!(a.messages, 1);
        assert_eq!(a.show, ShowState::FirstTime);
    }

    #[test]
    fn cpr_pair_yields_global_position() {
        let mut store = AircraftStore::new(60, None);
        let now = Instant::now();

        let even = decode(&[
            0x8D, 0x40, 0x62, 0x1D, 0x58, 0xC3, 0x82, 0xD6, 0x90, 0xC8, 0xAC, 0x28, 0x63, 0xA7,
        ]);
        assert_eq!(store.update_from_message(&even, now), None);

        let odd = decode(&[
            0x8D, 0x40, 0x62, 0x1D, 0x58, 0xC3, 0x86, 0x43, 0x5C, 0xC4, 0x12, 0x69, 0x2A, 0xD6,
        ]);
        let outcome = store.update_from_message(&odd, now + Duration::from_secs(1));
        assert_eq!(outcome, Some(PositionSource::Global));

        let (lat, lon) = store.position_of(0x40621D).unwrap();
        assert!((lat - 52.26578).abs() < 1e-3);
        assert!((lon - 3.93899).abs() < 1e-2);
    }

    #[test]
    fn stale_pair_falls_back_to_local_decode() {
        let mut store = AircraftStore::new(60, Some((52.26, 3.92)));
        let now = Instant::now();

        let odd = decode(&[
            0x8D, 0x40, 0x62, 0x1D, 0x58, 0xC3, 0x86, 0x43, 0x5C, 0xC4, 0x12, 0x69, 0x2A, 0xD6,
        ]);
        // No even partner at all: resolved against the home position.
        let outcome = store.update_from_message(&odd, now);
        assert_eq!(outcome, Some(PositionSource::Local));
        let (lat, _) = store.position_of(0x40621D).unwrap();
        assert!((lat - 52.26578).abs() < 1e-3);
    }

    #[test]
    fn ttl_eviction_walks_show_states() {
        let mut store = AircraftStore::new(10, None);
        let t0 = Instant::now();
        let mm = decode(&[
            0x8D, 0x48, 0x40, 0xD6, 0x20, 0x2C, 0xC3, 0x71, 0xC3, 0x2C, 0xE0, 0x57, 0x60, 0x98,
        ]);
        store.update_from_message(&mm, t0);

        store.tick(t0 + Duration::from_millis(125));
        assert_eq!(store.get(0x4840D6).unwrap().show, ShowState::Normal);

        // Just inside the final second: flagged for a last paint.
        store.tick(t0 + Duration::from_millis(9500));
        assert_eq!(store.get(0x4840D6).unwrap().show, ShowState::LastTime);

        // Past the TTL: gone.
        store.tick(t0 + Duration::from_millis(10200));
        assert!(store.get(0x4840D6).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn estimated_position_advances_with_speed() {
        let mut store = AircraftStore::new(60, None);
        let t0 = Instant::now();

        let even = decode(&[
            0x8D, 0x40, 0x62, 0x1D, 0x58, 0xC3, 0x82, 0xD6, 0x90, 0xC8, 0xAC, 0x28, 0x63, 0xA7,
        ]);
        let odd = decode(&[
            0x8D, 0x40, 0x62, 0x1D, 0x58, 0xC3, 0x86, 0x43, 0x5C, 0xC4, 0x12, 0x69, 0x2A, 0xD6,
        ]);
        store.update_from_message(&even, t0);
        store.update_from_message(&odd, t0);

        // Give it a northbound velocity.
        let vel = decode(&[
            0x8D, 0x48, 0x50, 0x20, 0x99, 0x44, 0x09, 0x94, 0x08, 0x38, 0x17, 0x5B, 0x28, 0x4F,
        ]);
        let mut vel_for_aircraft = vel.clone();
        vel_for_aircraft.aa = [0x40, 0x62, 0x1D];
        store.update_from_message(&vel_for_aircraft, t0);

        let before = store.get(0x40621D).unwrap().est_position.unwrap();
        store.tick(t0 + Duration::from_millis(125));
        store.tick(t0 + Duration::from_millis(1500));
        let after = store.get(0x40621D).unwrap().est_position.unwrap();
        assert!(after != before);
        // 160 kt for ~1.4 s is under 150 m.
        assert!(great_circle_dist(before, after) < 200.0);
        assert!(great_circle_dist(before, after) > 10.0);
    }

    #[test]
    fn sbs_update_creates_synthetic_aircraft() {
        let mut store = AircraftStore::new(60, None);
        let update = SbsUpdate {
            addr: 0x400000,
            callsign: Some("BAW12".into()),
            altitude: Some(12000),
            ground_speed: Some(250.0),
            track: Some(90.0),
            lat: Some(51.47),
            lon: Some(-0.4543),
            squawk: Some(4721),
        };
        store.update_from_sbs(&update, Instant::now());
        let a = store.get(0x400000).unwrap();
        assert_eq!(a.flight, "BAW12");
        assert_eq!(a.altitude, 12000);
        assert_eq!(a.speed, 250);
        assert_eq!(a.squawk, 4721);
        assert_eq!(a.position, Some((51.47, -0.4543)));
    }

    #[test]
    fn aircraft_json_contains_position_fields() {
        let mut store = AircraftStore::new(60, None);
        let now = Instant::now();
        let update = SbsUpdate {
            addr: 0x400000,
            lat: Some(51.47),
            lon: Some(-0.4543),
            ..Default::default()
        };
        store.update_from_sbs(&update, now);

        let json = store.aircraft_json(now, 42);
        let doc: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(doc["messages"], 42);
        assert_eq!(doc["aircraft"][0]["hex"], "400000");
        assert!((doc["aircraft"][0]["lat"].as_f64().unwrap() - 51.47).abs() < 1e-6);
        assert!((doc["aircraft"][0]["lon"].as_f64().unwrap() + 0.4543).abs() < 1e-6);
    }

    #[test]
    fn great_circle_dist_heathrow_to_gatwick() {
        // Roughly 40 km.
        let d = great_circle_dist((51.4700, -0.4543), (51.1537, -0.1821));
        assert!((d - 40_000.0).abs() < 3_000.0);
    }
}
