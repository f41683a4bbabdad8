//! Compact Position Reporting.
//!
//! Positions arrive as 17-bit fractions of a latitude/longitude zone,
//! alternating between an even and an odd zone grid. A fresh pair of
//! both parities pins the position globally; a single frame can be
//! resolved against a nearby reference position instead.

/// Always-positive modulo, the form the zone arithmetic needs.
fn cpr_mod(a: i32, b: i32) -> i32 {
    let res = a % b;
    if res < 0 {
        res + b
    } else {
        res
    }
}

/// Number of longitude zones at a latitude, from the precomputed
/// transition table (symmetric about the equator).
pub fn cpr_nl(lat: f64) -> i32 {
    let lat = lat.abs();

    if lat < 10.47047130 { return 59; }
    if lat < 14.82817437 { return 58; }
    if lat < 18.18626357 { return 57; }
    if lat < 21.02939493 { return 56; }
    if lat < 23.54504487 { return 55; }
    if lat < 25.82924707 { return 54; }
    if lat < 27.93898710 { return 53; }
    if lat < 29.91135686 { return 52; }
    if lat < 31.77209708 { return 51; }
    if lat < 33.53993436 { return 50; }
    if lat < 35.22899598 { return 49; }
    if lat < 36.85025108 { return 48; }
    if lat < 38.41241892 { return 47; }
    if lat < 39.92256684 { return 46; }
    if lat < 41.38651832 { return 45; }
    if lat < 42.80914012 { return 44; }
    if lat < 44.19454951 { return 43; }
    if lat < 45.54626723 { return 42; }
    if lat < 46.86733252 { return 41; }
    if lat < 48.16039128 { return 40; }
    if lat < 49.42776439 { return 39; }
    if lat < 50.67150166 { return 38; }
    if lat < 51.89342469 { return 37; }
    if lat < 53.09516153 { return 36; }
    if lat < 54.27817472 { return 35; }
    if lat < 55.44378444 { return 34; }
    if lat < 56.59318756 { return 33; }
    if lat < 57.72747354 { return 32; }
    if lat < 58.84763776 { return 31; }
    if lat < 59.95459277 { return 30; }
    if lat < 61.04917774 { return 29; }
    if lat < 62.13216659 { return 28; }
    if lat < 63.20427479 { return 27; }
    if lat < 64.26616523 { return 26; }
    if lat < 65.31845310 { return 25; }
    if lat < 66.36171008 { return 24; }
    if lat < 67.39646774 { return 23; }
    if lat < 68.42322022 { return 22; }
    if lat < 69.44242631 { return 21; }
    if lat < 70.45451075 { return 20; }
    if lat < 71.45986473 { return 19; }
    if lat < 72.45884545 { return 18; }
    if lat < 73.45177442 { return 17; }
    if lat < 74.43893416 { return 16; }
    if lat < 75.42056257 { return 15; }
    if lat < 76.39684391 { return 14; }
    if lat < 77.36789461 { return 13; }
    if lat < 78.33374083 { return 12; }
    if lat < 79.29428225 { return 11; }
    if lat < 80.24923213 { return 10; }
    if lat < 81.19801349 { return 9; }
    if lat < 82.13956981 { return 8; }
    if lat < 83.07199445 { return 7; }
    if lat < 83.99173563 { return 6; }
    if lat < 84.89166191 { return 5; }
    if lat < 85.75541621 { return 4; }
    if lat < 86.53536998 { return 3; }
    if lat < 87.00000000 { return 2; }
    1
}

fn cpr_n(lat: f64, odd: bool) -> i32 {
    let nl = cpr_nl(lat) - if odd { 1 } else { 0 };
    nl.max(1)
}

fn cpr_dlon(lat: f64, odd: bool, surface: bool) -> f64 {
    let span = if surface { 90.0 } else { 360.0 };
    span / cpr_n(lat, odd) as f64
}

/// Normalize a longitude to [-180, 180).
fn normalize_lon(lon: f64) -> f64 {
    lon - ((lon + 180.0) / 360.0).floor() * 360.0
}

/// Smallest absolute angular difference, wrapping at the antimeridian.
fn lon_delta(a: f64, b: f64) -> f64 {
    let mut d = (a - b).abs() % 360.0;
    if d > 180.0 {
        d = 360.0 - d;
    }
    d
}

/// Globally unambiguous decode from a fresh even/odd pair.
///
/// `newest_is_odd` selects which observation the result corresponds to.
/// Surface frames encode within a 90° quadrant; they additionally need
/// a `reference` position (receiver or last known fix) to pick the
/// quadrant, and `None` is returned without one.
pub fn decode_global(
    even: (u32, u32),
    odd: (u32, u32),
    newest_is_odd: bool,
    surface: bool,
    reference: Option<(f64, f64)>,
) -> Option<(f64, f64)> {
    let span = if surface { 90.0 } else { 360.0 };
    let air_dlat0 = span / 60.0;
    let air_dlat1 = span / 59.0;

    let lat0 = even.0 as f64;
    let lat1 = odd.0 as f64;
    let lon0 = even.1 as f64;
    let lon1 = odd.1 as f64;

    // Latitude zone index.
    let j = (((59.0 * lat0 - 60.0 * lat1) / 131072.0) + 0.5).floor() as i32;
    let mut rlat0 = air_dlat0 * (cpr_mod(j, 60) as f64 + lat0 / 131072.0);
    let mut rlat1 = air_dlat1 * (cpr_mod(j, 59) as f64 + lat1 / 131072.0);

    if !surface {
        if rlat0 >= 270.0 {
            rlat0 -= 360.0;
        }
        if rlat1 >= 270.0 {
            rlat1 -= 360.0;
        }
        if !(-90.0..=90.0).contains(&rlat0) || !(-90.0..=90.0).contains(&rlat1) {
            return None;
        }
    }

    // Both frames must agree on the longitude zone count.
    if cpr_nl(rlat0) != cpr_nl(rlat1) {
        return None;
    }

    let (rlat, raw_lon, odd_parity) = if newest_is_odd {
        (rlat1, lon1, true)
    } else {
        (rlat0, lon0, false)
    };

    let nl = cpr_nl(rlat);
    let ni = cpr_n(rlat, odd_parity);
    let m = ((((lon0 * (nl - 1) as f64) - (lon1 * nl as f64)) / 131072.0) + 0.5).floor() as i32;
    let mut rlon =
        cpr_dlon(rlat, odd_parity, surface) * (cpr_mod(m, ni) as f64 + raw_lon / 131072.0);

    if surface {
        // The quadrant-sized result has four longitude images and two
        // latitude images; pick the ones nearest the reference.
        let (ref_lat, ref_lon) = reference?;
        let rlat = if (rlat - ref_lat).abs() <= (rlat - 90.0 - ref_lat).abs() {
            rlat
        } else {
            rlat - 90.0
        };
        let mut best = normalize_lon(rlon);
        for k in 1..4 {
            let candidate = normalize_lon(rlon + k as f64 * 90.0);
            if lon_delta(candidate, ref_lon) < lon_delta(best, ref_lon) {
                best = candidate;
            }
        }
        return Some((rlat, best));
    }

    rlon = normalize_lon(rlon);
    Some((rlat, rlon))
}

/// Relative decode of a single frame against a reference position no
/// further than half a zone away in either axis.
pub fn decode_local(
    raw: (u32, u32),
    odd: bool,
    surface: bool,
    reference: (f64, f64),
) -> Option<(f64, f64)> {
    let (ref_lat, ref_lon) = reference;
    let span = if surface { 90.0 } else { 360.0 };
    let dlat = span / if odd { 59.0 } else { 60.0 };

    let lat_frac = raw.0 as f64 / 131072.0;
    let j = (ref_lat / dlat).floor()
        + (0.5 + ref_lat.rem_euclid(dlat) / dlat - lat_frac).floor();
    let rlat = dlat * (j + lat_frac);
    if !(-90.0..=90.0).contains(&rlat) {
        return None;
    }
    if (rlat - ref_lat).abs() > dlat / 2.0 {
        return None;
    }

    let dlon = cpr_dlon(rlat, odd, surface);
    let lon_frac = raw.1 as f64 / 131072.0;
    let m = (ref_lon / dlon).floor()
        + (0.5 + ref_lon.rem_euclid(dlon) / dlon - lon_frac).floor();
    let rlon = normalize_lon(dlon * (m + lon_frac));
    if lon_delta(rlon, ref_lon) > dlon / 2.0 {
        return None;
    }

    Some((rlat, rlon))
}

#[cfg(test)]
mod tests {
    use super::*;

    // Even/odd airborne pair for 52.2572°N 3.9194°E.
    const EVEN: (u32, u32) = (93000, 51372);
    const ODD: (u32, u32) = (74158, 50194);

    /// Test-side encoder: position -> 17-bit zone fractions.
    fn encode(lat: f64, lon: f64, odd: bool, surface: bool) -> (u32, u32) {
        let span = if surface { 90.0 } else { 360.0 };
        let dlat = span / if odd { 59.0 } else { 60.0 };
        let yz = (131072.0 * lat.rem_euclid(dlat) / dlat + 0.5).floor() as u32 % 131072;
        let dlon = span / cpr_n(lat, odd).max(1) as f64;
        let xz = (131072.0 * lon.rem_euclid(dlon) / dlon + 0.5).floor() as u32 % 131072;
        (yz, xz)
    }

    #[test]
    fn global_airborne_reference_pair() {
        let (lat, lon) = decode_global(EVEN, ODD, false, false, None).unwrap();
        assert!((lat - 52.25720).abs() < 1e-4);
        assert!((lon - 3.91937).abs() < 1e-4);

        // Resolving to the odd observation lands on that frame's fix.
        let (lat, lon) = decode_global(EVEN, ODD, true, false, None).unwrap();
        assert!((lat - 52.26578).abs() < 1e-4);
        assert!((lon - 3.93899).abs() < 1e-3);
    }

    #[test]
    fn global_rejects_zone_mismatch() {
        // A nonsense pair whose computed latitudes land outside the
        // valid range or in different NL bands.
        assert!(decode_global((0, 0), (90000, 0), false, false, None).is_none());
    }

    #[test]
    fn global_round_trips_synthesised_pair() {
        let (lat, lon) = (51.4700, -0.4543);
        let even = encode(lat, lon, false, false);
        let odd = encode(lat, lon, true, false);

        let (dlat, dlon) = decode_global(even, odd, false, false, None).unwrap();
        // 17-bit airborne resolution is about 5.1 m.
        assert!((dlat - lat).abs() < 1e-4);
        assert!((dlon - lon).abs() < 1e-4);
    }

    #[test]
    fn global_surface_uses_reference_quadrant() {
        let (lat, lon) = (51.4700, -0.4543);
        let even = encode(lat, lon, false, true);
        let odd = encode(lat, lon, true, true);

        assert!(decode_global(even, odd, false, true, None).is_none());

        let (dlat, dlon) =
            decode_global(even, odd, false, true, Some((51.5, -0.5))).unwrap();
        assert!((dlat - lat).abs() < 1e-4);
        assert!((dlon - lon).abs() < 1e-4);
    }

    #[test]
    fn local_decode_near_reference() {
        let (lat, lon) = decode_local(ODD, true, false, (52.258, 3.918)).unwrap();
        assert!((lat - 52.26578).abs() < 1e-4);
        assert!((lon - 3.93899).abs() < 1e-3);
    }

    #[test]
    fn local_decode_wraps_antimeridian() {
        // Raw longitude fraction 0.95 of a zone, reference just east of
        // the antimeridian: the candidate lands on the far side.
        let raw = ((0.1f64 * 131072.0) as u32, (0.95f64 * 131072.0) as u32);
        let (lat, lon) = decode_local(raw, false, false, (0.3, 179.95)).unwrap();
        assert!(lat.abs() < 1.0);
        assert!(lon < -177.0 && lon > -178.0);
    }

    #[test]
    fn local_decode_stays_within_half_zone_of_reference() {
        let (lat, _) = decode_local(ODD, true, false, (58.5, 3.918)).unwrap();
        assert!((lat - 58.5).abs() <= 360.0 / 59.0 / 2.0);
        // A reference a zone off resolves to a different image of the
        // same fraction, not the true fix: the caller owns freshness.
        assert!((lat - 52.26578).abs() > 1.0);
    }

    #[test]
    fn nl_table_spot_checks() {
        assert_eq!(cpr_nl(0.0), 59);
        assert_eq!(cpr_nl(45.0), 42);
        assert_eq!(cpr_nl(-45.0), 42);
        assert_eq!(cpr_nl(52.26), 36);
        assert_eq!(cpr_nl(87.5), 1);
    }
}
