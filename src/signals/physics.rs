//! Psychrometric helpers and trend fitting used by the rules.
//!
//! Vapor pressures follow the Magnus-Tetens approximation:
//!
//! ```text
//! SVP(T) = 0.6108 × exp(17.27·T / (T + 237.3))      kPa
//! VPD    = SVP × (1 − RH/100)
//! γ      = ln(RH/100) + a·T / (b + T)               a = 17.27, b = 237.7
//! Td     = b·γ / (a − γ)
//! ```

const SVP_COEFF_KPA: f64 = 0.6108;
const SVP_A: f64 = 17.27;
const SVP_B: f64 = 237.3;

const DEW_A: f64 = 17.27;
const DEW_B: f64 = 237.7;

/// Saturation vapor pressure in kPa.
pub fn saturation_vapor_pressure(temp_c: f64) -> f64 {
    SVP_COEFF_KPA * ((SVP_A * temp_c) / (temp_c + SVP_B)).exp()
}

/// Vapor pressure deficit in kPa.
pub fn vapor_pressure_deficit(temp_c: f64, rh_percent: f64) -> f64 {
    saturation_vapor_pressure(temp_c) * (1.0 - rh_percent / 100.0)
}

/// Dew point in °C. `None` when humidity is not positive.
pub fn dew_point(temp_c: f64, rh_percent: f64) -> Option<f64> {
    if rh_percent <= 0.0 {
        return None;
    }
    let gamma = (rh_percent / 100.0).ln() + (DEW_A * temp_c) / (DEW_B + temp_c);
    Some((DEW_B * gamma) / (DEW_A - gamma))
}

/// Least-squares slope of `values` against their index.
/// `None` for fewer than two points.
pub fn linear_slope(values: &[f64]) -> Option<f64> {
    let n = values.len();
    if n < 2 {
        return None;
    }
    let n_f = n as f64;
    let mean_x = (n_f - 1.0) / 2.0;
    let mean_y = values.iter().sum::<f64>() / n_f;

    let (mut num, mut den) = (0.0, 0.0);
    for (i, y) in values.iter().enumerate() {
        let dx = i as f64 - mean_x;
        num += dx * (y - mean_y);
        den += dx * dx;
    }
    Some(num / den)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn svp_at_25c() {
        let svp = saturation_vapor_pressure(25.0);
        assert!((svp - 3.167).abs() < 0.01, "Expected ~3.167 kPa, got {svp}");
    }

    #[test]
    fn vpd_saturated_air_is_zero() {
        assert!(vapor_pressure_deficit(20.0, 100.0).abs() < 1e-9);
    }

    #[test]
    fn vpd_typical_greenhouse() {
        let vpd = vapor_pressure_deficit(25.0, 65.0);
        assert!((vpd - 1.108).abs() < 0.01, "Expected ~1.108 kPa, got {vpd}");
    }

    #[test]
    fn dew_point_20c_50rh() {
        let dp = dew_point(20.0, 50.0).unwrap();
        assert!((dp - 9.3).abs() < 0.2, "Expected ~9.3°C, got {dp}");
    }

    #[test]
    fn dew_point_equals_temp_at_saturation() {
        let dp = dew_point(18.0, 100.0).unwrap();
        assert!((dp - 18.0).abs() < 1e-9);
    }

    #[test]
    fn dew_point_rejects_dry_air() {
        assert!(dew_point(20.0, 0.0).is_none());
    }

    #[test]
    fn slope_of_line() {
        let slope = linear_slope(&[1.0, 3.0, 5.0, 7.0]).unwrap();
        assert!((slope - 2.0).abs() < 1e-9);
    }

    #[test]
    fn slope_of_flat_series() {
        assert_eq!(linear_slope(&[4.0, 4.0, 4.0]), Some(0.0));
        assert_eq!(linear_slope(&[4.0]), None);
    }
}
