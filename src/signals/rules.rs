use std::sync::Arc;

use serde::Deserialize;
use thiserror::Error;

use super::physics;
use crate::core::{AlertLevel, AnomalyKind, Field, Reading, RuleResult};

/// Values that sensors emit when they have failed rather than measured.
const SENTINEL_VALUES: &[f64] = &[0.0, -999.0, 9999.0, -1.0];

/// Fields whose legitimate readings always jitter; an exact repeat means a stuck sensor.
const STUCK_FIELDS: &[Field] = &[Field::Temperature, Field::Humidity, Field::Voltage, Field::Co2];

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("non-finite {0} computed")]
    NonFinite(&'static str),
    #[error("rule panicked: {0}")]
    Panicked(String),
}

/// Every rule threshold, overridable from the `[rules]` config section.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct RuleThresholds {
    pub drop_temp_abs: f64,
    pub drop_temp_rel: f64,
    pub drop_voltage_abs: f64,
    pub drop_voltage_rel: f64,
    pub critical_voltage: f64,

    pub spike_temp_abs: f64,
    pub spike_temp_rel: f64,
    pub spike_voltage_abs: f64,
    pub spike_voltage_rel: f64,
    pub spike_temp_ceiling: f64,
    pub co2_critical: f64,

    pub vpd_min: f64,

    pub voltage_warning: f64,
    pub voltage_low: f64,
    pub battery_low: f64,

    pub dew_point_spread: f64,
    pub dew_humidity: f64,
    pub dew_temp_below: f64,

    pub battery_critical: f64,
    pub voltage_depleted: f64,
    pub battery_drop: f64,

    pub temperature_bounds: (f64, f64),
    pub humidity_bounds: (f64, f64),
    pub voltage_bounds: (f64, f64),
    pub failed_fields_min: usize,
    pub stuck_entries: usize,

    pub fluctuation_temp: f64,
    pub fluctuation_humidity: f64,
    pub fluctuation_voltage: f64,
    pub fluctuation_co2: f64,
    pub fluctuation_fields_min: usize,

    pub stress_humidity_high: f64,
    pub stress_humidity_low: f64,
    pub stress_cold: f64,
    pub stress_hot: f64,
    pub stress_vpd_low: f64,
    pub stress_vpd_high: f64,
    pub co2_warning: f64,
    pub temp_range: (f64, f64),
    pub stress_factors_min: usize,

    pub drift_min_history: usize,
    pub drift_window: usize,
    pub drift_temp: f64,
    pub drift_ec: f64,
    pub drift_ph: f64,
}

impl Default for RuleThresholds {
    fn default() -> Self {
        Self {
            drop_temp_abs: 10.0,
            drop_temp_rel: 0.25,
            drop_voltage_abs: 0.5,
            drop_voltage_rel: 0.20,
            critical_voltage: 2.7,

            spike_temp_abs: 10.0,
            spike_temp_rel: 0.25,
            spike_voltage_abs: 0.5,
            spike_voltage_rel: 0.20,
            spike_temp_ceiling: 45.0,
            co2_critical: 2000.0,

            vpd_min: 0.3,

            voltage_warning: 2.9,
            voltage_low: 3.0,
            battery_low: 30.0,

            dew_point_spread: 1.2,
            dew_humidity: 95.0,
            dew_temp_below: 25.0,

            battery_critical: 12.0,
            voltage_depleted: 2.3,
            battery_drop: 20.0,

            temperature_bounds: (-40.0, 80.0),
            humidity_bounds: (0.0, 100.0),
            voltage_bounds: (0.0, 6.0),
            failed_fields_min: 2,
            stuck_entries: 5,

            fluctuation_temp: 0.15,
            fluctuation_humidity: 0.20,
            fluctuation_voltage: 0.25,
            fluctuation_co2: 0.30,
            fluctuation_fields_min: 2,

            stress_humidity_high: 90.0,
            stress_humidity_low: 20.0,
            stress_cold: 15.0,
            stress_hot: 32.0,
            stress_vpd_low: 0.4,
            stress_vpd_high: 1.6,
            co2_warning: 1500.0,
            temp_range: (8.0, 42.0),
            stress_factors_min: 2,

            drift_min_history: 8,
            drift_window: 10,
            drift_temp: 0.5,
            drift_ec: 0.05,
            drift_ph: 0.1,
        }
    }
}

/// Everything a rule may look at.
#[derive(Debug, Clone, Copy)]
pub struct RuleInput<'a> {
    pub current: &'a Reading,
    pub previous: Option<&'a Reading>,
    /// Stream history before `current`, oldest first.
    pub history: &'a [Arc<Reading>],
    pub thresholds: &'a RuleThresholds,
}

/// Fixed metadata of one registered rule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RuleSpec {
    pub kind: AnomalyKind,
    pub alert_level: AlertLevel,
    pub priority: u8,
    pub confidence: f64,
    pub message: &'static str,
}

/// The rule registry in evaluation order.
pub static REGISTRY: [RuleSpec; 10] = [
    RuleSpec {
        kind: AnomalyKind::SuddenDrop,
        alert_level: AlertLevel::Red,
        priority: 3,
        confidence: 0.90,
        message: "Abnormal sensor behavior detected. Value dropped faster than expected.",
    },
    RuleSpec {
        kind: AnomalyKind::SuddenSpike,
        alert_level: AlertLevel::Yellow,
        priority: 2,
        confidence: 0.85,
        message: "Abnormally high sensor reading. Please check.",
    },
    RuleSpec {
        kind: AnomalyKind::VpdTooLow,
        alert_level: AlertLevel::Red,
        priority: 3,
        confidence: 0.95,
        message: "VPD too low! Risk of plant disease. Check ventilation system.",
    },
    RuleSpec {
        kind: AnomalyKind::LowVoltage,
        alert_level: AlertLevel::Red,
        priority: 2,
        confidence: 0.90,
        message: "Voltage instability alert. Please check electrical system.",
    },
    RuleSpec {
        kind: AnomalyKind::DewPointClose,
        alert_level: AlertLevel::Red,
        priority: 3,
        confidence: 0.90,
        message: "Dew point close to actual temperature. Risk of mold.",
    },
    RuleSpec {
        kind: AnomalyKind::BatteryDepleted,
        alert_level: AlertLevel::Red,
        priority: 3,
        confidence: 0.95,
        message: "Sensor battery depleted. Please replace or recharge.",
    },
    RuleSpec {
        kind: AnomalyKind::SensorFailure,
        alert_level: AlertLevel::Red,
        priority: 3,
        confidence: 0.92,
        message: "Sensor failure suspected. Values are stuck or outside physical range.",
    },
    RuleSpec {
        kind: AnomalyKind::HighFluctuation,
        alert_level: AlertLevel::Yellow,
        priority: 2,
        confidence: 0.80,
        message: "Several sensor values are fluctuating abnormally.",
    },
    RuleSpec {
        kind: AnomalyKind::EnvironmentalStress,
        alert_level: AlertLevel::Yellow,
        priority: 2,
        confidence: 0.85,
        message: "Multiple environmental stress factors detected.",
    },
    RuleSpec {
        kind: AnomalyKind::GradualDrift,
        alert_level: AlertLevel::Yellow,
        priority: 1,
        confidence: 0.75,
        message: "Sensor readings are drifting steadily. Calibration may be required.",
    },
];

impl RuleSpec {
    pub fn evaluate(&self, input: &RuleInput<'_>) -> Result<bool, RuleError> {
        match self.kind {
            AnomalyKind::SuddenDrop => sudden_drop(input),
            AnomalyKind::SuddenSpike => sudden_spike(input),
            AnomalyKind::VpdTooLow => vpd_too_low(input),
            AnomalyKind::LowVoltage => low_voltage(input),
            AnomalyKind::DewPointClose => dew_point_close(input),
            AnomalyKind::BatteryDepleted => battery_depleted(input),
            AnomalyKind::SensorFailure => sensor_failure(input),
            AnomalyKind::HighFluctuation => high_fluctuation(input),
            AnomalyKind::EnvironmentalStress => environmental_stress(input),
            AnomalyKind::GradualDrift => gradual_drift(input),
        }
    }

    pub fn result_for(&self, reading: Arc<Reading>) -> RuleResult {
        RuleResult {
            kind: self.kind,
            alert_level: self.alert_level,
            priority: self.priority,
            message: self.message,
            confidence: self.confidence,
            reading,
        }
    }
}

#[cfg(test)]
pub fn spec_for(kind: AnomalyKind) -> &'static RuleSpec {
    let index = match kind {
        AnomalyKind::SuddenDrop => 0,
        AnomalyKind::SuddenSpike => 1,
        AnomalyKind::VpdTooLow => 2,
        AnomalyKind::LowVoltage => 3,
        AnomalyKind::DewPointClose => 4,
        AnomalyKind::BatteryDepleted => 5,
        AnomalyKind::SensorFailure => 6,
        AnomalyKind::HighFluctuation => 7,
        AnomalyKind::EnvironmentalStress => 8,
        AnomalyKind::GradualDrift => 9,
    };
    &REGISTRY[index]
}

fn finite(name: &'static str, value: f64) -> Result<f64, RuleError> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(RuleError::NonFinite(name))
    }
}

/// Relative change from `before` to `now`, `None` when `before` is zero.
fn relative_change(before: f64, now: f64) -> Option<f64> {
    (before != 0.0).then(|| (now - before) / before.abs())
}

fn fell(before: f64, now: f64, abs: f64, rel: f64) -> bool {
    before - now > abs || relative_change(before, now).is_some_and(|c| -c > rel)
}

fn rose(before: f64, now: f64, abs: f64, rel: f64) -> bool {
    now - before > abs || relative_change(before, now).is_some_and(|c| c > rel)
}

/// VPD from the sensor if reported, otherwise computed from temperature/humidity.
fn effective_vpd(current: &Reading) -> Result<Option<f64>, RuleError> {
    if let Some(vpd) = current.get(Field::Vpd) {
        return Ok(Some(vpd));
    }
    match (current.get(Field::Temperature), current.get(Field::Humidity)) {
        (Some(t), Some(h)) => finite("vpd", physics::vapor_pressure_deficit(t, h)).map(Some),
        _ => Ok(None),
    }
}

// --- Individual Rules ---

fn sudden_drop(input: &RuleInput<'_>) -> Result<bool, RuleError> {
    let Some(prev) = input.previous else {
        return Ok(false);
    };
    let t = input.thresholds;
    let cur = input.current;

    if let (Some(before), Some(now)) = (prev.get(Field::Temperature), cur.get(Field::Temperature)) {
        if fell(before, now, t.drop_temp_abs, t.drop_temp_rel) {
            return Ok(true);
        }
    }
    if let Some(now) = cur.get(Field::Voltage) {
        if now < t.critical_voltage {
            return Ok(true);
        }
        if let Some(before) = prev.get(Field::Voltage) {
            return Ok(fell(before, now, t.drop_voltage_abs, t.drop_voltage_rel));
        }
    }
    Ok(false)
}

fn sudden_spike(input: &RuleInput<'_>) -> Result<bool, RuleError> {
    let Some(prev) = input.previous else {
        return Ok(false);
    };
    let t = input.thresholds;
    let cur = input.current;

    if let Some(now) = cur.get(Field::Temperature) {
        if now > t.spike_temp_ceiling {
            return Ok(true);
        }
        if let Some(before) = prev.get(Field::Temperature) {
            if rose(before, now, t.spike_temp_abs, t.spike_temp_rel) {
                return Ok(true);
            }
        }
    }
    if cur.get(Field::Co2).is_some_and(|co2| co2 > t.co2_critical) {
        return Ok(true);
    }
    if let (Some(before), Some(now)) = (prev.get(Field::Voltage), cur.get(Field::Voltage)) {
        return Ok(rose(before, now, t.spike_voltage_abs, t.spike_voltage_rel));
    }
    Ok(false)
}

fn vpd_too_low(input: &RuleInput<'_>) -> Result<bool, RuleError> {
    let min = input.thresholds.vpd_min;
    let cur = input.current;
    if cur.get(Field::Vpd).is_some_and(|vpd| vpd < min) {
        return Ok(true);
    }
    match (cur.get(Field::Temperature), cur.get(Field::Humidity)) {
        (Some(t), Some(h)) => Ok(finite("vpd", physics::vapor_pressure_deficit(t, h))? < min),
        _ => Ok(false),
    }
}

fn low_voltage(input: &RuleInput<'_>) -> Result<bool, RuleError> {
    let t = input.thresholds;
    let Some(voltage) = input.current.get(Field::Voltage) else {
        return Ok(false);
    };
    if voltage < t.voltage_warning {
        return Ok(true);
    }
    let battery_low = input
        .current
        .get(Field::BatteryLevel)
        .is_some_and(|b| b < t.battery_low);
    Ok(voltage < t.voltage_low && battery_low)
}

fn dew_point_close(input: &RuleInput<'_>) -> Result<bool, RuleError> {
    let t = input.thresholds;
    let cur = input.current;
    let Some(temp) = cur.get(Field::Temperature) else {
        return Ok(false);
    };
    if cur
        .get(Field::DewPoint)
        .is_some_and(|dp| temp - dp < t.dew_point_spread)
    {
        return Ok(true);
    }
    let Some(humidity) = cur.get(Field::Humidity) else {
        return Ok(false);
    };
    if humidity > t.dew_humidity && temp < t.dew_temp_below {
        return Ok(true);
    }
    match physics::dew_point(temp, humidity) {
        Some(dp) => Ok(temp - finite("dew_point", dp)? < t.dew_point_spread),
        None => Ok(false),
    }
}

fn battery_depleted(input: &RuleInput<'_>) -> Result<bool, RuleError> {
    let t = input.thresholds;
    let cur = input.current;
    if cur.get(Field::Voltage).is_some_and(|v| v < t.voltage_depleted) {
        return Ok(true);
    }
    let Some(battery) = cur.get(Field::BatteryLevel) else {
        return Ok(false);
    };
    if battery < t.battery_critical {
        return Ok(true);
    }
    let dropped = input
        .previous
        .and_then(|prev| prev.get(Field::BatteryLevel))
        .is_some_and(|before| before - battery > t.battery_drop);
    Ok(dropped)
}

fn sensor_failure(input: &RuleInput<'_>) -> Result<bool, RuleError> {
    let t = input.thresholds;
    let cur = input.current;
    let checks = [
        (Field::Temperature, t.temperature_bounds),
        (Field::Humidity, t.humidity_bounds),
        (Field::Voltage, t.voltage_bounds),
    ];
    let failed = checks
        .iter()
        .filter(|(field, (lo, hi))| {
            cur.get(*field).is_some_and(|v| {
                SENTINEL_VALUES.contains(&v) || v < *lo || v > *hi
            })
        })
        .count();
    if failed >= t.failed_fields_min {
        return Ok(true);
    }

    if t.stuck_entries == 0 || input.history.len() < t.stuck_entries {
        return Ok(false);
    }
    let tail = &input.history[input.history.len() - t.stuck_entries..];
    let stuck = STUCK_FIELDS.iter().any(|&field| {
        cur.get(field).is_some_and(|v| {
            tail.iter()
                .all(|r| r.get(field).is_some_and(|x| x.to_bits() == v.to_bits()))
        })
    });
    Ok(stuck)
}

fn high_fluctuation(input: &RuleInput<'_>) -> Result<bool, RuleError> {
    let Some(prev) = input.previous else {
        return Ok(false);
    };
    let t = input.thresholds;
    let limits = [
        (Field::Temperature, t.fluctuation_temp),
        (Field::Humidity, t.fluctuation_humidity),
        (Field::Voltage, t.fluctuation_voltage),
        (Field::Co2, t.fluctuation_co2),
    ];
    let fluctuating = limits
        .iter()
        .filter(|(field, limit)| {
            match (prev.get(*field), input.current.get(*field)) {
                (Some(before), Some(now)) => {
                    relative_change(before, now).is_some_and(|c| c.abs() > *limit)
                }
                _ => false,
            }
        })
        .count();
    Ok(fluctuating >= t.fluctuation_fields_min)
}

fn environmental_stress(input: &RuleInput<'_>) -> Result<bool, RuleError> {
    let t = input.thresholds;
    let cur = input.current;
    let temp = cur.get(Field::Temperature);
    let extreme_humidity = cur
        .get(Field::Humidity)
        .is_some_and(|h| h > t.stress_humidity_high || h < t.stress_humidity_low);

    let mut factors = 0;
    if extreme_humidity && temp.is_some_and(|v| v < t.stress_cold) {
        factors += 1;
    }
    if extreme_humidity && temp.is_some_and(|v| v > t.stress_hot) {
        factors += 1;
    }
    if effective_vpd(cur)?.is_some_and(|vpd| vpd < t.stress_vpd_low || vpd > t.stress_vpd_high) {
        factors += 1;
    }
    if cur.get(Field::Co2).is_some_and(|co2| co2 > t.co2_warning) {
        factors += 1;
    }
    if temp.is_some_and(|v| v < t.temp_range.0 || v > t.temp_range.1) {
        factors += 1;
    }
    Ok(factors >= t.stress_factors_min)
}

fn gradual_drift(input: &RuleInput<'_>) -> Result<bool, RuleError> {
    let t = input.thresholds;
    if input.history.len() < t.drift_min_history {
        return Ok(false);
    }
    let start = input.history.len().saturating_sub(t.drift_window);
    let window = &input.history[start..];

    for (field, limit) in [
        (Field::Temperature, t.drift_temp),
        (Field::Ec, t.drift_ec),
        (Field::Ph, t.drift_ph),
    ] {
        let values: Vec<f64> = window
            .iter()
            .map(Arc::as_ref)
            .chain(std::iter::once(input.current))
            .filter_map(|r| r.get(field))
            .collect();
        if values.len() < t.drift_min_history {
            continue;
        }
        if let Some(slope) = physics::linear_slope(&values) {
            if finite("slope", slope)?.abs() > limit {
                return Ok(true);
            }
        }
    }
    Ok(false)
}
