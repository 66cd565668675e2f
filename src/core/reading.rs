use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

use super::{Field, Reading};

/// Alternate column names some data sources emit.
const FIELD_ALIASES: &[(&str, Field)] = &[
    ("Temp", Field::Temperature),
    ("Humid", Field::Humidity),
    ("CO2", Field::Co2),
    ("EC", Field::Ec),
    ("pH", Field::Ph),
    ("battery", Field::BatteryLevel),
];

const NAIVE_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("sensor_data must be an object or an array of objects")]
    InvalidShape,
    #[error("sensor_data array cannot be empty")]
    Empty,
    #[error("sensor_data[{0}] must be an object")]
    NotAnObject(usize),
}

impl Reading {
    pub fn new(sensor_id: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            sensor_id: sensor_id.into(),
            timestamp,
            temperature: None,
            humidity: None,
            co2: None,
            ec: None,
            ph: None,
            voltage: None,
            battery_level: None,
            dew_point: None,
            vpd: None,
        }
    }

    #[cfg(test)]
    pub fn with(mut self, field: Field, value: f64) -> Self {
        *self.slot(field) = Some(value);
        self
    }

    fn slot(&mut self, field: Field) -> &mut Option<f64> {
        match field {
            Field::Temperature => &mut self.temperature,
            Field::Humidity => &mut self.humidity,
            Field::Co2 => &mut self.co2,
            Field::Ec => &mut self.ec,
            Field::Ph => &mut self.ph,
            Field::Voltage => &mut self.voltage,
            Field::BatteryLevel => &mut self.battery_level,
            Field::DewPoint => &mut self.dew_point,
            Field::Vpd => &mut self.vpd,
        }
    }

    fn raw(&self, field: Field) -> Option<f64> {
        match field {
            Field::Temperature => self.temperature,
            Field::Humidity => self.humidity,
            Field::Co2 => self.co2,
            Field::Ec => self.ec,
            Field::Ph => self.ph,
            Field::Voltage => self.voltage,
            Field::BatteryLevel => self.battery_level,
            Field::DewPoint => self.dew_point,
            Field::Vpd => self.vpd,
        }
    }

    /// Value of `field` if present and finite.
    pub fn get(&self, field: Field) -> Option<f64> {
        self.raw(field).filter(|v| v.is_finite())
    }

    /// Safe numeric fetch: `(value, true)` when present, `(default, false)` otherwise.
    pub fn fetch(&self, field: Field, default: f64) -> (f64, bool) {
        match self.get(field) {
            Some(v) => (v, true),
            None => (default, false),
        }
    }

    /// Safe fetch that discards the presence flag.
    pub fn value_or(&self, field: Field, default: f64) -> f64 {
        self.fetch(field, default).0
    }
}

/// Parse the ingestion payload: a single object or an array of objects.
pub fn parse_readings(
    payload: &Value,
    default_sensor_id: &str,
    now: DateTime<Utc>,
) -> Result<Vec<Reading>, IngestError> {
    match payload {
        Value::Object(obj) => Ok(vec![parse_reading(obj, default_sensor_id, now)]),
        Value::Array(items) => {
            if items.is_empty() {
                return Err(IngestError::Empty);
            }
            items
                .iter()
                .enumerate()
                .map(|(i, item)| match item {
                    Value::Object(obj) => Ok(parse_reading(obj, default_sensor_id, now)),
                    _ => Err(IngestError::NotAnObject(i)),
                })
                .collect()
        }
        _ => Err(IngestError::InvalidShape),
    }
}

/// Build a reading from one JSON object. Never fails: unusable values become absent.
pub fn parse_reading(obj: &Map<String, Value>, default_sensor_id: &str, now: DateTime<Utc>) -> Reading {
    let sensor_id = match obj.get("sensor_id") {
        Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        _ => default_sensor_id.to_string(),
    };
    let timestamp = obj.get("timestamp").and_then(parse_timestamp).unwrap_or(now);

    let mut reading = Reading::new(sensor_id, timestamp);
    for field in Field::ALL {
        let value = obj.get(field.name()).or_else(|| {
            FIELD_ALIASES
                .iter()
                .find(|(_, f)| *f == field)
                .and_then(|(alias, _)| obj.get(*alias))
        });
        let Some(value) = value else { continue };
        match coerce_number(value) {
            Some(v) => *reading.slot(field) = Some(v),
            None => debug!(sensor_id = %reading.sensor_id, "Ignoring unusable {field} value: {value}"),
        }
    }
    reading
}

fn coerce_number(value: &Value) -> Option<f64> {
    let v = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    v.is_finite().then_some(v)
}

fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => {
            let s = s.trim();
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.with_timezone(&Utc));
            }
            NAIVE_FORMATS
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
                .map(|naive| Utc.from_utc_datetime(&naive))
        }
        Value::Number(n) => {
            let secs = n.as_f64()?;
            if !secs.is_finite() {
                return None;
            }
            DateTime::from_timestamp(secs.trunc() as i64, (secs.fract() * 1e9) as u32)
        }
        _ => None,
    }
}
