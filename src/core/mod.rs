pub mod history;
pub mod pipeline;
pub mod reading;

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Numeric telemetry fields a reading may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Temperature,
    Humidity,
    Co2,
    Ec,
    Ph,
    Voltage,
    BatteryLevel,
    DewPoint,
    Vpd,
}

impl Field {
    pub const ALL: [Field; 9] = [
        Field::Temperature,
        Field::Humidity,
        Field::Co2,
        Field::Ec,
        Field::Ph,
        Field::Voltage,
        Field::BatteryLevel,
        Field::DewPoint,
        Field::Vpd,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Field::Temperature => "temperature",
            Field::Humidity => "humidity",
            Field::Co2 => "co2",
            Field::Ec => "ec",
            Field::Ph => "ph",
            Field::Voltage => "voltage",
            Field::BatteryLevel => "battery_level",
            Field::DewPoint => "dew_point",
            Field::Vpd => "vpd",
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One sensor sample. Absent fields stay `None` until the signal reader
/// substitutes a default for a specific consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub sensor_id: String,
    pub timestamp: DateTime<Utc>,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub co2: Option<f64>,
    pub ec: Option<f64>,
    pub ph: Option<f64>,
    pub voltage: Option<f64>,
    pub battery_level: Option<f64>,
    pub dew_point: Option<f64>,
    pub vpd: Option<f64>,
}

/// Severity attached to a rule hit and to the combined verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Green,
    Yellow,
    Red,
}

impl AlertLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertLevel::Green => "green",
            AlertLevel::Yellow => "yellow",
            AlertLevel::Red => "red",
        }
    }

    pub fn emoji(&self) -> &'static str {
        match self {
            AlertLevel::Red => "🔴",
            AlertLevel::Yellow => "🟡",
            AlertLevel::Green => "🟢",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn from_alert(level: AlertLevel) -> Self {
        match level {
            AlertLevel::Red => RiskLevel::High,
            AlertLevel::Yellow => RiskLevel::Medium,
            AlertLevel::Green => RiskLevel::Low,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
        }
    }
}

/// Anomaly categories the rule registry can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    SuddenDrop,
    SuddenSpike,
    VpdTooLow,
    LowVoltage,
    DewPointClose,
    BatteryDepleted,
    SensorFailure,
    HighFluctuation,
    EnvironmentalStress,
    GradualDrift,
}

impl AnomalyKind {
    pub fn name(&self) -> &'static str {
        match self {
            AnomalyKind::SuddenDrop => "sudden_drop",
            AnomalyKind::SuddenSpike => "sudden_spike",
            AnomalyKind::VpdTooLow => "vpd_too_low",
            AnomalyKind::LowVoltage => "low_voltage",
            AnomalyKind::DewPointClose => "dew_point_close",
            AnomalyKind::BatteryDepleted => "battery_depleted",
            AnomalyKind::SensorFailure => "sensor_failure",
            AnomalyKind::HighFluctuation => "high_fluctuation",
            AnomalyKind::EnvironmentalStress => "environmental_stress",
            AnomalyKind::GradualDrift => "gradual_drift",
        }
    }
}

impl fmt::Display for AnomalyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A triggered rule. Shares the triggering reading instead of copying it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleResult {
    #[serde(rename = "anomaly_type")]
    pub kind: AnomalyKind,
    pub alert_level: AlertLevel,
    pub priority: u8,
    pub message: &'static str,
    pub confidence: f64,
    #[serde(skip)]
    pub reading: Arc<Reading>,
}

/// Per-sample output of the external classifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifierResult {
    pub is_anomaly: bool,
    pub confidence: f64,
    #[serde(default)]
    pub model_name: String,
    pub feature_count: usize,
}

/// How the statistical path contributed to a verdict.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum MlStatus {
    Used { model: String },
    Unavailable { reason: String },
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecommendationPriority {
    Low,
    Medium,
    High,
}

impl RecommendationPriority {
    pub fn from_rule_priority(priority: u8) -> Self {
        match priority {
            p if p >= 3 => RecommendationPriority::High,
            2 => RecommendationPriority::Medium,
            _ => RecommendationPriority::Low,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recommendation {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub message: String,
    pub action: &'static str,
    pub priority: RecommendationPriority,
    pub estimated_time: &'static str,
    pub severity_impact: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ConfidenceScores {
    pub rule_based: f64,
    pub ml_based: f64,
    pub combined: f64,
}

/// Combined outcome for one reading.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionVerdict {
    pub alert_level: AlertLevel,
    pub risk_level: RiskLevel,
    pub priority_score: u8,
    pub health_score: u8, // 0-100
    pub confidence_scores: ConfidenceScores,
    pub total_anomalies: usize,
    pub rule_anomalies_found: bool,
    pub ml_anomalies_found: bool,
    pub detection_consensus: bool,
    pub rule_detection_types: Vec<AnomalyKind>,
    pub recommendations: Vec<Recommendation>,
    pub rule_based_detection: Vec<RuleResult>,
    pub ml_detection: Vec<ClassifierResult>,
    pub ml_status: MlStatus,
}
