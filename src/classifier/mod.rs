pub mod remote;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Datelike, Timelike};
use thiserror::Error;

use crate::core::{ClassifierResult, Field, Reading};

/// Nine base fields plus five time features.
pub const EXPECTED_FEATURES: usize = 14;

/// Substitutes for absent fields when building a feature row.
pub const FEATURE_DEFAULTS: [(Field, f64); 9] = [
    (Field::Temperature, 25.0),
    (Field::Humidity, 65.0),
    (Field::Co2, 800.0),
    (Field::Ec, 1.5),
    (Field::Ph, 6.5),
    (Field::Voltage, 3.3),
    (Field::BatteryLevel, 80.0),
    (Field::DewPoint, 15.0),
    (Field::Vpd, 1.0),
];

#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error("model unavailable: {0}")]
    Unavailable(String),
    #[error("feature mismatch: model expects {expected} features, got {actual}")]
    FeatureMismatch { expected: usize, actual: usize },
    #[error("result count mismatch: expected {expected}, got {actual}")]
    CountMismatch { expected: usize, actual: usize },
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("model server error: {0}")]
    Remote(String),
    #[error("classifier timed out after {0:?}")]
    Timeout(Duration),
    #[error("classifier panicked: {0}")]
    Panicked(String),
}

/// Black-box anomaly classifier.
#[async_trait]
pub trait Classifier: Send + Sync {
    fn name(&self) -> &str;

    fn expected_features(&self) -> usize;

    fn is_loaded(&self) -> bool;

    /// One result per feature row, in row order.
    async fn predict(
        &self,
        features: &[Vec<f64>],
        model: &str,
    ) -> Result<Vec<ClassifierResult>, ClassifierError>;
}

/// Stand-in used when no model server is configured. Every call is unavailable.
#[derive(Debug, Default)]
pub struct NoModel;

#[async_trait]
impl Classifier for NoModel {
    fn name(&self) -> &str {
        "none"
    }

    fn expected_features(&self) -> usize {
        EXPECTED_FEATURES
    }

    fn is_loaded(&self) -> bool {
        false
    }

    async fn predict(
        &self,
        _features: &[Vec<f64>],
        _model: &str,
    ) -> Result<Vec<ClassifierResult>, ClassifierError> {
        Err(ClassifierError::Unavailable("no model loaded".to_string()))
    }
}

/// Feature row for one reading: base fields (defaulted) then time features.
pub fn extract_features(reading: &Reading) -> Vec<f64> {
    let mut row: Vec<f64> = FEATURE_DEFAULTS
        .iter()
        .map(|(field, default)| reading.value_or(*field, *default))
        .collect();

    let ts = reading.timestamp;
    let hour = ts.hour();
    let weekday = ts.weekday().num_days_from_monday();
    row.push(f64::from(hour));
    row.push(f64::from(weekday));
    row.push(f64::from(ts.month()));
    row.push(if hour < 6 || hour >= 20 { 1.0 } else { 0.0 });
    row.push(if weekday >= 5 { 1.0 } else { 0.0 });
    row
}

/// Run the classifier over `readings` and check its output is well-formed.
pub async fn classify(
    classifier: &dyn Classifier,
    readings: &[Arc<Reading>],
    model: &str,
) -> Result<Vec<ClassifierResult>, ClassifierError> {
    let expected = classifier.expected_features();
    let features: Vec<Vec<f64>> = readings.iter().map(|r| extract_features(r)).collect();
    if let Some(row) = features.iter().find(|row| row.len() != expected) {
        return Err(ClassifierError::FeatureMismatch {
            expected,
            actual: row.len(),
        });
    }

    let mut results = classifier.predict(&features, model).await?;
    if results.len() != readings.len() {
        return Err(ClassifierError::CountMismatch {
            expected: readings.len(),
            actual: results.len(),
        });
    }
    for result in &mut results {
        if result.feature_count != expected {
            return Err(ClassifierError::FeatureMismatch {
                expected,
                actual: result.feature_count,
            });
        }
        if result.model_name.is_empty() {
            result.model_name = model.to_string();
        }
    }
    Ok(results)
}
