//! One-line JSON request/response protocol for cross-process callers.
//!
//! Request: `{"sensor_data": [..], "options": {"method", "model", "use_cache"}, "health_check": bool, "clear_cache": bool}`.
//! Success answers carry `"status": "success"`; failures are
//! `{"error", "status": "error", "timestamp"}`.

use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::info;

use crate::alerts::AlertMessage;
use crate::core::pipeline::{BatchOptions, DetectionMethod, DetectionService, UnitOutcome};
use crate::core::reading::{parse_readings, IngestError};
use crate::core::AlertLevel;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Invalid JSON input: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    Invalid(String),
    #[error("Failed to read input: {0}")]
    Io(#[from] std::io::Error),
    #[error("Detection failed: {0}")]
    Detection(String),
}

impl From<IngestError> for BridgeError {
    fn from(e: IngestError) -> Self {
        BridgeError::Invalid(e.to_string())
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RequestOptions {
    pub method: Option<DetectionMethod>,
    pub model: Option<String>,
    pub use_cache: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub sensor_data: Option<Value>,
    #[serde(default)]
    pub options: RequestOptions,
    #[serde(default)]
    pub health_check: bool,
    #[serde(default)]
    pub clear_cache: bool,
}

impl RequestOptions {
    fn apply(&self, defaults: &BatchOptions) -> BatchOptions {
        let mut options = defaults.clone();
        if let Some(method) = self.method {
            options.method = method;
        }
        if let Some(model) = &self.model {
            options.model = model.clone();
        }
        if let Some(use_cache) = self.use_cache {
            options.use_cache = use_cache;
        }
        options
    }
}

/// Parse one request line and produce the success response.
pub async fn handle(service: &Arc<DetectionService>, line: &str) -> Result<Value, BridgeError> {
    let line = line.trim();
    if line.is_empty() {
        return Err(BridgeError::Invalid("No input data received".into()));
    }
    let value: Value = serde_json::from_str(line)?;
    if !value.is_object() {
        return Err(BridgeError::Invalid("Input must be a JSON object".into()));
    }
    let request: Request =
        serde_json::from_value(value).map_err(|e| BridgeError::Invalid(e.to_string()))?;

    if request.health_check {
        return health_response(service);
    }
    if request.clear_cache {
        service.cache().clear();
        info!("Prediction cache cleared");
        return Ok(json!({
            "status": "success",
            "cache_cleared": true,
            "timestamp": Utc::now().to_rfc3339(),
        }));
    }

    let sensor_data = request
        .sensor_data
        .ok_or_else(|| BridgeError::Invalid("Missing required field: sensor_data".into()))?;
    if !sensor_data.is_array() {
        return Err(BridgeError::Invalid("sensor_data must be an array".into()));
    }
    let now = Utc::now();
    let readings = parse_readings(&sensor_data, service.default_sensor_id(), now)?;
    let options = request.options.apply(service.default_options());

    info!(
        "Processing request: method={:?}, model={}, data_points={}",
        options.method,
        options.model,
        readings.len()
    );
    let outcomes = service.detect_batch(readings, &options).await;

    if outcomes.len() == 1 {
        single_response(outcomes.into_iter().next())
    } else {
        batch_response(&outcomes)
    }
}

/// Error object sent to the error stream.
pub fn error_response(err: &BridgeError) -> Value {
    json!({
        "error": err.to_string(),
        "status": "error",
        "timestamp": Utc::now().to_rfc3339(),
    })
}

fn health_response(service: &DetectionService) -> Result<Value, BridgeError> {
    let health = service.health();
    let mut response = Map::new();
    response.insert("health_check".into(), Value::Bool(true));
    response.insert("status".into(), json!(health.service_status));
    response.insert("models_loaded".into(), json!(health.models_loaded));
    response.insert("uptime_hours".into(), json!(health.uptime_hours));
    response.insert("details".into(), serde_json::to_value(&health)?);
    Ok(Value::Object(response))
}

fn single_response(outcome: Option<UnitOutcome>) -> Result<Value, BridgeError> {
    match outcome {
        Some(UnitOutcome::Detected {
            sensor_id,
            timestamp,
            cached,
            verdict,
        }) => {
            let alert = AlertMessage::from_verdict(&verdict, timestamp);
            let mut response = match serde_json::to_value(&verdict)? {
                Value::Object(map) => map,
                _ => Map::new(),
            };
            response.insert("status".into(), json!("success"));
            response.insert("sensor_id".into(), json!(sensor_id));
            response.insert("timestamp".into(), json!(timestamp));
            response.insert("cached".into(), json!(cached));
            response.insert("alert".into(), serde_json::to_value(&alert)?);
            Ok(Value::Object(response))
        }
        Some(UnitOutcome::Failed { error, .. }) => Err(BridgeError::Detection(error)),
        None => Err(BridgeError::Detection("no result produced".into())),
    }
}

fn batch_response(outcomes: &[UnitOutcome]) -> Result<Value, BridgeError> {
    let verdicts: Vec<_> = outcomes.iter().filter_map(UnitOutcome::verdict).collect();

    let alert_level = verdicts
        .iter()
        .map(|v| v.alert_level)
        .max()
        .unwrap_or(AlertLevel::Green);
    let health_score = if verdicts.is_empty() {
        100.0
    } else {
        let mean = verdicts.iter().map(|v| f64::from(v.health_score)).sum::<f64>()
            / verdicts.len() as f64;
        (mean * 100.0).round() / 100.0
    };
    let total_anomalies: usize = verdicts.iter().map(|v| v.total_anomalies).sum();

    Ok(json!({
        "status": "success",
        "units": serde_json::to_value(outcomes)?,
        "summary": {
            "alert_level": alert_level,
            "health_score": health_score,
            "total_anomalies": total_anomalies,
            "data_points_processed": outcomes.len(),
            "failed_units": outcomes.len() - verdicts.len(),
        },
        "timestamp": Utc::now().to_rfc3339(),
    }))
}
