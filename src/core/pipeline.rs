use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use super::history::{HistorySnapshot, HistoryStore};
use super::{AlertLevel, ClassifierResult, DetectionVerdict, MlStatus, Reading};
use crate::cache::{fingerprint, CacheStats, PredictionCache};
use crate::classifier::{classify, Classifier, ClassifierError};
use crate::config::{Config, DetectionConfig};
use crate::signals::score::{combine, CombinerConfig};
use crate::signals::{panic_message, RuleEngine};

/// Smoothing factor for the average response time.
const EMA_ALPHA: f64 = 0.1;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMethod {
    #[default]
    Hybrid,
    RuleBased,
    MlBased,
}

#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub method: DetectionMethod,
    pub model: String,
    pub use_cache: bool,
    pub max_concurrency: usize,
    /// Applies to each classifier call, not to rule evaluation.
    pub timeout: Duration,
}

impl BatchOptions {
    pub fn from_config(config: &DetectionConfig) -> Self {
        Self {
            method: DetectionMethod::Hybrid,
            model: config.default_model.clone(),
            use_cache: true,
            max_concurrency: config.max_concurrency,
            timeout: Duration::from_secs(config.classifier_timeout_seconds),
        }
    }
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self::from_config(&DetectionConfig::default())
    }
}

/// Result for one reading of a batch.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UnitOutcome {
    Detected {
        sensor_id: String,
        timestamp: DateTime<Utc>,
        cached: bool,
        #[serde(flatten)]
        verdict: DetectionVerdict,
    },
    Failed {
        sensor_id: Option<String>,
        error: String,
    },
}

impl UnitOutcome {
    pub fn verdict(&self) -> Option<&DetectionVerdict> {
        match self {
            UnitOutcome::Detected { verdict, .. } => Some(verdict),
            UnitOutcome::Failed { .. } => None,
        }
    }
}

#[derive(Debug, Default)]
struct Metrics {
    prediction_count: u64,
    error_count: u64,
    average_response_time: Option<f64>,
}

impl Metrics {
    fn record_batch(&mut self, succeeded: u64, failed: u64, elapsed: Duration) {
        self.prediction_count += succeeded;
        self.error_count += failed;
        let secs = elapsed.as_secs_f64();
        self.average_response_time = Some(match self.average_response_time {
            Some(avg) => EMA_ALPHA * secs + (1.0 - EMA_ALPHA) * avg,
            None => secs,
        });
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub service_status: &'static str,
    pub models_loaded: bool,
    pub classifier: String,
    pub default_model: String,
    pub uptime_hours: f64,
    pub prediction_count: u64,
    pub error_count: u64,
    pub error_rate: f64,
    pub success_rate: f64,
    pub average_response_time: f64,
    pub cache: CacheStats,
    pub tracked_streams: usize,
    pub expected_features: usize,
    pub timestamp: DateTime<Utc>,
}

/// Owns everything detection needs: rules, classifier, cache, history, metrics.
pub struct DetectionService {
    engine: RuleEngine,
    classifier: Arc<dyn Classifier>,
    cache: PredictionCache,
    history: HistoryStore,
    combiner: CombinerConfig,
    defaults: BatchOptions,
    default_sensor_id: String,
    metrics: Mutex<Metrics>,
    started: Instant,
}

impl DetectionService {
    pub fn new(config: &Config, classifier: Arc<dyn Classifier>) -> Self {
        let detection = &config.detection;
        Self {
            engine: RuleEngine::new(config.rules.clone()),
            classifier,
            cache: PredictionCache::new(
                Duration::from_secs(detection.cache_ttl_seconds),
                detection.cache_max_size,
            ),
            history: HistoryStore::new(detection.history_capacity),
            combiner: config.combiner.clone(),
            defaults: BatchOptions::from_config(detection),
            default_sensor_id: detection.default_sensor_id.clone(),
            metrics: Mutex::new(Metrics::default()),
            started: Instant::now(),
        }
    }

    pub fn default_options(&self) -> &BatchOptions {
        &self.defaults
    }

    pub fn default_sensor_id(&self) -> &str {
        &self.default_sensor_id
    }

    pub fn cache(&self) -> &PredictionCache {
        &self.cache
    }

    #[cfg(test)]
    pub fn history(&self) -> &HistoryStore {
        &self.history
    }

    /// Detect anomalies for every reading. Outcomes come back in input order.
    ///
    /// Readings join their stream's history in input order before any unit
    /// runs, so later readings of a stream see earlier ones as `previous`.
    pub async fn detect_batch(
        self: &Arc<Self>,
        readings: Vec<Reading>,
        options: &BatchOptions,
    ) -> Vec<UnitOutcome> {
        let start = Instant::now();
        let total = readings.len();
        let semaphore = Arc::new(Semaphore::new(options.max_concurrency.max(1)));

        let mut handles = Vec::with_capacity(total);
        for reading in readings {
            let reading = Arc::new(reading);
            let snapshot = self.history.record(Arc::clone(&reading));
            let sensor_id = reading.sensor_id.clone();

            let service = Arc::clone(self);
            let semaphore = Arc::clone(&semaphore);
            let options = options.clone();
            let handle = tokio::spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(e) => {
                        return UnitOutcome::Failed {
                            sensor_id: Some(reading.sensor_id.clone()),
                            error: e.to_string(),
                        };
                    }
                };
                service.detect_unit(reading, snapshot, &options).await
            });
            handles.push((sensor_id, handle));
        }

        let mut outcomes = Vec::with_capacity(total);
        for (sensor_id, handle) in handles {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    let reason = if e.is_panic() {
                        panic_message(e.into_panic().as_ref())
                    } else {
                        e.to_string()
                    };
                    error!(sensor_id = %sensor_id, "Detection unit failed: {reason}");
                    UnitOutcome::Failed {
                        sensor_id: Some(sensor_id),
                        error: format!("detection failed: {reason}"),
                    }
                }
            };
            outcomes.push(outcome);
        }

        let failed = outcomes
            .iter()
            .filter(|o| matches!(o, UnitOutcome::Failed { .. }))
            .count();
        let elapsed = start.elapsed();
        self.metrics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record_batch((total - failed) as u64, failed as u64, elapsed);

        info!(
            "Batch of {total} processed in {:.3}s ({failed} failed)",
            elapsed.as_secs_f64()
        );
        outcomes
    }

    async fn detect_unit(
        &self,
        reading: Arc<Reading>,
        snapshot: HistorySnapshot,
        options: &BatchOptions,
    ) -> UnitOutcome {
        let key = (options.use_cache && options.method == DetectionMethod::Hybrid)
            .then(|| fingerprint(&reading, &options.model));

        if let Some(key) = &key {
            if let Some(verdict) = self.cache.get(key) {
                debug!(sensor_id = %reading.sensor_id, key = %key, "Cache hit");
                return UnitOutcome::Detected {
                    sensor_id: reading.sensor_id.clone(),
                    timestamp: reading.timestamp,
                    cached: true,
                    verdict: verdict.as_ref().clone(),
                };
            }
        }

        let rules = match options.method {
            DetectionMethod::MlBased => Vec::new(),
            _ => self.engine.evaluate(
                &reading,
                snapshot.previous.as_deref(),
                &snapshot.prior,
            ),
        };
        let (ml_results, ml_status) = match options.method {
            DetectionMethod::RuleBased => (Vec::new(), MlStatus::Skipped),
            _ => self.run_classifier(&reading, options).await,
        };

        // A loaded model that failed this time should be retried next time
        let transient_failure =
            matches!(ml_status, MlStatus::Unavailable { .. }) && self.classifier.is_loaded();

        let recent = snapshot.recent_with(&reading);
        let verdict = combine(rules, ml_results, ml_status, &recent, &self.combiner);
        if verdict.alert_level > AlertLevel::Green {
            debug!(
                sensor_id = %reading.sensor_id,
                "{} {} (health {})",
                verdict.alert_level.emoji(),
                verdict.alert_level.as_str(),
                verdict.health_score
            );
        }

        if let Some(key) = key {
            if !transient_failure {
                self.cache.put(key, Arc::new(verdict.clone()));
            }
        }

        UnitOutcome::Detected {
            sensor_id: reading.sensor_id.clone(),
            timestamp: reading.timestamp,
            cached: false,
            verdict,
        }
    }

    async fn run_classifier(
        &self,
        reading: &Arc<Reading>,
        options: &BatchOptions,
    ) -> (Vec<ClassifierResult>, MlStatus) {
        // Own task, so a panicking classifier costs the ML half only
        let classifier = Arc::clone(&self.classifier);
        let unit = Arc::clone(reading);
        let model = options.model.clone();
        let mut call = tokio::spawn(async move {
            classify(classifier.as_ref(), std::slice::from_ref(&unit), &model).await
        });
        let joined = tokio::time::timeout(options.timeout, &mut call).await;
        let result = match joined {
            Ok(Ok(result)) => result,
            Ok(Err(e)) if e.is_panic() => {
                Err(ClassifierError::Panicked(panic_message(e.into_panic().as_ref())))
            }
            Ok(Err(e)) => Err(ClassifierError::Unavailable(e.to_string())),
            Err(_) => {
                call.abort();
                Err(ClassifierError::Timeout(options.timeout))
            }
        };

        match result {
            Ok(results) => (
                results,
                MlStatus::Used {
                    model: options.model.clone(),
                },
            ),
            Err(e) => {
                if self.classifier.is_loaded() {
                    warn!(sensor_id = %reading.sensor_id, "Classifier failed, using rules only: {e}");
                    self.metrics
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .error_count += 1;
                } else {
                    debug!(sensor_id = %reading.sensor_id, "No model loaded, using rules only");
                }
                (Vec::new(), MlStatus::Unavailable { reason: e.to_string() })
            }
        }
    }

    pub fn health(&self) -> HealthReport {
        let (prediction_count, error_count, avg) = {
            let m = self.metrics.lock().unwrap_or_else(PoisonError::into_inner);
            (m.prediction_count, m.error_count, m.average_response_time)
        };
        let error_rate = if prediction_count > 0 {
            (error_count as f64 / prediction_count as f64).min(1.0)
        } else {
            0.0
        };
        let models_loaded = self.classifier.is_loaded();

        HealthReport {
            service_status: if models_loaded { "active" } else { "degraded" },
            models_loaded,
            classifier: self.classifier.name().to_string(),
            default_model: self.defaults.model.clone(),
            uptime_hours: self.started.elapsed().as_secs_f64() / 3600.0,
            prediction_count,
            error_count,
            error_rate,
            success_rate: 1.0 - error_rate,
            average_response_time: avg.unwrap_or(0.0),
            cache: self.cache.stats(),
            tracked_streams: self.history.stream_count(),
            expected_features: self.classifier.expected_features(),
            timestamp: Utc::now(),
        }
    }
}
