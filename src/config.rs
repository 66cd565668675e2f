use serde::Deserialize;
use std::path::Path;

use crate::cache;
use crate::core::history;
use crate::signals::rules::RuleThresholds;
use crate::signals::score::CombinerConfig;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub detection: DetectionConfig,
    pub classifier: ClassifierConfig,
    pub rules: RuleThresholds,
    pub combiner: CombinerConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DetectionConfig {
    pub cache_ttl_seconds: u64,
    pub cache_max_size: usize,
    pub max_concurrency: usize,
    pub classifier_timeout_seconds: u64,
    pub history_capacity: usize,
    pub default_model: String,
    pub default_sensor_id: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Model server base URL. Without one the service runs rule-only.
    pub endpoint: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub expected_features: usize,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            cache_ttl_seconds: cache::DEFAULT_TTL.as_secs(),
            cache_max_size: cache::DEFAULT_MAX_SIZE,
            max_concurrency: 4,
            classifier_timeout_seconds: 30,
            history_capacity: history::DEFAULT_CAPACITY,
            default_model: "gradient_boosting".into(),
            default_sensor_id: "GH001".into(),
        }
    }
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            user: None,
            password: None,
            expected_features: crate::classifier::EXPECTED_FEATURES,
        }
    }
}

impl Config {
    /// Load config from a TOML file. Falls back to defaults if file doesn't exist.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!("Config file {} not found, using defaults", path.display());
            return Self::default();
        }
        match std::fs::read_to_string(path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => {
                    tracing::info!("Config loaded from {}", path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!("Failed to parse {}: {e}, using defaults", path.display());
                    Self::default()
                }
            },
            Err(e) => {
                tracing::warn!("Failed to read {}: {e}, using defaults", path.display());
                Self::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            [detection]
            max_concurrency = 8

            [rules]
            vpd_min = 0.25
            temp_range = [10.0, 40.0]

            [combiner]
            rule_weight = 0.6
            ml_weight = 0.4
            "#,
        )
        .unwrap();
        assert_eq!(config.detection.max_concurrency, 8);
        assert_eq!(config.detection.cache_ttl_seconds, 300);
        assert_eq!(config.detection.default_model, "gradient_boosting");
        assert_eq!(config.rules.vpd_min, 0.25);
        assert_eq!(config.rules.temp_range, (10.0, 40.0));
        assert_eq!(config.rules.battery_critical, 12.0);
        assert_eq!(config.combiner.ml_weight, 0.4);
        assert_eq!(config.combiner.recommendation_limit, 5);
        assert!(config.classifier.endpoint.is_none());
        assert_eq!(config.classifier.expected_features, 14);
    }

    #[test]
    fn missing_file_uses_defaults() {
        let config = Config::load("/nonexistent/greensentry.toml");
        assert_eq!(config.detection.history_capacity, 100);
        assert_eq!(config.detection.default_sensor_id, "GH001");
    }
}
