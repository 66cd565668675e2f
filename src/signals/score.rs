use std::sync::Arc;

use serde::Deserialize;

use super::advice;
use crate::core::{
    AlertLevel, AnomalyKind, ClassifierResult, ConfidenceScores, DetectionVerdict, Field,
    MlStatus, Reading, Recommendation, RiskLevel, RuleResult,
};

const STRESS_TEMP_HIGH: f64 = 40.0;
const STRESS_TEMP_LOW: f64 = 10.0;
const STRESS_HUMIDITY_HIGH: f64 = 90.0;
const STRESS_VOLTAGE_LOW: f64 = 2.8;

/// Priority reported when only the classifier flagged the reading.
const ML_ONLY_PRIORITY: u8 = 2;

/// Weights and penalties for fusing rule and classifier output.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct CombinerConfig {
    pub rule_weight: f64,
    pub ml_weight: f64,
    pub red_penalty: f64,
    pub yellow_penalty: f64,
    pub ml_penalty: f64,
    pub persistent_penalty: f64,
    pub persistent_window: usize,
    pub persistent_min: usize,
    pub recommendation_limit: usize,
}

impl Default for CombinerConfig {
    fn default() -> Self {
        Self {
            rule_weight: 0.7,
            ml_weight: 0.3,
            red_penalty: 15.0,
            yellow_penalty: 8.0,
            ml_penalty: 5.0,
            persistent_penalty: 15.0,
            persistent_window: 5,
            persistent_min: 3,
            recommendation_limit: 5,
        }
    }
}

/// Fuse rule hits and classifier output into one verdict.
///
/// `recent` is the stream window including the current reading; it only
/// feeds the persistent-stress penalty.
pub fn combine(
    rules: Vec<RuleResult>,
    ml_results: Vec<ClassifierResult>,
    ml_status: MlStatus,
    recent: &[Arc<Reading>],
    config: &CombinerConfig,
) -> DetectionVerdict {
    let ml_anomalies = ml_results.iter().filter(|r| r.is_anomaly).count();
    let ml_flagged = ml_anomalies > 0;

    let mut alert_level = rules
        .iter()
        .map(|r| r.alert_level)
        .max()
        .unwrap_or(AlertLevel::Green);
    if ml_flagged {
        alert_level = alert_level.max(AlertLevel::Yellow);
    }

    let priority_score = match rules.iter().map(|r| r.priority).max() {
        Some(p) => p,
        None if ml_flagged => ML_ONLY_PRIORITY,
        None => 0,
    };

    let rule_confidence = rules.iter().map(|r| r.confidence).fold(0.0, f64::max);
    let ml_confidence = ml_results
        .iter()
        .filter(|r| r.is_anomaly)
        .map(|r| r.confidence)
        .fold(0.0, f64::max);
    let confidence_scores = ConfidenceScores {
        rule_based: rule_confidence,
        ml_based: ml_confidence,
        combined: config.rule_weight * rule_confidence + config.ml_weight * ml_confidence,
    };

    let health_score = health_score(&rules, ml_anomalies, recent, config);
    let recommendations = recommend(&rules, ml_flagged, config.recommendation_limit);

    let mut rule_detection_types: Vec<AnomalyKind> = Vec::with_capacity(rules.len());
    for r in &rules {
        if !rule_detection_types.contains(&r.kind) {
            rule_detection_types.push(r.kind);
        }
    }

    DetectionVerdict {
        alert_level,
        risk_level: RiskLevel::from_alert(alert_level),
        priority_score,
        health_score,
        confidence_scores,
        total_anomalies: rules.len() + ml_anomalies,
        rule_anomalies_found: !rules.is_empty(),
        ml_anomalies_found: ml_flagged,
        detection_consensus: !rules.is_empty() && ml_flagged,
        rule_detection_types,
        recommendations,
        rule_based_detection: rules,
        ml_detection: ml_results,
        ml_status,
    }
}

fn health_score(
    rules: &[RuleResult],
    ml_anomalies: usize,
    recent: &[Arc<Reading>],
    config: &CombinerConfig,
) -> u8 {
    let mut score = 100.0;
    for r in rules {
        let per_priority = match r.alert_level {
            AlertLevel::Red => config.red_penalty,
            AlertLevel::Yellow => config.yellow_penalty,
            AlertLevel::Green => 0.0,
        };
        score -= f64::from(r.priority) * per_priority;
    }
    score -= ml_anomalies as f64 * config.ml_penalty;
    if persistent_stress(recent, config) {
        score -= config.persistent_penalty;
    }
    score.clamp(0.0, 100.0).round() as u8
}

fn persistent_stress(recent: &[Arc<Reading>], config: &CombinerConfig) -> bool {
    let window = config.persistent_window;
    if window == 0 || recent.len() < window {
        return false;
    }
    let stressed = recent[recent.len() - window..]
        .iter()
        .filter(|r| {
            let temp = r.value_or(Field::Temperature, 25.0);
            let humidity = r.value_or(Field::Humidity, 65.0);
            let voltage = r.value_or(Field::Voltage, 3.3);
            temp > STRESS_TEMP_HIGH
                || temp < STRESS_TEMP_LOW
                || humidity > STRESS_HUMIDITY_HIGH
                || voltage < STRESS_VOLTAGE_LOW
        })
        .count();
    stressed >= config.persistent_min
}

fn recommend(rules: &[RuleResult], ml_flagged: bool, limit: usize) -> Vec<Recommendation> {
    let mut recs: Vec<Recommendation> = Vec::new();
    for r in rules {
        if !recs.iter().any(|rec| rec.kind == r.kind.name()) {
            recs.push(advice::for_rule(r));
        }
    }
    if ml_flagged && rules.is_empty() {
        recs.push(advice::general_anomaly());
    }
    if recs.is_empty() {
        recs.push(advice::preventive_maintenance());
    }
    recs.sort_by(|a, b| b.priority.cmp(&a.priority));
    recs.truncate(limit);
    recs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::RecommendationPriority;
    use crate::signals::rules::{spec_for, REGISTRY};
    use chrono::Utc;

    fn make_reading(fields: &[(Field, f64)]) -> Arc<Reading> {
        let reading = fields
            .iter()
            .fold(Reading::new("GH001", Utc::now()), |r, (f, v)| r.with(*f, *v));
        Arc::new(reading)
    }

    fn make_rule(kind: AnomalyKind) -> RuleResult {
        spec_for(kind).result_for(make_reading(&[]))
    }

    fn make_ml(is_anomaly: bool, confidence: f64) -> ClassifierResult {
        ClassifierResult {
            is_anomaly,
            confidence,
            model_name: "gradient_boosting".to_string(),
            feature_count: 14,
        }
    }

    fn used() -> MlStatus {
        MlStatus::Used {
            model: "gradient_boosting".to_string(),
        }
    }

    #[test]
    fn empty_inputs_are_all_normal() {
        let v = combine(vec![], vec![], MlStatus::Skipped, &[], &CombinerConfig::default());
        assert_eq!(v.alert_level, AlertLevel::Green);
        assert_eq!(v.risk_level, RiskLevel::Low);
        assert_eq!(v.health_score, 100);
        assert_eq!(v.priority_score, 0);
        assert_eq!(v.total_anomalies, 0);
        assert_eq!(v.recommendations.len(), 1);
        assert_eq!(v.recommendations[0].kind, "preventive_maintenance");
    }

    #[test]
    fn red_rule_dominates() {
        let rules = vec![make_rule(AnomalyKind::SuddenSpike), make_rule(AnomalyKind::VpdTooLow)];
        let v = combine(rules, vec![make_ml(false, 0.2)], used(), &[], &CombinerConfig::default());
        assert_eq!(v.alert_level, AlertLevel::Red);
        assert_eq!(v.risk_level, RiskLevel::High);
        assert_eq!(v.priority_score, 3);
        // 100 - 2*8 - 3*15
        assert_eq!(v.health_score, 39);
    }

    #[test]
    fn ml_only_raises_yellow() {
        let v = combine(vec![], vec![make_ml(true, 0.8)], used(), &[], &CombinerConfig::default());
        assert_eq!(v.alert_level, AlertLevel::Yellow);
        assert_eq!(v.priority_score, 2);
        assert_eq!(v.health_score, 95);
        assert_eq!(v.recommendations[0].kind, "general_anomaly");
        assert!(v.ml_anomalies_found);
        assert!(!v.detection_consensus);
    }

    #[test]
    fn ml_does_not_lower_a_red_alert() {
        let v = combine(
            vec![make_rule(AnomalyKind::BatteryDepleted)],
            vec![make_ml(true, 0.6)],
            used(),
            &[],
            &CombinerConfig::default(),
        );
        assert_eq!(v.alert_level, AlertLevel::Red);
        assert!(v.detection_consensus);
        assert_eq!(v.total_anomalies, 2);
    }

    #[test]
    fn combined_confidence_weighting() {
        let v = combine(
            vec![make_rule(AnomalyKind::VpdTooLow)],
            vec![make_ml(true, 0.5), make_ml(false, 0.99)],
            used(),
            &[],
            &CombinerConfig::default(),
        );
        let expected = 0.7 * 0.95 + 0.3 * 0.5;
        let combined = v.confidence_scores.combined;
        assert!((combined - expected).abs() < 1e-9, "Expected ~{expected}, got {combined}");
        assert!((v.confidence_scores.ml_based - 0.5).abs() < 1e-9);
    }

    #[test]
    fn health_score_clamps_at_zero() {
        let rules: Vec<RuleResult> = REGISTRY.iter().map(|s| make_rule(s.kind)).collect();
        let ml: Vec<ClassifierResult> = (0..10).map(|_| make_ml(true, 0.9)).collect();
        let v = combine(rules, ml, used(), &[], &CombinerConfig::default());
        assert_eq!(v.health_score, 0);
    }

    #[test]
    fn power_failure_scores_low() {
        let rules = vec![make_rule(AnomalyKind::BatteryDepleted), make_rule(AnomalyKind::LowVoltage)];
        let v = combine(rules, vec![], MlStatus::Skipped, &[], &CombinerConfig::default());
        // 100 - 3*15 - 2*15
        assert_eq!(v.health_score, 25);
        assert_eq!(v.alert_level, AlertLevel::Red);
    }

    #[test]
    fn persistent_stress_penalty() {
        let hot = make_reading(&[(Field::Temperature, 44.0)]);
        let fine = make_reading(&[(Field::Temperature, 24.0)]);
        let recent = vec![fine.clone(), hot.clone(), fine.clone(), hot.clone(), hot.clone()];
        let v = combine(vec![], vec![], MlStatus::Skipped, &recent, &CombinerConfig::default());
        assert_eq!(v.health_score, 85);

        // Only four entries: not enough to judge persistence
        let v = combine(vec![], vec![], MlStatus::Skipped, &recent[1..], &CombinerConfig::default());
        assert_eq!(v.health_score, 100);
    }

    #[test]
    fn recommendations_are_distinct_sorted_and_bounded() {
        let rules = vec![
            make_rule(AnomalyKind::GradualDrift),
            make_rule(AnomalyKind::HighFluctuation),
            make_rule(AnomalyKind::SensorFailure),
            make_rule(AnomalyKind::SensorFailure),
            make_rule(AnomalyKind::EnvironmentalStress),
            make_rule(AnomalyKind::VpdTooLow),
            make_rule(AnomalyKind::DewPointClose),
        ];
        let v = combine(rules, vec![], MlStatus::Skipped, &[], &CombinerConfig::default());
        assert_eq!(v.recommendations.len(), 5);
        let priorities: Vec<RecommendationPriority> =
            v.recommendations.iter().map(|r| r.priority).collect();
        let mut sorted = priorities.clone();
        sorted.sort_by(|a, b| b.cmp(a));
        assert_eq!(priorities, sorted);
        assert_eq!(v.recommendations[0].kind, "sensor_failure");
        assert!(v.recommendations.iter().all(|r| r.kind != "gradual_drift"));
        assert_eq!(v.rule_detection_types.len(), 6);
    }

    #[test]
    fn combine_is_deterministic() {
        let rules = vec![make_rule(AnomalyKind::LowVoltage), make_rule(AnomalyKind::SuddenSpike)];
        let ml = vec![make_ml(true, 0.7)];
        let recent = vec![make_reading(&[(Field::Voltage, 2.5)])];
        let config = CombinerConfig::default();
        let a = combine(rules.clone(), ml.clone(), used(), &recent, &config);
        let b = combine(rules, ml, used(), &recent, &config);
        assert_eq!(a, b);
    }

    #[test]
    fn alert_matches_max_rule_severity() {
        let kinds = [AnomalyKind::GradualDrift, AnomalyKind::SuddenSpike, AnomalyKind::SuddenDrop];
        for n in 0..=kinds.len() {
            let rules: Vec<RuleResult> = kinds[..n].iter().map(|k| make_rule(*k)).collect();
            let expected = rules.iter().map(|r| r.alert_level).max().unwrap_or(AlertLevel::Green);
            let v = combine(rules, vec![], MlStatus::Skipped, &[], &CombinerConfig::default());
            assert_eq!(v.alert_level, expected);
            assert!(v.health_score <= 100);
        }
    }
}
