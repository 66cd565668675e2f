use crate::core::{AnomalyKind, Recommendation, RecommendationPriority, RuleResult};

/// Pre-authored operator guidance for one anomaly kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Advice {
    pub action: &'static str,
    pub estimated_time: &'static str,
    pub severity_impact: &'static str,
}

pub fn advice_for(kind: AnomalyKind) -> Advice {
    let (action, estimated_time, severity_impact) = match kind {
        AnomalyKind::VpdTooLow => (
            "IMMEDIATE: Check ventilation system and increase air circulation. Adjust humidity to 60-70%. Monitor for next 2 hours.",
            "2-4 hours",
            "High risk of plant disease and poor growth",
        ),
        AnomalyKind::DewPointClose => (
            "URGENT: Risk of mold growth. Increase ventilation immediately. Consider dehumidification. Check within 1 hour.",
            "1-2 hours",
            "Critical risk of mold and fungal growth",
        ),
        AnomalyKind::LowVoltage => (
            "Check power supply connections and battery health. Replace if battery < 20%. Test voltage stability.",
            "30 minutes",
            "Potential data loss and system shutdown",
        ),
        AnomalyKind::BatteryDepleted => (
            "CRITICAL: Replace or recharge sensor battery immediately. System may shut down soon.",
            "15 minutes",
            "Imminent system shutdown",
        ),
        AnomalyKind::SuddenDrop => (
            "Investigate equipment malfunction. Check sensors, wiring and power supply. Document conditions.",
            "1-3 hours",
            "Possible equipment damage or environmental shock",
        ),
        AnomalyKind::SuddenSpike => (
            "Check for external interference, calibration drift or electrical issues. Verify reading accuracy.",
            "30-60 minutes",
            "Risk of sensor damage or incorrect readings",
        ),
        AnomalyKind::SensorFailure => (
            "Replace faulty sensor(s). Check connections and perform calibration after replacement.",
            "2-4 hours",
            "Loss of monitoring capability",
        ),
        AnomalyKind::HighFluctuation => (
            "Stabilize environment. Check for vibrations, electrical interference or loose connections.",
            "1-2 hours",
            "Unreliable data and potential stress",
        ),
        AnomalyKind::EnvironmentalStress => (
            "Adjust environmental controls. Optimize temperature and humidity for plant health.",
            "4-8 hours",
            "Plant health deterioration",
        ),
        AnomalyKind::GradualDrift => (
            "Schedule sensor recalibration. Check mounting and environmental factors affecting readings.",
            "1 hour",
            "Decreasing measurement accuracy",
        ),
    };
    Advice {
        action,
        estimated_time,
        severity_impact,
    }
}

pub fn for_rule(result: &RuleResult) -> Recommendation {
    let advice = advice_for(result.kind);
    Recommendation {
        kind: result.kind.name(),
        message: result.message.to_string(),
        action: advice.action,
        priority: RecommendationPriority::from_rule_priority(result.priority),
        estimated_time: advice.estimated_time,
        severity_impact: advice.severity_impact,
    }
}

/// Raised when only the classifier saw something.
pub fn general_anomaly() -> Recommendation {
    Recommendation {
        kind: "general_anomaly",
        message: "Machine learning model detected unusual patterns".to_string(),
        action: "Monitor system closely for 30 minutes and check for environmental changes",
        priority: RecommendationPriority::Medium,
        estimated_time: "30 minutes",
        severity_impact: "medium",
    }
}

pub fn preventive_maintenance() -> Recommendation {
    Recommendation {
        kind: "preventive_maintenance",
        message: "System operating normally".to_string(),
        action: "Continue regular monitoring and consider preventive maintenance",
        priority: RecommendationPriority::Low,
        estimated_time: "15 minutes",
        severity_impact: "low",
    }
}
