use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::core::{AlertLevel, DetectionVerdict, Recommendation, RecommendationPriority, RiskLevel};

const MAX_ISSUES: usize = 2;
const MAX_RECOMMENDATIONS: usize = 3;

/// Operator-facing alert rendered from a verdict.
#[derive(Debug, Clone, Serialize)]
pub struct AlertMessage {
    pub level: &'static str,
    pub title: String,
    pub message: String,
    pub icon: &'static str,
    pub confidence: f64,
    pub priority_score: u8,
    pub health_score: u8,
    pub risk_level: RiskLevel,
    pub total_anomalies: usize,
    pub recommendations: Vec<Recommendation>,
    pub timestamp: DateTime<Utc>,
}

impl AlertMessage {
    pub fn from_verdict(verdict: &DetectionVerdict, timestamp: DateTime<Utc>) -> Self {
        let health = verdict.health_score;
        let risk = verdict.risk_level.as_str().to_uppercase();

        let (level, icon, title, mut message) = if verdict.total_anomalies == 0 {
            (
                "info",
                "OK",
                "System Normal".to_string(),
                format!("All sensors are operating within normal parameters. Health Score: {health}/100"),
            )
        } else {
            match verdict.alert_level {
                AlertLevel::Red => (
                    "critical",
                    "CRITICAL",
                    format!("Critical System Alert - Health Score: {health}/100"),
                    format!("IMMEDIATE ACTION REQUIRED! Critical anomalies detected. Risk Level: {risk}"),
                ),
                AlertLevel::Yellow => (
                    "warning",
                    "WARNING",
                    format!("System Warning - Health Score: {health}/100"),
                    format!("Unusual patterns detected. Investigation recommended. Risk Level: {risk}"),
                ),
                AlertLevel::Green => (
                    "info",
                    "OK",
                    format!("System Information - Health Score: {health}/100"),
                    format!("Minor variations detected. Risk Level: {risk}"),
                ),
            }
        };

        let critical: Vec<&Recommendation> = verdict
            .recommendations
            .iter()
            .filter(|r| r.priority == RecommendationPriority::High)
            .collect();
        if !critical.is_empty() {
            let _ = write!(message, "\n\nCritical Issues ({}):", critical.len());
            for rec in critical.iter().take(MAX_ISSUES) {
                let _ = write!(
                    message,
                    "\n• {}\n  Action: {} (ETA: {})",
                    rec.message, rec.action, rec.estimated_time
                );
            }
        }

        Self {
            level,
            title,
            message,
            icon,
            confidence: verdict.confidence_scores.combined,
            priority_score: verdict.priority_score,
            health_score: health,
            risk_level: verdict.risk_level,
            total_anomalies: verdict.total_anomalies,
            recommendations: verdict
                .recommendations
                .iter()
                .take(MAX_RECOMMENDATIONS)
                .cloned()
                .collect(),
            timestamp,
        }
    }
}
