use crate::config::ReviewSettings;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewPriority {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AreaScore {
    pub area: String,
    pub score: f64,
}

/// Post-stage confidence verdict. Purely advisory: the evaluator annotates,
/// a downstream human-review collaborator acts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewAssessment {
    pub doc_id: String,
    pub overall_confidence: f64,
    pub needs_review: bool,
    pub priority: ReviewPriority,
    pub low_confidence_areas: Vec<AreaScore>,
    pub recommendations: Vec<String>,
    pub evaluated_at: DateTime<Utc>,
}

pub struct ReviewEvaluator {
    settings: ReviewSettings,
}

impl ReviewEvaluator {
    pub fn new(settings: ReviewSettings) -> Self {
        ReviewEvaluator { settings }
    }

    /// Weighted-average confidence over the known-area weight table, with the
    /// weights renormalized across the areas actually present. Areas outside
    /// the table are ignored for the average but still count for the
    /// per-area threshold check.
    pub fn evaluate(&self, doc_id: &str, scores: &HashMap<String, f64>) -> ReviewAssessment {
        let mut weighted_sum = 0.0;
        let mut weight_total = 0.0;
        for (area, score) in scores {
            if let Some(weight) = self.settings.weights.get(area) {
                weighted_sum += score * weight;
                weight_total += weight;
            }
        }
        let overall_confidence = if weight_total > 0.0 {
            weighted_sum / weight_total
        } else if scores.is_empty() {
            1.0
        } else {
            // Nothing in the weight table matched; fall back to a plain mean.
            scores.values().sum::<f64>() / scores.len() as f64
        };

        let mut low_confidence_areas: Vec<AreaScore> = scores
            .iter()
            .filter(|(_, score)| **score < self.settings.threshold)
            .map(|(area, score)| AreaScore {
                area: area.clone(),
                score: *score,
            })
            .collect();
        low_confidence_areas.sort_by(|a, b| {
            a.score
                .partial_cmp(&b.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.area.cmp(&b.area))
        });

        let needs_review =
            overall_confidence < self.settings.threshold || !low_confidence_areas.is_empty();

        let priority = if overall_confidence < self.settings.high_priority_below {
            ReviewPriority::High
        } else if overall_confidence < self.settings.medium_priority_below {
            ReviewPriority::Medium
        } else {
            ReviewPriority::Low
        };

        let recommendations = low_confidence_areas
            .iter()
            .map(|area| {
                format!(
                    "Area '{}' scored {:.2}, below the {:.2} review threshold; verify this output manually.",
                    area.area, area.score, self.settings.threshold
                )
            })
            .collect();

        debug!(doc_id, overall_confidence, needs_review, ?priority, "Review evaluation");

        ReviewAssessment {
            doc_id: doc_id.to_string(),
            overall_confidence,
            needs_review,
            priority,
            low_confidence_areas,
            recommendations,
            evaluated_at: Utc::now(),
        }
    }
}
