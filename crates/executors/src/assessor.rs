//! Approval assessor boundary.
//!
//! The autonomous executor consults an assessor before releasing an approval
//! gate without a human. The default implementation is a plain text
//! heuristic; hosts can plug in a model-backed assessor behind the same
//! trait.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use ts_rs::TS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RiskLevel::Low => write!(f, "low"),
            RiskLevel::Medium => write!(f, "medium"),
            RiskLevel::High => write!(f, "high"),
        }
    }
}

/// What the assessor is asked to judge: the output a task produced, plus the
/// task category when known (some categories are never auto-approved).
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
pub struct TaskOutputReview {
    pub task_type: Option<String>,
    pub output: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
pub struct ApprovalAssessment {
    pub can_auto_approve: bool,
    /// 0–100, higher is better.
    pub quality_score: u8,
    pub risk_level: RiskLevel,
}

#[async_trait]
pub trait ApprovalAssessor: Send + Sync {
    async fn assess(&self, review: &TaskOutputReview) -> ApprovalAssessment;
}

/// Keyword-driven assessment over the task output text.
pub struct HeuristicAssessor {
    /// Minimum quality score at which a low-risk output may be auto-approved.
    pub auto_approve_floor: u8,
}

const FAILURE_MARKERS: &[&str] = &["error", "failed", "failure", "panic", "exception", "fixme"];
const HIGH_RISK_TYPES: &[&str] = &["security_audit", "deployment"];
const HIGH_RISK_MARKERS: &[&str] = &["breaking change", "data migration", "drops table"];

impl Default for HeuristicAssessor {
    fn default() -> Self {
        Self {
            auto_approve_floor: 70,
        }
    }
}

#[async_trait]
impl ApprovalAssessor for HeuristicAssessor {
    async fn assess(&self, review: &TaskOutputReview) -> ApprovalAssessment {
        let text = review.output.to_lowercase();

        let mut score: i32 = 95;
        for marker in FAILURE_MARKERS {
            if text.contains(marker) {
                score -= 15;
            }
        }
        let quality_score = score.clamp(0, 100) as u8;

        let type_is_high_risk = review
            .task_type
            .as_deref()
            .is_some_and(|t| HIGH_RISK_TYPES.contains(&t));
        let risk_level = if type_is_high_risk || HIGH_RISK_MARKERS.iter().any(|m| text.contains(m))
        {
            RiskLevel::High
        } else if quality_score < 70 || text.contains("warning") {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        };

        ApprovalAssessment {
            can_auto_approve: risk_level == RiskLevel::Low
                && quality_score >= self.auto_approve_floor,
            quality_score,
            risk_level,
        }
    }
}
