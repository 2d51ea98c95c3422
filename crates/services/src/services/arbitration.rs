//! Conflict Arbitrator Service
//!
//! Detects disagreements between two agents' outputs on the same item,
//! records them, drives their resolution, and suggests decisions from the
//! history of similar resolved conflicts.

pub mod heuristics;

use db::{
    DBService,
    models::conflict::{
        AgentConflict, AgentPosition, ConflictError, ConflictSeverity, CreateConflict,
        ResolutionDecision,
    },
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;
use ts_rs::TS;
use uuid::Uuid;

use super::events::{OrchestratorBus, OrchestratorEvent};

pub use heuristics::{Classification, check_security_violations, classify_outputs};

#[derive(Debug, Error)]
pub enum ArbitrationError {
    #[error("Conflict not found")]
    NotFound,
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error(transparent)]
    Conflict(#[from] ConflictError),
}

/// Two agents' outputs about one item, as handed to detection.
#[derive(Debug, Clone, Deserialize, TS)]
pub struct DetectConflictInput {
    pub project_id: Uuid,
    pub item_id: String,
    pub item_type: String,
    pub agent1: String,
    pub agent1_output: String,
    pub agent2: String,
    pub agent2_output: String,
    /// Overrides the severity the heuristics would derive.
    pub severity: Option<ConflictSeverity>,
}

#[derive(Debug, Clone, Deserialize, TS)]
pub struct ConflictResolution {
    pub decision: ResolutionDecision,
    pub explanation: String,
    pub resolved_by: String,
}

/// Frequency-vote suggestion over matching resolved history.
#[derive(Debug, Clone, PartialEq, Serialize, TS)]
pub struct ResolutionSuggestion {
    pub decision: ResolutionDecision,
    /// Share of historical cases that chose `decision` (0.0–1.0).
    pub confidence: f64,
    pub based_on_similar_cases: usize,
}

#[derive(Clone)]
pub struct ConflictArbitratorService {
    db: DBService,
    events: OrchestratorBus,
}

impl ConflictArbitratorService {
    pub fn new(db: DBService, events: OrchestratorBus) -> Self {
        Self { db, events }
    }

    // ========== Detection / reporting ==========

    /// Run the category heuristics over the two outputs. When one fires, an
    /// open conflict is recorded and returned; otherwise None.
    pub async fn detect_conflict(
        &self,
        input: DetectConflictInput,
    ) -> Result<Option<AgentConflict>, ArbitrationError> {
        let Some(classification) = classify_outputs(&input.agent1_output, &input.agent2_output)
        else {
            return Ok(None);
        };

        let conflict = self
            .report_conflict(CreateConflict {
                project_id: input.project_id,
                item_id: input.item_id,
                item_type: input.item_type,
                conflict_type: classification.conflict_type,
                agent1: AgentPosition {
                    agent: input.agent1,
                    stance: input.agent1_output,
                    reasoning: None,
                },
                agent2: AgentPosition {
                    agent: input.agent2,
                    stance: input.agent2_output,
                    reasoning: None,
                },
                severity: input.severity.unwrap_or(classification.severity),
            })
            .await?;
        Ok(Some(conflict))
    }

    /// Record a conflict whose category is already known, bypassing
    /// detection.
    pub async fn report_conflict(
        &self,
        data: CreateConflict,
    ) -> Result<AgentConflict, ArbitrationError> {
        let conflict = AgentConflict::create(&self.db.pool, &data).await?;
        info!(
            conflict_id = %conflict.id,
            conflict_type = %conflict.conflict_type,
            severity = %conflict.severity,
            item_id = %conflict.item_id,
            "conflict detected"
        );
        self.events.emit(&OrchestratorEvent::ConflictDetected {
            conflict: conflict.clone(),
        });
        Ok(conflict)
    }

    // ========== Resolution ==========

    pub async fn resolve_conflict(
        &self,
        id: Uuid,
        resolution: ConflictResolution,
    ) -> Result<AgentConflict, ArbitrationError> {
        let existing = AgentConflict::find_by_id(&self.db.pool, id)
            .await?
            .ok_or(ArbitrationError::NotFound)?;

        let conflict = AgentConflict::resolve(
            &self.db.pool,
            id,
            resolution.decision,
            &resolution.explanation,
            &resolution.resolved_by,
        )
        .await?
        .ok_or_else(|| {
            ArbitrationError::InvalidState(format!("Conflict is already {}", existing.status))
        })?;

        info!(conflict_id = %id, decision = %resolution.decision, "conflict resolved");
        self.events.emit(&OrchestratorEvent::ConflictResolved {
            conflict: conflict.clone(),
        });
        Ok(conflict)
    }

    pub async fn dismiss_conflict(
        &self,
        id: Uuid,
        reason: &str,
    ) -> Result<AgentConflict, ArbitrationError> {
        let existing = AgentConflict::find_by_id(&self.db.pool, id)
            .await?
            .ok_or(ArbitrationError::NotFound)?;

        let conflict = AgentConflict::dismiss(&self.db.pool, id, reason)
            .await?
            .ok_or_else(|| {
                ArbitrationError::InvalidState(format!("Conflict is already {}", existing.status))
            })?;

        info!(conflict_id = %id, reason, "conflict dismissed");
        self.events.emit(&OrchestratorEvent::ConflictDismissed {
            conflict: conflict.clone(),
        });
        Ok(conflict)
    }

    // ========== Reads ==========

    pub async fn get_open_conflicts(
        &self,
        project_id: Uuid,
    ) -> Result<Vec<AgentConflict>, ArbitrationError> {
        Ok(AgentConflict::find_open_by_project(&self.db.pool, project_id).await?)
    }

    pub async fn get_item_conflicts(
        &self,
        item_id: &str,
    ) -> Result<Vec<AgentConflict>, ArbitrationError> {
        Ok(AgentConflict::find_by_item(&self.db.pool, item_id).await?)
    }

    // ========== Suggestion ==========

    /// Majority vote over resolved conflicts with the same type and the same
    /// ordered agent pair. Ties go to the decision seen first in history.
    /// None when the conflict id is unknown or no history exists.
    pub async fn suggest_resolution(
        &self,
        id: Uuid,
    ) -> Result<Option<ResolutionSuggestion>, ArbitrationError> {
        let Some(conflict) = AgentConflict::find_by_id(&self.db.pool, id).await? else {
            return Ok(None);
        };

        let history = AgentConflict::find_resolved_matching(
            &self.db.pool,
            conflict.conflict_type,
            &conflict.agent1,
            &conflict.agent2,
        )
        .await?;
        if history.is_empty() {
            return Ok(None);
        }

        // tally in first-seen order so a tie keeps the earliest majority
        let mut tally: Vec<(ResolutionDecision, usize)> = Vec::new();
        for past in &history {
            let Some(decision) = past.resolution_decision else {
                continue;
            };
            match tally.iter_mut().find(|(d, _)| *d == decision) {
                Some((_, count)) => *count += 1,
                None => tally.push((decision, 1)),
            }
        }

        let total: usize = tally.iter().map(|(_, count)| count).sum();
        let mut best: Option<(ResolutionDecision, usize)> = None;
        for (decision, count) in tally {
            if best.map_or(true, |(_, best_count)| count > best_count) {
                best = Some((decision, count));
            }
        }

        Ok(best.map(|(decision, count)| ResolutionSuggestion {
            decision,
            confidence: count as f64 / total as f64,
            based_on_similar_cases: total,
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use db::models::conflict::{ConflictStatus, ConflictType};

    use super::*;

    async fn arbitrator_with_bus() -> (ConflictArbitratorService, OrchestratorBus) {
        let db = DBService::new_in_memory().await.unwrap();
        let bus = OrchestratorBus::new();
        (ConflictArbitratorService::new(db, bus.clone()), bus)
    }

    fn detect_input(project_id: Uuid, output1: &str, output2: &str) -> DetectConflictInput {
        DetectConflictInput {
            project_id,
            item_id: "task-7".to_string(),
            item_type: "task".to_string(),
            agent1: "security".to_string(),
            agent1_output: output1.to_string(),
            agent2: "developer".to_string(),
            agent2_output: output2.to_string(),
            severity: None,
        }
    }

    fn report_spec(project_id: Uuid) -> CreateConflict {
        CreateConflict {
            project_id,
            item_id: "task-7".to_string(),
            item_type: "task".to_string(),
            conflict_type: ConflictType::ApproachConflict,
            agent1: AgentPosition {
                agent: "architect".to_string(),
                stance: "use events".to_string(),
                reasoning: None,
            },
            agent2: AgentPosition {
                agent: "developer".to_string(),
                stance: "use direct calls".to_string(),
                reasoning: None,
            },
            severity: ConflictSeverity::Low,
        }
    }

    #[tokio::test]
    async fn detection_records_and_publishes_security_conflicts() {
        let (arbitrator, bus) = arbitrator_with_bus().await;
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = seen.clone();
            bus.subscribe(move |event: &OrchestratorEvent| {
                seen.lock().unwrap().push(event.name().to_string());
            });
        }

        let project_id = Uuid::new_v4();
        let conflict = arbitrator
            .detect_conflict(detect_input(
                project_id,
                "Found XSS risk: user input flows into eval()",
                "The parser uses eval() on the provided expression",
            ))
            .await
            .unwrap()
            .expect("security conflict expected");

        assert_eq!(conflict.conflict_type, ConflictType::SecurityViolation);
        assert_eq!(conflict.status, ConflictStatus::Open);
        assert_eq!(seen.lock().unwrap().as_slice(), &["conflict-detected".to_string()]);

        let open = arbitrator.get_open_conflicts(project_id).await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(
            arbitrator.get_item_conflicts("task-7").await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn agreement_yields_no_conflict() {
        let (arbitrator, _) = arbitrator_with_bus().await;
        let result = arbitrator
            .detect_conflict(detect_input(
                Uuid::new_v4(),
                "The login flow uses OAuth",
                "Login is built on OAuth",
            ))
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn resolution_and_dismissal_are_terminal() {
        let (arbitrator, bus) = arbitrator_with_bus().await;
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = seen.clone();
            bus.subscribe(move |event: &OrchestratorEvent| {
                seen.lock().unwrap().push(event.name().to_string());
            });
        }

        let conflict = arbitrator
            .report_conflict(report_spec(Uuid::new_v4()))
            .await
            .unwrap();
        let resolved = arbitrator
            .resolve_conflict(
                conflict.id,
                ConflictResolution {
                    decision: ResolutionDecision::Compromise,
                    explanation: "events for cross-module, calls within".to_string(),
                    resolved_by: "lead".to_string(),
                },
            )
            .await
            .unwrap();
        assert_eq!(resolved.status, ConflictStatus::Resolved);

        assert!(matches!(
            arbitrator.dismiss_conflict(conflict.id, "stale").await,
            Err(ArbitrationError::InvalidState(_))
        ));
        assert!(matches!(
            arbitrator
                .resolve_conflict(
                    Uuid::new_v4(),
                    ConflictResolution {
                        decision: ResolutionDecision::Compromise,
                        explanation: String::new(),
                        resolved_by: "lead".to_string(),
                    },
                )
                .await,
            Err(ArbitrationError::NotFound)
        ));
        assert_eq!(
            seen.lock().unwrap().as_slice(),
            &["conflict-detected".to_string(), "conflict-resolved".to_string()]
        );
    }

    #[tokio::test]
    async fn suggestion_votes_over_matching_history() {
        let (arbitrator, _) = arbitrator_with_bus().await;
        let project_id = Uuid::new_v4();

        // three resolved cases for the same type/pair: [A, A, B]
        for decision in [
            ResolutionDecision::SideWithAgent1,
            ResolutionDecision::SideWithAgent1,
            ResolutionDecision::SideWithAgent2,
        ] {
            let past = arbitrator.report_conflict(report_spec(project_id)).await.unwrap();
            arbitrator
                .resolve_conflict(
                    past.id,
                    ConflictResolution {
                        decision,
                        explanation: String::new(),
                        resolved_by: "lead".to_string(),
                    },
                )
                .await
                .unwrap();
        }

        let open = arbitrator.report_conflict(report_spec(project_id)).await.unwrap();
        let suggestion = arbitrator
            .suggest_resolution(open.id)
            .await
            .unwrap()
            .expect("history exists");

        assert_eq!(suggestion.decision, ResolutionDecision::SideWithAgent1);
        assert_eq!(suggestion.based_on_similar_cases, 3);
        assert!((suggestion.confidence - 2.0 / 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn suggestion_is_none_without_history_or_for_unknown_ids() {
        let (arbitrator, _) = arbitrator_with_bus().await;

        assert!(arbitrator
            .suggest_resolution(Uuid::new_v4())
            .await
            .unwrap()
            .is_none());

        let conflict = arbitrator
            .report_conflict(report_spec(Uuid::new_v4()))
            .await
            .unwrap();
        assert!(arbitrator
            .suggest_resolution(conflict.id)
            .await
            .unwrap()
            .is_none());

        // dismissed conflicts never count as history
        arbitrator.dismiss_conflict(conflict.id, "noise").await.unwrap();
        let another = arbitrator
            .report_conflict(report_spec(Uuid::new_v4()))
            .await
            .unwrap();
        assert!(arbitrator
            .suggest_resolution(another.id)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn ties_keep_the_first_seen_majority() {
        let (arbitrator, _) = arbitrator_with_bus().await;
        let project_id = Uuid::new_v4();

        for decision in [
            ResolutionDecision::SideWithAgent2,
            ResolutionDecision::SideWithAgent1,
        ] {
            let past = arbitrator.report_conflict(report_spec(project_id)).await.unwrap();
            arbitrator
                .resolve_conflict(
                    past.id,
                    ConflictResolution {
                        decision,
                        explanation: String::new(),
                        resolved_by: "lead".to_string(),
                    },
                )
                .await
                .unwrap();
        }

        let open = arbitrator.report_conflict(report_spec(project_id)).await.unwrap();
        let suggestion = arbitrator.suggest_resolution(open.id).await.unwrap().unwrap();
        assert_eq!(suggestion.decision, ResolutionDecision::SideWithAgent2);
        assert!((suggestion.confidence - 0.5).abs() < 1e-9);
    }
}
