use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool, Type};
use strum_macros::EnumString;
use thiserror::Error;
use ts_rs::TS;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ConflictError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("Conflict not found")]
    NotFound,
}

#[derive(Debug, Clone, Copy, Type, Serialize, Deserialize, PartialEq, Eq, Hash, TS, EnumString)]
#[sqlx(type_name = "conflict_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ConflictType {
    SecurityViolation,
    RequirementChange,
    TestDisagreement,
    PriorityConflict,
    ApproachConflict,
}

impl std::fmt::Display for ConflictType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConflictType::SecurityViolation => write!(f, "security_violation"),
            ConflictType::RequirementChange => write!(f, "requirement_change"),
            ConflictType::TestDisagreement => write!(f, "test_disagreement"),
            ConflictType::PriorityConflict => write!(f, "priority_conflict"),
            ConflictType::ApproachConflict => write!(f, "approach_conflict"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Type, Serialize, Deserialize, PartialEq, Eq, TS)]
#[sqlx(type_name = "conflict_severity", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ConflictSeverity {
    Critical,
    High,
    #[default]
    Medium,
    Low,
}

impl std::fmt::Display for ConflictSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConflictSeverity::Critical => write!(f, "critical"),
            ConflictSeverity::High => write!(f, "high"),
            ConflictSeverity::Medium => write!(f, "medium"),
            ConflictSeverity::Low => write!(f, "low"),
        }
    }
}

#[derive(Debug, Clone, Copy, Type, Serialize, Deserialize, PartialEq, Eq, TS)]
#[sqlx(type_name = "conflict_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ConflictStatus {
    Open,
    Resolved,
    Dismissed,
}

impl std::fmt::Display for ConflictStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConflictStatus::Open => write!(f, "open"),
            ConflictStatus::Resolved => write!(f, "resolved"),
            ConflictStatus::Dismissed => write!(f, "dismissed"),
        }
    }
}

#[derive(Debug, Clone, Copy, Type, Serialize, Deserialize, PartialEq, Eq, Hash, TS, EnumString)]
#[sqlx(type_name = "resolution_decision", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ResolutionDecision {
    SideWithAgent1,
    SideWithAgent2,
    Compromise,
}

impl std::fmt::Display for ResolutionDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResolutionDecision::SideWithAgent1 => write!(f, "side_with_agent1"),
            ResolutionDecision::SideWithAgent2 => write!(f, "side_with_agent2"),
            ResolutionDecision::Compromise => write!(f, "compromise"),
        }
    }
}

/// One agent's side of a disagreement.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
pub struct AgentPosition {
    pub agent: String,
    pub stance: String,
    pub reasoning: Option<String>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize, TS)]
pub struct AgentConflict {
    pub id: Uuid,
    pub project_id: Uuid,
    pub item_id: String,
    pub item_type: String,
    pub conflict_type: ConflictType,
    pub agent1: String,
    pub agent1_stance: String,
    pub agent1_reasoning: Option<String>,
    pub agent2: String,
    pub agent2_stance: String,
    pub agent2_reasoning: Option<String>,
    pub severity: ConflictSeverity,
    pub status: ConflictStatus,
    pub resolution_decision: Option<ResolutionDecision>,
    pub resolution_explanation: Option<String>,
    pub dismissal_reason: Option<String>,
    pub resolved_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize, TS)]
pub struct CreateConflict {
    pub project_id: Uuid,
    pub item_id: String,
    pub item_type: String,
    pub conflict_type: ConflictType,
    pub agent1: AgentPosition,
    pub agent2: AgentPosition,
    pub severity: ConflictSeverity,
}

impl AgentConflict {
    pub async fn create(pool: &SqlitePool, data: &CreateConflict) -> Result<Self, ConflictError> {
        let id = Uuid::new_v4();
        let conflict_type = data.conflict_type.to_string();
        let severity = data.severity.to_string();

        let conflict = sqlx::query_as::<_, AgentConflict>(
            r#"
            INSERT INTO agent_conflicts (
                id, project_id, item_id, item_type, conflict_type,
                agent1, agent1_stance, agent1_reasoning,
                agent2, agent2_stance, agent2_reasoning,
                severity
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(data.project_id)
        .bind(&data.item_id)
        .bind(&data.item_type)
        .bind(conflict_type)
        .bind(&data.agent1.agent)
        .bind(&data.agent1.stance)
        .bind(&data.agent1.reasoning)
        .bind(&data.agent2.agent)
        .bind(&data.agent2.stance)
        .bind(&data.agent2.reasoning)
        .bind(severity)
        .fetch_one(pool)
        .await?;

        Ok(conflict)
    }

    pub async fn find_by_id(pool: &SqlitePool, id: Uuid) -> Result<Option<Self>, ConflictError> {
        let conflict =
            sqlx::query_as::<_, AgentConflict>(r#"SELECT * FROM agent_conflicts WHERE id = ?1"#)
                .bind(id)
                .fetch_optional(pool)
                .await?;
        Ok(conflict)
    }

    pub async fn find_open_by_project(
        pool: &SqlitePool,
        project_id: Uuid,
    ) -> Result<Vec<Self>, ConflictError> {
        let conflicts = sqlx::query_as::<_, AgentConflict>(
            r#"
            SELECT * FROM agent_conflicts
            WHERE project_id = ?1 AND status = 'open'
            ORDER BY created_at ASC, rowid ASC
            "#,
        )
        .bind(project_id)
        .fetch_all(pool)
        .await?;
        Ok(conflicts)
    }

    pub async fn find_by_item(
        pool: &SqlitePool,
        item_id: &str,
    ) -> Result<Vec<Self>, ConflictError> {
        let conflicts = sqlx::query_as::<_, AgentConflict>(
            r#"
            SELECT * FROM agent_conflicts
            WHERE item_id = ?1
            ORDER BY created_at ASC, rowid ASC
            "#,
        )
        .bind(item_id)
        .fetch_all(pool)
        .await?;
        Ok(conflicts)
    }

    /// Resolved history for the same conflict type and the same ordered agent
    /// pair, oldest first. Backs the arbitration suggestion vote.
    pub async fn find_resolved_matching(
        pool: &SqlitePool,
        conflict_type: ConflictType,
        agent1: &str,
        agent2: &str,
    ) -> Result<Vec<Self>, ConflictError> {
        let conflict_type = conflict_type.to_string();
        let conflicts = sqlx::query_as::<_, AgentConflict>(
            r#"
            SELECT * FROM agent_conflicts
            WHERE conflict_type = ?1
              AND agent1 = ?2
              AND agent2 = ?3
              AND status = 'resolved'
            ORDER BY created_at ASC, rowid ASC
            "#,
        )
        .bind(conflict_type)
        .bind(agent1)
        .bind(agent2)
        .fetch_all(pool)
        .await?;
        Ok(conflicts)
    }

    /// Terminal transition; only an open conflict can be resolved.
    pub async fn resolve(
        pool: &SqlitePool,
        id: Uuid,
        decision: ResolutionDecision,
        explanation: &str,
        resolved_by: &str,
    ) -> Result<Option<Self>, ConflictError> {
        let decision = decision.to_string();
        let conflict = sqlx::query_as::<_, AgentConflict>(
            r#"
            UPDATE agent_conflicts
            SET status = 'resolved',
                resolution_decision = ?2,
                resolution_explanation = ?3,
                resolved_by = ?4,
                resolved_at = datetime('now', 'subsec')
            WHERE id = ?1 AND status = 'open'
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(decision)
        .bind(explanation)
        .bind(resolved_by)
        .fetch_optional(pool)
        .await?;
        Ok(conflict)
    }

    /// Terminal transition; only an open conflict can be dismissed.
    pub async fn dismiss(
        pool: &SqlitePool,
        id: Uuid,
        reason: &str,
    ) -> Result<Option<Self>, ConflictError> {
        let conflict = sqlx::query_as::<_, AgentConflict>(
            r#"
            UPDATE agent_conflicts
            SET status = 'dismissed',
                dismissal_reason = ?2,
                resolved_at = datetime('now', 'subsec')
            WHERE id = ?1 AND status = 'open'
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(reason)
        .fetch_optional(pool)
        .await?;
        Ok(conflict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DBService;

    fn spec(project_id: Uuid, conflict_type: ConflictType) -> CreateConflict {
        CreateConflict {
            project_id,
            item_id: "task-42".to_string(),
            item_type: "task".to_string(),
            conflict_type,
            agent1: AgentPosition {
                agent: "security".to_string(),
                stance: "block the change".to_string(),
                reasoning: Some("unsafe sink".to_string()),
            },
            agent2: AgentPosition {
                agent: "developer".to_string(),
                stance: "ship it".to_string(),
                reasoning: None,
            },
            severity: ConflictSeverity::Medium,
        }
    }

    #[tokio::test]
    async fn resolution_record_present_iff_resolved() {
        let db = DBService::new_in_memory().await.unwrap();
        let conflict = AgentConflict::create(&db.pool, &spec(Uuid::new_v4(), ConflictType::ApproachConflict))
            .await
            .unwrap();

        assert_eq!(conflict.status, ConflictStatus::Open);
        assert!(conflict.resolution_decision.is_none());
        assert!(conflict.resolved_at.is_none());

        let resolved = AgentConflict::resolve(
            &db.pool,
            conflict.id,
            ResolutionDecision::SideWithAgent1,
            "security wins on sinks",
            "lead",
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(resolved.status, ConflictStatus::Resolved);
        assert_eq!(
            resolved.resolution_decision,
            Some(ResolutionDecision::SideWithAgent1)
        );
        assert!(resolved.resolved_at.is_some());

        // terminal: a second resolve or a dismiss finds no open row
        let again = AgentConflict::resolve(
            &db.pool,
            conflict.id,
            ResolutionDecision::Compromise,
            "x",
            "y",
        )
        .await
        .unwrap();
        assert!(again.is_none());
        let dismissed = AgentConflict::dismiss(&db.pool, conflict.id, "stale").await.unwrap();
        assert!(dismissed.is_none());
    }

    #[tokio::test]
    async fn history_query_matches_type_and_ordered_pair() {
        let db = DBService::new_in_memory().await.unwrap();
        let project_id = Uuid::new_v4();

        for _ in 0..2 {
            let c = AgentConflict::create(&db.pool, &spec(project_id, ConflictType::SecurityViolation))
                .await
                .unwrap();
            AgentConflict::resolve(
                &db.pool,
                c.id,
                ResolutionDecision::SideWithAgent1,
                "",
                "lead",
            )
            .await
            .unwrap();
        }

        // same type, pair reversed: must not match
        let mut reversed = spec(project_id, ConflictType::SecurityViolation);
        std::mem::swap(&mut reversed.agent1, &mut reversed.agent2);
        let c = AgentConflict::create(&db.pool, &reversed).await.unwrap();
        AgentConflict::resolve(&db.pool, c.id, ResolutionDecision::SideWithAgent2, "", "lead")
            .await
            .unwrap();

        // open conflict of the same shape: must not match either
        AgentConflict::create(&db.pool, &spec(project_id, ConflictType::SecurityViolation))
            .await
            .unwrap();

        let history = AgentConflict::find_resolved_matching(
            &db.pool,
            ConflictType::SecurityViolation,
            "security",
            "developer",
        )
        .await
        .unwrap();
        assert_eq!(history.len(), 2);
    }
}
