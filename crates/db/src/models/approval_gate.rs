use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{FromRow, SqlitePool, Type};
use thiserror::Error;
use ts_rs::TS;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ApprovalGateError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("Approval gate not found")]
    NotFound,
    #[error("Approval gate is already resolved")]
    AlreadyResolved,
}

#[derive(Debug, Clone, Copy, Type, Serialize, Deserialize, PartialEq, Eq, TS)]
#[sqlx(type_name = "gate_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum GateType {
    Manual,
    Quality,
    Security,
    TechDecision,
    Review,
}

impl std::fmt::Display for GateType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GateType::Manual => write!(f, "manual"),
            GateType::Quality => write!(f, "quality"),
            GateType::Security => write!(f, "security"),
            GateType::TechDecision => write!(f, "tech_decision"),
            GateType::Review => write!(f, "review"),
        }
    }
}

impl GateType {
    /// Gates that guard the start of execution re-queue the task when
    /// approved; review-style gates conclude it.
    pub fn resumes_execution(&self) -> bool {
        matches!(self, GateType::Manual | GateType::Security | GateType::TechDecision)
    }
}

#[derive(Debug, Clone, Copy, Type, Serialize, Deserialize, PartialEq, Eq, TS)]
#[sqlx(type_name = "gate_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum GateStatus {
    Pending,
    Approved,
    Rejected,
    Skipped,
}

impl std::fmt::Display for GateStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GateStatus::Pending => write!(f, "pending"),
            GateStatus::Approved => write!(f, "approved"),
            GateStatus::Rejected => write!(f, "rejected"),
            GateStatus::Skipped => write!(f, "skipped"),
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize, TS)]
pub struct TaskApprovalGate {
    pub id: Uuid,
    pub task_id: Uuid,
    pub gate_type: GateType,
    pub title: String,
    pub description: Option<String>,
    pub status: GateStatus,
    pub requires_human_review: bool,
    pub review_data: Option<String>,
    pub resolved_by: Option<String>,
    pub review_notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize, TS)]
pub struct CreateApprovalGate {
    pub task_id: Uuid,
    pub gate_type: GateType,
    pub title: String,
    pub description: Option<String>,
    pub requires_human_review: bool,
    pub review_data: Option<Value>,
}

impl TaskApprovalGate {
    pub fn review_data_json(&self) -> Option<Value> {
        self.review_data
            .as_ref()
            .and_then(|s| serde_json::from_str(s).ok())
    }

    pub async fn create(
        pool: &SqlitePool,
        data: CreateApprovalGate,
    ) -> Result<Self, ApprovalGateError> {
        let id = Uuid::new_v4();
        let gate_type = data.gate_type.to_string();
        let review_data = data.review_data.map(|v| v.to_string());

        let gate = sqlx::query_as::<_, TaskApprovalGate>(
            r#"
            INSERT INTO task_approval_gates (
                id, task_id, gate_type, title, description,
                requires_human_review, review_data
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(data.task_id)
        .bind(gate_type)
        .bind(&data.title)
        .bind(&data.description)
        .bind(data.requires_human_review)
        .bind(review_data)
        .fetch_one(pool)
        .await?;

        Ok(gate)
    }

    pub async fn find_by_id(
        pool: &SqlitePool,
        id: Uuid,
    ) -> Result<Option<Self>, ApprovalGateError> {
        let gate =
            sqlx::query_as::<_, TaskApprovalGate>(r#"SELECT * FROM task_approval_gates WHERE id = ?1"#)
                .bind(id)
                .fetch_optional(pool)
                .await?;
        Ok(gate)
    }

    pub async fn find_by_task(
        pool: &SqlitePool,
        task_id: Uuid,
    ) -> Result<Vec<Self>, ApprovalGateError> {
        let gates = sqlx::query_as::<_, TaskApprovalGate>(
            r#"
            SELECT * FROM task_approval_gates
            WHERE task_id = ?1
            ORDER BY created_at ASC, rowid ASC
            "#,
        )
        .bind(task_id)
        .fetch_all(pool)
        .await?;
        Ok(gates)
    }

    pub async fn find_pending_by_task(
        pool: &SqlitePool,
        task_id: Uuid,
    ) -> Result<Vec<Self>, ApprovalGateError> {
        let gates = sqlx::query_as::<_, TaskApprovalGate>(
            r#"
            SELECT * FROM task_approval_gates
            WHERE task_id = ?1 AND status = 'pending'
            ORDER BY created_at ASC, rowid ASC
            "#,
        )
        .bind(task_id)
        .fetch_all(pool)
        .await?;
        Ok(gates)
    }

    /// Resolution is terminal: only a pending gate can be resolved. Returns
    /// None when the gate was already resolved (or does not exist).
    pub async fn resolve(
        pool: &SqlitePool,
        id: Uuid,
        status: GateStatus,
        resolved_by: Option<&str>,
        review_notes: Option<&str>,
    ) -> Result<Option<Self>, ApprovalGateError> {
        let status = status.to_string();
        let gate = sqlx::query_as::<_, TaskApprovalGate>(
            r#"
            UPDATE task_approval_gates
            SET status = ?2,
                resolved_by = ?3,
                review_notes = ?4,
                resolved_at = datetime('now', 'subsec')
            WHERE id = ?1 AND status = 'pending'
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(status)
        .bind(resolved_by)
        .bind(review_notes)
        .fetch_optional(pool)
        .await?;
        Ok(gate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DBService;
    use crate::models::task::{AutonomyLevel, CreateTask, Task, TaskType};

    async fn seed_task(db: &DBService) -> Task {
        Task::create(
            &db.pool,
            &CreateTask {
                project_id: Uuid::new_v4(),
                parent_task_id: None,
                roadmap_item_id: None,
                title: "gated task".to_string(),
                description: None,
                task_type: TaskType::CodeGeneration,
                agent_type: "developer".to_string(),
                autonomy_level: AutonomyLevel::Supervised,
                priority: 50,
                input: None,
                approval_required: true,
                approval_checkpoint: None,
                max_retries: 3,
            },
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn gate_resolution_is_terminal() {
        let db = DBService::new_in_memory().await.unwrap();
        let task = seed_task(&db).await;

        let gate = TaskApprovalGate::create(
            &db.pool,
            CreateApprovalGate {
                task_id: task.id,
                gate_type: GateType::Manual,
                title: "Pre-execution review".to_string(),
                description: None,
                requires_human_review: true,
                review_data: None,
            },
        )
        .await
        .unwrap();
        assert_eq!(gate.status, GateStatus::Pending);

        let approved = TaskApprovalGate::resolve(
            &db.pool,
            gate.id,
            GateStatus::Approved,
            Some("alice"),
            Some("looks good"),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(approved.status, GateStatus::Approved);
        assert!(approved.resolved_at.is_some());

        // a resolved gate cannot be reopened or re-resolved
        let again =
            TaskApprovalGate::resolve(&db.pool, gate.id, GateStatus::Rejected, Some("bob"), None)
                .await
                .unwrap();
        assert!(again.is_none());

        let stored = TaskApprovalGate::find_by_id(&db.pool, gate.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, GateStatus::Approved);
        assert_eq!(stored.resolved_by.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn pending_filter_excludes_resolved_gates() {
        let db = DBService::new_in_memory().await.unwrap();
        let task = seed_task(&db).await;

        for title in ["first", "second"] {
            TaskApprovalGate::create(
                &db.pool,
                CreateApprovalGate {
                    task_id: task.id,
                    gate_type: GateType::Quality,
                    title: title.to_string(),
                    description: None,
                    requires_human_review: false,
                    review_data: Some(serde_json::json!({ "score": 80 })),
                },
            )
            .await
            .unwrap();
        }

        let pending = TaskApprovalGate::find_pending_by_task(&db.pool, task.id)
            .await
            .unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].title, "first");

        TaskApprovalGate::resolve(&db.pool, pending[0].id, GateStatus::Skipped, None, None)
            .await
            .unwrap()
            .unwrap();

        let remaining = TaskApprovalGate::find_pending_by_task(&db.pool, task.id)
            .await
            .unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].title, "second");
    }
}
