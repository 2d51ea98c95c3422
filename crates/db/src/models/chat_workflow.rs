use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool, Type};
use thiserror::Error;
use ts_rs::TS;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ChatWorkflowError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("Workflow not found")]
    NotFound,
}

#[derive(Debug, Clone, Copy, Type, Serialize, Deserialize, PartialEq, Eq, TS)]
#[sqlx(type_name = "workflow_type", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum WorkflowType {
    Sequential,
    Parallel,
}

impl std::fmt::Display for WorkflowType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkflowType::Sequential => write!(f, "sequential"),
            WorkflowType::Parallel => write!(f, "parallel"),
        }
    }
}

#[derive(Debug, Clone, Copy, Type, Serialize, Deserialize, PartialEq, Eq, TS)]
#[sqlx(type_name = "chat_workflow_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ChatWorkflowStatus {
    Parsing,
    Confirming,
    Running,
    Paused,
    Completed,
    Failed,
}

impl std::fmt::Display for ChatWorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChatWorkflowStatus::Parsing => write!(f, "parsing"),
            ChatWorkflowStatus::Confirming => write!(f, "confirming"),
            ChatWorkflowStatus::Running => write!(f, "running"),
            ChatWorkflowStatus::Paused => write!(f, "paused"),
            ChatWorkflowStatus::Completed => write!(f, "completed"),
            ChatWorkflowStatus::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, Copy, Type, Serialize, Deserialize, PartialEq, Eq, TS)]
#[sqlx(type_name = "step_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepStatus::Pending => write!(f, "pending"),
            StepStatus::Running => write!(f, "running"),
            StepStatus::Completed => write!(f, "completed"),
            StepStatus::Failed => write!(f, "failed"),
        }
    }
}

/// One planned step of a parsed workflow, stored as JSON on the request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
pub struct PlannedWorkflowTask {
    pub agent: String,
    pub instruction: String,
    /// Indices of the steps this one depends on. In a sequential workflow
    /// step i > 0 depends on step i - 1; parallel steps carry no dependencies.
    pub depends_on: Vec<usize>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize, TS)]
pub struct ChatWorkflowRequest {
    pub id: Uuid,
    pub project_id: Uuid,
    pub session_id: String,
    pub message: String,
    pub workflow_type: WorkflowType,
    /// JSON array of [`PlannedWorkflowTask`].
    pub tasks: String,
    pub input_context: Option<String>,
    pub status: ChatWorkflowStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize, TS)]
pub struct CreateChatWorkflow {
    pub project_id: Uuid,
    pub session_id: String,
    pub message: String,
    pub workflow_type: WorkflowType,
    pub tasks: Vec<PlannedWorkflowTask>,
    pub input_context: Option<String>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize, TS)]
pub struct WorkflowStepResult {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub step_index: i64,
    pub agent: String,
    pub instruction: String,
    pub output: String,
    pub status: StepStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ChatWorkflowRequest {
    pub fn planned_tasks(&self) -> Vec<PlannedWorkflowTask> {
        serde_json::from_str(&self.tasks).unwrap_or_default()
    }

    pub async fn create(
        pool: &SqlitePool,
        data: &CreateChatWorkflow,
    ) -> Result<Self, ChatWorkflowError> {
        let id = Uuid::new_v4();
        let workflow_type = data.workflow_type.to_string();
        let tasks = serde_json::to_string(&data.tasks).unwrap_or_else(|_| "[]".to_string());

        let request = sqlx::query_as::<_, ChatWorkflowRequest>(
            r#"
            INSERT INTO chat_workflow_requests (
                id, project_id, session_id, message, workflow_type,
                tasks, input_context, status
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'confirming')
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(data.project_id)
        .bind(&data.session_id)
        .bind(&data.message)
        .bind(workflow_type)
        .bind(tasks)
        .bind(&data.input_context)
        .fetch_one(pool)
        .await?;

        Ok(request)
    }

    pub async fn find_by_id(
        pool: &SqlitePool,
        id: Uuid,
    ) -> Result<Option<Self>, ChatWorkflowError> {
        let request = sqlx::query_as::<_, ChatWorkflowRequest>(
            r#"SELECT * FROM chat_workflow_requests WHERE id = ?1"#,
        )
        .bind(id)
        .fetch_optional(pool)
        .await?;
        Ok(request)
    }

    pub async fn find_by_project(
        pool: &SqlitePool,
        project_id: Uuid,
    ) -> Result<Vec<Self>, ChatWorkflowError> {
        let requests = sqlx::query_as::<_, ChatWorkflowRequest>(
            r#"
            SELECT * FROM chat_workflow_requests
            WHERE project_id = ?1
            ORDER BY created_at ASC, rowid ASC
            "#,
        )
        .bind(project_id)
        .fetch_all(pool)
        .await?;
        Ok(requests)
    }

    /// Claim the workflow for execution. Succeeds only from `confirming` or
    /// `paused`, which makes a concurrent duplicate start lose the race.
    pub async fn claim_for_running(
        pool: &SqlitePool,
        id: Uuid,
    ) -> Result<Option<Self>, ChatWorkflowError> {
        let request = sqlx::query_as::<_, ChatWorkflowRequest>(
            r#"
            UPDATE chat_workflow_requests
            SET status = 'running', updated_at = datetime('now', 'subsec')
            WHERE id = ?1 AND status IN ('confirming', 'paused')
            RETURNING *
            "#,
        )
        .bind(id)
        .fetch_optional(pool)
        .await?;
        Ok(request)
    }

    pub async fn set_status(
        pool: &SqlitePool,
        id: Uuid,
        status: ChatWorkflowStatus,
    ) -> Result<Option<Self>, ChatWorkflowError> {
        let status = status.to_string();
        let request = sqlx::query_as::<_, ChatWorkflowRequest>(
            r#"
            UPDATE chat_workflow_requests
            SET status = ?2, updated_at = datetime('now', 'subsec')
            WHERE id = ?1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(status)
        .fetch_optional(pool)
        .await?;
        Ok(request)
    }

    /// Conclude a run. Guarded so only one of two racing finishers (engine vs
    /// cancel) records the terminal state.
    pub async fn conclude(
        pool: &SqlitePool,
        id: Uuid,
        status: ChatWorkflowStatus,
    ) -> Result<Option<Self>, ChatWorkflowError> {
        let status = status.to_string();
        let request = sqlx::query_as::<_, ChatWorkflowRequest>(
            r#"
            UPDATE chat_workflow_requests
            SET status = ?2,
                updated_at = datetime('now', 'subsec'),
                completed_at = datetime('now', 'subsec')
            WHERE id = ?1 AND status NOT IN ('completed', 'failed')
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(status)
        .fetch_optional(pool)
        .await?;
        Ok(request)
    }
}

impl WorkflowStepResult {
    pub async fn create(
        pool: &SqlitePool,
        workflow_id: Uuid,
        step_index: i64,
        agent: &str,
        instruction: &str,
    ) -> Result<Self, ChatWorkflowError> {
        let id = Uuid::new_v4();
        let step = sqlx::query_as::<_, WorkflowStepResult>(
            r#"
            INSERT INTO workflow_step_results (id, workflow_id, step_index, agent, instruction)
            VALUES (?1, ?2, ?3, ?4, ?5)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(workflow_id)
        .bind(step_index)
        .bind(agent)
        .bind(instruction)
        .fetch_one(pool)
        .await?;
        Ok(step)
    }

    pub async fn find_by_workflow(
        pool: &SqlitePool,
        workflow_id: Uuid,
    ) -> Result<Vec<Self>, ChatWorkflowError> {
        let steps = sqlx::query_as::<_, WorkflowStepResult>(
            r#"
            SELECT * FROM workflow_step_results
            WHERE workflow_id = ?1
            ORDER BY step_index ASC
            "#,
        )
        .bind(workflow_id)
        .fetch_all(pool)
        .await?;
        Ok(steps)
    }

    pub async fn mark_running(pool: &SqlitePool, id: Uuid) -> Result<Option<Self>, ChatWorkflowError> {
        let step = sqlx::query_as::<_, WorkflowStepResult>(
            r#"
            UPDATE workflow_step_results
            SET status = 'running',
                started_at = datetime('now', 'subsec')
            WHERE id = ?1 AND status = 'pending'
            RETURNING *
            "#,
        )
        .bind(id)
        .fetch_optional(pool)
        .await?;
        Ok(step)
    }

    pub async fn append_output(
        pool: &SqlitePool,
        id: Uuid,
        chunk: &str,
    ) -> Result<(), ChatWorkflowError> {
        sqlx::query(r#"UPDATE workflow_step_results SET output = output || ?2 WHERE id = ?1"#)
            .bind(id)
            .bind(chunk)
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn mark_completed(
        pool: &SqlitePool,
        id: Uuid,
    ) -> Result<Option<Self>, ChatWorkflowError> {
        let step = sqlx::query_as::<_, WorkflowStepResult>(
            r#"
            UPDATE workflow_step_results
            SET status = 'completed',
                completed_at = datetime('now', 'subsec')
            WHERE id = ?1 AND status = 'running'
            RETURNING *
            "#,
        )
        .bind(id)
        .fetch_optional(pool)
        .await?;
        Ok(step)
    }

    pub async fn mark_failed(
        pool: &SqlitePool,
        id: Uuid,
        error: Option<&str>,
    ) -> Result<Option<Self>, ChatWorkflowError> {
        let step = sqlx::query_as::<_, WorkflowStepResult>(
            r#"
            UPDATE workflow_step_results
            SET status = 'failed',
                output = CASE WHEN ?2 IS NULL THEN output ELSE output || ?2 END,
                completed_at = datetime('now', 'subsec')
            WHERE id = ?1 AND status IN ('pending', 'running')
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(error)
        .fetch_optional(pool)
        .await?;
        Ok(step)
    }

    /// Used when a pause interrupts a step mid-turn: the partial output is
    /// discarded and the step runs again on resume.
    pub async fn reset_to_pending(
        pool: &SqlitePool,
        id: Uuid,
    ) -> Result<Option<Self>, ChatWorkflowError> {
        let step = sqlx::query_as::<_, WorkflowStepResult>(
            r#"
            UPDATE workflow_step_results
            SET status = 'pending',
                output = '',
                started_at = NULL
            WHERE id = ?1 AND status = 'running'
            RETURNING *
            "#,
        )
        .bind(id)
        .fetch_optional(pool)
        .await?;
        Ok(step)
    }
}
