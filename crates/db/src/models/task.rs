use chrono::{DateTime, Utc};
use executors::AgentType;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool, Type};
use strum_macros::EnumString;
use thiserror::Error;
use ts_rs::TS;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum TaskError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("Task not found")]
    NotFound,
}

#[derive(Debug, Clone, Copy, Type, Serialize, Deserialize, PartialEq, Eq, TS, EnumString)]
#[sqlx(type_name = "task_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Queued,
    Running,
    WaitingApproval,
    Completed,
    Failed,
    Cancelled,
    Skipped,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Queued => write!(f, "queued"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::WaitingApproval => write!(f, "waiting_approval"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Cancelled => write!(f, "cancelled"),
            TaskStatus::Skipped => write!(f, "skipped"),
        }
    }
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled | TaskStatus::Skipped
        )
    }

    /// Legal edges of the task state machine. A failed task may re-enter the
    /// queue (retry); every non-terminal state may be cancelled.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match self {
            Pending => matches!(next, Queued | Running | WaitingApproval | Cancelled | Skipped),
            Queued => matches!(next, Running | WaitingApproval | Cancelled | Skipped),
            Running => matches!(next, WaitingApproval | Completed | Failed | Cancelled),
            WaitingApproval => matches!(next, Running | Queued | Completed | Failed | Cancelled),
            Failed => matches!(next, Queued),
            Completed | Cancelled | Skipped => false,
        }
    }
}

#[derive(Debug, Clone, Copy, Type, Serialize, Deserialize, PartialEq, Eq, TS, EnumString)]
#[sqlx(type_name = "task_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TaskType {
    CodeGeneration,
    Testing,
    SecurityAudit,
    Deployment,
    Refactoring,
    BugFix,
    Documentation,
    TechDecision,
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskType::CodeGeneration => write!(f, "code_generation"),
            TaskType::Testing => write!(f, "testing"),
            TaskType::SecurityAudit => write!(f, "security_audit"),
            TaskType::Deployment => write!(f, "deployment"),
            TaskType::Refactoring => write!(f, "refactoring"),
            TaskType::BugFix => write!(f, "bug_fix"),
            TaskType::Documentation => write!(f, "documentation"),
            TaskType::TechDecision => write!(f, "tech_decision"),
        }
    }
}

#[derive(
    Debug, Clone, Copy, Default, Type, Serialize, Deserialize, PartialEq, Eq, TS, EnumString,
)]
#[sqlx(type_name = "autonomy_level", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AutonomyLevel {
    #[default]
    Auto,
    ApprovalGates,
    Supervised,
}

impl std::fmt::Display for AutonomyLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AutonomyLevel::Auto => write!(f, "auto"),
            AutonomyLevel::ApprovalGates => write!(f, "approval_gates"),
            AutonomyLevel::Supervised => write!(f, "supervised"),
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize, TS)]
pub struct Task {
    pub id: Uuid,
    pub project_id: Uuid,
    pub parent_task_id: Option<Uuid>,
    pub roadmap_item_id: Option<Uuid>,
    pub title: String,
    pub description: Option<String>,
    pub task_type: TaskType,
    /// Persona name; validated against [`AgentType`] at enqueue time.
    pub agent_type: String,
    pub autonomy_level: AutonomyLevel,
    /// Lower is more urgent.
    pub priority: i64,
    pub status: TaskStatus,
    pub input: Option<String>,
    pub output: Option<String>,
    pub error_message: Option<String>,
    pub approval_required: bool,
    pub approval_checkpoint: Option<String>,
    pub approved_by: Option<String>,
    pub approved_at: Option<DateTime<Utc>>,
    pub retry_count: i64,
    pub max_retries: i64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize, TS)]
pub struct CreateTask {
    pub project_id: Uuid,
    pub parent_task_id: Option<Uuid>,
    pub roadmap_item_id: Option<Uuid>,
    pub title: String,
    pub description: Option<String>,
    pub task_type: TaskType,
    pub agent_type: String,
    pub autonomy_level: AutonomyLevel,
    pub priority: i64,
    pub input: Option<serde_json::Value>,
    pub approval_required: bool,
    pub approval_checkpoint: Option<String>,
    pub max_retries: i64,
}

impl Task {
    pub fn agent(&self) -> Option<AgentType> {
        self.agent_type.parse().ok()
    }

    pub fn to_prompt(&self) -> String {
        if let Some(description) = &self.description {
            format!("Title: {}\n\nDescription: {}", self.title, description)
        } else {
            self.title.clone()
        }
    }

    pub async fn create(pool: &SqlitePool, data: &CreateTask) -> Result<Self, TaskError> {
        let id = Uuid::new_v4();
        let task_type = data.task_type.to_string();
        let autonomy = data.autonomy_level.to_string();
        let input = data.input.as_ref().map(|v| v.to_string());

        let task = sqlx::query_as::<_, Task>(
            r#"
            INSERT INTO tasks (
                id, project_id, parent_task_id, roadmap_item_id, title, description,
                task_type, agent_type, autonomy_level, priority,
                input, approval_required, approval_checkpoint, max_retries
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(data.project_id)
        .bind(data.parent_task_id)
        .bind(data.roadmap_item_id)
        .bind(&data.title)
        .bind(&data.description)
        .bind(task_type)
        .bind(&data.agent_type)
        .bind(autonomy)
        .bind(data.priority)
        .bind(input)
        .bind(data.approval_required)
        .bind(&data.approval_checkpoint)
        .bind(data.max_retries)
        .fetch_one(pool)
        .await?;

        Ok(task)
    }

    pub async fn find_by_id(pool: &SqlitePool, id: Uuid) -> Result<Option<Self>, TaskError> {
        let task = sqlx::query_as::<_, Task>(r#"SELECT * FROM tasks WHERE id = ?1"#)
            .bind(id)
            .fetch_optional(pool)
            .await?;
        Ok(task)
    }

    /// Tasks for a project, most urgent first; ties broken by creation time,
    /// then insertion order.
    pub async fn find_by_project(
        pool: &SqlitePool,
        project_id: Uuid,
    ) -> Result<Vec<Self>, TaskError> {
        let tasks = sqlx::query_as::<_, Task>(
            r#"
            SELECT * FROM tasks
            WHERE project_id = ?1
            ORDER BY priority ASC, created_at ASC, rowid ASC
            "#,
        )
        .bind(project_id)
        .fetch_all(pool)
        .await?;
        Ok(tasks)
    }

    pub async fn update_status(
        pool: &SqlitePool,
        id: Uuid,
        status: TaskStatus,
    ) -> Result<Option<Self>, TaskError> {
        let status = status.to_string();
        let task = sqlx::query_as::<_, Task>(
            r#"UPDATE tasks SET status = ?2 WHERE id = ?1 RETURNING *"#,
        )
        .bind(id)
        .bind(status)
        .fetch_optional(pool)
        .await?;
        Ok(task)
    }

    pub async fn record_start(pool: &SqlitePool, id: Uuid) -> Result<Option<Self>, TaskError> {
        let task = sqlx::query_as::<_, Task>(
            r#"
            UPDATE tasks
            SET status = 'running',
                started_at = COALESCE(started_at, datetime('now', 'subsec'))
            WHERE id = ?1 AND status IN ('pending', 'queued', 'waiting_approval')
            RETURNING *
            "#,
        )
        .bind(id)
        .fetch_optional(pool)
        .await?;
        Ok(task)
    }

    pub async fn mark_waiting_approval(
        pool: &SqlitePool,
        id: Uuid,
    ) -> Result<Option<Self>, TaskError> {
        let task = sqlx::query_as::<_, Task>(
            r#"
            UPDATE tasks
            SET status = 'waiting_approval'
            WHERE id = ?1 AND status IN ('pending', 'queued', 'running')
            RETURNING *
            "#,
        )
        .bind(id)
        .fetch_optional(pool)
        .await?;
        Ok(task)
    }

    pub async fn record_completion(
        pool: &SqlitePool,
        id: Uuid,
        output: Option<&str>,
    ) -> Result<Option<Self>, TaskError> {
        let task = sqlx::query_as::<_, Task>(
            r#"
            UPDATE tasks
            SET status = 'completed',
                output = COALESCE(?2, output),
                completed_at = datetime('now', 'subsec')
            WHERE id = ?1 AND status IN ('running', 'waiting_approval')
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(output)
        .fetch_optional(pool)
        .await?;
        Ok(task)
    }

    pub async fn record_failure(
        pool: &SqlitePool,
        id: Uuid,
        error: &str,
    ) -> Result<Option<Self>, TaskError> {
        let task = sqlx::query_as::<_, Task>(
            r#"
            UPDATE tasks
            SET status = 'failed',
                error_message = ?2,
                completed_at = datetime('now', 'subsec')
            WHERE id = ?1
              AND status NOT IN ('completed', 'failed', 'cancelled', 'skipped')
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(error)
        .fetch_optional(pool)
        .await?;
        Ok(task)
    }

    /// Put a failing task back in the queue, consuming one retry.
    pub async fn requeue_for_retry(
        pool: &SqlitePool,
        id: Uuid,
        error: &str,
    ) -> Result<Option<Self>, TaskError> {
        let task = sqlx::query_as::<_, Task>(
            r#"
            UPDATE tasks
            SET status = 'queued',
                error_message = ?2,
                retry_count = retry_count + 1
            WHERE id = ?1
              AND status IN ('running', 'waiting_approval', 'failed')
              AND retry_count < max_retries
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(error)
        .fetch_optional(pool)
        .await?;
        Ok(task)
    }

    /// Terminal cancellation. Returns None when the task was already
    /// terminal, making the operation an idempotent no-op for callers.
    pub async fn record_cancellation(
        pool: &SqlitePool,
        id: Uuid,
    ) -> Result<Option<Self>, TaskError> {
        let task = sqlx::query_as::<_, Task>(
            r#"
            UPDATE tasks
            SET status = 'cancelled',
                completed_at = datetime('now', 'subsec')
            WHERE id = ?1
              AND status NOT IN ('completed', 'failed', 'cancelled', 'skipped')
            RETURNING *
            "#,
        )
        .bind(id)
        .fetch_optional(pool)
        .await?;
        Ok(task)
    }

    pub async fn update_autonomy(
        pool: &SqlitePool,
        id: Uuid,
        autonomy_level: AutonomyLevel,
        approval_required: bool,
    ) -> Result<Option<Self>, TaskError> {
        let autonomy = autonomy_level.to_string();
        let task = sqlx::query_as::<_, Task>(
            r#"
            UPDATE tasks
            SET autonomy_level = ?2, approval_required = ?3
            WHERE id = ?1
              AND status NOT IN ('completed', 'failed', 'cancelled', 'skipped')
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(autonomy)
        .bind(approval_required)
        .fetch_optional(pool)
        .await?;
        Ok(task)
    }

    pub async fn record_approval(
        pool: &SqlitePool,
        id: Uuid,
        approved_by: &str,
    ) -> Result<Option<Self>, TaskError> {
        let task = sqlx::query_as::<_, Task>(
            r#"
            UPDATE tasks
            SET approved_by = ?2, approved_at = datetime('now', 'subsec')
            WHERE id = ?1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(approved_by)
        .fetch_optional(pool)
        .await?;
        Ok(task)
    }

    pub async fn set_output(
        pool: &SqlitePool,
        id: Uuid,
        output: &str,
    ) -> Result<Option<Self>, TaskError> {
        let task = sqlx::query_as::<_, Task>(
            r#"UPDATE tasks SET output = ?2 WHERE id = ?1 RETURNING *"#,
        )
        .bind(id)
        .bind(output)
        .fetch_optional(pool)
        .await?;
        Ok(task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DBService;

    fn create_spec(project_id: Uuid, title: &str, priority: i64) -> CreateTask {
        CreateTask {
            project_id,
            parent_task_id: None,
            roadmap_item_id: None,
            title: title.to_string(),
            description: None,
            task_type: TaskType::CodeGeneration,
            agent_type: "developer".to_string(),
            autonomy_level: AutonomyLevel::Auto,
            priority,
            input: None,
            approval_required: false,
            approval_checkpoint: None,
            max_retries: 3,
        }
    }

    #[test]
    fn terminal_states_accept_no_transitions() {
        for terminal in [
            TaskStatus::Completed,
            TaskStatus::Cancelled,
            TaskStatus::Skipped,
        ] {
            assert!(terminal.is_terminal());
            assert!(!terminal.can_transition_to(TaskStatus::Running));
            assert!(!terminal.can_transition_to(TaskStatus::Queued));
        }
        // failed is terminal but may re-enter the queue via retry
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Failed.can_transition_to(TaskStatus::Queued));
        assert!(!TaskStatus::Failed.can_transition_to(TaskStatus::Running));
    }

    #[test]
    fn state_machine_follows_spec_edges() {
        use TaskStatus::*;
        assert!(Pending.can_transition_to(Queued));
        assert!(Queued.can_transition_to(Running));
        assert!(Running.can_transition_to(WaitingApproval));
        assert!(WaitingApproval.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Running));
    }

    #[tokio::test]
    async fn create_applies_defaults_and_round_trips() {
        let db = DBService::new_in_memory().await.unwrap();
        let project_id = Uuid::new_v4();

        let task = Task::create(&db.pool, &create_spec(project_id, "build login", 50))
            .await
            .unwrap();

        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.priority, 50);
        assert_eq!(task.retry_count, 0);
        assert_eq!(task.agent(), Some(AgentType::Developer));
        assert!(task.started_at.is_none());

        let fetched = Task::find_by_id(&db.pool, task.id).await.unwrap().unwrap();
        assert_eq!(fetched.title, "build login");
        assert_eq!(fetched.task_type, TaskType::CodeGeneration);

        let missing = Task::find_by_id(&db.pool, Uuid::new_v4()).await.unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn listing_orders_by_priority_then_insertion() {
        let db = DBService::new_in_memory().await.unwrap();
        let project_id = Uuid::new_v4();

        Task::create(&db.pool, &create_spec(project_id, "later", 80))
            .await
            .unwrap();
        Task::create(&db.pool, &create_spec(project_id, "urgent", 10))
            .await
            .unwrap();
        Task::create(&db.pool, &create_spec(project_id, "tie-a", 50))
            .await
            .unwrap();
        Task::create(&db.pool, &create_spec(project_id, "tie-b", 50))
            .await
            .unwrap();

        let titles: Vec<_> = Task::find_by_project(&db.pool, project_id)
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.title)
            .collect();
        assert_eq!(titles, vec!["urgent", "tie-a", "tie-b", "later"]);
    }

    #[tokio::test]
    async fn cancellation_of_terminal_task_is_noop() {
        let db = DBService::new_in_memory().await.unwrap();
        let task = Task::create(&db.pool, &create_spec(Uuid::new_v4(), "t", 50))
            .await
            .unwrap();

        let cancelled = Task::record_cancellation(&db.pool, task.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cancelled.status, TaskStatus::Cancelled);

        // second cancel: no row matches the guard
        let again = Task::record_cancellation(&db.pool, task.id).await.unwrap();
        assert!(again.is_none());

        let stored = Task::find_by_id(&db.pool, task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn retry_consumes_attempts_until_cap() {
        let db = DBService::new_in_memory().await.unwrap();
        let mut spec = create_spec(Uuid::new_v4(), "flaky", 50);
        spec.max_retries = 2;
        let task = Task::create(&db.pool, &spec).await.unwrap();

        Task::record_start(&db.pool, task.id).await.unwrap();
        let retried = Task::requeue_for_retry(&db.pool, task.id, "boom")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(retried.status, TaskStatus::Queued);
        assert_eq!(retried.retry_count, 1);

        Task::record_start(&db.pool, task.id).await.unwrap();
        Task::requeue_for_retry(&db.pool, task.id, "boom").await.unwrap().unwrap();

        // cap reached: the guard refuses a third retry
        Task::record_start(&db.pool, task.id).await.unwrap();
        let exhausted = Task::requeue_for_retry(&db.pool, task.id, "boom").await.unwrap();
        assert!(exhausted.is_none());
    }
}
