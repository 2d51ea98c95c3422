//! Task Queue Service
//!
//! Owns the task lifecycle: enqueue with autonomy-derived approval
//! bookkeeping, priority-ordered listing, the status state machine, approval
//! gate creation and resolution, and cancellation of in-flight work.

use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use db::{
    DBService,
    models::{
        approval_gate::{
            ApprovalGateError, CreateApprovalGate, GateStatus, GateType, TaskApprovalGate,
        },
        task::{AutonomyLevel, CreateTask, Task, TaskError, TaskStatus, TaskType},
    },
};
use executors::AgentType;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use ts_rs::TS;
use uuid::Uuid;

use super::events::{OrchestratorBus, OrchestratorEvent};

#[derive(Debug, Error)]
pub enum TaskQueueError {
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Task not found")]
    TaskNotFound,
    #[error("Approval gate not found")]
    GateNotFound,
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error(transparent)]
    Task(#[from] TaskError),
    #[error(transparent)]
    Gate(#[from] ApprovalGateError),
}

/// Enqueue request as it arrives over the command surface. Enum-valued
/// fields are strings here and validated before any state is mutated.
#[derive(Debug, Clone, Deserialize, TS)]
pub struct EnqueueTask {
    pub project_id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub parent_task_id: Option<Uuid>,
    pub roadmap_item_id: Option<Uuid>,
    pub task_type: String,
    pub agent_type: String,
    pub autonomy_level: Option<String>,
    pub priority: Option<i64>,
    pub input: Option<Value>,
    pub approval_checkpoint: Option<String>,
    pub max_retries: Option<i64>,
}

impl EnqueueTask {
    pub fn new(
        project_id: Uuid,
        title: impl Into<String>,
        task_type: TaskType,
        agent_type: AgentType,
    ) -> Self {
        Self {
            project_id,
            title: title.into(),
            description: None,
            parent_task_id: None,
            roadmap_item_id: None,
            task_type: task_type.to_string(),
            agent_type: agent_type.to_string(),
            autonomy_level: None,
            priority: None,
            input: None,
            approval_checkpoint: None,
            max_retries: None,
        }
    }

    pub fn with_autonomy(mut self, level: AutonomyLevel) -> Self {
        self.autonomy_level = Some(level.to_string());
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_checkpoint(mut self, checkpoint: impl Into<String>) -> Self {
        self.approval_checkpoint = Some(checkpoint.into());
        self
    }
}

/// Outcome of asking the queue to start a task.
#[derive(Debug, Clone)]
pub enum StartOutcome {
    Started(Task),
    /// The task parked in `waiting_approval` behind the returned gate.
    AwaitingApproval { task: Task, gate: TaskApprovalGate },
}

/// Outcome of concluding a running task successfully.
#[derive(Debug, Clone)]
pub enum CompletionOutcome {
    Completed(Task),
    AwaitingApproval { task: Task, gate: TaskApprovalGate },
}

/// Outcome of a task failure.
#[derive(Debug, Clone)]
pub enum FailureDisposition {
    /// A retry was available; the task is back in the queue.
    Retried(Task),
    Failed(Task),
}

pub(crate) const DEFAULT_PRIORITY: i64 = 50;
pub(crate) const DEFAULT_MAX_RETRIES: i64 = 3;

/// Whether a task must block on a human given its autonomy level.
pub fn derive_approval_required(level: AutonomyLevel, checkpoint: Option<&str>) -> bool {
    match level {
        AutonomyLevel::Supervised => true,
        AutonomyLevel::ApprovalGates => checkpoint.is_some(),
        AutonomyLevel::Auto => false,
    }
}

#[derive(Clone)]
pub struct TaskQueueService {
    db: DBService,
    events: OrchestratorBus,
    /// Serializes status writes per task id so two callers cannot conclude
    /// the same task twice.
    task_locks: Arc<DashMap<Uuid, Arc<Mutex<()>>>>,
    /// Cancellation tokens for in-flight agent runs, keyed by task id.
    cancellations: Arc<DashMap<Uuid, CancellationToken>>,
    paused: Arc<AtomicBool>,
}

impl TaskQueueService {
    pub fn new(db: DBService, events: OrchestratorBus) -> Self {
        Self {
            db,
            events,
            task_locks: Arc::new(DashMap::new()),
            cancellations: Arc::new(DashMap::new()),
            paused: Arc::new(AtomicBool::new(false)),
        }
    }

    fn lock_for(&self, task_id: Uuid) -> Arc<Mutex<()>> {
        let entry = self
            .task_locks
            .entry(task_id)
            .or_insert_with(|| Arc::new(Mutex::new(())));
        Arc::clone(entry.value())
    }

    // ========== Enqueue / read ==========

    pub async fn enqueue(&self, data: EnqueueTask) -> Result<Task, TaskQueueError> {
        if data.title.trim().is_empty() {
            return Err(TaskQueueError::Validation("Title must not be empty".into()));
        }
        let task_type = TaskType::from_str(&data.task_type)
            .map_err(|_| TaskQueueError::Validation(format!("Unknown task type: {}", data.task_type)))?;
        let agent = AgentType::from_str(&data.agent_type).map_err(|_| {
            TaskQueueError::Validation(format!("Unknown agent type: {}", data.agent_type))
        })?;
        let autonomy_level = match &data.autonomy_level {
            Some(level) => AutonomyLevel::from_str(level).map_err(|_| {
                TaskQueueError::Validation(format!("Unknown autonomy level: {level}"))
            })?,
            None => AutonomyLevel::default(),
        };

        let approval_required =
            derive_approval_required(autonomy_level, data.approval_checkpoint.as_deref());

        let task = Task::create(
            &self.db.pool,
            &CreateTask {
                project_id: data.project_id,
                parent_task_id: data.parent_task_id,
                roadmap_item_id: data.roadmap_item_id,
                title: data.title,
                description: data.description,
                task_type,
                agent_type: agent.to_string(),
                autonomy_level,
                priority: data.priority.unwrap_or(DEFAULT_PRIORITY),
                input: data.input,
                approval_required,
                approval_checkpoint: data.approval_checkpoint,
                max_retries: data.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            },
        )
        .await?;

        info!(task_id = %task.id, project_id = %task.project_id, agent = %task.agent_type, "task enqueued");
        self.events.emit(&OrchestratorEvent::TaskQueued { task: task.clone() });
        Ok(task)
    }

    /// Tasks for a project, most urgent first.
    pub async fn list_tasks(&self, project_id: Uuid) -> Result<Vec<Task>, TaskQueueError> {
        Ok(Task::find_by_project(&self.db.pool, project_id).await?)
    }

    /// Never errors on an unknown id.
    pub async fn get_task(&self, id: Uuid) -> Result<Option<Task>, TaskQueueError> {
        Ok(Task::find_by_id(&self.db.pool, id).await?)
    }

    pub async fn get_approvals(
        &self,
        task_id: Uuid,
    ) -> Result<Vec<TaskApprovalGate>, TaskQueueError> {
        Ok(TaskApprovalGate::find_by_task(&self.db.pool, task_id).await?)
    }

    // ========== Autonomy / cancellation ==========

    /// Change the autonomy level of a non-terminal task and recompute its
    /// approval flag. Gates already created stay as they are.
    pub async fn update_autonomy(
        &self,
        task_id: Uuid,
        level: AutonomyLevel,
    ) -> Result<Task, TaskQueueError> {
        let lock = self.lock_for(task_id);
        let _guard = lock.lock().await;

        let task = Task::find_by_id(&self.db.pool, task_id)
            .await?
            .ok_or(TaskQueueError::TaskNotFound)?;
        if task.status.is_terminal() {
            return Err(TaskQueueError::InvalidState(format!(
                "Task is already {}",
                task.status
            )));
        }

        let approval_required =
            derive_approval_required(level, task.approval_checkpoint.as_deref());
        let updated = Task::update_autonomy(&self.db.pool, task_id, level, approval_required)
            .await?
            .ok_or(TaskQueueError::TaskNotFound)?;

        info!(task_id = %task_id, autonomy = %level, "autonomy level updated");
        Ok(updated)
    }

    /// Cancel a task from any non-terminal state. Returns false (and leaves
    /// the task untouched) when it is already terminal.
    pub async fn cancel(&self, task_id: Uuid) -> Result<bool, TaskQueueError> {
        let lock = self.lock_for(task_id);
        let _guard = lock.lock().await;

        if Task::find_by_id(&self.db.pool, task_id).await?.is_none() {
            return Err(TaskQueueError::TaskNotFound);
        }

        match Task::record_cancellation(&self.db.pool, task_id).await? {
            Some(task) => {
                if let Some((_, token)) = self.cancellations.remove(&task_id) {
                    token.cancel();
                }
                info!(task_id = %task_id, "task cancelled");
                self.events.emit(&OrchestratorEvent::TaskCancelled { task });
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Register the cancellation token guarding an in-flight run for `cancel`
    /// to trip.
    pub fn track_cancellation(&self, task_id: Uuid, token: CancellationToken) {
        self.cancellations.insert(task_id, token);
    }

    pub fn clear_cancellation(&self, task_id: Uuid) {
        self.cancellations.remove(&task_id);
    }

    // ========== State machine ==========

    /// Move a task toward execution. Supervised tasks that have not yet been
    /// cleared by a human park behind a pre-execution gate instead.
    pub async fn start_task(&self, task_id: Uuid) -> Result<StartOutcome, TaskQueueError> {
        let lock = self.lock_for(task_id);
        let _guard = lock.lock().await;

        let task = Task::find_by_id(&self.db.pool, task_id)
            .await?
            .ok_or(TaskQueueError::TaskNotFound)?;
        if !matches!(task.status, TaskStatus::Pending | TaskStatus::Queued) {
            return Err(TaskQueueError::InvalidState(format!(
                "Task cannot start from {}",
                task.status
            )));
        }

        if task.autonomy_level == AutonomyLevel::Supervised {
            let gates = TaskApprovalGate::find_by_task(&self.db.pool, task_id).await?;
            let cleared = gates.iter().any(|g| {
                g.gate_type.resumes_execution() && g.status == GateStatus::Approved
            });
            if !cleared {
                return self
                    .park_behind_gate(
                        task_id,
                        CreateApprovalGate {
                            task_id,
                            gate_type: GateType::Manual,
                            title: "Pre-execution review".to_string(),
                            description: Some(
                                "Supervised task requires approval before it may start".to_string(),
                            ),
                            requires_human_review: true,
                            review_data: None,
                        },
                    )
                    .await
                    .map(|(task, gate)| StartOutcome::AwaitingApproval { task, gate });
            }
        }

        let task = Task::record_start(&self.db.pool, task_id)
            .await?
            .ok_or_else(|| TaskQueueError::InvalidState("Task cannot start".to_string()))?;
        info!(task_id = %task_id, "task started");
        self.events.emit(&OrchestratorEvent::TaskStarted { task: task.clone() });
        Ok(StartOutcome::Started(task))
    }

    /// Attach a gate to a task and park it in `waiting_approval`.
    pub async fn request_approval(
        &self,
        gate: CreateApprovalGate,
    ) -> Result<(Task, TaskApprovalGate), TaskQueueError> {
        let task_id = gate.task_id;
        let lock = self.lock_for(task_id);
        let _guard = lock.lock().await;

        let task = Task::find_by_id(&self.db.pool, task_id)
            .await?
            .ok_or(TaskQueueError::TaskNotFound)?;
        if task.status.is_terminal() {
            return Err(TaskQueueError::InvalidState(format!(
                "Task is already {}",
                task.status
            )));
        }

        self.park_behind_gate(task_id, gate).await
    }

    async fn park_behind_gate(
        &self,
        task_id: Uuid,
        gate: CreateApprovalGate,
    ) -> Result<(Task, TaskApprovalGate), TaskQueueError> {
        let gate = TaskApprovalGate::create(&self.db.pool, gate).await?;
        let task = Task::mark_waiting_approval(&self.db.pool, task_id)
            .await?
            .or(Task::find_by_id(&self.db.pool, task_id).await?)
            .ok_or(TaskQueueError::TaskNotFound)?;

        info!(task_id = %task_id, gate_id = %gate.id, gate_type = %gate.gate_type, "approval required");
        self.events.emit(&OrchestratorEvent::TaskApprovalRequired {
            task: task.clone(),
            gate_id: gate.id,
        });
        Ok((task, gate))
    }

    /// Conclude a running task. Supervised tasks and tasks with a declared
    /// checkpoint go through one more review gate before `completed`.
    pub async fn complete_task(
        &self,
        task_id: Uuid,
        output: Option<&str>,
    ) -> Result<CompletionOutcome, TaskQueueError> {
        let lock = self.lock_for(task_id);
        let _guard = lock.lock().await;

        let task = Task::find_by_id(&self.db.pool, task_id)
            .await?
            .ok_or(TaskQueueError::TaskNotFound)?;
        if task.status != TaskStatus::Running {
            return Err(TaskQueueError::InvalidState(format!(
                "Task cannot complete from {}",
                task.status
            )));
        }

        let review_gate = match task.autonomy_level {
            AutonomyLevel::Supervised => Some(CreateApprovalGate {
                task_id,
                gate_type: GateType::Review,
                title: "Completion review".to_string(),
                description: Some("Supervised task output requires sign-off".to_string()),
                requires_human_review: true,
                review_data: output.map(|o| serde_json::json!({ "output": o })),
            }),
            AutonomyLevel::ApprovalGates => {
                task.approval_checkpoint.as_ref().map(|checkpoint| CreateApprovalGate {
                    task_id,
                    gate_type: GateType::Quality,
                    title: checkpoint.clone(),
                    description: None,
                    requires_human_review: false,
                    review_data: output.map(|o| serde_json::json!({ "output": o })),
                })
            }
            AutonomyLevel::Auto => None,
        };

        match review_gate {
            Some(gate) => {
                if let Some(output) = output {
                    Task::set_output(&self.db.pool, task_id, output).await?;
                }
                self.park_behind_gate(task_id, gate)
                    .await
                    .map(|(task, gate)| CompletionOutcome::AwaitingApproval { task, gate })
            }
            None => {
                let task = Task::record_completion(&self.db.pool, task_id, output)
                    .await?
                    .ok_or_else(|| {
                        TaskQueueError::InvalidState("Task cannot complete".to_string())
                    })?;
                self.clear_cancellation(task_id);
                info!(task_id = %task_id, "task completed");
                self.events.emit(&OrchestratorEvent::TaskCompleted { task: task.clone() });
                Ok(CompletionOutcome::Completed(task))
            }
        }
    }

    /// Record a failure, consuming a retry when one is available.
    pub async fn fail_task(
        &self,
        task_id: Uuid,
        error: &str,
    ) -> Result<FailureDisposition, TaskQueueError> {
        let lock = self.lock_for(task_id);
        let _guard = lock.lock().await;

        if Task::find_by_id(&self.db.pool, task_id).await?.is_none() {
            return Err(TaskQueueError::TaskNotFound);
        }
        self.clear_cancellation(task_id);

        if let Some(task) = Task::requeue_for_retry(&self.db.pool, task_id, error).await? {
            warn!(task_id = %task_id, retry = task.retry_count, error, "task failed, retrying");
            self.events.emit(&OrchestratorEvent::TaskQueued { task: task.clone() });
            return Ok(FailureDisposition::Retried(task));
        }

        let task = Task::record_failure(&self.db.pool, task_id, error)
            .await?
            .or(Task::find_by_id(&self.db.pool, task_id).await?)
            .ok_or(TaskQueueError::TaskNotFound)?;
        warn!(task_id = %task_id, error, "task failed");
        self.events.emit(&OrchestratorEvent::TaskFailed {
            task: task.clone(),
            error: error.to_string(),
        });
        Ok(FailureDisposition::Failed(task))
    }

    pub fn emit_progress(&self, task_id: Uuid, chunk: &str) {
        self.events.emit(&OrchestratorEvent::TaskProgress {
            task_id,
            chunk: chunk.to_string(),
        });
    }

    // ========== Gate resolution ==========

    /// Approve a pending gate. Start-guarding gates send the task back to
    /// the queue; review gates conclude it.
    pub async fn approve_gate(
        &self,
        gate_id: Uuid,
        approved_by: &str,
        notes: Option<&str>,
    ) -> Result<Task, TaskQueueError> {
        let gate = TaskApprovalGate::find_by_id(&self.db.pool, gate_id)
            .await?
            .ok_or(TaskQueueError::GateNotFound)?;
        let lock = self.lock_for(gate.task_id);
        let _guard = lock.lock().await;

        let gate = TaskApprovalGate::resolve(
            &self.db.pool,
            gate_id,
            GateStatus::Approved,
            Some(approved_by),
            notes,
        )
        .await?
        .ok_or_else(|| {
            TaskQueueError::InvalidState("Approval gate is already resolved".to_string())
        })?;

        Task::record_approval(&self.db.pool, gate.task_id, approved_by).await?;
        info!(task_id = %gate.task_id, gate_id = %gate_id, approver = approved_by, "gate approved");

        if gate.gate_type.resumes_execution() {
            let task = Task::update_status(&self.db.pool, gate.task_id, TaskStatus::Queued)
                .await?
                .ok_or(TaskQueueError::TaskNotFound)?;
            self.events.emit(&OrchestratorEvent::TaskQueued { task: task.clone() });
            Ok(task)
        } else {
            let task = Task::record_completion(&self.db.pool, gate.task_id, None)
                .await?
                .or(Task::find_by_id(&self.db.pool, gate.task_id).await?)
                .ok_or(TaskQueueError::TaskNotFound)?;
            self.clear_cancellation(gate.task_id);
            self.events.emit(&OrchestratorEvent::TaskCompleted { task: task.clone() });
            Ok(task)
        }
    }

    /// Reject a pending gate; the owning task fails with the rejection
    /// reason as its error message.
    pub async fn reject_gate(
        &self,
        gate_id: Uuid,
        rejected_by: &str,
        reason: &str,
    ) -> Result<Task, TaskQueueError> {
        let gate = TaskApprovalGate::find_by_id(&self.db.pool, gate_id)
            .await?
            .ok_or(TaskQueueError::GateNotFound)?;
        let lock = self.lock_for(gate.task_id);
        let _guard = lock.lock().await;

        let gate = TaskApprovalGate::resolve(
            &self.db.pool,
            gate_id,
            GateStatus::Rejected,
            Some(rejected_by),
            Some(reason),
        )
        .await?
        .ok_or_else(|| {
            TaskQueueError::InvalidState("Approval gate is already resolved".to_string())
        })?;

        self.clear_cancellation(gate.task_id);
        let task = Task::record_failure(&self.db.pool, gate.task_id, reason)
            .await?
            .or(Task::find_by_id(&self.db.pool, gate.task_id).await?)
            .ok_or(TaskQueueError::TaskNotFound)?;
        warn!(task_id = %gate.task_id, gate_id = %gate_id, reason, "gate rejected");
        self.events.emit(&OrchestratorEvent::TaskFailed {
            task: task.clone(),
            error: reason.to_string(),
        });
        Ok(task)
    }

    /// Skip a pending gate (e.g. after an autonomy downgrade). When no other
    /// pending gate remains, a waiting task re-enters the queue.
    pub async fn skip_gate(&self, gate_id: Uuid) -> Result<TaskApprovalGate, TaskQueueError> {
        let gate = TaskApprovalGate::find_by_id(&self.db.pool, gate_id)
            .await?
            .ok_or(TaskQueueError::GateNotFound)?;
        let lock = self.lock_for(gate.task_id);
        let _guard = lock.lock().await;

        let gate = TaskApprovalGate::resolve(&self.db.pool, gate_id, GateStatus::Skipped, None, None)
            .await?
            .ok_or_else(|| {
                TaskQueueError::InvalidState("Approval gate is already resolved".to_string())
            })?;

        let remaining = TaskApprovalGate::find_pending_by_task(&self.db.pool, gate.task_id).await?;
        if remaining.is_empty() {
            if let Some(task) = Task::find_by_id(&self.db.pool, gate.task_id).await? {
                if task.status == TaskStatus::WaitingApproval {
                    if let Some(task) =
                        Task::update_status(&self.db.pool, gate.task_id, TaskStatus::Queued).await?
                    {
                        self.events.emit(&OrchestratorEvent::TaskQueued { task });
                    }
                }
            }
        }
        Ok(gate)
    }

    // ========== Queue-level dispatch control ==========

    pub fn pause(&self) {
        if !self.paused.swap(true, Ordering::SeqCst) {
            info!("task queue paused");
            self.events.emit(&OrchestratorEvent::QueuePaused);
        }
    }

    pub fn resume_queue(&self) {
        if self.paused.swap(false, Ordering::SeqCst) {
            info!("task queue resumed");
            self.events.emit(&OrchestratorEvent::QueueResumed);
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use super::*;

    async fn queue_with_bus() -> (TaskQueueService, OrchestratorBus) {
        let db = DBService::new_in_memory().await.unwrap();
        let bus = OrchestratorBus::new();
        (TaskQueueService::new(db, bus.clone()), bus)
    }

    fn record_events(bus: &OrchestratorBus) -> Arc<StdMutex<Vec<String>>> {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        bus.subscribe(move |event: &OrchestratorEvent| {
            sink.lock().unwrap().push(event.name().to_string());
        });
        seen
    }

    #[tokio::test]
    async fn enqueue_rejects_unknown_enum_values() {
        let (queue, _) = queue_with_bus().await;
        let project_id = Uuid::new_v4();

        let mut spec = EnqueueTask::new(
            project_id,
            "task",
            TaskType::CodeGeneration,
            AgentType::Developer,
        );
        spec.task_type = "world_domination".to_string();
        assert!(matches!(
            queue.enqueue(spec).await,
            Err(TaskQueueError::Validation(_))
        ));

        let mut spec = EnqueueTask::new(
            project_id,
            "task",
            TaskType::CodeGeneration,
            AgentType::Developer,
        );
        spec.agent_type = "intern".to_string();
        assert!(matches!(
            queue.enqueue(spec).await,
            Err(TaskQueueError::Validation(_))
        ));

        // nothing was persisted
        assert!(queue.list_tasks(project_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn approval_required_tracks_autonomy_level() {
        let (queue, _) = queue_with_bus().await;
        let project_id = Uuid::new_v4();

        let auto = queue
            .enqueue(EnqueueTask::new(
                project_id,
                "auto task",
                TaskType::CodeGeneration,
                AgentType::Developer,
            ))
            .await
            .unwrap();
        assert_eq!(auto.autonomy_level, AutonomyLevel::Auto);
        assert!(!auto.approval_required);
        assert_eq!(auto.priority, DEFAULT_PRIORITY);

        let supervised = queue
            .enqueue(
                EnqueueTask::new(
                    project_id,
                    "supervised task",
                    TaskType::Deployment,
                    AgentType::Devops,
                )
                .with_autonomy(AutonomyLevel::Supervised),
            )
            .await
            .unwrap();
        assert!(supervised.approval_required);

        // approval_gates without a declared checkpoint does not block
        let gates = queue
            .enqueue(
                EnqueueTask::new(
                    project_id,
                    "gated task",
                    TaskType::Testing,
                    AgentType::Tester,
                )
                .with_autonomy(AutonomyLevel::ApprovalGates),
            )
            .await
            .unwrap();
        assert!(!gates.approval_required);

        let with_checkpoint = queue
            .enqueue(
                EnqueueTask::new(
                    project_id,
                    "checkpointed task",
                    TaskType::Testing,
                    AgentType::Tester,
                )
                .with_autonomy(AutonomyLevel::ApprovalGates)
                .with_checkpoint("test plan sign-off"),
            )
            .await
            .unwrap();
        assert!(with_checkpoint.approval_required);
    }

    #[tokio::test]
    async fn update_autonomy_round_trips_and_rejects_terminal() {
        let (queue, _) = queue_with_bus().await;
        let task = queue
            .enqueue(EnqueueTask::new(
                Uuid::new_v4(),
                "task",
                TaskType::CodeGeneration,
                AgentType::Developer,
            ))
            .await
            .unwrap();
        assert_eq!(task.autonomy_level, AutonomyLevel::Auto);

        queue
            .update_autonomy(task.id, AutonomyLevel::Supervised)
            .await
            .unwrap();
        let fetched = queue.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(fetched.autonomy_level, AutonomyLevel::Supervised);
        assert!(fetched.approval_required);

        queue.cancel(task.id).await.unwrap();
        assert!(matches!(
            queue.update_autonomy(task.id, AutonomyLevel::Auto).await,
            Err(TaskQueueError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn cancel_is_idempotent_and_trips_inflight_token() {
        let (queue, bus) = queue_with_bus().await;
        let events = record_events(&bus);
        let task = queue
            .enqueue(EnqueueTask::new(
                Uuid::new_v4(),
                "task",
                TaskType::CodeGeneration,
                AgentType::Developer,
            ))
            .await
            .unwrap();

        let token = CancellationToken::new();
        queue.track_cancellation(task.id, token.clone());

        assert!(queue.cancel(task.id).await.unwrap());
        assert!(token.is_cancelled());
        assert!(!queue.cancel(task.id).await.unwrap());

        let stored = queue.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Cancelled);
        assert_eq!(
            events
                .lock()
                .unwrap()
                .iter()
                .filter(|n| n.as_str() == "task-cancelled")
                .count(),
            1
        );

        assert!(matches!(
            queue.cancel(Uuid::new_v4()).await,
            Err(TaskQueueError::TaskNotFound)
        ));
    }

    #[tokio::test]
    async fn fresh_task_has_no_approvals() {
        let (queue, _) = queue_with_bus().await;
        let task = queue
            .enqueue(EnqueueTask::new(
                Uuid::new_v4(),
                "task",
                TaskType::CodeGeneration,
                AgentType::Developer,
            ))
            .await
            .unwrap();
        assert!(queue.get_approvals(task.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn supervised_task_runs_only_after_approval() {
        let (queue, bus) = queue_with_bus().await;
        let events = record_events(&bus);
        let task = queue
            .enqueue(
                EnqueueTask::new(
                    Uuid::new_v4(),
                    "risky change",
                    TaskType::Deployment,
                    AgentType::Devops,
                )
                .with_autonomy(AutonomyLevel::Supervised),
            )
            .await
            .unwrap();

        let gate = match queue.start_task(task.id).await.unwrap() {
            StartOutcome::AwaitingApproval { task, gate } => {
                assert_eq!(task.status, TaskStatus::WaitingApproval);
                gate
            }
            StartOutcome::Started(_) => panic!("supervised task must not start unapproved"),
        };

        let approved = queue.approve_gate(gate.id, "alice", None).await.unwrap();
        assert_eq!(approved.status, TaskStatus::Queued);
        assert_eq!(approved.approved_by.as_deref(), Some("alice"));

        match queue.start_task(task.id).await.unwrap() {
            StartOutcome::Started(task) => assert_eq!(task.status, TaskStatus::Running),
            StartOutcome::AwaitingApproval { .. } => panic!("approved task must start"),
        }

        // completion of a supervised task goes through a review gate
        let review = match queue.complete_task(task.id, Some("done")).await.unwrap() {
            CompletionOutcome::AwaitingApproval { gate, .. } => gate,
            CompletionOutcome::Completed(_) => panic!("supervised completion needs review"),
        };
        assert_eq!(review.gate_type, GateType::Review);

        let done = queue.approve_gate(review.id, "alice", Some("ship it")).await.unwrap();
        assert_eq!(done.status, TaskStatus::Completed);

        let names = events.lock().unwrap().clone();
        assert!(names.contains(&"task-approval-required".to_string()));
        assert!(names.contains(&"task-started".to_string()));
        assert!(names.contains(&"task-completed".to_string()));
    }

    #[tokio::test]
    async fn rejection_fails_task_with_reason() {
        let (queue, _) = queue_with_bus().await;
        let task = queue
            .enqueue(
                EnqueueTask::new(
                    Uuid::new_v4(),
                    "bad idea",
                    TaskType::Deployment,
                    AgentType::Devops,
                )
                .with_autonomy(AutonomyLevel::Supervised),
            )
            .await
            .unwrap();

        let gate = match queue.start_task(task.id).await.unwrap() {
            StartOutcome::AwaitingApproval { gate, .. } => gate,
            _ => unreachable!(),
        };

        let failed = queue
            .reject_gate(gate.id, "alice", "rollout window closed")
            .await
            .unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.error_message.as_deref(), Some("rollout window closed"));

        // resolution is terminal
        assert!(matches!(
            queue.approve_gate(gate.id, "bob", None).await,
            Err(TaskQueueError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn failure_retries_until_cap_then_fails() {
        let (queue, _) = queue_with_bus().await;
        let mut spec = EnqueueTask::new(
            Uuid::new_v4(),
            "flaky",
            TaskType::Testing,
            AgentType::Tester,
        );
        spec.max_retries = Some(1);
        let task = queue.enqueue(spec).await.unwrap();

        queue.start_task(task.id).await.unwrap();
        match queue.fail_task(task.id, "first failure").await.unwrap() {
            FailureDisposition::Retried(task) => {
                assert_eq!(task.status, TaskStatus::Queued);
                assert_eq!(task.retry_count, 1);
            }
            FailureDisposition::Failed(_) => panic!("first failure should retry"),
        }

        queue.start_task(task.id).await.unwrap();
        match queue.fail_task(task.id, "second failure").await.unwrap() {
            FailureDisposition::Failed(task) => {
                assert_eq!(task.status, TaskStatus::Failed);
                assert_eq!(task.error_message.as_deref(), Some("second failure"));
            }
            FailureDisposition::Retried(_) => panic!("retry cap exhausted"),
        }
    }

    #[tokio::test]
    async fn checkpointed_task_gates_before_completion() {
        let (queue, _) = queue_with_bus().await;
        let task = queue
            .enqueue(
                EnqueueTask::new(
                    Uuid::new_v4(),
                    "gated work",
                    TaskType::Refactoring,
                    AgentType::Developer,
                )
                .with_autonomy(AutonomyLevel::ApprovalGates)
                .with_checkpoint("architecture sign-off"),
            )
            .await
            .unwrap();

        // approval_gates without an approved start gate begins immediately
        match queue.start_task(task.id).await.unwrap() {
            StartOutcome::Started(task) => assert_eq!(task.status, TaskStatus::Running),
            _ => panic!("approval_gates tasks start without a pre-gate"),
        }

        let gate = match queue.complete_task(task.id, Some("refactored")).await.unwrap() {
            CompletionOutcome::AwaitingApproval { gate, .. } => gate,
            _ => panic!("declared checkpoint must gate completion"),
        };
        assert_eq!(gate.gate_type, GateType::Quality);
        assert_eq!(gate.title, "architecture sign-off");

        let done = queue.approve_gate(gate.id, "reviewer", None).await.unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn queue_pause_resume_is_idempotent() {
        let (queue, bus) = queue_with_bus().await;
        let events = record_events(&bus);

        queue.pause();
        queue.pause();
        assert!(queue.is_paused());
        queue.resume_queue();
        queue.resume_queue();
        assert!(!queue.is_paused());

        assert_eq!(
            events.lock().unwrap().as_slice(),
            &["queue-paused".to_string(), "queue-resumed".to_string()]
        );
    }
}
