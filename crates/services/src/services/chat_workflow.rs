//! Chat Workflow Service
//!
//! Turns one free-text request into a multi-agent pipeline and drives it:
//! sequential chains feed each step's output into the next and stop at the
//! first failure; parallel fan-outs let every step settle independently.
//! Pause freezes the run between steps (interrupting the in-flight agent
//! turn), resume continues from the first unexecuted step, cancel fails the
//! run. The workflow engine invokes the agent runner directly and does not
//! go through the task queue.

pub mod intent;

use std::str::FromStr;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use db::{
    DBService,
    models::chat_workflow::{
        ChatWorkflowError, ChatWorkflowRequest, ChatWorkflowStatus, CreateChatWorkflow,
        WorkflowStepResult, WorkflowType,
    },
};
use executors::{AgentRunner, AgentType, ExecutorError, ProjectContext};
use futures::future::join_all;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use super::events::{OrchestratorBus, OrchestratorEvent};

pub use intent::{CONFIDENCE_THRESHOLD, WorkflowIntent, parse_workflow_intent};

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("Workflow not found")]
    NotFound,
    #[error("The message does not describe a multi-agent workflow")]
    NotAWorkflow,
    #[error("Workflow is already running")]
    AlreadyRunning,
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error(transparent)]
    Store(#[from] ChatWorkflowError),
}

/// Cooperative run controls for one workflow, shared between the executing
/// task and pause/cancel callers.
struct WorkflowControl {
    /// Run-level cancellation; tripping it abandons the whole workflow.
    cancelled: CancellationToken,
    paused: AtomicBool,
    /// In-flight agent turns run under this token; pause trips it without
    /// cancelling the run.
    interrupt: StdMutex<CancellationToken>,
}

impl WorkflowControl {
    fn new() -> Self {
        let cancelled = CancellationToken::new();
        let interrupt = StdMutex::new(cancelled.child_token());
        Self {
            cancelled,
            paused: AtomicBool::new(false),
            interrupt,
        }
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Fresh interrupt scope for a new execution pass.
    fn rearm(&self) {
        self.paused.store(false, Ordering::SeqCst);
        *self.interrupt.lock().unwrap() = self.cancelled.child_token();
    }

    fn step_token(&self) -> CancellationToken {
        self.interrupt.lock().unwrap().clone()
    }

    fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        self.interrupt.lock().unwrap().cancel();
    }
}

#[derive(Clone)]
pub struct ChatWorkflowService {
    db: DBService,
    events: OrchestratorBus,
    runner: Arc<dyn AgentRunner>,
    controls: Arc<DashMap<Uuid, Arc<WorkflowControl>>>,
}

impl ChatWorkflowService {
    pub fn new(db: DBService, runner: Arc<dyn AgentRunner>, events: OrchestratorBus) -> Self {
        Self {
            db,
            events,
            runner,
            controls: Arc::new(DashMap::new()),
        }
    }

    /// Expose the pure intent parser over the command surface.
    pub fn parse_workflow_intent(&self, message: &str) -> Option<WorkflowIntent> {
        parse_workflow_intent(message)
    }

    // ========== Creation ==========

    /// Parse the message and materialize the workflow in `confirming`, with
    /// one persisted step row per planned task.
    pub async fn create_chat_workflow(
        &self,
        project_id: Uuid,
        session_id: &str,
        message: &str,
        input_context: Option<String>,
    ) -> Result<ChatWorkflowRequest, WorkflowError> {
        let intent = parse_workflow_intent(message).ok_or(WorkflowError::NotAWorkflow)?;

        let request = ChatWorkflowRequest::create(
            &self.db.pool,
            &CreateChatWorkflow {
                project_id,
                session_id: session_id.to_string(),
                message: message.to_string(),
                workflow_type: intent.workflow_type,
                tasks: intent.tasks.clone(),
                input_context,
            },
        )
        .await?;

        for (index, task) in intent.tasks.iter().enumerate() {
            WorkflowStepResult::create(
                &self.db.pool,
                request.id,
                index as i64,
                &task.agent,
                &task.instruction,
            )
            .await?;
        }

        info!(
            workflow_id = %request.id,
            workflow_type = %request.workflow_type,
            steps = intent.tasks.len(),
            confidence = intent.confidence,
            "chat workflow created"
        );
        self.events.emit(&OrchestratorEvent::ChatWorkflowCreated {
            workflow: request.clone(),
        });
        Ok(request)
    }

    pub async fn get_workflow(
        &self,
        id: Uuid,
    ) -> Result<Option<ChatWorkflowRequest>, WorkflowError> {
        Ok(ChatWorkflowRequest::find_by_id(&self.db.pool, id).await?)
    }

    pub async fn get_steps(&self, id: Uuid) -> Result<Vec<WorkflowStepResult>, WorkflowError> {
        Ok(WorkflowStepResult::find_by_workflow(&self.db.pool, id).await?)
    }

    // ========== Execution ==========

    /// Drive the workflow until it completes, fails, or freezes in `paused`.
    /// Returns the request in its final state for this pass.
    pub async fn execute_chat_workflow(
        &self,
        id: Uuid,
    ) -> Result<ChatWorkflowRequest, WorkflowError> {
        let request = ChatWorkflowRequest::find_by_id(&self.db.pool, id)
            .await?
            .ok_or(WorkflowError::NotFound)?;

        let claimed = match ChatWorkflowRequest::claim_for_running(&self.db.pool, id).await? {
            Some(claimed) => claimed,
            None => {
                return Err(match request.status {
                    ChatWorkflowStatus::Running => WorkflowError::AlreadyRunning,
                    status => WorkflowError::InvalidState(format!(
                        "Workflow cannot start from {status}"
                    )),
                });
            }
        };

        let control = {
            let entry = self
                .controls
                .entry(id)
                .or_insert_with(|| Arc::new(WorkflowControl::new()));
            Arc::clone(entry.value())
        };
        control.rearm();

        let steps = WorkflowStepResult::find_by_workflow(&self.db.pool, id).await?;
        let result = match claimed.workflow_type {
            WorkflowType::Sequential => self.run_sequential(&claimed, steps, &control).await,
            WorkflowType::Parallel => self.run_parallel(&claimed, steps, &control).await,
        };

        // drop the control for terminal runs, keep it for paused ones
        if let Ok(request) = &result {
            if matches!(
                request.status,
                ChatWorkflowStatus::Completed | ChatWorkflowStatus::Failed
            ) {
                self.controls.remove(&id);
            }
        }
        result
    }

    async fn run_sequential(
        &self,
        request: &ChatWorkflowRequest,
        steps: Vec<WorkflowStepResult>,
        control: &WorkflowControl,
    ) -> Result<ChatWorkflowRequest, WorkflowError> {
        let mut previous_output: Option<String> = None;

        for step in steps {
            if step.status == db::models::chat_workflow::StepStatus::Completed {
                previous_output = Some(step.output.clone());
                continue;
            }

            if control.cancelled.is_cancelled() {
                return self.conclude(request.id, ChatWorkflowStatus::Failed).await;
            }
            if control.is_paused() {
                return self.freeze_paused(request.id).await;
            }

            let instruction = match &previous_output {
                Some(prev) => format!(
                    "{}\n\nContext from previous step:\n{}",
                    step.instruction, prev
                ),
                None => step.instruction.clone(),
            };

            match self.run_step(request, &step, &instruction, control).await {
                StepRun::Completed(output) => {
                    previous_output = Some(output);
                }
                StepRun::Interrupted => {
                    if control.is_paused() {
                        WorkflowStepResult::reset_to_pending(&self.db.pool, step.id).await?;
                        return self.freeze_paused(request.id).await;
                    }
                    WorkflowStepResult::mark_failed(&self.db.pool, step.id, None).await?;
                    return self.conclude(request.id, ChatWorkflowStatus::Failed).await;
                }
                StepRun::Failed(error) => {
                    warn!(workflow_id = %request.id, step = step.step_index, error = %error, "sequential step failed");
                    // the rest of the chain cannot run without its context
                    let remaining =
                        WorkflowStepResult::find_by_workflow(&self.db.pool, request.id).await?;
                    for later in remaining.iter().filter(|s| {
                        s.step_index > step.step_index
                            && s.status == db::models::chat_workflow::StepStatus::Pending
                    }) {
                        WorkflowStepResult::mark_failed(&self.db.pool, later.id, None).await?;
                    }
                    return self.conclude(request.id, ChatWorkflowStatus::Failed).await;
                }
            }
        }

        self.conclude(request.id, ChatWorkflowStatus::Completed).await
    }

    async fn run_parallel(
        &self,
        request: &ChatWorkflowRequest,
        steps: Vec<WorkflowStepResult>,
        control: &WorkflowControl,
    ) -> Result<ChatWorkflowRequest, WorkflowError> {
        let runs = steps
            .into_iter()
            .filter(|s| s.status == db::models::chat_workflow::StepStatus::Pending)
            .map(|step| {
                let service = self.clone();
                let request = request.clone();
                async move {
                    let instruction = step.instruction.clone();
                    match service
                        .run_step(&request, &step, &instruction, control)
                        .await
                    {
                        StepRun::Completed(_) => Ok(()),
                        StepRun::Interrupted if control.is_paused() => {
                            WorkflowStepResult::reset_to_pending(&service.db.pool, step.id)
                                .await
                                .map(|_| ())
                        }
                        StepRun::Interrupted => {
                            WorkflowStepResult::mark_failed(&service.db.pool, step.id, None)
                                .await
                                .map(|_| ())
                        }
                        // failure already recorded; the other branches keep going
                        StepRun::Failed(_) => Ok(()),
                    }
                }
            });

        let results: Vec<Result<(), ChatWorkflowError>> = join_all(runs).await;
        for result in results {
            result?;
        }

        if control.cancelled.is_cancelled() {
            return self.conclude(request.id, ChatWorkflowStatus::Failed).await;
        }
        if control.is_paused() {
            return self.freeze_paused(request.id).await;
        }
        self.conclude(request.id, ChatWorkflowStatus::Completed).await
    }

    /// Run one step through the agent runner, recording its result. Failures
    /// are persisted here; interruption handling is left to the caller.
    async fn run_step(
        &self,
        request: &ChatWorkflowRequest,
        step: &WorkflowStepResult,
        instruction: &str,
        control: &WorkflowControl,
    ) -> StepRun {
        let agent = match AgentType::from_str(&step.agent) {
            Ok(agent) => agent,
            Err(_) => {
                let error = format!("Unknown agent type: {}", step.agent);
                let _ = WorkflowStepResult::mark_failed(&self.db.pool, step.id, Some(&error)).await;
                return StepRun::Failed(error);
            }
        };

        if WorkflowStepResult::mark_running(&self.db.pool, step.id)
            .await
            .ok()
            .flatten()
            .is_none()
        {
            return StepRun::Failed(format!("Step {} is not pending", step.step_index));
        }

        let mut ctx = ProjectContext::new(request.project_id);
        if let Some(context) = &request.input_context {
            ctx = ctx.with_context(context.clone());
        }

        let events = self.events.clone();
        let step_id = step.id;
        let on_chunk = move |chunk: &str| {
            events.emit(&OrchestratorEvent::TaskProgress {
                task_id: step_id,
                chunk: chunk.to_string(),
            });
        };

        let token = control.step_token();
        match self
            .runner
            .run(agent, instruction, &ctx, &token, &on_chunk)
            .await
        {
            Ok(output) => {
                if WorkflowStepResult::append_output(&self.db.pool, step.id, &output)
                    .await
                    .is_err()
                {
                    return StepRun::Failed("Failed to persist step output".to_string());
                }
                match WorkflowStepResult::mark_completed(&self.db.pool, step.id).await {
                    Ok(Some(completed)) => {
                        info!(workflow_id = %request.id, step = step.step_index, agent = %agent, "workflow step complete");
                        self.events.emit(&OrchestratorEvent::ChatWorkflowStepComplete {
                            workflow_id: request.id,
                            step: completed,
                        });
                        StepRun::Completed(output)
                    }
                    _ => StepRun::Failed("Step vanished while completing".to_string()),
                }
            }
            Err(ExecutorError::Cancelled) => StepRun::Interrupted,
            Err(e) => {
                let error = e.to_string();
                let _ = WorkflowStepResult::mark_failed(
                    &self.db.pool,
                    step.id,
                    Some(&format!("\n[error] {error}")),
                )
                .await;
                StepRun::Failed(error)
            }
        }
    }

    async fn freeze_paused(&self, id: Uuid) -> Result<ChatWorkflowRequest, WorkflowError> {
        info!(workflow_id = %id, "workflow paused");
        ChatWorkflowRequest::set_status(&self.db.pool, id, ChatWorkflowStatus::Paused)
            .await?
            .ok_or(WorkflowError::NotFound)
    }

    /// Record the terminal state; exactly one of two racing finishers (the
    /// engine and `cancel`) wins and emits the completion event.
    async fn conclude(
        &self,
        id: Uuid,
        status: ChatWorkflowStatus,
    ) -> Result<ChatWorkflowRequest, WorkflowError> {
        match ChatWorkflowRequest::conclude(&self.db.pool, id, status).await? {
            Some(request) => {
                info!(workflow_id = %id, status = %status, "workflow concluded");
                self.events.emit(&OrchestratorEvent::ChatWorkflowComplete {
                    workflow_id: id,
                    status,
                });
                Ok(request)
            }
            None => ChatWorkflowRequest::find_by_id(&self.db.pool, id)
                .await?
                .ok_or(WorkflowError::NotFound),
        }
    }

    // ========== Controls ==========

    /// Freeze a running workflow: clears the run flag and asks the agent
    /// runner to stop its current turn. The run settles in `paused`.
    pub async fn pause(&self, id: Uuid) -> Result<(), WorkflowError> {
        let request = ChatWorkflowRequest::find_by_id(&self.db.pool, id)
            .await?
            .ok_or(WorkflowError::NotFound)?;
        if request.status != ChatWorkflowStatus::Running {
            return Err(WorkflowError::InvalidState(format!(
                "Workflow is not running (status: {})",
                request.status
            )));
        }
        let control = self
            .controls
            .get(&id)
            .map(|c| Arc::clone(c.value()))
            .ok_or_else(|| WorkflowError::InvalidState("Workflow is not executing here".into()))?;
        control.pause();
        info!(workflow_id = %id, "workflow pause requested");
        Ok(())
    }

    /// Re-enter execution from the first unexecuted step. Completed steps
    /// are never re-run.
    pub async fn resume(&self, id: Uuid) -> Result<ChatWorkflowRequest, WorkflowError> {
        let request = ChatWorkflowRequest::find_by_id(&self.db.pool, id)
            .await?
            .ok_or(WorkflowError::NotFound)?;
        if request.status != ChatWorkflowStatus::Paused {
            return Err(WorkflowError::InvalidState("Workflow is not paused".into()));
        }
        info!(workflow_id = %id, "workflow resumed");
        self.execute_chat_workflow(id).await
    }

    /// Abandon the run: the in-flight agent turn is asked to stop and the
    /// workflow is marked failed.
    pub async fn cancel(&self, id: Uuid) -> Result<ChatWorkflowRequest, WorkflowError> {
        let request = ChatWorkflowRequest::find_by_id(&self.db.pool, id)
            .await?
            .ok_or(WorkflowError::NotFound)?;
        if matches!(
            request.status,
            ChatWorkflowStatus::Completed | ChatWorkflowStatus::Failed
        ) {
            return Err(WorkflowError::InvalidState(format!(
                "Workflow is already {}",
                request.status
            )));
        }

        if let Some((_, control)) = self.controls.remove(&id) {
            control.cancelled.cancel();
        }
        info!(workflow_id = %id, "workflow cancelled");
        self.conclude(id, ChatWorkflowStatus::Failed).await
    }
}

enum StepRun {
    Completed(String),
    Interrupted,
    Failed(String),
}
