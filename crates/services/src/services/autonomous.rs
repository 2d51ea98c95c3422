//! Autonomous Executor Service
//!
//! A single supervisory loop per service instance. Each poll tick it picks
//! the most urgent task that can make progress, unblocks approval gates via
//! the external assessor when auto-approval is enabled, and drives ready
//! tasks through the agent runner. The loop stops itself after a configured
//! idle window and accumulates non-fatal errors instead of crashing.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use db::models::approval_gate::TaskApprovalGate;
use db::models::task::{AutonomyLevel, Task, TaskStatus};
use executors::{AgentRunner, ApprovalAssessor, ExecutorError, ProjectContext, TaskOutputReview};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use ts_rs::TS;
use uuid::Uuid;

use super::events::{OrchestratorBus, OrchestratorEvent};
use super::task_queue::{
    CompletionOutcome, FailureDisposition, StartOutcome, TaskQueueError, TaskQueueService,
};

/// Identity recorded on gates the executor approves without a human.
const AUTO_APPROVER: &str = "autonomous-executor";

#[derive(Debug, Error)]
pub enum AutonomousError {
    #[error("Autonomous executor is already running")]
    AlreadyRunning,
    #[error(transparent)]
    Queue(#[from] TaskQueueError),
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
pub struct AutonomousConfig {
    pub project_id: Uuid,
    /// Autonomy applied when a task declares none; informational for hosts.
    pub default_autonomy: AutonomyLevel,
    pub poll_interval_ms: u64,
    /// Minimum assessor quality score (0–100) for an auto-approval.
    pub auto_approve_threshold: u8,
    /// The loop stops itself after this long without progress.
    pub max_idle_minutes: u64,
    pub auto_approval_enabled: bool,
}

impl AutonomousConfig {
    pub fn new(project_id: Uuid) -> Self {
        Self {
            project_id,
            default_autonomy: AutonomyLevel::Auto,
            poll_interval_ms: 1_000,
            auto_approve_threshold: 80,
            max_idle_minutes: 30,
            auto_approval_enabled: true,
        }
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    fn max_idle(&self) -> Duration {
        Duration::from_secs(self.max_idle_minutes * 60)
    }
}

#[derive(Debug, Clone, Default, Serialize, TS)]
pub struct AutonomousStats {
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub tasks_auto_approved: u64,
    pub tasks_manual_approval: u64,
    pub last_activity_at: Option<DateTime<Utc>>,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize, TS)]
pub struct ExecutorState {
    pub running: bool,
    pub paused: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub config: Option<AutonomousConfig>,
}

struct Inner {
    running: AtomicBool,
    paused: AtomicBool,
    started_at: RwLock<Option<DateTime<Utc>>>,
    config: RwLock<Option<AutonomousConfig>>,
    stats: RwLock<AutonomousStats>,
    cancel: RwLock<Option<CancellationToken>>,
}

#[derive(Clone)]
pub struct AutonomousExecutorService {
    inner: Arc<Inner>,
    queue: TaskQueueService,
    runner: Arc<dyn AgentRunner>,
    assessor: Arc<dyn ApprovalAssessor>,
    events: OrchestratorBus,
}

impl AutonomousExecutorService {
    pub fn new(
        queue: TaskQueueService,
        runner: Arc<dyn AgentRunner>,
        assessor: Arc<dyn ApprovalAssessor>,
        events: OrchestratorBus,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                running: AtomicBool::new(false),
                paused: AtomicBool::new(false),
                started_at: RwLock::new(None),
                config: RwLock::new(None),
                stats: RwLock::new(AutonomousStats::default()),
                cancel: RwLock::new(None),
            }),
            queue,
            runner,
            assessor,
            events,
        }
    }

    // ========== Lifecycle ==========

    /// Start the supervisory loop. Fails fast when one is already active.
    pub fn start_continuous(&self, config: AutonomousConfig) -> Result<(), AutonomousError> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Err(AutonomousError::AlreadyRunning);
        }

        let cancel = CancellationToken::new();
        self.inner.paused.store(false, Ordering::SeqCst);
        *self.inner.started_at.write().unwrap() = Some(Utc::now());
        *self.inner.config.write().unwrap() = Some(config.clone());
        *self.inner.stats.write().unwrap() = AutonomousStats::default();
        *self.inner.cancel.write().unwrap() = Some(cancel.clone());

        info!(project_id = %config.project_id, "autonomous executor started");
        self.events.emit(&OrchestratorEvent::AutonomousStarted {
            config: config.clone(),
        });

        let executor = self.clone();
        tokio::spawn(async move {
            executor.run_loop(config, cancel).await;
        });
        Ok(())
    }

    /// Halt polling without losing state. No-op unless actively polling.
    pub fn pause(&self) {
        if self.inner.running.load(Ordering::SeqCst)
            && !self.inner.paused.swap(true, Ordering::SeqCst)
        {
            info!("autonomous executor paused");
            self.events.emit(&OrchestratorEvent::AutonomousPaused);
        }
    }

    /// Resume a paused loop. No-op unless paused.
    pub fn resume(&self) {
        if self.inner.running.load(Ordering::SeqCst)
            && self.inner.paused.swap(false, Ordering::SeqCst)
        {
            info!("autonomous executor resumed");
            self.events.emit(&OrchestratorEvent::AutonomousResumed);
        }
    }

    /// Terminate the loop and publish final statistics. No-op when nothing
    /// is running.
    pub fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(token) = self.inner.cancel.write().unwrap().take() {
            token.cancel();
        }
        self.inner.paused.store(false, Ordering::SeqCst);
        let stats = self.get_stats();
        info!(
            completed = stats.tasks_completed,
            failed = stats.tasks_failed,
            "autonomous executor stopped"
        );
        self.events.emit(&OrchestratorEvent::AutonomousStopped { stats });
    }

    pub fn get_state(&self) -> ExecutorState {
        ExecutorState {
            running: self.inner.running.load(Ordering::SeqCst),
            paused: self.inner.paused.load(Ordering::SeqCst),
            started_at: *self.inner.started_at.read().unwrap(),
            config: self.inner.config.read().unwrap().clone(),
        }
    }

    pub fn get_stats(&self) -> AutonomousStats {
        self.inner.stats.read().unwrap().clone()
    }

    // ========== Loop ==========

    async fn run_loop(self, config: AutonomousConfig, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(config.poll_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut assessed_gates: HashSet<Uuid> = HashSet::new();
        let mut last_activity = tokio::time::Instant::now();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            if !self.inner.running.load(Ordering::SeqCst) {
                break;
            }
            if self.inner.paused.load(Ordering::SeqCst) || self.queue.is_paused() {
                continue;
            }

            match self.tick(&config, &cancel, &mut assessed_gates).await {
                Ok(true) => {
                    last_activity = tokio::time::Instant::now();
                    self.inner.stats.write().unwrap().last_activity_at = Some(Utc::now());
                }
                Ok(false) => {}
                Err(e) => {
                    error!(error = %e, "autonomous tick failed");
                    self.inner.stats.write().unwrap().errors.push(e.to_string());
                }
            }

            if last_activity.elapsed() > config.max_idle() {
                info!("autonomous executor idle limit reached, stopping");
                if self.inner.running.swap(false, Ordering::SeqCst) {
                    let stats = self.get_stats();
                    self.events.emit(&OrchestratorEvent::AutonomousStopped { stats });
                }
                break;
            }
        }
    }

    /// One scheduling decision: progress the most urgent eligible task.
    /// Returns whether any progress was made.
    async fn tick(
        &self,
        config: &AutonomousConfig,
        cancel: &CancellationToken,
        assessed_gates: &mut HashSet<Uuid>,
    ) -> Result<bool, AutonomousError> {
        let tasks = self.queue.list_tasks(config.project_id).await?;

        for task in tasks {
            match task.status {
                TaskStatus::WaitingApproval if config.auto_approval_enabled => {
                    if let Some(activity) = self.try_auto_approve(config, &task, assessed_gates).await? {
                        return Ok(activity);
                    }
                    // every gate here already left for a human; keep scanning
                }
                TaskStatus::Pending | TaskStatus::Queued => {
                    return self.drive_task(task, cancel).await;
                }
                _ => {}
            }
        }
        Ok(false)
    }

    /// Ask the assessor about the first unassessed pending gate of `task`.
    /// Returns None when there is nothing new to assess.
    async fn try_auto_approve(
        &self,
        config: &AutonomousConfig,
        task: &Task,
        assessed_gates: &mut HashSet<Uuid>,
    ) -> Result<Option<bool>, AutonomousError> {
        let pending: Vec<TaskApprovalGate> = self
            .queue
            .get_approvals(task.id)
            .await?
            .into_iter()
            .filter(|g| g.status == db::models::approval_gate::GateStatus::Pending)
            .collect();

        let Some(gate) = pending.into_iter().find(|g| !assessed_gates.contains(&g.id)) else {
            return Ok(None);
        };

        let output = gate
            .review_data_json()
            .and_then(|v| v.get("output").and_then(|o| o.as_str()).map(str::to_string))
            .or_else(|| task.output.clone())
            .unwrap_or_default();
        let assessment = self
            .assessor
            .assess(&TaskOutputReview {
                task_type: Some(task.task_type.to_string()),
                output,
            })
            .await;

        if assessment.can_auto_approve && assessment.quality_score >= config.auto_approve_threshold
        {
            let note = format!(
                "auto-approved (quality {}, risk {})",
                assessment.quality_score, assessment.risk_level
            );
            let task = self.queue.approve_gate(gate.id, AUTO_APPROVER, Some(&note)).await?;
            {
                let mut stats = self.inner.stats.write().unwrap();
                stats.tasks_auto_approved += 1;
                if task.status == TaskStatus::Completed {
                    stats.tasks_completed += 1;
                }
            }
            info!(task_id = %task.id, gate_id = %gate.id, score = assessment.quality_score, "gate auto-approved");
            Ok(Some(true))
        } else {
            assessed_gates.insert(gate.id);
            self.inner.stats.write().unwrap().tasks_manual_approval += 1;
            debug!(task_id = %task.id, gate_id = %gate.id, "gate left for manual approval");
            // a gate waiting on a human is not progress
            Ok(Some(false))
        }
    }

    /// Run one task through start → agent turn → conclusion.
    async fn drive_task(
        &self,
        task: Task,
        loop_cancel: &CancellationToken,
    ) -> Result<bool, AutonomousError> {
        let task = match self.queue.start_task(task.id).await? {
            StartOutcome::Started(task) => task,
            // parked behind a freshly created gate; that is progress too
            StartOutcome::AwaitingApproval { .. } => return Ok(true),
        };

        let Some(agent) = task.agent() else {
            self.conclude_failure(task.id, "Unknown agent type on task").await;
            return Ok(true);
        };

        let token = loop_cancel.child_token();
        self.queue.track_cancellation(task.id, token.clone());

        let mut ctx = ProjectContext::new(task.project_id);
        if let Some(input) = &task.input {
            ctx = ctx.with_context(input.clone());
        }
        let instruction = task.to_prompt();

        let progress_queue = self.queue.clone();
        let task_id = task.id;
        let on_chunk = move |chunk: &str| progress_queue.emit_progress(task_id, chunk);

        let result = self
            .runner
            .run(agent, &instruction, &ctx, &token, &on_chunk)
            .await;
        self.queue.clear_cancellation(task.id);

        match result {
            Ok(output) => match self.queue.complete_task(task.id, Some(&output)).await {
                Ok(CompletionOutcome::Completed(_)) => {
                    self.inner.stats.write().unwrap().tasks_completed += 1;
                }
                Ok(CompletionOutcome::AwaitingApproval { .. }) => {}
                Err(TaskQueueError::InvalidState(_)) => {
                    // concluded elsewhere (e.g. cancelled mid-run)
                }
                Err(e) => return Err(e.into()),
            },
            Err(ExecutorError::Cancelled) => {
                debug!(task_id = %task.id, "agent run cancelled");
            }
            Err(e) => {
                self.conclude_failure(task.id, &e.to_string()).await;
            }
        }
        Ok(true)
    }

    async fn conclude_failure(&self, task_id: Uuid, error: &str) {
        match self.queue.fail_task(task_id, error).await {
            Ok(FailureDisposition::Failed(_)) => {
                self.inner.stats.write().unwrap().tasks_failed += 1;
            }
            Ok(FailureDisposition::Retried(_)) => {}
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "could not record task failure");
                self.inner.stats.write().unwrap().errors.push(e.to_string());
            }
        }
    }
}
