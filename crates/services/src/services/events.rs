//! Orchestrator event vocabulary.
//!
//! Every lifecycle transition in the core is published on a shared
//! [`EventBus`] so observers (shell, logging, metrics) can follow along
//! without the services knowing about them.

use db::models::chat_workflow::{ChatWorkflowRequest, ChatWorkflowStatus, WorkflowStepResult};
use db::models::conflict::AgentConflict;
use db::models::task::Task;
use serde::Serialize;
use ts_rs::TS;
use utils::events::EventBus;
use uuid::Uuid;

use super::autonomous::{AutonomousConfig, AutonomousStats};

pub type OrchestratorBus = EventBus<OrchestratorEvent>;

#[derive(Debug, Clone, Serialize, TS)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum OrchestratorEvent {
    TaskQueued { task: Task },
    TaskStarted { task: Task },
    TaskProgress { task_id: Uuid, chunk: String },
    TaskApprovalRequired { task: Task, gate_id: Uuid },
    TaskCompleted { task: Task },
    TaskFailed { task: Task, error: String },
    TaskCancelled { task: Task },
    QueuePaused,
    QueueResumed,
    AutonomousStarted { config: AutonomousConfig },
    AutonomousPaused,
    AutonomousResumed,
    AutonomousStopped { stats: AutonomousStats },
    ConflictDetected { conflict: AgentConflict },
    ConflictResolved { conflict: AgentConflict },
    ConflictDismissed { conflict: AgentConflict },
    ChatWorkflowCreated { workflow: ChatWorkflowRequest },
    ChatWorkflowStepComplete { workflow_id: Uuid, step: WorkflowStepResult },
    ChatWorkflowComplete { workflow_id: Uuid, status: ChatWorkflowStatus },
}

impl OrchestratorEvent {
    pub fn name(&self) -> &'static str {
        match self {
            OrchestratorEvent::TaskQueued { .. } => "task-queued",
            OrchestratorEvent::TaskStarted { .. } => "task-started",
            OrchestratorEvent::TaskProgress { .. } => "task-progress",
            OrchestratorEvent::TaskApprovalRequired { .. } => "task-approval-required",
            OrchestratorEvent::TaskCompleted { .. } => "task-completed",
            OrchestratorEvent::TaskFailed { .. } => "task-failed",
            OrchestratorEvent::TaskCancelled { .. } => "task-cancelled",
            OrchestratorEvent::QueuePaused => "queue-paused",
            OrchestratorEvent::QueueResumed => "queue-resumed",
            OrchestratorEvent::AutonomousStarted { .. } => "autonomous-started",
            OrchestratorEvent::AutonomousPaused => "autonomous-paused",
            OrchestratorEvent::AutonomousResumed => "autonomous-resumed",
            OrchestratorEvent::AutonomousStopped { .. } => "autonomous-stopped",
            OrchestratorEvent::ConflictDetected { .. } => "conflict-detected",
            OrchestratorEvent::ConflictResolved { .. } => "conflict-resolved",
            OrchestratorEvent::ConflictDismissed { .. } => "conflict-dismissed",
            OrchestratorEvent::ChatWorkflowCreated { .. } => "chat-workflow-created",
            OrchestratorEvent::ChatWorkflowStepComplete { .. } => "chat-workflow-step-complete",
            OrchestratorEvent::ChatWorkflowComplete { .. } => "chat-workflow-complete",
        }
    }
}

impl std::fmt::Display for OrchestratorEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
