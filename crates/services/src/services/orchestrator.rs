//! Orchestrator composition root.
//!
//! Builds the four core services over one database handle and one shared
//! event bus. Each instance is independent, so hosts (and tests) construct
//! one per process or per project instead of relying on globals.

use std::sync::Arc;

use db::DBService;
use executors::{AgentRunner, ApprovalAssessor};

use super::arbitration::ConflictArbitratorService;
use super::autonomous::AutonomousExecutorService;
use super::chat_workflow::ChatWorkflowService;
use super::events::OrchestratorBus;
use super::task_queue::TaskQueueService;

pub struct OrchestratorCore {
    pub events: OrchestratorBus,
    pub queue: TaskQueueService,
    pub autonomous: AutonomousExecutorService,
    pub arbitrator: ConflictArbitratorService,
    pub workflows: ChatWorkflowService,
}

impl OrchestratorCore {
    pub fn new(
        db: DBService,
        runner: Arc<dyn AgentRunner>,
        assessor: Arc<dyn ApprovalAssessor>,
    ) -> Self {
        let events = OrchestratorBus::new();
        let queue = TaskQueueService::new(db.clone(), events.clone());
        let autonomous = AutonomousExecutorService::new(
            queue.clone(),
            runner.clone(),
            assessor,
            events.clone(),
        );
        let arbitrator = ConflictArbitratorService::new(db.clone(), events.clone());
        let workflows = ChatWorkflowService::new(db, runner, events.clone());

        Self {
            events,
            queue,
            autonomous,
            arbitrator,
            workflows,
        }
    }
}
