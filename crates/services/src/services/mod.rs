pub mod arbitration;
pub mod autonomous;
pub mod chat_workflow;
pub mod events;
pub mod orchestrator;
pub mod task_queue;

pub use arbitration::ConflictArbitratorService;
pub use autonomous::AutonomousExecutorService;
pub use chat_workflow::ChatWorkflowService;
pub use events::{OrchestratorBus, OrchestratorEvent};
pub use orchestrator::OrchestratorCore;
pub use task_queue::TaskQueueService;
