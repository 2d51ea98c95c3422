//! Agent execution boundary.
//!
//! Everything the orchestration core needs from the outside world to run one
//! agent turn: the agent personas, the [`AgentRunner`] contract with
//! cooperative cancellation, a child-process implementation, and the
//! [`ApprovalAssessor`] used for auto-approval decisions.

pub mod agent;
pub mod assessor;
pub mod runner;

pub use agent::{AgentType, ProjectContext};
pub use assessor::{ApprovalAssessment, ApprovalAssessor, HeuristicAssessor, RiskLevel, TaskOutputReview};
pub use runner::{AgentProfile, AgentRunner, CommandAgentRunner, ExecutorError};
