use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter, EnumString};
use ts_rs::TS;
use uuid::Uuid;

/// Persona that executes one instruction via the agent runner.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS, Display, EnumString, EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AgentType {
    Developer,
    Tester,
    Security,
    Reviewer,
    Devops,
    Architect,
    Documentation,
}

/// Project-scoped context handed to the runner alongside each instruction.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
pub struct ProjectContext {
    pub project_id: Uuid,
    pub working_dir: Option<PathBuf>,
    /// Free-form context injected into the agent prompt (prior outputs,
    /// analysis summaries, user-supplied notes).
    pub context: Option<String>,
}

impl ProjectContext {
    pub fn new(project_id: Uuid) -> Self {
        Self {
            project_id,
            working_dir: None,
            context: None,
        }
    }

    pub fn with_working_dir(mut self, dir: PathBuf) -> Self {
        self.working_dir = Some(dir);
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }
}
