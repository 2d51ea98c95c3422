//! Agent runner contract and the child-process implementation.
//!
//! The orchestration core never talks to a model directly; it hands an
//! instruction to an [`AgentRunner`] and consumes the streamed transcript.
//! Cancellation is cooperative: the caller cancels the token, the runner
//! kills the in-flight turn and returns [`ExecutorError::Cancelled`].

use std::collections::HashMap;
use std::process::Stdio;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::agent::{AgentType, ProjectContext};

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("Failed to spawn agent process: {0}")]
    Spawn(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Agent exited with status {code:?}: {stderr}")]
    Failed { code: Option<i32>, stderr: String },
    #[error("Agent run was cancelled")]
    Cancelled,
}

/// Callback receiving transcript chunks as the agent produces them.
pub type ChunkFn = dyn Fn(&str) + Send + Sync;

/// Executes one agent turn and streams its output.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    /// Run `instruction` as `agent`, forwarding each output chunk to
    /// `on_chunk` and returning the accumulated transcript.
    async fn run(
        &self,
        agent: AgentType,
        instruction: &str,
        ctx: &ProjectContext,
        cancel: &CancellationToken,
        on_chunk: &ChunkFn,
    ) -> Result<String, ExecutorError>;
}

/// Command template for one agent persona. `{instruction}` and `{agent}`
/// placeholders are substituted before spawning.
#[derive(Debug, Clone)]
pub struct AgentProfile {
    pub program: String,
    pub args: Vec<String>,
}

impl AgentProfile {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    fn build_command(&self, agent: AgentType, instruction: &str, ctx: &ProjectContext) -> Command {
        let agent_name = agent.to_string();
        let mut cmd = Command::new(&self.program);
        for arg in &self.args {
            cmd.arg(
                arg.replace("{instruction}", instruction)
                    .replace("{agent}", &agent_name),
            );
        }
        if let Some(dir) = &ctx.working_dir {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

impl Default for AgentProfile {
    fn default() -> Self {
        // Headless coding-agent CLI invocation; hosts override per deployment.
        Self::new("claude").with_args([
            "--print",
            "--append-system-prompt",
            "You are the {agent} agent.",
            "{instruction}",
        ])
    }
}

/// [`AgentRunner`] that spawns a CLI coding agent as a child process and
/// streams its stdout line by line.
pub struct CommandAgentRunner {
    profiles: HashMap<AgentType, AgentProfile>,
    default_profile: AgentProfile,
}

impl CommandAgentRunner {
    pub fn new(default_profile: AgentProfile) -> Self {
        Self {
            profiles: HashMap::new(),
            default_profile,
        }
    }

    pub fn with_profile(mut self, agent: AgentType, profile: AgentProfile) -> Self {
        self.profiles.insert(agent, profile);
        self
    }

    fn profile_for(&self, agent: AgentType) -> &AgentProfile {
        self.profiles.get(&agent).unwrap_or(&self.default_profile)
    }
}

impl Default for CommandAgentRunner {
    fn default() -> Self {
        Self::new(AgentProfile::default())
    }
}

#[async_trait]
impl AgentRunner for CommandAgentRunner {
    async fn run(
        &self,
        agent: AgentType,
        instruction: &str,
        ctx: &ProjectContext,
        cancel: &CancellationToken,
        on_chunk: &ChunkFn,
    ) -> Result<String, ExecutorError> {
        let mut cmd = self.profile_for(agent).build_command(agent, instruction, ctx);

        debug!(agent = %agent, project_id = %ctx.project_id, "spawning agent process");
        let mut child = cmd.spawn().map_err(|e| ExecutorError::Spawn(e.to_string()))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ExecutorError::Spawn("stdout not captured".to_string()))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| ExecutorError::Spawn("stderr not captured".to_string()))?;

        let mut lines = BufReader::new(stdout).lines();
        let mut transcript = String::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    warn!(agent = %agent, "agent run cancelled, killing process");
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    return Err(ExecutorError::Cancelled);
                }
                line = lines.next_line() => match line? {
                    Some(line) => {
                        on_chunk(&line);
                        transcript.push_str(&line);
                        transcript.push('\n');
                    }
                    None => break,
                },
            }
        }

        let status = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                return Err(ExecutorError::Cancelled);
            }
            status = child.wait() => status?,
        };

        if status.success() {
            Ok(transcript)
        } else {
            let mut err_text = String::new();
            let _ = stderr.read_to_string(&mut err_text).await;
            Err(ExecutorError::Failed {
                code: status.code(),
                stderr: err_text.trim().to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_ctx() -> ProjectContext {
        ProjectContext::new(uuid::Uuid::new_v4())
    }

    #[test]
    fn profile_substitutes_placeholders() {
        let profile = AgentProfile::new("echo").with_args(["{agent}", "{instruction}"]);
        let cmd = profile.build_command(AgentType::Tester, "run the suite", &test_ctx());
        let args: Vec<_> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().to_string())
            .collect();
        assert_eq!(args, vec!["tester", "run the suite"]);
    }

    #[tokio::test]
    async fn command_runner_streams_stdout() {
        let runner =
            CommandAgentRunner::new(AgentProfile::new("echo").with_args(["{instruction}"]));
        let chunks = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = {
            let chunks = chunks.clone();
            move |chunk: &str| chunks.lock().unwrap().push(chunk.to_string())
        };

        let out = runner
            .run(
                AgentType::Developer,
                "hello world",
                &test_ctx(),
                &CancellationToken::new(),
                &sink,
            )
            .await
            .unwrap();

        assert!(out.contains("hello world"));
        assert_eq!(chunks.lock().unwrap().as_slice(), &["hello world"]);
    }

    #[tokio::test]
    async fn command_runner_honors_cancellation() {
        let runner = CommandAgentRunner::new(AgentProfile::new("sleep").with_args(["5"]));
        let cancel = CancellationToken::new();

        let cancel_after = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            cancel_after.cancel();
        });

        let started = std::time::Instant::now();
        let result = runner
            .run(
                AgentType::Developer,
                "unused",
                &test_ctx(),
                &cancel,
                &|_| {},
            )
            .await;

        assert!(matches!(result, Err(ExecutorError::Cancelled)));
        assert!(started.elapsed() < std::time::Duration::from_secs(4));
    }

    #[tokio::test]
    async fn command_runner_surfaces_nonzero_exit() {
        let runner = CommandAgentRunner::new(AgentProfile::new("false"));
        let result = runner
            .run(
                AgentType::Developer,
                "unused",
                &test_ctx(),
                &CancellationToken::new(),
                &|_| {},
            )
            .await;

        match result {
            Err(ExecutorError::Failed { code, .. }) => assert_eq!(code, Some(1)),
            other => panic!("expected Failed, got {other:?}"),
        }
    }
}
