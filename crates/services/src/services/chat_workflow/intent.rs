//! Workflow intent parsing.
//!
//! Pure text classifier turning one free-text message into a multi-agent
//! plan. Kept free of I/O so a model-backed parser can replace it behind the
//! same signature.

use db::models::chat_workflow::{PlannedWorkflowTask, WorkflowType};
use executors::AgentType;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use ts_rs::TS;

/// Parsed multi-agent plan with the parser's confidence (0–100).
#[derive(Debug, Clone, Serialize, TS)]
pub struct WorkflowIntent {
    pub workflow_type: WorkflowType,
    pub tasks: Vec<PlannedWorkflowTask>,
    pub confidence: u8,
}

/// Minimum confidence for a message to count as a workflow request.
pub const CONFIDENCE_THRESHOLD: u8 = 50;

const AGENT_KEYWORDS: &[(AgentType, &[&str])] = &[
    (AgentType::Developer, &["developer", "coder", "programmer"]),
    (AgentType::Tester, &["tester", "qa", "test engineer"]),
    (AgentType::Security, &["security", "auditor", "pentester"]),
    (AgentType::Reviewer, &["reviewer", "code review"]),
    (AgentType::Devops, &["devops", "ops team", "release engineer"]),
    (AgentType::Architect, &["architect"]),
    (
        AgentType::Documentation,
        &["documentation writer", "docs writer", "technical writer", "documentation team"],
    ),
];

const ACTION_VERBS: &[&str] = &[
    "implement", "build", "create", "write", "fix", "verify", "test", "review", "audit",
    "deploy", "document", "refactor", "check", "scan", "investigate",
];

const SEQUENTIAL_INDICATORS: &[&str] = &[
    "first", "then", "after that", "afterwards", "next", "finally", "followed by",
];

const PARALLEL_INDICATORS: &[&str] = &[
    "in parallel", "simultaneously", "at the same time", "concurrently", "meanwhile",
];

static SEQUENCE_SPLITTER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:first|then|after that|afterwards|next|finally|followed by)\b")
        .expect("sequence splitter")
});

fn mentioned_agents(lower: &str) -> Vec<AgentType> {
    AGENT_KEYWORDS
        .iter()
        .filter(|(_, keywords)| keywords.iter().any(|k| lower.contains(k)))
        .map(|(agent, _)| *agent)
        .collect()
}

fn first_agent_in(lower: &str) -> Option<AgentType> {
    // earliest mention in the text, not table order
    AGENT_KEYWORDS
        .iter()
        .filter_map(|(agent, keywords)| {
            keywords
                .iter()
                .filter_map(|k| lower.find(k))
                .min()
                .map(|pos| (pos, *agent))
        })
        .min_by_key(|(pos, _)| *pos)
        .map(|(_, agent)| agent)
}

fn clean_instruction(segment: &str) -> String {
    segment
        .trim()
        .trim_matches(|c: char| matches!(c, ',' | ';' | '.' | ':'))
        .trim()
        .to_string()
}

/// Parse one free-text message into a workflow plan. None when fewer than
/// two agents are mentioned or the confidence lands below the threshold.
pub fn parse_workflow_intent(message: &str) -> Option<WorkflowIntent> {
    let lower = message.to_lowercase();

    let agents = mentioned_agents(&lower);
    if agents.len() < 2 {
        return None;
    }

    let verb_count = ACTION_VERBS.iter().filter(|v| lower.contains(*v)).count();
    let has_sequential = SEQUENTIAL_INDICATORS.iter().any(|i| lower.contains(i));
    let has_parallel = PARALLEL_INDICATORS.iter().any(|i| lower.contains(i));

    let confidence = (agents.len() * 30
        + verb_count * 10
        + if has_sequential || has_parallel { 20 } else { 0 })
    .min(100) as u8;
    if confidence < CONFIDENCE_THRESHOLD {
        return None;
    }

    let workflow_type = if has_parallel && !has_sequential {
        WorkflowType::Parallel
    } else {
        WorkflowType::Sequential
    };

    // split on ordering indicators, one task per matched agent
    let mut tasks: Vec<PlannedWorkflowTask> = SEQUENCE_SPLITTER
        .split(&lower)
        .filter_map(|segment| {
            let instruction = clean_instruction(segment);
            if instruction.is_empty() {
                return None;
            }
            first_agent_in(&instruction).map(|agent| PlannedWorkflowTask {
                agent: agent.to_string(),
                instruction,
                depends_on: Vec::new(),
            })
        })
        .collect();

    // nothing usable from splitting: one generic task per mentioned agent
    if tasks.len() < 2 {
        tasks = agents
            .iter()
            .map(|agent| PlannedWorkflowTask {
                agent: agent.to_string(),
                instruction: clean_instruction(&lower),
                depends_on: Vec::new(),
            })
            .collect();
    }

    if workflow_type == WorkflowType::Sequential {
        for i in 1..tasks.len() {
            tasks[i].depends_on = vec![i - 1];
        }
    }

    Some(WorkflowIntent {
        workflow_type,
        tasks,
        confidence,
    })
}
