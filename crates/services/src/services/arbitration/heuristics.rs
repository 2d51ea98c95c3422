//! Conflict classification heuristics.
//!
//! Pure text classifiers, kept free of I/O so a model-backed implementation
//! can replace them without touching the arbitration service. Categories are
//! tried in a fixed precedence; the first one whose heuristic fires wins.

use db::models::conflict::{ConflictSeverity, ConflictType};
use once_cell::sync::Lazy;
use regex::Regex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub conflict_type: ConflictType,
    pub severity: ConflictSeverity,
}

/// Dangerous constructs flagged by the security sub-check, with the
/// description reported for each.
const DANGEROUS_CONSTRUCTS: &[(&str, &str)] = &[
    ("eval(", "dynamic code evaluation via eval()"),
    ("new function(", "dynamic code construction via Function()"),
    ("exec(", "dynamic command execution"),
    ("innerhtml", "unsafe HTML injection via innerHTML"),
    ("document.write", "unsafe HTML injection via document.write"),
    ("dangerouslysetinnerhtml", "unsafe HTML injection via dangerouslySetInnerHTML"),
];

static CREDENTIAL_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)(api[_-]?key|password|secret|token)\s*[:=]\s*["'][^"']+["']"#)
        .expect("credential pattern")
});

const SECURITY_ALARMS: &[&str] = &[
    "security", "vulnerability", "vulnerable", "xss", "injection", "unsafe", "exploit", "csrf",
    "risk",
];

const DISAGREEMENT_MARKERS: &[&str] = &[
    "disagree",
    "should not",
    "shouldn't",
    "must not",
    "instead",
    "rather than",
    "incorrect",
    "wrong",
    "won't work",
    "will not work",
    "oppose",
    "object to",
    "insufficient",
    "however",
    "but ",
];

const CRITICAL_MARKERS: &[&str] = &[
    "injection",
    "xss",
    "critical",
    "remote code execution",
    "rce",
    "data loss",
];

const REQUIREMENT_TOPICS: &[&str] = &[
    "requirement",
    "scope",
    "specification",
    "acceptance criteria",
    "user story",
];

const TEST_TOPICS: &[&str] = &["test", "coverage", "assertion", "suite"];

const PRIORITY_TOPICS: &[&str] = &["priority", "urgent", "defer", "backlog", "sprint", "roadmap"];

const APPROACH_TOPICS: &[&str] = &[
    "approach",
    "architecture",
    "design",
    "pattern",
    "implementation",
    "solution",
];

fn mentions_any(text: &str, words: &[&str]) -> bool {
    words.iter().any(|w| text.contains(w))
}

/// Known-dangerous constructs present in `code` or `description`: dynamic
/// code evaluation, unsafe HTML injection, hard-coded credentials.
pub fn check_security_violations(code: &str, description: &str) -> Vec<String> {
    let combined = format!("{code}\n{description}").to_lowercase();
    let mut violations: Vec<String> = DANGEROUS_CONSTRUCTS
        .iter()
        .filter(|(needle, _)| combined.contains(needle))
        .map(|(_, description)| description.to_string())
        .collect();
    if CREDENTIAL_PATTERN.is_match(&combined) {
        violations.push("hard-coded credential or key".to_string());
    }
    violations
}

fn has_disagreement(a: &str, b: &str) -> bool {
    mentions_any(a, DISAGREEMENT_MARKERS) || mentions_any(b, DISAGREEMENT_MARKERS)
}

fn severity_for(conflict_type: ConflictType, combined: &str) -> ConflictSeverity {
    if mentions_any(combined, CRITICAL_MARKERS) {
        return ConflictSeverity::Critical;
    }
    match conflict_type {
        ConflictType::SecurityViolation => ConflictSeverity::High,
        ConflictType::RequirementChange | ConflictType::TestDisagreement => {
            ConflictSeverity::Medium
        }
        ConflictType::PriorityConflict | ConflictType::ApproachConflict => ConflictSeverity::Low,
    }
}

/// Classify two agent outputs about the same item. Returns the first
/// category whose heuristic fires in the precedence
/// security > requirement > test > priority > approach, or None.
pub fn classify_outputs(output1: &str, output2: &str) -> Option<Classification> {
    let a = output1.to_lowercase();
    let b = output2.to_lowercase();
    let combined = format!("{a}\n{b}");

    let conflict_type = if (mentions_any(&a, SECURITY_ALARMS) || mentions_any(&b, SECURITY_ALARMS))
        && !check_security_violations(output1, output2).is_empty()
    {
        Some(ConflictType::SecurityViolation)
    } else if mentions_any(&combined, REQUIREMENT_TOPICS) && has_disagreement(&a, &b) {
        Some(ConflictType::RequirementChange)
    } else if mentions_any(&combined, TEST_TOPICS) && has_disagreement(&a, &b) {
        Some(ConflictType::TestDisagreement)
    } else if mentions_any(&combined, PRIORITY_TOPICS) && has_disagreement(&a, &b) {
        Some(ConflictType::PriorityConflict)
    } else if mentions_any(&combined, APPROACH_TOPICS) && has_disagreement(&a, &b) {
        Some(ConflictType::ApproachConflict)
    } else {
        None
    }?;

    Some(Classification {
        conflict_type,
        severity: severity_for(conflict_type, &combined),
    })
}
