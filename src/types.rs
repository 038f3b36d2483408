use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ── Plan ──────────────────────────────────────────────────────────────────────

/// A validated execution plan: the user's intent plus a dependency graph
/// of tool invocations. Produced by the planner, driven by the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    #[serde(rename = "mainTask", alias = "main_task")]
    pub main_task: String,
    pub subtasks: Vec<Subtask>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subtask {
    pub id: u32,
    pub description: String,
    pub tool: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub dependencies: Vec<u32>,
}

/// Conditional guard encoded in a subtask description prefix.
/// `if <phrase> failed/cannot/not found/unsuccessful` gates on a failed
/// dependency; `if <phrase> succeeded/success` gates on a successful one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Guard {
    None,
    OnFailure,
    OnSuccess,
}

fn guard_prefix() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^\s*if\b").expect("guard prefix regex"))
}

fn failure_words() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(failed|fails|cannot|not\s+found|unsuccessful)\b").expect("guard regex")
    })
}

fn success_words() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\b(succeeded|succeeds|success)\b").expect("guard regex"))
}

impl Subtask {
    pub fn guard(&self) -> Guard {
        if !guard_prefix().is_match(&self.description) {
            return Guard::None;
        }
        if failure_words().is_match(&self.description) {
            Guard::OnFailure
        } else if success_words().is_match(&self.description) {
            Guard::OnSuccess
        } else {
            Guard::None
        }
    }

    pub fn is_conditional(&self) -> bool {
        self.guard() != Guard::None
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).and_then(Value::as_str)
    }
}

// ── Subtask results ───────────────────────────────────────────────────────────

/// Outcome of one subtask, recorded by the scheduler. Failures are data,
/// not raised errors; the scheduler routes around them.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SubtaskResult {
    pub success: bool,
    pub skipped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub payload: Value,
    pub retryable: bool,
    pub timed_out: bool,
}

impl SubtaskResult {
    pub fn ok(payload: Value) -> Self {
        Self {
            success: true,
            payload,
            ..Self::default()
        }
    }

    pub fn failed(error: impl Into<String>, retryable: bool) -> Self {
        Self {
            error: Some(error.into()),
            retryable,
            ..Self::default()
        }
    }

    pub fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }

    pub fn deadline_exceeded() -> Self {
        Self {
            error: Some("subtask deadline exceeded".to_string()),
            retryable: true,
            timed_out: true,
            ..Self::default()
        }
    }
}

// ── Attachments ───────────────────────────────────────────────────────────────

/// Binary blob (an image) carried with the user request, unchanged
/// through re-plans.
#[derive(Debug, Clone)]
pub struct Attachment {
    pub name: String,
    pub bytes: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subtask(description: &str) -> Subtask {
        Subtask {
            id: 1,
            description: description.to_string(),
            tool: "execute_blender_code".to_string(),
            parameters: Map::new(),
            dependencies: vec![],
        }
    }

    #[test]
    fn failure_guard_variants() {
        assert_eq!(subtask("If asset import failed, build it in code").guard(), Guard::OnFailure);
        assert_eq!(subtask("  if the search cannot locate a model, retry").guard(), Guard::OnFailure);
        assert_eq!(subtask("IF model not found use a primitive").guard(), Guard::OnFailure);
        assert_eq!(subtask("if generation was unsuccessful, fall back").guard(), Guard::OnFailure);
    }

    #[test]
    fn success_guard_and_unconditional() {
        assert_eq!(subtask("If the import succeeded, apply materials").guard(), Guard::OnSuccess);
        assert_eq!(subtask("Import a dragon model").guard(), Guard::None);
        // "if" without a recognized outcome word stays unconditional
        assert_eq!(subtask("if possible use cycles").guard(), Guard::None);
        // outcome words without the "if" prefix stay unconditional
        assert_eq!(subtask("report which steps failed").guard(), Guard::None);
    }

    #[test]
    fn plan_deserializes_camel_and_snake_main_task() {
        let camel: Plan = serde_json::from_str(
            r#"{"mainTask":"t","subtasks":[{"id":1,"description":"d","tool":"finish_task"}]}"#,
        )
        .unwrap();
        assert_eq!(camel.main_task, "t");
        assert!(camel.subtasks[0].dependencies.is_empty());

        let snake: Plan = serde_json::from_str(r#"{"main_task":"t","subtasks":[]}"#).unwrap();
        assert_eq!(snake.main_task, "t");
    }
}
