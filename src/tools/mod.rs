pub mod animation;
pub mod code_exec;
pub mod kb;
pub mod retry;
pub mod sanitize;
pub mod scene;
pub mod vision;

use std::{sync::Arc, time::Duration};

use serde_json::{Map, Value, json};
use tracing::{info, warn};

use crate::{
    agent::planner::{PlanRequest, Planner},
    agent::provider::LlmGateway,
    bridge::Bridge,
    errors::ToolError,
    integrations::{Integrations, IntegrationStatus},
    knowledge::KnowledgeIndex,
    types::{Plan, Subtask, SubtaskResult},
};
use retry::{RetryPolicy, with_retry};

pub const FINISH_TOOL: &str = "finish_task";

/// Execution policy and schema for one catalog entry.
pub struct ToolSpec {
    pub name: &'static str,
    pub required: &'static [&'static str],
    pub retry: RetryPolicy,
}

/// The fixed tool catalog. Remote-heavy tools get more attempts and a
/// longer backoff base; local or already-self-repairing tools run once.
pub static TOOL_CATALOG: &[ToolSpec] = &[
    ToolSpec {
        name: "decompose_task",
        required: &[],
        retry: RetryPolicy::once(),
    },
    ToolSpec {
        name: "search_knowledge_base",
        required: &["query"],
        retry: RetryPolicy::once(),
    },
    ToolSpec {
        name: "get_scene_info",
        required: &[],
        retry: RetryPolicy::new(3, Duration::from_millis(500)),
    },
    ToolSpec {
        name: "execute_blender_code",
        required: &["code"],
        retry: RetryPolicy::once(),
    },
    ToolSpec {
        name: "asset_search_and_import",
        required: &[],
        retry: RetryPolicy::new(2, Duration::from_secs(2)),
    },
    ToolSpec {
        name: "analyze_image",
        required: &[],
        retry: RetryPolicy::once(),
    },
    ToolSpec {
        name: "validate_with_vision",
        required: &["expectedOutcome"],
        retry: RetryPolicy::new(2, Duration::from_secs(1)),
    },
    ToolSpec {
        name: "create_animation",
        required: &["animationType"],
        retry: RetryPolicy::new(2, Duration::from_secs(1)),
    },
    ToolSpec {
        name: FINISH_TOOL,
        required: &[],
        retry: RetryPolicy::once(),
    },
];

pub fn tool_spec(name: &str) -> Option<&'static ToolSpec> {
    TOOL_CATALOG.iter().find(|spec| spec.name == name)
}

/// Request-scoped facts a tool may need beyond its own parameters.
/// Cheap to clone: the heavy parts are shared.
#[derive(Clone)]
pub struct RunContext {
    pub user_request: Arc<str>,
    pub attachments: Arc<Vec<crate::types::Attachment>>,
    pub integration_status: IntegrationStatus,
    /// Critical non-conditional failures recorded so far; `finish_task`
    /// refuses to finalize while this is non-empty.
    pub critical_failures: Arc<Vec<String>>,
}

/// How the scheduler invokes tools. The concrete implementation is
/// [`Toolbox`]; tests substitute scripted fakes.
pub trait ToolDispatch: Send + Sync + 'static {
    fn dispatch(
        &self,
        subtask: Subtask,
        ctx: RunContext,
    ) -> impl Future<Output = SubtaskResult> + Send;
}

/// All collaborators a tool execution can touch, wired once at startup.
pub struct Toolbox {
    pub bridge: Bridge,
    pub knowledge: Option<KnowledgeIndex>,
    pub integrations: Integrations,
    pub gateway: LlmGateway,
    pub planner: Planner<LlmGateway>,
    pub code_exec_retries: u32,
}

impl Toolbox {
    async fn execute(
        &self,
        spec: &ToolSpec,
        subtask: &Subtask,
        ctx: &RunContext,
    ) -> Result<Value, ToolError> {
        match spec.name {
            "decompose_task" => {
                let request = subtask
                    .param_str("userRequest")
                    .unwrap_or(&ctx.user_request)
                    .to_string();
                let req = PlanRequest {
                    user_request: request,
                    has_attachments: !ctx.attachments.is_empty(),
                    integration_status: ctx.integration_status,
                    ..PlanRequest::default()
                };
                let plan = self.planner.decompose(&req).await;
                Ok(json!({ "plan": plan }))
            }
            "search_knowledge_base" => {
                let query = require_str(subtask, "query")?;
                Ok(kb::search(self.knowledge.as_ref(), query).await)
            }
            "get_scene_info" => scene::scene_info(&self.bridge).await,
            "execute_blender_code" => {
                let code = require_str(subtask, "code")?;
                code_exec::execute(&self.bridge, code, self.code_exec_retries).await
            }
            "asset_search_and_import" => {
                let prompt = subtask.param_str("prompt").unwrap_or(&ctx.user_request);
                let asset = self
                    .integrations
                    .acquire(prompt, ctx.integration_status)
                    .await?;
                Ok(json!({ "assetResult": asset }))
            }
            "analyze_image" => Ok(vision::analyze_image(&self.gateway, &ctx.attachments).await),
            "validate_with_vision" => {
                let expected = require_str(subtask, "expectedOutcome")?;
                vision::validate_with_vision(&self.bridge, &self.gateway, expected).await
            }
            "create_animation" => {
                let kind = require_str(subtask, "animationType")?;
                let target = subtask.param_str("targetObject");
                let duration = subtask.parameters.get("duration").and_then(Value::as_f64);
                animation::create_animation(
                    &self.bridge,
                    kind,
                    target,
                    duration,
                    self.code_exec_retries,
                )
                .await
            }
            other => Err(ToolError::UnknownTool(other.to_string())),
        }
    }

    /// Terminal gate: refuse to finalize while critical failures remain.
    /// Without a `finalAnswer` parameter the gate passes silently and the
    /// scheduler synthesizes the response from the run's messages.
    fn finish(&self, subtask: &Subtask, ctx: &RunContext) -> SubtaskResult {
        let answer = subtask.param_str("finalAnswer").map(str::to_string);
        if ctx.critical_failures.is_empty() {
            let payload = match answer {
                Some(answer) => json!({ "finalAnswer": answer }),
                None => json!({}),
            };
            return SubtaskResult::ok(payload);
        }
        warn!(
            failures = ctx.critical_failures.len(),
            "finish_task vetoed: critical subtasks failed"
        );
        let summary = format!(
            "I could not fully complete the request; these steps failed: {}.",
            ctx.critical_failures.join("; ")
        );
        SubtaskResult {
            success: false,
            skipped: false,
            error: Some("critical subtasks failed".to_string()),
            payload: json!({ "finalAnswer": summary }),
            retryable: false,
            timed_out: false,
        }
    }
}

impl crate::agent::planner::PlanSource for Toolbox {
    async fn plan(&self, req: &crate::agent::planner::PlanRequest) -> Plan {
        self.planner.decompose(req).await
    }

    async fn replan(
        &self,
        req: &crate::agent::planner::PlanRequest,
        failed: &[crate::agent::planner::SubtaskNote],
        completed: &[crate::agent::planner::SubtaskNote],
    ) -> Plan {
        self.planner.replan_after_failures(req, failed, completed).await
    }
}

impl ToolDispatch for Toolbox {
    async fn dispatch(&self, subtask: Subtask, ctx: RunContext) -> SubtaskResult {
        let Some(spec) = tool_spec(&subtask.tool) else {
            return SubtaskResult::failed(
                ToolError::UnknownTool(subtask.tool.clone()).to_string(),
                false,
            );
        };
        if let Err(e) = validate_params(spec, &subtask.parameters) {
            return SubtaskResult::failed(e.to_string(), false);
        }
        if spec.name == FINISH_TOOL {
            return self.finish(&subtask, &ctx);
        }

        info!(id = subtask.id, tool = spec.name, "dispatching subtask");
        match with_retry(&spec.retry, spec.name, || self.execute(spec, &subtask, &ctx)).await {
            Ok(payload) => SubtaskResult::ok(payload),
            Err(e) => {
                warn!(id = subtask.id, tool = spec.name, error = %e, "subtask failed");
                SubtaskResult::failed(e.to_string(), e.is_retryable())
            }
        }
    }
}

fn require_str<'a>(subtask: &'a Subtask, key: &str) -> Result<&'a str, ToolError> {
    subtask
        .param_str(key)
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| ToolError::Schema(format!("`{key}` is required and must be a string")))
}

fn validate_params(spec: &ToolSpec, params: &Map<String, Value>) -> Result<(), ToolError> {
    for key in spec.required {
        let present = params.get(*key).and_then(Value::as_str).map(|v| !v.trim().is_empty());
        if present != Some(true) {
            return Err(ToolError::Schema(format!(
                "tool `{}` requires parameter `{key}`",
                spec.name
            )));
        }
    }
    Ok(())
}
