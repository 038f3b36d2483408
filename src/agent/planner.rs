use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::agent::provider::{ChatApi, Message};
use crate::errors::PlanError;
use crate::integrations::IntegrationStatus;
use crate::types::{Plan, Subtask};

/// System prompt for plan decomposition. The model must answer with the
/// plan JSON and nothing else; fences are tolerated and stripped.
const PLANNER_SYSTEM: &str = "\
You are the planning module of a 3D scene assistant. Decompose the user's \
request into subtasks over these tools:

  get_scene_info            -- inspect the current scene (no parameters)
  search_knowledge_base     -- parameters: {\"query\": string}
  asset_search_and_import   -- parameters: {\"prompt\": string}
  execute_blender_code      -- parameters: {\"code\": python string}
  analyze_image             -- analyze attached reference images (no parameters)
  validate_with_vision      -- parameters: {\"expectedOutcome\": string}
  create_animation          -- parameters: {\"animationType\": hop|walk|rotate|bounce, \
\"targetObject\"?: string, \"duration\"?: seconds}
  finish_task               -- parameters: {\"finalAnswer\": string}; exactly one, last

## Response format

Respond with JSON ONLY, exactly this shape:
{\"mainTask\": \"...\", \"subtasks\": [{\"id\": 1, \"description\": \"...\", \
\"tool\": \"...\", \"parameters\": {}, \"dependencies\": []}]}

## Rules
- ids are small positive integers, unique within the plan.
- dependencies reference earlier ids only; the graph must be acyclic.
- Include exactly one finish_task subtask that depends on the work before it.
- A fallback step runs only on failure when its description starts with \
\"If <step> failed\"; phrase success-gated steps as \"If <step> succeeded\".
- Independent subtasks may share no dependencies so they can run in parallel.";

const REPLAN_SYSTEM: &str = "\
You are re-planning after failures. Propose an ALTERNATIVE strategy that \
avoids the failure mode you are shown: if asset import failed, build the \
geometry with execute_blender_code instead; if code failed, consult \
search_knowledge_base first, then write simpler code. Do not repeat the \
failed approach. Respond with the same JSON plan shape, JSON ONLY.";

/// Everything the planner may consider. Carried by the scheduler and
/// rebuilt from its state on each planning call.
#[derive(Debug, Clone, Default)]
pub struct PlanRequest {
    pub user_request: String,
    pub has_attachments: bool,
    pub rag_context: Option<String>,
    pub scene_context: Option<String>,
    pub integration_status: IntegrationStatus,
}

/// Compact record of a prior subtask shown to the re-planner.
#[derive(Debug, Clone)]
pub struct SubtaskNote {
    pub id: u32,
    pub description: String,
    pub tool: String,
    pub outcome: String,
}

/// Source of plans as the scheduler sees it. Infallible: when the model
/// path fails, a deterministic fallback plan is produced instead.
pub trait PlanSource: Send + Sync + 'static {
    fn plan(&self, req: &PlanRequest) -> impl Future<Output = Plan> + Send;
    fn replan(
        &self,
        req: &PlanRequest,
        failed: &[SubtaskNote],
        completed: &[SubtaskNote],
    ) -> impl Future<Output = Plan> + Send;
}

pub struct Planner<G: ChatApi> {
    gateway: G,
    /// Model calls per planning request before the deterministic
    /// fallback takes over (`LLM_REPAIR_ATTEMPTS`).
    attempts: u32,
}

impl<G: ChatApi> Planner<G> {
    pub fn new(gateway: G) -> Self {
        Self { gateway, attempts: 2 }
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    pub async fn decompose(&self, req: &PlanRequest) -> Plan {
        match self.model_plan(PLANNER_SYSTEM, &build_prompt(req, None)).await {
            Ok(plan) => plan,
            Err(e) => {
                warn!(error = %e, "model planning failed; using the deterministic fallback");
                fallback_plan(req)
            }
        }
    }

    pub async fn replan_after_failures(
        &self,
        req: &PlanRequest,
        failed: &[SubtaskNote],
        completed: &[SubtaskNote],
    ) -> Plan {
        let prompt = build_prompt(req, Some((failed, completed)));
        match self.model_plan(REPLAN_SYSTEM, &prompt).await {
            Ok(plan) => plan,
            Err(e) => {
                warn!(error = %e, "re-planning failed; using the minimal recovery plan");
                fallback_replan(req)
            }
        }
    }

    async fn model_plan(&self, system: &str, prompt: &str) -> Result<Plan, PlanError> {
        let messages = [Message::system(system), Message::user(prompt)];
        let mut last_err = PlanError::Llm("no attempt made".to_string());
        for attempt in 1..=self.attempts {
            let raw = match self.gateway.chat(&messages).await {
                Ok(raw) => raw,
                Err(e) => {
                    last_err = PlanError::Llm(e.to_string());
                    continue;
                }
            };
            match parse_plan_text(&raw) {
                Ok(plan) => {
                    info!(subtasks = plan.subtasks.len(), attempt, "model produced a valid plan");
                    return Ok(plan);
                }
                Err(e) => {
                    warn!(attempt, error = %e, "model plan rejected");
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }
}

impl<G: ChatApi> PlanSource for Planner<G> {
    async fn plan(&self, req: &PlanRequest) -> Plan {
        self.decompose(req).await
    }

    async fn replan(
        &self,
        req: &PlanRequest,
        failed: &[SubtaskNote],
        completed: &[SubtaskNote],
    ) -> Plan {
        self.replan_after_failures(req, failed, completed).await
    }
}

fn build_prompt(req: &PlanRequest, history: Option<(&[SubtaskNote], &[SubtaskNote])>) -> String {
    let mut prompt = format!("User request: {}\n", req.user_request);
    if req.has_attachments {
        prompt.push_str("The user attached reference image(s); analyze them first.\n");
    }
    let status = req.integration_status;
    prompt.push_str(&format!(
        "Asset services -- generator: {}, marketplace: {}, library: {}\n",
        status.generator, status.marketplace, status.library
    ));
    if let Some(scene) = &req.scene_context {
        prompt.push_str(&format!("Current scene: {scene}\n"));
    }
    if let Some(rag) = &req.rag_context {
        prompt.push_str(&format!("Relevant documentation:\n{rag}\n"));
    }
    if let Some((failed, completed)) = history {
        prompt.push_str("\nFailed subtasks:\n");
        for note in failed {
            prompt.push_str(&format!(
                "- #{} {} [{}]: {}\n",
                note.id, note.description, note.tool, note.outcome
            ));
        }
        prompt.push_str("Completed subtasks:\n");
        for note in completed {
            prompt.push_str(&format!(
                "- #{} {} [{}]: {}\n",
                note.id, note.description, note.tool, note.outcome
            ));
        }
    }
    prompt
}

// ── Parsing & validation ──────────────────────────────────────────────────────

/// Pull the payload out of a possibly fence-wrapped model reply.
pub(crate) fn strip_code_fences(raw: &str) -> String {
    let Some(open) = raw.find("```") else {
        return raw.trim().to_string();
    };
    let after = &raw[open + 3..];
    let body_start = after.find('\n').map(|i| i + 1).unwrap_or(0);
    let body = &after[body_start..];
    let body = match body.find("```") {
        Some(close) => &body[..close],
        None => body,
    };
    body.trim().to_string()
}

pub(crate) fn parse_plan_text(raw: &str) -> Result<Plan, PlanError> {
    let stripped = strip_code_fences(raw);
    let plan: Plan =
        serde_json::from_str(stripped.trim()).map_err(|e| PlanError::Json(e.to_string()))?;
    validate_plan(&plan)?;
    Ok(plan)
}

/// Structural invariants every plan must satisfy before the scheduler
/// will touch it.
pub fn validate_plan(plan: &Plan) -> Result<(), PlanError> {
    if plan.subtasks.is_empty() {
        return Err(PlanError::Invalid("plan has no subtasks".into()));
    }

    let mut ids = HashSet::new();
    for s in &plan.subtasks {
        if s.id == 0 {
            return Err(PlanError::Invalid("subtask ids must be positive".into()));
        }
        if !ids.insert(s.id) {
            return Err(PlanError::Invalid(format!("duplicate subtask id {}", s.id)));
        }
    }
    for s in &plan.subtasks {
        for dep in &s.dependencies {
            if !ids.contains(dep) {
                return Err(PlanError::Invalid(format!(
                    "subtask {} depends on missing id {dep}",
                    s.id
                )));
            }
            if *dep == s.id {
                return Err(PlanError::Invalid(format!("subtask {} depends on itself", s.id)));
            }
        }
    }

    let finish_count = plan.subtasks.iter().filter(|s| s.tool == "finish_task").count();
    if finish_count != 1 {
        return Err(PlanError::Invalid(format!(
            "plan needs exactly one finish_task, found {finish_count}"
        )));
    }

    // Kahn's algorithm: every node must be reachable through the
    // dependency order or there is a cycle.
    let mut in_degree: HashMap<u32, usize> =
        plan.subtasks.iter().map(|s| (s.id, s.dependencies.len())).collect();
    let mut queue: Vec<u32> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut visited = 0usize;
    while let Some(id) = queue.pop() {
        visited += 1;
        for s in &plan.subtasks {
            if s.dependencies.contains(&id) {
                if let Some(degree) = in_degree.get_mut(&s.id) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push(s.id);
                    }
                }
            }
        }
    }
    if visited != plan.subtasks.len() {
        return Err(PlanError::Invalid("dependency graph contains a cycle".into()));
    }
    Ok(())
}

// ── Deterministic fallback ────────────────────────────────────────────────────

fn info_query_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(what|which|show|list|describe|status|how many|tell me about)\b")
            .expect("planner regex")
    })
}

fn named_asset_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)\b(dragon|cube|sphere|cylinder|cone|torus|monkey|suzanne|car|tree|house|chair|table|robot|sword)\b",
        )
        .expect("planner regex")
    })
}

/// Pattern-matched plan used whenever the model path is unavailable.
pub(crate) fn fallback_plan(req: &PlanRequest) -> Plan {
    let lowered = req.user_request.to_lowercase();

    if info_query_re().is_match(&lowered)
        && (lowered.contains("scene") || lowered.contains("object"))
    {
        return info_plan(&req.user_request);
    }
    if req.has_attachments {
        return image_plan(&req.user_request);
    }
    let subject = named_asset_re()
        .find(&lowered)
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| req.user_request.clone());
    asset_plan(&req.user_request, &subject)
}

/// Minimal three-step recovery used when the re-planning model call
/// fails too: learn, build in code, finish.
pub(crate) fn fallback_replan(req: &PlanRequest) -> Plan {
    let subject = named_asset_re()
        .find(&req.user_request.to_lowercase())
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| req.user_request.clone());
    Plan {
        main_task: format!("Recover: {}", req.user_request),
        subtasks: vec![
            subtask(1, "Look up relevant documentation", "search_knowledge_base",
                params(&[("query", Value::String(req.user_request.clone()))]), &[]),
            subtask(2, "Build the requested result directly with Python code",
                "execute_blender_code",
                params(&[("code", Value::String(primitive_code(&subject)))]), &[1]),
            subtask(3, "Summarize the recovery for the user", "finish_task",
                params(&[("finalAnswer", Value::String(format!(
                    "I rebuilt \"{}\" directly in the scene after the first approach failed.",
                    req.user_request
                )))]), &[2]),
        ],
    }
}

fn info_plan(request: &str) -> Plan {
    Plan {
        main_task: format!("Report scene information: {request}"),
        subtasks: vec![
            subtask(1, "Inspect the current scene", "get_scene_info", Map::new(), &[]),
            subtask(2, "Report the findings to the user", "finish_task", Map::new(), &[1]),
        ],
    }
}

fn image_plan(request: &str) -> Plan {
    Plan {
        main_task: format!("Recreate from reference image: {request}"),
        subtasks: vec![
            subtask(1, "Analyze the reference image", "analyze_image", Map::new(), &[]),
            subtask(2, "Search for and import a matching asset", "asset_search_and_import",
                params(&[("prompt", Value::String(request.to_string()))]), &[1]),
            subtask(3, "If the asset import failed, build an approximation with Python code",
                "execute_blender_code",
                params(&[("code", Value::String(primitive_code(request)))]), &[2]),
            subtask(4, "Summarize what was created", "finish_task",
                params(&[("finalAnswer", Value::String(format!(
                    "I recreated the reference image request: {request}."
                )))]), &[2, 3]),
        ],
    }
}

fn asset_plan(request: &str, subject: &str) -> Plan {
    Plan {
        main_task: request.to_string(),
        subtasks: vec![
            subtask(1, &format!("Search for and import {subject}"), "asset_search_and_import",
                params(&[("prompt", Value::String(request.to_string()))]), &[]),
            subtask(2, &format!("If the asset import failed, create {subject} with Python code"),
                "execute_blender_code",
                params(&[("code", Value::String(primitive_code(subject)))]), &[1]),
            subtask(3, "Summarize the result for the user", "finish_task",
                params(&[("finalAnswer", Value::String(format!("Done: {request}.")))]), &[1, 2]),
        ],
    }
}

/// Hand-written creation snippets for the fallback path. Known
/// primitives map directly; anything else gets a placeholder of the
/// right rough shape.
pub(crate) fn primitive_code(subject: &str) -> String {
    let lowered = subject.to_lowercase();
    let body = if lowered.contains("sphere") {
        "bpy.ops.mesh.primitive_uv_sphere_add(radius=1)".to_string()
    } else if lowered.contains("cylinder") {
        "bpy.ops.mesh.primitive_cylinder_add(radius=1, depth=2)".to_string()
    } else if lowered.contains("cone") {
        "bpy.ops.mesh.primitive_cone_add(radius1=1, depth=2)".to_string()
    } else if lowered.contains("torus") {
        "bpy.ops.mesh.primitive_torus_add(major_radius=1, minor_radius=0.25)".to_string()
    } else if lowered.contains("monkey") || lowered.contains("suzanne") {
        "bpy.ops.mesh.primitive_monkey_add(size=2)".to_string()
    } else {
        "bpy.ops.mesh.primitive_cube_add(size=2)".to_string()
    };
    let name = object_name(subject);
    let mut code = format!("import bpy\n{body}\n");
    code.push_str(&format!("bpy.context.active_object.name = {name:?}\n"));
    if lowered.contains("red") {
        code.push_str(
            "mat = bpy.data.materials.new(name='Red')\n\
             mat.diffuse_color = (1.0, 0.0, 0.0, 1.0)\n\
             bpy.context.active_object.data.materials.append(mat)\n",
        );
    }
    code
}

fn object_name(subject: &str) -> String {
    let name: String = subject
        .split_whitespace()
        .take(2)
        .collect::<Vec<_>>()
        .join("_")
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_')
        .collect();
    if name.is_empty() { "Object".to_string() } else { name }
}

fn subtask(
    id: u32,
    description: &str,
    tool: &str,
    parameters: Map<String, Value>,
    dependencies: &[u32],
) -> Subtask {
    Subtask {
        id,
        description: description.to_string(),
        tool: tool.to_string(),
        parameters,
        dependencies: dependencies.to_vec(),
    }
}

fn params(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}
