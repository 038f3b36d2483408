use std::{
    collections::{BTreeMap, HashSet},
    sync::Arc,
    time::Duration,
};

use serde_json::Value;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::{
    agent::planner::{PlanRequest, PlanSource, SubtaskNote},
    integrations::IntegrationStatus,
    tools::{FINISH_TOOL, RunContext, ToolDispatch, scene::summarize_scene},
    types::{Attachment, Guard, Plan, Subtask, SubtaskResult},
};

/// Hard deadline for one subtask inside a parallel pass or sequential
/// step. The underlying bridge request keeps draining; only the subtask
/// resolves as timed out.
const SUBTASK_DEADLINE: Duration = Duration::from_secs(60);

/// Tools whose non-conditional failure counts as critical for the
/// re-plan threshold: they are the ones that actually produce scene
/// content.
const CRITICAL_TOOLS: &[&str] =
    &["asset_search_and_import", "execute_blender_code", "create_animation"];

// ── State ─────────────────────────────────────────────────────────────────────

/// Mutable state of one agent run. Created per user request, owned by
/// exactly one scheduler invocation, discarded with the final response.
pub struct SchedulerState {
    pub plan: Option<Plan>,
    /// Cursor for sequential fallback execution only.
    pub current_index: usize,
    pub completed: HashSet<u32>,
    pub results: BTreeMap<u32, SubtaskResult>,
    pub loop_count: u32,
    pub max_loops: u32,
    pub has_replanned: bool,
    pub attachments: Arc<Vec<Attachment>>,
    pub rag_context: Option<String>,
    pub scene_context: Option<Value>,
    pub integration_status: IntegrationStatus,
    pub finished: bool,
    user_request: Arc<str>,
    ai_messages: Vec<String>,
    final_answer: Option<String>,
}

impl SchedulerState {
    fn new(
        request: &str,
        attachments: Vec<Attachment>,
        integration_status: IntegrationStatus,
        max_loops: u32,
    ) -> Self {
        Self {
            plan: None,
            current_index: 0,
            completed: HashSet::new(),
            results: BTreeMap::new(),
            loop_count: 0,
            max_loops: max_loops.max(1),
            has_replanned: false,
            attachments: Arc::new(attachments),
            rag_context: None,
            scene_context: None,
            integration_status,
            finished: false,
            user_request: Arc::from(request),
            ai_messages: Vec::new(),
            final_answer: None,
        }
    }
}

// ── Agent ─────────────────────────────────────────────────────────────────────

/// Drives a plan to its terminal state (or gives up at `max_loops`).
/// Generic over the dispatcher/planner so tests can inject fakes.
pub struct Agent<T> {
    inner: Arc<T>,
    max_loops: u32,
}

impl<T: ToolDispatch + PlanSource> Agent<T> {
    pub fn new(inner: Arc<T>, max_loops: u32) -> Self {
        Self { inner, max_loops }
    }

    pub async fn run(
        &self,
        request: &str,
        attachments: Vec<Attachment>,
        integration_status: IntegrationStatus,
    ) -> String {
        let mut state =
            SchedulerState::new(request, attachments, integration_status, self.max_loops);
        while self.step(&mut state).await {}
        finalize(&state)
    }

    /// One agent step. Returns false when the run is over.
    async fn step(&self, state: &mut SchedulerState) -> bool {
        if state.finished || state.loop_count >= state.max_loops {
            return false;
        }
        state.loop_count += 1;

        if state.plan.is_none() {
            let req = plan_request(state);
            let plan = self.inner.plan(&req).await;
            info!(task = %plan.main_task, subtasks = plan.subtasks.len(), "plan ready");
            state.plan = Some(plan);
            return true;
        }

        if should_replan(state) {
            let req = plan_request(state);
            let (failed, completed) = subtask_notes(state);
            let plan = self.inner.replan(&req, &failed, &completed).await;
            info!(subtasks = plan.subtasks.len(), "replacement plan adopted");
            state.plan = Some(plan);
            state.completed.clear();
            state.results.clear();
            state.current_index = 0;
            state.has_replanned = true;
            state.finished = false;
            return true;
        }

        let ready = ready_subtasks(state);
        if ready.len() >= 2 {
            self.parallel_pass(state, ready).await;
            return true;
        }

        self.sequential_step(state).await;
        true
    }

    /// Launch every ready subtask concurrently, then merge outcomes by
    /// id so sibling arrival order cannot influence the recorded state.
    async fn parallel_pass(&self, state: &mut SchedulerState, ready: Vec<Subtask>) {
        info!(count = ready.len(), "executing independent subtasks in parallel");
        let ctx = run_context(state);
        let mut join_set = JoinSet::new();
        for subtask in ready {
            let dispatcher = Arc::clone(&self.inner);
            let ctx = ctx.clone();
            join_set.spawn(async move {
                let id = subtask.id;
                let result = dispatch_with_deadline(dispatcher.as_ref(), subtask, ctx).await;
                (id, result)
            });
        }

        let mut buffer: Vec<(u32, SubtaskResult)> = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(pair) => buffer.push(pair),
                Err(e) => warn!(error = %e, "parallel subtask aborted"),
            }
        }
        buffer.sort_by_key(|(id, _)| *id);
        for (id, result) in buffer {
            record_result(state, id, result);
        }
        advance_cursor(state);
    }

    async fn sequential_step(&self, state: &mut SchedulerState) {
        advance_cursor(state);
        let Some(plan) = state.plan.clone() else { return };
        if state.current_index >= plan.subtasks.len() {
            // Everything recorded; nothing left to run.
            state.finished = true;
            return;
        }
        let subtask = plan.subtasks[state.current_index].clone();

        if subtask.tool == FINISH_TOOL {
            if non_finish_done(state, &plan) {
                self.dispatch_finish(state, subtask).await;
            } else {
                // The terminal subtask is not due yet; no-op loop over
                // the remaining work.
                debug!(id = subtask.id, "finish not due; advancing cursor");
                state.current_index = (state.current_index + 1) % plan.subtasks.len();
            }
            return;
        }

        if !deps_met(&subtask, state) {
            debug!(id = subtask.id, "dependencies not ready; no-op loop");
            state.current_index = (state.current_index + 1) % plan.subtasks.len();
            return;
        }

        if !guard_satisfied(&subtask, state) {
            info!(id = subtask.id, desc = %subtask.description, "conditional guard not met; skipping");
            record_result(state, subtask.id, SubtaskResult::skipped());
            advance_cursor(state);
            return;
        }

        let ctx = run_context(state);
        let id = subtask.id;
        let result = dispatch_with_deadline(self.inner.as_ref(), subtask, ctx).await;
        record_result(state, id, result);
        advance_cursor(state);
    }

    /// The terminal subtask may veto termination; a veto leaves it
    /// un-completed so the next iteration's re-plan check can fire.
    async fn dispatch_finish(&self, state: &mut SchedulerState, subtask: Subtask) {
        let ctx = run_context(state);
        let id = subtask.id;
        let result = self.inner.dispatch(subtask, ctx).await;
        let answer = result
            .payload
            .get("finalAnswer")
            .and_then(Value::as_str)
            .map(str::to_string);
        if result.success {
            state.final_answer = answer;
            record_result(state, id, result);
            state.finished = true;
        } else {
            warn!("finish_task refused to finalize");
            if let Some(answer) = answer {
                state.ai_messages.push(answer);
            }
            state.finished = false;
        }
    }
}

async fn dispatch_with_deadline<T: ToolDispatch>(
    dispatcher: &T,
    subtask: Subtask,
    ctx: RunContext,
) -> SubtaskResult {
    let id = subtask.id;
    match tokio::time::timeout(SUBTASK_DEADLINE, dispatcher.dispatch(subtask, ctx)).await {
        Ok(result) => result,
        Err(_) => {
            warn!(id, "subtask deadline exceeded");
            SubtaskResult::deadline_exceeded()
        }
    }
}

// ── Pure scheduler logic ──────────────────────────────────────────────────────

fn plan_request(state: &SchedulerState) -> PlanRequest {
    PlanRequest {
        user_request: state.user_request.to_string(),
        has_attachments: !state.attachments.is_empty(),
        rag_context: state.rag_context.clone(),
        scene_context: state.scene_context.as_ref().map(|v| v.to_string()),
        integration_status: state.integration_status,
    }
}

fn run_context(state: &SchedulerState) -> RunContext {
    RunContext {
        user_request: Arc::clone(&state.user_request),
        attachments: Arc::clone(&state.attachments),
        integration_status: state.integration_status,
        critical_failures: Arc::new(critical_failures(state)),
    }
}

fn critical_failures(state: &SchedulerState) -> Vec<String> {
    let Some(plan) = &state.plan else { return Vec::new() };
    plan.subtasks
        .iter()
        .filter_map(|s| {
            let r = state.results.get(&s.id)?;
            let critical = !r.success
                && !r.skipped
                && !s.is_conditional()
                && CRITICAL_TOOLS.contains(&s.tool.as_str());
            if !critical {
                return None;
            }
            // A failure with a successful fallback branch is handled,
            // not outstanding.
            let recovered = plan.subtasks.iter().any(|f| {
                f.guard() == Guard::OnFailure
                    && f.dependencies.contains(&s.id)
                    && state.results.get(&f.id).map(|fr| fr.success).unwrap_or(false)
            });
            if recovered {
                return None;
            }
            Some(format!(
                "#{} {} ({})",
                s.id,
                s.description,
                r.error.as_deref().unwrap_or("failed")
            ))
        })
        .collect()
}

/// Ready = not recorded, dependencies recorded, guard satisfied, and not
/// the terminal finish.
fn ready_subtasks(state: &SchedulerState) -> Vec<Subtask> {
    let Some(plan) = &state.plan else { return Vec::new() };
    plan.subtasks
        .iter()
        .filter(|s| {
            !state.completed.contains(&s.id)
                && s.tool != FINISH_TOOL
                && deps_met(s, state)
                && guard_satisfied(s, state)
        })
        .cloned()
        .collect()
}

fn deps_met(subtask: &Subtask, state: &SchedulerState) -> bool {
    subtask.dependencies.iter().all(|d| state.completed.contains(d))
}

fn guard_satisfied(subtask: &Subtask, state: &SchedulerState) -> bool {
    match subtask.guard() {
        Guard::None => true,
        Guard::OnFailure => subtask.dependencies.iter().any(|d| {
            state
                .results
                .get(d)
                .map(|r| !r.success && !r.skipped)
                .unwrap_or(false)
        }),
        Guard::OnSuccess => subtask
            .dependencies
            .iter()
            .any(|d| state.results.get(d).map(|r| r.success).unwrap_or(false)),
    }
}

fn non_finish_done(state: &SchedulerState, plan: &Plan) -> bool {
    plan.subtasks
        .iter()
        .filter(|s| s.tool != FINISH_TOOL)
        .all(|s| state.completed.contains(&s.id))
}

/// Record one outcome and fold useful observations back into the state
/// the planner sees on a re-plan.
fn record_result(state: &mut SchedulerState, id: u32, result: SubtaskResult) {
    if result.success {
        if result.payload.get("sceneContext").is_some() {
            state.scene_context = Some(result.payload.clone());
            if let Some(summary) = summarize_scene(&result.payload) {
                state.ai_messages.push(summary);
            }
        }
        if let Some(docs) = result.payload.get("documents").and_then(Value::as_array) {
            if !docs.is_empty() {
                let joined: Vec<&str> = docs.iter().filter_map(Value::as_str).collect();
                state.rag_context = Some(joined.join("\n---\n"));
            }
        }
        if let Some(analysis) = result.payload.get("analysis").and_then(Value::as_str) {
            state.ai_messages.push(analysis.to_string());
        }
        info!(id, "subtask succeeded");
    } else if result.skipped {
        info!(id, "subtask skipped");
    } else {
        warn!(id, error = result.error.as_deref().unwrap_or("?"), "subtask failed");
    }
    state.results.insert(id, result);
    state.completed.insert(id);
}

fn advance_cursor(state: &mut SchedulerState) {
    let Some(plan) = &state.plan else { return };
    while state.current_index < plan.subtasks.len()
        && state.completed.contains(&plan.subtasks[state.current_index].id)
    {
        state.current_index += 1;
    }
}

/// Critical-failure threshold: at least two attempted, at least two
/// critical failures, and half of everything attempted failing. One
/// extra case: a lone attempted subtask that failed critically with no
/// fallback branch left also triggers, so single-step plans can recover.
fn should_replan(state: &SchedulerState) -> bool {
    if state.has_replanned {
        return false;
    }
    let Some(plan) = &state.plan else { return false };

    let mut attempted = 0u32;
    let mut critical = 0u32;
    for s in &plan.subtasks {
        let Some(r) = state.results.get(&s.id) else { continue };
        if r.skipped {
            continue;
        }
        attempted += 1;
        if !r.success && !s.is_conditional() && CRITICAL_TOOLS.contains(&s.tool.as_str()) {
            critical += 1;
        }
    }

    if attempted >= 2 && critical >= 2 && critical as f32 / attempted as f32 >= 0.5 {
        return true;
    }
    // The lone failure must actually be blocking: no fallback branch to
    // take and nothing else dispatchable.
    attempted == 1
        && critical == 1
        && !fallback_branch_pending(state, plan)
        && ready_subtasks(state).is_empty()
}

fn fallback_branch_pending(state: &SchedulerState, plan: &Plan) -> bool {
    plan.subtasks.iter().any(|s| {
        !state.completed.contains(&s.id)
            && s.guard() == Guard::OnFailure
            && s.dependencies.iter().any(|d| {
                state
                    .results
                    .get(d)
                    .map(|r| !r.success && !r.skipped)
                    .unwrap_or(false)
            })
    })
}

fn subtask_notes(state: &SchedulerState) -> (Vec<SubtaskNote>, Vec<SubtaskNote>) {
    let Some(plan) = &state.plan else { return (Vec::new(), Vec::new()) };
    let mut failed = Vec::new();
    let mut completed = Vec::new();
    for s in &plan.subtasks {
        let Some(r) = state.results.get(&s.id) else { continue };
        if r.skipped {
            continue;
        }
        let note = SubtaskNote {
            id: s.id,
            description: s.description.clone(),
            tool: s.tool.clone(),
            outcome: if r.success {
                "succeeded".to_string()
            } else {
                r.error.clone().unwrap_or_else(|| "failed".to_string())
            },
        };
        if r.success {
            completed.push(note);
        } else {
            failed.push(note);
        }
    }
    (failed, completed)
}

/// Final response preference: the terminal summary, else the AI-visible
/// notes gathered along the run, else a templated report.
fn finalize(state: &SchedulerState) -> String {
    if let Some(answer) = &state.final_answer {
        return answer.clone();
    }
    if !state.ai_messages.is_empty() {
        return state.ai_messages.join("\n\n");
    }
    match state.scene_context.as_ref().and_then(summarize_scene) {
        Some(summary) => format!(
            "I worked through {} step(s). {}",
            state.loop_count, summary
        ),
        None => format!(
            "I worked through {} step(s) but could not produce a final summary.",
            state.loop_count
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Map, json};
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn subtask(id: u32, description: &str, tool: &str, deps: &[u32]) -> Subtask {
        Subtask {
            id,
            description: description.to_string(),
            tool: tool.to_string(),
            parameters: Map::new(),
            dependencies: deps.to_vec(),
        }
    }

    fn plan(subtasks: Vec<Subtask>) -> Plan {
        Plan {
            main_task: "test".to_string(),
            subtasks,
        }
    }

    /// Scripted dispatcher + planner. Outcomes are keyed by subtask id;
    /// ids without a script succeed with an empty payload. The finish
    /// gate mirrors the real tool.
    struct FakeTools {
        initial: Plan,
        replacement: Option<Plan>,
        outcomes: HashMap<u32, SubtaskResult>,
        dispatched: Mutex<Vec<u32>>,
        plan_calls: AtomicU32,
        replan_calls: AtomicU32,
    }

    impl FakeTools {
        fn new(initial: Plan) -> Self {
            Self {
                initial,
                replacement: None,
                outcomes: HashMap::new(),
                dispatched: Mutex::new(Vec::new()),
                plan_calls: AtomicU32::new(0),
                replan_calls: AtomicU32::new(0),
            }
        }

        fn failing(mut self, id: u32, error: &str) -> Self {
            self.outcomes.insert(id, SubtaskResult::failed(error, false));
            self
        }

        fn with_replacement(mut self, plan: Plan) -> Self {
            self.replacement = Some(plan);
            self
        }

        fn dispatched(&self) -> Vec<u32> {
            self.dispatched.lock().unwrap().clone()
        }
    }

    impl ToolDispatch for FakeTools {
        async fn dispatch(&self, subtask: Subtask, ctx: RunContext) -> SubtaskResult {
            self.dispatched.lock().unwrap().push(subtask.id);
            if subtask.tool == FINISH_TOOL {
                if ctx.critical_failures.is_empty() {
                    return SubtaskResult::ok(json!({ "finalAnswer": "all done" }));
                }
                return SubtaskResult {
                    success: false,
                    error: Some("critical subtasks failed".to_string()),
                    payload: json!({ "finalAnswer": "some steps failed" }),
                    ..SubtaskResult::default()
                };
            }
            self.outcomes
                .get(&subtask.id)
                .cloned()
                .unwrap_or_else(|| SubtaskResult::ok(json!({})))
        }
    }

    impl PlanSource for FakeTools {
        async fn plan(&self, _req: &PlanRequest) -> Plan {
            self.plan_calls.fetch_add(1, Ordering::SeqCst);
            self.initial.clone()
        }

        async fn replan(
            &self,
            _req: &PlanRequest,
            _failed: &[SubtaskNote],
            _completed: &[SubtaskNote],
        ) -> Plan {
            self.replan_calls.fetch_add(1, Ordering::SeqCst);
            self.replacement.clone().unwrap_or_else(|| self.initial.clone())
        }
    }

    fn two_parallel_plan() -> Plan {
        plan(vec![
            subtask(1, "Inspect the scene", "get_scene_info", &[]),
            subtask(2, "Look up docs", "search_knowledge_base", &[]),
            subtask(3, "Wrap up", FINISH_TOOL, &[1, 2]),
        ])
    }

    #[tokio::test]
    async fn independent_subtasks_run_in_one_parallel_pass() {
        let tools = Arc::new(FakeTools::new(two_parallel_plan()));
        let agent = Agent::new(Arc::clone(&tools), 10);
        let mut state = SchedulerState::new("do two things", vec![], IntegrationStatus::default(), 10);

        assert!(agent.step(&mut state).await); // plan
        assert_eq!(state.loop_count, 1);

        assert!(agent.step(&mut state).await); // parallel pass
        assert_eq!(state.loop_count, 2);
        assert_eq!(state.results.len(), 2);
        assert!(state.results[&1].success && state.results[&2].success);
        assert!(state.completed.contains(&1) && state.completed.contains(&2));
        assert_eq!(state.current_index, 2);

        assert!(agent.step(&mut state).await); // finish
        assert!(state.finished);
        assert!(!agent.step(&mut state).await);
        assert_eq!(finalize(&state), "all done");
    }

    #[tokio::test]
    async fn failed_dependency_enables_the_failure_gated_fallback() {
        let p = plan(vec![
            subtask(1, "Import a cube", "asset_search_and_import", &[]),
            subtask(2, "If the asset import failed, create a cube with Python code",
                "execute_blender_code", &[1]),
            subtask(3, "Wrap up", FINISH_TOOL, &[1, 2]),
        ]);
        let tools = Arc::new(FakeTools::new(p).failing(1, "no matching asset found"));
        let agent = Agent::new(Arc::clone(&tools), 10);

        let response = agent
            .run("create a cube", vec![], IntegrationStatus::default())
            .await;
        assert_eq!(response, "all done");
        assert_eq!(tools.dispatched(), vec![1, 2, 3]);
        assert!(tools.plan_calls.load(Ordering::SeqCst) == 1);
        // Recovered by the fallback: no re-plan needed.
        assert_eq!(tools.replan_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn satisfied_dependency_skips_the_failure_gated_fallback() {
        let p = plan(vec![
            subtask(1, "Import a cube", "asset_search_and_import", &[]),
            subtask(2, "If the asset import failed, create a cube with Python code",
                "execute_blender_code", &[1]),
            subtask(3, "Wrap up", FINISH_TOOL, &[1, 2]),
        ]);
        let tools = Arc::new(FakeTools::new(p));
        let agent = Agent::new(Arc::clone(&tools), 10);

        let response = agent
            .run("create a cube", vec![], IntegrationStatus::default())
            .await;
        assert_eq!(response, "all done");
        // The guarded step was recorded as skipped, never dispatched.
        assert_eq!(tools.dispatched(), vec![1, 3]);
    }

    #[tokio::test]
    async fn critical_failures_trigger_exactly_one_replan() {
        let p = plan(vec![
            subtask(1, "Generate a tree", "asset_search_and_import", &[]),
            subtask(2, "Generate a rock", "asset_search_and_import", &[1]),
            subtask(3, "Report", "get_scene_info", &[2]),
            subtask(4, "Wrap up", FINISH_TOOL, &[3]),
        ]);
        let replacement = plan(vec![
            subtask(11, "Build everything in code", "execute_blender_code", &[]),
            subtask(12, "Wrap up", FINISH_TOOL, &[11]),
        ]);
        let tools = Arc::new(
            FakeTools::new(p)
                .failing(1, "generation failed")
                .failing(2, "generation failed")
                .with_replacement(replacement),
        );
        let agent = Agent::new(Arc::clone(&tools), 10);

        let response = agent
            .run("a tree and a rock", vec![], IntegrationStatus::default())
            .await;
        assert_eq!(tools.replan_calls.load(Ordering::SeqCst), 1);
        assert_eq!(response, "all done");
    }

    #[tokio::test]
    async fn replan_happens_at_most_once() {
        // The replacement plan fails just as hard as the original.
        let p = plan(vec![
            subtask(1, "Generate a tree", "asset_search_and_import", &[]),
            subtask(2, "Generate a rock", "asset_search_and_import", &[1]),
            subtask(3, "Wrap up", FINISH_TOOL, &[1, 2]),
        ]);
        let tools = Arc::new(
            FakeTools::new(p)
                .failing(1, "generation failed")
                .failing(2, "generation failed"),
        );
        let agent = Agent::new(Arc::clone(&tools), 8);

        let response = agent
            .run("a tree and a rock", vec![], IntegrationStatus::default())
            .await;
        assert_eq!(tools.replan_calls.load(Ordering::SeqCst), 1);
        // finish_task keeps vetoing, so the run ends on the loop bound
        // with the veto explanation as the response.
        assert!(response.contains("some steps failed"));
    }

    #[tokio::test]
    async fn lone_critical_failure_without_fallback_triggers_the_relaxed_replan() {
        let p = plan(vec![
            subtask(1, "Generate a tree", "asset_search_and_import", &[]),
            subtask(2, "Wrap up", FINISH_TOOL, &[1]),
        ]);
        let replacement = plan(vec![
            subtask(11, "Build the tree in code", "execute_blender_code", &[]),
            subtask(12, "Wrap up", FINISH_TOOL, &[11]),
        ]);
        let tools = Arc::new(
            FakeTools::new(p)
                .failing(1, "generation failed")
                .with_replacement(replacement),
        );
        let agent = Agent::new(Arc::clone(&tools), 10);

        let response = agent.run("a tree", vec![], IntegrationStatus::default()).await;
        assert_eq!(tools.replan_calls.load(Ordering::SeqCst), 1);
        assert_eq!(response, "all done");
    }

    #[tokio::test]
    async fn run_always_terminates_within_max_loops() {
        // A plan whose guarded fallback never fires and whose critical
        // failure count stays below threshold: the finish veto loops
        // until max_loops stops the run.
        let p = plan(vec![
            subtask(1, "Import", "asset_search_and_import", &[]),
            subtask(2, "Wrap up", FINISH_TOOL, &[1]),
        ]);
        let tools =
            Arc::new(FakeTools::new(p).failing(1, "import failed"));
        let agent = Agent::new(Arc::clone(&tools), 5);

        // has_replanned is forced by giving no replacement plan: replan
        // returns the same failing plan, after which no further re-plan
        // is allowed.
        let response = agent.run("import", vec![], IntegrationStatus::default()).await;
        assert!(!response.is_empty());
        assert!(tools.replan_calls.load(Ordering::SeqCst) <= 1);
    }

    #[tokio::test]
    async fn scene_summary_feeds_the_final_response_when_finish_has_no_answer() {
        let p = plan(vec![
            subtask(1, "Inspect the scene", "get_scene_info", &[]),
            subtask(2, "Report", FINISH_TOOL, &[1]),
        ]);
        let mut tools = FakeTools::new(p);
        tools.outcomes.insert(
            1,
            SubtaskResult::ok(json!({ "sceneContext": {
                "object_count": 3,
                "objects": [ { "name": "Cube" }, { "name": "Light" }, { "name": "Camera" } ]
            }})),
        );
        let tools = Arc::new(tools);
        let agent = Agent::new(Arc::clone(&tools), 10);

        let mut state = SchedulerState::new("show scene info", vec![], IntegrationStatus::default(), 10);
        while agent.step(&mut state).await {}
        // finish succeeded with its own answer; the scene note is still
        // in the AI-visible messages.
        assert!(state.ai_messages.iter().any(|m| m.contains("3 objects")));
    }
}
