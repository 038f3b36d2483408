use std::time::Duration;

use serde_json::{Value, json};
use tokio::time::sleep;
use tracing::{debug, info};

use super::AssetRef;
use crate::{bridge::Bridge, errors::ToolError};

const POLL_INTERVAL: Duration = Duration::from_secs(5);
const POLL_BUDGET: Duration = Duration::from_secs(180);

/// Text-to-3D generation: submit a job, poll until the service reports
/// completion, then import the produced asset into the scene.
pub struct GeneratorAdapter {
    bridge: Bridge,
}

impl GeneratorAdapter {
    pub fn new(bridge: Bridge) -> Self {
        Self { bridge }
    }

    pub async fn generate(&self, prompt: &str) -> Result<AssetRef, ToolError> {
        let created = self
            .bridge
            .send("create_rodin_job", json!({ "text_prompt": prompt }))
            .await?;
        let job = JobHandle::from_creation(&created).ok_or_else(|| {
            ToolError::ImportFailed("unrecognized job creation response".to_string())
        })?;
        info!(prompt, "generation job submitted");

        let mut waited = Duration::ZERO;
        loop {
            if waited >= POLL_BUDGET {
                return Err(ToolError::ImportFailed(
                    "generation did not finish within the time budget".to_string(),
                ));
            }
            sleep(POLL_INTERVAL).await;
            waited += POLL_INTERVAL;

            let status = self
                .bridge
                .send("poll_rodin_job_status", job.poll_params())
                .await?;
            match job.progress(&status) {
                JobProgress::Done => break,
                JobProgress::Failed(msg) => return Err(ToolError::ImportFailed(msg)),
                JobProgress::Running => {
                    debug!(waited_secs = waited.as_secs(), "generation still running")
                }
            }
        }

        let name = asset_name_from_prompt(prompt);
        let imported = self
            .bridge
            .send("import_generated_asset", job.import_params(&name))
            .await?;
        let final_name = imported
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or(&name)
            .to_string();
        Ok(AssetRef {
            name: final_name,
            source: "generator",
            asset_type: "model".to_string(),
        })
    }
}

enum JobProgress {
    Running,
    Done,
    Failed(String),
}

/// The generation service answers job creation in one of two shapes: a
/// per-task job list keyed by a subscription, or a single uuid with an
/// overall status field. Which protocol applies is decided by inspecting
/// the creation response, never configured.
enum JobHandle {
    TaskList { subscription_key: String, request_id: String },
    Overall { uuid: String },
}

impl JobHandle {
    fn from_creation(created: &Value) -> Option<Self> {
        if let Some(key) = created
            .get("jobs")
            .and_then(|jobs| jobs.get("subscription_key"))
            .and_then(Value::as_str)
        {
            let request_id = created
                .get("uuid")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            return Some(JobHandle::TaskList {
                subscription_key: key.to_string(),
                request_id,
            });
        }
        if let Some(uuid) = created.get("uuid").and_then(Value::as_str) {
            return Some(JobHandle::Overall {
                uuid: uuid.to_string(),
            });
        }
        None
    }

    fn poll_params(&self) -> Value {
        match self {
            JobHandle::TaskList { subscription_key, .. } => {
                json!({ "subscription_key": subscription_key })
            }
            JobHandle::Overall { uuid } => json!({ "request_id": uuid }),
        }
    }

    fn progress(&self, status: &Value) -> JobProgress {
        match self {
            JobHandle::TaskList { .. } => {
                let Some(list) = status
                    .get("status_list")
                    .or_else(|| status.get("jobs"))
                    .and_then(Value::as_array)
                else {
                    return JobProgress::Running;
                };
                let states: Vec<&str> = list.iter().filter_map(Value::as_str).collect();
                if states.iter().any(|s| s.eq_ignore_ascii_case("failed")) {
                    JobProgress::Failed("a generation task failed".to_string())
                } else if !states.is_empty()
                    && states.iter().all(|s| s.eq_ignore_ascii_case("done"))
                {
                    JobProgress::Done
                } else {
                    JobProgress::Running
                }
            }
            JobHandle::Overall { .. } => {
                let state = status.get("status").and_then(Value::as_str).unwrap_or("");
                if state.eq_ignore_ascii_case("failed") {
                    JobProgress::Failed("generation job failed".to_string())
                } else if state.eq_ignore_ascii_case("done")
                    || state.eq_ignore_ascii_case("completed")
                {
                    JobProgress::Done
                } else {
                    JobProgress::Running
                }
            }
        }
    }

    fn import_params(&self, name: &str) -> Value {
        match self {
            JobHandle::TaskList { request_id, .. } => {
                json!({ "task_uuid": request_id, "name": name })
            }
            JobHandle::Overall { uuid } => json!({ "request_id": uuid, "name": name }),
        }
    }
}

fn asset_name_from_prompt(prompt: &str) -> String {
    let stem: String = prompt
        .split_whitespace()
        .take(3)
        .collect::<Vec<_>>()
        .join("_")
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_')
        .collect();
    if stem.is_empty() {
        "Generated_Asset".to_string()
    } else {
        format!("Generated_{stem}")
    }
}
